//! The runtime state: the heap plus everything reachable without a stack
//! frame (registry, main thread, per-type metatables) and the host hooks.

use crate::binary_chunk;
use crate::error::HetError;
use het_core::closure::{LClosure, NativeContext};
use het_core::collector::CollectStats;
use het_core::gc::{GcHeap, GcIdx};
use het_core::limits::{HeapConfig, Integer, MAX_C_CALLS, MAX_STACK};
use het_core::proto::Proto;
use het_core::table::Table;
use het_core::thread::Thread;
use het_core::tm::TagMethod;
use het_core::value::{TValue, NUM_TYPES};
use log::{debug, warn};
use std::mem;

/// Registry slot holding the main thread.
pub const RIDX_MAIN_THREAD: Integer = 1;
/// Registry slot holding the globals table.
pub const RIDX_GLOBALS: Integer = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateConfig {
    pub heap: HeapConfig,
    /// Maximum nesting of native calls.
    pub max_c_calls: u32,
    /// Maximum slots on the main thread's stack.
    pub max_stack: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        StateConfig {
            heap: HeapConfig::default(),
            max_c_calls: MAX_C_CALLS,
            max_stack: MAX_STACK,
        }
    }
}

/// Hooks a multi-threaded host uses to serialize access to a state. The
/// state takes the lock on entry to its public operations and releases it
/// around native function calls.
pub trait HostLock {
    fn lock(&mut self) {}
    fn unlock(&mut self) {}
}

/// No locking.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoLock;

impl HostLock for NoLock {}

pub struct State {
    pub(crate) heap: GcHeap,
    registry: GcIdx<Table>,
    main_thread: GcIdx<Thread>,
    pub(crate) type_metatables: [Option<GcIdx<Table>>; NUM_TYPES],
    /// Objects returned by the collector whose `__gc` has not run yet.
    pending_finalize: Vec<TValue>,
    lock: Box<dyn HostLock>,
}

impl State {
    pub fn new(config: StateConfig) -> Result<Self, HetError> {
        let mut heap = GcHeap::new(config.heap)?;
        let main_thread = heap.new_thread_with_limits(config.max_stack, config.max_c_calls)?;
        let registry = heap.new_table(2, 0)?;
        let globals = heap.new_table(0, 0)?;
        heap.table_set_int(registry, RIDX_MAIN_THREAD, TValue::Thread(main_thread))?;
        heap.table_set_int(registry, RIDX_GLOBALS, TValue::Table(globals))?;
        debug!("state created ({} bytes)", heap.mem().total());
        Ok(State {
            heap,
            registry,
            main_thread,
            type_metatables: [None; NUM_TYPES],
            pending_finalize: Vec::new(),
            lock: Box::new(NoLock),
        })
    }

    pub fn set_lock(&mut self, lock: Box<dyn HostLock>) {
        self.lock = lock;
    }

    pub fn heap(&self) -> &GcHeap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut GcHeap {
        &mut self.heap
    }

    pub fn registry(&self) -> GcIdx<Table> {
        self.registry
    }

    pub fn main_thread(&self) -> GcIdx<Thread> {
        self.main_thread
    }

    /// The globals table stored in the registry.
    pub fn globals(&self) -> Option<GcIdx<Table>> {
        self.heap
            .table_get_int(self.registry, RIDX_GLOBALS)
            .as_table()
    }

    pub(crate) fn locked<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.lock.lock();
        let r = f(self);
        self.lock.unlock();
        r
    }

    /// Give other host threads a chance to take the lock.
    pub fn yield_point(&mut self) {
        self.lock.unlock();
        self.lock.lock();
    }

    // ---- Metatables ----

    /// Set the metatable of `v`. Tables and full userdata carry their own;
    /// every other type shares one per type.
    pub fn set_metatable(&mut self, v: &TValue, mt: Option<GcIdx<Table>>) {
        match *v {
            TValue::Table(t) => {
                self.heap.get_mut(t).metatable = mt;
                self.heap.check_finalizer(t.to_ref(), mt);
            }
            TValue::Userdata(u) => {
                self.heap.get_mut(u).metatable = mt;
                self.heap.check_finalizer(u.to_ref(), mt);
            }
            ref other => self.type_metatables[other.type_tag() as usize] = mt,
        }
    }

    pub fn get_metatable(&self, v: &TValue) -> Option<GcIdx<Table>> {
        self.metatable_of(v)
    }

    // ---- Calls ----

    /// Call a native function (or a value with a `__call` handler).
    pub fn call(&mut self, f: TValue, args: &[TValue]) -> Result<Vec<TValue>, HetError> {
        self.locked(|s| s.call_value(f, args))
    }

    pub(crate) fn call_value(&mut self, f: TValue, args: &[TValue]) -> Result<Vec<TValue>, HetError> {
        let (func, closure) = match f {
            TValue::LightFunction(func) => (func, None),
            TValue::CClosure(c) => (self.heap.get(c).func, Some(c)),
            TValue::LClosure(_) => {
                return Err(HetError::runtime(
                    "interpreted functions must be run by the dispatch loop",
                ))
            }
            other => {
                let handler = self
                    .tm_by_obj(&other, TagMethod::Call)
                    .ok_or_else(|| self.type_error(&other, "call"))?;
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(other);
                full.extend_from_slice(args);
                self.heap.get_mut(self.main_thread).enter_c_call()?;
                let r = self.call_value(handler, &full);
                self.heap.get_mut(self.main_thread).leave_c_call();
                return r;
            }
        };
        self.heap.get_mut(self.main_thread).enter_c_call()?;
        self.lock.unlock();
        let result = func(&mut NativeContext {
            args,
            heap: &mut self.heap,
            closure,
        });
        self.lock.lock();
        self.heap.get_mut(self.main_thread).leave_c_call();
        Ok(result?)
    }

    // ---- Stack and closures ----

    pub fn push(&mut self, v: TValue) -> Result<(), HetError> {
        Ok(self.heap.thread_push(self.main_thread, v)?)
    }

    pub fn pop(&mut self) -> Option<TValue> {
        self.heap.thread_pop(self.main_thread)
    }

    pub fn set_top(&mut self, top: usize) -> Result<(), HetError> {
        Ok(self.heap.thread_set_top(self.main_thread, top)?)
    }

    /// Instantiate `proto` for a frame of the main thread based at `base`.
    pub fn new_closure(
        &mut self,
        proto: GcIdx<Proto>,
        base: usize,
        enclosing: Option<GcIdx<LClosure>>,
    ) -> Result<GcIdx<LClosure>, HetError> {
        Ok(self
            .heap
            .instantiate(proto, self.main_thread, base, enclosing)?)
    }

    /// Close the main thread's open upvalues at `level` and above.
    pub fn close_upvalues(&mut self, level: usize) {
        self.heap.close_upvals(self.main_thread, level);
    }

    // ---- Chunks ----

    /// Load a binary chunk as a closure. Its first upvalue, if any, is set
    /// to the globals table.
    pub fn load(&mut self, chunk: &[u8], name: &str) -> Result<GcIdx<LClosure>, HetError> {
        self.locked(|s| {
            let proto = binary_chunk::undump(&mut s.heap, chunk, name)?;
            let cl = s.heap.new_lclosure(proto)?;
            s.heap.init_upvals(cl)?;
            if let (Some(uv), Some(globals)) = (s.heap.get(cl).upval(0), s.globals()) {
                s.heap.upval_set(uv, TValue::Table(globals));
            }
            Ok(cl)
        })
    }

    pub fn dump(&self, f: GcIdx<LClosure>, strip: bool) -> Vec<u8> {
        binary_chunk::dump(&self.heap, self.heap.get(f).proto, strip)
    }

    // ---- Collection ----

    fn roots(&self) -> Vec<TValue> {
        let mut roots = vec![TValue::Table(self.registry), TValue::Thread(self.main_thread)];
        roots.extend(self.type_metatables.iter().flatten().map(|&mt| TValue::Table(mt)));
        roots.extend_from_slice(&self.pending_finalize);
        roots
    }

    /// Run a full collection. Objects found unreachable with a pending
    /// `__gc` are kept alive and queued for [`State::run_finalizers`].
    pub fn collect_garbage(&mut self) -> CollectStats {
        self.locked(|s| {
            if !s.pending_finalize.is_empty() {
                warn!(
                    "{} objects still waiting for finalizers at collection",
                    s.pending_finalize.len()
                );
            }
            let roots = s.roots();
            let result = s.heap.collect(&roots);
            s.pending_finalize.extend(result.to_finalize);
            result.stats
        })
    }

    pub fn pending_finalizers(&self) -> &[TValue] {
        &self.pending_finalize
    }

    /// Call `__gc` on every queued object. An error in a finalizer is logged
    /// and does not stop the others. Returns the number of handlers run.
    pub fn run_finalizers(&mut self) -> usize {
        let pending = mem::take(&mut self.pending_finalize);
        let mut ran = 0;
        for obj in pending {
            let Some(handler) = self.tm_by_obj(&obj, TagMethod::Gc) else {
                continue;
            };
            ran += 1;
            if let Err(e) = self.call(handler, &[obj]) {
                warn!("error in __gc: {e}");
            }
        }
        ran
    }

    /// Convert an error into the value a protected call would report.
    pub fn error_value(&mut self, e: &HetError) -> TValue {
        e.to_value(&mut self.heap)
    }
}

impl Drop for State {
    fn drop(&mut self) {
        if !self.pending_finalize.is_empty() {
            warn!(
                "state dropped with {} finalizers never run",
                self.pending_finalize.len()
            );
        }
    }
}
