//! Stop-the-world mark and sweep over the allocation list.
//!
//! A cycle marks from the caller's roots and the fixed objects, resolves weak
//! tables, resurrects unreachable objects that still need finalization, and
//! finally sweeps everything left unmarked. When to collect is the caller's
//! decision.

use crate::closure::{CClosure, LClosure, UpVal, UpValLocation};
use crate::gc::{GcHeap, GcIdx, GcObject, GcRef, Marks, ObjKind};
use crate::object::Udata;
use crate::proto::Proto;
use crate::string::TString;
use crate::table::Table;
use crate::thread::Thread;
use crate::tm::TagMethod;
use crate::value::TValue;
use log::debug;
use std::collections::HashSet;

/// Counters for one collection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CollectStats {
    pub freed: usize,
    pub bytes_before: usize,
    pub bytes_after: usize,
    /// Objects resurrected for finalization.
    pub finalizable: usize,
}

/// Outcome of a collection. The caller runs `__gc` on `to_finalize`; those
/// objects stay alive until a later cycle finds them unreachable again.
#[derive(Debug, Default)]
pub struct CollectResult {
    pub stats: CollectStats,
    pub to_finalize: Vec<TValue>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Weakness {
    Strong,
    Values,
    Keys,
    All,
}

#[derive(Default)]
struct Marker {
    gray: Vec<GcRef>,
    weak_values: Vec<GcIdx<Table>>,
    ephemerons: Vec<GcIdx<Table>>,
    all_weak: Vec<GcIdx<Table>>,
}

impl GcHeap {
    /// Register `r` for finalization if its new metatable has `__gc`.
    pub fn check_finalizer(&mut self, r: GcRef, mt: Option<GcIdx<Table>>) {
        if self.metamethod(mt, TagMethod::Gc).is_none() {
            return;
        }
        if let Some(h) = self.header_mut(r) {
            if !h.marked.contains(Marks::FIXED) {
                h.marked.insert(Marks::FINALIZABLE);
                h.marked.remove(Marks::FINALIZED);
            }
        }
    }

    /// Run a full collection cycle.
    pub fn collect(&mut self, roots: &[TValue]) -> CollectResult {
        let bytes_before = self.mem.total();
        let mut m = Marker::default();

        let fixed: Vec<GcRef> = self
            .allocation_list()
            .filter(|&r| self.header(r).is_some_and(|h| h.marked().contains(Marks::FIXED)))
            .collect();
        for r in fixed {
            self.mark_object(r, &mut m);
        }
        for v in roots {
            self.mark_value(v, &mut m);
        }
        self.propagate(&mut m);
        self.converge_ephemerons(&mut m);

        // Weak values must not see resurrected objects.
        let values_weak: Vec<GcIdx<Table>> =
            m.weak_values.iter().chain(&m.all_weak).copied().collect();
        self.clear_by_values(&values_weak);

        let to_finalize = self.separate_finalizable(&mut m);
        self.propagate(&mut m);
        self.converge_ephemerons(&mut m);

        let keys_weak: Vec<GcIdx<Table>> =
            m.ephemerons.iter().chain(&m.all_weak).copied().collect();
        self.clear_by_keys(&keys_weak);
        let values_weak: Vec<GcIdx<Table>> =
            m.weak_values.iter().chain(&m.all_weak).copied().collect();
        self.clear_by_values(&values_weak);

        let mut cache = std::mem::take(&mut self.strcache);
        cache.clear_dead(|r| self.is_marked(r));
        self.strcache = cache;

        let freed = self.sweep();
        self.check_string_table_size();

        let stats = CollectStats {
            freed,
            bytes_before,
            bytes_after: self.mem.total(),
            finalizable: to_finalize.len(),
        };
        debug!(
            "collection: freed {} objects, {} -> {} bytes, {} to finalize",
            stats.freed, stats.bytes_before, stats.bytes_after, stats.finalizable
        );
        CollectResult { stats, to_finalize }
    }

    fn marked_in(marks: Option<Marks>) -> bool {
        marks.is_some_and(|m| m.intersects(Marks::BLACK | Marks::FIXED))
    }

    fn is_marked(&self, r: GcRef) -> bool {
        Self::marked_in(self.header(r).map(|h| h.marked()))
    }

    /// Non-collectable values are always live.
    fn is_live(&self, v: &TValue) -> bool {
        v.gc_ref().map_or(true, |r| self.is_marked(r))
    }

    fn mark_object(&mut self, r: GcRef, m: &mut Marker) {
        if let Some(h) = self.header_mut(r) {
            if !h.marked.contains(Marks::BLACK) {
                h.marked.insert(Marks::BLACK);
                if r.kind != ObjKind::String {
                    m.gray.push(r);
                }
            }
        }
    }

    fn mark_value(&mut self, v: &TValue, m: &mut Marker) {
        if let Some(r) = v.gc_ref() {
            self.mark_object(r, m);
        }
    }

    fn mark_opt<T: GcObject>(&mut self, idx: Option<GcIdx<T>>, m: &mut Marker) {
        if let Some(idx) = idx {
            self.mark_object(idx.to_ref(), m);
        }
    }

    fn propagate(&mut self, m: &mut Marker) {
        while let Some(r) = m.gray.pop() {
            self.traverse(r, m);
        }
    }

    fn traverse(&mut self, r: GcRef, m: &mut Marker) {
        match r.kind {
            ObjKind::String => {}
            ObjKind::Table => {
                if let Some(t) = r.cast::<Table>() {
                    self.traverse_table(t, m);
                }
            }
            ObjKind::LClosure => {
                let Some(cl) = r.cast::<LClosure>().and_then(|c| self.try_get(c)) else {
                    return;
                };
                let proto = cl.proto;
                let upvals: Vec<GcIdx<UpVal>> = cl.upvals().collect();
                self.mark_object(proto.to_ref(), m);
                for uv in upvals {
                    self.mark_object(uv.to_ref(), m);
                }
            }
            ObjKind::CClosure => {
                let Some(cl) = r.cast::<CClosure>().and_then(|c| self.try_get(c)) else {
                    return;
                };
                let values = cl.upvalues.clone();
                for v in &values {
                    self.mark_value(v, m);
                }
            }
            ObjKind::UpVal => {
                let Some(uv) = r.cast::<UpVal>().and_then(|u| self.try_get(u)) else {
                    return;
                };
                let v = match uv.location() {
                    UpValLocation::Closed(v) => v,
                    // The slot's value, not the thread: a dying thread
                    // closes its upvalues before it is freed.
                    UpValLocation::Open { thread, level } => self
                        .try_get(thread)
                        .map_or(TValue::Nil, |t| t.stack_get(level)),
                };
                self.mark_value(&v, m);
            }
            ObjKind::Proto => {
                let Some(p) = r.cast::<Proto>().and_then(|p| self.try_get(p)) else {
                    return;
                };
                let mut refs: Vec<GcRef> = p.constants.iter().filter_map(|c| c.gc_ref()).collect();
                refs.extend(p.protos.iter().map(|c| c.to_ref()));
                refs.extend(p.upvalues.iter().filter_map(|u| u.name).map(|n| n.to_ref()));
                refs.extend(p.local_vars.iter().map(|l| l.name.to_ref()));
                refs.extend(p.source.map(|s| s.to_ref()));
                for r in refs {
                    self.mark_object(r, m);
                }
            }
            ObjKind::Userdata => {
                let Some(u) = r.cast::<Udata>().and_then(|u| self.try_get(u)) else {
                    return;
                };
                let mt = u.metatable;
                let values = u.user_values().to_vec();
                self.mark_opt(mt, m);
                for v in &values {
                    self.mark_value(v, m);
                }
            }
            ObjKind::Thread => {
                let Some(t) = r.cast::<Thread>().and_then(|t| self.try_get(t)) else {
                    return;
                };
                let values = t.stack().to_vec();
                let upvals: Vec<GcIdx<UpVal>> = t.open_upvals.iter().map(|&(_, uv)| uv).collect();
                for v in &values {
                    self.mark_value(v, m);
                }
                for uv in upvals {
                    self.mark_object(uv.to_ref(), m);
                }
            }
        }
    }

    fn weakness(&self, mt: Option<GcIdx<Table>>) -> Weakness {
        let Some(mt) = mt else {
            return Weakness::Strong;
        };
        let mode = self
            .get(mt)
            .get_short_str(self.tm_name(TagMethod::Mode), &self.strings);
        let Some(s) = mode.as_string() else {
            return Weakness::Strong;
        };
        let bytes = self.string_bytes(s);
        match (bytes.contains(&b'k'), bytes.contains(&b'v')) {
            (false, false) => Weakness::Strong,
            (false, true) => Weakness::Values,
            (true, false) => Weakness::Keys,
            (true, true) => Weakness::All,
        }
    }

    fn traverse_table(&mut self, t: GcIdx<Table>, m: &mut Marker) {
        let mt = self.get(t).metatable;
        let weakness = self.weakness(mt);
        self.mark_opt(mt, m);
        self.get_mut(t).kill_empty_keys();
        let entries: Vec<(TValue, TValue)> = self.get(t).iter().collect();
        // Strings are values, never cleared from weak tables.
        for (k, v) in &entries {
            if k.is_string() || matches!(weakness, Weakness::Strong | Weakness::Values) {
                self.mark_value(k, m);
            }
            let mark_value = match weakness {
                Weakness::Strong => true,
                Weakness::Keys => v.is_string() || self.is_live(k),
                Weakness::Values | Weakness::All => v.is_string(),
            };
            if mark_value {
                self.mark_value(v, m);
            }
        }
        match weakness {
            Weakness::Strong => {}
            Weakness::Values => m.weak_values.push(t),
            Weakness::Keys => m.ephemerons.push(t),
            Weakness::All => m.all_weak.push(t),
        }
    }

    /// Mark values of ephemeron entries whose keys became reachable, until
    /// nothing changes.
    fn converge_ephemerons(&mut self, m: &mut Marker) {
        loop {
            let mut changed = false;
            for t in m.ephemerons.clone() {
                let entries: Vec<(TValue, TValue)> = self.get(t).iter().collect();
                for (k, v) in entries {
                    if self.is_live(&k) && !self.is_live(&v) {
                        self.mark_value(&v, m);
                        changed = true;
                    }
                }
            }
            self.propagate(m);
            if !changed {
                break;
            }
        }
    }

    fn dead_refs(&self, t: GcIdx<Table>) -> HashSet<GcRef> {
        self.get(t)
            .iter()
            .flat_map(|(k, v)| [k.gc_ref(), v.gc_ref()])
            .flatten()
            .filter(|&r| !self.is_marked(r))
            .collect()
    }

    fn clear_by_values(&mut self, tables: &[GcIdx<Table>]) {
        for &t in tables {
            let dead = self.dead_refs(t);
            if !dead.is_empty() {
                self.get_mut(t)
                    .clear_by_values(|v| v.gc_ref().is_some_and(|r| dead.contains(&r)));
            }
        }
    }

    fn clear_by_keys(&mut self, tables: &[GcIdx<Table>]) {
        for &t in tables {
            let dead = self.dead_refs(t);
            if !dead.is_empty() {
                self.get_mut(t)
                    .clear_by_keys(|k| k.gc_ref().is_some_and(|r| dead.contains(&r)));
            }
        }
    }

    /// Resurrect unreachable objects registered for finalization.
    fn separate_finalizable(&mut self, m: &mut Marker) -> Vec<TValue> {
        let pending: Vec<GcRef> = self
            .allocation_list()
            .filter(|&r| {
                self.header(r).is_some_and(|h| {
                    h.marked().contains(Marks::FINALIZABLE) && !h.marked().contains(Marks::BLACK)
                })
            })
            .collect();
        let mut out = Vec::with_capacity(pending.len());
        for r in pending {
            if let Some(h) = self.header_mut(r) {
                h.marked.remove(Marks::FINALIZABLE);
                h.marked.insert(Marks::FINALIZED);
            }
            if let Some(v) = self.value_of(r) {
                out.push(v);
            }
            self.mark_object(r, m);
        }
        out
    }

    /// Free every unmarked object and clear the marks of survivors.
    fn sweep(&mut self) -> usize {
        let dying_threads: Vec<GcIdx<Thread>> = self
            .threads
            .iter()
            .map(|(idx, _)| idx)
            .filter(|t| !self.is_marked(t.to_ref()))
            .collect();
        for th in dying_threads {
            self.close_upvals(th, 0);
        }

        let mut freed = 0;
        let mut prev: Option<GcRef> = None;
        let mut cur = self.allgc();
        while let Some(r) = cur {
            let Some(h) = self.header(r).copied() else {
                break;
            };
            let next = h.next();
            if Self::marked_in(Some(h.marked())) {
                if let Some(h) = self.header_mut(r) {
                    h.marked.remove(Marks::BLACK);
                }
                prev = Some(r);
            } else {
                match prev {
                    None => self.set_allgc(next),
                    Some(p) => {
                        if let Some(ph) = self.header_mut(p) {
                            ph.next = next;
                        }
                    }
                }
                if let Some(s) = r.cast::<TString>() {
                    let short = self.try_get(s).map(|s| (s.is_short(), s.hash()));
                    if let Some((true, hash)) = short {
                        self.strt.remove(s, hash);
                    }
                }
                self.free_object(r);
                freed += 1;
            }
            cur = next;
        }
        freed
    }
}
