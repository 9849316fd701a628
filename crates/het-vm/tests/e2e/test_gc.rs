use super::helpers::*;
use het_core::closure::{NativeContext, NativeError};
use het_core::limits::{HeapConfig, Integer};
use het_core::value::TValue;
use het_vm::{HetError, State, StateConfig, Status};

/// `__gc` handler counting its calls in `counter[1]` (its upvalue).
fn count_call(ctx: &mut NativeContext<'_>) -> Result<Vec<TValue>, NativeError> {
    let counter = ctx
        .upvalue(0)
        .as_table()
        .ok_or_else(|| NativeError::Message("no counter".into()))?;
    let n = ctx.heap.table_get_int(counter, 1).as_integer().unwrap_or(0);
    ctx.heap
        .table_set_int(counter, 1, TValue::from_integer(n + 1))
        .map_err(|e| NativeError::Message(e.to_string()))?;
    Ok(vec![])
}

fn failing(_: &mut NativeContext<'_>) -> Result<Vec<TValue>, NativeError> {
    Err(NativeError::Message("finalizer failed".into()))
}

fn calls(s: &State, counter: het_core::gc::GcIdx<het_core::table::Table>) -> Integer {
    s.heap().table_get_int(counter, 1).as_integer().unwrap_or(0)
}

#[test]
fn test_unreachable_objects_are_freed() {
    let mut s = new_state();
    let kept = new_table(&mut s);
    anchor(&mut s, "kept", TValue::Table(kept));
    let garbage: Vec<_> = (0..10).map(|_| new_table(&mut s)).collect();
    let before = s.heap().stats().objects;

    let stats = s.collect_garbage();
    assert!(stats.freed >= 10);
    assert!(stats.bytes_after < stats.bytes_before);
    assert!(s.heap().stats().objects <= before - 10);
    assert!(s.heap().is_alive(kept.to_ref()));
    assert!(garbage.iter().all(|t| !s.heap().is_alive(t.to_ref())));
}

#[test]
fn test_finalizer_runs_once() {
    let mut s = new_state();
    let counter = new_table(&mut s);
    anchor(&mut s, "counter", TValue::Table(counter));
    let handler = s
        .heap_mut()
        .new_cclosure(count_call, vec![TValue::Table(counter)])
        .unwrap();
    let (obj, mt) = {
        let obj = new_table(&mut s);
        let mt = new_table(&mut s);
        s.heap_mut()
            .table_set_str(mt, b"__gc", TValue::CClosure(handler))
            .unwrap();
        s.set_metatable(&TValue::Table(obj), Some(mt));
        (obj, mt)
    };

    let stats = s.collect_garbage();
    assert_eq!(stats.finalizable, 1);
    assert_eq!(s.pending_finalizers(), &[TValue::Table(obj)]);
    assert!(s.heap().is_alive(obj.to_ref()));
    assert!(s.heap().is_alive(mt.to_ref()));

    assert_eq!(s.run_finalizers(), 1);
    assert_eq!(calls(&s, counter), 1);
    assert!(s.pending_finalizers().is_empty());

    let stats = s.collect_garbage();
    assert_eq!(stats.finalizable, 0);
    assert!(!s.heap().is_alive(obj.to_ref()));
    assert_eq!(s.run_finalizers(), 0);
    assert_eq!(calls(&s, counter), 1);
}

#[test]
fn test_gc_field_added_later_is_ignored() {
    let mut s = new_state();
    let (obj, mt) = table_with_metatable(&mut s);
    s.heap_mut()
        .table_set_str(mt, b"__gc", TValue::from_native(failing))
        .unwrap();
    let stats = s.collect_garbage();
    assert_eq!(stats.finalizable, 0);
    assert!(!s.heap().is_alive(obj.to_ref()));
}

#[test]
fn test_failing_finalizer_does_not_stop_others() {
    let mut s = new_state();
    let counter = new_table(&mut s);
    anchor(&mut s, "counter", TValue::Table(counter));
    let good = s
        .heap_mut()
        .new_cclosure(count_call, vec![TValue::Table(counter)])
        .unwrap();
    for handler in [TValue::from_native(failing), TValue::CClosure(good)] {
        let obj = new_table(&mut s);
        let mt = new_table(&mut s);
        s.heap_mut().table_set_str(mt, b"__gc", handler).unwrap();
        s.set_metatable(&TValue::Table(obj), Some(mt));
    }
    s.collect_garbage();
    assert_eq!(s.pending_finalizers().len(), 2);
    assert_eq!(s.run_finalizers(), 2);
    assert_eq!(calls(&s, counter), 1);
}

#[test]
fn test_weak_keys() {
    let mut s = new_state();
    let weak = new_table(&mut s);
    let mt = new_table(&mut s);
    let mode = str_val(&mut s, b"k");
    s.heap_mut().table_set_str(mt, b"__mode", mode).unwrap();
    s.set_metatable(&TValue::Table(weak), Some(mt));
    anchor(&mut s, "weak", TValue::Table(weak));

    let live_key = new_table(&mut s);
    anchor(&mut s, "live", TValue::Table(live_key));
    let dead_key = new_table(&mut s);
    for k in [live_key, dead_key] {
        s.heap_mut()
            .table_set(weak, TValue::Table(k), TValue::from_bool(true))
            .unwrap();
    }
    s.collect_garbage();
    assert_eq!(s.heap().get(weak).count(), 1);
    assert_eq!(
        s.heap().table_get(weak, &TValue::Table(live_key)),
        TValue::from_bool(true)
    );
    assert!(!s.heap().is_alive(dead_key.to_ref()));
}

#[test]
fn test_weak_values_keep_strings() {
    let mut s = new_state();
    let weak = new_table(&mut s);
    let mt = new_table(&mut s);
    let mode = str_val(&mut s, b"v");
    s.heap_mut().table_set_str(mt, b"__mode", mode).unwrap();
    s.set_metatable(&TValue::Table(weak), Some(mt));
    anchor(&mut s, "weak", TValue::Table(weak));

    let doomed = new_table(&mut s);
    s.heap_mut()
        .table_set_int(weak, 1, TValue::Table(doomed))
        .unwrap();
    let text = str_val(&mut s, b"only referenced weakly");
    s.heap_mut().table_set_int(weak, 2, text).unwrap();

    s.collect_garbage();
    assert!(s.heap().table_get_int(weak, 1).is_nil());
    assert_eq!(bytes_of(&s, s.heap().table_get_int(weak, 2)), b"only referenced weakly");
}

#[test]
fn test_type_metatables_are_roots() {
    let mut s = new_state();
    let mt = new_table(&mut s);
    s.set_metatable(&TValue::from_bool(true), Some(mt));
    s.collect_garbage();
    assert!(s.heap().is_alive(mt.to_ref()));
    assert_eq!(s.get_metatable(&TValue::from_bool(false)), Some(mt));
}

#[test]
fn test_memory_limit() {
    let mut s = State::new(StateConfig {
        heap: HeapConfig {
            memory_limit: Some(1 << 20),
            ..HeapConfig::default()
        },
        ..StateConfig::default()
    })
    .unwrap();
    let total = s.heap().mem().total();
    s.heap_mut().set_memory_limit(Some(total));
    let e = HetError::from(s.heap_mut().new_table(0, 0).unwrap_err());
    assert_eq!(e.status(), Status::ErrMem);
    assert_eq!(s.heap().mem().total(), total);
    // The error can still be reported without allocating.
    let v = s.error_value(&e);
    assert_eq!(bytes_of(&s, v), b"not enough memory");

    s.heap_mut().set_memory_limit(Some(total * 2));
    assert!(s.heap_mut().new_table(0, 0).is_ok());
}

#[test]
fn test_collection_is_idempotent_on_live_data() {
    let mut s = new_state();
    let t = new_table(&mut s);
    anchor(&mut s, "t", TValue::Table(t));
    s.collect_garbage();
    let objects = s.heap().stats().objects;
    let stats = s.collect_garbage();
    assert_eq!(stats.freed, 0);
    assert_eq!(s.heap().stats().objects, objects);
}
