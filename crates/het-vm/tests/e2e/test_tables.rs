use super::helpers::*;
use het_core::limits::Integer;
use het_core::table::TableError;
use het_core::value::TValue;
use het_vm::{HetError, Status};
use proptest::prelude::*;
use std::collections::HashMap;

#[test]
fn test_array_and_hash_parts() {
    let mut s = new_state();
    let t = new_table(&mut s);
    for i in 1..=100 {
        s.heap_mut()
            .table_set_int(t, i, TValue::from_integer(i * i))
            .unwrap();
    }
    let k = str_val(&mut s, b"name");
    let v = str_val(&mut s, b"value");
    s.heap_mut().table_set(t, k, v).unwrap();

    assert_eq!(s.heap_mut().table_length(t), 100);
    assert_int(s.heap().table_get_int(t, 7), 49);
    assert_eq!(bytes_of(&s, s.heap().table_get_str(t, b"name")), b"value");
    assert!(s.heap().table_get_int(t, 101).is_nil());
}

#[test]
fn test_float_keys_normalize() {
    let mut s = new_state();
    let t = new_table(&mut s);
    s.heap_mut()
        .table_set(t, TValue::from_float(3.0), TValue::from_bool(true))
        .unwrap();
    assert_eq!(s.heap().table_get_int(t, 3), TValue::from_bool(true));
    s.heap_mut()
        .table_set(t, TValue::from_float(0.5), TValue::from_integer(1))
        .unwrap();
    assert_int(s.heap().table_get(t, &TValue::from_float(0.5)), 1);
}

#[test]
fn test_invalid_keys() {
    let mut s = new_state();
    let t = new_table(&mut s);
    let e = s
        .heap_mut()
        .table_set(t, TValue::Nil, TValue::from_integer(1))
        .unwrap_err();
    assert_eq!(e, TableError::NilIndex);
    let e = s
        .heap_mut()
        .table_set(t, TValue::from_float(f64::NAN as _), TValue::from_integer(1))
        .unwrap_err();
    assert_eq!(e, TableError::NanIndex);
    let err = HetError::from(e);
    assert_eq!(err.status(), Status::ErrRun);
    assert_eq!(err.to_string(), "index is NaN");
}

#[test]
fn test_next_visits_every_entry_once() {
    let mut s = new_state();
    let t = new_table(&mut s);
    for i in 1..=10 {
        s.heap_mut()
            .table_set_int(t, i, TValue::from_integer(i))
            .unwrap();
    }
    for i in 0..10 {
        let key = str_val(&mut s, format!("k{i}").as_bytes());
        s.heap_mut().table_set(t, key, TValue::from_integer(i)).unwrap();
    }
    let mut seen = 0;
    let mut key = TValue::Nil;
    while let Some((k, v)) = s.heap().table_next(t, &key).unwrap() {
        assert!(!v.is_nil());
        seen += 1;
        key = k;
    }
    assert_eq!(seen, 20);
}

#[test]
fn test_clearing_during_traversal() {
    let mut s = new_state();
    let t = new_table(&mut s);
    for i in 0..20 {
        let key = str_val(&mut s, format!("f{i}").as_bytes());
        s.heap_mut().table_set(t, key, TValue::from_integer(i)).unwrap();
    }
    let mut key = TValue::Nil;
    let mut seen = 0;
    while let Some((k, _)) = s.heap().table_next(t, &key).unwrap() {
        s.heap_mut().table_set(t, k, TValue::Nil).unwrap();
        seen += 1;
        key = k;
    }
    assert_eq!(seen, 20);
    assert_eq!(s.heap().get(t).count(), 0);
}

#[test]
fn test_table_growth_respects_memory_limit() {
    let mut s = new_state();
    let t = new_table(&mut s);
    let total = s.heap().mem().total();
    s.heap_mut().set_memory_limit(Some(total));
    let mut failed = None;
    for i in 1..=1000 {
        if let Err(e) = s.heap_mut().table_set_int(t, i, TValue::from_integer(i)) {
            failed = Some((i, e));
            break;
        }
    }
    let (at, e) = failed.expect("growth past the limit must fail");
    assert_eq!(e, TableError::OutOfMemory);
    assert_eq!(HetError::from(e).status(), Status::ErrMem);
    // Entries stored before the failure are intact.
    for i in 1..at {
        assert_int(s.heap().table_get_int(t, i), i);
    }
    s.heap_mut().set_memory_limit(None);
    s.heap_mut()
        .table_set_int(t, at, TValue::from_integer(at))
        .unwrap();
}

#[derive(Clone, Debug)]
enum Key {
    Int(Integer),
    Str(String),
}

fn key_strategy() -> impl Strategy<Value = Key> {
    prop_oneof![
        (-20 as Integer..200).prop_map(Key::Int),
        "[a-z]{1,6}".prop_map(Key::Str),
    ]
}

proptest! {
    #[test]
    fn prop_table_matches_hashmap(
        ops in proptest::collection::vec((key_strategy(), proptest::option::of(0 as Integer..1000)), 1..200)
    ) {
        let mut s = new_state();
        let t = new_table(&mut s);
        let mut model: HashMap<String, Integer> = HashMap::new();
        for (key, value) in &ops {
            let (k, name) = match key {
                Key::Int(i) => (TValue::from_integer(*i), format!("#{i}")),
                Key::Str(st) => (str_val(&mut s, st.as_bytes()), st.clone()),
            };
            let v = value.map_or(TValue::Nil, TValue::from_integer);
            s.heap_mut().table_set(t, k, v).unwrap();
            match value {
                Some(x) => { model.insert(name, *x); }
                None => { model.remove(&name); }
            }
        }
        for (key, _) in &ops {
            let (got, name) = match key {
                Key::Int(i) => (s.heap().table_get_int(t, *i), format!("#{i}")),
                Key::Str(st) => (s.heap().table_get_str(t, st.as_bytes()), st.clone()),
            };
            match model.get(&name) {
                Some(x) => prop_assert_eq!(got.as_integer(), Some(*x)),
                None => prop_assert!(got.is_nil()),
            }
        }
        prop_assert_eq!(s.heap().get(t).count(), model.len());
    }
}
