use super::helpers::*;
use het_core::closure::UpValLocation;
use het_core::gc::GcIdx;
use het_core::proto::{Proto, UpvalDesc};
use het_core::value::TValue;
use het_vm::State;

/// A prototype capturing the given registers of its enclosing frame.
fn capturing(s: &mut State, registers: &[u8]) -> GcIdx<Proto> {
    let upvalues = registers
        .iter()
        .map(|&index| UpvalDesc {
            name: None,
            in_stack: true,
            index,
            kind: 0,
        })
        .collect();
    s.heap_mut()
        .new_proto(Proto {
            upvalues,
            ..Proto::default()
        })
        .unwrap()
}

#[test]
fn test_sibling_closures_share_a_cell() {
    let mut s = new_state();
    s.push(TValue::from_integer(1)).unwrap();
    s.push(TValue::from_integer(2)).unwrap();
    let p = capturing(&mut s, &[1]);
    let a = s.new_closure(p, 0, None).unwrap();
    let b = s.new_closure(p, 0, None).unwrap();

    let ua = s.heap().get(a).upval(0).unwrap();
    let ub = s.heap().get(b).upval(0).unwrap();
    assert_eq!(ua, ub);
    assert!(s.heap().get(ua).is_open());

    // Writes through the cell land in the stack slot while open.
    s.heap_mut().upval_set(ua, TValue::from_integer(20));
    assert_eq!(s.heap().get(s.main_thread()).stack_get(1), TValue::from_integer(20));

    s.close_upvalues(0);
    assert!(!s.heap().get(ua).is_open());
    assert_eq!(s.heap().upval_get(ub), TValue::from_integer(20));

    // Closed cells are independent of the stack.
    s.set_top(0).unwrap();
    s.push(TValue::from_integer(99)).unwrap();
    s.push(TValue::from_integer(99)).unwrap();
    assert_eq!(s.heap().upval_get(ua), TValue::from_integer(20));
    s.heap_mut().upval_set(ub, TValue::from_bool(true));
    assert_eq!(s.heap().upval_get(ua), TValue::from_bool(true));
}

#[test]
fn test_close_above_level_only() {
    let mut s = new_state();
    for i in 0..4 {
        s.push(TValue::from_integer(i)).unwrap();
    }
    let p = capturing(&mut s, &[0, 3]);
    let cl = s.new_closure(p, 0, None).unwrap();
    let low = s.heap().get(cl).upval(0).unwrap();
    let high = s.heap().get(cl).upval(1).unwrap();

    s.close_upvalues(2);
    assert!(s.heap().get(low).is_open());
    assert!(matches!(
        s.heap().get(high).location(),
        UpValLocation::Closed(v) if v == TValue::from_integer(3)
    ));
    assert!(s.heap().get(s.main_thread()).has_open_upvals());
    s.close_upvalues(0);
    assert!(!s.heap().get(s.main_thread()).has_open_upvals());
}

#[test]
fn test_nested_closure_inherits_enclosing_cells() {
    let mut s = new_state();
    s.push(TValue::from_integer(5)).unwrap();
    let outer_p = capturing(&mut s, &[0]);
    let outer = s.new_closure(outer_p, 0, None).unwrap();
    let inner_p = s
        .heap_mut()
        .new_proto(Proto {
            upvalues: vec![UpvalDesc {
                name: None,
                in_stack: false,
                index: 0,
                kind: 0,
            }],
            ..Proto::default()
        })
        .unwrap();
    let inner = s.new_closure(inner_p, 1, Some(outer)).unwrap();
    assert_eq!(s.heap().get(inner).upval(0), s.heap().get(outer).upval(0));
}

#[test]
fn test_closure_keeps_closed_value_alive() {
    let mut s = new_state();
    let t = new_table(&mut s);
    s.push(TValue::Table(t)).unwrap();
    let p = capturing(&mut s, &[0]);
    let cl = s.new_closure(p, 0, None).unwrap();
    anchor(&mut s, "closure", TValue::LClosure(cl));
    s.close_upvalues(0);
    s.set_top(0).unwrap();

    s.collect_garbage();
    assert!(s.heap().is_alive(t.to_ref()));
    let uv = s.heap().get(cl).upval(0).unwrap();
    assert_eq!(s.heap().upval_get(uv), TValue::Table(t));
}
