use super::helpers::*;
use het_core::closure::{NativeContext, NativeError};
use het_core::number::{ArithOp, CompareOp};
use het_core::tm::TagMethod;
use het_core::value::TValue;
use het_vm::metamethod::MetaResult;

fn string_upper(ctx: &mut NativeContext<'_>) -> Result<Vec<TValue>, NativeError> {
    let key = ctx.arg(1);
    let s = key
        .as_string()
        .ok_or_else(|| NativeError::Message("string key expected".into()))?;
    let upper = ctx.heap.string_bytes(s).to_ascii_uppercase();
    let v = ctx
        .heap
        .new_string_value(&upper)
        .map_err(|e| NativeError::Message(e.to_string()))?;
    Ok(vec![v])
}

#[test]
fn test_absence_is_cached_and_invalidated() {
    let mut s = new_state();
    let (t, mt) = table_with_metatable(&mut s);
    let tv = TValue::Table(t);
    assert_eq!(s.tm_by_obj(&tv, TagMethod::Index), None);
    assert_ne!(s.heap().get(mt).flags() & (1 << TagMethod::Index as u8), 0);

    let fallback = new_table(&mut s);
    s.heap_mut()
        .table_set_str(mt, b"__index", TValue::Table(fallback))
        .unwrap();
    assert_eq!(s.heap().get(mt).flags() & (1 << TagMethod::Index as u8), 0);
    assert_eq!(s.tm_by_obj(&tv, TagMethod::Index), Some(TValue::Table(fallback)));
}

#[test]
fn test_index_function_handler() {
    let mut s = new_state();
    let (t, mt) = table_with_metatable(&mut s);
    s.heap_mut()
        .table_set_str(mt, b"__index", TValue::from_native(string_upper))
        .unwrap();
    let key = str_val(&mut s, b"shout");
    let tv = TValue::Table(t);
    assert!(matches!(
        s.index_dispatch(&tv, &key).unwrap(),
        MetaResult::Call { args, .. } if args == [tv, key]
    ));
    let v = s.index(&tv, &key).unwrap();
    assert_eq!(bytes_of(&s, v), b"SHOUT");
}

#[test]
fn test_per_type_metatable_for_strings() {
    let mut s = new_state();
    let methods = new_table(&mut s);
    s.heap_mut()
        .table_set_str(methods, b"kind", TValue::from_integer(1))
        .unwrap();
    let mt = new_table(&mut s);
    s.heap_mut()
        .table_set_str(mt, b"__index", TValue::Table(methods))
        .unwrap();
    let sample = str_val(&mut s, b"any");
    s.set_metatable(&sample, Some(mt));
    anchor(&mut s, "string_mt", TValue::Table(mt));

    let other = str_val(&mut s, b"another string");
    let key = str_val(&mut s, b"kind");
    assert_int(s.index(&other, &key).unwrap(), 1);
    // Numbers have no metatable.
    let e = s.index(&TValue::from_integer(3), &key).unwrap_err();
    assert_eq!(e.to_string(), "attempt to index a number value");
}

#[test]
fn test_userdata_name_and_handlers() {
    let mut s = new_state();
    let u = s.heap_mut().new_userdata(16, 1).unwrap();
    let mt = new_table(&mut s);
    let name = str_val(&mut s, b"File");
    s.heap_mut().table_set_str(mt, b"__name", name).unwrap();
    let uv = TValue::Userdata(u);
    s.set_metatable(&uv, Some(mt));

    assert_eq!(s.obj_type_name(&uv), "File");
    let e = s.len(&uv).unwrap_err();
    assert_eq!(e.to_string(), "attempt to get length of a File value");

    s.heap_mut()
        .table_set_str(mt, b"__call", TValue::from_native(identity))
        .unwrap();
    let r = s.call(uv, &[TValue::from_integer(1)]).unwrap();
    assert_eq!(r, vec![uv, TValue::from_integer(1)]);
}

#[test]
fn test_binary_handler_order() {
    let mut s = new_state();
    let (a, mta) = table_with_metatable(&mut s);
    let (b, mtb) = table_with_metatable(&mut s);
    s.heap_mut()
        .table_set_str(mta, b"__sub", TValue::from_integer(1))
        .unwrap();
    s.heap_mut()
        .table_set_str(mtb, b"__sub", TValue::from_integer(2))
        .unwrap();
    let (av, bv) = (TValue::Table(a), TValue::Table(b));
    assert_eq!(
        s.binary_tm(&av, &bv, TagMethod::Sub),
        Some(TValue::from_integer(1))
    );
    assert_eq!(
        s.binary_tm(&TValue::from_integer(0), &bv, TagMethod::Sub),
        Some(TValue::from_integer(2))
    );
    match s.arith_dispatch(ArithOp::Sub, &bv, &av).unwrap() {
        MetaResult::Call { handler, args } => {
            assert_eq!(handler, TValue::from_integer(2));
            assert_eq!(args, [bv, av]);
        }
        other => panic!("expected a handler, got {other:?}"),
    }
}

#[test]
fn test_lt_handler() {
    let mut s = new_state();
    let (a, mt) = table_with_metatable(&mut s);
    let b = new_table(&mut s);
    s.heap_mut()
        .table_set_str(mt, b"__lt", TValue::from_native(identity))
        .unwrap();
    assert!(s
        .compare(CompareOp::Lt, &TValue::Table(a), &TValue::Table(b))
        .unwrap());
    let e = s
        .compare(CompareOp::Le, &TValue::Table(b), &TValue::Table(b))
        .unwrap_err();
    assert_eq!(e.to_string(), "attempt to compare two table values");
}
