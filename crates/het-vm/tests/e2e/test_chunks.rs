use super::helpers::*;
use het_core::proto::{Instruction, Proto, UpvalDesc};
use het_core::value::TValue;
use het_vm::binary_chunk::{is_binary_chunk, UndumpReason};
use het_vm::{HetError, Status};

fn main_chunk(s: &mut het_vm::State) -> het_core::gc::GcIdx<het_core::closure::LClosure> {
    let env = s.heap_mut().intern(b"_ENV").unwrap();
    let source = s.heap_mut().intern(b"@chunk.het").unwrap();
    let mut p = Proto {
        source: Some(source),
        is_vararg: true,
        max_stack_size: 2,
        upvalues: vec![UpvalDesc {
            name: Some(env),
            in_stack: true,
            index: 0,
            kind: 0,
        }],
        code: vec![Instruction(0x0000_0051), Instruction(0x0001_0046)],
        ..Proto::default()
    };
    let greeting = str_val(s, b"hello");
    p.add_constant(greeting);
    p.add_constant(TValue::from_float(-0.0));
    let proto = s.heap_mut().new_proto(p).unwrap();
    s.heap_mut().new_lclosure(proto).unwrap()
}

#[test]
fn test_load_binds_globals() {
    let mut s = new_state();
    let cl = main_chunk(&mut s);
    let bytes = s.dump(cl, false);
    assert!(is_binary_chunk(&bytes));

    let loaded = s.load(&bytes, "@chunk.het").unwrap();
    let uv = s.heap().get(loaded).upval(0).unwrap();
    assert_eq!(s.heap().upval_get(uv), TValue::Table(s.globals().unwrap()));

    let p = s.heap().get(loaded).proto;
    let proto = s.heap().get(p);
    assert_eq!(proto.code.len(), 2);
    assert_eq!(bytes_of(&s, proto.constants[0]), b"hello");
    let z = proto.constants[1].as_float().unwrap();
    assert!(z == 0.0 && z.is_sign_negative());
}

#[test]
fn test_dump_is_deterministic() {
    let mut s = new_state();
    let cl = main_chunk(&mut s);
    let once = s.dump(cl, true);
    let loaded = s.load(&once, "=x").unwrap();
    assert_eq!(s.dump(loaded, true), once);
}

#[test]
fn test_loaded_chunk_survives_collection() {
    let mut s = new_state();
    let cl = main_chunk(&mut s);
    let bytes = s.dump(cl, false);
    let loaded = s.load(&bytes, "=x").unwrap();
    anchor(&mut s, "main", TValue::LClosure(loaded));
    s.collect_garbage();
    let p = s.heap().get(loaded).proto;
    assert_eq!(bytes_of(&s, s.heap().get(p).constants[0]), b"hello");
}

#[test]
fn test_load_errors_are_syntax_errors() {
    let mut s = new_state();
    let e = s.load(b"return 1", "=src").unwrap_err();
    assert_eq!(e.status(), Status::ErrSyntax);
    match e {
        HetError::Undump(u) => {
            assert_eq!(u.reason, UndumpReason::NotAChunk);
            assert_eq!(u.chunk, "src");
        }
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn test_garbage_input_never_panics() {
    let mut s = new_state();
    let cl = main_chunk(&mut s);
    let bytes = s.dump(cl, false);
    for i in 0..bytes.len() {
        for flip in [0x01u8, 0x80, 0xff] {
            let mut corrupted = bytes.clone();
            corrupted[i] ^= flip;
            let _ = s.load(&corrupted, "=fuzz");
        }
    }
}
