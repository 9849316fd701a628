use het_core::closure::{NativeContext, NativeError};
use het_core::gc::GcIdx;
use het_core::limits::Integer;
use het_core::table::Table;
use het_core::value::TValue;
use het_vm::{State, StateConfig};

pub fn new_state() -> State {
    State::new(StateConfig::default()).unwrap_or_else(|e| panic!("state creation failed: {e}"))
}

/// A string value with these bytes.
pub fn str_val(s: &mut State, bytes: &[u8]) -> TValue {
    s.heap_mut().new_string_value(bytes).unwrap()
}

/// Bytes of a string value.
pub fn bytes_of(s: &State, v: TValue) -> Vec<u8> {
    let idx = v
        .as_string()
        .unwrap_or_else(|| panic!("{v:?} is not a string"));
    s.heap().string_bytes(idx).to_vec()
}

pub fn new_table(s: &mut State) -> GcIdx<Table> {
    s.heap_mut().new_table(0, 0).unwrap()
}

/// A fresh table and the metatable attached to it.
pub fn table_with_metatable(s: &mut State) -> (GcIdx<Table>, GcIdx<Table>) {
    let t = new_table(s);
    let mt = new_table(s);
    s.set_metatable(&TValue::Table(t), Some(mt));
    (t, mt)
}

/// Keep `v` alive across collections by storing it in the registry.
pub fn anchor(s: &mut State, name: &str, v: TValue) {
    let registry = s.registry();
    s.heap_mut()
        .table_set_str(registry, name.as_bytes(), v)
        .unwrap();
}

pub fn assert_int(v: TValue, expected: Integer) {
    let got = v
        .as_integer()
        .unwrap_or_else(|| panic!("{v:?}, expected integer {expected}"));
    assert_eq!(got, expected);
}

/// Native function returning its arguments.
pub fn identity(ctx: &mut NativeContext<'_>) -> Result<Vec<TValue>, NativeError> {
    Ok(ctx.args.to_vec())
}
