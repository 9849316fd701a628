use super::helpers::*;
use het_core::limits::MAX_SHORT_LEN;
use het_core::value::TValue;
use proptest::prelude::*;

#[test]
fn test_short_strings_are_interned() {
    let mut s = new_state();
    let a = str_val(&mut s, b"hello");
    let b = str_val(&mut s, b"hello");
    assert!(a.is_short_string());
    assert_eq!(a, b);
}

#[test]
fn test_long_strings_compare_by_content() {
    let mut s = new_state();
    let text = vec![b'x'; MAX_SHORT_LEN + 1];
    let a = str_val(&mut s, &text);
    let b = str_val(&mut s, &text);
    assert!(!a.is_short_string());
    assert_ne!(a.as_string(), b.as_string());
    assert!(s.heap().raw_equal(&a, &b));
}

#[test]
fn test_boundary_length() {
    let mut s = new_state();
    let at = str_val(&mut s, &[b'a'; MAX_SHORT_LEN]);
    assert!(at.is_short_string());
    let over = str_val(&mut s, &[b'a'; MAX_SHORT_LEN + 1]);
    assert!(!over.is_short_string());
    assert!(!s.heap().raw_equal(&at, &over));
}

#[test]
fn test_number_conversion_is_cached() {
    let mut s = new_state();
    let first = s.heap_mut().number_to_str(TValue::from_integer(12345)).unwrap();
    let second = s.heap_mut().number_to_str(TValue::from_integer(12345)).unwrap();
    assert_eq!(first, second);
    assert!(s.heap().stats().strcache_hits >= 1);
    let f = s.heap_mut().number_to_str(TValue::from_float(2.0)).unwrap().unwrap();
    assert_eq!(s.heap().string_bytes(f), b"2.0");
    assert_eq!(s.heap_mut().number_to_str(TValue::Nil).unwrap(), None);
}

#[test]
fn test_unreferenced_strings_are_collected() {
    let mut s = new_state();
    let kept = str_val(&mut s, b"kept");
    anchor(&mut s, "kept", kept);
    let _dropped = str_val(&mut s, b"dropped-string");
    s.collect_garbage();
    assert!(s.heap().find_interned(b"kept").is_some());
    assert!(s.heap().find_interned(b"dropped-string").is_none());
    // Metamethod names are fixed.
    assert!(s.heap().find_interned(b"__index").is_some());
}

proptest! {
    #[test]
    fn prop_interning_identity(text in proptest::collection::vec(any::<u8>(), 0..=MAX_SHORT_LEN)) {
        let mut s = new_state();
        let a = str_val(&mut s, &text);
        let b = str_val(&mut s, &text);
        prop_assert_eq!(a, b);
        prop_assert_eq!(bytes_of(&s, a), text);
    }

    #[test]
    fn prop_distinct_contents_distinct_objects(
        x in proptest::collection::vec(any::<u8>(), 0..=MAX_SHORT_LEN),
        y in proptest::collection::vec(any::<u8>(), 0..=MAX_SHORT_LEN),
    ) {
        prop_assume!(x != y);
        let mut s = new_state();
        let a = str_val(&mut s, &x);
        let b = str_val(&mut s, &y);
        prop_assert_ne!(a, b);
        prop_assert!(!s.heap().raw_equal(&a, &b));
    }
}
