#![no_main]

use het_vm::{State, StateConfig};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Loading must never panic on any input; errors are fine.
    let Ok(mut state) = State::new(StateConfig::default()) else {
        return;
    };
    if let Ok(cl) = state.load(data, "=fuzz") {
        // Whatever loads must dump and reload.
        let bytes = state.dump(cl, false);
        if state.load(&bytes, "=fuzz").is_err() {
            panic!("chunk failed to reload after dump");
        }
    }
    state.collect_garbage();
});
