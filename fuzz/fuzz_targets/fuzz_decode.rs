#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Decoding arbitrary bytes must fail cleanly, never panic.
    if let Ok(commands) = ethosu_backend_core::command::decode_bytes(data) {
        let words = ethosu_backend_core::command::encode(&commands);
        assert_eq!(ethosu_backend_core::command::decode(&words).as_ref(), Ok(&commands));
    }
});
