#![no_main]

use libfuzzer_sys::fuzz_target;
use helion_kernel::sanitize_app_id;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let clean = sanitize_app_id(s);
        assert!(clean
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
        assert_eq!(clean.chars().count(), s.chars().count());
        // Idempotent.
        assert_eq!(sanitize_app_id(&clean), clean);
    }
});
