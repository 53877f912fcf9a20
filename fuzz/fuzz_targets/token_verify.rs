#![no_main]

use libfuzzer_sys::fuzz_target;
use helion_kernel::TokenService;
use std::sync::LazyLock;

static SERVICE: LazyLock<TokenService> = LazyLock::new(TokenService::new);

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        // Must never panic, and must never come back valid for junk.
        let v = SERVICE.verify(s);
        assert!(!v.valid || v.payload.is_some());
        SERVICE.revoke(s);
    }
});
