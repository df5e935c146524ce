//! Fuzz target for multiaddress parsing
//!
//! Whatever decodes must re-encode to an address that decodes the same.

#![no_main]

use ferry_transport::Multiaddr;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(addr) = Multiaddr::from_bytes(data) {
        let again = Multiaddr::from_bytes(&addr.to_bytes()).expect("re-encoded address decodes");
        assert_eq!(again, addr);
    }

    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(addr) = text.parse::<Multiaddr>() {
            let _ = addr.to_bytes();
            let _ = addr.without_peer_id();
            let _ = addr.tcp_target();
        }
    }
});
