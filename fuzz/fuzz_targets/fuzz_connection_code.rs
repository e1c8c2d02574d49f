#![no_main]

use libfuzzer_sys::fuzz_target;

use fleetlink::fleet::ConnectionCode;

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(code) = ConnectionCode::parse(raw) {
        assert_eq!(code.as_str().len(), 6);
        assert!(code.as_str().bytes().all(|b| b.is_ascii_digit()));
        assert_eq!(ConnectionCode::parse(code.as_str()).ok(), Some(code));
    }
});
