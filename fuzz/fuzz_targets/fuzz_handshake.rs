#![no_main]
use libfuzzer_sys::fuzz_target;
use gosh_bt::torrent::Handshake;

fuzz_target!(|data: &[u8]| {
    if let Ok(buf) = <&[u8; 68]>::try_from(data) {
        let _ = Handshake::parse(buf);
    }
});
