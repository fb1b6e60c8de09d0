#![no_main]
use libfuzzer_sys::fuzz_target;
use gosh_bt::torrent::PeerMessage;

fuzz_target!(|data: &[u8]| {
    // parse() should never panic on arbitrary frames
    if let Ok(msg) = PeerMessage::parse(data) {
        // Anything that parses must encode back to the same frame
        let encoded = msg.encode();
        assert_eq!(&encoded[4..], data);
    }
});
