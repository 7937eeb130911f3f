//! Fuzz datagram framing: header parse, appended-ack strip, zerocode
//! expansion. Decode must never panic on arbitrary bytes, and anything
//! that decodes must re-encode to something that decodes identically.

#![no_main]

use libfuzzer_sys::fuzz_target;
use metaverse_proto::Packet;

fuzz_target!(|data: &[u8]| {
    if let Ok(packet) = Packet::decode(data) {
        let wire = packet.encode().expect("decoded packet re-encodes");
        let again = Packet::decode(&wire).expect("re-encoded packet decodes");
        assert_eq!(again.sequence, packet.sequence);
        assert_eq!(again.body, packet.body);
        assert_eq!(again.acks, packet.acks);
    }
});
