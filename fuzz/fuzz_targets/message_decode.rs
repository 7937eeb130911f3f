//! Fuzz the template-driven body codec: arbitrary bytes must either fail
//! cleanly or round-trip through encode.

#![no_main]

use libfuzzer_sys::fuzz_target;
use metaverse_proto::{Message, MessageTemplate};

fuzz_target!(|data: &[u8]| {
    let template = MessageTemplate::shared();
    if let Ok(message) = Message::decode(template, data) {
        let body = message.encode().expect("decoded message re-encodes");
        let again = Message::decode(template, &body).expect("re-encoded body decodes");
        assert_eq!(again, message);
    }
});
