//! Fuzz the LLSD-XML parser: arbitrary text must never panic, and any
//! value that parses must survive a serialize/parse round trip.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else { return };
    if let Ok(value) = metaverse_llsd::from_xml(text) {
        let xml = metaverse_llsd::to_xml(&value);
        let again = metaverse_llsd::from_xml(&xml).expect("serialized llsd re-parses");
        assert_eq!(again, value);
    }
});
