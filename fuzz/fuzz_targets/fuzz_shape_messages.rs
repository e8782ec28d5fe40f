//! Fuzz target for shape log body parsing.
//!
//! Arbitrary bodies must produce an error or a message list, never a panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use sync_collection::stream::parse_messages;
use sync_collection::Offset;

fuzz_target!(|data: &[u8]| {
    let Ok(body) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(messages) = parse_messages(body, Offset::new(1, 0)) {
        for message in &messages {
            let _ = message.as_change();
        }
    }
});
