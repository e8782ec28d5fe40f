//! Fuzz target for shape log offset parsing and comparison.
//!
//! Parsing must never panic, anything that parses must print back to
//! something that parses to the same offset, and comparison must be
//! antisymmetric.

#![no_main]

use libfuzzer_sys::fuzz_target;
use sync_collection::cursor::compare_offsets;
use sync_collection::Offset;

fuzz_target!(|data: (&str, &str)| {
    let (a, b) = data;

    if let Ok(offset) = a.parse::<Offset>() {
        let printed = offset.to_string();
        assert_eq!(printed.parse::<Offset>().ok(), Some(offset));
    }

    let ab = compare_offsets(a, b);
    let ba = compare_offsets(b, a);
    assert_eq!(ab, ba.reverse());
});
