#![no_main]
use libfuzzer_sys::fuzz_target;
use core_rotation::pool::{parse_destination, DestinationSet};

fuzz_target!(|text: &str| {
    let set = DestinationSet::parse_list(text);
    // Accepted entries are never IPv4-mapped.
    for addr in set.iter() {
        assert!(addr.to_ipv4_mapped().is_none());
    }
    assert!(set.len() <= text.lines().count());
    for line in text.lines() {
        let _ = parse_destination(line);
    }
});
