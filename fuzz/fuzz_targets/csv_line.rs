#![no_main]

use libfuzzer_sys::fuzz_target;
use sibscope::ingest::split_csv_line;
use sibscope::sibling::parent_prefix;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // Splitting and prefix extraction must never panic on trace input
        let fields = split_csv_line(input);
        for field in &fields {
            if let Ok(prefix) = parent_prefix(field, 0) {
                assert!(prefix.len() < field.len());
            }
        }
    }
});
