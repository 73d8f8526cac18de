//! Fuzz target for stream chunking.
//!
//! Chunks must concatenate back to the input and stay within the size
//! limit unless a single character is wider than it.

#![no_main]

use commune_server::pipeline::split_chunks;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|input: (u8, &str)| {
    let (size, text) = input;
    let size = usize::from(size).max(1);
    let chunks = split_chunks(text, size);
    assert_eq!(chunks.concat(), text);
    for chunk in &chunks {
        assert!(chunk.len() <= size || chunk.chars().count() == 1);
    }
});
