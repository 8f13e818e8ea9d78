//! Fuzz target for the client-facing dialect decoders.
//!
//! Run with: cargo +nightly fuzz run fuzz_dialect_decode
//!
//! Request bodies are untrusted client input (spec §4.1); this exercises
//! both `DialectCodec::decode` implementations with arbitrary bytes to find
//! panics or hangs in the JSON-to-canonical decode path. The first byte of
//! the corpus input selects which dialect gets the rest of the bytes so a
//! single corpus covers both codecs.

#![no_main]

use chatgate_core::ports::DialectCodec;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }
    let (selector, body) = data.split_at(1);
    if selector[0] % 2 == 0 {
        let _ = chatgate_dialect_openai::OpenAiDialect.decode(body);
    } else {
        let _ = chatgate_dialect_anthropic::AnthropicDialect.decode(body);
    }
});
