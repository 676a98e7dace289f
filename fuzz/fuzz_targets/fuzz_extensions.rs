#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use shiguredo_http_proto::extensions::{NegotiationPolicy, negotiate_compression_with};

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    want: bool,
    compression: u8,
    inflation: u8,
    reject_mixed_compressor: bool,
    offer: String,
}

fn valid_window(bits: u8) -> bool {
    bits == 0 || (8..=15).contains(&bits)
}

fuzz_target!(|input: FuzzInput| {
    // 希望値は 0 または 8..=15 に揃える
    let compression = if input.compression % 9 == 0 { 0 } else { 7 + input.compression % 9 };
    let inflation = if input.inflation % 9 == 0 { 0 } else { 7 + input.inflation % 9 };
    let policy = NegotiationPolicy {
        reject_mixed_compressor: input.reject_mixed_compressor,
    };

    let result =
        negotiate_compression_with(&policy, input.want, compression, inflation, &input.offer);
    assert!(valid_window(result.compression_window_bits));
    assert!(valid_window(result.inflation_window_bits));
    assert_eq!(result.enabled, !result.response.is_empty());
    if !input.want {
        assert!(!result.enabled);
    }
});
