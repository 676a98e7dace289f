//! Sec-WebSocket-Extensions ネゴシエーションのプロパティテスト

use pbt::{extension_offer, wanted_window_bits};
use proptest::prelude::*;
use shiguredo_http_proto::negotiate_compression;

fn valid_window(bits: u8) -> bool {
    bits == 0 || (8..=15).contains(&bits)
}

proptest! {
    #[test]
    fn negotiated_window_bits_are_valid(
        offer in extension_offer(),
        compression in wanted_window_bits(),
        inflation in wanted_window_bits(),
    ) {
        let result = negotiate_compression(true, compression, inflation, &offer);
        prop_assert!(valid_window(result.compression_window_bits));
        prop_assert!(valid_window(result.inflation_window_bits));
        prop_assert_eq!(result.enabled, !result.response.is_empty());
    }

    #[test]
    fn negotiation_never_widens_windows(
        offer in extension_offer(),
        compression in 9u8..=15,
        inflation in 8u8..=15,
    ) {
        let result = negotiate_compression(true, compression, inflation, &offer);
        if result.enabled {
            prop_assert!(result.compression_window_bits <= compression);
            prop_assert!(result.inflation_window_bits <= inflation);
        }
    }

    #[test]
    fn negotiation_is_deterministic(
        offer in extension_offer(),
        compression in wanted_window_bits(),
        inflation in wanted_window_bits(),
    ) {
        let first = negotiate_compression(true, compression, inflation, &offer);
        let second = negotiate_compression(true, compression, inflation, &offer);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn not_wanted_is_disabled(
        offer in extension_offer(),
        compression in wanted_window_bits(),
        inflation in wanted_window_bits(),
    ) {
        let result = negotiate_compression(false, compression, inflation, &offer);
        prop_assert!(!result.enabled);
        prop_assert!(result.response.is_empty());
    }

    #[test]
    fn arbitrary_offer_never_panics(offer in ".{0,64}") {
        let result = negotiate_compression(true, 15, 15, &offer);
        prop_assert!(valid_window(result.compression_window_bits));
    }
}
