//! Property-based tests for speed validation.
//!
//! Verifies:
//! - Values inside [0.1, 16] are accepted unchanged
//! - Values outside are rejected, never clamped
//! - JSON payloads only accept numbers
//! - `Speed::clamped` always lands inside the range
//! - Popup text parsing accepts an optional `x` suffix

use proptest::prelude::*;
use serde_json::json;

use playrate_core::error::SpeedError;
use playrate_core::speed::{MAX_SPEED, MIN_SPEED, Speed};
use playrate_core::speed_input::parse_speed_text;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    #[test]
    fn prop_in_range_accepted(value in MIN_SPEED..=MAX_SPEED) {
        let speed = Speed::new(value).unwrap();
        prop_assert_eq!(speed.get(), value);
    }

    #[test]
    fn prop_above_range_rejected(value in (MAX_SPEED + 1e-9)..1e9) {
        prop_assert_eq!(Speed::new(value), Err(SpeedError::OutOfRange(value)));
    }

    #[test]
    fn prop_below_range_rejected(value in -1e9..MIN_SPEED) {
        prop_assert!(Speed::new(value).is_err());
    }

    #[test]
    fn prop_clamped_in_range(value in any::<f64>()) {
        let speed = Speed::clamped(value).get();
        prop_assert!((MIN_SPEED..=MAX_SPEED).contains(&speed));
    }

    /// JSON numbers validate like raw floats.
    #[test]
    fn prop_json_numbers_match_new(value in -100.0f64..100.0) {
        prop_assert_eq!(Speed::from_json(&json!(value)), Speed::new(value));
    }

    /// Numeric strings are never coerced.
    #[test]
    fn prop_json_strings_rejected(value in MIN_SPEED..=MAX_SPEED) {
        prop_assert_eq!(
            Speed::from_json(&json!(value.to_string())),
            Err(SpeedError::NotANumber)
        );
    }

    /// `1.5` and `1.5x` parse to the same speed.
    #[test]
    fn prop_suffix_optional(hundredths in 10u32..=1600) {
        let value = f64::from(hundredths) / 100.0;
        let plain = parse_speed_text(&format!("{value}")).unwrap();
        let suffixed = parse_speed_text(&format!("{value}x")).unwrap();
        prop_assert_eq!(plain, suffixed);
        prop_assert_eq!(plain.get(), value);
    }
}
