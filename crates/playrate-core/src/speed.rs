//! Playback speed values.
//!
//! A [`Speed`] is always inside `[MIN_SPEED, MAX_SPEED]`. Message handlers
//! reject anything else; [`Speed::clamped`] exists only for UI controls that
//! want to snap a slider value into range.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SpeedError;

pub const MIN_SPEED: f64 = 0.1;
pub const MAX_SPEED: f64 = 16.0;
pub const DEFAULT_SPEED: f64 = 1.0;

/// Two rates closer than this are treated as equal when re-asserting speed.
pub const RATE_TOLERANCE: f64 = 0.01;

/// A validated playback rate.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Speed(f64);

impl Speed {
    pub const DEFAULT: Self = Self(DEFAULT_SPEED);

    /// Validate a raw rate.
    pub fn new(value: f64) -> Result<Self, SpeedError> {
        if value.is_nan() {
            return Err(SpeedError::NotANumber);
        }
        if !(MIN_SPEED..=MAX_SPEED).contains(&value) {
            return Err(SpeedError::OutOfRange(value));
        }
        Ok(Self(value))
    }

    /// Validate a speed taken from a JSON message payload.
    ///
    /// Only JSON numbers are accepted; numeric strings, booleans and nulls are
    /// rejected rather than coerced.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, SpeedError> {
        value
            .as_f64()
            .ok_or(SpeedError::NotANumber)
            .and_then(Self::new)
    }

    /// Snap an arbitrary value into range. NaN maps to the default speed.
    #[must_use]
    pub fn clamped(value: f64) -> Self {
        if value.is_nan() {
            return Self::DEFAULT;
        }
        Self(value.clamp(MIN_SPEED, MAX_SPEED))
    }

    #[must_use]
    pub fn get(self) -> f64 {
        self.0
    }

    #[must_use]
    pub fn is_default(self) -> bool {
        self.matches_rate(DEFAULT_SPEED)
    }

    /// Whether a live element rate is already at this speed.
    #[must_use]
    pub fn matches_rate(self, rate: f64) -> bool {
        (self.0 - rate).abs() <= RATE_TOLERANCE
    }
}

impl Default for Speed {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<f64> for Speed {
    type Error = SpeedError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Speed> for f64 {
    fn from(speed: Speed) -> Self {
        speed.0
    }
}

impl fmt::Display for Speed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bounds_are_inclusive() {
        assert!(Speed::new(0.1).is_ok());
        assert!(Speed::new(16.0).is_ok());
        assert!(Speed::new(0.09).is_err());
        assert!(Speed::new(16.01).is_err());
    }

    #[test]
    fn nan_is_not_a_number() {
        assert_eq!(Speed::new(f64::NAN), Err(SpeedError::NotANumber));
    }

    #[test]
    fn json_requires_a_number() {
        assert_eq!(Speed::from_json(&json!(2.5)).unwrap().get(), 2.5);
        assert_eq!(Speed::from_json(&json!(3)).unwrap().get(), 3.0);
        assert_eq!(Speed::from_json(&json!("2.0")), Err(SpeedError::NotANumber));
        assert_eq!(Speed::from_json(&json!(null)), Err(SpeedError::NotANumber));
        assert_eq!(Speed::from_json(&json!(true)), Err(SpeedError::NotANumber));
        assert_eq!(
            Speed::from_json(&json!(20)),
            Err(SpeedError::OutOfRange(20.0))
        );
    }

    #[test]
    fn clamped_snaps_into_range() {
        assert_eq!(Speed::clamped(40.0).get(), MAX_SPEED);
        assert_eq!(Speed::clamped(0.0).get(), MIN_SPEED);
        assert_eq!(Speed::clamped(f64::NAN), Speed::DEFAULT);
    }

    #[test]
    fn deserialize_rejects_out_of_range() {
        assert!(serde_json::from_str::<Speed>("1.25").is_ok());
        assert!(serde_json::from_str::<Speed>("0").is_err());
    }

    #[test]
    fn rate_tolerance() {
        let speed = Speed::new(2.0).unwrap();
        assert!(speed.matches_rate(2.005));
        assert!(!speed.matches_rate(2.05));
        assert!(Speed::DEFAULT.is_default());
        assert_eq!(speed.to_string(), "2x");
    }
}
