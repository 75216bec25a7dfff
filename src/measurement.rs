//! Data model shared across the session engine.

use serde::{Deserialize, Serialize};

/// A single geotagged sensor sample.
///
/// Only the timestamp is guaranteed to be present. An absent channel means
/// the device did not report it in this sample, not zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Milliseconds since the Unix epoch, stamped at ingestion.
    pub timestamp: i64,
    /// CO2 concentration in ppm, calibration already applied.
    pub co2: Option<f64>,
    /// Temperature in degrees Celsius.
    pub temperature: Option<f64>,
    /// Relative humidity in percent.
    pub humidity: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
}

impl Measurement {
    /// An empty sample carrying only its ingestion timestamp.
    pub fn new(timestamp: i64) -> Self {
        Self {
            timestamp,
            co2: None,
            temperature: None,
            humidity: None,
            latitude: None,
            longitude: None,
            altitude: None,
        }
    }
}

/// Linear CO2 correction. The device is the source of truth: local edits are
/// advisory until a `SETTINGS` event round-trips back and flips `applied`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSettings {
    pub co2_multiplier: f64,
    pub co2_offset: f64,
    /// Raw hardware reference value reported by the device, if any.
    pub hardware_calibration_reference: Option<i64>,
    /// True once the device confirmed these values via a `SETTINGS` event.
    pub applied: bool,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            co2_multiplier: 1.0,
            co2_offset: 0.0,
            hardware_calibration_reference: None,
            applied: false,
        }
    }
}

impl CalibrationSettings {
    /// Corrected CO2 value for a raw device reading.
    pub fn apply(&self, raw: f64) -> f64 {
        raw * self.co2_multiplier + self.co2_offset
    }
}

/// A GPS fix. All-zero coordinates mean "no fix available".
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GeoPosition {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calibration_applies_linear_correction() {
        let calibration = CalibrationSettings {
            co2_multiplier: 1.02,
            co2_offset: -3.0,
            ..Default::default()
        };
        assert!((calibration.apply(400.0) - 405.0).abs() < 1e-9);
    }

    #[test]
    fn default_calibration_is_identity() {
        let calibration = CalibrationSettings::default();
        assert_eq!(calibration.apply(412.5), 412.5);
        assert!(!calibration.applied);
    }
}
