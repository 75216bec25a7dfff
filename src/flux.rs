//! Flux analysis over a user-selected time window, and the append-only
//! `flux_data.csv` codec.
//!
//! A flux row summarizes the CO2 trend (slope, R²) plus per-channel extremes
//! of the measurements inside the selection. Rows are appended one per saved
//! selection and never mutated afterwards.

use std::io;
use std::path::PathBuf;

use chrono::{SecondsFormat, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, TelemetryError};
use crate::measurement::{CalibrationSettings, GeoPosition, Measurement};
use crate::regression::{linear_regression, Point};
use crate::storage::Storage;

/// Fixed flux summary filename inside the storage root.
pub const FLUX_FILE_NAME: &str = "flux_data.csv";

/// Decimal places kept on the scaled slope.
pub const DEFAULT_SLOPE_PRECISION: u32 = 1;

const FLUX_HEADER: [&str; 15] = [
    "Timestamp",
    "Date",
    "Sensor",
    "Longitude",
    "Latitude",
    "CO2 Slope",
    "CO2 R2",
    "CO2 Min",
    "CO2 Max",
    "Temperature Min",
    "Temperature Max",
    "Humidity Min",
    "Humidity Max",
    "CO2 Multiplier",
    "CO2 Offset",
];

/// One saved selection summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FluxRow {
    /// Milliseconds since the Unix epoch at save time.
    pub timestamp: i64,
    /// RFC 3339 rendering of `timestamp`.
    pub date: String,
    pub sensor: String,
    pub longitude: f64,
    pub latitude: f64,
    /// CO2 slope scaled by 1000 (ppm per 1000 time units, so ppm/s for
    /// millisecond timestamps), rounded to the configured precision.
    pub co2_slope: f64,
    pub co2_r_squared: f64,
    pub co2_min: f64,
    pub co2_max: f64,
    pub temp_min: f64,
    pub temp_max: f64,
    pub hum_min: f64,
    pub hum_max: f64,
    pub co2_multiplier: f64,
    pub co2_offset: f64,
}

fn min_max(rows: &[&Measurement], pick: impl Fn(&Measurement) -> Option<f64>) -> (f64, f64) {
    let values: Vec<f64> = rows
        .iter()
        .filter_map(|r| pick(r))
        .filter(|v| v.is_finite())
        .collect();
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    (min, max)
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for v in values {
        sum += v;
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Summarize the buffered measurements inside `window` into one flux row.
///
/// The window is inclusive on both ends and order-insensitive. Fails with
/// [`TelemetryError::InsufficientData`] unless at least two in-window points
/// carry a finite CO2 value; the buffer itself is never touched.
///
/// Coordinates are the mean of the in-window recorded fixes unless both
/// means are exactly zero (no GPS fix while recording), in which case the
/// caller-supplied live position is used instead.
pub fn compute_flux(
    buffer: &[Measurement],
    window: (i64, i64),
    live_position: GeoPosition,
    sensor_name: &str,
    calibration: &CalibrationSettings,
    precision: u32,
) -> Result<FluxRow> {
    let lo = window.0.min(window.1);
    let hi = window.0.max(window.1);
    let selected: Vec<&Measurement> = buffer
        .iter()
        .filter(|m| m.timestamp >= lo && m.timestamp <= hi)
        .collect();

    let points: Vec<Point> = selected
        .iter()
        .filter_map(|m| {
            m.co2.filter(|v| v.is_finite()).map(|y| Point {
                x: m.timestamp as f64,
                y,
            })
        })
        .collect();
    let fit = linear_regression(&points).ok_or(TelemetryError::InsufficientData)?;

    let (co2_min, co2_max) = min_max(&selected, |m| m.co2);
    let (temp_min, temp_max) = min_max(&selected, |m| m.temperature);
    let (hum_min, hum_max) = min_max(&selected, |m| m.humidity);

    let mean_longitude = mean(selected.iter().map(|m| m.longitude.unwrap_or(0.0)));
    let mean_latitude = mean(selected.iter().map(|m| m.latitude.unwrap_or(0.0)));
    let (longitude, latitude) = if mean_longitude != 0.0 || mean_latitude != 0.0 {
        (mean_longitude, mean_latitude)
    } else {
        (live_position.longitude, live_position.latitude)
    };

    let scale = 10f64.powi(precision as i32);
    let now = Utc::now();

    Ok(FluxRow {
        timestamp: now.timestamp_millis(),
        date: now.to_rfc3339_opts(SecondsFormat::Millis, true),
        sensor: sensor_name.to_string(),
        longitude,
        latitude,
        co2_slope: (fit.slope * 1000.0 * scale).round() / scale,
        co2_r_squared: fit.r_squared,
        co2_min,
        co2_max,
        temp_min,
        temp_max,
        hum_min,
        hum_max,
        co2_multiplier: calibration.co2_multiplier,
        co2_offset: calibration.co2_offset,
    })
}

fn format_rows(rows: &[FluxRow], include_header: bool) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    if include_header {
        writer.write_record(FLUX_HEADER)?;
    }
    for row in rows {
        writer.write_record(&[
            row.timestamp.to_string(),
            row.date.clone(),
            row.sensor.clone(),
            row.longitude.to_string(),
            row.latitude.to_string(),
            row.co2_slope.to_string(),
            row.co2_r_squared.to_string(),
            row.co2_min.to_string(),
            row.co2_max.to_string(),
            row.temp_min.to_string(),
            row.temp_max.to_string(),
            row.hum_min.to_string(),
            row.hum_max.to_string(),
            row.co2_multiplier.to_string(),
            row.co2_offset.to_string(),
        ])?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| TelemetryError::Persistence(e.into_error()))?;
    String::from_utf8(bytes).map_err(|e| TelemetryError::Persistence(io::Error::other(e)))
}

/// Append one row to `flux_data.csv`, writing the header only when the file
/// does not exist yet. Returns the written path.
pub async fn save_flux(storage: &dyn Storage, row: &FluxRow) -> Result<PathBuf> {
    let existing = storage.read_to_string(FLUX_FILE_NAME).await?;
    let content = match existing {
        Some(text) if !text.trim().is_empty() => {
            format!(
                "{}\n{}",
                text.trim_end(),
                format_rows(std::slice::from_ref(row), false)?
            )
        }
        _ => format_rows(std::slice::from_ref(row), true)?,
    };
    storage.write_string(FLUX_FILE_NAME, &content).await
}

fn parse_record(record: &csv::StringRecord) -> Option<FluxRow> {
    if record.len() < 15 {
        return None;
    }
    let field = |i: usize| record.get(i).unwrap_or("");
    let number = |i: usize| field(i).parse::<f64>().ok();

    let row = FluxRow {
        timestamp: field(0).parse().ok()?,
        date: field(1).to_string(),
        sensor: field(2).to_string(),
        longitude: number(3)?,
        latitude: number(4)?,
        co2_slope: number(5)?,
        co2_r_squared: number(6)?,
        co2_min: number(7)?,
        co2_max: number(8)?,
        temp_min: number(9)?,
        temp_max: number(10)?,
        hum_min: number(11)?,
        hum_max: number(12)?,
        co2_multiplier: number(13)?,
        co2_offset: number(14)?,
    };

    if !row.latitude.is_finite() || !row.longitude.is_finite() {
        return None;
    }
    Some(row)
}

/// Load every previously saved flux row, in file order.
///
/// A row failing the latitude/longitude finiteness check is discarded with a
/// warning; one corrupt row never aborts loading the rest of the file.
pub async fn load_flux(storage: &dyn Storage) -> Result<Vec<FluxRow>> {
    let Some(raw) = storage.read_to_string(FLUX_FILE_NAME).await? else {
        return Ok(Vec::new());
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(raw.as_bytes());

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                warn!("skipping unreadable flux row: {e}");
                continue;
            }
        };
        match parse_record(&record) {
            Some(row) => rows.push(row),
            None => warn!("discarding malformed flux row"),
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn measurement(timestamp: i64, co2: f64) -> Measurement {
        Measurement {
            co2: Some(co2),
            temperature: Some(22.0 + co2 / 1000.0),
            humidity: Some(40.0),
            latitude: Some(0.0),
            longitude: Some(0.0),
            altitude: Some(0.0),
            ..Measurement::new(timestamp)
        }
    }

    fn line_buffer() -> Vec<Measurement> {
        // co2 = 2*t + 5
        (0..10)
            .map(|i| measurement(i, 2.0 * i as f64 + 5.0))
            .collect()
    }

    #[test]
    fn slope_is_scaled_by_1000() {
        let buffer = line_buffer();
        let row = compute_flux(
            &buffer,
            (0, 9),
            GeoPosition::default(),
            "sensor",
            &CalibrationSettings::default(),
            DEFAULT_SLOPE_PRECISION,
        )
        .unwrap();

        assert_eq!(row.co2_slope, 2000.0);
        assert_eq!(row.co2_r_squared, 1.0);
        assert_eq!(row.co2_min, 5.0);
        assert_eq!(row.co2_max, 23.0);
    }

    #[test]
    fn window_is_inclusive_and_order_insensitive() {
        let buffer = line_buffer();
        let forward = compute_flux(
            &buffer,
            (2, 5),
            GeoPosition::default(),
            "sensor",
            &CalibrationSettings::default(),
            1,
        )
        .unwrap();
        let reversed = compute_flux(
            &buffer,
            (5, 2),
            GeoPosition::default(),
            "sensor",
            &CalibrationSettings::default(),
            1,
        )
        .unwrap();
        assert_eq!(forward.co2_min, reversed.co2_min);
        assert_eq!(forward.co2_min, 2.0 * 2.0 + 5.0);
        assert_eq!(forward.co2_max, 2.0 * 5.0 + 5.0);
    }

    #[test]
    fn insufficient_data_is_an_error() {
        let buffer = line_buffer();
        let result = compute_flux(
            &buffer,
            (100, 200),
            GeoPosition::default(),
            "sensor",
            &CalibrationSettings::default(),
            1,
        );
        assert!(matches!(result, Err(TelemetryError::InsufficientData)));

        // One in-window point is not enough either.
        let result = compute_flux(
            &buffer,
            (3, 3),
            GeoPosition::default(),
            "sensor",
            &CalibrationSettings::default(),
            1,
        );
        assert!(matches!(result, Err(TelemetryError::InsufficientData)));
    }

    #[test]
    fn zero_coordinates_fall_back_to_live_position() {
        let buffer = line_buffer();
        let live = GeoPosition {
            latitude: 44.56,
            longitude: 11.34,
            altitude: 90.0,
        };
        let row = compute_flux(
            &buffer,
            (0, 9),
            live,
            "sensor",
            &CalibrationSettings::default(),
            1,
        )
        .unwrap();
        assert_eq!(row.latitude, 44.56);
        assert_eq!(row.longitude, 11.34);
    }

    #[test]
    fn recorded_coordinates_win_over_live_position() {
        let mut buffer = line_buffer();
        for m in &mut buffer {
            m.latitude = Some(10.0);
            m.longitude = Some(20.0);
        }
        let live = GeoPosition {
            latitude: 44.56,
            longitude: 11.34,
            altitude: 90.0,
        };
        let row = compute_flux(
            &buffer,
            (0, 9),
            live,
            "sensor",
            &CalibrationSettings::default(),
            1,
        )
        .unwrap();
        assert_eq!(row.latitude, 10.0);
        assert_eq!(row.longitude, 20.0);
    }

    fn sample_row(timestamp: i64, slope: f64) -> FluxRow {
        FluxRow {
            timestamp,
            date: "2026-08-07T10:00:00.000Z".to_string(),
            sensor: "garden-sensor".to_string(),
            longitude: 11.34,
            latitude: 44.56,
            co2_slope: slope,
            co2_r_squared: 0.98,
            co2_min: 400.0,
            co2_max: 450.0,
            temp_min: 22.1,
            temp_max: 24.0,
            hum_min: 40.0,
            hum_max: 45.5,
            co2_multiplier: 1.02,
            co2_offset: -3.0,
        }
    }

    #[tokio::test]
    async fn round_trip_preserves_rows_and_order() {
        let storage = MemoryStorage::new();
        let rows: Vec<FluxRow> = (0..5).map(|i| sample_row(1000 + i, i as f64 * 10.5)).collect();
        for row in &rows {
            save_flux(&storage, row).await.unwrap();
        }

        let content = storage.get(FLUX_FILE_NAME).unwrap();
        // Header once, then one line per row.
        assert_eq!(content.lines().count(), rows.len() + 1);
        assert!(content.starts_with("Timestamp,Date,Sensor"));

        let loaded = load_flux(&storage).await.unwrap();
        assert_eq!(loaded, rows);
    }

    #[tokio::test]
    async fn corrupt_rows_are_discarded_not_fatal() {
        let storage = MemoryStorage::new();
        save_flux(&storage, &sample_row(1, 5.0)).await.unwrap();

        let mut content = storage.get(FLUX_FILE_NAME).unwrap();
        content.push_str("2,oops,x,NaN,NaN,,,,,,,,,,\n");
        content.push_str("3,short,row\n");
        storage.write_string(FLUX_FILE_NAME, &content).await.unwrap();
        save_flux(&storage, &sample_row(4, 7.5)).await.unwrap();

        let loaded = load_flux(&storage).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].timestamp, 1);
        assert_eq!(loaded[1].timestamp, 4);
    }

    #[tokio::test]
    async fn loading_without_a_file_yields_no_rows() {
        let storage = MemoryStorage::new();
        assert!(load_flux(&storage).await.unwrap().is_empty());
    }
}
