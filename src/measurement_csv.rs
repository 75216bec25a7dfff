//! CSV export of measurement sessions.
//!
//! File layout: a `Metadata,Value` block (sensor, session bounds, per-channel
//! stats), a blank separator line, the fixed column header, then one row per
//! sample. Files are never overwritten: the filename index is incremented
//! until an unused `<YYYY-MM-DD>-<sensor>-<n>.csv` name is found.

use std::path::PathBuf;

use chrono::{SecondsFormat, TimeZone, Utc};
use log::info;

use crate::errors::Result;
use crate::measurement::Measurement;
use crate::storage::Storage;

const CSV_HEADER: &str = "Timestamp,Date,CO2 (ppm),Temperature (C),Humidity (%)";

struct ChannelStats {
    avg: Option<f64>,
    min: Option<f64>,
    max: Option<f64>,
}

fn channel_stats(
    rows: &[Measurement],
    pick: impl Fn(&Measurement) -> Option<f64>,
) -> ChannelStats {
    let values: Vec<f64> = rows
        .iter()
        .filter_map(&pick)
        .filter(|v| v.is_finite())
        .collect();
    if values.is_empty() {
        return ChannelStats {
            avg: None,
            min: None,
            max: None,
        };
    }
    let sum: f64 = values.iter().sum();
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    ChannelStats {
        avg: Some(sum / values.len() as f64),
        min: Some(min),
        max: Some(max),
    }
}

/// Stat cell: two decimals with trailing zeros dropped, empty when the
/// channel never reported.
fn format_stat(value: Option<f64>) -> String {
    match value {
        Some(v) if v.is_finite() => {
            let rounded = (v * 100.0).round() / 100.0;
            format!("{rounded}")
        }
        _ => String::new(),
    }
}

fn optional_field(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn iso_utc(timestamp_ms: i64) -> String {
    Utc.timestamp_millis_opt(timestamp_ms)
        .single()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

fn date_part(timestamp_ms: i64) -> String {
    Utc.timestamp_millis_opt(timestamp_ms)
        .single()
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "1970-01-01".to_string())
}

/// Filename-safe sensor fragment: lowercased, whitespace collapsed to `-`,
/// anything outside `[a-z0-9-_]` dropped, `"sensor"` when nothing survives.
pub fn sanitize_file_part(value: &str) -> String {
    let lowered = value.trim().to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    for ch in lowered.chars() {
        if ch.is_whitespace() || ch == '-' {
            if !out.ends_with('-') {
                out.push('-');
            }
        } else if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_' {
            out.push(ch);
        }
    }
    let trimmed = out.trim_matches(|c| c == '-' || c == '_');
    if trimmed.is_empty() {
        "sensor".to_string()
    } else {
        trimmed.to_string()
    }
}

fn build_csv_content(rows: &[Measurement], sensor_name: &str) -> String {
    let start_ts = rows.first().map(|r| r.timestamp).unwrap_or_default();
    let end_ts = rows.last().map(|r| r.timestamp).unwrap_or_default();
    let co2 = channel_stats(rows, |r| r.co2);
    let temperature = channel_stats(rows, |r| r.temperature);
    let humidity = channel_stats(rows, |r| r.humidity);

    let mut lines = vec![
        "Metadata,Value".to_string(),
        format!("Sensor,{sensor_name}"),
        format!("Session Start,{}", iso_utc(start_ts)),
        format!("Session End,{}", iso_utc(end_ts)),
        format!("Samples,{}", rows.len()),
        format!("Avg CO2 (ppm),{}", format_stat(co2.avg)),
        format!("Min CO2 (ppm),{}", format_stat(co2.min)),
        format!("Max CO2 (ppm),{}", format_stat(co2.max)),
        format!("Avg Temperature (C),{}", format_stat(temperature.avg)),
        format!("Min Temperature (C),{}", format_stat(temperature.min)),
        format!("Max Temperature (C),{}", format_stat(temperature.max)),
        format!("Avg Humidity (%),{}", format_stat(humidity.avg)),
        format!("Min Humidity (%),{}", format_stat(humidity.min)),
        format!("Max Humidity (%),{}", format_stat(humidity.max)),
        String::new(),
        CSV_HEADER.to_string(),
    ];

    for row in rows {
        lines.push(format!(
            "{},{},{},{},{}",
            row.timestamp,
            iso_utc(row.timestamp),
            optional_field(row.co2),
            optional_field(row.temperature),
            optional_field(row.humidity),
        ));
    }

    lines.join("\n")
}

async fn next_free_name(
    storage: &dyn Storage,
    date_part: &str,
    sensor_part: &str,
) -> Result<String> {
    let mut index = 1u32;
    loop {
        let name = format!("{date_part}-{sensor_part}-{index}.csv");
        if !storage.exists(&name).await? {
            return Ok(name);
        }
        index += 1;
    }
}

/// Persist a detached session snapshot.
///
/// Returns the written path, or `None` for an empty snapshot.
pub async fn save_measurements(
    storage: &dyn Storage,
    rows: &[Measurement],
    sensor_name: &str,
) -> Result<Option<PathBuf>> {
    if rows.is_empty() {
        return Ok(None);
    }

    let date = date_part(rows[0].timestamp);
    let sensor = sanitize_file_part(sensor_name);
    let name = next_free_name(storage, &date, &sensor).await?;
    let content = build_csv_content(rows, sensor_name);
    let path = storage.write_string(&name, &content).await?;
    info!("saved {} measurements to {}", rows.len(), path.display());
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn sample(timestamp: i64, co2: f64) -> Measurement {
        Measurement {
            co2: Some(co2),
            temperature: Some(24.5),
            humidity: Some(40.0),
            ..Measurement::new(timestamp)
        }
    }

    #[test]
    fn sanitizes_sensor_names() {
        assert_eq!(sanitize_file_part("Garden Sensor MK2"), "garden-sensor-mk2");
        assert_eq!(sanitize_file_part("  spaced   out  "), "spaced-out");
        assert_eq!(sanitize_file_part("??!"), "sensor");
        assert_eq!(sanitize_file_part("-_leading_-"), "leading");
        assert_eq!(sanitize_file_part("snake_case"), "snake_case");
    }

    #[test]
    fn content_has_metadata_block_and_body() {
        let rows = vec![sample(0, 400.0), sample(1000, 410.0), sample(2000, 420.0)];
        let content = build_csv_content(&rows, "sensor");
        let lines: Vec<&str> = content.lines().collect();

        assert_eq!(lines[0], "Metadata,Value");
        assert_eq!(lines[1], "Sensor,sensor");
        assert_eq!(lines[4], "Samples,3");
        assert_eq!(lines[5], "Avg CO2 (ppm),410");

        let header_at = lines.iter().position(|l| *l == CSV_HEADER).unwrap();
        assert_eq!(lines[header_at - 1], "");
        assert_eq!(lines.len() - header_at - 1, 3);
        assert!(lines[header_at + 1].starts_with("0,1970-01-01T00:00:00.000Z,400"));
    }

    #[test]
    fn absent_channels_leave_empty_cells() {
        let mut row = Measurement::new(5000);
        row.co2 = Some(402.0);
        let content = build_csv_content(std::slice::from_ref(&row), "s");
        let body = content.lines().last().unwrap();
        assert_eq!(body, "5000,1970-01-01T00:00:05.000Z,402,,");
    }

    #[tokio::test]
    async fn empty_snapshot_writes_nothing() {
        let storage = MemoryStorage::new();
        let path = save_measurements(&storage, &[], "sensor").await.unwrap();
        assert!(path.is_none());
        assert!(storage.file_names().is_empty());
    }

    #[tokio::test]
    async fn filename_index_increments_to_avoid_overwrite() {
        let storage = MemoryStorage::new();
        let rows = vec![sample(0, 400.0)];

        let first = save_measurements(&storage, &rows, "My Sensor")
            .await
            .unwrap()
            .unwrap();
        let second = save_measurements(&storage, &rows, "My Sensor")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(first, PathBuf::from("1970-01-01-my-sensor-1.csv"));
        assert_eq!(second, PathBuf::from("1970-01-01-my-sensor-2.csv"));
        assert_eq!(storage.file_names().len(), 2);
    }
}
