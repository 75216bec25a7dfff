//! Wire protocol codec for the sensor's line-based ASCII protocol.
//!
//! Each frame is one newline-terminated line of the form `EVENT_TYPE[ PAYLOAD]`.
//! `DATA` and `SETTINGS` payloads are `key=value` lists separated by `;`.
//! Decoding is tolerant: a malformed token is skipped on its own, and an
//! unknown event type is reported without aborting the stream.

use log::{debug, warn};

use crate::measurement::{CalibrationSettings, Measurement};

/// A decoded line from the device. Produced only by [`parse_line`]; consumed
/// exhaustively at every routing site so a new event type cannot be silently
/// dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// `WHOIS` reply: free-text device identity.
    Identify { payload: String },
    /// `DATA`: one sample as a `key=value` list.
    Data { payload: String },
    /// `ACQUISITION_STATE`: device-side sampling toggled on or off.
    AcquisitionState { on: bool },
    /// `ERROR`: free-text device error report.
    Error { payload: String },
    /// `SETTINGS`: calibration values confirmed by the device.
    Settings { payload: String },
    /// `HW_CALIBRATION_REF`: hardware calibration reference value.
    HardwareCalibrationRef { payload: String },
}

/// Commands sent to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    StartAcquisition,
    StopAcquisition,
    GetAcquisitionState,
    Whois,
    Disconnect,
    GetSettings,
    SetSettings,
    GetHardwareCalibrationRef,
}

impl Command {
    /// Wire token for this command.
    pub fn token(self) -> &'static str {
        match self {
            Command::StartAcquisition => "START_ACQUISITION",
            Command::StopAcquisition => "STOP_ACQUISITION",
            Command::GetAcquisitionState => "GET_ACQUISITION_STATE",
            Command::Whois => "WHOIS",
            Command::Disconnect => "DISCONNECT",
            Command::GetSettings => "GET_SETTINGS",
            Command::SetSettings => "SET_SETTINGS",
            Command::GetHardwareCalibrationRef => "GET_HW_CALIBRATION_REF",
        }
    }
}

/// Parse one newline-stripped line into a typed event.
///
/// Returns `None` for blank lines and for unknown leading tokens; the latter
/// are reported but never fatal.
pub fn parse_line(line: &str) -> Option<ProtocolEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let (token, payload) = match trimmed.split_once(' ') {
        Some((token, payload)) => (token, payload),
        None => (trimmed, ""),
    };

    match token {
        "WHOIS" => Some(ProtocolEvent::Identify {
            payload: payload.to_string(),
        }),
        "DATA" => Some(ProtocolEvent::Data {
            payload: payload.to_string(),
        }),
        "ACQUISITION_STATE" => Some(ProtocolEvent::AcquisitionState {
            on: payload.trim() == "1",
        }),
        "ERROR" => Some(ProtocolEvent::Error {
            payload: payload.to_string(),
        }),
        "SETTINGS" => Some(ProtocolEvent::Settings {
            payload: payload.to_string(),
        }),
        "HW_CALIBRATION_REF" => Some(ProtocolEvent::HardwareCalibrationRef {
            payload: payload.to_string(),
        }),
        other => {
            warn!("unknown event type received: {other}");
            None
        }
    }
}

/// Decode a `DATA` payload (`CO2=400;TMP=24.5;HUM=40`) into a raw sample.
///
/// Keys are optional and may appear in any order; unknown keys are ignored.
/// A token missing its `=` or carrying a non-numeric value is skipped without
/// invalidating the rest of the line.
pub fn parse_data_payload(payload: &str, timestamp_ms: i64) -> Measurement {
    let mut measurement = Measurement::new(timestamp_ms);

    for token in payload.split(';') {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        let Ok(number) = value.trim().parse::<f64>() else {
            debug!("skipping non-numeric data token: {token}");
            continue;
        };
        match key.trim() {
            "CO2" => measurement.co2 = Some(number),
            "TMP" => measurement.temperature = Some(number),
            "HUM" => measurement.humidity = Some(number),
            _ => {}
        }
    }

    measurement
}

/// Decode a `SETTINGS` payload (`multiplier=1.02;offset=-3`).
///
/// Missing keys fall back to the identity correction. The `applied` flag is
/// left for the caller: only the session layer knows whether this came from
/// the device.
pub fn parse_settings_payload(payload: &str) -> CalibrationSettings {
    let mut settings = CalibrationSettings::default();

    for token in payload.split(';') {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        let Ok(number) = value.trim().parse::<f64>() else {
            debug!("skipping non-numeric settings token: {token}");
            continue;
        };
        match key.trim() {
            "multiplier" => settings.co2_multiplier = number,
            "offset" => settings.co2_offset = number,
            _ => {}
        }
    }

    settings
}

/// Encode a command with an optional payload, newline-terminated.
pub fn encode_command(command: Command, payload: Option<&str>) -> String {
    let mut line = encode_command_raw(command, payload);
    line.push('\n');
    line
}

/// Encode a command without the trailing newline (raw passthrough).
pub fn encode_command_raw(command: Command, payload: Option<&str>) -> String {
    match payload {
        Some(p) if !p.is_empty() => format!("{} {}", command.token(), p),
        _ => command.token().to_string(),
    }
}

/// Render a sample's reported channels back into a `DATA` payload.
/// The inverse of [`parse_data_payload`] for the key set present.
pub fn format_data_payload(measurement: &Measurement) -> String {
    let mut parts = Vec::with_capacity(3);
    if let Some(v) = measurement.co2 {
        parts.push(format!("CO2={v}"));
    }
    if let Some(v) = measurement.temperature {
        parts.push(format!("TMP={v}"));
    }
    if let Some(v) = measurement.humidity {
        parts.push(format!("HUM={v}"));
    }
    parts.join(";")
}
