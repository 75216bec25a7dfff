//! Acquisition session management.
//!
//! Converts decoded protocol events into buffered measurements and manages
//! the acquisition on/off session boundaries, including the CSV flush at the
//! end of a session and the backup flush after an abrupt disconnect.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};

use crate::measurement::{CalibrationSettings, Measurement};
use crate::measurement_csv;
use crate::position::PositionSource;
use crate::protocol::{self, ProtocolEvent};
use crate::storage::Storage;

/// Sensor name used until the device identifies itself.
pub const DEFAULT_SENSOR_NAME: &str = "sensor";

/// Owns the measurement buffers for the lifetime of one connection.
///
/// The full buffer is append-only and never truncated automatically; the
/// current-acquisition buffer holds only measurements received while
/// acquisition is on and resets at every session boundary. Snapshots handed
/// to the persistence path are detached copies, never aliases.
pub struct AcquisitionManager {
    storage: Arc<dyn Storage>,
    position: Arc<dyn PositionSource>,
    buffer: Vec<Measurement>,
    current_session: Vec<Measurement>,
    acquiring: bool,
    start_time: Option<i64>,
    sensor_name: String,
    calibration: CalibrationSettings,
    save_in_flight: bool,
}

impl AcquisitionManager {
    pub fn new(storage: Arc<dyn Storage>, position: Arc<dyn PositionSource>) -> Self {
        Self {
            storage,
            position,
            buffer: Vec::new(),
            current_session: Vec::new(),
            acquiring: false,
            start_time: None,
            sensor_name: DEFAULT_SENSOR_NAME.to_string(),
            calibration: CalibrationSettings::default(),
            save_in_flight: false,
        }
    }

    /// Every measurement received over this connection, in arrival order.
    pub fn buffer(&self) -> &[Measurement] {
        &self.buffer
    }

    /// Measurements received since acquisition last turned on.
    pub fn current_session(&self) -> &[Measurement] {
        &self.current_session
    }

    pub fn is_acquiring(&self) -> bool {
        self.acquiring
    }

    /// Epoch-millisecond start of the running acquisition, if any.
    pub fn start_time(&self) -> Option<i64> {
        self.start_time
    }

    pub fn sensor_name(&self) -> &str {
        &self.sensor_name
    }

    pub fn calibration(&self) -> &CalibrationSettings {
        &self.calibration
    }

    /// Local advisory calibration edit. The device stays authoritative:
    /// `applied` goes false until a `SETTINGS` event round-trips back.
    pub fn set_calibration(&mut self, multiplier: f64, offset: f64) {
        self.calibration.co2_multiplier = multiplier;
        self.calibration.co2_offset = offset;
        self.calibration.applied = false;
    }

    /// Replace the sensor name; blank or whitespace-only names are ignored.
    pub fn set_sensor_name(&mut self, name: &str) {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return;
        }
        self.sensor_name = trimmed.to_string();
    }

    /// Route one decoded event. Returns the path of any CSV written as a
    /// side effect (an acquisition session ending).
    pub async fn handle_event(&mut self, event: ProtocolEvent) -> Option<PathBuf> {
        match event {
            ProtocolEvent::Data { payload } => {
                self.ingest_data(&payload);
                None
            }
            ProtocolEvent::AcquisitionState { on } => {
                let snapshot = self.apply_acquisition_state(on);
                self.flush_rows(snapshot).await
            }
            ProtocolEvent::Identify { payload } => {
                info!("device identified: {payload}");
                self.set_sensor_name(&payload);
                None
            }
            ProtocolEvent::Error { payload } => {
                error!("device reported error: {payload}");
                None
            }
            ProtocolEvent::Settings { payload } => {
                let parsed = protocol::parse_settings_payload(&payload);
                self.calibration.co2_multiplier = parsed.co2_multiplier;
                self.calibration.co2_offset = parsed.co2_offset;
                self.calibration.applied = true;
                debug!(
                    "calibration confirmed: multiplier={}, offset={}",
                    parsed.co2_multiplier, parsed.co2_offset
                );
                None
            }
            ProtocolEvent::HardwareCalibrationRef { payload } => {
                match payload.trim().parse::<i64>() {
                    Ok(value) => self.calibration.hardware_calibration_reference = Some(value),
                    Err(_) => warn!("skipping malformed hardware calibration reference: {payload}"),
                }
                None
            }
        }
    }

    /// Decode a `DATA` payload, apply calibration to CO2, stamp the latest
    /// position, and append to the buffers.
    fn ingest_data(&mut self, payload: &str) {
        let mut measurement =
            protocol::parse_data_payload(payload, Utc::now().timestamp_millis());
        if let Some(raw) = measurement.co2 {
            measurement.co2 = Some(self.calibration.apply(raw));
        }

        let fix = self.position.location();
        measurement.latitude = Some(fix.latitude);
        measurement.longitude = Some(fix.longitude);
        measurement.altitude = Some(fix.altitude);

        self.buffer.push(measurement.clone());
        if self.acquiring {
            self.current_session.push(measurement);
        }
    }

    /// Apply an on/off transition and return the detached rows to persist
    /// when a session just ended. Redundant toggles leave the boundary alone.
    fn apply_acquisition_state(&mut self, next: bool) -> Vec<Measurement> {
        let was = self.acquiring;
        self.acquiring = next;

        if !was && next {
            self.current_session.clear();
            self.start_time = Some(Utc::now().timestamp_millis());
            return Vec::new();
        }

        if was && !next {
            self.start_time = None;
            return std::mem::take(&mut self.current_session);
        }

        if !next {
            self.start_time = None;
        }
        Vec::new()
    }

    /// Local acquisition-start command observed.
    pub fn mark_started(&mut self) {
        let _ = self.apply_acquisition_state(true);
    }

    /// Local acquisition-stop command observed; persists the ended session.
    pub async fn mark_stopped(&mut self) -> Option<PathBuf> {
        let snapshot = self.apply_acquisition_state(false);
        self.flush_rows(snapshot).await
    }

    /// Persist the current-acquisition buffer after a disconnect.
    ///
    /// No-op when a save is already in flight or the buffer is empty. On a
    /// successful write the current session is cleared and acquisition is
    /// marked off; on failure the rows stay buffered for a later attempt.
    pub async fn backup_on_disconnect(&mut self) -> Option<PathBuf> {
        if self.save_in_flight {
            debug!("backup skipped: save already in flight");
            return None;
        }
        if self.current_session.is_empty() {
            return None;
        }

        self.save_in_flight = true;
        let rows = self.current_session.clone();
        let result =
            measurement_csv::save_measurements(self.storage.as_ref(), &rows, &self.sensor_name)
                .await;
        self.save_in_flight = false;

        match result {
            Ok(Some(path)) => {
                self.current_session.clear();
                self.acquiring = false;
                self.start_time = None;
                info!("backed up {} rows after disconnect to {}", rows.len(), path.display());
                Some(path)
            }
            Ok(None) => None,
            Err(e) => {
                error!("disconnect backup failed: {e}");
                None
            }
        }
    }

    /// Flush the entire buffer (not just the current session) to a CSV.
    pub async fn export_all(&mut self) -> Option<PathBuf> {
        let rows = self.buffer.clone();
        self.flush_rows(rows).await
    }

    /// Drop all buffered measurements.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.current_session.clear();
        self.start_time = None;
    }

    async fn flush_rows(&mut self, rows: Vec<Measurement>) -> Option<PathBuf> {
        if rows.is_empty() {
            return None;
        }
        if self.save_in_flight {
            warn!("save already in flight, skipping flush of {} rows", rows.len());
            return None;
        }

        self.save_in_flight = true;
        let result =
            measurement_csv::save_measurements(self.storage.as_ref(), &rows, &self.sensor_name)
                .await;
        self.save_in_flight = false;

        match result {
            Ok(path) => path,
            Err(e) => {
                error!("failed to save measurement CSV: {e}");
                None
            }
        }
    }
}
