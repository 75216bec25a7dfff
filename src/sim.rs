//! Simulated sensor transport for demos and tests without hardware.
//!
//! Speaks the same line protocol as a real device: answers identity, state
//! and settings queries, and streams plausible `DATA` lines once acquisition
//! is started. Noise comes from a fixed-seed LCG so runs are reproducible.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::errors::{Result, TelemetryError};
use crate::transport::{Transport, TransportEvent};

/// Interval between simulated samples.
const SAMPLE_INTERVAL: Duration = Duration::from_millis(1000);

struct SimState {
    tx: Option<UnboundedSender<TransportEvent>>,
    acquiring: bool,
    multiplier: f64,
    offset: f64,
    hardware_reference: i64,
    rng: u64,
}

impl SimState {
    /// Uniform value in `[0, 1)` from a 64-bit LCG.
    fn noise(&mut self) -> f64 {
        self.rng = self
            .rng
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.rng >> 33) as f64 / (1u64 << 31) as f64
    }

    fn sample_line(&mut self) -> String {
        let co2 = 400.0 + self.noise() * 50.0;
        let tmp = 22.0 + self.noise() * 2.0;
        let hum = 40.0 + self.noise() * 5.0;
        format!("DATA CO2={co2:.1};TMP={tmp:.1};HUM={hum:.1}\n")
    }

    fn push(&self, line: String) {
        if let Some(tx) = &self.tx {
            tx.send(TransportEvent::Data(line)).ok();
        }
    }

    fn emit_disconnect(&mut self) {
        if let Some(tx) = self.tx.take() {
            tx.send(TransportEvent::Disconnected).ok();
        }
    }
}

/// In-process stand-in for a real sensor.
pub struct SimulatedSensor {
    name: String,
    state: Arc<Mutex<SimState>>,
    streamer: Option<JoinHandle<()>>,
}

impl SimulatedSensor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(SimState {
                tx: None,
                acquiring: false,
                multiplier: 1.0,
                offset: 0.0,
                hardware_reference: 400,
                rng: 0x5DEECE66D,
            })),
            streamer: None,
        }
    }
}

impl Drop for SimulatedSensor {
    fn drop(&mut self) {
        if let Some(handle) = self.streamer.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Transport for SimulatedSensor {
    async fn connect(&mut self, address: &str) -> Result<UnboundedReceiver<TransportEvent>> {
        info!("[sim] connecting to {address}");

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock().unwrap();
            state.acquiring = false;
            state.tx = Some(tx);
            // A real device reports its idle state right after connecting.
            state.push("ACQUISITION_STATE 0\n".to_string());
        }

        if let Some(handle) = self.streamer.take() {
            handle.abort();
        }
        let state = Arc::clone(&self.state);
        self.streamer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let mut state = state.lock().unwrap();
                if state.tx.is_none() {
                    break;
                }
                if !state.acquiring {
                    continue;
                }
                let line = state.sample_line();
                state.push(line);
            }
        }));

        Ok(rx)
    }

    async fn send(&mut self, message: &str) -> Result<()> {
        let trimmed = message.trim();
        debug!("[sim] wrote: {trimmed}");

        let (token, payload) = trimmed.split_once(' ').unwrap_or((trimmed, ""));
        let mut state = self.state.lock().unwrap();
        if state.tx.is_none() {
            return Err(TelemetryError::Transport("not connected".to_string()));
        }

        match token {
            "START_ACQUISITION" => {
                state.acquiring = true;
                state.push("ACQUISITION_STATE 1\n".to_string());
            }
            "STOP_ACQUISITION" => {
                state.acquiring = false;
                state.push("ACQUISITION_STATE 0\n".to_string());
            }
            "GET_ACQUISITION_STATE" => {
                let on = if state.acquiring { "1" } else { "0" };
                state.push(format!("ACQUISITION_STATE {on}\n"));
            }
            "WHOIS" => {
                let name = self.name.clone();
                state.push(format!("WHOIS {name}\n"));
            }
            "GET_SETTINGS" => {
                let line = format!(
                    "SETTINGS multiplier={};offset={}\n",
                    state.multiplier, state.offset
                );
                state.push(line);
            }
            "SET_SETTINGS" => {
                for part in payload.split(';') {
                    match part.split_once('=') {
                        Some(("multiplier", v)) => {
                            if let Ok(v) = v.parse() {
                                state.multiplier = v;
                            }
                        }
                        Some(("offset", v)) => {
                            if let Ok(v) = v.parse() {
                                state.offset = v;
                            }
                        }
                        _ => {}
                    }
                }
                // The device confirms the values it now holds.
                let line = format!(
                    "SETTINGS multiplier={};offset={}\n",
                    state.multiplier, state.offset
                );
                state.push(line);
            }
            "GET_HW_CALIBRATION_REF" => {
                let line = format!("HW_CALIBRATION_REF {}\n", state.hardware_reference);
                state.push(line);
            }
            "DISCONNECT" => {
                state.acquiring = false;
                state.emit_disconnect();
            }
            _ => {}
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        info!("[sim] disconnected");
        if let Some(handle) = self.streamer.take() {
            handle.abort();
        }
        let mut state = self.state.lock().unwrap();
        state.acquiring = false;
        state.emit_disconnect();
        Ok(())
    }
}
