//! Connection lifecycle state machine for one device session.
//!
//! All protocol-event handling, buffer mutation, and state transitions for a
//! connection are serialized on this one object: the transport hands over an
//! event channel on connect and [`DeviceSession::run`] (or the init retry
//! loop, while connecting) is the only place that drains it.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::acquisition::AcquisitionManager;
use crate::errors::{Result, TelemetryError};
use crate::position::PositionSource;
use crate::protocol::{self, Command, ProtocolEvent};
use crate::storage::Storage;
use crate::transport::{Transport, TransportEvent};

/// Delay between initialization-data request attempts.
const INIT_RETRY_INTERVAL: Duration = Duration::from_millis(1200);
/// Maximum initialization-data request attempts after a transport connect.
const INIT_MAX_ATTEMPTS: u32 = 5;
/// Bounded console history (rx lines and tx commands).
const CONSOLE_CAPACITY: usize = 500;

const UNEXPECTED_DISCONNECT_MESSAGE: &str = "Device disconnected unexpectedly";

/// Connection lifecycle states. Exactly one device session is active at a
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Idle,
    Connecting,
    Connected,
    Error,
}

/// One device session: transport lifecycle, line reassembly, event routing,
/// and disconnect classification.
pub struct DeviceSession {
    transport: Box<dyn Transport>,
    acquisition: AcquisitionManager,
    status: ConnectionStatus,
    current_address: Option<String>,
    last_error: Option<String>,
    last_disconnect_message: Option<String>,
    last_disconnect_at: Option<i64>,
    manual_disconnect_requested: bool,
    rx_buffer: String,
    pending_init_settings: bool,
    pending_init_hw_calibration_ref: bool,
    events: Option<UnboundedReceiver<TransportEvent>>,
    console: VecDeque<String>,
}

impl DeviceSession {
    pub fn new(
        transport: Box<dyn Transport>,
        storage: Arc<dyn Storage>,
        position: Arc<dyn PositionSource>,
    ) -> Self {
        Self {
            transport,
            acquisition: AcquisitionManager::new(storage, position),
            status: ConnectionStatus::Idle,
            current_address: None,
            last_error: None,
            last_disconnect_message: None,
            last_disconnect_at: None,
            manual_disconnect_requested: false,
            rx_buffer: String::new(),
            pending_init_settings: false,
            pending_init_hw_calibration_ref: false,
            events: None,
            console: VecDeque::new(),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.status == ConnectionStatus::Connecting
    }

    /// Address of the active session, if any.
    pub fn current_address(&self) -> Option<&str> {
        self.current_address.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// User-facing advisory set when the link dropped without a local
    /// disconnect request; cleared by a manual disconnect.
    pub fn last_disconnect_message(&self) -> Option<&str> {
        self.last_disconnect_message.as_deref()
    }

    /// Epoch milliseconds of the most recent disconnect.
    pub fn last_disconnect_at(&self) -> Option<i64> {
        self.last_disconnect_at
    }

    pub fn has_unexpected_disconnect(&self) -> bool {
        self.last_disconnect_message.is_some() && !self.manual_disconnect_requested
    }

    pub fn acquisition(&self) -> &AcquisitionManager {
        &self.acquisition
    }

    pub fn acquisition_mut(&mut self) -> &mut AcquisitionManager {
        &mut self.acquisition
    }

    /// Recent rx lines and tx commands, oldest first.
    pub fn console(&self) -> impl Iterator<Item = &str> {
        self.console.iter().map(String::as_str)
    }

    pub fn clear_console(&mut self) {
        self.console.clear();
    }

    /// Open a session to `address`.
    ///
    /// A second call while already `Connecting` is a no-op. An empty address
    /// fails fast without touching the transport. After the transport-level
    /// connect, device settings and the hardware calibration reference are
    /// requested in a bounded retry loop; `Connected` is entered even when
    /// they never arrive (missing init data only delays calibrated accuracy).
    pub async fn connect(&mut self, address: &str) -> Result<()> {
        if self.status == ConnectionStatus::Connecting {
            debug!("connect ignored: already connecting");
            return Ok(());
        }

        let address = address.trim();
        if address.is_empty() {
            self.status = ConnectionStatus::Error;
            self.last_error = Some(TelemetryError::InvalidAddress.to_string());
            return Err(TelemetryError::InvalidAddress);
        }

        self.status = ConnectionStatus::Connecting;
        self.last_error = None;
        self.last_disconnect_message = None;
        self.last_disconnect_at = None;
        self.manual_disconnect_requested = false;
        self.current_address = Some(address.to_string());
        self.rx_buffer.clear();
        self.pending_init_settings = false;
        self.pending_init_hw_calibration_ref = false;

        match self.transport.connect(address).await {
            Ok(receiver) => {
                self.events = Some(receiver);
            }
            Err(e) => {
                self.current_address = None;
                self.status = ConnectionStatus::Error;
                self.last_error = Some(e.to_string());
                self.rx_buffer.clear();
                return Err(e);
            }
        }

        info!("transport connected: address={address}");
        self.request_init_data().await;

        if self.status == ConnectionStatus::Connecting {
            self.status = ConnectionStatus::Connected;
            info!("session connected: address={address}");
        }
        Ok(())
    }

    /// Request a manual disconnect.
    ///
    /// The post-disconnect path (resource release, backup flush) runs whether
    /// or not the transport closes cleanly; a transport error is still
    /// reported to the caller.
    pub async fn disconnect(&mut self) -> Result<()> {
        self.manual_disconnect_requested = true;

        let result = self.transport.disconnect().await;
        if let Err(e) = &result {
            warn!("transport disconnect failed: {e}");
        }
        self.handle_disconnected(true).await;
        result
    }

    /// Send a protocol command; ignored unless connected.
    ///
    /// Start/stop commands also drive the local acquisition boundary; stop
    /// returns the path of any CSV written for the ended session.
    pub async fn send_command(
        &mut self,
        command: Command,
        payload: Option<&str>,
    ) -> Result<Option<PathBuf>> {
        if !self.is_connected() {
            debug!("command {command:?} ignored: not connected");
            return Ok(None);
        }

        self.send_protocol_message(&protocol::encode_command_raw(command, payload), true)
            .await?;

        match command {
            Command::StartAcquisition => {
                self.acquisition.mark_started();
                Ok(None)
            }
            Command::StopAcquisition => Ok(self.acquisition.mark_stopped().await),
            _ => Ok(None),
        }
    }

    /// Send a preformatted message; `append_newline = false` passes the text
    /// through untouched (raw passthrough). Ignored unless connected.
    pub async fn send_raw(&mut self, message: &str, append_newline: bool) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        self.send_protocol_message(message, append_newline).await
    }

    /// Drive the session until the transport disconnects or its channel
    /// closes. All event handling is serialized on this call; the session
    /// must not be driven from two places at once.
    pub async fn run(&mut self) {
        loop {
            let event = match self.events.as_mut() {
                Some(events) => events.recv().await,
                None => return,
            };
            match event {
                Some(TransportEvent::Data(chunk)) => self.handle_chunk(&chunk).await,
                Some(TransportEvent::Disconnected) | None => {
                    self.handle_transport_disconnect().await;
                    return;
                }
            }
        }
    }

    /// Buffer a raw transport chunk and dispatch every complete line.
    ///
    /// `\r\n` and bare `\r` are normalized to `\n`; a trailing partial line
    /// is retained for the next chunk.
    pub async fn handle_chunk(&mut self, chunk: &str) {
        self.rx_buffer.push_str(chunk);

        let normalized = self.rx_buffer.replace("\r\n", "\n").replace('\r', "\n");
        let mut lines: Vec<String> = normalized.split('\n').map(str::to_string).collect();
        self.rx_buffer = lines.pop().unwrap_or_default();

        for line in lines {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            self.handle_line(trimmed).await;
        }
    }

    /// Decode one complete line and route the event.
    pub async fn handle_line(&mut self, line: &str) {
        self.push_console(line.to_string());

        let Some(event) = protocol::parse_line(line) else {
            return;
        };

        match &event {
            ProtocolEvent::Settings { .. } => self.pending_init_settings = false,
            ProtocolEvent::HardwareCalibrationRef { .. } => {
                self.pending_init_hw_calibration_ref = false
            }
            _ => {}
        }

        if let Some(path) = self.acquisition.handle_event(event).await {
            info!("acquisition session saved to {}", path.display());
        }
    }

    /// Transport-initiated disconnect observed.
    pub async fn handle_transport_disconnect(&mut self) {
        self.handle_disconnected(false).await;
    }

    async fn handle_disconnected(&mut self, triggered_by_manual_action: bool) {
        let was_connected = matches!(
            self.status,
            ConnectionStatus::Connected | ConnectionStatus::Connecting
        );
        let was_manual = triggered_by_manual_action || self.manual_disconnect_requested;

        // A manual disconnect racing a transport-level close arrives here
        // twice; the second pass finds nothing left to release.
        if !was_connected && self.current_address.is_none() {
            return;
        }

        self.status = ConnectionStatus::Idle;
        self.current_address = None;
        self.last_error = None;
        self.last_disconnect_at = Some(Utc::now().timestamp_millis());
        self.rx_buffer.clear();
        self.pending_init_settings = false;
        self.pending_init_hw_calibration_ref = false;
        self.events = None;

        if was_connected && !was_manual {
            self.last_disconnect_message = Some(UNEXPECTED_DISCONNECT_MESSAGE.to_string());
            warn!("unexpected disconnect");
        } else if was_manual {
            self.last_disconnect_message = None;
            info!("session closed");
        }

        self.manual_disconnect_requested = false;

        if let Some(path) = self.acquisition.backup_on_disconnect().await {
            info!("disconnect backup saved to {}", path.display());
        }
    }

    fn init_data_complete(&self) -> bool {
        !self.pending_init_settings && !self.pending_init_hw_calibration_ref
    }

    /// Request device settings and the hardware calibration reference until
    /// both arrive or the attempts are exhausted. Aborts as soon as the
    /// session stops connecting (a disconnect mid-handshake).
    async fn request_init_data(&mut self) {
        self.pending_init_settings = true;
        self.pending_init_hw_calibration_ref = true;

        for attempt in 1..=INIT_MAX_ATTEMPTS {
            if self.status != ConnectionStatus::Connecting {
                debug!("init request loop aborted: session no longer connecting");
                return;
            }

            self.request_missing_init_data().await;
            if self.init_data_complete() {
                debug!("device initialization data complete after {attempt} attempt(s)");
                return;
            }

            self.wait_for_init_data().await;
            if self.status != ConnectionStatus::Connecting {
                debug!("init request loop aborted: session no longer connecting");
                return;
            }
            if self.init_data_complete() {
                debug!("device initialization data complete after {attempt} attempt(s)");
                return;
            }
        }

        warn!("proceeding without complete device initialization data");
    }

    async fn request_missing_init_data(&mut self) {
        if self.pending_init_settings {
            if let Err(e) = self
                .send_protocol_message(Command::GetSettings.token(), true)
                .await
            {
                warn!("settings request failed: {e}");
            }
        }
        if self.pending_init_hw_calibration_ref {
            if let Err(e) = self
                .send_protocol_message(Command::GetHardwareCalibrationRef.token(), true)
                .await
            {
                warn!("hardware calibration reference request failed: {e}");
            }
        }
    }

    /// Sleep one retry interval while still draining transport events, so
    /// init replies received mid-wait are observed immediately and a
    /// disconnect cancels the wait.
    async fn wait_for_init_data(&mut self) {
        let Some(mut events) = self.events.take() else {
            return;
        };

        let deadline = tokio::time::sleep(INIT_RETRY_INTERVAL);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.recv() => match event {
                    Some(TransportEvent::Data(chunk)) => {
                        self.handle_chunk(&chunk).await;
                        if self.init_data_complete() {
                            break;
                        }
                    }
                    Some(TransportEvent::Disconnected) | None => {
                        self.handle_transport_disconnect().await;
                        return;
                    }
                },
            }
        }

        self.events = Some(events);
    }

    async fn send_protocol_message(&mut self, message: &str, append_newline: bool) -> Result<()> {
        let framed = if append_newline {
            format!("{message}\n")
        } else {
            message.to_string()
        };
        self.push_console(format!("TX: {message}"));
        self.transport.send(&framed).await
    }

    fn push_console(&mut self, entry: String) {
        if self.console.len() == CONSOLE_CAPACITY {
            self.console.pop_front();
        }
        self.console.push_back(entry);
    }
}
