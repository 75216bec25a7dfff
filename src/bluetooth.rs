//! BlueZ-backed BLE transport (Linux only, feature `bluez`).
//!
//! Connects to the sensor as a GATT central: resolves the write and notify
//! characteristics (known UUIDs first, characteristic properties as a
//! fallback), forwards notifications into the session's event channel, and
//! watches the connection property to report link loss.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::errors::{Result, TelemetryError};
use crate::protocol::{self, Command};
use crate::transport::{Transport, TransportEvent};

const SCAN_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_CONNECT_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Write characteristic exposed by the sensor.
const WRITE_UUID: bluer::Uuid = bluer::Uuid::from_u128(0x7b6b12cd_ca54_46a6_b3f4_3a848a3ed00b);
/// Notify characteristic exposed by the sensor.
const NOTIFY_UUID: bluer::Uuid = bluer::Uuid::from_u128(0x907bac5d_92ed_4d90_905e_a3a7b9899f21);

fn transport_err(e: impl std::fmt::Display) -> TelemetryError {
    TelemetryError::Transport(e.to_string())
}

/// BLE transport over BlueZ.
pub struct BleTransport {
    // The D-Bus session must outlive the link; dropping it tears down every
    // derived adapter and device handle.
    session: Option<bluer::Session>,
    device: Option<Device>,
    write_char: Option<Characteristic>,
    tx: Option<UnboundedSender<TransportEvent>>,
    tasks: Vec<JoinHandle<()>>,
}

impl BleTransport {
    pub fn new() -> Self {
        Self {
            session: None,
            device: None,
            write_char: None,
            tx: None,
            tasks: Vec::new(),
        }
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Default for BleTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

async fn wait_for_device(adapter: &Adapter, address: Address) -> Result<()> {
    let known = adapter.device_addresses().await.map_err(transport_err)?;
    if known.contains(&address) {
        return Ok(());
    }

    let mut events = adapter.discover_devices().await.map_err(transport_err)?;
    let deadline = Instant::now() + SCAN_TIMEOUT;

    while let Some(event) = events.next().await {
        if let AdapterEvent::DeviceAdded(addr) = event {
            if addr == address {
                info!("device discovered: address={addr}");
                return Ok(());
            }
        }
        if Instant::now() > deadline {
            break;
        }
    }

    Err(TelemetryError::Transport(format!(
        "device not found during scan: {address}"
    )))
}

async fn connect_with_retries(device: &Device, address: Address) -> Result<()> {
    let mut last_error = None;
    for attempt in 0..MAX_CONNECT_RETRIES {
        if attempt > 0 {
            let delay = RETRY_DELAY * (1 << (attempt - 1).min(3));
            warn!("retrying BLE connection after {delay:?} (address={address}, attempt={attempt})");
            tokio::time::sleep(delay).await;
        }

        match tokio::time::timeout(CONNECT_TIMEOUT, device.connect()).await {
            Ok(Ok(())) => {
                info!("BLE connection established: address={address}");
                return Ok(());
            }
            Ok(Err(e)) => {
                warn!("BLE connection attempt failed: address={address}, error={e}");
                last_error = Some(transport_err(e));
            }
            Err(_) => {
                warn!("BLE connection attempt timed out: address={address}");
                last_error = Some(TelemetryError::Transport("connect timed out".to_string()));
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| TelemetryError::Transport("max retries exceeded".to_string())))
}

/// Find the write and notify characteristics across the device's services.
async fn resolve_characteristics(
    device: &Device,
) -> Result<(Characteristic, Characteristic)> {
    let mut write = None;
    let mut notify = None;
    let mut write_fallback = None;
    let mut notify_fallback = None;

    for service in device.services().await.map_err(transport_err)? {
        for characteristic in service.characteristics().await.map_err(transport_err)? {
            let uuid = characteristic.uuid().await.map_err(transport_err)?;
            if uuid == WRITE_UUID {
                write = Some(characteristic.clone());
            }
            if uuid == NOTIFY_UUID {
                notify = Some(characteristic.clone());
            }

            let flags = characteristic.flags().await.map_err(transport_err)?;
            if notify_fallback.is_none() && (flags.notify || flags.indicate) {
                notify_fallback = Some(characteristic.clone());
            }
            if write_fallback.is_none() && (flags.write || flags.write_without_response) {
                write_fallback = Some(characteristic.clone());
            }
        }
    }

    // Property-based detection covers firmware that moved the UUIDs.
    let write = write.or(write_fallback);
    let notify = notify.or(notify_fallback);

    match (write, notify) {
        (Some(write), Some(notify)) => Ok((write, notify)),
        _ => Err(TelemetryError::Transport(
            "unable to find BLE read/write characteristics".to_string(),
        )),
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn connect(&mut self, address: &str) -> Result<UnboundedReceiver<TransportEvent>> {
        self.abort_tasks();
        self.session = None;
        self.device = None;
        self.write_char = None;
        self.tx = None;

        let address: Address = address
            .parse()
            .map_err(|_| TelemetryError::Transport("invalid device address".to_string()))?;

        let session = bluer::Session::new().await.map_err(transport_err)?;
        let adapter = session.default_adapter().await.map_err(transport_err)?;
        adapter.set_powered(true).await.map_err(transport_err)?;

        wait_for_device(&adapter, address).await?;
        let device = adapter.device(address).map_err(transport_err)?;
        connect_with_retries(&device, address).await?;

        let (write_char, notify_char) = resolve_characteristics(&device).await?;

        let (tx, rx) = mpsc::unbounded_channel();

        let notifications = notify_char.notify().await.map_err(transport_err)?;
        let data_tx = tx.clone();
        self.tasks.push(tokio::spawn(async move {
            futures::pin_mut!(notifications);
            while let Some(bytes) = notifications.next().await {
                let chunk = String::from_utf8_lossy(&bytes).to_string();
                if data_tx.send(TransportEvent::Data(chunk)).is_err() {
                    break;
                }
            }
            debug!("notification stream ended");
            data_tx.send(TransportEvent::Disconnected).ok();
        }));

        let watch_device = device.clone();
        let watch_tx = tx.clone();
        self.tasks.push(tokio::spawn(async move {
            let Ok(events) = watch_device.events().await else {
                return;
            };
            futures::pin_mut!(events);
            while let Some(event) = events.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                    warn!("BLE link reported disconnected");
                    watch_tx.send(TransportEvent::Disconnected).ok();
                    break;
                }
            }
        }));

        // Kick off the settings handshake so calibration arrives early.
        write_char
            .write(protocol::encode_command(Command::GetSettings, None).as_bytes())
            .await
            .map_err(transport_err)?;

        self.session = Some(session);
        self.device = Some(device);
        self.write_char = Some(write_char);
        self.tx = Some(tx);
        Ok(rx)
    }

    async fn send(&mut self, message: &str) -> Result<()> {
        let Some(write_char) = &self.write_char else {
            return Err(TelemetryError::Transport(
                "not connected: no write characteristic".to_string(),
            ));
        };
        write_char
            .write(message.as_bytes())
            .await
            .map_err(transport_err)
    }

    async fn disconnect(&mut self) -> Result<()> {
        // Tell the device we are leaving; best effort.
        if let Some(write_char) = &self.write_char {
            let farewell = protocol::encode_command(Command::Disconnect, None);
            if let Err(e) = write_char.write(farewell.as_bytes()).await {
                debug!("disconnect notice not delivered: {e}");
            }
        }

        self.abort_tasks();
        self.write_char = None;

        let result = match self.device.take() {
            Some(device) => device.disconnect().await.map_err(transport_err),
            None => Ok(()),
        };
        self.session = None;

        if let Some(tx) = self.tx.take() {
            tx.send(TransportEvent::Disconnected).ok();
        }
        result
    }
}
