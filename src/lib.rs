//! Session engine for a battery-powered CO2 flux telemetry sensor.
//!
//! The sensor streams ASCII, semicolon-delimited measurements over an
//! unreliable BLE link with explicit connect/disconnect events. This crate
//! owns everything between the radio and the saved CSV files:
//!
//! - the line [`protocol`] codec
//! - the connection lifecycle state machine ([`session::DeviceSession`]),
//!   including the bounded init-data retry loop and disconnect classification
//! - the acquisition session manager ([`acquisition::AcquisitionManager`]):
//!   measurement buffering, calibration, and end-of-session persistence
//! - the flux analysis pipeline ([`flux`]): regression over a selected time
//!   window, appended to `flux_data.csv`
//!
//! Transport, storage, and positioning are capability traits injected once
//! at construction, so tests (and the demo) can run the whole engine against
//! the in-crate [`sim::SimulatedSensor`] and [`storage::MemoryStorage`].
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use fluxlink::{Command, DeviceSession, FixedPosition, FsStorage, SimulatedSensor};
//!
//! #[tokio::main]
//! async fn main() -> fluxlink::Result<()> {
//!     let storage = Arc::new(FsStorage::new("measurements"));
//!     let position = Arc::new(FixedPosition::default());
//!     let transport = Box::new(SimulatedSensor::new("demo sensor"));
//!
//!     let mut session = DeviceSession::new(transport, storage, position);
//!     session.connect("SIM:00:00").await?;
//!     session.send_command(Command::StartAcquisition, None).await?;
//!     session.run().await;
//!     Ok(())
//! }
//! ```

pub mod acquisition;
#[cfg(feature = "bluez")]
pub mod bluetooth;
pub mod errors;
pub mod flux;
pub mod logging;
pub mod measurement;
pub mod measurement_csv;
pub mod position;
pub mod protocol;
pub mod regression;
pub mod session;
pub mod sim;
pub mod storage;
pub mod transport;

pub use acquisition::AcquisitionManager;
#[cfg(feature = "bluez")]
pub use bluetooth::BleTransport;
pub use errors::{Result, TelemetryError};
pub use flux::{compute_flux, load_flux, save_flux, FluxRow, DEFAULT_SLOPE_PRECISION};
pub use measurement::{CalibrationSettings, GeoPosition, Measurement};
pub use position::{FixedPosition, PositionSource};
pub use protocol::{Command, ProtocolEvent};
pub use regression::{linear_regression, Point, Regression};
pub use session::{ConnectionStatus, DeviceSession};
pub use sim::SimulatedSensor;
pub use storage::{FsStorage, MemoryStorage, Storage};
pub use transport::{Transport, TransportEvent};
