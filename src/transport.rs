//! Transport capability boundary.
//!
//! The session engine never talks to a radio directly; it drives whatever
//! [`Transport`] it was handed: the BlueZ transport on real hardware, the
//! simulator in demos, a scripted fake in tests.

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::errors::Result;

/// Events delivered by a connected transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A raw chunk of received text, not necessarily line-aligned.
    Data(String),
    /// The link dropped or was closed.
    Disconnected,
}

/// Session-oriented transport to one device.
///
/// `connect` yields the receiving half of an event channel; the sending half
/// lives inside the transport for as long as the link is up. A closed channel
/// is treated the same as an explicit [`TransportEvent::Disconnected`].
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self, address: &str) -> Result<UnboundedReceiver<TransportEvent>>;
    async fn send(&mut self, message: &str) -> Result<()>;
    async fn disconnect(&mut self) -> Result<()>;
}
