//! End-to-end session scenarios driven through a scripted transport and the
//! in-crate simulator, persisting into in-memory storage.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use fluxlink::{
    Command, ConnectionStatus, DeviceSession, FixedPosition, GeoPosition, MemoryStorage, Result,
    SimulatedSensor, TelemetryError, Transport, TransportEvent,
};

#[derive(Default)]
struct LinkInner {
    tx: Option<UnboundedSender<TransportEvent>>,
    sent: Vec<String>,
    reply_to_init_requests: bool,
    disconnect_on_first_send: bool,
}

/// Test handle to the scripted link; the transport half is moved into the
/// session, this half pushes events and inspects sent messages.
#[derive(Clone)]
struct TestLink(Arc<Mutex<LinkInner>>);

impl TestLink {
    fn push_chunk(&self, chunk: &str) {
        let inner = self.0.lock().unwrap();
        if let Some(tx) = &inner.tx {
            tx.send(TransportEvent::Data(chunk.to_string())).unwrap();
        }
    }

    fn drop_link(&self) {
        let mut inner = self.0.lock().unwrap();
        if let Some(tx) = inner.tx.take() {
            tx.send(TransportEvent::Disconnected).ok();
        }
    }

    fn sent(&self) -> Vec<String> {
        self.0.lock().unwrap().sent.clone()
    }
}

struct ScriptedTransport(Arc<Mutex<LinkInner>>);

fn scripted_link(reply_to_init_requests: bool) -> (ScriptedTransport, TestLink) {
    let inner = Arc::new(Mutex::new(LinkInner {
        reply_to_init_requests,
        ..LinkInner::default()
    }));
    (ScriptedTransport(inner.clone()), TestLink(inner))
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&mut self, _address: &str) -> Result<UnboundedReceiver<TransportEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.0.lock().unwrap().tx = Some(tx);
        Ok(rx)
    }

    async fn send(&mut self, message: &str) -> Result<()> {
        let mut inner = self.0.lock().unwrap();
        inner.sent.push(message.to_string());

        if inner.disconnect_on_first_send {
            if let Some(tx) = inner.tx.take() {
                tx.send(TransportEvent::Disconnected).ok();
            }
            return Ok(());
        }

        if inner.reply_to_init_requests {
            let reply = match message.trim() {
                "GET_SETTINGS" => Some("SETTINGS multiplier=1.02;offset=-3\n"),
                "GET_HW_CALIBRATION_REF" => Some("HW_CALIBRATION_REF 400\n"),
                _ => None,
            };
            if let (Some(reply), Some(tx)) = (reply, &inner.tx) {
                tx.send(TransportEvent::Data(reply.to_string())).ok();
            }
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(tx) = self.0.lock().unwrap().tx.take() {
            tx.send(TransportEvent::Disconnected).ok();
        }
        Ok(())
    }
}

fn make_session(transport: Box<dyn Transport>) -> (DeviceSession, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let position = Arc::new(FixedPosition(GeoPosition {
        latitude: 44.56,
        longitude: 11.34,
        altitude: 90.0,
    }));
    (
        DeviceSession::new(transport, storage.clone(), position),
        storage,
    )
}

fn measurement_files(storage: &MemoryStorage) -> Vec<String> {
    storage
        .file_names()
        .into_iter()
        .filter(|n| n != "flux_data.csv")
        .collect()
}

fn csv_body_rows(content: &str) -> usize {
    content
        .lines()
        .skip_while(|l| !l.starts_with("Timestamp,"))
        .skip(1)
        .count()
}

#[tokio::test]
async fn acquisition_session_round_trip() {
    let (transport, link) = scripted_link(true);
    let (mut session, storage) = make_session(Box::new(transport));

    session.connect("AA:BB:CC:DD:EE:FF").await.unwrap();
    assert_eq!(session.status(), ConnectionStatus::Connected);
    assert!(session.acquisition().calibration().applied);

    link.push_chunk("WHOIS Garden Sensor\n");
    link.push_chunk("ACQUISITION_STATE 1\n");
    link.push_chunk("DATA CO2=400;TMP=24.5;HUM=40\n");
    link.push_chunk("DATA CO2=410;TMP=24.6;HUM=41\n");
    link.push_chunk("DATA CO2=420;TMP=24.7;HUM=42\n");
    link.push_chunk("ACQUISITION_STATE 0\n");
    link.drop_link();
    session.run().await;

    // Calibration 1.02/-3 applied at ingestion: 400 -> 405.
    let buffer = session.acquisition().buffer();
    assert_eq!(buffer.len(), 3);
    assert!((buffer[0].co2.unwrap() - 405.0).abs() < 1e-9);
    assert_eq!(buffer[0].temperature, Some(24.5));
    assert_eq!(buffer[0].latitude, Some(44.56));

    // The stop boundary persisted exactly the three session rows.
    let files = measurement_files(&storage);
    assert_eq!(files.len(), 1);
    assert!(files[0].contains("garden-sensor"));
    let content = storage.get(&files[0]).unwrap();
    assert_eq!(csv_body_rows(&content), 3);
    assert!(content.contains("Sensor,Garden Sensor"));

    assert!(session.acquisition().current_session().is_empty());
}

#[tokio::test]
async fn unexpected_disconnect_backs_up_exactly_once() {
    let (transport, link) = scripted_link(true);
    let (mut session, storage) = make_session(Box::new(transport));

    session.connect("AA:BB:CC:DD:EE:FF").await.unwrap();

    link.push_chunk("ACQUISITION_STATE 1\n");
    link.push_chunk("DATA CO2=400\n");
    link.push_chunk("DATA CO2=410\n");
    link.drop_link();
    session.run().await;

    assert_eq!(session.status(), ConnectionStatus::Idle);
    assert_eq!(
        session.last_disconnect_message(),
        Some("Device disconnected unexpectedly")
    );
    assert!(session.has_unexpected_disconnect());

    let files = measurement_files(&storage);
    assert_eq!(files.len(), 1);
    assert_eq!(csv_body_rows(&storage.get(&files[0]).unwrap()), 2);

    // The same disconnect firing again must not double-save.
    session.handle_transport_disconnect().await;
    assert_eq!(measurement_files(&storage).len(), 1);
}

#[tokio::test]
async fn stop_with_no_samples_writes_no_file() {
    let (transport, link) = scripted_link(true);
    let (mut session, storage) = make_session(Box::new(transport));

    session.connect("AA:BB:CC:DD:EE:FF").await.unwrap();
    link.push_chunk("ACQUISITION_STATE 1\n");
    link.push_chunk("ACQUISITION_STATE 0\n");
    link.drop_link();
    session.run().await;

    assert!(measurement_files(&storage).is_empty());
}

#[tokio::test]
async fn disconnect_mid_handshake_aborts_the_init_loop() {
    let (transport, link) = scripted_link(false);
    link.0.lock().unwrap().disconnect_on_first_send = true;
    let (mut session, storage) = make_session(Box::new(transport));

    session.connect("AA:BB:CC:DD:EE:FF").await.unwrap();

    // The first init request dropped the link; the session must not have
    // reached Connected.
    assert_eq!(session.status(), ConnectionStatus::Idle);
    assert_eq!(
        session.last_disconnect_message(),
        Some("Device disconnected unexpectedly")
    );
    assert!(measurement_files(&storage).is_empty());
}

#[tokio::test(start_paused = true)]
async fn connect_is_best_effort_when_init_data_never_arrives() {
    let (transport, link) = scripted_link(false);
    let (mut session, _storage) = make_session(Box::new(transport));

    session.connect("AA:BB:CC:DD:EE:FF").await.unwrap();

    assert_eq!(session.status(), ConnectionStatus::Connected);
    assert!(!session.acquisition().calibration().applied);

    // One settings and one reference request per attempt.
    let sent = link.sent();
    let settings_requests = sent.iter().filter(|m| m.trim() == "GET_SETTINGS").count();
    let reference_requests = sent
        .iter()
        .filter(|m| m.trim() == "GET_HW_CALIBRATION_REF")
        .count();
    assert_eq!(settings_requests, 5);
    assert_eq!(reference_requests, 5);
}

#[tokio::test(start_paused = true)]
async fn simulator_session_end_to_end() {
    let (mut session, storage) = make_session(Box::new(SimulatedSensor::new("Sim Sensor")));

    session.connect("SIM:00:00:00:00:00").await.unwrap();
    assert_eq!(session.status(), ConnectionStatus::Connected);

    session.send_command(Command::Whois, None).await.unwrap();
    session
        .send_command(Command::StartAcquisition, None)
        .await
        .unwrap();
    assert!(session.acquisition().is_acquiring());

    let _ = tokio::time::timeout(Duration::from_millis(4500), session.run()).await;
    assert!(session.acquisition().buffer().len() >= 2);
    assert_eq!(session.acquisition().sensor_name(), "Sim Sensor");

    let saved = session
        .send_command(Command::StopAcquisition, None)
        .await
        .unwrap();
    let path = saved.expect("stop should persist the session");
    let content = storage.get(&path.to_string_lossy()).unwrap();
    assert!(content.starts_with("Metadata,Value"));
    assert_eq!(
        csv_body_rows(&content),
        session.acquisition().buffer().len()
    );

    session.disconnect().await.unwrap();
    assert_eq!(session.status(), ConnectionStatus::Idle);
    assert!(!session.has_unexpected_disconnect());
}

#[tokio::test]
async fn invalid_address_never_reaches_the_transport() {
    struct PanicTransport;

    #[async_trait]
    impl Transport for PanicTransport {
        async fn connect(&mut self, _address: &str) -> Result<UnboundedReceiver<TransportEvent>> {
            panic!("transport must not be touched for an invalid address");
        }
        async fn send(&mut self, _message: &str) -> Result<()> {
            unreachable!()
        }
        async fn disconnect(&mut self) -> Result<()> {
            Ok(())
        }
    }

    let (mut session, _storage) = make_session(Box::new(PanicTransport));
    let result = session.connect("").await;

    assert!(matches!(result, Err(TelemetryError::InvalidAddress)));
    assert_eq!(session.status(), ConnectionStatus::Error);
    assert_eq!(session.last_error(), Some("Invalid address"));
}
