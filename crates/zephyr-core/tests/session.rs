//! Session state machine tests over an in-memory link

use pretty_assertions::assert_eq;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
use zephyr_core::export::{ExportError, SessionExporter};
use zephyr_core::params::{Calibration, ParameterValidationError, PidParameters, Setpoints};
use zephyr_core::protocol::{ActiveCommand, FrameError, ProtocolError, StatusMessage};
use zephyr_core::session::{Session, SessionError, SessionEvent, SessionState};
use zephyr_core::telemetry::{StoredRecord, TelemetryLayout, TelemetryRecord};
use zephyr_core::config::StandConfig;

const WAIT: Duration = Duration::from_secs(2);

struct Export {
    layout: TelemetryLayout,
    rows: Vec<TelemetryRecord>,
}

/// Keeps exports in memory; can be told to fail
#[derive(Clone, Default)]
struct RecordingExporter {
    exports: Arc<Mutex<Vec<Export>>>,
    fail: Arc<AtomicBool>,
}

impl RecordingExporter {
    fn count(&self) -> usize {
        self.exports.lock().unwrap().len()
    }

    fn last_rows(&self) -> Vec<TelemetryRecord> {
        self.exports
            .lock()
            .unwrap()
            .last()
            .map(|e| e.rows.clone())
            .unwrap_or_default()
    }

    fn last_layout(&self) -> Option<TelemetryLayout> {
        self.exports.lock().unwrap().last().map(|e| e.layout)
    }
}

impl SessionExporter for RecordingExporter {
    fn export(
        &mut self,
        layout: TelemetryLayout,
        rows: &[StoredRecord],
        destination_hint: &str,
    ) -> Result<PathBuf, ExportError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ExportError::Io(io::Error::new(io::ErrorKind::Other, "disk full")));
        }
        self.exports.lock().unwrap().push(Export {
            layout,
            rows: rows.iter().map(|r| r.record.clone()).collect(),
        });
        Ok(PathBuf::from(destination_hint))
    }
}

/// Device end of the link
struct Device {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl Device {
    async fn send(&mut self, text: &str) {
        self.writer.write_all(text.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn next_line(&mut self) -> Option<String> {
        tokio::time::timeout(WAIT, self.lines.next_line())
            .await
            .expect("timed out reading host output")
            .unwrap()
    }
}

fn connect(config: StandConfig) -> (Session, Device, RecordingExporter) {
    let exporter = RecordingExporter::default();
    let mut session = Session::new(config, Box::new(exporter.clone()));
    let (host, device) = tokio::io::duplex(64 * 1024);
    session.attach_stream(host).unwrap();
    let (read_half, writer) = tokio::io::split(device);
    let device = Device {
        lines: BufReader::new(read_half).lines(),
        writer,
    };
    (session, device, exporter)
}

/// Standard-layout line with the given index and fuel dP
fn standard_line(index: u64, dp0: f64) -> String {
    let mut values = vec![0.0; 22];
    values[0] = index as f64;
    values[13] = dp0;
    values[21] = index as f64 * 10.0;
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

async fn pump(session: &mut Session, items: usize) {
    for _ in 0..items {
        assert!(session.poll_once(WAIT).await.unwrap(), "no inbound item");
    }
}

/// Give the reader task time to move written lines into the channel
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_store_preserves_arrival_order() {
    let (mut session, mut device, exporter) = connect(StandConfig::default());
    session.begin(ActiveCommand::Ignition).await.unwrap();

    for index in [5, 3, 3, 9] {
        device.send(&standard_line(index, 1.0)).await;
    }
    pump(&mut session, 4).await;

    let indices: Vec<_> = session
        .store()
        .export_rows()
        .iter()
        .map(|r| r.record.sample_index())
        .collect();
    assert_eq!(indices, vec![Some(5), Some(3), Some(3), Some(9)]);

    device.send("IDLE").await;
    pump(&mut session, 1).await;
    assert_eq!(session.state(), SessionState::ConnectedIdle);

    let exported: Vec<_> = exporter
        .last_rows()
        .iter()
        .map(|r| r.sample_index())
        .collect();
    assert_eq!(exported, vec![Some(5), Some(3), Some(3), Some(9)]);
}

#[tokio::test]
async fn test_safety_idle_precedes_next_record() {
    let (mut session, mut device, exporter) = connect(StandConfig::default());
    session.begin(ActiveCommand::Ignition).await.unwrap();
    assert_eq!(device.next_line().await.as_deref(), Some("IGNITION"));

    // Violation followed by more records, all in flight at once
    device.send(&standard_line(1, 20.0)).await;
    device.send(&standard_line(2, 25.0)).await;
    device.send(&standard_line(3, 1.0)).await;

    pump(&mut session, 1).await;
    assert_eq!(session.store().len(), 1);
    assert_eq!(session.state(), SessionState::ShuttingDown);
    assert_eq!(device.next_line().await.as_deref(), Some("IDLE"));

    // Sustained violation does not repeat the IDLE
    pump(&mut session, 2).await;
    assert_eq!(session.store().len(), 3);

    device.send("IDLE").await;
    pump(&mut session, 1).await;
    assert_eq!(session.state(), SessionState::ConnectedIdle);
    assert_eq!(exporter.count(), 1);
    assert_eq!(exporter.last_rows().len(), 3);

    let trips = session
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::SafetyTrip(_)))
        .count();
    assert_eq!(trips, 1);

    session.close().await.unwrap();
    assert_eq!(device.next_line().await, None);
}

#[tokio::test]
async fn test_safety_limit_in_psi() {
    let mut config = StandConfig::default();
    config.pressure_unit = zephyr_core::unit_conversion::PressureUnit::Psi;
    let (mut session, mut device, _exporter) = connect(config);
    session.begin(ActiveCommand::PidTuneTest).await.unwrap();
    assert_eq!(device.next_line().await.as_deref(), Some("PID_TUNE_TEST"));

    // 3 psi is above the 17.4 kPa fuel limit
    device.send(&standard_line(1, 3.0)).await;
    pump(&mut session, 1).await;
    assert_eq!(device.next_line().await.as_deref(), Some("IDLE"));
}

#[tokio::test]
async fn test_idle_trip_sends_idle_without_storing() {
    let (mut session, mut device, exporter) = connect(StandConfig::default());

    device.send(&standard_line(1, 30.0)).await;
    pump(&mut session, 1).await;

    assert_eq!(device.next_line().await.as_deref(), Some("IDLE"));
    assert_eq!(session.state(), SessionState::ConnectedIdle);
    assert!(session.store().is_empty());
    assert_eq!(exporter.count(), 0);
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let (mut session, mut device, exporter) = connect(StandConfig::default());
    session.begin(ActiveCommand::Ignition).await.unwrap();

    device.send(&standard_line(1, 1.0)).await;
    device.send(&standard_line(2, 1.0)).await;
    settle().await;

    session.shutdown().await.unwrap();
    session.shutdown().await.unwrap();

    assert_eq!(session.state(), SessionState::ConnectedIdle);
    assert_eq!(exporter.count(), 1);
    // Records already received were drained into the export
    assert_eq!(exporter.last_rows().len(), 2);

    session.close().await.unwrap();
    assert_eq!(device.next_line().await.as_deref(), Some("IGNITION"));
    assert_eq!(device.next_line().await.as_deref(), Some("IDLE"));
    assert_eq!(device.next_line().await, None);
}

#[tokio::test]
async fn test_parameters_are_snapshots() {
    let (mut session, mut device, _exporter) = connect(StandConfig::default());

    let mut setpoints = Setpoints {
        valve_1: 12.5,
        valve_2: 40.0,
    };
    session.send_setpoints(setpoints).await.unwrap();
    setpoints.valve_1 = 99.0;

    let mut calibration = Calibration::default();
    calibration.p_max = 2000.0;
    session.send_calibration(calibration).await.unwrap();
    calibration.p_max = 1.0;

    assert_eq!(
        device.next_line().await.as_deref(),
        Some("UPDATESETPOINTS,12.5,40")
    );
    assert_eq!(
        device.next_line().await.as_deref(),
        Some("UPDATE_CALIBRATION,0.5,4.5,0,2000,5")
    );

    let sent = session.parameters();
    assert_eq!(sent.setpoints.valve_1, 12.5);
    assert_eq!(sent.calibration.p_max, 2000.0);
    assert_eq!(setpoints.valve_1, 99.0);
}

#[tokio::test]
async fn test_k_values_wait_for_ack() {
    let (mut session, mut device, _exporter) = connect(StandConfig::default());
    let pid = PidParameters::parse(&["1", "0.1", "0.01", "2", "0.2", "0.02"])
        .unwrap();

    let responder = tokio::spawn(async move {
        assert_eq!(device.next_line().await.as_deref(), Some("UPDATE_K_VALUES"));
        device.send("State set to UPDATE_K_VALUES").await;
        let gains = device.next_line().await;
        (device, gains)
    });

    session.send_k_values(pid).await.unwrap();
    let (_device, gains) = responder.await.unwrap();
    assert_eq!(gains.as_deref(), Some("1,0.1,0.01,2,0.2,0.02"));
    assert_eq!(session.parameters().pid, pid);
}

#[tokio::test]
async fn test_k_values_timeout_sends_no_gains() {
    let mut config = StandConfig::default();
    config.connection.ack_timeout_ms = 100;
    let (mut session, mut device, _exporter) = connect(config);
    let pid = PidParameters::default();

    // Unrelated chatter does not count as the acknowledgement
    device.send("State set to IDLE").await;

    let err = session.send_k_values(pid).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Connection(ProtocolError::Timeout(_))
    ));
    assert_eq!(session.state(), SessionState::ConnectedIdle);

    session.close().await.unwrap();
    assert_eq!(device.next_line().await.as_deref(), Some("UPDATE_K_VALUES"));
    assert_eq!(device.next_line().await.as_deref(), Some("IDLE"));
    assert_eq!(device.next_line().await, None);
}

#[tokio::test]
async fn test_commands_rejected_while_active() {
    let (mut session, mut device, _exporter) = connect(StandConfig::default());
    session.begin(ActiveCommand::Ignition).await.unwrap();

    let err = session
        .send_setpoints(Setpoints::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::IllegalState {
            operation: "send_setpoints",
            state: SessionState::Igniting
        }
    ));
    assert!(matches!(
        session.begin(ActiveCommand::PidTuneTest).await,
        Err(SessionError::IllegalState { .. })
    ));

    session.close().await.unwrap();
    assert_eq!(device.next_line().await.as_deref(), Some("IGNITION"));
    assert_eq!(device.next_line().await.as_deref(), Some("IDLE"));
    assert_eq!(device.next_line().await, None);
}

#[tokio::test]
async fn test_connection_loss_exports_and_disconnects() {
    let (mut session, mut device, exporter) = connect(StandConfig::default());
    session.begin(ActiveCommand::Ignition).await.unwrap();

    device.send(&standard_line(1, 1.0)).await;
    device.send(&standard_line(2, 1.0)).await;
    pump(&mut session, 2).await;
    drop(device);

    let err = session.poll_once(WAIT).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Connection(ProtocolError::Closed(_))
    ));
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(!session.is_connected());
    assert_eq!(exporter.count(), 1);
    assert_eq!(exporter.last_rows().len(), 2);

    assert!(session
        .drain_events()
        .iter()
        .any(|e| matches!(e, SessionEvent::Disconnected(_))));
}

#[tokio::test]
async fn test_emergency_shutdown_waits_for_idle() {
    let (mut session, mut device, exporter) = connect(StandConfig::default());
    session.begin(ActiveCommand::Ignition).await.unwrap();

    device.send("THRUSTING").await;
    device.send("EMERGENCY_SHUTDOWN").await;
    pump(&mut session, 2).await;
    assert_eq!(session.state(), SessionState::ShuttingDown);
    assert_eq!(exporter.count(), 0);

    device.send("IDLE").await;
    pump(&mut session, 1).await;
    assert_eq!(session.state(), SessionState::ConnectedIdle);
    assert_eq!(exporter.count(), 1);

    let events = session.drain_events();
    assert!(events.contains(&SessionEvent::Progress(StatusMessage::Thrusting)));
    assert!(events.contains(&SessionEvent::Status(StatusMessage::EmergencyShutdown)));
}

#[tokio::test]
async fn test_layout_declaration_switches_export() {
    let mut config = StandConfig::default();
    config.layout = TelemetryLayout::Compact;
    let (mut session, mut device, exporter) = connect(config);
    session.begin(ActiveCommand::TestConnection).await.unwrap();

    device.send("FIELDS 22").await;
    device.send("TESTINGCONNECTION complete").await;
    device.send(&standard_line(7, 1.0)).await;
    device.send("IDLE").await;
    pump(&mut session, 4).await;

    assert_eq!(session.state(), SessionState::ConnectedIdle);
    assert_eq!(exporter.last_layout(), Some(TelemetryLayout::Standard));
    let rows = exporter.last_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].sample_index(), Some(7));

    let events = session.drain_events();
    assert!(events.contains(&SessionEvent::Progress(StatusMessage::LayoutDeclared(22))));
    assert!(events.contains(&SessionEvent::Progress(StatusMessage::ConnectionOk)));
}

#[tokio::test]
async fn test_malformed_lines_are_discarded() {
    let (mut session, mut device, _exporter) = connect(StandConfig::default());
    session.begin(ActiveCommand::Ignition).await.unwrap();

    device.send("1,2,3").await;
    device.send("1,2,abc").await;
    device.send(&standard_line(1, 1.0)).await;
    pump(&mut session, 3).await;

    assert_eq!(session.store().len(), 1);
    let discarded = session
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::FrameDiscarded { .. }))
        .count();
    assert_eq!(discarded, 2);
    assert!(session
        .log()
        .lines()
        .iter()
        .any(|l| l.message.starts_with("Discarded frame")));
}

#[tokio::test]
async fn test_failed_export_can_be_retried() {
    let (mut session, mut device, exporter) = connect(StandConfig::default());
    exporter.fail.store(true, Ordering::SeqCst);
    session.begin(ActiveCommand::PidTuneTest).await.unwrap();

    device.send(&standard_line(1, 1.0)).await;
    device.send("PID_DONE").await;
    device.send("IDLE").await;
    pump(&mut session, 3).await;

    assert_eq!(session.state(), SessionState::ConnectedIdle);
    assert_eq!(exporter.count(), 0);
    assert!(session
        .drain_events()
        .iter()
        .any(|e| matches!(e, SessionEvent::ExportFailed(_))));
    assert_eq!(session.store().len(), 1);

    exporter.fail.store(false, Ordering::SeqCst);
    session.retry_export().unwrap();
    assert_eq!(exporter.count(), 1);
    assert_eq!(exporter.last_rows().len(), 1);
}

#[tokio::test]
async fn test_new_run_starts_new_segment() {
    let (mut session, mut device, exporter) = connect(StandConfig::default());

    session.begin(ActiveCommand::PidTuneTest).await.unwrap();
    device.send(&standard_line(1, 1.0)).await;
    device.send(&standard_line(2, 1.0)).await;
    device.send("IDLE").await;
    pump(&mut session, 3).await;

    session.begin(ActiveCommand::Ignition).await.unwrap();
    device.send(&standard_line(3, 1.0)).await;
    device.send("IDLE").await;
    pump(&mut session, 2).await;

    assert_eq!(exporter.count(), 2);
    assert_eq!(exporter.last_rows().len(), 1);
    // The store keeps everything from the session
    assert_eq!(session.store().len(), 3);
}

#[tokio::test]
async fn test_k_values_abandoned_on_safety_trip() {
    let (mut session, mut device, _exporter) = connect(StandConfig::default());
    let pid = PidParameters::parse(&["1", "0.1", "0.01", "2", "0.2", "0.02"]).unwrap();

    // An over-limit record lands before the acknowledgement
    device.send(&standard_line(1, 30.0)).await;
    device.send("State set to UPDATE_K_VALUES").await;

    let err = session.send_k_values(pid).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::SafetyAbort {
            operation: "send_k_values"
        }
    ));
    assert_eq!(session.state(), SessionState::ConnectedIdle);
    assert_eq!(session.parameters().pid, PidParameters::default());

    session.close().await.unwrap();
    assert_eq!(device.next_line().await.as_deref(), Some("UPDATE_K_VALUES"));
    assert_eq!(device.next_line().await.as_deref(), Some("IDLE"));
    assert_eq!(device.next_line().await, None);
}

#[tokio::test]
async fn test_non_finite_parameters_never_sent() {
    let (mut session, mut device, _exporter) = connect(StandConfig::default());

    let setpoints = Setpoints {
        valve_1: f64::INFINITY,
        valve_2: 1.0,
    };
    assert!(matches!(
        session.send_setpoints(setpoints).await,
        Err(SessionError::Parameters(ParameterValidationError::NotFinite {
            field: "valve_1"
        }))
    ));

    let calibration = Calibration {
        v_min: f64::NAN,
        ..Calibration::default()
    };
    assert!(matches!(
        session.send_calibration(calibration).await,
        Err(SessionError::Parameters(ParameterValidationError::NotFinite {
            field: "v_min"
        }))
    ));

    let mut pid = PidParameters::default();
    pid.fuel.kd = f64::NAN;
    assert!(matches!(
        session.send_k_values(pid).await,
        Err(SessionError::Parameters(ParameterValidationError::NotFinite {
            field: "kd1"
        }))
    ));

    assert_eq!(session.parameters(), StandConfig::default().parameters());
    session.close().await.unwrap();
    assert_eq!(device.next_line().await.as_deref(), Some("IDLE"));
    assert_eq!(device.next_line().await, None);
}

#[tokio::test]
async fn test_serial_noise_does_not_end_run() {
    let (mut session, mut device, _exporter) = connect(StandConfig::default());
    session.begin(ActiveCommand::Ignition).await.unwrap();

    device
        .writer
        .write_all(b"\xff\xfe garbage\nTHRUSTING\n")
        .await
        .unwrap();
    pump(&mut session, 2).await;

    assert_eq!(session.state(), SessionState::Igniting);
    assert!(session.is_connected());
    let events = session.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::FrameDiscarded {
            error: FrameError::NotText,
            ..
        }
    )));
    assert!(events.contains(&SessionEvent::Progress(StatusMessage::Thrusting)));
}

#[tokio::test]
async fn test_layout_switch_mid_run_exports_earlier_records() {
    let (mut session, mut device, exporter) = connect(StandConfig::default());
    session.begin(ActiveCommand::Ignition).await.unwrap();

    device.send(&standard_line(1, 1.0)).await;
    device.send(&standard_line(2, 1.0)).await;
    device.send("FIELDS 19").await;
    device.send("1000,1,2,3,4,5,6,0.1,0.2,0.3,0.4,0.5,0.6,1,2,10,20,30,40").await;
    device.send("IDLE").await;
    pump(&mut session, 5).await;

    assert_eq!(session.state(), SessionState::ConnectedIdle);
    let exports = exporter.exports.lock().unwrap();
    assert_eq!(exports.len(), 2);
    assert_eq!(exports[0].layout, TelemetryLayout::Standard);
    assert_eq!(exports[0].rows.len(), 2);
    assert_eq!(exports[1].layout, TelemetryLayout::Compact);
    assert_eq!(exports[1].rows.len(), 1);
}
