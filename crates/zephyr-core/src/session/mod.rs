//! Session state machine
//!
//! A [`Session`] is one control run over a single connection. It owns the
//! transport's write half, the telemetry store, the safety interlock and the
//! exporter, and it is the only thing that mutates the store.
//!
//! Inbound traffic is consumed cooperatively: [`Session::recv`] waits for the
//! next item from the reader task and is cancel-safe, so it can sit in a
//! `tokio::select!` next to stdin or Ctrl-C; [`Session::process`] applies the
//! item and belongs in the select arm body.

mod oplog;

pub use oplog::{LogLevel, LogLine, OperatorLog};

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::config::StandConfig;
use crate::export::{export_file_name, ExportError, SessionExporter};
use crate::params::{
    Calibration, ControlParameters, ParameterValidationError, PidParameters, Setpoints,
};
use crate::protocol::commands::UPDATE_K_VALUES;
use crate::protocol::{
    ActiveCommand, Command, Frame, FrameError, Inbound, LineTransport, ProtocolError, StandStream,
    StatusMessage,
};
use crate::safety::{SafetyAction, SafetyMonitor, SafetyVerdict};
use crate::telemetry::{TelemetryLayout, TelemetryRecord, TelemetryStore};

/// How long [`Session::run_until_idle`] waits per receive
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Pending events kept for [`Session::next_event`]; older ones are dropped
const MAX_PENDING_EVENTS: usize = 4096;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    ConnectedIdle,
    TestingConnection,
    TuningPid,
    Igniting,
    /// IDLE requested, waiting for the device to confirm
    ShuttingDown,
}

impl SessionState {
    fn for_command(command: ActiveCommand) -> Self {
        match command {
            ActiveCommand::TestConnection => SessionState::TestingConnection,
            ActiveCommand::PidTuneTest => SessionState::TuningPid,
            ActiveCommand::Ignition => SessionState::Igniting,
        }
    }

    /// A device sequence is running
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::TestingConnection | SessionState::TuningPid | SessionState::Igniting
        )
    }

    /// Active or shutting down: telemetry belongs to the current run
    pub fn is_running(&self) -> bool {
        self.is_active() || *self == SessionState::ShuttingDown
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "Disconnected",
            SessionState::ConnectedIdle => "Connected (idle)",
            SessionState::TestingConnection => "Testing connection",
            SessionState::TuningPid => "PID tuning",
            SessionState::Igniting => "Ignition",
            SessionState::ShuttingDown => "Shutting down",
        };
        write!(f, "{}", name)
    }
}

/// Something the operator surface may want to show
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// A record was stored
    Telemetry(TelemetryRecord),
    /// A step of the running command's sequence
    Progress(StatusMessage),
    /// Any other status line
    Status(StatusMessage),
    SafetyTrip(SafetyVerdict),
    Exported(PathBuf),
    ExportFailed(String),
    FrameDiscarded {
        line: String,
        error: FrameError,
    },
    Disconnected(String),
}

/// Errors returned by session operations
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Connection(#[from] ProtocolError),

    #[error("{operation} is not allowed while {state}")]
    IllegalState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("Invalid parameters: {0}")]
    Parameters(#[from] ParameterValidationError),

    #[error("Export failed: {0}")]
    Export(#[from] ExportError),

    #[error("{operation} aborted by a safety trip")]
    SafetyAbort { operation: &'static str },
}

/// One control run over one connection
pub struct Session {
    id: Uuid,
    config: StandConfig,
    state: SessionState,
    transport: Option<LineTransport>,
    store: TelemetryStore,
    safety: SafetyMonitor,
    exporter: Box<dyn SessionExporter>,
    /// Last parameter sets sent (configured defaults until then)
    parameters: ControlParameters,
    log: OperatorLog,
    active: Option<ActiveCommand>,
    /// IDLE was the last command written
    idle_sent: bool,
    /// The current segment belongs to a run that has not been exported
    export_pending: bool,
    events: VecDeque<SessionEvent>,
}

impl Session {
    /// Create a disconnected session
    pub fn new(config: StandConfig, exporter: Box<dyn SessionExporter>) -> Self {
        Self {
            id: Uuid::new_v4(),
            store: TelemetryStore::new(config.layout),
            safety: SafetyMonitor::new(config.safety_limits()),
            parameters: config.parameters(),
            config,
            state: SessionState::Disconnected,
            transport: None,
            exporter,
            log: OperatorLog::new(),
            active: None,
            idle_sent: false,
            export_pending: false,
            events: VecDeque::new(),
        }
    }

    /// Open the configured serial port
    #[instrument(name = "session", skip_all, fields(id = %self.id))]
    pub async fn initialize(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Disconnected {
            return Err(ProtocolError::AlreadyConnected.into());
        }
        self.log.info(format!(
            "Opening {} at {} baud",
            self.config.connection.port_name, self.config.connection.baud_rate
        ));
        match LineTransport::open(&self.config.connection, self.config.layout).await {
            Ok(transport) => self.attach(transport),
            Err(e) => {
                self.log.error(format!("Connection failed: {}", e));
                Err(e.into())
            }
        }
    }

    /// Start a session over an already-open transport
    pub fn attach(&mut self, transport: LineTransport) -> Result<(), SessionError> {
        if self.state != SessionState::Disconnected {
            return Err(ProtocolError::AlreadyConnected.into());
        }
        self.id = Uuid::new_v4();
        self.transport = Some(transport);
        self.store = TelemetryStore::new(self.config.layout);
        self.safety = SafetyMonitor::new(self.config.safety_limits());
        self.active = None;
        self.idle_sent = false;
        self.export_pending = false;
        self.log.info(format!("Session {} started", self.id));
        self.set_state(SessionState::ConnectedIdle);
        Ok(())
    }

    /// Start a session over any byte stream. Must be called inside a Tokio runtime.
    pub fn attach_stream<S: StandStream>(&mut self, stream: S) -> Result<(), SessionError> {
        if self.state != SessionState::Disconnected {
            return Err(ProtocolError::AlreadyConnected.into());
        }
        let transport = LineTransport::from_stream(stream, self.config.layout);
        self.attach(transport)
    }

    /// Start a device sequence
    #[instrument(name = "session", skip_all, fields(id = %self.id))]
    pub async fn begin(&mut self, command: ActiveCommand) -> Result<(), SessionError> {
        self.require_idle("begin")?;
        self.store.begin_segment();
        self.safety.rearm();
        self.write(&Command::Begin(command).line()).await?;
        self.idle_sent = false;
        self.active = Some(command);
        self.export_pending = true;
        self.log.info(format!("Sent {}", command.word()));
        self.set_state(SessionState::for_command(command));
        Ok(())
    }

    /// Send valve setpoints
    #[instrument(name = "session", skip_all, fields(id = %self.id))]
    pub async fn send_setpoints(&mut self, setpoints: Setpoints) -> Result<(), SessionError> {
        self.require_idle("send_setpoints")?;
        setpoints.validate()?;
        self.write(&Command::UpdateSetpoints(setpoints).line())
            .await?;
        self.idle_sent = false;
        self.parameters.setpoints = setpoints;
        self.log
            .info(format!("Setpoints sent: {}", setpoints.to_wire()));
        Ok(())
    }

    /// Send calibration; rejected before anything is written if invalid
    #[instrument(name = "session", skip_all, fields(id = %self.id))]
    pub async fn send_calibration(&mut self, calibration: Calibration) -> Result<(), SessionError> {
        self.require_idle("send_calibration")?;
        calibration.validate()?;
        self.write(&Command::UpdateCalibration(calibration).line())
            .await?;
        self.idle_sent = false;
        self.parameters.calibration = calibration;
        self.log
            .info(format!("Calibration sent: {}", calibration.to_wire()));
        Ok(())
    }

    /// Send PID gains.
    ///
    /// Writes the mode word, waits for the device to acknowledge it, then
    /// writes the six gains. Items arriving meanwhile are processed normally;
    /// if one of them trips the interlock the gains are never written.
    #[instrument(name = "session", skip_all, fields(id = %self.id))]
    pub async fn send_k_values(&mut self, pid: PidParameters) -> Result<(), SessionError> {
        self.require_idle("send_k_values")?;
        pid.validate()?;
        let command = Command::UpdateKValues(pid);
        let mode = command.awaits_ack().unwrap_or(UPDATE_K_VALUES);

        self.write(&command.line()).await?;
        self.idle_sent = false;

        let deadline =
            Instant::now() + Duration::from_millis(self.config.connection.ack_timeout_ms);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.log
                    .warn(format!("No acknowledgement for {}, gains not sent", mode));
                return Err(ProtocolError::Timeout(format!("'State set to {}'", mode)).into());
            }
            let Some(item) = self.recv(remaining).await else {
                continue;
            };
            let acked = matches!(
                &item,
                Inbound::Frame(Frame::Status(StatusMessage::StateSet(m))) if m == mode
            );
            self.process(item).await?;
            if self.idle_sent {
                // The device now reads our IDLE as the gains line
                self.log
                    .warn(format!("{} abandoned after safety trip", mode));
                return Err(SessionError::SafetyAbort {
                    operation: "send_k_values",
                });
            }
            if acked {
                break;
            }
        }

        if let Some(payload) = command.payload_line() {
            self.write(&payload).await?;
        }
        self.parameters.pid = pid;
        self.log.info(format!("PID gains sent: {}", pid.to_wire()));
        Ok(())
    }

    /// Wait up to `timeout` for the next inbound item. Cancel-safe.
    pub async fn recv(&mut self, timeout: Duration) -> Option<Inbound> {
        match self.transport.as_mut() {
            Some(transport) => transport.recv(timeout).await,
            None => {
                tokio::time::sleep(timeout).await;
                None
            }
        }
    }

    /// Apply one inbound item.
    ///
    /// A safety trip writes IDLE before this returns, so the next record is
    /// never processed ahead of the interlock.
    #[instrument(name = "session", skip_all, fields(id = %self.id))]
    pub async fn process(&mut self, inbound: Inbound) -> Result<(), SessionError> {
        match inbound {
            Inbound::Frame(Frame::Telemetry(record)) => self.on_telemetry(record).await,
            Inbound::Frame(Frame::Status(status)) => {
                self.on_status(status);
                Ok(())
            }
            Inbound::Malformed { line, error } => {
                self.log
                    .warn(format!("Discarded frame ({}): {}", error, line.trim()));
                self.push_event(SessionEvent::FrameDiscarded { line, error });
                Ok(())
            }
            Inbound::Closed(reason) => Err(self.connection_lost(ProtocolError::Closed(reason))),
        }
    }

    /// Receive and process at most one item; returns whether one arrived
    pub async fn poll_once(&mut self, timeout: Duration) -> Result<bool, SessionError> {
        match self.recv(timeout).await {
            Some(item) => {
                self.process(item).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Process traffic until the running sequence ends.
    ///
    /// Cancelling `cancel` shuts the session down instead.
    pub async fn run_until_idle(&mut self, cancel: &CancellationToken) -> Result<(), SessionError> {
        while self.state.is_running() {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    self.log.warn("Cancelled, shutting down");
                    return self.shutdown().await;
                }

                item = self.recv(POLL_INTERVAL) => {
                    if let Some(item) = item {
                        self.process(item).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Bring the stand back to idle and export the running segment.
    ///
    /// Idempotent: repeated calls write IDLE and export at most once.
    #[instrument(name = "session", skip_all, fields(id = %self.id))]
    pub async fn shutdown(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Disconnected => Ok(()),
            SessionState::ConnectedIdle => {
                if !self.idle_sent {
                    self.write_idle().await?;
                    self.log.info("Sent IDLE");
                }
                Ok(())
            }
            _ => {
                if !self.idle_sent {
                    self.write_idle().await?;
                    self.log.info("Shutdown requested, sent IDLE");
                }
                self.set_state(SessionState::ShuttingDown);

                // Everything already received belongs to this run
                while let Some(item) = self.transport.as_mut().and_then(|t| t.try_recv()) {
                    self.process(item).await?;
                }

                if self.state.is_running() {
                    self.finish_run();
                }
                Ok(())
            }
        }
    }

    /// Shut down, then release the connection
    #[instrument(name = "session", skip_all, fields(id = %self.id))]
    pub async fn close(&mut self) -> Result<(), SessionError> {
        let result = self.shutdown().await;
        if let Some(transport) = self.transport.take() {
            transport.close().await;
            self.log.info("Connection closed");
        }
        self.active = None;
        self.set_state(SessionState::Disconnected);
        result
    }

    /// Export the current segment again, e.g. after a failed export
    pub fn retry_export(&mut self) -> Result<PathBuf, SessionError> {
        if self.state.is_running() {
            return Err(SessionError::IllegalState {
                operation: "export",
                state: self.state,
            });
        }
        Ok(self.export_segment()?)
    }

    /// Take the oldest pending event
    pub fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    /// Take every pending event
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain(..).collect()
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &StandConfig {
        &self.config
    }

    pub fn store(&self) -> &TelemetryStore {
        &self.store
    }

    pub fn log(&self) -> &OperatorLog {
        &self.log
    }

    /// Parameter sets last sent
    pub fn parameters(&self) -> ControlParameters {
        self.parameters
    }

    /// Command whose sequence is running
    pub fn active_command(&self) -> Option<ActiveCommand> {
        self.active
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    fn require_idle(&self, operation: &'static str) -> Result<(), SessionError> {
        if self.state == SessionState::ConnectedIdle {
            Ok(())
        } else {
            Err(SessionError::IllegalState {
                operation,
                state: self.state,
            })
        }
    }

    async fn write(&mut self, line: &str) -> Result<(), SessionError> {
        let transport = self.transport.as_mut().ok_or(ProtocolError::NotConnected)?;
        if let Err(e) = transport.write_line(line).await {
            return Err(self.connection_lost(e));
        }
        Ok(())
    }

    async fn write_idle(&mut self) -> Result<(), SessionError> {
        self.write(&Command::Idle.line()).await?;
        self.idle_sent = true;
        Ok(())
    }

    async fn on_telemetry(&mut self, record: TelemetryRecord) -> Result<(), SessionError> {
        let action = self.safety.observe(&record);

        if self.state.is_running() {
            self.store.append(record.clone());
            self.push_event(SessionEvent::Telemetry(record));
        }

        if let SafetyAction::Trip(verdict) = action {
            self.trip(verdict).await?;
        }
        Ok(())
    }

    async fn trip(&mut self, verdict: SafetyVerdict) -> Result<(), SessionError> {
        if let SafetyVerdict::Violation {
            channel,
            value,
            limit,
        } = verdict
        {
            self.log.error(format!(
                "SAFETY TRIP: {} = {} exceeds limit {}, sending IDLE",
                channel, value, limit
            ));
        }
        self.push_event(SessionEvent::SafetyTrip(verdict));
        self.write_idle().await?;
        if self.state.is_active() {
            self.set_state(SessionState::ShuttingDown);
        }
        Ok(())
    }

    fn on_status(&mut self, status: StatusMessage) {
        match &status {
            StatusMessage::LayoutDeclared(count) => {
                match TelemetryLayout::from_field_count(*count) {
                    Some(layout) => {
                        if layout != self.store.layout() {
                            // Records before the switch go out in their own file
                            if self.export_pending && !self.store.segment().is_empty() {
                                self.export_segment().ok();
                            }
                            self.store.set_layout(layout);
                        }
                        self.log.info(format!(
                            "Device declared {} telemetry fields ({:?} layout)",
                            count, layout
                        ));
                    }
                    None => self.log.warn(format!(
                        "Device declared unknown field count {}, ignored",
                        count
                    )),
                }
            }
            StatusMessage::Idle if self.state.is_running() => {
                self.log.info("Device returned to IDLE");
                self.finish_run();
            }
            StatusMessage::EmergencyShutdown if self.state.is_running() => {
                self.log.error("Device reported EMERGENCY_SHUTDOWN");
                self.set_state(SessionState::ShuttingDown);
            }
            _ => self.log.info(format!("Device: {}", status)),
        }

        let is_progress = self
            .active
            .map_or(false, |command| command.is_progress(&status));
        self.push_event(if is_progress {
            SessionEvent::Progress(status)
        } else {
            SessionEvent::Status(status)
        });
    }

    fn finish_run(&mut self) {
        if self.export_pending {
            self.export_pending = false;
            // Failure is logged; the segment stays for retry_export
            self.export_segment().ok();
        }
        self.active = None;
        self.set_state(SessionState::ConnectedIdle);
    }

    fn export_segment(&mut self) -> Result<PathBuf, ExportError> {
        let hint = export_file_name(&Local::now());
        let layout = self.store.segment_layout();
        let rows = self.store.segment();
        match self.exporter.export(layout, rows, &hint) {
            Ok(path) => {
                self.log.info(format!(
                    "Exported {} records to {}",
                    rows.len(),
                    path.display()
                ));
                self.push_event(SessionEvent::Exported(path.clone()));
                Ok(path)
            }
            Err(e) => {
                self.log.warn(format!("Export failed: {}", e));
                self.push_event(SessionEvent::ExportFailed(e.to_string()));
                Err(e)
            }
        }
    }

    fn connection_lost(&mut self, error: ProtocolError) -> SessionError {
        self.log.error(format!("Connection lost: {}", error));
        if self.export_pending {
            self.export_pending = false;
            self.export_segment().ok();
        }
        self.transport = None;
        self.active = None;
        self.set_state(SessionState::Disconnected);
        self.push_event(SessionEvent::Disconnected(error.to_string()));
        SessionError::Connection(error)
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        let previous = std::mem::replace(&mut self.state, next);
        self.log.info(format!("State: {} -> {}", previous, next));
        self.push_event(SessionEvent::StateChanged {
            from: previous,
            to: next,
        });
    }

    fn push_event(&mut self, event: SessionEvent) {
        if self.events.len() >= MAX_PENDING_EVENTS {
            self.events.pop_front();
            debug!("event queue full, dropped oldest");
        }
        self.events.push_back(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::CsvExporter;
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn session() -> Session {
        let dir = std::env::temp_dir().join("zephyr-session-unit");
        Session::new(StandConfig::default(), Box::new(CsvExporter::new(dir)))
    }

    #[test]
    fn test_state_predicates() {
        assert!(SessionState::Igniting.is_active());
        assert!(!SessionState::ShuttingDown.is_active());
        assert!(SessionState::ShuttingDown.is_running());
        assert!(!SessionState::ConnectedIdle.is_running());
        assert_eq!(SessionState::TuningPid.to_string(), "PID tuning");
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let mut session = session();
        let err = session.begin(ActiveCommand::Ignition).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::IllegalState {
                operation: "begin",
                state: SessionState::Disconnected
            }
        ));
        // Shutting down a disconnected session is a no-op
        session.shutdown().await.unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_begin_writes_command() {
        let (host, device) = tokio::io::duplex(1024);
        let mut session = session();
        session.attach_stream(host).unwrap();
        assert_eq!(session.state(), SessionState::ConnectedIdle);

        session.begin(ActiveCommand::PidTuneTest).await.unwrap();
        assert_eq!(session.state(), SessionState::TuningPid);
        assert_eq!(session.active_command(), Some(ActiveCommand::PidTuneTest));

        let mut lines = BufReader::new(device).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "PID_TUNE_TEST");

        let err = session.begin(ActiveCommand::Ignition).await.unwrap_err();
        assert!(matches!(err, SessionError::IllegalState { .. }));
    }

    #[tokio::test]
    async fn test_attach_twice_rejected() {
        let (a, _da) = tokio::io::duplex(64);
        let (b, _db) = tokio::io::duplex(64);
        let mut session = session();
        session.attach_stream(a).unwrap();
        assert!(matches!(
            session.attach_stream(b),
            Err(SessionError::Connection(ProtocolError::AlreadyConnected))
        ));
    }

    #[tokio::test]
    async fn test_invalid_calibration_writes_nothing() {
        let (host, device) = tokio::io::duplex(1024);
        let mut session = session();
        session.attach_stream(host).unwrap();

        let inverted = Calibration {
            v_min: 4.5,
            v_max: 0.5,
            ..Calibration::default()
        };
        assert!(matches!(
            session.send_calibration(inverted).await,
            Err(SessionError::Parameters(_))
        ));

        session.close().await.unwrap();
        let mut lines = BufReader::new(device).lines();
        // close() from idle sends IDLE; the calibration never went out
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "IDLE");
        assert_eq!(lines.next_line().await.unwrap(), None);
    }
}
