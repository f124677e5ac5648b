//! Demo Mode - simulated test stand firmware
//!
//! Speaks the stand's line protocol over an in-memory duplex stream so the
//! console and the tests can run without hardware. Streams standard-layout
//! telemetry every tick while a sequence runs, with smoothed valve response
//! and random sensor noise.

use futures::{SinkExt, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, warn};

use crate::protocol::commands::UPDATE_K_VALUES;
use crate::protocol::MAX_LINE_LENGTH;
use crate::telemetry::TelemetryLayout;

/// Buffer size of the in-memory link
const DUPLEX_CAPACITY: usize = 64 * 1024;

/// Atmospheric pressure in kPa
const AMBIENT_KPA: f64 = 101.3;

/// Nominal differential pressures at full throttle (fuel, oxidizer)
const NOMINAL_DP: [f64; 2] = [8.0, 60.0];

/// Simulation settings
#[derive(Debug, Clone)]
pub struct DemoStandConfig {
    /// Telemetry period
    pub tick: Duration,
    /// RNG seed; random when `None`
    pub seed: Option<u64>,
    /// Length of each sequence phase in ticks
    pub phase_ticks: u64,
    /// Run tick at which dP0 spikes to 20 kPa
    pub fault_at_tick: Option<u64>,
    /// Run tick at which the firmware aborts with EMERGENCY_SHUTDOWN
    pub emergency_at_tick: Option<u64>,
    /// Keep streaming telemetry while idle
    pub idle_telemetry: bool,
}

impl Default for DemoStandConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(50),
            seed: None,
            phase_ticks: 40,
            fault_at_tick: None,
            emergency_at_tick: None,
            idle_telemetry: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Idle,
    TestConnection,
    PidTune,
    Ignition,
}

/// Simulated stand firmware
pub struct DemoStand {
    config: DemoStandConfig,
    mode: Mode,
    /// Ticks since the current sequence started
    run_tick: u64,
    /// Sample index, never reset
    index: u64,
    /// Smoothed valve opening, 0..1
    throttle: f64,
    awaiting_k_values: bool,
    setpoints: [f64; 2],
    pid: [f64; 6],
    calibration: [f64; 5],
    rng: StdRng,
}

impl DemoStand {
    pub fn new(config: DemoStandConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            mode: Mode::Idle,
            run_tick: 0,
            index: 0,
            throttle: 0.0,
            awaiting_k_values: false,
            setpoints: [50.0, 50.0],
            pid: [1.0, 0.0, 0.0, 1.0, 0.0, 0.0],
            calibration: [0.5, 4.5, 0.0, 1000.0, 5.0],
            rng,
        }
    }

    /// Whether a sequence is running
    pub fn is_running(&self) -> bool {
        self.mode != Mode::Idle
    }

    /// Setpoints last received
    pub fn setpoints(&self) -> [f64; 2] {
        self.setpoints
    }

    /// Gains last received
    pub fn pid_gains(&self) -> [f64; 6] {
        self.pid
    }

    /// Calibration last received
    pub fn calibration(&self) -> [f64; 5] {
        self.calibration
    }

    /// Handle one command line; returns the lines to send back
    pub fn handle_line(&mut self, line: &str) -> Vec<String> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }

        // The gains follow the mode word on their own line
        if self.awaiting_k_values {
            self.awaiting_k_values = false;
            return match parse_values::<6>(line) {
                Some(gains) => {
                    self.pid = gains;
                    vec!["K values updated".to_string()]
                }
                None => vec!["Invalid K values".to_string()],
            };
        }

        match line {
            "TEST_CONNECTION" => {
                self.start(Mode::TestConnection);
                vec![
                    format!("FIELDS {}", TelemetryLayout::Standard.field_count()),
                    "TESTINGCONNECTION complete".to_string(),
                ]
            }
            "PID_TUNE_TEST" => {
                self.start(Mode::PidTune);
                Vec::new()
            }
            "IGNITION" => {
                self.start(Mode::Ignition);
                vec!["IGNITION".to_string()]
            }
            "IDLE" => {
                self.mode = Mode::Idle;
                vec!["IDLE".to_string()]
            }
            UPDATE_K_VALUES => {
                self.awaiting_k_values = true;
                vec![format!("State set to {}", UPDATE_K_VALUES)]
            }
            _ => {
                if let Some(rest) = line.strip_prefix("UPDATESETPOINTS,") {
                    return match parse_values::<2>(rest) {
                        Some(sp) => {
                            self.setpoints = sp;
                            vec!["Setpoints updated".to_string()]
                        }
                        None => vec!["Invalid setpoints".to_string()],
                    };
                }
                if let Some(rest) = line.strip_prefix("UPDATE_CALIBRATION,") {
                    return match parse_values::<5>(rest) {
                        Some(cal) => {
                            self.calibration = cal;
                            vec!["Calibration updated".to_string()]
                        }
                        None => vec!["Invalid calibration".to_string()],
                    };
                }
                vec![format!("Unknown command: {}", line)]
            }
        }
    }

    /// Advance one period; returns the lines to send
    pub fn tick(&mut self) -> Vec<String> {
        let mut out = Vec::new();

        if self.mode == Mode::Idle {
            self.update_throttle(0.0);
            if self.config.idle_telemetry {
                out.push(self.telemetry_line(false));
            }
            return out;
        }

        self.run_tick += 1;

        if self.config.emergency_at_tick == Some(self.run_tick) {
            self.mode = Mode::Idle;
            out.push("EMERGENCY_SHUTDOWN".to_string());
            out.push("IDLE".to_string());
            return out;
        }

        let target = self.target_throttle();
        self.update_throttle(target);
        let fault = self.config.fault_at_tick == Some(self.run_tick);
        out.push(self.telemetry_line(fault));

        let phase = self.config.phase_ticks.max(1);
        match self.mode {
            Mode::TestConnection if self.run_tick >= phase => {
                self.mode = Mode::Idle;
                out.push("IDLE".to_string());
            }
            Mode::PidTune if self.run_tick >= phase => {
                self.mode = Mode::Idle;
                out.push("PID_DONE".to_string());
                out.push("IDLE".to_string());
            }
            Mode::Ignition if self.run_tick == phase => out.push("THRUSTING".to_string()),
            Mode::Ignition if self.run_tick == 2 * phase => out.push("COOLING".to_string()),
            Mode::Ignition if self.run_tick >= 3 * phase => {
                self.mode = Mode::Idle;
                out.push("IDLE".to_string());
            }
            _ => {}
        }
        out
    }

    fn start(&mut self, mode: Mode) {
        self.mode = mode;
        self.run_tick = 0;
    }

    /// Valve opening the current phase drives toward
    fn target_throttle(&self) -> f64 {
        let phase = self.config.phase_ticks.max(1);
        match self.mode {
            Mode::Idle | Mode::TestConnection => 0.0,
            // Step response for tuning
            Mode::PidTune => 0.5,
            Mode::Ignition if self.run_tick < phase => self.run_tick as f64 / phase as f64,
            Mode::Ignition if self.run_tick < 2 * phase => 1.0,
            Mode::Ignition => 0.0,
        }
    }

    fn update_throttle(&mut self, target: f64) {
        self.throttle += (target - self.throttle) * 0.3;
        self.throttle = self.throttle.clamp(0.0, 1.0);
    }

    fn noise(&mut self, amplitude: f64) -> f64 {
        self.rng.gen_range(-amplitude..=amplitude)
    }

    /// One standard-layout line:
    /// `Index,V0..V5,P0..P5,dP0,dP1,SV0,SV1,SP0,SP1,OP0,OP1,Elapsed`
    fn telemetry_line(&mut self, fault: bool) -> String {
        let t = self.throttle;
        let running = self.mode != Mode::Idle;

        let valves = [
            t * self.setpoints[0] + self.noise(0.2),
            t * self.setpoints[1] + self.noise(0.2),
            if running { 100.0 } else { 0.0 },
            0.0,
            0.0,
            if running { 0.0 } else { 100.0 },
        ];

        let mut dp = [
            t * NOMINAL_DP[0] + self.noise(0.3),
            t * NOMINAL_DP[1] + self.noise(1.5),
        ];
        if fault {
            dp[0] = 20.0;
        }

        let fuel_tank = 2500.0 + self.noise(5.0);
        let ox_tank = 4000.0 + self.noise(5.0);
        let chamber = AMBIENT_KPA + t * 1500.0 + self.noise(3.0);
        let pressures = [
            fuel_tank,
            ox_tank,
            fuel_tank - dp[0],
            ox_tank - dp[1],
            chamber,
            AMBIENT_KPA + self.noise(0.5),
        ];

        let setpoint_dp = if running { NOMINAL_DP } else { [0.0, 0.0] };
        let output = [
            (self.pid[0] * (setpoint_dp[0] - dp[0]) + t * 100.0).clamp(0.0, 100.0),
            (self.pid[3] * (setpoint_dp[1] - dp[1]) + t * 100.0).clamp(0.0, 100.0),
        ];

        let elapsed_ms = self.run_tick * self.config.tick.as_millis() as u64;
        let index = self.index;
        self.index += 1;

        let mut fields = Vec::with_capacity(TelemetryLayout::Standard.field_count());
        fields.push(index.to_string());
        fields.extend(
            valves
                .iter()
                .chain(&pressures)
                .chain(&dp)
                .chain(&self.setpoints)
                .chain(&setpoint_dp)
                .chain(&output)
                .map(|v| format!("{:.2}", v)),
        );
        fields.push(elapsed_ms.to_string());
        fields.join(",")
    }
}

fn parse_values<const N: usize>(text: &str) -> Option<[f64; N]> {
    let mut out = [0.0; N];
    let mut tokens = text.split(',');
    for slot in out.iter_mut() {
        *slot = tokens
            .next()?
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())?;
    }
    if tokens.next().is_some() {
        return None;
    }
    Some(out)
}

/// Run a simulated stand on a new in-memory link.
///
/// Returns the host end of the link. The stand stops when the host end is dropped.
pub fn spawn_demo_stand(config: DemoStandConfig) -> (DuplexStream, JoinHandle<()>) {
    let (host, device) = tokio::io::duplex(DUPLEX_CAPACITY);
    let handle = tokio::spawn(serve(DemoStand::new(config), device));
    (host, handle)
}

async fn serve(mut stand: DemoStand, stream: DuplexStream) {
    let (read_half, write_half) = tokio::io::split(stream);
    let mut commands = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let mut out = FramedWrite::new(write_half, LinesCodec::new());

    let mut ticker = tokio::time::interval(stand.config.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let lines = tokio::select! {
            command = commands.next() => match command {
                Some(Ok(line)) => {
                    debug!(line = %line, "demo stand rx");
                    stand.handle_line(&line)
                }
                Some(Err(e)) => {
                    warn!(error = %e, "demo stand read failed");
                    return;
                }
                None => {
                    debug!("host closed the demo link");
                    return;
                }
            },
            _ = ticker.tick() => stand.tick(),
        };

        for line in lines {
            if out.send(line).await.is_err() {
                return;
            }
        }
    }
}
