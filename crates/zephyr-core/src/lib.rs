//! # Zephyr Core Library
//!
//! Host-side control of the Zephyr liquid engine test stand.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Serial line protocol to the stand firmware (commands, telemetry, status)
//! - Session state machine for connection tests, PID tuning and ignition runs
//! - Differential-pressure safety interlock
//! - Telemetry store and CSV export
//! - A simulated stand for running without hardware
//!
//! ## Example
//!
//! ```rust,ignore
//! use zephyr_core::prelude::*;
//!
//! let config = StandConfig::load_or_default("stand.json")?;
//! let exporter = CsvExporter::new(&config.export_dir);
//! let mut session = Session::new(config, Box::new(exporter));
//!
//! session.initialize().await?;
//! session.begin(ActiveCommand::Ignition).await?;
//! session.run_until_idle(&CancellationToken::new()).await?;
//! session.close().await?;
//! ```

pub mod config;
pub mod demo;
pub mod export;
pub mod params;
pub mod protocol;
pub mod safety;
pub mod session;
pub mod telemetry;
pub mod unit_conversion;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::StandConfig;
    pub use crate::demo::{spawn_demo_stand, DemoStandConfig};
    pub use crate::export::{CsvExporter, ExportError, SessionExporter};
    pub use crate::params::{Calibration, ControlParameters, PidGains, PidParameters, Setpoints};
    pub use crate::protocol::{ActiveCommand, ConnectionConfig, LineTransport, ProtocolError};
    pub use crate::safety::{SafetyLimits, SafetyMonitor, SafetyVerdict};
    pub use crate::session::{Session, SessionError, SessionEvent, SessionState};
    pub use crate::telemetry::{TelemetryLayout, TelemetryRecord, TelemetryStore};
    pub use crate::unit_conversion::PressureUnit;
    pub use tokio_util::sync::CancellationToken;
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
