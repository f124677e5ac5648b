//! Stand configuration
//!
//! Persisted as pretty-printed JSON. Every field has a default, so a partial
//! file (or none at all) yields a usable configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::params::{Calibration, ControlParameters, PidParameters, Setpoints};
use crate::protocol::ConnectionConfig;
use crate::safety::SafetyLimits;
use crate::telemetry::TelemetryLayout;
use crate::unit_conversion::PressureUnit;

/// Configuration file name inside the config directory
pub const CONFIG_FILE_NAME: &str = "stand.json";

/// Everything needed to run a session against one stand
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StandConfig {
    /// Serial link
    pub connection: ConnectionConfig,
    /// Telemetry layout assumed until the device declares one
    pub layout: TelemetryLayout,
    /// Unit of the pressure columns in telemetry
    pub pressure_unit: PressureUnit,
    /// Differential-pressure interlock
    pub safety: SafetyLimits,
    /// Calibration offered to the operator
    pub calibration: Calibration,
    /// PID gains offered to the operator
    pub pid: PidParameters,
    /// Valve setpoints offered to the operator
    pub setpoints: Setpoints,
    /// Directory exports are written to
    pub export_dir: PathBuf,
}

impl Default for StandConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            layout: TelemetryLayout::default(),
            pressure_unit: PressureUnit::default(),
            safety: SafetyLimits::default(),
            calibration: Calibration::default(),
            pid: PidParameters::default(),
            setpoints: Setpoints::default(),
            export_dir: PathBuf::from("."),
        }
    }
}

impl StandConfig {
    /// `<config dir>/zephyr/stand.json`, when the platform has a config directory
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("zephyr").join(CONFIG_FILE_NAME))
    }

    /// Read a config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Read a config file, falling back to defaults when it does not exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write the config, creating parent directories
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Safety limits in the telemetry pressure unit
    pub fn safety_limits(&self) -> SafetyLimits {
        self.safety.converted_to(self.pressure_unit)
    }

    /// Configured parameter defaults as one set
    pub fn parameters(&self) -> ControlParameters {
        ControlParameters {
            setpoints: self.setpoints,
            pid: self.pid,
            calibration: self.calibration,
        }
    }
}
