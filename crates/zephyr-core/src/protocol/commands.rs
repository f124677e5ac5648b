//! Protocol commands
//!
//! Outbound command lines understood by the stand firmware.

use serde::{Deserialize, Serialize};

use super::StatusMessage;
use crate::params::{Calibration, PidParameters, Setpoints};

/// Mode word acknowledged before K values are sent
pub const UPDATE_K_VALUES: &str = "UPDATE_K_VALUES";

/// Commands that start a device sequence and run until the device returns to IDLE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActiveCommand {
    /// Connectivity test (`TEST_CONNECTION`)
    TestConnection,
    /// PID tuning sequence (`PID_TUNE_TEST`)
    PidTuneTest,
    /// Ignition sequence (`IGNITION`)
    Ignition,
}

impl ActiveCommand {
    /// Command word on the wire
    pub fn word(&self) -> &'static str {
        match self {
            ActiveCommand::TestConnection => "TEST_CONNECTION",
            ActiveCommand::PidTuneTest => "PID_TUNE_TEST",
            ActiveCommand::Ignition => "IGNITION",
        }
    }

    /// Whether `status` is an intermediate step of this command's sequence
    pub fn is_progress(&self, status: &StatusMessage) -> bool {
        match self {
            ActiveCommand::TestConnection => matches!(
                status,
                StatusMessage::ConnectionOk | StatusMessage::LayoutDeclared(_)
            ),
            ActiveCommand::PidTuneTest => matches!(status, StatusMessage::PidDone),
            ActiveCommand::Ignition => matches!(
                status,
                StatusMessage::Ignition | StatusMessage::Thrusting | StatusMessage::Cooling
            ),
        }
    }
}

/// An outbound command
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// Start a device sequence
    Begin(ActiveCommand),
    /// Force return to idle / abort
    Idle,
    /// `UPDATESETPOINTS,<v1>,<v2>`
    UpdateSetpoints(Setpoints),
    /// `UPDATE_K_VALUES` followed, after acknowledgement, by the six gains
    UpdateKValues(PidParameters),
    /// `UPDATE_CALIBRATION,<v_min>,<v_max>,<p_min>,<p_max>,<v_ref>`
    UpdateCalibration(Calibration),
}

impl Command {
    /// First line written for this command
    pub fn line(&self) -> String {
        match self {
            Command::Begin(active) => active.word().to_string(),
            Command::Idle => "IDLE".to_string(),
            Command::UpdateSetpoints(sp) => format!("UPDATESETPOINTS,{}", sp.to_wire()),
            Command::UpdateKValues(_) => UPDATE_K_VALUES.to_string(),
            Command::UpdateCalibration(cal) => format!("UPDATE_CALIBRATION,{}", cal.to_wire()),
        }
    }

    /// Second line, sent once the device acknowledges the mode
    pub fn payload_line(&self) -> Option<String> {
        match self {
            Command::UpdateKValues(pid) => Some(pid.to_wire()),
            _ => None,
        }
    }

    /// Mode the device must acknowledge before the payload line is sent
    pub fn awaits_ack(&self) -> Option<&'static str> {
        match self {
            Command::UpdateKValues(_) => Some(UPDATE_K_VALUES),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::PidGains;

    #[test]
    fn test_command_lines() {
        assert_eq!(Command::Begin(ActiveCommand::Ignition).line(), "IGNITION");
        assert_eq!(Command::Begin(ActiveCommand::PidTuneTest).line(), "PID_TUNE_TEST");
        assert_eq!(
            Command::Begin(ActiveCommand::TestConnection).line(),
            "TEST_CONNECTION"
        );
        assert_eq!(Command::Idle.line(), "IDLE");
        assert_eq!(
            Command::UpdateSetpoints(Setpoints {
                valve_1: 30.0,
                valve_2: 45.5
            })
            .line(),
            "UPDATESETPOINTS,30,45.5"
        );
        assert_eq!(
            Command::UpdateCalibration(Calibration::default()).line(),
            "UPDATE_CALIBRATION,0.5,4.5,0,1000,5"
        );
    }

    #[test]
    fn test_k_values_two_step() {
        let pid = PidParameters {
            fuel: PidGains {
                kp: 1.0,
                ki: 0.1,
                kd: 0.01,
            },
            oxidizer: PidGains {
                kp: 2.0,
                ki: 0.2,
                kd: 0.02,
            },
        };
        let cmd = Command::UpdateKValues(pid);
        assert_eq!(cmd.line(), "UPDATE_K_VALUES");
        assert_eq!(cmd.awaits_ack(), Some("UPDATE_K_VALUES"));
        assert_eq!(cmd.payload_line().unwrap(), "1,0.1,0.01,2,0.2,0.02");
        assert_eq!(Command::Idle.payload_line(), None);
    }

    #[test]
    fn test_progress_vocabulary() {
        let ignition = ActiveCommand::Ignition;
        assert!(ignition.is_progress(&StatusMessage::Thrusting));
        assert!(!ignition.is_progress(&StatusMessage::PidDone));
        assert!(!ignition.is_progress(&StatusMessage::Idle));
        assert!(ActiveCommand::PidTuneTest.is_progress(&StatusMessage::PidDone));
        assert!(ActiveCommand::TestConnection.is_progress(&StatusMessage::ConnectionOk));
    }
}
