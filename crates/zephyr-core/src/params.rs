//! Control parameters
//!
//! Setpoints, PID gains and sensor calibration sent to the stand. Each set is a
//! plain `Copy` value: a send captures the values at the moment it is called,
//! and the whole set is replaced on every update.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Operator input that cannot be sent
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParameterValidationError {
    #[error("{field}: '{input}' is not a number")]
    NotNumeric { field: &'static str, input: String },

    #[error("{field}: value must be finite")]
    NotFinite { field: &'static str },

    #[error("expected {expected} values, got {actual}")]
    WrongCount { expected: usize, actual: usize },

    #[error("{field}: {message}")]
    InvalidRange { field: &'static str, message: String },
}

/// Parse one operator-entered field
pub fn parse_field(field: &'static str, input: &str) -> Result<f64, ParameterValidationError> {
    let value = input
        .trim()
        .parse::<f64>()
        .map_err(|_| ParameterValidationError::NotNumeric {
            field,
            input: input.to_string(),
        })?;
    if !value.is_finite() {
        return Err(ParameterValidationError::NotFinite { field });
    }
    Ok(value)
}

fn parse_fields<const N: usize>(
    names: [&'static str; N],
    inputs: &[&str],
) -> Result<[f64; N], ParameterValidationError> {
    if inputs.len() != N {
        return Err(ParameterValidationError::WrongCount {
            expected: N,
            actual: inputs.len(),
        });
    }
    let mut out = [0.0; N];
    for (i, (name, input)) in names.iter().zip(inputs).enumerate() {
        out[i] = parse_field(name, input)?;
    }
    Ok(out)
}

fn check_finite(fields: &[(&'static str, f64)]) -> Result<(), ParameterValidationError> {
    match fields.iter().find(|(_, value)| !value.is_finite()) {
        Some((field, _)) => Err(ParameterValidationError::NotFinite { field }),
        None => Ok(()),
    }
}

fn join(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Valve setpoints
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Setpoints {
    /// Fuel valve setpoint
    pub valve_1: f64,
    /// Oxidizer valve setpoint
    pub valve_2: f64,
}

impl Setpoints {
    /// Parse `[v1, v2]` operator input
    pub fn parse(inputs: &[&str]) -> Result<Self, ParameterValidationError> {
        let [valve_1, valve_2] = parse_fields(["valve_1", "valve_2"], inputs)?;
        Ok(Self { valve_1, valve_2 })
    }

    /// Reject values that cannot go on the wire
    pub fn validate(&self) -> Result<(), ParameterValidationError> {
        check_finite(&[("valve_1", self.valve_1), ("valve_2", self.valve_2)])
    }

    /// Comma-separated wire form
    pub fn to_wire(&self) -> String {
        join(&[self.valve_1, self.valve_2])
    }
}

/// Gains of one PID loop
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

/// PID gains for both propellant channels
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PidParameters {
    /// Fuel channel
    pub fuel: PidGains,
    /// Oxidizer channel
    pub oxidizer: PidGains,
}

impl PidParameters {
    /// Parse `[kp1, ki1, kd1, kp2, ki2, kd2]` operator input
    pub fn parse(inputs: &[&str]) -> Result<Self, ParameterValidationError> {
        let [kp1, ki1, kd1, kp2, ki2, kd2] =
            parse_fields(["kp1", "ki1", "kd1", "kp2", "ki2", "kd2"], inputs)?;
        Ok(Self {
            fuel: PidGains {
                kp: kp1,
                ki: ki1,
                kd: kd1,
            },
            oxidizer: PidGains {
                kp: kp2,
                ki: ki2,
                kd: kd2,
            },
        })
    }

    /// Reject gains that cannot go on the wire
    pub fn validate(&self) -> Result<(), ParameterValidationError> {
        check_finite(&[
            ("kp1", self.fuel.kp),
            ("ki1", self.fuel.ki),
            ("kd1", self.fuel.kd),
            ("kp2", self.oxidizer.kp),
            ("ki2", self.oxidizer.ki),
            ("kd2", self.oxidizer.kd),
        ])
    }

    /// Comma-separated wire form (second line of the K-value handshake)
    pub fn to_wire(&self) -> String {
        join(&[
            self.fuel.kp,
            self.fuel.ki,
            self.fuel.kd,
            self.oxidizer.kp,
            self.oxidizer.ki,
            self.oxidizer.kd,
        ])
    }
}

/// Linear voltage-to-pressure calibration of the transducers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub v_min: f64,
    pub v_max: f64,
    pub p_min: f64,
    pub p_max: f64,
    /// ADC reference voltage
    pub v_ref: f64,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            v_min: 0.5,
            v_max: 4.5,
            p_min: 0.0,
            p_max: 1000.0,
            v_ref: 5.0,
        }
    }
}

impl Calibration {
    /// Parse `[v_min, v_max, p_min, p_max, v_ref]` operator input
    pub fn parse(inputs: &[&str]) -> Result<Self, ParameterValidationError> {
        let [v_min, v_max, p_min, p_max, v_ref] =
            parse_fields(["v_min", "v_max", "p_min", "p_max", "v_ref"], inputs)?;
        let calibration = Self {
            v_min,
            v_max,
            p_min,
            p_max,
            v_ref,
        };
        calibration.validate()?;
        Ok(calibration)
    }

    /// Check the map is usable
    pub fn validate(&self) -> Result<(), ParameterValidationError> {
        // NaN passes every ordering check below
        check_finite(&[
            ("v_min", self.v_min),
            ("v_max", self.v_max),
            ("p_min", self.p_min),
            ("p_max", self.p_max),
            ("v_ref", self.v_ref),
        ])?;
        if self.v_max <= self.v_min {
            return Err(ParameterValidationError::InvalidRange {
                field: "v_max",
                message: format!("must exceed v_min ({})", self.v_min),
            });
        }
        if self.p_max <= self.p_min {
            return Err(ParameterValidationError::InvalidRange {
                field: "p_max",
                message: format!("must exceed p_min ({})", self.p_min),
            });
        }
        if self.v_ref <= 0.0 {
            return Err(ParameterValidationError::InvalidRange {
                field: "v_ref",
                message: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Pressure for a transducer voltage
    pub fn pressure_from_voltage(&self, volts: f64) -> f64 {
        let span = (self.p_max - self.p_min) / (self.v_max - self.v_min);
        self.p_min + (volts - self.v_min) * span
    }

    /// Voltage for raw ADC counts at the given full-scale count
    pub fn voltage_from_counts(&self, counts: u32, full_scale: u32) -> f64 {
        if full_scale == 0 {
            return 0.0;
        }
        counts as f64 * self.v_ref / full_scale as f64
    }

    /// Comma-separated wire form
    pub fn to_wire(&self) -> String {
        join(&[self.v_min, self.v_max, self.p_min, self.p_max, self.v_ref])
    }
}

/// Every operator-adjustable parameter set
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlParameters {
    pub setpoints: Setpoints,
    pub pid: PidParameters,
    pub calibration: Calibration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_setpoints_parse() {
        let sp = Setpoints::parse(&["12.5", " 40 "]).unwrap();
        assert_eq!(
            sp,
            Setpoints {
                valve_1: 12.5,
                valve_2: 40.0
            }
        );
        assert_eq!(sp.to_wire(), "12.5,40");
    }

    #[test]
    fn test_non_numeric_rejected() {
        let err = PidParameters::parse(&["1", "2", "x", "4", "5", "6"]).unwrap_err();
        assert_eq!(
            err,
            ParameterValidationError::NotNumeric {
                field: "kd1",
                input: "x".to_string()
            }
        );
    }

    #[test]
    fn test_wrong_count_rejected() {
        let err = Setpoints::parse(&["1"]).unwrap_err();
        assert_eq!(
            err,
            ParameterValidationError::WrongCount {
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn test_infinite_rejected() {
        assert_eq!(
            parse_field("kp1", "inf").unwrap_err(),
            ParameterValidationError::NotFinite { field: "kp1" }
        );
    }

    #[test]
    fn test_validate_rejects_non_finite() {
        let cal = Calibration {
            v_min: f64::NAN,
            ..Calibration::default()
        };
        assert_eq!(
            cal.validate().unwrap_err(),
            ParameterValidationError::NotFinite { field: "v_min" }
        );

        let sp = Setpoints {
            valve_1: f64::INFINITY,
            valve_2: 1.0,
        };
        assert_eq!(
            sp.validate().unwrap_err(),
            ParameterValidationError::NotFinite { field: "valve_1" }
        );

        let mut pid = PidParameters::default();
        assert!(pid.validate().is_ok());
        pid.oxidizer.ki = f64::NEG_INFINITY;
        assert_eq!(
            pid.validate().unwrap_err(),
            ParameterValidationError::NotFinite { field: "ki2" }
        );
    }

    #[test]
    fn test_pid_wire_order() {
        let pid = PidParameters::parse(&["1", "0.5", "0.25", "2", "0.1", "0"]).unwrap();
        assert_eq!(pid.to_wire(), "1,0.5,0.25,2,0.1,0");
    }

    #[test]
    fn test_calibration_map() {
        let cal = Calibration::default();
        assert_eq!(cal.pressure_from_voltage(0.5), 0.0);
        assert_eq!(cal.pressure_from_voltage(4.5), 1000.0);
        assert_eq!(cal.pressure_from_voltage(2.5), 500.0);
        assert_eq!(cal.voltage_from_counts(1023, 1023), 5.0);
        assert_eq!(cal.voltage_from_counts(1, 0), 0.0);
    }

    #[test]
    fn test_calibration_inverted_range() {
        let err = Calibration::parse(&["4.5", "0.5", "0", "1000", "5"]).unwrap_err();
        assert!(matches!(
            err,
            ParameterValidationError::InvalidRange { field: "v_max", .. }
        ));
        assert_eq!(
            Calibration::parse(&["0.5", "4.5", "0", "1000", "5"])
                .unwrap()
                .to_wire(),
            "0.5,4.5,0,1000,5"
        );
    }
}
