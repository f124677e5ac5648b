//! Unit Conversion Functions
//!
//! Pressure conversions for stand deployments that report in kPa or PSI.

use serde::{Deserialize, Serialize};

/// Convert kPa to PSI
pub fn kpa_to_psi(kpa: f64) -> f64 {
    kpa * 0.14503773773020923
}

/// Convert PSI to kPa
pub fn psi_to_kpa(psi: f64) -> f64 {
    psi / 0.14503773773020923
}

/// Convert bar to PSI
pub fn bar_to_psi(bar: f64) -> f64 {
    bar * 14.503773773020923
}

/// Convert PSI to bar
pub fn psi_to_bar(psi: f64) -> f64 {
    psi / 14.503773773020923
}

/// Pressure unit a deployment reports in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureUnit {
    /// Kilopascal
    #[default]
    Kpa,
    /// Pounds per square inch
    Psi,
}

impl PressureUnit {
    /// Convert `value` expressed in `self` into `target`
    pub fn convert(self, value: f64, target: PressureUnit) -> f64 {
        match (self, target) {
            (PressureUnit::Kpa, PressureUnit::Psi) => kpa_to_psi(value),
            (PressureUnit::Psi, PressureUnit::Kpa) => psi_to_kpa(value),
            _ => value,
        }
    }

    /// Short display label
    pub fn label(&self) -> &'static str {
        match self {
            PressureUnit::Kpa => "kPa",
            PressureUnit::Psi => "psi",
        }
    }
}
