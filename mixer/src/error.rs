//! Error types for the mixer core
//!
//! Numeric degeneracy never shows up here: the color and mixing layers
//! recover from it locally and log the fallback they took.

use thiserror::Error;

use crate::pigment::Pigment;

/// Input or configuration rejected before any numeric or hardware work
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("empty input: no {0}")]
    EmptyInput(&'static str),

    #[error("pigment table must have exactly {expected} bases, got {actual}")]
    BaseCount { expected: usize, actual: usize },

    #[error("pigment bases {first} and {second} have identical Lab values")]
    DuplicateBase { first: Pigment, second: Pigment },

    #[error("non-finite value in {0}")]
    NonFinite(&'static str),

    #[error("GPIO {pin} is assigned to both {first} and {second}")]
    PinConflict {
        pin: u8,
        first: Pigment,
        second: Pigment,
    },

    #[error("target color component {value} is outside ±{limit}")]
    TargetOutOfRange { value: f64, limit: f64 },

    #[error("step budget must be greater than zero")]
    ZeroBudget,

    #[error("neutral patch range {start}..{end} does not fit a {len}-patch chart")]
    NeutralRange { start: usize, end: usize, len: usize },
}

/// GPIO failure on one motor channel
///
/// Fatal for the current channel operation and never retried here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HardwareError {
    #[error("{pigment}: failed to claim GPIO {pin}: {reason}")]
    Claim {
        pigment: Pigment,
        pin: u8,
        reason: String,
    },

    #[error("{pigment}: coil write failed: {reason}")]
    Write { pigment: Pigment, reason: String },

    #[error("{pigment}: limit switch read failed: {reason}")]
    Read { pigment: Pigment, reason: String },
}

impl HardwareError {
    /// Pigment channel the failure belongs to
    pub fn pigment(&self) -> Pigment {
        match self {
            HardwareError::Claim { pigment, .. }
            | HardwareError::Write { pigment, .. }
            | HardwareError::Read { pigment, .. } => *pigment,
        }
    }
}
