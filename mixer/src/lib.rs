//! Skin color estimation and pigment dispensing core
//!
//! Captured RGB samples go through [`pipeline`] to a single L*a*b* color,
//! [`solver`] turns that into shares of five pigment bases, and
//! [`dispenser`] drives the stepper channels in [`stepper`] to pump them.

pub mod calibration;
pub mod color;
pub mod dispenser;
pub mod error;
pub mod pigment;
pub mod pipeline;
pub mod skin;
pub mod solver;
pub mod stepper;

pub use color::{ColorSample, LabColor, SampleSet};
pub use dispenser::{
    ChannelOutcome, ChannelResult, DispenseReport, DispenseSettings, DispenserController,
    ExtractPreset, HardwareResource,
};
pub use error::{HardwareError, ValidationError};
pub use pigment::{PIGMENT_COUNT, Pigment, PigmentTable};
pub use pipeline::{ColorEstimate, ColorEstimator, estimate_color};
pub use solver::{MixModel, MixProportion, MixSolver, steps_from_proportions};
pub use stepper::MotorChannel;
