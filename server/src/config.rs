//! Service configuration
//!
//! Defaults match the dispenser wiring. A JSON file named by `MIXER_CONFIG`
//! replaces them, and single environment variables override individual
//! values on top of that.

use std::ops::Range;
use std::path::Path;

use serde::{Deserialize, Serialize};
use shade_mixer::calibration::{CalibrationReference, COLORCHECKER_NEUTRALS, COLORCHECKER_SRGB};
use shade_mixer::pigment::BASE_LABS;
use shade_mixer::{
    ColorEstimator, ColorSample, DispenseSettings, LabColor, MixModel, MixSolver, Pigment,
    PigmentTable, ValidationError, PIGMENT_COUNT,
};
use thiserror::Error;

const DEFAULT_PORT: u16 = 8080;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("Invalid value for {var}: {value}")]
    Env { var: &'static str, value: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// GPIO lines of one dispenser channel (BCM numbering)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPins {
    pub coils: [u8; 4],
    pub switch: u8,
}

impl ChannelPins {
    const fn new(coils: [u8; 4], switch: u8) -> Self {
        Self { coils, switch }
    }

    fn all(&self) -> impl Iterator<Item = u8> + '_ {
        self.coils.iter().copied().chain(std::iter::once(self.switch))
    }
}

/// Pin map in pigment order
pub const DEFAULT_PINS: [ChannelPins; PIGMENT_COUNT] = [
    ChannelPins::new([24, 25, 8, 7], 2),    // White
    ChannelPins::new([10, 9, 11, 5], 27),   // Black
    ChannelPins::new([6, 13, 19, 26], 17),  // Red
    ChannelPins::new([14, 15, 18, 23], 3),  // Blue
    ChannelPins::new([12, 16, 20, 21], 4),  // Yellow
];

/// Everything the core needs, as loaded from disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerConfig {
    pub channels: [ChannelPins; PIGMENT_COUNT],
    pub bases: [LabColor; PIGMENT_COUNT],
    /// Canonical chart, gamma-encoded, in capture order
    pub chart: Vec<ColorSample>,
    pub neutral_patches: Range<usize>,
    pub dispense: DispenseSettings,
    pub mix_model: MixModel,
    pub refine_iterations: usize,
    pub skin_filter: bool,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            channels: DEFAULT_PINS,
            bases: BASE_LABS,
            chart: COLORCHECKER_SRGB.iter().map(|&c| c.into()).collect(),
            neutral_patches: COLORCHECKER_NEUTRALS,
            dispense: DispenseSettings::default(),
            mix_model: MixModel::default(),
            refine_iterations: shade_mixer::solver::DEFAULT_REFINE_ITERATIONS,
            skin_filter: true,
        }
    }
}

impl MixerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }

    /// No GPIO line may serve two purposes
    pub fn check_pins(&self) -> Result<(), ValidationError> {
        let mut owners: Vec<(u8, Pigment)> = Vec::with_capacity(PIGMENT_COUNT * 5);
        for pigment in Pigment::ALL {
            for pin in self.channels[pigment.index()].all() {
                if let Some(&(_, first)) = owners.iter().find(|(p, _)| *p == pin) {
                    return Err(ValidationError::PinConflict {
                        pin,
                        first,
                        second: pigment,
                    });
                }
                owners.push((pin, pigment));
            }
        }
        Ok(())
    }

    /// Validate once and build the core objects
    pub fn build(&self) -> Result<Core, ValidationError> {
        self.check_pins()?;
        if self.dispense.step_budget == 0 {
            return Err(ValidationError::ZeroBudget);
        }

        let table = PigmentTable::new(&self.bases)?;
        let reference = CalibrationReference::new(&self.chart, self.neutral_patches.clone())?;

        Ok(Core {
            estimator: ColorEstimator::new(reference).with_skin_filter(self.skin_filter),
            solver: MixSolver::new(table, self.mix_model).with_refinement(self.refine_iterations),
        })
    }
}

/// Validated core objects
pub struct Core {
    pub estimator: ColorEstimator,
    pub solver: MixSolver,
}

/// Process configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub mixer: MixerConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load through an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut mixer = match lookup("MIXER_CONFIG") {
            Some(path) => {
                tracing::info!("Loading mixer config from {}", path);
                MixerConfig::from_file(Path::new(&path))?
            }
            None => MixerConfig::default(),
        };

        let port = parse_var(&lookup, "PORT")?.unwrap_or(DEFAULT_PORT);

        if let Some(budget) = parse_var(&lookup, "STEP_BUDGET")? {
            mixer.dispense.step_budget = budget;
        }
        if let Some(ms) = parse_var(&lookup, "SETTLE_MS")? {
            mixer.dispense.settle_ms = ms;
        }
        if let Some(us) = parse_var(&lookup, "PHASE_DELAY_US")? {
            mixer.dispense.phase_delay_us = us;
        }
        if let Some(model) = parse_var(&lookup, "MIX_MODEL")? {
            mixer.mix_model = model;
        }
        if let Some(value) = lookup("SKIN_FILTER") {
            mixer.skin_filter = match value.to_ascii_lowercase().as_str() {
                "on" | "true" | "1" => true,
                "off" | "false" | "0" => false,
                _ => {
                    return Err(ConfigError::Env {
                        var: "SKIN_FILTER",
                        value,
                    })
                }
            };
        }

        Ok(Self { port, mixer })
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env { var, value }),
    }
}
