//! Five-pigment base table
//!
//! Canonical Lab values of the pigment bases loaded into the dispensers.
//! Order is fixed and shared by proportions, step counts and motor channels.

use nalgebra::SMatrix;
use serde::{Deserialize, Serialize};

use crate::color::LabColor;
use crate::error::ValidationError;

/// Number of pigment bases and motor channels
pub const PIGMENT_COUNT: usize = 5;

/// Pigment identity, doubling as the channel index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Pigment {
    White = 0,
    Black = 1,
    Red = 2,
    Blue = 3,
    Yellow = 4,
}

impl Pigment {
    /// All pigments in channel order
    pub const ALL: [Pigment; PIGMENT_COUNT] = [
        Pigment::White,
        Pigment::Black,
        Pigment::Red,
        Pigment::Blue,
        Pigment::Yellow,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Pigment::White => "white",
            Pigment::Black => "black",
            Pigment::Red => "red",
            Pigment::Blue => "blue",
            Pigment::Yellow => "yellow",
        }
    }
}

impl std::fmt::Display for Pigment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Measured base pigment colors
pub const BASE_LABS: [LabColor; PIGMENT_COUNT] = [
    LabColor::new(98.5, 0.4, 1.2),    // White
    LabColor::new(6.2, 0.0, 0.0),     // Black
    LabColor::new(45.0, 55.0, 20.0),  // Red
    LabColor::new(35.0, 10.0, -45.0), // Blue
    LabColor::new(85.0, -5.0, 80.0),  // Yellow
];

/// Pigment identity with its canonical color
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PigmentBase {
    pub pigment: Pigment,
    pub lab: LabColor,
}

/// Validated 5×3 base matrix
///
/// Only constructed through [`PigmentTable::new`], so a table in hand is
/// always exactly five finite, pairwise distinct rows.
#[derive(Debug, Clone, PartialEq)]
pub struct PigmentTable {
    bases: [PigmentBase; PIGMENT_COUNT],
}

impl PigmentTable {
    pub fn new(labs: &[LabColor]) -> Result<Self, ValidationError> {
        if labs.len() != PIGMENT_COUNT {
            return Err(ValidationError::BaseCount {
                expected: PIGMENT_COUNT,
                actual: labs.len(),
            });
        }

        if labs.iter().any(|lab| !lab.is_finite()) {
            return Err(ValidationError::NonFinite("pigment bases"));
        }

        for i in 0..PIGMENT_COUNT {
            for j in (i + 1)..PIGMENT_COUNT {
                if labs[i] == labs[j] {
                    return Err(ValidationError::DuplicateBase {
                        first: Pigment::ALL[i],
                        second: Pigment::ALL[j],
                    });
                }
            }
        }

        let bases = Pigment::ALL.map(|pigment| PigmentBase {
            pigment,
            lab: labs[pigment.index()],
        });

        Ok(Self { bases })
    }

    pub fn bases(&self) -> &[PigmentBase; PIGMENT_COUNT] {
        &self.bases
    }

    #[inline]
    pub fn get(&self, pigment: Pigment) -> &LabColor {
        &self.bases[pigment.index()].lab
    }

    /// Base rows as a 5×3 matrix after mapping each row through `f`
    pub fn matrix_with(&self, f: impl Fn(LabColor) -> LabColor) -> SMatrix<f64, PIGMENT_COUNT, 3> {
        SMatrix::from_fn(|row, col| f(self.bases[row].lab).to_array()[col])
    }
}

impl Default for PigmentTable {
    fn default() -> Self {
        Self {
            bases: Pigment::ALL.map(|pigment| PigmentBase {
                pigment,
                lab: BASE_LABS[pigment.index()],
            }),
        }
    }
}
