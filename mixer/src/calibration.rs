//! Lighting correction from a captured reference chart
//!
//! A chart photographed next to the face is regressed against its canonical
//! values to get a 3×3 linear-RGB correction. When the regression has nothing
//! to stand on, the correction degrades to a per-channel gain from the gray
//! patches, and finally to no correction at all. Deriving a correction never
//! fails.

use std::ops::Range;

use nalgebra::{DMatrix, Matrix3};
use serde::Serialize;

use crate::color::{self, ColorSample, LinearColor};
use crate::error::ValidationError;

/// Relative singular value below which the chart regression is singular
const RCOND_LIMIT: f64 = 1e-8;

/// Captured gray levels below this cannot produce a usable gain
const MIN_GRAY_LEVEL: f64 = 1e-6;

/// Classic 24-patch ColorChecker, sRGB D65, row-major from dark skin to black
pub const COLORCHECKER_SRGB: [[u8; 3]; 24] = [
    [115, 82, 68],   // dark skin
    [194, 150, 130], // light skin
    [98, 122, 157],  // blue sky
    [87, 108, 67],   // foliage
    [133, 128, 177], // blue flower
    [103, 189, 170], // bluish green
    [214, 126, 44],  // orange
    [80, 91, 166],   // purplish blue
    [193, 90, 99],   // moderate red
    [94, 60, 108],   // purple
    [157, 188, 64],  // yellow green
    [224, 163, 46],  // orange yellow
    [56, 61, 150],   // blue
    [70, 148, 73],   // green
    [175, 54, 60],   // red
    [231, 199, 31],  // yellow
    [187, 86, 149],  // magenta
    [8, 133, 161],   // cyan
    [243, 243, 242], // white 9.5
    [200, 200, 200], // neutral 8
    [160, 160, 160], // neutral 6.5
    [122, 122, 121], // neutral 5
    [85, 85, 85],    // neutral 3.5
    [52, 52, 52],    // black 2
];

/// Gray row of the ColorChecker
pub const COLORCHECKER_NEUTRALS: Range<usize> = 18..24;

/// Canonical chart values under known lighting, read-only after startup
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationReference {
    patches: Vec<LinearColor>,
    neutral: Range<usize>,
}

impl CalibrationReference {
    pub fn new(chart: &[ColorSample], neutral: Range<usize>) -> Result<Self, ValidationError> {
        if chart.is_empty() {
            return Err(ValidationError::EmptyInput("reference chart patches"));
        }

        if neutral.is_empty() || neutral.end > chart.len() {
            return Err(ValidationError::NeutralRange {
                start: neutral.start,
                end: neutral.end,
                len: chart.len(),
            });
        }

        Ok(Self {
            patches: color::gamma_to_linear_set(chart),
            neutral,
        })
    }

    /// Reference built from the stock ColorChecker values
    pub fn colorchecker() -> Self {
        Self {
            patches: COLORCHECKER_SRGB
                .iter()
                .map(|&rgb| color::gamma_to_linear(rgb.into()))
                .collect(),
            neutral: COLORCHECKER_NEUTRALS,
        }
    }

    pub fn patches(&self) -> &[LinearColor] {
        &self.patches
    }

    pub fn neutral_range(&self) -> Range<usize> {
        self.neutral.clone()
    }

    pub fn neutral_patches(&self) -> &[LinearColor] {
        &self.patches[self.neutral.clone()]
    }
}

impl Default for CalibrationReference {
    fn default() -> Self {
        Self::colorchecker()
    }
}

/// Which correction was applied, for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionKind {
    Matrix,
    GrayGain,
    None,
}

/// Lighting correction in linear RGB
#[derive(Debug, Clone, PartialEq)]
pub enum CorrectionTransform {
    /// Row-vector transform: `corrected = captured · M`
    Matrix(Matrix3<f64>),
    /// Per-channel gain from the gray patches
    GrayGain([f64; 3]),
    /// Samples pass through uncorrected
    Identity,
}

impl CorrectionTransform {
    pub fn kind(&self) -> CorrectionKind {
        match self {
            CorrectionTransform::Matrix(_) => CorrectionKind::Matrix,
            CorrectionTransform::GrayGain(_) => CorrectionKind::GrayGain,
            CorrectionTransform::Identity => CorrectionKind::None,
        }
    }

    /// Correct one color, clipping to [0, 1]
    pub fn apply(&self, c: LinearColor) -> LinearColor {
        match self {
            CorrectionTransform::Matrix(m) => {
                LinearColor::from_vector(m.transpose() * c.to_vector()).clipped()
            }
            CorrectionTransform::GrayGain([gr, gg, gb]) => {
                LinearColor::new(c.r * gr, c.g * gg, c.b * gb).clipped()
            }
            CorrectionTransform::Identity => c,
        }
    }

    pub fn apply_set(&self, colors: &[LinearColor]) -> Vec<LinearColor> {
        colors.iter().map(|&c| self.apply(c)).collect()
    }
}

/// Derive the lighting correction for a captured chart
///
/// An empty `captured` set means no chart was found in the frame.
pub fn derive_correction(
    captured: &[ColorSample],
    reference: &CalibrationReference,
) -> CorrectionTransform {
    if captured.is_empty() {
        tracing::debug!("No reference chart captured, skipping lighting correction");
        return CorrectionTransform::Identity;
    }

    let captured = color::gamma_to_linear_set(captured);

    if let Some(m) = regress_matrix(&captured, reference.patches()) {
        return CorrectionTransform::Matrix(m);
    }

    match gray_gain(&captured, reference) {
        Some(gain) => {
            tracing::warn!(
                "Chart regression unavailable, using gray gain [{:.3}, {:.3}, {:.3}]",
                gain[0],
                gain[1],
                gain[2]
            );
            CorrectionTransform::GrayGain(gain)
        }
        None => {
            tracing::warn!("Gray patches unusable, skipping lighting correction");
            CorrectionTransform::Identity
        }
    }
}

/// Least-squares `M` with `captured · M ≈ canonical`, via the SVD pseudo-inverse
fn regress_matrix(captured: &[LinearColor], canonical: &[LinearColor]) -> Option<Matrix3<f64>> {
    if captured.len() != canonical.len() {
        tracing::debug!(
            "Chart has {} patches, reference has {}; cannot regress",
            captured.len(),
            canonical.len()
        );
        return None;
    }
    if captured.len() < 3 {
        tracing::debug!("Too few chart patches ({}) to regress", captured.len());
        return None;
    }

    let rows = |colors: &[LinearColor]| {
        DMatrix::from_fn(colors.len(), 3, |r, c| colors[r].to_vector()[c])
    };
    let a = rows(captured);
    let b = rows(canonical);

    let svd = a.svd(true, true);
    let max = svd.singular_values.max();
    let min = svd.singular_values.min();
    if max.is_nan() || max <= 0.0 || min <= max * RCOND_LIMIT {
        tracing::debug!("Chart regression singular (σmin={:e}, σmax={:e})", min, max);
        return None;
    }

    let solved = match svd.solve(&b, max * RCOND_LIMIT) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!("Chart regression solve failed: {}", e);
            return None;
        }
    };

    let m = Matrix3::from_fn(|r, c| solved[(r, c)]);
    if m.iter().all(|v| v.is_finite()) {
        Some(m)
    } else {
        None
    }
}

/// Per-channel gain mapping the captured gray median onto the canonical one
fn gray_gain(captured: &[LinearColor], reference: &CalibrationReference) -> Option<[f64; 3]> {
    let neutral = reference.neutral_range();
    let captured_gray = if neutral.end <= captured.len() {
        &captured[neutral]
    } else {
        captured
    };

    let canonical = color::median_linear(reference.neutral_patches())?;
    let observed = color::median_linear(captured_gray)?;

    if observed.r < MIN_GRAY_LEVEL || observed.g < MIN_GRAY_LEVEL || observed.b < MIN_GRAY_LEVEL {
        return None;
    }

    Some([
        canonical.r / observed.r,
        canonical.g / observed.g,
        canonical.b / observed.b,
    ])
}
