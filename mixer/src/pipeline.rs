//! Color estimation: captured samples → single target Lab color
//!
//! Order is fixed: gamma → linear for both sets, lighting correction of the
//! skin samples from the chart, linear → XYZ → Lab, then the median.

use serde::Serialize;

use crate::calibration::{self, CalibrationReference, CorrectionKind};
use crate::color::{self, ColorSample, LabColor};
use crate::error::ValidationError;
use crate::skin;

/// Result of one estimation request
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ColorEstimate {
    pub lab: LabColor,
    pub correction: CorrectionKind,
    /// Skin samples left after filtering
    pub samples_used: usize,
}

/// Estimates a skin color against a fixed calibration reference
#[derive(Debug, Clone)]
pub struct ColorEstimator {
    reference: CalibrationReference,
    filter_skin: bool,
}

impl ColorEstimator {
    pub fn new(reference: CalibrationReference) -> Self {
        Self {
            reference,
            filter_skin: false,
        }
    }

    /// Enable the skin/highlight pre-filter before decoding
    pub fn with_skin_filter(mut self, enabled: bool) -> Self {
        self.filter_skin = enabled;
        self
    }

    pub fn reference(&self) -> &CalibrationReference {
        &self.reference
    }

    pub fn estimate(
        &self,
        skin_samples: &[ColorSample],
        reference_samples: Option<&[ColorSample]>,
    ) -> Result<ColorEstimate, ValidationError> {
        if skin_samples.is_empty() {
            return Err(ValidationError::EmptyInput("skin samples"));
        }

        let filtered;
        let skin_samples = if self.filter_skin {
            filtered = skin::filter_skin_samples(skin_samples);
            &filtered[..]
        } else {
            skin_samples
        };

        let skin_linear = color::gamma_to_linear_set(skin_samples);
        let correction =
            calibration::derive_correction(reference_samples.unwrap_or_default(), &self.reference);
        let corrected = correction.apply_set(&skin_linear);

        let labs = color::xyz_to_lab_set(&color::linear_to_xyz_set(&corrected));
        let lab = color::aggregate(&labs)?;

        tracing::info!(
            "Estimated L*a*b* ({:.2}, {:.2}, {:.2}) from {} samples, correction {:?}",
            lab.l,
            lab.a,
            lab.b,
            skin_samples.len(),
            correction.kind()
        );

        Ok(ColorEstimate {
            lab,
            correction: correction.kind(),
            samples_used: skin_samples.len(),
        })
    }
}

impl Default for ColorEstimator {
    fn default() -> Self {
        Self::new(CalibrationReference::default())
    }
}

/// One-shot estimate without the skin filter
pub fn estimate_color(
    skin_samples: &[ColorSample],
    reference_samples: Option<&[ColorSample]>,
    reference: &CalibrationReference,
) -> Result<LabColor, ValidationError> {
    ColorEstimator::new(reference.clone())
        .estimate(skin_samples, reference_samples)
        .map(|estimate| estimate.lab)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::COLORCHECKER_SRGB;
    use approx::assert_abs_diff_eq;

    fn chart() -> Vec<ColorSample> {
        COLORCHECKER_SRGB.iter().map(|&c| c.into()).collect()
    }

    #[test]
    fn test_white_through_identity_calibration() {
        let skin = vec![ColorSample::new(255, 255, 255); 10];
        let estimate = ColorEstimator::default()
            .estimate(&skin, Some(chart().as_slice()))
            .unwrap();

        assert_eq!(estimate.correction, CorrectionKind::Matrix);
        assert_abs_diff_eq!(estimate.lab.l, 100.0, epsilon = 0.5);
        assert_abs_diff_eq!(estimate.lab.a, 0.0, epsilon = 0.5);
        assert_abs_diff_eq!(estimate.lab.b, 0.0, epsilon = 0.5);
    }

    #[test]
    fn test_no_reference_matches_direct_conversion() {
        let sample = ColorSample::new(198, 134, 103);
        let lab = estimate_color(&[sample], None, &CalibrationReference::default()).unwrap();
        let direct = color::xyz_to_lab(color::linear_to_xyz(color::gamma_to_linear(sample)));
        assert_eq!(lab, direct);
    }

    #[test]
    fn test_empty_skin_rejected() {
        let result = ColorEstimator::default().estimate(&[], Some(chart().as_slice()));
        assert_eq!(result, Err(ValidationError::EmptyInput("skin samples")));
    }

    #[test]
    fn test_empty_reference_is_uncorrected() {
        let skin = vec![ColorSample::new(198, 134, 103)];
        let estimate = ColorEstimator::default().estimate(&skin, Some(&[][..])).unwrap();
        assert_eq!(estimate.correction, CorrectionKind::None);
    }

    #[test]
    fn test_cast_is_corrected() {
        let reference = CalibrationReference::default();
        let truth = ColorSample::new(198, 134, 103);
        let cast = [0.75, 0.9, 1.0];

        let shift = |s: ColorSample| {
            let c = color::gamma_to_linear(s);
            color::LinearColor::new(c.r * cast[0], c.g * cast[1], c.b * cast[2]).to_sample()
        };
        let captured_chart: Vec<ColorSample> = chart().into_iter().map(shift).collect();
        let skin = vec![shift(truth); 5];

        let lab = estimate_color(&skin, Some(captured_chart.as_slice()), &reference).unwrap();
        let expected = estimate_color(&[truth], None, &reference).unwrap();
        assert!(lab.delta_e(&expected) < 1.5, "ΔE = {}", lab.delta_e(&expected));
    }

    #[test]
    fn test_skin_filter_rejects_highlight() {
        let mut skin: Vec<ColorSample> = (0..12)
            .map(|i| ColorSample::new(190 + i, 134, 103))
            .collect();
        skin.push(ColorSample::new(255, 250, 245));

        let estimate = ColorEstimator::default()
            .with_skin_filter(true)
            .estimate(&skin, None)
            .unwrap();
        assert_eq!(estimate.samples_used, 12);
    }
}
