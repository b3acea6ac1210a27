//! Skin sample pre-filter
//!
//! Drops samples that are clearly not skin (hair, background, lips in
//! shadow) and the brightest 5% that are usually specular highlights.

use crate::color::{ColorSample, SampleSet};

/// Luma percentile above which samples count as highlights
const HIGHLIGHT_PERCENTILE: f64 = 95.0;

#[inline]
fn looks_like_skin(s: &ColorSample) -> bool {
    let (r, g, b) = (s.r as i16, s.g as i16, s.b as i16);
    r > 40 && r > g && g > b - 10
}

/// Percentile with linear interpolation between order statistics
fn percentile(values: &mut [f64], pct: f64) -> f64 {
    values.sort_by(f64::total_cmp);
    let pos = pct / 100.0 * (values.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    values[lo] + (values[hi] - values[lo]) * (pos - lo as f64)
}

/// Keep plausible skin samples, minus highlights
///
/// Falls back to the mask-only set when too few samples survive, and to the
/// input when nothing passes the mask at all.
pub fn filter_skin_samples(samples: &[ColorSample]) -> SampleSet {
    let masked: SampleSet = samples.iter().copied().filter(looks_like_skin).collect();
    if masked.is_empty() {
        return samples.to_vec();
    }

    let mut lumas: Vec<f64> = masked.iter().map(ColorSample::luma).collect();
    let threshold = percentile(&mut lumas, HIGHLIGHT_PERCENTILE);

    let kept: SampleSet = masked
        .iter()
        .copied()
        .filter(|s| s.luma() <= threshold)
        .collect();

    if kept.len() < 3.max(samples.len() / 10) {
        masked
    } else {
        kept
    }
}
