//! Color space conversions for captured samples
//!
//! Gamma-encoded sRGB bytes → linear RGB → CIE XYZ (D65) → CIE L*a*b*,
//! plus the inverse path used to render a Lab estimate as a display hex.
//! Every function here is pure and total; only [`aggregate`] can fail.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// sRGB decoding exponent
pub const GAMMA: f64 = 2.4;

/// CIE ε (216/24389)
pub const EPSILON: f64 = 216.0 / 24389.0;
/// CIE κ (24389/27)
pub const KAPPA: f64 = 24389.0 / 27.0;

/// D65 reference white (Xn, Yn, Zn)
pub const WHITE_POINT: [f64; 3] = [0.95047, 1.00000, 1.08883];

/// Linear sRGB → XYZ, D65 primaries
#[rustfmt::skip]
pub const RGB_TO_XYZ: Matrix3<f64> = Matrix3::new(
    0.4124564, 0.3575761, 0.1804375,
    0.2126729, 0.7151522, 0.0721750,
    0.0193339, 0.1191920, 0.9503041,
);

/// XYZ → linear sRGB, D65 primaries
#[rustfmt::skip]
pub const XYZ_TO_RGB: Matrix3<f64> = Matrix3::new(
    3.2404542, -1.5371385, -0.4985314,
    -0.9692660, 1.8760108, 0.0415560,
    0.0556434, -0.2040259, 1.0572252,
);

/// Gamma-encoded RGB sample as captured (0-255 per channel)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u8; 3]", into = "[u8; 3]")]
pub struct ColorSample {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl ColorSample {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Rec.709 luma on the encoded values
    #[inline]
    pub fn luma(&self) -> f64 {
        0.2126 * self.r as f64 + 0.7152 * self.g as f64 + 0.0722 * self.b as f64
    }
}

impl From<[u8; 3]> for ColorSample {
    fn from([r, g, b]: [u8; 3]) -> Self {
        Self::new(r, g, b)
    }
}

impl From<ColorSample> for [u8; 3] {
    fn from(s: ColorSample) -> Self {
        [s.r, s.g, s.b]
    }
}

/// Ordered set of captured samples
pub type SampleSet = Vec<ColorSample>;

/// Gamma-decoded RGB, each channel in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LinearColor {
    pub r: f64,
    pub g: f64,
    pub b: f64,
}

impl LinearColor {
    pub const fn new(r: f64, g: f64, b: f64) -> Self {
        Self { r, g, b }
    }

    pub fn to_vector(self) -> Vector3<f64> {
        Vector3::new(self.r, self.g, self.b)
    }

    pub fn from_vector(v: Vector3<f64>) -> Self {
        Self::new(v.x, v.y, v.z)
    }

    /// Gamma-encode back to a byte sample, clipping first
    pub fn to_sample(self) -> ColorSample {
        let c = self.clipped();
        let encode = |v: f64| (linear_to_gamma(v) * 255.0).round().clamp(0.0, 255.0) as u8;
        ColorSample::new(encode(c.r), encode(c.g), encode(c.b))
    }

    /// Clip every channel to [0, 1]
    pub fn clipped(self) -> Self {
        Self::new(
            self.r.clamp(0.0, 1.0),
            self.g.clamp(0.0, 1.0),
            self.b.clamp(0.0, 1.0),
        )
    }
}

/// CIE XYZ tristimulus values relative to D65
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct XyzColor {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl XyzColor {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// CIE L*a*b* color
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "[f64; 3]", into = "[f64; 3]")]
pub struct LabColor {
    pub l: f64,
    pub a: f64,
    pub b: f64,
}

impl LabColor {
    pub const fn new(l: f64, a: f64, b: f64) -> Self {
        Self { l, a, b }
    }

    pub fn to_array(self) -> [f64; 3] {
        [self.l, self.a, self.b]
    }

    pub fn is_finite(&self) -> bool {
        self.l.is_finite() && self.a.is_finite() && self.b.is_finite()
    }

    /// Euclidean distance (ΔE*76)
    pub fn delta_e(&self, other: &LabColor) -> f64 {
        let dl = self.l - other.l;
        let da = self.a - other.a;
        let db = self.b - other.b;
        (dl * dl + da * da + db * db).sqrt()
    }

    /// Encode as an sRGB `#RRGGBB` string, clipping out-of-gamut values
    pub fn to_hex(&self) -> String {
        let s = xyz_to_linear(lab_to_xyz(*self)).to_sample();
        format!("#{:02X}{:02X}{:02X}", s.r, s.g, s.b)
    }
}

impl From<[f64; 3]> for LabColor {
    fn from([l, a, b]: [f64; 3]) -> Self {
        Self::new(l, a, b)
    }
}

impl From<LabColor> for [f64; 3] {
    fn from(c: LabColor) -> Self {
        c.to_array()
    }
}

/// Decode one normalized channel value
#[inline]
pub fn decode_channel(v: f64) -> f64 {
    if v <= 0.04045 {
        v / 12.92
    } else {
        ((v + 0.055) / 1.055).powf(GAMMA)
    }
}

/// Encode one linear channel value back to [0, 1] gamma space
#[inline]
pub fn linear_to_gamma(v: f64) -> f64 {
    if v <= 0.0031308 {
        12.92 * v
    } else {
        1.055 * v.powf(1.0 / GAMMA) - 0.055
    }
}

pub fn gamma_to_linear(sample: ColorSample) -> LinearColor {
    LinearColor::new(
        decode_channel(sample.r as f64 / 255.0),
        decode_channel(sample.g as f64 / 255.0),
        decode_channel(sample.b as f64 / 255.0),
    )
}

pub fn gamma_to_linear_set(samples: &[ColorSample]) -> Vec<LinearColor> {
    samples.iter().copied().map(gamma_to_linear).collect()
}

pub fn linear_to_xyz(linear: LinearColor) -> XyzColor {
    let v = RGB_TO_XYZ * linear.to_vector();
    XyzColor::new(v.x, v.y, v.z)
}

pub fn linear_to_xyz_set(linear: &[LinearColor]) -> Vec<XyzColor> {
    linear.iter().copied().map(linear_to_xyz).collect()
}

pub fn xyz_to_linear(xyz: XyzColor) -> LinearColor {
    LinearColor::from_vector(XYZ_TO_RGB * Vector3::new(xyz.x, xyz.y, xyz.z))
}

#[inline]
fn lab_f(t: f64) -> f64 {
    if t > EPSILON {
        t.cbrt()
    } else {
        (KAPPA * t + 16.0) / 116.0
    }
}

#[inline]
fn lab_f_inv(f: f64) -> f64 {
    let f3 = f * f * f;
    if f3 > EPSILON {
        f3
    } else {
        (116.0 * f - 16.0) / KAPPA
    }
}

pub fn xyz_to_lab(xyz: XyzColor) -> LabColor {
    let fx = lab_f(xyz.x / WHITE_POINT[0]);
    let fy = lab_f(xyz.y / WHITE_POINT[1]);
    let fz = lab_f(xyz.z / WHITE_POINT[2]);

    LabColor::new(116.0 * fy - 16.0, 500.0 * (fx - fy), 200.0 * (fy - fz))
}

pub fn xyz_to_lab_set(xyz: &[XyzColor]) -> Vec<LabColor> {
    xyz.iter().copied().map(xyz_to_lab).collect()
}

pub fn lab_to_xyz(lab: LabColor) -> XyzColor {
    let fy = (lab.l + 16.0) / 116.0;
    let fx = fy + lab.a / 500.0;
    let fz = fy - lab.b / 200.0;

    XyzColor::new(
        lab_f_inv(fx) * WHITE_POINT[0],
        lab_f_inv(fy) * WHITE_POINT[1],
        lab_f_inv(fz) * WHITE_POINT[2],
    )
}

/// Median of a slice, averaging the middle pair for even lengths
pub(crate) fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

/// Per-channel median of linear colors
pub(crate) fn median_linear(colors: &[LinearColor]) -> Option<LinearColor> {
    let mut r: Vec<f64> = colors.iter().map(|c| c.r).collect();
    let mut g: Vec<f64> = colors.iter().map(|c| c.g).collect();
    let mut b: Vec<f64> = colors.iter().map(|c| c.b).collect();
    Some(LinearColor::new(
        median(&mut r)?,
        median(&mut g)?,
        median(&mut b)?,
    ))
}

/// Component-wise median of a set of Lab colors
///
/// The median holds up against the specular highlights and shadowed points
/// that a handful of face samples routinely contain.
pub fn aggregate(labs: &[LabColor]) -> Result<LabColor, ValidationError> {
    let empty = || ValidationError::EmptyInput("lab samples");
    let mut l: Vec<f64> = labs.iter().map(|c| c.l).collect();
    let mut a: Vec<f64> = labs.iter().map(|c| c.a).collect();
    let mut b: Vec<f64> = labs.iter().map(|c| c.b).collect();

    Ok(LabColor::new(
        median(&mut l).ok_or_else(empty)?,
        median(&mut a).ok_or_else(empty)?,
        median(&mut b).ok_or_else(empty)?,
    ))
}
