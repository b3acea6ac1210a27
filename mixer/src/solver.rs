//! Target Lab color → pigment mix proportions → motor step counts
//!
//! The target is expressed as a convex combination of the five pigment base
//! colors. An unconstrained regularized least-squares solve gives a starting
//! point, the Euclidean projection onto the probability simplex makes it a
//! physical mix, and accelerated projected-gradient steps then settle it on
//! the best mix the simplex allows.

use nalgebra::{SMatrix, SVector};
use serde::{Deserialize, Serialize};

use crate::color::LabColor;
use crate::pigment::{PIGMENT_COUNT, Pigment, PigmentTable};

/// Tikhonov term for the rank-deficient 5-base / 3-dimension system
const RIDGE: f64 = 1e-8;

/// Default cap on projected-gradient refinement steps
pub const DEFAULT_REFINE_ITERATIONS: usize = 1000;

/// Refinement stops once a step moves the mix less than this
const REFINE_TOLERANCE: f64 = 1e-13;

type BaseMatrix = SMatrix<f64, PIGMENT_COUNT, 3>;
type Gram = SMatrix<f64, PIGMENT_COUNT, PIGMENT_COUNT>;
type Weights = SVector<f64, PIGMENT_COUNT>;

/// Space the least-squares fit is done in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MixModel {
    /// Raw L*a*b* coordinates
    #[default]
    Linear,
    /// Lightness raised to γ, chroma scaled to ±1
    #[serde(rename = "gamma", alias = "gamma_weighted")]
    GammaWeighted,
}

impl MixModel {
    fn map(self, lab: LabColor) -> LabColor {
        match self {
            MixModel::Linear => lab,
            MixModel::GammaWeighted => LabColor::new(
                (lab.l.max(0.0) / 100.0).powf(crate::color::GAMMA),
                lab.a / 128.0,
                lab.b / 128.0,
            ),
        }
    }
}

impl std::str::FromStr for MixModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(MixModel::Linear),
            "gamma" | "gamma_weighted" => Ok(MixModel::GammaWeighted),
            other => Err(format!("unknown mix model: {}", other)),
        }
    }
}

/// Non-negative pigment shares summing to one, in channel order
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MixProportion([f64; PIGMENT_COUNT]);

impl MixProportion {
    /// Project arbitrary weights onto the simplex
    pub fn from_weights(weights: [f64; PIGMENT_COUNT]) -> Self {
        Self(project_to_simplex(&weights))
    }

    #[inline]
    pub fn get(&self, pigment: Pigment) -> f64 {
        self.0[pigment.index()]
    }

    pub fn as_array(&self) -> &[f64; PIGMENT_COUNT] {
        &self.0
    }

    /// Pigment with the largest share, first one on ties
    pub fn dominant(&self) -> Pigment {
        let mut best = 0;
        for i in 1..PIGMENT_COUNT {
            if self.0[i] > self.0[best] {
                best = i;
            }
        }
        Pigment::ALL[best]
    }
}

/// Euclidean projection onto `{w : w ≥ 0, Σw = 1}`
pub fn project_to_simplex<const N: usize>(v: &[f64; N]) -> [f64; N] {
    // The projection is shift invariant. Measuring from the largest entry
    // keeps huge inputs from swallowing the unit offset below.
    let top = v.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut u = v.map(|x| x - top);
    u.sort_by(|a, b| b.total_cmp(a));

    // Largest ρ with u[ρ]·(ρ+1) > cssv[ρ] − 1, starting from ρ = 0
    let mut cssv = u[0];
    let mut theta = u[0] - 1.0;
    for (i, &ui) in u.iter().enumerate().skip(1) {
        cssv += ui;
        if ui * (i + 1) as f64 > cssv - 1.0 {
            theta = (cssv - 1.0) / (i + 1) as f64;
        }
    }

    v.map(|x| (x - top - theta).max(0.0))
}

/// Solves pigment proportions for a fixed base table
#[derive(Debug, Clone)]
pub struct MixSolver {
    table: PigmentTable,
    model: MixModel,
    bases: BaseMatrix,
    gram: Gram,
    /// Largest eigenvalue of the Gram matrix, the gradient's Lipschitz constant
    lipschitz: f64,
    refine_iterations: usize,
}

impl MixSolver {
    pub fn new(table: PigmentTable, model: MixModel) -> Self {
        let bases = table.matrix_with(|lab| model.map(lab));
        let gram = bases * bases.transpose();
        let lipschitz = gram.symmetric_eigenvalues().max();

        Self {
            table,
            model,
            bases,
            gram,
            lipschitz,
            refine_iterations: DEFAULT_REFINE_ITERATIONS,
        }
    }

    /// Cap refinement steps; zero leaves the plain simplex projection
    pub fn with_refinement(mut self, iterations: usize) -> Self {
        self.refine_iterations = iterations;
        self
    }

    pub fn table(&self) -> &PigmentTable {
        &self.table
    }

    pub fn model(&self) -> MixModel {
        self.model
    }

    pub fn solve(&self, target: LabColor) -> MixProportion {
        let t = self.model.map(target);
        let rhs: Weights = self.bases * SVector::<f64, 3>::new(t.l, t.a, t.b);

        let w0: [f64; PIGMENT_COUNT] = self.unconstrained(&rhs).into();
        let mut w = project_to_simplex(&w0);

        if self.refine_iterations > 0 && self.lipschitz > 0.0 {
            w = self.refine(w, &rhs);
        }
        if !w.iter().all(|v| v.is_finite()) {
            tracing::warn!("Mix solve overflowed, falling back to an even mix");
            w = [1.0 / PIGMENT_COUNT as f64; PIGMENT_COUNT];
        }

        let mix = MixProportion(w);
        tracing::debug!(
            "Mix for ({:.2}, {:.2}, {:.2}): {:?}",
            target.l,
            target.a,
            target.b,
            mix.as_array()
        );
        mix
    }

    /// `(BBᵀ + εI)·w0 = B·t`, least squares when even that is singular
    fn unconstrained(&self, rhs: &Weights) -> Weights {
        let regularized = self.gram + Gram::identity() * RIDGE;

        if let Some(w) = regularized.lu().solve(rhs)
            && w.iter().all(|v| v.is_finite())
        {
            return w;
        }

        tracing::debug!("Regularized mix solve singular, falling back to least squares");
        match regularized.svd(true, true).solve(rhs, f64::EPSILON) {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!("Least-squares mix solve failed ({}), starting from uniform", e);
                Weights::repeat(1.0 / PIGMENT_COUNT as f64)
            }
        }
    }

    /// FISTA on `½‖Bᵀw − t‖²` restricted to the simplex
    fn refine(&self, start: [f64; PIGMENT_COUNT], rhs: &Weights) -> [f64; PIGMENT_COUNT] {
        let step = 1.0 / self.lipschitz;
        let mut w = Weights::from(start);
        let mut y = w;
        let mut momentum = 1.0_f64;

        for _ in 0..self.refine_iterations {
            let grad = self.gram * y - rhs;
            let stepped: [f64; PIGMENT_COUNT] = (y - grad * step).into();
            let next = Weights::from(project_to_simplex(&stepped));

            let next_momentum = (1.0 + (1.0 + 4.0 * momentum * momentum).sqrt()) / 2.0;
            y = next + (next - w) * ((momentum - 1.0) / next_momentum);

            let moved = (next - w).norm();
            w = next;
            momentum = next_momentum;
            if moved < REFINE_TOLERANCE {
                break;
            }
        }

        w.into()
    }
}

impl Default for MixSolver {
    fn default() -> Self {
        Self::new(PigmentTable::default(), MixModel::default())
    }
}

/// Integer step counts summing exactly to `budget`
///
/// Rounding drift goes to the pigment with the largest share.
pub fn steps_from_proportions(mix: &MixProportion, budget: u32) -> [u32; PIGMENT_COUNT] {
    let shares = mix
        .as_array()
        .map(|p| if p.is_finite() { p.clamp(0.0, 1.0) } else { 0.0 });
    let mut steps = shares.map(|p| (budget as f64 * p).round() as i64);
    let mut diff = budget as i64 - steps.iter().sum::<i64>();

    let mut order: Vec<usize> = (0..PIGMENT_COUNT).collect();
    order.sort_by(|&a, &b| shares[b].total_cmp(&shares[a]));

    for i in order {
        if diff == 0 {
            break;
        }
        // Never take a channel below zero; carry the rest to the next share
        let applied = diff.max(-steps[i]);
        steps[i] += applied;
        diff -= applied;
    }

    steps.map(|s| s as u32)
}
