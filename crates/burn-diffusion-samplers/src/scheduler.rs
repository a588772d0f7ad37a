//! Noise schedules for diffusion models
//!
//! A discretization maps a `(steps, shift)` pair to a sequence of cumulative
//! signal retention values (`alpha_cumprod`), one per step plus a terminal
//! `1.0`. Every integrator reads its noise levels from this sequence and
//! converts between `alpha_cumprod`, timesteps and sigmas through the
//! [`Discretization`] trait.

use std::f64::consts::FRAC_PI_2;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::objective::{Objective, TimestepConditioning};

// ============================================================================
// Sampling records
// ============================================================================

/// Schedule resolution and warp factor for one run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sampling {
    /// Number of integrator steps
    pub steps: usize,
    /// Warp factor redistributing noise levels over the steps
    pub shift: f64,
}

impl Default for Sampling {
    fn default() -> Self {
        Self {
            steps: 20,
            shift: 1.0,
        }
    }
}

/// A possibly fractional position in the step sequence
///
/// img2img strength maps to a non-integer point in the schedule; integrators
/// start at `integral` and interpolate the first timestep using `fractional`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepPosition {
    pub integral: usize,
    pub fractional: f32,
}

impl StepPosition {
    /// Position at an arbitrary (clamped to non-negative) step value
    pub fn new(position: f32) -> Self {
        let position = position.max(0.0);
        Self {
            integral: position.floor() as usize,
            fractional: position,
        }
    }

    /// Position exactly at an integral step
    pub fn at(step: usize) -> Self {
        Self {
            integral: step,
            fractional: step as f32,
        }
    }

    /// True if this position lies strictly between two integral steps
    pub fn is_fractional(&self) -> bool {
        self.integral as f32 != self.fractional
    }
}

/// Result of mapping an img2img strength onto the schedule
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrengthMapping {
    /// Timestep the reference latent is noised to
    pub timestep: f32,
    /// Fractional start step
    pub start_step: f32,
    pub rounded_down_start_step: usize,
    pub rounded_up_start_step: usize,
}

// ============================================================================
// Parameterizations
// ============================================================================

/// EDM (Karras et al.) continuous parameterization
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EdmParameters {
    pub sigma_min: f64,
    pub sigma_max: f64,
    pub sigma_data: f64,
}

impl Default for EdmParameters {
    fn default() -> Self {
        Self {
            sigma_min: 0.002,
            sigma_max: 80.0,
            sigma_data: 0.5,
        }
    }
}

/// How DDPM betas are spaced between `linear_start` and `linear_end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Linspace {
    /// Linear in sqrt(beta), then squared (Stable Diffusion "scaled linear")
    #[default]
    LinearWrtSigma,
    /// Linear in beta
    LinearWrtBeta,
}

/// Discrete DDPM training schedule
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DdpmParameters {
    pub linear_start: f64,
    pub linear_end: f64,
    pub timesteps: usize,
    pub linspace: Linspace,
}

impl Default for DdpmParameters {
    /// Stable Diffusion 1.x / 2.x / XL training schedule
    fn default() -> Self {
        Self {
            linear_start: 0.00085,
            linear_end: 0.012,
            timesteps: 1000,
            linspace: Linspace::LinearWrtSigma,
        }
    }
}

impl DdpmParameters {
    fn betas(&self) -> Vec<f64> {
        let (start, end) = match self.linspace {
            Linspace::LinearWrtSigma => (self.linear_start.sqrt(), self.linear_end.sqrt()),
            Linspace::LinearWrtBeta => (self.linear_start, self.linear_end),
        };
        let length = end - start;
        let denom = self.timesteps.saturating_sub(1).max(1) as f64;
        (0..self.timesteps)
            .map(|i| {
                let beta = start + i as f64 * length / denom;
                match self.linspace {
                    Linspace::LinearWrtSigma => beta * beta,
                    Linspace::LinearWrtBeta => beta,
                }
            })
            .collect()
    }

    /// Training-time alphas cumprod, indexed by training timestep
    pub fn alphas_cumprod(&self) -> Vec<f64> {
        let mut cumprod = 1.0;
        self.betas()
            .into_iter()
            .map(|beta| {
                cumprod *= 1.0 - beta;
                cumprod
            })
            .collect()
    }

    fn sigmas(&self) -> Vec<f64> {
        self.alphas_cumprod()
            .into_iter()
            .map(|a| ((1.0 - a) / a).sqrt())
            .collect()
    }
}

/// Training parameterization of a denoiser
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Parameterization {
    Edm(EdmParameters),
    Ddpm(DdpmParameters),
}

// ============================================================================
// Discretization
// ============================================================================

/// Schedule-only conversions shared by every integrator
///
/// All methods are pure. Timesteps grow with noise: the noisiest entry of
/// `alphas_cumprod` maps to the largest timestep.
pub trait Discretization: fmt::Debug + Send + Sync {
    /// Objective of the network this schedule belongs to
    fn objective(&self) -> Objective;

    /// Timestep scale: 1 for continuous schedules, training steps for DDPM
    fn timesteps(&self) -> f32;

    /// Timestep conditioned on for a given alpha cumprod
    fn timestep_for(&self, alpha_cumprod: f64) -> f32;

    /// Alpha cumprod at a (possibly fractional) timestep, warped by `shift`
    fn alpha_cumprod_at(&self, timestep: f32, shift: f64) -> f64;

    /// Per-step alpha cumprod values, `steps + 1` entries ending in `1.0`
    fn alphas_cumprod(&self, steps: usize, shift: f64) -> Vec<f64>;

    fn sigma_from(&self, alpha_cumprod: f64) -> f64 {
        self.objective().sigma_from(alpha_cumprod)
    }

    fn alpha_cumprod_from(&self, sigma: f64) -> f64 {
        self.objective().alpha_cumprod_from(sigma)
    }

    /// Noise conditioning value for "noise-conditioned" networks
    fn noise_for(&self, alpha_cumprod: f64) -> f32 {
        self.objective().noise_for(alpha_cumprod)
    }

    /// Scalar handed to the network as its time signal
    fn conditioning_value(&self, alpha_cumprod: f64, conditioning: TimestepConditioning) -> f32 {
        match conditioning {
            TimestepConditioning::Noise => self.noise_for(alpha_cumprod),
            TimestepConditioning::Timestep => self.timestep_for(alpha_cumprod),
        }
    }

    /// Per-step sigmas, `steps + 1` entries ending in `0.0`
    fn sigmas(&self, steps: usize, shift: f64) -> Vec<f64> {
        self.alphas_cumprod(steps, shift)
            .into_iter()
            .map(|a| self.sigma_from(a))
            .collect()
    }

    /// Alpha cumprod at a fractional step position
    ///
    /// Interpolates the *timestep* between the bracketing integral steps and
    /// maps it back, rather than interpolating alpha cumprod directly.
    fn interpolated_alpha_cumprod(&self, alphas_cumprod: &[f64], step: f32) -> f64 {
        let last = alphas_cumprod.len().saturating_sub(1);
        let low_index = (step.floor().max(0.0) as usize).min(last);
        let high_index = (step.ceil().max(0.0) as usize).min(last);
        let low = self.timestep_for(alphas_cumprod[low_index]);
        let high = self.timestep_for(alphas_cumprod[high_index]);
        let timestep = low + (high - low) * (step - step.floor());
        self.alpha_cumprod_at(timestep, 1.0)
    }
}

/// Shared, thread-safe discretization handle
pub type SharedDiscretization = Arc<dyn Discretization>;

fn sigma_of(alpha_cumprod: f64) -> f64 {
    ((1.0 - alpha_cumprod) / alpha_cumprod).sqrt()
}

fn alpha_of(sigma: f64) -> f64 {
    1.0 / (sigma * sigma + 1.0)
}

/// Fractional training timestep of `alpha_cumprod` in an ascending sigma table
fn timestep_in_sigmas(alpha_cumprod: f64, sigmas: &[f64]) -> f32 {
    let sigma = sigma_of(alpha_cumprod);
    let last = sigmas.len() - 1;
    if !(sigma > sigmas[0]) {
        return 0.0;
    }
    if !(sigma < sigmas[last]) {
        return last as f32;
    }
    let mut high = last;
    let mut low = 0;
    while low < high - 1 {
        let mid = low + (high - low) / 2;
        if sigma < sigmas[mid] {
            high = mid;
        } else {
            low = mid;
        }
    }
    let low_log = sigmas[high - 1].ln();
    let high_log = sigmas[high].ln();
    let w = ((low_log - sigma.ln()) / (low_log - high_log)).clamp(0.0, 1.0);
    ((1.0 - w) * (high - 1) as f64 + w * high as f64) as f32
}

/// Alpha cumprod at a fractional training timestep, log-sigma interpolated
fn alpha_cumprod_in_sigmas(timestep: f32, sigmas: &[f64]) -> f64 {
    let last = sigmas.len() - 1;
    if timestep <= 0.0 {
        return alpha_of(sigmas[0]);
    }
    if timestep >= last as f32 {
        return alpha_of(sigmas[last]);
    }
    let low = sigmas[(timestep.floor() as usize).min(last)].ln();
    let high = sigmas[(timestep.ceil() as usize).min(last)].ln();
    let w = (timestep - timestep.floor()).clamp(0.0, 1.0) as f64;
    alpha_of((low * (1.0 - w) + w * high).exp())
}

fn shift_sigma(sigma: f64, shift: f64) -> f64 {
    if shift != 1.0 { shift * sigma } else { sigma }
}

// ----------------------------------------------------------------------------
// Cosine
// ----------------------------------------------------------------------------

/// Cosine schedule (Nichol & Dhariwal) with offset `s`
#[derive(Debug, Clone)]
pub struct CosineDiscretization {
    objective: Objective,
    timesteps: f32,
    s: f64,
    range: (f64, f64),
    min_var: f64,
    sigmas: Option<Vec<f64>>,
}

impl CosineDiscretization {
    pub fn new(parameterization: Parameterization, objective: Objective) -> Self {
        Self::with_offset(parameterization, objective, 0.008)
    }

    pub fn with_offset(parameterization: Parameterization, objective: Objective, s: f64) -> Self {
        let min_std = (s / (1.0 + s) * FRAC_PI_2).cos();
        let min_var = min_std * min_std;
        match parameterization {
            Parameterization::Edm(edm) => Self {
                objective,
                timesteps: 1.0,
                s,
                range: (alpha_of(edm.sigma_max), alpha_of(edm.sigma_min)),
                min_var,
                sigmas: None,
            },
            Parameterization::Ddpm(ddpm) => {
                let alphas_cumprod = ddpm.alphas_cumprod();
                let sigmas = alphas_cumprod.iter().map(|&a| sigma_of(a)).collect();
                Self {
                    objective,
                    timesteps: ddpm.timesteps as f32,
                    s,
                    range: (alphas_cumprod[alphas_cumprod.len() - 1], alphas_cumprod[0]),
                    min_var,
                    sigmas: Some(sigmas),
                }
            }
        }
    }

    fn variance_at(&self, t: f64, shift: f64) -> f64 {
        let (lower, upper) = self.range;
        let std = ((self.s + t) / (1.0 + self.s) * FRAC_PI_2).cos().clamp(0.0, 1.0);
        let mut v = (std * std / self.min_var).clamp(lower, upper);
        if shift != 1.0 {
            // sigmoid(logit(v) - 2 ln(shift))
            let shifted = 1.0 / (1.0 + shift * shift * (1.0 - v) / v);
            v = shifted.clamp(lower, upper);
        }
        v
    }
}

impl Discretization for CosineDiscretization {
    fn objective(&self) -> Objective {
        self.objective
    }

    fn timesteps(&self) -> f32 {
        self.timesteps
    }

    fn timestep_for(&self, alpha_cumprod: f64) -> f32 {
        if let Some(sigmas) = &self.sigmas {
            return timestep_in_sigmas(alpha_cumprod, sigmas);
        }
        let t = (alpha_cumprod * self.min_var).sqrt().acos() / FRAC_PI_2 * (1.0 + self.s) - self.s;
        t as f32 * self.timesteps
    }

    fn alpha_cumprod_at(&self, timestep: f32, shift: f64) -> f64 {
        if let Some(sigmas) = &self.sigmas {
            return alpha_of(shift_sigma(sigma_of(alpha_cumprod_in_sigmas(timestep, sigmas)), shift));
        }
        self.variance_at(timestep as f64 / self.timesteps as f64, shift)
    }

    fn alphas_cumprod(&self, steps: usize, shift: f64) -> Vec<f64> {
        let mut alphas_cumprod: Vec<f64> = (0..steps)
            .map(|i| self.variance_at((steps - i) as f64 / steps as f64, shift))
            .collect();
        alphas_cumprod.push(1.0);
        alphas_cumprod
    }
}

// ----------------------------------------------------------------------------
// Karras
// ----------------------------------------------------------------------------

/// Karras et al. rho-spaced sigma schedule
#[derive(Debug, Clone)]
pub struct KarrasDiscretization {
    objective: Objective,
    timesteps: f32,
    sigma_min: f64,
    sigma_max: f64,
    rho: f64,
    sigmas: Option<Vec<f64>>,
}

impl KarrasDiscretization {
    pub fn new(parameterization: Parameterization, objective: Objective) -> Self {
        Self::with_rho(parameterization, objective, 7.0)
    }

    pub fn with_rho(parameterization: Parameterization, objective: Objective, rho: f64) -> Self {
        match parameterization {
            Parameterization::Edm(edm) => Self {
                objective,
                timesteps: 1.0,
                sigma_min: edm.sigma_min,
                sigma_max: edm.sigma_max,
                rho,
                sigmas: None,
            },
            Parameterization::Ddpm(ddpm) => {
                let sigmas = ddpm.sigmas();
                Self {
                    objective,
                    timesteps: ddpm.timesteps as f32,
                    sigma_min: sigmas[1],
                    sigma_max: sigmas[sigmas.len() - 2],
                    rho,
                    sigmas: Some(sigmas),
                }
            }
        }
    }

    fn inv_rho_bounds(&self) -> (f64, f64) {
        (
            self.sigma_min.powf(1.0 / self.rho),
            self.sigma_max.powf(1.0 / self.rho),
        )
    }
}

impl Discretization for KarrasDiscretization {
    fn objective(&self) -> Objective {
        self.objective
    }

    fn timesteps(&self) -> f32 {
        self.timesteps
    }

    fn timestep_for(&self, alpha_cumprod: f64) -> f32 {
        if let Some(sigmas) = &self.sigmas {
            return timestep_in_sigmas(alpha_cumprod, sigmas);
        }
        let (min_inv_rho, max_inv_rho) = self.inv_rho_bounds();
        let sigma = sigma_of(alpha_cumprod);
        let t = 1.0 - (sigma.powf(1.0 / self.rho) - max_inv_rho) / (min_inv_rho - max_inv_rho);
        (t as f32).clamp(0.0, 1.0) * self.timesteps
    }

    fn alpha_cumprod_at(&self, timestep: f32, shift: f64) -> f64 {
        if let Some(sigmas) = &self.sigmas {
            return alpha_of(shift_sigma(sigma_of(alpha_cumprod_in_sigmas(timestep, sigmas)), shift));
        }
        let (min_inv_rho, max_inv_rho) = self.inv_rho_bounds();
        let ramp = 1.0 - timestep as f64 / self.timesteps as f64;
        let sigma = (max_inv_rho + ramp * (min_inv_rho - max_inv_rho)).powf(self.rho);
        alpha_of(shift_sigma(sigma, shift))
    }

    fn alphas_cumprod(&self, steps: usize, shift: f64) -> Vec<f64> {
        let (min_inv_rho, max_inv_rho) = self.inv_rho_bounds();
        let denom = steps.saturating_sub(1).max(1) as f64;
        let mut alphas_cumprod: Vec<f64> = (0..steps)
            .map(|i| {
                let sigma = (max_inv_rho + i as f64 * (min_inv_rho - max_inv_rho) / denom)
                    .powf(self.rho);
                alpha_of(shift_sigma(sigma, shift))
            })
            .collect();
        alphas_cumprod.push(1.0);
        alphas_cumprod
    }
}

// ----------------------------------------------------------------------------
// Linear
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum LinearTable {
    Ddpm {
        objective: Objective,
        is_legacy: bool,
        alphas_cumprod: Vec<f64>,
        sigmas: Vec<f64>,
    },
    Edm(KarrasDiscretization),
}

/// Evenly spaced training timesteps with log-sigma interpolation
///
/// The legacy variant reproduces the original Stable Diffusion DDIM spacing.
#[derive(Debug, Clone)]
pub struct LinearDiscretization {
    table: LinearTable,
}

impl LinearDiscretization {
    pub fn new(parameterization: Parameterization, objective: Objective) -> Self {
        Self::with_legacy(parameterization, objective, false)
    }

    pub fn with_legacy(
        parameterization: Parameterization,
        objective: Objective,
        is_legacy: bool,
    ) -> Self {
        let table = match parameterization {
            Parameterization::Edm(_) => {
                LinearTable::Edm(KarrasDiscretization::new(parameterization, objective))
            }
            Parameterization::Ddpm(ddpm) => {
                let alphas_cumprod = ddpm.alphas_cumprod();
                let sigmas = alphas_cumprod.iter().map(|&a| sigma_of(a)).collect();
                LinearTable::Ddpm {
                    objective,
                    is_legacy,
                    alphas_cumprod,
                    sigmas,
                }
            }
        };
        Self { table }
    }

    /// Training alphas cumprod, empty for EDM parameterizations
    pub fn training_alphas_cumprod(&self) -> &[f64] {
        match &self.table {
            LinearTable::Ddpm { alphas_cumprod, .. } => alphas_cumprod,
            LinearTable::Edm(_) => &[],
        }
    }
}

impl Discretization for LinearDiscretization {
    fn objective(&self) -> Objective {
        match &self.table {
            LinearTable::Ddpm { objective, .. } => *objective,
            LinearTable::Edm(karras) => karras.objective(),
        }
    }

    fn timesteps(&self) -> f32 {
        match &self.table {
            LinearTable::Ddpm { alphas_cumprod, .. } => alphas_cumprod.len() as f32,
            LinearTable::Edm(karras) => karras.timesteps(),
        }
    }

    fn timestep_for(&self, alpha_cumprod: f64) -> f32 {
        match &self.table {
            LinearTable::Ddpm { sigmas, .. } => timestep_in_sigmas(alpha_cumprod, sigmas),
            LinearTable::Edm(karras) => karras.timestep_for(alpha_cumprod),
        }
    }

    /// Between two table entries the sigma is interpolated geometrically
    /// instead of snapping to the nearest entry, so a fractional img2img
    /// start lands slightly off the rounded timestep.
    fn alpha_cumprod_at(&self, timestep: f32, shift: f64) -> f64 {
        match &self.table {
            LinearTable::Ddpm { sigmas, .. } => {
                let alpha_cumprod = alpha_cumprod_in_sigmas(timestep, sigmas);
                alpha_of(shift_sigma(sigma_of(alpha_cumprod), shift))
            }
            LinearTable::Edm(karras) => karras.alpha_cumprod_at(timestep, shift),
        }
    }

    fn alphas_cumprod(&self, steps: usize, shift: f64) -> Vec<f64> {
        let (is_legacy, sigmas) = match &self.table {
            LinearTable::Ddpm {
                is_legacy, sigmas, ..
            } => (*is_legacy, sigmas),
            LinearTable::Edm(karras) => return karras.alphas_cumprod(steps, shift),
        };
        let internal = sigmas.len();
        let mut alphas_cumprod: Vec<f64> = (0..steps)
            .map(|i| {
                let timestep = if is_legacy {
                    (steps - 1 - i) as f64 / steps as f64 * internal as f64 + 1.0
                } else {
                    (steps - 1 - i) as f64 / steps.saturating_sub(1).max(1) as f64
                        * (internal - 1) as f64
                };
                let low = (timestep.floor() as usize).min(internal - 1);
                let high = (low + 1).min(internal - 1);
                let w = (timestep - low as f64).clamp(0.0, 1.0);
                let sigma = ((1.0 - w) * sigmas[low].ln() + w * sigmas[high].ln()).exp();
                alpha_of(shift_sigma(sigma, shift))
            })
            .collect();
        alphas_cumprod.push(1.0);
        alphas_cumprod
    }
}

/// Linear schedule whose per-step training timesteps are chosen by the caller
///
/// `manual(steps)` must return `steps + 1` training timesteps, noisiest first;
/// otherwise the plain linear spacing is used.
#[derive(Clone)]
pub struct LinearManualDiscretization {
    linear: LinearDiscretization,
    manual: Arc<dyn Fn(usize) -> Vec<usize> + Send + Sync>,
}

impl LinearManualDiscretization {
    pub fn new(
        parameterization: Parameterization,
        objective: Objective,
        manual: impl Fn(usize) -> Vec<usize> + Send + Sync + 'static,
    ) -> Self {
        Self {
            linear: LinearDiscretization::new(parameterization, objective),
            manual: Arc::new(manual),
        }
    }
}

impl fmt::Debug for LinearManualDiscretization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinearManualDiscretization")
            .field("linear", &self.linear)
            .finish_non_exhaustive()
    }
}

impl Discretization for LinearManualDiscretization {
    fn objective(&self) -> Objective {
        self.linear.objective()
    }

    fn timesteps(&self) -> f32 {
        self.linear.timesteps()
    }

    fn timestep_for(&self, alpha_cumprod: f64) -> f32 {
        self.linear.timestep_for(alpha_cumprod)
    }

    fn alpha_cumprod_at(&self, timestep: f32, shift: f64) -> f64 {
        self.linear.alpha_cumprod_at(timestep, shift)
    }

    fn alphas_cumprod(&self, steps: usize, shift: f64) -> Vec<f64> {
        let training = self.linear.training_alphas_cumprod();
        if training.is_empty() || steps == 0 {
            return self.linear.alphas_cumprod(steps, shift);
        }
        let manual = (self.manual)(steps);
        if manual.len() != steps + 1 {
            return self.linear.alphas_cumprod(steps, shift);
        }
        // The manual list already names the terminal timestep, so the table
        // ends with that entry rather than a synthetic 1.0.
        manual
            .iter()
            .map(|&t| {
                let alpha_cumprod = training[t.min(training.len() - 1)];
                alpha_of(shift_sigma(sigma_of(alpha_cumprod), shift))
            })
            .collect()
    }
}

// ----------------------------------------------------------------------------
// Flow matching
// ----------------------------------------------------------------------------

/// Rectified-flow schedule for velocity ("u") objectives
///
/// `alpha_cumprod = 1 - t` with `t` the interpolation time; `shift` applies
/// the usual resolution-dependent warp `t' = shift t / (1 + (shift - 1) t)`.
#[derive(Debug, Clone)]
pub struct FlowMatchingDiscretization {
    objective: Objective,
    timesteps: f32,
}

impl FlowMatchingDiscretization {
    pub fn new(timesteps: f32) -> Self {
        Self {
            objective: Objective::U {
                condition_scale: timesteps as f64,
            },
            timesteps,
        }
    }

    fn shifted(t: f64, shift: f64) -> f64 {
        if shift == 1.0 {
            t
        } else {
            shift * t / (1.0 + (shift - 1.0) * t)
        }
    }
}

impl Default for FlowMatchingDiscretization {
    fn default() -> Self {
        Self::new(1000.0)
    }
}

impl Discretization for FlowMatchingDiscretization {
    fn objective(&self) -> Objective {
        self.objective
    }

    fn timesteps(&self) -> f32 {
        self.timesteps
    }

    fn timestep_for(&self, alpha_cumprod: f64) -> f32 {
        ((1.0 - alpha_cumprod) * self.timesteps as f64) as f32
    }

    fn alpha_cumprod_at(&self, timestep: f32, shift: f64) -> f64 {
        let t = (timestep as f64 / self.timesteps as f64).clamp(0.0, 1.0);
        1.0 - Self::shifted(t, shift)
    }

    fn alphas_cumprod(&self, steps: usize, shift: f64) -> Vec<f64> {
        let mut alphas_cumprod: Vec<f64> = (0..steps)
            .map(|i| 1.0 - Self::shifted((steps - i) as f64 / steps as f64, shift))
            .collect();
        alphas_cumprod.push(1.0);
        alphas_cumprod
    }
}

// ============================================================================
// Strength mapping and scale factors
// ============================================================================

/// Map an img2img strength onto the schedule by scanning for the bracketing
/// timesteps (sigma-space integrators)
pub fn strength_to_step(
    discretization: &dyn Discretization,
    strength: f32,
    sampling: Sampling,
) -> StrengthMapping {
    let init_timestep = strength * discretization.timesteps();
    let alphas_cumprod = discretization.alphas_cumprod(sampling.steps, sampling.shift);
    let mut previous_timestep = discretization.timesteps();
    for (i, &alpha_cumprod) in alphas_cumprod.iter().enumerate() {
        let timestep = discretization.timestep_for(alpha_cumprod);
        if init_timestep >= timestep {
            if i == 0 {
                return StrengthMapping {
                    timestep,
                    start_step: 0.0,
                    rounded_down_start_step: 0,
                    rounded_up_start_step: 0,
                };
            }
            if init_timestep <= timestep + 1e-3 {
                return StrengthMapping {
                    timestep: init_timestep,
                    start_step: i as f32,
                    rounded_down_start_step: i,
                    rounded_up_start_step: i,
                };
            }
            return StrengthMapping {
                timestep: init_timestep,
                start_step: (i - 1) as f32
                    + (init_timestep - previous_timestep) / (timestep - previous_timestep),
                rounded_down_start_step: i - 1,
                rounded_up_start_step: i,
            };
        }
        previous_timestep = timestep;
    }
    let last = alphas_cumprod.len() - 1;
    StrengthMapping {
        timestep: discretization.timestep_for(alphas_cumprod[0]),
        start_step: last as f32,
        rounded_down_start_step: last,
        rounded_up_start_step: last,
    }
}

/// Map an img2img strength onto an integral start step (DDPM-space integrators)
pub fn strength_to_integral_step(
    discretization: &dyn Discretization,
    strength: f32,
    sampling: Sampling,
) -> StrengthMapping {
    let encoded = ((strength.clamp(0.0, 1.0) * sampling.steps as f32) as usize).min(sampling.steps);
    let start_step = sampling.steps - encoded;
    let alphas_cumprod = discretization.alphas_cumprod(sampling.steps, sampling.shift);
    StrengthMapping {
        timestep: discretization.timestep_for(alphas_cumprod[start_step]),
        start_step: start_step as f32,
        rounded_down_start_step: start_step,
        rounded_up_start_step: start_step,
    }
}

/// Sigma at a fractional step, interpolated in timestep space
pub fn interpolated_sigma(
    discretization: &dyn Discretization,
    step: f32,
    sampling: Sampling,
) -> f64 {
    let alphas_cumprod = discretization.alphas_cumprod(sampling.steps, sampling.shift);
    let alpha_cumprod = discretization.interpolated_alpha_cumprod(&alphas_cumprod, step);
    discretization.sigma_from(alpha_cumprod)
}

/// Alpha cumprod at the step nearest to `step`
pub fn rounded_alpha_cumprod(
    discretization: &dyn Discretization,
    step: f32,
    sampling: Sampling,
) -> f64 {
    let alphas_cumprod = discretization.alphas_cumprod(sampling.steps, sampling.shift);
    let index = (step.round().max(0.0) as usize).min(alphas_cumprod.len() - 1);
    alphas_cumprod[index]
}

// ============================================================================
// Multi-step helpers
// ============================================================================

/// Adams-Bashforth coefficients, newest sample first
pub fn adams_bashforth_coefficients(order: usize) -> Vec<f64> {
    match order {
        1 => vec![1.0],
        2 => vec![1.5, -0.5],
        3 => vec![23.0 / 12.0, -16.0 / 12.0, 5.0 / 12.0],
        4 => vec![55.0 / 24.0, -59.0 / 24.0, 37.0 / 24.0, -9.0 / 24.0],
        _ => vec![1.0],
    }
}

/// Split a step from `sigma` to `sigma_next` into deterministic and injected noise
///
/// Returns `(sigma_down, sigma_up)`. `eta` scales the injected part
/// (0 = ODE, 1 = full ancestral).
pub fn get_ancestral_step(sigma: f64, sigma_next: f64, eta: f64) -> (f64, f64) {
    if sigma_next == 0.0 {
        return (0.0, 0.0);
    }
    let unscaled =
        (sigma_next.powi(2) * (sigma.powi(2) - sigma_next.powi(2)) / sigma.powi(2)).sqrt();
    let sigma_up = (eta * unscaled).min(sigma_next);
    let sigma_down = (sigma_next.powi(2) - sigma_up.powi(2)).sqrt();
    (sigma_down, sigma_up)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discretizations() -> Vec<SharedDiscretization> {
        let ddpm = Parameterization::Ddpm(DdpmParameters::default());
        let edm = Parameterization::Edm(EdmParameters::default());
        vec![
            Arc::new(LinearDiscretization::new(ddpm, Objective::Epsilon)),
            Arc::new(LinearDiscretization::with_legacy(ddpm, Objective::Epsilon, true)),
            Arc::new(KarrasDiscretization::new(ddpm, Objective::V)),
            Arc::new(KarrasDiscretization::new(edm, Objective::Edm { sigma_data: 0.5 })),
            Arc::new(CosineDiscretization::new(ddpm, Objective::Epsilon)),
            Arc::new(CosineDiscretization::new(edm, Objective::Edm { sigma_data: 0.5 })),
            Arc::new(FlowMatchingDiscretization::default()),
        ]
    }

    #[test]
    fn test_sigmas_strictly_decreasing() {
        for discretization in discretizations() {
            for &(steps, shift) in &[(1usize, 1.0), (4, 1.0), (20, 1.0), (30, 3.0), (8, 0.5)] {
                let alphas = discretization.alphas_cumprod(steps, shift);
                assert_eq!(alphas.len(), steps + 1, "{:?}", discretization);
                assert_eq!(*alphas.last().unwrap(), 1.0);
                assert!(alphas[0] >= 0.0 && alphas[0] <= 1.0);
                let sigmas = discretization.sigmas(steps, shift);
                for pair in sigmas.windows(2) {
                    assert!(
                        pair[0] > pair[1],
                        "{:?} steps={} shift={}: {:?}",
                        discretization,
                        steps,
                        shift,
                        sigmas
                    );
                }
            }
        }
    }

    #[test]
    fn test_timestep_round_trip() {
        for discretization in discretizations() {
            let alphas = discretization.alphas_cumprod(20, 1.0);
            for &a in &alphas[..alphas.len() - 1] {
                let timestep = discretization.timestep_for(a);
                let back = discretization.alpha_cumprod_at(timestep, 1.0);
                let (sigma, sigma_back) = (discretization.sigma_from(a), discretization.sigma_from(back));
                assert!(
                    (sigma.ln() - sigma_back.ln()).abs() < 1e-3 || (a - back).abs() < 1e-6,
                    "{:?}: {} -> {} -> {}",
                    discretization,
                    a,
                    timestep,
                    back
                );
            }
        }
    }

    #[test]
    fn test_timesteps_grow_with_noise() {
        for discretization in discretizations() {
            let alphas = discretization.alphas_cumprod(10, 1.0);
            let timesteps: Vec<f32> = alphas.iter().map(|&a| discretization.timestep_for(a)).collect();
            for pair in timesteps.windows(2) {
                assert!(pair[0] >= pair[1], "{:?}: {:?}", discretization, timesteps);
            }
        }
    }

    #[test]
    fn test_flow_matching_shift() {
        let flow = FlowMatchingDiscretization::default();
        let plain = flow.alphas_cumprod(4, 1.0);
        assert_eq!(plain, vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        let shifted = flow.alphas_cumprod(4, 3.0);
        // t = 0.5 -> 3 * 0.5 / (1 + 2 * 0.5) = 0.75
        assert!((shifted[2] - 0.25).abs() < 1e-12);
        assert_eq!(flow.sigma_from(0.25), 0.75);
    }

    #[test]
    fn test_ddpm_alphas_cumprod() {
        let alphas = DdpmParameters::default().alphas_cumprod();
        assert_eq!(alphas.len(), 1000);
        assert!((alphas[0] - (1.0 - 0.00085)).abs() < 1e-9);
        assert!(alphas[999] < 0.01);
    }

    #[test]
    fn test_fractional_interpolates_timestep() {
        let discretization = LinearDiscretization::new(
            Parameterization::Ddpm(DdpmParameters::default()),
            Objective::Epsilon,
        );
        let alphas = discretization.alphas_cumprod(10, 1.0);
        let low = discretization.timestep_for(alphas[3]);
        let high = discretization.timestep_for(alphas[4]);
        let a = discretization.interpolated_alpha_cumprod(&alphas, 3.5);
        let t = discretization.timestep_for(a);
        assert!((t - (low + high) / 2.0).abs() < 0.5, "{} vs {}", t, (low + high) / 2.0);
        let exact = discretization.interpolated_alpha_cumprod(&alphas, 3.0);
        assert!((exact - alphas[3]).abs() < 1e-6);
    }

    #[test]
    fn test_linear_timestep_between_entries_is_log_sigma_midpoint() {
        let discretization = LinearDiscretization::new(
            Parameterization::Ddpm(DdpmParameters::default()),
            Objective::Epsilon,
        );
        let table = DdpmParameters::default().alphas_cumprod();
        let (low, high) = (sigma_of(table[100]), sigma_of(table[101]));
        let a = discretization.alpha_cumprod_at(100.5, 1.0);
        assert!((sigma_of(a) - (low * high).sqrt()).abs() < 1e-9);
        // neither neighbour
        assert!((a - table[100]).abs() > 1e-6 && (a - table[101]).abs() > 1e-6);
        assert!((discretization.alpha_cumprod_at(100.0, 1.0) - table[100]).abs() < 1e-12);
    }

    #[test]
    fn test_strength_mapping() {
        let discretization = KarrasDiscretization::new(
            Parameterization::Ddpm(DdpmParameters::default()),
            Objective::Epsilon,
        );
        let sampling = Sampling { steps: 20, shift: 1.0 };
        let full = strength_to_step(&discretization, 1.0, sampling);
        assert_eq!(full.start_step, 0.0);
        let half = strength_to_step(&discretization, 0.5, sampling);
        assert!(half.start_step > 0.0 && half.start_step < 20.0);
        assert_eq!(half.rounded_up_start_step, half.rounded_down_start_step + 1);
        let none = strength_to_step(&discretization, 0.0, sampling);
        assert_eq!(none.rounded_down_start_step, 20);

        let integral = strength_to_integral_step(&discretization, 0.75, sampling);
        assert_eq!(integral.start_step, 5.0);
        assert_eq!(integral.rounded_down_start_step, 5);
    }

    #[test]
    fn test_adams_bashforth_coefficients() {
        assert_eq!(adams_bashforth_coefficients(1), vec![1.0]);
        let c4 = adams_bashforth_coefficients(4);
        assert!((c4.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!((c4[0] - 55.0 / 24.0).abs() < 1e-12);
        assert!((c4[3] + 9.0 / 24.0).abs() < 1e-12);
    }

    #[test]
    fn test_ancestral_step() {
        let (down, up) = get_ancestral_step(2.0, 1.0, 1.0);
        assert!((down * down + up * up - 1.0).abs() < 1e-9);
        let (down, up) = get_ancestral_step(2.0, 1.0, 0.0);
        assert_eq!(up, 0.0);
        assert_eq!(down, 1.0);
        assert_eq!(get_ancestral_step(1.0, 0.0, 1.0), (0.0, 0.0));
    }

    #[test]
    fn test_step_position() {
        let p = StepPosition::new(3.25);
        assert_eq!(p.integral, 3);
        assert!(p.is_fractional());
        assert!(!StepPosition::at(4).is_fractional());
    }
}
