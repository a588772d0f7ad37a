//! Denoising objectives
//!
//! Converts raw network output into a denoised estimate, an ODE derivative
//! or a predicted clean sample, depending on what the network was trained to
//! predict. Two latent conventions are used by the integrators:
//!
//! - *sigma space*: `x = x0 + sigma * eps` (Karras/k-diffusion style)
//! - *DDPM space*: `x = sqrt(a) * x0 + sqrt(1 - a) * eps`
//!
//! Flow-matching ("u") latents are `x = (1 - t) * x0 + t * eps` in both.

use burn::prelude::*;
use serde::{Deserialize, Serialize};

/// What the denoiser network predicts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Objective {
    /// Added noise
    Epsilon,
    /// Velocity `sqrt(a) eps - sqrt(1 - a) x0`
    V,
    /// EDM preconditioned output
    Edm { sigma_data: f64 },
    /// Rectified-flow velocity `eps - x0`; timestep scaled by `condition_scale`
    U { condition_scale: f64 },
}

impl Default for Objective {
    fn default() -> Self {
        Objective::Epsilon
    }
}

/// Which scalar the network is conditioned on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestepConditioning {
    /// Objective-specific function of sigma
    Noise,
    /// Training timestep
    #[default]
    Timestep,
}

impl Objective {
    /// True for flow-matching objectives
    pub fn is_flow(&self) -> bool {
        matches!(self, Objective::U { .. })
    }

    pub fn sigma_from(&self, alpha_cumprod: f64) -> f64 {
        match self {
            Objective::U { .. } => 1.0 - alpha_cumprod,
            _ => ((1.0 - alpha_cumprod) / alpha_cumprod).sqrt(),
        }
    }

    pub fn alpha_cumprod_from(&self, sigma: f64) -> f64 {
        match self {
            Objective::U { .. } => 1.0 - sigma,
            _ => 1.0 / (sigma * sigma + 1.0),
        }
    }

    /// Noise conditioning value for a schedule point
    pub fn noise_for(&self, alpha_cumprod: f64) -> f32 {
        if let Objective::U { condition_scale } = self {
            return ((1.0 - alpha_cumprod) * condition_scale) as f32;
        }
        let sigma = ((1.0 - alpha_cumprod) / alpha_cumprod).sqrt();
        let noise = match self {
            Objective::Edm { sigma_data } => sigma_data * sigma_data * sigma.ln(),
            Objective::V => 0.25 * sigma.ln(),
            _ => sigma,
        };
        noise as f32
    }

    /// Scale applied to a sigma-space latent before it is fed to the network
    pub fn input_scale(&self, sigma: f64) -> f64 {
        match self {
            Objective::U { .. } => 1.0,
            Objective::Edm { sigma_data } => 1.0 / (sigma * sigma + sigma_data * sigma_data).sqrt(),
            Objective::Epsilon | Objective::V => 1.0 / (sigma * sigma + 1.0).sqrt(),
        }
    }

    /// Coefficients `(c_x, c_out)` with `denoised = c_x * x + c_out * out`
    /// for a sigma-space latent
    pub fn denoised_coefficients(&self, sigma: f64) -> (f64, f64) {
        match self {
            Objective::Epsilon | Objective::U { .. } => (1.0, -sigma),
            Objective::V => {
                let sqrt_alpha = 1.0 / (sigma * sigma + 1.0).sqrt();
                (1.0 / (sigma * sigma + 1.0), -sigma * sqrt_alpha)
            }
            Objective::Edm { sigma_data } => {
                let sd2 = sigma_data * sigma_data;
                let norm = (sigma * sigma + sd2).sqrt();
                (sd2 / (sigma * sigma + sd2), sigma * sigma_data / norm)
            }
        }
    }

    /// Denoised estimate from a sigma-space latent
    pub fn denoised<B: Backend>(
        &self,
        x: Tensor<B, 4>,
        output: Tensor<B, 4>,
        sigma: f64,
    ) -> Tensor<B, 4> {
        let (c_x, c_out) = self.denoised_coefficients(sigma);
        combine(x, c_x, output, c_out)
    }

    /// ODE derivative `(x - denoised) / sigma`; the velocity itself for flows
    pub fn derivative<B: Backend>(
        &self,
        x: Tensor<B, 4>,
        output: Tensor<B, 4>,
        sigma: f64,
    ) -> Tensor<B, 4> {
        match self {
            Objective::Epsilon | Objective::U { .. } => output,
            Objective::V => {
                let sqrt_alpha = 1.0 / (sigma * sigma + 1.0).sqrt();
                combine(x, sigma / (sigma * sigma + 1.0), output, sqrt_alpha)
            }
            Objective::Edm { sigma_data } => {
                let sd2 = sigma_data * sigma_data;
                let norm = (sigma * sigma + sd2).sqrt();
                combine(x, sigma / (sigma * sigma + sd2), output, -sigma_data / norm)
            }
        }
    }

    /// Predicted clean sample from a DDPM-space latent
    pub fn predicted_x0<B: Backend>(
        &self,
        x: Tensor<B, 4>,
        output: Tensor<B, 4>,
        alpha_cumprod: f64,
    ) -> Tensor<B, 4> {
        let sigma = self.sigma_from(alpha_cumprod);
        if self.is_flow() {
            return combine(x, 1.0, output, -sigma);
        }
        let (c_x, c_out) = self.denoised_coefficients(sigma);
        combine(x, c_x / alpha_cumprod.sqrt(), output, c_out)
    }

    /// Noise estimate from a DDPM-space latent and the network output
    pub fn predicted_noise<B: Backend>(
        &self,
        x: Tensor<B, 4>,
        output: Tensor<B, 4>,
        alpha_cumprod: f64,
    ) -> Tensor<B, 4> {
        match self {
            Objective::Epsilon => output,
            Objective::V => combine(
                output,
                alpha_cumprod.sqrt(),
                x,
                (1.0 - alpha_cumprod).sqrt(),
            ),
            Objective::U { .. } => combine(x, 1.0, output, alpha_cumprod),
            Objective::Edm { .. } => {
                let x0 = self.predicted_x0(x.clone(), output, alpha_cumprod);
                let sqrt_alpha = alpha_cumprod.sqrt();
                let sqrt_one_minus = (1.0 - alpha_cumprod).sqrt().max(f64::EPSILON);
                combine(x, 1.0 / sqrt_one_minus, x0, -sqrt_alpha / sqrt_one_minus)
            }
        }
    }
}

/// `a * x + b * y` with scalar coefficients
pub fn combine<B: Backend>(x: Tensor<B, 4>, a: f64, y: Tensor<B, 4>, b: f64) -> Tensor<B, 4> {
    x.mul_scalar(a as f32) + y.mul_scalar(b as f32)
}
