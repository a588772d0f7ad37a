//! Analytic denoiser for Gaussian data
//!
//! If the data distribution is `N(mean, std^2)` the MMSE denoiser has a
//! closed form, so the integrators can be exercised end to end without any
//! weights. A sound integrator ends on samples with the data statistics.

use std::marker::PhantomData;

use burn::prelude::*;
use burn_diffusion_samplers::{
    DenoiserNetwork, ModelVersion, NetworkConfiguration, NetworkError, NetworkInput, Objective,
    SharedDiscretization, TimestepConditioning,
};

use crate::config::DataDistribution;

#[derive(Debug)]
pub struct GaussianDenoiser<B: Backend> {
    pub file_path: String,
    version: ModelVersion,
    discretization: SharedDiscretization,
    conditioning: TimestepConditioning,
    data: DataDistribution,
    pub calls: usize,
    _backend: PhantomData<B>,
}

impl<B: Backend> GaussianDenoiser<B> {
    pub fn new(
        configuration: &NetworkConfiguration,
        discretization: SharedDiscretization,
        conditioning: TimestepConditioning,
        data: DataDistribution,
    ) -> Self {
        Self {
            file_path: configuration.file_path.clone(),
            version: configuration.version,
            discretization,
            conditioning,
            data,
            calls: 0,
            _backend: PhantomData,
        }
    }

    /// Alpha cumprod the network is being asked about
    fn alpha_cumprod(&self, value: f32) -> f64 {
        let discretization = self.discretization.as_ref();
        let value = value as f64;
        let alpha_cumprod = match self.conditioning {
            TimestepConditioning::Timestep => discretization.alpha_cumprod_at(value as f32, 1.0),
            TimestepConditioning::Noise => match discretization.objective() {
                Objective::U { condition_scale } => 1.0 - value / condition_scale,
                Objective::V => discretization.alpha_cumprod_from((4.0 * value).exp()),
                Objective::Edm { sigma_data } => {
                    discretization.alpha_cumprod_from((value / (sigma_data * sigma_data)).exp())
                }
                Objective::Epsilon => discretization.alpha_cumprod_from(value),
            },
        };
        alpha_cumprod.clamp(0.0, 1.0)
    }

    /// Network output for DDPM-space (or flow-space) latent `z`
    pub fn predict(&self, z: Tensor<B, 4>, alpha_cumprod: f64) -> Result<Tensor<B, 4>, NetworkError> {
        let objective = self.discretization.objective();
        let (signal, noise) = if objective.is_flow() {
            (alpha_cumprod, 1.0 - alpha_cumprod)
        } else {
            (alpha_cumprod.sqrt(), (1.0 - alpha_cumprod).sqrt())
        };
        let mean = self.data.mean as f64;
        let variance = (self.data.std as f64).powi(2);
        // posterior mean of x0 given z = signal * x0 + noise * eps
        let gain = variance * signal / (signal * signal * variance + noise * noise);
        let x0 = z.clone().sub_scalar(signal * mean).mul_scalar(gain).add_scalar(mean);
        let noise = noise.max(1e-8);
        let eps = (z.clone() - x0.clone().mul_scalar(signal)).div_scalar(noise);
        Ok(match objective {
            Objective::Epsilon => eps,
            Objective::V => eps.mul_scalar(signal) - x0.mul_scalar(noise),
            Objective::U { .. } => (z - x0).div_scalar(noise),
            Objective::Edm { .. } => {
                return Err(NetworkError::Evaluation(
                    "the analytic denoiser does not model EDM preconditioning".into(),
                ))
            }
        })
    }
}

impl<B: Backend> DenoiserNetwork<B> for GaussianDenoiser<B> {
    fn version(&self) -> ModelVersion {
        self.version
    }

    fn forward(&mut self, input: NetworkInput<B>) -> Result<Tensor<B, 4>, NetworkError> {
        self.calls += 1;
        let alpha_cumprod = self.alpha_cumprod(input.timestep);
        tracing::trace!(step = input.step, alpha_cumprod, "analytic denoiser");
        self.predict(input.latent, alpha_cumprod)
    }
}
