//! Euler Ancestral sampler
//!
//! Euler step to `sigma_down` followed by fresh noise of `sigma_up`, in sigma
//! space. Flow-matching latents use the closed form of the same split.

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::SamplerError;
use crate::inpaint::LatentSpace;
use crate::lifecycle::DenoiserNetwork;
use crate::objective::{combine, Objective, TimestepConditioning};
use crate::sampler::{remaining_conditioning, step_sigma, Run, SampleRequest, SamplerOutput};
use crate::scheduler::{get_ancestral_step, Discretization, SharedDiscretization};

/// Euler Ancestral configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EulerAncestralConfig {
    /// Eta for noise injection (0 = ODE, 1 = full ancestral)
    pub eta: f64,
}

impl Default for EulerAncestralConfig {
    fn default() -> Self {
        Self { eta: 1.0 }
    }
}

/// Euler Ancestral sampler
#[derive(Debug, Clone)]
pub struct EulerAncestralSampler {
    discretization: SharedDiscretization,
    conditioning: TimestepConditioning,
    config: EulerAncestralConfig,
}

impl EulerAncestralSampler {
    pub fn new(
        discretization: SharedDiscretization,
        conditioning: TimestepConditioning,
        config: EulerAncestralConfig,
    ) -> Self {
        Self {
            discretization,
            conditioning,
            config,
        }
    }

    pub fn discretization(&self) -> &dyn Discretization {
        self.discretization.as_ref()
    }

    pub fn sample<B: Backend, N: DenoiserNetwork<B>>(
        &self,
        request: SampleRequest<'_, B, N>,
    ) -> Result<SamplerOutput<B, N>, SamplerError<N>> {
        if request.is_degenerate() {
            return Ok(request.into_passthrough());
        }
        let discretization = self.discretization.as_ref();
        let objective = discretization.objective();
        let sampling = request.sampling;
        let start = request.start;
        let alphas_cumprod = discretization.alphas_cumprod(sampling.steps, sampling.shift);
        let sigmas = discretization.sigmas(sampling.steps, sampling.shift);
        let first_sigma = step_sigma(discretization, &alphas_cumprod, &sigmas, start.integral, start);
        let timesteps = remaining_conditioning(
            discretization,
            self.conditioning,
            &alphas_cumprod,
            start.integral,
            request.end.integral,
            discretization.alpha_cumprod_from(first_sigma),
        );

        let (mut run, mut x) = Run::begin(request, "euler_ancestral", discretization, timesteps)?;
        // img2img starts arrive already scaled by the noise scale factor
        if start.fractional == 0.0 && sigmas[0] != 1.0 {
            x = x.mul_scalar(sigmas[0] as f32);
        }
        let mut old_denoised: Option<Tensor<B, 4>> = None;
        for i in run.start..run.end {
            let sigma = step_sigma(discretization, &alphas_cumprod, &sigmas, i, start);
            let alpha_cumprod = discretization.alpha_cumprod_from(sigma);
            run.report(i, old_denoised.as_ref())?;
            let timestep = discretization.timestep_for(alpha_cumprod);
            let remaining = remaining_conditioning(
                discretization,
                self.conditioning,
                &alphas_cumprod,
                i,
                run.end,
                alpha_cumprod,
            );
            run.maybe_switch(i, timestep, remaining)?;

            let input = x.clone().mul_scalar(objective.input_scale(sigma) as f32);
            let conditioning_value = discretization.conditioning_value(alpha_cumprod, self.conditioning);
            let et = run.evaluate(i, input, timestep, conditioning_value, None)?;

            let sigma_next = sigmas[i + 1];
            let (sigma_down, sigma_up) = get_ancestral_step(sigma, sigma_next, self.config.eta);
            let denoised = objective.denoised(x.clone(), et.clone(), sigma);
            x = match objective {
                Objective::U { .. } => combine(
                    x,
                    1.0 - sigma_next + sigma_down,
                    et,
                    sigma_down - sigma * sigma_down - sigma * (1.0 - sigma_next),
                ),
                _ => {
                    let d = objective.derivative(x.clone(), et, sigma);
                    // dt is negative
                    combine(x, 1.0, d, sigma_down - sigma)
                }
            };
            old_denoised = Some(denoised);
            if sigma_up > 0.0 {
                let noise = run.noise(&x);
                x = x + noise.mul_scalar(sigma_up as f32);
            }
            x = run.blend(i, x, LatentSpace::Sigma, alphas_cumprod[i + 1]);
        }
        run.finish(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::SamplerKind;
    use crate::scheduler::StepPosition;
    use crate::testing::{assert_close, latent, linear_epsilon, sample_oracle, values};

    #[test]
    fn test_converges_to_clean_sample() {
        let output = sample_oracle(SamplerKind::EulerAncestral, latent(1.0), 10, StepPosition::at(0), 0.5);
        assert_eq!(output.networks.len(), 1);
        assert_eq!(output.networks[0].calls, 10);
        assert_close(&values(output.x), 0.5, 1e-3);
    }

    #[test]
    fn test_noise_conditioning_is_sigma() {
        let output = sample_oracle(SamplerKind::EulerAncestral, latent(1.0), 4, StepPosition::at(0), 0.0);
        let sigmas = linear_epsilon().sigmas(4, 1.0);
        let seen = &output.networks[0].timesteps;
        assert_eq!(seen.len(), 4);
        for (seen, sigma) in seen.iter().zip(sigmas.iter()) {
            assert!((*seen as f64 - sigma).abs() / sigma < 1e-5);
        }
    }

    #[test]
    fn test_eta_zero_skips_noise() {
        let (down, up) = get_ancestral_step(2.0, 1.0, 0.0);
        assert_eq!(up, 0.0);
        assert_eq!(down, 1.0);
    }
}
