//! DPM++ SDE sampler
//!
//! Two network evaluations per step: an ancestral half step to the geometric
//! midpoint `sqrt(sigma * sigma_next)`, then a full step using the midpoint's
//! denoised estimate. The injected noise is a Brownian bridge split at each
//! sub-step, so consecutive observations stay correlated like a single
//! Brownian path from `sigma` down to zero.

use burn::prelude::*;

use crate::error::SamplerError;
use crate::inpaint::LatentSpace;
use crate::lifecycle::DenoiserNetwork;
use crate::objective::{combine, TimestepConditioning};
use crate::sampler::{remaining_conditioning, step_sigma, Run, SampleRequest, SamplerOutput};
use crate::scheduler::{get_ancestral_step, Discretization, SharedDiscretization};

/// DPM++ SDE sampler
#[derive(Debug, Clone)]
pub struct DpmPpSdeSampler {
    discretization: SharedDiscretization,
    conditioning: TimestepConditioning,
}

impl DpmPpSdeSampler {
    pub fn new(discretization: SharedDiscretization, conditioning: TimestepConditioning) -> Self {
        Self {
            discretization,
            conditioning,
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

        let (mut run, mut x) = Run::begin(request, "dpmpp_sde", discretization, timesteps)?;
        if start.fractional == 0.0 && sigmas[0] != 1.0 {
            x = x.mul_scalar(sigmas[0] as f32);
        }
        let is_flow = objective.is_flow();
        // Brownian state at the current sigma, W(sigma) ~ N(0, sigma)
        let brownian = run.noise(&x);
        let mut brownian = brownian.mul_scalar(first_sigma.sqrt() as f32);
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

            if i + 1 >= sampling.steps {
                let d = objective.derivative(x.clone(), et, sigma);
                x = combine(x, 1.0, d, sigma_next - sigma);
                x = run.blend(i, x, LatentSpace::Sigma, alphas_cumprod[i + 1]);
                continue;
            }

            let denoised = objective.denoised(x.clone(), et, sigma);
            // first half: sigma -> sigma_s
            let sigma_s = (sigma * sigma_next).sqrt();
            let (sigma_down_1, sigma_up_1) = get_ancestral_step(sigma, sigma_s, 1.0);
            let w1 = sigma_down_1 / sigma;
            let denoised_weight = if is_flow {
                1.0 - w1 + sigma_down_1 - sigma_s
            } else {
                1.0 - w1
            };
            let mut x2 = combine(x.clone(), w1, denoised.clone(), denoised_weight);

            // split W over [sigma_s, sigma] (right) and [0, sigma_s] (left)
            let left_over_h = sigma_s / sigma;
            let right_diff = sigma - sigma_s;
            let z = run.noise(&x);
            let left_w = combine(brownian.clone(), left_over_h, z, (right_diff * left_over_h).sqrt());
            let right_w = brownian - left_w.clone();
            x2 = combine(x2, 1.0, right_w.clone(), sigma_up_1 / right_diff.sqrt());

            let alpha_cumprod_s = discretization.alpha_cumprod_from(sigma_s);
            let timestep_s = discretization.timestep_for(alpha_cumprod_s);
            let input = x2.clone().mul_scalar(objective.input_scale(sigma_s) as f32);
            let conditioning_value = discretization.conditioning_value(alpha_cumprod_s, self.conditioning);
            let et = run.evaluate(i, input, timestep_s, conditioning_value, None)?;
            let denoised_2 = objective.denoised(x2, et, sigma_s);

            // second half: sigma -> sigma_next with the midpoint estimate
            let (sigma_down_2, sigma_up_2) = get_ancestral_step(sigma, sigma_next, 1.0);
            let w2 = sigma_down_2 / sigma;
            let denoised_weight = if is_flow {
                1.0 - w2 + sigma_down_2 - sigma_next
            } else {
                1.0 - w2
            };
            x = combine(x, w2, denoised_2, denoised_weight);

            let left_over_h = sigma_next / sigma_s;
            let right_diff = sigma_s - sigma_next;
            let z = run.noise(&x);
            let left_w_2 = combine(left_w.clone(), left_over_h, z, (right_diff * left_over_h).sqrt());
            let right_w_2 = left_w - left_w_2.clone() + right_w;
            x = combine(x, 1.0, right_w_2, sigma_up_2 / (sigma - sigma_next).sqrt());
            brownian = left_w_2;
            old_denoised = Some(denoised);
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
    use crate::testing::{assert_close, latent, sample_oracle, values};

    #[test]
    fn test_two_evaluations_per_step() {
        let output = sample_oracle(SamplerKind::DpmPpSde, latent(1.0), 6, StepPosition::at(0), 0.75);
        // the last step is a single Euler step
        assert_eq!(output.networks[0].calls, 11);
        assert_close(&values(output.x), 0.75, 1e-3);
    }

    #[test]
    fn test_midpoint_conditioning() {
        let output = sample_oracle(SamplerKind::DpmPpSde, latent(1.0), 3, StepPosition::at(0), 0.0);
        let seen = &output.networks[0].timesteps;
        // sigma, sqrt(sigma * sigma_next), sigma_next, ...
        let midpoint = (seen[0] * seen[2]).sqrt();
        assert!((seen[1] - midpoint).abs() / midpoint < 1e-4);
    }
}
