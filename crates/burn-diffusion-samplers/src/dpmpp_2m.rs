//! DPM++ 2M sampler
//!
//! Second-order multistep solver in log-sigma time. Keeps the previous
//! denoised estimate and extrapolates with the ratio of the last two step
//! sizes. Flow-matching latents measure time in `ln(sigma / (1 - sigma))`.

use burn::prelude::*;

use crate::error::SamplerError;
use crate::inpaint::LatentSpace;
use crate::lifecycle::DenoiserNetwork;
use crate::objective::{combine, TimestepConditioning};
use crate::sampler::{remaining_conditioning, step_sigma, Run, SampleRequest, SamplerOutput};
use crate::scheduler::{Discretization, SharedDiscretization};

/// DPM++ 2M sampler
#[derive(Debug, Clone)]
pub struct DpmPp2mSampler {
    discretization: SharedDiscretization,
    conditioning: TimestepConditioning,
}

impl DpmPp2mSampler {
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

        let (mut run, mut x) = Run::begin(request, "dpmpp_2m", discretization, timesteps)?;
        if start.fractional == 0.0 && sigmas[0] != 1.0 {
            x = x.mul_scalar(sigmas[0] as f32);
        }
        let is_flow = objective.is_flow();
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
            if run.maybe_switch(i, timestep, remaining)? {
                old_denoised = None;
            }

            let input = x.clone().mul_scalar(objective.input_scale(sigma) as f32);
            let conditioning_value = discretization.conditioning_value(alpha_cumprod, self.conditioning);
            let et = run.evaluate(i, input, timestep, conditioning_value, None)?;
            let denoised = objective.denoised(x.clone(), et.clone(), sigma);

            let sigma_next = sigmas[i + 1];
            let is_last = i + 1 == sampling.steps;
            x = match old_denoised {
                Some(old) if !is_last => {
                    let sigma_last = sigmas[i - 1];
                    if is_flow && sigma_last >= 1.0 {
                        // h_last is infinite, fall back to Euler
                        combine(x, 1.0, et, sigma_next - sigma)
                    } else {
                        let lambda = |s: f64| if is_flow { (s / (1.0 - s)).ln() } else { s.ln() };
                        let h_last = lambda(sigma_last) - lambda(sigma);
                        let h = lambda(sigma) - lambda(sigma_next);
                        let r = h / h_last / 2.0;
                        let denoised_d = combine(denoised.clone(), 1.0 + r, old, -r);
                        let w = sigma_next / sigma;
                        combine(x, w, denoised_d, 1.0 - w)
                    }
                }
                _ if is_last => denoised.clone(),
                _ if is_flow => combine(x, 1.0, et, sigma_next - sigma),
                _ => {
                    let w = sigma_next / sigma;
                    combine(x, w, denoised.clone(), 1.0 - w)
                }
            };
            old_denoised = Some(denoised);
            x = run.blend(i, x, LatentSpace::Sigma, alphas_cumprod[i + 1]);
        }
        run.finish(x)
    }
}
