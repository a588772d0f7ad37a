//! DDIM sampler
//!
//! Deterministic DDIM (eta = 0) in DDPM space. The latent is never rescaled:
//! each step predicts `x0` and the noise, then re-noises to the next
//! cumulative alpha. Flow-matching latents take the plain Euler step instead.

use burn::prelude::*;

use crate::error::SamplerError;
use crate::inpaint::LatentSpace;
use crate::lifecycle::DenoiserNetwork;
use crate::objective::{combine, Objective, TimestepConditioning};
use crate::sampler::{remaining_conditioning, Run, SampleRequest, SamplerOutput};
use crate::scheduler::{Discretization, SharedDiscretization};

/// DDIM sampler
#[derive(Debug, Clone)]
pub struct DdimSampler {
    discretization: SharedDiscretization,
    conditioning: TimestepConditioning,
}

impl DdimSampler {
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
        let alphas_cumprod = discretization.alphas_cumprod(sampling.steps, sampling.shift);
        let first = request.start.integral;
        let timesteps = remaining_conditioning(
            discretization,
            self.conditioning,
            &alphas_cumprod,
            first,
            request.end.integral,
            alphas_cumprod[first],
        );

        let (mut run, mut x) = Run::begin(request, "ddim", discretization, timesteps)?;
        let mut old_denoised: Option<Tensor<B, 4>> = None;
        for i in run.start..run.end {
            let alpha = alphas_cumprod[i];
            let alpha_prev = alphas_cumprod[i + 1];
            run.report(i, old_denoised.as_ref())?;
            let timestep = discretization.timestep_for(alpha);
            let remaining =
                remaining_conditioning(discretization, self.conditioning, &alphas_cumprod, i, run.end, alpha);
            run.maybe_switch(i, timestep, remaining)?;

            let conditioning_value = discretization.conditioning_value(alpha, self.conditioning);
            let et = run.evaluate(i, x.clone(), timestep, conditioning_value, None)?;

            let (next, x0) = match objective {
                Objective::U { .. } => {
                    let x0 = combine(x.clone(), 1.0, et.clone(), alpha - 1.0);
                    (combine(x, 1.0, et, alpha - alpha_prev), x0)
                }
                _ => {
                    let x0 = objective.predicted_x0(x.clone(), et.clone(), alpha);
                    let eps = objective.predicted_noise(x, et, alpha);
                    let next = combine(x0.clone(), alpha_prev.sqrt(), eps, (1.0 - alpha_prev).sqrt());
                    (next, x0)
                }
            };
            old_denoised = Some(x0);
            x = run.blend(i, next, LatentSpace::Ddpm, alpha_prev);
        }
        run.finish(x)
    }
}
