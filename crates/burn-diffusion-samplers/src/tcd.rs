//! Trajectory Consistency Distillation sampler
//!
//! Like LCM it predicts the clean sample every step, but it moves to an
//! intermediate timestep `(1 - gamma) * t_prev` along the deterministic
//! trajectory and only then re-noises to `t_prev`. `gamma` trades detail
//! (stochastic) against stability (deterministic at 0).

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::SamplerError;
use crate::inpaint::LatentSpace;
use crate::lifecycle::DenoiserNetwork;
use crate::objective::{combine, Objective, TimestepConditioning};
use crate::sampler::{remaining_conditioning, step_sigma, Run, SampleRequest, SamplerOutput};
use crate::scheduler::{Discretization, SharedDiscretization};

/// TCD configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcdConfig {
    /// Stochastic sampling gamma (0 = deterministic)
    pub gamma: f32,
}

impl Default for TcdConfig {
    fn default() -> Self {
        Self { gamma: 0.3 }
    }
}

/// TCD sampler
#[derive(Debug, Clone)]
pub struct TcdSampler {
    discretization: SharedDiscretization,
    conditioning: TimestepConditioning,
    config: TcdConfig,
}

impl TcdSampler {
    pub fn new(
        discretization: SharedDiscretization,
        conditioning: TimestepConditioning,
        config: TcdConfig,
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
        mut request: SampleRequest<'_, B, N>,
    ) -> Result<SamplerOutput<B, N>, SamplerError<N>> {
        if request.is_degenerate() {
            return Ok(request.into_passthrough());
        }
        let discretization = self.discretization.as_ref();
        let objective = discretization.objective();
        let sampling = request.sampling;
        let start = request.start;
        let gamma = self.config.gamma;
        // one extra step so that alphas_cumprod[i + 1] is never the terminal entry
        let alphas_cumprod = discretization.alphas_cumprod(sampling.steps + 1, sampling.shift);
        let sigmas: Vec<f64> = alphas_cumprod
            .iter()
            .map(|&a| discretization.sigma_from(a))
            .collect();
        let first_sigma = step_sigma(discretization, &alphas_cumprod, &sigmas, start.integral, start);
        let timesteps = remaining_conditioning(
            discretization,
            self.conditioning,
            &alphas_cumprod,
            start.integral,
            request.end.integral,
            discretization.alpha_cumprod_from(first_sigma),
        );
        request.guidance.classifier_free_guidance = false;

        let (mut run, mut x) = Run::begin(request, "tcd", discretization, timesteps)?;
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

            let conditioning_value = discretization.conditioning_value(alpha_cumprod, self.conditioning);
            let et = run.evaluate(i, x.clone(), timestep, conditioning_value, None)?;

            let alpha_prev = alphas_cumprod[i + 1];
            let timestep_prev = discretization.timestep_for(alpha_prev);
            let timestep_s = (1.0 - gamma) * timestep_prev;
            let alpha_cumprod_s = discretization.alpha_cumprod_at(timestep_s, sampling.shift);

            let x0 = objective.predicted_x0(x.clone(), et.clone(), alpha_cumprod);
            let noised = match objective {
                Objective::U { .. } => {
                    let sigma_s = discretization.sigma_from(alpha_cumprod_s);
                    combine(x.clone(), sigma_s / sigma, x0.clone(), 1.0 - sigma_s / sigma)
                }
                _ => {
                    let eps = objective.predicted_noise(x.clone(), et, alpha_cumprod);
                    combine(
                        x0.clone(),
                        alpha_cumprod_s.sqrt(),
                        eps,
                        (1.0 - alpha_cumprod_s).sqrt(),
                    )
                }
            };

            x = if i + 1 < sampling.steps {
                if gamma > 0.0 {
                    let noise = run.noise(&noised);
                    if objective.is_flow() {
                        let sigma_prev = 1.0 - alpha_prev;
                        let sigma_s = 1.0 - alpha_cumprod_s;
                        let x = combine(noised, 1.0, x0.clone(), alpha_cumprod_s - alpha_prev);
                        combine(
                            x,
                            1.0,
                            noise,
                            (sigma_prev * sigma_prev - sigma_s * sigma_s).max(0.0).sqrt(),
                        )
                    } else {
                        let ratio = alpha_prev / alpha_cumprod_s;
                        combine(noised, ratio.sqrt(), noise, (1.0 - ratio).max(0.0).sqrt())
                    }
                } else {
                    noised
                }
            } else {
                x0.clone()
            };
            old_denoised = Some(x0);
            x = run.blend(i, x, LatentSpace::Ddpm, alpha_prev);
        }
        run.finish(x)
    }
}
