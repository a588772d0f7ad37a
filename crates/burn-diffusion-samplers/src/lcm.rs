//! Latent Consistency Model sampler
//!
//! Each step predicts the clean sample directly, applies the consistency
//! boundary condition and re-noises to the next timestep. Guidance is
//! distilled into the network: CFG is off and the guidance scale enters as
//! an embedding added to the time embedding.

use burn::prelude::*;

use crate::error::SamplerError;
use crate::inpaint::LatentSpace;
use crate::lifecycle::DenoiserNetwork;
use crate::objective::{combine, TimestepConditioning};
use crate::sampler::{Run, SampleRequest, SamplerOutput};
use crate::scheduler::{Discretization, SharedDiscretization, StepPosition};

/// Training timesteps of the distilled schedule
const TRAINING_TIMESTEPS: usize = 1000;
/// First timestep of the skipping schedule
const ORIGIN_TIMESTEP: usize = 20;
/// Timestep scaling of the boundary condition
const TIMESTEP_SCALING: f64 = 10.0;
const SIGMA_DATA: f64 = 0.5;

/// Training timesteps visited by an LCM run of `steps` steps, noisiest first
///
/// Fractional start and end positions replace the timestep at their integral
/// step with the exact fractional timestep.
pub fn lcm_timesteps(steps: usize, start: StepPosition, end: StepPosition) -> Vec<usize> {
    let last = TRAINING_TIMESTEPS - 1;
    let mut timesteps: Vec<usize> = (0..steps)
        .map(|i| {
            let span = (last - ORIGIN_TIMESTEP) as f64 * (steps - i) as f64 / steps as f64;
            (span.round() as usize + ORIGIN_TIMESTEP).min(last)
        })
        .collect();
    let partial = |position: StepPosition| {
        let t = TRAINING_TIMESTEPS as f32 - position.fractional * TRAINING_TIMESTEPS as f32 / steps as f32;
        (t.max(0.0) as usize).min(last)
    };
    for position in [start, end] {
        if (position.integral as f32 - position.fractional).abs() >= 1e-4 && position.integral < steps {
            timesteps[position.integral] = partial(position);
        }
    }
    timesteps
}

/// `(c_skip, c_out)` of the consistency boundary condition
pub fn boundary_condition_scalings(timestep: usize) -> (f64, f64) {
    let scaled = timestep as f64 * TIMESTEP_SCALING;
    let sd2 = SIGMA_DATA * SIGMA_DATA;
    let c_skip = sd2 / (scaled * scaled + sd2);
    let c_out = scaled / (scaled * scaled + sd2).sqrt();
    (c_skip, c_out)
}

/// LCM sampler
#[derive(Debug, Clone)]
pub struct LcmSampler {
    discretization: SharedDiscretization,
    conditioning: TimestepConditioning,
}

impl LcmSampler {
    pub fn new(discretization: SharedDiscretization, conditioning: TimestepConditioning) -> Self {
        Self {
            discretization,
            conditioning,
        }
    }

    pub fn discretization(&self) -> &dyn Discretization {
        self.discretization.as_ref()
    }

    fn conditioning_value(&self, table: &[f64], timestep: usize) -> f32 {
        match self.conditioning {
            TimestepConditioning::Noise => self.discretization.noise_for(table[timestep]),
            TimestepConditioning::Timestep => timestep as f32,
        }
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
        // indexed by training timestep, 0 = clean
        let table: Vec<f64> = discretization
            .alphas_cumprod(TRAINING_TIMESTEPS, sampling.shift)
            .into_iter()
            .rev()
            .collect();
        let timesteps = lcm_timesteps(sampling.steps, request.start, request.end);
        let end = request.end.integral.min(timesteps.len());
        let conditioning_values: Vec<f32> = timesteps[request.start.integral.min(end)..end]
            .iter()
            .map(|&t| self.conditioning_value(&table, t))
            .collect();
        request.guidance.classifier_free_guidance = false;

        let (mut run, mut x) = Run::begin(request, "lcm", discretization, conditioning_values)?;
        let text_guidance = run.guidance.text;
        let mut guidance_embedding = run.guidance_embedding(text_guidance - 1.0)?;
        let mut old_denoised: Option<Tensor<B, 4>> = None;
        for i in run.start..end {
            let timestep = timesteps[i];
            run.report(i, old_denoised.as_ref())?;
            let remaining = timesteps[i..end]
                .iter()
                .map(|&t| self.conditioning_value(&table, t))
                .collect();
            if run.maybe_switch(i, timestep as f32, remaining)? {
                let is_consistency = run.refiner().is_some_and(|r| r.is_consistency_model);
                guidance_embedding = if is_consistency {
                    run.guidance_embedding(text_guidance - 1.0)?
                } else {
                    None
                };
            }

            let alpha_cumprod = table[timestep];
            let conditioning_value = self.conditioning_value(&table, timestep);
            let et = run.evaluate(
                i,
                x.clone(),
                timestep as f32,
                conditioning_value,
                guidance_embedding.clone(),
            )?;
            let x0 = objective.predicted_x0(x.clone(), et, alpha_cumprod);
            let (c_skip, c_out) = boundary_condition_scalings(timestep);
            let denoised = combine(x0, c_out, x, c_skip);

            let alpha_prev = table[timesteps.get(i + 1).copied().unwrap_or(0)];
            x = if i + 1 < sampling.steps {
                let noise = run.noise(&denoised);
                if objective.is_flow() {
                    combine(denoised.clone(), alpha_prev, noise, 1.0 - alpha_prev)
                } else {
                    combine(denoised.clone(), alpha_prev.sqrt(), noise, (1.0 - alpha_prev).sqrt())
                }
            } else {
                denoised.clone()
            };
            old_denoised = Some(denoised);
            x = run.blend(i, x, LatentSpace::Ddpm, alpha_prev);
        }
        run.finish(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::SamplerKind;
    use crate::testing::{assert_close, latent, sample_oracle, values};

    #[test]
    fn test_skipping_timesteps() {
        let timesteps = lcm_timesteps(4, StepPosition::at(0), StepPosition::at(4));
        assert_eq!(timesteps, vec![999, 754, 510, 265]);
        // img2img from 1.5 of 4 steps
        let timesteps = lcm_timesteps(4, StepPosition::new(1.5), StepPosition::at(4));
        assert_eq!(timesteps[1], 625);
    }

    #[test]
    fn test_boundary_condition() {
        let (c_skip, c_out) = boundary_condition_scalings(0);
        assert_eq!((c_skip, c_out), (1.0, 0.0));
        let (c_skip, c_out) = boundary_condition_scalings(500);
        assert!(c_skip < 1e-6);
        assert!((c_out - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_single_branch_converges() {
        let output = sample_oracle(SamplerKind::Lcm, latent(1.0), 4, StepPosition::at(0), 0.2);
        assert_eq!(output.networks[0].calls, 4);
        assert_close(&values(output.x), 0.2, 1e-3);
    }
}
