//! PLMS sampler
//!
//! Pseudo linear multistep: the DDIM update driven by an Adams-Bashforth
//! combination of the last noise estimates. With no history the first step
//! evaluates the network twice (here and at the trial next latent) and
//! averages, a second-order Heun bootstrap.

use std::collections::VecDeque;

use burn::prelude::*;

use crate::error::SamplerError;
use crate::inpaint::LatentSpace;
use crate::lifecycle::DenoiserNetwork;
use crate::objective::{combine, Objective, TimestepConditioning};
use crate::sampler::{remaining_conditioning, Run, SampleRequest, SamplerOutput};
use crate::scheduler::{adams_bashforth_coefficients, Discretization, SharedDiscretization};

/// Noise estimates kept for the multistep update
const HISTORY: usize = 3;

/// PLMS sampler
#[derive(Debug, Clone)]
pub struct PlmsSampler {
    discretization: SharedDiscretization,
    conditioning: TimestepConditioning,
}

/// Noise estimate the multistep update runs on; flow latents keep velocity
fn noise_estimate<B: Backend>(
    objective: Objective,
    x: Tensor<B, 4>,
    output: Tensor<B, 4>,
    alpha_cumprod: f64,
) -> Tensor<B, 4> {
    match objective {
        Objective::U { .. } => output,
        _ => objective.predicted_noise(x, output, alpha_cumprod),
    }
}

/// `(x_prev, x0)` of a DDIM step with noise estimate `et`
fn ddim_step<B: Backend>(
    objective: Objective,
    x: Tensor<B, 4>,
    et: Tensor<B, 4>,
    alpha: f64,
    alpha_prev: f64,
) -> (Tensor<B, 4>, Tensor<B, 4>) {
    if objective.is_flow() {
        let x0 = combine(x.clone(), 1.0, et.clone(), alpha - 1.0);
        return (combine(x, 1.0, et, alpha - alpha_prev), x0);
    }
    let x0 = combine(x, 1.0 / alpha.sqrt(), et.clone(), -((1.0 - alpha) / alpha).sqrt());
    let x_prev = combine(x0.clone(), alpha_prev.sqrt(), et, (1.0 - alpha_prev).sqrt());
    (x_prev, x0)
}

impl PlmsSampler {
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

        let (mut run, mut x) = Run::begin(request, "plms", discretization, timesteps)?;
        // oldest first
        let mut history: VecDeque<Tensor<B, 4>> = VecDeque::with_capacity(HISTORY + 1);
        let mut old_denoised: Option<Tensor<B, 4>> = None;
        for i in run.start..run.end {
            let alpha = alphas_cumprod[i];
            let alpha_prev = alphas_cumprod[i + 1];
            run.report(i, old_denoised.as_ref())?;
            let timestep = discretization.timestep_for(alpha);
            let remaining =
                remaining_conditioning(discretization, self.conditioning, &alphas_cumprod, i, run.end, alpha);
            if run.maybe_switch(i, timestep, remaining)? {
                history.clear();
            }

            let conditioning_value = discretization.conditioning_value(alpha, self.conditioning);
            let output = run.evaluate(i, x.clone(), timestep, conditioning_value, None)?;
            let et = noise_estimate(objective, x.clone(), output, alpha);

            let et_prime = if history.is_empty() {
                let (x_trial, _) = ddim_step(objective, x.clone(), et.clone(), alpha, alpha_prev);
                let timestep_next = discretization.timestep_for(alpha_prev);
                let conditioning_next = discretization.conditioning_value(alpha_prev, self.conditioning);
                let output = run.evaluate(i, x_trial.clone(), timestep_next, conditioning_next, None)?;
                let et_next = noise_estimate(objective, x_trial, output, alpha_prev);
                (et.clone() + et_next).mul_scalar(0.5)
            } else {
                let coefficients = adams_bashforth_coefficients(history.len() + 1);
                let mut et_prime = et.clone().mul_scalar(coefficients[0] as f32);
                for (eps, coefficient) in history.iter().rev().zip(&coefficients[1..]) {
                    et_prime = et_prime + eps.clone().mul_scalar(*coefficient as f32);
                }
                et_prime
            };

            let (next, x0) = ddim_step(objective, x, et_prime, alpha, alpha_prev);
            history.push_back(et);
            if history.len() > HISTORY {
                history.pop_front();
            }
            old_denoised = Some(x0);
            x = run.blend(i, next, LatentSpace::Ddpm, alpha_prev);
        }
        run.finish(x)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::sampler::SamplerKind;
    use crate::scheduler::{Sampling, StepPosition};
    use crate::testing::{assert_close, latent, linear_epsilon, sample_network, sample_oracle, values, Affine};

    const AFFINE: (f32, f32, f32) = (0.1, 0.05, 0.02);

    fn ddim(x: f64, et: f64, alpha: f64, alpha_prev: f64) -> f64 {
        let x0 = (x - (1.0 - alpha).sqrt() * et) / alpha.sqrt();
        alpha_prev.sqrt() * x0 + (1.0 - alpha_prev).sqrt() * et
    }

    fn run_affine(end: usize) -> SamplerOutput<crate::testing::TestBackend, Affine> {
        let (slope, bias, rate) = AFFINE;
        sample_network(
            SamplerKind::Plms,
            Arc::new(linear_epsilon()),
            latent(0.8),
            Sampling { steps: 10, shift: 1.0 },
            (StepPosition::at(0), StepPosition::at(end)),
            move || Affine::new(slope, bias, rate),
        )
    }

    #[test]
    fn test_bootstrap_evaluates_twice() {
        let output = sample_oracle(SamplerKind::Plms, latent(1.0), 6, StepPosition::at(0), 0.1);
        let seen = &output.networks[0].timesteps;
        assert_eq!(seen.len(), 7);
        // the bootstrap looks ahead to the next step's noise level
        assert_eq!(seen[1], seen[2]);
        assert!(seen[0] > seen[1]);
        assert_close(&values(output.x), 0.1, 1e-3);
    }

    #[test]
    fn test_bootstrap_then_fourth_order_update() {
        let discretization = linear_epsilon();
        let alphas = discretization.alphas_cumprod(10, 1.0);
        let noise = |a: f64| discretization.conditioning_value(a, TimestepConditioning::Noise);
        let network = Affine::new(AFFINE.0, AFFINE.1, AFFINE.2);
        let et = |x: f64, a: f64| network.at(x, noise(a));

        // newest last
        let mut history: Vec<f64> = Vec::new();
        let mut x = 0.8;
        let mut after_bootstrap = 0.0;
        for i in 0..4 {
            let (alpha, alpha_prev) = (alphas[i], alphas[i + 1]);
            let e = et(x, alpha);
            let et_prime = match history.as_slice() {
                [] => {
                    let trial = ddim(x, e, alpha, alpha_prev);
                    let averaged = 0.5 * (e + et(trial, alpha_prev));
                    // differs from the plain single-evaluation step
                    assert!((ddim(x, averaged, alpha, alpha_prev) - trial).abs() > 1e-3);
                    averaged
                }
                [.., e3, e2, e1] => (55.0 * e - 59.0 * e1 + 37.0 * e2 - 9.0 * e3) / 24.0,
                [.., e2, e1] => (23.0 * e - 16.0 * e1 + 5.0 * e2) / 12.0,
                [.., e1] => (3.0 * e - e1) / 2.0,
            };
            x = ddim(x, et_prime, alpha, alpha_prev);
            history.push(e);
            if i == 0 {
                after_bootstrap = x;
            }
        }

        let bootstrap = run_affine(1);
        let seen = &bootstrap.networks[0].timesteps;
        assert_eq!(seen, &vec![noise(alphas[0]), noise(alphas[1])]);
        assert_close(&values(bootstrap.x), after_bootstrap as f32, 1e-3);

        let output = run_affine(4);
        assert_eq!(output.networks[0].calls, 5);
        assert_close(&values(output.x), x as f32, 1e-3);
    }
}
