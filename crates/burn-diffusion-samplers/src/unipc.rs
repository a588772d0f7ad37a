//! UniPC sampler
//!
//! Unified predictor-corrector on data predictions, with the `bh2` variant
//! of the B(h) function. Every step first corrects the previous prediction
//! with the fresh model output (UniC), then predicts the next latent (UniP).
//! Both use up to two model outputs of history.

use std::collections::VecDeque;

use burn::prelude::*;

use crate::error::SamplerError;
use crate::inpaint::LatentSpace;
use crate::lifecycle::DenoiserNetwork;
use crate::objective::{combine, Objective, TimestepConditioning};
use crate::sampler::{remaining_conditioning, Run, SampleRequest, SamplerOutput};
use crate::scheduler::{Discretization, SharedDiscretization};

/// Model outputs kept for the multistep updates
const HISTORY: usize = 2;

/// UniPC sampler
#[derive(Debug, Clone)]
pub struct UniPcSampler {
    discretization: SharedDiscretization,
    conditioning: TimestepConditioning,
}

/// Signal and noise coefficients along the schedule, with their log ratio
struct Coefficients {
    alphas: Vec<f64>,
    sigmas: Vec<f64>,
    lambdas: Vec<f64>,
}

impl Coefficients {
    fn new(objective: Objective, alphas_cumprod: &[f64]) -> Self {
        let (alphas, sigmas): (Vec<f64>, Vec<f64>) = alphas_cumprod
            .iter()
            .map(|&a| {
                if objective.is_flow() {
                    (a, 1.0 - a)
                } else {
                    (a.sqrt(), (1.0 - a).sqrt())
                }
            })
            .unzip();
        let lambdas = alphas
            .iter()
            .zip(&sigmas)
            .map(|(alpha, sigma)| alpha.ln() - sigma.ln())
            .collect();
        Self {
            alphas,
            sigmas,
            lambdas,
        }
    }
}

/// Step indices and data predictions, oldest first
struct History<B: Backend> {
    entries: VecDeque<(usize, Tensor<B, 4>)>,
}

impl<B: Backend> History<B> {
    fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(HISTORY + 1),
        }
    }

    fn push(&mut self, step: usize, prediction: Tensor<B, 4>) {
        self.entries.push_back((step, prediction));
        if self.entries.len() > HISTORY {
            self.entries.pop_front();
        }
    }

    fn last(&self) -> Option<&(usize, Tensor<B, 4>)> {
        self.entries.back()
    }

    /// `(r_k, D1)`: the scaled difference to the older prediction
    fn first_difference(&self, coefficients: &Coefficients, h: f64) -> Option<(f64, Tensor<B, 4>)> {
        if self.entries.len() < 2 {
            return None;
        }
        let (s0, m0) = &self.entries[1];
        let (si, mi) = &self.entries[0];
        let rk = (coefficients.lambdas[*si] - coefficients.lambdas[*s0]) / h;
        let d1 = (mi.clone() - m0.clone()).mul_scalar((1.0 / rk) as f32);
        Some((rk, d1))
    }
}

/// UniP: predict the latent at step `t` from `x` at the last history step
fn predict<B: Backend>(
    x: Tensor<B, 4>,
    t: usize,
    history: &History<B>,
    coefficients: &Coefficients,
) -> Option<Tensor<B, 4>> {
    let (s0, m0) = history.last()?;
    let alpha_t = coefficients.alphas[t];
    let h = coefficients.lambdas[t] - coefficients.lambdas[*s0];
    let h_phi_1 = (-h).exp() - 1.0;
    let b_h = h_phi_1;
    let x_t = combine(
        x,
        coefficients.sigmas[t] / coefficients.sigmas[*s0],
        m0.clone(),
        -alpha_t * h_phi_1,
    );
    Some(match history.first_difference(coefficients, h) {
        Some((_, d1)) => combine(x_t, 1.0, d1, -alpha_t * b_h * 0.5),
        None => x_t,
    })
}

/// UniC: correct the prediction made from `last_sample` with the model output `mt` at step `t`
fn correct<B: Backend>(
    mt: Tensor<B, 4>,
    t: usize,
    last_sample: Tensor<B, 4>,
    history: &History<B>,
    coefficients: &Coefficients,
) -> Option<Tensor<B, 4>> {
    let (s0, m0) = history.last()?;
    let alpha_t = coefficients.alphas[t];
    let h = coefficients.lambdas[t] - coefficients.lambdas[*s0];
    let hh = -h;
    let h_phi_1 = hh.exp() - 1.0;
    let h_phi_k = h_phi_1 / hh - 1.0;
    let b_h = h_phi_1;
    let x_t = combine(
        last_sample,
        coefficients.sigmas[t] / coefficients.sigmas[*s0],
        m0.clone(),
        -alpha_t * h_phi_1,
    );
    let d1_t = mt - m0.clone();
    let d1s = match history.first_difference(coefficients, h) {
        Some((rk, d1)) => {
            let b0 = h_phi_k / b_h;
            let b1 = (h_phi_k / hh - 0.5) * 2.0 / b_h;
            let rho_c0 = (b0 - b1) / (1.0 - rk);
            let rho_c1 = b0 - rho_c0;
            combine(d1, rho_c0, d1_t, rho_c1)
        }
        None => d1_t.mul_scalar(0.5),
    };
    Some(combine(x_t, 1.0, d1s, -alpha_t * b_h))
}

impl UniPcSampler {
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
        let coefficients = Coefficients::new(objective, &alphas_cumprod);
        let first = request.start.integral;
        let timesteps = remaining_conditioning(
            discretization,
            self.conditioning,
            &alphas_cumprod,
            first,
            request.end.integral,
            alphas_cumprod[first],
        );

        let (mut run, mut x) = Run::begin(request, "unipc", discretization, timesteps)?;
        let mut history = History::new();
        let mut last_sample: Option<Tensor<B, 4>> = None;
        for i in run.start..run.end {
            let alpha_cumprod = alphas_cumprod[i];
            run.report(i, history.last().map(|(_, m)| m))?;
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
                history = History::new();
                last_sample = None;
            }

            let conditioning_value = discretization.conditioning_value(alpha_cumprod, self.conditioning);
            let output = run.evaluate(i, x.clone(), timestep, conditioning_value, None)?;
            let predicted = objective.predicted_x0(x.clone(), output, alpha_cumprod);

            if let Some(sample) = last_sample.take() {
                if let Some(corrected) = correct(predicted.clone(), i, sample, &history, &coefficients) {
                    x = corrected;
                }
            }
            history.push(i, predicted.clone());

            x = if i + 1 < sampling.steps {
                last_sample = Some(x.clone());
                predict(x.clone(), i + 1, &history, &coefficients).unwrap_or(x)
            } else {
                predicted
            };
            x = run.blend(i, x, LatentSpace::Ddpm, alphas_cumprod[i + 1]);
        }
        run.finish(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::SamplerKind;
    use crate::scheduler::StepPosition;
    use crate::testing::{assert_close, latent, linear_epsilon, sample_oracle, sample_oracle_range, values};

    #[test]
    fn test_converges_to_clean_sample() {
        let output = sample_oracle(SamplerKind::UniPc, latent(1.0), 10, StepPosition::at(0), 0.3);
        assert_eq!(output.networks[0].calls, 10);
        assert_close(&values(output.x), 0.3, 1e-3);
    }

    #[test]
    fn test_partial_run_stays_on_trajectory() {
        let alphas = linear_epsilon().alphas_cumprod(10, 1.0);
        let output = sample_oracle_range(
            SamplerKind::UniPc,
            latent(1.0),
            10,
            StepPosition::at(0),
            StepPosition::at(5),
            0.3,
        );
        assert_eq!(output.networks[0].calls, 5);
        // an exact data prediction keeps x on the DDPM trajectory of its noise
        let eps = (1.0 - alphas[0].sqrt() * 0.3) / (1.0 - alphas[0]).sqrt();
        let expected = alphas[5].sqrt() * 0.3 + (1.0 - alphas[5]).sqrt() * eps;
        assert_close(&values(output.x), expected as f32, 1e-3);
    }
}
