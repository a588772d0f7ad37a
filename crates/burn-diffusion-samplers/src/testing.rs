//! Stub collaborators shared by the integrator unit tests

use burn::prelude::*;
use burn_ndarray::NdArray;

use crate::error::NetworkError;
use crate::lifecycle::{DenoiserNetwork, NetworkConfiguration, NetworkInput, PassthroughEncoder};
use crate::model::ModelVersion;
use crate::objective::{Objective, TimestepConditioning};
use crate::sampler::{Sampler, SampleRequest, SamplerKind, SamplerOutput, ZeroNoise};
use crate::scheduler::{
    DdpmParameters, LinearDiscretization, Parameterization, Sampling, SharedDiscretization, StepPosition,
};

pub type TestBackend = NdArray;

/// Epsilon denoiser that knows the clean sample
///
/// Conditioned on noise, so the scalar it receives is sigma and the input is
/// `x0 + sigma * eps` scaled by `1 / sqrt(sigma^2 + 1)`. It returns the exact
/// noise for a constant clean sample.
pub struct Oracle {
    pub clean: f32,
    pub calls: usize,
    pub timesteps: Vec<f32>,
}

impl Oracle {
    pub fn new(clean: f32) -> Self {
        Self {
            clean,
            calls: 0,
            timesteps: Vec::new(),
        }
    }
}

impl DenoiserNetwork<TestBackend> for Oracle {
    fn version(&self) -> ModelVersion {
        ModelVersion::V1
    }

    fn forward(
        &mut self,
        input: NetworkInput<TestBackend>,
    ) -> Result<Tensor<TestBackend, 4>, NetworkError> {
        self.calls += 1;
        self.timesteps.push(input.timestep);
        let sigma = input.timestep;
        let x = input.latent.mul_scalar((sigma * sigma + 1.0).sqrt());
        Ok(x.sub_scalar(self.clean).div_scalar(sigma))
    }
}

/// Network returning `slope * latent + bias + rate * timestep`
pub struct Affine {
    pub slope: f32,
    pub bias: f32,
    pub rate: f32,
    pub calls: usize,
    pub timesteps: Vec<f32>,
}

impl Affine {
    pub fn new(slope: f32, bias: f32, rate: f32) -> Self {
        Self {
            slope,
            bias,
            rate,
            calls: 0,
            timesteps: Vec::new(),
        }
    }

    /// Same output in f64, for hand-computed trajectories
    pub fn at(&self, latent: f64, timestep: f32) -> f64 {
        self.slope as f64 * latent + self.bias as f64 + self.rate as f64 * timestep as f64
    }
}

impl DenoiserNetwork<TestBackend> for Affine {
    fn version(&self) -> ModelVersion {
        ModelVersion::V1
    }

    fn forward(
        &mut self,
        input: NetworkInput<TestBackend>,
    ) -> Result<Tensor<TestBackend, 4>, NetworkError> {
        self.calls += 1;
        self.timesteps.push(input.timestep);
        Ok(input
            .latent
            .mul_scalar(self.slope)
            .add_scalar(self.bias + self.rate * input.timestep))
    }
}

pub fn linear_epsilon() -> LinearDiscretization {
    LinearDiscretization::new(
        Parameterization::Ddpm(DdpmParameters::default()),
        Objective::Epsilon,
    )
}

pub fn latent(value: f32) -> Tensor<TestBackend, 4> {
    Tensor::ones([1, 4, 4, 4], &Default::default()).mul_scalar(value)
}

pub fn values(t: Tensor<TestBackend, 4>) -> Vec<f32> {
    t.into_data().convert::<f32>().to_vec::<f32>().unwrap()
}

/// Run `kind` against an [`Oracle`] with deterministic noise
pub fn sample_oracle(
    kind: SamplerKind,
    x: Tensor<TestBackend, 4>,
    steps: usize,
    start: StepPosition,
    clean: f32,
) -> SamplerOutput<TestBackend, Oracle> {
    sample_oracle_range(kind, x, steps, start, StepPosition::at(steps), clean)
}

/// [`sample_oracle`] stopping at `end`
pub fn sample_oracle_range(
    kind: SamplerKind,
    x: Tensor<TestBackend, 4>,
    steps: usize,
    start: StepPosition,
    end: StepPosition,
    clean: f32,
) -> SamplerOutput<TestBackend, Oracle> {
    sample_network(
        kind,
        std::sync::Arc::new(linear_epsilon()),
        x,
        Sampling { steps, shift: 1.0 },
        (start, end),
        move || Oracle::new(clean),
    )
}

/// Run `kind` over `start..end` with noise conditioning, compiling networks with `network`
pub fn sample_network<N: DenoiserNetwork<TestBackend>>(
    kind: SamplerKind,
    discretization: SharedDiscretization,
    x: Tensor<TestBackend, 4>,
    sampling: Sampling,
    (start, end): (StepPosition, StepPosition),
    mut network: impl FnMut() -> N,
) -> SamplerOutput<TestBackend, N> {
    let sampler = Sampler::new(kind, discretization, TimestepConditioning::Noise);
    let mut factory = move |_: &NetworkConfiguration| -> Result<N, NetworkError> { Ok(network()) };
    let mut encoder = PassthroughEncoder;
    let mut noise = ZeroNoise;
    let mut feedback = |_: usize, _: Option<Tensor<TestBackend, 4>>| true;
    let encoding = Tensor::<TestBackend, 3>::zeros([2, 77, 8], &Default::default());
    let mut request = SampleRequest::new(
        x,
        NetworkConfiguration::new("test.ckpt", ModelVersion::V1),
        vec![encoding],
        sampling,
        &mut factory,
        &mut encoder,
        &mut noise,
        &mut feedback,
    );
    request.start = start;
    request.end = end;
    sampler.sample(request).unwrap()
}

pub fn assert_close(actual: &[f32], expected: f32, tolerance: f32) {
    for value in actual {
        assert!(
            (value - expected).abs() <= tolerance,
            "expected {expected}, got {value}"
        );
    }
}
