//! Stub network and run harness shared by the integration tests

#![allow(dead_code)]

use std::sync::Arc;

use burn::prelude::*;
use burn_diffusion_samplers::{
    CancellationToken, DdpmParameters, DenoiserNetwork, GuidanceConfig, Inpainting, LinearDiscretization,
    ModelVersion, NetworkConfiguration, NetworkError, NetworkInput, Objective, Parameterization,
    PassthroughEncoder, Refiner, Sampler, SampleRequest, SamplerError, SamplerKind, SamplerOutput, Sampling,
    SharedDiscretization, StepPosition, TimestepConditioning, ZeroNoise,
};
use burn_ndarray::NdArray;

pub type TestBackend = NdArray;

/// What the stub network predicts
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// `-input`
    Negate,
    /// Always zero noise
    Zero,
    /// NaN everywhere
    Nan,
    /// Exact epsilon for a constant clean sample; needs noise conditioning
    Oracle(f32),
}

#[derive(Debug)]
pub struct Stub {
    pub file_path: String,
    pub behavior: Behavior,
    pub calls: usize,
    pub batch_sizes: Vec<usize>,
    pub steps: Vec<usize>,
    pub unloaded: bool,
}

impl DenoiserNetwork<TestBackend> for Stub {
    fn version(&self) -> ModelVersion {
        ModelVersion::V1
    }

    fn forward(
        &mut self,
        input: NetworkInput<TestBackend>,
    ) -> Result<Tensor<TestBackend, 4>, NetworkError> {
        self.calls += 1;
        self.batch_sizes.push(input.latent.dims()[0]);
        self.steps.push(input.step);
        let latent = input.latent;
        Ok(match self.behavior {
            Behavior::Negate => latent.neg(),
            Behavior::Zero => latent.zeros_like(),
            Behavior::Nan => latent.zeros_like().add_scalar(f32::NAN),
            Behavior::Oracle(clean) => {
                let sigma = input.timestep;
                latent
                    .mul_scalar((sigma * sigma + 1.0).sqrt())
                    .sub_scalar(clean)
                    .div_scalar(sigma)
            }
        })
    }

    fn unload(&mut self) {
        self.unloaded = true;
    }
}

pub fn linear_epsilon() -> SharedDiscretization {
    Arc::new(LinearDiscretization::new(
        Parameterization::Ddpm(DdpmParameters::default()),
        Objective::Epsilon,
    ))
}

pub fn filled(shape: [usize; 4], value: f32) -> Tensor<TestBackend, 4> {
    Tensor::ones(shape, &Default::default()).mul_scalar(value)
}

pub fn latent(value: f32) -> Tensor<TestBackend, 4> {
    filled([1, 8, 8, 4], value)
}

pub fn values(t: &Tensor<TestBackend, 4>) -> Vec<f32> {
    t.clone().into_data().convert::<f32>().to_vec::<f32>().unwrap()
}

pub fn assert_all_close(actual: &[f32], expected: f32, tolerance: f32) {
    for value in actual {
        assert!(
            (value - expected).abs() <= tolerance,
            "expected {expected}, got {value}"
        );
    }
}

/// One sampling run against [`Stub`] networks
pub struct Scenario {
    pub kind: SamplerKind,
    pub steps: usize,
    pub behavior: Behavior,
    pub conditioning: TimestepConditioning,
    pub guidance: GuidanceConfig,
    pub start: StepPosition,
    pub end: StepPosition,
    pub refiner: Option<Refiner>,
    pub inpainting: Option<Inpainting<TestBackend>>,
    pub token: Option<CancellationToken>,
    /// Feedback returns false once this many steps were reported
    pub stop_after: Option<usize>,
}

pub struct Outcome {
    pub result: Result<SamplerOutput<TestBackend, Stub>, SamplerError<Stub>>,
    /// Configurations the factory compiled, in order
    pub compiled: Vec<NetworkConfiguration>,
    /// Step counts the feedback callback saw
    pub reported: Vec<usize>,
}

impl Scenario {
    pub fn new(kind: SamplerKind, steps: usize, behavior: Behavior) -> Self {
        Self {
            kind,
            steps,
            behavior,
            conditioning: TimestepConditioning::Noise,
            guidance: GuidanceConfig::default(),
            start: StepPosition::at(0),
            end: StepPosition::at(steps),
            refiner: None,
            inpainting: None,
            token: None,
            stop_after: None,
        }
    }

    pub fn run(self, x: Tensor<TestBackend, 4>) -> Outcome {
        let sampler = Sampler::new(self.kind, linear_epsilon(), self.conditioning);
        let behavior = self.behavior;
        let mut compiled = Vec::new();
        let mut reported = Vec::new();
        let stop_after = self.stop_after;
        let result = {
            let mut factory = |configuration: &NetworkConfiguration| -> Result<Stub, NetworkError> {
                compiled.push(configuration.clone());
                Ok(Stub {
                    file_path: configuration.file_path.clone(),
                    behavior,
                    calls: 0,
                    batch_sizes: Vec::new(),
                    steps: Vec::new(),
                    unloaded: false,
                })
            };
            let mut encoder = PassthroughEncoder;
            let mut noise = ZeroNoise;
            let mut feedback = |step: usize, _: Option<Tensor<TestBackend, 4>>| {
                reported.push(step);
                stop_after.map_or(true, |stop| step < stop)
            };
            let encoding = Tensor::<TestBackend, 3>::zeros([2, 77, 8], &Default::default());
            let mut request = SampleRequest::new(
                x,
                NetworkConfiguration::new("base.ckpt", ModelVersion::V1),
                vec![encoding],
                Sampling {
                    steps: self.steps,
                    shift: 1.0,
                },
                &mut factory,
                &mut encoder,
                &mut noise,
                &mut feedback,
            );
            request.start = self.start;
            request.end = self.end;
            request.guidance = self.guidance;
            request.refiner = self.refiner;
            request.inpainting = self.inpainting;
            request.cancellation = self.token.as_ref();
            sampler.sample(request)
        };
        Outcome {
            result,
            compiled,
            reported,
        }
    }
}
