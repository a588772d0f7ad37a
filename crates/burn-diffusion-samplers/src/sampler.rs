//! Sampler selection and the shared run skeleton
//!
//! Every integrator takes a [`SampleRequest`] and returns a [`SamplerOutput`]
//! carrying the final latent and the network instances used (the last one
//! hot). The per-step plumbing they share (feedback and preview, refiner
//! switch, CFG evaluation with injected controls, inpainting blend, final NaN
//! scan) lives in [`Run`].

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::ddim::DdimSampler;
use crate::dpmpp_2m::DpmPp2mSampler;
use crate::dpmpp_sde::DpmPpSdeSampler;
use crate::error::{NetworkError, SamplerError};
use crate::euler_ancestral::EulerAncestralSampler;
use crate::guard::{contains_nan, should_preview, should_scan_preview, CancellationToken, RunGuard};
use crate::guidance::{cfg_channels_and_input_channels, guidance_scale_embedding, CfgCompositor, GuidanceConfig};
use crate::injection::{inject_all, loras_for_base, ControlInputs, InjectedControl};
use crate::inpaint::{Inpainting, LatentSpace};
use crate::lcm::LcmSampler;
use crate::lifecycle::{
    Conditioning, DenoiserNetwork, EncodeRequest, FixedEncoder, ModelLifecycle, NetworkConfiguration,
    NetworkFactory, NetworkInput, Refiner,
};
use crate::model::SamplerModifier;
use crate::objective::{Objective, TimestepConditioning};
use crate::plms::PlmsSampler;
use crate::scheduler::{
    interpolated_sigma, rounded_alpha_cumprod, strength_to_integral_step, strength_to_step,
    Discretization, Sampling, SharedDiscretization, StepPosition, StrengthMapping,
};
use crate::tcd::TcdSampler;
use crate::unipc::UniPcSampler;

// ============================================================================
// Noise
// ============================================================================

/// Source of standard normal noise
pub trait NoiseSource<B: Backend> {
    fn sample(&mut self, shape: [usize; 4], device: &B::Device) -> Tensor<B, 4>;
}

/// Draws from the backend RNG
#[derive(Debug, Clone, Copy, Default)]
pub struct GaussianNoise;

impl<B: Backend> NoiseSource<B> for GaussianNoise {
    fn sample(&mut self, shape: [usize; 4], device: &B::Device) -> Tensor<B, 4> {
        Tensor::random(shape, burn::tensor::Distribution::Normal(0.0, 1.0), device)
    }
}

/// Always zero; turns every stochastic integrator deterministic
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroNoise;

impl<B: Backend> NoiseSource<B> for ZeroNoise {
    fn sample(&mut self, shape: [usize; 4], device: &B::Device) -> Tensor<B, 4> {
        Tensor::zeros(shape, device)
    }
}

// ============================================================================
// Request / output
// ============================================================================

/// Feedback callback: `(steps done, decoded preview) -> keep going`
pub type Feedback<'a, B> = dyn FnMut(usize, Option<Tensor<B, 4>>) -> bool + 'a;

/// Everything one `sample()` call needs
pub struct SampleRequest<'a, B: Backend, N> {
    /// Initial latent, NHWC
    pub x: Tensor<B, 4>,
    /// Previously compiled networks; the first one is reused as the base
    pub networks: Vec<N>,
    pub inpainting: Option<Inpainting<B>>,
    /// Modifier condition channels (mask + masked image, depth, edit image...)
    pub condition_image: Option<Tensor<B, 4>>,
    /// Prompt encodings and micro-conditioning for the fixed encoder
    pub encode: EncodeRequest<B>,
    pub start: StepPosition,
    pub end: StepPosition,
    pub sampling: Sampling,
    pub guidance: GuidanceConfig,
    pub modifier: SamplerModifier,
    pub controls: Vec<InjectedControl<B>>,
    pub refiner: Option<Refiner>,
    /// Base network configuration (file, version, LoRAs)
    pub network: NetworkConfiguration,
    pub factory: &'a mut dyn NetworkFactory<N>,
    pub encoder: &'a mut dyn FixedEncoder<B>,
    pub noise: &'a mut dyn NoiseSource<B>,
    pub feedback: &'a mut Feedback<'a, B>,
    pub cancellation: Option<&'a CancellationToken>,
}

impl<'a, B: Backend, N> SampleRequest<'a, B, N> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        x: Tensor<B, 4>,
        network: NetworkConfiguration,
        text_encodings: Vec<Tensor<B, 3>>,
        sampling: Sampling,
        factory: &'a mut dyn NetworkFactory<N>,
        encoder: &'a mut dyn FixedEncoder<B>,
        noise: &'a mut dyn NoiseSource<B>,
        feedback: &'a mut Feedback<'a, B>,
    ) -> Self {
        Self {
            x,
            networks: Vec::new(),
            inpainting: None,
            condition_image: None,
            encode: EncodeRequest::new(network.version, text_encodings),
            start: StepPosition::at(0),
            end: StepPosition::at(sampling.steps),
            sampling,
            guidance: GuidanceConfig::default(),
            modifier: network.modifier,
            controls: Vec::new(),
            refiner: None,
            network,
            factory,
            encoder,
            noise,
            feedback,
            cancellation: None,
        }
    }

    /// Nothing to integrate
    pub fn is_degenerate(&self) -> bool {
        self.end.integral <= self.start.integral
    }

    /// The untouched input with no networks, for degenerate ranges
    pub fn into_passthrough(self) -> SamplerOutput<B, N> {
        SamplerOutput {
            x: self.x,
            networks: Vec::new(),
        }
    }
}

/// Result of a successful run
#[derive(Debug)]
pub struct SamplerOutput<B: Backend, N> {
    pub x: Tensor<B, 4>,
    /// Networks used by the run, last one hot
    pub networks: Vec<N>,
}

// ============================================================================
// Run skeleton
// ============================================================================

/// State shared by every integrator for the duration of one run
pub(crate) struct Run<'a, B: Backend, N> {
    pub start: usize,
    pub end: usize,
    pub steps: usize,
    pub objective: Objective,
    pub guidance: GuidanceConfig,
    device: B::Device,
    inpainting: Option<Inpainting<B>>,
    condition_image: Option<Tensor<B, 4>>,
    compositor: CfgCompositor,
    conditioning: Conditioning<B>,
    encode: EncodeRequest<B>,
    network: NetworkConfiguration,
    lifecycle: ModelLifecycle<N>,
    controls: Vec<InjectedControl<B>>,
    factory: &'a mut dyn NetworkFactory<N>,
    encoder: &'a mut dyn FixedEncoder<B>,
    noise: &'a mut dyn NoiseSource<B>,
    feedback: &'a mut Feedback<'a, B>,
    guard: RunGuard,
}

impl<'a, B: Backend, N: DenoiserNetwork<B>> Run<'a, B, N> {
    /// Encode conditioning, compile the base network and open the run scope
    ///
    /// `timesteps` are the conditioning values of the steps `start..end`.
    pub fn begin(
        request: SampleRequest<'a, B, N>,
        name: &'static str,
        discretization: &dyn Discretization,
        timesteps: Vec<f32>,
    ) -> Result<(Self, Tensor<B, 4>), SamplerError<N>> {
        let SampleRequest {
            x,
            networks,
            inpainting,
            condition_image,
            encode,
            start,
            end,
            sampling,
            guidance,
            modifier,
            controls,
            refiner,
            network,
            factory,
            encoder,
            noise,
            feedback,
            cancellation,
        } = request;
        let [batch_size, height, width, channels] = x.dims();
        let version = network.version;
        let condition_channels = condition_image.as_ref().map(|image| image.dims()[3]);
        let compositor = CfgCompositor::new(
            &guidance,
            version,
            modifier,
            batch_size,
            channels,
            condition_channels,
            discretization.timesteps(),
        );
        let (_, input_channels) = cfg_channels_and_input_channels(
            channels,
            condition_channels,
            compositor.is_cfg_enabled(),
            guidance.text,
            guidance.image,
            version,
            modifier,
        );
        let network = NetworkConfiguration {
            modifier,
            timestep: compile_timestep(discretization, sampling.steps),
            batch_size: compositor.network_batch(),
            input_channels,
            ..network
        };
        let encode = EncodeRequest {
            version,
            timesteps,
            batch_size,
            height,
            width,
            loras: loras_for_base(&network.loras),
            is_cfg_enabled: compositor.is_cfg_enabled(),
            ..encode
        };
        let conditioning = encoder.encode(&encode)?;
        let conditioning = prepare_conditioning(&compositor, conditioning);

        let mut lifecycle =
            ModelLifecycle::new(networks, version, refiner, discretization.timesteps());
        lifecycle.ensure_compiled(factory, &network)?;
        lifecycle.set_index_offset(start.integral);
        let hook = lifecycle.hot()?.cancel_hook();
        let guard = RunGuard::new(name, sampling.steps, cancellation, hook);
        tracing::info!(
            sampler = name,
            start = start.fractional,
            end = end.fractional,
            steps = sampling.steps,
            cfg = compositor.is_cfg_enabled(),
            "sampling"
        );
        let run = Self {
            start: start.integral,
            end: end.integral,
            steps: sampling.steps,
            objective: discretization.objective(),
            guidance,
            device: x.device(),
            inpainting,
            condition_image,
            compositor,
            conditioning,
            encode,
            network,
            lifecycle,
            controls,
            factory,
            encoder,
            noise,
            feedback,
            guard,
        };
        Ok((run, x))
    }

    /// Cancellation check, preview and feedback at the top of step `i`
    pub fn report(&mut self, i: usize, denoised: Option<&Tensor<B, 4>>) -> Result<(), SamplerError<N>> {
        if self.guard.is_cancelled() {
            return Err(self.cancelled());
        }
        let preview = match denoised {
            Some(denoised) if should_preview(i, self.start, self.steps) => {
                let decoded = self.lifecycle.hot()?.decode(denoised.clone());
                Some(decoded.map_err(|err| self.failure(err))?)
            }
            _ => None,
        };
        if let Some(preview) = &preview {
            if should_scan_preview(i) && contains_nan(preview, "preview")? {
                return Err(SamplerError::NaN);
            }
        }
        if !(self.feedback)(i - self.start, preview) {
            tracing::info!(step = i, "sampling cancelled by feedback");
            return Err(self.cancelled());
        }
        Ok(())
    }

    /// Switch to the refiner if `timestep` crossed its threshold
    ///
    /// `timesteps` are the conditioning values of the remaining steps.
    /// Returns true when the switch happened; multi-step integrators reset
    /// their history then.
    pub fn maybe_switch(
        &mut self,
        i: usize,
        timestep: f32,
        timesteps: Vec<f32>,
    ) -> Result<bool, SamplerError<N>> {
        if !self.lifecycle.should_switch(timestep) {
            return Ok(false);
        }
        let request = EncodeRequest {
            timesteps,
            ..self.encode.clone()
        };
        let switched = self.lifecycle.maybe_switch(
            i,
            timestep,
            &mut *self.factory,
            &mut *self.encoder,
            &request,
            &self.network,
        )?;
        let Some(conditioning) = switched else {
            return Ok(false);
        };
        self.conditioning = prepare_conditioning(&self.compositor, conditioning);
        let hook = self.lifecycle.hot()?.cancel_hook();
        self.guard.rebind(hook);
        Ok(true)
    }

    pub fn refiner(&self) -> Option<&Refiner> {
        self.lifecycle.refiner()
    }

    /// Run the network over all CFG branches and compose the guided output
    ///
    /// `timestep` drives the sharpness blend, `conditioning_value` is what
    /// the network is conditioned on. `embedding_offset` is added to the
    /// network's time embedding.
    pub fn evaluate(
        &mut self,
        i: usize,
        input: Tensor<B, 4>,
        timestep: f32,
        conditioning_value: f32,
        embedding_offset: Option<Tensor<B, 2>>,
    ) -> Result<Tensor<B, 4>, SamplerError<N>> {
        let batch = self.compositor.network_batch();
        let index = i.saturating_sub(self.lifecycle.index_offset());
        let encodings = self.conditioning.for_step(index);
        let passes = self
            .compositor
            .passes(input, self.condition_image.as_ref(), encodings.len());
        let time_embedding = self.lifecycle.hot()?.time_embedding(conditioning_value, batch);
        let time_embedding = match (time_embedding, embedding_offset) {
            (Some(embedding), Some(offset)) => Some(embedding + offset),
            (embedding, _) => embedding,
        };
        let mut outputs = Vec::with_capacity(passes.len());
        for pass in passes {
            let conditioning = match &pass.conditioning {
                Some(indices) => indices
                    .iter()
                    .filter_map(|&k| encodings.get(k).cloned())
                    .collect(),
                None => encodings.clone(),
            };
            let injected = inject_all(
                &mut self.controls,
                &ControlInputs {
                    latent: &pass.latent,
                    timestep,
                    time_embedding: time_embedding.as_ref(),
                    is_cfg_enabled: self.compositor.is_cfg_enabled(),
                    step: i,
                },
            );
            let controls = match injected {
                Ok(controls) => controls,
                Err(err) => return Err(self.failure(err)),
            };
            let input = NetworkInput {
                timestep: conditioning_value,
                time_embedding: time_embedding.clone(),
                latent: pass.latent,
                conditioning,
                vector: self.conditioning.vector.clone(),
                extra_projection: self.conditioning.extra_projection.clone(),
                controls,
                step: i,
            };
            let output = self.lifecycle.hot()?.forward(input);
            match output {
                Ok(output) => outputs.push(output),
                Err(err) => return Err(self.failure(err)),
            }
        }
        tracing::debug!(step = i, timestep, "network evaluated");
        let mut outputs = outputs.into_iter();
        let output = outputs
            .next()
            .ok_or_else(|| NetworkError::Evaluation("no guidance pass planned".into()))?;
        Ok(self.compositor.compose(output, outputs.next(), timestep, i))
    }

    /// Guidance embedding for consistency models, projected by the network
    pub fn guidance_embedding(&mut self, scale: f32) -> Result<Option<Tensor<B, 2>>, SamplerError<N>> {
        let batch = self.compositor.network_batch();
        let embedding = guidance_scale_embedding(scale, 256);
        let dim = embedding.len();
        let data: Vec<f32> = (0..batch).flat_map(|_| embedding.iter().copied()).collect();
        let embedding = Tensor::<B, 2>::from_data(TensorData::new(data, [batch, dim]), &self.device);
        Ok(self.lifecycle.hot()?.guidance_projection(embedding))
    }

    /// Fresh standard normal noise shaped like `like`
    pub fn noise(&mut self, like: &Tensor<B, 4>) -> Tensor<B, 4> {
        self.noise.sample(like.dims(), &self.device)
    }

    /// Paste the re-noised reference into `x` after step `i`
    pub fn blend(&mut self, i: usize, x: Tensor<B, 4>, space: LatentSpace, alpha_cumprod: f64) -> Tensor<B, 4> {
        if i + 1 >= self.end || self.inpainting.is_none() {
            return x;
        }
        let noise = self.noise(&x);
        match &self.inpainting {
            Some(inpainting) => inpainting.blend(x, noise, self.objective, space, alpha_cumprod),
            None => x,
        }
    }

    /// Final NaN scan and hand-back of the networks
    pub fn finish(self, x: Tensor<B, 4>) -> Result<SamplerOutput<B, N>, SamplerError<N>> {
        if contains_nan(&x, "x")? {
            return Err(SamplerError::NaN);
        }
        Ok(SamplerOutput {
            x,
            networks: self.lifecycle.into_networks(),
        })
    }

    fn cancelled(&mut self) -> SamplerError<N> {
        SamplerError::Cancelled {
            networks: self.lifecycle.take_networks(),
        }
    }

    /// Map a collaborator failure, preferring cancellation if it was requested
    fn failure(&mut self, err: NetworkError) -> SamplerError<N> {
        if self.guard.is_cancelled() || matches!(err, NetworkError::Cancelled) {
            return self.cancelled();
        }
        SamplerError::Network(err)
    }
}

fn prepare_conditioning<B: Backend>(
    compositor: &CfgCompositor,
    conditioning: Conditioning<B>,
) -> Conditioning<B> {
    Conditioning {
        encodings: compositor.prepare_encodings(conditioning.encodings),
        vector: conditioning.vector.map(|v| compositor.prepare_vector(v)),
        extra_projection: conditioning.extra_projection,
        per_step: conditioning
            .per_step
            .map(|steps| steps.into_iter().map(|c| compositor.prepare_encodings(c)).collect()),
    }
}

/// Timestep a network is traced at before the first step
pub(crate) fn compile_timestep(discretization: &dyn Discretization, steps: usize) -> f32 {
    let timesteps = discretization.timesteps();
    timesteps - timesteps / steps.max(1) as f32 + 1.0
}

// ============================================================================
// Sigma-space step helpers
// ============================================================================

/// Sigma of step `i`, interpolating the first step of a fractional start
pub(crate) fn step_sigma(
    discretization: &dyn Discretization,
    alphas_cumprod: &[f64],
    sigmas: &[f64],
    i: usize,
    start: StepPosition,
) -> f64 {
    if i == start.integral && start.is_fractional() {
        let alpha_cumprod = discretization.interpolated_alpha_cumprod(alphas_cumprod, start.fractional);
        return discretization.sigma_from(alpha_cumprod);
    }
    sigmas[i]
}

/// Conditioning values of steps `i..end`, the first one at `alpha_cumprod`
pub(crate) fn remaining_conditioning(
    discretization: &dyn Discretization,
    conditioning: TimestepConditioning,
    alphas_cumprod: &[f64],
    i: usize,
    end: usize,
    alpha_cumprod: f64,
) -> Vec<f32> {
    (i..end)
        .map(|k| {
            let a = if k == i { alpha_cumprod } else { alphas_cumprod[k] };
            discretization.conditioning_value(a, conditioning)
        })
        .collect()
}

// ============================================================================
// Strength and scale factor families
// ============================================================================

/// How an integrator maps img2img strength and scales the reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScheduleFamily {
    /// Sigma-space latent, fractional start from a schedule scan
    Sigma,
    /// DDPM-space latent, fractional start from a schedule scan
    DdpmScan,
    /// DDPM-space latent, integral start `steps - floor(strength * steps)`
    DdpmIntegral,
}

impl ScheduleFamily {
    pub fn timestep_for_strength(
        self,
        discretization: &dyn Discretization,
        strength: f32,
        sampling: Sampling,
    ) -> StrengthMapping {
        match self {
            ScheduleFamily::Sigma | ScheduleFamily::DdpmScan => {
                strength_to_step(discretization, strength, sampling)
            }
            ScheduleFamily::DdpmIntegral => {
                strength_to_integral_step(discretization, strength, sampling)
            }
        }
    }

    pub fn noise_scale_factor(self, discretization: &dyn Discretization, step: f32, sampling: Sampling) -> f32 {
        match self {
            ScheduleFamily::Sigma => interpolated_sigma(discretization, step, sampling) as f32,
            ScheduleFamily::DdpmScan | ScheduleFamily::DdpmIntegral => {
                let a = rounded_alpha_cumprod(discretization, step, sampling);
                if discretization.objective().is_flow() {
                    (1.0 - a) as f32
                } else {
                    (1.0 - a).sqrt() as f32
                }
            }
        }
    }

    pub fn sample_scale_factor(self, discretization: &dyn Discretization, step: f32, sampling: Sampling) -> f32 {
        match self {
            ScheduleFamily::Sigma => {
                if discretization.objective().is_flow() {
                    1.0 - self.noise_scale_factor(discretization, step, sampling)
                } else {
                    1.0
                }
            }
            ScheduleFamily::DdpmScan | ScheduleFamily::DdpmIntegral => {
                let a = rounded_alpha_cumprod(discretization, step, sampling);
                if discretization.objective().is_flow() {
                    a as f32
                } else {
                    a.sqrt() as f32
                }
            }
        }
    }
}

// ============================================================================
// Sampler
// ============================================================================

/// Integrator selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerKind {
    Ddim,
    Plms,
    #[serde(rename = "dpmpp_2m")]
    DpmPp2m,
    #[serde(rename = "dpmpp_sde")]
    DpmPpSde,
    EulerAncestral,
    Lcm,
    Tcd,
    #[serde(rename = "unipc")]
    UniPc,
}

/// One of the eight integrators, chosen once per run
#[derive(Debug, Clone)]
pub enum Sampler {
    Ddim(DdimSampler),
    Plms(PlmsSampler),
    DpmPp2m(DpmPp2mSampler),
    DpmPpSde(DpmPpSdeSampler),
    EulerAncestral(EulerAncestralSampler),
    Lcm(LcmSampler),
    Tcd(TcdSampler),
    UniPc(UniPcSampler),
}

impl Sampler {
    /// Integrator with default configuration
    pub fn new(
        kind: SamplerKind,
        discretization: SharedDiscretization,
        conditioning: TimestepConditioning,
    ) -> Self {
        match kind {
            SamplerKind::Ddim => Sampler::Ddim(DdimSampler::new(discretization, conditioning)),
            SamplerKind::Plms => Sampler::Plms(PlmsSampler::new(discretization, conditioning)),
            SamplerKind::DpmPp2m => {
                Sampler::DpmPp2m(DpmPp2mSampler::new(discretization, conditioning))
            }
            SamplerKind::DpmPpSde => {
                Sampler::DpmPpSde(DpmPpSdeSampler::new(discretization, conditioning))
            }
            SamplerKind::EulerAncestral => Sampler::EulerAncestral(EulerAncestralSampler::new(
                discretization,
                conditioning,
                Default::default(),
            )),
            SamplerKind::Lcm => Sampler::Lcm(LcmSampler::new(discretization, conditioning)),
            SamplerKind::Tcd => {
                Sampler::Tcd(TcdSampler::new(discretization, conditioning, Default::default()))
            }
            SamplerKind::UniPc => Sampler::UniPc(UniPcSampler::new(discretization, conditioning)),
        }
    }

    pub fn kind(&self) -> SamplerKind {
        match self {
            Sampler::Ddim(_) => SamplerKind::Ddim,
            Sampler::Plms(_) => SamplerKind::Plms,
            Sampler::DpmPp2m(_) => SamplerKind::DpmPp2m,
            Sampler::DpmPpSde(_) => SamplerKind::DpmPpSde,
            Sampler::EulerAncestral(_) => SamplerKind::EulerAncestral,
            Sampler::Lcm(_) => SamplerKind::Lcm,
            Sampler::Tcd(_) => SamplerKind::Tcd,
            Sampler::UniPc(_) => SamplerKind::UniPc,
        }
    }

    pub fn discretization(&self) -> &dyn Discretization {
        match self {
            Sampler::Ddim(s) => s.discretization(),
            Sampler::Plms(s) => s.discretization(),
            Sampler::DpmPp2m(s) => s.discretization(),
            Sampler::DpmPpSde(s) => s.discretization(),
            Sampler::EulerAncestral(s) => s.discretization(),
            Sampler::Lcm(s) => s.discretization(),
            Sampler::Tcd(s) => s.discretization(),
            Sampler::UniPc(s) => s.discretization(),
        }
    }

    fn family(&self) -> ScheduleFamily {
        match self {
            Sampler::DpmPp2m(_) | Sampler::DpmPpSde(_) | Sampler::EulerAncestral(_) => {
                ScheduleFamily::Sigma
            }
            Sampler::Lcm(_) | Sampler::Tcd(_) => ScheduleFamily::DdpmScan,
            Sampler::Ddim(_) | Sampler::Plms(_) | Sampler::UniPc(_) => ScheduleFamily::DdpmIntegral,
        }
    }

    /// Integrate from `request.start` to `request.end`
    pub fn sample<B: Backend, N: DenoiserNetwork<B>>(
        &self,
        request: SampleRequest<'_, B, N>,
    ) -> Result<SamplerOutput<B, N>, SamplerError<N>> {
        match self {
            Sampler::Ddim(s) => s.sample(request),
            Sampler::Plms(s) => s.sample(request),
            Sampler::DpmPp2m(s) => s.sample(request),
            Sampler::DpmPpSde(s) => s.sample(request),
            Sampler::EulerAncestral(s) => s.sample(request),
            Sampler::Lcm(s) => s.sample(request),
            Sampler::Tcd(s) => s.sample(request),
            Sampler::UniPc(s) => s.sample(request),
        }
    }

    /// Where img2img at `strength` starts in the schedule
    pub fn timestep_for_strength(&self, strength: f32, sampling: Sampling) -> StrengthMapping {
        self.family()
            .timestep_for_strength(self.discretization(), strength, sampling)
    }

    /// Noise scale of the reference latent at a (fractional) step
    pub fn noise_scale_factor(&self, step: f32, sampling: Sampling) -> f32 {
        self.family()
            .noise_scale_factor(self.discretization(), step, sampling)
    }

    /// Sample scale of the reference latent at a (fractional) step
    pub fn sample_scale_factor(&self, step: f32, sampling: Sampling) -> f32 {
        self.family()
            .sample_scale_factor(self.discretization(), step, sampling)
    }
}
