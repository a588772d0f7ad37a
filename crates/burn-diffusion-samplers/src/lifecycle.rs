//! Denoiser network lifecycle
//!
//! The engine never builds networks itself. A [`NetworkFactory`] compiles
//! them on demand, a [`FixedEncoder`] turns prompt encodings into per-run
//! [`Conditioning`], and [`ModelLifecycle`] owns the compiled instances for
//! the duration of a run, including the one-shot switch to a refiner.

use std::sync::Arc;

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::NetworkError;
use crate::injection::{loras_for_base, loras_for_refiner, InjectedControls, LoraConfiguration};
use crate::model::{ModelVersion, SamplerModifier};

/// Callback interrupting an in-flight network evaluation
pub type CancelHook = Arc<dyn Fn() + Send + Sync>;

// ============================================================================
// Collaborator contracts
// ============================================================================

/// Everything a denoiser sees for one evaluation
#[derive(Debug, Clone)]
pub struct NetworkInput<B: Backend> {
    /// Conditioning scalar (timestep or noise level)
    pub timestep: f32,
    pub time_embedding: Option<Tensor<B, 2>>,
    /// Network input batch, all CFG branches
    pub latent: Tensor<B, 4>,
    pub conditioning: Vec<Tensor<B, 3>>,
    pub vector: Option<Tensor<B, 2>>,
    pub extra_projection: Option<Tensor<B, 2>>,
    pub controls: InjectedControls<B>,
    /// Absolute step index
    pub step: usize,
}

/// An opaque, compiled denoiser
pub trait DenoiserNetwork<B: Backend> {
    fn version(&self) -> ModelVersion;

    /// Predict noise, velocity or clean sample for the input batch
    fn forward(&mut self, input: NetworkInput<B>) -> Result<Tensor<B, 4>, NetworkError>;

    /// Decode a latent for preview
    fn decode(&mut self, latent: Tensor<B, 4>) -> Result<Tensor<B, 4>, NetworkError> {
        Ok(latent)
    }

    /// Precomputed time embedding, if the network takes one from the caller
    fn time_embedding(&self, _timestep: f32, _batch_size: usize) -> Option<Tensor<B, 2>> {
        None
    }

    /// Projects a guidance embedding into time-embedding space (consistency models)
    fn guidance_projection(&self, _embedding: Tensor<B, 2>) -> Option<Tensor<B, 2>> {
        None
    }

    fn cancel_hook(&self) -> Option<CancelHook> {
        None
    }

    /// Release weights; the handle stays valid for reuse
    fn unload(&mut self) {}
}

/// Compiles a network for a configuration
pub trait NetworkFactory<N> {
    fn compile(&mut self, configuration: &NetworkConfiguration) -> Result<N, NetworkError>;
}

impl<N, F> NetworkFactory<N> for F
where
    F: FnMut(&NetworkConfiguration) -> Result<N, NetworkError>,
{
    fn compile(&mut self, configuration: &NetworkConfiguration) -> Result<N, NetworkError> {
        self(configuration)
    }
}

/// Turns prompt encodings into model-specific conditioning
pub trait FixedEncoder<B: Backend> {
    fn encode(&mut self, request: &EncodeRequest<B>) -> Result<Conditioning<B>, NetworkError>;
}

/// Uses the caller's text encodings unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughEncoder;

impl<B: Backend> FixedEncoder<B> for PassthroughEncoder {
    fn encode(&mut self, request: &EncodeRequest<B>) -> Result<Conditioning<B>, NetworkError> {
        Ok(Conditioning::new(request.text_encodings.clone()))
    }
}

// ============================================================================
// Records
// ============================================================================

/// Size and aesthetic micro-conditioning (SDXL family)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConditioning {
    pub original_size: (u32, u32),
    pub crop_top_left: (u32, u32),
    pub target_size: (u32, u32),
    pub aesthetic_score: f32,
    pub negative_original_size: (u32, u32),
    pub negative_aesthetic_score: f32,
    pub zero_negative_prompt: bool,
}

impl Default for ImageConditioning {
    fn default() -> Self {
        Self {
            original_size: (1024, 1024),
            crop_top_left: (0, 0),
            target_size: (1024, 1024),
            aesthetic_score: 6.0,
            negative_original_size: (512, 512),
            negative_aesthetic_score: 2.5,
            zero_negative_prompt: false,
        }
    }
}

/// Image-to-video conditioning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConditioning {
    pub fps_id: u32,
    pub motion_bucket_id: u32,
    pub cond_aug: f32,
}

impl Default for VideoConditioning {
    fn default() -> Self {
        Self {
            fps_id: 5,
            motion_bucket_id: 127,
            cond_aug: 0.02,
        }
    }
}

/// Tiled evaluation settings, passed through to the network
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TiledDiffusion {
    pub enabled: bool,
    pub tile_width: u32,
    pub tile_height: u32,
    pub tile_overlap: u32,
}

/// Step-skipping cache settings, passed through to the network
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TeaCache {
    pub enabled: bool,
    pub start_step: usize,
    pub end_step: usize,
    pub threshold: f32,
}

/// Causal (frame-by-frame) video inference, passed through to the network
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CausalInference {
    pub enabled: bool,
    pub frames: usize,
    pub pad: usize,
}

/// Refiner taking over for the low-noise tail of the schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Refiner {
    /// Fraction of the schedule (from the noisy end) run by the base network
    pub start: f32,
    pub file_path: String,
    pub version: ModelVersion,
    #[serde(default)]
    pub is_quantized_model: bool,
    #[serde(default)]
    pub is_consistency_model: bool,
    #[serde(default)]
    pub builtin_lora: bool,
    #[serde(default)]
    pub external_on_demand: bool,
}

impl Refiner {
    pub fn new(start: f32, file_path: impl Into<String>, version: ModelVersion) -> Self {
        Self {
            start,
            file_path: file_path.into(),
            version,
            is_quantized_model: false,
            is_consistency_model: false,
            builtin_lora: false,
            external_on_demand: false,
        }
    }

    /// Timestep below which the refiner takes over
    pub fn threshold(&self, timesteps: f32) -> f32 {
        (1.0 - self.start) * timesteps
    }
}

/// What a factory needs to compile one network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfiguration {
    pub file_path: String,
    pub version: ModelVersion,
    #[serde(default)]
    pub modifier: SamplerModifier,
    #[serde(default)]
    pub is_quantized_model: bool,
    #[serde(default)]
    pub is_consistency_model: bool,
    #[serde(default)]
    pub external_on_demand: bool,
    #[serde(default)]
    pub loras: Vec<LoraConfiguration>,
    /// Timestep used to trace the network at compile time
    #[serde(default)]
    pub timestep: f32,
    /// Network batch (all CFG branches)
    #[serde(default)]
    pub batch_size: usize,
    #[serde(default)]
    pub input_channels: usize,
    #[serde(default)]
    pub tiled_diffusion: TiledDiffusion,
    #[serde(default)]
    pub tea_cache: TeaCache,
    #[serde(default)]
    pub causal_inference: CausalInference,
}

impl NetworkConfiguration {
    pub fn new(file_path: impl Into<String>, version: ModelVersion) -> Self {
        Self {
            file_path: file_path.into(),
            version,
            modifier: SamplerModifier::None,
            is_quantized_model: false,
            is_consistency_model: false,
            external_on_demand: false,
            loras: Vec::new(),
            timestep: 0.0,
            batch_size: 1,
            input_channels: 4,
            tiled_diffusion: TiledDiffusion::default(),
            tea_cache: TeaCache::default(),
            causal_inference: CausalInference::default(),
        }
    }

    /// Configuration of the refiner derived from the base configuration
    pub fn for_refiner(&self, refiner: &Refiner) -> Self {
        Self {
            file_path: refiner.file_path.clone(),
            version: refiner.version,
            is_quantized_model: refiner.is_quantized_model,
            is_consistency_model: refiner.is_consistency_model,
            external_on_demand: refiner.external_on_demand,
            loras: loras_for_refiner(&self.loras, refiner, &self.file_path),
            ..self.clone()
        }
    }
}

/// Request handed to the fixed encoder
#[derive(Debug, Clone)]
pub struct EncodeRequest<B: Backend> {
    pub version: ModelVersion,
    pub text_encodings: Vec<Tensor<B, 3>>,
    /// Timesteps of the remaining steps, for timestep-dependent encodings
    pub timesteps: Vec<f32>,
    pub batch_size: usize,
    pub height: usize,
    pub width: usize,
    pub token_length_uncond: usize,
    pub token_length_cond: usize,
    pub loras: Vec<LoraConfiguration>,
    pub is_cfg_enabled: bool,
    pub image: ImageConditioning,
    pub video: VideoConditioning,
}

impl<B: Backend> EncodeRequest<B> {
    pub fn new(version: ModelVersion, text_encodings: Vec<Tensor<B, 3>>) -> Self {
        Self {
            version,
            text_encodings,
            timesteps: Vec::new(),
            batch_size: 1,
            height: 0,
            width: 0,
            token_length_uncond: 77,
            token_length_cond: 77,
            loras: Vec::new(),
            is_cfg_enabled: true,
            image: ImageConditioning::default(),
            video: VideoConditioning::default(),
        }
    }
}

/// Per-run conditioning bundle
#[derive(Debug, Clone)]
pub struct Conditioning<B: Backend> {
    pub encodings: Vec<Tensor<B, 3>>,
    /// Pooled vector conditioning
    pub vector: Option<Tensor<B, 2>>,
    pub extra_projection: Option<Tensor<B, 2>>,
    /// Timestep-dependent encodings, one list per remaining step
    pub per_step: Option<Vec<Vec<Tensor<B, 3>>>>,
}

impl<B: Backend> Conditioning<B> {
    pub fn new(encodings: Vec<Tensor<B, 3>>) -> Self {
        Self {
            encodings,
            vector: None,
            extra_projection: None,
            per_step: None,
        }
    }

    /// Encodings for the step at `index` relative to the network's first step
    pub fn for_step(&self, index: usize) -> Vec<Tensor<B, 3>> {
        match &self.per_step {
            Some(steps) if !steps.is_empty() => steps[index.min(steps.len() - 1)].clone(),
            _ => self.encodings.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.encodings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.encodings.is_empty()
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Owns the run's network instances; the last one is hot
pub struct ModelLifecycle<N> {
    networks: Vec<N>,
    version: ModelVersion,
    index_offset: usize,
    refiner: Option<Refiner>,
    threshold: Option<f32>,
}

impl<N> ModelLifecycle<N> {
    /// Start a run with the caller's networks; at most the first one is kept
    pub fn new(
        networks: Vec<N>,
        version: ModelVersion,
        refiner: Option<Refiner>,
        timesteps: f32,
    ) -> Self {
        let threshold = refiner.as_ref().map(|r| r.threshold(timesteps));
        Self {
            networks: networks.into_iter().take(1).collect(),
            version,
            index_offset: 0,
            refiner,
            threshold,
        }
    }

    /// Version of the hot network
    pub fn version(&self) -> ModelVersion {
        self.version
    }

    /// Step at which the hot network started
    pub fn index_offset(&self) -> usize {
        self.index_offset
    }

    pub fn set_index_offset(&mut self, index_offset: usize) {
        self.index_offset = index_offset;
    }

    pub fn refiner(&self) -> Option<&Refiner> {
        self.refiner.as_ref()
    }

    /// True once the refiner took over
    pub fn has_switched(&self) -> bool {
        self.refiner.is_some() && self.threshold.is_none()
    }

    /// Compile the base network if the caller supplied none
    pub fn ensure_compiled(
        &mut self,
        factory: &mut dyn NetworkFactory<N>,
        configuration: &NetworkConfiguration,
    ) -> Result<(), NetworkError> {
        if self.networks.is_empty() {
            let configuration = NetworkConfiguration {
                loras: loras_for_base(&configuration.loras),
                ..configuration.clone()
            };
            tracing::debug!(file = %configuration.file_path, "compiling base network");
            self.networks.push(factory.compile(&configuration)?);
        }
        Ok(())
    }

    pub fn hot(&mut self) -> Result<&mut N, NetworkError> {
        self.networks
            .last_mut()
            .ok_or_else(|| NetworkError::Load("no network compiled".into()))
    }

    pub fn into_networks(self) -> Vec<N> {
        self.networks
    }

    /// Move the networks out, leaving the lifecycle empty
    pub fn take_networks(&mut self) -> Vec<N> {
        std::mem::take(&mut self.networks)
    }

    /// Whether `timestep` is past the refiner threshold
    pub fn should_switch(&self, timestep: f32) -> bool {
        self.threshold.is_some_and(|threshold| timestep < threshold)
    }
}

impl<N> ModelLifecycle<N> {
    /// Hand over to the refiner once `timestep` drops below the threshold
    ///
    /// Unloads the hot network, re-encodes the conditioning for the refiner
    /// and compiles it. Returns the refiner's conditioning when the switch
    /// happened; fires at most once per run.
    pub fn maybe_switch<B: Backend>(
        &mut self,
        step: usize,
        timestep: f32,
        factory: &mut dyn NetworkFactory<N>,
        encoder: &mut dyn FixedEncoder<B>,
        request: &EncodeRequest<B>,
        base: &NetworkConfiguration,
    ) -> Result<Option<Conditioning<B>>, NetworkError>
    where
        N: DenoiserNetwork<B>,
    {
        if !self.should_switch(timestep) {
            return Ok(None);
        }
        let Some(refiner) = self.refiner.clone() else {
            return Ok(None);
        };
        self.threshold = None;
        if let Some(hot) = self.networks.last_mut() {
            hot.unload();
        }
        let configuration = NetworkConfiguration {
            timestep,
            ..base.for_refiner(&refiner)
        };
        let request = EncodeRequest {
            version: refiner.version,
            loras: configuration.loras.clone(),
            ..request.clone()
        };
        let conditioning = encoder.encode(&request)?;
        let network = factory.compile(&configuration)?;
        self.networks.push(network);
        self.version = refiner.version;
        self.index_offset = step;
        tracing::info!(
            step,
            timestep,
            file = %refiner.file_path,
            version = ?refiner.version,
            "switching to refiner"
        );
        Ok(Some(conditioning))
    }
}
