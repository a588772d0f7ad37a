//! Classifier-free guidance composition
//!
//! Builds the batched network input for the conditional / unconditional
//! (and, for editing models, all-unconditional) branches, and recombines the
//! network output into a single guided prediction.
//!
//! Branch layout along the batch dimension, `b` = caller batch size:
//!
//! | branch | rows | content |
//! |---|---|---|
//! | unconditional | `0..b` | negative prompt |
//! | conditional | `b..2b` | positive prompt |
//! | all-unconditional | `2b..3b` | editing only: no prompt, no image |

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::model::{ModelVersion, SamplerModifier};

const CFG_EPSILON: f32 = 1e-2;

// ============================================================================
// Configuration
// ============================================================================

/// CFG-Zero* rescale of the unconditional branch
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CfgZeroStar {
    pub enabled: bool,
    /// Leading steps whose guided output is forced to zero
    pub zero_init_steps: usize,
}

/// Guidance knobs for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuidanceConfig {
    /// Text guidance scale
    pub text: f32,
    /// Image guidance scale (editing models)
    pub image: f32,
    /// Guidance on the first frame (image-to-video), ramped to `text`
    pub start_frame_cfg: f32,
    /// Blends a blurred conditional prediction in at high noise
    pub sharpness: f32,
    /// Distilled guidance value for guidance-embedded models
    pub guidance_embed: f32,
    /// Caller switch; CFG runs only if this is set and the scales call for it
    pub classifier_free_guidance: bool,
    pub cfg_zero_star: CfgZeroStar,
}

impl Default for GuidanceConfig {
    fn default() -> Self {
        Self {
            text: 7.5,
            image: 1.5,
            start_frame_cfg: 1.0,
            sharpness: 0.0,
            guidance_embed: 3.5,
            classifier_free_guidance: true,
            cfg_zero_star: CfgZeroStar::default(),
        }
    }
}

// ============================================================================
// Channel policy
// ============================================================================

/// Whether the guidance scales call for more than a single branch
pub fn is_cfg_enabled(
    text: f32,
    image: f32,
    start_frame_cfg: f32,
    version: ModelVersion,
    modifier: SamplerModifier,
) -> bool {
    if version == ModelVersion::SvdI2v {
        return (text - 1.0).abs() > CFG_EPSILON || (start_frame_cfg - 1.0).abs() > CFG_EPSILON;
    }
    if modifier == SamplerModifier::Editing {
        return !((text - 1.0).abs() <= CFG_EPSILON && (image - 1.0).abs() <= CFG_EPSILON);
    }
    (text - 1.0).abs() > CFG_EPSILON
}

/// Number of CFG branches and network input channels
pub fn cfg_channels_and_input_channels(
    channels: usize,
    condition_channels: Option<usize>,
    is_cfg_enabled: bool,
    text: f32,
    image: f32,
    version: ModelVersion,
    modifier: SamplerModifier,
) -> (usize, usize) {
    if version == ModelVersion::SvdI2v {
        return (1, channels * 2);
    }
    let branches = if is_cfg_enabled { 2 } else { 1 };
    match modifier {
        SamplerModifier::Inpainting | SamplerModifier::Depth | SamplerModifier::Canny => {
            (branches, channels + condition_channels.unwrap_or(0))
        }
        SamplerModifier::Editing => {
            let cfg_channels = if !is_cfg_enabled {
                1
            } else if (text - image).abs() <= CFG_EPSILON {
                // degrades to guidance * (cond - all_uncond) + all_uncond
                2
            } else {
                3
            };
            (cfg_channels, channels * 2)
        }
        SamplerModifier::Double => (branches, channels * 2),
        SamplerModifier::None | SamplerModifier::Kontext => (branches, channels),
    }
}

// ============================================================================
// Blur
// ============================================================================

/// Depthwise, zero-padded, separable Gaussian blur over H and W of an NHWC tensor
#[derive(Debug, Clone)]
pub struct GaussianBlur {
    kernel: Vec<f32>,
}

impl GaussianBlur {
    pub fn new(sigma: f32, size: usize) -> Self {
        let size = size.max(1);
        let half = (size / 2) as f32;
        let weights: Vec<f32> = (0..size)
            .map(|i| {
                let d = i as f32 - half;
                (-d * d / (2.0 * sigma * sigma)).exp()
            })
            .collect();
        let sum: f32 = weights.iter().sum();
        Self {
            kernel: weights.into_iter().map(|w| w / sum).collect(),
        }
    }

    pub fn kernel(&self) -> &[f32] {
        &self.kernel
    }

    pub fn forward<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.blur_dim(x, 1);
        self.blur_dim(x, 2)
    }

    fn blur_dim<B: Backend>(&self, x: Tensor<B, 4>, dim: usize) -> Tensor<B, 4> {
        let dims = x.dims();
        let length = dims[dim];
        let pad = self.kernel.len() / 2;
        let mut pad_shape = dims;
        pad_shape[dim] = pad;
        let zeros = Tensor::<B, 4>::zeros(pad_shape, &x.device());
        let padded = Tensor::cat(vec![zeros.clone(), x, zeros], dim);
        let mut blurred = padded.clone().narrow(dim, 0, length).mul_scalar(self.kernel[0]);
        for (k, &w) in self.kernel.iter().enumerate().skip(1) {
            blurred = blurred + padded.clone().narrow(dim, k, length).mul_scalar(w);
        }
        blurred
    }
}

// ============================================================================
// Compositor
// ============================================================================

/// One network evaluation planned by the compositor
#[derive(Debug, Clone)]
pub struct GuidancePass<B: Backend> {
    pub latent: Tensor<B, 4>,
    /// Indices into the run's conditioning list used by this pass, `None` for all
    pub conditioning: Option<Vec<usize>>,
}

/// Batched CFG input construction and output recombination for one run
#[derive(Debug, Clone)]
pub struct CfgCompositor {
    batch_size: usize,
    channels: usize,
    cfg_channels: usize,
    is_cfg_enabled: bool,
    text: f32,
    image: f32,
    start_frame_cfg: f32,
    sharpness: f32,
    timesteps: f32,
    version: ModelVersion,
    modifier: SamplerModifier,
    cfg_zero_star: CfgZeroStar,
    blur: Option<GaussianBlur>,
}

impl CfgCompositor {
    pub fn new(
        guidance: &GuidanceConfig,
        version: ModelVersion,
        modifier: SamplerModifier,
        batch_size: usize,
        channels: usize,
        condition_channels: Option<usize>,
        timesteps: f32,
    ) -> Self {
        let is_cfg_enabled = guidance.classifier_free_guidance
            && is_cfg_enabled(
                guidance.text,
                guidance.image,
                guidance.start_frame_cfg,
                version,
                modifier,
            );
        let (cfg_channels, _) = cfg_channels_and_input_channels(
            channels,
            condition_channels,
            is_cfg_enabled,
            guidance.text,
            guidance.image,
            version,
            modifier,
        );
        Self {
            batch_size,
            channels,
            cfg_channels,
            is_cfg_enabled,
            text: guidance.text,
            image: guidance.image,
            start_frame_cfg: guidance.start_frame_cfg,
            sharpness: guidance.sharpness,
            timesteps,
            version,
            modifier,
            cfg_zero_star: guidance.cfg_zero_star,
            blur: (guidance.sharpness > 0.0).then(|| GaussianBlur::new(3.0, 13)),
        }
    }

    pub fn is_cfg_enabled(&self) -> bool {
        self.is_cfg_enabled
    }

    /// Branches evaluated per network call
    pub fn cfg_channels(&self) -> usize {
        self.cfg_channels
    }

    /// Batch of a single network call
    pub fn network_batch(&self) -> usize {
        self.cfg_channels * self.batch_size
    }

    /// Plan the network evaluations for input `x`
    ///
    /// `conditioning_len` is the number of encodings in the run's conditioning;
    /// image-to-video models split it into conditional and unconditional halves
    /// and evaluate the branches separately.
    pub fn passes<B: Backend>(
        &self,
        x: Tensor<B, 4>,
        condition_image: Option<&Tensor<B, 4>>,
        conditioning_len: usize,
    ) -> Vec<GuidancePass<B>> {
        if self.version == ModelVersion::SvdI2v {
            let split = 1 + conditioning_len.saturating_sub(1) / 2;
            let condition = match condition_image {
                Some(image) => self.repeat_batch(image.clone()),
                None => x.zeros_like(),
            };
            let mut passes = vec![GuidancePass {
                latent: Tensor::cat(vec![x.clone(), condition.clone()], 3),
                conditioning: Some((0..split).collect()),
            }];
            if self.is_cfg_enabled {
                let uncond = std::iter::once(0).chain(split..conditioning_len).collect();
                passes.push(GuidancePass {
                    latent: Tensor::cat(vec![x, condition.zeros_like()], 3),
                    conditioning: Some(uncond),
                });
            }
            return passes;
        }
        vec![GuidancePass {
            latent: self.build_input(x, condition_image),
            conditioning: None,
        }]
    }

    /// Replicate `x` per branch and append the modifier's condition channels
    pub fn build_input<B: Backend>(
        &self,
        x: Tensor<B, 4>,
        condition_image: Option<&Tensor<B, 4>>,
    ) -> Tensor<B, 4> {
        let branches: Vec<Tensor<B, 4>> = (0..self.cfg_channels).map(|_| x.clone()).collect();
        let latent = if branches.len() == 1 {
            x
        } else {
            Tensor::cat(branches, 0)
        };
        let Some(image) = condition_image else {
            return latent;
        };
        let image = self.repeat_batch(image.clone());
        let zeros = image.zeros_like();
        let condition = match self.modifier {
            SamplerModifier::None | SamplerModifier::Kontext => return latent,
            SamplerModifier::Editing => match self.cfg_channels {
                1 => image,
                // branch 0 stands in for the all-unconditional branch
                2 => Tensor::cat(vec![zeros, image], 0),
                _ => Tensor::cat(vec![image.clone(), image, zeros], 0),
            },
            SamplerModifier::Inpainting
            | SamplerModifier::Depth
            | SamplerModifier::Canny
            | SamplerModifier::Double => {
                let copies: Vec<Tensor<B, 4>> =
                    (0..self.cfg_channels).map(|_| image.clone()).collect();
                Tensor::cat(copies, 0)
            }
        };
        Tensor::cat(vec![latent, condition], 3)
    }

    /// Adapt per-run encodings to the branch layout
    ///
    /// With CFG off only the conditional half `[b, 2b)` is kept; three-branch
    /// editing appends the unconditional rows as the all-unconditional branch.
    pub fn prepare_encodings<B: Backend>(&self, encodings: Vec<Tensor<B, 3>>) -> Vec<Tensor<B, 3>> {
        if self.version == ModelVersion::SvdI2v {
            return encodings;
        }
        let b = self.batch_size;
        encodings
            .into_iter()
            .map(|c| {
                let [n, t, d] = c.dims();
                if !self.is_cfg_enabled {
                    if n == 2 * b {
                        return c.slice([b..2 * b, 0..t, 0..d]);
                    }
                    return c;
                }
                if self.cfg_channels == 3 && n == 2 * b {
                    let uncond = c.clone().slice([0..b, 0..t, 0..d]);
                    return Tensor::cat(vec![c, uncond], 0);
                }
                c
            })
            .collect()
    }

    /// Same as [`prepare_encodings`](Self::prepare_encodings) for pooled vectors
    pub fn prepare_vector<B: Backend>(&self, vector: Tensor<B, 2>) -> Tensor<B, 2> {
        let b = self.batch_size;
        let [n, d] = vector.dims();
        if self.version == ModelVersion::SvdI2v || n != 2 * b {
            return vector;
        }
        if !self.is_cfg_enabled {
            return vector.slice([b..2 * b, 0..d]);
        }
        if self.cfg_channels == 3 {
            let uncond = vector.clone().slice([0..b, 0..d]);
            return Tensor::cat(vec![vector, uncond], 0);
        }
        vector
    }

    /// Combine the outputs of the planned passes into one prediction
    ///
    /// `unconditional` is the output of the second pass when the branches were
    /// evaluated separately.
    pub fn compose<B: Backend>(
        &self,
        output: Tensor<B, 4>,
        unconditional: Option<Tensor<B, 4>>,
        timestep: f32,
        step: usize,
    ) -> Tensor<B, 4> {
        let alpha = 0.001 * self.sharpness * (self.timesteps - timestep) / self.timesteps;
        let guided = match unconditional {
            Some(uncond) => {
                let uncond = self.latent_slice(uncond, 0);
                let cond = self.sharpen(self.latent_slice(output, 0), alpha);
                let scale = self.frame_scales(&cond);
                uncond.clone() + scale * (cond - uncond)
            }
            None => self.compose_batched(output, alpha),
        };
        if self.cfg_zero_star.enabled && step < self.cfg_zero_star.zero_init_steps {
            return guided.zeros_like();
        }
        guided
    }

    fn compose_batched<B: Backend>(&self, output: Tensor<B, 4>, alpha: f32) -> Tensor<B, 4> {
        if !self.is_cfg_enabled {
            return self.sharpen(self.latent_slice(output, 0), alpha);
        }
        let mut uncond = self.latent_slice(output.clone(), 0);
        let cond = self.sharpen(self.latent_slice(output.clone(), 1), alpha);
        let batch_enabled = self.version.is_batch_enabled();
        if self.modifier == SamplerModifier::Editing {
            if self.cfg_channels == 2 {
                if self.cfg_zero_star.enabled {
                    uncond = zero_star_rescale(uncond, &cond, batch_enabled);
                }
                return uncond.clone() + (cond - uncond).mul_scalar(self.image);
            }
            let mut all_uncond = self.latent_slice(output, 2);
            if self.cfg_zero_star.enabled {
                all_uncond = zero_star_rescale(all_uncond, &uncond, false);
            }
            return all_uncond.clone()
                + (cond - uncond.clone()).mul_scalar(self.text)
                + (uncond - all_uncond).mul_scalar(self.image);
        }
        if self.cfg_zero_star.enabled {
            uncond = zero_star_rescale(uncond, &cond, batch_enabled);
        }
        uncond.clone() + (cond - uncond).mul_scalar(self.text)
    }

    /// Rows of `branch`, restricted to the latent channels
    fn latent_slice<B: Backend>(&self, output: Tensor<B, 4>, branch: usize) -> Tensor<B, 4> {
        let [n, h, w, c] = output.dims();
        let b = self.batch_size;
        let start = (branch * b).min(n);
        let end = (start + b).min(n);
        if start == 0 && end == n && c <= self.channels {
            return output;
        }
        output.slice([start..end, 0..h, 0..w, 0..self.channels.min(c)])
    }

    fn sharpen<B: Backend>(&self, cond: Tensor<B, 4>, alpha: f32) -> Tensor<B, 4> {
        match &self.blur {
            Some(blur) => {
                let degraded = blur.forward(cond.clone());
                degraded.mul_scalar(alpha) + cond.mul_scalar(1.0 - alpha)
            }
            None => cond,
        }
    }

    /// Per-frame guidance for image-to-video, ramping from the first frame
    fn frame_scales<B: Backend>(&self, like: &Tensor<B, 4>) -> Tensor<B, 4> {
        let dims = like.dims();
        let frames = dims[0];
        let denom = frames.saturating_sub(1).max(1) as f32;
        let scales: Vec<f32> = (0..frames)
            .map(|i| i as f32 * (self.text - self.start_frame_cfg) / denom + self.start_frame_cfg)
            .collect();
        Tensor::<B, 4>::from_data(TensorData::new(scales, [frames, 1, 1, 1]), &like.device())
            .expand(dims)
    }

    fn repeat_batch<B: Backend>(&self, image: Tensor<B, 4>) -> Tensor<B, 4> {
        let n = image.dims()[0];
        if n >= self.batch_size || n == 0 {
            return image;
        }
        let copies: Vec<Tensor<B, 4>> = (0..self.batch_size.div_ceil(n))
            .map(|_| image.clone())
            .collect();
        let [_, h, w, c] = image.dims();
        Tensor::cat(copies, 0).slice([0..self.batch_size, 0..h, 0..w, 0..c])
    }
}

/// CFG-Zero*: project `uncond` onto `cond` before guidance
pub fn zero_star_rescale<B: Backend>(
    uncond: Tensor<B, 4>,
    cond: &Tensor<B, 4>,
    batch_enabled: bool,
) -> Tensor<B, 4> {
    let dims = uncond.dims();
    let product = uncond.clone() * cond.clone();
    let squared = uncond.clone() * uncond.clone();
    let scale = if batch_enabled {
        let dot = product.sum().reshape([1, 1, 1, 1]);
        let norm = squared.sum().reshape([1, 1, 1, 1]).add_scalar(1e-8);
        dot / norm
    } else {
        let dot = product.sum_dim(1).sum_dim(2).sum_dim(3);
        let norm = squared.sum_dim(1).sum_dim(2).sum_dim(3).add_scalar(1e-8);
        dot / norm
    };
    uncond * scale.expand(dims)
}

/// Sinusoidal embedding of a guidance scale (sin half first)
pub fn guidance_scale_embedding(scale: f32, dim: usize) -> Vec<f32> {
    let half = dim / 2;
    let scale = scale as f64 * 1000.0;
    let denom = half.saturating_sub(1).max(1) as f64;
    let freqs: Vec<f64> = (0..half)
        .map(|i| (-(10000f64.ln()) * i as f64 / denom).exp() * scale)
        .collect();
    freqs
        .iter()
        .map(|f| f.sin() as f32)
        .chain(freqs.iter().map(|f| f.cos() as f32))
        .collect()
}
