//! Diffusion Sampling Engine
//!
//! Turns a denoising network into a sampler: noise schedules, guidance
//! composition, control injection, refiner hand-off and eight integrators
//! over NHWC latents.
//!
//! # Modules
//!
//! ## Schedules and Objectives
//!
//! - [`scheduler`] - Discretizations (linear, cosine, Karras, flow matching) and img2img strength mapping
//! - [`objective`] - Prediction objectives (epsilon, v, EDM, flow velocity) and their conversions
//!
//! ## Run Plumbing
//!
//! - [`guidance`] - Classifier-free guidance branches, zero-star rescale, sharpness blur
//! - [`injection`] - ControlNet / T2I-adapter / IP-adapter injection contract
//! - [`lifecycle`] - Network compilation, fixed encoder and refiner switch
//! - [`inpaint`] - Masked blending of the re-noised reference
//! - [`guard`] - Cancellation and NaN detection
//!
//! ## Integrators
//!
//! - [`ddim`], [`plms`], [`unipc`] - DDPM-space solvers on integral steps
//! - [`dpmpp_2m`], [`dpmpp_sde`], [`euler_ancestral`] - Sigma-space solvers
//! - [`lcm`], [`tcd`] - Consistency-distilled samplers
//!
//! [`Sampler`] picks one of them at runtime.

pub mod error;
pub mod model;
pub mod objective;
pub mod scheduler;

pub mod guard;
pub mod guidance;
pub mod injection;
pub mod inpaint;
pub mod lifecycle;
pub mod sampler;

pub mod ddim;
pub mod dpmpp_2m;
pub mod dpmpp_sde;
pub mod euler_ancestral;
pub mod lcm;
pub mod plms;
pub mod tcd;
pub mod unipc;

#[cfg(test)]
mod testing;

pub use error::{NetworkError, SamplerError};
pub use model::{ModelVersion, SamplerModifier};
pub use objective::{Objective, TimestepConditioning};
pub use scheduler::{
    CosineDiscretization, DdpmParameters, Discretization, EdmParameters, FlowMatchingDiscretization,
    KarrasDiscretization, LinearDiscretization, LinearManualDiscretization, Linspace, Parameterization,
    Sampling, SharedDiscretization, StepPosition, StrengthMapping,
};
pub use guard::CancellationToken;
pub use guidance::{CfgCompositor, CfgZeroStar, GuidanceConfig};
pub use injection::{ControlInputs, ControlMode, ControlModel, ControlType, InjectedControl, LoraConfiguration, LoraMode};
pub use inpaint::{Inpainting, LatentSpace};
pub use lifecycle::{
    Conditioning, DenoiserNetwork, EncodeRequest, FixedEncoder, NetworkConfiguration, NetworkFactory,
    NetworkInput, PassthroughEncoder, Refiner,
};
pub use sampler::{
    Feedback, GaussianNoise, NoiseSource, SampleRequest, Sampler, SamplerKind, SamplerOutput, ZeroNoise,
};

pub use ddim::DdimSampler;
pub use dpmpp_2m::DpmPp2mSampler;
pub use dpmpp_sde::DpmPpSdeSampler;
pub use euler_ancestral::{EulerAncestralConfig, EulerAncestralSampler};
pub use lcm::LcmSampler;
pub use plms::PlmsSampler;
pub use tcd::{TcdConfig, TcdSampler};
pub use unipc::UniPcSampler;
