//! Run configuration
//!
//! A JSON document describing one sampling run. Every field has a default,
//! so `{}` is a valid configuration (DDIM, 20 steps, SD 1.x schedule).

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use burn_diffusion_samplers::{
    CosineDiscretization, DdimSampler, DdpmParameters, DpmPp2mSampler, DpmPpSdeSampler,
    EulerAncestralConfig, EulerAncestralSampler, FlowMatchingDiscretization, GuidanceConfig, KarrasDiscretization,
    LcmSampler, LinearDiscretization, ModelVersion, Objective, Parameterization, PlmsSampler, Refiner, Sampler,
    SamplerKind, Sampling, SharedDiscretization, TcdConfig, TcdSampler, TimestepConditioning, UniPcSampler,
};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Noise schedule family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DiscretizationKind {
    #[default]
    Linear,
    Cosine,
    Karras,
    FlowMatching,
}

/// What the denoiser predicts on DDPM schedules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveKind {
    #[default]
    Epsilon,
    V,
}

/// Schedule selection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub discretization: DiscretizationKind,
    /// Ignored for flow matching, which always predicts velocity
    pub objective: ObjectiveKind,
    /// Training steps of a flow-matching schedule
    pub timesteps: f32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self::new(DiscretizationKind::Linear, ObjectiveKind::Epsilon)
    }
}

impl ScheduleConfig {
    pub fn new(discretization: DiscretizationKind, objective: ObjectiveKind) -> Self {
        Self {
            discretization,
            objective,
            timesteps: 1000.0,
        }
    }

    pub fn objective(&self) -> Objective {
        match (self.discretization, self.objective) {
            (DiscretizationKind::FlowMatching, _) => Objective::U {
                condition_scale: self.timesteps as f64,
            },
            (_, ObjectiveKind::Epsilon) => Objective::Epsilon,
            (_, ObjectiveKind::V) => Objective::V,
        }
    }

    pub fn build(&self) -> SharedDiscretization {
        let objective = self.objective();
        let ddpm = Parameterization::Ddpm(DdpmParameters::default());
        match self.discretization {
            DiscretizationKind::Linear => Arc::new(LinearDiscretization::new(ddpm, objective)),
            DiscretizationKind::Cosine => Arc::new(CosineDiscretization::new(ddpm, objective)),
            DiscretizationKind::Karras => Arc::new(KarrasDiscretization::new(ddpm, objective)),
            DiscretizationKind::FlowMatching => Arc::new(FlowMatchingDiscretization::new(self.timesteps)),
        }
    }
}

/// Gaussian the analytic denoiser treats as the data distribution
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataDistribution {
    pub mean: f32,
    pub std: f32,
}

impl Default for DataDistribution {
    fn default() -> Self {
        Self { mean: 0.0, std: 0.5 }
    }
}

/// One sampling run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub sampler: SamplerKind,
    pub schedule: ScheduleConfig,
    pub conditioning: TimestepConditioning,
    pub sampling: Sampling,
    /// img2img strength; 1.0 starts from pure noise
    pub strength: f32,
    pub guidance: GuidanceConfig,
    pub euler_ancestral: EulerAncestralConfig,
    pub tcd: TcdConfig,
    pub refiner: Option<Refiner>,
    pub version: ModelVersion,
    pub batch: usize,
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    pub data: DataDistribution,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            sampler: SamplerKind::Ddim,
            schedule: ScheduleConfig::default(),
            conditioning: TimestepConditioning::Timestep,
            sampling: Sampling::default(),
            strength: 1.0,
            guidance: GuidanceConfig::default(),
            euler_ancestral: EulerAncestralConfig::default(),
            tcd: TcdConfig::default(),
            refiner: None,
            version: ModelVersion::V1,
            batch: 1,
            height: 64,
            width: 64,
            channels: 4,
            data: DataDistribution::default(),
        }
    }
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.sampling.steps > 0, "steps must be positive");
        anyhow::ensure!(
            self.batch > 0 && self.height > 0 && self.width > 0 && self.channels > 0,
            "latent shape must be non-empty"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.strength),
            "strength must be within [0, 1], got {}",
            self.strength
        );
        anyhow::ensure!(self.data.std > 0.0, "data std must be positive");
        anyhow::ensure!(self.schedule.timesteps > 0.0, "schedule timesteps must be positive");
        Ok(())
    }

    pub fn shape(&self) -> [usize; 4] {
        [self.batch, self.height, self.width, self.channels]
    }

    /// Integrator with the per-sampler knobs of this configuration applied
    pub fn build_sampler(&self, discretization: SharedDiscretization) -> Sampler {
        let conditioning = self.conditioning;
        match self.sampler {
            SamplerKind::Ddim => Sampler::Ddim(DdimSampler::new(discretization, conditioning)),
            SamplerKind::Plms => Sampler::Plms(PlmsSampler::new(discretization, conditioning)),
            SamplerKind::DpmPp2m => Sampler::DpmPp2m(DpmPp2mSampler::new(discretization, conditioning)),
            SamplerKind::DpmPpSde => Sampler::DpmPpSde(DpmPpSdeSampler::new(discretization, conditioning)),
            SamplerKind::EulerAncestral => Sampler::EulerAncestral(EulerAncestralSampler::new(
                discretization,
                conditioning,
                self.euler_ancestral,
            )),
            SamplerKind::Lcm => Sampler::Lcm(LcmSampler::new(discretization, conditioning)),
            SamplerKind::Tcd => Sampler::Tcd(TcdSampler::new(discretization, conditioning, self.tcd)),
            SamplerKind::UniPc => Sampler::UniPc(UniPcSampler::new(discretization, conditioning)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: RunConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, RunConfig::default());
        assert_eq!(config.shape(), [1, 64, 64, 4]);
        config.validate().unwrap();
    }

    #[test]
    fn test_bundled_config_parses() {
        let config: RunConfig =
            serde_json::from_str(include_str!("../configs/flow_unipc.json")).unwrap();
        assert_eq!(config.sampler, SamplerKind::UniPc);
        assert_eq!(config.schedule.discretization, DiscretizationKind::FlowMatching);
        assert!(config.schedule.objective().is_flow());
        assert_eq!(config.sampling.steps, 12);
        assert!((config.sampling.shift - 3.0).abs() < 1e-12);
        let refiner = config.refiner.as_ref().unwrap();
        assert!((refiner.start - 0.8).abs() < 1e-6);
        config.validate().unwrap();
        assert_eq!(config.build_sampler(config.schedule.build()).kind(), SamplerKind::UniPc);
    }

    #[test]
    fn test_rejects_out_of_range_strength() {
        let config = RunConfig {
            strength: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sampler_knobs_are_applied() {
        let config: RunConfig =
            serde_json::from_str(r#"{"sampler": "euler_ancestral", "euler_ancestral": {"eta": 0.0}}"#).unwrap();
        assert_eq!(config.euler_ancestral.eta, 0.0);
        let sampler = config.build_sampler(config.schedule.build());
        assert_eq!(sampler.kind(), SamplerKind::EulerAncestral);
    }
}
