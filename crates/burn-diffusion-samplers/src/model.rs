//! Model-version policy tables
//!
//! Pure functions describing how a model family is driven: whether its
//! CFG branches may be reduced over the whole batch, which extra input
//! channels a sampler modifier adds, and the default conditioning scheme.

use serde::{Deserialize, Serialize};

use crate::objective::TimestepConditioning;

/// Denoiser model family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelVersion {
    #[serde(rename = "v1")]
    V1,
    #[serde(rename = "v2")]
    V2,
    #[serde(rename = "kandinsky2.1")]
    Kandinsky21,
    #[serde(rename = "sdxl_base_v0.9")]
    SdxlBase,
    #[serde(rename = "sdxl_refiner_v0.9")]
    SdxlRefiner,
    #[serde(rename = "ssd_1b")]
    Ssd1b,
    #[serde(rename = "svd_i2v")]
    SvdI2v,
    #[serde(rename = "wurstchen_v3.0_stage_c")]
    WurstchenStageC,
    #[serde(rename = "wurstchen_v3.0_stage_b")]
    WurstchenStageB,
    #[serde(rename = "sd3")]
    Sd3,
    #[serde(rename = "pixart")]
    Pixart,
    #[serde(rename = "auraflow")]
    Auraflow,
    #[serde(rename = "flux1")]
    Flux1,
    #[serde(rename = "sd3_large")]
    Sd3Large,
    #[serde(rename = "hunyuan_video")]
    HunyuanVideo,
    #[serde(rename = "wan_v2.1_1.3b")]
    Wan21_1_3b,
    #[serde(rename = "wan_v2.1_14b")]
    Wan21_14b,
    #[serde(rename = "hidream_i1")]
    HiDreamI1,
    #[serde(rename = "qwen_image")]
    QwenImage,
}

impl ModelVersion {
    /// Whether CFG-Zero* may reduce over the whole batch
    ///
    /// Video models treat the batch as frames, so the rescale is per frame.
    pub fn is_batch_enabled(&self) -> bool {
        !matches!(
            self,
            ModelVersion::HunyuanVideo
                | ModelVersion::SvdI2v
                | ModelVersion::Wan21_14b
                | ModelVersion::Wan21_1_3b
        )
    }

    /// True for rectified-flow model families
    pub fn is_flow_matching(&self) -> bool {
        matches!(
            self,
            ModelVersion::Sd3
                | ModelVersion::Sd3Large
                | ModelVersion::Auraflow
                | ModelVersion::Flux1
                | ModelVersion::HunyuanVideo
                | ModelVersion::Wan21_1_3b
                | ModelVersion::Wan21_14b
                | ModelVersion::HiDreamI1
                | ModelVersion::QwenImage
        )
    }

    /// Conditioning scheme used by default for this family
    pub fn default_conditioning(&self) -> TimestepConditioning {
        match self {
            ModelVersion::SvdI2v | ModelVersion::WurstchenStageC | ModelVersion::WurstchenStageB => {
                TimestepConditioning::Noise
            }
            _ => TimestepConditioning::Timestep,
        }
    }
}

/// Input layout variant of a denoiser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerModifier {
    #[default]
    None,
    /// Mask (1 channel) plus masked image latent appended to the input
    Inpainting,
    /// Depth map (1 channel) appended to the input
    Depth,
    /// Instruct-pix2pix: image latent appended, up to three CFG branches
    Editing,
    /// Condition image latent appended (same channel count as the latent)
    Double,
    /// Canny edge map appended to the input
    Canny,
    /// Reference images supplied through conditioning only
    Kontext,
}

impl SamplerModifier {
    /// Number of condition channels this modifier appends for a latent of
    /// `channels` channels, given the condition image's channel count
    pub fn condition_channels(&self, channels: usize, condition_channels: Option<usize>) -> usize {
        match self {
            SamplerModifier::Inpainting | SamplerModifier::Depth | SamplerModifier::Canny => {
                condition_channels.unwrap_or(0)
            }
            SamplerModifier::Editing | SamplerModifier::Double => channels,
            SamplerModifier::None | SamplerModifier::Kontext => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_policy() {
        assert!(ModelVersion::SdxlBase.is_batch_enabled());
        assert!(ModelVersion::Flux1.is_batch_enabled());
        assert!(!ModelVersion::SvdI2v.is_batch_enabled());
        assert!(!ModelVersion::Wan21_14b.is_batch_enabled());
    }

    #[test]
    fn test_version_serde_names() {
        let json = serde_json::to_string(&ModelVersion::SdxlRefiner).unwrap();
        assert_eq!(json, "\"sdxl_refiner_v0.9\"");
        let parsed: ModelVersion = serde_json::from_str("\"wan_v2.1_1.3b\"").unwrap();
        assert_eq!(parsed, ModelVersion::Wan21_1_3b);
        let modifier: SamplerModifier = serde_json::from_str("\"inpainting\"").unwrap();
        assert_eq!(modifier, SamplerModifier::Inpainting);
    }

    #[test]
    fn test_condition_channels() {
        assert_eq!(SamplerModifier::Inpainting.condition_channels(4, Some(5)), 5);
        assert_eq!(SamplerModifier::Editing.condition_channels(4, None), 4);
        assert_eq!(SamplerModifier::Kontext.condition_channels(16, Some(16)), 0);
    }
}
