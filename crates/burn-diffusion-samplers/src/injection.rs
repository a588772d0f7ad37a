//! Control and adapter injection
//!
//! Control models (ControlNet, T2I-Adapter) contribute residual hints added
//! inside the denoiser; adapters (IP-Adapter, inject-KV, Redux) contribute
//! extra attention tokens. Each injected control is active on a half-open
//! step window and scaled according to its [`ControlMode`].
//!
//! LoRA configurations live here as well: they are resolved per network at
//! compile time, so a refiner switch re-filters them.

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::NetworkError;
use crate::lifecycle::Refiner;
use crate::model::{ModelVersion, SamplerModifier};

/// Decay applied per level below the top in non-balanced modes
const LEVEL_DECAY: f32 = 0.825;

/// Kind of injected control model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlType {
    #[serde(rename = "controlnet")]
    ControlNet,
    #[serde(rename = "t2iadapter")]
    T2iAdapter,
    #[serde(rename = "ipadapterplus")]
    IpAdapterPlus,
    #[serde(rename = "ipadapterfull")]
    IpAdapterFull,
    #[serde(rename = "controlnetlora")]
    ControlNetLora,
    InjectKv,
    #[serde(rename = "ipadapterfaceidplus")]
    IpAdapterFaceIdPlus,
    #[serde(rename = "controlnetunion")]
    ControlNetUnion,
    Pulid,
    Redux,
    Llava,
}

impl ControlType {
    /// True for models that contribute attention tokens instead of residuals
    pub fn is_adapter(&self) -> bool {
        matches!(
            self,
            ControlType::IpAdapterPlus
                | ControlType::IpAdapterFull
                | ControlType::IpAdapterFaceIdPlus
                | ControlType::InjectKv
                | ControlType::Pulid
                | ControlType::Redux
                | ControlType::Llava
        )
    }
}

/// How hint strength is distributed across levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    /// Uniform `strength` at every level
    #[default]
    Balanced,
    /// Level `i` scaled by `0.825^(12 - i) * strength`
    Prompt,
    /// As `Prompt`, and the unconditional half receives no hints
    Control,
}

/// Per-step inputs handed to a control model
#[derive(Debug)]
pub struct ControlInputs<'a, B: Backend> {
    /// Network input batch (all CFG branches)
    pub latent: &'a Tensor<B, 4>,
    pub timestep: f32,
    pub time_embedding: Option<&'a Tensor<B, 2>>,
    pub is_cfg_enabled: bool,
    /// Absolute step index
    pub step: usize,
}

/// An external control model collaborator
pub trait ControlModel<B: Backend> {
    fn control_type(&self) -> ControlType;

    /// Residual hints, one per level
    fn hints(&mut self, _inputs: &ControlInputs<'_, B>) -> Result<Vec<Tensor<B, 4>>, NetworkError> {
        Ok(Vec::new())
    }

    /// Shapes of the hints for a network batch, used when the control is
    /// outside its step window
    fn hint_shapes(&self, _latent: [usize; 4]) -> Vec<[usize; 4]> {
        Vec::new()
    }

    /// Adapter tokens
    fn tokens(&mut self, _inputs: &ControlInputs<'_, B>) -> Result<Vec<Tensor<B, 3>>, NetworkError> {
        Ok(Vec::new())
    }
}

/// A control model with its activation window and strength policy
pub struct InjectedControl<B: Backend> {
    pub model: Box<dyn ControlModel<B>>,
    /// First active step (inclusive)
    pub start_step: usize,
    /// Last active step (exclusive)
    pub end_step: usize,
    pub strength: f32,
    pub mode: ControlMode,
    pub global_average_pooling: bool,
}

impl<B: Backend> std::fmt::Debug for InjectedControl<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InjectedControl")
            .field("type", &self.model.control_type())
            .field("start_step", &self.start_step)
            .field("end_step", &self.end_step)
            .field("strength", &self.strength)
            .field("mode", &self.mode)
            .finish()
    }
}

impl<B: Backend> InjectedControl<B> {
    pub fn new(model: Box<dyn ControlModel<B>>, strength: f32) -> Self {
        Self {
            model,
            start_step: 0,
            end_step: usize::MAX,
            strength,
            mode: ControlMode::Balanced,
            global_average_pooling: false,
        }
    }

    pub fn with_window(mut self, start_step: usize, end_step: usize) -> Self {
        self.start_step = start_step;
        self.end_step = end_step;
        self
    }

    pub fn with_mode(mut self, mode: ControlMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_global_average_pooling(mut self, enabled: bool) -> Self {
        self.global_average_pooling = enabled;
        self
    }

    pub fn is_active(&self, step: usize) -> bool {
        self.start_step <= step && step < self.end_step
    }

    /// Scaled residual hints for this step; zeros outside the window
    pub fn residuals(&mut self, inputs: &ControlInputs<'_, B>) -> Result<Vec<Tensor<B, 4>>, NetworkError> {
        if !self.is_active(inputs.step) {
            let device = inputs.latent.device();
            return Ok(self
                .model
                .hint_shapes(inputs.latent.dims())
                .into_iter()
                .map(|shape| Tensor::zeros(shape, &device))
                .collect());
        }
        let hints = self.model.hints(inputs)?;
        Ok(hints
            .into_iter()
            .enumerate()
            .map(|(level, hint)| self.shape_hint(level, hint, inputs.is_cfg_enabled))
            .collect())
    }

    /// Adapter tokens for this step; none outside the window
    pub fn tokens(&mut self, inputs: &ControlInputs<'_, B>) -> Result<Vec<Tensor<B, 3>>, NetworkError> {
        if !self.is_active(inputs.step) {
            return Ok(Vec::new());
        }
        let tokens = self.model.tokens(inputs)?;
        if self.strength == 1.0 {
            return Ok(tokens);
        }
        Ok(tokens.into_iter().map(|t| t.mul_scalar(self.strength)).collect())
    }

    fn shape_hint(&self, level: usize, hint: Tensor<B, 4>, is_cfg_enabled: bool) -> Tensor<B, 4> {
        let dims = hint.dims();
        let mut hint = hint;
        if self.mode == ControlMode::Control && is_cfg_enabled {
            let half = dims[0] / 2;
            let zeros = Tensor::zeros([half, dims[1], dims[2], dims[3]], &hint.device());
            let cond = hint.slice([half..dims[0], 0..dims[1], 0..dims[2], 0..dims[3]]);
            hint = Tensor::cat(vec![zeros, cond], 0);
        }
        if self.global_average_pooling {
            hint = global_average_pooling(hint);
        }
        match self.mode {
            ControlMode::Balanced if self.strength == 1.0 => hint,
            ControlMode::Balanced => hint.mul_scalar(self.strength),
            ControlMode::Prompt | ControlMode::Control => {
                hint.mul_scalar(level_scale(level) * self.strength)
            }
        }
    }
}

/// `0.825^(12 - level)`
pub fn level_scale(level: usize) -> f32 {
    LEVEL_DECAY.powi(12 - level as i32)
}

/// Mean over H and W, broadcast back to the input shape
pub fn global_average_pooling<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let dims = x.dims();
    x.mean_dim(1).mean_dim(2).expand(dims)
}

/// Everything injected into one network evaluation
#[derive(Debug, Clone)]
pub struct InjectedControls<B: Backend> {
    /// Residual hints summed level-wise across controls
    pub residuals: Vec<Tensor<B, 4>>,
    /// Adapter tokens of all active adapters, in control order
    pub tokens: Vec<Tensor<B, 3>>,
}

impl<B: Backend> Default for InjectedControls<B> {
    fn default() -> Self {
        Self {
            residuals: Vec::new(),
            tokens: Vec::new(),
        }
    }
}

impl<B: Backend> InjectedControls<B> {
    pub fn is_empty(&self) -> bool {
        self.residuals.is_empty() && self.tokens.is_empty()
    }
}

/// Evaluate every control for this step
///
/// A failing control model fails the whole step.
pub fn inject_all<B: Backend>(
    controls: &mut [InjectedControl<B>],
    inputs: &ControlInputs<'_, B>,
) -> Result<InjectedControls<B>, NetworkError> {
    let mut injected = InjectedControls::default();
    for control in controls.iter_mut() {
        if control.model.control_type().is_adapter() {
            injected.tokens.extend(control.tokens(inputs)?);
            continue;
        }
        let residuals = control.residuals(inputs)?;
        if injected.residuals.is_empty() {
            injected.residuals = residuals;
            continue;
        }
        for (level, residual) in residuals.into_iter().enumerate() {
            match injected.residuals.get_mut(level) {
                Some(sum) => *sum = sum.clone() + residual,
                None => injected.residuals.push(residual),
            }
        }
    }
    Ok(injected)
}

// ============================================================================
// LoRA
// ============================================================================

/// Which network(s) a LoRA applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoraMode {
    #[default]
    All,
    Base,
    Refiner,
}

/// A LoRA to merge into a network at compile time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfiguration {
    pub file: String,
    pub weight: f32,
    pub version: ModelVersion,
    #[serde(default)]
    pub is_loha: bool,
    #[serde(default)]
    pub modifier: SamplerModifier,
    #[serde(default)]
    pub mode: LoraMode,
}

/// LoRAs applied to the base network
pub fn loras_for_base(loras: &[LoraConfiguration]) -> Vec<LoraConfiguration> {
    loras
        .iter()
        .filter(|lora| matches!(lora.mode, LoraMode::All | LoraMode::Base))
        .cloned()
        .collect()
}

/// LoRAs applied to the refiner network
///
/// A refiner with a builtin LoRA loads its own file as the first LoRA; a
/// LoRA pointing at the base file is never applied to the refiner.
pub fn loras_for_refiner(
    loras: &[LoraConfiguration],
    refiner: &Refiner,
    base_file: &str,
) -> Vec<LoraConfiguration> {
    let mut filtered: Vec<LoraConfiguration> = loras
        .iter()
        .filter(|lora| matches!(lora.mode, LoraMode::All | LoraMode::Refiner))
        .filter(|lora| lora.file != base_file)
        .cloned()
        .collect();
    if refiner.builtin_lora {
        filtered.insert(
            0,
            LoraConfiguration {
                file: refiner.file_path.clone(),
                weight: 1.0,
                version: refiner.version,
                is_loha: false,
                modifier: SamplerModifier::None,
                mode: LoraMode::Refiner,
            },
        );
    }
    filtered
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    struct ConstantHints {
        value: f32,
        levels: usize,
    }

    impl ControlModel<TestBackend> for ConstantHints {
        fn control_type(&self) -> ControlType {
            ControlType::ControlNet
        }

        fn hints(
            &mut self,
            inputs: &ControlInputs<'_, TestBackend>,
        ) -> Result<Vec<Tensor<TestBackend, 4>>, NetworkError> {
            let device = inputs.latent.device();
            Ok((0..self.levels)
                .map(|_| Tensor::ones(inputs.latent.dims(), &device).mul_scalar(self.value))
                .collect())
        }

        fn hint_shapes(&self, latent: [usize; 4]) -> Vec<[usize; 4]> {
            vec![latent; self.levels]
        }
    }

    struct Failing;

    impl ControlModel<TestBackend> for Failing {
        fn control_type(&self) -> ControlType {
            ControlType::T2iAdapter
        }

        fn hints(
            &mut self,
            _inputs: &ControlInputs<'_, TestBackend>,
        ) -> Result<Vec<Tensor<TestBackend, 4>>, NetworkError> {
            Err(NetworkError::Control("hint encoder unavailable".into()))
        }
    }

    fn values(t: &Tensor<TestBackend, 4>) -> Vec<f32> {
        t.clone().into_data().convert::<f32>().to_vec::<f32>().unwrap()
    }

    fn inputs(latent: &Tensor<TestBackend, 4>, step: usize, cfg: bool) -> ControlInputs<'_, TestBackend> {
        ControlInputs {
            latent,
            timestep: 500.0,
            time_embedding: None,
            is_cfg_enabled: cfg,
            step,
        }
    }

    #[test]
    fn test_window_gives_zero_hints() {
        let latent = Tensor::<TestBackend, 4>::zeros([2, 2, 2, 4], &Default::default());
        let mut controls = vec![InjectedControl::new(
            Box::new(ConstantHints { value: 1.0, levels: 2 }),
            0.5,
        )
        .with_window(2, 4)];
        let before = inject_all(&mut controls, &inputs(&latent, 1, false)).unwrap();
        assert_eq!(before.residuals.len(), 2);
        assert!(values(&before.residuals[0]).iter().all(|&v| v == 0.0));
        let inside = inject_all(&mut controls, &inputs(&latent, 3, false)).unwrap();
        assert!(values(&inside.residuals[1]).iter().all(|&v| (v - 0.5).abs() < 1e-6));
        let after = inject_all(&mut controls, &inputs(&latent, 4, false)).unwrap();
        assert!(values(&after.residuals[0]).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_control_mode_scaling() {
        let latent = Tensor::<TestBackend, 4>::zeros([2, 1, 1, 1], &Default::default());
        let mut controls = vec![InjectedControl::new(
            Box::new(ConstantHints { value: 1.0, levels: 13 }),
            1.0,
        )
        .with_mode(ControlMode::Control)];
        let injected = inject_all(&mut controls, &inputs(&latent, 0, true)).unwrap();
        let top = values(&injected.residuals[12]);
        // unconditional row zeroed, conditional row at full strength
        assert_eq!(top[0], 0.0);
        assert!((top[1] - 1.0).abs() < 1e-6);
        let bottom = values(&injected.residuals[0]);
        assert!((bottom[1] - 0.825f32.powi(12)).abs() < 1e-6);
    }

    #[test]
    fn test_residuals_sum_levelwise() {
        let latent = Tensor::<TestBackend, 4>::zeros([1, 1, 1, 1], &Default::default());
        let mut controls = vec![
            InjectedControl::new(Box::new(ConstantHints { value: 1.0, levels: 2 }), 1.0),
            InjectedControl::new(Box::new(ConstantHints { value: 2.0, levels: 2 }), 1.0),
        ];
        let injected = inject_all(&mut controls, &inputs(&latent, 0, false)).unwrap();
        assert_eq!(values(&injected.residuals[1]), vec![3.0]);
        assert!(injected.tokens.is_empty());
    }

    #[test]
    fn test_control_failure_propagates() {
        let latent = Tensor::<TestBackend, 4>::zeros([1, 1, 1, 1], &Default::default());
        let mut controls = vec![InjectedControl::new(Box::new(Failing), 1.0)];
        let err = inject_all(&mut controls, &inputs(&latent, 0, false)).unwrap_err();
        assert!(matches!(err, NetworkError::Control(_)));
    }

    #[test]
    fn test_global_average_pooling() {
        let data = TensorData::new(vec![1.0f32, 2.0, 3.0, 6.0], [1, 2, 2, 1]);
        let x = Tensor::<TestBackend, 4>::from_data(data, &Default::default());
        assert_eq!(values(&global_average_pooling(x)), vec![3.0; 4]);
    }

    fn lora(file: &str, mode: LoraMode) -> LoraConfiguration {
        LoraConfiguration {
            file: file.into(),
            weight: 0.8,
            version: ModelVersion::SdxlBase,
            is_loha: false,
            modifier: SamplerModifier::None,
            mode,
        }
    }

    #[test]
    fn test_lora_filtering() {
        let loras = vec![
            lora("style.ckpt", LoraMode::All),
            lora("base-only.ckpt", LoraMode::Base),
            lora("refiner-only.ckpt", LoraMode::Refiner),
            lora("sdxl_base.ckpt", LoraMode::All),
        ];
        let base: Vec<String> = loras_for_base(&loras).into_iter().map(|l| l.file).collect();
        assert_eq!(base, vec!["style.ckpt", "base-only.ckpt", "sdxl_base.ckpt"]);

        let mut refiner = Refiner::new(0.2, "sdxl_refiner.ckpt", ModelVersion::SdxlRefiner);
        let refined: Vec<String> = loras_for_refiner(&loras, &refiner, "sdxl_base.ckpt")
            .into_iter()
            .map(|l| l.file)
            .collect();
        assert_eq!(refined, vec!["style.ckpt", "refiner-only.ckpt"]);

        refiner.builtin_lora = true;
        let refined = loras_for_refiner(&loras, &refiner, "sdxl_base.ckpt");
        assert_eq!(refined[0].file, "sdxl_refiner.ckpt");
        assert_eq!(refined.len(), 3);
    }
}
