//! Mask-guided inpainting
//!
//! After every step but the last, the reference sample is re-noised to the
//! next noise level and pasted into the known region of the latent.

use burn::prelude::*;

use crate::objective::Objective;

/// Latent convention of the integrator doing the blending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatentSpace {
    /// `x = x0 + sigma * eps`
    Sigma,
    /// `x = sqrt(a) * x0 + sqrt(1 - a) * eps`
    Ddpm,
}

/// Reference sample and masks for one run
///
/// `mask` is 1 where the reference is known and kept, `neg_mask` is 1 where
/// the integrator generates content. Both match the latent's shape.
#[derive(Debug, Clone)]
pub struct Inpainting<B: Backend> {
    pub sample: Tensor<B, 4>,
    pub mask: Tensor<B, 4>,
    pub neg_mask: Tensor<B, 4>,
}

impl<B: Backend> Inpainting<B> {
    /// Builds the generated-region mask as `1 - mask`
    pub fn new(sample: Tensor<B, 4>, mask: Tensor<B, 4>) -> Self {
        let neg_mask = mask.clone().neg().add_scalar(1.0);
        Self {
            sample,
            mask,
            neg_mask,
        }
    }

    /// Coefficients `(sample, noise)` of the re-noised reference at `alpha_cumprod`
    pub fn scales(objective: Objective, space: LatentSpace, alpha_cumprod: f64) -> (f64, f64) {
        let sigma = objective.sigma_from(alpha_cumprod);
        match (space, objective.is_flow()) {
            (LatentSpace::Sigma, true) => (1.0 - sigma, sigma),
            (LatentSpace::Sigma, false) => (1.0, sigma),
            (LatentSpace::Ddpm, true) => (alpha_cumprod, 1.0 - alpha_cumprod),
            (LatentSpace::Ddpm, false) => (alpha_cumprod.sqrt(), (1.0 - alpha_cumprod).sqrt()),
        }
    }

    /// Paste the reference, noised to `alpha_cumprod` with `noise`, into `x`
    pub fn blend(
        &self,
        x: Tensor<B, 4>,
        noise: Tensor<B, 4>,
        objective: Objective,
        space: LatentSpace,
        alpha_cumprod: f64,
    ) -> Tensor<B, 4> {
        let (sample_scale, noise_scale) = Self::scales(objective, space, alpha_cumprod);
        let q = self.sample.clone().mul_scalar(sample_scale as f32)
            + noise.mul_scalar(noise_scale as f32);
        q * self.mask.clone() + x * self.neg_mask.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn filled(value: f32) -> Tensor<TestBackend, 4> {
        Tensor::ones([1, 2, 2, 1], &Default::default()).mul_scalar(value)
    }

    fn values(t: Tensor<TestBackend, 4>) -> Vec<f32> {
        t.into_data().convert::<f32>().to_vec::<f32>().unwrap()
    }

    #[test]
    fn test_known_region_takes_renoised_reference() {
        let mask = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![1.0f32, 1.0, 0.0, 0.0], [1, 2, 2, 1]),
            &Default::default(),
        );
        let inpainting = Inpainting::new(filled(2.0), mask);
        let out = inpainting.blend(
            filled(-5.0),
            filled(1.0),
            Objective::Epsilon,
            LatentSpace::Sigma,
            0.2, // sigma = 2
        );
        assert_eq!(values(out), vec![4.0, 4.0, -5.0, -5.0]);
    }

    #[test]
    fn test_ddpm_and_flow_scales() {
        let (s, n) = Inpainting::<TestBackend>::scales(Objective::V, LatentSpace::Ddpm, 0.64);
        assert!((s - 0.8).abs() < 1e-12 && (n - 0.6).abs() < 1e-12);
        let flow = Objective::U { condition_scale: 1000.0 };
        let (s, n) = Inpainting::<TestBackend>::scales(flow, LatentSpace::Sigma, 0.75);
        assert_eq!((s, n), (0.75, 0.25));
        let (s, n) = Inpainting::<TestBackend>::scales(flow, LatentSpace::Ddpm, 0.75);
        assert_eq!((s, n), (0.75, 0.25));
    }
}
