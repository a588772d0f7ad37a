//! End-to-end sampling runs against stub networks.

mod common;

use burn::tensor::Tensor;
use burn_diffusion_samplers::{
    CancellationToken, GuidanceConfig, Inpainting, ModelVersion, Refiner, Sampler, SamplerError, SamplerKind,
    Sampling, StepPosition, TimestepConditioning,
};
use common::{assert_all_close, filled, latent, linear_epsilon, values, Behavior, Scenario, TestBackend};

const ALL_KINDS: [SamplerKind; 8] = [
    SamplerKind::Ddim,
    SamplerKind::Plms,
    SamplerKind::DpmPp2m,
    SamplerKind::DpmPpSde,
    SamplerKind::EulerAncestral,
    SamplerKind::Lcm,
    SamplerKind::Tcd,
    SamplerKind::UniPc,
];

// ============================================================================
// Degenerate ranges and determinism
// ============================================================================

#[test]
fn test_empty_range_returns_input() {
    for kind in ALL_KINDS {
        let mut scenario = Scenario::new(kind, 10, Behavior::Negate);
        scenario.start = StepPosition::at(4);
        scenario.end = StepPosition::at(4);
        let outcome = scenario.run(latent(0.7));
        let output = outcome.result.unwrap();
        assert_all_close(&values(&output.x), 0.7, 0.0);
        assert!(output.networks.is_empty(), "{kind:?} returned networks");
        assert!(outcome.compiled.is_empty(), "{kind:?} compiled a network");
        assert!(outcome.reported.is_empty());
    }
}

#[test]
fn test_deterministic_with_zero_noise() {
    for kind in [SamplerKind::Ddim, SamplerKind::EulerAncestral, SamplerKind::DpmPpSde, SamplerKind::Tcd] {
        let first = Scenario::new(kind, 6, Behavior::Negate).run(latent(0.01));
        let second = Scenario::new(kind, 6, Behavior::Negate).run(latent(0.01));
        let first = values(&first.result.unwrap().x);
        let second = values(&second.result.unwrap().x);
        assert_eq!(first, second, "{kind:?} is not deterministic");
    }
}

#[test]
fn test_every_integrator_reaches_clean_sample() {
    for kind in ALL_KINDS {
        let outcome = Scenario::new(kind, 8, Behavior::Oracle(0.25)).run(latent(1.0));
        let output = outcome.result.unwrap();
        assert_eq!(output.networks.len(), 1);
        assert_eq!(outcome.reported, (0..8).collect::<Vec<_>>(), "{kind:?}");
        let x = values(&output.x);
        assert!(
            x.iter().all(|v| (v - 0.25).abs() < 1e-3),
            "{kind:?} ended at {}",
            x[0]
        );
    }
}

// ============================================================================
// Guidance
// ============================================================================

#[test]
fn test_unit_scale_runs_single_branch() {
    let guided = Scenario::new(SamplerKind::Ddim, 5, Behavior::Negate).run(latent(0.01));
    let guided = guided.result.unwrap();
    assert!(guided.networks[0].batch_sizes.iter().all(|&b| b == 2));

    let mut scenario = Scenario::new(SamplerKind::Ddim, 5, Behavior::Negate);
    scenario.guidance = GuidanceConfig {
        text: 1.0,
        ..Default::default()
    };
    let outcome = scenario.run(latent(0.01));
    assert_eq!(outcome.compiled[0].batch_size, 1);
    let single = outcome.result.unwrap();
    assert!(single.networks[0].batch_sizes.iter().all(|&b| b == 1));
    // identical branches compose to the single-branch output
    assert_eq!(values(&guided.x), values(&single.x));
}

#[test]
fn test_consistency_samplers_disable_cfg() {
    for kind in [SamplerKind::Lcm, SamplerKind::Tcd] {
        let outcome = Scenario::new(kind, 4, Behavior::Zero).run(latent(1.0));
        let output = outcome.result.unwrap();
        assert!(output.networks[0].batch_sizes.iter().all(|&b| b == 1), "{kind:?}");
    }
}

// ============================================================================
// Refiner
// ============================================================================

#[test]
fn test_refiner_takes_over_once() {
    let mut scenario = Scenario::new(SamplerKind::Ddim, 10, Behavior::Zero);
    scenario.conditioning = TimestepConditioning::Timestep;
    scenario.refiner = Some(Refiner::new(0.5, "refiner.ckpt", ModelVersion::V1));
    let outcome = scenario.run(latent(1.0));
    let output = outcome.result.unwrap();
    assert_eq!(output.networks.len(), 2);
    assert_eq!(outcome.compiled.len(), 2);
    assert_eq!(outcome.compiled[1].file_path, "refiner.ckpt");

    let (base, refiner) = (&output.networks[0], &output.networks[1]);
    assert_eq!(base.file_path, "base.ckpt");
    assert!(base.unloaded);
    // timesteps 999, 888, ... cross 500 at step 5
    assert_eq!(base.steps, vec![0, 1, 2, 3, 4]);
    assert_eq!(refiner.steps, vec![5, 6, 7, 8, 9]);
    assert_eq!(refiner.file_path, "refiner.ckpt");
}

#[test]
fn test_multistep_integrators_converge_across_refiner_switch() {
    for kind in [SamplerKind::Plms, SamplerKind::UniPc, SamplerKind::DpmPp2m] {
        let mut scenario = Scenario::new(kind, 10, Behavior::Oracle(-0.2));
        scenario.refiner = Some(Refiner::new(0.5, "refiner.ckpt", ModelVersion::V1));
        let output = scenario.run(latent(1.0)).result.unwrap();
        assert_eq!(output.networks.len(), 2, "{kind:?}");
        assert_all_close(&values(&output.x), -0.2, 1e-3);
    }
}

/// Final latent of a 10-step Negate run, refined from step 5 if `refiner`
fn negate_run(
    kind: SamplerKind,
    refiner: bool,
    x: Tensor<TestBackend, 4>,
    (start, end): (usize, usize),
) -> Tensor<TestBackend, 4> {
    let mut scenario = Scenario::new(kind, 10, Behavior::Negate);
    scenario.start = StepPosition::at(start);
    scenario.end = StepPosition::at(end);
    if refiner {
        scenario.refiner = Some(Refiner::new(0.5, "refiner.ckpt", ModelVersion::V1));
    }
    scenario.run(x).result.unwrap().x
}

#[test]
fn test_multistep_history_restarts_at_refiner_switch() {
    for kind in [SamplerKind::Plms, SamplerKind::UniPc, SamplerKind::DpmPp2m] {
        let refined = values(&negate_run(kind, true, latent(1.0), (0, 10)));
        let plain = values(&negate_run(kind, false, latent(1.0), (0, 10)));
        assert!(
            refined.iter().zip(&plain).any(|(a, b)| (a - b).abs() > 1e-4),
            "{kind:?} carried its history across the switch"
        );

        // the base network up to the switch, then a fresh integrator from step 5
        let handoff = negate_run(kind, false, latent(1.0), (0, 5));
        let restarted = values(&negate_run(kind, false, handoff, (5, 10)));
        for (a, b) in refined.iter().zip(&restarted) {
            assert!((a - b).abs() <= 1e-4 * b.abs().max(1.0), "{kind:?}: {a} vs {b}");
        }
    }
}

// ============================================================================
// Inpainting
// ============================================================================

#[test]
fn test_fully_known_mask_keeps_reference() {
    let reference = latent(0.5);
    let mut scenario = Scenario::new(SamplerKind::Ddim, 10, Behavior::Zero);
    scenario.inpainting = Some(Inpainting::new(reference, latent(1.0)));
    let output = scenario.run(latent(1.0)).result.unwrap();
    assert_all_close(&values(&output.x), 0.5, 1e-4);

    // without the mask the zero-noise prediction just rescales the input
    let output = Scenario::new(SamplerKind::Ddim, 10, Behavior::Zero)
        .run(latent(1.0))
        .result
        .unwrap();
    assert!(values(&output.x).iter().all(|v| *v > 10.0));
}

#[test]
fn test_unknown_region_is_generated() {
    let mut scenario = Scenario::new(SamplerKind::EulerAncestral, 8, Behavior::Oracle(-0.4));
    let mask = filled([1, 8, 8, 4], 0.0);
    scenario.inpainting = Some(Inpainting::new(latent(0.9), mask));
    let output = scenario.run(latent(1.0)).result.unwrap();
    assert_all_close(&values(&output.x), -0.4, 1e-3);
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn test_nan_network_fails_run() {
    for kind in ALL_KINDS {
        let result = Scenario::new(kind, 6, Behavior::Nan).run(latent(1.0)).result;
        assert!(matches!(result, Err(SamplerError::NaN)), "{kind:?}: {result:?}");
    }
}

#[test]
fn test_feedback_cancels_run() {
    let mut scenario = Scenario::new(SamplerKind::UniPc, 10, Behavior::Zero);
    scenario.stop_after = Some(3);
    let outcome = scenario.run(latent(1.0));
    assert_eq!(outcome.reported, vec![0, 1, 2, 3]);
    match outcome.result {
        Err(SamplerError::Cancelled { networks }) => {
            assert_eq!(networks.len(), 1);
            assert_eq!(networks[0].calls, 3);
        }
        other => panic!("expected cancellation, got {other:?}"),
    }
}

#[test]
fn test_token_cancels_before_first_step() {
    let token = CancellationToken::new();
    token.cancel();
    let mut scenario = Scenario::new(SamplerKind::Ddim, 10, Behavior::Zero);
    scenario.token = Some(token);
    let outcome = scenario.run(latent(1.0));
    assert!(outcome.reported.is_empty());
    let err = outcome.result.unwrap_err();
    assert!(err.is_cancelled());
    let networks = err.into_networks();
    assert_eq!(networks.len(), 1);
    assert_eq!(networks[0].calls, 0);
}

// ============================================================================
// img2img
// ============================================================================

#[test]
fn test_strength_picks_start_step() {
    let sampling = Sampling { steps: 20, shift: 1.0 };
    let ddim = Sampler::new(SamplerKind::Ddim, linear_epsilon(), TimestepConditioning::Timestep);
    let mapping = ddim.timestep_for_strength(0.75, sampling);
    assert_eq!(mapping.rounded_down_start_step, 5);
    assert_eq!(mapping.rounded_up_start_step, 5);

    let euler = Sampler::new(SamplerKind::EulerAncestral, linear_epsilon(), TimestepConditioning::Timestep);
    let full = euler.timestep_for_strength(1.0, sampling);
    assert_eq!(full.rounded_down_start_step, 0);
    let partial = euler.timestep_for_strength(0.5, sampling);
    assert!(partial.start_step > 0.0 && partial.start_step < 20.0);
    assert!(partial.rounded_down_start_step as f32 <= partial.start_step);
    assert!(partial.rounded_up_start_step as f32 >= partial.start_step);
}

#[test]
fn test_img2img_from_scaled_reference() {
    // reference noised the way the caller prepares img2img input
    let sampling = Sampling { steps: 10, shift: 1.0 };
    let sampler = Sampler::new(SamplerKind::Ddim, linear_epsilon(), TimestepConditioning::Noise);
    let sample_scale = sampler.sample_scale_factor(4.0, sampling);
    let noise_scale = sampler.noise_scale_factor(4.0, sampling);
    let x = latent(0.6 * sample_scale + 0.5 * noise_scale);

    let mut scenario = Scenario::new(SamplerKind::Ddim, 10, Behavior::Oracle(0.6));
    scenario.start = StepPosition::at(4);
    let outcome = scenario.run(x);
    assert_eq!(outcome.reported, (0..6).collect::<Vec<_>>());
    let output = outcome.result.unwrap();
    assert_eq!(output.networks[0].calls, 6);
    assert_all_close(&values(&output.x), 0.6, 1e-3);
}
