//! burn-diffusion CLI
//!
//! Inspect noise schedules and img2img strength mapping, and run any of the
//! integrators end to end against an analytic Gaussian-data denoiser.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use burn::prelude::*;
use burn::tensor::ElementConversion;
use burn_diffusion_samplers::{
    GaussianNoise, NetworkConfiguration, NetworkError, PassthroughEncoder, SampleRequest, Sampler, SamplerKind,
    Sampling, StepPosition,
};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use config::{DiscretizationKind, ObjectiveKind, RunConfig, ScheduleConfig};
use denoiser::GaussianDenoiser;

mod config;
mod denoiser;

#[derive(Parser)]
#[command(name = "burn-diffusion")]
#[command(about = "Diffusion sampling engine in pure Rust")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the per-step noise schedule
    Schedule {
        #[arg(long, value_enum, default_value = "linear")]
        discretization: DiscretizationKind,

        #[arg(long, value_enum, default_value = "epsilon")]
        objective: ObjectiveKind,

        /// Number of integrator steps
        #[arg(long, default_value = "20")]
        steps: usize,

        /// Schedule warp factor
        #[arg(long, default_value = "1.0")]
        shift: f64,
    },

    /// Show where img2img at a given strength starts
    Strength {
        /// Transformation strength (0.0 = no change, 1.0 = full regeneration)
        #[arg(long, default_value = "0.75")]
        strength: f32,

        #[arg(long, value_enum, default_value = "ddim")]
        sampler: SamplerChoice,

        #[arg(long, value_enum, default_value = "linear")]
        discretization: DiscretizationKind,

        #[arg(long, default_value = "20")]
        steps: usize,

        #[arg(long, default_value = "1.0")]
        shift: f64,
    },

    /// Run a sampler against the analytic denoiser
    Sample {
        /// JSON run configuration (defaults apply when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the configured sampler
        #[arg(long, value_enum)]
        sampler: Option<SamplerChoice>,

        /// Override the configured step count
        #[arg(long)]
        steps: Option<usize>,

        /// Override the configured img2img strength
        #[arg(long)]
        strength: Option<f32>,

        /// Write a JSON summary of the run here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show information about backends and samplers
    Info,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SamplerChoice {
    /// DDIM - Deterministic, fast
    Ddim,
    /// PLMS - Pseudo linear multi-step
    Plms,
    /// DPM++ 2M - Second-order multistep
    DpmPp2m,
    /// DPM++ SDE - Stochastic, two evaluations per step
    DpmPpSde,
    /// Euler Ancestral - Euler with noise injection
    EulerA,
    /// LCM - Fast (4-8 steps), consistency models only
    Lcm,
    /// TCD - Trajectory consistency distillation
    Tcd,
    /// UniPC - Predictor-corrector
    UniPc,
}

impl SamplerChoice {
    fn kind(self) -> SamplerKind {
        match self {
            SamplerChoice::Ddim => SamplerKind::Ddim,
            SamplerChoice::Plms => SamplerKind::Plms,
            SamplerChoice::DpmPp2m => SamplerKind::DpmPp2m,
            SamplerChoice::DpmPpSde => SamplerKind::DpmPpSde,
            SamplerChoice::EulerA => SamplerKind::EulerAncestral,
            SamplerChoice::Lcm => SamplerKind::Lcm,
            SamplerChoice::Tcd => SamplerKind::Tcd,
            SamplerChoice::UniPc => SamplerKind::UniPc,
        }
    }
}

/// Outcome of one `sample` run
#[derive(Debug, Serialize)]
struct RunSummary {
    sampler: SamplerKind,
    steps: usize,
    start_step: f32,
    networks: Vec<String>,
    network_calls: usize,
    elapsed_ms: u128,
    mean: f32,
    std: f32,
    min: f32,
    max: f32,
    data_mean: f32,
    data_std: f32,
}

fn print_schedule(schedule: ScheduleConfig, sampling: Sampling) {
    let discretization = schedule.build();
    let alphas_cumprod = discretization.alphas_cumprod(sampling.steps, sampling.shift);
    println!(
        "{:?} schedule, {:?} objective, {} steps, shift {}",
        schedule.discretization,
        discretization.objective(),
        sampling.steps,
        sampling.shift
    );
    println!("{:>5} {:>14} {:>14} {:>10} {:>10}", "step", "alpha_cumprod", "sigma", "timestep", "noise");
    for (i, &alpha_cumprod) in alphas_cumprod.iter().enumerate() {
        println!(
            "{:>5} {:>14.8} {:>14.6} {:>10.3} {:>10.5}",
            i,
            alpha_cumprod,
            discretization.sigma_from(alpha_cumprod),
            discretization.timestep_for(alpha_cumprod),
            discretization.noise_for(alpha_cumprod)
        );
    }
}

fn print_strength(sampler: &Sampler, strength: f32, sampling: Sampling) {
    let mapping = sampler.timestep_for_strength(strength, sampling);
    println!("{:?} at strength {} over {} steps", sampler.kind(), strength, sampling.steps);
    println!("  timestep:      {:.3}", mapping.timestep);
    println!(
        "  start step:    {:.3} (rounded {}..{})",
        mapping.start_step, mapping.rounded_down_start_step, mapping.rounded_up_start_step
    );
    println!(
        "  sample scale:  {:.6}",
        sampler.sample_scale_factor(mapping.start_step, sampling)
    );
    println!(
        "  noise scale:   {:.6}",
        sampler.noise_scale_factor(mapping.start_step, sampling)
    );
}

/// Run a sampling job using the default backend
fn run_sample(config: RunConfig, output: Option<PathBuf>) -> Result<()> {
    // Use wgpu backend when enabled, fall back to ndarray
    #[cfg(feature = "wgpu")]
    {
        use burn_wgpu::{Wgpu, WgpuDevice};
        type Backend = Wgpu<f32>;
        let device = WgpuDevice::default();
        run_sample_with_backend::<Backend>(&config, output.as_deref(), &device)
    }

    #[cfg(all(feature = "ndarray", not(feature = "wgpu")))]
    {
        use burn_ndarray::NdArray;
        type Backend = NdArray<f32>;
        let device = Default::default();
        run_sample_with_backend::<Backend>(&config, output.as_deref(), &device)
    }

    #[cfg(not(any(feature = "wgpu", feature = "ndarray")))]
    {
        let _ = (config, output);
        anyhow::bail!("No backend enabled. Enable 'wgpu' or 'ndarray' feature.")
    }
}

/// Noised starting latent and its step position
///
/// img2img starts from a constant reference at the data mean, scaled and
/// noised the way the sampler expects at the start step.
fn initial_latent<B: Backend>(
    sampler: &Sampler,
    config: &RunConfig,
    device: &B::Device,
) -> (StepPosition, Tensor<B, 4>) {
    let noise = Tensor::random(config.shape(), burn::tensor::Distribution::Normal(0.0, 1.0), device);
    if config.strength >= 1.0 {
        return (StepPosition::at(0), noise);
    }
    let mapping = sampler.timestep_for_strength(config.strength, config.sampling);
    let sample_scale = sampler.sample_scale_factor(mapping.start_step, config.sampling);
    let noise_scale = sampler.noise_scale_factor(mapping.start_step, config.sampling);
    let reference = Tensor::<B, 4>::ones(config.shape(), device).mul_scalar(config.data.mean);
    let x = reference.mul_scalar(sample_scale) + noise.mul_scalar(noise_scale);
    (StepPosition::new(mapping.start_step), x)
}

fn run_sample_with_backend<B: Backend>(config: &RunConfig, output: Option<&Path>, device: &B::Device) -> Result<()> {
    let discretization = config.schedule.build();
    let sampler = config.build_sampler(discretization.clone());
    let sampling = config.sampling;
    let (start, x) = initial_latent::<B>(&sampler, config, device);
    tracing::info!(
        sampler = ?sampler.kind(),
        steps = sampling.steps,
        start = start.fractional,
        shape = ?config.shape(),
        "sampling"
    );

    let pb = ProgressBar::new(sampling.steps.saturating_sub(start.integral) as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let conditioning = config.conditioning;
    let data = config.data;
    let mut factory = |configuration: &NetworkConfiguration| -> Result<GaussianDenoiser<B>, NetworkError> {
        tracing::info!(file = %configuration.file_path, batch = configuration.batch_size, "compiling denoiser");
        Ok(GaussianDenoiser::new(
            configuration,
            discretization.clone(),
            conditioning,
            data,
        ))
    };
    let mut encoder = PassthroughEncoder;
    let mut noise = GaussianNoise;
    let mut feedback = |step: usize, preview: Option<Tensor<B, 4>>| {
        pb.set_position(step as u64);
        if let Some(preview) = preview {
            let mean: f32 = preview.mean().into_scalar().elem();
            pb.set_message(format!("denoised mean {mean:.4}"));
        }
        true
    };
    let encoding = Tensor::<B, 3>::zeros([2, 77, 768], device);

    let started = Instant::now();
    let mut request = SampleRequest::new(
        x,
        NetworkConfiguration::new("analytic-base", config.version),
        vec![encoding],
        sampling,
        &mut factory,
        &mut encoder,
        &mut noise,
        &mut feedback,
    );
    request.start = start;
    request.guidance = config.guidance.clone();
    request.refiner = config.refiner.clone();
    let result = sampler.sample(request);
    pb.finish_and_clear();
    let sampled = result.map_err(|err| anyhow::anyhow!("Sampling failed: {err}"))?;
    let elapsed = started.elapsed();

    let values = sampled
        .x
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| anyhow::anyhow!("Failed to read latent: {err:?}"))?;
    let count = values.len().max(1) as f32;
    let mean = values.iter().sum::<f32>() / count;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / count;
    let summary = RunSummary {
        sampler: sampler.kind(),
        steps: sampling.steps,
        start_step: start.fractional,
        networks: sampled.networks.iter().map(|n| n.file_path.clone()).collect(),
        network_calls: sampled.networks.iter().map(|n| n.calls).sum(),
        elapsed_ms: elapsed.as_millis(),
        mean,
        std: variance.sqrt(),
        min: values.iter().copied().fold(f32::INFINITY, f32::min),
        max: values.iter().copied().fold(f32::NEG_INFINITY, f32::max),
        data_mean: config.data.mean,
        data_std: config.data.std,
    };

    println!("{:?}: {} steps in {:.2?}", summary.sampler, summary.steps, elapsed);
    println!("  networks:      {} ({} calls)", summary.networks.join(", "), summary.network_calls);
    println!("  latent mean:   {:.4} (data {:.4})", summary.mean, summary.data_mean);
    println!("  latent std:    {:.4} (data {:.4})", summary.std, summary.data_std);
    println!("  latent range:  [{:.4}, {:.4}]", summary.min, summary.max);

    if let Some(path) = output {
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Saved summary to {}", path.display());
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "burn_diffusion=info,burn_diffusion_samplers=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Schedule {
            discretization,
            objective,
            steps,
            shift,
        } => {
            print_schedule(ScheduleConfig::new(discretization, objective), Sampling { steps, shift });
        }
        Commands::Strength {
            strength,
            sampler,
            discretization,
            steps,
            shift,
        } => {
            let schedule = ScheduleConfig::new(discretization, ObjectiveKind::Epsilon);
            let config = RunConfig {
                sampler: sampler.kind(),
                schedule,
                ..Default::default()
            };
            let sampler = config.build_sampler(schedule.build());
            print_strength(&sampler, strength, Sampling { steps, shift });
        }
        Commands::Sample {
            config,
            sampler,
            steps,
            strength,
            output,
        } => {
            let mut config = match config {
                Some(path) => RunConfig::load(&path)?,
                None => RunConfig::default(),
            };
            if let Some(sampler) = sampler {
                config.sampler = sampler.kind();
            }
            if let Some(steps) = steps {
                config.sampling.steps = steps;
            }
            if let Some(strength) = strength {
                config.strength = strength;
            }
            config.validate()?;
            run_sample(config, output)?;
        }
        Commands::Info => {
            println!("burn-diffusion: Diffusion sampling engine in pure Rust\n");
            println!("Available backends:");

            #[cfg(feature = "ndarray")]
            println!("  - ndarray (CPU, enabled)");
            #[cfg(not(feature = "ndarray"))]
            println!("  - ndarray (CPU, not enabled)");

            #[cfg(feature = "wgpu")]
            println!("  - wgpu (WebGPU, enabled)");
            #[cfg(not(feature = "wgpu"))]
            println!("  - wgpu (WebGPU, not enabled)");

            println!("\nSamplers:");
            for choice in SamplerChoice::value_variants() {
                if let Some(value) = choice.to_possible_value() {
                    println!("  - {:?} ({})", choice.kind(), value.get_name());
                }
            }

            println!("\nSchedules:");
            for kind in DiscretizationKind::value_variants() {
                println!("  - {kind:?}");
            }
        }
    }

    Ok(())
}
