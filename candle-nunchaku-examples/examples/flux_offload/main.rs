//! Flux transformer benchmark with layer offload and first-block caching.
//!
//! Builds a quantized Flux transformer from random weights and runs a few
//! denoising-like steps over random latents, reporting per-step timings,
//! offload scheduler counters and cache hits.
//!
//! # Usage
//!
//! ```bash
//! # Small model on CPU, every block resident
//! cargo run --release --example flux_offload -- --cpu
//!
//! # Stream blocks in and out, block-sparse attention
//! cargo run --release --example flux_offload -- --cpu --offload \
//!     --attention block-sparse=0.5 --height 16 --width 16 --txt-tokens 128
//!
//! # Full FLUX.1-dev shapes on GPU with the residual cache
//! cargo run --release --features cuda --example flux_offload -- \
//!     --preset flux-1-dev --offload --cache-threshold 0.12
//! ```

use std::time::Instant;

use anyhow::{bail, Result};
use candle::DType;
use candle_nn::{VarBuilder, VarMap};
use candle_nunchaku::context::ExecutionContext;
use candle_nunchaku::models::flux::{
    AttentionImpl, Config, FirstBlockCache, FluxInputs, FluxModel, FluxRotary, InferenceConfig,
};
use candle_nunchaku::quantized::Precision;
use candle_nunchaku_examples::random_tensor;
use clap::{Parser, ValueEnum};
use rand::prelude::*;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Preset {
    Tiny,
    #[value(name = "flux-1-dev")]
    Flux1Dev,
    #[value(name = "flux-1-schnell")]
    Flux1Schnell,
}

#[derive(Parser)]
#[command(
    name = "flux-offload",
    about = "Quantized Flux transformer with layer offload",
    version
)]
struct Args {
    /// Run on CPU instead of GPU.
    #[arg(long)]
    cpu: bool,

    /// Enable Chrome tracing profiler.
    #[arg(long)]
    tracing: bool,

    /// Model shape preset, ignored when --config is given.
    #[arg(long, value_enum, default_value_t = Preset::Tiny)]
    preset: Preset,

    /// JSON file with the transformer config.
    #[arg(long)]
    config: Option<String>,

    /// Use 8-bit weights instead of 4-bit.
    #[arg(long)]
    int8: bool,

    /// Latent height in patch tokens.
    #[arg(long, default_value_t = 8)]
    height: usize,

    /// Latent width in patch tokens.
    #[arg(long, default_value_t = 8)]
    width: usize,

    /// Number of text tokens.
    #[arg(long, default_value_t = 16)]
    txt_tokens: usize,

    #[arg(long, default_value_t = 1)]
    batch: usize,

    /// Number of denoising steps.
    #[arg(long, default_value_t = 4)]
    steps: usize,

    /// Stream transformer blocks in and out around compute.
    #[arg(long)]
    offload: bool,

    /// flashattn2, nunchaku-fp16, block-sparse or block-sparse=<ratio>.
    #[arg(long, default_value = "flashattn2")]
    attention: String,

    /// Run block-sparse attention on f16 copies of q/k/v.
    #[arg(long)]
    force_fp16: bool,

    /// Reuse the residual of the remaining layers when the first block's
    /// residual changed by less than this. Disabled when unset.
    #[arg(long)]
    cache_threshold: Option<f32>,

    /// Random seed for weights and inputs.
    #[arg(long, default_value_t = 299792458)]
    seed: u64,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => match args.preset {
            Preset::Tiny => Config::tiny(),
            Preset::Flux1Dev => Config::flux_1_dev(),
            Preset::Flux1Schnell => Config::flux_1_schnell(),
        },
    };
    if args.int8 {
        config.precision = Precision::Int8;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = candle_nunchaku_examples::setup_tracing(args.tracing);

    if args.steps == 0 {
        bail!("--steps must be at least 1")
    }
    let device = candle_nunchaku_examples::device(args.cpu)?;
    let config = load_config(&args)?;
    let attention_impl: AttentionImpl = args.attention.parse()?;
    let inference = InferenceConfig {
        offload: args.offload,
        attention_impl,
        force_fp16: args.force_fp16,
    };
    println!(
        "flux: {} joint + {} single layers, dim {}, {:?} weights, attention {attention_impl}, offload {}",
        config.num_layers,
        config.num_single_layers,
        config.inner_dim(),
        config.precision,
        args.offload,
    );

    let start = Instant::now();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let mut model = FluxModel::new(&config, &inference, vb)?;
    println!("model built in {:.2}s", start.elapsed().as_secs_f32());

    let mut rng = StdRng::seed_from_u64(args.seed);
    let dim = config.inner_dim();
    let img_tokens = args.height * args.width;
    let mut latents = random_tensor(&mut rng, &[args.batch, img_tokens, dim], &device)?;
    let txt = random_tensor(&mut rng, &[args.batch, args.txt_tokens, dim], &device)?;
    let temb = random_tensor(&mut rng, &[args.batch, dim], &device)?;
    let rotary = FluxRotary::new(
        args.txt_tokens,
        args.height,
        args.width,
        &config.axes_dims_rope,
        config.theta,
        &device,
    )?;

    let mut cache = args.cache_threshold.map(FirstBlockCache::new);
    let mut ctx = ExecutionContext::host();
    let dt = 1.0 / args.steps as f64;
    for step in 0..args.steps {
        let start = Instant::now();
        let inputs = FluxInputs::new(
            &latents,
            &txt,
            &temb,
            &rotary.img,
            &rotary.context,
            &rotary.single,
        );
        let out = match cache.as_mut() {
            Some(cache) => cache.forward(&mut model, &mut ctx, &inputs)?,
            None => model.forward(&mut ctx, &inputs, false)?,
        };
        let velocity = if model.num_single_layers() > 0 {
            out.narrow(1, args.txt_tokens, img_tokens)?
        } else {
            out
        };
        latents = (&latents - (velocity * dt)?)?;
        device.synchronize()?;
        println!(
            "step {}/{}: {:.3}s",
            step + 1,
            args.steps,
            start.elapsed().as_secs_f32()
        );
        if let Some(stats) = model.last_scheduler_stats() {
            tracing::info!(
                computed = stats.computed,
                loads = stats.loads,
                unloads = stats.unloads,
                peak_resident = stats.peak_resident,
                "scheduler"
            );
        }
    }

    if let Some(cache) = &cache {
        println!(
            "first block cache: {} hits, {} misses",
            cache.hits(),
            cache.misses()
        );
    }
    let norm = latents.sqr()?.mean_all()?.sqrt()?.to_scalar::<f32>()?;
    println!("final latent rms {norm:.4}");
    Ok(())
}
