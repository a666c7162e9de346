//! End-to-end properties of the quantized Flux model on random weights.

use candle::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_nunchaku::context::ExecutionContext;
use candle_nunchaku::models::flux::{
    AttentionImpl, Config, FirstBlockCache, FluxInputs, FluxModel, FluxRotary, InferenceConfig,
    Residency, SingleTransformerBlock,
};
use candle_nunchaku::Result;
use rand::prelude::*;

const HEIGHT: usize = 4;
const WIDTH: usize = 4;
const TXT_TOKENS: usize = 8;

/// Random tensor with values in [-0.5, 0.5].
fn random_tensor(shape: &[usize], seed: u64) -> Result<Tensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    let elem_count: usize = shape.iter().product();
    let data: Vec<f32> = (0..elem_count).map(|_| rng.random::<f32>() - 0.5).collect();
    Ok(Tensor::from_vec(data, shape, &Device::Cpu)?)
}

struct Fixture {
    img: Tensor,
    txt: Tensor,
    temb: Tensor,
    rotary: FluxRotary,
}

impl Fixture {
    fn new(config: &Config, batch: usize) -> Result<Self> {
        let dim = config.inner_dim();
        Ok(Self {
            img: random_tensor(&[batch, HEIGHT * WIDTH, dim], 1)?,
            txt: random_tensor(&[batch, TXT_TOKENS, dim], 2)?,
            temb: random_tensor(&[batch, dim], 3)?,
            rotary: FluxRotary::new(
                TXT_TOKENS,
                HEIGHT,
                WIDTH,
                &config.axes_dims_rope,
                config.theta,
                &Device::Cpu,
            )?,
        })
    }

    fn inputs(&self) -> FluxInputs<'_> {
        FluxInputs::new(
            &self.img,
            &self.txt,
            &self.temb,
            &self.rotary.img,
            &self.rotary.context,
            &self.rotary.single,
        )
    }
}

fn build(varmap: &VarMap, config: &Config, inference: InferenceConfig) -> Result<FluxModel> {
    let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
    FluxModel::new(config, &inference, vb)
}

fn offloaded() -> InferenceConfig {
    InferenceConfig {
        offload: true,
        ..Default::default()
    }
}

fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok((a - b)?.abs()?.max_all()?.to_scalar::<f32>()?)
}

#[test]
fn output_is_text_then_image() -> Result<()> {
    let config = Config::tiny();
    let varmap = VarMap::new();
    let mut model = build(&varmap, &config, InferenceConfig::default())?;
    let fx = Fixture::new(&config, 2)?;
    let out = model.forward(&mut ExecutionContext::host(), &fx.inputs(), false)?;
    assert_eq!(out.dims(), &[2, TXT_TOKENS + HEIGHT * WIDTH, config.inner_dim()]);
    Ok(())
}

#[test]
fn streams_merge_text_first() -> Result<()> {
    let config = Config {
        num_layers: 0,
        num_single_layers: 1,
        ..Config::tiny()
    };
    let varmap = VarMap::new();
    let mut model = build(&varmap, &config, InferenceConfig::default())?;
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let mut block = SingleTransformerBlock::new(
        config.inner_dim(),
        config.num_attention_heads,
        config.attention_head_dim,
        config.mlp_ratio,
        config.precision,
        vb.pp("single_transformer_blocks.0"),
    )?;
    let fx = Fixture::new(&config, 1)?;
    let out = model.forward(&mut ExecutionContext::host(), &fx.inputs(), false)?;
    let merged = Tensor::cat(&[&fx.txt, &fx.img], 1)?;
    let expected = block.forward(&merged, &fx.temb, &fx.rotary.single)?;
    assert_eq!(max_diff(&out, &expected)?, 0.);
    Ok(())
}

#[test]
fn without_single_blocks_the_image_stream_is_returned() -> Result<()> {
    let config = Config {
        num_single_layers: 0,
        ..Config::tiny()
    };
    let varmap = VarMap::new();
    let mut model = build(&varmap, &config, InferenceConfig::default())?;
    let fx = Fixture::new(&config, 1)?;
    let mut ctx = ExecutionContext::host();
    let out = model.forward(&mut ctx, &fx.inputs(), false)?;
    assert_eq!(out.dims(), fx.img.dims());

    let (h0, e0) = model.forward_layer(&mut ctx, 0, &fx.inputs())?;
    let (h1, _) = model.forward_layer(&mut ctx, 1, &fx.inputs().with_streams(&h0, &e0))?;
    assert_eq!(max_diff(&out, &h1)?, 0.);
    Ok(())
}

#[test]
fn offload_matches_resident_model() -> Result<()> {
    let config = Config::tiny();
    let varmap = VarMap::new();
    let mut resident = build(&varmap, &config, InferenceConfig::default())?;
    let mut streamed = build(&varmap, &config, offloaded())?;

    for layer in 0..streamed.num_layers() {
        let expected = if layer == 0 {
            Residency::Resident
        } else {
            Residency::Released
        };
        assert_eq!(streamed.residency(layer)?, expected);
    }

    let fx = Fixture::new(&config, 1)?;
    let mut ctx = ExecutionContext::host();
    let a = resident.forward(&mut ctx, &fx.inputs(), false)?;
    let b = streamed.forward(&mut ctx, &fx.inputs(), false)?;
    assert_eq!(max_diff(&a, &b)?, 0.);
    assert_eq!(ctx.depth(), 0);

    let stats = streamed.last_scheduler_stats().expect("stats recorded");
    assert_eq!(stats.computed, 4);
    assert_eq!(stats.loads, 4);
    assert_eq!(stats.unloads, 3);
    assert!(stats.peak_resident <= 2);
    assert_eq!(streamed.residency(0)?, Residency::Resident);
    for layer in 1..streamed.num_layers() {
        assert_eq!(streamed.residency(layer)?, Residency::Released);
    }
    Ok(())
}

#[test]
fn skip_first_layer_resumes_from_its_output() -> Result<()> {
    let config = Config::tiny();
    let varmap = VarMap::new();
    let mut model = build(&varmap, &config, offloaded())?;
    let fx = Fixture::new(&config, 1)?;
    let mut ctx = ExecutionContext::host();
    let full = model.forward(&mut ctx, &fx.inputs(), false)?;

    let (hidden, encoder) = model.forward_layer(&mut ctx, 0, &fx.inputs())?;
    let rest = model.forward(&mut ctx, &fx.inputs().with_streams(&hidden, &encoder), true)?;
    assert_eq!(max_diff(&full, &rest)?, 0.);
    Ok(())
}

#[test]
fn skipped_first_single_layer_takes_the_merged_sequence() -> Result<()> {
    let config = Config {
        num_layers: 0,
        num_single_layers: 2,
        ..Config::tiny()
    };
    let varmap = VarMap::new();
    let mut model = build(&varmap, &config, InferenceConfig::default())?;
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let mut second = SingleTransformerBlock::new(
        config.inner_dim(),
        config.num_attention_heads,
        config.attention_head_dim,
        config.mlp_ratio,
        config.precision,
        vb.pp("single_transformer_blocks.1"),
    )?;
    let fx = Fixture::new(&config, 1)?;
    let merged = Tensor::cat(&[&fx.txt, &fx.img], 1)?;
    let inputs = fx.inputs().with_streams(&merged, &fx.txt);
    let out = model.forward(&mut ExecutionContext::host(), &inputs, true)?;
    assert_eq!(out.dims(), merged.dims());
    let expected = second.forward(&merged, &fx.temb, &fx.rotary.single)?;
    assert_eq!(max_diff(&out, &expected)?, 0.);
    Ok(())
}

#[test]
fn forward_layer_rejects_bad_layers() -> Result<()> {
    let config = Config::tiny();
    let varmap = VarMap::new();
    let mut model = build(&varmap, &config, offloaded())?;
    let fx = Fixture::new(&config, 1)?;
    let mut ctx = ExecutionContext::host();

    let err = model
        .forward_layer(&mut ctx, config.num_layers, &fx.inputs())
        .unwrap_err();
    assert!(err.is_precondition());
    // Joint layer 1 is released after construction.
    let err = model.forward_layer(&mut ctx, 1, &fx.inputs()).unwrap_err();
    assert!(err.is_precondition());

    model.load_layer(&mut ctx, 1)?;
    assert_eq!(model.residency(1)?, Residency::Resident);
    model.forward_layer(&mut ctx, 1, &fx.inputs())?;
    model.release_layer(&mut ctx, 1)?;
    assert_eq!(model.residency(1)?, Residency::Released);
    assert!(model.residency(99).unwrap_err().is_precondition());
    Ok(())
}

#[test]
fn controlnet_residuals_touch_only_the_image_stream() -> Result<()> {
    let config = Config {
        num_layers: 1,
        num_single_layers: 1,
        ..Config::tiny()
    };
    let varmap = VarMap::new();
    let mut model = build(&varmap, &config, InferenceConfig::default())?;
    let fx = Fixture::new(&config, 1)?;
    let mut ctx = ExecutionContext::host();
    let plain = model.forward(&mut ctx, &fx.inputs(), false)?;

    let single = random_tensor(&[1, 1, HEIGHT * WIDTH, config.inner_dim()], 7)?;
    let with_single = model.forward(
        &mut ctx,
        &fx.inputs().with_controlnet(None, Some(&single)),
        false,
    )?;
    let txt_delta = max_diff(
        &plain.narrow(1, 0, TXT_TOKENS)?,
        &with_single.narrow(1, 0, TXT_TOKENS)?,
    )?;
    assert_eq!(txt_delta, 0.);
    let img_delta = (with_single.narrow(1, TXT_TOKENS, HEIGHT * WIDTH)?
        - plain.narrow(1, TXT_TOKENS, HEIGHT * WIDTH)?)?;
    assert!(max_diff(&img_delta, &single.get(0)?)? < 1e-3);

    let zeros = Tensor::zeros((2, 1, HEIGHT * WIDTH, config.inner_dim()), DType::F32, &Device::Cpu)?;
    let with_zeros = model.forward(
        &mut ctx,
        &fx.inputs().with_controlnet(Some(&zeros), None),
        false,
    )?;
    assert_eq!(max_diff(&plain, &with_zeros)?, 0.);

    let bad = Tensor::zeros((1, 1, 3, config.inner_dim()), DType::F32, &Device::Cpu)?;
    let err = model
        .forward(&mut ctx, &fx.inputs().with_controlnet(Some(&bad), None), false)
        .unwrap_err();
    assert!(err.is_precondition());
    Ok(())
}

#[test]
fn attention_mode_reaches_every_block() -> Result<()> {
    let config = Config::tiny();
    let varmap = VarMap::new();
    let mut model = build(&varmap, &config, InferenceConfig::default())?;
    let fx = Fixture::new(&config, 1)?;
    let mut ctx = ExecutionContext::host();
    let dense = model.forward(&mut ctx, &fx.inputs(), false)?;

    let sparse = AttentionImpl::BlockSparse {
        sparsity_ratio: 0.0,
    };
    model.set_attention_impl(sparse);
    assert!(model.attention_modes().iter().all(|m| *m == sparse));
    assert_eq!(model.attention_modes().len(), config.total_layers());
    let out = model.forward(&mut ctx, &fx.inputs(), false)?;
    assert_eq!(max_diff(&dense, &out)?, 0.);

    model.set_attention_impl(AttentionImpl::NunchakuFp16);
    assert_eq!(model.attention_impl(), AttentionImpl::NunchakuFp16);
    let half = model.forward(&mut ctx, &fx.inputs(), false)?;
    let scale = dense.abs()?.max_all()?.to_scalar::<f32>()?;
    assert!(max_diff(&dense, &half)? / scale < 5e-2);
    Ok(())
}

#[test]
fn forced_fp16_sparse_attention_stays_close() -> Result<()> {
    let config = Config::tiny();
    let varmap = VarMap::new();
    let sparse = InferenceConfig {
        attention_impl: AttentionImpl::BlockSparse {
            sparsity_ratio: 0.5,
        },
        ..Default::default()
    };
    let mut model = build(&varmap, &config, sparse)?;
    let mut forced = build(
        &varmap,
        &config,
        InferenceConfig {
            force_fp16: true,
            ..sparse
        },
    )?;
    assert!(!model.force_fp16());
    assert!(forced.force_fp16());
    let fx = Fixture::new(&config, 1)?;
    let mut ctx = ExecutionContext::host();
    let full = model.forward(&mut ctx, &fx.inputs(), false)?;
    let half = forced.forward(&mut ctx, &fx.inputs(), false)?;
    assert_eq!(half.dtype(), DType::F32);
    let scale = full.abs()?.max_all()?.to_scalar::<f32>()?;
    assert!(max_diff(&full, &half)? / scale < 5e-2);

    model.set_force_fp16(true);
    let toggled = model.forward(&mut ctx, &fx.inputs(), false)?;
    assert_eq!(max_diff(&half, &toggled)?, 0.);
    model.set_force_fp16(false);
    let restored = model.forward(&mut ctx, &fx.inputs(), false)?;
    assert_eq!(max_diff(&full, &restored)?, 0.);
    Ok(())
}

#[test]
fn first_block_cache_reuses_remaining_layers() -> Result<()> {
    let config = Config::tiny();
    let varmap = VarMap::new();
    let mut model = build(&varmap, &config, offloaded())?;
    let fx = Fixture::new(&config, 1)?;
    let mut ctx = ExecutionContext::host();
    let reference = model.forward(&mut ctx, &fx.inputs(), false)?;

    let mut cache = FirstBlockCache::default();
    let first = cache.forward(&mut model, &mut ctx, &fx.inputs())?;
    assert_eq!((cache.hits(), cache.misses()), (0, 1));
    assert_eq!(max_diff(&reference, &first)?, 0.);

    let second = cache.forward(&mut model, &mut ctx, &fx.inputs())?;
    assert_eq!((cache.hits(), cache.misses()), (1, 1));
    assert!(max_diff(&reference, &second)? < 1e-3);

    let mut strict = FirstBlockCache::new(0.0);
    strict.forward(&mut model, &mut ctx, &fx.inputs())?;
    strict.forward(&mut model, &mut ctx, &fx.inputs())?;
    assert_eq!((strict.hits(), strict.misses()), (0, 2));

    cache.reset();
    cache.forward(&mut model, &mut ctx, &fx.inputs())?;
    assert_eq!((cache.hits(), cache.misses()), (1, 2));
    Ok(())
}
