//! Flux transformer core: joint blocks, the stream merge, single blocks.
//!
//! The model owns its blocks and drives them through a
//! [`LayerOffloadScheduler`]. Layer `i < J` is joint block `i`; layer `J + s`
//! is single block `s`. The text and image streams are concatenated
//! text-first right before the first single block.

use candle::{Device, Tensor};
use candle_nn::VarBuilder;

use crate::context::{device_ordinal, ExecutionContext};
use crate::error::{Error, OpContext, Result};
use crate::kernels::{self, ceil_div};
use crate::offload::{LayerOffloadScheduler, LayerOps, SchedulerStats};
use crate::precondition;

use super::attention::AttentionImpl;
use super::blocks::{JointTransformerBlock, Residency, SingleTransformerBlock, TransformerBlock};
use super::config::{Config, InferenceConfig};

/// Per-call inputs of [`FluxModel::forward`].
#[derive(Debug, Clone, Copy)]
pub struct FluxInputs<'a> {
    /// Image tokens `[B, T_img, D]`.
    pub hidden_states: &'a Tensor,
    /// Text tokens `[B, T_txt, D]`.
    pub encoder_hidden_states: &'a Tensor,
    /// Conditioning embedding `[B, D]`.
    pub temb: &'a Tensor,
    /// Rotary tensor for the image tokens, `[T_img, Dh/2, 2, 2]`.
    pub rotary_img: &'a Tensor,
    /// Rotary tensor for the text tokens, `[T_txt, Dh/2, 2, 2]`.
    pub rotary_context: &'a Tensor,
    /// Rotary tensor for the merged text-then-image sequence.
    pub rotary_single: &'a Tensor,
    /// `[n, B, T_img, D]` residuals added after joint blocks.
    pub controlnet_block_samples: Option<&'a Tensor>,
    /// `[n, B, T_img, D]` residuals added to the image part after single blocks.
    pub controlnet_single_block_samples: Option<&'a Tensor>,
}

impl<'a> FluxInputs<'a> {
    pub fn new(
        hidden_states: &'a Tensor,
        encoder_hidden_states: &'a Tensor,
        temb: &'a Tensor,
        rotary_img: &'a Tensor,
        rotary_context: &'a Tensor,
        rotary_single: &'a Tensor,
    ) -> Self {
        Self {
            hidden_states,
            encoder_hidden_states,
            temb,
            rotary_img,
            rotary_context,
            rotary_single,
            controlnet_block_samples: None,
            controlnet_single_block_samples: None,
        }
    }

    pub fn with_controlnet(
        mut self,
        block_samples: Option<&'a Tensor>,
        single_block_samples: Option<&'a Tensor>,
    ) -> Self {
        self.controlnet_block_samples = block_samples;
        self.controlnet_single_block_samples = single_block_samples;
        self
    }

    /// Replaces both token streams, keeping everything else.
    pub fn with_streams(
        mut self,
        hidden_states: &'a Tensor,
        encoder_hidden_states: &'a Tensor,
    ) -> Self {
        self.hidden_states = hidden_states;
        self.encoder_hidden_states = encoder_hidden_states;
        self
    }
}

/// Which ControlNet residual applies to `layer` out of `num_layers` when
/// `num_samples` residuals are supplied.
pub fn controlnet_block_index(layer: usize, num_layers: usize, num_samples: usize) -> Result<usize> {
    precondition!(
        num_samples > 0 && layer < num_layers,
        "controlnet: layer {layer} of {num_layers} with {num_samples} samples"
    );
    Ok(layer / ceil_div(num_layers, num_samples))
}

fn controlnet_sample(samples: &Tensor, layer: usize, num_layers: usize) -> Result<Tensor> {
    let num_samples = samples.dim(0).op("controlnet")?;
    let idx = controlnet_block_index(layer, num_layers, num_samples)?;
    samples.get(idx).op("controlnet")
}

#[derive(Debug)]
pub struct FluxModel {
    config: Config,
    offload: bool,
    attention_impl: AttentionImpl,
    force_fp16: bool,
    joint_blocks: Vec<JointTransformerBlock>,
    single_blocks: Vec<SingleTransformerBlock>,
    device: Device,
    last_stats: Option<SchedulerStats>,
    span: tracing::Span,
}

impl FluxModel {
    pub fn new(config: &Config, inference: &InferenceConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let dim = config.inner_dim();
        let joint_blocks = (0..config.num_layers)
            .map(|i| {
                let context_pre_only = config.context_pre_only_last && i + 1 == config.num_layers;
                JointTransformerBlock::new(
                    dim,
                    config.num_attention_heads,
                    config.attention_head_dim,
                    config.mlp_ratio,
                    context_pre_only,
                    config.precision,
                    vb.pp(format!("transformer_blocks.{i}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let single_blocks = (0..config.num_single_layers)
            .map(|i| {
                SingleTransformerBlock::new(
                    dim,
                    config.num_attention_heads,
                    config.attention_head_dim,
                    config.mlp_ratio,
                    config.precision,
                    vb.pp(format!("single_transformer_blocks.{i}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let mut model = Self {
            config: config.clone(),
            offload: inference.offload,
            attention_impl: AttentionImpl::default(),
            force_fp16: false,
            joint_blocks,
            single_blocks,
            device: vb.device().clone(),
            last_stats: None,
            span: tracing::span!(tracing::Level::TRACE, "flux"),
        };
        model.set_attention_impl(inference.attention_impl);
        if inference.force_fp16 {
            model.set_force_fp16(true);
        }
        if model.offload {
            for layer in 1..model.num_layers() {
                model.block_mut(layer)?.release_params();
            }
            tracing::info!(
                layers = model.num_layers(),
                "layer offload enabled, only the first block stays resident"
            );
        }
        Ok(model)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn offload(&self) -> bool {
        self.offload
    }

    pub fn num_layers(&self) -> usize {
        self.joint_blocks.len() + self.single_blocks.len()
    }

    pub fn num_joint_layers(&self) -> usize {
        self.joint_blocks.len()
    }

    pub fn num_single_layers(&self) -> usize {
        self.single_blocks.len()
    }

    pub fn attention_impl(&self) -> AttentionImpl {
        self.attention_impl
    }

    /// Scheduler statistics of the last completed [`Self::forward`].
    pub fn last_scheduler_stats(&self) -> Option<SchedulerStats> {
        self.last_stats
    }

    fn block(&self, layer: usize) -> Result<&dyn TransformerBlock> {
        let num_joint = self.joint_blocks.len();
        let block: Option<&dyn TransformerBlock> = if layer < num_joint {
            self.joint_blocks.get(layer).map(|b| b as &dyn TransformerBlock)
        } else {
            self.single_blocks
                .get(layer - num_joint)
                .map(|b| b as &dyn TransformerBlock)
        };
        block.ok_or_else(|| {
            Error::precondition(format!("layer {layer} out of range 0..{}", self.num_layers()))
        })
    }

    fn block_mut(&mut self, layer: usize) -> Result<&mut dyn TransformerBlock> {
        block_mut(&mut self.joint_blocks, &mut self.single_blocks, layer)
    }

    /// Switches every attention module of every block to `attention_impl`.
    pub fn set_attention_impl(&mut self, attention_impl: AttentionImpl) {
        tracing::info!(%attention_impl, "setting attention implementation");
        self.attention_impl = attention_impl;
        let joint = self
            .joint_blocks
            .iter_mut()
            .map(|b| b as &mut dyn TransformerBlock);
        let single = self
            .single_blocks
            .iter_mut()
            .map(|b| b as &mut dyn TransformerBlock);
        for block in joint.chain(single) {
            for attn in block.attention_modules_mut() {
                attn.set_implementation(attention_impl);
            }
        }
    }

    /// Runs block-sparse attention of every block on f16 copies of its inputs.
    pub fn set_force_fp16(&mut self, force_fp16: bool) {
        if force_fp16 {
            tracing::info!("enable force fp16 attention");
        } else {
            tracing::info!("disable force fp16 attention");
        }
        self.force_fp16 = force_fp16;
        let joint = self
            .joint_blocks
            .iter_mut()
            .map(|b| b as &mut dyn TransformerBlock);
        let single = self
            .single_blocks
            .iter_mut()
            .map(|b| b as &mut dyn TransformerBlock);
        for block in joint.chain(single) {
            for attn in block.attention_modules_mut() {
                attn.set_force_fp16(force_fp16);
            }
        }
    }

    pub fn force_fp16(&self) -> bool {
        self.force_fp16
    }

    /// Attention mode of every attention module, in layer order.
    pub fn attention_modes(&mut self) -> Vec<AttentionImpl> {
        let joint = self
            .joint_blocks
            .iter_mut()
            .map(|b| b as &mut dyn TransformerBlock);
        let single = self
            .single_blocks
            .iter_mut()
            .map(|b| b as &mut dyn TransformerBlock);
        joint
            .chain(single)
            .flat_map(|b| {
                b.attention_modules_mut()
                    .into_iter()
                    .map(|a| a.implementation())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn residency(&self, layer: usize) -> Result<Residency> {
        Ok(self.block(layer)?.residency())
    }

    /// Makes `layer` resident. The transfer is foreign code to the device
    /// context, so the device cache is bypassed while it runs.
    pub fn load_layer(&mut self, ctx: &mut ExecutionContext, layer: usize) -> Result<()> {
        let _guard = ctx.enter_device(None, true)?;
        self.block_mut(layer)?.load_params()
    }

    pub fn release_layer(&mut self, ctx: &mut ExecutionContext, layer: usize) -> Result<()> {
        let _guard = ctx.enter_device(None, true)?;
        self.block_mut(layer)?.release_params();
        Ok(())
    }

    fn check_inputs(&self, inputs: &FluxInputs) -> Result<(usize, usize, usize)> {
        let dim = self.config.inner_dim();
        let (b, img_tokens, d) = inputs.hidden_states.dims3().op("flux")?;
        let (b_txt, txt_tokens, d_txt) = inputs.encoder_hidden_states.dims3().op("flux")?;
        let (b_emb, d_emb) = inputs.temb.dims2().op("flux")?;
        precondition!(
            d == dim && d_txt == dim && d_emb == dim,
            "flux: hidden sizes {d}/{d_txt}/{d_emb}, expected {dim}"
        );
        precondition!(
            b == b_txt && b == b_emb,
            "flux: batch sizes {b}/{b_txt}/{b_emb} differ"
        );
        let check_samples = |samples: Option<&Tensor>, name: &str| -> Result<()> {
            if let Some(samples) = samples {
                let (n, sb, st, sd) = samples.dims4().op("flux")?;
                precondition!(
                    n > 0 && sb == b && st == img_tokens && sd == dim,
                    "flux: {name} {:?} do not match [n, {b}, {img_tokens}, {dim}]",
                    samples.dims()
                );
            }
            Ok(())
        };
        check_samples(inputs.controlnet_block_samples, "controlnet block samples")?;
        check_samples(
            inputs.controlnet_single_block_samples,
            "controlnet single block samples",
        )?;
        Ok((b, img_tokens, txt_tokens))
    }

    /// Runs every layer. Returns the merged `[B, T_txt + T_img, D]` sequence,
    /// or the image stream when the model has no single blocks.
    ///
    /// With `skip_first_layer` the first layer is not computed; the caller
    /// passes that layer's output as `hidden_states`. When the model has no
    /// joint blocks that output is already the merged text-then-image
    /// sequence, so no merge happens.
    pub fn forward(
        &mut self,
        ctx: &mut ExecutionContext,
        inputs: &FluxInputs,
        skip_first_layer: bool,
    ) -> Result<Tensor> {
        let span = self.span.clone();
        let _enter = span.enter();
        let (_, img_tokens, txt_tokens) = self.check_inputs(inputs)?;
        let num_layers = self.num_layers();
        let scheduler = LayerOffloadScheduler::new(self.offload, num_layers);
        let mut ctx = ctx.enter_device(device_ordinal(&self.device), false)?;
        let mut pass = ForwardPass {
            joint_blocks: &mut self.joint_blocks,
            single_blocks: &mut self.single_blocks,
            inputs,
            hidden_states: inputs.hidden_states.clone(),
            encoder_hidden_states: Some(inputs.encoder_hidden_states.clone()),
            img_tokens,
            txt_tokens,
            skip_first_layer,
        };
        let stats = scheduler.run(&mut ctx, &mut pass)?;
        tracing::debug!(?stats, "flux forward");
        let hidden_states = pass.hidden_states;
        self.last_stats = Some(stats);
        Ok(hidden_states)
    }

    /// Runs joint layer `layer` alone and returns `(hidden, encoder_hidden)`.
    pub fn forward_layer(
        &mut self,
        ctx: &mut ExecutionContext,
        layer: usize,
        inputs: &FluxInputs,
    ) -> Result<(Tensor, Tensor)> {
        let num_joint = self.joint_blocks.len();
        precondition!(
            layer < num_joint,
            "forward_layer: layer {layer} is not one of the {num_joint} joint layers"
        );
        self.check_inputs(inputs)?;
        let _guard = ctx.enter_device(device_ordinal(&self.device), false)?;
        let block = &mut self.joint_blocks[layer];
        let (hidden, encoder) = block.forward(
            inputs.hidden_states,
            inputs.encoder_hidden_states,
            inputs.temb,
            inputs.rotary_img,
            inputs.rotary_context,
        )?;
        let hidden = match inputs.controlnet_block_samples {
            Some(samples) => kernels::add(&hidden, &controlnet_sample(samples, layer, num_joint)?)?,
            None => hidden,
        };
        Ok((hidden, encoder))
    }
}

fn block_mut<'a>(
    joint: &'a mut [JointTransformerBlock],
    single: &'a mut [SingleTransformerBlock],
    layer: usize,
) -> Result<&'a mut dyn TransformerBlock> {
    let num_layers = joint.len() + single.len();
    let num_joint = joint.len();
    let block: Option<&mut dyn TransformerBlock> = if layer < num_joint {
        joint.get_mut(layer).map(|b| b as &mut dyn TransformerBlock)
    } else {
        single
            .get_mut(layer - num_joint)
            .map(|b| b as &mut dyn TransformerBlock)
    };
    block.ok_or_else(|| Error::precondition(format!("layer {layer} out of range 0..{num_layers}")))
}

/// State of one forward pass, driven layer by layer by the scheduler.
struct ForwardPass<'m, 'i> {
    joint_blocks: &'m mut [JointTransformerBlock],
    single_blocks: &'m mut [SingleTransformerBlock],
    inputs: &'i FluxInputs<'i>,
    hidden_states: Tensor,
    /// Dropped once the streams are merged.
    encoder_hidden_states: Option<Tensor>,
    img_tokens: usize,
    txt_tokens: usize,
    skip_first_layer: bool,
}

impl ForwardPass<'_, '_> {
    fn merge_streams(&mut self) -> Result<()> {
        if let Some(encoder) = self.encoder_hidden_states.take() {
            self.hidden_states =
                Tensor::cat(&[&encoder, &self.hidden_states], 1).op("flux.merge")?;
        }
        Ok(())
    }

    fn compute_joint(&mut self, layer: usize) -> Result<()> {
        let Some(encoder) = self.encoder_hidden_states.as_ref() else {
            return Err(Error::precondition("text stream already merged"));
        };
        let num_joint = self.joint_blocks.len();
        let (hidden, encoder) = self.joint_blocks[layer].forward(
            &self.hidden_states,
            encoder,
            self.inputs.temb,
            self.inputs.rotary_img,
            self.inputs.rotary_context,
        )?;
        self.hidden_states = match self.inputs.controlnet_block_samples {
            Some(samples) => kernels::add(&hidden, &controlnet_sample(samples, layer, num_joint)?)?,
            None => hidden,
        };
        self.encoder_hidden_states = Some(encoder);
        Ok(())
    }

    fn compute_single(&mut self, idx: usize) -> Result<()> {
        let num_single = self.single_blocks.len();
        let hidden = self.single_blocks[idx].forward(
            &self.hidden_states,
            self.inputs.temb,
            self.inputs.rotary_single,
        )?;
        self.hidden_states = match self.inputs.controlnet_single_block_samples {
            Some(samples) => {
                let sample = controlnet_sample(samples, idx, num_single)?;
                let txt = hidden.narrow(1, 0, self.txt_tokens).op("controlnet")?;
                let img = hidden
                    .narrow(1, self.txt_tokens, self.img_tokens)
                    .op("controlnet")?;
                let img = kernels::add(&img, &sample)?;
                Tensor::cat(&[&txt, &img], 1).op("controlnet")?
            }
            None => hidden,
        };
        Ok(())
    }
}

impl LayerOps for ForwardPass<'_, '_> {
    fn compute(&mut self, _ctx: &mut ExecutionContext, layer: usize) -> Result<()> {
        if self.skip_first_layer && layer == 0 {
            return Ok(());
        }
        let num_joint = self.joint_blocks.len();
        if layer == num_joint {
            self.merge_streams()?;
        }
        if layer < num_joint {
            self.compute_joint(layer)
        } else {
            self.compute_single(layer - num_joint)
        }
    }

    fn load(&mut self, ctx: &mut ExecutionContext, layer: usize) -> Result<()> {
        let _guard = ctx.enter_device(None, true)?;
        block_mut(self.joint_blocks, self.single_blocks, layer)?.load_params()
    }

    fn unload(&mut self, ctx: &mut ExecutionContext, layer: usize) -> Result<()> {
        let _guard = ctx.enter_device(None, true)?;
        block_mut(self.joint_blocks, self.single_blocks, layer)?.release_params();
        Ok(())
    }
}
