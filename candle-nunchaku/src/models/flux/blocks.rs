//! Transformer blocks for quantized Flux.
//!
//! - **Joint block**: image and text streams are modulated and projected
//!   separately, attend jointly over the concatenated sequence, then go
//!   through separate output projections and MLPs.
//! - **Single block**: one merged stream; attention and MLP run in parallel
//!   from the same normalized input and share one gated residual.
//!
//! Both keep their quantized weights behind an explicit residency flag so the
//! offload scheduler can stream them in and out.

use candle::{DType, Tensor};
use candle_nn::{LayerNorm, Module, RmsNorm, VarBuilder};

use crate::error::{Error, OpContext, Result};
use crate::kernels::{self, round_up, Segment, FP16_TILE, POOL_SIZE};
use crate::precondition;
use crate::quantized::{qlinear, rms_norm, PackedQkv, Precision, QLinear};

use super::attention::{Attention, AttentionImpl, AttentionOutput};
use super::norm::{
    layer_norm_no_affine, AdaLayerNormZero, AdaLayerNormZeroSingle, FullModulation,
    ModulationOutput,
};

const QK_NORM_EPS: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    Resident,
    Released,
}

/// Capabilities the model needs from every block.
pub trait TransformerBlock {
    /// Every attention module owned by the block.
    fn attention_modules_mut(&mut self) -> Vec<&mut Attention>;

    fn load_params(&mut self) -> Result<()>;

    fn release_params(&mut self);

    fn residency(&self) -> Residency;
}

fn load_all(layers: Vec<&mut QLinear>) -> Result<()> {
    for layer in layers {
        layer.load()?;
    }
    Ok(())
}

fn ensure_resident(residency: Residency, kind: &str) -> Result<()> {
    precondition!(
        residency == Residency::Resident,
        "{kind} block invoked while its parameters are released"
    );
    Ok(())
}

/// Two quantized layers with GELU in between; the activation crosses the
/// layer boundary in quantized form.
#[derive(Debug)]
pub struct FeedForward {
    fc1: QLinear,
    fc2: QLinear,
}

impl FeedForward {
    pub fn new(
        dim: usize,
        hidden_dim: usize,
        precision: Precision,
        vb_fc1: VarBuilder,
        vb_fc2: VarBuilder,
    ) -> Result<Self> {
        let fc1 = qlinear(dim, hidden_dim, precision, vb_fc1)?;
        let fc2 = qlinear(hidden_dim, dim, precision, vb_fc2)?;
        Ok(Self { fc1, fc2 })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let act = self.fc1.forward_gelu_quant(xs)?;
        self.fc2.forward_quant(&act)
    }

    fn layers_mut(&mut self) -> [&mut QLinear; 2] {
        [&mut self.fc1, &mut self.fc2]
    }
}

/// Per-stream QKV projection and its Q/K norms.
#[derive(Debug)]
struct QkvProjection {
    proj: QLinear,
    norm_q: RmsNorm,
    norm_k: RmsNorm,
}

impl QkvProjection {
    fn new(
        dim: usize,
        head_dim: usize,
        precision: Precision,
        vb: VarBuilder,
        proj: &str,
        norm_q: &str,
        norm_k: &str,
    ) -> Result<Self> {
        Ok(Self {
            proj: qlinear(dim, 3 * dim, precision, vb.pp(proj))?,
            norm_q: rms_norm(head_dim, QK_NORM_EPS, vb.pp(norm_q))?,
            norm_k: rms_norm(head_dim, QK_NORM_EPS, vb.pp(norm_k))?,
        })
    }

    /// Packed QKV laid out for the heads of `attn`.
    fn packed(
        &self,
        x: &Tensor,
        rotary: &Tensor,
        attn: &Attention,
        emit_pool: bool,
    ) -> Result<PackedQkv> {
        self.proj.forward_qkv(
            x,
            &self.norm_q,
            &self.norm_k,
            rotary,
            attn.num_heads(),
            attn.head_dim(),
            emit_pool,
        )
    }

    fn padded(
        &self,
        x: &Tensor,
        rotary: &Tensor,
        attn: &Attention,
        tokens_pad: usize,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        self.proj.forward_qkv_padded(
            x,
            &self.norm_q,
            &self.norm_k,
            rotary,
            attn.num_heads(),
            attn.head_dim(),
            tokens_pad,
        )
    }
}

/// Output projection, post-attention norm and MLP of one stream.
#[derive(Debug)]
struct StreamTail {
    out_proj: QLinear,
    norm2: LayerNorm,
    mlp: FeedForward,
}

impl StreamTail {
    fn new(
        dim: usize,
        mlp_hidden_dim: usize,
        precision: Precision,
        vb: &VarBuilder,
        names: [&str; 3],
    ) -> Result<Self> {
        let [out_proj, fc1, fc2] = names;
        Ok(Self {
            out_proj: qlinear(dim, dim, precision, vb.pp(out_proj))?,
            norm2: layer_norm_no_affine(dim, 1e-6, vb.device(), vb.dtype())?,
            mlp: FeedForward::new(dim, mlp_hidden_dim, precision, vb.pp(fc1), vb.pp(fc2))?,
        })
    }

    /// Gated attention residual followed by the modulated MLP residual.
    fn forward(
        &self,
        residual: &Tensor,
        attn: &Tensor,
        modulation: &FullModulation,
    ) -> Result<Tensor> {
        let attn = self.out_proj.forward(attn)?;
        let hidden = kernels::mul_add(&attn, &modulation.gate_msa, residual)?;
        let normed = self.norm2.forward(&hidden).op("layer_norm")?;
        let normed = modulation.modulate_mlp(&normed)?;
        let ff = self.mlp.forward(&normed)?;
        kernels::mul_add(&ff, &modulation.gate_mlp, &hidden)
    }

    fn layers_mut(&mut self) -> Vec<&mut QLinear> {
        let mut layers = vec![&mut self.out_proj];
        layers.extend(self.mlp.layers_mut());
        layers
    }
}

/// Dual-stream block: image and text attend jointly, everything else is
/// per stream.
#[derive(Debug)]
pub struct JointTransformerBlock {
    dim: usize,
    context_pre_only: bool,
    norm1: AdaLayerNormZero,
    norm1_context: AdaLayerNormZero,
    qkv: QkvProjection,
    qkv_context: QkvProjection,
    attn: Attention,
    img_tail: StreamTail,
    context_tail: Option<StreamTail>,
    residency: Residency,
    span: tracing::Span,
}

impl JointTransformerBlock {
    pub fn new(
        dim: usize,
        num_heads: usize,
        head_dim: usize,
        mlp_ratio: usize,
        context_pre_only: bool,
        precision: Precision,
        vb: VarBuilder,
    ) -> Result<Self> {
        precondition!(
            num_heads * head_dim == dim,
            "joint block: {num_heads} heads of {head_dim} do not make {dim}"
        );
        let mlp_hidden_dim = dim * mlp_ratio;
        let norm1 = AdaLayerNormZero::new(dim, false, precision, vb.pp("norm1"))?;
        let norm1_context =
            AdaLayerNormZero::new(dim, context_pre_only, precision, vb.pp("norm1_context"))?;
        let qkv = QkvProjection::new(dim, head_dim, precision, vb.clone(), "qkv_proj", "norm_q", "norm_k")?;
        let qkv_context = QkvProjection::new(
            dim,
            head_dim,
            precision,
            vb.clone(),
            "qkv_proj_context",
            "norm_added_q",
            "norm_added_k",
        )?;
        let img_tail = StreamTail::new(
            dim,
            mlp_hidden_dim,
            precision,
            &vb,
            ["out_proj", "mlp_fc1", "mlp_fc2"],
        )?;
        let context_tail = if context_pre_only {
            None
        } else {
            Some(StreamTail::new(
                dim,
                mlp_hidden_dim,
                precision,
                &vb,
                ["out_proj_context", "mlp_context_fc1", "mlp_context_fc2"],
            )?)
        };
        Ok(Self {
            dim,
            context_pre_only,
            norm1,
            norm1_context,
            qkv,
            qkv_context,
            attn: Attention::new(num_heads, head_dim),
            img_tail,
            context_tail,
            residency: Residency::Resident,
            span: tracing::span!(tracing::Level::TRACE, "joint-block"),
        })
    }

    pub fn context_pre_only(&self) -> bool {
        self.context_pre_only
    }

    fn quantized_layers_mut(&mut self) -> Vec<&mut QLinear> {
        let mut layers = vec![
            self.norm1.linear_mut(),
            self.norm1_context.linear_mut(),
            &mut self.qkv.proj,
            &mut self.qkv_context.proj,
        ];
        layers.extend(self.img_tail.layers_mut());
        if let Some(tail) = self.context_tail.as_mut() {
            layers.extend(tail.layers_mut());
        }
        layers
    }

    /// Joint attention over image-then-text, in whichever mode is active.
    fn attention(
        &mut self,
        img: &Tensor,
        txt: &Tensor,
        rotary_img: &Tensor,
        rotary_context: &Tensor,
        out_dtype: DType,
    ) -> Result<AttentionOutput> {
        let img_tokens = img.dim(1).op("joint-block")?;
        let txt_tokens = txt.dim(1).op("joint-block")?;
        match self.attn.implementation() {
            AttentionImpl::NunchakuFp16 => {
                let img_pad = round_up(img_tokens, FP16_TILE);
                let txt_pad = round_up(txt_tokens, FP16_TILE);
                let (qi, ki, vi) = self.qkv.padded(img, rotary_img, &self.attn, img_pad)?;
                let (qt, kt, vt) =
                    self.qkv_context
                        .padded(txt, rotary_context, &self.attn, txt_pad)?;
                let cat = |a: &Tensor, b: &Tensor| Tensor::cat(&[a, b], 2).op("joint-block");
                let segments = vec![Segment::new(0, img_tokens), Segment::new(img_pad, txt_tokens)];
                self.attn.dispatch_padded(
                    &cat(&qi, &qt)?,
                    &cat(&ki, &kt)?,
                    &cat(&vi, &vt)?,
                    segments,
                    out_dtype,
                )
            }
            mode => {
                let emit_pool = matches!(mode, AttentionImpl::BlockSparse { sparsity_ratio } if sparsity_ratio > 0.0)
                    && img_tokens % POOL_SIZE == 0
                    && txt_tokens % POOL_SIZE == 0;
                let img_qkv = self.qkv.packed(img, rotary_img, &self.attn, emit_pool)?;
                let txt_qkv = self
                    .qkv_context
                    .packed(txt, rotary_context, &self.attn, emit_pool)?;
                let qkv = Tensor::cat(&[&img_qkv.qkv, &txt_qkv.qkv], 1).op("joint-block")?;
                let pool = match (&img_qkv.pool, &txt_qkv.pool) {
                    (Some(a), Some(b)) => Some(Tensor::cat(&[a, b], 1).op("joint-block")?),
                    _ => None,
                };
                let segments = vec![Segment::new(0, img_tokens), Segment::new(img_tokens, txt_tokens)];
                self.attn.dispatch_packed(&qkv, pool.as_ref(), segments)
            }
        }
    }

    /// Returns the updated `(hidden_states, encoder_hidden_states)`.
    ///
    /// When the block is `context_pre_only` the text stream is returned
    /// unchanged.
    pub fn forward(
        &mut self,
        hidden_states: &Tensor,
        encoder_hidden_states: &Tensor,
        temb: &Tensor,
        rotary_img: &Tensor,
        rotary_context: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let span = self.span.clone();
        let _enter = span.enter();
        ensure_resident(self.residency, "joint")?;
        let (b, img_tokens, d) = hidden_states.dims3().op("joint-block")?;
        let (b_txt, txt_tokens, d_txt) = encoder_hidden_states.dims3().op("joint-block")?;
        precondition!(
            b == b_txt && d == self.dim && d_txt == self.dim,
            "joint block: image {:?} and text {:?} do not match hidden size {}",
            hidden_states.dims(),
            encoder_hidden_states.dims(),
            self.dim
        );
        tracing::trace!(b, img_tokens, txt_tokens, "joint block");

        let ModulationOutput::Full(img_mod) = self.norm1.forward(hidden_states, temb)? else {
            return Err(Error::precondition("image stream needs full modulation"));
        };
        let txt_mod = self.norm1_context.forward(encoder_hidden_states, temb)?;

        let attn = self.attention(
            &img_mod.x,
            txt_mod.x(),
            rotary_img,
            rotary_context,
            hidden_states.dtype(),
        )?;

        let hidden_states = self
            .img_tail
            .forward(hidden_states, &attn.segment(0)?, &img_mod)?;

        let encoder_hidden_states = match (&self.context_tail, txt_mod) {
            (None, _) => encoder_hidden_states.clone(),
            (Some(tail), ModulationOutput::Full(txt_mod)) => {
                tail.forward(encoder_hidden_states, &attn.segment(1)?, &txt_mod)?
            }
            (Some(_), ModulationOutput::PreOnly(_)) => {
                return Err(Error::precondition("text stream tail needs full modulation"))
            }
        };
        Ok((hidden_states, encoder_hidden_states))
    }
}

impl TransformerBlock for JointTransformerBlock {
    fn attention_modules_mut(&mut self) -> Vec<&mut Attention> {
        vec![&mut self.attn]
    }

    fn load_params(&mut self) -> Result<()> {
        load_all(self.quantized_layers_mut())?;
        self.residency = Residency::Resident;
        Ok(())
    }

    fn release_params(&mut self) {
        self.quantized_layers_mut()
            .into_iter()
            .for_each(QLinear::release);
        self.residency = Residency::Released;
    }

    fn residency(&self) -> Residency {
        self.residency
    }
}

/// Merged-stream block with parallel attention and MLP.
#[derive(Debug)]
pub struct SingleTransformerBlock {
    dim: usize,
    norm: AdaLayerNormZeroSingle,
    qkv: QkvProjection,
    attn: Attention,
    out_proj: QLinear,
    mlp: FeedForward,
    residency: Residency,
    span: tracing::Span,
}

impl SingleTransformerBlock {
    pub fn new(
        dim: usize,
        num_heads: usize,
        head_dim: usize,
        mlp_ratio: usize,
        precision: Precision,
        vb: VarBuilder,
    ) -> Result<Self> {
        precondition!(
            num_heads * head_dim == dim,
            "single block: {num_heads} heads of {head_dim} do not make {dim}"
        );
        let mlp_hidden_dim = dim * mlp_ratio;
        Ok(Self {
            dim,
            norm: AdaLayerNormZeroSingle::new(dim, precision, vb.pp("norm"))?,
            qkv: QkvProjection::new(dim, head_dim, precision, vb.clone(), "qkv_proj", "norm_q", "norm_k")?,
            attn: Attention::new(num_heads, head_dim),
            out_proj: qlinear(dim, dim, precision, vb.pp("out_proj"))?,
            mlp: FeedForward::new(
                dim,
                mlp_hidden_dim,
                precision,
                vb.pp("mlp_fc1"),
                vb.pp("mlp_fc2"),
            )?,
            residency: Residency::Resident,
            span: tracing::span!(tracing::Level::TRACE, "single-block"),
        })
    }

    fn quantized_layers_mut(&mut self) -> Vec<&mut QLinear> {
        let mut layers = vec![self.norm.linear_mut(), &mut self.qkv.proj, &mut self.out_proj];
        layers.extend(self.mlp.layers_mut());
        layers
    }

    pub fn forward(&mut self, hidden_states: &Tensor, temb: &Tensor, rotary: &Tensor) -> Result<Tensor> {
        let span = self.span.clone();
        let _enter = span.enter();
        ensure_resident(self.residency, "single")?;
        let (b, tokens, d) = hidden_states.dims3().op("single-block")?;
        precondition!(
            d == self.dim,
            "single block: hidden size {d}, expected {}",
            self.dim
        );

        let normed = self.norm.forward(hidden_states, temb)?;
        let attn = match self.attn.implementation() {
            AttentionImpl::NunchakuFp16 => {
                precondition!(b == 1, "fp16 attention in single blocks needs batch 1, got {b}");
                let tokens_pad = round_up(tokens, FP16_TILE);
                let (q, k, v) = self.qkv.padded(&normed.x, rotary, &self.attn, tokens_pad)?;
                self.attn
                    .dispatch_padded(&q, &k, &v, vec![Segment::new(0, tokens)], hidden_states.dtype())?
            }
            _ => {
                let packed = self.qkv.packed(&normed.x, rotary, &self.attn, false)?;
                self.attn
                    .dispatch_packed(&packed.qkv, None, vec![Segment::new(0, tokens)])?
            }
        };
        let attn = self.out_proj.forward(&attn.segment(0)?)?;
        let ff = self.mlp.forward(&normed.x)?;
        let out = kernels::add(&attn, &ff)?;
        kernels::mul_add(&out, &normed.gate_msa, hidden_states)
    }
}

impl TransformerBlock for SingleTransformerBlock {
    fn attention_modules_mut(&mut self) -> Vec<&mut Attention> {
        vec![&mut self.attn]
    }

    fn load_params(&mut self) -> Result<()> {
        load_all(self.quantized_layers_mut())?;
        self.residency = Residency::Resident;
        Ok(())
    }

    fn release_params(&mut self) {
        self.quantized_layers_mut()
            .into_iter()
            .for_each(QLinear::release);
        self.residency = Residency::Released;
    }

    fn residency(&self) -> Residency {
        self.residency
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::flux::rope::FluxRotary;
    use candle::Device;
    use candle_nn::VarMap;

    const DIM: usize = 64;
    const HEADS: usize = 2;
    const HEAD_DIM: usize = 32;
    const AXES: [usize; 3] = [8, 12, 12];

    fn joint(context_pre_only: bool) -> Result<JointTransformerBlock> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        JointTransformerBlock::new(DIM, HEADS, HEAD_DIM, 4, context_pre_only, Precision::Int4, vb)
    }

    fn single() -> Result<SingleTransformerBlock> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        SingleTransformerBlock::new(DIM, HEADS, HEAD_DIM, 4, Precision::Int4, vb)
    }

    struct Inputs {
        img: Tensor,
        txt: Tensor,
        temb: Tensor,
        rotary: FluxRotary,
    }

    fn inputs(b: usize, h: usize, w: usize, txt_tokens: usize) -> Result<Inputs> {
        let dev = Device::Cpu;
        Ok(Inputs {
            img: Tensor::randn(0f32, 1., (b, h * w, DIM), &dev)?,
            txt: Tensor::randn(0f32, 1., (b, txt_tokens, DIM), &dev)?,
            temb: Tensor::randn(0f32, 1., (b, DIM), &dev)?,
            rotary: FluxRotary::new(txt_tokens, h, w, &AXES, 10_000., &dev)?,
        })
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        Ok((a - b)?.abs()?.max_all()?.to_scalar::<f32>()?)
    }

    /// Max deviation relative to the magnitude of `reference`.
    fn rel_diff(reference: &Tensor, b: &Tensor) -> Result<f32> {
        let scale = reference.abs()?.max_all()?.to_scalar::<f32>()?;
        Ok(max_diff(reference, b)? / scale.max(1e-6))
    }

    #[test]
    fn context_pre_only_keeps_text_untouched() -> Result<()> {
        let mut block = joint(true)?;
        let x = inputs(1, 4, 4, 8)?;
        let (img, txt) =
            block.forward(&x.img, &x.txt, &x.temb, &x.rotary.img, &x.rotary.context)?;
        assert_eq!(img.dims(), x.img.dims());
        assert_eq!(max_diff(&txt, &x.txt)?, 0.);
        assert_ne!(max_diff(&img, &x.img)?, 0.);
        Ok(())
    }

    #[test]
    fn joint_block_batches_independently() -> Result<()> {
        let mut block = joint(false)?;
        let x = inputs(2, 4, 4, 8)?;
        let (img, txt) =
            block.forward(&x.img, &x.txt, &x.temb, &x.rotary.img, &x.rotary.context)?;
        assert_eq!(txt.dims(), x.txt.dims());
        let (img0, txt0) = block.forward(
            &x.img.narrow(0, 1, 1)?,
            &x.txt.narrow(0, 1, 1)?,
            &x.temb.narrow(0, 1, 1)?,
            &x.rotary.img,
            &x.rotary.context,
        )?;
        assert!(max_diff(&img.narrow(0, 1, 1)?, &img0)? < 1e-4);
        assert!(max_diff(&txt.narrow(0, 1, 1)?, &txt0)? < 1e-4);
        Ok(())
    }

    #[test]
    fn zero_sparsity_joint_matches_dense() -> Result<()> {
        let mut block = joint(false)?;
        let x = inputs(1, 8, 16, POOL_SIZE)?;
        let dense = block.forward(&x.img, &x.txt, &x.temb, &x.rotary.img, &x.rotary.context)?;
        block.attn.set_implementation(AttentionImpl::BlockSparse { sparsity_ratio: 0.0 });
        let sparse = block.forward(&x.img, &x.txt, &x.temb, &x.rotary.img, &x.rotary.context)?;
        assert_eq!(max_diff(&dense.0, &sparse.0)?, 0.);
        assert_eq!(max_diff(&dense.1, &sparse.1)?, 0.);

        block.attn.set_implementation(AttentionImpl::BlockSparse { sparsity_ratio: 0.5 });
        let (img, _) = block.forward(&x.img, &x.txt, &x.temb, &x.rotary.img, &x.rotary.context)?;
        assert_eq!(img.dims(), x.img.dims());
        assert_eq!(block.attn.seqlens_rebuilds(), 1);
        Ok(())
    }

    #[test]
    fn fp16_joint_tracks_dense() -> Result<()> {
        let mut block = joint(false)?;
        let x = inputs(1, 3, 5, 7)?;
        let dense = block.forward(&x.img, &x.txt, &x.temb, &x.rotary.img, &x.rotary.context)?;
        block.attn.set_implementation(AttentionImpl::NunchakuFp16);
        let half = block.forward(&x.img, &x.txt, &x.temb, &x.rotary.img, &x.rotary.context)?;
        assert!(rel_diff(&dense.0, &half.0)? < 2e-2);
        assert!(rel_diff(&dense.1, &half.1)? < 2e-2);
        Ok(())
    }

    #[test]
    fn single_block_fp16_needs_batch_one() -> Result<()> {
        let mut block = single()?;
        let x = inputs(2, 2, 2, 4)?;
        let merged = Tensor::cat(&[&x.txt, &x.img], 1)?;
        let out = block.forward(&merged, &x.temb, &x.rotary.single)?;
        assert_eq!(out.dims(), merged.dims());

        block.attn.set_implementation(AttentionImpl::NunchakuFp16);
        let err = block
            .forward(&merged, &x.temb, &x.rotary.single)
            .unwrap_err();
        assert!(err.is_precondition());
        let first = block.forward(
            &merged.narrow(0, 0, 1)?,
            &x.temb.narrow(0, 0, 1)?,
            &x.rotary.single,
        )?;
        assert!(rel_diff(&out.narrow(0, 0, 1)?, &first)? < 2e-2);
        Ok(())
    }

    #[test]
    fn released_block_refuses_compute() -> Result<()> {
        let mut block = single()?;
        let x = inputs(1, 2, 2, 4)?;
        let merged = Tensor::cat(&[&x.txt, &x.img], 1)?;
        let before = block.forward(&merged, &x.temb, &x.rotary.single)?;
        block.release_params();
        assert_eq!(block.residency(), Residency::Released);
        let err = block.forward(&merged, &x.temb, &x.rotary.single).unwrap_err();
        assert!(err.is_precondition());
        block.load_params()?;
        let after = block.forward(&merged, &x.temb, &x.rotary.single)?;
        assert_eq!(max_diff(&before, &after)?, 0.);
        Ok(())
    }
}
