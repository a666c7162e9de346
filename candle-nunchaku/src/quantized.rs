//! Quantized linear layers with explicit residency.
//!
//! A [`QLinear`] keeps a host-staged GGML tensor for its weight. Every GGML
//! block stores its own scale next to the packed values, so weight and scale
//! form a single residency unit: [`QLinear::load`] materialises the device
//! copy of both, [`QLinear::release`] drops both.
//!
//! The fused epilogues used by the transformer blocks live here as well:
//! - `forward_qkv` normalizes Q/K per head, applies the rotary rotation and
//!   optionally emits the pooled QKV needed by block-sparse attention,
//! - `forward_qkv_padded` writes f16 `[B, H, T_pad, Dh]` q/k/v for the
//!   reduced-precision attention path,
//! - `forward_gelu_quant` / `forward_quant` chain the two MLP layers through
//!   a quantized activation.

use std::sync::Arc;

use candle::quantized::{ggml_file::qtensor_from_ggml, GgmlDType, QMatMul, QTensor};
use candle::{DType, Device, Module, Tensor};
use candle_nn::{Init, RmsNorm, VarBuilder};
use serde::Deserialize;

use crate::error::{Error, OpContext, Result};
use crate::kernels::{apply_rotary, POOL_SIZE};
use crate::precondition;

/// Weight precision of the quantized linear layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Int4,
    Int8,
}

impl Precision {
    pub fn ggml_dtype(self) -> GgmlDType {
        match self {
            Self::Int4 => GgmlDType::Q4_0,
            Self::Int8 => GgmlDType::Q8_0,
        }
    }
}

/// MLP activation handed from the first to the second layer in quantized form.
#[derive(Debug)]
pub struct QuantizedActivation {
    data: QTensor,
    dims: Vec<usize>,
    dtype: DType,
}

impl QuantizedActivation {
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }
}

/// Packed `[B, T, 3 * H * Dh]` QKV and, when requested, its
/// `[B, T / 128, 3 * H * Dh]` pooled summary.
#[derive(Debug, Clone)]
pub struct PackedQkv {
    pub qkv: Tensor,
    pub pool: Option<Tensor>,
}

#[derive(Debug)]
struct Resident {
    weight: QMatMul,
    bias: Option<Tensor>,
}

#[derive(Debug)]
pub struct QLinear {
    in_features: usize,
    out_features: usize,
    staged: Arc<QTensor>,
    staged_bias: Option<Tensor>,
    device: Device,
    resident: Option<Resident>,
    span: tracing::Span,
}

impl QLinear {
    /// Quantizes a float `[out, in]` weight and makes the layer resident on `device`.
    pub fn new(
        weight: &Tensor,
        bias: Option<&Tensor>,
        precision: Precision,
        device: &Device,
    ) -> Result<Self> {
        let (out_features, in_features) = weight.dims2().op("qlinear.new")?;
        let dtype = precision.ggml_dtype();
        precondition!(
            in_features % dtype.block_size() == 0,
            "qlinear: {in_features} input features are not a multiple of the {dtype:?} block size {}",
            dtype.block_size()
        );
        let host = weight
            .to_device(&Device::Cpu)
            .and_then(|w| w.to_dtype(DType::F32))
            .op("qlinear.new")?;
        let staged = QTensor::quantize(&host, dtype).op("quantize")?;
        let staged_bias = bias
            .map(|b| {
                precondition!(
                    b.dims() == [out_features],
                    "qlinear: bias shape {:?} does not match {out_features} outputs",
                    b.dims()
                );
                b.to_device(&Device::Cpu)
                    .and_then(|b| b.to_dtype(DType::F32))
                    .op("qlinear.new")
            })
            .transpose()?;
        let mut layer = Self {
            in_features,
            out_features,
            staged: Arc::new(staged),
            staged_bias,
            device: device.clone(),
            resident: None,
            span: tracing::span!(tracing::Level::TRACE, "qlinear"),
        };
        layer.load()?;
        Ok(layer)
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn is_resident(&self) -> bool {
        self.resident.is_some()
    }

    /// Materialises the device copy. Loading a resident layer is a no-op.
    pub fn load(&mut self) -> Result<()> {
        if self.resident.is_some() {
            return Ok(());
        }
        let qtensor = if self.device.is_cpu() {
            self.staged.clone()
        } else {
            let data = self.staged.data().op("qlinear.load")?;
            let dims = self.staged.shape().dims().to_vec();
            let qtensor = qtensor_from_ggml(self.staged.dtype(), &data, dims, &self.device)
                .op("qlinear.load")?;
            Arc::new(qtensor)
        };
        let weight = QMatMul::from_arc(qtensor).op("qlinear.load")?;
        let bias = self
            .staged_bias
            .as_ref()
            .map(|b| b.to_device(&self.device))
            .transpose()
            .op("qlinear.load")?;
        self.resident = Some(Resident { weight, bias });
        Ok(())
    }

    /// Drops the device copy of weight, scales and bias together.
    pub fn release(&mut self) {
        self.resident = None;
    }

    fn resident(&self) -> Result<&Resident> {
        self.resident.as_ref().ok_or_else(|| {
            Error::precondition(format!(
                "quantized linear {}x{} used while released",
                self.out_features, self.in_features
            ))
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let resident = self.resident()?;
        precondition!(
            x.dims().last() == Some(&self.in_features),
            "qlinear: expected {} input features, got {:?}",
            self.in_features,
            x.dims()
        );
        let dtype = x.dtype();
        let run = || -> candle::Result<Tensor> {
            let out = x
                .to_dtype(DType::F32)?
                .contiguous()?
                .apply(&resident.weight)?;
            let out = match &resident.bias {
                Some(bias) => out.broadcast_add(bias)?,
                None => out,
            };
            out.to_dtype(dtype)
        };
        run().op("qlinear.forward")
    }

    /// First MLP layer: projection, GELU and activation quantization.
    pub fn forward_gelu_quant(&self, x: &Tensor) -> Result<QuantizedActivation> {
        let hidden = self.forward(x)?;
        let dims = hidden.dims().to_vec();
        let dtype = hidden.dtype();
        let data = hidden
            .gelu()
            .and_then(|h| h.to_dtype(DType::F32))
            .and_then(|h| h.flatten_to(dims.len().saturating_sub(2)))
            .and_then(|h| QTensor::quantize(&h, GgmlDType::Q8_0))
            .op("quantize")?;
        Ok(QuantizedActivation { data, dims, dtype })
    }

    /// Second MLP layer consuming a quantized activation.
    pub fn forward_quant(&self, act: &QuantizedActivation) -> Result<Tensor> {
        let x = act
            .data
            .dequantize(&self.device)
            .and_then(|x| x.reshape(act.dims.as_slice()))
            .and_then(|x| x.to_dtype(act.dtype))
            .op("dequantize")?;
        self.forward(&x)
    }

    fn split_heads(&self, x: &Tensor, num_heads: usize, head_dim: usize) -> Result<(usize, usize)> {
        let (b, t, _) = x.dims3().op("qlinear.qkv")?;
        precondition!(
            3 * num_heads * head_dim == self.out_features,
            "qkv projection width {} is not 3 * {num_heads} heads * {head_dim}",
            self.out_features
        );
        Ok((b, t))
    }

    /// Normalized, rotated q/k/v, each `[B, T, H, Dh]`.
    fn project_qkv(
        &self,
        x: &Tensor,
        norm_q: &RmsNorm,
        norm_k: &RmsNorm,
        rotary: &Tensor,
        num_heads: usize,
        head_dim: usize,
    ) -> Result<[Tensor; 3]> {
        let (b, t) = self.split_heads(x, num_heads, head_dim)?;
        let qkv = self
            .forward(x)?
            .reshape((b, t, 3, num_heads, head_dim))
            .op("qlinear.qkv")?;
        let part = |i: usize| qkv.get_on_dim(2, i).and_then(|p| p.contiguous());
        let q = part(0).and_then(|q| norm_q.forward(&q)).op("qlinear.qkv")?;
        let k = part(1).and_then(|k| norm_k.forward(&k)).op("qlinear.qkv")?;
        let v = part(2).op("qlinear.qkv")?;
        Ok([apply_rotary(&q, rotary)?, apply_rotary(&k, rotary)?, v])
    }

    pub fn forward_qkv(
        &self,
        x: &Tensor,
        norm_q: &RmsNorm,
        norm_k: &RmsNorm,
        rotary: &Tensor,
        num_heads: usize,
        head_dim: usize,
        emit_pool: bool,
    ) -> Result<PackedQkv> {
        let (b, t) = self.split_heads(x, num_heads, head_dim)?;
        let [q, k, v] = self.project_qkv(x, norm_q, norm_k, rotary, num_heads, head_dim)?;
        let qkv = Tensor::stack(&[q, k, v], 2)
            .and_then(|p| p.reshape((b, t, self.out_features)))
            .op("qlinear.qkv")?;
        let pool = if emit_pool {
            precondition!(
                t % POOL_SIZE == 0,
                "pooled qkv needs a multiple of {POOL_SIZE} tokens, got {t}"
            );
            let pool = qkv
                .reshape((b, t / POOL_SIZE, POOL_SIZE, self.out_features))
                .and_then(|p| p.mean(2))
                .op("qlinear.qkv")?;
            Some(pool)
        } else {
            None
        };
        Ok(PackedQkv { qkv, pool })
    }

    /// f16 q/k/v, each `[B, H, tokens_pad, Dh]`, zero beyond the real tokens.
    pub fn forward_qkv_padded(
        &self,
        x: &Tensor,
        norm_q: &RmsNorm,
        norm_k: &RmsNorm,
        rotary: &Tensor,
        num_heads: usize,
        head_dim: usize,
        tokens_pad: usize,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let (_, t) = self.split_heads(x, num_heads, head_dim)?;
        precondition!(
            tokens_pad >= t,
            "cannot pad {t} tokens down to {tokens_pad}"
        );
        let [q, k, v] = self.project_qkv(x, norm_q, norm_k, rotary, num_heads, head_dim)?;
        let pad = |x: Tensor| -> candle::Result<Tensor> {
            x.transpose(1, 2)?
                .pad_with_zeros(2, 0, tokens_pad - t)?
                .to_dtype(DType::F16)?
                .contiguous()
        };
        Ok((
            pad(q).op("qlinear.qkv_padded")?,
            pad(k).op("qlinear.qkv_padded")?,
            pad(v).op("qlinear.qkv_padded")?,
        ))
    }
}

/// Builds a quantized linear layer from `vb`, in the layout of `candle_nn::linear`.
pub fn qlinear(
    in_dim: usize,
    out_dim: usize,
    precision: Precision,
    vb: VarBuilder,
) -> Result<QLinear> {
    let bound = 1. / (in_dim as f64).sqrt();
    let weight = vb
        .get_with_hints((out_dim, in_dim), "weight", candle_nn::init::DEFAULT_KAIMING_NORMAL)
        .op("qlinear.new")?;
    let bias = vb
        .get_with_hints(out_dim, "bias", Init::Uniform { lo: -bound, up: bound })
        .op("qlinear.new")?;
    QLinear::new(&weight, Some(&bias), precision, vb.device())
}

/// Per-head RMS norm over the last axis, as used for Q/K.
pub fn rms_norm(head_dim: usize, eps: f64, vb: VarBuilder) -> Result<RmsNorm> {
    let weight = vb
        .get_with_hints(head_dim, "weight", Init::Const(1.))
        .op("rms_norm")?;
    Ok(RmsNorm::new(weight, eps))
}
