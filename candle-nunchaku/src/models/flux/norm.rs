//! Adaptive LayerNorm-Zero modulation.
//!
//! The conditioning embedding goes through `silu -> linear`, the projection is
//! split into equal chunks, and the affine-free LayerNorm output of `x` is
//! modulated as `x * (1 + scale) + shift`.

use candle::{DType, Device, Tensor};
use candle_nn::{LayerNorm, Module, VarBuilder};

use crate::error::{OpContext, Result};
use crate::kernels::{mul_add, split_mod};
use crate::precondition;
use crate::quantized::{qlinear, Precision, QLinear};

/// Parameter-free LayerNorm, PyTorch's `elementwise_affine=False`.
pub fn layer_norm_no_affine(size: usize, eps: f64, device: &Device, dtype: DType) -> Result<LayerNorm> {
    let weight = Tensor::ones(size, dtype, device).op("layer_norm")?;
    Ok(LayerNorm::new_no_bias(weight, eps))
}

/// Modulated input together with the untouched parameters of the later stages.
#[derive(Debug, Clone)]
pub struct FullModulation {
    pub x: Tensor,
    pub gate_msa: Tensor,
    pub shift_mlp: Tensor,
    pub scale_mlp: Tensor,
    pub gate_mlp: Tensor,
}

impl FullModulation {
    /// `x * (1 + scale_mlp) + shift_mlp`
    pub fn modulate_mlp(&self, xs: &Tensor) -> Result<Tensor> {
        modulate(xs, &self.shift_mlp, &self.scale_mlp)
    }
}

#[derive(Debug, Clone)]
pub enum ModulationOutput {
    Full(FullModulation),
    PreOnly(Tensor),
}

impl ModulationOutput {
    /// The modulated input, whatever the variant.
    pub fn x(&self) -> &Tensor {
        match self {
            Self::Full(m) => &m.x,
            Self::PreOnly(x) => x,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SingleModulationOutput {
    pub x: Tensor,
    pub gate_msa: Tensor,
}

fn modulate(x: &Tensor, shift: &Tensor, scale: &Tensor) -> Result<Tensor> {
    let scale = (scale + 1.0).op("modulate")?;
    mul_add(x, &scale, shift)
}

fn check_inputs(x: &Tensor, emb: &Tensor, dim: usize) -> Result<()> {
    let (b, _, d) = x.dims3().op("adanorm")?;
    let (b_emb, d_emb) = emb.dims2().op("adanorm")?;
    precondition!(
        d == dim && d_emb == dim,
        "adanorm: expected hidden size {dim}, got x {:?} and emb {:?}",
        x.dims(),
        emb.dims()
    );
    precondition!(b == b_emb, "adanorm: batch {b} of x vs {b_emb} of emb");
    Ok(())
}

/// AdaLN-Zero for the joint blocks, full (6-way) or pre-only (2-way).
#[derive(Debug)]
pub struct AdaLayerNormZero {
    dim: usize,
    pre_only: bool,
    linear: QLinear,
    norm: LayerNorm,
}

impl AdaLayerNormZero {
    pub fn new(dim: usize, pre_only: bool, precision: Precision, vb: VarBuilder) -> Result<Self> {
        let chunks = if pre_only { 2 } else { 6 };
        let norm = layer_norm_no_affine(dim, 1e-6, vb.device(), vb.dtype())?;
        let linear = qlinear(dim, chunks * dim, precision, vb.pp("linear"))?;
        Ok(Self {
            dim,
            pre_only,
            linear,
            norm,
        })
    }

    pub fn pre_only(&self) -> bool {
        self.pre_only
    }

    pub fn linear_mut(&mut self) -> &mut QLinear {
        &mut self.linear
    }

    pub fn forward(&self, x: &Tensor, emb: &Tensor) -> Result<ModulationOutput> {
        check_inputs(x, emb, self.dim)?;
        let emb = self.linear.forward(&emb.silu().op("adanorm")?)?;
        let normed = self.norm.forward(x).op("adanorm")?;
        if self.pre_only {
            let [shift, scale] = split_mod::<2>(&emb)?;
            return Ok(ModulationOutput::PreOnly(modulate(&normed, &shift, &scale)?));
        }
        let [shift_msa, scale_msa, gate_msa, shift_mlp, scale_mlp, gate_mlp] =
            split_mod::<6>(&emb)?;
        Ok(ModulationOutput::Full(FullModulation {
            x: modulate(&normed, &shift_msa, &scale_msa)?,
            gate_msa,
            shift_mlp,
            scale_mlp,
            gate_mlp,
        }))
    }
}

/// AdaLN-Zero for the single blocks (3-way).
#[derive(Debug)]
pub struct AdaLayerNormZeroSingle {
    dim: usize,
    linear: QLinear,
    norm: LayerNorm,
}

impl AdaLayerNormZeroSingle {
    pub fn new(dim: usize, precision: Precision, vb: VarBuilder) -> Result<Self> {
        let norm = layer_norm_no_affine(dim, 1e-6, vb.device(), vb.dtype())?;
        let linear = qlinear(dim, 3 * dim, precision, vb.pp("linear"))?;
        Ok(Self { dim, linear, norm })
    }

    pub fn linear_mut(&mut self) -> &mut QLinear {
        &mut self.linear
    }

    pub fn forward(&self, x: &Tensor, emb: &Tensor) -> Result<SingleModulationOutput> {
        check_inputs(x, emb, self.dim)?;
        let emb = self.linear.forward(&emb.silu().op("adanorm")?)?;
        let [shift_msa, scale_msa, gate_msa] = split_mod::<3>(&emb)?;
        let normed = self.norm.forward(x).op("adanorm")?;
        Ok(SingleModulationOutput {
            x: modulate(&normed, &shift_msa, &scale_msa)?,
            gate_msa,
        })
    }
}
