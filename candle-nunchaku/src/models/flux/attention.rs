//! Attention dispatch.
//!
//! One [`AttentionImpl`] is active per model. The dispatcher accepts either a
//! packed `[B, T, 3 * H * Dh]` QKV (dense and block-sparse) or padded f16
//! q/k/v (reduced precision) and always returns an [`AttentionOutput`] that
//! knows where each stream's tokens sit, so joint blocks can split it.

use std::fmt;
use std::str::FromStr;

use candle::{DType, Tensor};
use serde::Deserialize;

use crate::error::{Error, OpContext, Result};
use crate::kernels::{self, Segment, FP16_TILE, POOL_SIZE};
use crate::precondition;

/// Sparsity used by the bare `block-sparse` selector.
pub const DEFAULT_SPARSITY_RATIO: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum AttentionImpl {
    /// Dense bidirectional attention.
    #[default]
    FlashAttention2,
    /// Block-sparse attention driven by pooled 128-token block scores.
    BlockSparse { sparsity_ratio: f32 },
    /// f16 attention over sequences padded to 256 tokens.
    NunchakuFp16,
}

impl FromStr for AttentionImpl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "flashattn2" => Ok(Self::FlashAttention2),
            "nunchaku-fp16" => Ok(Self::NunchakuFp16),
            "block-sparse" => Ok(Self::BlockSparse {
                sparsity_ratio: DEFAULT_SPARSITY_RATIO,
            }),
            other => {
                let ratio = other
                    .strip_prefix("block-sparse=")
                    .and_then(|r| r.parse::<f32>().ok())
                    .filter(|r| (0.0..1.0).contains(r));
                match ratio {
                    Some(sparsity_ratio) => Ok(Self::BlockSparse { sparsity_ratio }),
                    None => Err(Error::unsupported(format!("attention implementation {other:?}"))),
                }
            }
        }
    }
}

impl TryFrom<String> for AttentionImpl {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl fmt::Display for AttentionImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FlashAttention2 => write!(f, "flashattn2"),
            Self::NunchakuFp16 => write!(f, "nunchaku-fp16"),
            Self::BlockSparse { sparsity_ratio } => write!(f, "block-sparse={sparsity_ratio}"),
        }
    }
}

/// `[B, T_seq, H * Dh]` attention output plus the token segment of every
/// stream that went into it.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    hidden: Tensor,
    segments: Vec<Segment>,
}

impl AttentionOutput {
    pub fn hidden(&self) -> &Tensor {
        &self.hidden
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Tokens of stream `idx`, `[B, len, H * Dh]`.
    ///
    /// A single batch item is narrowed in place; larger batches get a
    /// contiguous copy of the strided slice.
    pub fn segment(&self, idx: usize) -> Result<Tensor> {
        let Some(seg) = self.segments.get(idx) else {
            return Err(Error::precondition(format!(
                "attention output has {} segments, asked for {idx}",
                self.segments.len()
            )));
        };
        let (b, t, _) = self.hidden.dims3().op("attention.split")?;
        if seg.offset == 0 && seg.len == t {
            return Ok(self.hidden.clone());
        }
        let part = self
            .hidden
            .narrow(1, seg.offset, seg.len)
            .op("attention.split")?;
        if b == 1 {
            Ok(part)
        } else {
            part.contiguous().op("attention.split")
        }
    }
}

#[derive(Debug, Clone)]
struct CuSeqlens {
    num_tokens: usize,
    offsets: Vec<u32>,
}

#[derive(Debug)]
pub struct Attention {
    num_heads: usize,
    head_dim: usize,
    implementation: AttentionImpl,
    force_fp16: bool,
    cu_seqlens: Option<CuSeqlens>,
    seqlens_rebuilds: usize,
    span: tracing::Span,
}

impl Attention {
    pub fn new(num_heads: usize, head_dim: usize) -> Self {
        Self {
            num_heads,
            head_dim,
            implementation: AttentionImpl::default(),
            force_fp16: false,
            cu_seqlens: None,
            seqlens_rebuilds: 0,
            span: tracing::span!(tracing::Level::TRACE, "attention"),
        }
    }

    pub fn implementation(&self) -> AttentionImpl {
        self.implementation
    }

    pub fn set_implementation(&mut self, implementation: AttentionImpl) {
        self.implementation = implementation;
    }

    /// Whether block-sparse attention runs on f16 copies of its inputs.
    pub fn force_fp16(&self) -> bool {
        self.force_fp16
    }

    pub fn set_force_fp16(&mut self, force_fp16: bool) {
        self.force_fp16 = force_fp16;
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// How many times the cu-seqlens table was rebuilt.
    pub fn seqlens_rebuilds(&self) -> usize {
        self.seqlens_rebuilds
    }

    fn scale(&self) -> f64 {
        1. / (self.head_dim as f64).sqrt()
    }

    fn check_packed(&self, qkv: &Tensor) -> Result<(usize, usize)> {
        let (b, t, width) = qkv.dims3().op("attention")?;
        precondition!(
            width == 3 * self.num_heads * self.head_dim,
            "attention: qkv width {width} != 3 * {} heads * {} head_dim",
            self.num_heads,
            self.head_dim
        );
        Ok((b, t))
    }

    fn cu_seqlens(&mut self, batch_size: usize, num_tokens: usize) -> Vec<u32> {
        let stale = match &self.cu_seqlens {
            Some(c) => c.offsets.len() != batch_size + 1 || c.num_tokens != num_tokens,
            None => true,
        };
        if stale {
            tracing::debug!(batch_size, num_tokens, "rebuilding cu_seqlens");
            let offsets = (0..=batch_size).map(|i| (i * num_tokens) as u32).collect();
            self.cu_seqlens = Some(CuSeqlens {
                num_tokens,
                offsets,
            });
            self.seqlens_rebuilds += 1;
        }
        self.cu_seqlens
            .as_ref()
            .map(|c| c.offsets.clone())
            .unwrap_or_default()
    }

    /// Dense attention on packed QKV; returns `[B * T, H, Dh]`.
    pub fn forward(&self, qkv: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (b, t) = self.check_packed(qkv)?;
        let (h, d) = (self.num_heads, self.head_dim);
        let qkv = qkv.reshape((b, t, 3 * h, d)).op("attention")?;
        let q = qkv.narrow(2, 0, h).op("attention")?;
        let k = qkv.narrow(2, h, h).op("attention")?;
        let v = qkv.narrow(2, 2 * h, h).op("attention")?;
        kernels::mha_fwd(&q, &k, &v, self.scale())
    }

    /// Block-sparse attention on packed QKV; returns `[B * T, H, Dh]`.
    ///
    /// Runs dense when `sparsity_ratio <= 0` or when no pooled QKV is given.
    /// With `force_fp16` set, non-f16 inputs are cast to f16 for the kernel and
    /// the output is cast back to the input dtype.
    pub fn forward_sparse(
        &mut self,
        qkv: &Tensor,
        pool_qkv: Option<&Tensor>,
        sparsity_ratio: f32,
    ) -> Result<Tensor> {
        let span = self.span.clone();
        let _enter = span.enter();
        let dtype = qkv.dtype();
        if !self.force_fp16 || dtype == DType::F16 {
            return self.sparse_or_dense(qkv, pool_qkv, sparsity_ratio);
        }
        let half = kernels::cast(qkv, DType::F16)?;
        let out = self.sparse_or_dense(&half, pool_qkv, sparsity_ratio)?;
        kernels::cast(&out, dtype)
    }

    fn sparse_or_dense(
        &mut self,
        qkv: &Tensor,
        pool_qkv: Option<&Tensor>,
        sparsity_ratio: f32,
    ) -> Result<Tensor> {
        let Some(pool_qkv) = pool_qkv.filter(|_| sparsity_ratio > 0.0) else {
            return self.forward(qkv);
        };
        let (b, t) = self.check_packed(qkv)?;
        let (h, d) = (self.num_heads, self.head_dim);
        let pool_tokens = kernels::ceil_div(t, POOL_SIZE);
        precondition!(
            pool_qkv.dims() == [b, pool_tokens, 3 * h * d],
            "attention: pooled qkv {:?} does not match [{b}, {pool_tokens}, {}]",
            pool_qkv.dims(),
            3 * h * d
        );

        let scores = || -> candle::Result<Tensor> {
            let pool = pool_qkv
                .to_dtype(DType::F32)?
                .reshape((b, pool_tokens, 3, h, d))?;
            let pool_q = pool.get_on_dim(2, 0)?.transpose(1, 2)?.contiguous()?;
            let pool_k = pool.get_on_dim(2, 1)?.transpose(1, 2)?.contiguous()?;
            pool_q.matmul(&pool_k.t()?)
        };
        let scores = scores().op("pool_score")?;
        let keep = kernels::sparse_keep_blocks(pool_tokens, sparsity_ratio);
        let blockmask = kernels::topk_blockmask(&scores, keep)?;
        tracing::trace!(pool_tokens, keep, "block-sparse attention");

        let offsets = self.cu_seqlens(b, t);
        let flat = qkv.reshape((b * t, 3 * h, d)).op("attention")?;
        let q = flat.narrow(1, 0, h).op("attention")?;
        let k = flat.narrow(1, h, h).op("attention")?;
        let v = flat.narrow(1, 2 * h, h).op("attention")?;
        kernels::mha_fwd_block(&q, &k, &v, &offsets, POOL_SIZE, &blockmask, self.scale())
    }

    /// Reduced-precision attention on padded f16 `[B, H, T_pad, Dh]` q/k/v.
    pub fn forward_fp16(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        valid: &[Segment],
        out_dtype: DType,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (_, h, _, d) = q.dims4().op("attention")?;
        precondition!(
            h == self.num_heads && d == self.head_dim,
            "attention: fp16 q has {h} heads of {d}, expected {} of {}",
            self.num_heads,
            self.head_dim
        );
        kernels::attention_fp16(q, k, v, valid, out_dtype, self.scale())
    }

    /// Runs the packed path selected by the active implementation.
    ///
    /// `segments` lists the token range of every stream concatenated into `qkv`.
    pub fn dispatch_packed(
        &mut self,
        qkv: &Tensor,
        pool_qkv: Option<&Tensor>,
        segments: Vec<Segment>,
    ) -> Result<AttentionOutput> {
        let (b, t) = self.check_packed(qkv)?;
        let out = match self.implementation {
            AttentionImpl::BlockSparse { sparsity_ratio } => {
                self.forward_sparse(qkv, pool_qkv, sparsity_ratio)?
            }
            AttentionImpl::FlashAttention2 | AttentionImpl::NunchakuFp16 => self.forward(qkv)?,
        };
        let hidden = out
            .reshape((b, t, self.num_heads * self.head_dim))
            .op("attention")?;
        Ok(AttentionOutput { hidden, segments })
    }

    /// Runs the reduced-precision path; `segments` are offsets into the padded sequence.
    pub fn dispatch_padded(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        segments: Vec<Segment>,
        out_dtype: DType,
    ) -> Result<AttentionOutput> {
        let (_, _, t_pad, _) = q.dims4().op("attention")?;
        precondition!(
            t_pad % FP16_TILE == 0,
            "attention: padded length {t_pad} is not a multiple of {FP16_TILE}"
        );
        let hidden = self.forward_fp16(q, k, v, &segments, out_dtype)?;
        Ok(AttentionOutput { hidden, segments })
    }
}
