//! Fixed-signature kernels consumed by the blocks and the attention dispatcher.
//!
//! These are reference implementations written with candle tensor ops. Each
//! one checks its shape contract up front and tags device failures with its
//! own name, so a failing call reports e.g. `mha_fwd_block failed: ...`.

use candle::{DType, Device, Tensor, D};

use crate::error::{Error, OpContext, Result};
use crate::precondition;

/// Token granularity of the pooled QKV used for block-sparse attention.
pub const POOL_SIZE: usize = 128;

/// Sequence padding granularity of the fp16 attention path.
pub const FP16_TILE: usize = 256;

pub fn ceil_div(a: usize, b: usize) -> usize {
    a.div_ceil(b)
}

pub fn round_up(a: usize, b: usize) -> usize {
    ceil_div(a, b) * b
}

/// `x * scale + shift`, with `scale` and `shift` broadcast over the token axis.
pub fn mul_add(x: &Tensor, scale: &Tensor, shift: &Tensor) -> Result<Tensor> {
    x.broadcast_mul(scale)
        .and_then(|t| t.broadcast_add(shift))
        .op("mul_add")
}

/// Elementwise sum of two tensors of identical shape.
pub fn add(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    precondition!(
        a.dims() == b.dims(),
        "add: shape mismatch {:?} vs {:?}",
        a.dims(),
        b.dims()
    );
    (a + b).op("add")
}

pub fn cast(x: &Tensor, dtype: DType) -> Result<Tensor> {
    x.to_dtype(dtype).op("cast")
}

/// Splits a `[B, K * D]` modulation embedding into `K` equal contiguous chunks,
/// each shaped `[B, 1, D]` so they broadcast over tokens.
pub fn split_mod<const K: usize>(emb: &Tensor) -> Result<[Tensor; K]> {
    let (_, width) = emb.dims2().op("split_mod")?;
    precondition!(
        width % K == 0,
        "split_mod: width {width} is not divisible into {K} chunks"
    );
    let dim = width / K;
    let chunks = (0..K)
        .map(|i| emb.narrow(1, i * dim, dim)?.unsqueeze(1))
        .collect::<candle::Result<Vec<Tensor>>>()
        .op("split_mod")?;
    chunks
        .try_into()
        .map_err(|_: Vec<Tensor>| Error::precondition("split_mod: chunk count mismatch"))
}

/// Number of key blocks kept per query block for a given sparsity ratio.
pub fn sparse_keep_blocks(pool_tokens: usize, sparsity_ratio: f32) -> usize {
    let keep = (pool_tokens as f64 * (1.0 - sparsity_ratio as f64)).floor();
    (keep.max(0.0) as usize).clamp(1, pool_tokens.max(1))
}

/// Keeps the `k` highest-scoring key blocks of every query block.
///
/// `scores` is `[B, H, P, P]`; the result is a `u8` mask of the same shape.
/// Ties go to the lower key-block index.
pub fn topk_blockmask(scores: &Tensor, k: usize) -> Result<Tensor> {
    let (b, h, p, p_k) = scores.dims4().op("topk_blockmask")?;
    precondition!(p == p_k, "topk_blockmask: scores must be square, got {p}x{p_k}");
    precondition!(
        (1..=p).contains(&k),
        "topk_blockmask: k = {k} outside 1..={p}"
    );
    let rows = scores
        .to_dtype(DType::F32)
        .and_then(|s| s.flatten_to(2))
        .and_then(|s| s.to_vec2::<f32>())
        .op("topk_blockmask")?;
    let mut mask = vec![0u8; b * h * p * p];
    let mut order: Vec<usize> = Vec::with_capacity(p);
    for (r, row) in rows.iter().enumerate() {
        order.clear();
        order.extend(0..p);
        // sort_by is stable, equal scores keep ascending index order
        order.sort_by(|&x, &y| row[y].total_cmp(&row[x]));
        for &col in &order[..k] {
            mask[r * p + col] = 1;
        }
    }
    Tensor::from_vec(mask, (b, h, p, p), scores.device()).op("topk_blockmask")
}

/// Rotates channel pairs of `x: [B, T, H, Dh]` with `rotary: [T, Dh/2, 2, 2]`.
pub fn apply_rotary(x: &Tensor, rotary: &Tensor) -> Result<Tensor> {
    let (b, t, h, d) = x.dims4().op("apply_rotary")?;
    precondition!(
        rotary.dims() == [t, d / 2, 2, 2],
        "apply_rotary: expected rotary [{t}, {}, 2, 2], got {:?}",
        d / 2,
        rotary.dims()
    );
    let rotate = || -> candle::Result<Tensor> {
        let x = x.reshape((b, t, h, d / 2, 1, 2))?;
        let rot = rotary
            .to_dtype(x.dtype())?
            .reshape((1, t, 1, d / 2, 2, 2))?;
        let x0 = x.get_on_dim(D::Minus1, 0)?;
        let x1 = x.get_on_dim(D::Minus1, 1)?;
        let r0 = rot.get_on_dim(D::Minus1, 0)?;
        let r1 = rot.get_on_dim(D::Minus1, 1)?;
        let out = (r0.broadcast_mul(&x0)? + r1.broadcast_mul(&x1)?)?;
        out.reshape((b, t, h, d))
    };
    rotate().op("apply_rotary")
}

/// Softmax attention over the last two axes, optionally masked.
///
/// `mask` holds 1 for visible logits and broadcasts to the logits shape.
fn softmax_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    scale: f64,
    mask: Option<&Tensor>,
) -> candle::Result<Tensor> {
    let logits = (q.matmul(&k.t()?)? * scale)?;
    let logits = match mask {
        Some(mask) => {
            let hidden = Tensor::full(f32::NEG_INFINITY, logits.dims(), logits.device())?
                .to_dtype(logits.dtype())?;
            mask.broadcast_as(logits.dims())?
                .where_cond(&logits, &hidden)?
        }
        None => logits,
    };
    candle_nn::ops::softmax_last_dim(&logits)?.matmul(v)
}

/// Dense bidirectional attention.
///
/// `q`, `k`, `v` are `[B, T, H, Dh]`; the output is `[B * T, H, Dh]`.
pub fn mha_fwd(q: &Tensor, k: &Tensor, v: &Tensor, scale: f64) -> Result<Tensor> {
    let (b, t, h, d) = q.dims4().op("mha_fwd")?;
    precondition!(
        k.dims() == q.dims() && v.dims() == q.dims(),
        "mha_fwd: q/k/v shapes differ: {:?} {:?} {:?}",
        q.dims(),
        k.dims(),
        v.dims()
    );
    let run = || -> candle::Result<Tensor> {
        let q = q.transpose(1, 2)?.contiguous()?;
        let k = k.transpose(1, 2)?.contiguous()?;
        let v = v.transpose(1, 2)?.contiguous()?;
        let o = softmax_attention(&q, &k, &v, scale, None)?;
        o.transpose(1, 2)?.reshape((b * t, h, d))
    };
    run().op("mha_fwd")
}

/// Expands a `[H, P, P]` block mask to a `[H, len, len]` token mask.
fn expand_blockmask(mask: &Tensor, block_size: usize, len: usize) -> candle::Result<Tensor> {
    let (h, p, _) = mask.dims3()?;
    mask.reshape((h, p, 1, p, 1))?
        .broadcast_as((h, p, block_size, p, block_size))?
        .reshape((h, p * block_size, p * block_size))?
        .narrow(1, 0, len)?
        .narrow(2, 0, len)
}

/// Block-sparse varlen attention.
///
/// `q`, `k`, `v` are flattened `[total_tokens, H, Dh]` and `cu_seqlens` holds
/// the `B + 1` sequence offsets. `blockmask` is `[B, H, P, P]` over
/// `block_size` token tiles; masked-out tiles contribute nothing.
pub fn mha_fwd_block(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    cu_seqlens: &[u32],
    block_size: usize,
    blockmask: &Tensor,
    scale: f64,
) -> Result<Tensor> {
    let (total, _, _) = q.dims3().op("mha_fwd_block")?;
    precondition!(
        k.dims() == q.dims() && v.dims() == q.dims(),
        "mha_fwd_block: q/k/v shapes differ"
    );
    precondition!(
        cu_seqlens.len() >= 2 && cu_seqlens.last().copied() == Some(total as u32),
        "mha_fwd_block: cu_seqlens {cu_seqlens:?} does not cover {total} tokens"
    );
    let (batch, _, p, _) = blockmask.dims4().op("mha_fwd_block")?;
    precondition!(
        batch == cu_seqlens.len() - 1,
        "mha_fwd_block: blockmask batch {batch} vs {} sequences",
        cu_seqlens.len() - 1
    );
    let run = || -> candle::Result<Tensor> {
        let mut outs = Vec::with_capacity(batch);
        for (idx, w) in cu_seqlens.windows(2).enumerate() {
            let (start, len) = (w[0] as usize, (w[1] - w[0]) as usize);
            if ceil_div(len, block_size) != p {
                candle::bail!("sequence {idx} of {len} tokens does not span {p} blocks")
            }
            let slice = |x: &Tensor| -> candle::Result<Tensor> {
                x.narrow(0, start, len)?.transpose(0, 1)?.contiguous()
            };
            let mask = expand_blockmask(&blockmask.get(idx)?, block_size, len)?;
            let o = softmax_attention(&slice(q)?, &slice(k)?, &slice(v)?, scale, Some(&mask))?;
            outs.push(o.transpose(0, 1)?);
        }
        Tensor::cat(&outs, 0)
    };
    run().op("mha_fwd_block")
}

/// A run of valid tokens inside a padded or concatenated attention sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub offset: usize,
    pub len: usize,
}

impl Segment {
    pub fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }
}

fn key_mask(valid: &[Segment], tokens: usize, device: &Device) -> candle::Result<Tensor> {
    let mut mask = vec![0u8; tokens];
    for seg in valid {
        mask[seg.offset..seg.offset + seg.len].fill(1);
    }
    Tensor::from_vec(mask, (1, 1, 1, tokens), device)
}

/// Reduced-precision attention on padded sequences.
///
/// `q`, `k`, `v` are f16 `[B, H, T_pad, Dh]`. Keys outside `valid` are
/// excluded from the softmax. The output is `[B, T_pad, H * Dh]` in
/// `out_dtype`; rows at padded positions carry no meaning.
pub fn attention_fp16(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    valid: &[Segment],
    out_dtype: DType,
    scale: f64,
) -> Result<Tensor> {
    let (b, h, t, d) = q.dims4().op("attention_fp16")?;
    precondition!(
        [q, k, v].iter().all(|x| x.dtype() == DType::F16),
        "attention_fp16: q/k/v must be f16"
    );
    precondition!(
        k.dims() == q.dims() && v.dims() == q.dims(),
        "attention_fp16: q/k/v shapes differ"
    );
    precondition!(
        t % FP16_TILE == 0,
        "attention_fp16: sequence length {t} is not padded to {FP16_TILE}"
    );
    precondition!(
        valid.iter().all(|s| s.offset + s.len <= t) && valid.iter().any(|s| s.len > 0),
        "attention_fp16: invalid segments {valid:?} for {t} tokens"
    );
    let run = || -> candle::Result<Tensor> {
        let mask = key_mask(valid, t, q.device())?;
        let o = softmax_attention(q, k, v, scale, Some(&mask))?;
        o.transpose(1, 2)?.reshape((b, t, h * d))?.to_dtype(out_dtype)
    };
    run().op("attention_fp16")
}
