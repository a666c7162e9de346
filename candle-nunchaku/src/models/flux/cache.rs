//! First-block residual cache across denoising steps.
//!
//! Consecutive denoising steps often change the transformer's input very
//! little. The cache runs only the first layer, compares its residual with
//! the one from the last fully computed step and, when they are close
//! enough, reuses the residual the remaining layers produced back then.

use candle::Tensor;

use crate::context::ExecutionContext;
use crate::error::{OpContext, Result};

use super::model::{FluxInputs, FluxModel};

pub const DEFAULT_RESIDUAL_DIFF_THRESHOLD: f32 = 0.12;

/// `mean|prev - cur| / mean|prev| < threshold`
pub fn are_similar(prev: &Tensor, cur: &Tensor, threshold: f32) -> Result<bool> {
    let measure = || -> candle::Result<(f32, f32)> {
        let diff = (prev - cur)?.abs()?.mean_all()?.to_dtype(candle::DType::F32)?;
        let norm = prev.abs()?.mean_all()?.to_dtype(candle::DType::F32)?;
        Ok((diff.to_scalar::<f32>()?, norm.to_scalar::<f32>()?))
    };
    let (diff, norm) = measure().op("first_block_cache")?;
    if norm == 0. {
        return Ok(false);
    }
    Ok(diff / norm < threshold)
}

#[derive(Debug)]
pub struct FirstBlockCache {
    residual_diff_threshold: f32,
    first_residual: Option<Tensor>,
    remaining_residual: Option<Tensor>,
    hits: usize,
    misses: usize,
}

impl Default for FirstBlockCache {
    fn default() -> Self {
        Self::new(DEFAULT_RESIDUAL_DIFF_THRESHOLD)
    }
}

impl FirstBlockCache {
    pub fn new(residual_diff_threshold: f32) -> Self {
        Self {
            residual_diff_threshold,
            first_residual: None,
            remaining_residual: None,
            hits: 0,
            misses: 0,
        }
    }

    pub fn residual_diff_threshold(&self) -> f32 {
        self.residual_diff_threshold
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn misses(&self) -> usize {
        self.misses
    }

    /// Forgets cached residuals, e.g. between two generations.
    pub fn reset(&mut self) {
        self.first_residual = None;
        self.remaining_residual = None;
    }

    /// Same contract as [`FluxModel::forward`] without `skip_first_layer`.
    pub fn forward(
        &mut self,
        model: &mut FluxModel,
        ctx: &mut ExecutionContext,
        inputs: &FluxInputs,
    ) -> Result<Tensor> {
        let (hidden, encoder) = model.forward_layer(ctx, 0, inputs)?;
        let first_residual = (&hidden - inputs.hidden_states).op("first_block_cache")?;
        let merged = model.num_single_layers() > 0;

        if let (Some(prev), Some(remaining)) = (&self.first_residual, &self.remaining_residual) {
            if are_similar(prev, &first_residual, self.residual_diff_threshold)? {
                self.hits += 1;
                tracing::debug!(hits = self.hits, "first block cache hit");
                let base = if merged {
                    Tensor::cat(&[&encoder, &hidden], 1).op("first_block_cache")?
                } else {
                    hidden
                };
                return (base + remaining).op("first_block_cache");
            }
        }

        self.misses += 1;
        let rest = inputs.with_streams(&hidden, &encoder);
        let out = model.forward(ctx, &rest, true)?;
        let base = if merged {
            Tensor::cat(&[&encoder, &hidden], 1).op("first_block_cache")?
        } else {
            hidden.clone()
        };
        self.remaining_residual = Some((&out - base).op("first_block_cache")?);
        self.first_residual = Some(first_residual);
        Ok(out)
    }
}
