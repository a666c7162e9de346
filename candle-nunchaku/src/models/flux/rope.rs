//! Rotary position embeddings for Flux.
//!
//! Every position axis gets its own frequency band, the bands are
//! concatenated along the channel-pair axis and each channel pair is rotated
//! by a 2×2 matrix `[[cos, -sin], [sin, cos]]`. The resulting tensors have the
//! `[tokens, head_dim / 2, 2, 2]` layout consumed by the QKV projections.

use candle::{DType, Device, Tensor, D};

use crate::error::{OpContext, Result};
use crate::precondition;

fn rope(pos: &Tensor, dim: usize, theta: f32) -> candle::Result<Tensor> {
    if dim % 2 == 1 {
        candle::bail!("rope: axis dimension {dim} is odd")
    }
    let dev = pos.device();
    let t = pos.dim(0)?;
    let inv_freq: Vec<f32> = (0..dim)
        .step_by(2)
        .map(|i| 1f32 / theta.powf(i as f32 / dim as f32))
        .collect();
    let inv_freq = Tensor::new(inv_freq.as_slice(), dev)?.unsqueeze(0)?;
    let freqs = pos.unsqueeze(1)?.broadcast_mul(&inv_freq)?;
    let cos = freqs.cos()?;
    let sin = freqs.sin()?;
    Tensor::stack(&[&cos, &sin.neg()?, &sin, &cos], D::Minus1)?.reshape((t, dim / 2, 2, 2))
}

/// Rotary tensor `[T, sum(axes_dim) / 2, 2, 2]` for position ids `[T, n_axes]`.
pub fn rotary_embedding(ids: &Tensor, axes_dim: &[usize], theta: f32) -> Result<Tensor> {
    let (_, n_axes) = ids.dims2().op("rotary_embedding")?;
    precondition!(
        n_axes == axes_dim.len(),
        "rotary_embedding: {n_axes} position axes but {} axis dims",
        axes_dim.len()
    );
    let build = || -> candle::Result<Tensor> {
        let ids = ids.to_dtype(DType::F32)?;
        let bands = axes_dim
            .iter()
            .enumerate()
            .map(|(i, &dim)| rope(&ids.get_on_dim(1, i)?, dim, theta))
            .collect::<candle::Result<Vec<_>>>()?;
        Tensor::cat(&bands, 1)
    };
    build().op("rotary_embedding")
}

/// Text ids are all zero; image ids are `(0, row, col)` on a `height × width` grid.
pub fn position_ids(
    txt_tokens: usize,
    height: usize,
    width: usize,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let txt = Tensor::zeros((txt_tokens, 3), DType::F32, device).op("position_ids")?;
    let img: Vec<f32> = (0..height)
        .flat_map(|r| (0..width).flat_map(move |c| [0., r as f32, c as f32]))
        .collect();
    let img = Tensor::from_vec(img, (height * width, 3), device).op("position_ids")?;
    Ok((txt, img))
}

/// The three rotary tensors one forward pass consumes.
#[derive(Debug, Clone)]
pub struct FluxRotary {
    pub img: Tensor,
    pub context: Tensor,
    /// Merged text-then-image sequence, used by the single blocks.
    pub single: Tensor,
}

impl FluxRotary {
    pub fn new(
        txt_tokens: usize,
        height: usize,
        width: usize,
        axes_dim: &[usize],
        theta: f32,
        device: &Device,
    ) -> Result<Self> {
        let (txt_ids, img_ids) = position_ids(txt_tokens, height, width, device)?;
        let img = rotary_embedding(&img_ids, axes_dim, theta)?;
        let context = rotary_embedding(&txt_ids, axes_dim, theta)?;
        let single = Tensor::cat(&[&context, &img], 0).op("rotary_embedding")?;
        Ok(Self {
            img,
            context,
            single,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_and_rotation() -> Result<()> {
        let dev = Device::Cpu;
        let rot = FluxRotary::new(2, 2, 3, &[4, 6, 6], 10_000., &dev)?;
        assert_eq!(rot.img.dims(), &[6, 8, 2, 2]);
        assert_eq!(rot.context.dims(), &[2, 8, 2, 2]);
        assert_eq!(rot.single.dims(), &[8, 8, 2, 2]);

        // Position zero is the identity rotation.
        let first = rot.context.get(0)?.to_vec3::<f32>()?;
        for pair in first {
            assert_eq!(pair, [[1., -0.], [0., 1.]]);
        }
        // Every 2x2 block is a rotation: determinant one.
        let m = rot.img.flatten_to(1)?.to_vec3::<f32>()?;
        for block in m {
            let det = block[0][0] * block[1][1] - block[0][1] * block[1][0];
            assert!((det - 1.).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn axis_count_must_match() -> Result<()> {
        let ids = Tensor::zeros((4, 2), DType::F32, &Device::Cpu)?;
        assert!(rotary_embedding(&ids, &[4, 4, 4], 10_000.)
            .unwrap_err()
            .is_precondition());
        Ok(())
    }
}
