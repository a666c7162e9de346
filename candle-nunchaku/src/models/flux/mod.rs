//! Quantized Flux transformer core with layer offload.
//!
//! ```text
//! image tokens ──┐                      ┌── merged (text, image) ──┐
//!                ├─ 19 joint blocks ────┤                          ├─ 38 single blocks ─→ out
//! text tokens  ──┘   (joint attention)  └─ concat, text first ─────┘
//! ```
//!
//! Every block runs its linear layers as GGML 4-bit or 8-bit quantized
//! matmuls. With offload enabled, only the first block stays resident and the
//! others are streamed in one layer ahead of their compute.
//!
//! # Usage
//!
//! ```ignore
//! use candle_nunchaku::context::ExecutionContext;
//! use candle_nunchaku::models::flux::{Config, FluxInputs, FluxModel, InferenceConfig};
//!
//! let inference = InferenceConfig { offload: true, ..Default::default() };
//! let mut model = FluxModel::new(&Config::flux_1_dev(), &inference, vb)?;
//! let mut ctx = ExecutionContext::host();
//! let inputs = FluxInputs::new(&img, &txt, &temb, &rot.img, &rot.context, &rot.single);
//! let out = model.forward(&mut ctx, &inputs, false)?;
//! ```

pub mod attention;
pub mod blocks;
pub mod cache;
pub mod config;
pub mod model;
pub mod norm;
pub mod rope;

pub use attention::{Attention, AttentionImpl, AttentionOutput};
pub use blocks::{JointTransformerBlock, Residency, SingleTransformerBlock, TransformerBlock};
pub use cache::FirstBlockCache;
pub use config::{Config, InferenceConfig};
pub use model::{controlnet_block_index, FluxInputs, FluxModel};
pub use rope::FluxRotary;
