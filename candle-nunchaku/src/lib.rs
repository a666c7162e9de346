//! Quantized diffusion-transformer inference with per-layer weight streaming.
//!
//! The crate runs the Flux transformer core with 4-bit or 8-bit quantized
//! linear layers on top of candle. Models whose weights do not fit in device
//! memory can stream their blocks in and out around compute through
//! [`offload::LayerOffloadScheduler`].
//!
//! - [`kernels`]: fused elementwise ops and reference attention kernels
//! - [`quantized`]: quantized linear layers with explicit residency
//! - [`context`]: explicit device/stream context passed through every call
//! - [`offload`]: the layer-offload scheduler
//! - [`models::flux`]: blocks, attention dispatch and the model graph

pub mod context;
pub mod error;
pub mod kernels;
pub mod models;
pub mod offload;
pub mod quantized;

pub use error::{Error, Result};
