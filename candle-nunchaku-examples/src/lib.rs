//! Shared helpers for the candle-nunchaku example binaries.

use anyhow::Result;
use candle::utils::{cuda_is_available, metal_is_available};
use candle::{Device, Tensor};
use rand::prelude::*;
use tracing_chrome::ChromeLayerBuilder;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Picks the first accelerator available unless `cpu` is set.
pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            println!(
                "Running on CPU, to run on GPU(metal), build this example with `--features metal`"
            );
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            println!("Running on CPU, to run on GPU, build this example with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}

/// Chrome tracing when `chrome` is set, otherwise a fmt subscriber honoring
/// `RUST_LOG`.
///
/// Keep the returned guard alive until the trace should be flushed.
pub fn setup_tracing(chrome: bool) -> Option<tracing_chrome::FlushGuard> {
    if chrome {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();
        None
    }
}

/// Seeded tensor with values in [-0.5, 0.5].
pub fn random_tensor(rng: &mut StdRng, shape: &[usize], device: &Device) -> Result<Tensor> {
    let elem_count: usize = shape.iter().product();
    let data: Vec<f32> = (0..elem_count).map(|_| rng.random::<f32>() - 0.5).collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}
