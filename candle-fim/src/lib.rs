pub mod batcher;
pub mod dataset;
pub mod error;
pub mod family;
pub mod generation;
pub mod hub;
pub mod lora;
pub mod model;
pub mod pipeline;
pub mod prompt;
pub mod writer;

pub use error::{Error, Result};

use candle::Device;

/// Picks the first accelerator compiled in, unless `cpu` is set.
pub fn device(cpu: bool) -> candle::Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle::utils::cuda_is_available() {
        Device::new_cuda(0)
    } else if candle::utils::metal_is_available() {
        Device::new_metal(0)
    } else {
        tracing::warn!("running on CPU, build with `--features cuda` or `--features metal` to use a GPU");
        Ok(Device::Cpu)
    }
}
