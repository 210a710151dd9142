//! # nf4-codec
//!
//! Block-wise NF4 (4-bit NormalFloat) quantization of neural network weights,
//! as used by QLoRA for low-memory fine-tuning.
//!
//! ## Core Concept
//!
//! A weight tensor is compressed by:
//! - **Block scaling**: each run of `block_size` elements is divided by its absolute maximum
//! - **NF4 lookup**: every normalized value is mapped onto one of 16 normal-quantile codepoints
//! - **Nibble packing**: two 4-bit indices are stored per byte
//! - **Double quantization**: the per-block scales themselves are stored as 8-bit indices
//!
//! ## Example
//!
//! ```ignore
//! use nf4_codec::{CodecConfig, QloraWeight};
//! use candle_core::{Device, Tensor};
//!
//! fn main() -> nf4_codec::Result<()> {
//!     let weight = Tensor::randn(0f32, 1.0, (64, 256), &Device::Cpu)?;
//!     let qweight = QloraWeight::from_tensor(&weight, &CodecConfig::default())?;
//!     let restored = qweight.to_dense()?;
//!     println!("{:?}", qweight.reconstruction_error(&weight)?);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod quantization;
pub mod utils;

// Re-exports for convenience
pub use config::{CodecConfig, NonFinitePolicy};
pub use quantization::{
    BlockScales, DoubleQuantizedScales, Nf4Quantizer, QloraWeight, QuantizedTensor, Quantizer,
    ReconstructionError, ReferenceQuantizer,
};

/// Error types for the library
#[derive(thiserror::Error, Debug)]
pub enum Nf4Error {
    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("Non-finite input value at flat index {index}")]
    NonFiniteInput { index: usize },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),
}

pub type Result<T> = std::result::Result<T, Nf4Error>;
