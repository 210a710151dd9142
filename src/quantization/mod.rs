//! NF4 quantization with optional double quantization of block scales.
//!
//! Implements the QLoRA weight format:
//! - 16-level NormalFloat codebook, one absmax scale per block
//! - two 4-bit indices per byte
//! - block scales re-quantized to 8 bits per group of scales
//!
//! Two implementations share the [`Quantizer`] interface: [`Nf4Quantizer`] works on
//! whole blocks in parallel, [`ReferenceQuantizer`] walks element by element and is
//! kept to check the former against.

pub mod block;
pub mod codebook;
pub mod double_quant;
pub mod packing;
pub mod scalar;

mod nf4;
mod reference;
mod tensor;
mod weight;

pub use double_quant::DoubleQuantizedScales;
pub use nf4::Nf4Quantizer;
pub use reference::ReferenceQuantizer;
pub use tensor::{BlockScales, QuantizedTensor};
pub use weight::{QloraWeight, ReconstructionError};

use candle_core::{DType, Device, Tensor};

use crate::config::{CodecConfig, NonFinitePolicy};
use crate::utils::is_float_dtype;
use crate::Nf4Error;

/// Trait for quantization implementations
pub trait Quantizer: Send + Sync {
    /// Quantize a tensor to compressed format
    fn quantize(&self, tensor: &Tensor) -> crate::Result<QuantizedTensor>;

    /// Dequantize back to full precision
    fn dequantize(&self, quantized: &QuantizedTensor) -> crate::Result<Tensor>;
}

/// Which implementation of the codec to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Implementation {
    /// Block-parallel production codec
    #[default]
    Fast,
    /// Element-by-element reference codec
    Reference,
}

/// Create a quantizer for the given implementation
pub fn create_quantizer(implementation: Implementation, config: CodecConfig) -> Box<dyn Quantizer> {
    match implementation {
        Implementation::Fast => Box::new(Nf4Quantizer::with_config(config)),
        Implementation::Reference => Box::new(ReferenceQuantizer::with_config(config)),
    }
}

/// Flattened f32 view of an input tensor after all encode-time checks
pub(crate) struct PreparedInput {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
    pub dtype: DType,
}

/// Validate `tensor` against `config` and flatten it to f32
pub(crate) fn prepare_input(tensor: &Tensor, config: &CodecConfig) -> crate::Result<PreparedInput> {
    config.validate()?;

    let dtype = tensor.dtype();
    if !is_float_dtype(dtype) {
        return Err(Nf4Error::UnsupportedDtype(format!("{:?}", dtype)));
    }

    let shape: Vec<usize> = tensor.dims().to_vec();
    let numel = tensor.elem_count();
    if numel % config.block_size != 0 {
        return Err(Nf4Error::Shape(format!(
            "{} elements (shape {:?}) are not divisible by block size {}",
            numel, shape, config.block_size
        )));
    }

    let data: Vec<f32> = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;

    if config.non_finite == NonFinitePolicy::Reject {
        if let Some(index) = data.iter().position(|x| !x.is_finite()) {
            return Err(Nf4Error::NonFiniteInput { index });
        }
    }

    Ok(PreparedInput { data, shape, dtype })
}

/// Scale representation selected by `config`
pub(crate) fn encode_scales(scales: Vec<f32>, config: &CodecConfig) -> crate::Result<BlockScales> {
    let zero_blocks = scales.iter().filter(|&&s| s == 0.0).count();
    if zero_blocks > 0 {
        tracing::debug!("{} all-zero blocks mapped to the zero codepoint", zero_blocks);
    }

    Ok(match config.scaler_block_size {
        Some(scaler_block_size) => {
            BlockScales::DoubleQuantized(DoubleQuantizedScales::quantize(&scales, scaler_block_size)?)
        }
        None => BlockScales::Full(scales),
    })
}

/// Rebuild a tensor with the artifact's shape and dtype from decoded values
pub(crate) fn restore_tensor(values: Vec<f32>, quantized: &QuantizedTensor) -> crate::Result<Tensor> {
    let tensor = Tensor::from_vec(values, quantized.shape.as_slice(), &Device::Cpu)?;
    tensor.to_dtype(quantized.dtype).map_err(Into::into)
}
