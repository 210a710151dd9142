//! A quantized linear-layer weight.
//!
//! Holds the NF4 artifact and decodes it whenever a dense view is needed; use
//! sites call [`QloraWeight::to_dense`] or [`QloraWeight::linear`] explicitly.

use candle_core::{DType, Tensor};

use super::{Nf4Quantizer, QuantizedTensor, Quantizer};
use crate::config::CodecConfig;
use crate::Nf4Error;

/// Error statistics between an original tensor and its reconstruction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconstructionError {
    pub max_abs: f32,
    pub mean_abs: f32,
    pub rmse: f32,
}

impl ReconstructionError {
    /// Compare two tensors of equal shape element-wise in f32
    pub fn between(original: &Tensor, restored: &Tensor) -> crate::Result<Self> {
        if original.dims() != restored.dims() {
            return Err(Nf4Error::Shape(format!(
                "cannot compare {:?} with {:?}",
                original.dims(),
                restored.dims()
            )));
        }
        let a: Vec<f32> = original.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
        let b: Vec<f32> = restored.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
        Ok(Self::from_slices(&a, &b))
    }

    pub fn from_slices(original: &[f32], restored: &[f32]) -> Self {
        let n = original.len().max(1) as f64;
        let (mut max_abs, mut sum_abs, mut sum_sq) = (0.0f32, 0.0f64, 0.0f64);
        for (o, r) in original.iter().zip(restored) {
            let diff = (o - r).abs();
            // NaN must survive; `f32::max` would drop it
            max_abs = if max_abs.is_nan() || diff.is_nan() { f32::NAN } else { max_abs.max(diff) };
            sum_abs += diff as f64;
            sum_sq += (diff as f64) * (diff as f64);
        }
        Self {
            max_abs,
            mean_abs: (sum_abs / n) as f32,
            rmse: (sum_sq / n).sqrt() as f32,
        }
    }
}

/// NF4-quantized weight
#[derive(Debug, Clone)]
pub struct QloraWeight {
    artifact: QuantizedTensor,
    quantizer: Nf4Quantizer,
}

impl QloraWeight {
    /// Quantize a dense weight
    pub fn from_tensor(weight: &Tensor, config: &CodecConfig) -> crate::Result<Self> {
        let quantizer = Nf4Quantizer::with_config(config.clone());
        let artifact = quantizer.quantize(weight)?;
        Ok(Self {
            artifact,
            quantizer,
        })
    }

    /// Wrap an existing artifact, e.g. one loaded from disk
    pub fn from_artifact(artifact: QuantizedTensor) -> crate::Result<Self> {
        artifact.validate()?;
        let config = CodecConfig::default().with_block_size(artifact.block_size);
        Ok(Self {
            artifact,
            quantizer: Nf4Quantizer::with_config(config),
        })
    }

    pub fn artifact(&self) -> &QuantizedTensor {
        &self.artifact
    }

    pub fn into_artifact(self) -> QuantizedTensor {
        self.artifact
    }

    pub fn shape(&self) -> &[usize] {
        &self.artifact.shape
    }

    pub fn dtype(&self) -> DType {
        self.artifact.dtype
    }

    pub fn compression_ratio(&self) -> f32 {
        self.artifact.compression_ratio()
    }

    /// Decode to a dense tensor in the original shape and dtype
    pub fn to_dense(&self) -> crate::Result<Tensor> {
        self.quantizer.dequantize(&self.artifact)
    }

    /// `input · weightᵀ` for a `[out_features, in_features]` weight
    pub fn linear(&self, input: &Tensor) -> crate::Result<Tensor> {
        if self.artifact.shape.len() != 2 {
            return Err(Nf4Error::Shape(format!(
                "linear needs a 2-D weight, got {:?}",
                self.artifact.shape
            )));
        }
        let weight = self
            .to_dense()?
            .to_device(input.device())?
            .to_dtype(input.dtype())?;
        input.broadcast_matmul(&weight.t()?).map_err(Into::into)
    }

    /// Error introduced by quantizing `original` into this weight
    pub fn reconstruction_error(&self, original: &Tensor) -> crate::Result<ReconstructionError> {
        ReconstructionError::between(original, &self.to_dense()?)
    }
}
