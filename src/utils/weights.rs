//! Reading and writing safetensors weight files.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use safetensors::SafeTensors;

/// Convert safetensor dtype to candle dtype, `None` for types the codec cannot encode
fn convert_safetensor_dtype(dtype: safetensors::Dtype) -> Option<DType> {
    match dtype {
        safetensors::Dtype::F16 => Some(DType::F16),
        safetensors::Dtype::BF16 => Some(DType::BF16),
        safetensors::Dtype::F32 => Some(DType::F32),
        safetensors::Dtype::F64 => Some(DType::F64),
        _ => None,
    }
}

/// Load every floating-point tensor of a safetensors file onto the CPU.
///
/// Tensors are returned sorted by name; non-float tensors are skipped.
pub fn load_float_tensors(path: impl AsRef<Path>) -> crate::Result<Vec<(String, Tensor)>> {
    let path = path.as_ref();
    tracing::debug!("Loading weight file: {:?}", path);

    // Memory-map the file
    let file = std::fs::File::open(path)?;
    let mmap = unsafe { memmap2::Mmap::map(&file)? };
    let safetensors = SafeTensors::deserialize(&mmap)?;

    let mut tensors = Vec::new();
    for (name, view) in safetensors.tensors() {
        let Some(dtype) = convert_safetensor_dtype(view.dtype()) else {
            tracing::warn!("Skipping {} with unsupported dtype {:?}", name, view.dtype());
            continue;
        };
        let tensor = Tensor::from_raw_buffer(view.data(), dtype, view.shape(), &Device::Cpu)?;
        tensors.push((name, tensor));
    }
    tensors.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(tensors)
}

/// Write named tensors to a safetensors file
pub fn save_tensors(tensors: &HashMap<String, Tensor>, path: impl AsRef<Path>) -> crate::Result<()> {
    candle_core::safetensors::save(tensors, path)?;
    Ok(())
}

/// File-name-safe form of a tensor name
pub fn artifact_file_name(tensor_name: &str) -> String {
    let stem: String = tensor_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' { c } else { '_' })
        .collect();
    format!("{}.nf4", stem)
}
