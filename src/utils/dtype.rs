//! Data type utilities.

use candle_core::DType;

/// Parse dtype string to candle DType
pub fn parse_dtype(dtype_str: &str) -> crate::Result<DType> {
    match dtype_str.to_lowercase().as_str() {
        "f32" | "float32" | "float" => Ok(DType::F32),
        "f16" | "float16" | "half" => Ok(DType::F16),
        "bf16" | "bfloat16" => Ok(DType::BF16),
        "f64" | "float64" | "double" => Ok(DType::F64),
        _ => Err(crate::Nf4Error::Config(format!("unknown dtype '{}'", dtype_str))),
    }
}

/// Whether the codec can encode tensors of this dtype
pub fn is_float_dtype(dtype: DType) -> bool {
    matches!(dtype, DType::F32 | DType::F16 | DType::BF16 | DType::F64)
}

/// Tag used for the dtype in serialized artifacts
pub fn dtype_tag(dtype: DType) -> u8 {
    match dtype {
        DType::F32 => 0,
        DType::F16 => 1,
        DType::BF16 => 2,
        DType::F64 => 3,
        _ => u8::MAX,
    }
}

pub fn dtype_from_tag(tag: u8) -> Option<DType> {
    match tag {
        0 => Some(DType::F32),
        1 => Some(DType::F16),
        2 => Some(DType::BF16),
        3 => Some(DType::F64),
        _ => None,
    }
}
