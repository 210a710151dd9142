//! Utility modules for dtypes, sample weights, weight files, and size formatting.

mod dtype;
mod memory;
mod sample;
mod weights;

pub use dtype::{dtype_from_tag, dtype_tag, is_float_dtype, parse_dtype};
pub use memory::format_bytes;
pub use sample::{build_input_weight, normal_weight};
pub use weights::{artifact_file_name, load_float_tensors, save_tensors};
