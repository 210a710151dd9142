//! Codec configuration structures.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// How encode treats NaN and infinite input values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NonFinitePolicy {
    /// Let non-finite values flow through the arithmetic; the affected block
    /// (and, with double quantization, every scale) decodes as non-finite
    #[default]
    Propagate,
    /// Fail encode with `Nf4Error::NonFiniteInput`
    Reject,
}

/// Codec configuration, usually loaded from a JSON file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Number of elements sharing one absmax scale
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Number of block scales sharing one correction factor.
    /// `None` stores full-precision scales.
    #[serde(default = "default_scaler_block_size")]
    pub scaler_block_size: Option<usize>,

    /// Spread block work across the rayon thread pool
    #[serde(default = "default_parallel")]
    pub parallel: bool,

    /// Handling of NaN/Inf inputs
    #[serde(default)]
    pub non_finite: NonFinitePolicy,
}

fn default_block_size() -> usize {
    64
}

fn default_scaler_block_size() -> Option<usize> {
    Some(256)
}

fn default_parallel() -> bool {
    true
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            scaler_block_size: default_scaler_block_size(),
            parallel: default_parallel(),
            non_finite: NonFinitePolicy::default(),
        }
    }
}

impl CodecConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CodecConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Single quantization only: one f32 scale per block
    pub fn single(block_size: usize) -> Self {
        Self {
            block_size,
            scaler_block_size: None,
            ..Default::default()
        }
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_scaler_block_size(mut self, scaler_block_size: Option<usize>) -> Self {
        self.scaler_block_size = scaler_block_size;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_non_finite(mut self, policy: NonFinitePolicy) -> Self {
        self.non_finite = policy;
        self
    }

    /// Whether block scales are double-quantized
    pub fn double_quant(&self) -> bool {
        self.scaler_block_size.is_some()
    }

    /// Check settings that do not depend on the tensor being encoded
    pub fn validate(&self) -> crate::Result<()> {
        if self.block_size == 0 || self.block_size % 2 != 0 {
            return Err(crate::Nf4Error::Config(format!(
                "block_size must be positive and even, got {}",
                self.block_size
            )));
        }
        if self.scaler_block_size == Some(0) {
            return Err(crate::Nf4Error::Config(
                "scaler_block_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
