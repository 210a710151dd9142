//! Configuration module for codec settings.

mod codec_config;

pub use codec_config::{CodecConfig, NonFinitePolicy};
