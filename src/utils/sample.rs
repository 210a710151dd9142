//! Seeded standard-normal weights for tests and benchmarks.

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Tensor of N(0, 1) samples with the given shape and dtype, reproducible from `seed`
pub fn normal_weight(shape: &[usize], dtype: DType, seed: u64) -> crate::Result<Tensor> {
    let numel: usize = shape.iter().product();
    let mut rng = StdRng::seed_from_u64(seed);
    let data: Vec<f32> = (0..numel).map(|_| rng.sample(StandardNormal)).collect();
    let tensor = Tensor::from_vec(data, shape, &Device::Cpu)?;
    Ok(tensor.to_dtype(dtype)?)
}

/// Square bf16 weight of side `embed_dim`, seeded with 0
pub fn build_input_weight(embed_dim: usize) -> crate::Result<Tensor> {
    normal_weight(&[embed_dim, embed_dim], DType::BF16, 0)
}
