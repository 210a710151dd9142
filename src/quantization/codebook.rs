//! The NF4 codebook.
//!
//! NF4 is an information-theoretically optimal data type for normally distributed
//! weights: each of its 16 levels is a quantile of N(0, 1), rescaled into [-1, 1].
//!
//! Reference: QLoRA paper (https://arxiv.org/abs/2305.14314)

/// The 16 NF4 quantization levels (normalized to [-1, 1])
pub const NF4_CODEBOOK: [f32; 16] = [
    -1.0,
    -0.6961928009986877,
    -0.5250730514526367,
    -0.39491748809814453,
    -0.28444138169288635,
    -0.18477343022823334,
    -0.09105003625154495,
    0.0,
    0.07958029955625534,
    0.16093020141124725,
    0.24611230194568634,
    0.33791524171829224,
    0.44070982933044434,
    0.5626170039176941,
    0.7229568362236023,
    1.0,
];

/// Index of the exact 0.0 codepoint
pub const ZERO_INDEX: u8 = 7;

/// Upper probability of the quantile grids used to derive the codebook
const QUANTILE_OFFSET: f64 = 0.9677083;

/// The literal codebook
pub fn values() -> &'static [f32; 16] {
    &NF4_CODEBOOK
}

pub fn zero_index() -> u8 {
    ZERO_INDEX
}

/// Recompute the codebook from normal quantiles.
///
/// Eight quantiles of `linspace(offset, 0.5, 9)` (last dropped) form the positive
/// half, seven negated quantiles of `linspace(offset, 0.5, 8)` (last dropped) form
/// the negative half, and an explicit zero sits between them.
pub fn build_analytic() -> [f32; 16] {
    let mut levels: Vec<f64> = Vec::with_capacity(16);
    levels.extend(linspace(QUANTILE_OFFSET, 0.5, 9)[..8].iter().map(|&p| inverse_normal_cdf(p)));
    levels.extend(linspace(QUANTILE_OFFSET, 0.5, 8)[..7].iter().map(|&p| -inverse_normal_cdf(p)));
    levels.push(0.0);
    levels.sort_by(f64::total_cmp);

    let max = levels.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut codebook = [0.0f32; 16];
    for (slot, level) in codebook.iter_mut().zip(&levels) {
        *slot = (level / max) as f32;
    }
    codebook
}

fn linspace(start: f64, end: f64, steps: usize) -> Vec<f64> {
    let step = (end - start) / (steps - 1) as f64;
    (0..steps).map(|i| start + step * i as f64).collect()
}

/// Standard normal quantile function.
///
/// Acklam's rational approximation, relative error below 1.2e-9.
pub fn inverse_normal_cdf(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969683028665376e1,
        2.209460984245205e2,
        -2.759285104469687e2,
        1.383577518672690e2,
        -3.066479806614716e1,
        2.506628277459239,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e1,
        1.615858368580409e2,
        -1.556989798598866e2,
        6.680131188771972e1,
        -1.328068155288572e1,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-3,
        -3.223964580411365e-1,
        -2.400758277161838,
        -2.549732539343734,
        4.374664141464968,
        2.938163982698783,
    ];
    const D: [f64; 4] = [
        7.784695709041462e-3,
        3.224671290700398e-1,
        2.445134137142996,
        3.754408661907416,
    ];
    const P_LOW: f64 = 0.02425;

    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }

    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    }
}
