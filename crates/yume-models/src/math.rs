//! Dense helpers shared by the artifact forward passes

use rand::Rng;

/// `out[r] = bias[r] + sum_c weights[r * cols + c] * input[c]`
pub(crate) fn affine(weights: &[f32], bias: &[f32], input: &[f32]) -> Vec<f32> {
    let cols = input.len();
    bias.iter()
        .enumerate()
        .map(|(row, b)| {
            let start = row * cols;
            weights[start..start + cols]
                .iter()
                .zip(input)
                .fold(*b, |acc, (w, x)| acc + w * x)
        })
        .collect()
}

/// Accumulate `weights * input` into an existing output
pub(crate) fn add_matvec(out: &mut [f32], weights: &[f32], input: &[f32]) {
    let cols = input.len();
    for (row, value) in out.iter_mut().enumerate() {
        let start = row * cols;
        *value += weights[start..start + cols]
            .iter()
            .zip(input)
            .map(|(w, x)| w * x)
            .sum::<f32>();
    }
}

pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Uniform Glorot-style initialization
pub(crate) fn glorot(rng: &mut impl Rng, fan_in: usize, fan_out: usize, count: usize) -> Vec<f32> {
    let limit = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
    (0..count).map(|_| rng.gen_range(-limit..limit)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affine() {
        // 2x3 matrix
        let w = [1.0, 0.0, 2.0, 0.0, 1.0, -1.0];
        let b = [0.5, -0.5];
        let out = affine(&w, &b, &[1.0, 2.0, 3.0]);
        assert_eq!(out, vec![7.5, -1.5]);
    }

    #[test]
    fn test_add_matvec() {
        let mut out = vec![1.0, 1.0];
        add_matvec(&mut out, &[1.0, 1.0, 2.0, 0.0], &[3.0, 4.0]);
        assert_eq!(out, vec![8.0, 7.0]);
    }

    #[test]
    fn test_sigmoid_midpoint() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
    }
}
