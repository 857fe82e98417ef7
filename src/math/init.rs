use rand::prelude::*;
use rand::rngs::StdRng;
use std::f32::consts::PI;

/// Deterministic generator for a construction seed.
pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Samples a single value from N(0, 1) using the Box-Muller transform.
pub fn sample_standard_normal<R: Rng>(rng: &mut R) -> f32 {
    // Both uniforms in (0, 1] to avoid log(0).
    let u1: f32 = 1.0 - rng.gen::<f32>();
    let u2: f32 = 1.0 - rng.gen::<f32>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

/// `len` samples from N(mean, std_dev).
pub fn normal<R: Rng>(rng: &mut R, len: usize, mean: f32, std_dev: f32) -> Vec<f32> {
    (0..len).map(|_| mean + sample_standard_normal(rng) * std_dev).collect()
}

/// He initialization: N(0, sqrt(2 / fan_in)). Recommended before ReLU.
pub fn he<R: Rng>(rng: &mut R, len: usize, fan_in: usize) -> Vec<f32> {
    normal(rng, len, 0.0, (2.0 / fan_in.max(1) as f32).sqrt())
}

/// Xavier (Glorot) initialization: N(0, sqrt(1 / fan_in)).
pub fn xavier<R: Rng>(rng: &mut R, len: usize, fan_in: usize) -> Vec<f32> {
    normal(rng, len, 0.0, (1.0 / fan_in.max(1) as f32).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_weights() {
        let a = he(&mut seeded_rng(7), 16, 4);
        let b = he(&mut seeded_rng(7), 16, 4);
        assert_eq!(a, b);
        assert_ne!(a, he(&mut seeded_rng(8), 16, 4));
    }

    #[test]
    fn test_normal_moments() {
        let v = normal(&mut seeded_rng(1), 20000, 0.5, 2.0);
        let mean = v.iter().sum::<f32>() / v.len() as f32;
        let var = v.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / v.len() as f32;
        assert!((mean - 0.5).abs() < 0.1, "mean {mean}");
        assert!((var.sqrt() - 2.0).abs() < 0.1, "std {}", var.sqrt());
    }
}
