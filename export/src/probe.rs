//! Probe waveforms used to build and trace entry points.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::signature::{WAVEFORM_DTYPE, WAVEFORM_SAMPLES};
use crate::tensor::Tensor;

/// Returns a `[16000] float32` waveform of uniform `[0, 1)` samples drawn
/// from the thread-local generator.
pub fn random_waveform() -> Tensor {
    sample_waveform(&mut rand::thread_rng())
}

/// Returns a `[16000] float32` waveform of uniform `[0, 1)` samples.
/// The same seed always yields the same samples.
pub fn uniform_waveform(seed: u64) -> Tensor {
    sample_waveform(&mut StdRng::seed_from_u64(seed))
}

/// Returns a silent `[16000] float32` waveform.
pub fn zero_waveform() -> Tensor {
    Tensor::zeros(&[WAVEFORM_SAMPLES], WAVEFORM_DTYPE)
}

fn sample_waveform<R: Rng + ?Sized>(rng: &mut R) -> Tensor {
    let samples = (0..WAVEFORM_SAMPLES).map(|_| rng.r#gen::<f32>()).collect();
    Tensor::vector(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_unit_uniform(w: &Tensor) {
        assert_eq!(w.shape(), &[16000]);
        let samples = w.as_f32().unwrap();
        assert!(samples.iter().all(|&x| (0.0..1.0).contains(&x)));
        let mean = samples.iter().sum::<f32>() / samples.len() as f32;
        assert!((mean - 0.5).abs() < 0.05, "mean = {mean}");
    }

    #[test]
    fn uniform_waveform_deterministic() {
        assert_eq!(uniform_waveform(7), uniform_waveform(7));
        assert_ne!(uniform_waveform(7), uniform_waveform(8));
    }

    #[test]
    fn uniform_waveform_range() {
        assert_unit_uniform(&uniform_waveform(42));
    }

    #[test]
    fn random_waveform_range() {
        let a = random_waveform();
        assert_unit_uniform(&a);
        assert_ne!(a, random_waveform());
    }
}
