//! Seeded noise source for preview sampling
//!
//! PCG32 (XSH-RR variant). The stream is fully determined by the seed, so
//! the same seed always yields the same tensors on every platform.

use candle_core::{Device, Result, Shape, Tensor};

const MULTIPLIER: u64 = 6364136223846793005;

/// Stream selector used when only a seed is given
pub const DEFAULT_STREAM: u64 = 0xda3e_39cb_94b9_5bdb;

pub struct Pcg32 {
    state: u64,
    inc: u64,
}

impl Pcg32 {
    pub fn new(seed: u64, stream: u64) -> Self {
        let mut rng = Self {
            state: 0,
            inc: (stream << 1) | 1,
        };
        rng.step();
        rng.state = rng.state.wrapping_add(seed);
        rng.step();
        rng
    }

    pub fn from_seed(seed: u64) -> Self {
        Self::new(seed, DEFAULT_STREAM)
    }

    fn step(&mut self) -> u64 {
        let old = self.state;
        self.state = old.wrapping_mul(MULTIPLIER).wrapping_add(self.inc);
        old
    }

    pub fn next_u32(&mut self) -> u32 {
        let old = self.step();
        let xorshifted = (((old >> 18) ^ old) >> 27) as u32;
        xorshifted.rotate_right((old >> 59) as u32)
    }

    /// Uniform in [0, 1) with 24 bits of precision
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 * (1.0 / (1u32 << 24) as f32)
    }

    /// Pair of standard normal samples (Box-Muller)
    pub fn next_gaussian(&mut self) -> (f32, f32) {
        let mut u1 = self.next_f32();
        while u1 <= 1e-7 {
            u1 = self.next_f32();
        }
        let u2 = self.next_f32();

        let radius = (-2.0 * u1.ln()).sqrt();
        let (sin, cos) = (std::f32::consts::TAU * u2).sin_cos();
        (radius * cos, radius * sin)
    }

    /// Tensor of standard normal noise
    pub fn randn(&mut self, shape: impl Into<Shape>, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let count = shape.elem_count();
        let mut data = Vec::with_capacity(count + 1);
        while data.len() < count {
            let (z0, z1) = self.next_gaussian();
            data.push(z0);
            data.push(z1);
        }
        data.truncate(count);
        Tensor::from_vec(data, shape, device)
    }
}
