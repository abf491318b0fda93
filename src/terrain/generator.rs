//! Noise-based procedural height field generation

use noise::{Fbm, MultiFractal, NoiseFn, Perlin};
use serde::{Deserialize, Serialize};

use crate::core::types::Result;
use crate::math::Size;
use super::heightfield::{HeightField, MAX_HEIGHT};

/// Parameters controlling height field synthesis
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseParams {
    pub seed: u32,
    pub scale: f32,        // Samples per noise period (larger = smoother)
    pub amplitude: f32,    // Fraction of the sample range used, 0..=1
    pub octaves: u32,      // FBM octaves (detail levels)
    pub persistence: f32,  // FBM persistence (0.5 typical)
    pub lacunarity: f32,   // FBM lacunarity (2.0 typical)
}

impl Default for NoiseParams {
    fn default() -> Self {
        Self {
            seed: 12345,
            scale: 96.0,
            amplitude: 0.8,
            octaves: 5,
            persistence: 0.5,
            lacunarity: 2.0,
        }
    }
}

/// Height field generator using fractal Brownian motion (FBM)
pub struct HeightFieldGenerator {
    params: NoiseParams,
    noise: Fbm<Perlin>,
}

impl HeightFieldGenerator {
    pub fn new(params: NoiseParams) -> Self {
        let noise = Fbm::<Perlin>::new(params.seed)
            .set_octaves(params.octaves as usize)
            .set_persistence(params.persistence as f64)
            .set_lacunarity(params.lacunarity as f64);

        Self { params, noise }
    }

    pub fn params(&self) -> &NoiseParams {
        &self.params
    }

    /// Raw sample value at a (fractional) grid position
    pub fn sample_at(&self, x: f32, y: f32) -> i16 {
        let nx = (x / self.params.scale) as f64;
        let ny = (y / self.params.scale) as f64;

        // Noise is roughly in [-1, 1]
        let value = self.noise.get([nx, ny]).clamp(-1.0, 1.0);
        (value * self.params.amplitude.clamp(0.0, 1.0) as f64 * MAX_HEIGHT as f64) as i16
    }

    /// Fill a height field of the given size
    pub fn generate(&self, size: Size) -> Result<HeightField> {
        let mut samples = Vec::with_capacity(size.area());
        for y in 0..size.height {
            for x in 0..size.width {
                samples.push(self.sample_at(x as f32, y as f32));
            }
        }
        log::debug!("Generated {}x{} height field (seed {})", size.width, size.height, self.params.seed);
        HeightField::from_samples(size, samples)
    }
}
