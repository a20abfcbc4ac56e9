//! Spherical-harmonics projection of environment radiance.
//!
//! A 9-coefficient (order 2) projection is enough to reconstruct diffuse
//! irradiance to within a few percent for typical environments.

use std::f32::consts::PI;
use std::time::Instant;

use cgmath::Vector3;

use crate::error::IblError;
use crate::ibl::{EnvironmentSource, Rgb, SourceSampler};

/// Band-limited radiance: L0, L1 (y, z, x), L2 (xy, yz, 3z²-1, xz, x²-y²).
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SphericalHarmonics {
    pub coefficients: [Rgb; 9],
}

impl Default for SphericalHarmonics {
    fn default() -> Self {
        Self {
            coefficients: [Vector3::new(0.0, 0.0, 0.0); 9],
        }
    }
}

impl SphericalHarmonics {
    /// Reconstructs radiance in direction `dir` (unit length).
    pub fn evaluate(&self, dir: Vector3<f32>) -> Rgb {
        let basis = sh_basis(dir);
        self.coefficients
            .iter()
            .zip(basis.iter())
            .fold(Vector3::new(0.0, 0.0, 0.0), |acc, (c, b)| acc + c * *b)
    }

    /// Irradiance around `normal`, in the same convention as the irradiance
    /// cubemap (cosine-convolved radiance divided by π).
    pub fn evaluate_irradiance(&self, normal: Vector3<f32>) -> Rgb {
        // Cosine-lobe convolution factors per band (Ramamoorthi & Hanrahan).
        const BAND: [f32; 3] = [PI, 2.0 * PI / 3.0, PI / 4.0];
        let basis = sh_basis(normal);

        let mut result = Vector3::new(0.0, 0.0, 0.0);
        for (i, (c, b)) in self.coefficients.iter().zip(basis.iter()).enumerate() {
            let band = match i {
                0 => BAND[0],
                1..=3 => BAND[1],
                _ => BAND[2],
            };
            result += c * (*b * band);
        }
        result / PI
    }

    /// Coefficients flattened to 27 floats (RGB per coefficient), e.g. for a uniform buffer.
    pub fn to_array(&self) -> [f32; 27] {
        let mut out = [0.0; 27];
        for (i, c) in self.coefficients.iter().enumerate() {
            out[i * 3..i * 3 + 3].copy_from_slice(&[c.x, c.y, c.z]);
        }
        out
    }
}

/// Real SH basis functions up to band 2 at `dir`.
pub fn sh_basis(dir: Vector3<f32>) -> [f32; 9] {
    let (x, y, z) = (dir.x, dir.y, dir.z);
    [
        0.282095,
        0.488603 * y,
        0.488603 * z,
        0.488603 * x,
        1.092548 * x * y,
        1.092548 * y * z,
        0.315392 * (3.0 * z * z - 1.0),
        1.092548 * x * z,
        0.546274 * (x * x - y * y),
    ]
}

/// Direction `i` of an `m`-point Fibonacci lattice on the unit sphere.
pub fn fibonacci_sphere(i: u32, m: u32) -> Vector3<f32> {
    let offset = 2.0 / m as f32;
    let increment = PI * (3.0 - 5.0f32.sqrt());

    let y = i as f32 * offset - 1.0 + offset / 2.0;
    let r = (1.0 - y * y).max(0.0).sqrt();
    let phi = i as f32 * increment;

    Vector3::new(phi.cos() * r, y, phi.sin() * r)
}

/// Projects the radiance of `source` onto 9 SH coefficients using
/// `sample_count` equal-area lattice directions.
pub fn extract_spherical_harmonics(
    source: &EnvironmentSource,
    sample_count: u32,
) -> Result<SphericalHarmonics, IblError> {
    if sample_count == 0 {
        return Err(IblError::invalid_request("SH sample_count must be positive"));
    }
    let sampler = SourceSampler::new(source)?;
    let started = Instant::now();

    let weight = 4.0 * PI / sample_count as f32;
    let mut sh = SphericalHarmonics::default();

    for i in 0..sample_count {
        let dir = fibonacci_sphere(i, sample_count);
        let radiance = sampler.sample(dir);
        for (c, b) in sh.coefficients.iter_mut().zip(sh_basis(dir)) {
            *c += radiance * (b * weight);
        }
    }

    log::debug!(
        "Projected source {} onto SH with {} samples in {:.1?}",
        source.key().id,
        sample_count,
        started.elapsed()
    );

    Ok(sh)
}
