//! Low-discrepancy sample generation and hemisphere importance sampling.
//!
//! All samplers return tangent-space vectors where +Z is the surface normal;
//! use [`TangentFrame`] to bring them into world space.

use std::f32::consts::TAU;

use cgmath::{InnerSpace, Vector2, Vector3};

use crate::cube::safe_normalize;

/// Lower bound applied to roughness before GGX sampling. Zero roughness would
/// collapse the distribution into a delta.
pub const MIN_ROUGHNESS: f32 = 1e-3;

/// Van der Corput radical inverse in base 2 via 32-bit bit reversal.
pub fn radical_inverse_base2(bits: u32) -> f32 {
    let mut bits = bits.rotate_right(16);
    bits = ((bits & 0x00FF00FF) << 8) | ((bits & 0xFF00FF00) >> 8);
    bits = ((bits & 0x0F0F0F0F) << 4) | ((bits & 0xF0F0F0F0) >> 4);
    bits = ((bits & 0x33333333) << 2) | ((bits & 0xCCCCCCCC) >> 2);
    bits = ((bits & 0x55555555) << 1) | ((bits & 0xAAAAAAAA) >> 1);
    // 2^-32
    (bits as f64 * 2.328_306_436_538_696_3e-10) as f32
}

/// Point `i` of an `n`-point Hammersley set.
pub fn hammersley(i: u32, n: u32) -> Vector2<f32> {
    Vector2::new(i as f32 / n as f32, radical_inverse_base2(i))
}

/// Samples a GGX half-vector around +Z.
///
/// `alpha = roughness²`, with roughness clamped to `[MIN_ROUGHNESS, 1]`.
pub fn importance_sample_ggx(xi: Vector2<f32>, roughness: f32) -> Vector3<f32> {
    let roughness = roughness.clamp(MIN_ROUGHNESS, 1.0);
    let alpha = roughness * roughness;

    let phi = TAU * xi.x;
    let cos_theta = ((1.0 - xi.y) / (1.0 + (alpha * alpha - 1.0) * xi.y)).sqrt();
    let sin_theta = (1.0 - cos_theta * cos_theta).max(0.0).sqrt();

    Vector3::new(phi.cos() * sin_theta, phi.sin() * sin_theta, cos_theta)
}

/// Cosine-weighted hemisphere sample around +Z (Malley's method).
pub fn cosine_sample_hemisphere(xi: Vector2<f32>) -> Vector3<f32> {
    let r = xi.x.sqrt();
    let phi = TAU * xi.y;

    let x = r * phi.cos();
    let y = r * phi.sin();
    let z = (1.0 - x * x - y * y).max(0.0).sqrt();

    Vector3::new(x, y, z)
}

/// Orthonormal basis built around a surface normal.
#[derive(Debug, Copy, Clone)]
pub struct TangentFrame {
    pub tangent: Vector3<f32>,
    pub bitangent: Vector3<f32>,
    pub normal: Vector3<f32>,
}

impl TangentFrame {
    /// Builds a frame around `normal`. Uses +Y as the reference up vector
    /// unless the normal is nearly parallel to it, in which case +X.
    pub fn new(normal: Vector3<f32>) -> Self {
        let normal = safe_normalize(normal);
        let up = if normal.y.abs() > 0.999 {
            Vector3::unit_x()
        } else {
            Vector3::unit_y()
        };
        let tangent = up.cross(normal).normalize();
        let bitangent = normal.cross(tangent);

        Self {
            tangent,
            bitangent,
            normal,
        }
    }

    /// Transforms a tangent-space vector into world space.
    pub fn to_world(&self, v: Vector3<f32>) -> Vector3<f32> {
        self.tangent * v.x + self.bitangent * v.y + self.normal * v.z
    }
}
