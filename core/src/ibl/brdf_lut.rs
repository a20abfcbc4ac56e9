//! BRDF integration lookup table generation.
//!
//! Generates a 2D LUT used in the split-sum approximation for specular IBL.
//! The LUT stores pre-integrated BRDF terms that can be looked up at runtime
//! using N·V and roughness as coordinates.

use std::time::Instant;

use cgmath::{InnerSpace, Vector3};
use ibl_bake_common::{hammersley, importance_sample_ggx, safe_normalize};
use rayon::prelude::*;

use crate::error::IblError;
use crate::ibl::SourceKey;

/// Identity used for keys of generated BRDF LUTs.
pub const BRDF_LUT_SOURCE_ID: u64 = u64::MAX;

/// Smallest N·V integrated; grazing angles are clamped here.
const MIN_N_DOT_V: f32 = 1e-4;

/// Pre-integrated `(scale, bias)` pairs of the specular BRDF.
///
/// Columns index N·V at texel centers, `(x + 0.5) / size`. Rows index roughness
/// from 0 on the first row to 1 on the last.
#[derive(Debug, Clone, PartialEq)]
pub struct BrdfLut {
    /// Identity of this LUT. Generated LUTs use [`BRDF_LUT_SOURCE_ID`] with the
    /// size and sample count folded into the version, so equal keys mean equal
    /// contents.
    pub key: SourceKey,
    pub size: u32,
    pub sample_count: u32,
    /// Row-major `(scale, bias)` pairs, `size * size` entries.
    pub data: Vec<[f32; 2]>,
}

impl BrdfLut {
    /// Replaces the generated key, e.g. to track a LUT loaded from elsewhere.
    pub fn with_key(mut self, key: SourceKey) -> Self {
        self.key = key;
        self
    }

    /// Entry at column `x` (N·V) and row `y` (roughness).
    pub fn get(&self, x: u32, y: u32) -> Option<[f32; 2]> {
        if x >= self.size || y >= self.size {
            return None;
        }
        self.data.get((y * self.size + x) as usize).copied()
    }

    /// Nearest entry for the given N·V and roughness, both clamped to `[0, 1]`.
    pub fn lookup(&self, n_dot_v: f32, roughness: f32) -> [f32; 2] {
        let last = self.size.saturating_sub(1);
        let x = ((n_dot_v.clamp(0.0, 1.0) * self.size as f32) as u32).min(last);
        let y = (roughness.clamp(0.0, 1.0) * last as f32).round() as u32;
        self.get(x, y).unwrap_or([0.0, 1.0])
    }
}

/// N·V at column `x` of a `size` wide LUT.
pub fn lut_n_dot_v(x: u32, size: u32) -> f32 {
    (x as f32 + 0.5) / size as f32
}

/// Roughness at row `y` of a `size` tall LUT.
pub fn lut_roughness(y: u32, size: u32) -> f32 {
    if size <= 1 {
        0.0
    } else {
        y as f32 / (size - 1) as f32
    }
}

/// Integrates a `size` x `size` BRDF LUT with `sample_count` GGX samples per entry.
///
/// This only needs to be done once - the LUT is independent of the environment map.
pub fn integrate_brdf_lut(size: u32, sample_count: u32) -> Result<BrdfLut, IblError> {
    if size == 0 {
        return Err(IblError::invalid_request("BRDF LUT size must be positive"));
    }
    if sample_count == 0 {
        return Err(IblError::invalid_request("BRDF LUT sample_count must be positive"));
    }

    let started = Instant::now();
    let mut data = vec![[0.0f32; 2]; (size * size) as usize];

    data.par_chunks_mut(size as usize)
        .enumerate()
        .for_each(|(y, row)| {
            let roughness = lut_roughness(y as u32, size);
            for (x, entry) in row.iter_mut().enumerate() {
                *entry = integrate_brdf(lut_n_dot_v(x as u32, size), roughness, sample_count);
            }
        });

    log::info!(
        "BRDF LUT {}x{} with {} samples in {:.1?}",
        size,
        size,
        sample_count,
        started.elapsed()
    );

    Ok(BrdfLut {
        key: SourceKey::new(BRDF_LUT_SOURCE_ID, ((size as u64) << 32) | sample_count as u64),
        size,
        sample_count,
        data,
    })
}

/// Schlick-GGX geometry term with the IBL remapping `k = roughness² / 2`.
fn geometry_schlick_ggx(n_dot_x: f32, k: f32) -> f32 {
    n_dot_x / (n_dot_x * (1.0 - k) + k)
}

/// Split-sum `(scale, bias)` for one N·V / roughness pair.
///
/// Works in tangent space, where the normal is +Z.
pub fn integrate_brdf(n_dot_v: f32, roughness: f32, sample_count: u32) -> [f32; 2] {
    let [scale, bias] = split_sum(n_dot_v, roughness, sample_count);
    [scale.clamp(0.0, 1.0), bias.clamp(0.0, 1.0)]
}

/// Monte-Carlo estimate of the split-sum terms before clamping.
fn split_sum(n_dot_v: f32, roughness: f32, sample_count: u32) -> [f32; 2] {
    let n_dot_v = n_dot_v.clamp(MIN_N_DOT_V, 1.0);
    let v = Vector3::new((1.0 - n_dot_v * n_dot_v).max(0.0).sqrt(), 0.0, n_dot_v);
    let k = roughness * roughness / 2.0;

    let mut scale = 0.0f32;
    let mut bias = 0.0f32;

    for i in 0..sample_count {
        let h = importance_sample_ggx(hammersley(i, sample_count), roughness);
        let v_dot_h_raw = v.dot(h);
        let l = safe_normalize(h * (2.0 * v_dot_h_raw) - v);

        let n_dot_l = l.z;
        let n_dot_h = h.z;
        let v_dot_h = v_dot_h_raw.max(0.0);
        if n_dot_l <= 0.0 || n_dot_h <= 0.0 {
            continue;
        }

        let g = geometry_schlick_ggx(n_dot_v, k) * geometry_schlick_ggx(n_dot_l, k);
        let g_vis = g * v_dot_h / (n_dot_h * n_dot_v);
        let fc = (1.0 - v_dot_h).powi(5);

        scale += (1.0 - fc) * g_vis;
        bias += fc * g_vis;
    }

    let n = sample_count as f32;
    [scale / n, bias / n]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lut_entries_stay_in_unit_range() {
        let lut = integrate_brdf_lut(16, 128).unwrap();
        assert_eq!(lut.data.len(), 256);
        for [scale, bias] in &lut.data {
            assert!((0.0..=1.0).contains(scale), "scale {}", scale);
            assert!((0.0..=1.0).contains(bias), "bias {}", bias);
        }
    }

    #[test]
    fn test_smooth_head_on_reflects_almost_everything() {
        // Roughness 0, N·V = 1: G ≈ 1 and Fresnel ≈ F0, so scale ≈ 1 and bias ≈ 0.
        let [scale, bias] = integrate_brdf(1.0, 0.0, 64);
        assert!(scale > 0.95, "scale {}", scale);
        assert!(bias < 0.05, "bias {}", bias);
    }

    #[test]
    fn test_mirror_entries_follow_schlick_fresnel() {
        // At roughness 0 every half-vector is the normal and G = 1, so the sums
        // reduce to 1 - (1 - N·V)^5 and (1 - N·V)^5.
        for x in 0..8 {
            let n_dot_v = lut_n_dot_v(x, 8);
            let fc = (1.0 - n_dot_v).powi(5);
            let [scale, bias] = split_sum(n_dot_v, 0.0, 64);
            assert!((scale - (1.0 - fc)).abs() < 1e-3, "scale {} at {}", scale, n_dot_v);
            assert!((bias - fc).abs() < 1e-3, "bias {} at {}", bias, n_dot_v);
        }
    }

    #[test]
    fn test_directional_albedo_never_exceeds_one() {
        let size = 16;
        for y in 0..size {
            for x in 0..size {
                let n_dot_v = lut_n_dot_v(x, size);
                let roughness = lut_roughness(y, size);
                let [scale, bias] = split_sum(n_dot_v, roughness, 512);
                assert!(scale >= 0.0 && bias >= 0.0);
                assert!(
                    scale + bias <= 1.0 + 2e-2,
                    "albedo {} at N·V {} roughness {}",
                    scale + bias,
                    n_dot_v,
                    roughness
                );
            }
        }
    }

    #[test]
    fn test_rough_surfaces_lose_energy() {
        let [smooth_scale, smooth_bias] = integrate_brdf(0.5, 0.1, 512);
        let [rough_scale, rough_bias] = integrate_brdf(0.5, 1.0, 512);
        assert!(rough_scale + rough_bias < smooth_scale + smooth_bias);
    }

    #[test]
    fn test_grazing_angle_is_finite() {
        let [scale, bias] = integrate_brdf(0.0, 0.5, 64);
        assert!(scale.is_finite() && bias.is_finite());
    }

    #[test]
    fn test_axes_and_lookup() {
        assert_eq!(lut_n_dot_v(0, 4), 0.125);
        assert_eq!(lut_roughness(0, 4), 0.0);
        assert_eq!(lut_roughness(3, 4), 1.0);
        assert_eq!(lut_roughness(0, 1), 0.0);

        let lut = integrate_brdf_lut(4, 16).unwrap();
        assert_eq!(lut.lookup(1.0, 1.0), lut.data[15]);
        assert_eq!(lut.lookup(0.0, 0.0), lut.data[0]);
        assert_eq!(lut.get(4, 0), None);
    }

    #[test]
    fn test_generated_keys_track_parameters() {
        let a = integrate_brdf_lut(4, 16).unwrap();
        let b = integrate_brdf_lut(4, 16).unwrap();
        let c = integrate_brdf_lut(4, 32).unwrap();
        assert_eq!(a.key, b.key);
        assert_ne!(a.key, c.key);
        assert_eq!(a.key.id, BRDF_LUT_SOURCE_ID);

        let custom = a.with_key(SourceKey::new(3, 1));
        assert_eq!(custom.key, SourceKey::new(3, 1));
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(integrate_brdf_lut(0, 16).is_err());
        assert!(integrate_brdf_lut(16, 0).is_err());
    }
}
