//! Image Based Lighting (IBL) precomputation.
//!
//! This module turns an environment source (cubemap or equirectangular panorama)
//! into the resources a PBR shader needs for image-based lighting:
//! a diffuse irradiance cubemap, a roughness-leveled pre-filtered specular cubemap,
//! the BRDF integration LUT and, optionally, a spherical-harmonics irradiance encoding.
//!
//! All kernels run on the CPU and are pure functions of their request; nothing here
//! caches results. GPU residency lives in [`crate::renderer`].

mod brdf_lut;
mod equirect;
mod irradiance;
mod prefilter;
mod sh;
mod source;

pub use brdf_lut::{
    integrate_brdf, integrate_brdf_lut, lut_n_dot_v, lut_roughness, BrdfLut, BRDF_LUT_SOURCE_ID,
};
pub use equirect::panorama_to_cube;
pub use irradiance::{convolve_irradiance, IrradianceMap};
pub use prefilter::{prefilter_specular, PrefilterMap};
pub use sh::{extract_spherical_harmonics, fibonacci_sphere, sh_basis, SphericalHarmonics};
pub use source::{
    CubeEnvironment, CubeMip, EnvironmentSource, PanoramicEnvironment, PixelData, Rgb, SourceKey,
    SourceSampler,
};

use std::time::Instant;

use ibl_bake_common::{texel_direction, CubeFace};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::IblError;

/// Size of the irradiance cubemap (per face). Low resolution since irradiance is low-frequency.
pub const IRRADIANCE_CUBEMAP_SIZE: u32 = 32;

/// Size of the pre-filtered environment cubemap base level (per face).
pub const PREFILTERED_CUBEMAP_SIZE: u32 = 128;

/// Number of mip levels for the pre-filtered cubemap (roughness levels).
pub const PREFILTERED_MIP_LEVELS: u32 = 5;

/// Size of the BRDF integration LUT.
pub const BRDF_LUT_SIZE: u32 = 512;

/// Bake parameters.
///
/// Every field has a default, so partial settings files deserialize cleanly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IblSettings {
    /// Face size of the irradiance cubemap.
    pub irradiance_size: u32,
    /// Cosine-weighted samples per irradiance texel.
    pub irradiance_samples: u32,
    /// Face size of mip 0 of the pre-filtered cubemap.
    pub prefiltered_size: u32,
    /// Roughness levels, one per mip of the pre-filtered cubemap.
    pub prefiltered_mip_levels: u32,
    /// GGX samples per pre-filtered texel.
    pub prefilter_samples: u32,
    /// Width and height of the BRDF LUT.
    pub brdf_lut_size: u32,
    /// GGX samples per BRDF LUT texel.
    pub brdf_lut_samples: u32,
    /// Whether to also project the environment onto spherical harmonics.
    pub compute_spherical_harmonics: bool,
    /// Fibonacci-lattice directions used for the SH projection.
    pub sh_samples: u32,
    /// Copy the source into mip 0 of the pre-filtered map instead of sampling it.
    pub mirror_base_level: bool,
    /// When set, panoramic sources are first resampled into a cubemap of this
    /// face size and convolved from there.
    pub resample_panorama_size: Option<u32>,
}

impl Default for IblSettings {
    fn default() -> Self {
        Self {
            irradiance_size: IRRADIANCE_CUBEMAP_SIZE,
            irradiance_samples: 512,
            prefiltered_size: PREFILTERED_CUBEMAP_SIZE,
            prefiltered_mip_levels: PREFILTERED_MIP_LEVELS,
            prefilter_samples: 256,
            brdf_lut_size: BRDF_LUT_SIZE,
            brdf_lut_samples: 512,
            compute_spherical_harmonics: true,
            sh_samples: 2048,
            mirror_base_level: true,
            resample_panorama_size: None,
        }
    }
}

impl IblSettings {
    /// Checks every size and sample count before any work is done.
    pub fn validate(&self) -> Result<(), IblError> {
        let positive = [
            ("irradiance_size", self.irradiance_size),
            ("irradiance_samples", self.irradiance_samples),
            ("prefiltered_size", self.prefiltered_size),
            ("prefilter_samples", self.prefilter_samples),
            ("brdf_lut_size", self.brdf_lut_size),
            ("brdf_lut_samples", self.brdf_lut_samples),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(IblError::invalid_request(format!("{} must be positive", name)));
            }
        }
        if self.compute_spherical_harmonics && self.sh_samples == 0 {
            return Err(IblError::invalid_request("sh_samples must be positive"));
        }
        if self.resample_panorama_size == Some(0) {
            return Err(IblError::invalid_request("resample_panorama_size must be positive"));
        }
        check_roughness_levels(self.prefiltered_size, self.prefiltered_mip_levels)
    }
}

/// Parameters of one cubemap convolution.
#[derive(Debug, Clone, Copy)]
pub struct ConvolutionRequest<'a> {
    pub source: &'a EnvironmentSource,
    /// Face size of the output (of mip 0 for the pre-filtered map).
    pub target_size: u32,
    /// Samples integrated per output texel.
    pub sample_count: u32,
    /// Number of roughness levels (mips). Only the pre-filter kernel uses more than one.
    pub roughness_levels: u32,
    /// Copy the source into the roughness-0 level instead of sampling it.
    pub mirror_base_level: bool,
}

impl<'a> ConvolutionRequest<'a> {
    pub fn new(source: &'a EnvironmentSource, target_size: u32, sample_count: u32) -> Self {
        Self {
            source,
            target_size,
            sample_count,
            roughness_levels: 1,
            mirror_base_level: true,
        }
    }

    pub fn with_roughness_levels(mut self, levels: u32) -> Self {
        self.roughness_levels = levels;
        self
    }

    pub fn with_mirror_base_level(mut self, mirror: bool) -> Self {
        self.mirror_base_level = mirror;
        self
    }

    /// Rejects non-positive sizes and sample counts, and roughness level counts
    /// that cannot form a strictly halving mip chain.
    pub fn validate(&self) -> Result<(), IblError> {
        if self.target_size == 0 {
            return Err(IblError::invalid_request("target_size must be positive"));
        }
        if self.sample_count == 0 {
            return Err(IblError::invalid_request("sample_count must be positive"));
        }
        check_roughness_levels(self.target_size, self.roughness_levels)
    }
}

fn check_roughness_levels(size: u32, levels: u32) -> Result<(), IblError> {
    if levels == 0 {
        return Err(IblError::invalid_request("roughness_levels must be at least 1"));
    }
    let max = max_mip_levels(size);
    if levels > max {
        return Err(IblError::invalid_request(format!(
            "{} roughness levels requested but a {}px face only has {} mips",
            levels, size, max
        )));
    }
    Ok(())
}

/// Length of the full mip chain of a `size` texel face, i.e. `floor(log2(size)) + 1`.
pub fn max_mip_levels(size: u32) -> u32 {
    32 - size.leading_zeros()
}

/// Face sizes of a `levels`-long mip chain starting at `base`.
pub fn mip_sizes(base: u32, levels: u32) -> Vec<u32> {
    (0..levels)
        .map(|level| base.checked_shr(level).unwrap_or(0).max(1))
        .collect()
}

/// Roughness encoded in mip `level` of a `levels`-long pre-filtered chain.
///
/// The mapping is linear: level 0 is a mirror, the last level is fully rough.
pub fn mip_roughness(level: u32, levels: u32) -> f32 {
    if levels <= 1 {
        0.0
    } else {
        level as f32 / (levels - 1) as f32
    }
}

/// Evaluates `kernel` at the center direction of every texel of a `size` cube
/// level. Faces and rows are processed in parallel.
pub(crate) fn convolve_cube_level<F>(size: u32, kernel: F) -> CubeMip
where
    F: Fn(cgmath::Vector3<f32>) -> Rgb + Sync,
{
    let row_len = size as usize * 3;
    let mut faces: [PixelData; 6] = std::array::from_fn(|_| PixelData::F32(Vec::new()));

    faces.par_iter_mut().enumerate().for_each(|(index, slot)| {
        let face = CubeFace::ALL[index];
        let mut data = vec![0.0f32; row_len * size as usize];

        data.par_chunks_mut(row_len)
            .enumerate()
            .for_each(|(y, row)| {
                for x in 0..size {
                    let color = kernel(texel_direction(face, x, y as u32, size));
                    let offset = x as usize * 3;
                    row[offset..offset + 3].copy_from_slice(&[color.x, color.y, color.z]);
                }
            });

        *slot = PixelData::F32(data);
    });

    CubeMip { size, faces }
}

/// Everything baked from one environment source.
#[derive(Debug, Clone, PartialEq)]
pub struct IblEnvironment {
    /// Key of the source these maps were baked from.
    pub key: SourceKey,
    pub irradiance: IrradianceMap,
    pub prefilter: PrefilterMap,
    pub spherical_harmonics: Option<SphericalHarmonics>,
}

/// Bakes irradiance, pre-filtered specular and (optionally) SH from `source`.
pub fn bake_environment(
    source: &EnvironmentSource,
    settings: &IblSettings,
) -> Result<IblEnvironment, IblError> {
    settings.validate()?;
    source.validate()?;

    let started = Instant::now();
    let key = source.key();

    let resampled;
    let source = match (source, settings.resample_panorama_size) {
        (EnvironmentSource::Panoramic(pano), Some(size)) => {
            resampled = EnvironmentSource::Cube(panorama_to_cube(pano, size)?);
            &resampled
        }
        _ => source,
    };

    let irradiance = convolve_irradiance(&ConvolutionRequest::new(
        source,
        settings.irradiance_size,
        settings.irradiance_samples,
    ))?;

    let prefilter = prefilter_specular(
        &ConvolutionRequest::new(source, settings.prefiltered_size, settings.prefilter_samples)
            .with_roughness_levels(settings.prefiltered_mip_levels)
            .with_mirror_base_level(settings.mirror_base_level),
    )?;

    let spherical_harmonics = if settings.compute_spherical_harmonics {
        Some(extract_spherical_harmonics(source, settings.sh_samples)?)
    } else {
        None
    };

    log::info!(
        "Baked environment {} (version {}) in {:.1?}",
        key.id,
        key.version,
        started.elapsed()
    );

    Ok(IblEnvironment {
        key,
        irradiance,
        prefilter,
        spherical_harmonics,
    })
}

/// Integrates the BRDF LUT described by `settings`.
///
/// The LUT does not depend on the environment, so it only needs to be baked once.
pub fn bake_brdf_lut(settings: &IblSettings) -> Result<BrdfLut, IblError> {
    integrate_brdf_lut(settings.brdf_lut_size, settings.brdf_lut_samples)
}
