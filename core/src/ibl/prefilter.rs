//! Pre-filtered environment map generation for specular IBL.
//!
//! Uses GGX importance sampling to generate a pre-filtered environment cubemap
//! where each mip level represents a different roughness value.

use std::time::Instant;

use cgmath::{InnerSpace, Vector3};
use ibl_bake_common::{hammersley, importance_sample_ggx, TangentFrame};

use crate::error::IblError;
use crate::ibl::{
    convolve_cube_level, mip_roughness, mip_sizes, ConvolutionRequest, CubeEnvironment, Rgb,
    SourceSampler,
};

/// Multi-mip cubemap where mip `k` holds the environment pre-integrated for
/// roughness [`mip_roughness`]`(k, mip_count)`.
#[derive(Debug, Clone, PartialEq)]
pub struct PrefilterMap {
    pub environment: CubeEnvironment,
}

impl PrefilterMap {
    /// Face size of mip 0.
    pub fn size(&self) -> u32 {
        self.environment.size
    }

    pub fn mip_count(&self) -> u32 {
        self.environment.mip_count()
    }

    /// Roughness encoded in `level`.
    pub fn roughness(&self, level: u32) -> f32 {
        mip_roughness(level, self.mip_count())
    }
}

/// Generates a pre-filtered cubemap with `request.roughness_levels` mips.
///
/// Each mip level is generated with increasing roughness:
/// - Mip 0: roughness = 0.0 (mirror reflection)
/// - Mip N-1: roughness = 1.0 (fully rough)
///
/// With `mirror_base_level` set, mip 0 copies the source radiance in the texel
/// direction rather than integrating a near-delta lobe.
pub fn prefilter_specular(request: &ConvolutionRequest<'_>) -> Result<PrefilterMap, IblError> {
    request.validate()?;
    let sampler = SourceSampler::new(request.source)?;

    let levels = request.roughness_levels;
    let sample_count = request.sample_count;
    let mut mips = Vec::with_capacity(levels as usize);

    for (level, size) in mip_sizes(request.target_size, levels).into_iter().enumerate() {
        let level = level as u32;
        let roughness = mip_roughness(level, levels);
        let started = Instant::now();

        let mip = if level == 0 && request.mirror_base_level {
            convolve_cube_level(size, |normal| sampler.sample(normal))
        } else {
            convolve_cube_level(size, |normal| {
                prefiltered_at(&sampler, normal, roughness, sample_count)
            })
        };

        log::debug!(
            "Prefilter mip {} ({}x{}, roughness {:.2}) in {:.1?}",
            level,
            size,
            size,
            roughness,
            started.elapsed()
        );
        mips.push(mip);
    }

    log::info!(
        "Prefiltered {} mips from {}px with {} samples",
        levels,
        request.target_size,
        sample_count
    );

    Ok(PrefilterMap {
        environment: CubeEnvironment::new(request.source.key(), request.target_size, 3, mips),
    })
}

fn prefiltered_at(
    sampler: &SourceSampler<'_>,
    normal: Vector3<f32>,
    roughness: f32,
    sample_count: u32,
) -> Rgb {
    // Split-sum assumption: view direction equals the normal.
    let frame = TangentFrame::new(normal);
    let n = frame.normal;

    let mut color = Vector3::new(0.0, 0.0, 0.0);
    let mut total_weight = 0.0f32;

    for i in 0..sample_count {
        let h = frame.to_world(importance_sample_ggx(hammersley(i, sample_count), roughness));
        let l = h * (2.0 * n.dot(h)) - n;

        let n_dot_l = n.dot(l);
        if n_dot_l > 0.0 {
            color += sampler.sample(l) * n_dot_l;
            total_weight += n_dot_l;
        }
    }

    if total_weight > 0.0 {
        color / total_weight
    } else {
        Vector3::new(0.0, 0.0, 0.0)
    }
}
