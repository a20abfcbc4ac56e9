//! Diffuse irradiance convolution.
//!
//! The irradiance map stores the diffuse component of IBL lighting by
//! convolving the environment with a cosine-weighted hemisphere.

use std::time::Instant;

use cgmath::Vector3;
use ibl_bake_common::{cosine_sample_hemisphere, hammersley, TangentFrame};

use crate::error::IblError;
use crate::ibl::{convolve_cube_level, ConvolutionRequest, CubeEnvironment, Rgb, SourceSampler};

/// Single-mip cubemap of cosine-convolved radiance, keyed like its source.
pub type IrradianceMap = CubeEnvironment;

/// Generates an irradiance cubemap of `request.target_size` texels per face.
///
/// Samples are drawn with a cosine-weighted PDF, so the cosine term cancels and
/// each texel is the plain mean of the sampled radiance. A uniform environment
/// therefore yields its own radiance everywhere.
pub fn convolve_irradiance(request: &ConvolutionRequest<'_>) -> Result<IrradianceMap, IblError> {
    request.validate()?;
    let sampler = SourceSampler::new(request.source)?;

    let started = Instant::now();
    let size = request.target_size;
    let sample_count = request.sample_count;

    let level = convolve_cube_level(size, |normal| irradiance_at(&sampler, normal, sample_count));

    log::info!(
        "Irradiance {}x{} with {} samples in {:.1?}",
        size,
        size,
        sample_count,
        started.elapsed()
    );

    Ok(CubeEnvironment::new(request.source.key(), size, 3, vec![level]))
}

fn irradiance_at(sampler: &SourceSampler<'_>, normal: Vector3<f32>, sample_count: u32) -> Rgb {
    let frame = TangentFrame::new(normal);
    let mut sum = Vector3::new(0.0, 0.0, 0.0);

    for i in 0..sample_count {
        let local = cosine_sample_hemisphere(hammersley(i, sample_count));
        sum += sampler.sample(frame.to_world(local));
    }

    sum / sample_count as f32
}
