//! Equirectangular to cubemap resampling.

use std::time::Instant;

use crate::error::IblError;
use crate::ibl::{convolve_cube_level, CubeEnvironment, PanoramicEnvironment, SourceSampler};

/// Resamples a panorama into a single-level float cubemap of `size` texels per face.
///
/// The cubemap keeps the panorama's key, since it carries the same content.
pub fn panorama_to_cube(
    panorama: &PanoramicEnvironment,
    size: u32,
) -> Result<CubeEnvironment, IblError> {
    if size == 0 {
        return Err(IblError::invalid_request("cubemap size must be positive"));
    }

    let sampler = SourceSampler::from_panorama(panorama)?;

    let started = Instant::now();
    let level = convolve_cube_level(size, |dir| sampler.sample(dir));

    log::info!(
        "Resampled {}x{} panorama into {}px cubemap in {:.1?}",
        panorama.width,
        panorama.height,
        size,
        started.elapsed()
    );

    Ok(CubeEnvironment::new(panorama.key, size, 3, vec![level]))
}
