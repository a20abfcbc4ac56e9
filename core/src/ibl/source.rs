//! Environment sources and the uniform radiance lookup over them.
//!
//! A source is either a cubemap (optionally with a mip chain) or an
//! equirectangular panorama, stored as 8-bit or 32-bit float texels. The
//! [`SourceSampler`] hides those differences behind a single nearest-texel
//! `sample(direction)` call.

use cgmath::Vector3;
use ibl_bake_common::{direction_to_face_uv, equirect_direction_to_uv, CubeFace};

use crate::error::IblError;

/// Linear RGB radiance.
pub type Rgb = Vector3<f32>;

/// Identity and version of a source, owned by whoever produces the source.
///
/// The version must increase every time the producer changes the pixels.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct SourceKey {
    pub id: u64,
    pub version: u64,
}

impl SourceKey {
    pub fn new(id: u64, version: u64) -> Self {
        Self { id, version }
    }

    /// The same identity with the version bumped by one.
    pub fn next_version(self) -> Self {
        Self {
            id: self.id,
            version: self.version + 1,
        }
    }
}

/// Texel storage, row-major, `channels` values per texel.
#[derive(Debug, Clone, PartialEq)]
pub enum PixelData {
    /// Unorm bytes, decoded to `[0, 1]` on read.
    U8(Vec<u8>),
    /// Linear float values, read as-is.
    F32(Vec<f32>),
}

impl PixelData {
    pub fn len(&self) -> usize {
        match self {
            PixelData::U8(data) => data.len(),
            PixelData::F32(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the texels are float-backed.
    pub fn is_float(&self) -> bool {
        matches!(self, PixelData::F32(_))
    }

    /// Reads the RGB part of texel `index`. Alpha, if present, is ignored.
    ///
    /// The caller guarantees `index` is in range.
    fn rgb(&self, index: usize, channels: usize) -> Rgb {
        let base = index * channels;
        match self {
            PixelData::F32(data) => Vector3::new(data[base], data[base + 1], data[base + 2]),
            PixelData::U8(data) => Vector3::new(
                data[base] as f32 / 255.0,
                data[base + 1] as f32 / 255.0,
                data[base + 2] as f32 / 255.0,
            ),
        }
    }

    /// The RGB part of every texel as floats. `channels` below 3 is treated as 3.
    pub fn to_rgb_f32(&self, channels: u32) -> Vec<f32> {
        let channels = channels.max(3) as usize;
        let texels = self.len() / channels;
        let mut out = Vec::with_capacity(texels * 3);
        for i in 0..texels {
            let rgb = self.rgb(i, channels);
            out.extend_from_slice(&[rgb.x, rgb.y, rgb.z]);
        }
        out
    }
}

/// One level of a cubemap mip chain.
#[derive(Debug, Clone, PartialEq)]
pub struct CubeMip {
    /// Width and height of each face in texels.
    pub size: u32,
    /// Faces in array-layer order (+X, -X, +Y, -Y, +Z, -Z).
    pub faces: [PixelData; 6],
}

impl CubeMip {
    /// A mip level of uniform float RGB texels.
    pub fn solid(size: u32, color: Rgb) -> Self {
        let texels = (size * size) as usize;
        let face = PixelData::F32(
            std::iter::repeat([color.x, color.y, color.z])
                .take(texels)
                .flatten()
                .collect(),
        );
        Self {
            size,
            faces: std::array::from_fn(|_| face.clone()),
        }
    }
}

/// A cubemap environment with one or more mip levels.
#[derive(Debug, Clone, PartialEq)]
pub struct CubeEnvironment {
    pub key: SourceKey,
    /// Face size of mip 0.
    pub size: u32,
    /// Values per texel in every face buffer (3 or 4).
    pub channels: u32,
    pub mips: Vec<CubeMip>,
}

impl CubeEnvironment {
    pub fn new(key: SourceKey, size: u32, channels: u32, mips: Vec<CubeMip>) -> Self {
        Self {
            key,
            size,
            channels,
            mips,
        }
    }

    /// A single-level cubemap from six face buffers.
    pub fn from_faces(key: SourceKey, size: u32, channels: u32, faces: [PixelData; 6]) -> Self {
        Self::new(key, size, channels, vec![CubeMip { size, faces }])
    }

    /// A single-level cubemap of uniform radiance.
    pub fn solid(key: SourceKey, size: u32, color: Rgb) -> Self {
        Self::new(key, size, 3, vec![CubeMip::solid(size, color)])
    }

    pub fn mip_count(&self) -> u32 {
        self.mips.len() as u32
    }

    pub fn mip(&self, level: u32) -> Option<&CubeMip> {
        self.mips.get(level as usize)
    }

    fn has_any_data(&self) -> bool {
        self.mips
            .iter()
            .any(|mip| mip.faces.iter().any(|face| !face.is_empty()))
    }
}

/// An equirectangular (latitude/longitude) environment.
#[derive(Debug, Clone, PartialEq)]
pub struct PanoramicEnvironment {
    pub key: SourceKey,
    pub width: u32,
    pub height: u32,
    /// Values per texel (3 or 4).
    pub channels: u32,
    pub pixels: PixelData,
}

impl PanoramicEnvironment {
    pub fn new(key: SourceKey, width: u32, height: u32, channels: u32, pixels: PixelData) -> Self {
        Self {
            key,
            width,
            height,
            channels,
            pixels,
        }
    }

    /// A panorama of uniform radiance.
    pub fn solid(key: SourceKey, width: u32, height: u32, color: Rgb) -> Self {
        let texels = (width * height) as usize;
        let pixels = PixelData::F32(
            std::iter::repeat([color.x, color.y, color.z])
                .take(texels)
                .flatten()
                .collect(),
        );
        Self::new(key, width, height, 3, pixels)
    }
}

/// Immutable snapshot of an environment to be convolved.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvironmentSource {
    Cube(CubeEnvironment),
    Panoramic(PanoramicEnvironment),
}

impl EnvironmentSource {
    pub fn key(&self) -> SourceKey {
        match self {
            EnvironmentSource::Cube(cube) => cube.key,
            EnvironmentSource::Panoramic(pano) => pano.key,
        }
    }

    /// Checks that the source has pixel data consistent with its dimensions.
    pub fn validate(&self) -> Result<(), IblError> {
        SourceSampler::new(self).map(|_| ())
    }

    /// One-shot nearest-texel radiance lookup.
    ///
    /// Validates the source on every call; hot loops should build a
    /// [`SourceSampler`] once instead.
    pub fn sample(&self, direction: Vector3<f32>) -> Result<Rgb, IblError> {
        Ok(SourceSampler::new(self)?.sample(direction))
    }
}

impl From<CubeEnvironment> for EnvironmentSource {
    fn from(cube: CubeEnvironment) -> Self {
        EnvironmentSource::Cube(cube)
    }
}

impl From<PanoramicEnvironment> for EnvironmentSource {
    fn from(pano: PanoramicEnvironment) -> Self {
        EnvironmentSource::Panoramic(pano)
    }
}

/// Validated read access to an [`EnvironmentSource`].
///
/// Construction checks every buffer once so that lookups can index directly.
#[derive(Debug, Copy, Clone)]
pub struct SourceSampler<'a> {
    view: SourceView<'a>,
}

#[derive(Debug, Copy, Clone)]
enum SourceView<'a> {
    Cube(&'a CubeEnvironment),
    Panoramic(&'a PanoramicEnvironment),
}

impl<'a> SourceSampler<'a> {
    pub fn new(source: &'a EnvironmentSource) -> Result<Self, IblError> {
        match source {
            EnvironmentSource::Cube(cube) => Self::from_cube(cube),
            EnvironmentSource::Panoramic(pano) => Self::from_panorama(pano),
        }
    }

    pub fn from_cube(cube: &'a CubeEnvironment) -> Result<Self, IblError> {
        validate_cube(cube)?;
        Ok(Self {
            view: SourceView::Cube(cube),
        })
    }

    pub fn from_panorama(pano: &'a PanoramicEnvironment) -> Result<Self, IblError> {
        validate_panorama(pano)?;
        Ok(Self {
            view: SourceView::Panoramic(pano),
        })
    }

    /// Nearest-texel radiance in `direction`, read from mip 0 of cube sources.
    pub fn sample(&self, direction: Vector3<f32>) -> Rgb {
        self.sample_level(direction, 0)
    }

    /// Nearest-texel radiance from a specific cube mip. The level is clamped to
    /// the available chain; panoramas have a single level.
    pub fn sample_level(&self, direction: Vector3<f32>, level: u32) -> Rgb {
        match self.view {
            SourceView::Cube(cube) => {
                let level = (level as usize).min(cube.mips.len() - 1);
                let mip = &cube.mips[level];
                let (face, u, v) = direction_to_face_uv(direction);
                let x = nearest_texel(u, mip.size);
                let y = nearest_texel(v, mip.size);
                let index = (y * mip.size + x) as usize;
                mip.faces[face.index()].rgb(index, cube.channels as usize)
            }
            SourceView::Panoramic(pano) => {
                let (u, v) = equirect_direction_to_uv(direction);
                let x = nearest_texel(u, pano.width);
                let y = nearest_texel(v, pano.height);
                let index = (y * pano.width + x) as usize;
                pano.pixels.rgb(index, pano.channels as usize)
            }
        }
    }
}

fn nearest_texel(coord: f32, extent: u32) -> u32 {
    // `as` saturates negative and NaN coordinates to 0.
    ((coord * extent as f32) as u32).min(extent - 1)
}

fn check_channels(id: u64, channels: u32) -> Result<(), IblError> {
    if channels == 3 || channels == 4 {
        Ok(())
    } else {
        Err(IblError::InvalidSource {
            id,
            reason: format!("expected 3 or 4 channels, got {}", channels),
        })
    }
}

fn validate_cube(cube: &CubeEnvironment) -> Result<(), IblError> {
    let id = cube.key.id;
    if !cube.has_any_data() {
        return Err(IblError::MissingSourceData { id });
    }
    check_channels(id, cube.channels)?;

    for (level, mip) in cube.mips.iter().enumerate() {
        if mip.size == 0 {
            return Err(IblError::InvalidSource {
                id,
                reason: format!("mip {} has zero size", level),
            });
        }
        let expected = (mip.size * mip.size * cube.channels) as usize;
        for face in CubeFace::ALL {
            let actual = mip.faces[face.index()].len();
            if actual != expected {
                return Err(IblError::InvalidSource {
                    id,
                    reason: format!(
                        "mip {} face {:?} has {} values, expected {}",
                        level, face, actual, expected
                    ),
                });
            }
        }
    }
    Ok(())
}

fn validate_panorama(pano: &PanoramicEnvironment) -> Result<(), IblError> {
    let id = pano.key.id;
    if pano.pixels.is_empty() {
        return Err(IblError::MissingSourceData { id });
    }
    check_channels(id, pano.channels)?;

    if pano.width == 0 || pano.height == 0 {
        return Err(IblError::InvalidSource {
            id,
            reason: format!("zero-sized panorama {}x{}", pano.width, pano.height),
        });
    }
    let expected = (pano.width * pano.height * pano.channels) as usize;
    if pano.pixels.len() != expected {
        return Err(IblError::InvalidSource {
            id,
            reason: format!("{} values, expected {}", pano.pixels.len(), expected),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ibl_bake_common::face_direction;

    const TEST_EPSILON: f32 = 1e-6;

    fn face_tinted_cube() -> CubeEnvironment {
        // Each face stores its own index in the red channel as a byte.
        let faces = std::array::from_fn(|i| PixelData::U8([i as u8 * 40, 0, 255, 255].repeat(4)));
        CubeEnvironment::from_faces(SourceKey::new(7, 1), 2, 4, faces)
    }

    #[test]
    fn test_cube_lookup_selects_face_and_decodes_bytes() {
        let source = EnvironmentSource::from(face_tinted_cube());
        let sampler = SourceSampler::new(&source).unwrap();

        for face in CubeFace::ALL {
            let rgb = sampler.sample(face_direction(face, 0.5, 0.5));
            let expected = (face.index() as f32 * 40.0) / 255.0;
            assert!((rgb.x - expected).abs() < TEST_EPSILON);
            assert!(rgb.y.abs() < TEST_EPSILON);
            assert!((rgb.z - 1.0).abs() < TEST_EPSILON);
        }
    }

    #[test]
    fn test_cube_lookup_is_nearest_texel() {
        let mut faces: [PixelData; 6] = std::array::from_fn(|_| PixelData::F32(vec![0.0; 12]));
        // Bottom-right texel of +Z.
        faces[CubeFace::PositiveZ.index()] =
            PixelData::F32(vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 5.0, 6.0, 7.0]);
        let source =
            EnvironmentSource::from(CubeEnvironment::from_faces(SourceKey::default(), 2, 3, faces));
        let sampler = SourceSampler::new(&source).unwrap();

        let rgb = sampler.sample(face_direction(CubeFace::PositiveZ, 0.8, 0.8));
        assert_eq!(rgb, Vector3::new(5.0, 6.0, 7.0));
        let rgb = sampler.sample(face_direction(CubeFace::PositiveZ, 0.2, 0.2));
        assert_eq!(rgb, Vector3::new(0.0, 0.0, 0.0));
    }

    #[test]
    fn test_sample_level_clamps_to_chain() {
        let cube = CubeEnvironment::new(
            SourceKey::default(),
            2,
            3,
            vec![
                CubeMip::solid(2, Vector3::new(1.0, 1.0, 1.0)),
                CubeMip::solid(1, Vector3::new(0.5, 0.5, 0.5)),
            ],
        );
        let source = EnvironmentSource::from(cube);
        let sampler = SourceSampler::new(&source).unwrap();

        let dir = Vector3::new(0.0, 1.0, 0.0);
        assert_eq!(sampler.sample_level(dir, 0).x, 1.0);
        assert_eq!(sampler.sample_level(dir, 1).x, 0.5);
        assert_eq!(sampler.sample_level(dir, 9).x, 0.5);
    }

    #[test]
    fn test_panorama_lookup_rows_follow_polar_angle() {
        // Two rows: top row bright, bottom row dark.
        let pixels = PixelData::F32(vec![
            1.0, 1.0, 1.0, 1.0, 1.0, 1.0, //
            0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
        ]);
        let source = EnvironmentSource::from(PanoramicEnvironment::new(
            SourceKey::default(),
            2,
            2,
            3,
            pixels,
        ));

        let up = source.sample(Vector3::new(0.1, 1.0, 0.0)).unwrap();
        let down = source.sample(Vector3::new(0.1, -1.0, 0.0)).unwrap();
        assert_eq!(up, Vector3::new(1.0, 1.0, 1.0));
        assert_eq!(down, Vector3::new(0.0, 0.0, 0.0));
    }

    #[test]
    fn test_missing_data_is_reported() {
        let empty_cube = CubeEnvironment::from_faces(
            SourceKey::new(3, 0),
            4,
            3,
            std::array::from_fn(|_| PixelData::F32(Vec::new())),
        );
        assert_eq!(
            EnvironmentSource::from(empty_cube).validate(),
            Err(IblError::MissingSourceData { id: 3 })
        );

        let empty_pano =
            PanoramicEnvironment::new(SourceKey::new(4, 0), 8, 4, 3, PixelData::U8(Vec::new()));
        assert_eq!(
            EnvironmentSource::from(empty_pano).sample(Vector3::unit_x()),
            Err(IblError::MissingSourceData { id: 4 })
        );
    }

    #[test]
    fn test_mismatched_buffers_are_rejected() {
        let mut cube = CubeEnvironment::solid(SourceKey::new(5, 0), 2, Vector3::new(1.0, 1.0, 1.0));
        cube.mips[0].faces[3] = PixelData::F32(vec![1.0; 3]);
        assert!(matches!(
            EnvironmentSource::from(cube).validate(),
            Err(IblError::InvalidSource { id: 5, .. })
        ));

        let pano =
            PanoramicEnvironment::new(SourceKey::new(6, 0), 4, 2, 2, PixelData::F32(vec![0.0; 16]));
        assert!(matches!(
            EnvironmentSource::from(pano).validate(),
            Err(IblError::InvalidSource { id: 6, .. })
        ));
    }

    #[test]
    fn test_source_key_versions() {
        let key = SourceKey::new(9, 2);
        assert_eq!(key.next_version(), SourceKey::new(9, 3));
        assert_ne!(key, key.next_version());
    }

    #[test]
    fn test_to_rgb_f32_drops_alpha() {
        let data = PixelData::U8(vec![255, 0, 51, 128]);
        assert!(!data.is_float());
        assert!(PixelData::F32(vec![0.0; 3]).is_float());
        let rgb = data.to_rgb_f32(4);
        assert_eq!(rgb.len(), 3);
        assert!((rgb[0] - 1.0).abs() < TEST_EPSILON);
        assert!((rgb[2] - 0.2).abs() < TEST_EPSILON);
    }
}
