//! Conversion of baked float data into upload-ready texture bytes.
//!
//! Cubemaps upload as `Rgba16Float`, the BRDF LUT as `Rg16Float`. Rows are
//! padded to the device's copy pitch alignment before they reach the queue.

use half::f16;
use ibl_bake_common::CubeFace;

use crate::ibl::{BrdfLut, CubeMip};

/// Half-float 1.0.
pub const HALF_ONE: u16 = 0x3C00;

/// Bytes per texel of an `Rgba16Float` texture.
pub const RGBA16F_TEXEL_BYTES: u32 = 8;

/// Bytes per texel of an `Rg16Float` texture.
pub const RG16F_TEXEL_BYTES: u32 = 4;

/// Converts an IEEE-754 single into a half-precision bit pattern.
///
/// Rounds to nearest-even. Values too large for a half become infinity,
/// values too small become a signed zero, and NaN stays NaN.
pub fn float_to_half(value: f32) -> u16 {
    f16::from_f32(value).to_bits()
}

/// Decodes a half-precision bit pattern. Every half is exactly representable as an f32.
pub fn half_to_float(bits: u16) -> f32 {
    f16::from_bits(bits).to_f32()
}

/// Rounds `row_bytes` up to a multiple of `alignment`. An alignment of 0 is treated as 1.
pub fn align_row_pitch(row_bytes: u32, alignment: u32) -> u32 {
    let alignment = alignment.max(1);
    row_bytes.div_ceil(alignment) * alignment
}

/// Copies `row_count` rows of `row_bytes` each into a buffer with `aligned_row_bytes` pitch.
///
/// Padding bytes are zero. Rows missing from `data` are left zeroed as well.
pub fn pad_rows(
    data: &[u8],
    row_bytes: usize,
    aligned_row_bytes: usize,
    row_count: usize,
) -> Vec<u8> {
    let pitch = aligned_row_bytes.max(row_bytes);
    let mut out = vec![0u8; pitch * row_count];
    if row_bytes == 0 {
        return out;
    }
    for (dst, src) in out.chunks_exact_mut(pitch).zip(data.chunks(row_bytes)) {
        dst[..src.len()].copy_from_slice(src);
    }
    out
}

/// Packs tightly laid out RGB floats into `Rgba16Float` bytes with alpha 1.
pub fn pack_rgba16f(rgb: &[f32]) -> Vec<u8> {
    let halves: Vec<u16> = rgb
        .chunks_exact(3)
        .flat_map(|c| {
            [
                float_to_half(c[0]),
                float_to_half(c[1]),
                float_to_half(c[2]),
                HALF_ONE,
            ]
        })
        .collect();
    bytemuck::cast_slice(&halves).to_vec()
}

/// Packs `(scale, bias)` pairs into `Rg16Float` bytes.
pub fn pack_rg16f(pairs: &[[f32; 2]]) -> Vec<u8> {
    let halves: Vec<u16> = pairs
        .iter()
        .flat_map(|p| [float_to_half(p[0]), float_to_half(p[1])])
        .collect();
    bytemuck::cast_slice(&halves).to_vec()
}

/// One face or image of texel data, laid out at the device copy pitch.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedImage {
    pub width: u32,
    pub height: u32,
    /// Row pitch of `data`, a multiple of `wgpu::COPY_BYTES_PER_ROW_ALIGNMENT`.
    pub bytes_per_row: u32,
    pub data: Vec<u8>,
}

impl PackedImage {
    fn from_tight(width: u32, height: u32, texel_bytes: u32, tight: &[u8]) -> Self {
        let row_bytes = width * texel_bytes;
        let bytes_per_row = align_row_pitch(row_bytes, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let data = pad_rows(
            tight,
            row_bytes as usize,
            bytes_per_row as usize,
            height as usize,
        );
        Self {
            width,
            height,
            bytes_per_row,
            data,
        }
    }
}

/// Packs one face of a cube mip as `Rgba16Float`.
pub fn pack_cube_mip_face(mip: &CubeMip, face: CubeFace, channels: u32) -> PackedImage {
    let rgb = mip.faces[face.index()].to_rgb_f32(channels);
    PackedImage::from_tight(mip.size, mip.size, RGBA16F_TEXEL_BYTES, &pack_rgba16f(&rgb))
}

/// Packs the BRDF LUT as `Rg16Float`.
pub fn pack_brdf_lut(lut: &BrdfLut) -> PackedImage {
    PackedImage::from_tight(lut.size, lut.size, RG16F_TEXEL_BYTES, &pack_rg16f(&lut.data))
}
