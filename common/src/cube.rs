//! Conversions between cube-face texel coordinates, equirectangular coordinates
//! and unit direction vectors.
//!
//! Face order and orientation follow the wgpu/Vulkan cube array-layer convention:
//! layer 0..6 = +X, -X, +Y, -Y, +Z, -Z, with `v` increasing downwards on each face.

use std::f32::consts::{PI, TAU};

use cgmath::{InnerSpace, Vector3};

use crate::EPSILON;

/// One of the six faces of a cubemap, in array-layer order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CubeFace {
    PositiveX = 0,
    NegativeX = 1,
    PositiveY = 2,
    NegativeY = 3,
    PositiveZ = 4,
    NegativeZ = 5,
}

impl CubeFace {
    /// All faces in array-layer order.
    pub const ALL: [CubeFace; 6] = [
        CubeFace::PositiveX,
        CubeFace::NegativeX,
        CubeFace::PositiveY,
        CubeFace::NegativeY,
        CubeFace::PositiveZ,
        CubeFace::NegativeZ,
    ];

    /// Array layer index of this face.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Face for an array layer index. Returns `None` for indices >= 6.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

/// Normalizes `v`, returning +Z for vectors too short to normalize.
///
/// Degenerate directions never produce NaN anywhere in the pipeline; they
/// collapse onto +Z instead.
pub fn safe_normalize(v: Vector3<f32>) -> Vector3<f32> {
    let len2 = v.magnitude2();
    if len2 < EPSILON * EPSILON {
        Vector3::unit_z()
    } else {
        v / len2.sqrt()
    }
}

/// Maps normalized face coordinates `(u, v)` in `[0, 1]` to a unit direction.
pub fn face_direction(face: CubeFace, u: f32, v: f32) -> Vector3<f32> {
    let s = 2.0 * u - 1.0;
    let t = 2.0 * v - 1.0;

    let dir = match face {
        CubeFace::PositiveX => Vector3::new(1.0, -t, -s),
        CubeFace::NegativeX => Vector3::new(-1.0, -t, s),
        CubeFace::PositiveY => Vector3::new(s, 1.0, t),
        CubeFace::NegativeY => Vector3::new(s, -1.0, -t),
        CubeFace::PositiveZ => Vector3::new(s, -t, 1.0),
        CubeFace::NegativeZ => Vector3::new(-s, -t, -1.0),
    };

    dir.normalize()
}

/// Direction through the center of texel `(x, y)` on a face of `size` x `size` texels.
pub fn texel_direction(face: CubeFace, x: u32, y: u32, size: u32) -> Vector3<f32> {
    let size = size.max(1) as f32;
    let u = (x as f32 + 0.5) / size;
    let v = (y as f32 + 0.5) / size;
    face_direction(face, u, v)
}

/// Finds the face a direction points into and the `(u, v)` coordinates on it.
///
/// The dominant axis wins; ties resolve x, then y, then z. A zero-length
/// direction maps to the center of +Z.
pub fn direction_to_face_uv(dir: Vector3<f32>) -> (CubeFace, f32, f32) {
    let ax = dir.x.abs();
    let ay = dir.y.abs();
    let az = dir.z.abs();

    if ax.max(ay).max(az) < EPSILON {
        return (CubeFace::PositiveZ, 0.5, 0.5);
    }

    let (face, s, t) = if ax >= ay && ax >= az {
        if dir.x > 0.0 {
            (CubeFace::PositiveX, -dir.z / ax, -dir.y / ax)
        } else {
            (CubeFace::NegativeX, dir.z / ax, -dir.y / ax)
        }
    } else if ay >= az {
        if dir.y > 0.0 {
            (CubeFace::PositiveY, dir.x / ay, dir.z / ay)
        } else {
            (CubeFace::NegativeY, dir.x / ay, -dir.z / ay)
        }
    } else if dir.z > 0.0 {
        (CubeFace::PositiveZ, dir.x / az, -dir.y / az)
    } else {
        (CubeFace::NegativeZ, -dir.x / az, -dir.y / az)
    };

    (face, (s + 1.0) * 0.5, (t + 1.0) * 0.5)
}

/// Projects a direction onto equirectangular `(u, v)`.
///
/// `u` follows the azimuth `atan2(z, x)` wrapped into `[0, 2π)`, `v` the polar
/// angle from +Y, so `v = 0` is straight up.
pub fn equirect_direction_to_uv(dir: Vector3<f32>) -> (f32, f32) {
    let dir = safe_normalize(dir);

    let mut theta = dir.z.atan2(dir.x);
    if theta < 0.0 {
        theta += TAU;
    }
    let phi = dir.y.clamp(-1.0, 1.0).acos();

    // atan2 can land exactly on 2π after wrapping a tiny negative angle.
    let u = (theta / TAU).min(1.0);
    (u, phi / PI)
}

/// Inverse of [`equirect_direction_to_uv`].
pub fn equirect_uv_to_direction(u: f32, v: f32) -> Vector3<f32> {
    let theta = u * TAU;
    let phi = v * PI;
    let sin_phi = phi.sin();

    Vector3::new(sin_phi * theta.cos(), phi.cos(), sin_phi * theta.sin())
}
