//! Geometry and sampling primitives shared by the IBL bake pipeline.
//!
//! Everything in this crate is pure: no pixel storage, no device handles.

pub mod cube;
pub mod sampling;

pub use cube::{
    direction_to_face_uv, equirect_direction_to_uv, equirect_uv_to_direction, face_direction,
    safe_normalize, texel_direction, CubeFace,
};
pub use sampling::{
    cosine_sample_hemisphere, hammersley, importance_sample_ggx, radical_inverse_base2,
    TangentFrame, MIN_ROUGHNESS,
};

/// Tolerance used for degenerate-vector checks and float comparisons.
pub const EPSILON: f32 = 1e-6;
