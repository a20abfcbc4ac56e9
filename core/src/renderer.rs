//! GPU side of image-based lighting: packing baked data into texture bytes and
//! keeping it resident behind a single bind group.

pub mod pack;

mod device;
mod residency;

pub use device::{
    ibl_bind_group_layout_entries, GpuDevice, IblBindGroupEntries, SamplerDesc, TextureDesc,
    TextureKind, TextureWrite, WgpuDevice,
};
pub use residency::{
    GpuResourceHandle, IblInputs, IblResidencyManager, ResidencyStatus, BRDF_LUT_FORMAT,
    CUBEMAP_FORMAT,
};
