pub mod error;
pub mod ibl;
pub mod renderer;

pub use ibl_bake_common as common;

pub use error::{DeviceError, IblError};
pub use ibl::{
    bake_brdf_lut, bake_environment, BrdfLut, CubeEnvironment, EnvironmentSource, IblEnvironment,
    IblSettings, PanoramicEnvironment, PixelData, SourceKey,
};
pub use renderer::{GpuResourceHandle, IblInputs, IblResidencyManager, WgpuDevice};
