//! The graphics device seam used by the residency manager.
//!
//! [`GpuDevice`] exposes the handful of operations needed to make IBL data
//! resident. [`WgpuDevice`] implements it over a `wgpu` device and queue;
//! tests substitute a recording mock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::DeviceError;
use crate::renderer::pack::PackedImage;

/// Shape of a texture the residency manager allocates.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TextureKind {
    /// Six-layer texture viewed as a cube.
    Cube,
    /// Single-layer 2D texture.
    D2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureDesc {
    pub label: String,
    pub kind: TextureKind,
    /// Width and height of mip 0.
    pub size: u32,
    pub mip_level_count: u32,
    pub format: wgpu::TextureFormat,
}

impl TextureDesc {
    pub fn layers(&self) -> u32 {
        match self.kind {
            TextureKind::Cube => 6,
            TextureKind::D2 => 1,
        }
    }

    /// Bytes the full mip chain occupies, excluding any driver padding.
    pub fn byte_size(&self) -> u64 {
        let texel_bytes = self.format.block_copy_size(None).unwrap_or(0) as u64;
        (0..self.mip_level_count)
            .map(|level| {
                let size = self.size.checked_shr(level).unwrap_or(0).max(1) as u64;
                size * size * texel_bytes * self.layers() as u64
            })
            .sum()
    }
}

/// Filtering setup of a sampler. Addressing is always clamp-to-edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerDesc {
    pub label: String,
    /// Blend between mips. Off for single-mip textures.
    pub mipmapped: bool,
}

/// One face (or the only layer) of one mip, ready for the queue.
#[derive(Debug, Clone, Copy)]
pub struct TextureWrite<'a> {
    pub mip_level: u32,
    pub layer: u32,
    pub image: &'a PackedImage,
}

/// The six resources bound to the IBL bind group, in binding order.
pub struct IblBindGroupEntries<'a, D: GpuDevice + ?Sized> {
    pub irradiance_view: &'a D::TextureView,
    pub irradiance_sampler: &'a D::Sampler,
    pub prefiltered_view: &'a D::TextureView,
    pub prefiltered_sampler: &'a D::Sampler,
    pub brdf_lut_view: &'a D::TextureView,
    pub brdf_lut_sampler: &'a D::Sampler,
}

/// Operations the residency manager needs from a graphics device.
///
/// Creation calls are synchronous and report allocation failures as
/// [`DeviceError`]. Uploads are queued and never fail on the caller's side.
pub trait GpuDevice {
    type Texture;
    type TextureView;
    type Sampler;
    type BindGroupLayout;
    type BindGroup;

    fn create_texture(&self, desc: &TextureDesc) -> Result<Self::Texture, DeviceError>;

    /// Creates a view covering every mip and layer of `texture`.
    fn create_texture_view(
        &self,
        texture: &Self::Texture,
        desc: &TextureDesc,
    ) -> Result<Self::TextureView, DeviceError>;

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<Self::Sampler, DeviceError>;

    /// Creates the six-entry IBL layout, see [`ibl_bind_group_layout_entries`].
    fn create_bind_group_layout(&self, label: &str) -> Result<Self::BindGroupLayout, DeviceError>;

    fn create_bind_group(
        &self,
        label: &str,
        layout: &Self::BindGroupLayout,
        entries: &IblBindGroupEntries<'_, Self>,
    ) -> Result<Self::BindGroup, DeviceError>;

    fn write_texture(&self, texture: &Self::Texture, write: &TextureWrite<'_>);

    /// Releases the texture's memory immediately.
    fn destroy_texture(&self, texture: Self::Texture);

    /// Fails with [`DeviceError::Lost`] once the device is gone.
    fn check_status(&self) -> Result<(), DeviceError>;
}

/// Layout entries for IBL sampling in fragment shaders.
///
/// Bindings: 0/1 irradiance cube and sampler, 2/3 pre-filtered cube and
/// sampler, 4/5 BRDF LUT and sampler.
pub fn ibl_bind_group_layout_entries() -> [wgpu::BindGroupLayoutEntry; 6] {
    let texture = |binding, view_dimension| wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: true },
            view_dimension,
            multisampled: false,
        },
        count: None,
    };
    let sampler = |binding| wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
        count: None,
    };

    [
        texture(0, wgpu::TextureViewDimension::Cube),
        sampler(1),
        texture(2, wgpu::TextureViewDimension::Cube),
        sampler(3),
        texture(4, wgpu::TextureViewDimension::D2),
        sampler(5),
    ]
}

/// [`GpuDevice`] over a `wgpu` device and its queue.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    lost: Arc<AtomicBool>,
}

impl WgpuDevice {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let flag = lost.clone();
        device.set_device_lost_callback(move |reason, message| {
            log::error!("Graphics device lost ({:?}): {}", reason, message);
            flag.store(true, Ordering::SeqCst);
        });

        Self {
            device,
            queue,
            lost,
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Runs `create` inside out-of-memory and validation error scopes.
    fn scoped<T>(&self, create: impl FnOnce(&wgpu::Device) -> T) -> Result<T, DeviceError> {
        self.check_status()?;

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = create(&self.device);
        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());

        if let Some(err) = out_of_memory {
            return Err(DeviceError::OutOfMemory(err.to_string()));
        }
        if let Some(err) = validation {
            return Err(DeviceError::Validation(err.to_string()));
        }
        self.check_status()?;
        Ok(value)
    }
}

impl GpuDevice for WgpuDevice {
    type Texture = wgpu::Texture;
    type TextureView = wgpu::TextureView;
    type Sampler = wgpu::Sampler;
    type BindGroupLayout = wgpu::BindGroupLayout;
    type BindGroup = wgpu::BindGroup;

    fn create_texture(&self, desc: &TextureDesc) -> Result<wgpu::Texture, DeviceError> {
        self.scoped(|device| {
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some(&desc.label),
                size: wgpu::Extent3d {
                    width: desc.size,
                    height: desc.size,
                    depth_or_array_layers: desc.layers(),
                },
                mip_level_count: desc.mip_level_count,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: desc.format,
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            })
        })
    }

    fn create_texture_view(
        &self,
        texture: &wgpu::Texture,
        desc: &TextureDesc,
    ) -> Result<wgpu::TextureView, DeviceError> {
        let dimension = match desc.kind {
            TextureKind::Cube => wgpu::TextureViewDimension::Cube,
            TextureKind::D2 => wgpu::TextureViewDimension::D2,
        };
        self.scoped(|_| {
            texture.create_view(&wgpu::TextureViewDescriptor {
                label: Some(&format!("{} View", desc.label)),
                format: Some(desc.format),
                dimension: Some(dimension),
                aspect: wgpu::TextureAspect::All,
                base_mip_level: 0,
                mip_level_count: Some(desc.mip_level_count),
                base_array_layer: 0,
                array_layer_count: Some(desc.layers()),
                ..Default::default()
            })
        })
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<wgpu::Sampler, DeviceError> {
        self.scoped(|device| {
            device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some(&desc.label),
                address_mode_u: wgpu::AddressMode::ClampToEdge,
                address_mode_v: wgpu::AddressMode::ClampToEdge,
                address_mode_w: wgpu::AddressMode::ClampToEdge,
                mag_filter: wgpu::FilterMode::Linear,
                min_filter: wgpu::FilterMode::Linear,
                mipmap_filter: if desc.mipmapped {
                    wgpu::FilterMode::Linear
                } else {
                    wgpu::FilterMode::Nearest
                },
                ..Default::default()
            })
        })
    }

    fn create_bind_group_layout(&self, label: &str) -> Result<wgpu::BindGroupLayout, DeviceError> {
        let entries = ibl_bind_group_layout_entries();
        self.scoped(|device| {
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(label),
                entries: &entries,
            })
        })
    }

    fn create_bind_group(
        &self,
        label: &str,
        layout: &wgpu::BindGroupLayout,
        entries: &IblBindGroupEntries<'_, Self>,
    ) -> Result<wgpu::BindGroup, DeviceError> {
        self.scoped(|device| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(label),
                layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(entries.irradiance_view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::Sampler(entries.irradiance_sampler),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: wgpu::BindingResource::TextureView(entries.prefiltered_view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: wgpu::BindingResource::Sampler(entries.prefiltered_sampler),
                    },
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: wgpu::BindingResource::TextureView(entries.brdf_lut_view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 5,
                        resource: wgpu::BindingResource::Sampler(entries.brdf_lut_sampler),
                    },
                ],
            })
        })
    }

    fn write_texture(&self, texture: &wgpu::Texture, write: &TextureWrite<'_>) {
        let image = write.image;
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                aspect: wgpu::TextureAspect::All,
                texture,
                mip_level: write.mip_level,
                origin: wgpu::Origin3d {
                    x: 0,
                    y: 0,
                    z: write.layer,
                },
            },
            &image.data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(image.bytes_per_row),
                rows_per_image: Some(image.height),
            },
            wgpu::Extent3d {
                width: image.width,
                height: image.height,
                depth_or_array_layers: 1,
            },
        );
    }

    fn destroy_texture(&self, texture: wgpu::Texture) {
        texture.destroy();
    }

    fn check_status(&self) -> Result<(), DeviceError> {
        if self.is_lost() {
            Err(DeviceError::Lost)
        } else {
            Ok(())
        }
    }
}
