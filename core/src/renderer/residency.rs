//! Keeps baked IBL data resident on the GPU.
//!
//! The manager compares the [`SourceKey`]s of its inputs with what is currently
//! bound and only touches the device when something changed. Missing inputs are
//! replaced by neutral fallbacks so shaders can always sample a complete bind group.

use std::rc::Rc;

use ibl_bake_common::CubeFace;

use crate::error::DeviceError;
use crate::ibl::{BrdfLut, CubeEnvironment, IblEnvironment, Rgb, SourceKey};
use crate::renderer::device::{
    GpuDevice, IblBindGroupEntries, SamplerDesc, TextureDesc, TextureKind, TextureWrite,
};
use crate::renderer::pack::{pack_brdf_lut, pack_cube_mip_face};

/// Texture format of the irradiance and pre-filtered cubemaps.
pub const CUBEMAP_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;

/// Texture format of the BRDF LUT (scale, bias).
pub const BRDF_LUT_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rg16Float;

/// What to make resident on the next [`IblResidencyManager::prepare`].
#[derive(Debug, Clone, Copy, Default)]
pub struct IblInputs<'a> {
    /// Baked environment. `None` binds the white fallback cube.
    pub environment: Option<&'a IblEnvironment>,
    /// BRDF LUT. `None` binds the fallback LUT.
    pub brdf_lut: Option<&'a BrdfLut>,
    /// Re-upload everything even if the keys match.
    pub force_update: bool,
}

/// Borrowed view of the currently bound IBL resources.
pub struct GpuResourceHandle<'a, D: GpuDevice> {
    pub bind_group: &'a D::BindGroup,
    pub using_fallback_environment: bool,
    pub using_fallback_brdf: bool,
    /// Mip count of the bound pre-filtered cubemap. 1 for the fallback.
    pub prefiltered_mip_count: u32,
    /// Key of the bound environment, `None` for the fallback.
    pub source: Option<SourceKey>,
}

/// Coarse residency state, for callers that only need to know where the manager stands.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResidencyStatus {
    Uninitialized,
    Bound,
    FallbackBound,
    Stale,
}

struct GpuTextureSet<D: GpuDevice> {
    texture: D::Texture,
    view: D::TextureView,
    sampler: D::Sampler,
    byte_size: u64,
}

/// One bound texture. `key` is `None` when the slot holds a fallback.
struct Slot<D: GpuDevice> {
    key: Option<SourceKey>,
    set: Rc<GpuTextureSet<D>>,
}

struct BoundSet<D: GpuDevice> {
    bind_group: D::BindGroup,
    irradiance: Slot<D>,
    prefiltered: Slot<D>,
    brdf_lut: Slot<D>,
    prefiltered_mip_count: u32,
}

impl<D: GpuDevice> BoundSet<D> {
    fn uses_fallback_environment(&self) -> bool {
        self.irradiance.key.is_none()
    }

    fn uses_fallback_brdf(&self) -> bool {
        self.brdf_lut.key.is_none()
    }

    fn matches(&self, environment: Option<SourceKey>, brdf_lut: Option<SourceKey>) -> bool {
        self.irradiance.key == environment
            && self.prefiltered.key == environment
            && self.brdf_lut.key == brdf_lut
    }

    fn handle(&self) -> GpuResourceHandle<'_, D> {
        GpuResourceHandle {
            bind_group: &self.bind_group,
            using_fallback_environment: self.uses_fallback_environment(),
            using_fallback_brdf: self.uses_fallback_brdf(),
            prefiltered_mip_count: self.prefiltered_mip_count,
            source: self.irradiance.key,
        }
    }

    fn into_slots(self) -> [Slot<D>; 3] {
        [self.irradiance, self.prefiltered, self.brdf_lut]
    }
}

enum ResidencyState<D: GpuDevice> {
    Uninitialized,
    Bound(BoundSet<D>),
    FallbackBound(BoundSet<D>),
    /// Waiting for a rebuild. Keeps the previous set, if any, until its
    /// replacement exists.
    Stale(Option<BoundSet<D>>),
}

impl<D: GpuDevice> ResidencyState<D> {
    fn bound(&self) -> Option<&BoundSet<D>> {
        match self {
            ResidencyState::Bound(set) | ResidencyState::FallbackBound(set) => Some(set),
            _ => None,
        }
    }

    fn into_bound(self) -> Option<BoundSet<D>> {
        match self {
            ResidencyState::Bound(set) | ResidencyState::FallbackBound(set) => Some(set),
            ResidencyState::Stale(set) => set,
            ResidencyState::Uninitialized => None,
        }
    }
}

/// Singleton fallbacks, created on first use and kept until dispose or device loss.
struct Fallbacks<D: GpuDevice> {
    cube: Option<Rc<GpuTextureSet<D>>>,
    brdf_lut: Option<Rc<GpuTextureSet<D>>>,
}

impl<D: GpuDevice> Default for Fallbacks<D> {
    fn default() -> Self {
        Self {
            cube: None,
            brdf_lut: None,
        }
    }
}

/// Owns the device objects backing the IBL bind group.
///
/// Drive it from the thread that owns the device; it is neither `Send` nor `Sync`.
pub struct IblResidencyManager<D: GpuDevice> {
    state: ResidencyState<D>,
    layout: Option<D::BindGroupLayout>,
    fallbacks: Fallbacks<D>,
    needs_update: bool,
    allocated_bytes: u64,
    freed_bytes: u64,
}

impl<D: GpuDevice> Default for IblResidencyManager<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: GpuDevice> IblResidencyManager<D> {
    pub fn new() -> Self {
        Self {
            state: ResidencyState::Uninitialized,
            layout: None,
            fallbacks: Fallbacks::default(),
            needs_update: false,
            allocated_bytes: 0,
            freed_bytes: 0,
        }
    }

    pub fn status(&self) -> ResidencyStatus {
        match self.state {
            ResidencyState::Uninitialized => ResidencyStatus::Uninitialized,
            ResidencyState::Bound(_) => ResidencyStatus::Bound,
            ResidencyState::FallbackBound(_) => ResidencyStatus::FallbackBound,
            ResidencyState::Stale(_) => ResidencyStatus::Stale,
        }
    }

    /// The bound resources, if the manager is settled.
    pub fn handle(&self) -> Option<GpuResourceHandle<'_, D>> {
        self.state.bound().map(BoundSet::handle)
    }

    /// The IBL bind group layout, once created.
    pub fn bind_group_layout(&self) -> Option<&D::BindGroupLayout> {
        self.layout.as_ref()
    }

    /// Bytes allocated over the manager's lifetime.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }

    /// Bytes released over the manager's lifetime.
    pub fn freed_bytes(&self) -> u64 {
        self.freed_bytes
    }

    /// Bytes currently held on the device.
    pub fn resident_bytes(&self) -> u64 {
        self.allocated_bytes.saturating_sub(self.freed_bytes)
    }

    /// Forces the next [`prepare`](Self::prepare) to re-upload everything.
    pub fn mark_needs_update(&mut self) {
        self.needs_update = true;
    }

    /// Makes `inputs` resident and returns the bind group to render with.
    ///
    /// Returns the cached handle without touching the device when the input
    /// keys match what is bound. On error the previous resources stay alive
    /// and the manager is left `Stale`, so a later call can retry.
    pub fn prepare(
        &mut self,
        device: &D,
        inputs: &IblInputs<'_>,
    ) -> Result<GpuResourceHandle<'_, D>, DeviceError> {
        if let Err(err) = device.check_status() {
            if err == DeviceError::Lost {
                self.handle_device_lost();
            }
            return Err(err);
        }

        let environment_key = inputs.environment.map(|env| env.key);
        let brdf_key = inputs.brdf_lut.map(|lut| lut.key);
        let force = inputs.force_update || self.needs_update;

        let cache_hit = !force
            && self
                .state
                .bound()
                .is_some_and(|set| set.matches(environment_key, brdf_key));
        if cache_hit {
            log::debug!("IBL residency cache hit for {:?}", environment_key);
            return self.current_handle();
        }

        let previous = std::mem::replace(&mut self.state, ResidencyState::Stale(None));
        let previous = previous.into_bound();
        log::debug!(
            "IBL residency rebuilding (environment {:?}, brdf {:?}, forced: {})",
            environment_key,
            brdf_key,
            force
        );

        match self.build(device, inputs, previous.as_ref(), force) {
            Ok(next) => {
                if let Some(previous) = previous {
                    let [irradiance, prefiltered, brdf_lut] = previous.into_slots();
                    self.retire(device, irradiance);
                    self.retire(device, prefiltered);
                    self.retire(device, brdf_lut);
                }
                self.needs_update = false;

                self.state = if next.uses_fallback_environment() || next.uses_fallback_brdf() {
                    log::warn!(
                        "IBL bound with fallbacks (environment: {}, brdf: {})",
                        next.uses_fallback_environment(),
                        next.uses_fallback_brdf()
                    );
                    ResidencyState::FallbackBound(next)
                } else {
                    ResidencyState::Bound(next)
                };
                self.current_handle()
            }
            Err(err) => {
                if err == DeviceError::Lost {
                    drop(previous);
                    self.handle_device_lost();
                } else {
                    log::error!("Failed to make IBL resources resident: {}", err);
                    self.state = ResidencyState::Stale(previous);
                }
                Err(err)
            }
        }
    }

    /// Drops every device object after the device was lost.
    ///
    /// Nothing is destroyed explicitly since the objects died with the device.
    /// The next [`prepare`](Self::prepare) rebuilds from its inputs.
    pub fn handle_device_lost(&mut self) {
        log::error!(
            "IBL residency dropping {} resident bytes after device loss",
            self.resident_bytes()
        );
        self.state = ResidencyState::Stale(None);
        self.fallbacks = Fallbacks::default();
        self.layout = None;
        self.freed_bytes = self.allocated_bytes;
    }

    /// Destroys everything, fallbacks included, and returns to `Uninitialized`.
    pub fn dispose(&mut self, device: &D) {
        let state = std::mem::replace(&mut self.state, ResidencyState::Uninitialized);
        if let Some(set) = state.into_bound() {
            for slot in set.into_slots() {
                self.retire(device, slot);
            }
        }

        let fallbacks = std::mem::take(&mut self.fallbacks);
        for set in [fallbacks.cube, fallbacks.brdf_lut].into_iter().flatten() {
            self.release(device, set);
        }
        self.layout = None;
        self.needs_update = false;
        log::debug!(
            "IBL residency disposed, {} bytes still resident",
            self.resident_bytes()
        );
    }

    fn current_handle(&self) -> Result<GpuResourceHandle<'_, D>, DeviceError> {
        self.state
            .bound()
            .map(BoundSet::handle)
            .ok_or_else(|| DeviceError::Validation("IBL resources are not bound".into()))
    }

    fn build(
        &mut self,
        device: &D,
        inputs: &IblInputs<'_>,
        previous: Option<&BoundSet<D>>,
        force: bool,
    ) -> Result<BoundSet<D>, DeviceError> {
        if self.layout.is_none() {
            self.layout = Some(device.create_bind_group_layout("IBL Bind Group Layout")?);
        }

        // Slots built so far, released again if a later step fails.
        let mut built: Vec<Slot<D>> = Vec::with_capacity(3);
        let (irradiance, prefiltered, brdf_lut, prefiltered_mip_count) =
            match self.build_slots(device, inputs, previous, force, &mut built) {
                Ok(slots) => slots,
                Err(err) => {
                    for slot in built {
                        self.retire(device, slot);
                    }
                    return Err(err);
                }
            };

        let bind_group = match self.layout.as_ref() {
            Some(layout) => device.create_bind_group(
                "IBL Bind Group",
                layout,
                &IblBindGroupEntries {
                    irradiance_view: &irradiance.set.view,
                    irradiance_sampler: &irradiance.set.sampler,
                    prefiltered_view: &prefiltered.set.view,
                    prefiltered_sampler: &prefiltered.set.sampler,
                    brdf_lut_view: &brdf_lut.set.view,
                    brdf_lut_sampler: &brdf_lut.set.sampler,
                },
            ),
            None => Err(DeviceError::Validation("missing IBL bind group layout".into())),
        };

        match bind_group {
            Ok(bind_group) => Ok(BoundSet {
                bind_group,
                irradiance,
                prefiltered,
                brdf_lut,
                prefiltered_mip_count,
            }),
            Err(err) => {
                for slot in [irradiance, prefiltered, brdf_lut] {
                    self.retire(device, slot);
                }
                Err(err)
            }
        }
    }

    fn build_slots(
        &mut self,
        device: &D,
        inputs: &IblInputs<'_>,
        previous: Option<&BoundSet<D>>,
        force: bool,
        built: &mut Vec<Slot<D>>,
    ) -> Result<(Slot<D>, Slot<D>, Slot<D>, u32), DeviceError> {
        let (irradiance, prefiltered, prefiltered_mip_count) = match inputs.environment {
            Some(env) => {
                let key = Some(env.key);

                let irradiance = match reusable(previous.map(|p| &p.irradiance), key, force) {
                    Some(set) => set,
                    None => Rc::new(self.upload_cube(device, &env.irradiance, "IBL Irradiance")?),
                };
                built.push(Slot {
                    key,
                    set: Rc::clone(&irradiance),
                });

                let prefiltered = match reusable(previous.map(|p| &p.prefiltered), key, force) {
                    Some(set) => set,
                    None => Rc::new(self.upload_cube(
                        device,
                        &env.prefilter.environment,
                        "IBL Prefiltered",
                    )?),
                };
                built.push(Slot {
                    key,
                    set: Rc::clone(&prefiltered),
                });

                (
                    Slot {
                        key,
                        set: irradiance,
                    },
                    Slot {
                        key,
                        set: prefiltered,
                    },
                    env.prefilter.mip_count(),
                )
            }
            None => {
                let cube = self.fallback_cube(device)?;
                (
                    Slot {
                        key: None,
                        set: Rc::clone(&cube),
                    },
                    Slot {
                        key: None,
                        set: cube,
                    },
                    1,
                )
            }
        };

        let brdf_lut = match inputs.brdf_lut {
            Some(lut) => {
                let key = Some(lut.key);
                let set = match reusable(previous.map(|p| &p.brdf_lut), key, force) {
                    Some(set) => set,
                    None => Rc::new(self.upload_brdf_lut(device, lut)?),
                };
                Slot { key, set }
            }
            None => Slot {
                key: None,
                set: self.fallback_brdf_lut(device)?,
            },
        };

        // The cleanup copies must not keep the new sets shared.
        built.clear();
        Ok((irradiance, prefiltered, brdf_lut, prefiltered_mip_count))
    }

    fn fallback_cube(&mut self, device: &D) -> Result<Rc<GpuTextureSet<D>>, DeviceError> {
        if let Some(cube) = &self.fallbacks.cube {
            return Ok(Rc::clone(cube));
        }
        let white = CubeEnvironment::solid(SourceKey::default(), 1, Rgb::new(1.0, 1.0, 1.0));
        let cube = Rc::new(self.upload_cube(device, &white, "IBL Fallback Cube")?);
        self.fallbacks.cube = Some(Rc::clone(&cube));
        Ok(cube)
    }

    fn fallback_brdf_lut(&mut self, device: &D) -> Result<Rc<GpuTextureSet<D>>, DeviceError> {
        if let Some(lut) = &self.fallbacks.brdf_lut {
            return Ok(Rc::clone(lut));
        }
        // Scale 0, bias 1: specular reduces to the pre-filtered radiance.
        let neutral = BrdfLut {
            key: SourceKey::default(),
            size: 1,
            sample_count: 0,
            data: vec![[0.0, 1.0]],
        };
        let lut = Rc::new(self.upload_brdf_lut(device, &neutral)?);
        self.fallbacks.brdf_lut = Some(Rc::clone(&lut));
        Ok(lut)
    }

    fn upload_cube(
        &mut self,
        device: &D,
        cube: &CubeEnvironment,
        label: &str,
    ) -> Result<GpuTextureSet<D>, DeviceError> {
        if cube.mip_count() == 0 {
            return Err(DeviceError::Validation(format!("{} has no mip levels", label)));
        }
        let desc = TextureDesc {
            label: label.to_string(),
            kind: TextureKind::Cube,
            size: cube.size,
            mip_level_count: cube.mip_count(),
            format: CUBEMAP_FORMAT,
        };
        self.create_set(device, &desc, |texture| {
            for (level, mip) in cube.mips.iter().enumerate() {
                for face in CubeFace::ALL {
                    let image = pack_cube_mip_face(mip, face, cube.channels);
                    device.write_texture(
                        texture,
                        &TextureWrite {
                            mip_level: level as u32,
                            layer: face.index() as u32,
                            image: &image,
                        },
                    );
                }
            }
        })
    }

    fn upload_brdf_lut(
        &mut self,
        device: &D,
        lut: &BrdfLut,
    ) -> Result<GpuTextureSet<D>, DeviceError> {
        let desc = TextureDesc {
            label: "IBL BRDF LUT".to_string(),
            kind: TextureKind::D2,
            size: lut.size,
            mip_level_count: 1,
            format: BRDF_LUT_FORMAT,
        };
        self.create_set(device, &desc, |texture| {
            let image = pack_brdf_lut(lut);
            device.write_texture(
                texture,
                &TextureWrite {
                    mip_level: 0,
                    layer: 0,
                    image: &image,
                },
            );
        })
    }

    /// Creates texture, view and sampler in that order, uploading between the
    /// first two. A failure destroys whatever was already created.
    fn create_set(
        &mut self,
        device: &D,
        desc: &TextureDesc,
        upload: impl FnOnce(&D::Texture),
    ) -> Result<GpuTextureSet<D>, DeviceError> {
        let texture = device.create_texture(desc)?;
        upload(&texture);

        let view = match device.create_texture_view(&texture, desc) {
            Ok(view) => view,
            Err(err) => {
                device.destroy_texture(texture);
                return Err(err);
            }
        };
        let sampler_desc = SamplerDesc {
            label: format!("{} Sampler", desc.label),
            mipmapped: desc.mip_level_count > 1,
        };
        let sampler = match device.create_sampler(&sampler_desc) {
            Ok(sampler) => sampler,
            Err(err) => {
                drop(view);
                device.destroy_texture(texture);
                return Err(err);
            }
        };

        let byte_size = desc.byte_size();
        self.allocated_bytes += byte_size;
        log::debug!("Uploaded {} ({} bytes)", desc.label, byte_size);

        Ok(GpuTextureSet {
            texture,
            view,
            sampler,
            byte_size,
        })
    }

    /// Releases a slot's texture unless it is still shared with a live set or
    /// the fallback cache.
    fn retire(&mut self, device: &D, slot: Slot<D>) {
        self.release(device, slot.set);
    }

    fn release(&mut self, device: &D, set: Rc<GpuTextureSet<D>>) {
        if let Ok(set) = Rc::try_unwrap(set) {
            self.freed_bytes += set.byte_size;
            let GpuTextureSet { texture, view, .. } = set;
            drop(view);
            device.destroy_texture(texture);
        }
    }
}

/// The previous slot's texture set if it already holds `key` and no rebuild is forced.
fn reusable<D: GpuDevice>(
    previous: Option<&Slot<D>>,
    key: Option<SourceKey>,
    force: bool,
) -> Option<Rc<GpuTextureSet<D>>> {
    previous
        .filter(|slot| !force && slot.key == key)
        .map(|slot| Rc::clone(&slot.set))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ibl::{bake_brdf_lut, bake_environment, EnvironmentSource, IblSettings};
    use crate::renderer::device::mock::MockDevice;

    fn small_settings() -> IblSettings {
        IblSettings {
            irradiance_size: 4,
            irradiance_samples: 16,
            prefiltered_size: 8,
            prefiltered_mip_levels: 3,
            prefilter_samples: 16,
            brdf_lut_size: 4,
            brdf_lut_samples: 16,
            compute_spherical_harmonics: false,
            ..IblSettings::default()
        }
    }

    fn bake(id: u64, version: u64) -> IblEnvironment {
        let source: EnvironmentSource = CubeEnvironment::solid(
            SourceKey::new(id, version),
            8,
            Rgb::new(0.5, 0.25, 1.0),
        )
        .into();
        bake_environment(&source, &small_settings()).unwrap()
    }

    #[test]
    fn test_fallback_is_idempotent() {
        let device = MockDevice::default();
        let mut manager = IblResidencyManager::new();
        assert_eq!(manager.status(), ResidencyStatus::Uninitialized);

        let inputs = IblInputs::default();
        let first_group = {
            let handle = manager.prepare(&device, &inputs).unwrap();
            assert!(handle.using_fallback_environment);
            assert!(handle.using_fallback_brdf);
            assert_eq!(handle.prefiltered_mip_count, 1);
            assert_eq!(handle.source, None);
            *handle.bind_group
        };
        assert_eq!(manager.status(), ResidencyStatus::FallbackBound);

        // One fallback cube shared by both cube slots, one fallback LUT.
        assert_eq!(device.textures_created.get(), 2);
        let creations = device.creations();

        let second_group = *manager.prepare(&device, &inputs).unwrap().bind_group;
        assert_eq!(first_group, second_group);
        assert_eq!(device.creations(), creations);
    }

    #[test]
    fn test_fallback_uploads_neutral_texels() {
        let device = MockDevice::default();
        let mut manager = IblResidencyManager::new();
        manager.prepare(&device, &IblInputs::default()).unwrap();

        let writes = device.writes.borrow();
        // Six 1x1 cube faces plus one LUT texel.
        assert_eq!(writes.len(), 7);
        assert!(writes.iter().all(|w| w.width == 1 && w.mip_level == 0));
    }

    #[test]
    fn test_cache_hit_creates_nothing() {
        let device = MockDevice::default();
        let mut manager = IblResidencyManager::new();
        let environment = bake(1, 1);
        let lut = bake_brdf_lut(&small_settings()).unwrap();
        let inputs = IblInputs {
            environment: Some(&environment),
            brdf_lut: Some(&lut),
            force_update: false,
        };

        {
            let handle = manager.prepare(&device, &inputs).unwrap();
            assert!(!handle.using_fallback_environment);
            assert!(!handle.using_fallback_brdf);
            assert_eq!(handle.prefiltered_mip_count, 3);
            assert_eq!(handle.source, Some(SourceKey::new(1, 1)));
        }
        assert_eq!(manager.status(), ResidencyStatus::Bound);

        let creations = device.creations();
        let writes = device.writes.borrow().len();
        for _ in 0..3 {
            manager.prepare(&device, &inputs).unwrap();
        }
        assert_eq!(device.creations(), creations);
        assert_eq!(device.writes.borrow().len(), writes);
        assert!(device.destroyed.borrow().is_empty());
    }

    #[test]
    fn test_every_face_and_mip_is_uploaded() {
        let device = MockDevice::default();
        let mut manager = IblResidencyManager::new();
        let environment = bake(1, 1);
        let lut = bake_brdf_lut(&small_settings()).unwrap();
        manager
            .prepare(
                &device,
                &IblInputs {
                    environment: Some(&environment),
                    brdf_lut: Some(&lut),
                    force_update: false,
                },
            )
            .unwrap();

        let writes = device.writes.borrow();
        // Irradiance: 1 mip, prefiltered: 3 mips, LUT: 1 image.
        assert_eq!(writes.len(), 6 + 6 * 3 + 1);
        for layer in 0..6 {
            for mip in 0..3 {
                assert!(writes
                    .iter()
                    .any(|w| w.layer == layer && w.mip_level == mip && w.width == 8 >> mip));
            }
        }
    }

    #[test]
    fn test_version_change_rebuilds_environment_only() {
        let device = MockDevice::default();
        let mut manager = IblResidencyManager::new();
        let lut = bake_brdf_lut(&small_settings()).unwrap();
        let v1 = bake(7, 1);
        let v2 = bake(7, 2);

        manager
            .prepare(
                &device,
                &IblInputs {
                    environment: Some(&v1),
                    brdf_lut: Some(&lut),
                    force_update: false,
                },
            )
            .unwrap();
        let textures = device.textures_created.get();
        let resident = manager.resident_bytes();

        let handle = manager
            .prepare(
                &device,
                &IblInputs {
                    environment: Some(&v2),
                    brdf_lut: Some(&lut),
                    force_update: false,
                },
            )
            .unwrap();
        assert_eq!(handle.source, Some(SourceKey::new(7, 2)));

        // Irradiance and prefiltered rebuilt, LUT reused.
        assert_eq!(device.textures_created.get(), textures + 2);
        assert_eq!(device.layouts_created.get(), 1);
        assert_eq!(device.destroyed.borrow().len(), 2);
        assert_eq!(manager.resident_bytes(), resident);
        assert!(manager.freed_bytes() > 0);
    }

    #[test]
    fn test_force_update_reuploads() {
        let device = MockDevice::default();
        let mut manager = IblResidencyManager::new();
        let environment = bake(3, 1);
        let mut inputs = IblInputs {
            environment: Some(&environment),
            brdf_lut: None,
            force_update: false,
        };

        manager.prepare(&device, &inputs).unwrap();
        let textures = device.textures_created.get();

        inputs.force_update = true;
        manager.prepare(&device, &inputs).unwrap();
        // Environment re-uploaded; the fallback LUT is a cached singleton.
        assert_eq!(device.textures_created.get(), textures + 2);

        manager.mark_needs_update();
        inputs.force_update = false;
        manager.prepare(&device, &inputs).unwrap();
        assert_eq!(device.textures_created.get(), textures + 4);

        // The flag is consumed by the rebuild.
        manager.prepare(&device, &inputs).unwrap();
        assert_eq!(device.textures_created.get(), textures + 4);
    }

    #[test]
    fn test_switching_to_fallback_keeps_lut() {
        let device = MockDevice::default();
        let mut manager = IblResidencyManager::new();
        let environment = bake(2, 1);
        let lut = bake_brdf_lut(&small_settings()).unwrap();

        manager
            .prepare(
                &device,
                &IblInputs {
                    environment: Some(&environment),
                    brdf_lut: Some(&lut),
                    force_update: false,
                },
            )
            .unwrap();
        let handle = manager
            .prepare(
                &device,
                &IblInputs {
                    environment: None,
                    brdf_lut: Some(&lut),
                    force_update: false,
                },
            )
            .unwrap();
        assert!(handle.using_fallback_environment);
        assert!(!handle.using_fallback_brdf);
        assert_eq!(manager.status(), ResidencyStatus::FallbackBound);
        assert_eq!(device.destroyed.borrow().len(), 2);
    }

    #[test]
    fn test_device_loss_rebuilds_on_next_prepare() {
        let device = MockDevice::default();
        let mut manager = IblResidencyManager::new();
        let environment = bake(5, 1);
        let inputs = IblInputs {
            environment: Some(&environment),
            brdf_lut: None,
            force_update: false,
        };

        manager.prepare(&device, &inputs).unwrap();
        let layouts = device.layouts_created.get();
        let textures = device.textures_created.get();

        device.lost.set(true);
        let err = manager.prepare(&device, &inputs).err();
        assert_eq!(err, Some(DeviceError::Lost));
        assert!(err.is_some_and(|e| e.is_recoverable()));
        assert_eq!(manager.status(), ResidencyStatus::Stale);
        assert_eq!(manager.resident_bytes(), 0);
        assert!(manager.handle().is_none());

        // A replacement device comes up; everything is rebuilt from the same inputs.
        device.lost.set(false);
        let handle = manager.prepare(&device, &inputs).unwrap();
        assert_eq!(handle.source, Some(SourceKey::new(5, 1)));
        assert_eq!(device.layouts_created.get(), layouts + 1);
        assert_eq!(device.textures_created.get(), textures * 2);
        assert!(device.destroyed.borrow().is_empty());
    }

    #[test]
    fn test_fatal_error_keeps_previous_resources() {
        let device = MockDevice::default();
        let mut manager = IblResidencyManager::new();
        let v1 = bake(9, 1);
        let v2 = bake(9, 2);

        manager
            .prepare(
                &device,
                &IblInputs {
                    environment: Some(&v1),
                    brdf_lut: None,
                    force_update: false,
                },
            )
            .unwrap();
        let resident = manager.resident_bytes();

        device.fail_texture_at.set(1);
        let err = manager
            .prepare(
                &device,
                &IblInputs {
                    environment: Some(&v2),
                    brdf_lut: None,
                    force_update: false,
                },
            )
            .err();
        assert!(matches!(err, Some(DeviceError::OutOfMemory(_))));
        assert!(!err.is_some_and(|e| e.is_recoverable()));
        assert_eq!(manager.status(), ResidencyStatus::Stale);
        assert_eq!(manager.resident_bytes(), resident);
        assert!(device.destroyed.borrow().is_empty());

        // Retrying succeeds and retires the old textures.
        manager
            .prepare(
                &device,
                &IblInputs {
                    environment: Some(&v2),
                    brdf_lut: None,
                    force_update: false,
                },
            )
            .unwrap();
        assert_eq!(manager.status(), ResidencyStatus::FallbackBound);
        assert_eq!(device.destroyed.borrow().len(), 2);
    }

    #[test]
    fn test_partial_rebuild_failure_destroys_new_textures() {
        let device = MockDevice::default();
        let mut manager = IblResidencyManager::new();
        let v1 = bake(9, 1);
        let v2 = bake(9, 2);

        manager
            .prepare(
                &device,
                &IblInputs {
                    environment: Some(&v1),
                    brdf_lut: None,
                    force_update: false,
                },
            )
            .unwrap();
        let resident = manager.resident_bytes();
        let textures = device.textures_created.get();

        // The new irradiance cube is created, then the pre-filtered one fails.
        device.fail_texture_at.set(2);
        let inputs = IblInputs {
            environment: Some(&v2),
            brdf_lut: None,
            force_update: false,
        };
        let err = manager.prepare(&device, &inputs).err();
        assert!(matches!(err, Some(DeviceError::OutOfMemory(_))));
        assert_eq!(manager.status(), ResidencyStatus::Stale);
        assert!(manager.handle().is_none());

        assert_eq!(device.textures_created.get(), textures + 1);
        assert_eq!(device.destroyed.borrow().len(), 1);
        // 4x4 irradiance cube, one mip, Rgba16Float.
        assert_eq!(device.destroyed_bytes.get(), 4 * 4 * 8 * 6);
        assert_eq!(manager.freed_bytes(), device.destroyed_bytes.get());
        assert_eq!(manager.resident_bytes(), resident);

        manager.prepare(&device, &inputs).unwrap();
        assert_eq!(manager.status(), ResidencyStatus::FallbackBound);
        assert_eq!(device.destroyed.borrow().len(), 3);
        assert_eq!(manager.freed_bytes(), device.destroyed_bytes.get());
    }

    #[test]
    fn test_bind_group_failure_destroys_new_textures() {
        let device = MockDevice::default();
        let mut manager = IblResidencyManager::new();
        let v1 = bake(11, 1);
        let v2 = bake(11, 2);
        let lut = bake_brdf_lut(&small_settings()).unwrap();

        manager
            .prepare(
                &device,
                &IblInputs {
                    environment: Some(&v1),
                    brdf_lut: Some(&lut),
                    force_update: false,
                },
            )
            .unwrap();
        let resident = manager.resident_bytes();
        let textures = device.textures_created.get();
        let groups = device.bind_groups_created.get();

        device.fail_next_bind_group.set(true);
        let inputs = IblInputs {
            environment: Some(&v2),
            brdf_lut: Some(&lut),
            force_update: false,
        };
        let err = manager.prepare(&device, &inputs).err();
        assert!(matches!(err, Some(DeviceError::Validation(_))));
        assert_eq!(manager.status(), ResidencyStatus::Stale);

        // Both new cubes are destroyed; the reused LUT stays with the previous set.
        assert_eq!(device.textures_created.get(), textures + 2);
        assert_eq!(device.bind_groups_created.get(), groups);
        assert_eq!(device.destroyed.borrow().len(), 2);
        assert_eq!(manager.freed_bytes(), device.destroyed_bytes.get());
        assert_eq!(manager.resident_bytes(), resident);

        let handle = manager.prepare(&device, &inputs).unwrap();
        assert_eq!(handle.source, Some(SourceKey::new(11, 2)));
        assert!(!handle.using_fallback_brdf);
        assert_eq!(manager.status(), ResidencyStatus::Bound);
        assert_eq!(device.destroyed.borrow().len(), 4);
        assert_eq!(manager.resident_bytes(), resident);
    }

    #[test]
    fn test_dispose_frees_everything() {
        let device = MockDevice::default();
        let mut manager = IblResidencyManager::new();
        let environment = bake(4, 1);
        let lut = bake_brdf_lut(&small_settings()).unwrap();

        manager.prepare(&device, &IblInputs::default()).unwrap();
        manager
            .prepare(
                &device,
                &IblInputs {
                    environment: Some(&environment),
                    brdf_lut: Some(&lut),
                    force_update: false,
                },
            )
            .unwrap();
        assert!(manager.resident_bytes() > 0);

        manager.dispose(&device);
        assert_eq!(manager.status(), ResidencyStatus::Uninitialized);
        assert_eq!(manager.resident_bytes(), 0);
        assert_eq!(manager.freed_bytes(), manager.allocated_bytes());
        assert_eq!(
            device.destroyed.borrow().len() as u32,
            device.textures_created.get()
        );
        assert!(manager.bind_group_layout().is_none());
    }
}
