//! Bakes a procedural sky, uploads it through wgpu without a window, and
//! reports what ended up resident.
//!
//! Run with `RUST_LOG=info` to see the bake and residency log.

use std::f32::consts::PI;

use anyhow::{Context, Result};
use cgmath::{InnerSpace, Vector3};
use ibl_bake::common::equirect_uv_to_direction;
use ibl_bake::ibl::{bake_brdf_lut, bake_environment, IblSettings};
use ibl_bake::renderer::{IblInputs, IblResidencyManager, WgpuDevice};
use ibl_bake::{EnvironmentSource, PanoramicEnvironment, PixelData, SourceKey};

const SKY_ID: u64 = 1;
const PANORAMA_WIDTH: u32 = 256;
const PANORAMA_HEIGHT: u32 = 128;

/// Blue gradient sky over a brown ground with a small bright sun.
fn procedural_sky(version: u64, sun_elevation: f32) -> PanoramicEnvironment {
    let sun = Vector3::new(sun_elevation.cos(), sun_elevation.sin(), 0.3).normalize();
    let mut pixels = Vec::with_capacity((PANORAMA_WIDTH * PANORAMA_HEIGHT * 3) as usize);

    for y in 0..PANORAMA_HEIGHT {
        for x in 0..PANORAMA_WIDTH {
            let u = (x as f32 + 0.5) / PANORAMA_WIDTH as f32;
            let v = (y as f32 + 0.5) / PANORAMA_HEIGHT as f32;
            let dir = equirect_uv_to_direction(u, v);

            let mut color = if dir.y >= 0.0 {
                let t = dir.y.sqrt();
                Vector3::new(0.6, 0.75, 0.95) * (1.0 - t) + Vector3::new(0.15, 0.3, 0.8) * t
            } else {
                Vector3::new(0.25, 0.2, 0.15)
            };
            if dir.dot(sun) > (2.0 * PI / 180.0).cos() {
                color += Vector3::new(50.0, 45.0, 40.0);
            }
            pixels.extend_from_slice(&[color.x, color.y, color.z]);
        }
    }

    PanoramicEnvironment::new(
        SourceKey::new(SKY_ID, version),
        PANORAMA_WIDTH,
        PANORAMA_HEIGHT,
        3,
        PixelData::F32(pixels),
    )
}

fn create_device() -> Result<WgpuDevice> {
    let instance = wgpu::Instance::default();
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::default(),
        compatible_surface: None,
        force_fallback_adapter: false,
    }))
    .context("no graphics adapter available")?;
    log::info!("Using adapter {:?}", adapter.get_info().name);

    let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
        required_features: wgpu::Features::empty(),
        required_limits: wgpu::Limits::default(),
        label: Some("Headless Bake Device"),
        memory_hints: Default::default(),
        trace: wgpu::Trace::Off,
        experimental_features: Default::default(),
    }))
    .context("failed to create device")?;

    Ok(WgpuDevice::new(device, queue))
}

fn run() -> Result<()> {
    let settings = IblSettings {
        irradiance_samples: 256,
        prefilter_samples: 128,
        brdf_lut_size: 128,
        brdf_lut_samples: 256,
        resample_panorama_size: Some(128),
        ..IblSettings::default()
    };

    let source = EnvironmentSource::from(procedural_sky(1, 0.6));
    let environment = bake_environment(&source, &settings)?;
    let brdf_lut = bake_brdf_lut(&settings)?;

    if let Some(sh) = &environment.spherical_harmonics {
        let up = sh.evaluate_irradiance(Vector3::unit_y());
        let down = sh.evaluate_irradiance(-Vector3::unit_y());
        log::info!(
            "SH irradiance up ({:.3}, {:.3}, {:.3}) down ({:.3}, {:.3}, {:.3})",
            up.x,
            up.y,
            up.z,
            down.x,
            down.y,
            down.z
        );
    }

    let device = create_device()?;
    let mut residency = IblResidencyManager::new();

    {
        let handle = residency.prepare(&device, &IblInputs::default())?;
        log::info!(
            "Fallback bound (environment: {}, brdf: {})",
            handle.using_fallback_environment,
            handle.using_fallback_brdf
        );
    }

    let inputs = IblInputs {
        environment: Some(&environment),
        brdf_lut: Some(&brdf_lut),
        force_update: false,
    };
    {
        let handle = residency.prepare(&device, &inputs)?;
        log::info!(
            "Bound {:?} with {} pre-filtered mips",
            handle.source,
            handle.prefiltered_mip_count
        );
    }
    // Same keys: served from the cache.
    residency.prepare(&device, &inputs)?;

    // The sun moves; a new version replaces the environment but keeps the LUT.
    let moved = bake_environment(&EnvironmentSource::from(procedural_sky(2, 0.3)), &settings)?;
    residency.prepare(
        &device,
        &IblInputs {
            environment: Some(&moved),
            ..inputs
        },
    )?;

    log::info!(
        "Allocated {} bytes, freed {} bytes, resident {} bytes",
        residency.allocated_bytes(),
        residency.freed_bytes(),
        residency.resident_bytes()
    );

    residency.dispose(&device);
    log::info!("Disposed, {} bytes resident", residency.resident_bytes());
    Ok(())
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
