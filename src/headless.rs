use std::path::Path;

use anyhow::Context;
use renderer::camera::FixedCamera;
use renderer::config::RendererConfig;
use renderer::headless::HeadlessDevice;
use renderer::pipeline::exports;
use renderer::scene::SphereScene;
use renderer::shaders::ShaderLibrary;
use renderer::FrameDriver;

/// Runs the configured number of frames on the software device.
pub fn run(config: RendererConfig) -> anyhow::Result<()> {
    let device = HeadlessDevice::from_config(&config);
    let shaders = ShaderLibrary::empty_modules(&exports::SHADERS);
    let camera = Box::new(FixedCamera::default_view(config.aspect_ratio()));
    let frames = config.headless.frames;
    let dump = config.headless.dump.clone();

    let mut driver = FrameDriver::new(device, config, &SphereScene::default(), &shaders, camera)?;
    let mut blocked = 0;
    for _ in 0..frames {
        if driver.tick(1.0 / 60.0)?.blocked {
            blocked += 1;
        }
    }
    let stats = driver.fence().stats();
    let device = driver.shutdown()?;
    log::info!(
        "{} frames, {} submissions, {} of them waited for a slot",
        frames,
        stats.submissions,
        blocked
    );

    if let Some(path) = dump {
        dump_last_frame(&device, &path)?;
    }
    Ok(())
}

fn dump_last_frame(device: &HeadlessDevice, path: &Path) -> anyhow::Result<()> {
    let frame = device
        .presented_frames()
        .last()
        .context("no frame was presented")?;
    let desc = device
        .texture_desc(frame.target)
        .context("presented target is gone")?;
    let texels = device
        .texture_texels(frame.target)
        .context("presented target is gone")?;
    image::save_buffer(
        path,
        texels,
        desc.width,
        desc.height,
        image::ColorType::Rgba8,
    )
    .with_context(|| format!("writing {}", path.display()))?;
    log::info!("frame {} written to {}", frame.frame, path.display());
    Ok(())
}
