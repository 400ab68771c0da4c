use std::time::Instant;

use anyhow::Context;
use nalgebra_glm as glm;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use winit::{
    dpi::PhysicalSize,
    event::{ElementState, Event, KeyboardInput, VirtualKeyCode, WindowEvent},
    event_loop::{ControlFlow, EventLoop},
    window::WindowBuilder,
};

use renderer::config::RendererConfig;
use renderer::scene::SphereScene;
use renderer::shaders::ShaderLibrary;
use renderer::vulkan_device::VulkanDevice;
use renderer::FrameDriver;

use crate::camera::FlyCamera;

/// Opens a window and renders into it until it is closed. Never returns on success.
pub fn run(config: RendererConfig, shaders: ShaderLibrary) -> anyhow::Result<()> {
    let event_loop = EventLoop::new();
    let window = WindowBuilder::new()
        .with_title("tracey")
        .with_inner_size(PhysicalSize::new(config.width, config.height))
        .with_resizable(false)
        .build(&event_loop)
        .context("creating the window")?;

    let device = VulkanDevice::new(
        &config,
        window.raw_display_handle(),
        window.raw_window_handle(),
    )?;
    let camera = FlyCamera::new(
        glm::vec3(0.0, 1.0, 6.0),
        glm::vec3(0.0, 0.0, 0.0),
        config.aspect_ratio(),
    );
    let keys = camera.held_keys();
    let mut driver = Some(FrameDriver::new(
        device,
        config,
        &SphereScene::default(),
        &shaders,
        Box::new(camera),
    )?);

    let mut last_frame = Instant::now();
    event_loop.run(move |event, _, control_flow| {
        *control_flow = ControlFlow::Poll;
        match event {
            Event::WindowEvent {
                event: WindowEvent::CloseRequested,
                window_id,
            } if window_id == window.id() => *control_flow = ControlFlow::Exit,
            Event::WindowEvent {
                event:
                    WindowEvent::KeyboardInput {
                        input:
                            KeyboardInput {
                                virtual_keycode: Some(key),
                                state,
                                ..
                            },
                        ..
                    },
                ..
            } => {
                if key == VirtualKeyCode::Escape {
                    *control_flow = ControlFlow::Exit;
                }
                keys.set(key, state == ElementState::Pressed);
            }
            Event::MainEventsCleared => {
                let Some(frames) = driver.as_mut() else {
                    return;
                };
                let now = Instant::now();
                let delta = (now - last_frame).as_secs_f32();
                last_frame = now;
                if let Err(error) = frames.tick(delta) {
                    log::error!("{:?}", anyhow::Error::new(error).context("rendering a frame"));
                    driver = None;
                    *control_flow = ControlFlow::ExitWithCode(1);
                }
            }
            Event::LoopDestroyed => {
                if let Some(frames) = driver.take() {
                    match frames.shutdown() {
                        Ok(_) => log::info!("renderer shut down"),
                        Err(error) => log::error!("shutdown failed: {}", error),
                    }
                }
            }
            _ => {}
        }
    })
}
