//! Frame loop demo
//!
//! Spins a push-constant driven triangle through the renderer so the
//! frames-in-flight loop, resize handling and pipeline rebuilds can be
//! watched with validation layers on.

use ash::vk;
use glfw::{Action, Key, WindowEvent};
use gpu_core::logging;
use gpu_core::prelude::*;
use std::sync::Arc;
use std::time::Instant;

const CONFIG_PATH: &str = "frame_demo.toml";
const TRIANGLE: &str = "triangle";

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct PushData {
    time: f32,
    aspect: f32,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = RendererConfig::load_or_default(CONFIG_PATH)?;
    logging::init_with_level(&config.log_level);
    config.validate()?;

    log::info!("Starting {} ({} frames in flight)", config.application_name, config.max_frames_in_flight);

    let mut window = GlfwWindow::new(&config.application_name, 1280, 720)?;
    let device = Arc::new(Device::new(&mut window, &config)?);
    let mut renderer = Renderer::new(&device, &window, &config)?;

    let mut pipelines = PipelineSet::new();
    let recipe = PipelineBuilder::from_shader_names(&device, &config.shaders, "triangle.vert", "triangle.frag")?
        .provider(&PipelineKind::Fullscreen)?
        .push_constants::<PushData>(vk::ShaderStageFlags::VERTEX)
        .target(PipelineTarget::for_swapchain(renderer.swapchain()?));
    pipelines.insert(TRIANGLE, recipe)?;

    let start = Instant::now();
    let mut generation = renderer.swapchain_generation();

    while !window.should_close() {
        for event in window.poll_events() {
            match event {
                WindowEvent::Key(Key::Escape, _, Action::Press, _) | WindowEvent::Close => {
                    window.set_should_close(true);
                }
                _ => {}
            }
        }

        let Some(frame) = renderer.begin_frame(&mut window)? else {
            continue;
        };

        if renderer.swapchain_generation() != generation {
            generation = renderer.swapchain_generation();
            log::debug!("Swapchain generation {generation}, rebuilding pipelines");
            pipelines.rebuild_all(&PipelineTarget::for_swapchain(renderer.swapchain()?))?;
        }

        renderer.begin_rendering(&frame)?;
        if let Some(triangle) = pipelines.get(TRIANGLE) {
            let push = PushData { time: start.elapsed().as_secs_f32(), aspect: renderer.aspect_ratio() };
            triangle.bind(frame.command_buffer);
            triangle.push_constants(frame.command_buffer, vk::ShaderStageFlags::VERTEX, &push);
            unsafe { device.handle().cmd_draw(frame.command_buffer, 3, 1, 0, 0) };
        }
        renderer.end_rendering(&frame)?;
        renderer.end_frame(&mut window, frame)?;
    }

    renderer.wait_idle()?;
    log::info!("Shutting down");
    Ok(())
}
