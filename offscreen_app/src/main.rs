//! Offscreen demo application
//!
//! Creates a headless device, renders one cleared frame into an offscreen
//! target with a mesh uploaded alongside, waits on a fence and tears
//! everything down in dependency order. Pass a `.toml` or `.ron` config path
//! as the first argument to override the defaults.

use ash::vk;
use render_core::prelude::*;
use render_core::CommandBufferState;

const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;

fn load_config() -> Result<RenderCoreConfig, Box<dyn std::error::Error>> {
    match std::env::args().nth(1) {
        Some(path) => Ok(RenderCoreConfig::load_validated(&path)?),
        None => Ok(RenderCoreConfig::new("offscreen")),
    }
}

fn run(device: &GraphicsDevice) -> GpuResult<()> {
    let clear_color = device.config().default_clear_color;
    let attachments = [
        AttachmentDesc::color(vk::Format::R8G8B8A8_UNORM),
        AttachmentDesc::depth(vk::Format::D32_SFLOAT),
    ];
    let mut target = RenderTarget::load(
        device,
        vk::Offset2D { x: 0, y: 0 },
        vk::Extent2D { width: WIDTH, height: HEIGHT },
        &attachments,
        1,
    )?;
    log::info!(
        "Render target ready: {} frame buffer(s), {} attachment(s) each",
        target.frame_buffer_count(),
        target.attachments_per_buffer()
    );

    let vertices: [[f32; 3]; 4] = [
        [-0.5, -0.5, 0.0],
        [0.5, -0.5, 0.0],
        [0.5, 0.5, 0.0],
        [-0.5, 0.5, 0.0],
    ];
    let indices: [u32; 6] = [0, 1, 2, 2, 3, 0];
    let mut quad = Mesh::load(device, &vertices, Some(&indices[..]), false)?;
    log::info!(
        "Quad uploaded: {} vertices, {} indices",
        quad.vertices_count(),
        quad.indices_count()
    );

    let mut commands = CommandBuffers::load(device, 1, vk::CommandBufferLevel::PRIMARY, false, None)?;
    // No pipeline is bound here, so the pass only clears its attachments.
    target.record_command_buffer(&commands, |_cmd, _index| Ok(()), clear_color, 1.0, 0)?;

    let mut fence = Fence::new(device, false)?;
    let recorded: Vec<_> = commands.commands().iter().collect();
    device.submit(&recorded, device.graphics_queue(), &[], &[], &[], Some(&fence), false)?;
    fence.wait()?;

    if let Some(cmd) = commands.command_at(0) {
        debug_assert_eq!(cmd.state(), CommandBufferState::Submitted);
    }
    log::info!("Frame complete");

    fence.release();
    commands.release();
    quad.release();
    target.release();
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    render_core::foundation::logging::init_with_level(config.level_filter());
    log::info!("Starting {}", config.application_name);

    let device = render_core::create_headless(config)?;
    log::info!("Using {}", device.info());

    run(&device)?;
    device.wait_idle()?;
    log::info!("Shutdown complete");
    Ok(())
}
