//! Command recording, render passes and offscreen render targets

pub mod commands;
pub mod render_pass;
pub mod render_target;

pub use commands::{CommandBuffer, CommandBufferState, CommandBuffers};
pub use render_pass::{default_dependencies, AttachmentDesc, ImageView, RenderPass, SubpassDescription};
pub use render_target::RenderTarget;
