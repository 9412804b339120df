//! # Render Core
//!
//! GPU resource and command-buffer lifecycle layer over Vulkan.
//!
//! A [`GraphicsDevice`] owns the native device, its queues, a shared command
//! pool and the memory allocator. Buffers, textures, meshes, render passes,
//! render targets, command buffers and sync objects borrow it and release
//! their native objects exactly once, either explicitly or on drop.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use render_core::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RenderCoreConfig::new("offscreen");
//!     render_core::foundation::logging::init_with_level(config.level_filter());
//!     let device = render_core::create_headless(config)?;
//!     let mut fence = Fence::new(&device, false)?;
//!     device.wait_idle()?;
//!     fence.release();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod config;
pub mod core;
pub mod foundation;
pub mod render;

pub use crate::core::config::RenderCoreConfig;
pub use foundation::Color;
pub use render::vulkan::{
    create_headless, AttachmentDesc, Buffer, CommandBuffer, CommandBufferState, CommandBuffers, DeviceApi,
    DeviceFeatures, DeviceInfo, DrawParams, ErrorClass, Fence, FenceState, GpuError, GpuResult, GraphicsDevice,
    ImageView, IndirectDrawCommands, MemoryUsage, Mesh, RenderPass, RenderTarget, Semaphore, SubpassDescription,
    Texture,
};

/// Common imports for library users
pub mod prelude {
    pub use crate::{
        AttachmentDesc, Buffer, Color, CommandBuffers, DrawParams, ErrorClass, Fence, GpuError, GpuResult,
        GraphicsDevice, IndirectDrawCommands, MemoryUsage, Mesh, RenderCoreConfig, RenderPass, RenderTarget,
        Semaphore, SubpassDescription, Texture,
    };
}
