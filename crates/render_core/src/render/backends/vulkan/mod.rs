//! Vulkan backend implementation
//!
//! Organized into initialization, resources, rendering and state modules.
//! Every resource borrows the [`GraphicsDevice`] that created it.

/// Device creation and the native entry point seam
pub mod initialization;

/// Buffers, images, meshes and memory allocation
pub mod resources;

/// Command buffers, render passes and render targets
pub mod rendering;

/// Fences and semaphores
pub mod state;

#[cfg(test)]
pub(crate) mod test_support;

pub use initialization::context::{
    DeviceFeatures, DeviceInfo, DeviceParts, DeviceQueues, ErrorClass, GpuError, GpuResult, GraphicsDevice, Queue,
};
pub use initialization::{create_headless, AshDevice, DeviceApi};

pub use resources::{
    Allocation, AllocationInfo, Buffer, DrawParams, IndirectDrawCommands, MemoryAllocator, MemoryUsage, Mesh,
    PoolAllocator, Texture, VmaPool,
};

pub use rendering::{
    AttachmentDesc, CommandBuffer, CommandBufferState, CommandBuffers, ImageView, RenderPass, RenderTarget,
    SubpassDescription,
};

pub use state::{Fence, FenceState, Semaphore};
