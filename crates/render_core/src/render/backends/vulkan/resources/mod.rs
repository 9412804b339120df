//! GPU memory-backed resources: buffers, images, meshes and indirect draws

pub mod buffer;
pub mod indirect_draw;
pub mod memory_allocator;
pub mod mesh;
pub mod texture;
pub mod vma_pool;

pub use buffer::Buffer;
pub use indirect_draw::{IndirectDrawCommands, INDIRECT_COMMAND_STRIDE};
pub use memory_allocator::{Allocation, AllocationInfo, MemoryAllocator, MemoryUsage, PoolAllocator, PoolKey};
pub use mesh::{DrawParams, Mesh};
pub use texture::Texture;
pub use vma_pool::VmaPool;
