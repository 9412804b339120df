//! Native device entry points
//!
//! Every Vulkan call the resource and command layer makes goes through
//! [`DeviceApi`]. The production implementation forwards to `ash`; tests
//! plug in a recording fake so lifecycle rules can be checked without a GPU.

use ash::prelude::VkResult;
use ash::vk;
use std::ffi::c_void;

/// Native graphics device entry points used by the resource layer
///
/// Implementations must be shareable across threads: secondary command
/// buffers are recorded concurrently, each from its own command pool, while
/// sharing one device. Queue submission is externally synchronized; callers
/// must not submit to the same queue from two threads without a lock.
pub trait DeviceApi: Send + Sync {
    // Buffers and memory

    /// Create a buffer object without backing memory
    fn create_buffer(&self, create_info: &vk::BufferCreateInfo) -> VkResult<vk::Buffer>;
    /// Destroy a buffer object
    fn destroy_buffer(&self, buffer: vk::Buffer);
    /// Query memory requirements of a buffer
    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    /// Allocate raw device memory
    fn allocate_memory(&self, allocate_info: &vk::MemoryAllocateInfo) -> VkResult<vk::DeviceMemory>;
    /// Free raw device memory
    fn free_memory(&self, memory: vk::DeviceMemory);
    /// Bind device memory to a buffer
    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()>;
    /// Map a range of device memory into host address space
    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<*mut c_void>;
    /// Unmap previously mapped device memory
    fn unmap_memory(&self, memory: vk::DeviceMemory);
    /// Flush host writes for non-coherent memory
    fn flush_mapped_memory_ranges(&self, ranges: &[vk::MappedMemoryRange]) -> VkResult<()>;
    /// Make device writes visible to host reads of non-coherent memory
    fn invalidate_mapped_memory_ranges(&self, ranges: &[vk::MappedMemoryRange]) -> VkResult<()>;

    // Images

    /// Create an image object without backing memory
    fn create_image(&self, create_info: &vk::ImageCreateInfo) -> VkResult<vk::Image>;
    /// Destroy an image object
    fn destroy_image(&self, image: vk::Image);
    /// Query memory requirements of an image
    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;
    /// Bind device memory to an image
    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()>;
    /// Create an image view
    fn create_image_view(&self, create_info: &vk::ImageViewCreateInfo) -> VkResult<vk::ImageView>;
    /// Destroy an image view
    fn destroy_image_view(&self, view: vk::ImageView);
    /// Create a sampler
    fn create_sampler(&self, create_info: &vk::SamplerCreateInfo) -> VkResult<vk::Sampler>;
    /// Destroy a sampler
    fn destroy_sampler(&self, sampler: vk::Sampler);

    // Command pools and buffers

    /// Create a command pool for a queue family
    fn create_command_pool(
        &self,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<vk::CommandPool>;
    /// Destroy a command pool and every command buffer allocated from it
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    /// Allocate command buffers from a pool
    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>>;
    /// Return command buffers to their pool
    fn free_command_buffers(&self, pool: vk::CommandPool, command_buffers: &[vk::CommandBuffer]);
    /// Start recording a command buffer
    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::CommandBufferBeginInfo,
    ) -> VkResult<()>;
    /// Finish recording a command buffer
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;

    // Queues

    /// Submit batches of command buffers to a queue
    fn queue_submit(&self, queue: vk::Queue, submits: &[vk::SubmitInfo], fence: vk::Fence) -> VkResult<()>;
    /// Block until a queue is idle
    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()>;
    /// Block until the whole device is idle
    fn device_wait_idle(&self) -> VkResult<()>;

    // Synchronization

    /// Create a fence
    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    /// Destroy a fence
    fn destroy_fence(&self, fence: vk::Fence);
    /// Wait for fences; a timeout surfaces as `vk::Result::TIMEOUT`
    fn wait_for_fences(&self, fences: &[vk::Fence], wait_all: bool, timeout_ns: u64) -> VkResult<()>;
    /// Reset fences to the unsignaled state
    fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()>;
    /// Query whether a fence is signaled
    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool>;
    /// Create a binary semaphore
    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    /// Destroy a semaphore
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    // Render passes

    /// Create a render pass
    fn create_render_pass(&self, create_info: &vk::RenderPassCreateInfo) -> VkResult<vk::RenderPass>;
    /// Destroy a render pass
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    /// Create a frame buffer
    fn create_framebuffer(&self, create_info: &vk::FramebufferCreateInfo) -> VkResult<vk::Framebuffer>;
    /// Destroy a frame buffer
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    // Recording

    /// Record a render pass begin
    fn cmd_begin_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::RenderPassBeginInfo,
        contents: vk::SubpassContents,
    );
    /// Record a render pass end
    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer);
    /// Record a buffer-to-buffer copy
    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );
    /// Record vertex buffer bindings
    fn cmd_bind_vertex_buffers(
        &self,
        command_buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    );
    /// Record an index buffer binding
    fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    );
    /// Record a non-indexed draw
    fn cmd_draw(
        &self,
        command_buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );
    /// Record an indexed draw
    fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
    /// Record an indexed draw whose parameters live in a buffer
    fn cmd_draw_indexed_indirect(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        draw_count: u32,
        stride: u32,
    );
    /// Record execution of secondary command buffers
    fn cmd_execute_commands(&self, command_buffer: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]);
}
