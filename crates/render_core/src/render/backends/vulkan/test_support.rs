//! Recording fake of the native device for unit tests
//!
//! Device memory is backed by host byte vectors, buffer copies recorded into
//! command buffers run when the command buffer is submitted, and every entry
//! point bumps a call counter. A small bump-allocating pool stands in for the
//! pooled sub-allocator.

use ash::prelude::VkResult;
use ash::vk;
use ash::vk::Handle;
use slotmap::SlotMap;
use std::collections::{HashMap, HashSet};
use std::ffi::c_void;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::config::RenderCoreConfig;
use crate::render::backends::vulkan::initialization::context::{
    DeviceFeatures, DeviceInfo, DeviceParts, DeviceQueues, GraphicsDevice, Queue,
};
use crate::render::backends::vulkan::initialization::device_api::DeviceApi;
use crate::render::backends::vulkan::resources::memory_allocator::{
    AllocationInfo, MemoryUsage, PoolAllocator, PoolKey,
};
use crate::render::backends::vulkan::resources::texture::aspect_mask;

/// Size of each pool block
pub const POOL_BLOCK_SIZE: u64 = 1 << 20;

/// Entry points counted by the fake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockCall {
    CreateBuffer,
    DestroyBuffer,
    AllocateMemory,
    FreeMemory,
    BindBufferMemory,
    MapMemory,
    UnmapMemory,
    FlushMemory,
    InvalidateMemory,
    CreateImage,
    DestroyImage,
    BindImageMemory,
    CreateImageView,
    DestroyImageView,
    CreateSampler,
    DestroySampler,
    CreateCommandPool,
    DestroyCommandPool,
    AllocateCommandBuffers,
    FreeCommandBuffers,
    BeginCommandBuffer,
    EndCommandBuffer,
    QueueSubmit,
    QueueWaitIdle,
    DeviceWaitIdle,
    CreateFence,
    DestroyFence,
    WaitForFences,
    ResetFences,
    CreateSemaphore,
    DestroySemaphore,
    CreateRenderPass,
    DestroyRenderPass,
    CreateFramebuffer,
    DestroyFramebuffer,
    BeginRenderPass,
    EndRenderPass,
    CopyBuffer,
    BindVertexBuffers,
    BindIndexBuffer,
    Draw,
    DrawIndexed,
    DrawIndexedIndirect,
    ExecuteCommands,
    PoolAllocate,
    PoolBind,
    PoolMap,
    PoolUnmap,
    PoolFlush,
    PoolInvalidate,
    PoolFree,
}

/// Object kinds tracked for leak checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Buffer,
    Memory,
    Image,
    ImageView,
    Sampler,
    CommandPool,
    CommandBuffer,
    Fence,
    Semaphore,
    RenderPass,
    Framebuffer,
}

/// A clear value read back according to its attachment's format
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearRecord {
    /// Float color for a color attachment
    Color([f32; 4]),
    /// Depth and stencil for a depth/stencil attachment
    DepthStencil { depth: f32, stencil: u32 },
}

/// A command captured while recording
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    BeginRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        render_area: (i32, i32, u32, u32),
        clear_value_count: u32,
        clear_values: Vec<ClearRecord>,
        contents: vk::SubpassContents,
    },
    EndRenderPass,
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<(u64, u64, u64)>,
    },
    BindVertexBuffers {
        first_binding: u32,
        buffers: Vec<vk::Buffer>,
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        index_type: vk::IndexType,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    DrawIndexedIndirect {
        buffer: vk::Buffer,
        offset: u64,
        draw_count: u32,
        stride: u32,
    },
    ExecuteCommands(Vec<vk::CommandBuffer>),
}

/// How a command buffer was begun
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRecord {
    pub flags: vk::CommandBufferUsageFlags,
    pub inherited_render_pass: Option<vk::RenderPass>,
    pub inherited_framebuffer: Option<vk::Framebuffer>,
}

/// One captured queue submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRecord {
    pub queue: vk::Queue,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub wait_stages: Vec<vk::PipelineStageFlags>,
    pub signal_semaphores: Vec<vk::Semaphore>,
    pub fence: vk::Fence,
}

/// Captured subpass shape
#[derive(Debug, Clone)]
pub struct SubpassRecord {
    pub color: Vec<vk::AttachmentReference>,
    pub input: Vec<vk::AttachmentReference>,
    pub depth: Option<vk::AttachmentReference>,
}

/// Captured render pass creation
#[derive(Debug, Clone)]
pub struct RenderPassRecord {
    pub attachments: Vec<vk::AttachmentDescription>,
    pub subpasses: Vec<SubpassRecord>,
    pub dependencies: Vec<vk::SubpassDependency>,
}

/// Captured frame buffer creation
#[derive(Debug, Clone)]
pub struct FramebufferRecord {
    pub render_pass: vk::RenderPass,
    pub attachments: Vec<vk::ImageView>,
    pub width: u32,
    pub height: u32,
}

/// Captured image creation
#[derive(Debug, Clone, Copy)]
pub struct ImageRecord {
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub extent: vk::Extent3D,
    pub image_type: vk::ImageType,
}

struct MockMemory {
    data: Vec<u8>,
    type_index: u32,
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    calls: HashMap<MockCall, usize>,
    live: HashMap<ObjectKind, HashSet<u64>>,
    invalid_destroys: usize,
    memory: HashMap<u64, MockMemory>,
    buffer_sizes: HashMap<u64, u64>,
    buffer_bindings: HashMap<u64, (u64, u64)>,
    images: HashMap<u64, ImageRecord>,
    pool_buffers: HashMap<u64, Vec<u64>>,
    recordings: HashMap<u64, Vec<Recorded>>,
    begin_records: HashMap<u64, BeginRecord>,
    fences: HashMap<u64, bool>,
    submits: Vec<SubmitRecord>,
    render_passes: HashMap<u64, RenderPassRecord>,
    framebuffers: HashMap<u64, FramebufferRecord>,
    framebuffers_created: usize,
    flushed_ranges: Vec<(u64, u64, u64)>,
    invalidated_ranges: Vec<(u64, u64, u64)>,
    fail_allocations: bool,
    fail_framebuffer_at: Option<usize>,
    fence_timeout: bool,
    device_lost: bool,
    in_flight: HashSet<u64>,
    in_flight_destroys: usize,
}

impl MockState {
    fn bump(&mut self, call: MockCall) {
        *self.calls.entry(call).or_insert(0) += 1;
    }

    fn new_handle(&mut self, kind: ObjectKind) -> u64 {
        self.next_handle += 1;
        let raw = 0x1000 + self.next_handle;
        self.live.entry(kind).or_default().insert(raw);
        raw
    }

    fn retire(&mut self, kind: ObjectKind, raw: u64) {
        let removed = self.live.get_mut(&kind).map_or(false, |set| set.remove(&raw));
        if !removed {
            self.invalid_destroys += 1;
        }
        if self.in_flight.contains(&raw) {
            self.in_flight_destroys += 1;
        }
    }

    fn execute(&mut self, command_buffer: u64) {
        let commands = self.recordings.get(&command_buffer).cloned().unwrap_or_default();
        for command in commands {
            match command {
                Recorded::CopyBuffer { src, dst, regions } => {
                    for (src_offset, dst_offset, size) in regions {
                        let bytes = self.read_bound(src.as_raw(), src_offset, size);
                        self.write_bound(dst.as_raw(), dst_offset, &bytes);
                    }
                }
                Recorded::ExecuteCommands(secondaries) => {
                    for secondary in secondaries {
                        self.execute(secondary.as_raw());
                    }
                }
                _ => {}
            }
        }
    }

    fn read_bound(&self, buffer: u64, offset: u64, size: u64) -> Vec<u8> {
        let (memory, base) = self.buffer_bindings[&buffer];
        let start = (base + offset) as usize;
        self.memory[&memory].data[start..start + size as usize].to_vec()
    }

    fn write_bound(&mut self, buffer: u64, offset: u64, bytes: &[u8]) {
        let (memory, base) = self.buffer_bindings[&buffer];
        let start = (base + offset) as usize;
        let target = self.memory.get_mut(&memory).expect("bound memory exists");
        target.data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    fn allocate_block(&mut self, size: u64, type_index: u32) -> u64 {
        let raw = self.new_handle(ObjectKind::Memory);
        self.memory.insert(
            raw,
            MockMemory {
                data: vec![0; size as usize],
                type_index,
            },
        );
        raw
    }
}

/// Read a native `(pointer, count)` pair as a slice
unsafe fn slice<'a, T>(ptr: *const T, count: u32) -> &'a [T] {
    if ptr.is_null() || count == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(ptr, count as usize)
    }
}

/// Memory types exposed by the fake: device-local, host coherent, host cached
pub fn memory_properties() -> vk::PhysicalDeviceMemoryProperties {
    let mut properties = vk::PhysicalDeviceMemoryProperties {
        memory_type_count: 3,
        memory_heap_count: 1,
        ..Default::default()
    };
    properties.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    properties.memory_types[1].property_flags =
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
    properties.memory_types[2].property_flags =
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED;
    properties.memory_heaps[0].size = 256 << 20;
    properties
}

/// Recording fake device
#[derive(Default)]
pub struct MockDevice {
    state: Mutex<MockState>,
}

impl MockDevice {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of times `call` was made
    pub fn count(&self, call: MockCall) -> usize {
        self.lock().calls.get(&call).copied().unwrap_or(0)
    }

    /// Number of live objects of a kind
    pub fn live(&self, kind: ObjectKind) -> usize {
        self.lock().live.get(&kind).map_or(0, HashSet::len)
    }

    /// Destroy calls on handles that were not alive
    pub fn invalid_destroys(&self) -> usize {
        self.lock().invalid_destroys
    }

    /// Make every subsequent memory allocation fail
    pub fn fail_allocations(&self, fail: bool) {
        self.lock().fail_allocations = fail;
    }

    /// Make the n-th (zero-based) frame buffer creation fail
    pub fn fail_framebuffer_at(&self, index: usize) {
        let mut state = self.lock();
        state.fail_framebuffer_at = Some(state.framebuffers_created + index);
    }

    /// Make fence waits time out; work submitted meanwhile stays in flight
    /// until the device goes idle
    pub fn force_fence_timeout(&self, timeout: bool) {
        self.lock().fence_timeout = timeout;
    }

    /// Make device idle waits fail with `ERROR_DEVICE_LOST`
    pub fn lose_device(&self, lost: bool) {
        self.lock().device_lost = lost;
    }

    /// Fences and command buffers destroyed while the GPU could still use them
    pub fn in_flight_destroys(&self) -> usize {
        self.lock().in_flight_destroys
    }

    /// Commands recorded into a command buffer since its last begin
    pub fn recorded(&self, command_buffer: vk::CommandBuffer) -> Vec<Recorded> {
        self.lock()
            .recordings
            .get(&command_buffer.as_raw())
            .cloned()
            .unwrap_or_default()
    }

    /// How a command buffer was last begun
    pub fn begin_record(&self, command_buffer: vk::CommandBuffer) -> Option<BeginRecord> {
        self.lock().begin_records.get(&command_buffer.as_raw()).copied()
    }

    /// Most recent queue submission
    pub fn last_submit(&self) -> Option<SubmitRecord> {
        self.lock().submits.last().cloned()
    }

    /// All queue submissions
    pub fn submits(&self) -> Vec<SubmitRecord> {
        self.lock().submits.clone()
    }

    /// Creation record of a render pass
    pub fn render_pass(&self, render_pass: vk::RenderPass) -> Option<RenderPassRecord> {
        self.lock().render_passes.get(&render_pass.as_raw()).cloned()
    }

    /// Creation record of a frame buffer
    pub fn framebuffer(&self, framebuffer: vk::Framebuffer) -> Option<FramebufferRecord> {
        self.lock().framebuffers.get(&framebuffer.as_raw()).cloned()
    }

    /// Creation record of an image
    pub fn image(&self, image: vk::Image) -> Option<ImageRecord> {
        self.lock().images.get(&image.as_raw()).copied()
    }

    /// Explicit flush ranges as `(memory, offset, size)`
    pub fn flushed_ranges(&self) -> Vec<(u64, u64, u64)> {
        self.lock().flushed_ranges.clone()
    }

    /// `(memory, offset, size)` of every invalidated range, in call order
    pub fn invalidated_ranges(&self) -> Vec<(u64, u64, u64)> {
        self.lock().invalidated_ranges.clone()
    }

    /// Whether a buffer has memory bound
    pub fn is_bound(&self, buffer: vk::Buffer) -> bool {
        self.lock().buffer_bindings.contains_key(&buffer.as_raw())
    }

    /// Bytes currently backing a bound buffer
    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Vec<u8> {
        let state = self.lock();
        let size = state.buffer_sizes[&buffer.as_raw()];
        state.read_bound(buffer.as_raw(), 0, size)
    }

    fn pool_allocate(&self, buffer: vk::Buffer, type_index: u32, block: Option<u64>) -> VkResult<(u64, u64)> {
        let mut state = self.lock();
        if state.fail_allocations {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        state.bump(MockCall::PoolAllocate);
        let size = state.buffer_sizes[&buffer.as_raw()];
        let block = match block {
            Some(block) => block,
            None => state.allocate_block(POOL_BLOCK_SIZE, type_index),
        };
        Ok((block, size))
    }
}

impl DeviceApi for MockDevice {
    fn create_buffer(&self, create_info: &vk::BufferCreateInfo) -> VkResult<vk::Buffer> {
        let mut state = self.lock();
        state.bump(MockCall::CreateBuffer);
        let raw = state.new_handle(ObjectKind::Buffer);
        state.buffer_sizes.insert(raw, create_info.size);
        Ok(vk::Buffer::from_raw(raw))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.lock();
        state.bump(MockCall::DestroyBuffer);
        state.retire(ObjectKind::Buffer, buffer.as_raw());
        state.buffer_sizes.remove(&buffer.as_raw());
        state.buffer_bindings.remove(&buffer.as_raw());
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let state = self.lock();
        vk::MemoryRequirements {
            size: state.buffer_sizes.get(&buffer.as_raw()).copied().unwrap_or(0),
            alignment: 16,
            memory_type_bits: 0b111,
        }
    }

    fn allocate_memory(&self, allocate_info: &vk::MemoryAllocateInfo) -> VkResult<vk::DeviceMemory> {
        let mut state = self.lock();
        state.bump(MockCall::AllocateMemory);
        if state.fail_allocations {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let raw = state.allocate_block(allocate_info.allocation_size, allocate_info.memory_type_index);
        Ok(vk::DeviceMemory::from_raw(raw))
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.lock();
        state.bump(MockCall::FreeMemory);
        state.retire(ObjectKind::Memory, memory.as_raw());
        state.memory.remove(&memory.as_raw());
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        let mut state = self.lock();
        state.bump(MockCall::BindBufferMemory);
        state.buffer_bindings.insert(buffer.as_raw(), (memory.as_raw(), offset));
        Ok(())
    }

    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        _size: vk::DeviceSize,
    ) -> VkResult<*mut c_void> {
        let mut state = self.lock();
        state.bump(MockCall::MapMemory);
        let properties = memory_properties();
        let block = state
            .memory
            .get_mut(&memory.as_raw())
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let flags = properties.memory_types[block.type_index as usize].property_flags;
        if !flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        Ok(block.data[offset as usize..].as_mut_ptr().cast())
    }

    fn invalidate_mapped_memory_ranges(&self, ranges: &[vk::MappedMemoryRange]) -> VkResult<()> {
        let mut state = self.lock();
        state.bump(MockCall::InvalidateMemory);
        for range in ranges {
            state
                .invalidated_ranges
                .push((range.memory.as_raw(), range.offset, range.size));
        }
        Ok(())
    }

    fn unmap_memory(&self, _memory: vk::DeviceMemory) {
        self.lock().bump(MockCall::UnmapMemory);
    }

    fn flush_mapped_memory_ranges(&self, ranges: &[vk::MappedMemoryRange]) -> VkResult<()> {
        let mut state = self.lock();
        state.bump(MockCall::FlushMemory);
        for range in ranges {
            state
                .flushed_ranges
                .push((range.memory.as_raw(), range.offset, range.size));
        }
        Ok(())
    }

    fn create_image(&self, create_info: &vk::ImageCreateInfo) -> VkResult<vk::Image> {
        let mut state = self.lock();
        state.bump(MockCall::CreateImage);
        let raw = state.new_handle(ObjectKind::Image);
        state.images.insert(
            raw,
            ImageRecord {
                format: create_info.format,
                usage: create_info.usage,
                extent: create_info.extent,
                image_type: create_info.image_type,
            },
        );
        Ok(vk::Image::from_raw(raw))
    }

    fn destroy_image(&self, image: vk::Image) {
        let mut state = self.lock();
        state.bump(MockCall::DestroyImage);
        state.retire(ObjectKind::Image, image.as_raw());
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let state = self.lock();
        let size = state.images.get(&image.as_raw()).map_or(0, |image| {
            u64::from(image.extent.width) * u64::from(image.extent.height) * 4
        });
        vk::MemoryRequirements {
            size,
            alignment: 256,
            memory_type_bits: 0b111,
        }
    }

    fn bind_image_memory(&self, _image: vk::Image, _memory: vk::DeviceMemory, _offset: vk::DeviceSize) -> VkResult<()> {
        self.lock().bump(MockCall::BindImageMemory);
        Ok(())
    }

    fn create_image_view(&self, _create_info: &vk::ImageViewCreateInfo) -> VkResult<vk::ImageView> {
        let mut state = self.lock();
        state.bump(MockCall::CreateImageView);
        Ok(vk::ImageView::from_raw(state.new_handle(ObjectKind::ImageView)))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        let mut state = self.lock();
        state.bump(MockCall::DestroyImageView);
        state.retire(ObjectKind::ImageView, view.as_raw());
    }

    fn create_sampler(&self, _create_info: &vk::SamplerCreateInfo) -> VkResult<vk::Sampler> {
        let mut state = self.lock();
        state.bump(MockCall::CreateSampler);
        Ok(vk::Sampler::from_raw(state.new_handle(ObjectKind::Sampler)))
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        let mut state = self.lock();
        state.bump(MockCall::DestroySampler);
        state.retire(ObjectKind::Sampler, sampler.as_raw());
    }

    fn create_command_pool(
        &self,
        _queue_family_index: u32,
        _flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<vk::CommandPool> {
        let mut state = self.lock();
        state.bump(MockCall::CreateCommandPool);
        let raw = state.new_handle(ObjectKind::CommandPool);
        state.pool_buffers.insert(raw, Vec::new());
        Ok(vk::CommandPool::from_raw(raw))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.lock();
        state.bump(MockCall::DestroyCommandPool);
        state.retire(ObjectKind::CommandPool, pool.as_raw());
        for buffer in state.pool_buffers.remove(&pool.as_raw()).unwrap_or_default() {
            state.retire(ObjectKind::CommandBuffer, buffer);
        }
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        _level: vk::CommandBufferLevel,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        let mut state = self.lock();
        state.bump(MockCall::AllocateCommandBuffers);
        let handles: Vec<u64> = (0..count)
            .map(|_| state.new_handle(ObjectKind::CommandBuffer))
            .collect();
        state
            .pool_buffers
            .entry(pool.as_raw())
            .or_default()
            .extend(handles.iter().copied());
        Ok(handles.into_iter().map(vk::CommandBuffer::from_raw).collect())
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, command_buffers: &[vk::CommandBuffer]) {
        let mut state = self.lock();
        state.bump(MockCall::FreeCommandBuffers);
        for buffer in command_buffers {
            state.retire(ObjectKind::CommandBuffer, buffer.as_raw());
            if let Some(owned) = state.pool_buffers.get_mut(&pool.as_raw()) {
                owned.retain(|raw| *raw != buffer.as_raw());
            }
        }
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::CommandBufferBeginInfo,
    ) -> VkResult<()> {
        let mut state = self.lock();
        state.bump(MockCall::BeginCommandBuffer);
        // SAFETY: the inheritance pointer, when set, outlives the begin call
        let inheritance = unsafe { begin_info.p_inheritance_info.as_ref() };
        state.begin_records.insert(
            command_buffer.as_raw(),
            BeginRecord {
                flags: begin_info.flags,
                inherited_render_pass: inheritance.map(|info| info.render_pass),
                inherited_framebuffer: inheritance.map(|info| info.framebuffer),
            },
        );
        state.recordings.insert(command_buffer.as_raw(), Vec::new());
        Ok(())
    }

    fn end_command_buffer(&self, _command_buffer: vk::CommandBuffer) -> VkResult<()> {
        self.lock().bump(MockCall::EndCommandBuffer);
        Ok(())
    }

    fn queue_submit(&self, queue: vk::Queue, submits: &[vk::SubmitInfo], fence: vk::Fence) -> VkResult<()> {
        let mut state = self.lock();
        state.bump(MockCall::QueueSubmit);
        for submit in submits {
            // SAFETY: submit arrays are live for the duration of the call
            let record = unsafe {
                SubmitRecord {
                    queue,
                    command_buffers: slice(submit.p_command_buffers, submit.command_buffer_count).to_vec(),
                    wait_semaphores: slice(submit.p_wait_semaphores, submit.wait_semaphore_count).to_vec(),
                    wait_stages: slice(submit.p_wait_dst_stage_mask, submit.wait_semaphore_count).to_vec(),
                    signal_semaphores: slice(submit.p_signal_semaphores, submit.signal_semaphore_count).to_vec(),
                    fence,
                }
            };
            for command_buffer in &record.command_buffers {
                state.execute(command_buffer.as_raw());
                if state.fence_timeout {
                    state.in_flight.insert(command_buffer.as_raw());
                }
            }
            state.submits.push(record);
        }
        if fence != vk::Fence::null() {
            state.fences.insert(fence.as_raw(), true);
            if state.fence_timeout {
                state.in_flight.insert(fence.as_raw());
            }
        }
        Ok(())
    }

    fn queue_wait_idle(&self, _queue: vk::Queue) -> VkResult<()> {
        self.lock().bump(MockCall::QueueWaitIdle);
        Ok(())
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        let mut state = self.lock();
        state.bump(MockCall::DeviceWaitIdle);
        if state.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        state.in_flight.clear();
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut state = self.lock();
        state.bump(MockCall::CreateFence);
        let raw = state.new_handle(ObjectKind::Fence);
        state.fences.insert(raw, signaled);
        Ok(vk::Fence::from_raw(raw))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.lock();
        state.bump(MockCall::DestroyFence);
        state.retire(ObjectKind::Fence, fence.as_raw());
        state.fences.remove(&fence.as_raw());
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], _wait_all: bool, _timeout_ns: u64) -> VkResult<()> {
        let mut state = self.lock();
        state.bump(MockCall::WaitForFences);
        let all_signaled = fences
            .iter()
            .all(|fence| state.fences.get(&fence.as_raw()).copied().unwrap_or(false));
        if state.fence_timeout || !all_signaled {
            return Err(vk::Result::TIMEOUT);
        }
        Ok(())
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()> {
        let mut state = self.lock();
        state.bump(MockCall::ResetFences);
        for fence in fences {
            state.fences.insert(fence.as_raw(), false);
        }
        Ok(())
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        let state = self.lock();
        Ok(state.fences.get(&fence.as_raw()).copied().unwrap_or(false))
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let mut state = self.lock();
        state.bump(MockCall::CreateSemaphore);
        Ok(vk::Semaphore::from_raw(state.new_handle(ObjectKind::Semaphore)))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.lock();
        state.bump(MockCall::DestroySemaphore);
        state.retire(ObjectKind::Semaphore, semaphore.as_raw());
    }

    fn create_render_pass(&self, create_info: &vk::RenderPassCreateInfo) -> VkResult<vk::RenderPass> {
        let mut state = self.lock();
        state.bump(MockCall::CreateRenderPass);
        // SAFETY: create-info arrays are live for the duration of the call
        let record = unsafe {
            RenderPassRecord {
                attachments: slice(create_info.p_attachments, create_info.attachment_count).to_vec(),
                subpasses: slice(create_info.p_subpasses, create_info.subpass_count)
                    .iter()
                    .map(|subpass| SubpassRecord {
                        color: slice(subpass.p_color_attachments, subpass.color_attachment_count).to_vec(),
                        input: slice(subpass.p_input_attachments, subpass.input_attachment_count).to_vec(),
                        depth: subpass.p_depth_stencil_attachment.as_ref().copied(),
                    })
                    .collect(),
                dependencies: slice(create_info.p_dependencies, create_info.dependency_count).to_vec(),
            }
        };
        let raw = state.new_handle(ObjectKind::RenderPass);
        state.render_passes.insert(raw, record);
        Ok(vk::RenderPass::from_raw(raw))
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        let mut state = self.lock();
        state.bump(MockCall::DestroyRenderPass);
        let framebuffers_alive = state
            .framebuffers
            .values()
            .any(|framebuffer| framebuffer.render_pass == render_pass);
        if framebuffers_alive {
            // frame buffers must go before their render pass
            state.invalid_destroys += 1;
        }
        state.retire(ObjectKind::RenderPass, render_pass.as_raw());
    }

    fn create_framebuffer(&self, create_info: &vk::FramebufferCreateInfo) -> VkResult<vk::Framebuffer> {
        let mut state = self.lock();
        state.bump(MockCall::CreateFramebuffer);
        let index = state.framebuffers_created;
        state.framebuffers_created += 1;
        if state.fail_framebuffer_at == Some(index) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        // SAFETY: the attachment array is live for the duration of the call
        let attachments = unsafe { slice(create_info.p_attachments, create_info.attachment_count).to_vec() };
        let raw = state.new_handle(ObjectKind::Framebuffer);
        state.framebuffers.insert(
            raw,
            FramebufferRecord {
                render_pass: create_info.render_pass,
                attachments,
                width: create_info.width,
                height: create_info.height,
            },
        );
        Ok(vk::Framebuffer::from_raw(raw))
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        let mut state = self.lock();
        state.bump(MockCall::DestroyFramebuffer);
        state.retire(ObjectKind::Framebuffer, framebuffer.as_raw());
        state.framebuffers.remove(&framebuffer.as_raw());
    }

    fn cmd_begin_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::RenderPassBeginInfo,
        contents: vk::SubpassContents,
    ) {
        let mut state = self.lock();
        state.bump(MockCall::BeginRenderPass);
        let formats: Vec<vk::Format> = state
            .render_passes
            .get(&begin_info.render_pass.as_raw())
            .map(|record| record.attachments.iter().map(|attachment| attachment.format).collect())
            .unwrap_or_default();
        // SAFETY: clear values are live for the call; each is read as the
        // union member its attachment's format selects
        let clear_values: Vec<ClearRecord> = unsafe {
            slice(begin_info.p_clear_values, begin_info.clear_value_count)
                .iter()
                .enumerate()
                .map(|(index, value)| {
                    let format = formats.get(index).copied().unwrap_or(vk::Format::UNDEFINED);
                    if aspect_mask(format).contains(vk::ImageAspectFlags::COLOR) {
                        ClearRecord::Color(value.color.float32)
                    } else {
                        ClearRecord::DepthStencil {
                            depth: value.depth_stencil.depth,
                            stencil: value.depth_stencil.stencil,
                        }
                    }
                })
                .collect()
        };
        let area = begin_info.render_area;
        state
            .recordings
            .entry(command_buffer.as_raw())
            .or_default()
            .push(Recorded::BeginRenderPass {
                render_pass: begin_info.render_pass,
                framebuffer: begin_info.framebuffer,
                render_area: (area.offset.x, area.offset.y, area.extent.width, area.extent.height),
                clear_value_count: begin_info.clear_value_count,
                clear_values,
                contents,
            });
    }

    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        let mut state = self.lock();
        state.bump(MockCall::EndRenderPass);
        state
            .recordings
            .entry(command_buffer.as_raw())
            .or_default()
            .push(Recorded::EndRenderPass);
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        let mut state = self.lock();
        state.bump(MockCall::CopyBuffer);
        state
            .recordings
            .entry(command_buffer.as_raw())
            .or_default()
            .push(Recorded::CopyBuffer {
                src,
                dst,
                regions: regions
                    .iter()
                    .map(|region| (region.src_offset, region.dst_offset, region.size))
                    .collect(),
            });
    }

    fn cmd_bind_vertex_buffers(
        &self,
        command_buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        _offsets: &[vk::DeviceSize],
    ) {
        let mut state = self.lock();
        state.bump(MockCall::BindVertexBuffers);
        state
            .recordings
            .entry(command_buffer.as_raw())
            .or_default()
            .push(Recorded::BindVertexBuffers {
                first_binding,
                buffers: buffers.to_vec(),
            });
    }

    fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        _offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        let mut state = self.lock();
        state.bump(MockCall::BindIndexBuffer);
        state
            .recordings
            .entry(command_buffer.as_raw())
            .or_default()
            .push(Recorded::BindIndexBuffer { buffer, index_type });
    }

    fn cmd_draw(
        &self,
        command_buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        let mut state = self.lock();
        state.bump(MockCall::Draw);
        state
            .recordings
            .entry(command_buffer.as_raw())
            .or_default()
            .push(Recorded::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            });
    }

    fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        let mut state = self.lock();
        state.bump(MockCall::DrawIndexed);
        state
            .recordings
            .entry(command_buffer.as_raw())
            .or_default()
            .push(Recorded::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            });
    }

    fn cmd_draw_indexed_indirect(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        draw_count: u32,
        stride: u32,
    ) {
        let mut state = self.lock();
        state.bump(MockCall::DrawIndexedIndirect);
        state
            .recordings
            .entry(command_buffer.as_raw())
            .or_default()
            .push(Recorded::DrawIndexedIndirect {
                buffer,
                offset,
                draw_count,
                stride,
            });
    }

    fn cmd_execute_commands(&self, command_buffer: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]) {
        let mut state = self.lock();
        state.bump(MockCall::ExecuteCommands);
        state
            .recordings
            .entry(command_buffer.as_raw())
            .or_default()
            .push(Recorded::ExecuteCommands(secondaries.to_vec()));
    }
}

#[derive(Default)]
struct MockPoolState {
    blocks: HashMap<u32, (u64, u64)>,
    allocations: SlotMap<PoolKey, AllocationInfo>,
}

/// Bump allocator over one fixed block per memory type
pub struct MockPool {
    device: Arc<MockDevice>,
    state: Mutex<MockPoolState>,
}

impl MockPool {
    /// Create a pool that carves its blocks out of `device`
    pub fn new(device: Arc<MockDevice>) -> Self {
        Self {
            device,
            state: Mutex::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockPoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn type_index(usage: MemoryUsage) -> u32 {
        match usage {
            MemoryUsage::GpuOnly => 0,
            MemoryUsage::CpuOnly | MemoryUsage::CpuToGpu => 1,
            MemoryUsage::GpuToCpu => 2,
        }
    }
}

impl PoolAllocator for MockPool {
    fn allocate_buffer(&self, buffer: vk::Buffer, usage: MemoryUsage) -> VkResult<PoolKey> {
        let type_index = Self::type_index(usage);
        let mut state = self.lock();
        let existing = state.blocks.get(&type_index).map(|(block, _)| *block);
        let (block, size) = self.device.pool_allocate(buffer, type_index, existing)?;
        let entry = state.blocks.entry(type_index).or_insert((block, 0));
        let offset = (entry.1 + 15) & !15;
        if offset + size > POOL_BLOCK_SIZE {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        entry.1 = offset + size;
        let info = AllocationInfo {
            memory: vk::DeviceMemory::from_raw(block),
            offset,
            size,
            memory_type_index: type_index,
            property_flags: memory_properties().memory_types[type_index as usize].property_flags,
        };
        Ok(state.allocations.insert(info))
    }

    fn allocation_info(&self, key: PoolKey) -> Option<AllocationInfo> {
        self.lock().allocations.get(key).copied()
    }

    fn bind_buffer(&self, key: PoolKey, buffer: vk::Buffer) -> VkResult<()> {
        let info = self.allocation_info(key).ok_or(vk::Result::ERROR_UNKNOWN)?;
        let mut state = self.device.lock();
        state.bump(MockCall::PoolBind);
        state
            .buffer_bindings
            .insert(buffer.as_raw(), (info.memory.as_raw(), info.offset));
        Ok(())
    }

    fn map(&self, key: PoolKey) -> VkResult<*mut u8> {
        let info = self.allocation_info(key).ok_or(vk::Result::ERROR_UNKNOWN)?;
        let mut state = self.device.lock();
        state.bump(MockCall::PoolMap);
        if !info.property_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        let block = state
            .memory
            .get_mut(&info.memory.as_raw())
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        Ok(block.data[info.offset as usize..].as_mut_ptr())
    }

    fn unmap(&self, _key: PoolKey) {
        self.device.lock().bump(MockCall::PoolUnmap);
    }

    fn flush(&self, _key: PoolKey, _offset: vk::DeviceSize, _size: vk::DeviceSize) -> VkResult<()> {
        self.device.lock().bump(MockCall::PoolFlush);
        Ok(())
    }

    fn invalidate(&self, _key: PoolKey, _offset: vk::DeviceSize, _size: vk::DeviceSize) -> VkResult<()> {
        self.device.lock().bump(MockCall::PoolInvalidate);
        Ok(())
    }

    fn free_buffer(&self, key: PoolKey) -> bool {
        let removed = self.lock().allocations.remove(key).is_some();
        if removed {
            self.device.lock().bump(MockCall::PoolFree);
        }
        removed
    }
}

impl Drop for MockPool {
    fn drop(&mut self) {
        let blocks: Vec<u64> = self.lock().blocks.values().map(|(block, _)| *block).collect();
        let mut state = self.device.lock();
        for block in blocks {
            state.retire(ObjectKind::Memory, block);
            state.memory.remove(&block);
        }
    }
}

/// Configuration used by the fake devices
pub fn config() -> RenderCoreConfig {
    RenderCoreConfig::new("render_core_tests").with_validation(false)
}

/// Fake device with a memory pool and default features
pub fn device() -> (Arc<MockDevice>, GraphicsDevice) {
    device_with_config(config(), true)
}

/// Fake device without a memory pool
pub fn standalone_device() -> (Arc<MockDevice>, GraphicsDevice) {
    device_with_config(config().with_memory_pool(false), false)
}

/// Fake device with a pool (when `with_pool`) and the given configuration
pub fn device_with_config(config: RenderCoreConfig, with_pool: bool) -> (Arc<MockDevice>, GraphicsDevice) {
    build(config, with_pool, DeviceFeatures::default())
}

/// Fake device with explicit optional features
pub fn device_with_features(features: DeviceFeatures) -> (Arc<MockDevice>, GraphicsDevice) {
    build(config(), true, features)
}

fn build(config: RenderCoreConfig, with_pool: bool, features: DeviceFeatures) -> (Arc<MockDevice>, GraphicsDevice) {
    let mock = Arc::new(MockDevice::default());
    let pool: Option<Box<dyn PoolAllocator>> = if with_pool {
        Some(Box::new(MockPool::new(Arc::clone(&mock))))
    } else {
        None
    };
    let graphics = Queue {
        handle: vk::Queue::from_raw(0xfeed),
        family_index: 0,
    };
    let parts = DeviceParts {
        api: mock.clone(),
        info: DeviceInfo {
            name: "Mock GPU".to_string(),
            vendor_id: 0xabcd,
            device_id: 0x1,
            api_version: vk::API_VERSION_1_2,
            device_type: "virtual".to_string(),
        },
        features,
        queues: DeviceQueues {
            graphics,
            present: None,
            compute: None,
            transfer: Some(Queue {
                handle: vk::Queue::from_raw(0xbeef),
                family_index: 1,
            }),
        },
        memory_properties: memory_properties(),
        pool,
    };
    let device = GraphicsDevice::new(parts, config).expect("mock device");
    (mock, device)
}
