//! Buffer management for vertex data, indices and uniforms
//!
//! A [`Buffer`] owns one native buffer and the memory behind it. Memory comes
//! from the device pool or from a dedicated allocation, chosen at
//! [`Buffer::allocate`] and kept across [`Buffer::reallocate`].
//!
//! GPU-only buffers are never mapped; fill them with [`Buffer::copy_to`] from
//! a staging buffer.

use ash::vk;

use super::memory_allocator::{Allocation, MemoryUsage};
use crate::render::backends::vulkan::initialization::context::{GpuError, GpuResult, GraphicsDevice};
use crate::render::backends::vulkan::rendering::commands::CommandBuffers;

/// Pooled allocations are reserved in multiples of this many bytes
const POOL_SIZE_GRANULARITY: vk::DeviceSize = 4;

/// Buffer wrapper with memory management
pub struct Buffer<'d> {
    device: Option<&'d GraphicsDevice>,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    usage_flags: vk::BufferUsageFlags,
    memory_usage: MemoryUsage,
    from_pool: bool,
    used_size: vk::DeviceSize,
    bound: bool,
}

impl<'d> Buffer<'d> {
    /// Create a buffer and its backing memory
    ///
    /// Memory is not bound until [`Buffer::bind`]. With `from_pool` the size
    /// is rounded up to a multiple of four bytes.
    pub fn allocate(
        device: &'d GraphicsDevice,
        size: vk::DeviceSize,
        usage_flags: vk::BufferUsageFlags,
        memory_usage: MemoryUsage,
        from_pool: bool,
    ) -> GpuResult<Self> {
        let mut buffer = Self {
            device: Some(device),
            buffer: vk::Buffer::null(),
            allocation: None,
            usage_flags,
            memory_usage,
            from_pool,
            used_size: 0,
            bound: false,
        };
        buffer.create(device, size)?;
        Ok(buffer)
    }

    /// Host-visible transfer source for uploads
    pub fn allocate_as_staging(device: &'d GraphicsDevice, size: vk::DeviceSize, from_pool: bool) -> GpuResult<Self> {
        Self::allocate(
            device,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryUsage::CpuOnly,
            from_pool,
        )
    }

    fn create(&mut self, device: &GraphicsDevice, size: vk::DeviceSize) -> GpuResult<()> {
        const TRACE: &str = "buffer::allocate";

        if size == 0 {
            return Err(device.report(TRACE, GpuError::invalid_argument("buffer size must be non-zero")));
        }
        let size = if self.from_pool {
            (size + POOL_SIZE_GRANULARITY - 1) / POOL_SIZE_GRANULARITY * POOL_SIZE_GRANULARITY
        } else {
            size
        };

        let create_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(self.usage_flags)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = device
            .api()
            .create_buffer(&create_info)
            .map_err(|e| device.report(TRACE, GpuError::Api(e)))?;

        match device
            .memory_allocator()
            .allocate_for_buffer(buffer, self.memory_usage, self.from_pool)
        {
            Ok(allocation) => {
                self.buffer = buffer;
                self.allocation = Some(allocation);
                self.used_size = size;
                self.bound = false;
                Ok(())
            }
            Err(e) => {
                device.api().destroy_buffer(buffer);
                Err(device.report(TRACE, e))
            }
        }
    }

    fn live(&self, trace: &str) -> GpuResult<(&'d GraphicsDevice, &Allocation)> {
        match (self.device, &self.allocation) {
            (Some(device), Some(allocation)) => Ok((device, allocation)),
            (Some(device), None) => Err(device.report(trace, GpuError::invalid_state("buffer memory was freed"))),
            (None, _) => {
                log::warn!("{}: buffer already released", trace);
                Err(GpuError::invalid_state("buffer already released"))
            }
        }
    }

    /// Bind the backing memory to the buffer
    pub fn bind(&mut self) -> GpuResult<()> {
        const TRACE: &str = "buffer::bind";
        let (device, allocation) = self.live(TRACE)?;
        if self.bound {
            return Err(device.report(TRACE, GpuError::invalid_state("buffer memory already bound")));
        }
        device
            .memory_allocator()
            .bind_buffer(allocation, self.buffer)
            .map_err(|e| device.report(TRACE, e))?;
        self.bound = true;
        Ok(())
    }

    /// Copy `data` to the start of the buffer through a host mapping
    ///
    /// Fails without touching the mapping on GPU-only memory. The buffer must
    /// not be read by in-flight GPU work while this runs.
    pub fn set_data<T: bytemuck::Pod>(&self, data: &[T]) -> GpuResult<()> {
        const TRACE: &str = "buffer::set_data";
        let (device, allocation) = self.live(TRACE)?;

        if !self.memory_usage.is_host_visible() {
            return Err(device.report(TRACE, GpuError::invalid_state("cannot map GPU-only buffer")));
        }
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.is_empty() {
            return Err(device.report(TRACE, GpuError::invalid_argument("no data to upload")));
        }
        if bytes.len() as vk::DeviceSize > self.used_size {
            return Err(device.report(
                TRACE,
                GpuError::invalid_argument(format!(
                    "{} bytes do not fit a {} byte buffer",
                    bytes.len(),
                    self.used_size
                )),
            ));
        }

        let allocator = device.memory_allocator();
        let ptr = allocator.map(allocation).map_err(|e| device.report(TRACE, e))?;
        // SAFETY: the mapping covers at least `used_size` bytes and `bytes` fits.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
        let flushed = allocator.flush(allocation);
        allocator.unmap(allocation);
        flushed.map_err(|e| device.report(TRACE, e))
    }

    /// Read the buffer contents back to the host
    ///
    /// Non-coherent memory is invalidated before the copy so device writes
    /// are visible. The GPU must have finished writing the buffer.
    pub fn read_back(&self) -> GpuResult<Vec<u8>> {
        const TRACE: &str = "buffer::read_back";
        let (device, allocation) = self.live(TRACE)?;
        if !self.memory_usage.is_host_visible() {
            return Err(device.report(TRACE, GpuError::invalid_state("cannot map GPU-only buffer")));
        }

        let allocator = device.memory_allocator();
        let ptr = allocator.map(allocation).map_err(|e| device.report(TRACE, e))?;
        if let Err(e) = allocator.invalidate(allocation) {
            allocator.unmap(allocation);
            return Err(device.report(TRACE, e));
        }
        let mut contents = vec![0u8; self.used_size as usize];
        // SAFETY: the mapping covers at least `used_size` bytes.
        unsafe { std::ptr::copy_nonoverlapping(ptr, contents.as_mut_ptr(), contents.len()) };
        allocator.unmap(allocation);
        Ok(contents)
    }

    /// Copy this buffer's contents into `dst` on the device
    ///
    /// Records a one-shot copy of `size()` bytes at offset 0 on the graphics
    /// queue and blocks until it completes.
    pub fn copy_to(&self, dst: &Buffer<'_>) -> GpuResult<()> {
        const TRACE: &str = "buffer::copy_to";
        let (device, _) = self.live(TRACE)?;
        dst.live(TRACE)?;

        if !self.bound || !dst.bound {
            return Err(device.report(TRACE, GpuError::invalid_state("copy between unbound buffers")));
        }
        if dst.used_size < self.used_size {
            return Err(device.report(
                TRACE,
                GpuError::invalid_argument(format!(
                    "destination holds {} bytes, source has {}",
                    dst.used_size, self.used_size
                )),
            ));
        }

        let commands = CommandBuffers::load(device, 1, vk::CommandBufferLevel::PRIMARY, false, None)?;
        commands.begin(0, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        if let Some(command) = commands.command_at(0) {
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: self.used_size,
            };
            device
                .api()
                .cmd_copy_buffer(command.handle(), self.buffer, dst.buffer, &[region]);
        }
        commands.end(0)?;
        commands.flush(0)
    }

    /// Free and allocate again with a new size, keeping usage, memory class
    /// and pool mode
    ///
    /// The new memory is not bound.
    pub fn reallocate(&mut self, size: vk::DeviceSize) -> GpuResult<()> {
        const TRACE: &str = "buffer::reallocate";
        let Some(device) = self.device else {
            log::warn!("{}: buffer already released", TRACE);
            return Err(GpuError::invalid_state("buffer already released"));
        };
        self.free();
        self.create(device, size)
    }

    /// Destroy the buffer and return its memory; `false` if nothing was held
    ///
    /// The buffer stays attached to its device and can be reallocated.
    pub fn free(&mut self) -> bool {
        let Some(device) = self.device else {
            return false;
        };
        let Some(allocation) = self.allocation.take() else {
            return false;
        };
        device.api().destroy_buffer(self.buffer);
        device.memory_allocator().free(allocation);
        self.buffer = vk::Buffer::null();
        self.used_size = 0;
        self.bound = false;
        true
    }

    /// Free everything and detach from the device; `false` if already released
    pub fn release(&mut self) -> bool {
        if self.device.is_none() {
            return false;
        }
        self.free();
        self.device = None;
        true
    }

    /// Native handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Bytes in use
    pub fn size(&self) -> vk::DeviceSize {
        self.used_size
    }

    /// Bytes reserved by the allocation
    pub fn global_size(&self) -> vk::DeviceSize {
        self.allocation.as_ref().map_or(0, |allocation| allocation.info().size)
    }

    /// Offset of the buffer inside its device memory
    pub fn offset(&self) -> vk::DeviceSize {
        self.allocation.as_ref().map_or(0, |allocation| allocation.info().offset)
    }

    /// Backing device memory
    pub fn memory(&self) -> vk::DeviceMemory {
        self.allocation
            .as_ref()
            .map_or(vk::DeviceMemory::null(), |allocation| allocation.info().memory)
    }

    /// Usage flags the buffer was created with
    pub fn usage_flags(&self) -> vk::BufferUsageFlags {
        self.usage_flags
    }

    /// Memory placement the buffer was allocated for
    pub fn memory_usage(&self) -> MemoryUsage {
        self.memory_usage
    }

    /// Whether memory came from the device pool
    pub fn is_pooled(&self) -> bool {
        self.allocation.as_ref().map_or(false, Allocation::is_pooled)
    }

    /// Whether native buffer and memory are live
    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// Binding info covering the used range
    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.buffer,
            offset: 0,
            range: self.used_size,
        }
    }
}

impl Drop for Buffer<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Buffer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("buffer", &self.buffer)
            .field("usage_flags", &self.usage_flags)
            .field("memory_usage", &self.memory_usage)
            .field("used_size", &self.used_size)
            .field("pooled", &self.is_pooled())
            .field("bound", &self.bound)
            .finish()
    }
}
