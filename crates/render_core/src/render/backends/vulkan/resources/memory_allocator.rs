//! Device memory allocation
//!
//! Resources get their memory in one of two ways: sub-allocated from a
//! [`PoolAllocator`], or as a dedicated native allocation sized exactly to
//! the resource. An [`Allocation`] remembers which path produced it, so it is
//! always returned through the same path.

use ash::prelude::VkResult;
use ash::vk;
use std::sync::Arc;

use crate::render::backends::vulkan::initialization::context::{GpuError, GpuResult};
use crate::render::backends::vulkan::initialization::device_api::DeviceApi;

slotmap::new_key_type! {
    /// Handle to an allocation owned by a [`PoolAllocator`]
    pub struct PoolKey;
}

/// Host/device visibility class of a memory allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryUsage {
    /// Host-visible and coherent; staging uploads
    CpuOnly,
    /// Device-local; never mapped
    GpuOnly,
    /// Host-visible, written every frame and read by the device
    CpuToGpu,
    /// Host-visible and cached; device writes read back on the host
    GpuToCpu,
}

impl MemoryUsage {
    /// Property flags a dedicated allocation must have
    pub fn required_flags(self) -> vk::MemoryPropertyFlags {
        match self {
            Self::CpuOnly => vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            Self::GpuOnly => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            Self::CpuToGpu => vk::MemoryPropertyFlags::HOST_VISIBLE,
            Self::GpuToCpu => vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED,
        }
    }

    /// Whether memory of this class may be mapped
    pub fn is_host_visible(self) -> bool {
        !matches!(self, Self::GpuOnly)
    }
}

/// Where an allocation lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationInfo {
    /// Backing device memory
    pub memory: vk::DeviceMemory,
    /// Byte offset into `memory`
    pub offset: vk::DeviceSize,
    /// Byte size of the allocation
    pub size: vk::DeviceSize,
    /// Memory type the allocation came from
    pub memory_type_index: u32,
    /// Properties of that memory type
    pub property_flags: vk::MemoryPropertyFlags,
}

impl AllocationInfo {
    /// Whether the host can map this memory
    pub fn is_host_visible(&self) -> bool {
        self.property_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    /// Whether host writes need an explicit flush
    pub fn needs_flush(&self) -> bool {
        !self.property_flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }
}

/// A range of device memory, owned by exactly one deallocation path
#[derive(Debug)]
pub enum Allocation {
    /// Sub-allocated from the pool; freed through the pool
    Pooled {
        /// Pool handle
        key: PoolKey,
        /// Location inside the pool
        info: AllocationInfo,
    },
    /// Dedicated native allocation; freed with a direct memory free
    Standalone {
        /// Location, always at offset 0
        info: AllocationInfo,
        /// Flags the allocation was requested with
        required_flags: vk::MemoryPropertyFlags,
    },
}

impl Allocation {
    /// Location of the allocation
    pub fn info(&self) -> &AllocationInfo {
        match self {
            Self::Pooled { info, .. } | Self::Standalone { info, .. } => info,
        }
    }

    /// Whether the allocation came from the pool
    pub fn is_pooled(&self) -> bool {
        matches!(self, Self::Pooled { .. })
    }
}

/// Pooled sub-allocator for buffers
///
/// Implementations do their own locking; several threads may allocate at
/// once.
pub trait PoolAllocator: Send + Sync {
    /// Reserve memory suitable for `buffer`
    fn allocate_buffer(&self, buffer: vk::Buffer, usage: MemoryUsage) -> VkResult<PoolKey>;
    /// Location of a live allocation
    fn allocation_info(&self, key: PoolKey) -> Option<AllocationInfo>;
    /// Bind the allocation to `buffer`
    fn bind_buffer(&self, key: PoolKey, buffer: vk::Buffer) -> VkResult<()>;
    /// Map the allocation; the pointer addresses its first byte
    fn map(&self, key: PoolKey) -> VkResult<*mut u8>;
    /// Undo a previous [`PoolAllocator::map`]
    fn unmap(&self, key: PoolKey);
    /// Flush a byte range relative to the allocation start
    fn flush(&self, key: PoolKey, offset: vk::DeviceSize, size: vk::DeviceSize) -> VkResult<()>;
    /// Invalidate a byte range relative to the allocation start
    fn invalidate(&self, key: PoolKey, offset: vk::DeviceSize, size: vk::DeviceSize) -> VkResult<()>;
    /// Return the allocation to the pool; false if the key was unknown
    fn free_buffer(&self, key: PoolKey) -> bool;
}

/// Routes allocations to the pool or to dedicated native allocations
pub struct MemoryAllocator {
    pool: Option<Box<dyn PoolAllocator>>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    api: Arc<dyn DeviceApi>,
}

impl MemoryAllocator {
    /// Create an allocator; without a pool every allocation is dedicated
    pub fn new(
        api: Arc<dyn DeviceApi>,
        memory_properties: vk::PhysicalDeviceMemoryProperties,
        pool: Option<Box<dyn PoolAllocator>>,
    ) -> Self {
        Self {
            pool,
            memory_properties,
            api,
        }
    }

    /// Whether a pool is available
    pub fn has_pool(&self) -> bool {
        self.pool.is_some()
    }

    /// Physical device memory properties
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /// Find a memory type allowed by `type_bits` that has all of `properties`
    pub fn find_memory_type(&self, type_bits: u32, properties: vk::MemoryPropertyFlags) -> Option<u32> {
        (0..self.memory_properties.memory_type_count).find(|&i| {
            (type_bits & (1 << i)) != 0
                && self.memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(properties)
        })
    }

    /// Allocate memory for a buffer, from the pool when `from_pool` is set
    pub fn allocate_for_buffer(&self, buffer: vk::Buffer, usage: MemoryUsage, from_pool: bool) -> GpuResult<Allocation> {
        if from_pool {
            let pool = self
                .pool
                .as_ref()
                .ok_or_else(|| GpuError::invalid_state("pooled allocation requested but the device has no memory pool"))?;
            let key = pool.allocate_buffer(buffer, usage).map_err(pool_error)?;
            let info = pool
                .allocation_info(key)
                .ok_or_else(|| GpuError::invalid_state("pool lost a fresh allocation"))?;
            return Ok(Allocation::Pooled { key, info });
        }

        let requirements = self.api.buffer_memory_requirements(buffer);
        self.allocate_standalone(requirements, usage)
    }

    /// Allocate dedicated memory for an image
    pub fn allocate_for_image(&self, image: vk::Image, usage: MemoryUsage) -> GpuResult<Allocation> {
        let requirements = self.api.image_memory_requirements(image);
        self.allocate_standalone(requirements, usage)
    }

    fn allocate_standalone(&self, requirements: vk::MemoryRequirements, usage: MemoryUsage) -> GpuResult<Allocation> {
        let required_flags = usage.required_flags();
        let memory_type_index = self
            .find_memory_type(requirements.memory_type_bits, required_flags)
            .ok_or(GpuError::NoSuitableMemoryType)?;

        let allocate_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        let memory = self.api.allocate_memory(&allocate_info).map_err(pool_error)?;

        Ok(Allocation::Standalone {
            info: AllocationInfo {
                memory,
                offset: 0,
                size: requirements.size,
                memory_type_index,
                property_flags: self.memory_properties.memory_types[memory_type_index as usize].property_flags,
            },
            required_flags,
        })
    }

    /// Bind an allocation to a buffer
    pub fn bind_buffer(&self, allocation: &Allocation, buffer: vk::Buffer) -> GpuResult<()> {
        match allocation {
            Allocation::Pooled { key, .. } => self.pool()?.bind_buffer(*key, buffer)?,
            Allocation::Standalone { info, .. } => self.api.bind_buffer_memory(buffer, info.memory, 0)?,
        }
        Ok(())
    }

    /// Bind a dedicated allocation to an image
    pub fn bind_image(&self, allocation: &Allocation, image: vk::Image) -> GpuResult<()> {
        match allocation {
            Allocation::Pooled { .. } => Err(GpuError::invalid_argument("images are never pool-allocated")),
            Allocation::Standalone { info, .. } => {
                self.api.bind_image_memory(image, info.memory, 0)?;
                Ok(())
            }
        }
    }

    /// Map an allocation into host memory
    ///
    /// Dedicated allocations requested as device-local are refused without a
    /// native call, as is any memory type that is not host-visible.
    pub fn map(&self, allocation: &Allocation) -> GpuResult<*mut u8> {
        match allocation {
            Allocation::Pooled { key, .. } => Ok(self.pool()?.map(*key)?),
            Allocation::Standalone { info, required_flags } => {
                if required_flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL) || !info.is_host_visible() {
                    return Err(GpuError::invalid_state("device-local memory cannot be mapped"));
                }
                let ptr = self.api.map_memory(info.memory, 0, vk::WHOLE_SIZE)?;
                Ok(ptr.cast())
            }
        }
    }

    /// Undo a previous [`MemoryAllocator::map`]
    pub fn unmap(&self, allocation: &Allocation) {
        match allocation {
            Allocation::Pooled { key, .. } => {
                if let Some(pool) = &self.pool {
                    pool.unmap(*key);
                }
            }
            Allocation::Standalone { info, .. } => self.api.unmap_memory(info.memory),
        }
    }

    /// Make host writes visible to the device
    ///
    /// Coherent memory needs nothing; otherwise the whole allocation range
    /// is flushed.
    pub fn flush(&self, allocation: &Allocation) -> GpuResult<()> {
        match allocation {
            Allocation::Pooled { key, info } => {
                self.pool()?.flush(*key, 0, info.size)?;
            }
            Allocation::Standalone { info, .. } => {
                if info.needs_flush() {
                    let range = vk::MappedMemoryRange::builder()
                        .memory(info.memory)
                        .offset(0)
                        .size(vk::WHOLE_SIZE)
                        .build();
                    self.api.flush_mapped_memory_ranges(&[range])?;
                }
            }
        }
        Ok(())
    }

    /// Make device writes visible to host reads
    ///
    /// Call after mapping and before reading. Coherent memory needs nothing.
    pub fn invalidate(&self, allocation: &Allocation) -> GpuResult<()> {
        match allocation {
            Allocation::Pooled { key, info } => {
                self.pool()?.invalidate(*key, 0, info.size)?;
            }
            Allocation::Standalone { info, .. } => {
                if info.needs_flush() {
                    let range = vk::MappedMemoryRange::builder()
                        .memory(info.memory)
                        .offset(0)
                        .size(vk::WHOLE_SIZE)
                        .build();
                    self.api.invalidate_mapped_memory_ranges(&[range])?;
                }
            }
        }
        Ok(())
    }

    /// Release an allocation through the path that created it
    pub fn free(&self, allocation: Allocation) {
        match allocation {
            Allocation::Pooled { key, .. } => match &self.pool {
                Some(pool) => {
                    if !pool.free_buffer(key) {
                        log::warn!("memory_allocator::free: pool did not know allocation {:?}", key);
                    }
                }
                None => log::warn!("memory_allocator::free: pooled allocation without a pool"),
            },
            Allocation::Standalone { info, .. } => self.api.free_memory(info.memory),
        }
    }

    fn pool(&self) -> GpuResult<&dyn PoolAllocator> {
        self.pool
            .as_deref()
            .ok_or_else(|| GpuError::invalid_state("device has no memory pool"))
    }
}

/// Out-of-memory results are exhaustion, anything else stays an API error
fn pool_error(result: vk::Result) -> GpuError {
    match result {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            GpuError::exhausted(format!("device memory allocation failed: {:?}", result))
        }
        other => GpuError::Api(other),
    }
}
