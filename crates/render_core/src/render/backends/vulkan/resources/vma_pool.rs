//! Pooled buffer memory backed by the Vulkan Memory Allocator

use ash::prelude::VkResult;
use ash::vk;
use vk_mem::Alloc;
use slotmap::SlotMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::memory_allocator::{AllocationInfo, MemoryUsage, PoolAllocator, PoolKey};
use crate::render::backends::vulkan::initialization::context::{GpuError, GpuResult};

/// [`PoolAllocator`] over `vk-mem`
///
/// Live allocations are kept in a slot map so callers only ever hold a
/// [`PoolKey`]. Must be dropped before the `ash::Device` it was created from.
pub struct VmaPool {
    allocations: Mutex<SlotMap<PoolKey, vk_mem::Allocation>>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    allocator: vk_mem::Allocator,
}

impl VmaPool {
    /// Create the allocator for a device
    pub fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
    ) -> GpuResult<Self> {
        let allocator = vk_mem::Allocator::new(vk_mem::AllocatorCreateInfo::new(instance, device, physical_device))
            .map_err(|e| GpuError::InitializationFailed(format!("Failed to create memory allocator: {:?}", e)))?;
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };

        log::debug!("Memory pool created");
        Ok(Self {
            allocations: Mutex::new(SlotMap::with_key()),
            memory_properties,
            allocator,
        })
    }

    fn lock(&self) -> MutexGuard<'_, SlotMap<PoolKey, vk_mem::Allocation>> {
        self.allocations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn create_info(usage: MemoryUsage) -> vk_mem::AllocationCreateInfo {
        let (vma_usage, flags) = match usage {
            MemoryUsage::GpuOnly => (vk_mem::MemoryUsage::AutoPreferDevice, vk_mem::AllocationCreateFlags::empty()),
            MemoryUsage::CpuOnly => (
                vk_mem::MemoryUsage::AutoPreferHost,
                vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
            ),
            MemoryUsage::CpuToGpu => (
                vk_mem::MemoryUsage::Auto,
                vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
            ),
            MemoryUsage::GpuToCpu => (vk_mem::MemoryUsage::Auto, vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM),
        };
        let required_flags = if usage.is_host_visible() {
            vk::MemoryPropertyFlags::HOST_VISIBLE
        } else {
            vk::MemoryPropertyFlags::empty()
        };
        vk_mem::AllocationCreateInfo {
            usage: vma_usage,
            flags,
            required_flags,
            ..Default::default()
        }
    }
}

impl PoolAllocator for VmaPool {
    fn allocate_buffer(&self, buffer: vk::Buffer, usage: MemoryUsage) -> VkResult<PoolKey> {
        let allocation = unsafe { self.allocator.allocate_memory_for_buffer(buffer, &Self::create_info(usage))? };
        Ok(self.lock().insert(allocation))
    }

    fn allocation_info(&self, key: PoolKey) -> Option<AllocationInfo> {
        let allocations = self.lock();
        let allocation = allocations.get(key)?;
        let info = self.allocator.get_allocation_info(allocation);
        Some(AllocationInfo {
            memory: info.device_memory,
            offset: info.offset,
            size: info.size,
            memory_type_index: info.memory_type,
            property_flags: self.memory_properties.memory_types[info.memory_type as usize].property_flags,
        })
    }

    fn bind_buffer(&self, key: PoolKey, buffer: vk::Buffer) -> VkResult<()> {
        let mut allocations = self.lock();
        let allocation = allocations.get_mut(key).ok_or(vk::Result::ERROR_UNKNOWN)?;
        unsafe { self.allocator.bind_buffer_memory(allocation, buffer) }
    }

    fn map(&self, key: PoolKey) -> VkResult<*mut u8> {
        let mut allocations = self.lock();
        let allocation = allocations.get_mut(key).ok_or(vk::Result::ERROR_UNKNOWN)?;
        unsafe { self.allocator.map_memory(allocation) }
    }

    fn unmap(&self, key: PoolKey) {
        if let Some(allocation) = self.lock().get_mut(key) {
            unsafe { self.allocator.unmap_memory(allocation) };
        }
    }

    fn flush(&self, key: PoolKey, offset: vk::DeviceSize, size: vk::DeviceSize) -> VkResult<()> {
        let allocations = self.lock();
        let allocation = allocations.get(key).ok_or(vk::Result::ERROR_UNKNOWN)?;
        self.allocator
            .flush_allocation(allocation, offset as usize, size as usize)
    }

    fn invalidate(&self, key: PoolKey, offset: vk::DeviceSize, size: vk::DeviceSize) -> VkResult<()> {
        let allocations = self.lock();
        let allocation = allocations.get(key).ok_or(vk::Result::ERROR_UNKNOWN)?;
        self.allocator
            .invalidate_allocation(allocation, offset as usize, size as usize)
    }

    fn free_buffer(&self, key: PoolKey) -> bool {
        match self.lock().remove(key) {
            Some(mut allocation) => {
                unsafe { self.allocator.free_memory(&mut allocation) };
                true
            }
            None => false,
        }
    }
}

impl Drop for VmaPool {
    fn drop(&mut self) {
        let allocations = self.allocations.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !allocations.is_empty() {
            log::warn!("Memory pool dropped with {} live allocations", allocations.len());
        }
        for (_, mut allocation) in allocations.drain() {
            unsafe { self.allocator.free_memory(&mut allocation) };
        }
    }
}
