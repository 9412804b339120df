//! `ash`-backed native device
//!
//! [`AshDevice`] owns the Vulkan entry, instance and logical device and
//! implements [`DeviceApi`] by forwarding each call. [`create_headless`]
//! builds a complete [`GraphicsDevice`] without a surface, which is all
//! offscreen rendering needs.

use ash::extensions::ext::DebugUtils;
use ash::prelude::VkResult;
use ash::{vk, Device, Entry, Instance};
use std::ffi::{c_void, CStr, CString};
use std::sync::Arc;

use super::context::{DeviceFeatures, DeviceInfo, DeviceParts, DeviceQueues, GpuError, GpuResult, GraphicsDevice, Queue};
use super::device_api::DeviceApi;
use crate::core::config::RenderCoreConfig;
use crate::render::backends::vulkan::resources::memory_allocator::PoolAllocator;
use crate::render::backends::vulkan::resources::vma_pool::VmaPool;

const ENGINE_NAME: &str = "render_core";
const VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";

/// Native device entry points over `ash`
pub struct AshDevice {
    device: Device,
    debug: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    instance: Instance,
    _entry: Entry,
}

impl Drop for AshDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
            if let Some((debug_utils, messenger)) = self.debug.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        log::debug!("Vulkan device destroyed");
    }
}

/// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    let message = if callback_data.is_null() || (*callback_data).p_message.is_null() {
        std::borrow::Cow::Borrowed("<no message>")
    } else {
        CStr::from_ptr((*callback_data).p_message).to_string_lossy()
    };

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::debug!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}

fn init_error(what: &str, result: vk::Result) -> GpuError {
    GpuError::InitializationFailed(format!("{}: {:?}", what, result))
}

fn create_instance(entry: &Entry, config: &RenderCoreConfig) -> GpuResult<(Instance, bool)> {
    let app_name = CString::new(config.application_name.as_str())
        .map_err(|_| GpuError::invalid_argument("application name contains a NUL byte"))?;
    let engine_name = CString::new(ENGINE_NAME).map_err(|_| GpuError::invalid_argument("engine name"))?;
    let app_info = vk::ApplicationInfo::builder()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 1, 0, 0))
        .engine_name(&engine_name)
        .engine_version(vk::make_api_version(0, 1, 0, 0))
        .api_version(vk::API_VERSION_1_1);

    let mut validation = config.validation_enabled();
    if validation {
        let available = entry
            .enumerate_instance_layer_properties()
            .map_err(|e| init_error("Failed to enumerate layers", e))?;
        validation = available.iter().any(|layer| {
            // SAFETY: layer names are NUL-terminated by the loader.
            unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) }.to_bytes() == VALIDATION_LAYER.as_bytes()
        });
        if !validation {
            log::warn!("{} not available, continuing without validation", VALIDATION_LAYER);
        }
    }

    let layer = CString::new(VALIDATION_LAYER).map_err(|_| GpuError::invalid_argument("layer name"))?;
    let layers: Vec<*const std::os::raw::c_char> = if validation { vec![layer.as_ptr()] } else { Vec::new() };
    let extensions: Vec<*const std::os::raw::c_char> = if validation {
        vec![DebugUtils::name().as_ptr()]
    } else {
        Vec::new()
    };

    let create_info = vk::InstanceCreateInfo::builder()
        .application_info(&app_info)
        .enabled_layer_names(&layers)
        .enabled_extension_names(&extensions);
    let instance = unsafe { entry.create_instance(&create_info, None) }
        .map_err(|e| init_error("Failed to create instance", e))?;
    Ok((instance, validation))
}

fn create_debug_messenger(entry: &Entry, instance: &Instance) -> GpuResult<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
    let debug_utils = DebugUtils::new(entry, instance);
    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR)
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));
    let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
        .map_err(|e| init_error("Failed to create debug messenger", e))?;
    Ok((debug_utils, messenger))
}

/// Chosen physical device and its queue families
struct Selection {
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    features: vk::PhysicalDeviceFeatures,
    graphics_family: u32,
    compute_family: Option<u32>,
    transfer_family: Option<u32>,
}

fn select_physical_device(instance: &Instance) -> GpuResult<Selection> {
    let devices = unsafe { instance.enumerate_physical_devices() }
        .map_err(|e| init_error("Failed to enumerate physical devices", e))?;

    let mut candidates: Vec<Selection> = devices
        .into_iter()
        .filter_map(|physical_device| {
            let families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
            let find = |wanted: vk::QueueFlags, unwanted: vk::QueueFlags| {
                families
                    .iter()
                    .position(|family| {
                        family.queue_count > 0
                            && family.queue_flags.contains(wanted)
                            && !family.queue_flags.intersects(unwanted)
                    })
                    .map(|index| index as u32)
            };
            let graphics_family = find(vk::QueueFlags::GRAPHICS, vk::QueueFlags::empty())?;
            Some(Selection {
                physical_device,
                properties: unsafe { instance.get_physical_device_properties(physical_device) },
                features: unsafe { instance.get_physical_device_features(physical_device) },
                graphics_family,
                compute_family: find(vk::QueueFlags::COMPUTE, vk::QueueFlags::GRAPHICS),
                transfer_family: find(
                    vk::QueueFlags::TRANSFER,
                    vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
                ),
            })
        })
        .collect();

    candidates.sort_by_key(|candidate| match candidate.properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 0,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        _ => 3,
    });
    if candidates.is_empty() {
        return Err(GpuError::InitializationFailed("No suitable GPU found".to_string()));
    }
    Ok(candidates.swap_remove(0))
}

fn device_info(properties: &vk::PhysicalDeviceProperties) -> DeviceInfo {
    // SAFETY: the driver NUL-terminates the device name.
    let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
        .to_string_lossy()
        .into_owned();
    let device_type = match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => "discrete",
        vk::PhysicalDeviceType::INTEGRATED_GPU => "integrated",
        vk::PhysicalDeviceType::VIRTUAL_GPU => "virtual",
        vk::PhysicalDeviceType::CPU => "cpu",
        _ => "other",
    };
    DeviceInfo {
        name,
        vendor_id: properties.vendor_id,
        device_id: properties.device_id,
        api_version: properties.api_version,
        device_type: device_type.to_string(),
    }
}

/// Create a [`GraphicsDevice`] on the best available GPU, without a surface
///
/// Validation layers are enabled when the configuration asks for them and
/// the layer is installed. A `vk-mem` pool is created when
/// `use_memory_pool` is set.
pub fn create_headless(config: RenderCoreConfig) -> GpuResult<GraphicsDevice> {
    config.validate().map_err(GpuError::InitializationFailed)?;

    let entry = unsafe { Entry::load() }
        .map_err(|e| GpuError::InitializationFailed(format!("Failed to load Vulkan: {:?}", e)))?;
    let (instance, validation) = create_instance(&entry, &config)?;

    let debug = if validation {
        match create_debug_messenger(&entry, &instance) {
            Ok(debug) => Some(debug),
            Err(e) => {
                log::warn!("{}", e);
                None
            }
        }
    } else {
        None
    };

    let selection = match select_physical_device(&instance) {
        Ok(selection) => selection,
        Err(e) => {
            unsafe {
                if let Some((debug_utils, messenger)) = &debug {
                    debug_utils.destroy_debug_utils_messenger(*messenger, None);
                }
                instance.destroy_instance(None);
            }
            return Err(e);
        }
    };

    let features = DeviceFeatures {
        multi_draw_indirect: selection.features.multi_draw_indirect == vk::TRUE,
        sampler_anisotropy: selection.features.sampler_anisotropy == vk::TRUE,
    };
    let enabled_features = vk::PhysicalDeviceFeatures::builder()
        .multi_draw_indirect(features.multi_draw_indirect)
        .sampler_anisotropy(features.sampler_anisotropy)
        .build();

    let mut families = vec![selection.graphics_family];
    families.extend(selection.compute_family);
    families.extend(selection.transfer_family);
    let priorities = [1.0f32];
    let queue_infos: Vec<vk::DeviceQueueCreateInfo> = families
        .iter()
        .map(|&family| {
            vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(family)
                .queue_priorities(&priorities)
                .build()
        })
        .collect();
    let create_info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(&queue_infos)
        .enabled_features(&enabled_features);

    let device = match unsafe { instance.create_device(selection.physical_device, &create_info, None) } {
        Ok(device) => device,
        Err(e) => {
            unsafe {
                if let Some((debug_utils, messenger)) = &debug {
                    debug_utils.destroy_debug_utils_messenger(*messenger, None);
                }
                instance.destroy_instance(None);
            }
            return Err(init_error("Failed to create logical device", e));
        }
    };

    let queue = |family: u32| Queue {
        handle: unsafe { device.get_device_queue(family, 0) },
        family_index: family,
    };
    let queues = DeviceQueues {
        graphics: queue(selection.graphics_family),
        present: None,
        compute: selection.compute_family.map(queue),
        transfer: selection.transfer_family.map(queue),
    };
    let memory_properties = unsafe { instance.get_physical_device_memory_properties(selection.physical_device) };

    let pool: Option<Box<dyn PoolAllocator>> = if config.use_memory_pool {
        match VmaPool::new(&instance, &device, selection.physical_device) {
            Ok(pool) => Some(Box::new(pool)),
            Err(e) => {
                log::warn!("{}; falling back to dedicated allocations", e);
                None
            }
        }
    } else {
        None
    };

    let info = device_info(&selection.properties);
    log::info!("Selected GPU: {}", info);

    let api: Arc<dyn DeviceApi> = Arc::new(AshDevice {
        device,
        debug,
        instance,
        _entry: entry,
    });
    GraphicsDevice::new(
        DeviceParts {
            api,
            info,
            features,
            queues,
            memory_properties,
            pool,
        },
        config,
    )
}

impl DeviceApi for AshDevice {
    fn create_buffer(&self, create_info: &vk::BufferCreateInfo) -> VkResult<vk::Buffer> {
        unsafe { self.device.create_buffer(create_info, None) }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) }
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn allocate_memory(&self, allocate_info: &vk::MemoryAllocateInfo) -> VkResult<vk::DeviceMemory> {
        unsafe { self.device.allocate_memory(allocate_info, None) }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) }
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory, offset: vk::DeviceSize) -> VkResult<()> {
        unsafe { self.device.bind_buffer_memory(buffer, memory, offset) }
    }

    fn map_memory(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, size: vk::DeviceSize) -> VkResult<*mut c_void> {
        unsafe {
            self.device
                .map_memory(memory, offset, size, vk::MemoryMapFlags::empty())
        }
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.unmap_memory(memory) }
    }

    fn flush_mapped_memory_ranges(&self, ranges: &[vk::MappedMemoryRange]) -> VkResult<()> {
        unsafe { self.device.flush_mapped_memory_ranges(ranges) }
    }

    fn invalidate_mapped_memory_ranges(&self, ranges: &[vk::MappedMemoryRange]) -> VkResult<()> {
        unsafe { self.device.invalidate_mapped_memory_ranges(ranges) }
    }

    fn create_image(&self, create_info: &vk::ImageCreateInfo) -> VkResult<vk::Image> {
        unsafe { self.device.create_image(create_info, None) }
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) }
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        unsafe { self.device.get_image_memory_requirements(image) }
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory, offset: vk::DeviceSize) -> VkResult<()> {
        unsafe { self.device.bind_image_memory(image, memory, offset) }
    }

    fn create_image_view(&self, create_info: &vk::ImageViewCreateInfo) -> VkResult<vk::ImageView> {
        unsafe { self.device.create_image_view(create_info, None) }
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) }
    }

    fn create_sampler(&self, create_info: &vk::SamplerCreateInfo) -> VkResult<vk::Sampler> {
        unsafe { self.device.create_sampler(create_info, None) }
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) }
    }

    fn create_command_pool(&self, queue_family_index: u32, flags: vk::CommandPoolCreateFlags) -> VkResult<vk::CommandPool> {
        let create_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family_index)
            .flags(flags);
        unsafe { self.device.create_command_pool(&create_info, None) }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(count);
        unsafe { self.device.allocate_command_buffers(&allocate_info) }
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, command_buffers: &[vk::CommandBuffer]) {
        unsafe { self.device.free_command_buffers(pool, command_buffers) }
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::CommandBufferBeginInfo,
    ) -> VkResult<()> {
        unsafe { self.device.begin_command_buffer(command_buffer, begin_info) }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.device.end_command_buffer(command_buffer) }
    }

    fn queue_submit(&self, queue: vk::Queue, submits: &[vk::SubmitInfo], fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.queue_submit(queue, submits, fence) }
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        unsafe { self.device.queue_wait_idle(queue) }
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        unsafe { self.device.device_wait_idle() }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::builder().flags(flags);
        unsafe { self.device.create_fence(&create_info, None) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], wait_all: bool, timeout_ns: u64) -> VkResult<()> {
        unsafe { self.device.wait_for_fences(fences, wait_all, timeout_ns) }
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()> {
        unsafe { self.device.reset_fences(fences) }
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        unsafe { self.device.get_fence_status(fence) }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::builder();
        unsafe { self.device.create_semaphore(&create_info, None) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn create_render_pass(&self, create_info: &vk::RenderPassCreateInfo) -> VkResult<vk::RenderPass> {
        unsafe { self.device.create_render_pass(create_info, None) }
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe { self.device.destroy_render_pass(render_pass, None) }
    }

    fn create_framebuffer(&self, create_info: &vk::FramebufferCreateInfo) -> VkResult<vk::Framebuffer> {
        unsafe { self.device.create_framebuffer(create_info, None) }
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) }
    }

    fn cmd_begin_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::RenderPassBeginInfo,
        contents: vk::SubpassContents,
    ) {
        unsafe { self.device.cmd_begin_render_pass(command_buffer, begin_info, contents) }
    }

    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_render_pass(command_buffer) }
    }

    fn cmd_copy_buffer(&self, command_buffer: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        unsafe { self.device.cmd_copy_buffer(command_buffer, src, dst, regions) }
    }

    fn cmd_bind_vertex_buffers(
        &self,
        command_buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(command_buffer, first_binding, buffers, offsets)
        }
    }

    fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(command_buffer, buffer, offset, index_type)
        }
    }

    fn cmd_draw(
        &self,
        command_buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        unsafe {
            self.device
                .cmd_draw(command_buffer, vertex_count, instance_count, first_vertex, first_instance)
        }
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
        unsafe {
            self.device.cmd_draw_indexed(
                command_buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        }
    }

    fn cmd_draw_indexed_indirect(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        draw_count: u32,
        stride: u32,
    ) {
        unsafe {
            self.device
                .cmd_draw_indexed_indirect(command_buffer, buffer, offset, draw_count, stride)
        }
    }

    fn cmd_execute_commands(&self, command_buffer: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]) {
        unsafe { self.device.cmd_execute_commands(command_buffer, secondaries) }
    }
}
