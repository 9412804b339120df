//! Graphics device context
//!
//! [`GraphicsDevice`] is the single long-lived owner of the native device
//! entry points, the queues, the shared command pool and the memory
//! allocator. Every resource in this crate borrows it, so the borrow checker
//! guarantees the device outlives whatever it created.
//!
//! Failures are reported through [`GraphicsDevice::report`], which logs the
//! error once with the device identity and an operation trace string, then
//! hands the error back for propagation.

use ash::vk;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

use super::device_api::DeviceApi;
use crate::core::config::RenderCoreConfig;
use crate::render::backends::vulkan::rendering::commands::{CommandBuffer, CommandBufferState};
use crate::render::backends::vulkan::resources::memory_allocator::{MemoryAllocator, PoolAllocator};
use crate::render::backends::vulkan::state::sync::{Fence, FenceState, Semaphore};

/// GPU layer error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    /// A caller-supplied argument was rejected before any work was done
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Description of the rejected argument
        reason: String,
    },

    /// No memory type satisfies both the resource and the requested visibility
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,

    /// An allocator or pool ran out of space
    #[error("Resource exhausted: {reason}")]
    ResourceExhausted {
        /// What ran out
        reason: String,
    },

    /// An operation was attempted in the wrong lifecycle state
    #[error("Invalid state: {reason}")]
    InvalidState {
        /// Description of the state violation
        reason: String,
    },

    /// A fence did not signal within the allowed time
    #[error("Fence wait timed out after {timeout_ns} ns")]
    FenceTimeout {
        /// The timeout that elapsed
        timeout_ns: u64,
    },

    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Device or instance initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),
}

impl GpuError {
    /// Shorthand for [`GpuError::InvalidArgument`]
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument { reason: reason.into() }
    }

    /// Shorthand for [`GpuError::InvalidState`]
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState { reason: reason.into() }
    }

    /// Shorthand for [`GpuError::ResourceExhausted`]
    pub fn exhausted(reason: impl Into<String>) -> Self {
        Self::ResourceExhausted { reason: reason.into() }
    }

    /// Failure class of this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidArgument { .. } => ErrorClass::InvalidArgument,
            Self::NoSuitableMemoryType | Self::ResourceExhausted { .. } => ErrorClass::ResourceExhaustion,
            Self::InvalidState { .. } => ErrorClass::StateMisuse,
            Self::FenceTimeout { .. } => ErrorClass::GpuCompletion,
            Self::Api(result) => match *result {
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
                | vk::Result::ERROR_OUT_OF_HOST_MEMORY
                | vk::Result::ERROR_TOO_MANY_OBJECTS
                | vk::Result::ERROR_OUT_OF_POOL_MEMORY => ErrorClass::ResourceExhaustion,
                vk::Result::TIMEOUT | vk::Result::ERROR_DEVICE_LOST => ErrorClass::GpuCompletion,
                _ => ErrorClass::Api,
            },
            Self::InitializationFailed(_) => ErrorClass::Api,
        }
    }
}

impl From<vk::Result> for GpuError {
    fn from(result: vk::Result) -> Self {
        Self::Api(result)
    }
}

/// Result type for GPU operations
pub type GpuResult<T> = Result<T, GpuError>;

/// Broad failure classes, used to pick a log severity and by callers that
/// decide whether a failure is recoverable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Bad input, detected before any work
    InvalidArgument,
    /// Memory or object allocation failed
    ResourceExhaustion,
    /// Operation out of lifecycle order
    StateMisuse,
    /// GPU work did not complete; treat as device loss
    GpuCompletion,
    /// Any other native failure
    Api,
}

/// Identity of the physical device, used in every diagnostic line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Driver-reported device name
    pub name: String,
    /// PCI vendor id
    pub vendor_id: u32,
    /// PCI device id
    pub device_id: u32,
    /// Supported API version, packed
    pub api_version: u32,
    /// Discrete, integrated, virtual, CPU...
    pub device_type: String,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, vendor 0x{:04x}, device 0x{:04x}, api {}.{}.{})",
            self.name,
            self.device_type,
            self.vendor_id,
            self.device_id,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
        )
    }
}

/// Optional device capabilities this layer adapts to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceFeatures {
    /// One indirect call may issue several draws
    pub multi_draw_indirect: bool,
    /// Anisotropic filtering on samplers
    pub sampler_anisotropy: bool,
}

/// A device queue and the family it belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Queue {
    /// Native queue handle
    pub handle: vk::Queue,
    /// Queue family index
    pub family_index: u32,
}

/// Queues retrieved at device creation
#[derive(Debug, Clone, Copy)]
pub struct DeviceQueues {
    /// Graphics queue, always present
    pub graphics: Queue,
    /// Presentation queue, when a surface was involved
    pub present: Option<Queue>,
    /// Dedicated compute queue
    pub compute: Option<Queue>,
    /// Dedicated transfer queue
    pub transfer: Option<Queue>,
}

/// Everything needed to assemble a [`GraphicsDevice`]
pub struct DeviceParts {
    /// Native entry points
    pub api: Arc<dyn DeviceApi>,
    /// Device identity
    pub info: DeviceInfo,
    /// Enabled optional features
    pub features: DeviceFeatures,
    /// Retrieved queues
    pub queues: DeviceQueues,
    /// Physical device memory types and heaps
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Pooled sub-allocator, if one was created
    pub pool: Option<Box<dyn PoolAllocator>>,
}

/// Owner of the native device and everything shared between resources
///
/// Field order matters: the memory allocator (and any pool inside it) is
/// dropped before the native entry points.
pub struct GraphicsDevice {
    info: DeviceInfo,
    features: DeviceFeatures,
    queues: DeviceQueues,
    config: RenderCoreConfig,
    shared_pool: Mutex<vk::CommandPool>,
    default_texture: Option<vk::DescriptorImageInfo>,
    memory_allocator: MemoryAllocator,
    api: Arc<dyn DeviceApi>,
}

impl GraphicsDevice {
    /// Assemble a device from its parts and create the shared command pool
    pub fn new(parts: DeviceParts, config: RenderCoreConfig) -> GpuResult<Self> {
        config.validate().map_err(GpuError::InitializationFailed)?;

        let pool = if config.use_memory_pool {
            parts.pool
        } else {
            None
        };

        let shared_pool = parts
            .api
            .create_command_pool(
                parts.queues.graphics.family_index,
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )
            .map_err(|e| {
                log::error!("graphics_device::new [{}]: shared command pool creation failed: {:?}", parts.info, e);
                GpuError::Api(e)
            })?;

        log::info!(
            "Graphics device ready: {} (memory pool: {}, multi-draw-indirect: {})",
            parts.info,
            pool.is_some(),
            parts.features.multi_draw_indirect
        );

        Ok(Self {
            info: parts.info,
            features: parts.features,
            queues: parts.queues,
            config,
            shared_pool: Mutex::new(shared_pool),
            default_texture: None,
            memory_allocator: MemoryAllocator::new(Arc::clone(&parts.api), parts.memory_properties, pool),
            api: parts.api,
        })
    }

    /// Native entry points
    pub fn api(&self) -> &dyn DeviceApi {
        self.api.as_ref()
    }

    /// Device identity used in diagnostics
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Enabled optional features
    pub fn features(&self) -> DeviceFeatures {
        self.features
    }

    /// All retrieved queues
    pub fn queues(&self) -> &DeviceQueues {
        &self.queues
    }

    /// The graphics queue
    pub fn graphics_queue(&self) -> &Queue {
        &self.queues.graphics
    }

    /// Configuration the device was created with
    pub fn config(&self) -> &RenderCoreConfig {
        &self.config
    }

    /// Device memory allocator
    pub fn memory_allocator(&self) -> &MemoryAllocator {
        &self.memory_allocator
    }

    /// Whether buffers can be sub-allocated from a pool
    pub fn has_memory_pool(&self) -> bool {
        self.memory_allocator.has_pool()
    }

    /// Texture bound to meshes that were never given one
    pub fn default_texture(&self) -> Option<vk::DescriptorImageInfo> {
        self.default_texture
    }

    /// Set the texture bound to meshes that were never given one
    pub fn set_default_texture(&mut self, texture: vk::DescriptorImageInfo) {
        self.default_texture = Some(texture);
    }

    /// Log a failure with device context and hand it back
    ///
    /// State misuse is logged as a warning, everything else as an error.
    pub fn report(&self, trace: &str, error: GpuError) -> GpuError {
        match error.class() {
            ErrorClass::StateMisuse => log::warn!("{} [{}]: {}", trace, self.info, error),
            _ => log::error!("{} [{}]: {}", trace, self.info, error),
        }
        error
    }

    /// Run `f` with the shared command pool locked
    pub(crate) fn with_shared_pool<R>(&self, f: impl FnOnce(vk::CommandPool) -> R) -> R {
        let pool = self.shared_pool.lock().unwrap_or_else(PoisonError::into_inner);
        f(*pool)
    }

    /// Submit recorded command buffers to a queue
    ///
    /// `wait_stages[i]` is the stage at which `wait_semaphores[i]` is waited
    /// on. The fence, if any, must be unsignaled and is left pending. With
    /// `wait_idle` the host blocks until the queue drains.
    ///
    /// Submitting to one queue from several threads at once is not
    /// synchronized here; callers must serialize it.
    #[allow(clippy::too_many_arguments)]
    pub fn submit(
        &self,
        command_buffers: &[&CommandBuffer],
        queue: &Queue,
        wait_stages: &[vk::PipelineStageFlags],
        wait_semaphores: &[&Semaphore],
        signal_semaphores: &[&Semaphore],
        fence: Option<&Fence>,
        wait_idle: bool,
    ) -> GpuResult<()> {
        const TRACE: &str = "graphics_device::submit";

        if command_buffers.is_empty() {
            return Err(self.report(TRACE, GpuError::invalid_argument("no command buffers to submit")));
        }
        if wait_stages.len() != wait_semaphores.len() {
            return Err(self.report(
                TRACE,
                GpuError::invalid_argument(format!(
                    "{} wait stages for {} wait semaphores",
                    wait_stages.len(),
                    wait_semaphores.len()
                )),
            ));
        }
        if let Some(index) = command_buffers
            .iter()
            .position(|cmd| !matches!(cmd.state(), CommandBufferState::Recorded | CommandBufferState::Submitted))
        {
            return Err(self.report(
                TRACE,
                GpuError::invalid_state(format!(
                    "command buffer {} is {:?}, expected a finished recording",
                    index,
                    command_buffers[index].state()
                )),
            ));
        }
        if let Some(fence) = fence {
            if fence.state() != FenceState::Unsignaled {
                return Err(self.report(
                    TRACE,
                    GpuError::invalid_state(format!("fence is {:?}; reset it before reuse", fence.state())),
                ));
            }
        }

        let handles: Vec<vk::CommandBuffer> = command_buffers.iter().map(|cmd| cmd.handle()).collect();
        let waits: Vec<vk::Semaphore> = wait_semaphores.iter().map(|s| s.handle()).collect();
        let signals: Vec<vk::Semaphore> = signal_semaphores.iter().map(|s| s.handle()).collect();

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&waits)
            .wait_dst_stage_mask(wait_stages)
            .command_buffers(&handles)
            .signal_semaphores(&signals)
            .build();

        let fence_handle = fence.map_or_else(vk::Fence::null, Fence::handle);
        self.api
            .queue_submit(queue.handle, &[submit_info], fence_handle)
            .map_err(|e| self.report(TRACE, GpuError::Api(e)))?;

        for cmd in command_buffers {
            cmd.set_state(CommandBufferState::Submitted);
        }
        if let Some(fence) = fence {
            fence.mark_pending();
        }

        if wait_idle {
            self.api
                .queue_wait_idle(queue.handle)
                .map_err(|e| self.report(TRACE, GpuError::Api(e)))?;
        }
        Ok(())
    }

    /// Record a raw non-indexed draw
    pub fn draw(
        &self,
        command_buffer: &CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> GpuResult<()> {
        if command_buffer.state() != CommandBufferState::Recording {
            return Err(self.report(
                "graphics_device::draw",
                GpuError::invalid_state("command buffer is not recording"),
            ));
        }
        self.api.cmd_draw(
            command_buffer.handle(),
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        );
        Ok(())
    }

    /// Block until all queues are idle
    pub fn wait_idle(&self) -> GpuResult<()> {
        self.api
            .device_wait_idle()
            .map_err(|e| self.report("graphics_device::wait_idle", GpuError::Api(e)))
    }
}

impl fmt::Debug for GraphicsDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphicsDevice")
            .field("info", &self.info)
            .field("features", &self.features)
            .field("queues", &self.queues)
            .field("memory_pool", &self.has_memory_pool())
            .finish_non_exhaustive()
    }
}

impl Drop for GraphicsDevice {
    fn drop(&mut self) {
        if let Err(e) = self.api.device_wait_idle() {
            log::warn!("graphics_device::drop [{}]: wait idle failed: {:?}", self.info, e);
        }
        let pool = *self.shared_pool.get_mut().unwrap_or_else(PoisonError::into_inner);
        self.api.destroy_command_pool(pool);
        log::debug!("Graphics device released: {}", self.info);
    }
}
