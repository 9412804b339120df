//! Vulkan synchronization primitives for GPU/CPU coordination
//!
//! RAII wrappers for semaphores and fences. Both release their native
//! object on `release()` or on drop, whichever comes first.
//!
//! ## GPU-GPU Synchronization (Semaphores)
//!
//! ```text
//! Queue A: [Work] -> Signal Semaphore ->
//! Queue B:          Wait Semaphore -> [Work]
//! ```
//!
//! Semaphores have no host-visible state; they are only handed to
//! [`GraphicsDevice::submit`] as wait or signal lists.
//!
//! ## CPU-GPU Synchronization (Fences)
//!
//! ```text
//! CPU: Submit work with fence
//! GPU: [Processing work...]
//! CPU: Wait on fence (blocks until GPU completes or the timeout elapses)
//! ```
//!
//! A fence is tracked through `Unsignaled -> Pending -> Signaled`, and must
//! be reset before it is submitted again. Waiting on a fence that is
//! unsignaled and was never submitted fails immediately instead of blocking
//! until the timeout.

use ash::vk;
use std::cell::Cell;

use crate::render::backends::vulkan::initialization::context::{GpuError, GpuResult, GraphicsDevice};

/// Binary semaphore wrapper with RAII cleanup
pub struct Semaphore<'d> {
    device: Option<&'d GraphicsDevice>,
    semaphore: vk::Semaphore,
}

impl<'d> Semaphore<'d> {
    /// Create a new semaphore
    pub fn new(device: &'d GraphicsDevice) -> GpuResult<Self> {
        let semaphore = device
            .api()
            .create_semaphore()
            .map_err(|e| device.report("semaphore::new", GpuError::Api(e)))?;

        Ok(Self {
            device: Some(device),
            semaphore,
        })
    }

    /// Get semaphore handle
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Destroy the semaphore; `false` if already released
    pub fn release(&mut self) -> bool {
        match self.device.take() {
            Some(device) => {
                device.api().destroy_semaphore(self.semaphore);
                self.semaphore = vk::Semaphore::null();
                true
            }
            None => false,
        }
    }
}

impl Drop for Semaphore<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Host-side view of a fence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FenceState {
    /// Reset and not submitted
    Unsignaled,
    /// Submitted; the GPU will signal it
    Pending,
    /// Known to be signaled
    Signaled,
}

/// Fence wrapper with RAII cleanup
pub struct Fence<'d> {
    device: Option<&'d GraphicsDevice>,
    fence: vk::Fence,
    state: Cell<FenceState>,
}

impl<'d> Fence<'d> {
    /// Create a new fence, optionally already signaled
    pub fn new(device: &'d GraphicsDevice, signaled: bool) -> GpuResult<Self> {
        let fence = device
            .api()
            .create_fence(signaled)
            .map_err(|e| device.report("fence::new", GpuError::Api(e)))?;

        Ok(Self {
            device: Some(device),
            fence,
            state: Cell::new(if signaled { FenceState::Signaled } else { FenceState::Unsignaled }),
        })
    }

    /// Get fence handle
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Last known state
    pub fn state(&self) -> FenceState {
        self.state.get()
    }

    pub(crate) fn mark_pending(&self) {
        self.state.set(FenceState::Pending);
    }

    fn device(&self, trace: &str) -> GpuResult<&'d GraphicsDevice> {
        self.device.ok_or_else(|| {
            log::warn!("{}: fence already released", trace);
            GpuError::invalid_state("fence already released")
        })
    }

    /// Wait using the device's configured timeout
    pub fn wait(&self) -> GpuResult<()> {
        let device = self.device("fence::wait")?;
        self.wait_timeout(device.config().fence_timeout_ns)
    }

    /// Wait for the fence to signal
    ///
    /// A timeout is reported as [`GpuError::FenceTimeout`].
    pub fn wait_timeout(&self, timeout_ns: u64) -> GpuResult<()> {
        const TRACE: &str = "fence::wait";
        let device = self.device(TRACE)?;

        match self.state.get() {
            FenceState::Signaled => return Ok(()),
            FenceState::Unsignaled => {
                return Err(device.report(
                    TRACE,
                    GpuError::invalid_state("waiting on a fence that was never submitted"),
                ));
            }
            FenceState::Pending => {}
        }

        match device.api().wait_for_fences(&[self.fence], true, timeout_ns) {
            Ok(()) => {
                self.state.set(FenceState::Signaled);
                Ok(())
            }
            Err(vk::Result::TIMEOUT) => Err(device.report(TRACE, GpuError::FenceTimeout { timeout_ns })),
            Err(e) => Err(device.report(TRACE, GpuError::Api(e))),
        }
    }

    /// Reset fence to unsignaled state
    pub fn reset(&self) -> GpuResult<()> {
        let device = self.device("fence::reset")?;
        device
            .api()
            .reset_fences(&[self.fence])
            .map_err(|e| device.report("fence::reset", GpuError::Api(e)))?;
        self.state.set(FenceState::Unsignaled);
        Ok(())
    }

    /// Poll whether the fence is signaled, without blocking
    pub fn status(&self) -> GpuResult<bool> {
        let device = self.device("fence::status")?;
        let signaled = device
            .api()
            .fence_status(self.fence)
            .map_err(|e| device.report("fence::status", GpuError::Api(e)))?;
        if signaled {
            self.state.set(FenceState::Signaled);
        }
        Ok(signaled)
    }

    /// Give up the fence without destroying it
    ///
    /// For a fence the GPU may still signal, when waiting for the device has
    /// failed too.
    pub(crate) fn abandon(mut self) {
        if self.device.take().is_some() {
            log::warn!("fence {:?} abandoned while pending", self.fence);
        }
    }

    /// Destroy the fence; `false` if already released
    pub fn release(&mut self) -> bool {
        match self.device.take() {
            Some(device) => {
                device.api().destroy_fence(self.fence);
                self.fence = vk::Fence::null();
                true
            }
            None => false,
        }
    }
}

impl Drop for Fence<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
