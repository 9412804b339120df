//! Command buffer management
//!
//! [`CommandBuffers`] owns a set of command buffers of one level and tracks
//! each buffer through `Idle -> Recording -> Recorded -> Submitted`. The
//! transitions are enforced here, not left to validation layers:
//!
//! - `begin` is refused while a buffer is already recording
//! - `end` needs a recording buffer
//! - `flush` needs a finished recording and blocks on a fence until the GPU
//!   is done, after which the buffer is idle again
//!
//! Buffers come from the device's shared pool by default. Pass `create_pool`
//! to get a dedicated pool, which is what worker threads recording secondary
//! buffers in parallel need: command pools are externally synchronized.

use ash::vk;
use std::cell::Cell;

use crate::render::backends::vulkan::initialization::context::{GpuError, GpuResult, GraphicsDevice, Queue};
use crate::render::backends::vulkan::state::sync::Fence;

/// Recording state of one command buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandBufferState {
    /// Allocated or completed; ready to begin
    Idle,
    /// Between begin and end
    Recording,
    /// Ended, ready for submission
    Recorded,
    /// Handed to a queue
    Submitted,
}

/// One command buffer and its recording state
#[derive(Debug)]
pub struct CommandBuffer {
    handle: vk::CommandBuffer,
    level: vk::CommandBufferLevel,
    state: Cell<CommandBufferState>,
}

impl CommandBuffer {
    fn new(handle: vk::CommandBuffer, level: vk::CommandBufferLevel) -> Self {
        Self {
            handle,
            level,
            state: Cell::new(CommandBufferState::Idle),
        }
    }

    /// Native handle
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    /// Primary or secondary
    pub fn level(&self) -> vk::CommandBufferLevel {
        self.level
    }

    /// Current recording state
    pub fn state(&self) -> CommandBufferState {
        self.state.get()
    }

    /// Whether commands may be recorded right now
    pub fn is_recording(&self) -> bool {
        self.state.get() == CommandBufferState::Recording
    }

    pub(crate) fn set_state(&self, state: CommandBufferState) {
        self.state.set(state);
    }
}

/// A set of command buffers of one level
pub struct CommandBuffers<'d> {
    device: Option<&'d GraphicsDevice>,
    commands: Vec<CommandBuffer>,
    level: vk::CommandBufferLevel,
    queue: Queue,
    pool: vk::CommandPool,
    owns_pool: bool,
    abandoned: Cell<bool>,
}

impl<'d> CommandBuffers<'d> {
    /// Allocate `count` command buffers
    ///
    /// Without `create_pool` they come from the device's shared graphics
    /// pool and `pool_queue` must be `None`. With `create_pool` a dedicated
    /// pool is created for `pool_queue`, or for the graphics queue when none
    /// is given; submissions go to that queue.
    pub fn load(
        device: &'d GraphicsDevice,
        count: u32,
        level: vk::CommandBufferLevel,
        create_pool: bool,
        pool_queue: Option<&Queue>,
    ) -> GpuResult<Self> {
        const TRACE: &str = "command_buffers::load";

        if count == 0 {
            return Err(device.report(TRACE, GpuError::invalid_argument("command buffer count must be non-zero")));
        }
        if !create_pool && pool_queue.is_some() {
            return Err(device.report(
                TRACE,
                GpuError::invalid_argument("a queue can only be chosen together with a dedicated pool"),
            ));
        }

        let api = device.api();
        let (queue, pool, handles) = if create_pool {
            let queue = *pool_queue.unwrap_or_else(|| device.graphics_queue());
            let pool = api
                .create_command_pool(queue.family_index, vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                .map_err(|e| device.report(TRACE, GpuError::Api(e)))?;
            match api.allocate_command_buffers(pool, level, count) {
                Ok(handles) => (queue, pool, handles),
                Err(e) => {
                    api.destroy_command_pool(pool);
                    return Err(device.report(TRACE, GpuError::Api(e)));
                }
            }
        } else {
            let (pool, handles) = device.with_shared_pool(|pool| (pool, api.allocate_command_buffers(pool, level, count)));
            let handles = handles.map_err(|e| device.report(TRACE, GpuError::Api(e)))?;
            (*device.graphics_queue(), pool, handles)
        };

        log::trace!("Allocated {} {:?} command buffers (dedicated pool: {})", count, level, create_pool);

        Ok(Self {
            device: Some(device),
            commands: handles.into_iter().map(|handle| CommandBuffer::new(handle, level)).collect(),
            level,
            queue,
            pool,
            owns_pool: create_pool,
            abandoned: Cell::new(false),
        })
    }

    fn device(&self, trace: &str) -> GpuResult<&'d GraphicsDevice> {
        self.device.ok_or_else(|| {
            log::warn!("{}: command buffers already released", trace);
            GpuError::invalid_state("command buffers already released")
        })
    }

    fn checked(&self, trace: &str, index: usize) -> GpuResult<(&'d GraphicsDevice, &CommandBuffer)> {
        let device = self.device(trace)?;
        if self.abandoned.get() {
            return Err(device.report(
                trace,
                GpuError::invalid_state("command buffers were left in flight after a failed wait"),
            ));
        }
        let command = self.commands.get(index).ok_or_else(|| {
            device.report(
                trace,
                GpuError::invalid_argument(format!(
                    "command buffer index {} out of range ({} buffers)",
                    index,
                    self.commands.len()
                )),
            )
        })?;
        Ok((device, command))
    }

    /// Start recording buffer `index`
    ///
    /// Secondary buffers begun this way inherit no render pass.
    pub fn begin(&self, index: usize, flags: vk::CommandBufferUsageFlags) -> GpuResult<()> {
        let inheritance = vk::CommandBufferInheritanceInfo::builder().build();
        self.begin_with(
            "command_buffers::begin",
            index,
            flags,
            (self.level == vk::CommandBufferLevel::SECONDARY).then_some(&inheritance),
        )
    }

    /// Start recording secondary buffer `index` inside a render pass
    ///
    /// `RENDER_PASS_CONTINUE` is always added to `flags`.
    pub fn begin_secondary(
        &self,
        index: usize,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> GpuResult<()> {
        const TRACE: &str = "command_buffers::begin_secondary";
        if self.level != vk::CommandBufferLevel::SECONDARY {
            let device = self.device(TRACE)?;
            return Err(device.report(TRACE, GpuError::invalid_argument("buffers are not secondary")));
        }
        let inheritance = vk::CommandBufferInheritanceInfo::builder()
            .render_pass(render_pass)
            .subpass(0)
            .framebuffer(framebuffer)
            .build();
        self.begin_with(
            TRACE,
            index,
            flags | vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE,
            Some(&inheritance),
        )
    }

    fn begin_with(
        &self,
        trace: &str,
        index: usize,
        flags: vk::CommandBufferUsageFlags,
        inheritance: Option<&vk::CommandBufferInheritanceInfo>,
    ) -> GpuResult<()> {
        let (device, command) = self.checked(trace, index)?;
        if command.state() == CommandBufferState::Recording {
            return Err(device.report(
                trace,
                GpuError::invalid_state(format!("command buffer {} is already recording", index)),
            ));
        }

        let mut begin_info = vk::CommandBufferBeginInfo::builder().flags(flags);
        if let Some(inheritance) = inheritance {
            begin_info = begin_info.inheritance_info(inheritance);
        }
        device
            .api()
            .begin_command_buffer(command.handle(), &begin_info)
            .map_err(|e| device.report(trace, GpuError::Api(e)))?;

        command.set_state(CommandBufferState::Recording);
        Ok(())
    }

    /// Finish recording buffer `index`
    pub fn end(&self, index: usize) -> GpuResult<()> {
        const TRACE: &str = "command_buffers::end";
        let (device, command) = self.checked(TRACE, index)?;
        if command.state() != CommandBufferState::Recording {
            return Err(device.report(
                TRACE,
                GpuError::invalid_state(format!("command buffer {} was not begun", index)),
            ));
        }

        device
            .api()
            .end_command_buffer(command.handle())
            .map_err(|e| device.report(TRACE, GpuError::Api(e)))?;

        command.set_state(CommandBufferState::Recorded);
        Ok(())
    }

    /// Submit buffer `index` and block until the GPU finishes it
    pub fn flush(&self, index: usize) -> GpuResult<()> {
        const TRACE: &str = "command_buffers::flush";
        let (device, command) = self.checked(TRACE, index)?;
        if command.state() != CommandBufferState::Recorded {
            return Err(device.report(
                TRACE,
                GpuError::invalid_state(format!("command buffer {} is {:?}, expected Recorded", index, command.state())),
            ));
        }
        self.submit_and_wait(device, &[command])
    }

    /// Submit every buffer as one batch and block until the GPU finishes
    pub fn flush_all(&self) -> GpuResult<()> {
        const TRACE: &str = "command_buffers::flush_all";
        let device = self.device(TRACE)?;
        if let Some(index) = self
            .commands
            .iter()
            .position(|command| command.state() != CommandBufferState::Recorded)
        {
            return Err(device.report(
                TRACE,
                GpuError::invalid_state(format!(
                    "command buffer {} is {:?}, expected Recorded",
                    index,
                    self.commands[index].state()
                )),
            ));
        }
        let commands: Vec<&CommandBuffer> = self.commands.iter().collect();
        self.submit_and_wait(device, &commands)
    }

    fn submit_and_wait(&self, device: &GraphicsDevice, commands: &[&CommandBuffer]) -> GpuResult<()> {
        let fence = Fence::new(device, false)?;
        device.submit(commands, &self.queue, &[], &[], &[], Some(&fence), false)?;
        if let Err(error) = fence.wait_timeout(device.config().fence_timeout_ns) {
            // The submission may still be executing; nothing it uses can be
            // freed until the device is idle.
            if device.wait_idle().is_err() {
                log::warn!(
                    "command_buffers::flush: device never went idle, leaking a fence and {} command buffer(s)",
                    commands.len()
                );
                fence.abandon();
                self.abandoned.set(true);
                return Err(error);
            }
            for command in commands {
                command.set_state(CommandBufferState::Idle);
            }
            return Err(error);
        }
        for command in commands {
            command.set_state(CommandBufferState::Idle);
        }
        Ok(())
    }

    /// Record execution of `secondaries` into primary buffer `index`
    ///
    /// The primary buffer must be recording and every secondary buffer must
    /// have finished its recording.
    pub fn execute_secondary_commands(&self, index: usize, secondaries: &[&CommandBuffer]) -> GpuResult<()> {
        const TRACE: &str = "command_buffers::execute_secondary_commands";
        let (device, command) = self.checked(TRACE, index)?;

        if self.level != vk::CommandBufferLevel::PRIMARY {
            return Err(device.report(TRACE, GpuError::invalid_argument("target buffers are not primary")));
        }
        if !command.is_recording() {
            return Err(device.report(
                TRACE,
                GpuError::invalid_state(format!("command buffer {} is not recording", index)),
            ));
        }
        if secondaries.is_empty() {
            return Err(device.report(TRACE, GpuError::invalid_argument("no secondary command buffers")));
        }
        if let Some(bad) = secondaries.iter().find(|secondary| secondary.level() != vk::CommandBufferLevel::SECONDARY) {
            return Err(device.report(
                TRACE,
                GpuError::invalid_argument(format!("{:?} is not a secondary command buffer", bad.handle())),
            ));
        }
        if let Some(bad) = secondaries.iter().find(|secondary| secondary.state() != CommandBufferState::Recorded) {
            return Err(device.report(
                TRACE,
                GpuError::invalid_state(format!("secondary {:?} is {:?}, expected Recorded", bad.handle(), bad.state())),
            ));
        }

        let handles: Vec<vk::CommandBuffer> = secondaries.iter().map(|secondary| secondary.handle()).collect();
        device.api().cmd_execute_commands(command.handle(), &handles);
        Ok(())
    }

    /// Buffer at `index`
    pub fn command_at(&self, index: usize) -> Option<&CommandBuffer> {
        self.commands.get(index)
    }

    /// All buffers in order
    pub fn commands(&self) -> &[CommandBuffer] {
        &self.commands
    }

    /// Number of buffers; zero after release
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether there are no buffers
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Level of every buffer in the set
    pub fn level(&self) -> vk::CommandBufferLevel {
        self.level
    }

    /// Queue submissions go to
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Whether a flush left these buffers with the GPU after a failed wait
    ///
    /// Abandoned buffers refuse further use and are never freed.
    pub fn is_abandoned(&self) -> bool {
        self.abandoned.get()
    }

    /// Free the buffers, and the pool if it is owned
    ///
    /// Returns `false` when already released.
    pub fn release(&mut self) -> bool {
        let Some(device) = self.device.take() else {
            return false;
        };

        let handles: Vec<vk::CommandBuffer> = self.commands.drain(..).map(|command| command.handle()).collect();
        if self.abandoned.get() {
            log::warn!("command_buffers::release: {} command buffer(s) still in flight, not freed", handles.len());
            self.pool = vk::CommandPool::null();
            return true;
        }
        let api = device.api();
        if self.owns_pool {
            api.destroy_command_pool(self.pool);
        } else if !handles.is_empty() {
            device.with_shared_pool(|pool| api.free_command_buffers(pool, &handles));
        }
        self.pool = vk::CommandPool::null();
        true
    }
}

impl Drop for CommandBuffers<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
