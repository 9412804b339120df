//! Indirect draw command buffers
//!
//! Draw parameters are edited on the host in [`IndirectDrawCommands::commands_mut`]
//! and written to a host-visible `INDIRECT_BUFFER` with
//! [`IndirectDrawCommands::upload`] before recording the draw.

use ash::vk;

use super::buffer::Buffer;
use super::memory_allocator::MemoryUsage;
use crate::render::backends::vulkan::initialization::context::{GpuError, GpuResult, GraphicsDevice};

/// Byte stride between consecutive commands in the buffer
pub const INDIRECT_COMMAND_STRIDE: u32 = std::mem::size_of::<vk::DrawIndexedIndirectCommand>() as u32;

/// Indexed indirect draw commands mirrored in a device buffer
pub struct IndirectDrawCommands<'d> {
    commands: Vec<vk::DrawIndexedIndirectCommand>,
    buffer: Buffer<'d>,
}

impl<'d> IndirectDrawCommands<'d> {
    /// Allocate room for `draw_count` zeroed commands
    pub fn load(device: &'d GraphicsDevice, draw_count: usize) -> GpuResult<Self> {
        if draw_count == 0 {
            return Err(device.report(
                "indirect_draw::load",
                GpuError::invalid_argument("at least one indirect draw is required"),
            ));
        }
        let size = (draw_count * INDIRECT_COMMAND_STRIDE as usize) as vk::DeviceSize;
        let mut buffer = Buffer::allocate(
            device,
            size,
            vk::BufferUsageFlags::INDIRECT_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryUsage::CpuToGpu,
            device.has_memory_pool(),
        )?;
        buffer.bind()?;

        Ok(Self {
            commands: vec![vk::DrawIndexedIndirectCommand::default(); draw_count],
            buffer,
        })
    }

    /// CPU copy of the commands, in upload order
    pub fn commands(&self) -> &[vk::DrawIndexedIndirectCommand] {
        &self.commands
    }

    /// Edit the host copy; call [`IndirectDrawCommands::upload`] afterwards
    pub fn commands_mut(&mut self) -> &mut [vk::DrawIndexedIndirectCommand] {
        &mut self.commands
    }

    /// Number of draws
    pub fn draw_count(&self) -> u32 {
        self.commands.len() as u32
    }

    /// Write the host copy to the device buffer
    pub fn upload(&self) -> GpuResult<()> {
        let words: Vec<u32> = self
            .commands
            .iter()
            .flat_map(|command| {
                [
                    command.index_count,
                    command.instance_count,
                    command.first_index,
                    command.vertex_offset as u32,
                    command.first_instance,
                ]
            })
            .collect();
        self.buffer.set_data(&words)
    }

    /// Indirect buffer holding the commands
    pub fn buffer(&self) -> &Buffer<'d> {
        &self.buffer
    }

    /// Native indirect buffer
    pub fn handle(&self) -> vk::Buffer {
        self.buffer.handle()
    }

    /// Release the indirect buffer; `false` if already released
    pub fn release(&mut self) -> bool {
        self.buffer.release()
    }
}
