//! Offscreen render targets
//!
//! A [`RenderTarget`] creates its own attachment textures and a render pass
//! over them. Every attachment ends in `SHADER_READ_ONLY_OPTIMAL`, so the
//! result can be sampled by a later pass.
//!
//! Textures are stored flat: attachment `j` of frame buffer `i` is at
//! `i * attachments_per_buffer + j`.

use ash::vk;

use super::commands::{CommandBuffer, CommandBuffers};
use super::render_pass::{AttachmentDesc, ImageView, RenderPass, SubpassDescription};
use crate::foundation::Color;
use crate::render::backends::vulkan::initialization::context::{GpuError, GpuResult, GraphicsDevice};
use crate::render::backends::vulkan::resources::memory_allocator::MemoryUsage;
use crate::render::backends::vulkan::resources::texture::Texture;

/// Render pass plus the textures it renders into
pub struct RenderTarget<'d> {
    device: Option<&'d GraphicsDevice>,
    render_pass: RenderPass<'d>,
    textures: Vec<Texture<'d>>,
    attachments_per_buffer: usize,
}

impl<'d> RenderTarget<'d> {
    /// Create `count` frame buffers, each with one texture per attachment
    ///
    /// Attachments are classified by their reference layout: color
    /// attachments get `COLOR_ATTACHMENT | SAMPLED`, depth/stencil ones
    /// `DEPTH_STENCIL_ATTACHMENT | SAMPLED`.
    pub fn load(
        device: &'d GraphicsDevice,
        offset: vk::Offset2D,
        size: vk::Extent2D,
        attachments: &[AttachmentDesc],
        count: usize,
    ) -> GpuResult<Self> {
        const TRACE: &str = "render_target::load";

        if attachments.is_empty() || count == 0 {
            return Err(device.report(
                TRACE,
                GpuError::invalid_argument("a render target needs at least one attachment and one frame buffer"),
            ));
        }

        let mut descs = Vec::with_capacity(attachments.len());
        let mut subpass = SubpassDescription::graphics();
        for (index, attachment) in attachments.iter().enumerate() {
            let mut desc = *attachment;
            desc.description.final_layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
            desc.reference.attachment = index as u32;
            match desc.reference.layout {
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => subpass.color_attachments.push(desc.reference),
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL if subpass.depth_stencil.is_none() => {
                    subpass.depth_stencil = Some(desc.reference)
                }
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => {
                    return Err(device.report(TRACE, GpuError::invalid_argument("more than one depth/stencil attachment")));
                }
                other => {
                    return Err(device.report(
                        TRACE,
                        GpuError::invalid_argument(format!("attachment {} has unsupported layout {:?}", index, other)),
                    ));
                }
            }
            descs.push(desc);
        }

        let mut textures = Vec::with_capacity(count * descs.len());
        let mut sets = Vec::with_capacity(count);
        for _ in 0..count {
            let mut set = Vec::with_capacity(descs.len());
            for desc in &descs {
                let usage = if desc.is_depth_stencil() {
                    vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
                } else {
                    vk::ImageUsageFlags::COLOR_ATTACHMENT
                };
                let mut texture = Texture::new(device, size.width, size.height, MemoryUsage::GpuOnly);
                texture.set_format(desc.description.format);
                texture.set_usage_flags(usage | vk::ImageUsageFlags::SAMPLED);
                // a failure drops `textures`, which releases everything created so far
                texture.load()?;
                set.push(ImageView::new(texture.image_view(), size.width, size.height, *desc));
                textures.push(texture);
            }
            sets.push(set);
        }

        let render_pass = RenderPass::load(device, offset, size, &sets, Some(std::slice::from_ref(&subpass)), None)?;

        log::debug!(
            "Render target created: {}x{}, {} attachments x {} frame buffers",
            size.width,
            size.height,
            descs.len(),
            count
        );
        Ok(Self {
            device: Some(device),
            render_pass,
            textures,
            attachments_per_buffer: descs.len(),
        })
    }

    /// Record every command buffer of `commands` with this target's render pass
    ///
    /// `commands` must hold exactly one primary buffer per frame buffer. For
    /// each index the buffer is begun, the render pass begun, `draw` invoked,
    /// and both ended again. The result of the last `draw` call is returned;
    /// a failure to begin or end aborts at once.
    pub fn record_command_buffer<F>(
        &self,
        commands: &CommandBuffers<'_>,
        mut draw: F,
        clear_color: Color,
        clear_depth: f32,
        clear_stencil: u32,
    ) -> GpuResult<()>
    where
        F: FnMut(&CommandBuffer, usize) -> GpuResult<()>,
    {
        const TRACE: &str = "render_target::record_command_buffer";
        let device = self.device.ok_or_else(|| {
            log::warn!("{}: render target already released", TRACE);
            GpuError::invalid_state("render target already released")
        })?;

        if commands.len() != self.render_pass.frame_buffer_count() {
            return Err(device.report(
                TRACE,
                GpuError::invalid_argument(format!(
                    "{} command buffers for {} frame buffers",
                    commands.len(),
                    self.render_pass.frame_buffer_count()
                )),
            ));
        }
        if commands.level() != vk::CommandBufferLevel::PRIMARY {
            return Err(device.report(TRACE, GpuError::invalid_argument("render targets record primary buffers")));
        }

        let mut outcome = Ok(());
        for (index, command) in commands.commands().iter().enumerate() {
            commands.begin(index, vk::CommandBufferUsageFlags::empty())?;
            self.render_pass.begin(
                index,
                command,
                clear_color,
                clear_depth,
                clear_stencil,
                vk::SubpassContents::INLINE,
            )?;
            outcome = draw(command, index);
            self.render_pass.end(command)?;
            commands.end(index)?;
        }
        outcome
    }

    /// Render pass owning the frame buffers
    pub fn render_pass(&self) -> &RenderPass<'d> {
        &self.render_pass
    }

    /// Render area offset
    pub fn offset(&self) -> vk::Offset2D {
        self.render_pass.offset()
    }

    /// Render area extent
    pub fn size(&self) -> vk::Extent2D {
        self.render_pass.size()
    }

    /// Number of frame buffers, one per attachment set
    pub fn frame_buffer_count(&self) -> usize {
        self.render_pass.frame_buffer_count()
    }

    /// Attachments in each frame buffer
    pub fn attachments_per_buffer(&self) -> usize {
        self.attachments_per_buffer
    }

    /// Texture at flat attachment index `index`
    pub fn texture(&self, index: usize) -> Option<&Texture<'d>> {
        self.textures.get(index)
    }

    /// View of owned attachment `index`
    pub fn image_view(&self, index: usize) -> Option<vk::ImageView> {
        self.texture(index).map(Texture::image_view)
    }

    /// Sampler of owned attachment `index`
    pub fn sampler(&self, index: usize) -> Option<vk::Sampler> {
        self.texture(index).map(Texture::sampler)
    }

    /// Format of owned attachment `index`
    pub fn attachment_format(&self, index: usize) -> Option<vk::Format> {
        self.texture(index).map(Texture::format)
    }

    /// Image type of owned attachment `index`
    pub fn image_type(&self, index: usize) -> Option<vk::ImageType> {
        self.texture(index).map(Texture::image_type)
    }

    /// View type of owned attachment `index`
    pub fn image_view_type(&self, index: usize) -> Option<vk::ImageViewType> {
        self.texture(index).map(Texture::view_type)
    }

    /// Binding info for sampling attachment `index`
    pub fn attachment_descriptor_info(&self, index: usize) -> Option<vk::DescriptorImageInfo> {
        self.texture(index).map(Texture::descriptor_info)
    }

    /// Destroy the render pass, then the textures; `false` if already released
    pub fn release(&mut self) -> bool {
        if self.device.take().is_none() {
            return false;
        }
        self.render_pass.release();
        for texture in &mut self.textures {
            texture.release();
        }
        self.textures.clear();
        true
    }
}

impl Drop for RenderTarget<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
