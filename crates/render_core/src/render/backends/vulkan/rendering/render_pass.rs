//! Render pass and frame buffer management
//!
//! A [`RenderPass`] is created from one or more attachment sets. The first
//! set describes the attachments; every set becomes one frame buffer, so a
//! swapchain with three images passes three sets of the same shape.
//!
//! Frame buffers reference the render pass, so `release` destroys them
//! first.

use ash::vk;

use crate::foundation::Color;
use crate::render::backends::vulkan::initialization::context::{GpuError, GpuResult, GraphicsDevice};
use crate::render::backends::vulkan::rendering::commands::CommandBuffer;
use crate::render::backends::vulkan::resources::texture::aspect_mask;

/// Attachment description plus the reference a subpass uses for it
#[derive(Debug, Clone, Copy)]
pub struct AttachmentDesc {
    /// Format, load/store ops and layouts
    pub description: vk::AttachmentDescription,
    /// Index and layout used inside the subpass
    pub reference: vk::AttachmentReference,
}

impl AttachmentDesc {
    /// Cleared color attachment at index 0, ready for presentation
    pub fn color(format: vk::Format) -> Self {
        Self {
            description: vk::AttachmentDescription::builder()
                .format(format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                .build(),
            reference: vk::AttachmentReference {
                attachment: 0,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            },
        }
    }

    /// Cleared depth/stencil attachment at index 1
    pub fn depth(format: vk::Format) -> Self {
        Self {
            description: vk::AttachmentDescription::builder()
                .format(format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .build(),
            reference: vk::AttachmentReference {
                attachment: 1,
                layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            },
        }
    }

    /// Whether the reference layout marks a depth/stencil attachment
    pub fn is_depth_stencil(&self) -> bool {
        self.reference.layout == vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
    }
}

/// An image view bound into a frame buffer, with its extent
#[derive(Debug, Clone, Copy)]
pub struct ImageView {
    /// Native view
    pub view: vk::ImageView,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// How the view is used as an attachment
    pub attachment: AttachmentDesc,
}

impl ImageView {
    /// Describe a view
    pub fn new(view: vk::ImageView, width: u32, height: u32, attachment: AttachmentDesc) -> Self {
        Self {
            view,
            width,
            height,
            attachment,
        }
    }
}

/// Owned subpass description
#[derive(Debug, Clone)]
pub struct SubpassDescription {
    /// Pipeline bind point
    pub bind_point: vk::PipelineBindPoint,
    /// Input attachments
    pub input_attachments: Vec<vk::AttachmentReference>,
    /// Color attachments
    pub color_attachments: Vec<vk::AttachmentReference>,
    /// Resolve attachments, empty or one per color attachment
    pub resolve_attachments: Vec<vk::AttachmentReference>,
    /// Depth/stencil attachment
    pub depth_stencil: Option<vk::AttachmentReference>,
    /// Attachments preserved across this subpass
    pub preserve_attachments: Vec<u32>,
}

impl SubpassDescription {
    /// Empty graphics subpass
    pub fn graphics() -> Self {
        Self {
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            input_attachments: Vec::new(),
            color_attachments: Vec::new(),
            resolve_attachments: Vec::new(),
            depth_stencil: None,
            preserve_attachments: Vec::new(),
        }
    }

    /// Add a color attachment reference
    pub fn with_color(mut self, reference: vk::AttachmentReference) -> Self {
        self.color_attachments.push(reference);
        self
    }

    /// Add an input attachment reference
    pub fn with_input(mut self, reference: vk::AttachmentReference) -> Self {
        self.input_attachments.push(reference);
        self
    }

    /// Set the depth/stencil reference
    pub fn with_depth_stencil(mut self, reference: vk::AttachmentReference) -> Self {
        self.depth_stencil = Some(reference);
        self
    }

    /// Whether this subpass writes a depth/stencil attachment
    pub fn uses_depth_stencil(&self) -> bool {
        self.depth_stencil
            .map_or(false, |reference| reference.layout != vk::ImageLayout::UNDEFINED)
    }

    /// Native description pointing into `self`
    fn as_vk(&self) -> vk::SubpassDescription {
        let mut builder = vk::SubpassDescription::builder()
            .pipeline_bind_point(self.bind_point)
            .input_attachments(&self.input_attachments)
            .color_attachments(&self.color_attachments)
            .preserve_attachments(&self.preserve_attachments);
        if !self.resolve_attachments.is_empty() {
            builder = builder.resolve_attachments(&self.resolve_attachments);
        }
        if let Some(depth) = &self.depth_stencil {
            builder = builder.depth_stencil_attachment(depth);
        }
        builder.build()
    }
}

/// The two dependencies used when none are supplied: external work before
/// color output, and color output before external reads
pub fn default_dependencies() -> [vk::SubpassDependency; 2] {
    [
        vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::BOTTOM_OF_PIPE)
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::MEMORY_READ)
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .dependency_flags(vk::DependencyFlags::BY_REGION)
            .build(),
        vk::SubpassDependency::builder()
            .src_subpass(0)
            .dst_subpass(vk::SUBPASS_EXTERNAL)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_stage_mask(vk::PipelineStageFlags::BOTTOM_OF_PIPE)
            .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ)
            .dependency_flags(vk::DependencyFlags::BY_REGION)
            .build(),
    ]
}

/// Render pass wrapper with RAII cleanup, owning its frame buffers
pub struct RenderPass<'d> {
    device: Option<&'d GraphicsDevice>,
    render_pass: vk::RenderPass,
    frame_buffers: Vec<vk::Framebuffer>,
    offset: vk::Offset2D,
    size: vk::Extent2D,
    depth_stencil_enabled: bool,
    attachment_formats: Vec<vk::Format>,
}

impl<'d> RenderPass<'d> {
    /// Create a render pass and one frame buffer per attachment set
    ///
    /// Without `subpasses` a single graphics subpass is used: color
    /// attachment 0, plus depth attachment 1 when the sets have two or more
    /// attachments. Without `dependencies`, [`default_dependencies`] apply.
    ///
    /// Every view in a set must have the same width and height, and every
    /// set the same number of views as the first.
    pub fn load(
        device: &'d GraphicsDevice,
        offset: vk::Offset2D,
        size: vk::Extent2D,
        attachment_sets: &[Vec<ImageView>],
        subpasses: Option<&[SubpassDescription]>,
        dependencies: Option<&[vk::SubpassDependency]>,
    ) -> GpuResult<Self> {
        const TRACE: &str = "render_pass::load";

        let first = match attachment_sets.first() {
            Some(first) if !first.is_empty() => first,
            _ => return Err(device.report(TRACE, GpuError::invalid_argument("at least one attachment is required"))),
        };
        for (index, set) in attachment_sets.iter().enumerate() {
            if set.len() != first.len() {
                return Err(device.report(
                    TRACE,
                    GpuError::invalid_argument(format!(
                        "attachment set {} has {} views, the first set has {}",
                        index,
                        set.len(),
                        first.len()
                    )),
                ));
            }
            if set.iter().any(|view| view.width != set[0].width || view.height != set[0].height) {
                return Err(device.report(
                    TRACE,
                    GpuError::invalid_argument(format!("attachment set {} mixes image sizes", index)),
                ));
            }
        }

        let attachments: Vec<vk::AttachmentDescription> = first.iter().map(|view| view.attachment.description).collect();

        let default_subpass;
        let subpasses = match subpasses {
            Some(subpasses) if !subpasses.is_empty() => subpasses,
            Some(_) => return Err(device.report(TRACE, GpuError::invalid_argument("empty subpass list"))),
            None => {
                let mut subpass = SubpassDescription::graphics().with_color(vk::AttachmentReference {
                    attachment: 0,
                    layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                });
                if first.len() >= 2 {
                    subpass = subpass.with_depth_stencil(vk::AttachmentReference {
                        attachment: 1,
                        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                    });
                }
                default_subpass = [subpass];
                &default_subpass[..]
            }
        };
        let depth_stencil_enabled = subpasses.iter().any(SubpassDescription::uses_depth_stencil);
        let vk_subpasses: Vec<vk::SubpassDescription> = subpasses.iter().map(SubpassDescription::as_vk).collect();

        let default_deps = default_dependencies();
        let dependencies = dependencies.unwrap_or(&default_deps);

        let create_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&vk_subpasses)
            .dependencies(dependencies);
        let render_pass = device
            .api()
            .create_render_pass(&create_info)
            .map_err(|e| device.report(TRACE, GpuError::Api(e)))?;

        let mut pass = Self {
            device: Some(device),
            render_pass,
            frame_buffers: Vec::with_capacity(attachment_sets.len()),
            offset,
            size,
            depth_stencil_enabled,
            attachment_formats: attachments.iter().map(|attachment| attachment.format).collect(),
        };

        for set in attachment_sets {
            let views: Vec<vk::ImageView> = set.iter().map(|view| view.view).collect();
            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass)
                .attachments(&views)
                .width(set[0].width)
                .height(set[0].height)
                .layers(1);
            match device.api().create_framebuffer(&framebuffer_info) {
                Ok(framebuffer) => pass.frame_buffers.push(framebuffer),
                Err(e) => {
                    pass.release();
                    return Err(device.report(TRACE, GpuError::Api(e)));
                }
            }
        }

        log::debug!(
            "Render pass created: {} attachments, {} subpasses, {} frame buffers, depth/stencil: {}",
            attachments.len(),
            subpasses.len(),
            pass.frame_buffers.len(),
            depth_stencil_enabled
        );
        Ok(pass)
    }

    fn device(&self, trace: &str) -> GpuResult<&'d GraphicsDevice> {
        self.device.ok_or_else(|| {
            log::warn!("{}: render pass already released", trace);
            GpuError::invalid_state("render pass already released")
        })
    }

    /// Begin the render pass on frame buffer `index`
    ///
    /// One clear value is supplied per attachment, in attachment order:
    /// depth/stencil formats get the depth/stencil pair, every other
    /// attachment gets the color.
    pub fn begin(
        &self,
        frame_buffer_index: usize,
        command_buffer: &CommandBuffer,
        clear_color: Color,
        clear_depth: f32,
        clear_stencil: u32,
        contents: vk::SubpassContents,
    ) -> GpuResult<()> {
        const TRACE: &str = "render_pass::begin";
        let device = self.device(TRACE)?;

        let Some(&framebuffer) = self.frame_buffers.get(frame_buffer_index) else {
            return Err(device.report(
                TRACE,
                GpuError::invalid_argument(format!(
                    "frame buffer index {} out of range ({} frame buffers)",
                    frame_buffer_index,
                    self.frame_buffers.len()
                )),
            ));
        };
        if !command_buffer.is_recording() {
            return Err(device.report(TRACE, GpuError::invalid_state("command buffer is not recording")));
        }

        let color = vk::ClearValue {
            color: vk::ClearColorValue {
                float32: clear_color.to_normalized(),
            },
        };
        let depth_stencil = vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: clear_depth,
                stencil: clear_stencil,
            },
        };
        let clear_values: Vec<vk::ClearValue> = self
            .attachment_formats
            .iter()
            .map(|&format| {
                if aspect_mask(format).contains(vk::ImageAspectFlags::COLOR) {
                    color
                } else {
                    depth_stencil
                }
            })
            .collect();
        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass)
            .framebuffer(framebuffer)
            .render_area(self.render_area())
            .clear_values(&clear_values);

        device
            .api()
            .cmd_begin_render_pass(command_buffer.handle(), &begin_info, contents);
        Ok(())
    }

    /// End the render pass
    pub fn end(&self, command_buffer: &CommandBuffer) -> GpuResult<()> {
        const TRACE: &str = "render_pass::end";
        let device = self.device(TRACE)?;
        if !command_buffer.is_recording() {
            return Err(device.report(TRACE, GpuError::invalid_state("command buffer is not recording")));
        }
        device.api().cmd_end_render_pass(command_buffer.handle());
        Ok(())
    }

    /// Render area offset
    pub fn offset(&self) -> vk::Offset2D {
        self.offset
    }

    /// Render area size
    pub fn size(&self) -> vk::Extent2D {
        self.size
    }

    /// Render area
    pub fn render_area(&self) -> vk::Rect2D {
        vk::Rect2D {
            offset: self.offset,
            extent: self.size,
        }
    }

    /// Get the render pass handle
    pub fn handle(&self) -> vk::RenderPass {
        self.render_pass
    }

    /// Frame buffer at `index`
    pub fn frame_buffer(&self, index: usize) -> Option<vk::Framebuffer> {
        self.frame_buffers.get(index).copied()
    }

    /// Number of frame buffers
    pub fn frame_buffer_count(&self) -> usize {
        self.frame_buffers.len()
    }

    /// Whether any subpass writes depth/stencil
    pub fn depth_stencil_enabled(&self) -> bool {
        self.depth_stencil_enabled
    }

    /// Destroy frame buffers, then the render pass
    ///
    /// Returns `false` when already released.
    pub fn release(&mut self) -> bool {
        let Some(device) = self.device.take() else {
            return false;
        };
        let api = device.api();
        for framebuffer in self.frame_buffers.drain(..) {
            api.destroy_framebuffer(framebuffer);
        }
        api.destroy_render_pass(self.render_pass);
        self.render_pass = vk::RenderPass::null();
        true
    }
}

impl Drop for RenderPass<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
