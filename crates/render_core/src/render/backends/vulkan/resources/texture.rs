//! Vulkan texture management
//!
//! Minimal image + view + sampler bundle used for render target attachments.
//! Configure with the `set_*` methods, then call [`Texture::load`].

use ash::vk;

use super::memory_allocator::{Allocation, MemoryUsage};
use crate::render::backends::vulkan::initialization::context::{GpuError, GpuResult, GraphicsDevice};

/// Image with dedicated memory, a view and a sampler
pub struct Texture<'d> {
    device: Option<&'d GraphicsDevice>,
    width: u32,
    height: u32,
    memory_usage: MemoryUsage,
    format: vk::Format,
    usage_flags: vk::ImageUsageFlags,
    image_type: vk::ImageType,
    view_type: vk::ImageViewType,
    image: vk::Image,
    allocation: Option<Allocation>,
    image_view: vk::ImageView,
    sampler: vk::Sampler,
}

impl<'d> Texture<'d> {
    /// Describe a 2D RGBA8 texture; nothing is created until [`Texture::load`]
    pub fn new(device: &'d GraphicsDevice, width: u32, height: u32, memory_usage: MemoryUsage) -> Self {
        Self {
            device: Some(device),
            width,
            height,
            memory_usage,
            format: vk::Format::R8G8B8A8_UNORM,
            usage_flags: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            image_type: vk::ImageType::TYPE_2D,
            view_type: vk::ImageViewType::TYPE_2D,
            image: vk::Image::null(),
            allocation: None,
            image_view: vk::ImageView::null(),
            sampler: vk::Sampler::null(),
        }
    }

    /// Override the image format
    pub fn set_format(&mut self, format: vk::Format) {
        self.format = format;
    }

    /// Override the image usage flags
    pub fn set_usage_flags(&mut self, usage_flags: vk::ImageUsageFlags) {
        self.usage_flags = usage_flags;
    }

    /// Image and view dimensionality
    pub fn set_kind(&mut self, image_type: vk::ImageType, view_type: vk::ImageViewType) {
        self.image_type = image_type;
        self.view_type = view_type;
    }

    /// Create the image, its memory, the view and the sampler
    ///
    /// On failure everything created so far is released again.
    pub fn load(&mut self) -> GpuResult<()> {
        const TRACE: &str = "texture::load";
        let Some(device) = self.device else {
            log::warn!("{}: texture already released", TRACE);
            return Err(GpuError::invalid_state("texture already released"));
        };
        if self.image != vk::Image::null() {
            return Err(device.report(TRACE, GpuError::invalid_state("texture already loaded")));
        }
        if self.width == 0 || self.height == 0 {
            return Err(device.report(
                TRACE,
                GpuError::invalid_argument(format!("invalid texture extent {}x{}", self.width, self.height)),
            ));
        }

        if let Err(e) = self.create_objects(device) {
            self.destroy_objects(device);
            return Err(device.report(TRACE, e));
        }

        log::debug!(
            "Texture loaded: {}x{} {:?} usage {:?}",
            self.width,
            self.height,
            self.format,
            self.usage_flags
        );
        Ok(())
    }

    fn create_objects(&mut self, device: &GraphicsDevice) -> GpuResult<()> {
        let api = device.api();

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(self.image_type)
            .extent(vk::Extent3D {
                width: self.width,
                height: self.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(self.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(self.usage_flags)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(vk::SampleCountFlags::TYPE_1);
        self.image = api.create_image(&image_info)?;

        let allocator = device.memory_allocator();
        let allocation = allocator.allocate_for_image(self.image, self.memory_usage)?;
        let bound = allocator.bind_image(&allocation, self.image);
        self.allocation = Some(allocation);
        bound?;

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(self.image)
            .view_type(self.view_type)
            .format(self.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect_mask(self.format),
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        self.image_view = api.create_image_view(&view_info)?;

        let anisotropy = device.features().sampler_anisotropy;
        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .anisotropy_enable(anisotropy)
            .max_anisotropy(if anisotropy { 16.0 } else { 1.0 })
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .min_lod(0.0)
            .max_lod(0.0);
        self.sampler = api.create_sampler(&sampler_info)?;
        Ok(())
    }

    fn destroy_objects(&mut self, device: &GraphicsDevice) {
        let api = device.api();
        if self.sampler != vk::Sampler::null() {
            api.destroy_sampler(self.sampler);
            self.sampler = vk::Sampler::null();
        }
        if self.image_view != vk::ImageView::null() {
            api.destroy_image_view(self.image_view);
            self.image_view = vk::ImageView::null();
        }
        if self.image != vk::Image::null() {
            api.destroy_image(self.image);
            self.image = vk::Image::null();
        }
        if let Some(allocation) = self.allocation.take() {
            device.memory_allocator().free(allocation);
        }
    }

    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Image format
    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Image usage flags
    pub fn usage_flags(&self) -> vk::ImageUsageFlags {
        self.usage_flags
    }

    /// Image dimensionality
    pub fn image_type(&self) -> vk::ImageType {
        self.image_type
    }

    /// View dimensionality
    pub fn view_type(&self) -> vk::ImageViewType {
        self.view_type
    }

    /// Native image, null once released
    pub fn image(&self) -> vk::Image {
        self.image
    }

    /// Native view, null once released
    pub fn image_view(&self) -> vk::ImageView {
        self.image_view
    }

    /// Native sampler, null once released
    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    /// Binding info for sampling the texture in a shader
    pub fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: self.sampler,
            image_view: self.image_view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    /// Destroy all native objects; `false` if already released
    pub fn release(&mut self) -> bool {
        match self.device.take() {
            Some(device) => {
                self.destroy_objects(device);
                true
            }
            None => false,
        }
    }
}

impl Drop for Texture<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Aspect flags a view of `format` must use
pub fn aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}
