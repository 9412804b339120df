//! GPU meshes
//!
//! A [`Mesh`] uploads vertex and optional index data into device-local
//! buffers through host-visible staging buffers. Static meshes drop their
//! staging buffers after the upload; dynamic meshes keep them so the
//! contents can be refreshed with [`Mesh::update_dynamic_buffer`]. The
//! vertex and index counts of a mesh never change after [`Mesh::load`].

use ash::vk;

use super::buffer::Buffer;
use super::indirect_draw::{IndirectDrawCommands, INDIRECT_COMMAND_STRIDE};
use super::memory_allocator::MemoryUsage;
use crate::render::backends::vulkan::initialization::context::{GpuError, GpuResult, GraphicsDevice};
use crate::render::backends::vulkan::rendering::commands::CommandBuffer;

/// Parameters for [`Mesh::draw`]
///
/// `None` counts draw the whole mesh. `instance_count` counts instances in
/// addition to the first one.
#[derive(Clone, Copy, Default)]
pub struct DrawParams<'a> {
    /// Per-instance vertex buffer bound at binding 1
    pub instance_buffer: Option<vk::Buffer>,
    /// Additional instances to draw, capped at `u32::MAX` in total
    pub instance_count: u32,
    /// Instance ID of the first instance
    pub first_instance: u32,
    /// Draw from these commands instead of the counts below
    pub indirect: Option<&'a IndirectDrawCommands<'a>>,
    /// Added to every index before fetching the vertex
    pub vertex_offset: i32,
    /// Indices to draw, the whole index buffer when `None`
    pub index_count: Option<u32>,
    /// First index read from the index buffer
    pub first_index: u32,
    /// Vertices to draw for unindexed meshes, all of them when `None`
    pub vertex_count: Option<u32>,
    /// First vertex for unindexed meshes
    pub first_vertex: u32,
}

/// Vertex buffer, optional index buffer and their staging copies
pub struct Mesh<'d> {
    device: Option<&'d GraphicsDevice>,
    vertex_buffer: Option<Buffer<'d>>,
    index_buffer: Option<Buffer<'d>>,
    staging_vertex_buffer: Option<Buffer<'d>>,
    staging_index_buffer: Option<Buffer<'d>>,
    vertex_count: u32,
    index_count: u32,
    vertex_bytes: usize,
    dynamic: bool,
    texture: Option<vk::DescriptorImageInfo>,
}

impl<'d> Mesh<'d> {
    /// Upload `vertices` and, when given, 32-bit `indices`
    ///
    /// A missing or empty index slice creates an unindexed mesh. The
    /// device's default texture is assigned.
    pub fn load<V: bytemuck::Pod>(
        device: &'d GraphicsDevice,
        vertices: &[V],
        indices: Option<&[u32]>,
        dynamic: bool,
    ) -> GpuResult<Self> {
        const TRACE: &str = "mesh::load";

        if vertices.is_empty() || std::mem::size_of::<V>() == 0 {
            return Err(device.report(TRACE, GpuError::invalid_argument("mesh has no vertex data")));
        }
        let indices = indices.filter(|indices| !indices.is_empty());
        let from_pool = device.has_memory_pool();

        let (staging_vertex_buffer, vertex_buffer) =
            Self::upload(device, vertices, vk::BufferUsageFlags::VERTEX_BUFFER, from_pool)?;
        let (staging_index_buffer, index_buffer) = match indices {
            Some(indices) => {
                let (staging, buffer) = Self::upload(device, indices, vk::BufferUsageFlags::INDEX_BUFFER, from_pool)?;
                (Some(staging), Some(buffer))
            }
            None => (None, None),
        };

        let mut mesh = Self {
            device: Some(device),
            vertex_buffer: Some(vertex_buffer),
            index_buffer,
            staging_vertex_buffer: Some(staging_vertex_buffer),
            staging_index_buffer,
            vertex_count: vertices.len() as u32,
            index_count: indices.map_or(0, |indices| indices.len() as u32),
            vertex_bytes: std::mem::size_of_val(vertices),
            dynamic,
            texture: device.default_texture(),
        };
        if !dynamic {
            mesh.release_staging();
        }

        log::debug!(
            "Mesh loaded: {} vertices, {} indices, dynamic: {}",
            mesh.vertex_count,
            mesh.index_count,
            dynamic
        );
        Ok(mesh)
    }

    /// Stage `data` and copy it into a new device-local buffer
    fn upload<T: bytemuck::Pod>(
        device: &'d GraphicsDevice,
        data: &[T],
        usage: vk::BufferUsageFlags,
        from_pool: bool,
    ) -> GpuResult<(Buffer<'d>, Buffer<'d>)> {
        let size = std::mem::size_of_val(data) as vk::DeviceSize;

        let mut staging = Buffer::allocate_as_staging(device, size, from_pool)?;
        staging.bind()?;
        staging.set_data(data)?;

        let mut buffer = Buffer::allocate(
            device,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryUsage::GpuOnly,
            from_pool,
        )?;
        buffer.bind()?;
        staging.copy_to(&buffer)?;
        Ok((staging, buffer))
    }

    fn release_staging(&mut self) {
        for staging in [&mut self.staging_vertex_buffer, &mut self.staging_index_buffer] {
            if let Some(mut buffer) = staging.take() {
                buffer.release();
            }
        }
    }

    /// Refresh the contents of a dynamic mesh
    ///
    /// The vertex count, vertex byte size and index count must match the
    /// ones given to [`Mesh::load`].
    pub fn update_dynamic_buffer<V: bytemuck::Pod>(&self, vertices: &[V], indices: Option<&[u32]>) -> GpuResult<()> {
        const TRACE: &str = "mesh::update_dynamic_buffer";
        let Some(device) = self.device else {
            log::warn!("{}: mesh already released", TRACE);
            return Err(GpuError::invalid_state("mesh already released"));
        };
        if !self.dynamic {
            return Err(device.report(TRACE, GpuError::invalid_state("mesh was not created dynamic")));
        }

        let index_count = indices.map_or(0, <[u32]>::len);
        if vertices.len() != self.vertex_count as usize
            || std::mem::size_of_val(vertices) != self.vertex_bytes
            || index_count != self.index_count as usize
        {
            return Err(device.report(
                TRACE,
                GpuError::invalid_argument(format!(
                    "mesh topology is fixed at {} vertices and {} indices, got {} and {}",
                    self.vertex_count,
                    self.index_count,
                    vertices.len(),
                    index_count
                )),
            ));
        }

        if let (Some(staging), Some(buffer)) = (&self.staging_vertex_buffer, &self.vertex_buffer) {
            staging.set_data(vertices)?;
            staging.copy_to(buffer)?;
        }
        if let (Some(indices), Some(staging), Some(buffer)) =
            (indices, &self.staging_index_buffer, &self.index_buffer)
        {
            staging.set_data(indices)?;
            staging.copy_to(buffer)?;
        }
        Ok(())
    }

    /// Record binds and the draw call(s) into a recording command buffer
    ///
    /// With `params.indirect`, devices without multi-draw-indirect get one
    /// indirect draw call per command.
    pub fn draw(&self, command_buffer: &CommandBuffer, params: &DrawParams<'_>) -> GpuResult<()> {
        const TRACE: &str = "mesh::draw";
        let (Some(device), Some(vertex_buffer)) = (self.device, &self.vertex_buffer) else {
            log::warn!("{}: mesh already released", TRACE);
            return Err(GpuError::invalid_state("mesh already released"));
        };
        if !command_buffer.is_recording() {
            return Err(device.report(TRACE, GpuError::invalid_state("command buffer is not recording")));
        }
        if params.indirect.is_some() && self.index_buffer.is_none() {
            return Err(device.report(TRACE, GpuError::invalid_argument("indirect draws need an indexed mesh")));
        }

        let api = device.api();
        let handle = command_buffer.handle();
        api.cmd_bind_vertex_buffers(handle, 0, &[vertex_buffer.handle()], &[0]);
        if let Some(instance_buffer) = params.instance_buffer {
            api.cmd_bind_vertex_buffers(handle, 1, &[instance_buffer], &[0]);
        }
        if let Some(index_buffer) = &self.index_buffer {
            api.cmd_bind_index_buffer(handle, index_buffer.handle(), 0, vk::IndexType::UINT32);
        }

        if let Some(indirect) = params.indirect {
            let draw_count = indirect.draw_count();
            if device.features().multi_draw_indirect {
                api.cmd_draw_indexed_indirect(handle, indirect.handle(), 0, draw_count, INDIRECT_COMMAND_STRIDE);
            } else {
                for draw in 0..draw_count {
                    let offset = vk::DeviceSize::from(draw) * vk::DeviceSize::from(INDIRECT_COMMAND_STRIDE);
                    api.cmd_draw_indexed_indirect(handle, indirect.handle(), offset, 1, INDIRECT_COMMAND_STRIDE);
                }
            }
        } else if self.index_buffer.is_some() {
            api.cmd_draw_indexed(
                handle,
                params.index_count.unwrap_or(self.index_count),
                params.instance_count.saturating_add(1),
                params.first_index,
                params.vertex_offset,
                params.first_instance,
            );
        } else {
            api.cmd_draw(
                handle,
                params.vertex_count.unwrap_or(self.vertex_count),
                params.instance_count.saturating_add(1),
                params.first_vertex,
                params.first_instance,
            );
        }
        Ok(())
    }

    /// Device-local vertex buffer, `None` once released
    pub fn vertex_buffer(&self) -> Option<&Buffer<'d>> {
        self.vertex_buffer.as_ref()
    }

    /// Device-local index buffer, `None` for unindexed meshes
    pub fn index_buffer(&self) -> Option<&Buffer<'d>> {
        self.index_buffer.as_ref()
    }

    /// Null once released
    pub fn vertex_buffer_handle(&self) -> vk::Buffer {
        self.vertex_buffer.as_ref().map_or(vk::Buffer::null(), Buffer::handle)
    }

    /// Null for unindexed meshes
    pub fn index_buffer_handle(&self) -> vk::Buffer {
        self.index_buffer.as_ref().map_or(vk::Buffer::null(), Buffer::handle)
    }

    /// Number of vertices uploaded
    pub fn vertices_count(&self) -> u32 {
        self.vertex_count
    }

    /// Number of indices uploaded, 0 for unindexed meshes
    pub fn indices_count(&self) -> u32 {
        self.index_count
    }

    /// Whether the mesh keeps staging buffers for updates
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// Whether staging buffers are still held
    pub fn has_staging_buffers(&self) -> bool {
        self.staging_vertex_buffer.is_some()
    }

    /// Sampled image bound with the mesh, if any
    pub fn texture(&self) -> Option<vk::DescriptorImageInfo> {
        self.texture
    }

    /// Replace the sampled image
    pub fn set_texture(&mut self, texture: vk::DescriptorImageInfo) {
        self.texture = Some(texture);
    }

    /// Release all buffers and forget the texture; `false` if already released
    pub fn release(&mut self) -> bool {
        if self.device.take().is_none() {
            return false;
        }
        self.release_staging();
        for buffer in [&mut self.vertex_buffer, &mut self.index_buffer] {
            if let Some(mut buffer) = buffer.take() {
                buffer.release();
            }
        }
        self.texture = None;
        true
    }
}

impl Drop for Mesh<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
