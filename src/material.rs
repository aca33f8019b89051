// Material vertex/instance binding
//
// A material pairs an externally built pipeline (and optional descriptor set)
// with the geometry buffers it draws from. Vertices and indices live in
// device-local buffers filled through the staging path; instance data is
// rewritten by the CPU into one host-visible buffer per frame slot.
//
// Misusing an upload (wrong layout) logs an error and does nothing. Drawing
// before the data for this frame exists is skipped silently.

use anyhow::{bail, Context, Result};

use crate::backend::{BufferUsage, Gpu};
use crate::destruction::{DescriptorRelease, Retired};
use crate::renderer::Renderer;

/// Offset of a geometry buffer nobody uploaded into yet
pub const EMPTY_OFFSET: u64 = u64::MAX;

/// Which vertex streams a pipeline consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexUsage {
    None,
    Vertices,
    Instances,
    VerticesAndInstances,
}

impl VertexUsage {
    pub fn from_strides(vertex_stride: u32, instance_stride: u32) -> Self {
        match (vertex_stride > 0, instance_stride > 0) {
            (true, true) => VertexUsage::VerticesAndInstances,
            (true, false) => VertexUsage::Vertices,
            (false, true) => VertexUsage::Instances,
            (false, false) => VertexUsage::None,
        }
    }

    pub fn uses_vertices(self) -> bool {
        matches!(self, VertexUsage::Vertices | VertexUsage::VerticesAndInstances)
    }

    pub fn uses_instances(self) -> bool {
        matches!(self, VertexUsage::Instances | VertexUsage::VerticesAndInstances)
    }
}

/// Vertex input layout and buffer capacities of a material
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaterialLayout {
    /// Bytes per vertex, zero when the pipeline takes no vertex stream
    pub vertex_stride: u32,
    /// Bytes per instance, zero when the pipeline takes no instance stream
    pub instance_stride: u32,
    pub max_vertices: u32,
    pub max_indices: u32,
    pub max_instances: u32,
}

impl Default for MaterialLayout {
    fn default() -> Self {
        Self {
            vertex_stride: 0,
            instance_stride: 0,
            max_vertices: 4,
            max_indices: 6,
            max_instances: 10_000,
        }
    }
}

/// What a bound material asks the backend to draw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawKind {
    Indexed { index_count: u32, instance_count: u32 },
    Direct { vertex_count: u32, instance_count: u32 },
}

/// Everything a backend needs to record one material draw
pub struct DrawCall<'a, G: Gpu> {
    pub pipeline: G::Pipeline,
    pub descriptor_set: Option<G::DescriptorSet>,
    /// Bound in order starting at binding 0, with their byte offsets
    pub vertex_buffers: Vec<(&'a G::Buffer, u64)>,
    pub index_buffer: Option<(&'a G::Buffer, u64)>,
    pub kind: DrawKind,
}

struct GeometryBuffer<G: Gpu> {
    buffer: G::Buffer,
    capacity: u64,
    offset: u64,
    size: u64,
}

impl<G: Gpu> GeometryBuffer<G> {
    fn new(gpu: &mut G, usage: BufferUsage, capacity: u64, name: &str) -> Result<Self> {
        let buffer = gpu
            .create_buffer(usage, capacity, name)
            .with_context(|| format!("Failed to create {name}"))?;
        Ok(Self { buffer, capacity, offset: EMPTY_OFFSET, size: 0 })
    }

    fn is_empty(&self) -> bool {
        self.offset == EMPTY_OFFSET
    }

    fn check_fits(&self, offset: u64, len: usize) -> Result<()> {
        let end = offset.saturating_add(len as u64);
        if end > self.capacity {
            bail!("{} bytes at offset {} overflow a {} byte buffer", len, offset, self.capacity);
        }
        Ok(())
    }

    fn mark_filled(&mut self, offset: u64, len: usize) {
        self.offset = 0;
        self.size = self.size.max(offset + len as u64);
    }

    fn clear(&mut self) {
        self.offset = EMPTY_OFFSET;
        self.size = 0;
    }
}

pub struct Material<G: Gpu> {
    name: String,
    usage: VertexUsage,
    layout: MaterialLayout,
    pipeline: G::Pipeline,
    descriptor: Option<DescriptorRelease<G>>,
    vertices: Option<GeometryBuffer<G>>,
    indices: Option<GeometryBuffer<G>>,
    /// One per frame slot
    instances: Vec<GeometryBuffer<G>>,
}

impl<G: Gpu> Material<G> {
    /// Wrap an already built pipeline. Takes ownership of the pipeline and the
    /// descriptor set; both are retired together with the material.
    pub fn new(
        renderer: &mut Renderer<G>,
        name: &str,
        pipeline: G::Pipeline,
        descriptor: Option<DescriptorRelease<G>>,
        layout: MaterialLayout,
    ) -> Result<Self> {
        let usage = VertexUsage::from_strides(layout.vertex_stride, layout.instance_stride);
        let depth = renderer.presentation_depth();

        let mut material = Self {
            name: name.to_string(),
            usage,
            layout,
            pipeline,
            descriptor,
            vertices: None,
            indices: None,
            instances: Vec::new(),
        };
        // A partially built material still owns the pipeline and descriptor set
        if let Err(e) = material.create_buffers(renderer.gpu_mut(), depth) {
            material.retire(renderer);
            return Err(e);
        }

        log::debug!("Created material '{}' ({:?})", name, usage);
        Ok(material)
    }

    fn create_buffers(&mut self, gpu: &mut G, depth: usize) -> Result<()> {
        let name = &self.name;
        let layout = &self.layout;

        if self.usage.uses_vertices() {
            let vertex_bytes = layout.vertex_stride as u64 * layout.max_vertices as u64;
            let index_bytes = std::mem::size_of::<u32>() as u64 * layout.max_indices as u64;
            self.vertices = Some(GeometryBuffer::new(gpu, BufferUsage::Vertex, vertex_bytes, &format!("{name} vertices"))?);
            self.indices = Some(GeometryBuffer::new(gpu, BufferUsage::Index, index_bytes, &format!("{name} indices"))?);
        }

        if self.usage.uses_instances() {
            let instance_bytes = layout.instance_stride as u64 * layout.max_instances as u64;
            for slot in 0..depth {
                let instances =
                    GeometryBuffer::new(gpu, BufferUsage::Instance, instance_bytes, &format!("{name} instances {slot}"))?;
                self.instances.push(instances);
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn usage(&self) -> VertexUsage {
        self.usage
    }

    // ─────────────────────────────────────────────────────────────────────────
    // UPLOADS
    // ─────────────────────────────────────────────────────────────────────────

    /// Stage vertex data through the current slot's transfer list
    pub fn upload_vertices(&mut self, renderer: &mut Renderer<G>, data: &[u8], offset: u64) -> Result<()> {
        let Some(vertices) = self.vertices.as_mut() else {
            log::error!("Material '{}' does not use vertices", self.name);
            return Ok(());
        };
        vertices.check_fits(offset, data.len())?;
        renderer.upload_buffer(&vertices.buffer, offset, data)?;
        vertices.mark_filled(offset, data.len());
        Ok(())
    }

    pub fn upload_indices(&mut self, renderer: &mut Renderer<G>, indices: &[u32], offset: u64) -> Result<()> {
        let Some(buffer) = self.indices.as_mut() else {
            log::error!("Material '{}' does not use indices", self.name);
            return Ok(());
        };
        let data: &[u8] = bytemuck::cast_slice(indices);
        buffer.check_fits(offset, data.len())?;
        renderer.upload_buffer(&buffer.buffer, offset, data)?;
        buffer.mark_filled(offset, data.len());
        Ok(())
    }

    /// Write instance data for the current frame slot
    pub fn upload_instances(&mut self, renderer: &mut Renderer<G>, data: &[u8], offset: u64) -> Result<()> {
        if !self.usage.uses_instances() {
            log::error!("Material '{}' does not use instances", self.name);
            return Ok(());
        }
        let slot = renderer.current_frame_slot();
        Self::write_instances(&mut self.instances[slot], renderer.gpu_mut(), data, offset)
    }

    /// Write the same instance data into every slot's buffer
    pub fn upload_instances_all(&mut self, renderer: &mut Renderer<G>, data: &[u8], offset: u64) -> Result<()> {
        if !self.usage.uses_instances() {
            log::error!("Material '{}' does not use instances", self.name);
            return Ok(());
        }
        for instances in self.instances.iter_mut() {
            Self::write_instances(instances, renderer.gpu_mut(), data, offset)?;
        }
        Ok(())
    }

    fn write_instances(instances: &mut GeometryBuffer<G>, gpu: &mut G, data: &[u8], offset: u64) -> Result<()> {
        instances.check_fits(offset, data.len())?;
        gpu.write_buffer(&instances.buffer, offset, data)
            .context("Failed to write instance buffer")?;
        instances.mark_filled(offset, data.len());
        Ok(())
    }

    pub fn clear_vertices(&mut self) {
        if let Some(vertices) = self.vertices.as_mut() {
            vertices.clear();
        }
    }

    pub fn clear_indices(&mut self) {
        if let Some(indices) = self.indices.as_mut() {
            indices.clear();
        }
    }

    pub fn clear_instances(&mut self) {
        for instances in self.instances.iter_mut() {
            instances.clear();
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // DRAWING
    // ─────────────────────────────────────────────────────────────────────────

    /// Describe the draw for `slot`, or `None` while the data it needs is missing
    pub fn draw_call(&self, slot: usize) -> Option<DrawCall<'_, G>> {
        let instances = if self.usage.uses_instances() {
            let instances = self.instances.get(slot)?;
            if instances.is_empty() {
                return None;
            }
            Some(instances)
        } else {
            None
        };

        let geometry = if self.usage.uses_vertices() {
            let vertices = self.vertices.as_ref()?;
            let indices = self.indices.as_ref()?;
            if vertices.is_empty() {
                return None;
            }
            Some((vertices, indices))
        } else {
            None
        };

        let instance_count = match instances {
            Some(instances) => (instances.size / self.layout.instance_stride as u64) as u32,
            None => 1,
        };

        let mut vertex_buffers = Vec::with_capacity(2);
        let mut index_buffer = None;
        let kind = match geometry {
            Some((vertices, indices)) => {
                vertex_buffers.push((&vertices.buffer, vertices.offset));
                let index_offset = if indices.is_empty() { 0 } else { indices.offset };
                index_buffer = Some((&indices.buffer, index_offset));
                DrawKind::Indexed {
                    index_count: (indices.size / std::mem::size_of::<u32>() as u64) as u32,
                    instance_count,
                }
            }
            // Vertex positions come from the vertex index in the shader
            None => DrawKind::Direct { vertex_count: 3, instance_count },
        };
        if let Some(instances) = instances {
            vertex_buffers.push((&instances.buffer, instances.offset));
        }

        Some(DrawCall {
            pipeline: self.pipeline,
            descriptor_set: self.descriptor.as_ref().and_then(|d| d.set),
            vertex_buffers,
            index_buffer,
            kind,
        })
    }

    /// Record this material's draw into the frame's render commands
    pub fn bind(&self, renderer: &Renderer<G>, commands: G::CommandList) -> Result<()> {
        match self.draw_call(renderer.current_frame_slot()) {
            Some(draw) => renderer.gpu().record_draw(commands, &draw),
            None => Ok(()),
        }
    }

    /// Schedule every owned GPU object for deferred destruction
    pub fn retire(self, renderer: &mut Renderer<G>) {
        let buffers = self
            .vertices
            .into_iter()
            .chain(self.indices)
            .chain(self.instances);
        for geometry in buffers {
            renderer.schedule_destruction(Retired::<G>::buffer(geometry.buffer));
        }
        renderer.schedule_destruction(Retired::<G>::Pipeline(self.pipeline));
        if let Some(descriptor) = self.descriptor {
            renderer.schedule_destruction(descriptor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::simulated::{GpuEvent, ReleaseKind, SimulatedGpu};
    use crate::renderer::FrameSettings;

    fn renderer() -> Renderer<SimulatedGpu> {
        let _ = env_logger::builder().is_test(true).try_init();
        Renderer::new(SimulatedGpu::new(), FrameSettings::default()).unwrap()
    }

    fn material(renderer: &mut Renderer<SimulatedGpu>, layout: MaterialLayout) -> Material<SimulatedGpu> {
        let pipeline = renderer.gpu().create_pipeline("test pipeline");
        Material::new(renderer, "test", pipeline, None, layout).unwrap()
    }

    #[test]
    fn failed_creation_retires_what_was_built() {
        let _ = env_logger::builder().is_test(true).try_init();
        let gpu = SimulatedGpu::new();
        let mut renderer = Renderer::new(gpu.clone(), FrameSettings::default()).unwrap();
        let buffers_before = gpu.live_count(ReleaseKind::Buffer);

        // Vertices, indices and the first slot's instances succeed
        gpu.fail_creation(ReleaseKind::Buffer, 3);
        let pipeline = gpu.create_pipeline("doomed");
        let layout = MaterialLayout { vertex_stride: 12, instance_stride: 16, ..Default::default() };
        assert!(Material::new(&mut renderer, "doomed", pipeline, None, layout).is_err());

        assert_eq!(gpu.live_count(ReleaseKind::Buffer), buffers_before + 3);
        assert_eq!(renderer.pending_destruction_count(), 4);

        for _ in 0..renderer.presentation_depth() + 1 {
            renderer.render_frame(&mut []).unwrap();
        }
        assert_eq!(gpu.live_count(ReleaseKind::Buffer), buffers_before);
        assert_eq!(gpu.live_count(ReleaseKind::Pipeline), 0);
        assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
    }

    #[test]
    fn usage_follows_strides() {
        assert_eq!(VertexUsage::from_strides(0, 0), VertexUsage::None);
        assert_eq!(VertexUsage::from_strides(12, 0), VertexUsage::Vertices);
        assert_eq!(VertexUsage::from_strides(0, 64), VertexUsage::Instances);
        assert_eq!(VertexUsage::from_strides(12, 64), VertexUsage::VerticesAndInstances);
    }

    #[test]
    fn uploading_instances_without_instance_layout_is_a_no_op() {
        let mut renderer = renderer();
        let layout = MaterialLayout { vertex_stride: 12, ..Default::default() };
        let mut material = material(&mut renderer, layout);
        let writes = renderer.gpu().buffer_writes();

        material.upload_instances(&mut renderer, &[0; 64], 0).unwrap();
        material.upload_instances_all(&mut renderer, &[0; 64], 0).unwrap();

        assert_eq!(renderer.gpu().buffer_writes(), writes);
        assert_eq!(renderer.frame_context().current().transfers.len(), 0);
    }

    #[test]
    fn uploading_vertices_without_vertex_layout_is_a_no_op() {
        let mut renderer = renderer();
        let layout = MaterialLayout { instance_stride: 16, ..Default::default() };
        let mut material = material(&mut renderer, layout);

        material.upload_vertices(&mut renderer, &[0; 48], 0).unwrap();
        material.upload_indices(&mut renderer, &[0, 1, 2], 0).unwrap();

        assert_eq!(renderer.frame_context().current().transfers.len(), 0);
    }

    #[test]
    fn draw_is_skipped_until_data_is_uploaded() {
        let mut renderer = renderer();
        let layout = MaterialLayout { vertex_stride: 12, instance_stride: 16, ..Default::default() };
        let mut material = material(&mut renderer, layout);
        let slot = renderer.current_frame_slot();

        assert!(material.draw_call(slot).is_none());

        material.upload_vertices(&mut renderer, &[0; 48], 0).unwrap();
        material.upload_indices(&mut renderer, &[0, 1, 2, 2, 3, 0], 0).unwrap();
        assert!(material.draw_call(slot).is_none(), "instances still missing");

        material.upload_instances(&mut renderer, &[0; 32], 0).unwrap();
        let draw = material.draw_call(slot).unwrap();
        assert_eq!(draw.kind, DrawKind::Indexed { index_count: 6, instance_count: 2 });
        assert_eq!(draw.vertex_buffers.len(), 2);

        material.clear_vertices();
        assert!(material.draw_call(slot).is_none());
    }

    #[test]
    fn instances_are_per_slot() {
        let mut renderer = renderer();
        let layout = MaterialLayout { instance_stride: 16, ..Default::default() };
        let mut material = material(&mut renderer, layout);
        let slot = renderer.current_frame_slot();

        material.upload_instances(&mut renderer, &[0; 48], 0).unwrap();
        assert_eq!(
            material.draw_call(slot).unwrap().kind,
            DrawKind::Direct { vertex_count: 3, instance_count: 3 }
        );
        assert!(material.draw_call(slot + 1).is_none());
    }

    #[test]
    fn layoutless_material_draws_a_single_triangle() {
        let mut renderer = renderer();
        let material = material(&mut renderer, MaterialLayout::default());
        let draw = material.draw_call(0).unwrap();
        assert_eq!(draw.kind, DrawKind::Direct { vertex_count: 3, instance_count: 1 });
        assert!(draw.vertex_buffers.is_empty());
        assert!(draw.index_buffer.is_none());
    }

    #[test]
    fn silent_skip_records_no_draw() {
        struct Scene(Material<SimulatedGpu>);
        impl crate::renderer::FrameParticipant<SimulatedGpu> for Scene {
            fn render(
                &mut self,
                renderer: &Renderer<SimulatedGpu>,
                commands: <SimulatedGpu as Gpu>::CommandList,
            ) -> Result<()> {
                self.0.bind(renderer, commands)
            }
        }

        let mut renderer = renderer();
        let layout = MaterialLayout { instance_stride: 16, ..Default::default() };
        let mut scene = Scene(material(&mut renderer, layout));

        renderer.render_frame(&mut [&mut scene]).unwrap();
        let draws = |gpu: &SimulatedGpu| {
            gpu.events().iter().filter(|e| matches!(e, GpuEvent::Draw { .. })).count()
        };
        assert_eq!(draws(renderer.gpu()), 0);

        scene.0.upload_instances(&mut renderer, &[0; 16], 0).unwrap();
        renderer.render_frame(&mut [&mut scene]).unwrap();
        assert_eq!(draws(renderer.gpu()), 1);

        scene.0.retire(&mut renderer);
        assert!(renderer.pending_destruction_count() >= 3);
    }
}
