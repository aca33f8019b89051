// Deferred destruction queues
//
// Retiring a resource only records what must be released. The handles are
// released later, at the Reclaim step of the frame that reuses the slot the
// resource was retired in, once the back-pressure wait has proven the GPU is
// done with every earlier frame.

use std::fmt;

use crate::backend::Gpu;
use crate::upload::Texture;

/// Queue kinds, in the order a drain walks them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    SurfaceSet,
    Image,
    Buffer,
    Pipeline,
    DescriptorSet,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::SurfaceSet,
        ResourceKind::Image,
        ResourceKind::Buffer,
        ResourceKind::Pipeline,
        ResourceKind::DescriptorSet,
    ];
}

/// Image plus whatever was created on top of it
pub struct ImageRelease<G: Gpu> {
    pub image: G::Image,
    pub view: Option<G::ImageView>,
    pub sampler: Option<G::Sampler>,
}

pub struct BufferRelease<G: Gpu> {
    pub buffer: G::Buffer,
    /// Separate upload buffer owned by the same logical resource
    pub staging: Option<G::Buffer>,
}

pub struct DescriptorRelease<G: Gpu> {
    pub layout: G::DescriptorSetLayout,
    pub set: Option<G::DescriptorSet>,
    /// Sets from the bindless pool are never freed individually
    pub bindless: bool,
}

/// One pending destruction entry
pub enum Retired<G: Gpu> {
    SurfaceSet(G::SurfaceSet),
    Image(ImageRelease<G>),
    Buffer(BufferRelease<G>),
    Pipeline(G::Pipeline),
    DescriptorSet(DescriptorRelease<G>),
}

impl<G: Gpu> Retired<G> {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Retired::SurfaceSet(_) => ResourceKind::SurfaceSet,
            Retired::Image(_) => ResourceKind::Image,
            Retired::Buffer(_) => ResourceKind::Buffer,
            Retired::Pipeline(_) => ResourceKind::Pipeline,
            Retired::DescriptorSet(_) => ResourceKind::DescriptorSet,
        }
    }

    /// A buffer with no separate staging buffer
    pub fn buffer(buffer: G::Buffer) -> Self {
        Retired::Buffer(BufferRelease { buffer, staging: None })
    }
}

impl<G: Gpu> From<ImageRelease<G>> for Retired<G> {
    fn from(entry: ImageRelease<G>) -> Self {
        Retired::Image(entry)
    }
}

impl<G: Gpu> From<BufferRelease<G>> for Retired<G> {
    fn from(entry: BufferRelease<G>) -> Self {
        Retired::Buffer(entry)
    }
}

impl<G: Gpu> From<DescriptorRelease<G>> for Retired<G> {
    fn from(entry: DescriptorRelease<G>) -> Self {
        Retired::DescriptorSet(entry)
    }
}

impl<G: Gpu> From<Texture<G>> for Retired<G> {
    fn from(texture: Texture<G>) -> Self {
        Retired::Image(ImageRelease {
            image: texture.image,
            view: Some(texture.view),
            sampler: Some(texture.sampler),
        })
    }
}

impl<G: Gpu> fmt::Debug for Retired<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Retired::SurfaceSet(set) => f.debug_tuple("SurfaceSet").field(set).finish(),
            Retired::Image(entry) => f
                .debug_struct("Image")
                .field("image", &entry.image)
                .field("view", &entry.view)
                .field("sampler", &entry.sampler)
                .finish(),
            Retired::Buffer(entry) => f
                .debug_struct("Buffer")
                .field("buffer", &entry.buffer)
                .field("staging", &entry.staging)
                .finish(),
            Retired::Pipeline(pipeline) => f.debug_tuple("Pipeline").field(pipeline).finish(),
            Retired::DescriptorSet(entry) => f
                .debug_struct("DescriptorSet")
                .field("layout", &entry.layout)
                .field("set", &entry.set)
                .field("bindless", &entry.bindless)
                .finish(),
        }
    }
}

// =============================================================================
// QUEUES
// =============================================================================

/// Five append-only lists, one per resource kind, drained in full
pub struct DestructionQueues<G: Gpu> {
    surface_sets: Vec<G::SurfaceSet>,
    images: Vec<ImageRelease<G>>,
    buffers: Vec<BufferRelease<G>>,
    pipelines: Vec<G::Pipeline>,
    descriptor_sets: Vec<DescriptorRelease<G>>,
}

impl<G: Gpu> Default for DestructionQueues<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G: Gpu> DestructionQueues<G> {
    pub fn new() -> Self {
        Self {
            surface_sets: Vec::new(),
            images: Vec::new(),
            buffers: Vec::new(),
            pipelines: Vec::new(),
            descriptor_sets: Vec::new(),
        }
    }

    /// Record intent to release. Never blocks, never fails.
    pub fn schedule(&mut self, entry: impl Into<Retired<G>>) {
        match entry.into() {
            Retired::SurfaceSet(set) => self.surface_sets.push(set),
            Retired::Image(entry) => self.images.push(entry),
            Retired::Buffer(entry) => self.buffers.push(entry),
            Retired::Pipeline(pipeline) => self.pipelines.push(pipeline),
            Retired::DescriptorSet(entry) => self.descriptor_sets.push(entry),
        }
    }

    pub fn pending(&self, kind: ResourceKind) -> usize {
        match kind {
            ResourceKind::SurfaceSet => self.surface_sets.len(),
            ResourceKind::Image => self.images.len(),
            ResourceKind::Buffer => self.buffers.len(),
            ResourceKind::Pipeline => self.pipelines.len(),
            ResourceKind::DescriptorSet => self.descriptor_sets.len(),
        }
    }

    pub fn len(&self) -> usize {
        ResourceKind::ALL.iter().map(|&kind| self.pending(kind)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release everything, kind by kind. Returns how many entries were released.
    ///
    /// Only call once the GPU can no longer reference any queued handle.
    pub fn drain(&mut self, gpu: &mut G) -> usize {
        let released = self.len();
        if released == 0 {
            return 0;
        }

        for set in self.surface_sets.drain(..) {
            gpu.release_surface_set(set);
        }

        for entry in self.images.drain(..) {
            if let Some(sampler) = entry.sampler {
                gpu.release_sampler(sampler);
            }
            if let Some(view) = entry.view {
                gpu.release_image_view(view);
            }
            gpu.release_image(entry.image);
        }

        for entry in self.buffers.drain(..) {
            gpu.release_buffer(entry.buffer);
            if let Some(staging) = entry.staging {
                gpu.release_buffer(staging);
            }
        }

        for pipeline in self.pipelines.drain(..) {
            gpu.release_pipeline(pipeline);
        }

        for entry in self.descriptor_sets.drain(..) {
            if !entry.bindless {
                if let Some(set) = entry.set {
                    gpu.release_descriptor_set(set);
                }
            }
            gpu.release_descriptor_set_layout(entry.layout);
        }

        log::debug!("Released {} retired resources", released);
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::simulated::{ReleaseKind, SimulatedGpu};
    use crate::backend::BufferUsage;
    use crate::upload::{SamplerConfig, TextureDesc, TextureFormat};

    fn texture(gpu: &mut SimulatedGpu) -> Texture<SimulatedGpu> {
        let desc = TextureDesc::new(4, 4, TextureFormat::Rgba8Srgb);
        let image = gpu.create_texture_image(&desc).unwrap();
        let view = gpu.create_texture_view(&image, &desc).unwrap();
        let sampler = gpu.create_sampler(&SamplerConfig::default(), 1).unwrap();
        Texture { image, view, sampler, desc }
    }

    #[test]
    fn scheduling_only_records_intent() {
        let mut gpu = SimulatedGpu::new();
        let mut queues = DestructionQueues::<SimulatedGpu>::new();
        let buffer = gpu.create_buffer(BufferUsage::Vertex, 64, "vertices").unwrap();

        queues.schedule(Retired::<SimulatedGpu>::buffer(buffer));

        assert_eq!(queues.pending(ResourceKind::Buffer), 1);
        assert!(gpu.releases().is_empty());
    }

    #[test]
    fn drain_walks_kinds_in_order() {
        let mut gpu = SimulatedGpu::new();
        let mut queues = DestructionQueues::<SimulatedGpu>::new();

        let layout = gpu.create_descriptor_set_layout("layout");
        queues.schedule(DescriptorRelease { layout, set: None, bindless: false });
        let pipeline = gpu.create_pipeline("opaque");
        queues.schedule(Retired::<SimulatedGpu>::Pipeline(pipeline));
        let buffer = gpu.create_buffer(BufferUsage::Index, 64, "indices").unwrap();
        queues.schedule(Retired::<SimulatedGpu>::buffer(buffer));
        let tex = texture(&mut gpu);
        queues.schedule(tex);

        assert_eq!(queues.drain(&mut gpu), 4);
        assert!(queues.is_empty());

        let kinds: Vec<ReleaseKind> = gpu.releases().iter().map(|(kind, _)| *kind).collect();
        assert_eq!(
            kinds,
            vec![
                ReleaseKind::Sampler,
                ReleaseKind::ImageView,
                ReleaseKind::Image,
                ReleaseKind::Buffer,
                ReleaseKind::Pipeline,
                ReleaseKind::DescriptorSetLayout,
            ]
        );
        assert!(gpu.violations().is_empty());
    }

    #[test]
    fn bindless_sets_are_never_freed_individually() {
        let mut gpu = SimulatedGpu::new();
        let mut queues = DestructionQueues::<SimulatedGpu>::new();

        let layout = gpu.create_descriptor_set_layout("bindless");
        let set = gpu.create_descriptor_set(layout);
        queues.schedule(DescriptorRelease { layout, set: Some(set), bindless: true });
        let layout = gpu.create_descriptor_set_layout("material");
        let set = gpu.create_descriptor_set(layout);
        queues.schedule(DescriptorRelease { layout, set: Some(set), bindless: false });

        queues.drain(&mut gpu);

        let kinds: Vec<ReleaseKind> = gpu.releases().iter().map(|(kind, _)| *kind).collect();
        assert_eq!(
            kinds,
            vec![
                ReleaseKind::DescriptorSetLayout,
                ReleaseKind::DescriptorSet,
                ReleaseKind::DescriptorSetLayout,
            ]
        );
    }

    #[test]
    fn staging_buffer_follows_primary() {
        let mut gpu = SimulatedGpu::new();
        let mut queues = DestructionQueues::<SimulatedGpu>::new();
        let buffer = gpu.create_buffer(BufferUsage::Vertex, 64, "mesh").unwrap();
        let staging = gpu.create_buffer(BufferUsage::Staging, 64, "mesh staging").unwrap();
        let (primary_id, staging_id) = (buffer.id(), staging.id());

        queues.schedule(BufferRelease { buffer, staging: Some(staging) });
        queues.drain(&mut gpu);

        assert_eq!(
            gpu.releases(),
            vec![(ReleaseKind::Buffer, primary_id), (ReleaseKind::Buffer, staging_id)]
        );
    }

    #[test]
    fn draining_empty_queues_releases_nothing() {
        let mut gpu = SimulatedGpu::new();
        let mut queues = DestructionQueues::<SimulatedGpu>::new();
        assert_eq!(queues.drain(&mut gpu), 0);
        assert!(gpu.releases().is_empty());
    }
}
