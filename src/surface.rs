// Surface manager - swap surface set and its attachments
//
// Owns exactly one live surface set plus one color and one depth attachment
// per presentable image. Recreation never releases anything inline: the
// outgoing attachments and surface set are handed to a destruction bank.

use anyhow::{Context, Result};
use glam::UVec2;

use crate::backend::{AttachmentKind, Gpu, PresentMode, SurfaceCapabilities, SurfaceInfo};
use crate::destruction::{DestructionQueues, ImageRelease, Retired};

/// Upper bound for both presentation depth and presentable image count
pub const MAX_PRESENTATION_DEPTH: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceState {
    Stable,
    Recreating,
}

/// What the application asks for; the platform decides what it gets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfacePreferences {
    pub present_mode: PresentMode,
    pub presentation_depth: usize,
    /// Used only when the surface lets the swapchain pick its size
    pub requested_extent: UVec2,
}

/// Pick extent, image count and present mode from what the surface supports
pub fn select_surface(caps: &SurfaceCapabilities, prefs: &SurfacePreferences) -> SurfaceInfo {
    let extent = caps
        .current_extent
        .unwrap_or_else(|| prefs.requested_extent.clamp(caps.min_extent, caps.max_extent));

    let mut image_count = (caps.min_image_count + 1)
        .min(MAX_PRESENTATION_DEPTH as u32)
        .max(prefs.presentation_depth as u32)
        .max(caps.min_image_count);
    if caps.max_image_count > 0 {
        image_count = image_count.min(caps.max_image_count);
    }

    let supports = |mode: PresentMode| caps.present_modes.contains(&mode);
    let present_mode = if supports(prefs.present_mode) {
        prefs.present_mode
    } else if image_count >= 3 && supports(PresentMode::Mailbox) {
        PresentMode::Mailbox
    } else {
        // FIFO is guaranteed to be available
        PresentMode::Fifo
    };

    SurfaceInfo { extent, image_count, present_mode }
}

/// A color or depth render target sized to the surface
pub struct Attachment<G: Gpu> {
    pub kind: AttachmentKind,
    pub image: G::Image,
    pub view: G::ImageView,
}

impl<G: Gpu> From<Attachment<G>> for Retired<G> {
    fn from(attachment: Attachment<G>) -> Self {
        Retired::Image(ImageRelease {
            image: attachment.image,
            view: Some(attachment.view),
            sampler: None,
        })
    }
}

pub struct SurfaceManager<G: Gpu> {
    state: SurfaceState,
    preferences: SurfacePreferences,
    info: Option<SurfaceInfo>,
    minimized: bool,
    color: Vec<Attachment<G>>,
    depth: Vec<Attachment<G>>,
    set: Option<G::SurfaceSet>,
}

impl<G: Gpu> SurfaceManager<G> {
    /// An empty manager. The first `recreate` builds the surface set.
    pub fn new(preferences: SurfacePreferences) -> Self {
        Self {
            state: SurfaceState::Stable,
            preferences,
            info: None,
            minimized: false,
            color: Vec::new(),
            depth: Vec::new(),
            set: None,
        }
    }

    pub fn state(&self) -> SurfaceState {
        self.state
    }

    pub fn info(&self) -> Option<SurfaceInfo> {
        self.info
    }

    /// Size of the presentable area, zero before the first build
    pub fn extent(&self) -> UVec2 {
        self.info.map(|info| info.extent).unwrap_or(UVec2::ZERO)
    }

    /// The surface reports a zero-sized area (window minimized)
    pub fn is_minimized(&self) -> bool {
        self.minimized
    }

    pub fn surface_set(&self) -> Result<&G::SurfaceSet> {
        self.set.as_ref().context("No live surface set")
    }

    pub fn set_requested_extent(&mut self, extent: UVec2) {
        self.preferences.requested_extent = extent;
    }

    /// Re-query the surface and rebuild when the extent changed.
    ///
    /// Returns whether a rebuild happened. With `force` the rebuild happens
    /// even for an unchanged extent, for surface sets the platform reported
    /// as unusable. Outgoing resources are scheduled into `retired`.
    pub fn recreate(&mut self, gpu: &mut G, retired: &mut DestructionQueues<G>, force: bool) -> Result<bool> {
        let caps = gpu
            .surface_capabilities()
            .context("Failed to query surface capabilities")
            .inspect_err(|e| log::error!("Surface recreation failed: {e:#}"))?;
        let info = select_surface(&caps, &self.preferences);

        if info.extent.x == 0 || info.extent.y == 0 {
            if !self.minimized {
                log::debug!("Surface has zero extent, pausing presentation");
            }
            self.minimized = true;
            return Ok(false);
        }
        self.minimized = false;

        if !force && self.set.is_some() && self.extent() == info.extent {
            return Ok(false);
        }

        self.state = SurfaceState::Recreating;
        self.rebuild(gpu, retired, info)
            .inspect_err(|e| log::error!("Surface recreation failed: {e:#}"))?;
        self.state = SurfaceState::Stable;

        log::info!(
            "Surface set built: {}x{}, {} images, {:?}",
            info.extent.x,
            info.extent.y,
            info.image_count,
            info.present_mode
        );
        Ok(true)
    }

    fn rebuild(&mut self, gpu: &mut G, retired: &mut DestructionQueues<G>, info: SurfaceInfo) -> Result<()> {
        for attachment in self.color.drain(..).chain(self.depth.drain(..)) {
            retired.schedule(attachment);
        }

        for _ in 0..info.image_count {
            self.color.push(Self::create_attachment(gpu, AttachmentKind::Color, info.extent)?);
            self.depth.push(Self::create_attachment(gpu, AttachmentKind::Depth, info.extent)?);
        }

        let color: Vec<G::ImageView> = self.color.iter().map(|a| a.view).collect();
        let depth: Vec<G::ImageView> = self.depth.iter().map(|a| a.view).collect();
        let set = gpu
            .create_surface_set(&info, &color, &depth, self.set.as_ref())
            .context("Failed to create surface set")?;

        if let Some(outgoing) = self.set.replace(set) {
            retired.schedule(Retired::<G>::SurfaceSet(outgoing));
        }
        self.info = Some(info);
        Ok(())
    }

    fn create_attachment(gpu: &mut G, kind: AttachmentKind, extent: UVec2) -> Result<Attachment<G>> {
        let (image, view) = gpu
            .create_attachment(kind, extent)
            .with_context(|| format!("Failed to create {kind:?} attachment"))?;
        Ok(Attachment { kind, image, view })
    }

    /// Release everything immediately. Only valid once the device is idle.
    pub fn destroy(&mut self, gpu: &mut G) {
        if let Some(set) = self.set.take() {
            gpu.release_surface_set(set);
        }
        for attachment in self.color.drain(..).chain(self.depth.drain(..)) {
            gpu.release_image_view(attachment.view);
            gpu.release_image(attachment.image);
        }
        self.info = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::simulated::SimulatedGpu;
    use crate::destruction::ResourceKind;

    fn caps() -> SurfaceCapabilities {
        SurfaceCapabilities {
            current_extent: Some(UVec2::new(800, 600)),
            min_extent: UVec2::new(1, 1),
            max_extent: UVec2::new(4096, 4096),
            min_image_count: 2,
            max_image_count: 8,
            present_modes: vec![PresentMode::Fifo, PresentMode::Mailbox],
        }
    }

    fn prefs(present_mode: PresentMode) -> SurfacePreferences {
        SurfacePreferences {
            present_mode,
            presentation_depth: 2,
            requested_extent: UVec2::new(1280, 720),
        }
    }

    #[test]
    fn selection_prefers_configured_mode() {
        let info = select_surface(&caps(), &prefs(PresentMode::Fifo));
        assert_eq!(info.present_mode, PresentMode::Fifo);
        assert_eq!(info.image_count, 3);
        assert_eq!(info.extent, UVec2::new(800, 600));
    }

    #[test]
    fn selection_falls_back_to_mailbox_then_fifo() {
        let info = select_surface(&caps(), &prefs(PresentMode::Immediate));
        assert_eq!(info.present_mode, PresentMode::Mailbox);

        let mut two_images = caps();
        two_images.max_image_count = 2;
        let info = select_surface(&two_images, &prefs(PresentMode::Immediate));
        assert_eq!(info.image_count, 2);
        assert_eq!(info.present_mode, PresentMode::Fifo);
    }

    #[test]
    fn undefined_extent_uses_clamped_request() {
        let mut caps = caps();
        caps.current_extent = None;
        caps.max_extent = UVec2::new(1024, 1024);
        let info = select_surface(&caps, &prefs(PresentMode::Fifo));
        assert_eq!(info.extent, UVec2::new(1024, 720));
    }

    #[test]
    fn recreation_with_unchanged_extent_is_a_no_op() {
        let mut gpu = SimulatedGpu::new();
        let mut retired = DestructionQueues::new();
        let mut surface = SurfaceManager::new(prefs(PresentMode::Fifo));

        assert!(surface.recreate(&mut gpu, &mut retired, false).unwrap());
        assert!(retired.is_empty());
        let built = gpu.surface_sets_created();

        assert!(!surface.recreate(&mut gpu, &mut retired, false).unwrap());
        assert!(retired.is_empty());
        assert_eq!(gpu.surface_sets_created(), built);
        assert_eq!(surface.state(), SurfaceState::Stable);
    }

    #[test]
    fn resize_retires_attachments_and_outgoing_set() {
        let mut gpu = SimulatedGpu::new();
        let mut retired = DestructionQueues::new();
        let mut surface = SurfaceManager::new(prefs(PresentMode::Fifo));
        surface.recreate(&mut gpu, &mut retired, false).unwrap();
        let images = surface.info().unwrap().image_count as usize;

        gpu.set_surface_extent(UVec2::new(640, 480));
        assert!(surface.recreate(&mut gpu, &mut retired, false).unwrap());

        assert_eq!(retired.pending(ResourceKind::SurfaceSet), 1);
        assert_eq!(retired.pending(ResourceKind::Image), images * 2);
        assert_eq!(surface.extent(), UVec2::new(640, 480));
        assert!(gpu.releases().is_empty());
    }

    #[test]
    fn zero_extent_pauses_without_rebuilding() {
        let mut gpu = SimulatedGpu::new();
        let mut retired = DestructionQueues::new();
        let mut surface = SurfaceManager::new(prefs(PresentMode::Fifo));
        surface.recreate(&mut gpu, &mut retired, false).unwrap();

        gpu.set_surface_extent(UVec2::new(0, 600));
        assert!(!surface.recreate(&mut gpu, &mut retired, false).unwrap());
        assert!(surface.is_minimized());
        assert!(retired.is_empty());

        gpu.set_surface_extent(UVec2::new(800, 600));
        assert!(!surface.recreate(&mut gpu, &mut retired, false).unwrap());
        assert!(!surface.is_minimized());
    }
}
