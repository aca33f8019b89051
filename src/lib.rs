// =============================================================================
// FRAME PIPELINE - Frame pacing and GPU resource lifecycle core
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  Renderer (synchronization protocol, once per frame)            │
// │    ├── FrameContext (cursor + slot table, explicitly owned)     │
// │    ├── SurfaceManager (swap surface set + attachments)          │
// │    ├── DestructionQueues (one bank per frame slot)              │
// │    └── Gpu backend (Vulkan, or the simulated signal clock)      │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Acquire presentable image
// 2. Back-pressure wait on the previous frame's counting signals
// 3. Reclaim retired resources of the slot being reused
// 4. Record (update hooks + uploads, then render work)
// 5. Submit transfer work (if any)
// 6. Submit render work gated on transfer + image availability
// 7. Present
// 8. Advance the frame cursor
//
// =============================================================================

pub mod backend;
pub mod config;
pub mod destruction;
pub mod frame;
pub mod material;
pub mod renderer;
pub mod surface;
pub mod upload;

pub use backend::Gpu;
pub use destruction::{DestructionQueues, ResourceKind, Retired};
pub use renderer::{FrameParticipant, FrameSettings, Renderer};
pub use surface::{SurfaceManager, SurfaceState};
pub use upload::{SamplerConfig, Texture, TextureDesc, TextureFormat};
