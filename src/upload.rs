// Resource upload path
//
// Texture and buffer uploads are staged into the current frame slot's scratch
// buffer and recorded into that slot's transfer command list. Nothing here
// submits: the synchronization protocol submits the transfer list once per
// frame (or `Renderer::first_transfer` at startup).

use glam::UVec2;

use crate::backend::Gpu;

/// Every staging reservation starts on this boundary
pub const STAGING_ALIGNMENT: u64 = 16;

/// Round `value` up to the next multiple of `alignment` (a power of two)
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

// =============================================================================
// STAGING CURSOR
// =============================================================================

/// Per-slot write offset into a fixed-size upload scratch buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingCursor {
    offset: u64,
    capacity: u64,
}

impl StagingCursor {
    pub fn new(capacity: u64) -> Self {
        Self { offset: 0, capacity }
    }

    /// Reserve `size` bytes at the next aligned offset.
    ///
    /// Returns `None` (and leaves the cursor untouched) when the scratch
    /// buffer cannot fit the request.
    pub fn reserve(&mut self, size: u64) -> Option<u64> {
        let start = align_up(self.offset, STAGING_ALIGNMENT);
        let end = start.checked_add(size)?;
        if end > self.capacity {
            return None;
        }
        self.offset = end;
        Some(start)
    }

    /// Give back everything reserved after `offset`, a value previously
    /// returned by `offset()`
    pub fn rewind(&mut self, offset: u64) {
        debug_assert!(offset <= self.offset);
        self.offset = offset.min(self.offset);
    }

    /// Contents only need to survive until the transfer completes
    pub fn reset(&mut self) {
        self.offset = 0;
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

// =============================================================================
// TEXTURE DESCRIPTION
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Srgb,
    Rgba8Unorm,
    Bgra8Srgb,
    R8Unorm,
}

impl TextureFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            TextureFormat::Rgba8Srgb | TextureFormat::Rgba8Unorm | TextureFormat::Bgra8Srgb => 4,
            TextureFormat::R8Unorm => 1,
        }
    }
}

/// Destination image of a texture upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub format: TextureFormat,
}

impl TextureDesc {
    pub fn new(width: u32, height: u32, format: TextureFormat) -> Self {
        Self { width, height, mip_levels: 1, format }
    }

    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels.clamp(1, full_mip_chain_length(self.extent()));
        self
    }

    /// Every level down to 1x1
    pub fn with_full_mip_chain(mut self) -> Self {
        self.mip_levels = full_mip_chain_length(self.extent());
        self
    }

    pub fn extent(&self) -> UVec2 {
        UVec2::new(self.width, self.height)
    }

    /// Size of the base level pixel data
    pub fn byte_size(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.format.bytes_per_pixel() as u64
    }

    pub fn has_mip_chain(&self) -> bool {
        self.mip_levels > 1
    }

    /// Extent of `level`, halving each axis per level with a minimum of 1
    pub fn mip_extent(&self, level: u32) -> UVec2 {
        mip_extent(self.extent(), level)
    }
}

pub fn mip_extent(base: UVec2, level: u32) -> UVec2 {
    let shift = level.min(31);
    (base >> shift).max(UVec2::ONE)
}

pub fn full_mip_chain_length(extent: UVec2) -> u32 {
    32 - extent.max_element().max(1).leading_zeros()
}

// =============================================================================
// SAMPLER CONFIGURATION
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FilterMode {
    Nearest,
    #[default]
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MipmapMode {
    Nearest,
    #[default]
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EdgeMode {
    #[default]
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SamplerConfig {
    pub filter: FilterMode,
    pub mipmap_mode: MipmapMode,
    pub edge: EdgeMode,
}

// =============================================================================
// TRANSFER COMMANDS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    Undefined,
    TransferDst,
    TransferSrc,
    ShaderReadOnly,
}

/// Layout transition (plus the memory dependency it implies) over a mip range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
    pub base_mip_level: u32,
    pub level_count: u32,
}

impl ImageBarrier {
    pub fn levels(old_layout: ImageLayout, new_layout: ImageLayout, base_mip_level: u32, level_count: u32) -> Self {
        Self { old_layout, new_layout, base_mip_level, level_count }
    }

    pub fn level(old_layout: ImageLayout, new_layout: ImageLayout, mip_level: u32) -> Self {
        Self::levels(old_layout, new_layout, mip_level, 1)
    }
}

/// One command of a recorded texture upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOp {
    Barrier(ImageBarrier),
    /// Staging buffer → mip level 0
    CopyBufferToImage { buffer_offset: u64, extent: UVec2 },
    /// Downsample `src_level` into `dst_level` with linear filtering
    Blit { src_level: u32, src_extent: UVec2, dst_level: u32, dst_extent: UVec2 },
}

/// Buffer → buffer copy region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

/// Build the command sequence uploading `desc` from `staging_offset`.
///
/// Single level: transfer-dst, copy, shader-read.
/// Mip chain: transfer-dst, copy, then per level `i` in `1..levels` a
/// transfer-src barrier on `i - 1`, a blit `i - 1 → i` and a shader-read
/// barrier on `i - 1`, finishing with a shader-read barrier on the last level.
pub fn plan_texture_upload(desc: &TextureDesc, staging_offset: u64) -> Vec<TransferOp> {
    let levels = desc.mip_levels.max(1);
    let mut ops = Vec::with_capacity(3 + 3 * (levels as usize - 1) + 1);

    ops.push(TransferOp::Barrier(ImageBarrier::levels(
        ImageLayout::Undefined,
        ImageLayout::TransferDst,
        0,
        levels,
    )));
    ops.push(TransferOp::CopyBufferToImage {
        buffer_offset: staging_offset,
        extent: desc.extent(),
    });

    if levels == 1 {
        ops.push(TransferOp::Barrier(ImageBarrier::level(
            ImageLayout::TransferDst,
            ImageLayout::ShaderReadOnly,
            0,
        )));
        return ops;
    }

    // Copy must land before level 0 is read back by the first blit
    ops.push(TransferOp::Barrier(ImageBarrier::levels(
        ImageLayout::TransferDst,
        ImageLayout::TransferDst,
        0,
        levels,
    )));

    for level in 1..levels {
        let src_level = level - 1;
        ops.push(TransferOp::Barrier(ImageBarrier::level(
            ImageLayout::TransferDst,
            ImageLayout::TransferSrc,
            src_level,
        )));
        ops.push(TransferOp::Blit {
            src_level,
            src_extent: desc.mip_extent(src_level),
            dst_level: level,
            dst_extent: desc.mip_extent(level),
        });
        ops.push(TransferOp::Barrier(ImageBarrier::level(
            ImageLayout::TransferSrc,
            ImageLayout::ShaderReadOnly,
            src_level,
        )));
    }

    ops.push(TransferOp::Barrier(ImageBarrier::level(
        ImageLayout::TransferDst,
        ImageLayout::ShaderReadOnly,
        levels - 1,
    )));

    ops
}

// =============================================================================
// UPLOADED TEXTURE
// =============================================================================

/// A texture whose upload has been recorded. Live until retired through
/// `Renderer::schedule_destruction`.
pub struct Texture<G: Gpu> {
    pub image: G::Image,
    pub view: G::ImageView,
    pub sampler: G::Sampler,
    pub desc: TextureDesc,
}

impl<G: Gpu> std::fmt::Debug for Texture<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("image", &self.image)
            .field("view", &self.view)
            .field("sampler", &self.sampler)
            .field("desc", &self.desc)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservations_are_sixteen_byte_aligned() {
        let mut cursor = StagingCursor::new(256);
        assert_eq!(cursor.reserve(3), Some(0));
        assert_eq!(cursor.reserve(5), Some(16));
        assert_eq!(cursor.offset(), 21);
        assert_eq!(cursor.reserve(32), Some(32));
    }

    #[test]
    fn rewind_hands_back_a_failed_reservation() {
        let mut cursor = StagingCursor::new(256);
        cursor.reserve(10).unwrap();
        let mark = cursor.offset();
        assert_eq!(cursor.reserve(100), Some(16));
        cursor.rewind(mark);
        assert_eq!(cursor.offset(), 10);
        assert_eq!(cursor.reserve(100), Some(16));
    }

    #[test]
    fn overflowing_reservation_leaves_cursor_untouched() {
        let mut cursor = StagingCursor::new(64);
        assert_eq!(cursor.reserve(40), Some(0));
        assert_eq!(cursor.reserve(24), None);
        assert_eq!(cursor.offset(), 40);
        cursor.reset();
        assert_eq!(cursor.reserve(64), Some(0));
    }

    #[test]
    fn mip_extents_halve_with_floor_of_one() {
        let desc = TextureDesc::new(64, 4, TextureFormat::Rgba8Srgb).with_full_mip_chain();
        assert_eq!(desc.mip_levels, 7);
        assert_eq!(desc.mip_extent(1), UVec2::new(32, 2));
        assert_eq!(desc.mip_extent(2), UVec2::new(16, 1));
        assert_eq!(desc.mip_extent(6), UVec2::new(1, 1));
    }

    #[test]
    fn requested_mip_levels_are_clamped_to_the_chain() {
        let desc = TextureDesc::new(4, 4, TextureFormat::R8Unorm).with_mip_levels(10);
        assert_eq!(desc.mip_levels, 3);
        assert_eq!(desc.byte_size(), 16);
    }

    #[test]
    fn single_level_upload_goes_straight_to_shader_read() {
        let desc = TextureDesc::new(8, 8, TextureFormat::Rgba8Unorm);
        let ops = plan_texture_upload(&desc, 48);
        assert_eq!(
            ops,
            vec![
                TransferOp::Barrier(ImageBarrier::levels(ImageLayout::Undefined, ImageLayout::TransferDst, 0, 1)),
                TransferOp::CopyBufferToImage { buffer_offset: 48, extent: UVec2::new(8, 8) },
                TransferOp::Barrier(ImageBarrier::level(ImageLayout::TransferDst, ImageLayout::ShaderReadOnly, 0)),
            ]
        );
    }

    #[test]
    fn every_mip_level_ends_shader_readable_exactly_once() {
        let desc = TextureDesc::new(100, 30, TextureFormat::Rgba8Srgb).with_full_mip_chain();
        let ops = plan_texture_upload(&desc, 0);

        for level in 0..desc.mip_levels {
            let to_shader_read = ops
                .iter()
                .filter(|op| {
                    matches!(op, TransferOp::Barrier(b)
                        if b.new_layout == ImageLayout::ShaderReadOnly
                            && b.base_mip_level == level
                            && b.level_count == 1)
                })
                .count();
            assert_eq!(to_shader_read, 1, "level {level}");
        }

        // Each barrier names its own level: nothing is carried over between iterations
        let blit_sources: Vec<u32> = ops
            .iter()
            .filter_map(|op| match op {
                TransferOp::Blit { src_level, .. } => Some(*src_level),
                _ => None,
            })
            .collect();
        assert_eq!(blit_sources, (0..desc.mip_levels - 1).collect::<Vec<_>>());
    }
}
