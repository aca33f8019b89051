// Frame cursor
//
// Which presentable image was acquired, which slot is being filled, which
// slot was filled one presentation ago, and how many frames were presented.
// `frame_index == absolute_frame % depth` holds between protocol steps.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCursor {
    depth: usize,
    image_index: u32,
    frame_index: usize,
    previous_frame: usize,
    absolute_frame: u64,
}

impl FrameCursor {
    pub fn new(depth: usize) -> Self {
        assert!(depth > 0, "presentation depth must be non-zero");
        Self {
            depth,
            image_index: 0,
            frame_index: 0,
            previous_frame: 0,
            absolute_frame: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Slot the next acquire signals into
    pub fn acquire_slot(&self) -> usize {
        (self.absolute_frame % self.depth as u64) as usize
    }

    pub fn set_image_index(&mut self, image_index: u32) {
        self.image_index = image_index;
    }

    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    pub fn previous_frame(&self) -> usize {
        self.previous_frame
    }

    pub fn absolute_frame(&self) -> u64 {
        self.absolute_frame
    }

    /// Step 8 of the frame: move on to the next slot
    pub fn advance(&mut self) {
        self.previous_frame = self.frame_index;
        self.frame_index = (self.frame_index + 1) % self.depth;
        self.absolute_frame += 1;
        debug_assert_eq!(self.frame_index, self.acquire_slot());
    }
}
