// Simulated GPU - deterministic GPU-signal clock
//
// Implements `Gpu` without a device. Submissions complete either immediately
// or only when the host waits for them (in submission order), which makes the
// CPU-ahead-of-GPU window observable. Every interesting call is appended to an
// event log, and protocol hazards are collected as violations instead of
// crashing:
// - releasing a handle twice, or while a pending submission references it
// - resetting command state a pending submission still executes
// - host writes into a buffer a pending submission reads
// - one-shot signals set twice, or waited on without a producer
// - GPU waits on counting values nobody will ever signal
//
// The state sits behind an `Arc<Mutex<..>>` so tests can keep a clone after
// moving the backend into a `Renderer`.

use anyhow::{bail, Result};
use glam::UVec2;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::{
    AcquireOutcome, AttachmentKind, BufferUsage, Gpu, PresentMode, PresentOutcome, SemaphoreSignal,
    SemaphoreWait, SurfaceCapabilities, SurfaceInfo,
};
use crate::material::{DrawCall, DrawKind};
use crate::upload::{BufferCopy, SamplerConfig, TextureDesc, TransferOp};

// =============================================================================
// HANDLES
// =============================================================================

macro_rules! sim_handle {
    ($(#[$meta:meta])* $name:ident, copy) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(u64);

        impl $name {
            pub fn id(&self) -> u64 {
                self.0
            }
        }
    };
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, PartialEq, Eq, Hash)]
        pub struct $name(u64);

        impl $name {
            pub fn id(&self) -> u64 {
                self.0
            }
        }
    };
}

sim_handle!(SimSemaphore, copy);
sim_handle!(SimCommands, copy);
sim_handle!(SimImageView, copy);
sim_handle!(SimSampler, copy);
sim_handle!(SimPipeline, copy);
sim_handle!(SimDescriptorSetLayout, copy);
sim_handle!(SimDescriptorSet, copy);
sim_handle!(
    /// Owned: moved into `release_image` exactly once
    SimImage
);
sim_handle!(
    /// Owned: moved into `release_buffer` exactly once
    SimBuffer
);

#[derive(Debug, PartialEq, Eq)]
pub struct SimSurfaceSet {
    id: u64,
    extent: UVec2,
    image_count: u32,
    color: Vec<u64>,
    depth: Vec<u64>,
}

impl SimSurfaceSet {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn extent(&self) -> UVec2 {
        self.extent
    }

    pub fn image_count(&self) -> u32 {
        self.image_count
    }
}

// =============================================================================
// EVENTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Completion {
    /// Work finishes the moment it is submitted
    Immediate,
    /// Work finishes only when a host wait needs it
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Queue {
    Transfer,
    Render,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReleaseKind {
    SurfaceSet,
    Sampler,
    ImageView,
    Image,
    Buffer,
    Pipeline,
    DescriptorSet,
    DescriptorSetLayout,
    Semaphore,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GpuEvent {
    Acquired { semaphore: u64, image_index: u32 },
    AcquireOutOfDate,
    HostWaitBegin { waits: Vec<(u64, u64)> },
    HostWaitEnd { waits: Vec<(u64, u64)> },
    Submitted {
        submission: u64,
        queue: Queue,
        waits: Vec<(u64, Option<u64>)>,
        signals: Vec<(u64, Option<u64>)>,
    },
    Completed { submission: u64, queue: Queue },
    Presented { image_index: u32, outcome: PresentOutcome },
    Released { kind: ReleaseKind, id: u64 },
    SurfaceSetCreated { id: u64, extent: UVec2, image_count: u32, replaces: Option<u64> },
    CommandsReset { image_index: u32, slot: usize },
    RenderBegun { commands: u64, image_index: u32 },
    ImageUploadRecorded { slot: usize, commands: u64, ops: Vec<TransferOp> },
    BufferUploadRecorded { slot: usize, commands: u64, copy: BufferCopy },
    Draw { commands: u64, kind: DrawKind },
    Idle,
}

// =============================================================================
// STATE
// =============================================================================

struct Submission {
    id: u64,
    queue: Queue,
    signals: Vec<(u64, Option<u64>)>,
    references: Vec<u64>,
    /// Transfer slot whose command state this submission executes
    slot: Option<usize>,
    /// Presentable image whose render commands this submission executes
    image_index: Option<u32>,
}

#[derive(Default)]
struct Counter {
    completed: u64,
    submitted: u64,
}

#[derive(Default)]
struct OneShot {
    signaled: bool,
    /// Submission whose wait consumed the last signal
    waiter: Option<u64>,
}

struct State {
    completion: Completion,
    next_id: u64,
    next_submission: u64,
    events: Vec<GpuEvent>,
    live: HashMap<u64, ReleaseKind>,
    released: Vec<(ReleaseKind, u64)>,
    violations: Vec<String>,
    counting: HashMap<u64, Counter>,
    one_shot: HashMap<u64, OneShot>,
    pending: VecDeque<Submission>,
    command_refs: HashMap<u64, Vec<u64>>,
    transfer_slot: HashMap<u64, usize>,
    render_image: HashMap<u64, u32>,
    capabilities: SurfaceCapabilities,
    acquire_script: VecDeque<AcquireOutcome>,
    present_script: VecDeque<PresentOutcome>,
    next_image: u32,
    buffer_sizes: HashMap<u64, u64>,
    buffer_data: HashMap<u64, Vec<u8>>,
    buffer_writes: usize,
    surface_sets_created: usize,
    /// Creations of a kind still allowed through before one fails
    creation_failures: HashMap<ReleaseKind, usize>,
    submit_failures: Vec<Queue>,
}

impl State {
    fn new(completion: Completion) -> Self {
        Self {
            completion,
            next_id: 1,
            next_submission: 1,
            events: Vec::new(),
            live: HashMap::new(),
            released: Vec::new(),
            violations: Vec::new(),
            counting: HashMap::new(),
            one_shot: HashMap::new(),
            pending: VecDeque::new(),
            command_refs: HashMap::new(),
            transfer_slot: HashMap::new(),
            render_image: HashMap::new(),
            capabilities: SurfaceCapabilities {
                current_extent: Some(UVec2::new(1280, 720)),
                min_extent: UVec2::ONE,
                max_extent: UVec2::splat(16384),
                min_image_count: 2,
                max_image_count: 8,
                present_modes: vec![PresentMode::Fifo, PresentMode::Mailbox, PresentMode::Immediate],
            },
            acquire_script: VecDeque::new(),
            present_script: VecDeque::new(),
            next_image: 0,
            buffer_sizes: HashMap::new(),
            buffer_data: HashMap::new(),
            buffer_writes: 0,
            surface_sets_created: 0,
            creation_failures: HashMap::new(),
            submit_failures: Vec::new(),
        }
    }

    fn allocate(&mut self, kind: Option<ReleaseKind>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        if let Some(kind) = kind {
            self.live.insert(id, kind);
        }
        id
    }

    fn creation_fails(&mut self, kind: ReleaseKind) -> bool {
        match self.creation_failures.get_mut(&kind) {
            Some(0) => {
                self.creation_failures.remove(&kind);
                true
            }
            Some(remaining) => {
                *remaining -= 1;
                false
            }
            None => false,
        }
    }

    fn submit_fails(&mut self, queue: Queue) -> bool {
        match self.submit_failures.iter().position(|q| *q == queue) {
            Some(index) => {
                self.submit_failures.remove(index);
                true
            }
            None => false,
        }
    }

    fn violation(&mut self, message: String) {
        log::error!("simulated gpu: {}", message);
        self.violations.push(message);
    }

    fn referenced_by_pending(&self, id: u64) -> Option<u64> {
        self.pending
            .iter()
            .find(|submission| submission.references.contains(&id))
            .map(|submission| submission.id)
    }

    fn release(&mut self, kind: ReleaseKind, id: u64) {
        if self.live.get(&id) != Some(&kind) {
            self.violation(format!("{kind:?} {id} released but not live"));
            return;
        }
        if let Some(submission) = self.referenced_by_pending(id) {
            self.violation(format!("{kind:?} {id} released while submission {submission} still uses it"));
        }
        self.live.remove(&id);
        self.buffer_sizes.remove(&id);
        self.buffer_data.remove(&id);
        self.released.push((kind, id));
        self.events.push(GpuEvent::Released { kind, id });
    }

    fn complete_next(&mut self) -> bool {
        let Some(submission) = self.pending.pop_front() else {
            return false;
        };
        for (semaphore, value) in &submission.signals {
            if let (Some(value), Some(counter)) = (value, self.counting.get_mut(semaphore)) {
                counter.completed = counter.completed.max(*value);
            }
        }
        self.events.push(GpuEvent::Completed { submission: submission.id, queue: submission.queue });
        true
    }

    fn complete_all(&mut self) {
        while self.complete_next() {}
    }

    fn signal_one_shot(&mut self, semaphore: u64) {
        let pending_waiter = self.one_shot.get(&semaphore).and_then(|state| state.waiter).filter(|waiter| {
            self.pending.iter().any(|submission| submission.id == *waiter)
        });
        let Some(state) = self.one_shot.get_mut(&semaphore) else {
            self.violation(format!("signal on unknown one-shot {semaphore}"));
            return;
        };
        let already_signaled = state.signaled;
        state.signaled = true;
        state.waiter = None;

        if already_signaled {
            self.violation(format!("one-shot {semaphore} signaled twice without a wait"));
        }
        if let Some(waiter) = pending_waiter {
            self.violation(format!("one-shot {semaphore} reused while submission {waiter} still waits on it"));
        }
    }

    fn wait_one_shot(&mut self, semaphore: u64, waiter: Option<u64>) {
        let Some(state) = self.one_shot.get_mut(&semaphore) else {
            self.violation(format!("wait on unknown one-shot {semaphore}"));
            return;
        };
        let was_signaled = state.signaled;
        state.signaled = false;
        state.waiter = waiter;
        if !was_signaled {
            self.violation(format!("wait on one-shot {semaphore} that nobody signaled"));
        }
    }

    fn submit(
        &mut self,
        queue: Queue,
        commands: &[u64],
        waits: &[SemaphoreWait<SimSemaphore>],
        signals: &[SemaphoreSignal<SimSemaphore>],
    ) {
        let id = self.next_submission;
        self.next_submission += 1;

        for wait in waits {
            let semaphore = wait.semaphore.id();
            match wait.value {
                Some(value) => {
                    let submitted = self.counting.get(&semaphore).map(|c| c.submitted).unwrap_or(0);
                    if value > submitted {
                        self.violation(format!(
                            "submission {id} waits on counting {semaphore} >= {value}, only {submitted} was ever submitted"
                        ));
                    }
                }
                None => self.wait_one_shot(semaphore, Some(id)),
            }
        }

        for signal in signals {
            let semaphore = signal.semaphore.id();
            match signal.value {
                Some(value) => {
                    let counter = self.counting.entry(semaphore).or_default();
                    let previous = counter.submitted;
                    counter.submitted = counter.submitted.max(value);
                    if value <= previous {
                        self.violation(format!(
                            "counting {semaphore} signaled to {value} after {previous} was already submitted"
                        ));
                    }
                }
                None => self.signal_one_shot(semaphore),
            }
        }

        let mut references = Vec::new();
        let mut slot = None;
        let mut image_index = None;
        for command in commands {
            references.extend(self.command_refs.remove(command).unwrap_or_default());
            if let Some(s) = self.transfer_slot.remove(command) {
                slot = Some(s);
            }
            if let Some(i) = self.render_image.remove(command) {
                image_index = Some(i);
            }
        }

        self.events.push(GpuEvent::Submitted {
            submission: id,
            queue,
            waits: waits.iter().map(|w| (w.semaphore.id(), w.value)).collect(),
            signals: signals.iter().map(|s| (s.semaphore.id(), s.value)).collect(),
        });
        self.pending.push_back(Submission {
            id,
            queue,
            signals: signals.iter().map(|s| (s.semaphore.id(), s.value)).collect(),
            references,
            slot,
            image_index,
        });

        if self.completion == Completion::Immediate {
            self.complete_all();
        }
    }

    fn new_commands(&mut self, references: Vec<u64>) -> u64 {
        let id = self.allocate(None);
        self.command_refs.insert(id, references);
        id
    }
}

// =============================================================================
// SIMULATED GPU
// =============================================================================

#[derive(Clone)]
pub struct SimulatedGpu {
    state: Arc<Mutex<State>>,
}

impl Default for SimulatedGpu {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedGpu {
    /// Every submission completes as soon as it is made
    pub fn new() -> Self {
        Self::with_completion(Completion::Immediate)
    }

    /// Submissions complete only when a host wait requires them
    pub fn deferred() -> Self {
        Self::with_completion(Completion::Deferred)
    }

    pub fn with_completion(completion: Completion) -> Self {
        Self { state: Arc::new(Mutex::new(State::new(completion))) }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // SCRIPTING
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_surface_extent(&self, extent: UVec2) {
        self.state.lock().capabilities.current_extent = Some(extent);
    }

    pub fn set_capabilities(&self, capabilities: SurfaceCapabilities) {
        self.state.lock().capabilities = capabilities;
    }

    /// Outcome of an upcoming acquire, consumed in order
    pub fn push_acquire_outcome(&self, outcome: AcquireOutcome) {
        self.state.lock().acquire_script.push_back(outcome);
    }

    /// Outcome of an upcoming present, consumed in order
    pub fn push_present_outcome(&self, outcome: PresentOutcome) {
        self.state.lock().present_script.push_back(outcome);
    }

    /// Let `successes` more creations of `kind` through, then fail the next one
    pub fn fail_creation(&self, kind: ReleaseKind, successes: usize) {
        self.state.lock().creation_failures.insert(kind, successes);
    }

    /// The next submission to `queue` reports a lost device
    pub fn fail_next_submit(&self, queue: Queue) {
        self.state.lock().submit_failures.push(queue);
    }

    /// Finish the oldest pending submission. Returns false when nothing is pending.
    pub fn complete_next(&self) -> bool {
        self.state.lock().complete_next()
    }

    pub fn complete_all(&self) {
        self.state.lock().complete_all();
    }

    /// Make `commands` reference a handle, as a draw reading it would
    pub fn touch(&self, commands: SimCommands, id: u64) {
        self.state.lock().command_refs.entry(commands.id()).or_default().push(id);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // COLLABORATOR OBJECTS (built outside the frame core)
    // ─────────────────────────────────────────────────────────────────────────

    pub fn create_pipeline(&self, name: &str) -> SimPipeline {
        let id = self.state.lock().allocate(Some(ReleaseKind::Pipeline));
        log::trace!("simulated pipeline {} = {}", name, id);
        SimPipeline(id)
    }

    pub fn create_descriptor_set_layout(&self, name: &str) -> SimDescriptorSetLayout {
        let id = self.state.lock().allocate(Some(ReleaseKind::DescriptorSetLayout));
        log::trace!("simulated descriptor set layout {} = {}", name, id);
        SimDescriptorSetLayout(id)
    }

    pub fn create_descriptor_set(&self, _layout: SimDescriptorSetLayout) -> SimDescriptorSet {
        SimDescriptorSet(self.state.lock().allocate(Some(ReleaseKind::DescriptorSet)))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // INSPECTION
    // ─────────────────────────────────────────────────────────────────────────

    pub fn events(&self) -> Vec<GpuEvent> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    pub fn releases(&self) -> Vec<(ReleaseKind, u64)> {
        self.state.lock().released.clone()
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    pub fn pending_submissions(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_live(&self, id: u64) -> bool {
        self.state.lock().live.contains_key(&id)
    }

    pub fn live_count(&self, kind: ReleaseKind) -> usize {
        self.state.lock().live.values().filter(|live| **live == kind).count()
    }

    pub fn counting_value(&self, semaphore: SimSemaphore) -> u64 {
        self.state.lock().counting.get(&semaphore.id()).map(|c| c.completed).unwrap_or(0)
    }

    pub fn buffer_contents(&self, buffer: &SimBuffer) -> Vec<u8> {
        self.state.lock().buffer_data.get(&buffer.id()).cloned().unwrap_or_default()
    }

    /// Number of host writes into buffers so far
    pub fn buffer_writes(&self) -> usize {
        self.state.lock().buffer_writes
    }

    pub fn surface_sets_created(&self) -> usize {
        self.state.lock().surface_sets_created
    }
}

impl Gpu for SimulatedGpu {
    type Semaphore = SimSemaphore;
    type CommandList = SimCommands;
    type Image = SimImage;
    type ImageView = SimImageView;
    type Sampler = SimSampler;
    type Buffer = SimBuffer;
    type Pipeline = SimPipeline;
    type DescriptorSetLayout = SimDescriptorSetLayout;
    type DescriptorSet = SimDescriptorSet;
    type SurfaceSet = SimSurfaceSet;

    // ─────────────────────────────────────────────────────────────────────────
    // SYNCHRONIZATION
    // ─────────────────────────────────────────────────────────────────────────

    fn create_one_shot(&mut self, _name: &str) -> Result<SimSemaphore> {
        let mut state = self.state.lock();
        let id = state.allocate(Some(ReleaseKind::Semaphore));
        state.one_shot.insert(id, OneShot::default());
        Ok(SimSemaphore(id))
    }

    fn create_counting(&mut self, _name: &str) -> Result<SimSemaphore> {
        let mut state = self.state.lock();
        let id = state.allocate(Some(ReleaseKind::Semaphore));
        state.counting.insert(id, Counter::default());
        Ok(SimSemaphore(id))
    }

    fn destroy_semaphore(&mut self, semaphore: SimSemaphore) {
        self.state.lock().release(ReleaseKind::Semaphore, semaphore.id());
    }

    fn wait_for_values(&mut self, waits: &[(SimSemaphore, u64)]) -> Result<()> {
        let mut state = self.state.lock();
        let waits: Vec<(u64, u64)> = waits.iter().map(|(s, v)| (s.id(), *v)).collect();
        state.events.push(GpuEvent::HostWaitBegin { waits: waits.clone() });

        for &(semaphore, value) in &waits {
            loop {
                let completed = state.counting.get(&semaphore).map(|c| c.completed).unwrap_or(0);
                if completed >= value {
                    break;
                }
                if !state.complete_next() {
                    bail!("GPU hang: counting {} stuck at {}, waiting for {}", semaphore, completed, value);
                }
            }
        }

        state.events.push(GpuEvent::HostWaitEnd { waits });
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.complete_all();
        state.events.push(GpuEvent::Idle);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // SURFACE
    // ─────────────────────────────────────────────────────────────────────────

    fn surface_capabilities(&mut self) -> Result<SurfaceCapabilities> {
        Ok(self.state.lock().capabilities.clone())
    }

    fn create_attachment(&mut self, _kind: AttachmentKind, _extent: UVec2) -> Result<(SimImage, SimImageView)> {
        let mut state = self.state.lock();
        let image = state.allocate(Some(ReleaseKind::Image));
        let view = state.allocate(Some(ReleaseKind::ImageView));
        Ok((SimImage(image), SimImageView(view)))
    }

    fn create_surface_set(
        &mut self,
        info: &SurfaceInfo,
        color: &[SimImageView],
        depth: &[SimImageView],
        previous: Option<&SimSurfaceSet>,
    ) -> Result<SimSurfaceSet> {
        if color.is_empty() || color.len() != depth.len() {
            bail!("surface set needs matching color and depth attachments");
        }
        let mut state = self.state.lock();
        let id = state.allocate(Some(ReleaseKind::SurfaceSet));
        state.surface_sets_created += 1;
        state.events.push(GpuEvent::SurfaceSetCreated {
            id,
            extent: info.extent,
            image_count: info.image_count,
            replaces: previous.map(|set| set.id),
        });
        Ok(SimSurfaceSet {
            id,
            extent: info.extent,
            image_count: info.image_count,
            color: color.iter().map(|v| v.id()).collect(),
            depth: depth.iter().map(|v| v.id()).collect(),
        })
    }

    fn acquire_next_image(&mut self, set: &SimSurfaceSet, signal: SimSemaphore) -> Result<AcquireOutcome> {
        let mut state = self.state.lock();
        if !state.live.contains_key(&set.id) {
            state.violation(format!("acquire from released surface set {}", set.id));
        }

        let outcome = match state.acquire_script.pop_front() {
            Some(outcome) => outcome,
            None => {
                let image_index = state.next_image % set.image_count;
                state.next_image = state.next_image.wrapping_add(1);
                AcquireOutcome::Acquired { image_index, suboptimal: false }
            }
        };

        match outcome {
            AcquireOutcome::Acquired { image_index, .. } => {
                state.signal_one_shot(signal.id());
                state.events.push(GpuEvent::Acquired { semaphore: signal.id(), image_index });
            }
            AcquireOutcome::OutOfDate => state.events.push(GpuEvent::AcquireOutOfDate),
        }
        Ok(outcome)
    }

    fn present(&mut self, set: &SimSurfaceSet, image_index: u32, wait: SimSemaphore) -> Result<PresentOutcome> {
        let mut state = self.state.lock();
        if !state.live.contains_key(&set.id) {
            state.violation(format!("present to released surface set {}", set.id));
        }
        state.wait_one_shot(wait.id(), None);
        let outcome = state.present_script.pop_front().unwrap_or(PresentOutcome::Presented);
        state.events.push(GpuEvent::Presented { image_index, outcome });
        Ok(outcome)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // COMMANDS
    // ─────────────────────────────────────────────────────────────────────────

    fn reset_commands(&mut self, image_index: u32, slot: usize) -> Result<()> {
        let mut state = self.state.lock();
        let busy = state
            .pending
            .iter()
            .find(|s| s.image_index == Some(image_index) || s.slot == Some(slot))
            .map(|s| s.id);
        if let Some(submission) = busy {
            state.violation(format!(
                "commands of image {image_index} / slot {slot} reset while submission {submission} executes them"
            ));
        }
        state.events.push(GpuEvent::CommandsReset { image_index, slot });
        Ok(())
    }

    fn begin_render(&mut self, set: &SimSurfaceSet, image_index: u32) -> Result<SimCommands> {
        if image_index >= set.image_count {
            bail!("image {} out of range for a {} image surface set", image_index, set.image_count);
        }
        let attachment = image_index as usize % set.color.len();
        let mut state = self.state.lock();
        let commands = state.new_commands(vec![set.id, set.color[attachment], set.depth[attachment]]);
        state.render_image.insert(commands, image_index);
        state.events.push(GpuEvent::RenderBegun { commands, image_index });
        Ok(SimCommands(commands))
    }

    fn end_render(&mut self, _commands: SimCommands) -> Result<()> {
        Ok(())
    }

    fn record_draw(&self, commands: SimCommands, draw: &DrawCall<'_, Self>) -> Result<()> {
        let mut state = self.state.lock();
        let refs = state.command_refs.entry(commands.id()).or_default();
        refs.push(draw.pipeline.id());
        refs.extend(draw.vertex_buffers.iter().map(|(buffer, _)| buffer.id()));
        refs.extend(draw.index_buffer.iter().map(|(buffer, _)| buffer.id()));
        state.events.push(GpuEvent::Draw { commands: commands.id(), kind: draw.kind });
        Ok(())
    }

    fn record_image_upload(
        &mut self,
        slot: usize,
        staging: &SimBuffer,
        image: &SimImage,
        ops: &[TransferOp],
    ) -> Result<SimCommands> {
        let mut state = self.state.lock();
        let commands = state.new_commands(vec![staging.id(), image.id()]);
        state.transfer_slot.insert(commands, slot);
        state.events.push(GpuEvent::ImageUploadRecorded { slot, commands, ops: ops.to_vec() });
        Ok(SimCommands(commands))
    }

    fn record_buffer_upload(
        &mut self,
        slot: usize,
        staging: &SimBuffer,
        destination: &SimBuffer,
        copy: BufferCopy,
    ) -> Result<SimCommands> {
        let mut state = self.state.lock();
        let size = state.buffer_sizes.get(&destination.id()).copied().unwrap_or(0);
        if copy.dst_offset + copy.size > size {
            bail!("copy of {} bytes at {} overflows buffer {}", copy.size, copy.dst_offset, destination.id());
        }
        let commands = state.new_commands(vec![staging.id(), destination.id()]);
        state.transfer_slot.insert(commands, slot);
        state.events.push(GpuEvent::BufferUploadRecorded { slot, commands, copy });
        Ok(SimCommands(commands))
    }

    fn submit_transfer(&mut self, commands: &[SimCommands], signal: SemaphoreSignal<SimSemaphore>) -> Result<()> {
        let ids: Vec<u64> = commands.iter().map(|c| c.id()).collect();
        let mut state = self.state.lock();
        if state.submit_fails(Queue::Transfer) {
            bail!("transfer queue lost");
        }
        state.submit(Queue::Transfer, &ids, &[], &[signal]);
        Ok(())
    }

    fn submit_render(
        &mut self,
        commands: SimCommands,
        waits: &[SemaphoreWait<SimSemaphore>],
        signals: &[SemaphoreSignal<SimSemaphore>],
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.submit_fails(Queue::Render) {
            bail!("render queue lost");
        }
        state.submit(Queue::Render, &[commands.id()], waits, signals);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // RESOURCES
    // ─────────────────────────────────────────────────────────────────────────

    fn create_buffer(&mut self, _usage: BufferUsage, size: u64, name: &str) -> Result<SimBuffer> {
        let mut state = self.state.lock();
        if state.creation_fails(ReleaseKind::Buffer) {
            bail!("out of device memory for {name}");
        }
        let id = state.allocate(Some(ReleaseKind::Buffer));
        state.buffer_sizes.insert(id, size);
        Ok(SimBuffer(id))
    }

    fn write_buffer(&mut self, buffer: &SimBuffer, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let id = buffer.id();
        let size = state.buffer_sizes.get(&id).copied().unwrap_or(0);
        let end = offset + data.len() as u64;
        if end > size {
            bail!("write of {} bytes at {} overflows buffer {} ({} bytes)", data.len(), offset, id, size);
        }
        if let Some(submission) = state.referenced_by_pending(id) {
            state.violation(format!("host write into buffer {id} while submission {submission} reads it"));
        }

        let contents = state.buffer_data.entry(id).or_default();
        if contents.len() < end as usize {
            contents.resize(end as usize, 0);
        }
        contents[offset as usize..end as usize].copy_from_slice(data);
        state.buffer_writes += 1;
        Ok(())
    }

    fn create_texture_image(&mut self, _desc: &TextureDesc) -> Result<SimImage> {
        let mut state = self.state.lock();
        if state.creation_fails(ReleaseKind::Image) {
            bail!("out of device memory for image");
        }
        Ok(SimImage(state.allocate(Some(ReleaseKind::Image))))
    }

    fn create_texture_view(&mut self, _image: &SimImage, _desc: &TextureDesc) -> Result<SimImageView> {
        let mut state = self.state.lock();
        if state.creation_fails(ReleaseKind::ImageView) {
            bail!("image view creation failed");
        }
        Ok(SimImageView(state.allocate(Some(ReleaseKind::ImageView))))
    }

    fn create_sampler(&mut self, _config: &SamplerConfig, _mip_levels: u32) -> Result<SimSampler> {
        let mut state = self.state.lock();
        if state.creation_fails(ReleaseKind::Sampler) {
            bail!("sampler creation failed");
        }
        Ok(SimSampler(state.allocate(Some(ReleaseKind::Sampler))))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // RELEASE
    // ─────────────────────────────────────────────────────────────────────────

    fn release_surface_set(&mut self, set: SimSurfaceSet) {
        self.state.lock().release(ReleaseKind::SurfaceSet, set.id);
    }

    fn release_sampler(&mut self, sampler: SimSampler) {
        self.state.lock().release(ReleaseKind::Sampler, sampler.id());
    }

    fn release_image_view(&mut self, view: SimImageView) {
        self.state.lock().release(ReleaseKind::ImageView, view.id());
    }

    fn release_image(&mut self, image: SimImage) {
        self.state.lock().release(ReleaseKind::Image, image.id());
    }

    fn release_buffer(&mut self, buffer: SimBuffer) {
        self.state.lock().release(ReleaseKind::Buffer, buffer.id());
    }

    fn release_pipeline(&mut self, pipeline: SimPipeline) {
        self.state.lock().release(ReleaseKind::Pipeline, pipeline.id());
    }

    fn release_descriptor_set(&mut self, set: SimDescriptorSet) {
        self.state.lock().release(ReleaseKind::DescriptorSet, set.id());
    }

    fn release_descriptor_set_layout(&mut self, layout: SimDescriptorSetLayout) {
        self.state.lock().release(ReleaseKind::DescriptorSetLayout, layout.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deferred_work_completes_in_submission_order_on_wait() {
        let mut gpu = SimulatedGpu::deferred();
        let first = gpu.create_counting("first").unwrap();
        let second = gpu.create_counting("second").unwrap();
        let commands = SimCommands(gpu.state.lock().new_commands(Vec::new()));
        gpu.submit_transfer(&[commands], SemaphoreSignal::counting(first, 1)).unwrap();
        let commands = SimCommands(gpu.state.lock().new_commands(Vec::new()));
        gpu.submit_transfer(&[commands], SemaphoreSignal::counting(second, 1)).unwrap();

        assert_eq!(gpu.pending_submissions(), 2);
        gpu.wait_for_values(&[(second, 1)]).unwrap();
        assert_eq!(gpu.counting_value(first), 1);
        assert_eq!(gpu.pending_submissions(), 0);
    }

    #[test]
    fn waiting_for_a_value_nobody_signals_is_a_hang() {
        let mut gpu = SimulatedGpu::deferred();
        let signal = gpu.create_counting("never").unwrap();
        assert!(gpu.wait_for_values(&[(signal, 1)]).is_err());
        assert!(gpu.wait_for_values(&[(signal, 0)]).is_ok());
    }

    #[test]
    fn release_while_referenced_is_a_violation() {
        let mut gpu = SimulatedGpu::deferred();
        let signal = gpu.create_counting("transfer").unwrap();
        let buffer = gpu.create_buffer(BufferUsage::Vertex, 16, "vertices").unwrap();
        let staging = gpu.create_buffer(BufferUsage::Staging, 16, "staging").unwrap();
        let copy = BufferCopy { src_offset: 0, dst_offset: 0, size: 16 };
        let commands = gpu.record_buffer_upload(0, &staging, &buffer, copy).unwrap();
        gpu.submit_transfer(&[commands], SemaphoreSignal::counting(signal, 1)).unwrap();

        gpu.release_buffer(buffer);
        assert_eq!(gpu.violations().len(), 1);

        gpu.complete_all();
        gpu.release_buffer(staging);
        assert_eq!(gpu.violations().len(), 1);
    }

    #[test]
    fn double_release_is_a_violation() {
        let mut gpu = SimulatedGpu::new();
        let pipeline = gpu.create_pipeline("pipeline");
        gpu.release_pipeline(pipeline);
        gpu.release_pipeline(pipeline);
        assert_eq!(gpu.violations().len(), 1);
    }

    #[test]
    fn one_shot_must_be_signaled_before_it_is_waited_on() {
        let mut gpu = SimulatedGpu::new();
        let image_acquired = gpu.create_one_shot("acquired").unwrap();
        let commands = SimCommands(gpu.state.lock().new_commands(Vec::new()));
        gpu.submit_render(
            commands,
            &[SemaphoreWait::one_shot(image_acquired, super::super::WaitStage::ColorAttachmentOutput)],
            &[],
        )
        .unwrap();
        assert_eq!(gpu.violations().len(), 1);
    }
}
