// Frame protocol tests
//
// Drive the renderer over the simulated GPU and check the protocol through
// the event log it records: slot rotation, back-pressure ordering, deferred
// release timing, upload command shape and surface recreation.

use anyhow::Result;
use glam::UVec2;

use frame_pipeline::backend::simulated::{GpuEvent, Queue, ReleaseKind, SimulatedGpu};
use frame_pipeline::backend::{AcquireOutcome, BufferUsage, Gpu, PresentOutcome};
use frame_pipeline::upload::{ImageLayout, TransferOp};
use frame_pipeline::{
    FrameParticipant, FrameSettings, Renderer, ResourceKind, Retired, SamplerConfig, Texture,
    TextureDesc, TextureFormat,
};

// =============================================================================
// HELPERS
// =============================================================================

fn init_logging() {
    let _ = env_logger::Builder::new()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

fn settings(depth: usize, staging: u64) -> FrameSettings {
    FrameSettings {
        presentation_depth: depth,
        staging_buffer_size: staging,
        ..FrameSettings::default()
    }
}

/// Renderer plus a handle onto the same simulated GPU for inspection
fn renderer_with(gpu: SimulatedGpu, depth: usize) -> (Renderer<SimulatedGpu>, SimulatedGpu) {
    init_logging();
    let renderer = Renderer::new(gpu.clone(), settings(depth, 64 * 1024)).unwrap();
    (renderer, gpu)
}

/// Participant running a closure as its update hook and recording nothing
struct Hook<F>(F);

fn hook<F>(f: F) -> Hook<F>
where
    F: FnMut(&mut Renderer<SimulatedGpu>) -> Result<()>,
{
    Hook(f)
}

impl<F> FrameParticipant<SimulatedGpu> for Hook<F>
where
    F: FnMut(&mut Renderer<SimulatedGpu>) -> Result<()>,
{
    fn update(&mut self, renderer: &mut Renderer<SimulatedGpu>) -> Result<()> {
        (self.0)(renderer)
    }

    fn render(
        &mut self,
        _renderer: &Renderer<SimulatedGpu>,
        _commands: <SimulatedGpu as Gpu>::CommandList,
    ) -> Result<()> {
        Ok(())
    }
}

/// Participant whose render hook always fails
struct FailingRender;

impl FrameParticipant<SimulatedGpu> for FailingRender {
    fn render(
        &mut self,
        _renderer: &Renderer<SimulatedGpu>,
        _commands: <SimulatedGpu as Gpu>::CommandList,
    ) -> Result<()> {
        anyhow::bail!("render hook failed")
    }
}

fn checkerboard(desc: &TextureDesc) -> Vec<u8> {
    vec![0x7f; desc.byte_size() as usize]
}

fn upload(renderer: &mut Renderer<SimulatedGpu>, desc: &TextureDesc) -> Result<Texture<SimulatedGpu>> {
    renderer.upload_texture(desc, &checkerboard(desc), &SamplerConfig::default())
}

fn position(events: &[GpuEvent], matches: impl Fn(&GpuEvent) -> bool) -> Option<usize> {
    events.iter().position(matches)
}

fn count(events: &[GpuEvent], matches: impl Fn(&GpuEvent) -> bool) -> usize {
    events.iter().filter(|e| matches(*e)).count()
}

fn render_submissions(events: &[GpuEvent]) -> Vec<Vec<(u64, Option<u64>)>> {
    events
        .iter()
        .filter_map(|e| match e {
            GpuEvent::Submitted { queue: Queue::Render, waits, .. } => Some(waits.clone()),
            _ => None,
        })
        .collect()
}

fn current_surface_set(events: &[GpuEvent]) -> Option<u64> {
    events.iter().rev().find_map(|e| match e {
        GpuEvent::SurfaceSetCreated { id, .. } => Some(*id),
        _ => None,
    })
}

// =============================================================================
// SLOT ROTATION
// =============================================================================

#[test]
fn slots_rotate_with_depth_two() {
    let (mut renderer, gpu) = renderer_with(SimulatedGpu::new(), 2);

    let mut slots = Vec::new();
    for _ in 0..5 {
        slots.push(renderer.current_frame_slot());
        assert!(renderer.render_frame(&mut []).unwrap());
        assert_eq!(renderer.pending_destruction_count(), 0);
    }

    assert_eq!(slots, [0, 1, 0, 1, 0]);
    assert_eq!(renderer.absolute_frame_count(), 5);
    assert_eq!(gpu.surface_sets_created(), 1);
    assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
}

#[test]
fn cursor_wraps_with_depth_three() {
    let (mut renderer, _gpu) = renderer_with(SimulatedGpu::new(), 3);

    let mut seen = Vec::new();
    for _ in 0..7 {
        renderer.render_frame(&mut []).unwrap();
        seen.push((renderer.current_frame_slot(), renderer.previous_frame_slot()));
    }

    assert_eq!(seen, [(1, 0), (2, 1), (0, 2), (1, 0), (2, 1), (0, 2), (1, 0)]);
    assert_eq!(
        renderer.current_frame_slot() as u64,
        renderer.absolute_frame_count() % 3
    );
}

#[test]
fn presentation_depth_is_clamped() {
    let (deep, _) = renderer_with(SimulatedGpu::new(), 7);
    assert_eq!(deep.presentation_depth(), 3);

    let (shallow, _) = renderer_with(SimulatedGpu::new(), 1);
    assert_eq!(shallow.presentation_depth(), 2);
}

// =============================================================================
// BACK-PRESSURE AND DEFERRED DESTRUCTION
// =============================================================================

#[test]
fn retired_buffer_is_released_at_reclaim_of_frame_k_plus_depth() {
    let (mut renderer, gpu) = renderer_with(SimulatedGpu::deferred(), 2);

    let buffer = renderer
        .gpu_mut()
        .create_buffer(BufferUsage::Vertex, 256, "retired in frame 0")
        .unwrap();
    let id = buffer.id();
    let mut buffer = Some(buffer);
    let mut retire = hook(|r| {
        if let Some(buffer) = buffer.take() {
            r.schedule_destruction(Retired::<SimulatedGpu>::buffer(buffer));
        }
        Ok(())
    });

    // Frame 0 retires it
    assert!(renderer.render_frame(&mut [&mut retire]).unwrap());
    assert!(gpu.is_live(id));
    assert_eq!(renderer.pending_destruction_count(), 1);
    assert_eq!(renderer.frame_context().slots[0].retired.pending(ResourceKind::Buffer), 1);

    // Frame 1 reclaims the other slot
    assert!(renderer.render_frame(&mut []).unwrap());
    assert!(gpu.is_live(id));

    // Frame 2 reclaims slot 0, after waiting for frame 1
    gpu.clear_events();
    assert!(renderer.render_frame(&mut []).unwrap());
    assert!(!gpu.is_live(id));
    assert_eq!(renderer.pending_destruction_count(), 0);

    let events = gpu.events();
    let wait_end = position(&events, |e| matches!(e, GpuEvent::HostWaitEnd { .. })).unwrap();
    let released = position(&events, |e| {
        matches!(e, GpuEvent::Released { kind: ReleaseKind::Buffer, id: released } if *released == id)
    })
    .unwrap();
    let reset = position(&events, |e| matches!(e, GpuEvent::CommandsReset { .. })).unwrap();
    assert!(wait_end < released && released < reset);
    assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
}

#[test]
fn host_waits_for_previous_frame_before_reclaiming() {
    let (mut renderer, gpu) = renderer_with(SimulatedGpu::deferred(), 2);
    let desc = TextureDesc::new(16, 16, TextureFormat::Rgba8Srgb);

    let mut current: Option<Texture<SimulatedGpu>> = None;
    let mut churn = hook(|r| {
        if let Some(old) = current.take() {
            r.schedule_destruction(old);
        }
        current = Some(upload(r, &desc)?);
        Ok(())
    });

    for frame in 0..6 {
        gpu.clear_events();
        assert!(renderer.render_frame(&mut [&mut churn]).unwrap());

        let events = gpu.events();
        let wait_begin = position(&events, |e| matches!(e, GpuEvent::HostWaitBegin { .. })).unwrap();
        let acquired = position(&events, |e| matches!(e, GpuEvent::Acquired { .. })).unwrap();
        let reset = position(&events, |e| matches!(e, GpuEvent::CommandsReset { .. })).unwrap();
        assert!(acquired < wait_begin && wait_begin < reset, "frame {frame}: {events:?}");
        if let Some(first_release) = position(&events, |e| matches!(e, GpuEvent::Released { .. })) {
            assert!(wait_begin < first_release, "frame {frame} released before waiting");
        }

        // Only this frame's transfer and render submissions may still be in flight
        assert!(gpu.pending_submissions() <= 2);
    }

    assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
}

#[test]
fn frame_without_uploads_has_no_transfer_wait() {
    let (mut renderer, gpu) = renderer_with(SimulatedGpu::new(), 2);
    renderer.render_frame(&mut []).unwrap();

    let events = gpu.events();
    assert_eq!(count(&events, |e| matches!(e, GpuEvent::Submitted { queue: Queue::Transfer, .. })), 0);

    let renders = render_submissions(&events);
    assert_eq!(renders.len(), 1);
    assert_eq!(renders[0].len(), 1);
    assert_eq!(renders[0][0].1, None);
}

#[test]
fn render_waits_on_this_frames_transfer() {
    let (mut renderer, gpu) = renderer_with(SimulatedGpu::deferred(), 2);
    let desc = TextureDesc::new(8, 8, TextureFormat::Rgba8Unorm);

    let mut texture = None;
    let mut once = hook(|r| {
        if texture.is_none() {
            texture = Some(upload(r, &desc)?);
        }
        Ok(())
    });
    renderer.render_frame(&mut [&mut once]).unwrap();

    let events = gpu.events();
    let transfer_signal = events
        .iter()
        .find_map(|e| match e {
            GpuEvent::Submitted { queue: Queue::Transfer, signals, .. } => Some(signals[0]),
            _ => None,
        })
        .unwrap();
    assert_eq!(transfer_signal.1, Some(1));

    let renders = render_submissions(&events);
    assert_eq!(renders[0].len(), 2);
    assert!(renders[0].contains(&transfer_signal));

    if let Some(texture) = texture.take() {
        renderer.schedule_destruction(texture);
    }
    renderer.shutdown().unwrap();
    assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
}

// =============================================================================
// UPLOADS
// =============================================================================

#[test]
fn mip_chain_upload_records_one_blit_per_level() {
    let (mut renderer, gpu) = renderer_with(SimulatedGpu::new(), 2);
    let desc = TextureDesc::new(64, 32, TextureFormat::Rgba8Srgb).with_mip_levels(4);

    let texture = upload(&mut renderer, &desc).unwrap();
    let ops = gpu
        .events()
        .into_iter()
        .find_map(|e| match e {
            GpuEvent::ImageUploadRecorded { ops, slot: 0, .. } => Some(ops),
            _ => None,
        })
        .unwrap();

    let blits: Vec<(u32, UVec2, u32, UVec2)> = ops
        .iter()
        .filter_map(|op| match *op {
            TransferOp::Blit { src_level, src_extent, dst_level, dst_extent } => {
                Some((src_level, src_extent, dst_level, dst_extent))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        blits,
        [
            (0, UVec2::new(64, 32), 1, UVec2::new(32, 16)),
            (1, UVec2::new(32, 16), 2, UVec2::new(16, 8)),
            (2, UVec2::new(16, 8), 3, UVec2::new(8, 4)),
        ]
    );

    let shader_read: Vec<u32> = ops
        .iter()
        .filter_map(|op| match op {
            TransferOp::Barrier(b) if b.new_layout == ImageLayout::ShaderReadOnly => Some(b.base_mip_level),
            _ => None,
        })
        .collect();
    assert_eq!(shader_read, [0, 1, 2, 3]);

    match ops.last() {
        Some(TransferOp::Barrier(b)) => {
            assert_eq!(b.new_layout, ImageLayout::ShaderReadOnly);
            assert_eq!((b.base_mip_level, b.level_count), (3, 1));
        }
        other => panic!("upload must end on a barrier, got {other:?}"),
    }

    renderer.schedule_destruction(texture);
    renderer.render_frame(&mut []).unwrap();
    assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
}

#[test]
fn buffer_upload_stages_data_and_records_copy() {
    let (mut renderer, gpu) = renderer_with(SimulatedGpu::new(), 2);
    let destination = renderer
        .gpu_mut()
        .create_buffer(BufferUsage::Index, 64, "indices")
        .unwrap();
    let data: Vec<u8> = (1..=12).collect();

    renderer.upload_buffer(&destination, 16, &data).unwrap();

    let copy = gpu
        .events()
        .into_iter()
        .find_map(|e| match e {
            GpuEvent::BufferUploadRecorded { copy, slot: 0, .. } => Some(copy),
            _ => None,
        })
        .unwrap();
    assert_eq!((copy.dst_offset, copy.size), (16, 12));

    let staging = &renderer.frame_context().slots[0].staging;
    let contents = gpu.buffer_contents(staging);
    let start = copy.src_offset as usize;
    assert_eq!(&contents[start..start + 12], data.as_slice());

    // Submitted with the next frame
    renderer.render_frame(&mut []).unwrap();
    assert_eq!(
        count(&gpu.events(), |e| matches!(e, GpuEvent::Submitted { queue: Queue::Transfer, .. })),
        1
    );

    renderer.schedule_destruction(Retired::<SimulatedGpu>::buffer(destination));
}

#[test]
fn empty_buffer_upload_records_nothing() {
    let (mut renderer, gpu) = renderer_with(SimulatedGpu::new(), 2);
    let destination = renderer
        .gpu_mut()
        .create_buffer(BufferUsage::Vertex, 64, "vertices")
        .unwrap();

    renderer.upload_buffer(&destination, 0, &[]).unwrap();
    assert_eq!(count(&gpu.events(), |e| matches!(e, GpuEvent::BufferUploadRecorded { .. })), 0);
    renderer.schedule_destruction(Retired::<SimulatedGpu>::buffer(destination));
}

#[test]
fn staging_overflow_is_an_error_and_records_nothing() {
    init_logging();
    let gpu = SimulatedGpu::new();
    let mut renderer = Renderer::new(gpu.clone(), settings(2, 1024)).unwrap();
    let images_before = gpu.live_count(ReleaseKind::Image);

    let desc = TextureDesc::new(32, 32, TextureFormat::Rgba8Srgb);
    assert!(upload(&mut renderer, &desc).is_err());

    assert_eq!(count(&gpu.events(), |e| matches!(e, GpuEvent::ImageUploadRecorded { .. })), 0);
    assert_eq!(gpu.live_count(ReleaseKind::Image), images_before);

    // A fitting upload still goes through afterwards
    let small = TextureDesc::new(8, 8, TextureFormat::Rgba8Srgb);
    let texture = upload(&mut renderer, &small).unwrap();
    renderer.schedule_destruction(texture);
}

#[test]
fn failed_texture_creation_retires_partial_objects() {
    let (mut renderer, gpu) = renderer_with(SimulatedGpu::new(), 2);
    let images = gpu.live_count(ReleaseKind::Image);
    let views = gpu.live_count(ReleaseKind::ImageView);
    let desc = TextureDesc::new(16, 16, TextureFormat::Rgba8Srgb);

    gpu.fail_creation(ReleaseKind::Sampler, 0);
    assert!(upload(&mut renderer, &desc).is_err());
    gpu.fail_creation(ReleaseKind::ImageView, 0);
    assert!(upload(&mut renderer, &desc).is_err());

    // Image plus view, then the bare image
    assert_eq!(renderer.pending_destruction_count(), 2);
    assert_eq!(renderer.frame_context().current().staging_cursor.offset(), 0);
    assert_eq!(count(&gpu.events(), |e| matches!(e, GpuEvent::ImageUploadRecorded { .. })), 0);

    for _ in 0..3 {
        assert!(renderer.render_frame(&mut []).unwrap());
    }
    assert_eq!(gpu.live_count(ReleaseKind::Image), images);
    assert_eq!(gpu.live_count(ReleaseKind::ImageView), views);
    assert_eq!(gpu.live_count(ReleaseKind::Sampler), 0);
    assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
}

#[test]
fn mismatched_pixel_data_is_rejected() {
    let (mut renderer, gpu) = renderer_with(SimulatedGpu::new(), 2);
    let desc = TextureDesc::new(4, 4, TextureFormat::Rgba8Srgb);

    let result = renderer.upload_texture(&desc, &[0u8; 15], &SamplerConfig::default());
    assert!(result.is_err());
    assert_eq!(gpu.live_count(ReleaseKind::Sampler), 0);
}

// =============================================================================
// SURFACE RECREATION
// =============================================================================

#[test]
fn stale_acquire_recreates_once_and_retries_once() {
    let (mut renderer, gpu) = renderer_with(SimulatedGpu::new(), 2);
    renderer.render_frame(&mut []).unwrap();
    let outgoing = current_surface_set(&gpu.events()).unwrap();

    gpu.clear_events();
    gpu.push_acquire_outcome(AcquireOutcome::OutOfDate);
    assert!(renderer.render_frame(&mut []).unwrap());

    let events = gpu.events();
    assert_eq!(count(&events, |e| matches!(e, GpuEvent::AcquireOutOfDate)), 1);
    assert_eq!(count(&events, |e| matches!(e, GpuEvent::Acquired { .. })), 1);
    assert_eq!(count(&events, |e| matches!(e, GpuEvent::Presented { .. })), 1);
    let replaced: Vec<Option<u64>> = events
        .iter()
        .filter_map(|e| match e {
            GpuEvent::SurfaceSetCreated { replaces, .. } => Some(*replaces),
            _ => None,
        })
        .collect();
    assert_eq!(replaced, [Some(outgoing)]);

    // The stale frame ran in slot 1; its bank holds the outgoing set once
    let bank = &renderer.frame_context().slots[1].retired;
    assert_eq!(bank.pending(ResourceKind::SurfaceSet), 1);
    assert!(gpu.is_live(outgoing));

    for _ in 0..3 {
        renderer.render_frame(&mut []).unwrap();
    }
    let released = gpu
        .releases()
        .into_iter()
        .filter(|&(kind, id)| kind == ReleaseKind::SurfaceSet && id == outgoing)
        .count();
    assert_eq!(released, 1);
    assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
}

#[test]
fn surface_still_stale_after_retry_skips_the_frame() {
    let (mut renderer, gpu) = renderer_with(SimulatedGpu::new(), 2);
    gpu.push_acquire_outcome(AcquireOutcome::OutOfDate);
    gpu.push_acquire_outcome(AcquireOutcome::OutOfDate);

    assert!(!renderer.render_frame(&mut []).unwrap());
    assert_eq!(renderer.absolute_frame_count(), 0);
    assert_eq!(gpu.surface_sets_created(), 2);
    assert_eq!(count(&gpu.events(), |e| matches!(e, GpuEvent::Presented { .. })), 0);

    // The next attempt reuses the slot and goes through
    assert!(renderer.render_frame(&mut []).unwrap());
    assert_eq!(renderer.absolute_frame_count(), 1);
    assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
}

#[test]
fn suboptimal_acquire_still_renders() {
    let (mut renderer, gpu) = renderer_with(SimulatedGpu::new(), 2);
    gpu.push_acquire_outcome(AcquireOutcome::Acquired { image_index: 0, suboptimal: true });

    assert!(renderer.render_frame(&mut []).unwrap());
    assert_eq!(gpu.surface_sets_created(), 1);
}

#[test]
fn recreation_with_unchanged_extent_is_idempotent() {
    let (mut renderer, gpu) = renderer_with(SimulatedGpu::new(), 2);
    let extent = renderer.presentable_area_size();

    for _ in 0..3 {
        renderer.notify_resized(extent);
        renderer.render_frame(&mut []).unwrap();
    }
    assert_eq!(gpu.surface_sets_created(), 1);
    assert_eq!(renderer.pending_destruction_count(), 0);

    gpu.set_surface_extent(UVec2::new(800, 600));
    renderer.notify_resized(UVec2::new(800, 600));
    renderer.render_frame(&mut []).unwrap();
    assert_eq!(gpu.surface_sets_created(), 2);
    assert_eq!(renderer.presentable_area_size(), UVec2::new(800, 600));
}

#[test]
fn stale_present_rebuilds_before_the_next_frame() {
    let (mut renderer, gpu) = renderer_with(SimulatedGpu::new(), 2);
    gpu.set_surface_extent(UVec2::new(1024, 768));
    gpu.push_present_outcome(PresentOutcome::OutOfDate);

    assert!(renderer.render_frame(&mut []).unwrap());
    assert_eq!(gpu.surface_sets_created(), 2);
    assert_eq!(renderer.presentable_area_size(), UVec2::new(1024, 768));

    gpu.clear_events();
    assert!(renderer.render_frame(&mut []).unwrap());
    assert_eq!(count(&gpu.events(), |e| matches!(e, GpuEvent::SurfaceSetCreated { .. })), 0);
    assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
}

#[test]
fn resized_surface_set_outlives_its_frames_in_flight() {
    let (mut renderer, gpu) = renderer_with(SimulatedGpu::deferred(), 2);
    renderer.render_frame(&mut []).unwrap();
    renderer.render_frame(&mut []).unwrap();
    let outgoing = current_surface_set(&gpu.events()).unwrap();

    // Frame 2 runs in slot 0 and retires the outgoing set there
    gpu.set_surface_extent(UVec2::new(640, 480));
    renderer.notify_resized(UVec2::new(640, 480));
    assert!(renderer.render_frame(&mut []).unwrap());
    assert_ne!(current_surface_set(&gpu.events()), Some(outgoing));
    assert!(gpu.is_live(outgoing));
    assert_eq!(renderer.frame_context().slots[0].retired.pending(ResourceKind::SurfaceSet), 1);

    assert!(renderer.render_frame(&mut []).unwrap());
    assert!(gpu.is_live(outgoing));

    // Frame 4 reclaims slot 0 after waiting for frame 3
    gpu.clear_events();
    assert!(renderer.render_frame(&mut []).unwrap());
    assert!(!gpu.is_live(outgoing));

    let events = gpu.events();
    let wait_end = position(&events, |e| matches!(e, GpuEvent::HostWaitEnd { .. })).unwrap();
    let released = position(&events, |e| {
        matches!(e, GpuEvent::Released { kind: ReleaseKind::SurfaceSet, id } if *id == outgoing)
    })
    .unwrap();
    assert!(wait_end < released);
    assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
}

#[test]
fn stale_present_retires_the_set_into_the_presenting_slot() {
    let (mut renderer, gpu) = renderer_with(SimulatedGpu::deferred(), 2);
    renderer.render_frame(&mut []).unwrap();
    let outgoing = current_surface_set(&gpu.events()).unwrap();

    // Frame 1 presents from slot 1 and finds the surface stale
    gpu.set_surface_extent(UVec2::new(1024, 768));
    gpu.push_present_outcome(PresentOutcome::OutOfDate);
    assert!(renderer.render_frame(&mut []).unwrap());
    assert_eq!(renderer.frame_context().slots[1].retired.pending(ResourceKind::SurfaceSet), 1);
    assert!(gpu.is_live(outgoing));

    assert!(renderer.render_frame(&mut []).unwrap());
    assert!(gpu.is_live(outgoing));

    assert!(renderer.render_frame(&mut []).unwrap());
    assert!(!gpu.is_live(outgoing));
    assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
}

#[test]
fn minimized_surface_skips_frames_until_restored() {
    let (mut renderer, gpu) = renderer_with(SimulatedGpu::new(), 2);
    renderer.render_frame(&mut []).unwrap();

    gpu.set_surface_extent(UVec2::ZERO);
    renderer.notify_resized(UVec2::ZERO);
    gpu.clear_events();
    assert!(!renderer.render_frame(&mut []).unwrap());
    assert!(!renderer.render_frame(&mut []).unwrap());
    assert_eq!(count(&gpu.events(), |e| matches!(e, GpuEvent::Acquired { .. })), 0);
    assert_eq!(renderer.absolute_frame_count(), 1);

    gpu.set_surface_extent(UVec2::new(640, 480));
    renderer.notify_resized(UVec2::new(640, 480));
    assert!(renderer.render_frame(&mut []).unwrap());
    assert_eq!(renderer.presentable_area_size(), UVec2::new(640, 480));
    assert_eq!(gpu.surface_sets_created(), 2);
}

// =============================================================================
// FAILURES
// =============================================================================

#[test]
fn participant_failure_still_presents_the_frame() {
    let (mut renderer, gpu) = renderer_with(SimulatedGpu::deferred(), 2);

    let mut failing_update = hook(|_| Err(anyhow::anyhow!("update hook failed")));
    assert!(renderer.render_frame(&mut [&mut failing_update]).is_err());
    assert_eq!(renderer.absolute_frame_count(), 1);
    assert_eq!(count(&gpu.events(), |e| matches!(e, GpuEvent::Presented { .. })), 1);

    let mut failing_render = FailingRender;
    assert!(renderer.render_frame(&mut [&mut failing_render]).is_err());
    assert_eq!(renderer.absolute_frame_count(), 2);

    for _ in 0..3 {
        assert!(renderer.render_frame(&mut []).unwrap());
    }
    assert_eq!(renderer.absolute_frame_count(), 5);
    assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
}

#[test]
fn staging_overflow_inside_update_keeps_the_renderer_usable() {
    init_logging();
    let gpu = SimulatedGpu::new();
    let mut renderer = Renderer::new(gpu.clone(), settings(2, 1024)).unwrap();
    let desc = TextureDesc::new(32, 32, TextureFormat::Rgba8Srgb);

    let mut greedy = hook(|r| {
        let texture = upload(r, &desc)?;
        r.schedule_destruction(texture);
        Ok(())
    });
    let error = renderer.render_frame(&mut [&mut greedy]).unwrap_err();
    assert!(format!("{error:#}").contains("Staging buffer"), "{error:#}");

    assert!(renderer.render_frame(&mut []).unwrap());
    assert!(renderer.render_frame(&mut []).unwrap());
    assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
}

#[test]
fn failed_submission_makes_the_renderer_unusable() {
    let (mut renderer, gpu) = renderer_with(SimulatedGpu::new(), 2);
    renderer.render_frame(&mut []).unwrap();

    gpu.fail_next_submit(Queue::Render);
    assert!(renderer.render_frame(&mut []).is_err());

    let error = renderer.render_frame(&mut []).unwrap_err();
    assert!(error.to_string().contains("failed frame"), "{error:#}");

    renderer.shutdown().unwrap();
    assert_eq!(gpu.live_count(ReleaseKind::SurfaceSet), 0);
    assert_eq!(gpu.live_count(ReleaseKind::Semaphore), 0);
}

// =============================================================================
// SHUTDOWN
// =============================================================================

#[test]
fn shutdown_releases_everything() {
    let (mut renderer, gpu) = renderer_with(SimulatedGpu::deferred(), 3);
    let desc = TextureDesc::new(32, 32, TextureFormat::Rgba8Srgb).with_full_mip_chain();

    let mut current: Option<Texture<SimulatedGpu>> = None;
    {
        let mut churn = hook(|r| {
            if let Some(old) = current.take() {
                r.schedule_destruction(old);
            }
            current = Some(upload(r, &desc)?);
            Ok(())
        });
        for frame in 0..8 {
            if frame == 4 {
                gpu.set_surface_extent(UVec2::new(960, 540));
                renderer.notify_resized(UVec2::new(960, 540));
            }
            assert!(renderer.render_frame(&mut [&mut churn]).unwrap());
        }
    }
    if let Some(texture) = current.take() {
        renderer.schedule_destruction(texture);
    }
    assert!(renderer.pending_destruction_count() > 0);

    renderer.shutdown().unwrap();

    for kind in [
        ReleaseKind::SurfaceSet,
        ReleaseKind::Sampler,
        ReleaseKind::ImageView,
        ReleaseKind::Image,
        ReleaseKind::Buffer,
        ReleaseKind::Semaphore,
    ] {
        assert_eq!(gpu.live_count(kind), 0, "{kind:?} left alive");
    }
    assert_eq!(gpu.pending_submissions(), 0);
    assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());

    assert!(renderer.render_frame(&mut []).is_err());
    assert!(renderer.shutdown().is_ok());
}
