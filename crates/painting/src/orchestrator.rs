//! Frame orchestrator
//!
//! Drives one frame per tick through `Idle -> Acquire -> Record -> Submit ->
//! (Present | Export)`. Frame slots cycle by frame index; a slot is reused
//! only after its fence says the previous submission in it retired.
//!
//! Everything a frame draws is recorded into the slot's command buffer and
//! submitted once: uniform updates gated by the dirty masks, the layer
//! composite, the raster or ray-trace view pass, the post blit onto the swap
//! image and, when exporting, the copies for the consumer.

use std::mem::size_of;
use std::time::Duration;

use painter_config::{EngineConfig, OutputMode, RenderMode};
use tracing::{debug, info, warn};

use crate::compositor::record_composite;
use crate::device::{
    BufferSlice, Command, CommandBuffer, GpuDevice, PipelineHandle, PushConstants, RasterBindings,
    ShaderGroup, ShaderProgram, TextureDesc, TextureHandle, TraceBindings, UNIFORM_BLOCK_SIZE,
};
use crate::error::{PaintError, PaintResult};
use crate::export::FrameExporter;
use crate::frame::{FrameReport, FrameSlot, FrameState};
use crate::memory::HostArena;
use crate::params::RuntimeParams;
use crate::projector::{PaintProjector, UNIFORM_ALIGNMENT};
use crate::sbt::{SbtLayout, ShaderBindingTable};
use crate::scene::{PaintScene, RenderScene, UboMatrices};
use crate::types::{Region, RenderDirty, SceneDirty};

/// View pipeline groups in binding-table order
pub const VIEW_GROUPS: [ShaderProgram; 4] = [
    ShaderProgram::ViewRaygen,
    ShaderProgram::PrimaryMiss,
    ShaderProgram::OcclusionMiss,
    ShaderProgram::SurfaceClosestHit,
];

/// Everything a frame reads or writes besides the orchestrator itself
pub struct FrameContext<'a> {
    pub device: &'a mut dyn GpuDevice,
    pub render: &'a mut RenderScene,
    pub paint: &'a mut PaintScene,
    pub projector: &'a mut PaintProjector,
    pub params: &'a RuntimeParams,
}

/// Offscreen targets and swap images sized to the window extent
#[derive(Debug)]
struct Targets {
    color: TextureHandle,
    depth: TextureHandle,
    swap_images: Vec<TextureHandle>,
}

impl Targets {
    fn new(device: &mut dyn GpuDevice, output: OutputMode, width: u32, height: u32, count: u32) -> PaintResult<Self> {
        let color = device.create_texture(&TextureDesc::rgba8(width, height))?;
        let depth = device.create_texture(&TextureDesc::depth(width, height))?;
        let swap_images = match output {
            OutputMode::Present => device.create_swapchain(width, height, count)?,
            // Nothing is presented; the slots render into private images
            OutputMode::CopyToHost => (0..count)
                .map(|_| device.create_texture(&TextureDesc::rgba8(width, height)))
                .collect::<Result<Vec<_>, _>>()?,
        };
        Ok(Self {
            color,
            depth,
            swap_images,
        })
    }

    fn release(&mut self, device: &mut dyn GpuDevice, output: OutputMode) {
        device.destroy_texture(self.color);
        device.destroy_texture(self.depth);
        match output {
            OutputMode::Present => device.destroy_swapchain(),
            OutputMode::CopyToHost => {
                for image in self.swap_images.drain(..) {
                    device.destroy_texture(image);
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct FrameOrchestrator {
    slots: Vec<FrameSlot>,
    state: FrameState,
    frame_index: u64,
    /// Nothing has been recorded yet: every uniform and the composite are due
    first_frame: bool,
    output: OutputMode,
    paint_texture: TextureHandle,
    targets: Targets,
    extent: (u32, u32),
    pipeline: PipelineHandle,
    sbt: ShaderBindingTable,
    uniforms: BufferSlice,
    push: PushConstants,
    exporter: Option<FrameExporter>,
    fence_timeout: Duration,
}

impl FrameOrchestrator {
    pub fn new(
        device: &mut dyn GpuDevice,
        arena: &mut HostArena,
        config: &EngineConfig,
        texture_size: u32,
    ) -> PaintResult<Self> {
        let (width, height) = (config.width, config.height);
        let slots = (0..config.frames_in_flight)
            .map(|_| FrameSlot::new(device))
            .collect::<PaintResult<Vec<_>>>()?;

        let output = config.output_mode;
        let paint_texture = device.create_texture(&TextureDesc::rgba8(texture_size, texture_size))?;
        let targets = Targets::new(device, output, width, height, config.frames_in_flight)?;

        let groups = VIEW_GROUPS.map(ShaderGroup::new);
        let pipeline = device.create_ray_tracing_pipeline(&groups)?;
        let sbt = ShaderBindingTable::build(device, arena, pipeline, SbtLayout::STANDARD)?;
        let uniforms = arena.allocate(UNIFORM_BLOCK_SIZE, UNIFORM_ALIGNMENT)?;

        let exporter = match output {
            OutputMode::CopyToHost => Some(FrameExporter::new(device, config.export_mode, width, height)?),
            OutputMode::Present => None,
        };

        info!(
            "Frame orchestrator ready: {} slots, {}x{}, {:?}",
            slots.len(),
            width,
            height,
            output
        );
        Ok(Self {
            slots,
            state: FrameState::Idle,
            frame_index: 0,
            first_frame: true,
            output,
            paint_texture,
            targets,
            extent: (width, height),
            pipeline,
            sbt,
            uniforms,
            push: PushConstants::default(),
            exporter,
            fence_timeout: config.fence_timeout(),
        })
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Frames completed so far
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn output(&self) -> OutputMode {
        self.output
    }

    /// Composite of all visible layers
    pub fn paint_texture(&self) -> TextureHandle {
        self.paint_texture
    }

    pub fn color_target(&self) -> TextureHandle {
        self.targets.color
    }

    pub fn depth_target(&self) -> TextureHandle {
        self.targets.depth
    }

    pub fn swap_images(&self) -> &[TextureHandle] {
        &self.targets.swap_images
    }

    pub fn extent(&self) -> (u32, u32) {
        self.extent
    }

    pub fn exporter(&self) -> Option<&FrameExporter> {
        self.exporter.as_ref()
    }

    pub fn exporter_mut(&mut self) -> Option<&mut FrameExporter> {
        self.exporter.as_mut()
    }

    pub fn push_constants(&self) -> &PushConstants {
        &self.push
    }

    pub fn set_push_constants(&mut self, push: PushConstants) {
        self.push = push;
    }

    /// Run one frame. On error the state machine is back at `Idle`.
    pub fn render_frame(&mut self, ctx: FrameContext<'_>) -> PaintResult<FrameReport> {
        let result = self.run_frame(ctx);
        if let Err(err) = &result {
            warn!("Frame {} failed: {}", self.frame_index, err);
            self.state = FrameState::Idle;
        }
        result
    }

    fn advance(&mut self, next: FrameState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "frame state {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    fn run_frame(&mut self, ctx: FrameContext<'_>) -> PaintResult<FrameReport> {
        let FrameContext {
            device,
            render,
            paint,
            projector,
            params,
        } = ctx;

        let painted = projector.sync(device, render, paint)?;

        self.advance(FrameState::Acquire);
        let slot_index = (self.frame_index % self.slots.len() as u64) as usize;
        let (fence, render_complete, image_acquired) = {
            let slot = &self.slots[slot_index];
            (slot.fence, slot.render_complete, slot.image_acquired)
        };
        device
            .wait_fence(fence, self.fence_timeout)
            .map_err(|err| PaintError::DeviceLost(format!("frame slot {slot_index}: {err}")))?;
        device.reset_fence(fence)?;
        let image = match self.output {
            OutputMode::Present => device.acquire_next_image(image_acquired)?,
            OutputMode::CopyToHost => slot_index as u32,
        };

        self.advance(FrameState::Record);
        let mode = params.render_mode();
        let mut commands = std::mem::take(&mut self.slots[slot_index].commands);
        commands.reset();
        let composited = self.record(&mut commands, render, paint, mode, image, painted);
        let copied = match &self.exporter {
            Some(exporter) => exporter.record_copies(&mut commands, self.swap_image(image)?, self.targets.depth),
            None => false,
        };

        self.advance(FrameState::Submit);
        let mut wait = Vec::new();
        let mut signal = Vec::new();
        if let Some(paint_done) = projector.take_paint_done() {
            wait.push(paint_done);
        }
        match self.exporter.as_mut() {
            Some(exporter) => {
                wait.extend(exporter.take_waits());
                signal.extend(exporter.signals(slot_index));
            }
            None => signal.push(render_complete),
        }
        let submitted = device.submit(commands.submission(wait, signal, Some(fence)));
        self.slots[slot_index].commands = commands;
        submitted.map_err(|err| PaintError::SubmissionFailed(err.to_string()))?;

        self.advance(if self.exporter.is_some() { FrameState::Export } else { FrameState::Present });
        match self.exporter.as_mut() {
            Some(exporter) => exporter.finish(device, self.frame_index, slot_index, fence, self.fence_timeout)?,
            None => device.present(image, &[render_complete, image_acquired])?,
        }

        render.clear_dirty();
        paint.clear_dirty();
        self.first_frame = false;

        let report = FrameReport {
            frame: self.frame_index,
            slot: slot_index,
            image,
            mode,
            output: self.output,
            painted,
            composited,
            copied,
        };
        self.frame_index += 1;
        self.advance(FrameState::Idle);
        debug!("{:?}", report);
        Ok(report)
    }

    fn swap_image(&self, image: u32) -> PaintResult<TextureHandle> {
        self.targets
            .swap_images
            .get(image as usize)
            .copied()
            .ok_or_else(|| PaintError::SubmissionFailed(format!("no swap image {image}")))
    }

    /// Record the frame's passes. Returns whether the layers were recomposited.
    fn record(
        &self,
        cmd: &mut CommandBuffer,
        render: &mut RenderScene,
        paint: &PaintScene,
        mode: RenderMode,
        image: u32,
        painted: bool,
    ) -> bool {
        let render_dirty = render.dirty();
        let paint_dirty = paint.dirty();

        let camera_dirty = render_dirty.intersects(RenderDirty::VIEW | RenderDirty::PROJECTION | RenderDirty::EXTENT)
            || paint_dirty.intersects(SceneDirty::VIEW | SceneDirty::PROJECTION);
        if self.first_frame || camera_dirty {
            cmd.record(Command::UpdateBuffer {
                buffer: self.uniforms.buffer,
                offset: self.uniforms.offset,
                data: bytemuck::bytes_of(&render.matrices()).to_vec(),
            });
        }
        if self.first_frame || paint_dirty.contains(SceneDirty::BRUSH) {
            cmd.record(Command::UpdateBuffer {
                buffer: self.uniforms.buffer,
                offset: self.uniforms.offset + size_of::<UboMatrices>() as u64,
                data: bytemuck::bytes_of(&paint.brush().ubo()).to_vec(),
            });
        }

        let composite = self.first_frame || painted || paint_dirty.contains(SceneDirty::LAYERS);
        if composite {
            record_composite(cmd, self.paint_texture, paint.layers());
            render.notify_texture_changed();
        }

        let (width, height) = self.extent;
        let clear = [
            Command::ClearColor {
                texture: self.targets.color,
                color: self.push.clear_color,
            },
            Command::ClearDepth {
                texture: self.targets.depth,
                depth: 1.0,
            },
        ];
        match (render.mesh(), mode) {
            (None, _) => clear.into_iter().for_each(|c| cmd.record(c)),
            (Some(mesh), RenderMode::Raster) => {
                clear.into_iter().for_each(|c| cmd.record(c));
                cmd.record(Command::Rasterize {
                    bindings: RasterBindings {
                        accel: mesh.accel,
                        uniforms: self.uniforms,
                        color: self.targets.color,
                        depth: self.targets.depth,
                        paint_texture: self.paint_texture,
                        push: self.push,
                    },
                });
            }
            (Some(mesh), RenderMode::RayTrace) => {
                cmd.record(Command::TraceRays {
                    pipeline: self.pipeline,
                    sbt: self.sbt.regions(),
                    launch: Region::full(width, height),
                    bindings: TraceBindings {
                        accel: mesh.accel,
                        uniforms: self.uniforms,
                        target: self.targets.color,
                        depth: Some(self.targets.depth),
                        paint_texture: Some(self.paint_texture),
                        push: self.push,
                        occlusion_test: false,
                    },
                });
            }
        }

        if let Some(&target) = self.targets.swap_images.get(image as usize) {
            cmd.record(Command::Post {
                source: self.targets.color,
                target,
            });
        }
        composite
    }

    /// Drain the device and reallocate everything sized to the window
    pub fn resize(
        &mut self,
        device: &mut dyn GpuDevice,
        render: &mut RenderScene,
        width: u32,
        height: u32,
    ) -> PaintResult<()> {
        if (width, height) == self.extent {
            return Ok(());
        }
        device.wait_idle()?;
        self.targets.release(device, self.output);
        self.targets = Targets::new(device, self.output, width, height, self.slots.len() as u32)?;
        if let Some(exporter) = self.exporter.as_mut() {
            exporter.resize(device, width, height)?;
        }
        self.extent = (width, height);
        render.set_extent(width, height);
        info!("Resized to {}x{}", width, height);
        Ok(())
    }

    /// Free everything. The device must be idle.
    pub fn release(&mut self, device: &mut dyn GpuDevice) {
        for slot in self.slots.drain(..) {
            slot.release(device);
        }
        self.targets.release(device, self.output);
        device.destroy_texture(self.paint_texture);
        device.destroy_pipeline(self.pipeline);
        if let Some(exporter) = self.exporter.as_mut() {
            exporter.release(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blend;
    use crate::device::{CpuDevice, ExternalSync};
    use crate::layers::LayerStack;
    use crate::raycast::MeshGeometry;
    use crate::undo::UndoLedger;
    use glam::Vec2;
    use painter_config::{ExportMode, TextureTier};

    const TEXTURE: u32 = 32;
    const EXTENT: u32 = 16;

    struct Fixture {
        device: CpuDevice,
        render: RenderScene,
        paint: PaintScene,
        projector: PaintProjector,
        params: RuntimeParams,
        frames: FrameOrchestrator,
    }

    impl Fixture {
        fn new(config: EngineConfig) -> Self {
            let mut device = CpuDevice::new(TextureTier::K4.memory_budget());
            let mut arena = HostArena::new(&mut device, 4096).unwrap();
            let mut render = RenderScene::new(EXTENT, EXTENT);
            render.set_mesh(&mut device, MeshGeometry::plane(1.0)).unwrap();
            let mut paint = PaintScene::new(LayerStack::new(TEXTURE, 4), UndoLedger::new(8, u64::MAX));
            paint.create_layer(&mut device).unwrap();
            let projector = PaintProjector::new(&mut device, &mut arena, false).unwrap();
            let frames = FrameOrchestrator::new(&mut device, &mut arena, &config, TEXTURE).unwrap();
            let params = RuntimeParams::new(&config);
            Self {
                device,
                render,
                paint,
                projector,
                params,
                frames,
            }
        }

        fn frame(&mut self) -> PaintResult<FrameReport> {
            self.frames.render_frame(FrameContext {
                device: &mut self.device,
                render: &mut self.render,
                paint: &mut self.paint,
                projector: &mut self.projector,
                params: &self.params,
            })
        }

        fn pixel(&mut self, texture: TextureHandle, x: u32, y: u32) -> [u8; 4] {
            let data = self.device.read_region(texture, Region::new(x, y, 1, 1)).unwrap();
            [data[0], data[1], data[2], data[3]]
        }
    }

    fn config(render_mode: RenderMode, output_mode: OutputMode, export_mode: ExportMode) -> EngineConfig {
        EngineConfig {
            width: EXTENT,
            height: EXTENT,
            render_mode,
            output_mode,
            export_mode,
            fence_timeout_ms: 5,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_present_cycles_slots_and_images() {
        let mut f = Fixture::new(config(RenderMode::Raster, OutputMode::Present, ExportMode::HostCopy));
        let first = f.frame().unwrap();
        assert_eq!((first.frame, first.slot, first.image), (0, 0, 0));
        assert!(first.composited);
        assert!(!first.copied);
        f.device.poll().unwrap();
        assert_eq!(f.device.last_presented(), Some(0));

        let second = f.frame().unwrap();
        assert_eq!((second.slot, second.image), (1, 1));
        assert!(!second.composited);
        let third = f.frame().unwrap();
        assert_eq!(third.slot, 0);
        assert_eq!(f.frames.state(), FrameState::Idle);
        f.device.poll().unwrap();
        assert_eq!(f.device.stats().presented, 3);
    }

    #[test]
    fn test_dirty_masks_cleared_after_frame() {
        let mut f = Fixture::new(config(RenderMode::Raster, OutputMode::Present, ExportMode::HostCopy));
        f.frame().unwrap();
        assert!(f.render.dirty().is_empty());
        assert!(f.paint.dirty().is_empty());
    }

    #[test]
    fn test_stroke_shows_in_both_render_modes() {
        for mode in [RenderMode::Raster, RenderMode::RayTrace] {
            let mut f = Fixture::new(config(mode, OutputMode::Present, ExportMode::HostCopy));
            f.paint.brush_mut().set_radius(0.3);
            f.paint.brush_mut().set_color([1.0, 0.0, 0.0]);
            f.paint.brush_mut().pen_down(Vec2::splat(0.5));

            let report = f.frame().unwrap();
            assert!(report.painted && report.composited);
            assert_eq!(report.mode, mode);

            let image = f.frames.swap_images()[report.image as usize];
            let center = f.pixel(image, EXTENT / 2, EXTENT / 2);
            assert!(center[0] > center[1] + 40, "{mode:?}: {center:?}");
            let corner = f.pixel(image, 0, 0);
            assert_eq!(corner, blend::pack(PushConstants::default().clear_color));
        }
    }

    #[test]
    fn test_host_copy_export_matches_swap_image() {
        let mut f = Fixture::new(config(RenderMode::Raster, OutputMode::CopyToHost, ExportMode::HostCopy));
        let report = f.frame().unwrap();
        assert!(report.copied);
        let image = f.frames.swap_images()[report.image as usize];
        let rendered = f.device.read_region(image, Region::full(EXTENT, EXTENT)).unwrap();
        let exporter = f.frames.exporter().unwrap();
        assert_eq!(exporter.read_color(&f.device).unwrap(), rendered);
        let depth = exporter.read_depth(&f.device).unwrap();
        let center = ((EXTENT / 2 * EXTENT + EXTENT / 2) * 4) as usize;
        assert!(f32::from_le_bytes(depth[center..center + 4].try_into().unwrap()) < 1.0);
    }

    #[test]
    fn test_fast_path_skips_copy() {
        let mut f = Fixture::new(config(RenderMode::Raster, OutputMode::CopyToHost, ExportMode::HostCopy));
        f.frames.exporter_mut().unwrap().set_fast_path(true);
        let report = f.frame().unwrap();
        assert!(!report.copied);
        let exporter = f.frames.exporter().unwrap();
        assert!(exporter.read_color(&f.device).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_external_export_waits_for_read_done() {
        let mut f = Fixture::new(config(RenderMode::Raster, OutputMode::CopyToHost, ExportMode::External));
        let semaphores = f.frames.exporter().unwrap().descriptor().semaphores.unwrap();

        f.frame().unwrap();
        f.device.import_and_wait(semaphores.frame_done[0], Duration::ZERO).unwrap();

        // The consumer still holds frame 0: frame 1 is queued but cannot run
        f.frame().unwrap();
        assert_eq!(f.device.pending_work(), 1);
        let frame_done_1 = f.frames.exporter().unwrap().frame_done(1);
        assert!(!f.device.semaphore_signaled(frame_done_1));

        f.device.import_and_signal(semaphores.read_done).unwrap();
        f.device.poll().unwrap();
        assert!(f.device.semaphore_signaled(frame_done_1));
        assert_eq!(f.device.pending_work(), 0);
    }

    #[test]
    fn test_stalled_consumer_times_out_as_device_lost() {
        let mut f = Fixture::new(config(RenderMode::Raster, OutputMode::CopyToHost, ExportMode::External));
        f.frame().unwrap();
        f.frame().unwrap();
        f.frame().unwrap();
        // Slot 1 is still waiting on a read-done that never comes
        let err = f.frame().unwrap_err();
        assert!(matches!(err, PaintError::DeviceLost(_)));
        assert!(err.is_fatal());
        assert_eq!(f.frames.state(), FrameState::Idle);
    }

    #[test]
    fn test_resize_reallocates_targets() {
        let mut f = Fixture::new(config(RenderMode::Raster, OutputMode::CopyToHost, ExportMode::HostCopy));
        f.frame().unwrap();
        f.frames.resize(&mut f.device, &mut f.render, 8, 4).unwrap();
        assert_eq!(f.frames.extent(), (8, 4));
        assert!(f.render.dirty().contains(RenderDirty::EXTENT));
        let desc = f.device.texture_desc(f.frames.swap_images()[0]).unwrap();
        assert_eq!((desc.width, desc.height), (8, 4));

        let report = f.frame().unwrap();
        assert!(report.copied);
        assert_eq!(f.frames.exporter().unwrap().read_color(&f.device).unwrap().len(), 8 * 4 * 4);
    }
}
