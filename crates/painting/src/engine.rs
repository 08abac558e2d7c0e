//! Paint engine
//!
//! Owns the device, both scenes, the projector, the frame orchestrator and the
//! plugin, and runs the per-tick control flow: plugin update, brush sync,
//! render, present or export.

use std::sync::Arc;
use std::time::Instant;

use glam::Vec2;
use painter_config::{EngineConfig, RenderMode};
use painter_ipc::{ExportDescriptor, ExportEvent};
use tracing::{debug, error, info, warn};

use crate::constants::HOST_ARENA_SIZE;
use crate::device::GpuDevice;
use crate::error::{PaintError, PaintResult};
use crate::frame::FrameReport;
use crate::layers::{LayerRelease, LayerStack};
use crate::memory::HostArena;
use crate::orchestrator::{FrameContext, FrameOrchestrator};
use crate::params::RuntimeParams;
use crate::plugin::{LoadedPlugin, PaintPlugin, PluginContext, PluginImport, PluginSource};
use crate::projector::PaintProjector;
use crate::raycast::MeshGeometry;
use crate::scene::{Camera, PaintScene, RenderScene};
use crate::types::{LayerId, Region, SceneDirty};
use crate::undo::UndoLedger;

pub struct PaintEngine<D: GpuDevice> {
    config: EngineConfig,
    device: D,
    arena: Option<HostArena>,
    render: RenderScene,
    paint: PaintScene,
    projector: PaintProjector,
    frames: FrameOrchestrator,
    params: Arc<RuntimeParams>,
    plugin: Option<LoadedPlugin>,
    released: bool,
}

impl<D: GpuDevice> PaintEngine<D> {
    pub fn new(config: EngineConfig, mut device: D) -> PaintResult<Self> {
        config.validate()?;
        let texture_size = config.paint_texture_size();

        let mut arena = HostArena::new(&mut device, HOST_ARENA_SIZE)?;
        let render = RenderScene::new(config.width, config.height);
        let paint = PaintScene::new(
            LayerStack::new(texture_size, config.max_layers),
            UndoLedger::new(config.undo_entries, config.undo_byte_budget),
        );
        let projector = PaintProjector::new(&mut device, &mut arena, config.occlusion_test)?;
        let frames = FrameOrchestrator::new(&mut device, &mut arena, &config, texture_size)?;
        let params = Arc::new(RuntimeParams::new(&config));

        info!(
            "Paint engine up: {}px paint texture, {:?} / {:?}",
            texture_size, config.render_mode, config.output_mode
        );
        Ok(Self {
            config,
            device,
            arena: Some(arena),
            render,
            paint,
            projector,
            frames,
            params,
            plugin: None,
            released: false,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn render(&self) -> &RenderScene {
        &self.render
    }

    pub fn render_mut(&mut self) -> &mut RenderScene {
        &mut self.render
    }

    pub fn paint(&self) -> &PaintScene {
        &self.paint
    }

    pub fn paint_mut(&mut self) -> &mut PaintScene {
        &mut self.paint
    }

    pub fn frames(&self) -> &FrameOrchestrator {
        &self.frames
    }

    pub fn params(&self) -> &Arc<RuntimeParams> {
        &self.params
    }

    /// Load the plugin; failure is fatal at startup
    pub fn load_plugin(&mut self, source: &dyn PluginSource) -> PaintResult<()> {
        let loaded = source
            .load(PluginImport {
                params: Arc::clone(&self.params),
            })
            .inspect_err(|err| error!("{}", err))?;
        self.plugin = Some(loaded);
        Ok(())
    }

    pub fn plugin_name(&self) -> Option<&str> {
        self.plugin.as_ref().map(|p| p.name())
    }

    fn with_plugin(
        &mut self,
        call: impl FnOnce(&mut dyn PaintPlugin, &mut PluginContext<'_>) -> PaintResult<()>,
    ) -> PaintResult<()> {
        let Some(loaded) = self.plugin.as_mut() else {
            return Ok(());
        };
        let mut ctx = PluginContext::new(&mut self.render, &mut self.paint, &mut self.device, &self.params);
        call(loaded.plugin(), &mut ctx)
    }

    pub fn init(&mut self) -> PaintResult<()> {
        self.with_plugin(|plugin, ctx| plugin.init(ctx))
    }

    /// One tick: plugin update, then one frame. Fatal errors stop the loop.
    pub fn tick(&mut self) -> PaintResult<FrameReport> {
        let result = self.with_plugin(|plugin, ctx| plugin.update(ctx)).and_then(|_| {
            self.frames.render_frame(FrameContext {
                device: &mut self.device,
                render: &mut self.render,
                paint: &mut self.paint,
                projector: &mut self.projector,
                params: &self.params,
            })
        });
        if let Err(err) = &result {
            if err.is_fatal() {
                error!("Fatal: {}", err);
                self.params.request_stop();
            }
        }
        result
    }

    /// Tick until stopped or `max_frames` is reached, pacing to the frame
    /// interval. Returns the number of frames rendered.
    pub fn run(&mut self) -> PaintResult<u64> {
        self.run_with(|_, _| {})
    }

    /// [`run`](Self::run), calling `after_tick` with every frame report
    pub fn run_with(&mut self, mut after_tick: impl FnMut(&mut Self, &FrameReport)) -> PaintResult<u64> {
        let interval = self.config.frame_interval();
        let mut frames = 0;
        while self.params.should_run() && self.config.max_frames.is_none_or(|max| frames < max) {
            let started = Instant::now();
            let report = self.tick()?;
            after_tick(self, &report);
            frames += 1;
            if let Some(rest) = interval.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
        }
        info!("Tick loop finished after {} frames", frames);
        Ok(frames)
    }

    /// Ask the tick loop to finish
    pub fn stop(&self) {
        self.params.request_stop();
    }

    /// Plugin cleanup, wait for the device, release everything. Idempotent.
    pub fn shutdown(&mut self) -> PaintResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.params.request_stop();

        let cleanup = self.with_plugin(|plugin, ctx| plugin.cleanup(ctx));
        if let Err(err) = &cleanup {
            warn!("Plugin cleanup failed: {}", err);
        }
        self.plugin = None;
        if let Err(err) = self.projector.end_stroke(&mut self.device, &mut self.paint) {
            warn!("Dropping open stroke: {}", err);
        }

        let idle = self.device.wait_idle().map_err(PaintError::from);
        if let Err(err) = &idle {
            error!("Device did not go idle: {}", err);
        }
        self.frames.release(&mut self.device);
        self.projector.release(&mut self.device);
        self.render.release(&mut self.device);
        self.paint.release(&mut self.device);
        if let Some(arena) = self.arena.take() {
            arena.release(&mut self.device);
        }
        info!("Paint engine shut down");
        idle.and(cleanup)
    }

    pub fn set_mesh(&mut self, geometry: MeshGeometry) -> PaintResult<()> {
        self.render.set_mesh(&mut self.device, geometry)
    }

    pub fn set_camera(&mut self, camera: Camera) {
        self.render.set_camera(camera);
        self.paint.mark(SceneDirty::VIEW | SceneDirty::PROJECTION);
    }

    pub fn resize(&mut self, width: u32, height: u32) -> PaintResult<()> {
        self.frames.resize(&mut self.device, &mut self.render, width, height)
    }

    pub fn set_render_mode(&mut self, mode: RenderMode) {
        debug!("Render mode -> {:?}", mode);
        self.params.set_render_mode(mode);
    }

    pub fn create_layer(&mut self) -> PaintResult<LayerId> {
        self.paint.create_layer(&mut self.device)
    }

    pub fn increment_layer(&mut self, id: LayerId) -> PaintResult<u32> {
        self.paint.increment_layer(id)
    }

    pub fn decrement_layer(&mut self, id: LayerId) -> PaintResult<LayerRelease> {
        self.paint.decrement_layer(&mut self.device, id)
    }

    pub fn copy_texture_to_layer(&mut self, src: LayerId, dst: LayerId, region: Region) -> PaintResult<()> {
        self.paint.copy_texture_to_layer(&mut self.device, src, dst, region)
    }

    /// Full readback of a layer
    pub fn read_layer(&mut self, id: LayerId) -> PaintResult<Vec<u8>> {
        let texture = self.paint.layers().texture(id)?;
        let region = self.paint.layers().full_region();
        Ok(self.device.read_region(texture, region)?)
    }

    /// Paint a stroke through `points` on the active layer and commit it
    pub fn stroke(&mut self, points: &[Vec2]) -> PaintResult<Option<u64>> {
        self.projector.stroke(&mut self.device, &self.render, &mut self.paint, points)
    }

    /// Undo the newest stroke, committing any open one first
    pub fn undo(&mut self) -> PaintResult<bool> {
        self.projector.end_stroke(&mut self.device, &mut self.paint)?;
        self.paint.undo(&mut self.device)
    }

    pub fn redo(&mut self) -> PaintResult<bool> {
        self.projector.end_stroke(&mut self.device, &mut self.paint)?;
        self.paint.redo(&mut self.device)
    }

    /// Skip pixel copies for exported frames. No effect when presenting.
    pub fn set_fast_path(&mut self, fast_path: bool) {
        if let Some(exporter) = self.frames.exporter_mut() {
            exporter.set_fast_path(fast_path);
        }
    }

    pub fn export_descriptor(&self) -> Option<&ExportDescriptor> {
        self.frames.exporter().map(|e| e.descriptor())
    }

    pub fn take_export_events(&mut self) -> Vec<ExportEvent> {
        self.frames.exporter_mut().map(|e| e.take_events()).unwrap_or_default()
    }

    /// Host-copy readback of the last exported color image
    pub fn read_exported_color(&self) -> PaintResult<Option<Vec<u8>>> {
        self.frames.exporter().map(|e| e.read_color(&self.device)).transpose()
    }
}

impl<D: GpuDevice> Drop for PaintEngine<D> {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!("Shutdown on drop: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CpuDevice, ExternalSync};
    use crate::plugin::StaticPluginSource;
    use painter_config::{ExportMode, OutputMode};

    const TEXTURE: u32 = 32;
    const EXTENT: u32 = 16;

    fn config() -> EngineConfig {
        EngineConfig {
            texture_size: Some(TEXTURE),
            width: EXTENT,
            height: EXTENT,
            fence_timeout_ms: 5,
            frame_interval_ns: 0,
            ..EngineConfig::default()
        }
    }

    fn engine(config: EngineConfig) -> PaintEngine<CpuDevice> {
        let device = CpuDevice::new(config.memory_budget());
        let mut engine = PaintEngine::new(config, device).unwrap();
        engine.set_mesh(MeshGeometry::plane(1.0)).unwrap();
        engine
    }

    #[test]
    fn test_layer_copy_survives_source_free() {
        let mut engine = engine(config());
        let l1 = engine.create_layer().unwrap();
        assert_eq!(engine.paint().layers().ref_count(l1), Some(1));

        engine.paint_mut().brush_mut().set_radius(0.2);
        let points = [Vec2::new(0.3, 0.5), Vec2::new(0.6, 0.5)];
        assert!(engine.stroke(&points).unwrap().is_some());

        let l2 = engine.create_layer().unwrap();
        let full = engine.paint().layers().full_region();
        engine.copy_texture_to_layer(l1, l2, full).unwrap();
        let painted = engine.read_layer(l1).unwrap();
        assert!(painted.iter().any(|&b| b != 0));
        assert_eq!(engine.read_layer(l2).unwrap(), painted);

        assert_eq!(engine.decrement_layer(l1).unwrap(), LayerRelease::Freed);
        assert!(!engine.paint().layers().contains(l1));
        assert_eq!(engine.read_layer(l2).unwrap(), painted);
        assert_eq!(engine.paint().active_layer(), Some(l2));

        // The copy was not a stroke and L1's history went with it
        assert!(!engine.undo().unwrap());
    }

    #[test]
    fn test_undo_redo_through_engine() {
        let mut engine = engine(config());
        let layer = engine.create_layer().unwrap();
        engine.paint_mut().brush_mut().set_radius(0.2);
        engine.stroke(&[Vec2::splat(0.5)]).unwrap();
        let painted = engine.read_layer(layer).unwrap();

        assert!(engine.undo().unwrap());
        assert!(engine.read_layer(layer).unwrap().iter().all(|&b| b == 0));
        assert!(engine.redo().unwrap());
        assert_eq!(engine.read_layer(layer).unwrap(), painted);
        assert!(!engine.redo().unwrap());
    }

    struct Sweep {
        layer: Option<LayerId>,
        ticks: u32,
    }

    impl PaintPlugin for Sweep {
        fn init(&mut self, ctx: &mut PluginContext<'_>) -> PaintResult<()> {
            self.layer = Some(ctx.create_layer()?);
            ctx.paint.brush_mut().set_radius(0.2);
            Ok(())
        }

        fn update(&mut self, ctx: &mut PluginContext<'_>) -> PaintResult<()> {
            match self.ticks {
                0 => ctx.paint.brush_mut().pen_down(Vec2::new(0.4, 0.5)),
                1 => ctx.paint.brush_mut().set_position(Vec2::new(0.6, 0.5)),
                _ => ctx.paint.brush_mut().pen_up(),
            }
            self.ticks += 1;
            Ok(())
        }

        fn cleanup(&mut self, ctx: &mut PluginContext<'_>) -> PaintResult<()> {
            if let Some(layer) = self.layer.take() {
                ctx.decrement_layer(layer)?;
            }
            Ok(())
        }
    }

    fn sweep(_: PluginImport) -> Option<Box<dyn PaintPlugin>> {
        Some(Box::new(Sweep { layer: None, ticks: 0 }))
    }

    #[test]
    fn test_run_drives_plugin_and_commits_stroke() {
        let mut engine = engine(EngineConfig {
            max_frames: Some(4),
            ..config()
        });
        engine.load_plugin(&StaticPluginSource::new("sweep", sweep)).unwrap();
        engine.init().unwrap();
        assert_eq!(engine.run().unwrap(), 4);
        assert_eq!(engine.frames().frame_index(), 4);
        assert_eq!(engine.paint().ledger().len(), 1);

        engine.shutdown().unwrap();
        assert!(!engine.params().should_run());
        assert_eq!(engine.device().live_textures(), 0);
        assert_eq!(engine.device().total_memory_used(), 0);
    }

    #[test]
    fn test_stalled_export_is_fatal() {
        let mut engine = engine(EngineConfig {
            output_mode: OutputMode::CopyToHost,
            export_mode: ExportMode::External,
            ..config()
        });
        for _ in 0..3 {
            engine.tick().unwrap();
        }
        let err = engine.tick().unwrap_err();
        assert!(matches!(err, PaintError::DeviceLost(_)));
        assert!(!engine.params().should_run());
        assert_eq!(engine.run().unwrap(), 0);
    }

    #[test]
    fn test_paint_and_undo_while_consumer_holds_frame() {
        let mut engine = engine(EngineConfig {
            output_mode: OutputMode::CopyToHost,
            export_mode: ExportMode::External,
            ..config()
        });
        let semaphores = engine.export_descriptor().unwrap().semaphores.unwrap();
        let layer = engine.create_layer().unwrap();
        engine.tick().unwrap();
        // Queued behind a read-done the consumer has not signaled
        engine.tick().unwrap();

        engine.paint_mut().brush_mut().set_radius(0.2);
        assert!(engine.stroke(&[Vec2::splat(0.5)]).unwrap().is_some());
        assert!(engine.undo().unwrap());
        assert!(engine.redo().unwrap());
        assert!(engine.params().should_run());
        assert!(!engine.device().is_lost());

        engine.device_mut().import_and_signal(semaphores.read_done).unwrap();
        assert!(engine.read_layer(layer).unwrap().iter().any(|&b| b != 0));
        assert!(engine.undo().unwrap());
        assert!(engine.read_layer(layer).unwrap().iter().all(|&b| b == 0));
        engine.tick().unwrap();
    }

    #[test]
    fn test_fast_path_leaves_export_untouched() {
        let mut engine = engine(EngineConfig {
            output_mode: OutputMode::CopyToHost,
            export_mode: ExportMode::HostCopy,
            ..config()
        });
        let layer = engine.create_layer().unwrap();
        let first = engine.tick().unwrap();
        assert!(first.copied);
        let exported = engine.read_exported_color().unwrap().unwrap();

        engine.paint_mut().brush_mut().set_radius(0.3);
        engine.stroke(&[Vec2::splat(0.5)]).unwrap();
        assert!(engine.read_layer(layer).unwrap().iter().any(|&b| b != 0));

        engine.set_fast_path(true);
        let second = engine.tick().unwrap();
        assert!(second.composited && !second.copied);
        assert_eq!(engine.read_exported_color().unwrap().unwrap(), exported);

        engine.set_fast_path(false);
        engine.tick().unwrap();
        assert_ne!(engine.read_exported_color().unwrap().unwrap(), exported);

        let events = engine.take_export_events();
        assert!(matches!(events.first(), Some(ExportEvent::Configure(_))));
        let fast: Vec<bool> = events
            .iter()
            .filter_map(|e| match e {
                ExportEvent::FrameReady { fast_path, .. } => Some(*fast_path),
                _ => None,
            })
            .collect();
        assert_eq!(fast, vec![false, true, false]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = EngineConfig {
            frames_in_flight: 0,
            ..config()
        };
        let device = CpuDevice::new(config.memory_budget());
        assert!(matches!(PaintEngine::new(config, device), Err(PaintError::Config(_))));
    }
}
