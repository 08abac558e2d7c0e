//! Paint projector
//!
//! Projects brush dabs onto the active layer with a ray-tracing pass. Each
//! dab traces one ray per texel of its footprint: the closest hit resolves
//! the surface point carrying that texel's UV, the occlusion miss decides
//! whether the camera can see it, and the brush falloff weights the blend.
//!
//! Strokes are delimited by the pen: the first dab begins an undo entry,
//! later dabs extend it, and pen up commits it.

use glam::Vec2;
use tracing::{debug, info};

use crate::brush::Brush;
use crate::device::{
    BufferSlice, Command, CommandBuffer, GpuDevice, PipelineHandle, PushConstants, SemaphoreHandle,
    ShaderGroup, ShaderProgram, TraceBindings, UNIFORM_BLOCK_SIZE, Uniforms,
};
use crate::error::{PaintError, PaintResult};
use crate::memory::HostArena;
use crate::raycast::MeshGeometry;
use crate::sbt::{SbtLayout, ShaderBindingTable};
use crate::scene::{PaintScene, RenderScene};
use crate::types::{EntryHandle, LayerId, Region, SceneDirty};

/// Pipeline groups in binding-table order
pub const PAINT_GROUPS: [ShaderProgram; 4] = [
    ShaderProgram::PaintRaygen,
    ShaderProgram::PrimaryMiss,
    ShaderProgram::OcclusionMiss,
    ShaderProgram::SurfaceClosestHit,
];

/// Minimum alignment of uniform blocks in the host arena
pub(crate) const UNIFORM_ALIGNMENT: u64 = 256;

#[derive(Debug, Clone, Copy)]
struct ActiveStroke {
    handle: EntryHandle,
    layer: LayerId,
    dabs: u32,
}

#[derive(Debug)]
pub struct PaintProjector {
    pipeline: PipelineHandle,
    sbt: ShaderBindingTable,
    uniforms: BufferSlice,
    /// Signaled by the first dab of a frame, waited on by the frame submission
    paint_done: SemaphoreHandle,
    signal_pending: bool,
    stroke: Option<ActiveStroke>,
    occlusion_test: bool,
    commands: CommandBuffer,
}

impl PaintProjector {
    pub fn new(device: &mut dyn GpuDevice, arena: &mut HostArena, occlusion_test: bool) -> PaintResult<Self> {
        let groups = PAINT_GROUPS.map(ShaderGroup::new);
        let pipeline = device.create_ray_tracing_pipeline(&groups)?;
        let sbt = ShaderBindingTable::build(device, arena, pipeline, SbtLayout::STANDARD)?;
        let uniforms = arena.allocate(UNIFORM_BLOCK_SIZE, UNIFORM_ALIGNMENT)?;
        let paint_done = device.create_semaphore(false)?;
        info!("Paint projector ready (occlusion test {})", occlusion_test);
        Ok(Self {
            pipeline,
            sbt,
            uniforms,
            paint_done,
            signal_pending: false,
            stroke: None,
            occlusion_test,
            commands: CommandBuffer::new(),
        })
    }

    pub fn sbt(&self) -> &ShaderBindingTable {
        &self.sbt
    }

    pub fn set_occlusion_test(&mut self, enabled: bool) {
        self.occlusion_test = enabled;
    }

    pub fn in_stroke(&self) -> bool {
        self.stroke.is_some()
    }

    /// Texels a dab can touch: the brush circle, clipped to the mesh UV
    /// bounds and the texture. `None` when nothing is left.
    pub fn footprint(brush: &Brush, mesh: &MeshGeometry, texture_size: u32) -> Option<Region> {
        if brush.is_noop() {
            return None;
        }
        let reach = Vec2::splat(brush.radius());
        let (uv_min, uv_max) = mesh.uv_bounds();
        let lo = (brush.position() - reach).max(uv_min).max(Vec2::ZERO);
        let hi = (brush.position() + reach).min(uv_max).min(Vec2::ONE);
        if lo.x >= hi.x || lo.y >= hi.y {
            return None;
        }

        let size = texture_size as f32;
        let x0 = (lo.x * size).floor() as u32;
        let y0 = (lo.y * size).floor() as u32;
        let x1 = ((hi.x * size).ceil() as u32).min(texture_size);
        let y1 = ((hi.y * size).ceil() as u32).min(texture_size);
        let region = Region::new(x0, y0, x1.saturating_sub(x0), y1.saturating_sub(y0));
        (!region.is_empty()).then_some(region)
    }

    /// Project one dab at the current brush position. Returns whether any
    /// GPU work was submitted.
    pub fn dab(
        &mut self,
        device: &mut dyn GpuDevice,
        render: &RenderScene,
        paint: &mut PaintScene,
    ) -> PaintResult<bool> {
        let Some(layer) = paint.active_layer() else {
            debug!("Dab skipped: no active layer");
            return Ok(false);
        };
        let Some(mesh) = render.mesh() else {
            debug!("Dab skipped: no mesh");
            return Ok(false);
        };
        let texture_size = paint.layers().texture_size();
        let Some(footprint) = Self::footprint(paint.brush(), &mesh.geometry, texture_size) else {
            debug!("Dab skipped: empty footprint");
            return Ok(false);
        };
        let target = paint.layers().texture(layer)?;

        // Snapshot copies go in ahead of the trace that overwrites them
        self.commands.reset();
        match self.stroke {
            Some(stroke) if stroke.layer == layer && paint.ledger().is_pending(stroke.handle) => {
                paint.extend_stroke(device, stroke.handle, footprint, &mut self.commands)?;
            }
            current => {
                if let Some(stroke) = current {
                    Self::commit(device, paint, stroke)?;
                }
                let handle = paint.begin_stroke(device, layer, footprint, &mut self.commands)?;
                self.stroke = Some(ActiveStroke { handle, layer, dabs: 0 });
            }
        }

        let uniforms = Uniforms {
            matrices: render.matrices(),
            brush: paint.brush().ubo(),
        };
        self.commands.record(Command::UpdateBuffer {
            buffer: self.uniforms.buffer,
            offset: self.uniforms.offset,
            data: bytemuck::bytes_of(&uniforms).to_vec(),
        });
        self.commands.record(Command::TraceRays {
            pipeline: self.pipeline,
            sbt: self.sbt.regions(),
            launch: footprint,
            bindings: TraceBindings {
                accel: mesh.accel,
                uniforms: self.uniforms,
                target,
                depth: None,
                paint_texture: None,
                push: PushConstants::default(),
                occlusion_test: self.occlusion_test,
            },
        });

        let signal = if self.signal_pending { Vec::new() } else { vec![self.paint_done] };
        device
            .submit(self.commands.submission(Vec::new(), signal, None))
            .map_err(|err| PaintError::SubmissionFailed(err.to_string()))?;
        self.signal_pending = true;

        if let Some(stroke) = self.stroke.as_mut() {
            stroke.dabs += 1;
        }
        paint.mark(SceneDirty::LAYERS);
        debug!("Dab on layer {} over {:?}", layer, footprint);
        Ok(true)
    }

    /// Commit the open stroke, if any. Returns the ledger sequence number.
    pub fn end_stroke(&mut self, device: &mut dyn GpuDevice, paint: &mut PaintScene) -> PaintResult<Option<u64>> {
        let Some(stroke) = self.stroke.take() else {
            return Ok(None);
        };
        debug!("Stroke on layer {} ended after {} dabs", stroke.layer, stroke.dabs);
        Self::commit(device, paint, stroke)
    }

    fn commit(device: &mut dyn GpuDevice, paint: &mut PaintScene, stroke: ActiveStroke) -> PaintResult<Option<u64>> {
        // Freeing the layer mid-stroke already dropped the pending entry
        if !paint.ledger().is_pending(stroke.handle) {
            return Ok(None);
        }
        paint.commit_stroke(device, stroke.handle)
    }

    /// Paint a whole stroke through `points` and commit it
    pub fn stroke(
        &mut self,
        device: &mut dyn GpuDevice,
        render: &RenderScene,
        paint: &mut PaintScene,
        points: &[Vec2],
    ) -> PaintResult<Option<u64>> {
        self.end_stroke(device, paint)?;
        for &point in points {
            paint.brush_mut().pen_down(point);
            self.dab(device, render, paint)?;
        }
        paint.brush_mut().pen_up();
        self.end_stroke(device, paint)
    }

    /// Per-tick brush handling: dab while the pen is down and the brush
    /// changed, commit on pen up
    pub fn sync(
        &mut self,
        device: &mut dyn GpuDevice,
        render: &RenderScene,
        paint: &mut PaintScene,
    ) -> PaintResult<bool> {
        if paint.brush().is_active() {
            if paint.brush().is_dirty() {
                return self.dab(device, render, paint);
            }
            return Ok(false);
        }
        self.end_stroke(device, paint)?;
        Ok(false)
    }

    /// Semaphore the next frame submission must wait on, if a dab signaled it
    pub fn take_paint_done(&mut self) -> Option<SemaphoreHandle> {
        std::mem::take(&mut self.signal_pending).then_some(self.paint_done)
    }

    pub fn release(&mut self, device: &mut dyn GpuDevice) {
        device.destroy_pipeline(self.pipeline);
        device.destroy_semaphore(self.paint_done);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CpuDevice;
    use crate::layers::LayerStack;
    use crate::undo::UndoLedger;
    use painter_config::TextureTier;

    const SIZE: u32 = 32;

    struct Fixture {
        device: CpuDevice,
        render: RenderScene,
        paint: PaintScene,
        projector: PaintProjector,
        layer: LayerId,
    }

    fn fixture() -> Fixture {
        let mut device = CpuDevice::new(TextureTier::K4.memory_budget());
        let mut arena = HostArena::new(&mut device, 4096).unwrap();
        let mut render = RenderScene::new(16, 16);
        render.set_mesh(&mut device, MeshGeometry::plane(1.0)).unwrap();
        let mut paint = PaintScene::new(LayerStack::new(SIZE, 4), UndoLedger::new(8, u64::MAX));
        let layer = paint.create_layer(&mut device).unwrap();
        let projector = PaintProjector::new(&mut device, &mut arena, true).unwrap();
        paint.brush_mut().set_radius(0.1);
        paint.brush_mut().set_color([1.0, 0.0, 0.0]);
        Fixture {
            device,
            render,
            paint,
            projector,
            layer,
        }
    }

    fn layer_pixels(f: &mut Fixture) -> Vec<u8> {
        let texture = f.paint.layers().texture(f.layer).unwrap();
        f.device.read_region(texture, Region::full(SIZE, SIZE)).unwrap()
    }

    fn texel(pixels: &[u8], x: u32, y: u32) -> [u8; 4] {
        let i = ((y * SIZE + x) * 4) as usize;
        [pixels[i], pixels[i + 1], pixels[i + 2], pixels[i + 3]]
    }

    #[test]
    fn test_footprint_clipped_to_uv_bounds() {
        let mesh = MeshGeometry::plane(1.0);
        let mut brush = Brush::new();
        brush.set_radius(0.25);
        brush.set_position(Vec2::new(0.0, 0.5));
        let region = PaintProjector::footprint(&brush, &mesh, 64).unwrap();
        assert_eq!(region, Region::new(0, 16, 16, 32));

        brush.set_position(Vec2::new(2.0, 2.0));
        assert_eq!(PaintProjector::footprint(&brush, &mesh, 64), None);
    }

    #[test]
    fn test_dab_paints_center_of_brush() {
        let mut f = fixture();
        f.paint.brush_mut().pen_down(Vec2::new(0.5, 0.5));
        assert!(f.projector.dab(&mut f.device, &f.render, &mut f.paint).unwrap());
        assert!(f.projector.in_stroke());

        let pixels = layer_pixels(&mut f);
        let center = texel(&pixels, 16, 16);
        assert!(center[0] > 200 && center[1] == 0 && center[3] > 150);
        assert_eq!(texel(&pixels, 0, 0), [0; 4]);
        assert!(f.paint.dirty().contains(SceneDirty::LAYERS));
    }

    #[test]
    fn test_zero_brush_is_noop() {
        let mut f = fixture();
        f.paint.brush_mut().set_opacity(0.0);
        let sequence = f
            .projector
            .stroke(&mut f.device, &f.render, &mut f.paint, &[Vec2::splat(0.5)])
            .unwrap();
        assert_eq!(sequence, None);

        f.paint.brush_mut().set_opacity(1.0);
        f.paint.brush_mut().set_radius(0.0);
        f.projector
            .stroke(&mut f.device, &f.render, &mut f.paint, &[Vec2::splat(0.5)])
            .unwrap();

        assert!(f.paint.ledger().is_empty());
        assert!(layer_pixels(&mut f).iter().all(|&b| b == 0));
        assert_eq!(f.device.stats().rays_traced, 0);
    }

    #[test]
    fn test_outside_mesh_is_noop() {
        let mut f = fixture();
        let sequence = f
            .projector
            .stroke(&mut f.device, &f.render, &mut f.paint, &[Vec2::new(3.0, 3.0)])
            .unwrap();
        assert_eq!(sequence, None);
        assert!(f.paint.ledger().is_empty());
    }

    #[test]
    fn test_stroke_commits_one_entry_and_undoes() {
        let mut f = fixture();
        let points = [Vec2::new(0.3, 0.5), Vec2::new(0.5, 0.5), Vec2::new(0.7, 0.5)];
        let sequence = f.projector.stroke(&mut f.device, &f.render, &mut f.paint, &points).unwrap();
        assert!(sequence.is_some());
        assert_eq!(f.paint.ledger().len(), 1);
        assert!(!f.projector.in_stroke());
        assert!(layer_pixels(&mut f).iter().any(|&b| b != 0));

        assert!(f.paint.undo(&mut f.device).unwrap());
        assert!(layer_pixels(&mut f).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_occluded_texels_skipped() {
        let mut f = fixture();
        // Camera behind the plane: every texel is hidden by the back of the mesh
        let blocker = MeshGeometry::new(
            vec![
                glam::Vec3::new(-2.0, -2.0, 1.0),
                glam::Vec3::new(2.0, -2.0, 1.0),
                glam::Vec3::new(2.0, 2.0, 1.0),
                glam::Vec3::new(-1.0, -1.0, 0.0),
                glam::Vec3::new(1.0, -1.0, 0.0),
                glam::Vec3::new(1.0, 1.0, 0.0),
            ],
            vec![glam::Vec3::Z; 6],
            vec![
                Vec2::new(5.0, 5.0),
                Vec2::new(6.0, 5.0),
                Vec2::new(6.0, 6.0),
                Vec2::new(0.0, 0.0),
                Vec2::new(1.0, 0.0),
                Vec2::new(1.0, 1.0),
            ],
            vec![0, 1, 2, 3, 4, 5],
        )
        .unwrap();
        f.render.set_mesh(&mut f.device, blocker).unwrap();
        f.paint.brush_mut().pen_down(Vec2::new(0.75, 0.25));
        f.projector.dab(&mut f.device, &f.render, &mut f.paint).unwrap();
        let hidden = layer_pixels(&mut f);
        assert!(hidden.iter().all(|&b| b == 0));

        f.projector.set_occlusion_test(false);
        f.projector.dab(&mut f.device, &f.render, &mut f.paint).unwrap();
        assert!(layer_pixels(&mut f).iter().any(|&b| b != 0));
    }

    #[test]
    fn test_sync_follows_pen() {
        let mut f = fixture();
        f.paint.brush_mut().pen_down(Vec2::splat(0.5));
        assert!(f.projector.sync(&mut f.device, &f.render, &mut f.paint).unwrap());
        f.paint.clear_dirty();
        assert!(!f.projector.sync(&mut f.device, &f.render, &mut f.paint).unwrap());

        f.paint.brush_mut().set_position(Vec2::splat(0.6));
        assert!(f.projector.sync(&mut f.device, &f.render, &mut f.paint).unwrap());
        assert!(f.projector.take_paint_done().is_some());
        assert_eq!(f.projector.take_paint_done(), None);

        f.paint.brush_mut().pen_up();
        f.projector.sync(&mut f.device, &f.render, &mut f.paint).unwrap();
        assert!(!f.projector.in_stroke());
        assert_eq!(f.paint.ledger().len(), 1);
    }
}
