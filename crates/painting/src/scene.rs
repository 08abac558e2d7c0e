//! Render and paint scenes
//!
//! [`RenderScene`] holds what the frame draws: camera, mesh and window
//! extent. [`PaintScene`] holds what the brush edits: the brush, the layer
//! stack, the undo ledger and the active layer. Each carries its own dirty
//! mask, cleared by the frame orchestrator once a frame has consumed it.

use std::sync::Arc;

use glam::{Mat4, Vec3};
use tracing::{debug, info};

use crate::brush::Brush;
use crate::device::{AccelerationStructureHandle, CommandBuffer, GpuDevice, TextureHandle};
use crate::error::{PaintError, PaintResult};
use crate::layers::{LayerRelease, LayerStack};
use crate::raycast::MeshGeometry;
use crate::types::{BlendMode, EntryHandle, LayerId, Region, RenderDirty, SceneDirty};
use crate::undo::UndoLedger;

/// Matrix block of the shared uniform buffer
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct UboMatrices {
    pub model: [[f32; 4]; 4],
    pub view: [[f32; 4]; 4],
    pub proj: [[f32; 4]; 4],
    pub view_inv: [[f32; 4]; 4],
    pub proj_inv: [[f32; 4]; 4],
}

/// View and projection transforms
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub view: Mat4,
    pub projection: Mat4,
}

impl Camera {
    /// Right-handed perspective camera looking from `eye` at `target`
    pub fn look_at(eye: Vec3, target: Vec3, fov_y: f32, aspect: f32) -> Self {
        Self {
            view: Mat4::look_at_rh(eye, target, Vec3::Y),
            projection: Mat4::perspective_rh(fov_y, aspect.max(f32::EPSILON), 0.01, 100.0),
        }
    }

    /// World-space camera position
    pub fn eye(&self) -> Vec3 {
        self.view.inverse().transform_point3(Vec3::ZERO)
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::look_at(Vec3::new(0.0, 0.0, 2.0), Vec3::ZERO, 45f32.to_radians(), 1.0)
    }
}

/// Mesh geometry together with its acceleration structure
#[derive(Debug, Clone)]
pub struct SceneMesh {
    pub geometry: Arc<MeshGeometry>,
    pub accel: AccelerationStructureHandle,
}

#[derive(Debug)]
pub struct RenderScene {
    camera: Camera,
    model: Mat4,
    extent: (u32, u32),
    mesh: Option<SceneMesh>,
    dirty: RenderDirty,
}

impl RenderScene {
    pub fn new(width: u32, height: u32) -> Self {
        let mut camera = Camera::default();
        camera.projection =
            Mat4::perspective_rh(45f32.to_radians(), width as f32 / height.max(1) as f32, 0.01, 100.0);
        Self {
            camera,
            model: Mat4::IDENTITY,
            extent: (width, height),
            mesh: None,
            dirty: RenderDirty::ALL,
        }
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn set_camera(&mut self, camera: Camera) {
        self.set_view(camera.view);
        self.set_projection(camera.projection);
    }

    pub fn set_view(&mut self, view: Mat4) {
        if self.camera.view != view {
            self.camera.view = view;
            self.dirty.insert(RenderDirty::VIEW);
        }
    }

    pub fn set_projection(&mut self, projection: Mat4) {
        if self.camera.projection != projection {
            self.camera.projection = projection;
            self.dirty.insert(RenderDirty::PROJECTION);
        }
    }

    pub fn model(&self) -> Mat4 {
        self.model
    }

    pub fn set_model(&mut self, model: Mat4) {
        self.model = model;
        self.dirty.insert(RenderDirty::VIEW);
    }

    pub fn extent(&self) -> (u32, u32) {
        self.extent
    }

    pub fn set_extent(&mut self, width: u32, height: u32) {
        if self.extent != (width, height) {
            self.extent = (width, height);
            self.dirty.insert(RenderDirty::EXTENT);
        }
    }

    pub fn mesh(&self) -> Option<&SceneMesh> {
        self.mesh.as_ref()
    }

    /// Replace the mesh, building its acceleration structure
    pub fn set_mesh(&mut self, device: &mut dyn GpuDevice, geometry: MeshGeometry) -> PaintResult<()> {
        let geometry = Arc::new(geometry);
        let accel = device
            .build_acceleration_structure(Arc::clone(&geometry))
            .map_err(PaintError::from)?;
        if let Some(old) = self.mesh.replace(SceneMesh { geometry, accel }) {
            device.destroy_acceleration_structure(old.accel);
        }
        self.dirty.insert(RenderDirty::MESH);
        info!("Mesh set ({} triangles)", self.mesh.as_ref().map_or(0, |m| m.geometry.triangle_count()));
        Ok(())
    }

    /// Called by the paint side after the composited paint texture changed
    pub fn notify_texture_changed(&mut self) {
        self.dirty.insert(RenderDirty::TEXTURE);
    }

    pub fn matrices(&self) -> UboMatrices {
        UboMatrices {
            model: self.model.to_cols_array_2d(),
            view: self.camera.view.to_cols_array_2d(),
            proj: self.camera.projection.to_cols_array_2d(),
            view_inv: self.camera.view.inverse().to_cols_array_2d(),
            proj_inv: self.camera.projection.inverse().to_cols_array_2d(),
        }
    }

    pub fn dirty(&self) -> RenderDirty {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = RenderDirty::empty();
    }

    pub fn release(&mut self, device: &mut dyn GpuDevice) {
        if let Some(mesh) = self.mesh.take() {
            device.destroy_acceleration_structure(mesh.accel);
        }
    }
}

#[derive(Debug)]
pub struct PaintScene {
    brush: Brush,
    layers: LayerStack,
    ledger: UndoLedger,
    active_layer: Option<LayerId>,
    dirty: SceneDirty,
}

impl PaintScene {
    pub fn new(layers: LayerStack, ledger: UndoLedger) -> Self {
        Self {
            brush: Brush::new(),
            layers,
            ledger,
            active_layer: None,
            dirty: SceneDirty::ALL,
        }
    }

    pub fn brush(&self) -> &Brush {
        &self.brush
    }

    /// Brush setters mark the brush dirty themselves
    pub fn brush_mut(&mut self) -> &mut Brush {
        &mut self.brush
    }

    pub fn layers(&self) -> &LayerStack {
        &self.layers
    }

    pub fn ledger(&self) -> &UndoLedger {
        &self.ledger
    }

    pub fn active_layer(&self) -> Option<LayerId> {
        self.active_layer
    }

    pub fn set_active_layer(&mut self, id: LayerId) -> PaintResult<()> {
        self.layers.get(id)?;
        self.active_layer = Some(id);
        Ok(())
    }

    /// Create a layer; the first one becomes active
    pub fn create_layer(&mut self, device: &mut dyn GpuDevice) -> PaintResult<LayerId> {
        let id = self.layers.create(device)?;
        if self.active_layer.is_none() {
            self.active_layer = Some(id);
        }
        self.dirty.insert(SceneDirty::LAYERS);
        Ok(id)
    }

    pub fn increment_layer(&mut self, id: LayerId) -> PaintResult<u32> {
        self.layers.increment(id)
    }

    /// Drop a reference. Freeing the layer also drops its undo history.
    pub fn decrement_layer(&mut self, device: &mut dyn GpuDevice, id: LayerId) -> PaintResult<LayerRelease> {
        let release = self.layers.decrement(device, id)?;
        if release == LayerRelease::Freed {
            self.ledger.forget_layer(device, id);
            if self.active_layer == Some(id) {
                self.active_layer = self.layers.top();
                debug!("Active layer now {:?}", self.active_layer);
            }
            self.dirty.insert(SceneDirty::LAYERS);
        }
        Ok(release)
    }

    /// Copy `region` of layer `src` into layer `dst`. Not an undoable stroke.
    pub fn copy_texture_to_layer(
        &mut self,
        device: &mut dyn GpuDevice,
        src: LayerId,
        dst: LayerId,
        region: Region,
    ) -> PaintResult<()> {
        let texture = self.layers.texture(src)?;
        self.copy_from_texture(device, texture, dst, region)
    }

    /// Copy `region` of any texture into layer `dst`
    pub fn copy_from_texture(
        &mut self,
        device: &mut dyn GpuDevice,
        src: TextureHandle,
        dst: LayerId,
        region: Region,
    ) -> PaintResult<()> {
        self.layers.copy_texture_to_layer(device, src, dst, region)?;
        self.dirty.insert(SceneDirty::LAYERS);
        Ok(())
    }

    pub fn move_layer(&mut self, id: LayerId, position: usize) -> PaintResult<()> {
        self.layers.move_layer(id, position)?;
        self.dirty.insert(SceneDirty::LAYERS);
        Ok(())
    }

    pub fn set_layer_visible(&mut self, id: LayerId, visible: bool) -> PaintResult<()> {
        self.layers.set_visible(id, visible)?;
        self.dirty.insert(SceneDirty::LAYERS);
        Ok(())
    }

    pub fn set_layer_blend(&mut self, id: LayerId, blend: BlendMode, opacity: f32) -> PaintResult<()> {
        self.layers.set_blend(id, blend, opacity)?;
        self.dirty.insert(SceneDirty::LAYERS);
        Ok(())
    }

    /// Begin an undo entry; the snapshot copies land in `commands`
    pub fn begin_stroke(
        &mut self,
        device: &mut dyn GpuDevice,
        layer: LayerId,
        region: Region,
        commands: &mut CommandBuffer,
    ) -> PaintResult<EntryHandle> {
        self.ledger.begin_stroke(device, &self.layers, layer, region, commands)
    }

    pub fn extend_stroke(
        &mut self,
        device: &mut dyn GpuDevice,
        handle: EntryHandle,
        region: Region,
        commands: &mut CommandBuffer,
    ) -> PaintResult<()> {
        self.ledger.extend_stroke(device, &self.layers, handle, region, commands)
    }

    pub fn commit_stroke(&mut self, device: &mut dyn GpuDevice, handle: EntryHandle) -> PaintResult<Option<u64>> {
        self.ledger.commit_stroke(device, handle)
    }

    pub fn abort_stroke(&mut self, device: &mut dyn GpuDevice, handle: EntryHandle) -> bool {
        self.ledger.abort_stroke(device, handle)
    }

    pub fn undo(&mut self, device: &mut dyn GpuDevice) -> PaintResult<bool> {
        let changed = self.ledger.undo(device, &self.layers)?;
        if changed {
            self.dirty.insert(SceneDirty::LAYERS);
        }
        Ok(changed)
    }

    pub fn redo(&mut self, device: &mut dyn GpuDevice) -> PaintResult<bool> {
        let changed = self.ledger.redo(device, &self.layers)?;
        if changed {
            self.dirty.insert(SceneDirty::LAYERS);
        }
        Ok(changed)
    }

    pub fn mark(&mut self, flags: SceneDirty) {
        self.dirty.insert(flags);
    }

    /// Pending changes, including brush edits
    pub fn dirty(&self) -> SceneDirty {
        let mut dirty = self.dirty;
        if self.brush.is_dirty() {
            dirty.insert(SceneDirty::BRUSH);
        }
        dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = SceneDirty::empty();
        self.brush.clear_dirty();
    }

    pub fn release(&mut self, device: &mut dyn GpuDevice) {
        self.ledger.release(device);
        self.layers.release_all(device);
        self.active_layer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CpuDevice;
    use painter_config::TextureTier;

    fn device() -> CpuDevice {
        CpuDevice::new(TextureTier::K4.memory_budget())
    }

    fn paint_scene() -> PaintScene {
        PaintScene::new(LayerStack::new(16, 4), UndoLedger::new(4, u64::MAX))
    }

    #[test]
    fn test_camera_eye() {
        let camera = Camera::look_at(Vec3::new(1.0, 2.0, 3.0), Vec3::ZERO, 1.0, 1.0);
        assert!((camera.eye() - Vec3::new(1.0, 2.0, 3.0)).length() < 1e-4);
    }

    #[test]
    fn test_render_dirty_flags() {
        let mut device = device();
        let mut scene = RenderScene::new(8, 8);
        assert_eq!(scene.dirty(), RenderDirty::ALL);
        scene.clear_dirty();

        scene.set_extent(8, 8);
        assert!(scene.dirty().is_empty());
        scene.set_extent(16, 8);
        scene.set_mesh(&mut device, MeshGeometry::plane(1.0)).unwrap();
        scene.notify_texture_changed();
        assert!(scene.dirty().contains(RenderDirty::EXTENT | RenderDirty::MESH | RenderDirty::TEXTURE));
        assert!(!scene.dirty().intersects(RenderDirty::VIEW));
    }

    #[test]
    fn test_matrices_are_inverses() {
        let scene = RenderScene::new(4, 3);
        let m = scene.matrices();
        let view = Mat4::from_cols_array_2d(&m.view);
        let view_inv = Mat4::from_cols_array_2d(&m.view_inv);
        assert!((view * view_inv).abs_diff_eq(Mat4::IDENTITY, 1e-4));
    }

    #[test]
    fn test_first_layer_becomes_active() {
        let mut device = device();
        let mut scene = paint_scene();
        let a = scene.create_layer(&mut device).unwrap();
        let b = scene.create_layer(&mut device).unwrap();
        assert_eq!(scene.active_layer(), Some(a));
        scene.decrement_layer(&mut device, a).unwrap();
        assert_eq!(scene.active_layer(), Some(b));
    }

    #[test]
    fn test_brush_dirty_reported_and_cleared() {
        let mut scene = paint_scene();
        scene.clear_dirty();
        assert!(scene.dirty().is_empty());
        scene.brush_mut().set_radius(0.2);
        assert!(scene.dirty().contains(SceneDirty::BRUSH));
        scene.clear_dirty();
        assert!(!scene.brush().is_dirty());
    }

    #[test]
    fn test_freed_layer_history_purged() {
        let mut device = device();
        let mut scene = paint_scene();
        let layer = scene.create_layer(&mut device).unwrap();
        let mut commands = CommandBuffer::new();
        let handle = scene
            .begin_stroke(&mut device, layer, Region::new(0, 0, 4, 4), &mut commands)
            .unwrap();
        device.submit(commands.submission(vec![], vec![], None)).unwrap();
        scene.commit_stroke(&mut device, handle).unwrap();
        assert_eq!(scene.ledger().len(), 1);

        scene.decrement_layer(&mut device, layer).unwrap();
        assert!(scene.ledger().is_empty());
        assert!(!scene.undo(&mut device).unwrap());
    }
}
