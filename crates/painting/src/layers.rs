//! Reference-counted layer arena
//!
//! Layers live in generation-tagged slots. A [`LayerId`] stays valid until
//! its count drops to zero; the texture is released on that transition and
//! the slot's generation is bumped so stale ids are rejected.

use tracing::{debug, info};

use crate::device::{Command, CommandBuffer, CompositeInput, GpuDevice, TextureDesc, TextureHandle};
use crate::error::{PaintError, PaintResult};
use crate::types::{BlendMode, LayerId, Region};

/// A live layer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Layer {
    pub texture: TextureHandle,
    pub ref_count: u32,
    pub visible: bool,
    pub blend: BlendMode,
    /// Opacity applied when compositing, 0..=1
    pub opacity: f32,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    layer: Option<Layer>,
}

/// Outcome of [`LayerStack::decrement`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerRelease {
    /// Still referenced, with the remaining count
    Retained(u32),
    /// Count reached zero and the texture was destroyed
    Freed,
}

#[derive(Debug)]
pub struct LayerStack {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Composite order, bottom first
    order: Vec<LayerId>,
    max_layers: u32,
    texture_size: u32,
}

impl LayerStack {
    pub fn new(texture_size: u32, max_layers: u32) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            order: Vec::new(),
            max_layers,
            texture_size,
        }
    }

    /// Edge length of every layer texture
    pub fn texture_size(&self) -> u32 {
        self.texture_size
    }

    pub fn full_region(&self) -> Region {
        Region::full(self.texture_size, self.texture_size)
    }

    /// Allocate a cleared layer with a count of one on top of the composite order
    pub fn create(&mut self, device: &mut dyn GpuDevice) -> PaintResult<LayerId> {
        if self.len() >= self.max_layers as usize {
            return Err(PaintError::ResourceExhausted(format!(
                "layer budget of {} reached",
                self.max_layers
            )));
        }
        let texture = device
            .create_texture(&TextureDesc::rgba8(self.texture_size, self.texture_size))
            .map_err(PaintError::from)?;
        let layer = Layer {
            texture,
            ref_count: 1,
            visible: true,
            blend: BlendMode::Over,
            opacity: 1.0,
        };

        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.layer = Some(layer);
                LayerId::new(index, slot.generation)
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    layer: Some(layer),
                });
                LayerId::new(self.slots.len() as u32 - 1, 0)
            }
        };
        self.order.push(id);
        info!("Created layer {} ({}x{})", id, self.texture_size, self.texture_size);
        Ok(id)
    }

    pub fn increment(&mut self, id: LayerId) -> PaintResult<u32> {
        let layer = self.get_mut(id)?;
        layer.ref_count += 1;
        Ok(layer.ref_count)
    }

    /// Drop one reference; the last one destroys the texture
    pub fn decrement(&mut self, device: &mut dyn GpuDevice, id: LayerId) -> PaintResult<LayerRelease> {
        let layer = self.get_mut(id)?;
        layer.ref_count -= 1;
        if layer.ref_count > 0 {
            return Ok(LayerRelease::Retained(layer.ref_count));
        }

        let texture = layer.texture;
        let slot = &mut self.slots[id.index() as usize];
        slot.layer = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index());
        self.order.retain(|&other| other != id);
        device.destroy_texture(texture);
        info!("Freed layer {}", id);
        Ok(LayerRelease::Freed)
    }

    /// Blit `region` of `src` into the same region of layer `dst`
    pub fn copy_texture_to_layer(
        &mut self,
        device: &mut dyn GpuDevice,
        src: TextureHandle,
        dst: LayerId,
        region: Region,
    ) -> PaintResult<()> {
        let target = self.texture(dst)?;
        if !region.fits_within(self.texture_size, self.texture_size) {
            return Err(PaintError::RegionOutOfBounds {
                region,
                width: self.texture_size,
                height: self.texture_size,
            });
        }
        let source = device.texture_desc(src).map_err(PaintError::from)?;
        if !region.fits_within(source.width, source.height) {
            return Err(PaintError::RegionOutOfBounds {
                region,
                width: source.width,
                height: source.height,
            });
        }
        if region.is_empty() {
            return Ok(());
        }

        let mut cmd = CommandBuffer::new();
        cmd.record(Command::CopyTexture {
            src,
            dst: target,
            region,
        });
        device
            .submit(cmd.submission(Vec::new(), Vec::new(), None))
            .map_err(|err| PaintError::SubmissionFailed(err.to_string()))?;
        debug!("Copied {:?} into layer {}", region, dst);
        Ok(())
    }

    /// Move a layer to `position` in composite order (clamped to the top)
    pub fn move_layer(&mut self, id: LayerId, position: usize) -> PaintResult<()> {
        self.get(id)?;
        self.order.retain(|&other| other != id);
        let position = position.min(self.order.len());
        self.order.insert(position, id);
        Ok(())
    }

    pub fn set_visible(&mut self, id: LayerId, visible: bool) -> PaintResult<()> {
        self.get_mut(id)?.visible = visible;
        Ok(())
    }

    pub fn set_blend(&mut self, id: LayerId, blend: BlendMode, opacity: f32) -> PaintResult<()> {
        let layer = self.get_mut(id)?;
        layer.blend = blend;
        layer.opacity = if opacity.is_nan() { 0.0 } else { opacity.clamp(0.0, 1.0) };
        Ok(())
    }

    /// Layer ids in composite order, bottom first
    pub fn order(&self) -> &[LayerId] {
        &self.order
    }

    /// Visible layers in ascending composite order
    pub fn composite_inputs(&self) -> Vec<CompositeInput> {
        self.order
            .iter()
            .filter_map(|&id| self.get(id).ok())
            .filter(|layer| layer.visible)
            .map(|layer| CompositeInput {
                texture: layer.texture,
                blend: layer.blend,
                opacity: layer.opacity,
            })
            .collect()
    }

    pub fn get(&self, id: LayerId) -> PaintResult<&Layer> {
        self.slots
            .get(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.layer.as_ref())
            .ok_or(PaintError::InvalidHandle(id))
    }

    fn get_mut(&mut self, id: LayerId) -> PaintResult<&mut Layer> {
        self.slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.layer.as_mut())
            .ok_or(PaintError::InvalidHandle(id))
    }

    pub fn texture(&self, id: LayerId) -> PaintResult<TextureHandle> {
        self.get(id).map(|layer| layer.texture)
    }

    pub fn ref_count(&self, id: LayerId) -> Option<u32> {
        self.get(id).ok().map(|layer| layer.ref_count)
    }

    pub fn contains(&self, id: LayerId) -> bool {
        self.get(id).is_ok()
    }

    /// Topmost layer in composite order
    pub fn top(&self) -> Option<LayerId> {
        self.order.last().copied()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Destroy every layer regardless of count (shutdown)
    pub fn release_all(&mut self, device: &mut dyn GpuDevice) {
        for slot in &mut self.slots {
            if let Some(layer) = slot.layer.take() {
                device.destroy_texture(layer.texture);
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
        self.free = (0..self.slots.len() as u32).rev().collect();
        self.order.clear();
    }
}
