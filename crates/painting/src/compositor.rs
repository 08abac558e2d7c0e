//! Layer compositing
//!
//! Records the pass that flattens the visible layers, bottom first, into the
//! paint texture the view passes sample.

use tracing::debug;

use crate::device::{Command, CommandBuffer, TextureHandle};
use crate::layers::LayerStack;

/// Record a composite of `layers` into `target`. Returns the number of
/// layers blended.
pub fn record_composite(cmd: &mut CommandBuffer, target: TextureHandle, layers: &LayerStack) -> usize {
    let inputs = layers.composite_inputs();
    let count = inputs.len();
    cmd.record(Command::Composite { target, layers: inputs });
    debug!("Compositing {} of {} layers", count, layers.len());
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CpuDevice, GpuDevice, TextureDesc};
    use crate::types::{BlendMode, Region};
    use painter_config::TextureTier;

    const SIZE: u32 = 4;

    fn fill(device: &mut CpuDevice, texture: TextureHandle, texel: [u8; 4]) {
        let data: Vec<u8> = std::iter::repeat_n(texel, (SIZE * SIZE) as usize).flatten().collect();
        device.write_region(texture, Region::full(SIZE, SIZE), &data).unwrap();
    }

    fn composite(device: &mut CpuDevice, layers: &LayerStack) -> Vec<u8> {
        let target = device.create_texture(&TextureDesc::rgba8(SIZE, SIZE)).unwrap();
        let mut cmd = CommandBuffer::new();
        record_composite(&mut cmd, target, layers);
        device.submit(cmd.submission(vec![], vec![], None)).unwrap();
        device.read_region(target, Region::new(0, 0, 1, 1)).unwrap()
    }

    #[test]
    fn test_top_layer_wins_when_opaque() {
        let mut device = CpuDevice::new(TextureTier::K4.memory_budget());
        let mut layers = LayerStack::new(SIZE, 4);
        let bottom = layers.create(&mut device).unwrap();
        let top = layers.create(&mut device).unwrap();
        fill(&mut device, layers.texture(bottom).unwrap(), [255, 0, 0, 255]);
        fill(&mut device, layers.texture(top).unwrap(), [0, 0, 255, 255]);
        assert_eq!(composite(&mut device, &layers), vec![0, 0, 255, 255]);

        layers.move_layer(top, 0).unwrap();
        assert_eq!(composite(&mut device, &layers), vec![255, 0, 0, 255]);
    }

    #[test]
    fn test_hidden_and_erase_layers() {
        let mut device = CpuDevice::new(TextureTier::K4.memory_budget());
        let mut layers = LayerStack::new(SIZE, 4);
        let base = layers.create(&mut device).unwrap();
        let eraser = layers.create(&mut device).unwrap();
        fill(&mut device, layers.texture(base).unwrap(), [0, 255, 0, 255]);
        fill(&mut device, layers.texture(eraser).unwrap(), [0, 0, 0, 255]);

        layers.set_blend(eraser, BlendMode::Erase, 1.0).unwrap();
        assert_eq!(composite(&mut device, &layers)[3], 0);

        layers.set_visible(eraser, false).unwrap();
        assert_eq!(composite(&mut device, &layers), vec![0, 255, 0, 255]);
    }

    #[test]
    fn test_empty_stack_clears_target() {
        let mut device = CpuDevice::new(TextureTier::K4.memory_budget());
        let layers = LayerStack::new(SIZE, 4);
        assert_eq!(composite(&mut device, &layers), vec![0; 4]);
    }
}
