//! Host-visible block allocator
//!
//! Small host-visible allocations (uniform blocks, binding tables) are carved
//! out of one buffer with a bump pointer. Blocks live as long as the arena.

use tracing::debug;

use crate::device::{BufferDesc, BufferHandle, BufferSlice, GpuDevice, MemoryKind};
use crate::error::{PaintError, PaintResult};

#[derive(Debug)]
pub struct HostArena {
    buffer: BufferHandle,
    size: u64,
    cursor: u64,
}

impl HostArena {
    pub fn new(device: &mut dyn GpuDevice, size: u64) -> PaintResult<Self> {
        let buffer = device.create_buffer(&BufferDesc {
            size,
            memory: MemoryKind::HostVisible,
        })?;
        Ok(Self {
            buffer,
            size,
            cursor: 0,
        })
    }

    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    /// Reserve `size` bytes whose offset is a multiple of `alignment`
    pub fn allocate(&mut self, size: u64, alignment: u64) -> PaintResult<BufferSlice> {
        let alignment = alignment.max(1);
        let offset = self.cursor.div_ceil(alignment) * alignment;
        let end = offset.checked_add(size).filter(|&end| end <= self.size);
        let Some(end) = end else {
            return Err(PaintError::ResourceExhausted(format!(
                "host arena: {size} bytes at alignment {alignment}, {} of {} used",
                self.cursor, self.size
            )));
        };
        self.cursor = end;
        debug!("Host block {}..{} (align {})", offset, end, alignment);
        Ok(BufferSlice {
            buffer: self.buffer,
            offset,
            size,
        })
    }

    /// Bytes handed out so far, including alignment padding
    pub fn used(&self) -> u64 {
        self.cursor
    }

    pub fn release(self, device: &mut dyn GpuDevice) {
        device.destroy_buffer(self.buffer);
    }
}
