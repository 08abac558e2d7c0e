//! External frame exporter
//!
//! Instead of presenting, a finished frame's swap image and depth are copied
//! into one buffer: color at offset 0, depth right after it, 4 bytes per
//! pixel each. In host-copy mode the buffer is host-visible transfer memory
//! and the engine waits the frame fence before anyone reads it. In external
//! mode the buffer lives in exportable memory and synchronization goes
//! through exported semaphores: the engine signals `frame_done[slot]`, the
//! consumer signals `read_done`, and the next frame's submission waits on
//! `read_done` before overwriting the buffer.
//!
//! With the fast path set, frames only signal; the buffer is left alone.

use std::time::Duration;

use painter_config::ExportMode;
use painter_ipc::{ELEMENT_SIZE, ExportDescriptor, ExportEvent, ExternalMemory, ExternalSemaphores};
use tracing::{debug, info};

use crate::device::{
    BufferDesc, BufferHandle, Command, CommandBuffer, Exportable, FenceHandle, GpuDevice,
    MemoryKind, SemaphoreHandle, TextureHandle,
};
use crate::error::PaintResult;

#[derive(Debug)]
pub struct FrameExporter {
    mode: ExportMode,
    width: u32,
    height: u32,
    buffer: BufferHandle,
    frame_done: [SemaphoreHandle; 2],
    read_done: SemaphoreHandle,
    /// The consumer has not yet released the last exported frame
    awaiting_read: bool,
    fast_path: bool,
    descriptor: ExportDescriptor,
    events: Vec<ExportEvent>,
}

impl FrameExporter {
    pub fn new(device: &mut dyn GpuDevice, mode: ExportMode, width: u32, height: u32) -> PaintResult<Self> {
        let exportable = mode == ExportMode::External;
        let frame_done = [device.create_semaphore(exportable)?, device.create_semaphore(exportable)?];
        let read_done = device.create_semaphore(exportable)?;
        let buffer = create_buffer(device, mode, width, height)?;

        let mut exporter = Self {
            mode,
            width,
            height,
            buffer,
            frame_done,
            read_done,
            awaiting_read: false,
            fast_path: false,
            descriptor: ExportDescriptor {
                width,
                height,
                element_size: ELEMENT_SIZE,
                memory: None,
                semaphores: None,
            },
            events: Vec::new(),
        };
        exporter.describe(device)?;
        info!("Frame export ready ({:?}, {}x{})", mode, width, height);
        Ok(exporter)
    }

    pub fn mode(&self) -> ExportMode {
        self.mode
    }

    pub fn fast_path(&self) -> bool {
        self.fast_path
    }

    /// Skip pixel copies; frames still signal completion
    pub fn set_fast_path(&mut self, fast_path: bool) {
        self.fast_path = fast_path;
    }

    pub fn descriptor(&self) -> &ExportDescriptor {
        &self.descriptor
    }

    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    /// Bytes of one image (color or depth)
    pub fn image_size(&self) -> u64 {
        self.descriptor.buffer_size()
    }

    pub fn color_offset(&self) -> u64 {
        0
    }

    pub fn depth_offset(&self) -> u64 {
        self.image_size()
    }

    pub fn frame_done(&self, slot: usize) -> SemaphoreHandle {
        self.frame_done[slot % 2]
    }

    pub fn read_done(&self) -> SemaphoreHandle {
        self.read_done
    }

    pub fn awaiting_read(&self) -> bool {
        self.awaiting_read
    }

    /// Record the color and depth copies unless on the fast path. Returns
    /// whether anything was recorded.
    pub fn record_copies(&self, cmd: &mut CommandBuffer, color: TextureHandle, depth: TextureHandle) -> bool {
        if self.fast_path {
            return false;
        }
        cmd.record(Command::CopyTextureToBuffer {
            texture: color,
            buffer: self.buffer,
            offset: self.color_offset(),
        });
        cmd.record(Command::CopyTextureToBuffer {
            texture: depth,
            buffer: self.buffer,
            offset: self.depth_offset(),
        });
        true
    }

    /// Semaphores the frame submission must wait on before touching the buffer
    pub fn take_waits(&mut self) -> Vec<SemaphoreHandle> {
        if self.mode == ExportMode::External && std::mem::take(&mut self.awaiting_read) {
            vec![self.read_done]
        } else {
            Vec::new()
        }
    }

    /// Semaphores the frame submission signals for the consumer
    pub fn signals(&self, slot: usize) -> Vec<SemaphoreHandle> {
        match self.mode {
            ExportMode::External => vec![self.frame_done(slot)],
            ExportMode::HostCopy => Vec::new(),
        }
    }

    /// Hand the submitted frame over to the consumer
    pub fn finish(
        &mut self,
        device: &mut dyn GpuDevice,
        frame: u64,
        slot: usize,
        fence: FenceHandle,
        timeout: Duration,
    ) -> PaintResult<()> {
        match self.mode {
            ExportMode::HostCopy => {
                // A frame that never retires is a lost device
                device.wait_fence(fence, timeout)?;
            }
            ExportMode::External => self.awaiting_read = true,
        }
        self.events.push(ExportEvent::FrameReady {
            frame,
            slot: (slot % 2) as u32,
            fast_path: self.fast_path,
        });
        debug!("Exported frame {} (slot {}, fast path {})", frame, slot % 2, self.fast_path);
        Ok(())
    }

    /// Host-copy readback of the color image
    pub fn read_color(&self, device: &dyn GpuDevice) -> PaintResult<Vec<u8>> {
        Ok(device.read_buffer(self.buffer, self.color_offset(), self.image_size())?)
    }

    pub fn read_depth(&self, device: &dyn GpuDevice) -> PaintResult<Vec<u8>> {
        Ok(device.read_buffer(self.buffer, self.depth_offset(), self.image_size())?)
    }

    /// Drain protocol events for the consumer
    pub fn take_events(&mut self) -> Vec<ExportEvent> {
        std::mem::take(&mut self.events)
    }

    /// Reallocate for a new extent. The device must be idle.
    pub fn resize(&mut self, device: &mut dyn GpuDevice, width: u32, height: u32) -> PaintResult<()> {
        device.destroy_buffer(self.buffer);
        self.buffer = create_buffer(device, self.mode, width, height)?;
        self.width = width;
        self.height = height;
        self.awaiting_read = false;
        self.describe(device)
    }

    /// Rebuild the descriptor and announce it
    fn describe(&mut self, device: &mut dyn GpuDevice) -> PaintResult<()> {
        let mut descriptor = ExportDescriptor {
            width: self.width,
            height: self.height,
            element_size: ELEMENT_SIZE,
            memory: None,
            semaphores: None,
        };
        if self.mode == ExportMode::External {
            let size = descriptor.buffer_size();
            descriptor.memory = Some(ExternalMemory {
                handle: device.export_handle(Exportable::Memory(self.buffer))?,
                size: size * 2,
                color_offset: 0,
                depth_offset: size,
            });
            descriptor.semaphores = Some(ExternalSemaphores {
                frame_done: [
                    device.export_handle(Exportable::Semaphore(self.frame_done[0]))?,
                    device.export_handle(Exportable::Semaphore(self.frame_done[1]))?,
                ],
                read_done: device.export_handle(Exportable::Semaphore(self.read_done))?,
            });
        }
        descriptor.validate()?;
        self.events.push(ExportEvent::Configure(descriptor.clone()));
        self.descriptor = descriptor;
        Ok(())
    }

    pub fn release(&mut self, device: &mut dyn GpuDevice) {
        self.events.push(ExportEvent::Shutdown);
        device.destroy_buffer(self.buffer);
        for semaphore in self.frame_done {
            device.destroy_semaphore(semaphore);
        }
        device.destroy_semaphore(self.read_done);
    }
}

fn create_buffer(device: &mut dyn GpuDevice, mode: ExportMode, width: u32, height: u32) -> PaintResult<BufferHandle> {
    let memory = match mode {
        ExportMode::HostCopy => MemoryKind::HostTransfer,
        ExportMode::External => MemoryKind::External,
    };
    let size = u64::from(width) * u64::from(height) * u64::from(ELEMENT_SIZE) * 2;
    Ok(device.create_buffer(&BufferDesc { size, memory })?)
}
