//! Frame export protocol for the painter engine
//!
//! Defines the description of an exported frame (dimensions, memory and
//! synchronization handles) and the line-delimited JSON events exchanged with
//! the consumer process that reads those frames.
//!
//! Consumer contract: wait on the frame-done semaphore of the announced slot
//! before reading color/depth, signal read-done after use.

mod error;

pub use error::IpcError;

use serde::{Deserialize, Serialize};

/// Bytes per exported pixel, for both color and depth.
pub const ELEMENT_SIZE: u32 = 4;

/// Native handle value ("file descriptor" style) transferred to the consumer.
pub type RawHandle = i64;

/// Exported device memory holding the color and depth buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalMemory {
    /// Handle to the whole exportable allocation
    pub handle: RawHandle,
    /// Size of the allocation in bytes
    pub size: u64,
    /// Byte offset of the color buffer inside the allocation
    pub color_offset: u64,
    /// Byte offset of the depth buffer inside the allocation
    pub depth_offset: u64,
}

/// Semaphore handles shared with the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalSemaphores {
    /// Signaled by the engine when a frame in slot 0 / 1 is ready
    pub frame_done: [RawHandle; 2],
    /// Signaled by the consumer once it is done reading the frame
    pub read_done: RawHandle,
}

/// Everything a consumer needs to map and read exported frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportDescriptor {
    pub width: u32,
    pub height: u32,
    /// Always [`ELEMENT_SIZE`]
    pub element_size: u32,
    /// Present only for external-memory export
    pub memory: Option<ExternalMemory>,
    /// Present only for external-memory export
    pub semaphores: Option<ExternalSemaphores>,
}

impl ExportDescriptor {
    /// Size of one exported buffer (color or depth) in bytes
    pub fn buffer_size(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.element_size as u64
    }

    /// Check the descriptor is internally consistent
    pub fn validate(&self) -> Result<(), IpcError> {
        if self.element_size != ELEMENT_SIZE {
            return Err(IpcError::Mismatch(format!(
                "element size {} (expected {})",
                self.element_size, ELEMENT_SIZE
            )));
        }
        if let Some(memory) = &self.memory {
            let end = memory.color_offset.max(memory.depth_offset) + self.buffer_size();
            if end > memory.size {
                return Err(IpcError::Mismatch(format!(
                    "buffers end at {end} but memory is {} bytes",
                    memory.size
                )));
            }
        }
        if self.memory.is_some() != self.semaphores.is_some() {
            return Err(IpcError::Mismatch(
                "external memory and semaphores must be exported together".to_string(),
            ));
        }
        Ok(())
    }
}

/// Events exchanged between the engine and the consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ExportEvent {
    /// Sent once on startup and after every resize
    Configure(ExportDescriptor),

    /// A frame finished; wait on `frame_done[slot]` before reading
    FrameReady {
        frame: u64,
        slot: u32,
        /// Pixels were not copied for this frame
        fast_path: bool,
    },

    /// Consumer finished reading the given frame
    ReadDone { frame: u64 },

    /// Engine is shutting down; handles become invalid
    Shutdown,
}

impl ExportEvent {
    /// Encode as a single JSON line (no trailing newline)
    pub fn to_line(&self) -> Result<String, IpcError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a single JSON line
    pub fn from_line(line: &str) -> Result<Self, IpcError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(IpcError::InvalidFormat("empty line".to_string()));
        }
        Ok(serde_json::from_str(line)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn external_descriptor() -> ExportDescriptor {
        ExportDescriptor {
            width: 4,
            height: 2,
            element_size: ELEMENT_SIZE,
            memory: Some(ExternalMemory {
                handle: 7,
                size: 64,
                color_offset: 0,
                depth_offset: 32,
            }),
            semaphores: Some(ExternalSemaphores {
                frame_done: [8, 9],
                read_done: 10,
            }),
        }
    }

    #[test]
    fn test_buffer_size() {
        assert_eq!(external_descriptor().buffer_size(), 32);
    }

    #[test]
    fn test_validate_ok() {
        assert!(external_descriptor().validate().is_ok());
    }

    #[test]
    fn test_validate_overflowing_memory() {
        let mut descriptor = external_descriptor();
        descriptor.memory.as_mut().unwrap().size = 48;
        assert!(matches!(descriptor.validate(), Err(IpcError::Mismatch(_))));
    }

    #[test]
    fn test_validate_missing_semaphores() {
        let mut descriptor = external_descriptor();
        descriptor.semaphores = None;
        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn test_event_line_format() {
        let line = ExportEvent::FrameReady {
            frame: 3,
            slot: 1,
            fast_path: true,
        }
        .to_line()
        .unwrap();
        assert!(line.contains(r#""type":"FrameReady""#));
        assert!(!line.contains('\n'));

        let event = ExportEvent::from_line(&format!("{line}\n")).unwrap();
        assert_eq!(
            event,
            ExportEvent::FrameReady {
                frame: 3,
                slot: 1,
                fast_path: true
            }
        );
    }

    #[test]
    fn test_empty_line_rejected() {
        assert!(matches!(
            ExportEvent::from_line("  "),
            Err(IpcError::InvalidFormat(_))
        ));
    }
}
