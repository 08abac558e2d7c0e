//! Frame slots and the per-frame state machine

use painter_config::{OutputMode, RenderMode};

use crate::device::{CommandBuffer, FenceHandle, GpuDevice, SemaphoreHandle};
use crate::error::PaintResult;

/// Phases of one frame tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameState {
    #[default]
    Idle,
    Acquire,
    Record,
    Submit,
    Present,
    Export,
}

impl FrameState {
    /// `Idle -> Acquire -> Record -> Submit -> (Present | Export) -> Idle`
    pub fn can_transition_to(self, next: FrameState) -> bool {
        use FrameState::*;
        matches!(
            (self, next),
            (Idle, Acquire)
                | (Acquire, Record)
                | (Record, Submit)
                | (Submit, Present)
                | (Submit, Export)
                | (Present, Idle)
                | (Export, Idle)
        )
    }
}

/// Resources owned by one in-flight frame
#[derive(Debug)]
pub struct FrameSlot {
    pub commands: CommandBuffer,
    /// Signaled when the slot's last submission retired
    pub fence: FenceHandle,
    pub render_complete: SemaphoreHandle,
    pub image_acquired: SemaphoreHandle,
}

impl FrameSlot {
    pub fn new(device: &mut dyn GpuDevice) -> PaintResult<Self> {
        Ok(Self {
            commands: CommandBuffer::new(),
            // Created signaled so the first acquire does not wait
            fence: device.create_fence(true),
            render_complete: device.create_semaphore(false)?,
            image_acquired: device.create_semaphore(false)?,
        })
    }

    pub fn release(&self, device: &mut dyn GpuDevice) {
        device.destroy_fence(self.fence);
        device.destroy_semaphore(self.render_complete);
        device.destroy_semaphore(self.image_acquired);
    }
}

/// What a finished frame did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReport {
    pub frame: u64,
    pub slot: usize,
    /// Swap image the post pass wrote
    pub image: u32,
    pub mode: RenderMode,
    pub output: OutputMode,
    /// A dab was projected this tick
    pub painted: bool,
    /// The layer stack was recomposited
    pub composited: bool,
    /// Pixels were copied out for the export consumer
    pub copied: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_present_cycle() {
        let cycle = [
            FrameState::Idle,
            FrameState::Acquire,
            FrameState::Record,
            FrameState::Submit,
            FrameState::Present,
            FrameState::Idle,
        ];
        assert!(cycle.windows(2).all(|w| w[0].can_transition_to(w[1])));
    }

    #[test]
    fn test_export_branch() {
        assert!(FrameState::Submit.can_transition_to(FrameState::Export));
        assert!(FrameState::Export.can_transition_to(FrameState::Idle));
        assert!(!FrameState::Export.can_transition_to(FrameState::Present));
    }

    #[test]
    fn test_no_shortcuts() {
        assert!(!FrameState::Idle.can_transition_to(FrameState::Record));
        assert!(!FrameState::Acquire.can_transition_to(FrameState::Submit));
        assert!(!FrameState::Record.can_transition_to(FrameState::Present));
        assert!(!FrameState::Present.can_transition_to(FrameState::Acquire));
        assert!(!FrameState::Idle.can_transition_to(FrameState::Idle));
    }
}
