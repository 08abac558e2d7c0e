//! Runtime flags shared with the plugin
//!
//! Plugins get a read-only view; only the engine flips them.

use std::sync::atomic::{AtomicBool, Ordering};

use painter_config::{EngineConfig, OutputMode, RenderMode};

#[derive(Debug)]
pub struct RuntimeParams {
    should_run: AtomicBool,
    ray_trace: AtomicBool,
    copy_to_host: AtomicBool,
}

impl RuntimeParams {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            should_run: AtomicBool::new(true),
            ray_trace: AtomicBool::new(config.render_mode == RenderMode::RayTrace),
            copy_to_host: AtomicBool::new(config.copy_swap_to_host()),
        }
    }

    /// False once shutdown was requested
    pub fn should_run(&self) -> bool {
        self.should_run.load(Ordering::Acquire)
    }

    pub fn render_mode(&self) -> RenderMode {
        if self.ray_trace.load(Ordering::Relaxed) {
            RenderMode::RayTrace
        } else {
            RenderMode::Raster
        }
    }

    pub fn output_mode(&self) -> OutputMode {
        if self.copy_swap_to_host() {
            OutputMode::CopyToHost
        } else {
            OutputMode::Present
        }
    }

    pub fn copy_swap_to_host(&self) -> bool {
        self.copy_to_host.load(Ordering::Relaxed)
    }

    pub(crate) fn request_stop(&self) {
        self.should_run.store(false, Ordering::Release);
    }

    pub(crate) fn set_render_mode(&self, mode: RenderMode) {
        self.ray_trace.store(mode == RenderMode::RayTrace, Ordering::Relaxed);
    }
}
