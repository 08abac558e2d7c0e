//! Shared configuration for the painter engine
//!
//! This crate is the single source of truth for texture resolution tiers,
//! the device-memory budget each tier implies, window defaults and the
//! runtime mode toggles (ray trace vs. raster, present vs. copy-to-host).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default window width in pixels
pub const DEFAULT_WIDTH: u32 = 1500;

/// Default window height in pixels
pub const DEFAULT_HEIGHT: u32 = 1500;

/// Number of frame slots cycled by the frame orchestrator
pub const DEFAULT_FRAMES_IN_FLIGHT: u32 = 2;

/// Default target frame interval (1 / 60 s)
pub const DEFAULT_FRAME_INTERVAL_NS: u64 = 16_666_666;

/// Default plugin module name, resolved relative to the plugin root
pub const DEFAULT_PLUGIN_MODULE: &str = "standalone";

/// Longest plugin module name accepted (without prefix or suffix)
pub const MAX_PLUGIN_NAME_LEN: usize = 28;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Errors produced while loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Texture resolution tier. Each tier fixes the paint texture size and the
/// device-memory envelope the engine is allowed to allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextureTier {
    #[default]
    #[serde(rename = "4k")]
    K4,
    #[serde(rename = "8k")]
    K8,
    #[serde(rename = "16k")]
    K16,
}

impl TextureTier {
    /// Edge length of the square paint texture for this tier
    pub fn texture_size(self) -> u32 {
        match self {
            Self::K4 => 4096,
            Self::K8 => 8192,
            Self::K16 => 16384,
        }
    }

    /// Memory budget envelope for this tier
    pub fn memory_budget(self) -> MemoryBudget {
        match self {
            Self::K4 => MemoryBudget {
                host_graphics_buffer: GIB,
                device_graphics_buffer: 256 * MIB,
                device_graphics_image: GIB,
                host_transfer_buffer: 2 * GIB,
                device_external_image: 100 * MIB,
            },
            Self::K8 => MemoryBudget {
                host_graphics_buffer: 2 * GIB,
                device_graphics_buffer: 256 * MIB,
                device_graphics_image: 2 * GIB,
                host_transfer_buffer: 4 * GIB,
                device_external_image: 100 * MIB,
            },
            Self::K16 => MemoryBudget {
                host_graphics_buffer: 6 * GIB,
                device_graphics_buffer: 512 * MIB,
                device_graphics_image: 6 * GIB,
                host_transfer_buffer: 8 * GIB,
                device_external_image: 100 * MIB,
            },
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "4k" | "4096" => Some(Self::K4),
            "8k" | "8192" => Some(Self::K8),
            "16k" | "16384" => Some(Self::K16),
            _ => None,
        }
    }
}

/// Byte budgets per device memory kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryBudget {
    /// Host-visible buffers used for uniforms and shader binding tables
    pub host_graphics_buffer: u64,
    /// Device-local buffers (vertex, index, acceleration structures)
    pub device_graphics_buffer: u64,
    /// Device-local images (layers, offscreen targets, swap images)
    pub device_graphics_image: u64,
    /// Host-visible transfer buffers (readback, export copies)
    pub host_transfer_buffer: u64,
    /// Exportable device memory shared with another process
    pub device_external_image: u64,
}

/// How the mesh is drawn into the offscreen target each frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    #[default]
    Raster,
    RayTrace,
}

/// Where a finished frame goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Present to the display surface
    #[default]
    Present,
    /// Hand the frame to an external host process
    CopyToHost,
}

/// How frames reach the external host when [`OutputMode::CopyToHost`] is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportMode {
    /// Copy color and depth into host-visible memory the caller reads directly
    #[default]
    HostCopy,
    /// Expose exportable memory plus semaphore handles to another process
    External,
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Texture resolution tier
    pub tier: TextureTier,
    /// Paint texture edge length; overrides the tier size when set
    pub texture_size: Option<u32>,
    /// Window width in pixels
    pub width: u32,
    /// Window height in pixels
    pub height: u32,
    /// Number of cycled frame slots
    pub frames_in_flight: u32,
    /// Maximum simultaneously allocated layers
    pub max_layers: u32,
    /// Maximum undo entries held by the ledger
    pub undo_entries: usize,
    /// Maximum snapshot bytes held by the ledger
    pub undo_byte_budget: u64,
    /// Fence wait timeout before the device is declared lost
    pub fence_timeout_ms: u64,
    /// Target frame interval for the tick loop
    pub frame_interval_ns: u64,
    /// Initial render mode
    pub render_mode: RenderMode,
    /// Present or copy to host
    pub output_mode: OutputMode,
    /// Export flavour when copying to host
    pub export_mode: ExportMode,
    /// Skip brush texels hidden from the camera
    pub occlusion_test: bool,
    /// Directory the plugin module is resolved from
    pub plugin_root: String,
    /// Plugin module name without platform prefix or suffix
    pub plugin_module: String,
    /// Stop the tick loop after this many frames
    pub max_frames: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tier: TextureTier::default(),
            texture_size: None,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            max_layers: 16,
            undo_entries: 16,
            undo_byte_budget: 4096 * 4096 * 4,
            fence_timeout_ms: 10_000,
            frame_interval_ns: DEFAULT_FRAME_INTERVAL_NS,
            render_mode: RenderMode::default(),
            output_mode: OutputMode::default(),
            export_mode: ExportMode::default(),
            occlusion_test: true,
            plugin_root: ".".to_string(),
            plugin_module: DEFAULT_PLUGIN_MODULE.to_string(),
            max_frames: None,
        }
    }
}

impl EngineConfig {
    /// Load a JSON config file. Missing fields fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Parse a JSON config string and validate it
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Default config with `PAINTER_*` environment overrides applied
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the environment, in production)
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup("PAINTER_TIER") {
            self.tier = TextureTier::parse(&value).ok_or(ConfigError::InvalidValue {
                key: "PAINTER_TIER",
                value,
            })?;
        }
        if let Some(value) = lookup("PAINTER_MODE") {
            self.render_mode = match value.as_str() {
                "raster" => RenderMode::Raster,
                "raytrace" | "ray_trace" => RenderMode::RayTrace,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "PAINTER_MODE",
                        value,
                    });
                }
            };
        }
        if let Some(value) = lookup("PAINTER_OUTPUT") {
            match value.as_str() {
                "present" => self.output_mode = OutputMode::Present,
                "host" | "copy_to_host" => {
                    self.output_mode = OutputMode::CopyToHost;
                    self.export_mode = ExportMode::HostCopy;
                }
                "external" => {
                    self.output_mode = OutputMode::CopyToHost;
                    self.export_mode = ExportMode::External;
                }
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "PAINTER_OUTPUT",
                        value,
                    });
                }
            }
        }
        if let Some(value) = lookup("PAINTER_PLUGIN") {
            self.plugin_module = value;
        }
        if let Some(value) = lookup("PAINTER_PLUGIN_ROOT") {
            self.plugin_root = value;
        }
        if let Some(value) = lookup("PAINTER_MAX_FRAMES") {
            let frames = value.parse().map_err(|_| ConfigError::InvalidValue {
                key: "PAINTER_MAX_FRAMES",
                value,
            })?;
            self.max_frames = Some(frames);
        }
        Ok(())
    }

    /// Check invariants the engine relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &'static str, value: String| Err(ConfigError::InvalidValue { key, value });

        if self.frames_in_flight == 0 {
            return invalid("frames_in_flight", self.frames_in_flight.to_string());
        }
        if self.max_layers == 0 {
            return invalid("max_layers", self.max_layers.to_string());
        }
        if self.width == 0 || self.height == 0 {
            return invalid("window", format!("{}x{}", self.width, self.height));
        }
        if self.texture_size == Some(0) {
            return invalid("texture_size", "0".to_string());
        }
        if self.plugin_module.is_empty() || self.plugin_module.len() > MAX_PLUGIN_NAME_LEN {
            return invalid("plugin_module", self.plugin_module.clone());
        }
        Ok(())
    }

    /// Edge length of the paint texture
    pub fn paint_texture_size(&self) -> u32 {
        self.texture_size.unwrap_or_else(|| self.tier.texture_size())
    }

    /// Memory budget implied by the tier
    pub fn memory_budget(&self) -> MemoryBudget {
        self.tier.memory_budget()
    }

    /// Fence wait timeout as a duration
    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }

    /// Frame interval as a duration
    pub fn frame_interval(&self) -> Duration {
        Duration::from_nanos(self.frame_interval_ns)
    }

    /// Whether finished frames are handed to an external host
    pub fn copy_swap_to_host(&self) -> bool {
        self.output_mode == OutputMode::CopyToHost
    }
}
