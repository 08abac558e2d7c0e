//! Layered mesh-paint engine
//!
//! Brush strokes are projected onto the surface of a mesh with a ray-tracing
//! pass, land in a stack of reference-counted texture layers, and are
//! composited into the paint texture the view passes sample. Every stroke is
//! undoable. Finished frames are presented or handed to another process.
//!
//! - [`brush`] - brush state and its uniform block
//! - [`layers`] - reference-counted layer stack
//! - [`undo`] - bounded ledger of pre-stroke snapshots
//! - [`projector`] - dab projection through the paint pipeline
//! - [`orchestrator`] - per-frame state machine
//! - [`export`] - frame hand-off to an external consumer
//! - [`plugin`] - plugin lifecycle and loaders
//! - [`engine`] - the [`PaintEngine`] tying it all together
//! - [`device`] - the GPU seam and its software backend

pub mod blend;
pub mod brush;
pub mod compositor;
pub mod constants;
pub mod device;
pub mod engine;
pub mod error;
pub mod export;
pub mod frame;
pub mod layers;
pub mod memory;
pub mod orchestrator;
pub mod params;
pub mod plugin;
pub mod projector;
pub mod raycast;
pub mod sbt;
pub mod scene;
pub mod types;
pub mod undo;

pub use brush::Brush;
pub use device::{CpuDevice, GpuDevice};
pub use engine::PaintEngine;
pub use error::{PaintError, PaintResult};
pub use export::FrameExporter;
pub use frame::{FrameReport, FrameState};
pub use layers::{LayerRelease, LayerStack};
pub use plugin::{
    DylibPluginSource, PaintPlugin, PluginContext, PluginImport, PluginSource, StaticPluginSource,
};
pub use raycast::MeshGeometry;
pub use scene::{Camera, PaintScene, RenderScene};
pub use types::{BlendMode, LayerId, Region};
pub use undo::UndoLedger;
