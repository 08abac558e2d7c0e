//! Plugin bridge
//!
//! A plugin drives the engine from the outside: it is initialised once,
//! updated once per tick before the frame is rendered, and cleaned up at
//! shutdown. The engine hands it a [`PluginImport`] at load time and a
//! [`PluginContext`] on every lifecycle call.
//!
//! Plugins are produced by a [`PluginSource`]. Shared-library plugins export a
//! `handshake` entry point, most easily written with [`declare_plugin!`](crate::declare_plugin):
//!
//! ```ignore
//! painting::declare_plugin!(|import| Some(Box::new(MyPlugin::new(import))));
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use libloading::Library;
use painter_config::{EngineConfig, MAX_PLUGIN_NAME_LEN};
use tracing::info;

use crate::device::{GpuDevice, TextureHandle};
use crate::error::{PaintError, PaintResult};
use crate::layers::LayerRelease;
use crate::params::RuntimeParams;
use crate::scene::{PaintScene, RenderScene};
use crate::types::{LayerId, Region};

/// Entry point symbol every shared-library plugin exports
pub const HANDSHAKE_SYMBOL: &[u8] = b"handshake\0";

/// What the engine gives a plugin when it is loaded
#[derive(Debug, Clone)]
pub struct PluginImport {
    pub params: Arc<RuntimeParams>,
}

/// Signature of the `handshake` entry point. `None` refuses the load.
pub type HandshakeFn = fn(PluginImport) -> Option<Box<dyn PaintPlugin>>;

pub trait PaintPlugin {
    fn name(&self) -> &str {
        "plugin"
    }

    fn init(&mut self, ctx: &mut PluginContext<'_>) -> PaintResult<()>;

    /// Called once per tick, before the frame is rendered
    fn update(&mut self, ctx: &mut PluginContext<'_>) -> PaintResult<()>;

    fn cleanup(&mut self, ctx: &mut PluginContext<'_>) -> PaintResult<()>;
}

/// Engine access during a lifecycle call
pub struct PluginContext<'a> {
    pub render: &'a mut RenderScene,
    pub paint: &'a mut PaintScene,
    device: &'a mut dyn GpuDevice,
    params: &'a RuntimeParams,
}

impl<'a> PluginContext<'a> {
    pub fn new(
        render: &'a mut RenderScene,
        paint: &'a mut PaintScene,
        device: &'a mut dyn GpuDevice,
        params: &'a RuntimeParams,
    ) -> Self {
        Self {
            render,
            paint,
            device,
            params,
        }
    }

    pub fn params(&self) -> &RuntimeParams {
        self.params
    }

    /// Allocate a cleared layer on top of the stack with one reference
    pub fn create_layer(&mut self) -> PaintResult<LayerId> {
        self.paint.create_layer(self.device)
    }

    pub fn increment_layer(&mut self, id: LayerId) -> PaintResult<u32> {
        self.paint.increment_layer(id)
    }

    pub fn decrement_layer(&mut self, id: LayerId) -> PaintResult<LayerRelease> {
        self.paint.decrement_layer(self.device, id)
    }

    /// Copy a region between layers. Not recorded in the undo ledger.
    pub fn copy_texture_to_layer(&mut self, src: LayerId, dst: LayerId, region: Region) -> PaintResult<()> {
        self.paint.copy_texture_to_layer(self.device, src, dst, region)
    }

    /// Copy a region of any texture into a layer
    pub fn copy_from_texture(&mut self, src: TextureHandle, dst: LayerId, region: Region) -> PaintResult<()> {
        self.paint.copy_from_texture(self.device, src, dst, region)
    }
}

/// Factory for a plugin
pub trait PluginSource {
    fn name(&self) -> &str;

    fn load(&self, import: PluginImport) -> PaintResult<LoadedPlugin>;
}

/// A plugin together with the library its code lives in
pub struct LoadedPlugin {
    // Dropped before the library
    plugin: Box<dyn PaintPlugin>,
    _library: Option<Library>,
}

impl LoadedPlugin {
    pub fn plugin(&mut self) -> &mut dyn PaintPlugin {
        self.plugin.as_mut()
    }

    pub fn name(&self) -> &str {
        self.plugin.name()
    }
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("name", &self.plugin.name())
            .field("dynamic", &self._library.is_some())
            .finish()
    }
}

fn load_failure(module: &str, reason: impl ToString) -> PaintError {
    PaintError::PluginLoadFailure {
        module: module.to_string(),
        reason: reason.to_string(),
    }
}

fn handshake(module: &str, entry: HandshakeFn, import: PluginImport) -> PaintResult<Box<dyn PaintPlugin>> {
    entry(import).ok_or_else(|| load_failure(module, "handshake returned no plugin"))
}

/// Plugin compiled as a shared library, resolved as
/// `<root>/<prefix><module><suffix>` for the host platform
#[derive(Debug, Clone)]
pub struct DylibPluginSource {
    root: PathBuf,
    module: String,
}

impl DylibPluginSource {
    pub fn new(root: impl Into<PathBuf>, module: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            module: module.into(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(&config.plugin_root, &config.plugin_module)
    }

    pub fn path(&self) -> PathBuf {
        self.root.join(libloading::library_filename(&self.module))
    }
}

impl PluginSource for DylibPluginSource {
    fn name(&self) -> &str {
        &self.module
    }

    #[allow(unsafe_code)]
    fn load(&self, import: PluginImport) -> PaintResult<LoadedPlugin> {
        if self.module.is_empty() || self.module.len() > MAX_PLUGIN_NAME_LEN {
            return Err(load_failure(
                &self.module,
                format!("module name must be 1 to {MAX_PLUGIN_NAME_LEN} characters"),
            ));
        }
        let path = self.path();

        // SAFETY: loading runs the library's initialisers, and the entry point
        // must have the `HandshakeFn` signature. Both hold for libraries built
        // with `declare_plugin!` by the same toolchain.
        let library = unsafe { Library::new(&path) }.map_err(|err| load_failure(&self.module, err))?;
        let entry: HandshakeFn = unsafe {
            *library
                .get::<HandshakeFn>(HANDSHAKE_SYMBOL)
                .map_err(|err| load_failure(&self.module, err))?
        };

        let plugin = handshake(&self.module, entry, import)?;
        info!("Loaded plugin '{}' from {}", plugin.name(), path.display());
        Ok(LoadedPlugin {
            plugin,
            _library: Some(library),
        })
    }
}

/// Plugin linked into the host
#[derive(Debug, Clone)]
pub struct StaticPluginSource {
    name: String,
    entry: HandshakeFn,
}

impl StaticPluginSource {
    pub fn new(name: impl Into<String>, entry: HandshakeFn) -> Self {
        Self {
            name: name.into(),
            entry,
        }
    }
}

impl PluginSource for StaticPluginSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&self, import: PluginImport) -> PaintResult<LoadedPlugin> {
        let plugin = handshake(&self.name, self.entry, import)?;
        info!("Loaded built-in plugin '{}'", plugin.name());
        Ok(LoadedPlugin {
            plugin,
            _library: None,
        })
    }
}

/// Export `handshake` from a plugin library. Takes an expression of type
/// [`HandshakeFn`](crate::plugin::HandshakeFn), usually a closure.
#[macro_export]
macro_rules! declare_plugin {
    ($entry:expr) => {
        #[allow(unsafe_code)]
        #[unsafe(no_mangle)]
        pub fn handshake(
            import: $crate::plugin::PluginImport,
        ) -> ::std::option::Option<::std::boxed::Box<dyn $crate::plugin::PaintPlugin>> {
            let entry: $crate::plugin::HandshakeFn = $entry;
            entry(import)
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CpuDevice;
    use crate::layers::LayerStack;
    use crate::undo::UndoLedger;
    use painter_config::TextureTier;

    fn import() -> PluginImport {
        PluginImport {
            params: Arc::new(RuntimeParams::new(&EngineConfig::default())),
        }
    }

    struct Counter {
        layer: Option<LayerId>,
        updates: u32,
    }

    impl PaintPlugin for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn init(&mut self, ctx: &mut PluginContext<'_>) -> PaintResult<()> {
            self.layer = Some(ctx.create_layer()?);
            Ok(())
        }

        fn update(&mut self, ctx: &mut PluginContext<'_>) -> PaintResult<()> {
            if ctx.params().should_run() {
                self.updates += 1;
            }
            Ok(())
        }

        fn cleanup(&mut self, ctx: &mut PluginContext<'_>) -> PaintResult<()> {
            if let Some(layer) = self.layer.take() {
                ctx.decrement_layer(layer)?;
            }
            Ok(())
        }
    }

    fn counter(_: PluginImport) -> Option<Box<dyn PaintPlugin>> {
        Some(Box::new(Counter { layer: None, updates: 0 }))
    }

    fn refuse(_: PluginImport) -> Option<Box<dyn PaintPlugin>> {
        None
    }

    #[test]
    fn test_static_plugin_lifecycle() {
        let mut device = CpuDevice::new(TextureTier::K4.memory_budget());
        let mut render = RenderScene::new(8, 8);
        let mut paint = PaintScene::new(LayerStack::new(16, 4), UndoLedger::new(4, u64::MAX));
        let import = import();

        let mut loaded = StaticPluginSource::new("counter", counter).load(import.clone()).unwrap();
        assert_eq!(loaded.name(), "counter");

        let mut ctx = PluginContext::new(&mut render, &mut paint, &mut device, &import.params);
        loaded.plugin().init(&mut ctx).unwrap();
        loaded.plugin().update(&mut ctx).unwrap();
        assert_eq!(ctx.paint.layers().len(), 1);
        loaded.plugin().cleanup(&mut ctx).unwrap();
        assert!(ctx.paint.layers().is_empty());
        assert_eq!(device.live_textures(), 0);
    }

    #[test]
    fn test_refused_handshake_fails_load() {
        let result = StaticPluginSource::new("refuse", refuse).load(import());
        assert!(matches!(
            result,
            Err(PaintError::PluginLoadFailure { ref module, .. }) if module == "refuse"
        ));
    }

    #[test]
    fn test_missing_module_fails_load() {
        let dir = std::env::temp_dir().join("painter-plugin-test-missing");
        let source = DylibPluginSource::new(&dir, "nothing_here");
        assert!(source.path().starts_with(&dir));
        let err = source.load(import()).unwrap_err();
        assert!(matches!(err, PaintError::PluginLoadFailure { .. }));
        assert!(err.is_fatal());
    }

    /// Path of the C library mapped into this process
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    fn loaded_libc() -> PathBuf {
        let maps = std::fs::read_to_string("/proc/self/maps").unwrap();
        maps.lines()
            .filter_map(|line| line.split_whitespace().nth(5))
            .find(|path| path.contains("/libc.so") || path.contains("/libc-"))
            .map(PathBuf::from)
            .unwrap()
    }

    #[test]
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    fn test_library_without_handshake_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        let source = DylibPluginSource::new(dir.path(), "no_entry");
        std::os::unix::fs::symlink(loaded_libc(), source.path()).unwrap();

        let err = source.load(import()).unwrap_err();
        assert!(matches!(
            err,
            PaintError::PluginLoadFailure { ref module, .. } if module == "no_entry"
        ));
        assert!(err.to_string().contains("handshake"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_long_module_name_rejected() {
        let source = DylibPluginSource::new(".", "x".repeat(MAX_PLUGIN_NAME_LEN + 1));
        let err = source.load(import()).unwrap_err();
        assert!(err.to_string().contains("characters"));
    }

    #[test]
    fn test_library_file_name() {
        let source = DylibPluginSource::new("/plugins", "standalone");
        let file = source.path();
        let name = file.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.contains("standalone"));
        assert_eq!(name, libloading::library_filename("standalone").to_string_lossy());
    }
}
