//! Default plugin
//!
//! Creates a layer of its own, sweeps one circular stroke over it across the
//! first ticks and releases the layer at cleanup.

use std::f32::consts::TAU;

use glam::Vec2;
use painting::plugin::{PaintPlugin, PluginContext, PluginImport};
use painting::{LayerId, PaintResult};
use tracing::info;

/// Ticks the demo stroke is spread over
const SWEEP_STEPS: u32 = 48;

const SWEEP_CENTER: Vec2 = Vec2::new(0.5, 0.5);
const SWEEP_RADIUS: f32 = 0.25;

pub struct Standalone {
    import: PluginImport,
    layer: Option<LayerId>,
    step: u32,
}

impl Standalone {
    pub fn new(import: PluginImport) -> Self {
        Self {
            import,
            layer: None,
            step: 0,
        }
    }

    /// Point of the sweep at `step`
    fn sweep_point(step: u32) -> Vec2 {
        let angle = step as f32 / SWEEP_STEPS as f32 * TAU;
        SWEEP_CENTER + SWEEP_RADIUS * Vec2::new(angle.cos(), angle.sin())
    }
}

impl PaintPlugin for Standalone {
    fn name(&self) -> &str {
        "standalone"
    }

    fn init(&mut self, ctx: &mut PluginContext<'_>) -> PaintResult<()> {
        let layer = ctx.create_layer()?;
        ctx.paint.set_active_layer(layer)?;
        let brush = ctx.paint.brush_mut();
        brush.set_radius(0.04);
        brush.set_color([0.9, 0.25, 0.1]);
        brush.set_falloff(2.0);
        self.layer = Some(layer);
        info!(
            "Standalone plugin on layer {} ({:?})",
            layer,
            self.import.params.render_mode()
        );
        Ok(())
    }

    fn update(&mut self, ctx: &mut PluginContext<'_>) -> PaintResult<()> {
        if !ctx.params().should_run() {
            return Ok(());
        }
        let brush = ctx.paint.brush_mut();
        match self.step {
            0 => brush.pen_down(Self::sweep_point(0)),
            step if step <= SWEEP_STEPS => brush.set_position(Self::sweep_point(step)),
            step if step == SWEEP_STEPS + 1 => brush.pen_up(),
            _ => return Ok(()),
        }
        self.step += 1;
        Ok(())
    }

    fn cleanup(&mut self, ctx: &mut PluginContext<'_>) -> PaintResult<()> {
        if let Some(layer) = self.layer.take() {
            ctx.decrement_layer(layer)?;
        }
        Ok(())
    }
}

painting::declare_plugin!(|import| Some(Box::new(Standalone::new(import))));
