//! Brush state
//!
//! Mutable paint-tool parameters. Mutated by the plugin each tick, read by
//! the paint projector and mirrored into the brush uniform block.

use glam::Vec2;
use tracing::debug;

use crate::types::BlendMode;

/// Default brush radius in UV units
pub const DEFAULT_RADIUS: f32 = 0.01;

/// Default falloff exponent (linear)
pub const DEFAULT_FALLOFF: f32 = 1.0;

/// Brush parameters plus pen state
#[derive(Debug, Clone, PartialEq)]
pub struct Brush {
    /// Position in normalized texture space
    position: Vec2,
    /// Radius in UV units, never negative
    radius: f32,
    color: [f32; 3],
    /// Opacity in `[0, 1]`
    opacity: f32,
    /// Falloff exponent, never negative
    falloff: f32,
    mode: BlendMode,
    /// Pen down. Strokes begin and end on its transitions.
    active: bool,
    dirty: bool,
}

impl Default for Brush {
    fn default() -> Self {
        Self {
            position: Vec2::ZERO,
            radius: DEFAULT_RADIUS,
            color: [1.0; 3],
            opacity: 1.0,
            falloff: DEFAULT_FALLOFF,
            mode: BlendMode::Over,
            active: false,
            dirty: true,
        }
    }
}

/// Clamp to `[min, max]`, mapping NaN to `min`
fn clamp_finite(value: f32, min: f32, max: f32) -> f32 {
    if value.is_nan() { min } else { value.clamp(min, max) }
}

impl Brush {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> Vec2 {
        self.position
    }

    pub fn radius(&self) -> f32 {
        self.radius
    }

    pub fn color(&self) -> [f32; 3] {
        self.color
    }

    pub fn opacity(&self) -> f32 {
        self.opacity
    }

    pub fn falloff(&self) -> f32 {
        self.falloff
    }

    pub fn mode(&self) -> BlendMode {
        self.mode
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_position(&mut self, position: Vec2) {
        if position != self.position {
            self.position = position;
            self.dirty = true;
        }
    }

    /// Set the radius; negative and NaN values clamp to zero
    pub fn set_radius(&mut self, radius: f32) {
        self.radius = clamp_finite(radius, 0.0, f32::MAX);
        self.dirty = true;
    }

    pub fn set_color(&mut self, color: [f32; 3]) {
        self.color = color.map(|c| clamp_finite(c, 0.0, 1.0));
        self.dirty = true;
    }

    /// Set the opacity, clamped to `[0, 1]`
    pub fn set_opacity(&mut self, opacity: f32) {
        self.opacity = clamp_finite(opacity, 0.0, 1.0);
        self.dirty = true;
    }

    pub fn set_falloff(&mut self, falloff: f32) {
        self.falloff = clamp_finite(falloff, 0.0, f32::MAX);
        self.dirty = true;
    }

    pub fn set_mode(&mut self, mode: BlendMode) {
        self.mode = mode;
        self.dirty = true;
    }

    /// Put the pen down at `position`
    pub fn pen_down(&mut self, position: Vec2) {
        debug!("Pen down at ({:.3}, {:.3})", position.x, position.y);
        self.position = position;
        self.active = true;
        self.dirty = true;
    }

    pub fn pen_up(&mut self) {
        if self.active {
            debug!("Pen up");
            self.active = false;
            self.dirty = true;
        }
    }

    /// A dab with these parameters cannot change any texel
    pub fn is_noop(&self) -> bool {
        self.radius <= 0.0 || self.opacity <= 0.0
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Uniform block mirror of the brush
    pub fn ubo(&self) -> UboBrush {
        UboBrush {
            x: self.position.x,
            y: self.position.y,
            radius: self.radius,
            r: self.color[0],
            g: self.color[1],
            b: self.color[2],
            opacity: self.opacity,
            falloff: self.falloff,
            mode: self.mode as u32,
            active: self.active as u32,
            _padding: [0; 2],
        }
    }
}

/// GPU layout of the brush uniform block
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct UboBrush {
    pub x: f32,
    pub y: f32,
    pub radius: f32,
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub opacity: f32,
    pub falloff: f32,
    pub mode: u32,
    pub active: u32,
    pub _padding: [u32; 2],
}

impl UboBrush {
    pub fn mode(&self) -> BlendMode {
        match self.mode {
            1 => BlendMode::Replace,
            2 => BlendMode::Erase,
            3 => BlendMode::Add,
            4 => BlendMode::Multiply,
            _ => BlendMode::Over,
        }
    }

    pub fn center(&self) -> Vec2 {
        Vec2::new(self.x, self.y)
    }
}
