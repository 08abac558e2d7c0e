//! Recorded GPU commands

use std::mem::size_of;

use super::{
    AccelerationStructureHandle, BufferHandle, BufferSlice, FenceHandle, PipelineHandle,
    SemaphoreHandle, Submission, TextureHandle,
};
use crate::brush::UboBrush;
use crate::scene::UboMatrices;
use crate::types::{BlendMode, Region};

/// Uniform block shared by the raster and ray-trace passes
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct Uniforms {
    pub matrices: UboMatrices,
    pub brush: UboBrush,
}

pub const UNIFORM_BLOCK_SIZE: u64 = size_of::<Uniforms>() as u64;

/// Shading constants pushed with every trace or raster command
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct PushConstants {
    pub clear_color: [f32; 4],
    /// Direction towards the light, world space
    pub light_dir: [f32; 3],
    pub light_intensity: f32,
    /// 0 = directional
    pub light_kind: u32,
    pub _padding: [u32; 3],
}

impl Default for PushConstants {
    fn default() -> Self {
        Self {
            clear_color: crate::constants::DEFAULT_CLEAR_COLOR,
            light_dir: [0.3, 0.5, 1.0],
            light_intensity: 1.0,
            light_kind: 0,
            _padding: [0; 3],
        }
    }
}

/// One layer as seen by the compositor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompositeInput {
    pub texture: TextureHandle,
    pub blend: BlendMode,
    pub opacity: f32,
}

/// Device-addressed region of a shader binding table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StridedRegion {
    pub offset: u64,
    pub stride: u64,
    pub size: u64,
}

impl StridedRegion {
    /// Number of records in the region
    pub fn count(&self) -> u64 {
        if self.stride == 0 { 0 } else { self.size / self.stride }
    }

    /// Offset of record `index`, `None` past the end
    pub fn record(&self, index: u32) -> Option<u64> {
        (u64::from(index) < self.count()).then(|| self.offset + u64::from(index) * self.stride)
    }
}

/// Binding-table regions passed to a trace command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtRegions {
    pub buffer: BufferHandle,
    pub raygen: StridedRegion,
    pub miss: StridedRegion,
    pub hit: StridedRegion,
}

/// Resources read and written by a trace command
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraceBindings {
    pub accel: AccelerationStructureHandle,
    /// Location of a [`Uniforms`] block
    pub uniforms: BufferSlice,
    /// Paint layer (paint raygen) or offscreen color (view raygen)
    pub target: TextureHandle,
    /// Depth written by the view raygen
    pub depth: Option<TextureHandle>,
    /// Composited paint texture sampled by the view raygen
    pub paint_texture: Option<TextureHandle>,
    pub push: PushConstants,
    /// Skip texels the camera cannot see
    pub occlusion_test: bool,
}

/// Resources used by the raster pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterBindings {
    pub accel: AccelerationStructureHandle,
    pub uniforms: BufferSlice,
    pub color: TextureHandle,
    pub depth: TextureHandle,
    pub paint_texture: TextureHandle,
    pub push: PushConstants,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Write bytes into a buffer in queue order
    UpdateBuffer {
        buffer: BufferHandle,
        offset: u64,
        data: Vec<u8>,
    },
    ClearColor {
        texture: TextureHandle,
        color: [f32; 4],
    },
    ClearDepth {
        texture: TextureHandle,
        depth: f32,
    },
    /// Clear `target` then blend `layers` into it in order
    Composite {
        target: TextureHandle,
        layers: Vec<CompositeInput>,
    },
    TraceRays {
        pipeline: PipelineHandle,
        sbt: SbtRegions,
        /// Launch grid in target texels
        launch: Region,
        bindings: TraceBindings,
    },
    Rasterize {
        bindings: RasterBindings,
    },
    /// Fullscreen blit of the offscreen color onto a swap image
    Post {
        source: TextureHandle,
        target: TextureHandle,
    },
    CopyTexture {
        src: TextureHandle,
        dst: TextureHandle,
        region: Region,
    },
    /// Tightly packed copy of a whole texture into a buffer
    CopyTextureToBuffer {
        texture: TextureHandle,
        buffer: BufferHandle,
        offset: u64,
    },
    /// Tightly packed copy of one texture region into a buffer
    CopyRegionToBuffer {
        texture: TextureHandle,
        region: Region,
        buffer: BufferHandle,
        offset: u64,
    },
    /// Exchange a texture region with the tightly packed texels stored in a buffer
    SwapRegionWithBuffer {
        texture: TextureHandle,
        region: Region,
        buffer: BufferHandle,
        offset: u64,
    },
}

impl Command {
    /// Whether executing the command reads or writes `texture`
    pub fn uses_texture(&self, texture: TextureHandle) -> bool {
        match self {
            Command::UpdateBuffer { .. } => false,
            Command::ClearColor { texture: t, .. }
            | Command::ClearDepth { texture: t, .. }
            | Command::CopyTextureToBuffer { texture: t, .. }
            | Command::CopyRegionToBuffer { texture: t, .. }
            | Command::SwapRegionWithBuffer { texture: t, .. } => *t == texture,
            Command::Composite { target, layers } => {
                *target == texture || layers.iter().any(|input| input.texture == texture)
            }
            Command::TraceRays { bindings, .. } => {
                bindings.target == texture
                    || bindings.depth == Some(texture)
                    || bindings.paint_texture == Some(texture)
            }
            Command::Rasterize { bindings } => {
                bindings.color == texture || bindings.depth == texture || bindings.paint_texture == texture
            }
            Command::Post { source, target } => *source == texture || *target == texture,
            Command::CopyTexture { src, dst, .. } => *src == texture || *dst == texture,
        }
    }

    /// Whether executing the command reads or writes `buffer`
    pub fn uses_buffer(&self, buffer: BufferHandle) -> bool {
        match self {
            Command::UpdateBuffer { buffer: b, .. }
            | Command::CopyTextureToBuffer { buffer: b, .. }
            | Command::CopyRegionToBuffer { buffer: b, .. }
            | Command::SwapRegionWithBuffer { buffer: b, .. } => *b == buffer,
            Command::TraceRays { sbt, bindings, .. } => sbt.buffer == buffer || bindings.uniforms.buffer == buffer,
            Command::Rasterize { bindings } => bindings.uniforms.buffer == buffer,
            Command::ClearColor { .. }
            | Command::ClearDepth { .. }
            | Command::Composite { .. }
            | Command::Post { .. }
            | Command::CopyTexture { .. } => false,
        }
    }
}

/// Command list re-recorded from scratch each use
#[derive(Debug, Default)]
pub struct CommandBuffer {
    commands: Vec<Command>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.commands.clear();
    }

    pub fn record(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Submission carrying a copy of the recorded commands
    pub fn submission(
        &self,
        wait: Vec<SemaphoreHandle>,
        signal: Vec<SemaphoreHandle>,
        fence: Option<FenceHandle>,
    ) -> Submission {
        Submission {
            commands: self.commands.clone(),
            wait,
            signal,
            fence,
        }
    }
}
