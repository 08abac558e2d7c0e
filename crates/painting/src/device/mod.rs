//! GPU device seam
//!
//! Everything the engine asks of the GPU goes through [`GpuDevice`]:
//! textures, buffers, fences, binary semaphores, ordered command submission,
//! ray-tracing pipelines and their shader-group handles, and presentation.
//! Cross-process sharing goes through the [`ExternalSync`] capability.
//!
//! Work is asynchronous: `submit` only queues. The CPU observes completion
//! through fences, readbacks, or `wait_idle`.

mod command;
mod cpu;
mod shaders;

pub use command::{
    Command, CommandBuffer, CompositeInput, PushConstants, RasterBindings, SbtRegions,
    StridedRegion, TraceBindings, UNIFORM_BLOCK_SIZE, Uniforms,
};
pub use cpu::{CpuDevice, DeviceStats};

use std::sync::Arc;
use std::time::Duration;

use painter_config::MemoryBudget;
use painter_ipc::RawHandle;
use thiserror::Error;

use crate::raycast::MeshGeometry;
use crate::types::Region;

macro_rules! handle {
    ($($(#[$meta:meta])* $name:ident),+ $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub(crate) u32);

            impl $name {
                pub fn raw(self) -> u32 {
                    self.0
                }
            }
        )+
    };
}

handle! {
    TextureHandle,
    BufferHandle,
    FenceHandle,
    /// Binary semaphore: a wait consumes the signal
    SemaphoreHandle,
    AccelerationStructureHandle,
    PipelineHandle,
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Out of {kind:?} memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        kind: MemoryKind,
        requested: u64,
        available: u64,
    },

    #[error("Unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: u32 },

    #[error("Region {region:?} outside {width}x{height}")]
    OutOfBounds {
        region: Region,
        width: u32,
        height: u32,
    },

    #[error("Fence wait timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid submission: {0}")]
    Submission(String),

    #[error("Shader binding table: {0}")]
    ShaderBindingTable(String),

    #[error("Handle {0} is not exportable")]
    NotExportable(u32),

    #[error("Unknown external handle {0}")]
    UnknownExternal(RawHandle),

    #[error("Device lost: {0}")]
    Lost(String),
}

pub type DeviceResult<T> = Result<T, DeviceError>;

/// Device memory heaps, each with its own byte budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// Device-local images
    DeviceImage,
    /// Device-local buffers (geometry, acceleration structures)
    DeviceBuffer,
    /// Host-visible buffers (uniforms, binding tables)
    HostVisible,
    /// Host-visible transfer targets (readback)
    HostTransfer,
    /// Exportable memory shared with another process
    External,
}

impl MemoryKind {
    pub(crate) const ALL: [MemoryKind; 5] = [
        MemoryKind::DeviceImage,
        MemoryKind::DeviceBuffer,
        MemoryKind::HostVisible,
        MemoryKind::HostTransfer,
        MemoryKind::External,
    ];

    /// Budget for this heap
    pub fn budget(self, budget: &MemoryBudget) -> u64 {
        match self {
            MemoryKind::DeviceImage => budget.device_graphics_image,
            MemoryKind::DeviceBuffer => budget.device_graphics_buffer,
            MemoryKind::HostVisible => budget.host_graphics_buffer,
            MemoryKind::HostTransfer => budget.host_transfer_buffer,
            MemoryKind::External => budget.device_external_image,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureFormat {
    /// 8-bit straight RGBA
    Rgba8Unorm,
    /// 32-bit float depth, cleared to 1.0
    Depth32Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

impl TextureDesc {
    pub fn rgba8(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            format: TextureFormat::Rgba8Unorm,
        }
    }

    pub fn depth(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            format: TextureFormat::Depth32Float,
        }
    }

    pub fn full_region(&self) -> Region {
        Region::full(self.width, self.height)
    }

    /// Bytes occupied by the texture (both formats are 4 bytes per texel)
    pub fn byte_size(&self) -> u64 {
        self.full_region().byte_len(crate::constants::TEXEL_SIZE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub memory: MemoryKind,
}

/// A byte range inside a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSlice {
    pub buffer: BufferHandle,
    pub offset: u64,
    pub size: u64,
}

/// Limits the engine sizes its tables against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub max_texture_dimension: u32,
    /// Bytes per shader-group handle
    pub shader_group_handle_size: u32,
    /// Required alignment of binding-table records
    pub shader_group_base_alignment: u32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_texture_dimension: 16384,
            shader_group_handle_size: 32,
            shader_group_base_alignment: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderGroupKind {
    RayGen,
    Miss,
    Hit,
}

/// Shader programs the ray-tracing pipelines are built from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderProgram {
    /// One ray per texel of the brush footprint
    PaintRaygen,
    /// One ray per pixel of the view
    ViewRaygen,
    /// Nothing under the ray
    PrimaryMiss,
    /// Nothing between the ray origin and its target: visible
    OcclusionMiss,
    /// Surface attributes at the hit
    SurfaceClosestHit,
}

impl ShaderProgram {
    pub fn kind(self) -> ShaderGroupKind {
        match self {
            Self::PaintRaygen | Self::ViewRaygen => ShaderGroupKind::RayGen,
            Self::PrimaryMiss | Self::OcclusionMiss => ShaderGroupKind::Miss,
            Self::SurfaceClosestHit => ShaderGroupKind::Hit,
        }
    }
}

/// One group of a ray-tracing pipeline, addressed by its position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderGroup {
    pub kind: ShaderGroupKind,
    pub program: ShaderProgram,
}

impl ShaderGroup {
    pub fn new(program: ShaderProgram) -> Self {
        Self {
            kind: program.kind(),
            program,
        }
    }
}

/// One queue submission
#[derive(Debug, Clone, Default)]
pub struct Submission {
    pub commands: Vec<Command>,
    /// Semaphores that must be signaled before execution; consumed on start
    pub wait: Vec<SemaphoreHandle>,
    /// Semaphores signaled on completion
    pub signal: Vec<SemaphoreHandle>,
    /// Fence signaled on completion; must be unsignaled at submit
    pub fence: Option<FenceHandle>,
}

/// Object that can be shared with another process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exportable {
    Memory(BufferHandle),
    Semaphore(SemaphoreHandle),
}

/// Cross-process sharing of memory and semaphores through native handles
pub trait ExternalSync {
    /// Export a buffer's memory or a semaphore as a native handle
    fn export_handle(&mut self, object: Exportable) -> DeviceResult<RawHandle>;

    /// Consumer side: block until the semaphore behind `handle` is signaled, consuming it
    fn import_and_wait(&mut self, handle: RawHandle, timeout: Duration) -> DeviceResult<()>;

    /// Consumer side: signal the semaphore behind `handle`
    fn import_and_signal(&mut self, handle: RawHandle) -> DeviceResult<()>;

    /// Consumer side: read `len` bytes at `offset` of imported memory
    fn read_external(&mut self, handle: RawHandle, offset: u64, len: u64) -> DeviceResult<Vec<u8>>;
}

/// The GPU operations the engine uses
pub trait GpuDevice: ExternalSync {
    fn limits(&self) -> DeviceLimits;

    /// Create a zero-initialized texture (depth textures start at 1.0)
    fn create_texture(&mut self, desc: &TextureDesc) -> DeviceResult<TextureHandle>;

    /// Destroy a texture. Destruction waits for queued work that uses it.
    fn destroy_texture(&mut self, texture: TextureHandle);

    fn texture_desc(&self, texture: TextureHandle) -> DeviceResult<TextureDesc>;

    /// Read back a region, row-major. Completes the queued work that uses
    /// the texture first and fails with a timeout if that work is stalled.
    fn read_region(&mut self, texture: TextureHandle, region: Region) -> DeviceResult<Vec<u8>>;

    /// Upload a region, row-major. Same queue rules as `read_region`.
    fn write_region(&mut self, texture: TextureHandle, region: Region, data: &[u8]) -> DeviceResult<()>;

    fn create_buffer(&mut self, desc: &BufferDesc) -> DeviceResult<BufferHandle>;

    /// Destroy a buffer. Destruction waits for queued work that uses it.
    fn destroy_buffer(&mut self, buffer: BufferHandle);

    /// Host write into a host-visible buffer
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> DeviceResult<()>;

    /// Host read of a host-visible buffer. Does not wait for queued work.
    fn read_buffer(&self, buffer: BufferHandle, offset: u64, len: u64) -> DeviceResult<Vec<u8>>;

    fn build_acceleration_structure(
        &mut self,
        geometry: Arc<MeshGeometry>,
    ) -> DeviceResult<AccelerationStructureHandle>;

    fn destroy_acceleration_structure(&mut self, accel: AccelerationStructureHandle);

    /// Create a pipeline whose groups are addressed by their index in `groups`
    fn create_ray_tracing_pipeline(&mut self, groups: &[ShaderGroup]) -> DeviceResult<PipelineHandle>;

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle);

    /// Opaque handles of `count` groups starting at `first`, packed at
    /// `shader_group_handle_size` bytes each
    fn shader_group_handles(&self, pipeline: PipelineHandle, first: u32, count: u32) -> DeviceResult<Vec<u8>>;

    fn create_fence(&mut self, signaled: bool) -> FenceHandle;

    /// Wait for a fence. Not reaching the signal within `timeout` is an error.
    fn wait_fence(&mut self, fence: FenceHandle, timeout: Duration) -> DeviceResult<()>;

    fn reset_fence(&mut self, fence: FenceHandle) -> DeviceResult<()>;

    fn fence_signaled(&self, fence: FenceHandle) -> DeviceResult<bool>;

    fn destroy_fence(&mut self, fence: FenceHandle);

    /// Create a binary semaphore; `exportable` ones can be shared via [`ExternalSync`]
    fn create_semaphore(&mut self, exportable: bool) -> DeviceResult<SemaphoreHandle>;

    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle);

    fn submit(&mut self, submission: Submission) -> DeviceResult<()>;

    /// Create the presentable images
    fn create_swapchain(&mut self, width: u32, height: u32, image_count: u32) -> DeviceResult<Vec<TextureHandle>>;

    fn destroy_swapchain(&mut self);

    /// Index of the next presentable image; `signal` is signaled when it is ready
    fn acquire_next_image(&mut self, signal: SemaphoreHandle) -> DeviceResult<u32>;

    /// Queue presentation of an image after all `wait` semaphores
    fn present(&mut self, image_index: u32, wait: &[SemaphoreHandle]) -> DeviceResult<()>;

    /// Complete all queued work
    fn wait_idle(&mut self) -> DeviceResult<()>;
}

