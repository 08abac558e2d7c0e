//! Deterministic software device
//!
//! Submissions are queued and retired strictly in order. The queue stalls on
//! a wait semaphore nobody has signaled, just like a hardware queue, so a
//! fence wait that cannot make progress reports a timeout instead of
//! sleeping. Memory is charged against the tier budget per heap.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use glam::Vec2;
use painter_config::MemoryBudget;
use painter_ipc::RawHandle;
use tracing::{debug, warn};

use super::shaders::{self, ResolvedSbt, Tracer};
use super::{
    AccelerationStructureHandle, BufferDesc, BufferHandle, Command, CompositeInput, DeviceError,
    DeviceLimits, DeviceResult, Exportable, ExternalSync, FenceHandle, GpuDevice, MemoryKind,
    PipelineHandle, SbtRegions, SemaphoreHandle, ShaderGroup, ShaderGroupKind, ShaderProgram,
    StridedRegion, Submission, TextureDesc, TextureFormat, TextureHandle, Uniforms,
    UNIFORM_BLOCK_SIZE,
};
use crate::blend;
use crate::raycast::MeshGeometry;
use crate::types::Region;

/// First handle value handed out for exported objects
const FIRST_EXTERNAL_HANDLE: RawHandle = 3;

pub(super) struct CpuTexture {
    pub desc: TextureDesc,
    texels: Vec<[u8; 4]>,
}

impl CpuTexture {
    fn new(desc: TextureDesc) -> Self {
        let fill = match desc.format {
            TextureFormat::Rgba8Unorm => [0; 4],
            TextureFormat::Depth32Float => 1.0f32.to_le_bytes(),
        };
        Self {
            desc,
            texels: vec![fill; desc.width as usize * desc.height as usize],
        }
    }

    fn check(&self, region: Region) -> DeviceResult<()> {
        if region.fits_within(self.desc.width, self.desc.height) {
            Ok(())
        } else {
            Err(DeviceError::OutOfBounds {
                region,
                width: self.desc.width,
                height: self.desc.height,
            })
        }
    }

    fn index(&self, x: u32, y: u32) -> Option<usize> {
        (x < self.desc.width && y < self.desc.height)
            .then(|| y as usize * self.desc.width as usize + x as usize)
    }

    pub fn texel_mut(&mut self, x: u32, y: u32) -> Option<&mut [u8; 4]> {
        self.index(x, y).map(|i| &mut self.texels[i])
    }

    /// Nearest sample at normalized coordinates, clamped to the edge
    pub fn sample(&self, uv: Vec2) -> [u8; 4] {
        let x = ((uv.x * self.desc.width as f32).floor().max(0.0) as u32).min(self.desc.width - 1);
        let y = ((uv.y * self.desc.height as f32).floor().max(0.0) as u32).min(self.desc.height - 1);
        self.texels[y as usize * self.desc.width as usize + x as usize]
    }

    pub fn depth_at(&self, x: u32, y: u32) -> f32 {
        self.index(x, y).map_or(1.0, |i| f32::from_le_bytes(self.texels[i]))
    }

    fn read(&self, region: Region) -> Vec<u8> {
        let width = self.desc.width as usize;
        let mut out = Vec::with_capacity(region.byte_len(4) as usize);
        for y in region.y..region.bottom() {
            let start = y as usize * width + region.x as usize;
            out.extend_from_slice(bytemuck::cast_slice(&self.texels[start..start + region.width as usize]));
        }
        out
    }

    fn write(&mut self, region: Region, data: &[u8]) {
        let width = self.desc.width as usize;
        let row_bytes = region.width as usize * 4;
        for (row, chunk) in data.chunks_exact(row_bytes).enumerate() {
            let start = (region.y as usize + row) * width + region.x as usize;
            let dst: &mut [u8] = bytemuck::cast_slice_mut(&mut self.texels[start..start + region.width as usize]);
            dst.copy_from_slice(chunk);
        }
    }

    fn fill(&mut self, texel: [u8; 4]) {
        self.texels.fill(texel);
    }
}

struct CpuBuffer {
    desc: BufferDesc,
    data: Vec<u8>,
}

impl CpuBuffer {
    fn range(&self, offset: u64, len: u64) -> DeviceResult<std::ops::Range<usize>> {
        let end = offset.checked_add(len).filter(|&end| end <= self.desc.size);
        match end {
            Some(end) => Ok(offset as usize..end as usize),
            None => Err(DeviceError::Submission(format!(
                "buffer access {offset}+{len} outside {} bytes",
                self.desc.size
            ))),
        }
    }
}

struct CpuSemaphore {
    signaled: bool,
    exportable: bool,
}

enum Work {
    Submit(Submission),
    Present { image: u32, wait: Vec<SemaphoreHandle> },
}

impl Work {
    fn waits(&self) -> &[SemaphoreHandle] {
        match self {
            Work::Submit(submission) => &submission.wait,
            Work::Present { wait, .. } => wait,
        }
    }

    fn uses(&self, object: Deferred) -> bool {
        let Work::Submit(submission) = self else {
            return false;
        };
        submission.commands.iter().any(|command| match object {
            Deferred::Texture(texture) => command.uses_texture(texture),
            Deferred::Buffer(buffer) => command.uses_buffer(buffer),
        })
    }
}

/// Object whose destruction waits for the queued work using it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deferred {
    Texture(TextureHandle),
    Buffer(BufferHandle),
}

/// Counters for tests and diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub submissions: u64,
    /// Submissions retired
    pub executed: u64,
    pub presented: u64,
    pub textures_created: u64,
    pub textures_destroyed: u64,
    pub rays_traced: u64,
    pub texels_painted: u64,
}

/// Software implementation of [`GpuDevice`]
pub struct CpuDevice {
    limits: DeviceLimits,
    budget: MemoryBudget,
    used: HashMap<MemoryKind, u64>,
    next_id: u32,
    next_external: RawHandle,
    textures: HashMap<u32, CpuTexture>,
    buffers: HashMap<u32, CpuBuffer>,
    fences: HashMap<u32, bool>,
    semaphores: HashMap<u32, CpuSemaphore>,
    accels: HashMap<u32, Arc<MeshGeometry>>,
    pipelines: HashMap<u32, Vec<ShaderGroup>>,
    swapchain: Vec<TextureHandle>,
    next_image: u32,
    last_presented: Option<u32>,
    queue: VecDeque<Work>,
    deferred: Vec<Deferred>,
    external: HashMap<RawHandle, Exportable>,
    lost: Option<String>,
    stats: DeviceStats,
}

impl CpuDevice {
    pub fn new(budget: MemoryBudget) -> Self {
        Self::with_limits(budget, DeviceLimits::default())
    }

    pub fn with_limits(budget: MemoryBudget, limits: DeviceLimits) -> Self {
        Self {
            limits,
            budget,
            used: HashMap::new(),
            next_id: 1,
            next_external: FIRST_EXTERNAL_HANDLE,
            textures: HashMap::new(),
            buffers: HashMap::new(),
            fences: HashMap::new(),
            semaphores: HashMap::new(),
            accels: HashMap::new(),
            pipelines: HashMap::new(),
            swapchain: Vec::new(),
            next_image: 0,
            last_presented: None,
            queue: VecDeque::new(),
            deferred: Vec::new(),
            external: HashMap::new(),
            lost: None,
            stats: DeviceStats::default(),
        }
    }

    pub fn stats(&self) -> DeviceStats {
        self.stats
    }

    pub fn memory_used(&self, kind: MemoryKind) -> u64 {
        self.used.get(&kind).copied().unwrap_or(0)
    }

    /// Bytes used across all heaps
    pub fn total_memory_used(&self) -> u64 {
        MemoryKind::ALL.iter().map(|&kind| self.memory_used(kind)).sum()
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    /// Submissions and presents not yet retired
    pub fn pending_work(&self) -> usize {
        self.queue.len()
    }

    pub fn last_presented(&self) -> Option<u32> {
        self.last_presented
    }

    pub fn semaphore_signaled(&self, semaphore: SemaphoreHandle) -> bool {
        self.semaphores.get(&semaphore.0).is_some_and(|s| s.signaled)
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_some()
    }

    /// Retire queued work until the queue is empty or stalls on a semaphore
    pub fn poll(&mut self) -> DeviceResult<usize> {
        self.check_lost()?;
        let mut retired = 0;
        loop {
            let ready = match self.queue.front() {
                Some(work) => work.waits().iter().all(|s| self.semaphore_signaled(*s)),
                None => break,
            };
            if !ready {
                break;
            }
            let Some(work) = self.queue.pop_front() else {
                break;
            };
            for semaphore in work.waits() {
                if let Some(s) = self.semaphores.get_mut(&semaphore.0) {
                    s.signaled = false;
                }
            }
            match work {
                Work::Submit(submission) => {
                    if let Err(err) = self.execute(&submission.commands) {
                        warn!("Device lost while executing submission: {}", err);
                        self.lost = Some(err.to_string());
                        self.queue.clear();
                        self.collect_deferred();
                        return Err(DeviceError::Lost(err.to_string()));
                    }
                    for semaphore in &submission.signal {
                        if let Some(s) = self.semaphores.get_mut(&semaphore.0) {
                            s.signaled = true;
                        }
                    }
                    if let Some(fence) = submission.fence {
                        self.fences.insert(fence.0, true);
                    }
                    self.stats.executed += 1;
                }
                Work::Present { image, .. } => {
                    self.last_presented = Some(image);
                    self.stats.presented += 1;
                }
            }
            retired += 1;
        }
        if retired > 0 {
            self.collect_deferred();
        }
        Ok(retired)
    }

    /// Objects waiting for queued work before they are destroyed
    pub fn deferred_destroys(&self) -> usize {
        self.deferred.len()
    }

    /// Retire everything queued; a stalled queue cannot be drained
    fn drain(&mut self) -> DeviceResult<()> {
        self.poll()?;
        if self.queue.is_empty() {
            Ok(())
        } else {
            Err(DeviceError::Timeout(Duration::ZERO))
        }
    }

    /// Retire queued work up to the last submission using `texture`. Fails
    /// with a timeout when that submission sits behind a stalled wait.
    fn settle(&mut self, texture: TextureHandle) -> DeviceResult<()> {
        self.poll()?;
        if self.queue.iter().any(|work| work.uses(Deferred::Texture(texture))) {
            Err(DeviceError::Timeout(Duration::ZERO))
        } else {
            Ok(())
        }
    }

    /// Destroy now, or once the queue no longer uses the object
    fn destroy(&mut self, object: Deferred) {
        if let Err(err) = self.poll() {
            warn!("Retiring work before destroy failed: {}", err);
        }
        if self.queue.iter().any(|work| work.uses(object)) {
            debug!("Destroy of {:?} deferred until queued work retires", object);
            if !self.deferred.contains(&object) {
                self.deferred.push(object);
            }
            return;
        }
        self.free(object);
    }

    fn collect_deferred(&mut self) {
        let deferred = std::mem::take(&mut self.deferred);
        for object in deferred {
            if self.queue.iter().any(|work| work.uses(object)) {
                self.deferred.push(object);
            } else {
                self.free(object);
            }
        }
    }

    fn free(&mut self, object: Deferred) {
        match object {
            Deferred::Texture(texture) => {
                if let Some(removed) = self.textures.remove(&texture.0) {
                    self.release(MemoryKind::DeviceImage, removed.desc.byte_size());
                    self.stats.textures_destroyed += 1;
                }
            }
            Deferred::Buffer(buffer) => {
                if let Some(removed) = self.buffers.remove(&buffer.0) {
                    self.release(removed.desc.memory, removed.desc.size);
                    self.external.retain(|_, object| *object != Exportable::Memory(buffer));
                }
            }
        }
    }

    fn check_lost(&self) -> DeviceResult<()> {
        match &self.lost {
            Some(reason) => Err(DeviceError::Lost(reason.clone())),
            None => Ok(()),
        }
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn allocate(&mut self, kind: MemoryKind, bytes: u64) -> DeviceResult<()> {
        let used = self.memory_used(kind);
        let budget = kind.budget(&self.budget);
        if used + bytes > budget {
            return Err(DeviceError::OutOfMemory {
                kind,
                requested: bytes,
                available: budget.saturating_sub(used),
            });
        }
        self.used.insert(kind, used + bytes);
        Ok(())
    }

    fn release(&mut self, kind: MemoryKind, bytes: u64) {
        let used = self.memory_used(kind);
        self.used.insert(kind, used.saturating_sub(bytes));
    }

    fn texture(&self, texture: TextureHandle) -> DeviceResult<&CpuTexture> {
        self.textures.get(&texture.0).ok_or(DeviceError::UnknownHandle {
            kind: "texture",
            id: texture.0,
        })
    }

    fn buffer(&self, buffer: BufferHandle) -> DeviceResult<&CpuBuffer> {
        self.buffers.get(&buffer.0).ok_or(DeviceError::UnknownHandle {
            kind: "buffer",
            id: buffer.0,
        })
    }

    fn buffer_mut(&mut self, buffer: BufferHandle) -> DeviceResult<&mut CpuBuffer> {
        self.buffers.get_mut(&buffer.0).ok_or(DeviceError::UnknownHandle {
            kind: "buffer",
            id: buffer.0,
        })
    }

    /// Take a texture out of the table while a command writes it
    fn take_texture(&mut self, texture: TextureHandle) -> DeviceResult<CpuTexture> {
        self.textures.remove(&texture.0).ok_or(DeviceError::UnknownHandle {
            kind: "texture",
            id: texture.0,
        })
    }

    fn read_uniforms(&self, buffer: BufferHandle, offset: u64) -> DeviceResult<Uniforms> {
        let buffer = self.buffer(buffer)?;
        let range = buffer.range(offset, UNIFORM_BLOCK_SIZE)?;
        Ok(bytemuck::pod_read_unaligned(&buffer.data[range]))
    }

    fn geometry(&self, accel: AccelerationStructureHandle) -> DeviceResult<Arc<MeshGeometry>> {
        self.accels.get(&accel.0).cloned().ok_or(DeviceError::UnknownHandle {
            kind: "acceleration structure",
            id: accel.0,
        })
    }

    fn semaphore_for(&self, handle: RawHandle) -> DeviceResult<SemaphoreHandle> {
        match self.external.get(&handle) {
            Some(Exportable::Semaphore(semaphore)) => Ok(*semaphore),
            _ => Err(DeviceError::UnknownExternal(handle)),
        }
    }

    /// Decode the binding table records into the programs they point at
    fn resolve_sbt(&self, pipeline: PipelineHandle, sbt: &SbtRegions) -> DeviceResult<ResolvedSbt> {
        let groups = self.pipelines.get(&pipeline.0).ok_or(DeviceError::UnknownHandle {
            kind: "pipeline",
            id: pipeline.0,
        })?;
        let buffer = self.buffer(sbt.buffer)?;
        let alignment = u64::from(self.limits.shader_group_base_alignment);
        let handle_size = u64::from(self.limits.shader_group_handle_size);

        if sbt.raygen.offset % alignment != 0 {
            return Err(DeviceError::ShaderBindingTable(format!(
                "raygen offset {} not aligned to {alignment}",
                sbt.raygen.offset
            )));
        }

        let record = |region: &StridedRegion, index: u32, kind: ShaderGroupKind| -> DeviceResult<ShaderProgram> {
            if region.stride < handle_size {
                return Err(DeviceError::ShaderBindingTable(format!(
                    "stride {} smaller than handle size {handle_size}",
                    region.stride
                )));
            }
            let offset = region.record(index).ok_or_else(|| {
                DeviceError::ShaderBindingTable(format!("{kind:?} record {index} outside region"))
            })?;
            let bytes = &buffer.data[buffer.range(offset, 8)?];
            let owner = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            let group = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
            if owner != pipeline.0 {
                return Err(DeviceError::ShaderBindingTable(format!(
                    "record at {offset} belongs to pipeline {owner}, not {}",
                    pipeline.0
                )));
            }
            match groups.get(group as usize) {
                Some(g) if g.kind == kind => Ok(g.program),
                Some(g) => Err(DeviceError::ShaderBindingTable(format!(
                    "record at {offset} is group {group} ({:?}), expected {kind:?}",
                    g.kind
                ))),
                None => Err(DeviceError::ShaderBindingTable(format!("group {group} out of range"))),
            }
        };

        let raygen = record(&sbt.raygen, 0, ShaderGroupKind::RayGen)?;
        let miss = (0..sbt.miss.count() as u32)
            .map(|i| record(&sbt.miss, i, ShaderGroupKind::Miss))
            .collect::<DeviceResult<Vec<_>>>()?;
        let hit = (0..sbt.hit.count() as u32)
            .map(|i| record(&sbt.hit, i, ShaderGroupKind::Hit))
            .collect::<DeviceResult<Vec<_>>>()?;
        Ok(ResolvedSbt { raygen, miss, hit })
    }

    fn execute(&mut self, commands: &[Command]) -> DeviceResult<()> {
        for command in commands {
            match command {
                Command::UpdateBuffer { buffer, offset, data } => {
                    let target = self.buffers.get_mut(&buffer.0).ok_or(DeviceError::UnknownHandle {
                        kind: "buffer",
                        id: buffer.0,
                    })?;
                    let range = target.range(*offset, data.len() as u64)?;
                    target.data[range].copy_from_slice(data);
                }
                Command::ClearColor { texture, color } => {
                    let texel = blend::pack(*color);
                    self.with_texture(*texture, |t| t.fill(texel))?;
                }
                Command::ClearDepth { texture, depth } => {
                    let texel = depth.to_le_bytes();
                    self.with_texture(*texture, |t| t.fill(texel))?;
                }
                Command::Composite { target, layers } => self.composite(*target, layers)?,
                Command::TraceRays {
                    pipeline,
                    sbt,
                    launch,
                    bindings,
                } => {
                    let resolved = self.resolve_sbt(*pipeline, sbt)?;
                    let geometry = self.geometry(bindings.accel)?;
                    let uniforms = self.read_uniforms(bindings.uniforms.buffer, bindings.uniforms.offset)?;
                    let mut tracer = Tracer::new(&geometry, &resolved);

                    match resolved.raygen {
                        ShaderProgram::PaintRaygen => {
                            let mut target = self.take_texture(bindings.target)?;
                            let result = target.check(*launch).and_then(|_| {
                                shaders::paint_raygen(&mut tracer, &mut target, *launch, &uniforms, bindings.occlusion_test)
                            });
                            self.textures.insert(bindings.target.0, target);
                            self.stats.texels_painted += result?;
                        }
                        ShaderProgram::ViewRaygen => {
                            let depth_handle = bindings.depth.ok_or_else(|| {
                                DeviceError::Submission("view trace without depth target".to_string())
                            })?;
                            let mut color = self.take_texture(bindings.target)?;
                            let mut depth = match self.take_texture(depth_handle) {
                                Ok(depth) => depth,
                                Err(err) => {
                                    self.textures.insert(bindings.target.0, color);
                                    return Err(err);
                                }
                            };
                            let paint = bindings.paint_texture.and_then(|t| self.textures.get(&t.0));
                            let result = shaders::view_raygen(&mut tracer, &mut color, &mut depth, paint, &uniforms, &bindings.push);
                            self.textures.insert(bindings.target.0, color);
                            self.textures.insert(depth_handle.0, depth);
                            result?;
                        }
                        other => {
                            return Err(DeviceError::ShaderBindingTable(format!(
                                "{other:?} is not a ray-generation program"
                            )));
                        }
                    }
                    self.stats.rays_traced += tracer.rays();
                }
                Command::Rasterize { bindings } => {
                    let geometry = self.geometry(bindings.accel)?;
                    let uniforms = self.read_uniforms(bindings.uniforms.buffer, bindings.uniforms.offset)?;
                    let mut color = self.take_texture(bindings.color)?;
                    let mut depth = match self.take_texture(bindings.depth) {
                        Ok(depth) => depth,
                        Err(err) => {
                            self.textures.insert(bindings.color.0, color);
                            return Err(err);
                        }
                    };
                    let paint = self.textures.get(&bindings.paint_texture.0);
                    shaders::rasterize(&geometry, &mut color, &mut depth, paint, &uniforms, &bindings.push);
                    self.textures.insert(bindings.color.0, color);
                    self.textures.insert(bindings.depth.0, depth);
                }
                Command::Post { source, target } => {
                    let mut out = self.take_texture(*target)?;
                    let result = self.texture(*source).map(|src| shaders::post(src, &mut out));
                    self.textures.insert(target.0, out);
                    result?;
                }
                Command::CopyTexture { src, dst, region } => {
                    let source = self.texture(*src)?;
                    source.check(*region)?;
                    let data = source.read(*region);
                    let target = self.textures.get_mut(&dst.0).ok_or(DeviceError::UnknownHandle {
                        kind: "texture",
                        id: dst.0,
                    })?;
                    target.check(*region)?;
                    target.write(*region, &data);
                }
                Command::CopyTextureToBuffer { texture, buffer, offset } => {
                    let source = self.texture(*texture)?;
                    let data = source.read(source.desc.full_region());
                    let target = self.buffers.get_mut(&buffer.0).ok_or(DeviceError::UnknownHandle {
                        kind: "buffer",
                        id: buffer.0,
                    })?;
                    let range = target.range(*offset, data.len() as u64)?;
                    target.data[range].copy_from_slice(&data);
                }
                Command::CopyRegionToBuffer {
                    texture,
                    region,
                    buffer,
                    offset,
                } => {
                    let source = self.texture(*texture)?;
                    source.check(*region)?;
                    let data = source.read(*region);
                    let target = self.buffer_mut(*buffer)?;
                    let range = target.range(*offset, data.len() as u64)?;
                    target.data[range].copy_from_slice(&data);
                }
                Command::SwapRegionWithBuffer {
                    texture,
                    region,
                    buffer,
                    offset,
                } => {
                    let stored = {
                        let source = self.buffer(*buffer)?;
                        source.data[source.range(*offset, region.byte_len(4))?].to_vec()
                    };
                    let target = self.textures.get_mut(&texture.0).ok_or(DeviceError::UnknownHandle {
                        kind: "texture",
                        id: texture.0,
                    })?;
                    target.check(*region)?;
                    let current = target.read(*region);
                    target.write(*region, &stored);
                    let source = self.buffer_mut(*buffer)?;
                    let range = source.range(*offset, current.len() as u64)?;
                    source.data[range].copy_from_slice(&current);
                }
            }
        }
        Ok(())
    }

    fn with_texture(&mut self, texture: TextureHandle, f: impl FnOnce(&mut CpuTexture)) -> DeviceResult<()> {
        let target = self.textures.get_mut(&texture.0).ok_or(DeviceError::UnknownHandle {
            kind: "texture",
            id: texture.0,
        })?;
        f(target);
        Ok(())
    }

    fn composite(&mut self, target: TextureHandle, layers: &[CompositeInput]) -> DeviceResult<()> {
        let mut out = self.take_texture(target)?;
        let sources: DeviceResult<Vec<_>> = layers
            .iter()
            .map(|input| {
                let texture = self.texture(input.texture)?;
                if texture.desc.width != out.desc.width || texture.desc.height != out.desc.height {
                    return Err(DeviceError::Submission(format!(
                        "layer texture {} is {}x{}, paint texture is {}x{}",
                        input.texture.0, texture.desc.width, texture.desc.height, out.desc.width, out.desc.height
                    )));
                }
                Ok((texture, input.blend, input.opacity))
            })
            .collect();
        let sources = match sources {
            Ok(sources) => sources,
            Err(err) => {
                self.textures.insert(target.0, out);
                return Err(err);
            }
        };

        for (i, texel) in out.texels.iter_mut().enumerate() {
            let acc = sources
                .iter()
                .fold([0.0; 4], |acc, (src, mode, opacity)| blend::composite(acc, src.texels[i], *mode, *opacity));
            *texel = blend::pack(acc);
        }
        self.textures.insert(target.0, out);
        Ok(())
    }
}

impl GpuDevice for CpuDevice {
    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> DeviceResult<TextureHandle> {
        self.check_lost()?;
        let max = self.limits.max_texture_dimension;
        if desc.width == 0 || desc.height == 0 || desc.width > max || desc.height > max {
            return Err(DeviceError::OutOfBounds {
                region: desc.full_region(),
                width: max,
                height: max,
            });
        }
        self.allocate(MemoryKind::DeviceImage, desc.byte_size())?;
        let id = self.next_id();
        self.textures.insert(id, CpuTexture::new(*desc));
        self.stats.textures_created += 1;
        Ok(TextureHandle(id))
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.destroy(Deferred::Texture(texture));
    }

    fn texture_desc(&self, texture: TextureHandle) -> DeviceResult<TextureDesc> {
        self.texture(texture).map(|t| t.desc)
    }

    fn read_region(&mut self, texture: TextureHandle, region: Region) -> DeviceResult<Vec<u8>> {
        self.settle(texture)?;
        let source = self.texture(texture)?;
        source.check(region)?;
        Ok(source.read(region))
    }

    fn write_region(&mut self, texture: TextureHandle, region: Region, data: &[u8]) -> DeviceResult<()> {
        self.settle(texture)?;
        let target = self.textures.get_mut(&texture.0).ok_or(DeviceError::UnknownHandle {
            kind: "texture",
            id: texture.0,
        })?;
        target.check(region)?;
        if data.len() as u64 != region.byte_len(4) {
            return Err(DeviceError::Submission(format!(
                "{} bytes for a {}x{} region",
                data.len(),
                region.width,
                region.height
            )));
        }
        target.write(region, data);
        Ok(())
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> DeviceResult<BufferHandle> {
        self.check_lost()?;
        self.allocate(desc.memory, desc.size)?;
        let id = self.next_id();
        self.buffers.insert(
            id,
            CpuBuffer {
                desc: *desc,
                data: vec![0; desc.size as usize],
            },
        );
        Ok(BufferHandle(id))
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.destroy(Deferred::Buffer(buffer));
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let target = self.buffers.get_mut(&buffer.0).ok_or(DeviceError::UnknownHandle {
            kind: "buffer",
            id: buffer.0,
        })?;
        let range = target.range(offset, data.len() as u64)?;
        target.data[range].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferHandle, offset: u64, len: u64) -> DeviceResult<Vec<u8>> {
        let source = self.buffer(buffer)?;
        let range = source.range(offset, len)?;
        Ok(source.data[range].to_vec())
    }

    fn build_acceleration_structure(
        &mut self,
        geometry: Arc<MeshGeometry>,
    ) -> DeviceResult<AccelerationStructureHandle> {
        self.check_lost()?;
        // Rough footprint: vertex attributes plus one node per triangle
        let bytes = geometry.vertex_count() as u64 * 32 + geometry.triangle_count() as u64 * 64;
        self.allocate(MemoryKind::DeviceBuffer, bytes)?;
        let id = self.next_id();
        debug!(
            "Built acceleration structure {} ({} triangles)",
            id,
            geometry.triangle_count()
        );
        self.accels.insert(id, geometry);
        Ok(AccelerationStructureHandle(id))
    }

    fn destroy_acceleration_structure(&mut self, accel: AccelerationStructureHandle) {
        if let Err(err) = self.poll() {
            warn!("Retiring work before acceleration structure destroy failed: {}", err);
        }
        if let Some(geometry) = self.accels.remove(&accel.0) {
            let bytes = geometry.vertex_count() as u64 * 32 + geometry.triangle_count() as u64 * 64;
            self.release(MemoryKind::DeviceBuffer, bytes);
        }
    }

    fn create_ray_tracing_pipeline(&mut self, groups: &[ShaderGroup]) -> DeviceResult<PipelineHandle> {
        self.check_lost()?;
        if let Some(bad) = groups.iter().find(|g| g.program.kind() != g.kind) {
            return Err(DeviceError::Submission(format!(
                "{:?} cannot be used as a {:?} group",
                bad.program, bad.kind
            )));
        }
        if !groups.iter().any(|g| g.kind == ShaderGroupKind::RayGen) {
            return Err(DeviceError::Submission("pipeline without ray generation group".to_string()));
        }
        let id = self.next_id();
        self.pipelines.insert(id, groups.to_vec());
        Ok(PipelineHandle(id))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        self.pipelines.remove(&pipeline.0);
    }

    fn shader_group_handles(&self, pipeline: PipelineHandle, first: u32, count: u32) -> DeviceResult<Vec<u8>> {
        let groups = self.pipelines.get(&pipeline.0).ok_or(DeviceError::UnknownHandle {
            kind: "pipeline",
            id: pipeline.0,
        })?;
        if (first + count) as usize > groups.len() {
            return Err(DeviceError::Submission(format!(
                "groups {first}..{} requested from a {}-group pipeline",
                first + count,
                groups.len()
            )));
        }
        let handle_size = self.limits.shader_group_handle_size as usize;
        let mut data = vec![0; handle_size * count as usize];
        for (slot, group) in (first..first + count).enumerate() {
            let record = &mut data[slot * handle_size..];
            record[..4].copy_from_slice(&pipeline.0.to_le_bytes());
            record[4..8].copy_from_slice(&group.to_le_bytes());
        }
        Ok(data)
    }

    fn create_fence(&mut self, signaled: bool) -> FenceHandle {
        let id = self.next_id();
        self.fences.insert(id, signaled);
        FenceHandle(id)
    }

    fn wait_fence(&mut self, fence: FenceHandle, timeout: Duration) -> DeviceResult<()> {
        self.poll()?;
        match self.fences.get(&fence.0) {
            Some(true) => Ok(()),
            // Nothing else can retire the stalled work
            Some(false) => Err(DeviceError::Timeout(timeout)),
            None => Err(DeviceError::UnknownHandle {
                kind: "fence",
                id: fence.0,
            }),
        }
    }

    fn reset_fence(&mut self, fence: FenceHandle) -> DeviceResult<()> {
        match self.fences.get_mut(&fence.0) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => Err(DeviceError::UnknownHandle {
                kind: "fence",
                id: fence.0,
            }),
        }
    }

    fn fence_signaled(&self, fence: FenceHandle) -> DeviceResult<bool> {
        self.fences.get(&fence.0).copied().ok_or(DeviceError::UnknownHandle {
            kind: "fence",
            id: fence.0,
        })
    }

    fn destroy_fence(&mut self, fence: FenceHandle) {
        self.fences.remove(&fence.0);
    }

    fn create_semaphore(&mut self, exportable: bool) -> DeviceResult<SemaphoreHandle> {
        self.check_lost()?;
        let id = self.next_id();
        self.semaphores.insert(
            id,
            CpuSemaphore {
                signaled: false,
                exportable,
            },
        );
        Ok(SemaphoreHandle(id))
    }

    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle) {
        self.semaphores.remove(&semaphore.0);
        self.external.retain(|_, object| *object != Exportable::Semaphore(semaphore));
    }

    fn submit(&mut self, submission: Submission) -> DeviceResult<()> {
        self.check_lost()?;
        if let Some(fence) = submission.fence {
            match self.fences.get(&fence.0) {
                Some(false) => {}
                Some(true) => {
                    return Err(DeviceError::Submission(format!("fence {} is already signaled", fence.0)));
                }
                None => {
                    return Err(DeviceError::UnknownHandle {
                        kind: "fence",
                        id: fence.0,
                    });
                }
            }
        }
        if let Some(missing) = submission
            .wait
            .iter()
            .chain(&submission.signal)
            .find(|s| !self.semaphores.contains_key(&s.0))
        {
            return Err(DeviceError::UnknownHandle {
                kind: "semaphore",
                id: missing.0,
            });
        }
        self.stats.submissions += 1;
        self.queue.push_back(Work::Submit(submission));
        Ok(())
    }

    fn create_swapchain(&mut self, width: u32, height: u32, image_count: u32) -> DeviceResult<Vec<TextureHandle>> {
        self.destroy_swapchain();
        let images = (0..image_count)
            .map(|_| self.create_texture(&TextureDesc::rgba8(width, height)))
            .collect::<DeviceResult<Vec<_>>>()?;
        self.swapchain = images.clone();
        self.next_image = 0;
        Ok(images)
    }

    fn destroy_swapchain(&mut self) {
        for image in std::mem::take(&mut self.swapchain) {
            self.destroy_texture(image);
        }
    }

    fn acquire_next_image(&mut self, signal: SemaphoreHandle) -> DeviceResult<u32> {
        self.check_lost()?;
        if self.swapchain.is_empty() {
            return Err(DeviceError::Submission("no swapchain".to_string()));
        }
        let index = self.next_image;
        self.next_image = (index + 1) % self.swapchain.len() as u32;
        // Images are always available immediately
        match self.semaphores.get_mut(&signal.0) {
            Some(s) => s.signaled = true,
            None => {
                return Err(DeviceError::UnknownHandle {
                    kind: "semaphore",
                    id: signal.0,
                });
            }
        }
        Ok(index)
    }

    fn present(&mut self, image_index: u32, wait: &[SemaphoreHandle]) -> DeviceResult<()> {
        self.check_lost()?;
        if image_index as usize >= self.swapchain.len() {
            return Err(DeviceError::Submission(format!("no swapchain image {image_index}")));
        }
        self.queue.push_back(Work::Present {
            image: image_index,
            wait: wait.to_vec(),
        });
        Ok(())
    }

    fn wait_idle(&mut self) -> DeviceResult<()> {
        self.drain()
    }
}

impl ExternalSync for CpuDevice {
    fn export_handle(&mut self, object: Exportable) -> DeviceResult<RawHandle> {
        if let Some((&handle, _)) = self.external.iter().find(|(_, o)| **o == object) {
            return Ok(handle);
        }
        let exportable = match object {
            Exportable::Memory(buffer) => self.buffer(buffer)?.desc.memory == MemoryKind::External,
            Exportable::Semaphore(semaphore) => {
                self.semaphores
                    .get(&semaphore.0)
                    .ok_or(DeviceError::UnknownHandle {
                        kind: "semaphore",
                        id: semaphore.0,
                    })?
                    .exportable
            }
        };
        if !exportable {
            let id = match object {
                Exportable::Memory(buffer) => buffer.0,
                Exportable::Semaphore(semaphore) => semaphore.0,
            };
            return Err(DeviceError::NotExportable(id));
        }
        let handle = self.next_external;
        self.next_external += 1;
        self.external.insert(handle, object);
        Ok(handle)
    }

    fn import_and_wait(&mut self, handle: RawHandle, timeout: Duration) -> DeviceResult<()> {
        let semaphore = self.semaphore_for(handle)?;
        self.poll()?;
        match self.semaphores.get_mut(&semaphore.0) {
            Some(s) if s.signaled => {
                s.signaled = false;
                Ok(())
            }
            _ => Err(DeviceError::Timeout(timeout)),
        }
    }

    fn import_and_signal(&mut self, handle: RawHandle) -> DeviceResult<()> {
        let semaphore = self.semaphore_for(handle)?;
        if let Some(s) = self.semaphores.get_mut(&semaphore.0) {
            s.signaled = true;
        }
        Ok(())
    }

    fn read_external(&mut self, handle: RawHandle, offset: u64, len: u64) -> DeviceResult<Vec<u8>> {
        match self.external.get(&handle) {
            Some(Exportable::Memory(buffer)) => {
                let buffer = *buffer;
                self.read_buffer(buffer, offset, len)
            }
            _ => Err(DeviceError::UnknownExternal(handle)),
        }
    }
}
