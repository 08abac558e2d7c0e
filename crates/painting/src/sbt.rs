//! Shader binding table
//!
//! Group handles are copied into host-visible memory one record per group,
//! each record `stride` bytes apart where the stride is the device's
//! shader-group base alignment. Groups are laid out raygen first, then the
//! miss groups, then the hit groups; trace calls address miss and hit
//! records by index, so the order is part of the contract with the shaders.

use tracing::debug;

use crate::constants::{HIT_GROUP_COUNT, MISS_GROUP_COUNT, RAYGEN_GROUP_COUNT};
use crate::device::{BufferHandle, GpuDevice, PipelineHandle, SbtRegions, StridedRegion};
use crate::error::{PaintError, PaintResult};
use crate::memory::HostArena;

/// Number of groups of each kind, in table order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtLayout {
    pub raygen: u32,
    pub miss: u32,
    pub hit: u32,
}

impl SbtLayout {
    /// Raygen, primary miss, occlusion miss, closest hit
    pub const STANDARD: Self = Self {
        raygen: RAYGEN_GROUP_COUNT,
        miss: MISS_GROUP_COUNT,
        hit: HIT_GROUP_COUNT,
    };

    pub fn group_count(&self) -> u32 {
        self.raygen + self.miss + self.hit
    }

    /// Index of the first miss group
    pub fn first_miss(&self) -> u32 {
        self.raygen
    }

    /// Index of the first hit group
    pub fn first_hit(&self) -> u32 {
        self.raygen + self.miss
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderBindingTable {
    buffer: BufferHandle,
    /// Offset of the raygen record
    base: u64,
    stride: u64,
    layout: SbtLayout,
}

impl ShaderBindingTable {
    /// Copy the group handles of `pipeline` into an aligned arena block
    pub fn build(
        device: &mut dyn GpuDevice,
        arena: &mut HostArena,
        pipeline: PipelineHandle,
        layout: SbtLayout,
    ) -> PaintResult<Self> {
        let limits = device.limits();
        let stride = u64::from(limits.shader_group_base_alignment);
        let handle_size = limits.shader_group_handle_size as usize;
        if (handle_size as u64) > stride {
            return Err(PaintError::SubmissionFailed(format!(
                "shader group handle size {handle_size} exceeds base alignment {stride}"
            )));
        }

        let count = layout.group_count();
        let handles = device.shader_group_handles(pipeline, 0, count)?;
        let block = arena.allocate(u64::from(count) * stride, stride)?;

        let table = Self {
            buffer: block.buffer,
            base: block.offset,
            stride,
            layout,
        };
        for (group, handle) in handles.chunks_exact(handle_size).enumerate() {
            device.write_buffer(table.buffer, table.record_offset(group as u32), handle)?;
        }
        debug!(
            "Shader binding table: {} groups at {} (stride {})",
            count, table.base, stride
        );
        Ok(table)
    }

    /// Offset of group `group`'s record: `base + group * stride`
    pub fn record_offset(&self, group: u32) -> u64 {
        self.base + u64::from(group) * self.stride
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    pub fn layout(&self) -> SbtLayout {
        self.layout
    }

    /// Raygen, miss and hit regions as passed to a trace command
    pub fn regions(&self) -> SbtRegions {
        let region = |first: u32, count: u32| StridedRegion {
            offset: self.record_offset(first),
            stride: self.stride,
            size: u64::from(count) * self.stride,
        };
        SbtRegions {
            buffer: self.buffer,
            raygen: region(0, self.layout.raygen),
            miss: region(self.layout.first_miss(), self.layout.miss),
            hit: region(self.layout.first_hit(), self.layout.hit),
        }
    }
}
