// SPDX-License-Identifier: CEPL-1.0
//! Per-slot uniform storage and the descriptor sets that point at it.
//!
//! Set 0 layout:
//! - binding 0: `ViewProjection` (uniform buffer, vertex)
//! - binding 1: per-instance model matrix (dynamic uniform buffer, vertex)
//! - binding 2: base color texture (combined image sampler, fragment)
use std::mem::size_of;
use std::sync::Arc;

use ash::vk;
use kestrel_math::{Mat4, ViewProjection};
use tracing::debug;

use crate::context::DeviceContext;
use crate::error::{VkError, VkResult};
use crate::memory::{dynamic_stride, GpuBuffer};
use crate::texture::{Sampler, Texture};

pub const GLOBAL_BINDING: u32 = 0;
pub const INSTANCE_BINDING: u32 = 1;
pub const TEXTURE_BINDING: u32 = 2;

/// Stride and capacity of the dynamic per-instance block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstanceLayout {
    pub stride: vk::DeviceSize,
    pub capacity: u32,
}

impl InstanceLayout {
    pub fn new(min_alignment: vk::DeviceSize, capacity: u32) -> Self {
        InstanceLayout {
            stride: dynamic_stride(size_of::<Mat4>() as vk::DeviceSize, min_alignment),
            capacity: capacity.max(1),
        }
    }

    /// Bytes per slot: `stride * capacity`.
    pub fn total_size(&self) -> vk::DeviceSize {
        self.stride * self.capacity as vk::DeviceSize
    }

    pub fn offset(&self, index: u32) -> VkResult<vk::DeviceSize> {
        if index >= self.capacity {
            return Err(VkError::CapacityExceeded {
                index,
                capacity: self.capacity,
            });
        }
        Ok(self.stride * index as vk::DeviceSize)
    }

    /// Offset for `vkCmdBindDescriptorSets`.
    pub fn dynamic_offset(&self, index: u32) -> VkResult<u32> {
        let offset = self.offset(index)?;
        u32::try_from(offset).map_err(|_| VkError::CapacityExceeded {
            index,
            capacity: self.capacity,
        })
    }
}

pub struct DescriptorSetLayout {
    ctx: Arc<DeviceContext>,
    handle: vk::DescriptorSetLayout,
}

impl DescriptorSetLayout {
    pub fn frame_layout(ctx: &Arc<DeviceContext>) -> VkResult<Self> {
        let bindings = [
            vk::DescriptorSetLayoutBinding {
                binding: GLOBAL_BINDING,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 1,
                stage_flags: vk::ShaderStageFlags::VERTEX,
                ..Default::default()
            },
            vk::DescriptorSetLayoutBinding {
                binding: INSTANCE_BINDING,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                descriptor_count: 1,
                stage_flags: vk::ShaderStageFlags::VERTEX,
                ..Default::default()
            },
            vk::DescriptorSetLayoutBinding {
                binding: TEXTURE_BINDING,
                descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: 1,
                stage_flags: vk::ShaderStageFlags::FRAGMENT,
                ..Default::default()
            },
        ];
        let ci = vk::DescriptorSetLayoutCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_LAYOUT_CREATE_INFO,
            binding_count: bindings.len() as u32,
            p_bindings: bindings.as_ptr(),
            ..Default::default()
        };
        let handle = unsafe { ctx.device()?.create_descriptor_set_layout(&ci, None)? };
        Ok(DescriptorSetLayout {
            ctx: Arc::clone(ctx),
            handle,
        })
    }

    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.handle
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        if let Ok(device) = self.ctx.device() {
            unsafe { device.destroy_descriptor_set_layout(self.handle, None) };
        }
    }
}

struct DescriptorPool {
    ctx: Arc<DeviceContext>,
    handle: vk::DescriptorPool,
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        if let Ok(device) = self.ctx.device() {
            // Frees the sets allocated from it.
            unsafe { device.destroy_descriptor_pool(self.handle, None) };
        }
    }
}

struct SlotUniforms {
    set: vk::DescriptorSet,
    globals: GpuBuffer,
    instances: GpuBuffer,
}

/// Uniform buffers and descriptor sets for every frame slot.
///
/// A slot's buffers may only be written once that slot's fence was observed
/// signaled, i.e. between `acquire` and `submit` of the slot's own frame.
pub struct FrameUniforms {
    // Sets go with the pool, so slots drop before it.
    slots: Vec<SlotUniforms>,
    pool: DescriptorPool,
    layout: DescriptorSetLayout,
    instance_layout: InstanceLayout,
}

impl FrameUniforms {
    pub fn new(
        ctx: &Arc<DeviceContext>,
        slot_count: usize,
        capacity: u32,
        texture: &Texture,
        sampler: &Sampler,
    ) -> VkResult<Self> {
        let device = ctx.device()?;
        let min_alignment = ctx.limits()?.min_uniform_buffer_offset_alignment;
        let instance_layout = InstanceLayout::new(min_alignment, capacity);
        let layout = DescriptorSetLayout::frame_layout(ctx)?;
        let n = slot_count.max(1) as u32;

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: n,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                descriptor_count: n,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: n,
            },
        ];
        let pool_ci = vk::DescriptorPoolCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
            max_sets: n,
            pool_size_count: pool_sizes.len() as u32,
            p_pool_sizes: pool_sizes.as_ptr(),
            ..Default::default()
        };
        let pool = DescriptorPool {
            ctx: Arc::clone(ctx),
            handle: unsafe { device.create_descriptor_pool(&pool_ci, None)? },
        };

        let layouts = vec![layout.handle(); n as usize];
        let alloc = vk::DescriptorSetAllocateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
            descriptor_pool: pool.handle,
            descriptor_set_count: n,
            p_set_layouts: layouts.as_ptr(),
            ..Default::default()
        };
        let sets = unsafe { device.allocate_descriptor_sets(&alloc)? };

        let mut slots = Vec::with_capacity(sets.len());
        for set in sets {
            let globals = GpuBuffer::new_mapped(
                ctx,
                size_of::<ViewProjection>() as vk::DeviceSize,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
            )?;
            let instances = GpuBuffer::new_mapped(
                ctx,
                instance_layout.total_size(),
                vk::BufferUsageFlags::UNIFORM_BUFFER,
            )?;
            slots.push(SlotUniforms {
                set,
                globals,
                instances,
            });
        }

        let uniforms = FrameUniforms {
            slots,
            pool,
            layout,
            instance_layout,
        };
        uniforms.write_descriptors(device, texture, sampler);
        debug!(
            slots = n,
            stride = instance_layout.stride,
            capacity = instance_layout.capacity,
            "frame uniforms created"
        );
        Ok(uniforms)
    }

    fn write_descriptors(&self, device: &ash::Device, texture: &Texture, sampler: &Sampler) {
        let image_info = vk::DescriptorImageInfo {
            sampler: sampler.handle(),
            image_view: texture.view(),
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };
        for slot in &self.slots {
            let global_info = vk::DescriptorBufferInfo {
                buffer: slot.globals.handle(),
                offset: 0,
                range: size_of::<ViewProjection>() as vk::DeviceSize,
            };
            // Dynamic binding: range is one element, the offset comes at bind time.
            let instance_info = vk::DescriptorBufferInfo {
                buffer: slot.instances.handle(),
                offset: 0,
                range: size_of::<Mat4>() as vk::DeviceSize,
            };
            let writes = [
                vk::WriteDescriptorSet {
                    s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                    dst_set: slot.set,
                    dst_binding: GLOBAL_BINDING,
                    descriptor_count: 1,
                    descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                    p_buffer_info: &global_info,
                    ..Default::default()
                },
                vk::WriteDescriptorSet {
                    s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                    dst_set: slot.set,
                    dst_binding: INSTANCE_BINDING,
                    descriptor_count: 1,
                    descriptor_type: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                    p_buffer_info: &instance_info,
                    ..Default::default()
                },
                vk::WriteDescriptorSet {
                    s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                    dst_set: slot.set,
                    dst_binding: TEXTURE_BINDING,
                    descriptor_count: 1,
                    descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    p_image_info: &image_info,
                    ..Default::default()
                },
            ];
            unsafe { device.update_descriptor_sets(&writes, &[]) };
        }
    }

    /// Point every slot at a different texture. The device must be idle.
    pub fn rebind_texture(&self, texture: &Texture, sampler: &Sampler) -> VkResult<()> {
        let device = self.pool.ctx.device()?;
        self.write_descriptors(device, texture, sampler);
        Ok(())
    }

    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout.handle()
    }

    pub fn instance_layout(&self) -> InstanceLayout {
        self.instance_layout
    }

    pub fn capacity(&self) -> u32 {
        self.instance_layout.capacity
    }

    pub fn set(&self, slot: usize) -> vk::DescriptorSet {
        self.slots[slot % self.slots.len()].set
    }

    pub fn write_globals(&mut self, slot: usize, vp: &ViewProjection) -> VkResult<()> {
        let n = self.slots.len();
        self.slots[slot % n]
            .globals
            .write(0, bytemuck::bytes_of(vp))
    }

    /// Store `model` at `index * stride`; fails past the configured capacity.
    pub fn write_instance(&mut self, slot: usize, index: u32, model: &Mat4) -> VkResult<()> {
        let offset = self.instance_layout.offset(index)?;
        let n = self.slots.len();
        self.slots[slot % n]
            .instances
            .write(offset, bytemuck::bytes_of(model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_follows_device_alignment() {
        assert_eq!(InstanceLayout::new(256, 125).stride, 256);
        assert_eq!(InstanceLayout::new(16, 125).stride, 64);
    }

    #[test]
    fn total_size_covers_every_instance() {
        let layout = InstanceLayout::new(256, 125);
        assert_eq!(layout.total_size(), 256 * 125);
    }

    #[test]
    fn offsets_step_by_stride() {
        let layout = InstanceLayout::new(256, 4);
        assert_eq!(layout.offset(0).unwrap(), 0);
        assert_eq!(layout.offset(3).unwrap(), 768);
        assert_eq!(layout.dynamic_offset(2).unwrap(), 512);
    }

    #[test]
    fn writing_past_capacity_is_rejected() {
        let layout = InstanceLayout::new(64, 4);
        assert!(matches!(
            layout.offset(4),
            Err(VkError::CapacityExceeded { index: 4, capacity: 4 })
        ));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        assert_eq!(InstanceLayout::new(64, 0).capacity, 1);
    }
}
