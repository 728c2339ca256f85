// SPDX-License-Identifier: CEPL-1.0
//! One primary command buffer per frame slot, plus throwaway buffers for uploads.
use std::sync::Arc;

use ash::vk;
use tracing::trace;

use crate::context::DeviceContext;
use crate::error::{VkError, VkResult};
use crate::mesh::Mesh;
use crate::pipeline::GraphicsPipeline;
use crate::sync::FrameSlot;

/// Where a frame's render pass draws to.
#[derive(Clone, Copy, Debug)]
pub struct FrameTarget {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub clear_color: [f32; 4],
}

pub struct CommandRecorder {
    ctx: Arc<DeviceContext>,
    pool: vk::CommandPool,
    buffers: Vec<vk::CommandBuffer>,
    queue: vk::Queue,
}

impl CommandRecorder {
    pub fn new(ctx: &Arc<DeviceContext>, slots: usize) -> VkResult<Self> {
        let device = ctx.device()?;
        let family = ctx.queue_families()?.graphics;
        let pool_info = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            queue_family_index: family,
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            ..Default::default()
        };
        let pool = unsafe { device.create_command_pool(&pool_info, None)? };
        let alloc_info = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: slots.max(1) as u32,
            ..Default::default()
        };
        let buffers = match unsafe { device.allocate_command_buffers(&alloc_info) } {
            Ok(b) => b,
            Err(e) => {
                unsafe { device.destroy_command_pool(pool, None) };
                return Err(e.into());
            }
        };
        Ok(CommandRecorder {
            ctx: Arc::clone(ctx),
            pool,
            buffers,
            queue: ctx.graphics_queue()?,
        })
    }

    pub fn buffer(&self, slot: usize) -> vk::CommandBuffer {
        self.buffers[slot % self.buffers.len()]
    }

    /// Only valid once the slot's fence has been observed signaled.
    pub fn reset(&self, slot: usize) -> VkResult<()> {
        let device = self.ctx.device()?;
        unsafe {
            device.reset_command_buffer(self.buffer(slot), vk::CommandBufferResetFlags::empty())?
        };
        Ok(())
    }

    /// Open the slot's buffer, begin the render pass and set viewport/scissor.
    pub fn begin_frame(&self, slot: usize, target: &FrameTarget) -> VkResult<vk::CommandBuffer> {
        let device = self.ctx.device()?;
        let cmd = self.buffer(slot);
        let bi = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            ..Default::default()
        };
        let clear = vk::ClearValue {
            color: vk::ClearColorValue {
                float32: target.clear_color,
            },
        };
        let rp_begin = vk::RenderPassBeginInfo {
            s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
            render_pass: target.render_pass,
            framebuffer: target.framebuffer,
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: target.extent,
            },
            clear_value_count: 1,
            p_clear_values: &clear,
            ..Default::default()
        };
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: target.extent.width as f32,
            height: target.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: target.extent,
        };
        unsafe {
            device.begin_command_buffer(cmd, &bi)?;
            device.cmd_begin_render_pass(cmd, &rp_begin, vk::SubpassContents::INLINE);
            device.cmd_set_viewport(cmd, 0, std::slice::from_ref(&viewport));
            device.cmd_set_scissor(cmd, 0, std::slice::from_ref(&scissor));
        }
        Ok(cmd)
    }

    /// Bind pipeline, geometry and the slot's set at `dynamic_offset`, then draw every index.
    pub fn record_draw(
        &self,
        slot: usize,
        pipeline: &GraphicsPipeline,
        mesh: &Mesh,
        set: vk::DescriptorSet,
        dynamic_offset: u32,
    ) -> VkResult<()> {
        let device = self.ctx.device()?;
        let cmd = self.buffer(slot);
        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.handle());
            device.cmd_bind_vertex_buffers(cmd, 0, &[mesh.vertex_buffer()], &[0]);
            device.cmd_bind_index_buffer(cmd, mesh.index_buffer(), 0, vk::IndexType::UINT32);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.layout(),
                0,
                &[set],
                &[dynamic_offset],
            );
            device.cmd_draw_indexed(cmd, mesh.index_count(), 1, 0, 0, 0);
        }
        trace!(slot, dynamic_offset, indices = mesh.index_count(), "draw recorded");
        Ok(())
    }

    pub fn end_frame(&self, slot: usize) -> VkResult<()> {
        let device = self.ctx.device()?;
        let cmd = self.buffer(slot);
        unsafe {
            device.cmd_end_render_pass(cmd);
            device.end_command_buffer(cmd)?;
        }
        Ok(())
    }

    /// Queue the slot's buffer behind "image available"; signal "render finished" and the fence.
    pub fn submit(&self, slot: usize, sync: &FrameSlot) -> VkResult<()> {
        let device = self.ctx.device()?;
        let cmd = self.buffer(slot);
        let wait = [sync.image_available.handle()];
        let stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal = [sync.render_finished.handle()];
        let si = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: wait.len() as u32,
            p_wait_semaphores: wait.as_ptr(),
            p_wait_dst_stage_mask: stages.as_ptr(),
            command_buffer_count: 1,
            p_command_buffers: &cmd,
            signal_semaphore_count: signal.len() as u32,
            p_signal_semaphores: signal.as_ptr(),
            ..Default::default()
        };
        unsafe {
            device.queue_submit(
                self.queue,
                std::slice::from_ref(&si),
                sync.in_flight.handle(),
            )
        }
        .map_err(VkError::classify)
    }

    /// Record with `f` into a one-time buffer, submit, wait for the queue, free.
    ///
    /// Must not be called while a frame recording is open.
    pub fn run_immediate<F>(&self, f: F) -> VkResult<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let device = self.ctx.device()?;
        let ai = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: self.pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        let cmd = unsafe { device.allocate_command_buffers(&ai)? }[0];

        let result = (|| -> VkResult<()> {
            let bi = vk::CommandBufferBeginInfo {
                s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
                flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                ..Default::default()
            };
            unsafe { device.begin_command_buffer(cmd, &bi)? };
            f(cmd);
            unsafe { device.end_command_buffer(cmd)? };

            let si = vk::SubmitInfo {
                s_type: vk::StructureType::SUBMIT_INFO,
                command_buffer_count: 1,
                p_command_buffers: &cmd,
                ..Default::default()
            };
            unsafe {
                device
                    .queue_submit(self.queue, std::slice::from_ref(&si), vk::Fence::null())
                    .map_err(VkError::classify)?;
                device.queue_wait_idle(self.queue).map_err(VkError::classify)?;
            }
            Ok(())
        })();

        unsafe { device.free_command_buffers(self.pool, std::slice::from_ref(&cmd)) };
        result
    }
}

impl Drop for CommandRecorder {
    fn drop(&mut self) {
        if let Ok(device) = self.ctx.device() {
            // Frees every buffer allocated from it.
            unsafe { device.destroy_command_pool(self.pool, None) };
        }
    }
}
