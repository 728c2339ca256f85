// SPDX-License-Identifier: CEPL-1.0
use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::command::CommandRecorder;
use crate::context::DeviceContext;
use crate::error::{VkError, VkResult};
use crate::memory::{create_image_view, staging_buffer, GpuImage, ImageView};

pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

/// Access masks and stages for the two transitions a texture upload needs.
pub fn layout_barrier_masks(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> VkResult<(
    vk::AccessFlags,
    vk::AccessFlags,
    vk::PipelineStageFlags,
    vk::PipelineStageFlags,
)> {
    match (old, new) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => Ok((
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
        )),
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => Ok((
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        )),
        _ => Err(VkError::UnsupportedLayoutTransition { old, new }),
    }
}

pub fn transition_layout(
    ctx: &DeviceContext,
    recorder: &CommandRecorder,
    image: vk::Image,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> VkResult<()> {
    let (src_access, dst_access, src_stage, dst_stage) = layout_barrier_masks(old, new)?;
    let device = ctx.device()?;
    let barrier = vk::ImageMemoryBarrier {
        s_type: vk::StructureType::IMAGE_MEMORY_BARRIER,
        src_access_mask: src_access,
        dst_access_mask: dst_access,
        old_layout: old,
        new_layout: new,
        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        image,
        subresource_range: vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        },
        ..Default::default()
    };
    recorder.run_immediate(|cmd| unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            std::slice::from_ref(&barrier),
        );
    })
}

/// Sampled RGBA8 image in device-local memory.
pub struct Texture {
    // View before image; the image frees its memory last.
    view: ImageView,
    image: GpuImage,
}

impl Texture {
    /// Upload tightly packed `width * height * 4` bytes.
    pub fn from_rgba8(
        ctx: &Arc<DeviceContext>,
        recorder: &CommandRecorder,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> VkResult<Self> {
        let expected = width as u64 * height as u64 * 4;
        if expected == 0 {
            return Err(VkError::ZeroSizedBuffer);
        }
        if pixels.len() as u64 != expected {
            return Err(VkError::OutOfBounds {
                offset: 0,
                len: pixels.len() as u64,
                size: expected,
            });
        }

        let staging = staging_buffer(ctx, pixels)?;
        let extent = vk::Extent2D { width, height };
        let image = GpuImage::new(
            ctx,
            extent,
            TEXTURE_FORMAT,
            vk::ImageTiling::OPTIMAL,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        transition_layout(
            ctx,
            recorder,
            image.handle(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )?;

        let device = ctx.device()?;
        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            image_extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
        };
        recorder.run_immediate(|cmd| unsafe {
            device.cmd_copy_buffer_to_image(
                cmd,
                staging.handle(),
                image.handle(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                std::slice::from_ref(&region),
            );
        })?;

        transition_layout(
            ctx,
            recorder,
            image.handle(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;

        let view = create_image_view(ctx, image.handle(), TEXTURE_FORMAT, vk::ImageAspectFlags::COLOR)?;
        debug!(width, height, "texture uploaded");
        Ok(Texture { view, image })
    }

    /// 1x1 opaque white, bound when a mesh has no texture of its own.
    pub fn white(ctx: &Arc<DeviceContext>, recorder: &CommandRecorder) -> VkResult<Self> {
        Texture::from_rgba8(ctx, recorder, 1, 1, &[255, 255, 255, 255])
    }

    pub fn view(&self) -> vk::ImageView {
        self.view.handle()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.image.extent()
    }
}

pub struct Sampler {
    ctx: Arc<DeviceContext>,
    handle: vk::Sampler,
}

impl Sampler {
    /// Linear filtering, repeat addressing, no anisotropy.
    pub fn linear(ctx: &Arc<DeviceContext>) -> VkResult<Self> {
        let ci = vk::SamplerCreateInfo {
            s_type: vk::StructureType::SAMPLER_CREATE_INFO,
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode_u: vk::SamplerAddressMode::REPEAT,
            address_mode_v: vk::SamplerAddressMode::REPEAT,
            address_mode_w: vk::SamplerAddressMode::REPEAT,
            anisotropy_enable: vk::FALSE,
            max_anisotropy: 1.0,
            border_color: vk::BorderColor::INT_OPAQUE_BLACK,
            unnormalized_coordinates: vk::FALSE,
            compare_enable: vk::FALSE,
            compare_op: vk::CompareOp::ALWAYS,
            ..Default::default()
        };
        let handle = unsafe { ctx.device()?.create_sampler(&ci, None)? };
        Ok(Sampler {
            ctx: Arc::clone(ctx),
            handle,
        })
    }

    pub fn handle(&self) -> vk::Sampler {
        self.handle
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        if let Ok(device) = self.ctx.device() {
            unsafe { device.destroy_sampler(self.handle, None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_transitions_are_supported() {
        let (src, dst, _, dst_stage) = layout_barrier_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        assert!(src.is_empty());
        assert_eq!(dst, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(dst_stage, vk::PipelineStageFlags::TRANSFER);

        let (src, dst, _, dst_stage) = layout_barrier_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(src, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(dst, vk::AccessFlags::SHADER_READ);
        assert_eq!(dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn other_transitions_are_rejected() {
        let res = layout_barrier_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        assert!(matches!(
            res,
            Err(VkError::UnsupportedLayoutTransition { .. })
        ));
    }
}
