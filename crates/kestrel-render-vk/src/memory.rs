// SPDX-License-Identifier: CEPL-1.0
//! Buffers, images and the memory behind them.
//!
//! Every wrapper releases its handle before its memory, on drop. Callers make
//! sure no in-flight frame still references the resource (device idle or the
//! owning slot's fence observed).
use std::sync::Arc;

use ash::vk;
use tracing::{debug, trace};

use crate::command::CommandRecorder;
use crate::context::DeviceContext;
use crate::error::{VkError, VkResult};

/// Depth formats in preference order.
pub const DEPTH_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// First memory type allowed by `type_bits` whose flags include `required`.
pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> VkResult<u32> {
    (0..props.memory_type_count)
        .find(|&i| {
            (type_bits & (1 << i)) != 0
                && props.memory_types[i as usize]
                    .property_flags
                    .contains(required)
        })
        .ok_or(VkError::NoSuitableMemoryType {
            type_bits,
            required,
        })
}

/// `size` rounded up to a multiple of `min_alignment` (0 means no constraint).
pub fn dynamic_stride(size: vk::DeviceSize, min_alignment: vk::DeviceSize) -> vk::DeviceSize {
    if min_alignment == 0 {
        return size;
    }
    size.div_ceil(min_alignment) * min_alignment
}

/// First candidate whose `tiling` features contain `features`, according to `probe`.
pub fn find_supported_format(
    candidates: &[vk::Format],
    tiling: vk::ImageTiling,
    features: vk::FormatFeatureFlags,
    probe: impl Fn(vk::Format) -> VkResult<vk::FormatProperties>,
) -> VkResult<vk::Format> {
    for &format in candidates {
        let props = probe(format)?;
        let supported = match tiling {
            vk::ImageTiling::LINEAR => props.linear_tiling_features.contains(features),
            vk::ImageTiling::OPTIMAL => props.optimal_tiling_features.contains(features),
            _ => false,
        };
        if supported {
            return Ok(format);
        }
    }
    Err(VkError::UnsupportedFormat)
}

pub fn find_depth_format(ctx: &DeviceContext) -> VkResult<vk::Format> {
    find_supported_format(
        &DEPTH_CANDIDATES,
        vk::ImageTiling::OPTIMAL,
        vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        |f| ctx.format_properties(f),
    )
}

pub fn has_stencil_component(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D24_UNORM_S8_UINT
    )
}

fn check_range(
    offset: vk::DeviceSize,
    len: vk::DeviceSize,
    size: vk::DeviceSize,
) -> VkResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(VkError::OutOfBounds { offset, len, size }),
    }
}

fn allocate(
    ctx: &DeviceContext,
    requirements: vk::MemoryRequirements,
    props: vk::MemoryPropertyFlags,
) -> VkResult<vk::DeviceMemory> {
    let device = ctx.device()?;
    let memory_type_index =
        find_memory_type(ctx.memory_properties()?, requirements.memory_type_bits, props)?;
    let mai = vk::MemoryAllocateInfo {
        s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
        allocation_size: requirements.size,
        memory_type_index,
        ..Default::default()
    };
    Ok(unsafe { device.allocate_memory(&mai, None)? })
}

/// A buffer with its own allocation. Host-visible buffers may stay mapped.
pub struct GpuBuffer {
    ctx: Arc<DeviceContext>,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    mapped: *mut u8,
}

impl GpuBuffer {
    pub fn new(
        ctx: &Arc<DeviceContext>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        props: vk::MemoryPropertyFlags,
    ) -> VkResult<Self> {
        if size == 0 {
            return Err(VkError::ZeroSizedBuffer);
        }
        let device = ctx.device()?;
        let bci = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let buffer = unsafe { device.create_buffer(&bci, None)? };
        let req = unsafe { device.get_buffer_memory_requirements(buffer) };
        let memory = match allocate(ctx, req, props) {
            Ok(m) => m,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };
        if let Err(e) = unsafe { device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
            }
            return Err(e.into());
        }
        trace!(size, ?usage, ?props, "buffer created");
        Ok(GpuBuffer {
            ctx: Arc::clone(ctx),
            buffer,
            memory,
            size,
            mapped: std::ptr::null_mut(),
        })
    }

    /// Host-visible, host-coherent buffer that stays mapped for its whole life.
    pub fn new_mapped(
        ctx: &Arc<DeviceContext>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> VkResult<Self> {
        let mut buf = GpuBuffer::new(
            ctx,
            size,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        buf.map()?;
        Ok(buf)
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn is_mapped(&self) -> bool {
        !self.mapped.is_null()
    }

    pub fn map(&mut self) -> VkResult<()> {
        if self.is_mapped() {
            return Ok(());
        }
        let device = self.ctx.device()?;
        let ptr = unsafe {
            device.map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())?
        };
        self.mapped = ptr.cast();
        Ok(())
    }

    /// Copy `bytes` in at `offset`. Maps for the duration of the call if not mapped.
    pub fn write(&mut self, offset: vk::DeviceSize, bytes: &[u8]) -> VkResult<()> {
        check_range(offset, bytes.len() as vk::DeviceSize, self.size)?;
        let transient = !self.is_mapped();
        if transient {
            self.map()?;
        }
        // SAFETY: range checked above and the mapping spans the whole allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.mapped.add(offset as usize),
                bytes.len(),
            );
        }
        if transient {
            self.unmap();
        }
        Ok(())
    }

    fn unmap(&mut self) {
        if self.is_mapped() {
            if let Ok(device) = self.ctx.device() {
                unsafe { device.unmap_memory(self.memory) };
            }
            self.mapped = std::ptr::null_mut();
        }
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        self.unmap();
        if let Ok(device) = self.ctx.device() {
            unsafe {
                device.destroy_buffer(self.buffer, None);
                device.free_memory(self.memory, None);
            }
        }
    }
}

/// Host data -> staging buffer -> `dst`, through one immediate submission.
pub fn upload_via_staging(
    ctx: &Arc<DeviceContext>,
    recorder: &CommandRecorder,
    dst: &GpuBuffer,
    data: &[u8],
) -> VkResult<()> {
    let size = data.len() as vk::DeviceSize;
    check_range(0, size, dst.size())?;
    let staging = staging_buffer(ctx, data)?;
    let device = ctx.device()?;
    recorder.run_immediate(|cmd| {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        unsafe {
            device.cmd_copy_buffer(cmd, staging.handle(), dst.handle(), std::slice::from_ref(&region))
        };
    })?;
    debug!(bytes = size, "staging upload complete");
    Ok(())
}

/// Transfer-source buffer filled with `data`.
pub(crate) fn staging_buffer(ctx: &Arc<DeviceContext>, data: &[u8]) -> VkResult<GpuBuffer> {
    let mut staging = GpuBuffer::new(
        ctx,
        data.len() as vk::DeviceSize,
        vk::BufferUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;
    staging.write(0, data)?;
    Ok(staging)
}

/// A 2D image with its own allocation.
pub struct GpuImage {
    ctx: Arc<DeviceContext>,
    image: vk::Image,
    memory: vk::DeviceMemory,
    extent: vk::Extent2D,
    format: vk::Format,
}

impl GpuImage {
    pub fn new(
        ctx: &Arc<DeviceContext>,
        extent: vk::Extent2D,
        format: vk::Format,
        tiling: vk::ImageTiling,
        usage: vk::ImageUsageFlags,
        props: vk::MemoryPropertyFlags,
    ) -> VkResult<Self> {
        let device = ctx.device()?;
        let ici = vk::ImageCreateInfo {
            s_type: vk::StructureType::IMAGE_CREATE_INFO,
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        let image = unsafe { device.create_image(&ici, None)? };
        let req = unsafe { device.get_image_memory_requirements(image) };
        let memory = match allocate(ctx, req, props) {
            Ok(m) => m,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e);
            }
        };
        if let Err(e) = unsafe { device.bind_image_memory(image, memory, 0) } {
            unsafe {
                device.destroy_image(image, None);
                device.free_memory(memory, None);
            }
            return Err(e.into());
        }
        trace!(?extent, ?format, "image created");
        Ok(GpuImage {
            ctx: Arc::clone(ctx),
            image,
            memory,
            extent,
            format,
        })
    }

    pub fn handle(&self) -> vk::Image {
        self.image
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        if let Ok(device) = self.ctx.device() {
            unsafe {
                device.destroy_image(self.image, None);
                device.free_memory(self.memory, None);
            }
        }
    }
}

pub struct ImageView {
    ctx: Arc<DeviceContext>,
    view: vk::ImageView,
}

impl ImageView {
    pub fn handle(&self) -> vk::ImageView {
        self.view
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        if let Ok(device) = self.ctx.device() {
            unsafe { device.destroy_image_view(self.view, None) };
        }
    }
}

pub fn create_image_view(
    ctx: &Arc<DeviceContext>,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
) -> VkResult<ImageView> {
    let device = ctx.device()?;
    let ivci = vk::ImageViewCreateInfo {
        s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
        image,
        view_type: vk::ImageViewType::TYPE_2D,
        format,
        components: vk::ComponentMapping::default(),
        subresource_range: vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        },
        ..Default::default()
    };
    let view = unsafe { device.create_image_view(&ivci, None)? };
    Ok(ImageView {
        ctx: Arc::clone(ctx),
        view,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_props(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = flags.len() as u32;
        for (i, f) in flags.iter().enumerate() {
            props.memory_types[i].property_flags = *f;
        }
        props
    }

    #[test]
    fn memory_type_must_be_allowed_and_superset() {
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let props = memory_props(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            host,
            host | vk::MemoryPropertyFlags::HOST_CACHED,
        ]);
        assert_eq!(find_memory_type(&props, 0b111, host).unwrap(), 1);
        // type 1 masked out, so the cached superset is next.
        assert_eq!(find_memory_type(&props, 0b101, host).unwrap(), 2);
        assert_eq!(
            find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            0
        );
    }

    #[test]
    fn missing_memory_type_is_an_error() {
        let props = memory_props(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        let err = find_memory_type(&props, 0b1, vk::MemoryPropertyFlags::HOST_VISIBLE);
        assert!(matches!(err, Err(VkError::NoSuitableMemoryType { type_bits: 1, .. })));
    }

    #[test]
    fn dynamic_stride_rounds_up_to_alignment() {
        assert_eq!(dynamic_stride(64, 256), 256);
        assert_eq!(dynamic_stride(64, 16), 64);
        assert_eq!(dynamic_stride(64, 0), 64);
        for shift in 0..12 {
            let align = 1u64 << shift;
            let stride = dynamic_stride(64, align);
            assert!(stride >= 64);
            assert_eq!(stride % align, 0);
        }
    }

    #[test]
    fn supported_format_respects_tiling() {
        let probe = |f: vk::Format| -> VkResult<vk::FormatProperties> {
            Ok(match f {
                vk::Format::D32_SFLOAT => vk::FormatProperties {
                    linear_tiling_features: vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
                    ..Default::default()
                },
                vk::Format::D24_UNORM_S8_UINT => vk::FormatProperties {
                    optimal_tiling_features: vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
                    ..Default::default()
                },
                _ => vk::FormatProperties::default(),
            })
        };
        let feature = vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
        assert_eq!(
            find_supported_format(&DEPTH_CANDIDATES, vk::ImageTiling::OPTIMAL, feature, probe)
                .unwrap(),
            vk::Format::D24_UNORM_S8_UINT
        );
        assert_eq!(
            find_supported_format(&DEPTH_CANDIDATES, vk::ImageTiling::LINEAR, feature, probe)
                .unwrap(),
            vk::Format::D32_SFLOAT
        );
    }

    #[test]
    fn no_supported_format_is_an_error() {
        let res = find_supported_format(
            &DEPTH_CANDIDATES,
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            |_| Ok(vk::FormatProperties::default()),
        );
        assert!(matches!(res, Err(VkError::UnsupportedFormat)));
    }

    #[test]
    fn depth_format_needs_an_adapter() {
        let Ok(ctx) = DeviceContext::new(false) else {
            return;
        };
        assert!(matches!(
            find_depth_format(&ctx),
            Err(VkError::NotInitialized(_))
        ));
    }

    #[test]
    fn stencil_formats() {
        assert!(!has_stencil_component(vk::Format::D32_SFLOAT));
        assert!(has_stencil_component(vk::Format::D32_SFLOAT_S8_UINT));
        assert!(has_stencil_component(vk::Format::D24_UNORM_S8_UINT));
    }

    #[test]
    fn range_check_catches_overflow() {
        assert!(check_range(0, 64, 64).is_ok());
        assert!(check_range(64, 0, 64).is_ok());
        assert!(matches!(
            check_range(60, 8, 64),
            Err(VkError::OutOfBounds { offset: 60, len: 8, size: 64 })
        ));
        assert!(check_range(u64::MAX, 2, 64).is_err());
    }
}
