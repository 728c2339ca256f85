// SPDX-License-Identifier: CEPL-1.0
//! Swapchain, its image views, the render pass and one framebuffer per image.
//!
//! `Uninitialized -> Ready -> (Invalidated -> Ready)* -> Destroyed`
//!
//! Images, views and framebuffers are always rebuilt together; their counts
//! match after every successful build.
use std::sync::Arc;

use ash::khr::swapchain;
use ash::vk;
use kestrel_core::PresentPreference;
use kestrel_render::{Acquired, Presented, RenderSize};
use tracing::{debug, info};

use crate::context::{DeviceContext, QueueFamilies};
use crate::error::{VkError, VkResult};
use crate::memory::{create_image_view, ImageView};
use crate::surface::Surface;

// --- Selection policies (pure) ------------------------------------------------

pub const PREFERRED_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_SRGB,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// BGRA8 sRGB when offered, anywhere in the list; else the first entry.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| f.format == PREFERRED_FORMAT.format && f.color_space == PREFERRED_FORMAT.color_space)
        .or_else(|| formats.first().copied())
}

/// MAILBOX when preferred and offered; FIFO otherwise (always supported).
pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    pref: PresentPreference,
) -> vk::PresentModeKHR {
    match pref {
        PresentPreference::Mailbox if modes.contains(&vk::PresentModeKHR::MAILBOX) => {
            vk::PresentModeKHR::MAILBOX
        }
        _ => vk::PresentModeKHR::FIFO,
    }
}

/// The surface's current extent when it reports one, else the drawable clamped to bounds.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, drawable: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: drawable
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: drawable
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// One above the minimum, capped by the maximum (0 means no maximum).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        wanted.min(caps.max_image_count)
    } else {
        wanted
    }
}

/// CONCURRENT across two distinct families, EXCLUSIVE when they coincide.
pub fn sharing_mode(families: QueueFamilies) -> (vk::SharingMode, Vec<u32>) {
    if families.is_shared() {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    } else {
        (vk::SharingMode::CONCURRENT, families.unique())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapchainState {
    Uninitialized,
    Ready,
    /// Needs a rebuild; stays here while the drawable is zero-sized.
    Invalidated,
    Destroyed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rebuild {
    /// Drawable is zero-sized; nothing was created.
    Deferred,
    Done { format_changed: bool },
}

// --- RAII handles -------------------------------------------------------------

pub struct RenderPass {
    ctx: Arc<DeviceContext>,
    handle: vk::RenderPass,
    format: vk::Format,
}

impl RenderPass {
    /// Single subpass, one color attachment cleared on load and handed to present.
    pub fn new(ctx: &Arc<DeviceContext>, format: vk::Format) -> VkResult<Self> {
        let device = ctx.device()?;
        let color = vk::AttachmentDescription {
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            ..Default::default()
        };
        let color_ref = vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        };
        let subpass = vk::SubpassDescription {
            pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
            color_attachment_count: 1,
            p_color_attachments: &color_ref,
            ..Default::default()
        };
        // Layout transition waits for the acquire semaphore's stage.
        let dependency = vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            src_access_mask: vk::AccessFlags::empty(),
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            ..Default::default()
        };
        let ci = vk::RenderPassCreateInfo {
            s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
            attachment_count: 1,
            p_attachments: &color,
            subpass_count: 1,
            p_subpasses: &subpass,
            dependency_count: 1,
            p_dependencies: &dependency,
            ..Default::default()
        };
        let handle = unsafe { device.create_render_pass(&ci, None)? };
        Ok(RenderPass {
            ctx: Arc::clone(ctx),
            handle,
            format,
        })
    }

    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        if let Ok(device) = self.ctx.device() {
            unsafe { device.destroy_render_pass(self.handle, None) };
        }
    }
}

pub struct Framebuffer {
    ctx: Arc<DeviceContext>,
    handle: vk::Framebuffer,
}

impl Framebuffer {
    pub fn new(
        ctx: &Arc<DeviceContext>,
        render_pass: &RenderPass,
        view: &ImageView,
        extent: vk::Extent2D,
    ) -> VkResult<Self> {
        let device = ctx.device()?;
        let attachments = [view.handle()];
        let ci = vk::FramebufferCreateInfo {
            s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
            render_pass: render_pass.handle(),
            attachment_count: attachments.len() as u32,
            p_attachments: attachments.as_ptr(),
            width: extent.width,
            height: extent.height,
            layers: 1,
            ..Default::default()
        };
        let handle = unsafe { device.create_framebuffer(&ci, None)? };
        Ok(Framebuffer {
            ctx: Arc::clone(ctx),
            handle,
        })
    }

    pub fn handle(&self) -> vk::Framebuffer {
        self.handle
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        if let Ok(device) = self.ctx.device() {
            unsafe { device.destroy_framebuffer(self.handle, None) };
        }
    }
}

// --- Swapchain ----------------------------------------------------------------

pub struct Swapchain {
    ctx: Arc<DeviceContext>,
    loader: swapchain::Device,
    handle: vk::SwapchainKHR,
    // Dropped in this order: framebuffers, views, then the render pass.
    framebuffers: Vec<Framebuffer>,
    views: Vec<ImageView>,
    images: Vec<vk::Image>,
    render_pass: Option<RenderPass>,
    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    preference: PresentPreference,
    state: SwapchainState,
}

impl Swapchain {
    /// Build against `surface` at `drawable`. A zero-sized drawable leaves it `Invalidated`.
    pub fn new(
        ctx: &Arc<DeviceContext>,
        surface: &Surface,
        drawable: RenderSize,
        preference: PresentPreference,
    ) -> VkResult<Self> {
        let loader = swapchain::Device::new(ctx.instance()?, ctx.device()?);
        let mut sc = Swapchain {
            ctx: Arc::clone(ctx),
            loader,
            handle: vk::SwapchainKHR::null(),
            framebuffers: Vec::new(),
            views: Vec::new(),
            images: Vec::new(),
            render_pass: None,
            format: PREFERRED_FORMAT,
            present_mode: vk::PresentModeKHR::FIFO,
            extent: vk::Extent2D::default(),
            preference,
            state: SwapchainState::Uninitialized,
        };
        if drawable.is_zero() {
            sc.state = SwapchainState::Invalidated;
            debug!("initial drawable is zero-sized, swapchain deferred");
        } else {
            sc.build(surface, drawable)?;
        }
        Ok(sc)
    }

    pub fn state(&self) -> SwapchainState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SwapchainState::Ready
    }

    pub fn invalidate(&mut self) {
        if self.state == SwapchainState::Ready {
            self.state = SwapchainState::Invalidated;
        }
    }

    pub fn set_preference(&mut self, preference: PresentPreference) {
        if self.preference != preference {
            self.preference = preference;
            self.invalidate();
        }
    }

    /// Wait for the device, drop everything derived from the old swapchain, rebuild.
    pub fn recreate(&mut self, surface: &Surface, drawable: RenderSize) -> VkResult<Rebuild> {
        self.state = SwapchainState::Invalidated;
        if drawable.is_zero() {
            debug!("drawable is zero-sized, deferring swapchain rebuild");
            return Ok(Rebuild::Deferred);
        }
        self.ctx.wait_idle()?;

        // STRICT ORDER: framebuffers, then views, then the swapchain they came from.
        self.framebuffers.clear();
        self.views.clear();
        let old_format = self.render_pass.as_ref().map(|rp| rp.format());

        self.build(surface, drawable)?;
        if self.state != SwapchainState::Ready {
            return Ok(Rebuild::Deferred);
        }
        let format_changed = old_format.is_some_and(|f| f != self.format.format);
        info!(
            width = self.extent.width,
            height = self.extent.height,
            format_changed,
            "swapchain recreated"
        );
        Ok(Rebuild::Done { format_changed })
    }

    fn build(&mut self, surface: &Surface, drawable: RenderSize) -> VkResult<()> {
        let adapter = self.ctx.adapter()?;
        let support = surface.support(adapter.physical)?;
        let caps = support.capabilities;

        let format = choose_surface_format(&support.formats).ok_or(VkError::UnsupportedFormat)?;
        let present_mode = choose_present_mode(&support.present_modes, self.preference);
        let extent = choose_extent(&caps, drawable);
        if extent.width == 0 || extent.height == 0 {
            // Surface reports a zero current extent (minimized on some platforms).
            self.state = SwapchainState::Invalidated;
            return Ok(());
        }
        let image_count = choose_image_count(&caps);
        let (image_sharing_mode, family_indices) = sharing_mode(adapter.families);

        let pre_transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };

        let old = self.handle;
        let ci = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface: surface.handle(),
            min_image_count: image_count,
            image_format: format.format,
            image_color_space: format.color_space,
            image_extent: extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode,
            queue_family_index_count: family_indices.len() as u32,
            p_queue_family_indices: family_indices.as_ptr(),
            pre_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode,
            clipped: vk::TRUE,
            old_swapchain: old,
            ..Default::default()
        };
        let handle = unsafe { self.loader.create_swapchain(&ci, None)? };
        if old != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(old, None) };
        }
        self.handle = handle;
        self.images = unsafe { self.loader.get_swapchain_images(handle)? };
        self.format = format;
        self.present_mode = present_mode;
        self.extent = extent;

        let keep_pass = self
            .render_pass
            .as_ref()
            .is_some_and(|rp| rp.format() == format.format);
        if !keep_pass {
            self.render_pass = None;
            self.render_pass = Some(RenderPass::new(&self.ctx, format.format)?);
        }
        let render_pass = self
            .render_pass
            .as_ref()
            .ok_or(VkError::NotInitialized("render pass"))?;

        let mut views = Vec::with_capacity(self.images.len());
        for &image in &self.images {
            views.push(create_image_view(
                &self.ctx,
                image,
                format.format,
                vk::ImageAspectFlags::COLOR,
            )?);
        }
        let mut framebuffers = Vec::with_capacity(views.len());
        for view in &views {
            framebuffers.push(Framebuffer::new(&self.ctx, render_pass, view, extent)?);
        }
        self.views = views;
        self.framebuffers = framebuffers;
        self.state = SwapchainState::Ready;

        info!(
            format = ?format.format,
            color_space = ?format.color_space,
            ?present_mode,
            width = extent.width,
            height = extent.height,
            images = self.images.len(),
            requested = image_count,
            "swapchain ready"
        );
        Ok(())
    }

    pub fn acquire_next_image(&self, signal: vk::Semaphore) -> VkResult<Acquired> {
        let res = unsafe {
            self.loader
                .acquire_next_image(self.handle, u64::MAX, signal, vk::Fence::null())
        };
        match res {
            Ok((index, suboptimal)) => Ok(Acquired::Image { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquired::OutOfDate),
            Err(vk::Result::ERROR_DEVICE_LOST) => Err(VkError::DeviceLost),
            Err(e) => Err(VkError::Acquire(e)),
        }
    }

    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> VkResult<Presented> {
        let waits = [wait];
        let swapchains = [self.handle];
        let indices = [image_index];
        let pi = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: waits.len() as u32,
            p_wait_semaphores: waits.as_ptr(),
            swapchain_count: 1,
            p_swapchains: swapchains.as_ptr(),
            p_image_indices: indices.as_ptr(),
            ..Default::default()
        };
        match unsafe { self.loader.queue_present(queue, &pi) } {
            Ok(false) => Ok(Presented::Optimal),
            Ok(true) => Ok(Presented::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Presented::OutOfDate),
            Err(vk::Result::ERROR_DEVICE_LOST) => Err(VkError::DeviceLost),
            Err(e) => Err(VkError::Present(e)),
        }
    }

    pub fn render_pass(&self) -> VkResult<&RenderPass> {
        self.render_pass
            .as_ref()
            .ok_or(VkError::NotInitialized("render pass"))
    }

    pub fn framebuffer(&self, image_index: u32) -> Option<vk::Framebuffer> {
        self.framebuffers
            .get(image_index as usize)
            .map(Framebuffer::handle)
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// `(images, views, framebuffers)`
    pub fn counts(&self) -> (usize, usize, usize) {
        (self.images.len(), self.views.len(), self.framebuffers.len())
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        let _ = self.ctx.wait_idle();
        self.framebuffers.clear();
        self.views.clear();
        if self.handle != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(self.handle, None) };
        }
        self.render_pass = None;
        self.state = SwapchainState::Destroyed;
        debug!("swapchain destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    #[test]
    fn preferred_format_wins_regardless_of_position() {
        let list = [
            fmt(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            fmt(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            PREFERRED_FORMAT,
        ];
        let picked = choose_surface_format(&list).map(|f| (f.format, f.color_space));
        assert_eq!(
            picked,
            Some((PREFERRED_FORMAT.format, PREFERRED_FORMAT.color_space))
        );
    }

    #[test]
    fn format_falls_back_to_first_entry() {
        let first = fmt(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR);
        // Right format, wrong color space: not a match.
        let near = fmt(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT);
        let picked = choose_surface_format(&[first, near]).map(|f| (f.format, f.color_space));
        assert_eq!(picked, Some((first.format, first.color_space)));
        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn mailbox_chosen_even_when_listed_last() {
        let modes = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
        ];
        assert_eq!(
            choose_present_mode(&modes, PresentPreference::Mailbox),
            vk::PresentModeKHR::MAILBOX
        );
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let modes = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&modes, PresentPreference::Mailbox),
            vk::PresentModeKHR::FIFO
        );
        let with_mailbox = [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&with_mailbox, PresentPreference::Fifo),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn image_count_is_min_plus_one_clamped() {
        assert_eq!(choose_image_count(&caps(2, 3)), 3);
        assert_eq!(choose_image_count(&caps(3, 3)), 3);
        assert_eq!(choose_image_count(&caps(2, 0)), 3);
        assert_eq!(choose_image_count(&caps(1, 8)), 2);
    }

    #[test]
    fn extent_uses_current_when_defined() {
        let mut c = caps(2, 3);
        c.current_extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let e = choose_extent(&c, RenderSize::new(256, 256));
        assert_eq!((e.width, e.height), (800, 600));
    }

    #[test]
    fn extent_clamps_drawable_when_free() {
        let c = caps(2, 3);
        let e = choose_extent(&c, RenderSize::new(256, 256));
        assert_eq!((e.width, e.height), (256, 256));
        let e = choose_extent(&c, RenderSize::new(10_000, 0));
        assert_eq!((e.width, e.height), (4096, 1));
    }

    #[test]
    fn sharing_follows_family_split() {
        let same = QueueFamilies {
            graphics: 0,
            present: 0,
        };
        assert_eq!(sharing_mode(same), (vk::SharingMode::EXCLUSIVE, vec![]));
        let split = QueueFamilies {
            graphics: 0,
            present: 2,
        };
        assert_eq!(sharing_mode(split), (vk::SharingMode::CONCURRENT, vec![0, 2]));
    }
}
