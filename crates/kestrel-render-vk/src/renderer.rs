// SPDX-License-Identifier: CEPL-1.0
//! `VkRenderer`: wires the device context, presentation surface, frame
//! synchronizer, command recorder and uniforms into the generic `DrawLoop`.
use std::sync::Arc;

use anyhow::{Context, Result};
use ash::vk;
use kestrel_core::{PresentPreference, RenderCfg};
use kestrel_math::Camera;
use kestrel_render::{
    Acquired, DrawLoop, FrameBackend, FrameStatus, Presented, RenderSize, Renderer,
    MAX_FRAMES_IN_FLIGHT,
};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{debug, info, warn};

use crate::command::{CommandRecorder, FrameTarget};
use crate::context::DeviceContext;
use crate::error::{VkError, VkResult};
use crate::mesh::{Drawable, Mesh, MeshData, MeshId};
use crate::overlay::{record_overlays, Overlay, OverlayFrame};
use crate::pipeline::GraphicsPipeline;
use crate::surface::Surface;
use crate::swapchain::{Rebuild, Swapchain, SwapchainState};
use crate::sync::{fence_timeout, FrameSynchronizer};
use crate::texture::{Sampler, Texture};
use crate::uniforms::FrameUniforms;

const APP_NAME: &str = "kestrel";

/// Everything one displayed frame touches. Fields drop top to bottom, after a device idle.
struct FrameContext {
    overlays: Vec<Box<dyn Overlay>>,
    pipeline: Option<GraphicsPipeline>,
    uniforms: FrameUniforms,
    sampler: Sampler,
    texture: Texture,
    meshes: Vec<Mesh>,
    recorder: CommandRecorder,
    sync: FrameSynchronizer,
    swapchain: Swapchain,
    surface: Surface,
    ctx: Arc<DeviceContext>,
    drawables: Vec<Drawable>,
    camera: Camera,
    size: RenderSize,
    clear_color: [f32; 4],
}

impl FrameContext {
    /// (Re)build the pipeline when missing or when the swapchain format moved.
    fn ensure_pipeline(&mut self, force: bool) -> VkResult<()> {
        if !self.swapchain.is_ready() {
            return Ok(());
        }
        let format = self.swapchain.format();
        let stale = self
            .pipeline
            .as_ref()
            .is_none_or(|p| p.color_format() != format);
        if force || stale {
            self.pipeline = None;
            let render_pass = self.swapchain.render_pass()?.handle();
            self.pipeline = Some(GraphicsPipeline::new(
                &self.ctx,
                render_pass,
                format,
                self.uniforms.layout(),
            )?);
        }
        Ok(())
    }
}

impl FrameBackend for FrameContext {
    type Error = VkError;

    fn acquire(&mut self, slot: usize) -> VkResult<Acquired> {
        let acquired = self.sync.acquire_next(slot, &self.swapchain)?;
        if let Acquired::Image { .. } = acquired {
            self.recorder.reset(slot)?;
        }
        Ok(acquired)
    }

    fn update(&mut self, slot: usize) -> VkResult<()> {
        let extent = self.swapchain.extent();
        let vp = self.camera.matrices(extent.width, extent.height);
        self.uniforms.write_globals(slot, &vp)?;
        for (i, drawable) in self.drawables.iter().enumerate() {
            self.uniforms
                .write_instance(slot, i as u32, &drawable.transform.matrix())?;
        }
        Ok(())
    }

    fn record(&mut self, slot: usize, image_index: u32) -> VkResult<()> {
        let framebuffer = self
            .swapchain
            .framebuffer(image_index)
            .ok_or(VkError::NotInitialized("framebuffer"))?;
        let render_pass = self.swapchain.render_pass()?.handle();
        let extent = self.swapchain.extent();
        let target = FrameTarget {
            render_pass,
            framebuffer,
            extent,
            clear_color: self.clear_color,
        };
        let cmd = self.recorder.begin_frame(slot, &target)?;

        if let Some(pipeline) = &self.pipeline {
            let set = self.uniforms.set(slot);
            let layout = self.uniforms.instance_layout();
            for (i, drawable) in self.drawables.iter().enumerate() {
                let mesh = drawable.mesh.lookup(&self.meshes)?;
                let offset = layout.dynamic_offset(i as u32)?;
                self.recorder.record_draw(slot, pipeline, mesh, set, offset)?;
            }
        }

        if !self.overlays.is_empty() {
            let frame = OverlayFrame {
                ctx: &self.ctx,
                command_buffer: cmd,
                render_pass,
                image_count: self.swapchain.image_count(),
                extent,
                slot,
            };
            record_overlays(&mut self.overlays, &frame)?;
        }

        self.recorder.end_frame(slot)
    }

    fn submit(&mut self, slot: usize) -> VkResult<()> {
        self.recorder.submit(slot, self.sync.slot(slot))
    }

    fn present(&mut self, slot: usize, image_index: u32) -> VkResult<Presented> {
        let queue = self.ctx.present_queue()?;
        let wait = self.sync.slot(slot).render_finished.handle();
        self.swapchain.present(queue, image_index, wait)
    }

    fn recreate(&mut self) -> VkResult<()> {
        match self.swapchain.recreate(&self.surface, self.size)? {
            Rebuild::Deferred => Ok(()),
            Rebuild::Done { format_changed } => self.ensure_pipeline(format_changed),
        }
    }

    fn is_ready(&self) -> bool {
        self.swapchain.is_ready()
    }

    fn drawable_is_zero(&self) -> bool {
        self.size.is_zero()
    }
}

impl Drop for FrameContext {
    fn drop(&mut self) {
        // STRICT TEARDOWN ORDER: nothing below may be destroyed while the GPU reads it.
        if let Err(e) = self.ctx.wait_idle() {
            warn!(error = %e, "device wait idle failed during teardown");
        }
    }
}

pub struct VkRenderer {
    frame: FrameContext,
    draw_loop: DrawLoop,
}

impl VkRenderer {
    /// Build on an already-shared context. The context is initialized here if it was not.
    pub fn with_context(
        ctx: Arc<DeviceContext>,
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        cfg: &RenderCfg,
    ) -> Result<Self> {
        let display_raw = display.display_handle()?.as_raw();
        ctx.initialize(APP_NAME, Some(display_raw))
            .context("create vulkan instance")?;
        let surface = Surface::new(&ctx, window, display).context("create surface")?;
        ctx.create_logical_device(&surface)
            .context("create logical device")?;

        let swapchain = Swapchain::new(&ctx, &surface, size, cfg.present_mode)
            .context("create swapchain")?;
        let sync = FrameSynchronizer::new(
            &ctx,
            MAX_FRAMES_IN_FLIGHT,
            fence_timeout(cfg.fence_timeout_ms),
        )
        .context("create frame synchronizer")?;
        let recorder =
            CommandRecorder::new(&ctx, MAX_FRAMES_IN_FLIGHT).context("create command pool")?;
        let texture = Texture::white(&ctx, &recorder).context("upload default texture")?;
        let sampler = Sampler::linear(&ctx).context("create sampler")?;
        let uniforms = FrameUniforms::new(
            &ctx,
            MAX_FRAMES_IN_FLIGHT,
            cfg.max_instances,
            &texture,
            &sampler,
        )
        .context("create frame uniforms")?;

        let mut frame = FrameContext {
            overlays: Vec::new(),
            pipeline: None,
            uniforms,
            sampler,
            texture,
            meshes: Vec::new(),
            recorder,
            sync,
            swapchain,
            surface,
            ctx,
            drawables: Vec::new(),
            camera: Camera::default(),
            size,
            clear_color: cfg.clear_color,
        };
        frame.ensure_pipeline(false).context("create pipeline")?;

        info!(
            width = size.width,
            height = size.height,
            capacity = frame.uniforms.capacity(),
            "vulkan renderer ready"
        );
        Ok(VkRenderer {
            frame,
            draw_loop: DrawLoop::new(MAX_FRAMES_IN_FLIGHT),
        })
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.frame.ctx
    }

    pub fn add_mesh(&mut self, data: &MeshData) -> VkResult<MeshId> {
        let mesh = Mesh::upload(&self.frame.ctx, &self.frame.recorder, data)?;
        self.frame.meshes.push(mesh);
        Ok(MeshId(self.frame.meshes.len() - 1))
    }

    /// Fails for a mesh that was never added, or once every per-instance slot is taken.
    pub fn add_drawable(&mut self, drawable: Drawable) -> VkResult<usize> {
        drawable.mesh.lookup(&self.frame.meshes)?;
        let index = self.frame.drawables.len();
        self.frame
            .uniforms
            .instance_layout()
            .offset(index as u32)?;
        self.frame.drawables.push(drawable);
        Ok(index)
    }

    pub fn drawables(&self) -> &[Drawable] {
        &self.frame.drawables
    }

    pub fn drawables_mut(&mut self) -> &mut [Drawable] {
        &mut self.frame.drawables
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.frame.camera
    }

    pub fn add_overlay(&mut self, overlay: Box<dyn Overlay>) {
        self.frame.overlays.push(overlay);
    }

    /// Replace the texture every mesh samples. Waits for the device.
    pub fn set_texture(&mut self, width: u32, height: u32, pixels: &[u8]) -> VkResult<()> {
        let texture = Texture::from_rgba8(
            &self.frame.ctx,
            &self.frame.recorder,
            width,
            height,
            pixels,
        )?;
        self.frame.ctx.wait_idle()?;
        self.frame
            .uniforms
            .rebind_texture(&texture, &self.frame.sampler)?;
        self.frame.texture = texture;
        Ok(())
    }

    pub fn swapchain_state(&self) -> SwapchainState {
        self.frame.swapchain.state()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.frame.swapchain.extent()
    }

    pub fn frames(&self) -> u64 {
        self.draw_loop.ring().frames()
    }

    /// One pass of the draw loop. `None` when the surface is zero-sized and nothing ran.
    pub fn render_frame(&mut self) -> VkResult<Option<FrameStatus>> {
        let Some(status) = self.draw_loop.tick(&mut self.frame)? else {
            return Ok(None);
        };
        if status != FrameStatus::Presented {
            debug!(?status, frames = self.frames(), "frame finished with recreation");
        }
        Ok(Some(status))
    }
}

impl Renderer for VkRenderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        cfg: &RenderCfg,
    ) -> Result<Self> {
        let validation = cfg.validation.enabled();
        let ctx = Arc::new(DeviceContext::new(validation).context("load vulkan")?);
        Self::with_context(ctx, window, display, size, cfg)
    }

    fn resize(&mut self, size: RenderSize) -> Result<()> {
        if size == self.frame.size {
            return Ok(());
        }
        self.frame.size = size;
        if size.is_zero() {
            self.frame.swapchain.invalidate();
        } else if self.frame.swapchain.is_ready() {
            self.draw_loop.request_resize();
        }
        Ok(())
    }

    fn render(&mut self) -> Result<()> {
        self.render_frame().context("render frame")?;
        Ok(())
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.frame.clear_color = rgba;
    }

    fn set_present_preference(&mut self, pref: PresentPreference) {
        self.frame.swapchain.set_preference(pref);
    }
}
