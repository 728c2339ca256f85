// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use kestrel_core::{init_tracing, EngineConfig};
use kestrel_math::{Transform, Vec3};
use kestrel_platform::drawable_size;
use kestrel_render::{RenderSize, Renderer};
use kestrel_render_vk::{Drawable, MeshData, MeshId, SolidRect, VkError, VkRenderer};
use tracing::{error, info, warn};

use kestrel_platform::winit::{
    application::ApplicationHandler,
    dpi::LogicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowId},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file; missing means defaults
    #[arg(long, default_value = "kestrel.toml")]
    config: PathBuf,
    /// Capacity of the per-instance uniform block (overrides the config)
    #[arg(long)]
    instances: Option<u32>,
    /// Side length of the demo cube grid
    #[arg(long, default_value_t = 5)]
    grid: u32,
}

const SPACING: f32 = 1.6;

/// Centred `n x n` grid on the XZ plane.
fn grid_positions(n: u32) -> Vec<Vec3> {
    let half = (n.saturating_sub(1)) as f32 * SPACING * 0.5;
    let mut out = Vec::with_capacity((n * n) as usize);
    for row in 0..n {
        for col in 0..n {
            out.push(Vec3::new(
                col as f32 * SPACING - half,
                0.0,
                row as f32 * SPACING - half,
            ));
        }
    }
    out
}

/// Floor plus a grid of cubes; returns the cube mesh.
fn populate(renderer: &mut VkRenderer, grid: u32) -> Result<MeshId> {
    let cube = renderer
        .add_mesh(&MeshData::cube())
        .context("upload cube mesh")?;
    let floor = renderer
        .add_mesh(&MeshData::quad())
        .context("upload floor mesh")?;

    let extent = grid.max(1) as f32 * SPACING;
    let mut ground = Transform::from_position(Vec3::new(0.0, -0.75, 0.0))
        .with_scale(Vec3::new(extent, extent, 1.0));
    ground.rotate_ypr(Vec3::new(0.0, -std::f32::consts::FRAC_PI_2, 0.0));
    renderer
        .add_drawable(Drawable::new(floor, ground))
        .context("add floor")?;

    let mut placed = 0;
    for pos in grid_positions(grid) {
        let transform = Transform::from_position(pos).with_scale(Vec3::splat(0.8));
        match renderer.add_drawable(Drawable::new(cube, transform)) {
            Ok(_) => placed += 1,
            Err(VkError::CapacityExceeded { capacity, .. }) => {
                warn!(capacity, placed, "instance capacity reached, grid truncated");
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    let reach = extent * 0.75 + 3.0;
    let camera = renderer.camera_mut();
    camera.eye = Vec3::new(-reach, reach * 0.6, -reach);
    camera.target = Vec3::ZERO;
    info!(cubes = placed, "scene populated");
    Ok(cube)
}

fn spin(renderer: &mut VkRenderer, cube: MeshId, dt: f32) {
    for (i, d) in renderer.drawables_mut().iter_mut().enumerate() {
        if d.mesh != cube {
            continue;
        }
        let speed = 0.4 + (i % 7) as f32 * 0.15;
        d.transform.rotate_ypr(Vec3::new(speed * dt, speed * 0.5 * dt, 0.0));
    }
}

/// Last drawable size seen; rendering pauses while it has a zero axis.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct SurfaceWatch {
    size: RenderSize,
    paused: bool,
}

impl SurfaceWatch {
    fn new(size: RenderSize) -> Self {
        SurfaceWatch {
            size,
            paused: size.is_zero(),
        }
    }

    /// Record a freshly polled size. `true` when it differs from the last one.
    fn observe(&mut self, size: RenderSize) -> bool {
        if size == self.size {
            return false;
        }
        self.size = size;
        self.paused = size.is_zero();
        true
    }
}

struct App {
    cfg: EngineConfig,
    grid: u32,
    window: Option<Window>,
    renderer: Option<VkRenderer>,
    cube: MeshId,
    surface: SurfaceWatch,
    fatal: Option<anyhow::Error>,

    exiting: bool,
    frames: u32,
    last_fps_instant: Instant,
    last_frame: Instant,
}

impl App {
    fn new(cfg: EngineConfig, grid: u32) -> Self {
        let now = Instant::now();
        App {
            cfg,
            grid,
            window: None,
            renderer: None,
            cube: MeshId(0),
            surface: SurfaceWatch::default(),
            fatal: None,
            exiting: false,
            frames: 0,
            last_fps_instant: now,
            last_frame: now,
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: anyhow::Error) {
        error!("{err:#}");
        self.fatal = Some(err);
        self.shutdown(event_loop);
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        self.exiting = true;
        // Renderer before window: the surface borrows the window's handles.
        self.renderer = None;
        self.window = None;
        event_loop.exit();
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let attrs = Window::default_attributes()
            .with_title(self.cfg.window.title.clone())
            .with_inner_size(LogicalSize::new(self.cfg.window.width, self.cfg.window.height));
        let window = event_loop.create_window(attrs).context("create window")?;

        let (width, height) = drawable_size(&window);
        self.surface = SurfaceWatch::new(RenderSize::new(width, height));

        let mut renderer = VkRenderer::new(&window, &window, self.surface.size, &self.cfg.render)
            .context("vulkan init")?;
        self.cube = populate(&mut renderer, self.grid)?;
        renderer.add_overlay(Box::new(SolidRect {
            x: 0,
            y: 0,
            width: 4096,
            height: 6,
            color: [0.9, 0.5, 0.1, 1.0],
        }));

        self.window = Some(window);
        self.renderer = Some(renderer);
        Ok(())
    }

    /// Forward a changed drawable size to the renderer and resume drawing when it is nonzero.
    fn apply_size(&mut self, event_loop: &ActiveEventLoop, size: RenderSize) {
        let was_paused = self.surface.paused;
        if !self.surface.observe(size) {
            return;
        }
        if was_paused != self.surface.paused {
            info!(
                width = size.width,
                height = size.height,
                paused = self.surface.paused,
                "resized"
            );
        }

        if let Some(renderer) = self.renderer.as_mut() {
            if let Err(e) = renderer.resize(size) {
                self.fail(event_loop, e);
                return;
            }
        }
        if !self.surface.paused {
            if let Some(w) = &self.window {
                w.request_redraw();
            }
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            if let Err(e) = self.init(event_loop) {
                self.fail(event_loop, e);
                return;
            }
        }

        event_loop.set_control_flow(ControlFlow::Wait);
        info!(paused = self.surface.paused, "resumed");

        if !self.surface.paused {
            if let Some(w) = &self.window {
                w.request_redraw();
            }
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("close requested");
                self.shutdown(event_loop);
            }

            WindowEvent::Resized(new_size) => {
                self.apply_size(event_loop, RenderSize::new(new_size.width, new_size.height));
            }

            WindowEvent::RedrawRequested => {
                if self.exiting || self.surface.paused {
                    return;
                }
                let now = Instant::now();
                let dt = now.duration_since(self.last_frame).as_secs_f32();
                self.last_frame = now;

                let Some(renderer) = self.renderer.as_mut() else {
                    return;
                };
                spin(renderer, self.cube, dt);
                match renderer.render_frame() {
                    // count only frames that were actually rendered
                    Ok(Some(_)) => self.frames = self.frames.saturating_add(1),
                    Ok(None) => {}
                    Err(e) => self.fail(event_loop, anyhow!(e).context("render frame")),
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }
        if self.surface.paused {
            // Some platforms restore a minimized window without a Resized event.
            event_loop.set_control_flow(ControlFlow::Wait);
            self.frames = 0;
            let polled = self.window.as_ref().map(|w| drawable_size(w));
            if let Some((width, height)) = polled {
                self.apply_size(event_loop, RenderSize::new(width, height));
            }
            return;
        }

        // Present blocks on the swapchain, so this paces itself.
        event_loop.set_control_flow(ControlFlow::Wait);
        if let Some(w) = &self.window {
            w.request_redraw();
        }

        let now = Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            info!("fps ~ {}", self.frames);
            self.frames = 0;
            self.last_fps_instant = now;
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut cfg = EngineConfig::load_or_default(&args.config);
    if let Some(n) = args.instances {
        cfg.render.max_instances = n;
    }
    info!(config = %args.config.display(), grid = args.grid, ?cfg, "starting");

    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App::new(cfg, args.grid);
    event_loop.run_app(&mut app)?;

    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_is_centred() {
        let pts = grid_positions(3);
        assert_eq!(pts.len(), 9);
        let sum = pts.iter().fold(Vec3::ZERO, |a, &p| a + p);
        assert!(sum.length() < 1e-4);
        assert_eq!(pts[0], Vec3::new(-SPACING, 0.0, -SPACING));
    }

    #[test]
    fn single_cube_sits_at_origin() {
        assert_eq!(grid_positions(1), vec![Vec3::ZERO]);
        assert!(grid_positions(0).is_empty());
    }

    #[test]
    fn surface_watch_pauses_at_zero_and_resumes_on_growth() {
        let mut watch = SurfaceWatch::new(RenderSize::new(1280, 720));
        assert!(!watch.paused);
        assert!(!watch.observe(RenderSize::new(1280, 720)));

        assert!(watch.observe(RenderSize::new(0, 720)));
        assert!(watch.paused);
        // Polling the same zero size again is not a change.
        assert!(!watch.observe(RenderSize::new(0, 720)));
        assert!(watch.paused);

        assert!(watch.observe(RenderSize::new(800, 600)));
        assert!(!watch.paused);
        assert_eq!(watch.size, RenderSize::new(800, 600));
    }

    #[test]
    fn cli_overrides_parse() {
        let args = Args::parse_from(["kestrel", "--instances", "64", "--grid", "3"]);
        assert_eq!(args.instances, Some(64));
        assert_eq!(args.grid, 3);
        assert_eq!(args.config, PathBuf::from("kestrel.toml"));
    }
}
