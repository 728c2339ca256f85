// SPDX-License-Identifier: CEPL-1.0
//! Drives the real `DrawLoop` against a GPU-free backend whose swapchain is
//! sized by the same policies the Vulkan swapchain uses.
use std::collections::HashMap;

use kestrel_render::{
    Acquired, DrawLoop, FrameBackend, FrameStatus, Presented, RenderSize, MAX_FRAMES_IN_FLIGHT,
};
use kestrel_render_vk::{choose_extent, choose_image_count, vk};

fn surface_caps() -> vk::SurfaceCapabilitiesKHR {
    vk::SurfaceCapabilitiesKHR {
        min_image_count: 2,
        max_image_count: 3,
        // u32::MAX: the surface lets the drawable size decide.
        current_extent: vk::Extent2D {
            width: u32::MAX,
            height: u32::MAX,
        },
        min_image_extent: vk::Extent2D {
            width: 1,
            height: 1,
        },
        max_image_extent: vk::Extent2D {
            width: 8192,
            height: 8192,
        },
        ..Default::default()
    }
}

#[derive(Default)]
struct MockSwapchain {
    extent: (u32, u32),
    images: Vec<u32>,
    views: Vec<u32>,
    framebuffers: Vec<u32>,
    builds: u32,
}

impl MockSwapchain {
    fn build(&mut self, drawable: RenderSize) {
        let caps = surface_caps();
        let count = choose_image_count(&caps);
        let extent = choose_extent(&caps, drawable);
        self.extent = (extent.width, extent.height);
        self.images = (0..count).collect();
        self.views = self.images.clone();
        self.framebuffers = self.views.clone();
        self.builds += 1;
    }

    fn counts(&self) -> (usize, usize, usize) {
        (self.images.len(), self.views.len(), self.framebuffers.len())
    }
}

struct MockBackend {
    swapchain: MockSwapchain,
    drawable: RenderSize,
    /// true = signaled
    fences: [bool; MAX_FRAMES_IN_FLIGHT],
    /// false once a rebuild was deferred at zero size
    ready: bool,
    next_image: u32,
    fail_submit: bool,
    submitted: u32,
    presented: u32,
    /// Present results keyed by the number of presents already done.
    present_script: HashMap<u32, Presented>,
    acquire_script: HashMap<u32, Acquired>,
    acquires: u32,
}

impl MockBackend {
    fn new(drawable: RenderSize) -> Self {
        let mut swapchain = MockSwapchain::default();
        swapchain.build(drawable);
        MockBackend {
            swapchain,
            drawable,
            fences: [true; MAX_FRAMES_IN_FLIGHT],
            ready: true,
            next_image: 0,
            fail_submit: false,
            submitted: 0,
            presented: 0,
            present_script: HashMap::new(),
            acquire_script: HashMap::new(),
            acquires: 0,
        }
    }
}

impl FrameBackend for MockBackend {
    type Error = String;

    fn acquire(&mut self, slot: usize) -> Result<Acquired, String> {
        if !self.ready {
            return Err("acquire on an invalidated swapchain".into());
        }
        if !self.fences[slot] {
            return Err(format!("slot {slot} fence never signaled"));
        }
        let n = self.acquires;
        self.acquires += 1;
        if let Some(scripted) = self.acquire_script.remove(&n) {
            return Ok(scripted);
        }
        let index = self.next_image;
        self.next_image = (self.next_image + 1) % self.swapchain.images.len() as u32;
        self.fences[slot] = false;
        Ok(Acquired::Image {
            index,
            suboptimal: false,
        })
    }

    fn update(&mut self, slot: usize) -> Result<(), String> {
        // acquire() reset the fence; the slot's previous frame is known complete.
        if self.fences[slot] {
            return Err(format!("slot {slot} written before its acquire"));
        }
        Ok(())
    }

    fn record(&mut self, _slot: usize, image_index: u32) -> Result<(), String> {
        // Zero draws: only the framebuffer lookup matters.
        if image_index as usize >= self.swapchain.framebuffers.len() {
            return Err(format!("no framebuffer for image {image_index}"));
        }
        Ok(())
    }

    fn submit(&mut self, slot: usize) -> Result<(), String> {
        if self.fail_submit {
            return Err("queue submit failed".into());
        }
        self.submitted += 1;
        // The mock GPU finishes immediately.
        self.fences[slot] = true;
        Ok(())
    }

    fn present(&mut self, _slot: usize, image_index: u32) -> Result<Presented, String> {
        if image_index as usize >= self.swapchain.images.len() {
            return Err(format!("presenting unknown image {image_index}"));
        }
        let n = self.presented;
        self.presented += 1;
        Ok(self.present_script.remove(&n).unwrap_or(Presented::Optimal))
    }

    fn recreate(&mut self) -> Result<(), String> {
        // Same contract as the Vulkan swapchain: defer, never build at zero.
        self.ready = false;
        if self.drawable.is_zero() {
            return Ok(());
        }
        self.swapchain.build(self.drawable);
        self.next_image = 0;
        self.ready = true;
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn drawable_is_zero(&self) -> bool {
        self.drawable.is_zero()
    }
}

#[test]
fn ten_frames_at_256_end_on_slot_zero() {
    let mut backend = MockBackend::new(RenderSize::new(256, 256));
    let mut draw = DrawLoop::new(MAX_FRAMES_IN_FLIGHT);

    for _ in 0..10 {
        let status = draw.run_frame(&mut backend).expect("frame failed");
        assert_eq!(status, FrameStatus::Presented);
    }

    assert_eq!(draw.ring().frames(), 10);
    assert_eq!(draw.current_slot(), 0);
    assert_eq!(backend.submitted, 10);
    assert_eq!(backend.presented, 10);
    assert_eq!(backend.swapchain.extent, (256, 256));
    assert_eq!(backend.swapchain.counts(), (3, 3, 3));
    assert_eq!(backend.swapchain.builds, 1);
}

#[test]
fn suboptimal_present_rebuilds_without_touching_the_counter() {
    let mut backend = MockBackend::new(RenderSize::new(256, 256));
    let mut draw = DrawLoop::new(MAX_FRAMES_IN_FLIGHT);

    draw.run_frame(&mut backend).unwrap();
    assert_eq!(draw.current_slot(), 1);

    backend.drawable = RenderSize::new(640, 360);
    backend.present_script.insert(1, Presented::Suboptimal);

    let before = draw.ring().frames();
    let status = draw.run_frame(&mut backend).unwrap();
    assert_eq!(status, FrameStatus::Recreated);
    assert_eq!(backend.swapchain.builds, 2);
    assert_eq!(backend.swapchain.extent, (640, 360));

    let (images, views, framebuffers) = backend.swapchain.counts();
    assert_eq!(images, views);
    assert_eq!(views, framebuffers);
    assert_eq!(images as u32, choose_image_count(&surface_caps()));

    // Exactly one advance for the presented frame; recreation added nothing.
    assert_eq!(draw.ring().frames(), before + 1);
    assert_eq!(draw.current_slot(), 0);
}

#[test]
fn out_of_date_acquire_skips_the_frame() {
    let mut backend = MockBackend::new(RenderSize::new(256, 256));
    let mut draw = DrawLoop::new(MAX_FRAMES_IN_FLIGHT);
    backend.acquire_script.insert(0, Acquired::OutOfDate);

    let status = draw.run_frame(&mut backend).unwrap();
    assert_eq!(status, FrameStatus::Skipped);
    assert_eq!(draw.ring().frames(), 0);
    assert_eq!(backend.submitted, 0);
    assert_eq!(backend.swapchain.builds, 2);
    // The slot fence was not consumed, so the retry proceeds.
    assert_eq!(draw.run_frame(&mut backend).unwrap(), FrameStatus::Presented);
    assert_eq!(draw.ring().frames(), 1);
}

#[test]
fn flagged_resize_is_honoured_after_present() {
    let mut backend = MockBackend::new(RenderSize::new(256, 256));
    let mut draw = DrawLoop::new(MAX_FRAMES_IN_FLIGHT);

    backend.drawable = RenderSize::new(300, 200);
    draw.request_resize();
    assert_eq!(draw.run_frame(&mut backend).unwrap(), FrameStatus::Recreated);
    assert!(!draw.resize_pending());
    assert_eq!(backend.swapchain.extent, (300, 200));
    assert_eq!(draw.run_frame(&mut backend).unwrap(), FrameStatus::Presented);
}

#[test]
fn backend_errors_propagate() {
    let mut backend = MockBackend::new(RenderSize::new(256, 256));
    let mut draw = DrawLoop::new(MAX_FRAMES_IN_FLIGHT);
    backend.fail_submit = true;

    let err = draw.tick(&mut backend).unwrap_err();
    assert!(err.contains("submit"));
    assert_eq!(backend.presented, 0);
    assert_eq!(draw.ring().frames(), 0);
}

#[test]
fn zero_size_defers_until_the_window_grows() {
    let mut backend = MockBackend::new(RenderSize::new(256, 256));
    let mut draw = DrawLoop::new(MAX_FRAMES_IN_FLIGHT);

    // Minimized mid-frame: the present reports out of date at 0x0.
    backend.drawable = RenderSize::new(0, 0);
    backend.present_script.insert(0, Presented::OutOfDate);
    assert_eq!(
        draw.tick(&mut backend).unwrap(),
        Some(FrameStatus::Recreated)
    );
    assert!(!backend.ready);
    assert_eq!(backend.swapchain.builds, 1);
    assert_eq!(draw.ring().frames(), 1);

    // While zero-sized nothing is acquired, built or counted.
    for _ in 0..3 {
        assert_eq!(draw.tick(&mut backend).unwrap(), None);
    }
    assert_eq!(backend.acquires, 1);
    assert_eq!(backend.swapchain.builds, 1);
    assert_eq!(draw.ring().frames(), 1);

    // The first nonzero size completes the rebuild before drawing.
    backend.drawable = RenderSize::new(320, 240);
    assert_eq!(
        draw.tick(&mut backend).unwrap(),
        Some(FrameStatus::Presented)
    );
    assert!(backend.ready);
    assert_eq!(backend.swapchain.builds, 2);
    assert_eq!(backend.swapchain.extent, (320, 240));
    let (images, views, framebuffers) = backend.swapchain.counts();
    assert_eq!(images, views);
    assert_eq!(views, framebuffers);
    assert_eq!(images as u32, choose_image_count(&surface_caps()));
    assert_eq!(draw.ring().frames(), 2);
}
