// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use kestrel_core::{PresentPreference, RenderCfg};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

pub mod frame;

pub use frame::{
    Acquired, DrawLoop, FrameBackend, FrameStatus, Presented, SlotRing, MAX_FRAMES_IN_FLIGHT,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub fn new(width: u32, height: u32) -> Self {
        RenderSize { width, height }
    }

    /// Minimized windows report a zero axis; nothing may be created at this size.
    pub fn is_zero(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

pub trait Renderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        cfg: &RenderCfg,
    ) -> Result<Self>
    where
        Self: Sized;

    /// Record the new drawable size; the swapchain is rebuilt after the next present.
    fn resize(&mut self, size: RenderSize) -> Result<()>;
    fn render(&mut self) -> Result<()>;
    fn set_clear_color(&mut self, rgba: [f32; 4]);
    fn set_present_preference(&mut self, _pref: PresentPreference) {}
}
