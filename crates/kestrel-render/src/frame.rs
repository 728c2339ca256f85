// SPDX-License-Identifier: CEPL-1.0
//! Backend-agnostic per-frame state machine:
//! `Idle -> Acquired -> Recording -> Submitted -> Presented -> Idle`.
//!
//! The loop owns only the frame counter and the resize flag. Everything that
//! touches the GPU sits behind [`FrameBackend`], which keeps the ordering rules
//! testable without a device.
use tracing::{debug, trace};

/// Number of frame slots the CPU may record ahead of the GPU.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Monotonic frame counter; the active slot is `frames % count`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotRing {
    frames: u64,
    count: usize,
}

impl SlotRing {
    pub fn new(count: usize) -> Self {
        SlotRing {
            frames: 0,
            count: count.max(1),
        }
    }

    pub fn current(&self) -> usize {
        (self.frames % self.count as u64) as usize
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Total number of completed frames.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn advance(&mut self) -> usize {
        self.frames += 1;
        self.current()
    }
}

impl Default for SlotRing {
    fn default() -> Self {
        SlotRing::new(MAX_FRAMES_IN_FLIGHT)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquired {
    Image { index: u32, suboptimal: bool },
    /// Surface no longer matches the swapchain; nothing was acquired.
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presented {
    Optimal,
    Suboptimal,
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    /// Frame shown, nothing else happened.
    Presented,
    /// Frame shown, then the swapchain was rebuilt.
    Recreated,
    /// Acquire reported out-of-date; swapchain rebuilt, counter untouched.
    Skipped,
}

/// The GPU side of one displayed frame. Every method receives the active slot.
pub trait FrameBackend {
    type Error;

    /// Wait on the slot's fence and acquire the next presentable image.
    /// The fence and command buffer are reset only when an image was acquired.
    fn acquire(&mut self, slot: usize) -> Result<Acquired, Self::Error>;
    /// Write per-frame uniforms for the slot. Its fence is known signaled here.
    fn update(&mut self, slot: usize) -> Result<(), Self::Error>;
    fn record(&mut self, slot: usize, image_index: u32) -> Result<(), Self::Error>;
    /// Wait on "image available", signal "render finished" and the slot fence.
    fn submit(&mut self, slot: usize) -> Result<(), Self::Error>;
    fn present(&mut self, slot: usize, image_index: u32) -> Result<Presented, Self::Error>;
    /// Rebuild the swapchain. At a zero drawable size this defers and leaves
    /// [`is_ready`](Self::is_ready) false instead of failing.
    fn recreate(&mut self) -> Result<(), Self::Error>;

    /// A presentable swapchain exists.
    fn is_ready(&self) -> bool {
        true
    }

    /// The drawable currently has a zero axis (minimized window).
    fn drawable_is_zero(&self) -> bool {
        false
    }
}

#[derive(Debug, Default)]
pub struct DrawLoop {
    ring: SlotRing,
    resize_pending: bool,
}

impl DrawLoop {
    pub fn new(slots: usize) -> Self {
        DrawLoop {
            ring: SlotRing::new(slots),
            resize_pending: false,
        }
    }

    pub fn ring(&self) -> &SlotRing {
        &self.ring
    }

    pub fn current_slot(&self) -> usize {
        self.ring.current()
    }

    /// Externally flagged resize, honoured after the next present.
    pub fn request_resize(&mut self) {
        self.resize_pending = true;
    }

    pub fn resize_pending(&self) -> bool {
        self.resize_pending
    }

    /// Run a frame when the surface can take one.
    ///
    /// Returns `None` while the drawable is zero-sized, or when a deferred
    /// rebuild still produced no swapchain. The first nonzero size completes
    /// the rebuild before anything is acquired.
    pub fn tick<B: FrameBackend>(
        &mut self,
        backend: &mut B,
    ) -> Result<Option<FrameStatus>, B::Error> {
        if !backend.is_ready() {
            if backend.drawable_is_zero() {
                trace!("drawable is zero-sized, frame deferred");
                return Ok(None);
            }
            debug!("completing deferred swapchain rebuild");
            self.resize_pending = false;
            backend.recreate()?;
            if !backend.is_ready() {
                return Ok(None);
            }
        }
        self.run_frame(backend).map(Some)
    }

    pub fn run_frame<B: FrameBackend>(&mut self, backend: &mut B) -> Result<FrameStatus, B::Error> {
        let slot = self.ring.current();

        let image_index = match backend.acquire(slot)? {
            Acquired::OutOfDate => {
                debug!(slot, "acquire out of date, recreating and skipping frame");
                self.resize_pending = false;
                backend.recreate()?;
                return Ok(FrameStatus::Skipped);
            }
            Acquired::Image { index, suboptimal } => {
                trace!(slot, index, suboptimal, "acquired");
                index
            }
        };

        backend.update(slot)?;
        backend.record(slot, image_index)?;
        backend.submit(slot)?;
        let presented = backend.present(slot, image_index)?;

        let resize = std::mem::take(&mut self.resize_pending);
        let status = if resize || presented != Presented::Optimal {
            debug!(slot, ?presented, resize, "recreating after present");
            backend.recreate()?;
            FrameStatus::Recreated
        } else {
            FrameStatus::Presented
        };

        self.ring.advance();
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_alternates_between_two_slots() {
        let mut ring = SlotRing::default();
        assert_eq!(ring.current(), 0);
        for n in 1..=9u64 {
            ring.advance();
            assert_eq!(ring.current() as u64, n % 2);
        }
        assert_eq!(ring.frames(), 9);
    }

    #[test]
    fn zero_slots_is_clamped_to_one() {
        let mut ring = SlotRing::new(0);
        assert_eq!(ring.count(), 1);
        assert_eq!(ring.advance(), 0);
    }

    #[derive(Default)]
    struct Scripted {
        acquire: Vec<Acquired>,
        present: Vec<Presented>,
        log: Vec<&'static str>,
    }

    impl FrameBackend for Scripted {
        type Error = ();

        fn acquire(&mut self, _slot: usize) -> Result<Acquired, ()> {
            self.log.push("acquire");
            Ok(if self.acquire.is_empty() {
                Acquired::Image { index: 0, suboptimal: false }
            } else {
                self.acquire.remove(0)
            })
        }
        fn update(&mut self, _slot: usize) -> Result<(), ()> {
            self.log.push("update");
            Ok(())
        }
        fn record(&mut self, _slot: usize, _image_index: u32) -> Result<(), ()> {
            self.log.push("record");
            Ok(())
        }
        fn submit(&mut self, _slot: usize) -> Result<(), ()> {
            self.log.push("submit");
            Ok(())
        }
        fn present(&mut self, _slot: usize, _image_index: u32) -> Result<Presented, ()> {
            self.log.push("present");
            Ok(if self.present.is_empty() {
                Presented::Optimal
            } else {
                self.present.remove(0)
            })
        }
        fn recreate(&mut self) -> Result<(), ()> {
            self.log.push("recreate");
            Ok(())
        }
    }

    #[test]
    fn steps_run_in_order() {
        let mut b = Scripted::default();
        let mut lp = DrawLoop::new(2);
        assert_eq!(lp.run_frame(&mut b), Ok(FrameStatus::Presented));
        assert_eq!(b.log, ["acquire", "update", "record", "submit", "present"]);
        assert_eq!(lp.current_slot(), 1);
    }

    #[test]
    fn out_of_date_acquire_skips_without_advancing() {
        let mut b = Scripted {
            acquire: vec![Acquired::OutOfDate],
            ..Default::default()
        };
        let mut lp = DrawLoop::new(2);
        lp.request_resize();
        assert_eq!(lp.run_frame(&mut b), Ok(FrameStatus::Skipped));
        assert_eq!(b.log, ["acquire", "recreate"]);
        assert_eq!(lp.ring().frames(), 0);
        assert!(!lp.resize_pending());
    }

    #[test]
    fn pending_resize_recreates_after_optimal_present() {
        let mut b = Scripted::default();
        let mut lp = DrawLoop::new(2);
        lp.request_resize();
        assert_eq!(lp.run_frame(&mut b), Ok(FrameStatus::Recreated));
        assert_eq!(b.log.last(), Some(&"recreate"));
        assert!(!lp.resize_pending());
        assert_eq!(lp.ring().frames(), 1);
    }

    #[test]
    fn tick_runs_a_frame_on_a_ready_backend() {
        let mut b = Scripted::default();
        let mut lp = DrawLoop::new(2);
        assert_eq!(lp.tick(&mut b), Ok(Some(FrameStatus::Presented)));
        assert_eq!(lp.ring().frames(), 1);
    }

    #[test]
    fn suboptimal_acquire_still_draws() {
        let mut b = Scripted {
            acquire: vec![Acquired::Image { index: 2, suboptimal: true }],
            ..Default::default()
        };
        let mut lp = DrawLoop::new(2);
        assert_eq!(lp.run_frame(&mut b), Ok(FrameStatus::Presented));
        assert!(b.log.contains(&"submit"));
    }
}
