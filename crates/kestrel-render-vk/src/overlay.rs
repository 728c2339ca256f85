// SPDX-License-Identifier: CEPL-1.0
//! Hook for UI drawn into the frame's render pass after the scene.
use ash::vk;

use crate::context::DeviceContext;
use crate::error::VkResult;

/// What an overlay may touch while the frame's render pass is open.
pub struct OverlayFrame<'a> {
    pub ctx: &'a DeviceContext,
    pub command_buffer: vk::CommandBuffer,
    pub render_pass: vk::RenderPass,
    pub image_count: usize,
    pub extent: vk::Extent2D,
    pub slot: usize,
}

pub trait Overlay {
    /// Record commands into `frame.command_buffer`. Do not end the render pass.
    fn record(&mut self, frame: &OverlayFrame<'_>) -> VkResult<()>;
}

/// Record every overlay in order; the first failure aborts the frame.
pub fn record_overlays(
    overlays: &mut [Box<dyn Overlay + '_>],
    frame: &OverlayFrame<'_>,
) -> VkResult<()> {
    for overlay in overlays {
        overlay.record(frame)?;
    }
    Ok(())
}

/// Flat-colored rectangle in pixels, e.g. a status bar.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SolidRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub color: [f32; 4],
}

impl SolidRect {
    /// Intersection with the drawable area; `None` when nothing is visible.
    pub fn clip(&self, extent: vk::Extent2D) -> Option<vk::Rect2D> {
        let x0 = self.x.max(0) as i64;
        let y0 = self.y.max(0) as i64;
        let x1 = (self.x as i64 + self.width as i64).min(extent.width as i64);
        let y1 = (self.y as i64 + self.height as i64).min(extent.height as i64);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(vk::Rect2D {
            offset: vk::Offset2D {
                x: x0 as i32,
                y: y0 as i32,
            },
            extent: vk::Extent2D {
                width: (x1 - x0) as u32,
                height: (y1 - y0) as u32,
            },
        })
    }
}

impl Overlay for SolidRect {
    fn record(&mut self, frame: &OverlayFrame<'_>) -> VkResult<()> {
        let Some(rect) = self.clip(frame.extent) else {
            return Ok(());
        };
        let device = frame.ctx.device()?;
        let attachment = vk::ClearAttachment {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            color_attachment: 0,
            clear_value: vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.color,
                },
            },
        };
        let clear_rect = vk::ClearRect {
            rect,
            base_array_layer: 0,
            layer_count: 1,
        };
        unsafe {
            device.cmd_clear_attachments(
                frame.command_buffer,
                std::slice::from_ref(&attachment),
                std::slice::from_ref(&clear_rect),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VkError;

    fn extent(w: u32, h: u32) -> vk::Extent2D {
        vk::Extent2D {
            width: w,
            height: h,
        }
    }

    fn rect(x: i32, y: i32, width: u32, height: u32) -> SolidRect {
        SolidRect {
            x,
            y,
            width,
            height,
            color: [1.0; 4],
        }
    }

    #[test]
    fn inside_rect_is_unchanged() {
        let r = rect(10, 20, 30, 40).clip(extent(256, 256)).unwrap();
        assert_eq!((r.offset.x, r.offset.y), (10, 20));
        assert_eq!((r.extent.width, r.extent.height), (30, 40));
    }

    #[test]
    fn rect_is_clipped_to_extent() {
        let r = rect(-10, 250, 100, 100).clip(extent(256, 256)).unwrap();
        assert_eq!((r.offset.x, r.offset.y), (0, 250));
        assert_eq!((r.extent.width, r.extent.height), (90, 6));
    }

    #[test]
    fn offscreen_rect_records_nothing() {
        assert!(rect(300, 0, 10, 10).clip(extent(256, 256)).is_none());
        assert!(rect(0, 0, 0, 10).clip(extent(256, 256)).is_none());
    }

    struct Counting<'a> {
        calls: &'a std::cell::Cell<u32>,
    }

    impl Overlay for Counting<'_> {
        fn record(&mut self, _frame: &OverlayFrame<'_>) -> VkResult<()> {
            self.calls.set(self.calls.get() + 1);
            Ok(())
        }
    }

    // Needs the Vulkan loader for a `DeviceContext`; returns early without one.
    #[test]
    fn overlay_failure_stops_the_frame() {
        let ctx = match DeviceContext::new(false) {
            Ok(ctx) => ctx,
            Err(e) => {
                eprintln!("skipping: {e}");
                return;
            }
        };
        let frame = OverlayFrame {
            ctx: &ctx,
            command_buffer: vk::CommandBuffer::null(),
            render_pass: vk::RenderPass::null(),
            image_count: 3,
            extent: extent(256, 256),
            slot: 0,
        };

        // Offscreen rects never reach the device.
        assert!(rect(300, 0, 10, 10).record(&frame).is_ok());

        // Visible rect without a logical device fails, and later overlays are skipped.
        let calls = std::cell::Cell::new(0);
        let mut overlays: Vec<Box<dyn Overlay + '_>> = vec![
            Box::new(Counting { calls: &calls }),
            Box::new(rect(0, 0, 32, 8)),
            Box::new(Counting { calls: &calls }),
        ];
        let err = record_overlays(&mut overlays, &frame).unwrap_err();
        assert!(matches!(err, VkError::NotInitialized(_)));
        assert_eq!(calls.get(), 1);
    }
}
