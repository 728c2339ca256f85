// SPDX-License-Identifier: CEPL-1.0
//! Windowing glue. The renderer only ever sees raw handles and a pixel size.
pub use winit;

use winit::window::Window;

/// Current drawable size in physical pixels. Either axis may be zero while minimized.
pub fn drawable_size(window: &Window) -> (u32, u32) {
    let size = window.inner_size();
    (size.width, size.height)
}
