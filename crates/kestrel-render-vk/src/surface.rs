// SPDX-License-Identifier: CEPL-1.0
use std::sync::Arc;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::debug;

use crate::context::DeviceContext;
use crate::error::VkResult;

/// What a surface offers on a given adapter.
#[derive(Clone, Debug, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Presentation surface bound to a window. Destroyed on drop.
pub struct Surface {
    ctx: Arc<DeviceContext>,
    handle: vk::SurfaceKHR,
}

impl Surface {
    /// The context must already be initialized with the window's display handle.
    pub fn new(
        ctx: &Arc<DeviceContext>,
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
    ) -> VkResult<Self> {
        let instance = ctx.instance()?;
        let handle = unsafe {
            ash_window::create_surface(
                ctx.entry(),
                instance,
                display.display_handle()?.as_raw(),
                window.window_handle()?.as_raw(),
                None,
            )?
        };
        debug!(?handle, "surface created");
        Ok(Surface {
            ctx: Arc::clone(ctx),
            handle,
        })
    }

    pub fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    pub fn support(&self, phys: vk::PhysicalDevice) -> VkResult<SurfaceSupport> {
        let loader = self.ctx.surface_loader()?;
        unsafe {
            Ok(SurfaceSupport {
                capabilities: loader.get_physical_device_surface_capabilities(phys, self.handle)?,
                formats: loader.get_physical_device_surface_formats(phys, self.handle)?,
                present_modes: loader
                    .get_physical_device_surface_present_modes(phys, self.handle)?,
            })
        }
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        if let Ok(loader) = self.ctx.surface_loader() {
            unsafe { loader.destroy_surface(self.handle, None) };
            debug!("surface destroyed");
        }
    }
}
