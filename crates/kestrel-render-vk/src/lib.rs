// SPDX-License-Identifier: CEPL-1.0
//! Vulkan backend: frame lifecycle and GPU resource ownership.
//!
//! Construction order is `DeviceContext` -> `Surface` -> logical device ->
//! `Swapchain` + `FrameSynchronizer` -> `CommandRecorder` -> resources.
//! Every resource wrapper keeps an `Arc<DeviceContext>`, so the device is
//! destroyed only after the last of them.
pub mod command;
pub mod context;
pub mod error;
pub mod memory;
pub mod mesh;
pub mod overlay;
pub mod pipeline;
pub mod renderer;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod texture;
pub mod uniforms;

pub use ash::vk;

pub use command::{CommandRecorder, FrameTarget};
pub use context::{
    pick_adapter, pick_queue_families, rate_adapter, Adapter, AdapterReport, DeviceContext,
    FamilySupport, QueueFamilies,
};
pub use error::{VkError, VkResult};
pub use memory::{
    create_image_view, dynamic_stride, find_depth_format, find_memory_type,
    find_supported_format, has_stencil_component, upload_via_staging, GpuBuffer, GpuImage,
    ImageView, DEPTH_CANDIDATES,
};
pub use mesh::{Drawable, Mesh, MeshData, MeshId, Vertex};
pub use overlay::{record_overlays, Overlay, OverlayFrame, SolidRect};
pub use pipeline::GraphicsPipeline;
pub use renderer::VkRenderer;
pub use surface::{Surface, SurfaceSupport};
pub use swapchain::{
    choose_extent, choose_image_count, choose_present_mode, choose_surface_format, sharing_mode,
    Framebuffer, Rebuild, RenderPass, Swapchain, SwapchainState, PREFERRED_FORMAT,
};
pub use sync::{fence_timeout, Fence, FrameSlot, FrameSynchronizer, Semaphore};
pub use texture::{layout_barrier_masks, transition_layout, Sampler, Texture, TEXTURE_FORMAT};
pub use uniforms::{DescriptorSetLayout, FrameUniforms, InstanceLayout};
