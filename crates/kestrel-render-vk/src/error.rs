// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use thiserror::Error;

pub type VkResult<T> = Result<T, VkError>;

#[derive(Debug, Error)]
pub enum VkError {
    #[error("vulkan call failed: {0}")]
    Vulkan(#[from] vk::Result),

    #[error("failed to load the vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("window handle unavailable: {0}")]
    WindowHandle(#[from] raw_window_handle::HandleError),

    #[error("requested layer {0} is not available")]
    MissingLayer(String),

    #[error("{0} used before it was initialized")]
    NotInitialized(&'static str),

    #[error("no adapter satisfies the renderer's requirements")]
    NoSuitableAdapter,

    #[error("no memory type in mask {type_bits:#x} has {required:?}")]
    NoSuitableMemoryType {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },

    #[error("none of the candidate formats supports the requested features")]
    UnsupportedFormat,

    #[error("instance {index} exceeds the per-frame capacity of {capacity}")]
    CapacityExceeded { index: u32, capacity: u32 },

    #[error("write of {len} bytes at offset {offset} overruns a {size}-byte buffer")]
    OutOfBounds {
        offset: vk::DeviceSize,
        len: vk::DeviceSize,
        size: vk::DeviceSize,
    },

    #[error("mesh {id} does not exist ({loaded} loaded)")]
    UnknownMesh { id: usize, loaded: usize },

    #[error("buffers must have a non-zero size")]
    ZeroSizedBuffer,

    #[error("unsupported image layout transition {old:?} -> {new:?}")]
    UnsupportedLayoutTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },

    #[error("failed to acquire swapchain image: {0}")]
    Acquire(vk::Result),

    #[error("failed to present swapchain image: {0}")]
    Present(vk::Result),

    #[error("gpu did not signal within {waited_ms} ms")]
    GpuTimeout { waited_ms: u64 },

    #[error("device lost")]
    DeviceLost,

    #[error("shader module: {0}")]
    Shader(String),

    #[error("graphics pipeline creation failed: {0}")]
    Pipeline(vk::Result),
}

impl VkError {
    /// Fold `ERROR_DEVICE_LOST` out of the generic bucket so callers can match on it.
    pub(crate) fn classify(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => VkError::DeviceLost,
            other => VkError::Vulkan(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_lost_is_distinguished() {
        assert!(matches!(
            VkError::classify(vk::Result::ERROR_DEVICE_LOST),
            VkError::DeviceLost
        ));
        assert!(matches!(
            VkError::classify(vk::Result::ERROR_OUT_OF_HOST_MEMORY),
            VkError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
        ));
    }

    #[test]
    fn capacity_message_names_both_numbers() {
        let msg = VkError::CapacityExceeded { index: 7, capacity: 4 }.to_string();
        assert!(msg.contains('7') && msg.contains('4'));
    }
}
