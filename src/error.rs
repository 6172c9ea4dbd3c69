// Renderer error taxonomy
//
// Three fatal kinds (init, draw, buffer misuse) plus carriers for raw API
// failures. Swapchain invalidation (out-of-date/suboptimal) is deliberately
// NOT an error: the frame scheduler absorbs it through the rebuild path and
// callers only observe "this frame produced no image".

use ash::vk;
use thiserror::Error;

pub type RenderResult<T> = Result<T, RenderError>;

#[derive(Debug, Error)]
pub enum RenderError {
    /// Device, surface, swapchain, shader, or pipeline creation failure.
    /// The renderer must not enter the frame loop after one of these.
    #[error("initialization failed: {0}")]
    Init(String),

    /// Raw Vulkan failure inside an init or resource path.
    #[error("vulkan call failed: {0}")]
    Vulkan(#[from] vk::Result),

    /// GPU memory allocation failure.
    #[error("allocation failed: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),

    /// Unexpected acquire/submit/present result with no defined recovery.
    #[error("draw failed: {0}")]
    Draw(vk::Result),

    /// Programmer error on the buffer layer: size mismatch on copy,
    /// out-of-bounds mapped write, or a write to a non-host-visible buffer.
    #[error("buffer misuse: {0}")]
    BufferMisuse(String),
}

impl RenderError {
    /// Draw failures (device lost, unexpected submit/present results) have
    /// no defined recovery; the frame loop must stop. Everything else
    /// surfaces before the loop starts or is retryable next frame.
    pub fn halts_frame_loop(&self) -> bool {
        matches!(self, RenderError::Draw(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_draw_errors_halt_the_frame_loop() {
        assert!(RenderError::Draw(vk::Result::ERROR_DEVICE_LOST).halts_frame_loop());

        assert!(!RenderError::Init("no surface".to_string()).halts_frame_loop());
        assert!(!RenderError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY).halts_frame_loop());
        assert!(!RenderError::BufferMisuse("size mismatch".to_string()).halts_frame_loop());
    }
}
