// Backend module - Vulkan abstraction layer
//
// Thin owning wrappers around ash handles. Each wrapper releases its
// Vulkan objects on drop, in dependency order.

pub mod buffer;
pub mod device;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use buffer::{BufferAllocator, BufferKind, GpuBuffer};
pub use device::DeviceContext;
pub use pipeline::Vertex;
pub use swapchain::{ImageAcquire, PresentResult, Swapchain};
pub use sync::FrameSync;
