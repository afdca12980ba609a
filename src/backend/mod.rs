// Backend module - Vulkan abstraction layer
//
// Thin wrappers around ash. Each wrapper owns its handles and releases them
// on drop; callers flush the frame queue before dropping GPU resources.

pub mod buffer;
pub mod descriptor;
pub mod device;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod texture;

pub use buffer::Buffer;
pub use device::VulkanDevice;
pub use surface::Surface;
pub use swapchain::Swapchain;
pub use sync::FrameQueue;
