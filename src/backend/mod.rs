// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash; each GPU object has one owner and is
// destroyed through a deletion queue or its owner's Drop

pub mod allocator;
pub mod barrier;
pub mod deletion;
pub mod descriptors;
pub mod device;
pub mod frame;
pub mod immediate;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use allocator::{AllocatedImage, ResourceAllocator};
pub use deletion::{DeletionQueue, GpuResource};
pub use descriptors::DescriptorTable;
pub use device::{ContextDesc, DeviceCandidate, GraphicsContext};
pub use frame::{FrameHandle, FrameScheduler, FRAMES_IN_FLIGHT};
pub use immediate::ImmediateExecutor;
pub use pipeline::GradientPipeline;
pub use swapchain::SwapchainManager;
