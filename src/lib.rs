// =============================================================================
// VK FRAME RENDERER - GPU-resident rendering core
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  App (winit window, input -> event sources)                     │
// │    └── Renderer (init / render / shutdown)                      │
// │          ├── GraphicsContext (instance, device, queue)          │
// │          ├── SwapchainManager (present chain + draw image)      │
// │          ├── FrameScheduler (2 frames in flight)                │
// │          ├── ImmediateExecutor (blocking one-off submits)       │
// │          ├── ResourceAllocator (gpu-allocator)                  │
// │          └── DescriptorTable + GradientPipeline                 │
// └─────────────────────────────────────────────────────────────────┘

pub mod app;
pub mod backend;
pub mod config;
pub mod events;
pub mod renderer;

pub use config::Config;
pub use renderer::{OverlayPass, OverlayTarget, Renderer};
