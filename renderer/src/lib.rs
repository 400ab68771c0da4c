pub mod acceleration_structure;
pub mod bindings;
pub mod camera;
pub mod commands;
pub mod config;
pub mod device;
pub mod error;
pub mod fence;
pub mod frame_driver;
pub mod frame_ring;
pub mod headless;
pub mod logging;
pub mod pipeline;
pub mod resource_state;
pub mod scene;
pub mod shader_table;
pub mod shaders;
pub mod upload;
pub mod vulkan_device;
pub use ash::vk;

pub use error::{RenderError, Result};
pub use frame_driver::{FrameDriver, FrameState, FrameStats};
