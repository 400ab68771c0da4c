pub mod buffer_resource;
pub mod command_buffer;
pub mod device_context;
pub mod error;
pub mod gpu;
pub mod image_resource;
pub mod memory;
pub mod shader_library;
pub mod swapchain;
pub mod timeline;
pub mod vk_instance;
