use ash::extensions::khr::{AccelerationStructure, RayTracingPipeline};
use ash::vk::{
    DeviceCreateInfo, DeviceQueueCreateInfo, PhysicalDeviceAccelerationStructureFeaturesKHR,
    PhysicalDeviceRayTracingPipelineFeaturesKHR, PhysicalDeviceVulkan12Features, Queue,
};
use ash::Device;

use crate::error::VkCallError;
use crate::gpu::{ray_tracing_extensions, Gpu};
use crate::vk_check;

/// Logical device with its single submission queue and the ray-tracing loaders.
pub struct DeviceContext {
    gpu: Gpu,
    device: Device,
    queue: Queue,
    acceleration_structure: AccelerationStructure,
    ray_tracing: RayTracingPipeline,
}

impl DeviceContext {
    pub fn new(gpu: Gpu) -> Result<Self, VkCallError> {
        let priorities: [f32; 1] = [1.];
        let index = gpu.queue_family_index();
        let queue_info = [DeviceQueueCreateInfo::builder()
            .queue_priorities(&priorities)
            .queue_family_index(index)
            .build()];

        let extension_names_raw: Vec<*const i8> = ray_tracing_extensions()
            .iter()
            .map(|name| name.as_ptr())
            .collect();

        let mut vulkan12 = PhysicalDeviceVulkan12Features::builder()
            .buffer_device_address(true)
            .timeline_semaphore(true);
        let mut acceleration_structure_features =
            PhysicalDeviceAccelerationStructureFeaturesKHR::builder().acceleration_structure(true);
        let mut ray_tracing_features =
            PhysicalDeviceRayTracingPipelineFeaturesKHR::builder().ray_tracing_pipeline(true);

        let create_info = DeviceCreateInfo::builder()
            .enabled_extension_names(&extension_names_raw)
            .queue_create_infos(&queue_info)
            .push_next(&mut vulkan12)
            .push_next(&mut acceleration_structure_features)
            .push_next(&mut ray_tracing_features);

        let device = vk_check!(unsafe {
            gpu.vk_instance()
                .create_device(*gpu.vk_physical_device(), &create_info, None)
        })?;
        let queue = unsafe { device.get_device_queue(index, 0) };
        let acceleration_structure = AccelerationStructure::new(gpu.vk_instance(), &device);
        let ray_tracing = RayTracingPipeline::new(gpu.vk_instance(), &device);

        log::info!("opened {} (queue family {})", gpu.name(), index);

        Ok(Self {
            gpu,
            device,
            queue,
            acceleration_structure,
            ray_tracing,
        })
    }

    pub fn wait(&self) -> Result<(), VkCallError> {
        vk_check!(unsafe { self.device.device_wait_idle() })
    }

    pub fn queue(&self) -> Queue {
        self.queue
    }

    pub fn queue_family_index(&self) -> u32 {
        self.gpu.queue_family_index()
    }

    pub fn vk_device(&self) -> &Device {
        &self.device
    }

    pub fn gpu(&self) -> &Gpu {
        &self.gpu
    }

    pub fn acceleration_structure(&self) -> &AccelerationStructure {
        &self.acceleration_structure
    }

    pub fn ray_tracing(&self) -> &RayTracingPipeline {
        &self.ray_tracing
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}
