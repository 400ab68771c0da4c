use ash::extensions::khr::{AccelerationStructure, RayTracingPipeline};
use ash::vk::{
    self, PhysicalDevice, PhysicalDeviceAccelerationStructureFeaturesKHR,
    PhysicalDeviceFeatures2, PhysicalDeviceMemoryProperties, PhysicalDeviceProperties,
    PhysicalDeviceProperties2, PhysicalDeviceRayTracingPipelineFeaturesKHR,
    PhysicalDeviceRayTracingPipelinePropertiesKHR, PhysicalDeviceType,
    PhysicalDeviceVulkan12Features,
};
use ash::Instance;
use std::ffi::CStr;

/// The device extensions a ray-tracing device has to expose.
pub fn ray_tracing_extensions() -> [&'static CStr; 4] {
    [
        AccelerationStructure::name(),
        RayTracingPipeline::name(),
        vk::KhrDeferredHostOperationsFn::name(),
        ash::extensions::khr::Swapchain::name(),
    ]
}

pub struct Gpu {
    instance: Instance,
    physical_device: PhysicalDevice,
    properties: PhysicalDeviceProperties,
    ray_tracing_properties: PhysicalDeviceRayTracingPipelinePropertiesKHR,
    memory_properties: PhysicalDeviceMemoryProperties,
    queue_family_index: u32,
}

impl Gpu {
    pub(crate) fn new(
        instance: &Instance,
        physical_device: PhysicalDevice,
        queue_family_index: u32,
    ) -> Self {
        let mut ray_tracing_properties = PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let properties = unsafe {
            let mut properties2 =
                PhysicalDeviceProperties2::builder().push_next(&mut ray_tracing_properties);
            instance.get_physical_device_properties2(physical_device, &mut properties2);
            properties2.properties
        };
        ray_tracing_properties.p_next = std::ptr::null_mut();

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        Self {
            instance: instance.clone(),
            physical_device,
            properties,
            ray_tracing_properties,
            memory_properties,
            queue_family_index,
        }
    }

    pub fn vk_physical_device(&self) -> &PhysicalDevice {
        &self.physical_device
    }

    pub fn vk_instance(&self) -> &Instance {
        &self.instance
    }

    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    pub fn is_discrete(&self) -> bool {
        self.properties.device_type == PhysicalDeviceType::DISCRETE_GPU
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    pub fn memory_properties(&self) -> &PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn ray_tracing_properties(&self) -> &PhysicalDeviceRayTracingPipelinePropertiesKHR {
        &self.ray_tracing_properties
    }

    /// Names the first missing piece of ray-tracing support, if any.
    pub fn missing_ray_tracing_support(&self) -> Option<String> {
        let available = match unsafe {
            self.instance
                .enumerate_device_extension_properties(self.physical_device)
        } {
            Ok(available) => available,
            Err(result) => return Some(format!("extension query failed: {:?}", result)),
        };

        for required in ray_tracing_extensions() {
            let present = available.iter().any(|extension| {
                (unsafe { CStr::from_ptr(extension.extension_name.as_ptr()) }) == required
            });
            if !present {
                return Some(format!("missing extension {}", required.to_string_lossy()));
            }
        }

        let mut vulkan12 = PhysicalDeviceVulkan12Features::default();
        let mut acceleration_structure = PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut ray_tracing = PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
        unsafe {
            let mut features = PhysicalDeviceFeatures2::builder()
                .push_next(&mut vulkan12)
                .push_next(&mut acceleration_structure)
                .push_next(&mut ray_tracing);
            self.instance
                .get_physical_device_features2(self.physical_device, &mut features);
        }

        if vulkan12.buffer_device_address == vk::FALSE {
            return Some("buffer device address is not supported".into());
        }
        if vulkan12.timeline_semaphore == vk::FALSE {
            return Some("timeline semaphores are not supported".into());
        }
        if acceleration_structure.acceleration_structure == vk::FALSE {
            return Some("acceleration structures are not supported".into());
        }
        if ray_tracing.ray_tracing_pipeline == vk::FALSE {
            return Some("ray tracing pipelines are not supported".into());
        }
        None
    }
}
