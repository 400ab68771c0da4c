use ash::vk::{
    Semaphore, SemaphoreCreateInfo, SemaphoreType, SemaphoreTypeCreateInfo, SemaphoreWaitInfo,
};
use ash::Device;

use crate::error::VkCallError;
use crate::vk_check;

/// A timeline semaphore: a GPU-signalled monotonically increasing counter.
pub struct TimelineSemaphore {
    device: Device,
    semaphore: Semaphore,
}

impl TimelineSemaphore {
    pub fn new(device: &Device, initial_value: u64) -> Result<Self, VkCallError> {
        let mut type_info = SemaphoreTypeCreateInfo::builder()
            .semaphore_type(SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let info = SemaphoreCreateInfo::builder().push_next(&mut type_info);
        let semaphore = vk_check!(unsafe { device.create_semaphore(&info, None) })?;
        Ok(Self {
            device: device.clone(),
            semaphore,
        })
    }

    pub fn native_handle(&self) -> Semaphore {
        self.semaphore
    }

    pub fn value(&self) -> Result<u64, VkCallError> {
        vk_check!(unsafe { self.device.get_semaphore_counter_value(self.semaphore) })
    }

    pub fn wait(&self, value: u64) -> Result<(), VkCallError> {
        let semaphores = [self.semaphore];
        let values = [value];
        let info = SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);
        vk_check!(unsafe { self.device.wait_semaphores(&info, std::u64::MAX) })
    }
}

impl Drop for TimelineSemaphore {
    fn drop(&mut self) {
        unsafe { self.device.destroy_semaphore(self.semaphore, None) }
    }
}
