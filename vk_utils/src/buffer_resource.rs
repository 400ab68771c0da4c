use crate::device_context::DeviceContext;
use crate::error::VkCallError;
use crate::memory::memory_type_index;
use crate::vk_check;

use ash::vk::{
    self, Buffer, BufferCreateInfo, BufferDeviceAddressInfo, BufferUsageFlags, DeviceAddress,
    DeviceMemory, MemoryAllocateFlags, MemoryAllocateFlagsInfo, MemoryAllocateInfo,
    MemoryMapFlags, MemoryPropertyFlags, SharingMode,
};
use ash::Device;

/// A buffer with its own allocation. Host-visible buffers stay mapped until drop.
pub struct BufferResource {
    device: Device,
    pub buffer: Buffer,
    memory: DeviceMemory,
    size: u64,
    mapped: Option<*mut u8>,
}

impl BufferResource {
    pub fn new(
        context: &DeviceContext,
        size: u64,
        property_flags: MemoryPropertyFlags,
        usage: BufferUsageFlags,
    ) -> Result<Self, VkCallError> {
        let device = context.vk_device();
        let buffer_info = BufferCreateInfo::builder()
            .size(size)
            .sharing_mode(SharingMode::EXCLUSIVE)
            .usage(usage | BufferUsageFlags::SHADER_DEVICE_ADDRESS);

        unsafe {
            let buffer = vk_check!(device.create_buffer(&buffer_info, None))?;
            let memory_requirements = device.get_buffer_memory_requirements(buffer);
            let type_index = match memory_type_index(
                memory_requirements.memory_type_bits,
                context.gpu().memory_properties(),
                property_flags,
            ) {
                Some(type_index) => type_index,
                None => {
                    device.destroy_buffer(buffer, None);
                    return Err(VkCallError::new(
                        "memory_type_index",
                        file!(),
                        line!(),
                        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
                    ));
                }
            };

            let mut flags =
                MemoryAllocateFlagsInfo::builder().flags(MemoryAllocateFlags::DEVICE_ADDRESS);
            let allocation_info = MemoryAllocateInfo::builder()
                .push_next(&mut flags)
                .memory_type_index(type_index)
                .allocation_size(memory_requirements.size);
            let memory = vk_check!(device.allocate_memory(&allocation_info, None))?;
            vk_check!(device.bind_buffer_memory(buffer, memory, 0))?;

            let mapped = if property_flags.contains(MemoryPropertyFlags::HOST_VISIBLE) {
                let ptr = vk_check!(device.map_memory(memory, 0, size, MemoryMapFlags::empty()))?;
                Some(ptr as *mut u8)
            } else {
                None
            };

            Ok(Self {
                device: device.clone(),
                buffer,
                memory,
                size,
                mapped,
            })
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Copies `data` into the mapping at `offset`. Returns false when the
    /// buffer is not host visible or the range does not fit.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> bool {
        match self.mapped {
            Some(ptr) if offset + data.len() as u64 <= self.size => {
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        data.as_ptr(),
                        ptr.add(offset as usize),
                        data.len(),
                    );
                }
                true
            }
            _ => false,
        }
    }

    pub fn device_address(&self) -> DeviceAddress {
        let address_info = BufferDeviceAddressInfo::builder().buffer(self.buffer);
        unsafe { self.device.get_buffer_device_address(&address_info) }
    }
}

impl Drop for BufferResource {
    fn drop(&mut self) {
        unsafe {
            if self.mapped.take().is_some() {
                self.device.unmap_memory(self.memory);
            }
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
        }
    }
}
