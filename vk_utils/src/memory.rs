use ash::vk::{MemoryPropertyFlags, PhysicalDeviceMemoryProperties};

pub fn memory_type_index(
    type_bits: u32,
    properties: &PhysicalDeviceMemoryProperties,
    flags: MemoryPropertyFlags,
) -> Option<u32> {
    properties.memory_types[..properties.memory_type_count as usize]
        .iter()
        .enumerate()
        .find(|(index, memory_type)| {
            (1 << index) & type_bits != 0 && memory_type.property_flags.contains(flags)
        })
        .map(|(index, _)| index as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::MemoryType;

    #[test]
    fn picks_first_type_allowed_by_mask_and_flags() {
        let mut properties = PhysicalDeviceMemoryProperties {
            memory_type_count: 3,
            ..Default::default()
        };
        properties.memory_types[0] = MemoryType {
            property_flags: MemoryPropertyFlags::DEVICE_LOCAL,
            heap_index: 0,
        };
        properties.memory_types[1] = MemoryType {
            property_flags: MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
            heap_index: 1,
        };
        properties.memory_types[2] = MemoryType {
            property_flags: MemoryPropertyFlags::HOST_VISIBLE,
            heap_index: 1,
        };

        assert_eq!(
            memory_type_index(0b111, &properties, MemoryPropertyFlags::HOST_VISIBLE),
            Some(1)
        );
        assert_eq!(
            memory_type_index(0b100, &properties, MemoryPropertyFlags::HOST_VISIBLE),
            Some(2)
        );
        assert_eq!(
            memory_type_index(0b001, &properties, MemoryPropertyFlags::HOST_VISIBLE),
            None
        );
    }
}
