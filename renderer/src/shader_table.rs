use crate::commands::{DispatchRaysDesc, TableRegion};
use crate::device::{
    BufferDesc, BufferHandle, BufferUsage, MemoryLocation, PipelineHandle, RayTracingDevice,
    ShaderIdentifier,
};
use crate::error::{RenderError, Result};
use crate::resource_state::ResourceState;

pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Export names in table order.
#[derive(Debug, Clone, Copy)]
pub struct ShaderTableRecords<'a> {
    pub ray_generation: &'a str,
    pub miss: &'a str,
    pub hit_group: &'a str,
}

impl<'a> ShaderTableRecords<'a> {
    fn in_order(&self) -> [&'a str; 3] {
        [self.ray_generation, self.miss, self.hit_group]
    }
}

/// Write-once table of one ray generation, one miss and one hit group record.
#[derive(Debug)]
pub struct ShaderTable {
    buffer: BufferHandle,
    stride: u64,
    identifiers: [ShaderIdentifier; 3],
}

impl ShaderTable {
    /// Local arguments of the hit group record: the materials buffer address.
    pub const HIT_GROUP_LOCAL_ARGUMENTS: u64 = 8;

    pub fn entry_stride(
        identifier_size: u64,
        largest_local_arguments: u64,
        record_alignment: u64,
        table_alignment: u64,
    ) -> u64 {
        align_up(
            identifier_size + largest_local_arguments,
            record_alignment.max(table_alignment),
        )
    }

    pub fn build<D: RayTracingDevice>(
        device: &mut D,
        pipeline: PipelineHandle,
        records: ShaderTableRecords,
        hit_group_arguments: &[u8],
    ) -> Result<Self> {
        if hit_group_arguments.len() as u64 > Self::HIT_GROUP_LOCAL_ARGUMENTS {
            return Err(RenderError::InvalidPipeline(format!(
                "hit group record carries {} bytes of local arguments",
                hit_group_arguments.len()
            )));
        }

        let capabilities = device.capabilities().clone();
        let stride = Self::entry_stride(
            capabilities.shader_identifier_size as u64,
            Self::HIT_GROUP_LOCAL_ARGUMENTS,
            capabilities.shader_record_alignment as u64,
            capabilities.shader_table_alignment as u64,
        );

        let identifiers = [
            device.shader_identifier(pipeline, records.ray_generation)?,
            device.shader_identifier(pipeline, records.miss)?,
            device.shader_identifier(pipeline, records.hit_group)?,
        ];

        let mut contents = vec![0u8; (stride * 3) as usize];
        for (index, identifier) in identifiers.iter().enumerate() {
            let start = index * stride as usize;
            contents[start..start + identifier.as_bytes().len()]
                .copy_from_slice(identifier.as_bytes());
        }
        let arguments = 2 * stride as usize + capabilities.shader_identifier_size as usize;
        contents[arguments..arguments + hit_group_arguments.len()]
            .copy_from_slice(hit_group_arguments);

        let buffer = device.create_buffer(&BufferDesc {
            label: "shader table",
            size: contents.len() as u64,
            location: MemoryLocation::Upload,
            usage: BufferUsage::ShaderTable,
            initial_state: ResourceState::GenericRead,
        })?;
        device.write_buffer(buffer, 0, &contents)?;

        log::info!(
            "shader table: {:?} at stride {}",
            records.in_order(),
            stride
        );
        Ok(Self {
            buffer,
            stride,
            identifiers,
        })
    }

    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    /// Identifier copied into record `index` (0 ray generation, 1 miss, 2 hit group).
    pub fn identifier(&self, index: usize) -> &ShaderIdentifier {
        &self.identifiers[index]
    }

    pub fn record_offset(&self, index: usize) -> u64 {
        index as u64 * self.stride
    }

    pub fn dispatch_desc(&self, width: u32, height: u32) -> DispatchRaysDesc {
        let region = |index| TableRegion {
            buffer: self.buffer,
            offset: self.record_offset(index),
            size: self.stride,
            stride: self.stride,
        };
        DispatchRaysDesc {
            ray_generation: region(0),
            miss: region(1),
            hit_group: region(2),
            width,
            height,
            depth: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_covers_identifier_and_arguments() {
        assert_eq!(ShaderTable::entry_stride(32, 8, 32, 64), 64);
        assert_eq!(ShaderTable::entry_stride(32, 0, 32, 32), 32);
        assert_eq!(ShaderTable::entry_stride(32, 40, 32, 64), 128);
    }

    #[test]
    fn align_up_rounds_to_the_next_multiple() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(96, 256), 256);
    }
}
