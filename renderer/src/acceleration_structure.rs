//! Two-level acceleration structure builds.
//!
//! A bottom level is built over procedural AABBs, a top level over instance
//! descriptors that all reference bottom levels. Both builds are recorded
//! into the caller's list; the caller submits and flushes, then calls
//! [`AccelerationStructureBuilder::release_transients`].

use bytemuck::{Pod, Zeroable};
use nalgebra_glm as glm;

use crate::commands::{BuildAccelerationStructure, Command, CommandList, GeometryInputs};
use crate::device::{BufferDesc, BufferHandle, BufferUsage, MemoryLocation, RayTracingDevice};
use crate::error::Result;
use crate::resource_state::{ResourceState, ResourceStateTracker};
use crate::scene::SphereScene;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccelerationStructureLevel {
    Bottom,
    Top,
}

#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Aabb {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl Aabb {
    pub const UNIT_CUBE: Aabb = Aabb {
        min: [-1.0, -1.0, -1.0],
        max: [1.0, 1.0, 1.0],
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct InstanceDescriptor {
    /// Row-major 3x4.
    pub transform: [f32; 12],
    pub id_and_mask: u32,
    pub hit_group_offset_and_flags: u32,
    pub bottom_level_address: u64,
}

impl InstanceDescriptor {
    pub fn new(
        transform: &glm::Mat4,
        instance_id: u32,
        mask: u8,
        hit_group_offset: u32,
        flags: u8,
        bottom_level_address: u64,
    ) -> Self {
        let mut rows = [0.0f32; 12];
        for row in 0..3 {
            for column in 0..4 {
                rows[row * 4 + column] = transform[(row, column)];
            }
        }
        Self {
            transform: rows,
            id_and_mask: ((mask as u32) << 24) | (instance_id & 0x00ff_ffff),
            hit_group_offset_and_flags: ((flags as u32) << 24) | (hit_group_offset & 0x00ff_ffff),
            bottom_level_address,
        }
    }

    pub fn instance_id(&self) -> u32 {
        self.id_and_mask & 0x00ff_ffff
    }

    pub fn mask(&self) -> u8 {
        (self.id_and_mask >> 24) as u8
    }

    pub fn hit_group_offset(&self) -> u32 {
        self.hit_group_offset_and_flags & 0x00ff_ffff
    }

    pub fn flags(&self) -> u8 {
        (self.hit_group_offset_and_flags >> 24) as u8
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Instance {
    pub transform: glm::Mat4,
    pub instance_id: u32,
    pub mask: u8,
    pub hit_group_offset: u32,
}

/// Force procedural hits to be treated as opaque.
pub const INSTANCE_FLAG_FORCE_OPAQUE: u8 = 0x04;

#[derive(Debug, Clone, Copy)]
pub struct AccelerationStructureBuffers {
    pub scratch: BufferHandle,
    pub result: BufferHandle,
    pub instance_descriptors: Option<BufferHandle>,
}

/// A recorded bottom-level build. Only [`AccelerationStructureBuilder`]
/// creates these, so a top level cannot reference a build that was never
/// recorded.
#[derive(Debug)]
pub struct BottomLevel {
    buffers: AccelerationStructureBuffers,
    address: u64,
    size: u64,
}

impl BottomLevel {
    pub fn result(&self) -> BufferHandle {
        self.buffers.result
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

#[derive(Debug)]
pub struct TopLevel {
    buffers: AccelerationStructureBuffers,
    size: u64,
    instance_count: u32,
}

impl TopLevel {
    pub fn result(&self) -> BufferHandle {
        self.buffers.result
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    pub fn instance_descriptors(&self) -> Option<BufferHandle> {
        self.buffers.instance_descriptors
    }
}

#[derive(Debug, Default)]
pub struct AccelerationStructureBuilder {
    transients: Vec<BufferHandle>,
}

impl AccelerationStructureBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build_bottom_level<D: RayTracingDevice>(
        &mut self,
        device: &mut D,
        tracker: &mut ResourceStateTracker,
        list: &mut CommandList,
        aabbs: &[Aabb],
    ) -> Result<BottomLevel> {
        let geometry = self.upload(
            device,
            tracker,
            "aabbs",
            BufferUsage::Geometry,
            bytemuck::cast_slice(aabbs),
        )?;
        self.transients.push(geometry);
        let inputs = GeometryInputs::ProceduralAabbs {
            buffer: geometry,
            count: aabbs.len() as u32,
            stride: std::mem::size_of::<Aabb>() as u64,
        };

        let (buffers, size) = self.record_build(
            device,
            tracker,
            list,
            AccelerationStructureLevel::Bottom,
            inputs,
        )?;
        let address =
            device.acceleration_structure_address(buffers.result, AccelerationStructureLevel::Bottom)?;

        log::info!(
            "bottom level: {} aabbs, {} bytes at {:#x}",
            aabbs.len(),
            size,
            address
        );
        Ok(BottomLevel {
            buffers,
            address,
            size,
        })
    }

    pub fn build_top_level<D: RayTracingDevice>(
        &mut self,
        device: &mut D,
        tracker: &mut ResourceStateTracker,
        list: &mut CommandList,
        bottom: &BottomLevel,
        instances: &[Instance],
    ) -> Result<TopLevel> {
        let descriptors: Vec<InstanceDescriptor> = instances
            .iter()
            .map(|instance| {
                InstanceDescriptor::new(
                    &instance.transform,
                    instance.instance_id,
                    instance.mask,
                    instance.hit_group_offset,
                    INSTANCE_FLAG_FORCE_OPAQUE,
                    bottom.address,
                )
            })
            .collect();

        // Fully written before the build is recorded.
        let instance_buffer = self.upload(
            device,
            tracker,
            "instance descriptors",
            BufferUsage::InstanceDescriptors,
            bytemuck::cast_slice(&descriptors),
        )?;
        let inputs = GeometryInputs::Instances {
            buffer: instance_buffer,
            count: descriptors.len() as u32,
        };

        let (mut buffers, size) = self.record_build(
            device,
            tracker,
            list,
            AccelerationStructureLevel::Top,
            inputs,
        )?;
        buffers.instance_descriptors = Some(instance_buffer);

        log::info!("top level: {} instances, {} bytes", descriptors.len(), size);
        Ok(TopLevel {
            buffers,
            size,
            instance_count: descriptors.len() as u32,
        })
    }

    /// One shared unit-sphere bottom level, one instance per sphere.
    pub fn build_scene<D: RayTracingDevice>(
        &mut self,
        device: &mut D,
        tracker: &mut ResourceStateTracker,
        list: &mut CommandList,
        scene: &SphereScene,
    ) -> Result<(BottomLevel, TopLevel)> {
        let bottom = self.build_bottom_level(device, tracker, list, &[Aabb::UNIT_CUBE])?;
        let instances: Vec<Instance> = scene
            .spheres
            .iter()
            .enumerate()
            .map(|(index, sphere)| Instance {
                transform: sphere.transform(),
                instance_id: index as u32,
                mask: 0xff,
                hit_group_offset: 0,
            })
            .collect();
        let top = self.build_top_level(device, tracker, list, &bottom, &instances)?;
        Ok((bottom, top))
    }

    /// Frees input and scratch memory. Only valid once the builds have retired.
    pub fn release_transients<D: RayTracingDevice>(
        &mut self,
        device: &mut D,
        tracker: &mut ResourceStateTracker,
    ) -> Result<()> {
        log::debug!("releasing {} transient build buffers", self.transients.len());
        for buffer in self.transients.drain(..) {
            device.destroy_buffer(buffer)?;
            tracker.forget(buffer);
        }
        Ok(())
    }

    pub fn transient_count(&self) -> usize {
        self.transients.len()
    }

    fn upload<D: RayTracingDevice>(
        &mut self,
        device: &mut D,
        tracker: &mut ResourceStateTracker,
        label: &'static str,
        usage: BufferUsage,
        bytes: &[u8],
    ) -> Result<BufferHandle> {
        let buffer = device.create_buffer(&BufferDesc {
            label,
            size: bytes.len() as u64,
            location: MemoryLocation::Upload,
            usage,
            initial_state: ResourceState::GenericRead,
        })?;
        device.write_buffer(buffer, 0, bytes)?;
        tracker.register(buffer, ResourceState::GenericRead);
        Ok(buffer)
    }

    fn record_build<D: RayTracingDevice>(
        &mut self,
        device: &mut D,
        tracker: &mut ResourceStateTracker,
        list: &mut CommandList,
        level: AccelerationStructureLevel,
        inputs: GeometryInputs,
    ) -> Result<(AccelerationStructureBuffers, u64)> {
        let sizes = device.acceleration_structure_prebuild_info(level, &inputs)?;

        let scratch = device.create_buffer(&BufferDesc {
            label: "acceleration structure scratch",
            size: sizes.scratch_size,
            location: MemoryLocation::DeviceLocal,
            usage: BufferUsage::AccelerationStructureScratch,
            initial_state: ResourceState::UnorderedAccess,
        })?;
        self.transients.push(scratch);
        tracker.register(scratch, ResourceState::UnorderedAccess);

        let result = device.create_buffer(&BufferDesc {
            label: "acceleration structure",
            size: sizes.result_size,
            location: MemoryLocation::DeviceLocal,
            usage: BufferUsage::AccelerationStructure,
            initial_state: ResourceState::AccelerationStructure,
        })?;
        tracker.register(result, ResourceState::AccelerationStructure);

        list.record(Command::BuildAccelerationStructure(BuildAccelerationStructure {
            level,
            inputs,
            scratch,
            result,
        }));
        // Written here, read by every later build and dispatch.
        tracker.uav_barrier(list, result)?;

        Ok((
            AccelerationStructureBuffers {
                scratch,
                result,
                instance_descriptors: None,
            },
            sizes.result_size,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Barrier;
    use crate::resource_state::ResourceId;

    #[test]
    fn instance_descriptor_matches_the_hardware_layout() {
        assert_eq!(std::mem::size_of::<InstanceDescriptor>(), 64);
        assert_eq!(std::mem::size_of::<Aabb>(), 24);

        let transform = glm::translate(&glm::Mat4::identity(), &glm::vec3(2.0, 3.0, 4.0));
        let descriptor = InstanceDescriptor::new(&transform, 7, 0xff, 1, 0x04, 0xdead_0000);
        assert_eq!(descriptor.instance_id(), 7);
        assert_eq!(descriptor.mask(), 0xff);
        assert_eq!(descriptor.hit_group_offset(), 1);
        assert_eq!(descriptor.flags(), 0x04);
        assert_eq!(
            descriptor.transform,
            [1.0, 0.0, 0.0, 2.0, 0.0, 1.0, 0.0, 3.0, 0.0, 0.0, 1.0, 4.0]
        );
    }

    #[test]
    fn instance_id_is_truncated_to_24_bits() {
        let descriptor =
            InstanceDescriptor::new(&glm::Mat4::identity(), 0x0100_0001, 0x0f, 0, 0, 0);
        assert_eq!(descriptor.instance_id(), 1);
        assert_eq!(descriptor.mask(), 0x0f);
    }

    #[test]
    fn each_build_is_followed_by_a_uav_barrier_on_its_result() {
        use crate::headless::{GpuProgress, HeadlessDevice};

        let mut device = HeadlessDevice::new(4, 4, 2, GpuProgress::Immediate);
        let mut tracker = ResourceStateTracker::new();
        let allocator = device.create_command_allocator().unwrap();
        let mut list = CommandList::new();
        list.begin(allocator);

        let mut builder = AccelerationStructureBuilder::new();
        let (bottom, top) = builder
            .build_scene(&mut device, &mut tracker, &mut list, &SphereScene::default())
            .unwrap();

        let commands = list.commands();
        assert_eq!(commands.len(), 4);
        assert!(matches!(
            commands[0],
            Command::BuildAccelerationStructure(BuildAccelerationStructure {
                level: AccelerationStructureLevel::Bottom,
                ..
            })
        ));
        assert_eq!(
            commands[1],
            Command::Barrier(Barrier::Uav {
                resource: ResourceId::Buffer(bottom.result())
            })
        );
        assert_eq!(
            commands[3],
            Command::Barrier(Barrier::Uav {
                resource: ResourceId::Buffer(top.result())
            })
        );
        assert_eq!(top.instance_count(), 4);
        // aabbs and both scratch buffers
        assert_eq!(builder.transient_count(), 3);
        assert!(top.instance_descriptors().is_some());
    }
}
