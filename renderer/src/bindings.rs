//! Resources bound once for every dispatch, and the per-frame constants.

use bytemuck::{Pod, Zeroable};
use nalgebra_glm as glm;
use rand::{Rng, SeedableRng};

use crate::acceleration_structure::{BottomLevel, TopLevel};
use crate::commands::{Command, CommandList};
use crate::device::{
    BindingKind, BindingLayout, BindingResource, BindingSetDesc, BindingSetHandle, BindingSlot,
    BufferDesc, BufferHandle, BufferUsage, MemoryLocation, PipelineHandle, RayTracingDevice,
    TextureDesc, TextureFormat, TextureHandle, TextureUsage,
};
use crate::error::{RenderError, Result};
use crate::fence::{Fence, Ticket};
use crate::resource_state::{ResourceState, ResourceStateTracker};
use crate::scene::SphereScene;
use crate::shader_table::align_up;
use crate::upload;

pub mod binding {
    pub const SCENE: u32 = 0;
    pub const OUTPUT: u32 = 1;
    pub const CONSTANTS: u32 = 2;
    pub const SPHERES: u32 = 3;
    pub const MATERIALS: u32 = 4;
    pub const NOISE: u32 = 5;
}

pub const CONSTANTS_ALIGNMENT: u64 = 256;

pub fn binding_layout() -> BindingLayout {
    let slot = |binding, kind| BindingSlot { binding, kind };
    BindingLayout {
        slots: vec![
            slot(binding::SCENE, BindingKind::AccelerationStructure),
            slot(binding::OUTPUT, BindingKind::StorageTexture),
            slot(binding::CONSTANTS, BindingKind::DynamicConstantBuffer),
            slot(binding::SPHERES, BindingKind::StorageBuffer),
            slot(binding::MATERIALS, BindingKind::StorageBuffer),
            slot(binding::NOISE, BindingKind::SampledTexture),
        ],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct RayTracingConstants {
    pub camera_position: [f32; 3],
    _padding: f32,
    /// Column-major.
    pub view_projection_inverse: [f32; 16],
    pub textures_offset: u32,
    pub spheres_offset: u32,
    pub materials_offset: u32,
    pub random_numbers_index: u32,
}

impl RayTracingConstants {
    pub fn new(view_projection: &glm::Mat4, eye: &glm::Vec3, random_numbers_index: u32) -> Self {
        let mut view_projection_inverse = [0.0; 16];
        view_projection_inverse.copy_from_slice(glm::inverse(view_projection).as_slice());
        Self {
            camera_position: [eye.x, eye.y, eye.z],
            _padding: 0.0,
            view_projection_inverse,
            textures_offset: binding::NOISE,
            spheres_offset: binding::SPHERES,
            materials_offset: binding::MATERIALS,
            random_numbers_index,
        }
    }
}

pub struct GlobalBindings {
    constants: BufferHandle,
    constants_stride: u64,
    slots: usize,
    spheres: BufferHandle,
    materials: BufferHandle,
    noise: TextureHandle,
    output: TextureHandle,
    structures: Option<(BottomLevel, TopLevel)>,
    binding_set: Option<BindingSetHandle>,
}

impl GlobalBindings {
    pub fn new<D: RayTracingDevice>(
        device: &mut D,
        tracker: &mut ResourceStateTracker,
        scene: &SphereScene,
        width: u32,
        height: u32,
        slots: usize,
    ) -> Result<Self> {
        let constants_stride = align_up(
            std::mem::size_of::<RayTracingConstants>() as u64,
            CONSTANTS_ALIGNMENT,
        );
        let constants = device.create_buffer(&BufferDesc {
            label: "constants",
            size: constants_stride * slots as u64,
            location: MemoryLocation::Upload,
            usage: BufferUsage::Constants,
            initial_state: ResourceState::GenericRead,
        })?;

        let spheres = Self::storage_buffer(
            device,
            "spheres",
            bytemuck::cast_slice(&scene.sphere_infos()),
        )?;
        let materials =
            Self::storage_buffer(device, "materials", bytemuck::cast_slice(&scene.materials))?;

        let output = device.create_texture(&TextureDesc {
            label: "output",
            width,
            height,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::Storage,
            initial_state: ResourceState::CopySource,
        })?;
        tracker.register(output, ResourceState::CopySource);

        let noise = device.create_texture(&TextureDesc {
            label: "noise",
            width,
            height,
            format: TextureFormat::Rgba32Float,
            usage: TextureUsage::Sampled,
            initial_state: ResourceState::GenericRead,
        })?;
        tracker.register(noise, ResourceState::GenericRead);

        for buffer in [constants, spheres, materials] {
            tracker.register(buffer, ResourceState::GenericRead);
        }

        Ok(Self {
            constants,
            constants_stride,
            slots,
            spheres,
            materials,
            noise,
            output,
            structures: None,
            binding_set: None,
        })
    }

    fn storage_buffer<D: RayTracingDevice>(
        device: &mut D,
        label: &'static str,
        bytes: &[u8],
    ) -> Result<BufferHandle> {
        let buffer = device.create_buffer(&BufferDesc {
            label,
            size: bytes.len() as u64,
            location: MemoryLocation::Upload,
            usage: BufferUsage::Storage,
            initial_state: ResourceState::GenericRead,
        })?;
        device.write_buffer(buffer, 0, bytes)?;
        Ok(buffer)
    }

    /// Fills the noise texture with seeded random values. Submits and flushes.
    pub fn upload_noise<D: RayTracingDevice>(
        &self,
        device: &mut D,
        tracker: &mut ResourceStateTracker,
        fence: &mut Fence,
        list: &mut CommandList,
        width: u32,
        height: u32,
        seed: u64,
    ) -> Result<Ticket> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let noise: Vec<f32> = (0..width as usize * height as usize * 4)
            .map(|_| rng.gen::<f32>())
            .collect();

        let texture = self.noise;
        let ((), ticket) = upload::with_staging(
            device,
            fence,
            list,
            bytemuck::cast_slice(&noise),
            |_, list, staging| {
                tracker.transition(
                    list,
                    texture,
                    ResourceState::GenericRead,
                    ResourceState::CopyDestination,
                )?;
                list.record(Command::CopyBufferToTexture {
                    source: staging,
                    destination: texture,
                });
                tracker.transition(
                    list,
                    texture,
                    ResourceState::CopyDestination,
                    ResourceState::GenericRead,
                )?;
                Ok(())
            },
        )?;
        log::info!("noise texture uploaded ({}x{})", width, height);
        Ok(ticket)
    }

    pub fn attach_acceleration_structures(&mut self, bottom: BottomLevel, top: TopLevel) {
        self.structures = Some((bottom, top));
    }

    pub fn top_level(&self) -> Option<&TopLevel> {
        self.structures.as_ref().map(|(_, top)| top)
    }

    pub fn bottom_level(&self) -> Option<&BottomLevel> {
        self.structures.as_ref().map(|(bottom, _)| bottom)
    }

    pub fn create_binding_set<D: RayTracingDevice>(
        &mut self,
        device: &mut D,
        pipeline: PipelineHandle,
    ) -> Result<BindingSetHandle> {
        let top = self.top_level().ok_or_else(|| {
            RenderError::InvalidPipeline("no top level attached to the bindings".into())
        })?;

        let desc = BindingSetDesc {
            entries: vec![
                (
                    binding::SCENE,
                    BindingResource::AccelerationStructure(top.result()),
                ),
                (binding::OUTPUT, BindingResource::StorageTexture(self.output)),
                (
                    binding::CONSTANTS,
                    BindingResource::DynamicConstantBuffer {
                        buffer: self.constants,
                        range: std::mem::size_of::<RayTracingConstants>() as u64,
                    },
                ),
                (binding::SPHERES, BindingResource::StorageBuffer(self.spheres)),
                (
                    binding::MATERIALS,
                    BindingResource::StorageBuffer(self.materials),
                ),
                (binding::NOISE, BindingResource::SampledTexture(self.noise)),
            ],
        };
        let set = device.create_binding_set(pipeline, &desc)?;
        self.binding_set = Some(set);
        Ok(set)
    }

    pub fn binding_set(&self) -> Option<BindingSetHandle> {
        self.binding_set
    }

    pub fn constants_offset(&self, slot: usize) -> u64 {
        self.constants_stride * slot as u64
    }

    /// Writes into the region owned by `slot`. The caller guarantees the
    /// slot's previous frame has retired.
    pub fn write_constants<D: RayTracingDevice>(
        &self,
        device: &mut D,
        slot: usize,
        constants: &RayTracingConstants,
    ) -> Result<u64> {
        debug_assert!(slot < self.slots);
        let offset = self.constants_offset(slot);
        device.write_buffer(self.constants, offset, bytemuck::bytes_of(constants))?;
        Ok(offset)
    }

    pub fn materials_address<D: RayTracingDevice>(&self, device: &D) -> Result<u64> {
        device.buffer_address(self.materials)
    }

    pub fn constants(&self) -> BufferHandle {
        self.constants
    }

    pub fn output(&self) -> TextureHandle {
        self.output
    }

    pub fn noise(&self) -> TextureHandle {
        self.noise
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_layout() {
        assert_eq!(std::mem::size_of::<RayTracingConstants>(), 96);
        assert_eq!(
            offset_of_view_projection_inverse(),
            16,
            "the matrix must start on a 16 byte boundary"
        );
    }

    fn offset_of_view_projection_inverse() -> usize {
        let constants = RayTracingConstants::zeroed();
        let base = &constants as *const _ as usize;
        let field = &constants.view_projection_inverse as *const _ as usize;
        field - base
    }

    #[test]
    fn constants_store_the_inverse_view_projection() {
        let view_projection = glm::scale(&glm::Mat4::identity(), &glm::vec3(2.0, 4.0, 8.0));
        let constants =
            RayTracingConstants::new(&view_projection, &glm::vec3(1.0, 2.0, 3.0), 9);
        assert_eq!(constants.view_projection_inverse[0], 0.5);
        assert_eq!(constants.view_projection_inverse[5], 0.25);
        assert_eq!(constants.view_projection_inverse[10], 0.125);
        assert_eq!(constants.camera_position, [1.0, 2.0, 3.0]);
        assert_eq!(constants.random_numbers_index, 9);
        assert_eq!(constants.spheres_offset, binding::SPHERES);
    }

    #[test]
    fn layout_has_one_slot_per_binding() {
        let layout = binding_layout();
        let mut bindings: Vec<u32> = layout.slots.iter().map(|slot| slot.binding).collect();
        bindings.dedup();
        assert_eq!(bindings, vec![0, 1, 2, 3, 4, 5]);
    }
}
