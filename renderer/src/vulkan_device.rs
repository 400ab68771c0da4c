//! The hardware device: Vulkan ray tracing through `vk_utils`.
//!
//! Resource states become image layouts, UAV barriers become global
//! acceleration structure memory barriers and the ticket counter is a
//! timeline semaphore.

use std::collections::HashMap;
use std::ffi::CStr;

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use slotmap::SlotMap;

use vk_utils::buffer_resource::BufferResource;
use vk_utils::command_buffer::{color_image_transition, memory_barrier, CommandAllocator, LayoutUsage};
use vk_utils::device_context::DeviceContext;
use vk_utils::error::VkCallError;
use vk_utils::image_resource::Image2DResource;
use vk_utils::shader_library::create_shader_module;
use vk_utils::swapchain::Swapchain;
use vk_utils::timeline::TimelineSemaphore;
use vk_utils::vk_check;
use vk_utils::vk_instance::Vulkan;

use crate::acceleration_structure::AccelerationStructureLevel;
use crate::commands::{Barrier, BuildAccelerationStructure, Command, GeometryInputs, TableRegion};
use crate::config::RendererConfig;
use crate::device::{
    AllocatorHandle, BindingKind, BindingResource, BindingSetDesc, BindingSetHandle, BufferDesc,
    BufferHandle, BufferUsage, DeviceCapabilities, MemoryLocation, PipelineHandle, PrebuildInfo,
    RayTracingDevice, ShaderIdentifier, TextureDesc, TextureFormat, TextureHandle, TextureUsage,
    TextureViewHandle,
};
use crate::error::{DeviceCallError, RenderError, Result};
use crate::pipeline::{HitGroupKind, PipelineDesc, PipelineSubobject, ShaderStage};
use crate::resource_state::{ResourceId, ResourceState};

fn entry_point() -> &'static CStr {
    unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") }
}

fn layout_usage(state: ResourceState) -> LayoutUsage {
    use vk::{AccessFlags as A, ImageLayout as L, PipelineStageFlags as S};
    let (layout, access, stage) = match state {
        ResourceState::Common => (L::GENERAL, A::MEMORY_READ, S::ALL_COMMANDS),
        ResourceState::CopySource => (L::TRANSFER_SRC_OPTIMAL, A::TRANSFER_READ, S::TRANSFER),
        ResourceState::CopyDestination => {
            (L::TRANSFER_DST_OPTIMAL, A::TRANSFER_WRITE, S::TRANSFER)
        }
        ResourceState::UnorderedAccess => (
            L::GENERAL,
            A::SHADER_READ | A::SHADER_WRITE,
            S::RAY_TRACING_SHADER_KHR,
        ),
        ResourceState::RenderTarget => (
            L::COLOR_ATTACHMENT_OPTIMAL,
            A::COLOR_ATTACHMENT_WRITE,
            S::COLOR_ATTACHMENT_OUTPUT,
        ),
        ResourceState::Present => (L::PRESENT_SRC_KHR, A::empty(), S::ALL_COMMANDS),
        ResourceState::GenericRead => (
            L::SHADER_READ_ONLY_OPTIMAL,
            A::SHADER_READ,
            S::RAY_TRACING_SHADER_KHR,
        ),
        ResourceState::AccelerationStructure => (
            L::GENERAL,
            A::ACCELERATION_STRUCTURE_READ_KHR,
            S::ACCELERATION_STRUCTURE_BUILD_KHR | S::RAY_TRACING_SHADER_KHR,
        ),
    };
    LayoutUsage {
        layout,
        access,
        stage,
    }
}

fn buffer_usage_flags(usage: BufferUsage) -> vk::BufferUsageFlags {
    use vk::BufferUsageFlags as F;
    match usage {
        BufferUsage::Geometry | BufferUsage::InstanceDescriptors => {
            F::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR | F::STORAGE_BUFFER
        }
        BufferUsage::AccelerationStructureScratch => F::STORAGE_BUFFER,
        BufferUsage::AccelerationStructure => F::ACCELERATION_STRUCTURE_STORAGE_KHR,
        BufferUsage::ShaderTable => F::SHADER_BINDING_TABLE_KHR,
        BufferUsage::Constants => F::UNIFORM_BUFFER,
        BufferUsage::Storage => F::STORAGE_BUFFER,
        BufferUsage::Staging => F::TRANSFER_SRC,
    }
}

fn texture_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
    }
}

fn descriptor_type(kind: BindingKind) -> vk::DescriptorType {
    match kind {
        BindingKind::AccelerationStructure => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        BindingKind::StorageTexture => vk::DescriptorType::STORAGE_IMAGE,
        BindingKind::DynamicConstantBuffer => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        BindingKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        BindingKind::SampledTexture => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
    }
}

fn shader_stage_flags(stage: ShaderStage) -> vk::ShaderStageFlags {
    match stage {
        ShaderStage::RayGeneration => vk::ShaderStageFlags::RAYGEN_KHR,
        ShaderStage::Miss => vk::ShaderStageFlags::MISS_KHR,
        ShaderStage::Intersection => vk::ShaderStageFlags::INTERSECTION_KHR,
        ShaderStage::AnyHit => vk::ShaderStageFlags::ANY_HIT_KHR,
        ShaderStage::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
    }
}

fn structure_type(level: AccelerationStructureLevel) -> vk::AccelerationStructureTypeKHR {
    match level {
        AccelerationStructureLevel::Bottom => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        AccelerationStructureLevel::Top => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
    }
}

enum TextureImage {
    Owned(Image2DResource),
    Swapchain(usize),
}

struct Texture {
    image: TextureImage,
    desc: TextureDesc,
    // Until the first barrier the image contents are undefined.
    initialized: bool,
}

struct Allocator {
    allocator: CommandAllocator,
    last_signal: Option<u64>,
}

struct PipelineObjects {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    set_layout: vk::DescriptorSetLayout,
    slots: Vec<(u32, BindingKind)>,
    identifiers: HashMap<String, ShaderIdentifier>,
}

struct AcquiredImage {
    index: u32,
    semaphore_slot: usize,
    // Taken by the first submission that waits on it.
    wait: Option<vk::Semaphore>,
}

/// Per acquire semaphore, the timeline value that retires the last
/// submission waiting on it. Zero when nothing is pending.
struct AcquireWaits(Vec<u64>);

impl AcquireWaits {
    fn new(count: usize) -> Self {
        Self(vec![0; count])
    }

    fn retired_at(&self, slot: usize) -> u64 {
        self.0[slot]
    }

    fn waited(&mut self, slot: usize, value: u64) {
        self.0[slot] = value;
    }
}

struct BindingSetObjects {
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
}

pub struct VulkanDevice {
    capabilities: DeviceCapabilities,
    buffers: SlotMap<BufferHandle, BufferResource>,
    structures: HashMap<BufferHandle, vk::AccelerationStructureKHR>,
    textures: SlotMap<TextureHandle, Texture>,
    views: SlotMap<TextureViewHandle, vk::ImageView>,
    allocators: SlotMap<AllocatorHandle, Allocator>,
    pipelines: SlotMap<PipelineHandle, PipelineObjects>,
    binding_sets: SlotMap<BindingSetHandle, BindingSetObjects>,
    sampler: vk::Sampler,
    targets: Vec<TextureHandle>,
    acquired: Option<AcquiredImage>,
    acquire_waits: AcquireWaits,
    last_signal: u64,
    // Declaration order is teardown order.
    timeline: TimelineSemaphore,
    swapchain: Swapchain,
    context: DeviceContext,
    vulkan: Vulkan,
}

impl VulkanDevice {
    pub fn new(
        config: &RendererConfig,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<Self> {
        let vulkan = Vulkan::new("tracey", Some(display), config.validation)?;

        let mut rejected = Vec::new();
        let mut candidates = Vec::new();
        for gpu in vulkan.hardware_devices_with_queue_support(vk::QueueFlags::GRAPHICS)? {
            match gpu.missing_ray_tracing_support() {
                Some(reason) => rejected.push(format!("{}: {}", gpu.name(), reason)),
                None => candidates.push(gpu),
            }
        }
        candidates.sort_by_key(|gpu| !gpu.is_discrete());
        let gpu = match candidates.into_iter().next() {
            Some(gpu) => gpu,
            None => return Err(RenderError::CapabilityMissing(rejected.join("; "))),
        };
        log::info!("selected {}", gpu.name());

        let properties = *gpu.ray_tracing_properties();
        let capabilities = DeviceCapabilities {
            adapter_name: gpu.name(),
            shader_identifier_size: properties.shader_group_handle_size,
            shader_record_alignment: properties.shader_group_handle_alignment,
            shader_table_alignment: properties.shader_group_base_alignment,
            max_recursion_depth: properties.max_ray_recursion_depth,
        };

        let context = DeviceContext::new(gpu)?;
        let swapchain = Swapchain::new(
            &vulkan,
            &context,
            display,
            window,
            config.width,
            config.height,
        )?;
        let timeline = TimelineSemaphore::new(context.vk_device(), 0)?;

        let sampler_info = vk::SamplerCreateInfo::builder()
            .min_filter(vk::Filter::NEAREST)
            .mag_filter(vk::Filter::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT);
        let sampler = vk_check!(unsafe { context.vk_device().create_sampler(&sampler_info, None) })?;

        let mut textures = SlotMap::with_key();
        let targets = (0..swapchain.image_count())
            .map(|index| {
                textures.insert(Texture {
                    image: TextureImage::Swapchain(index),
                    desc: TextureDesc {
                        label: "swapchain image",
                        width: swapchain.width(),
                        height: swapchain.height(),
                        format: TextureFormat::Rgba8Unorm,
                        usage: TextureUsage::Present,
                        initial_state: ResourceState::Present,
                    },
                    initialized: false,
                })
            })
            .collect();

        Ok(Self {
            capabilities,
            buffers: SlotMap::with_key(),
            structures: HashMap::new(),
            textures,
            views: SlotMap::with_key(),
            allocators: SlotMap::with_key(),
            pipelines: SlotMap::with_key(),
            binding_sets: SlotMap::with_key(),
            sampler,
            targets,
            acquired: None,
            acquire_waits: AcquireWaits::new(swapchain.image_count()),
            last_signal: 0,
            timeline,
            swapchain,
            context,
            vulkan,
        })
    }

    fn device(&self) -> &ash::Device {
        self.context.vk_device()
    }

    /// Attaches queued validation messages, and reports a lost device as removed.
    fn failure(&self, error: VkCallError) -> RenderError {
        if error.is_device_lost() {
            return RenderError::DeviceRemoved {
                reason: format!("{} returned {:?}", error.call, error.result),
            };
        }
        DeviceCallError::from(error)
            .with_debug_messages(self.vulkan.drain_messages())
            .into()
    }

    fn check<T>(&self, result: std::result::Result<T, VkCallError>) -> Result<T> {
        result.map_err(|error| self.failure(error))
    }

    #[track_caller]
    fn misuse(&self, call: &str, message: impl Into<String>) -> RenderError {
        DeviceCallError::at_caller(call, message)
            .with_debug_messages(self.vulkan.drain_messages())
            .into()
    }

    fn buffer(&self, handle: BufferHandle) -> Result<&BufferResource> {
        self.buffers
            .get(handle)
            .ok_or_else(|| self.misuse("buffer", "unknown buffer"))
    }

    fn image(&self, handle: TextureHandle) -> Result<(vk::Image, vk::ImageView, vk::Format)> {
        let texture = self
            .textures
            .get(handle)
            .ok_or_else(|| self.misuse("texture", "unknown texture"))?;
        Ok(match &texture.image {
            TextureImage::Owned(image) => (image.vk_image(), image.view(), image.format()),
            TextureImage::Swapchain(index) => (
                self.swapchain.images()[*index],
                self.swapchain.image_view(*index),
                self.swapchain.format(),
            ),
        })
    }

    fn geometry(&self, inputs: &GeometryInputs) -> Result<vk::AccelerationStructureGeometryKHR> {
        let address = vk::DeviceOrHostAddressConstKHR {
            device_address: self.buffer(inputs.buffer())?.device_address(),
        };
        let (geometry_type, data) = match *inputs {
            GeometryInputs::ProceduralAabbs { stride, .. } => (
                vk::GeometryTypeKHR::AABBS,
                vk::AccelerationStructureGeometryDataKHR {
                    aabbs: vk::AccelerationStructureGeometryAabbsDataKHR::builder()
                        .data(address)
                        .stride(stride)
                        .build(),
                },
            ),
            GeometryInputs::Instances { .. } => (
                vk::GeometryTypeKHR::INSTANCES,
                vk::AccelerationStructureGeometryDataKHR {
                    instances: vk::AccelerationStructureGeometryInstancesDataKHR::builder()
                        .data(address)
                        .build(),
                },
            ),
        };
        Ok(vk::AccelerationStructureGeometryKHR::builder()
            .geometry_type(geometry_type)
            .geometry(data)
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .build())
    }

    fn structure(
        &mut self,
        result: BufferHandle,
        level: AccelerationStructureLevel,
    ) -> Result<vk::AccelerationStructureKHR> {
        if let Some(structure) = self.structures.get(&result) {
            return Ok(*structure);
        }
        let buffer = self.buffer(result)?;
        let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .buffer(buffer.buffer)
            .size(buffer.size())
            .ty(structure_type(level));
        let structure = vk_check!(unsafe {
            self.context
                .acceleration_structure()
                .create_acceleration_structure(&create_info, None)
        });
        let structure = self.check(structure)?;
        self.structures.insert(result, structure);
        Ok(structure)
    }

    fn region(&self, region: &TableRegion) -> Result<vk::StridedDeviceAddressRegionKHR> {
        Ok(vk::StridedDeviceAddressRegionKHR {
            device_address: self.buffer(region.buffer)?.device_address() + region.offset,
            stride: region.stride,
            size: region.size,
        })
    }

    fn record(
        &mut self,
        command_buffer: vk::CommandBuffer,
        command: &Command,
        bound: &mut Option<PipelineHandle>,
    ) -> Result<()> {
        let device = self.context.vk_device().clone();
        match *command {
            Command::Barrier(Barrier::Transition {
                resource: ResourceId::Texture(texture),
                from,
                to,
            }) => {
                let (image, _, _) = self.image(texture)?;
                let initialized = self
                    .textures
                    .get_mut(texture)
                    .map(|texture| std::mem::replace(&mut texture.initialized, true))
                    .unwrap_or(true);
                let source = if initialized {
                    layout_usage(from)
                } else {
                    LayoutUsage {
                        layout: vk::ImageLayout::UNDEFINED,
                        access: vk::AccessFlags::empty(),
                        stage: vk::PipelineStageFlags::TOP_OF_PIPE,
                    }
                };
                color_image_transition(&device, command_buffer, image, source, layout_usage(to));
            }
            Command::Barrier(Barrier::Transition {
                resource: ResourceId::Buffer(_),
                from,
                to,
            }) => {
                let (from, to) = (layout_usage(from), layout_usage(to));
                memory_barrier(
                    &device,
                    command_buffer,
                    (from.access, from.stage),
                    (to.access, to.stage),
                );
            }
            Command::Barrier(Barrier::Uav { .. }) => {
                memory_barrier(
                    &device,
                    command_buffer,
                    (
                        vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR
                            | vk::AccessFlags::SHADER_WRITE,
                        vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR
                            | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                    ),
                    (
                        vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
                            | vk::AccessFlags::SHADER_READ,
                        vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR
                            | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                    ),
                );
            }
            Command::BuildAccelerationStructure(build) => {
                self.record_build(command_buffer, &build)?;
            }
            Command::SetPipeline(pipeline) => {
                let objects = self
                    .pipelines
                    .get(pipeline)
                    .ok_or_else(|| self.misuse("SetPipeline", "unknown pipeline"))?;
                unsafe {
                    device.cmd_bind_pipeline(
                        command_buffer,
                        vk::PipelineBindPoint::RAY_TRACING_KHR,
                        objects.pipeline,
                    )
                };
                *bound = Some(pipeline);
            }
            Command::BindGlobals {
                bindings,
                constants_offset,
            } => {
                let layout = bound
                    .and_then(|pipeline| self.pipelines.get(pipeline))
                    .map(|objects| objects.layout)
                    .ok_or_else(|| self.misuse("BindGlobals", "no pipeline is set"))?;
                let set = self
                    .binding_sets
                    .get(bindings)
                    .ok_or_else(|| self.misuse("BindGlobals", "unknown binding set"))?
                    .set;
                unsafe {
                    device.cmd_bind_descriptor_sets(
                        command_buffer,
                        vk::PipelineBindPoint::RAY_TRACING_KHR,
                        layout,
                        0,
                        &[set],
                        &[constants_offset as u32],
                    )
                };
            }
            Command::DispatchRays(desc) => {
                let ray_generation = self.region(&desc.ray_generation)?;
                let miss = self.region(&desc.miss)?;
                let hit_group = self.region(&desc.hit_group)?;
                let callable = vk::StridedDeviceAddressRegionKHR::default();
                unsafe {
                    self.context.ray_tracing().cmd_trace_rays(
                        command_buffer,
                        &ray_generation,
                        &miss,
                        &hit_group,
                        &callable,
                        desc.width,
                        desc.height,
                        desc.depth,
                    )
                };
            }
            Command::CopyTexture {
                source,
                destination,
            } => {
                self.record_texture_copy(command_buffer, source, destination)?;
            }
            Command::CopyBufferToTexture {
                source,
                destination,
            } => {
                let buffer = self.buffer(source)?.buffer;
                let (image, _, _) = self.image(destination)?;
                let desc = &self.textures[destination].desc;
                let region = vk::BufferImageCopy::builder()
                    .image_subresource(vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    })
                    .image_extent(vk::Extent3D {
                        width: desc.width,
                        height: desc.height,
                        depth: 1,
                    })
                    .build();
                unsafe {
                    device.cmd_copy_buffer_to_image(
                        command_buffer,
                        buffer,
                        image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    )
                };
            }
        }
        Ok(())
    }

    fn record_build(
        &mut self,
        command_buffer: vk::CommandBuffer,
        build: &BuildAccelerationStructure,
    ) -> Result<()> {
        let destination = self.structure(build.result, build.level)?;
        let geometries = [self.geometry(&build.inputs)?];
        let info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(structure_type(build.level))
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .dst_acceleration_structure(destination)
            .geometries(&geometries)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: self.buffer(build.scratch)?.device_address(),
            })
            .build();
        let ranges = [vk::AccelerationStructureBuildRangeInfoKHR::builder()
            .primitive_count(build.inputs.count())
            .build()];
        unsafe {
            self.context
                .acceleration_structure()
                .cmd_build_acceleration_structures(command_buffer, &[info], &[&ranges])
        };
        Ok(())
    }

    fn record_texture_copy(
        &mut self,
        command_buffer: vk::CommandBuffer,
        source: TextureHandle,
        destination: TextureHandle,
    ) -> Result<()> {
        let (source_image, _, source_format) = self.image(source)?;
        let (destination_image, _, destination_format) = self.image(destination)?;
        let extent = |handle: TextureHandle| {
            let desc = &self.textures[handle].desc;
            (desc.width, desc.height)
        };
        let (source_width, source_height) = extent(source);
        let (destination_width, destination_height) = extent(destination);
        let layers = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let device = self.device();

        if source_format == destination_format
            && (source_width, source_height) == (destination_width, destination_height)
        {
            let region = vk::ImageCopy::builder()
                .src_subresource(layers)
                .dst_subresource(layers)
                .extent(vk::Extent3D {
                    width: source_width,
                    height: source_height,
                    depth: 1,
                })
                .build();
            unsafe {
                device.cmd_copy_image(
                    command_buffer,
                    source_image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    destination_image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                )
            };
        } else {
            // Swapchain formats and extents need not match the output.
            let corner = |width: u32, height: u32| vk::Offset3D {
                x: width as i32,
                y: height as i32,
                z: 1,
            };
            let region = vk::ImageBlit::builder()
                .src_subresource(layers)
                .src_offsets([vk::Offset3D::default(), corner(source_width, source_height)])
                .dst_subresource(layers)
                .dst_offsets([
                    vk::Offset3D::default(),
                    corner(destination_width, destination_height),
                ])
                .build();
            unsafe {
                device.cmd_blit_image(
                    command_buffer,
                    source_image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    destination_image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                    vk::Filter::NEAREST,
                )
            };
        }
        Ok(())
    }

    fn submit(
        &self,
        command_buffers: &[vk::CommandBuffer],
        wait: Option<vk::Semaphore>,
        signal_binary: Option<vk::Semaphore>,
        timeline_value: Option<u64>,
    ) -> std::result::Result<(), VkCallError> {
        let wait_semaphores: Vec<vk::Semaphore> = wait.into_iter().collect();
        let wait_values = vec![0u64; wait_semaphores.len()];
        let wait_stages = vec![vk::PipelineStageFlags::TRANSFER; wait_semaphores.len()];

        let mut signal_semaphores = Vec::new();
        let mut signal_values = Vec::new();
        if let Some(value) = timeline_value {
            signal_semaphores.push(self.timeline.native_handle());
            signal_values.push(value);
        }
        if let Some(semaphore) = signal_binary {
            signal_semaphores.push(semaphore);
            signal_values.push(0);
        }

        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::builder()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);
        let submit = vk::SubmitInfo::builder()
            .push_next(&mut timeline_info)
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();
        vk_check!(unsafe {
            self.device()
                .queue_submit(self.context.queue(), &[submit], vk::Fence::null())
        })
    }

    fn writes_to_target(&self, commands: &[Command]) -> bool {
        commands.iter().any(|command| match command {
            Command::CopyTexture { destination, .. }
            | Command::CopyBufferToTexture { destination, .. } => {
                self.targets.contains(destination)
            }
            _ => false,
        })
    }
}

impl RayTracingDevice for VulkanDevice {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<BufferHandle> {
        let properties = match desc.location {
            MemoryLocation::DeviceLocal => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryLocation::Upload => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
        };
        let buffer = BufferResource::new(
            &self.context,
            desc.size,
            properties,
            buffer_usage_flags(desc.usage),
        );
        let buffer = self.check(buffer)?;
        log::trace!("{} buffer: {} bytes", desc.label, desc.size);
        Ok(self.buffers.insert(buffer))
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        if let Some(structure) = self.structures.remove(&buffer) {
            unsafe {
                self.context
                    .acceleration_structure()
                    .destroy_acceleration_structure(structure, None)
            };
        }
        self.buffers
            .remove(buffer)
            .map(drop)
            .ok_or_else(|| self.misuse("destroy_buffer", "unknown buffer"))
    }

    #[track_caller]
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let written = match self.buffers.get_mut(buffer) {
            Some(resource) => resource.write(offset, data),
            None => false,
        };
        if written {
            Ok(())
        } else {
            Err(self.misuse(
                "write_buffer",
                format!("{} bytes at {} do not fit a mapped buffer", data.len(), offset),
            ))
        }
    }

    fn buffer_address(&self, buffer: BufferHandle) -> Result<u64> {
        Ok(self.buffer(buffer)?.device_address())
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureHandle> {
        let usage = match desc.usage {
            TextureUsage::Storage => {
                vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC
            }
            TextureUsage::Sampled => {
                vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST
            }
            TextureUsage::Present => {
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST
            }
        };
        let image = Image2DResource::new(
            &self.context,
            desc.width,
            desc.height,
            texture_format(desc.format),
            usage,
        );
        let image = self.check(image)?;
        Ok(self.textures.insert(Texture {
            image: TextureImage::Owned(image),
            desc: desc.clone(),
            initialized: false,
        }))
    }

    fn create_target_view(&mut self, texture: TextureHandle) -> Result<TextureViewHandle> {
        let (_, view, _) = self.image(texture)?;
        Ok(self.views.insert(view))
    }

    fn present_targets(&self) -> &[TextureHandle] {
        &self.targets
    }

    fn acceleration_structure_prebuild_info(
        &self,
        level: AccelerationStructureLevel,
        geometry: &GeometryInputs,
    ) -> Result<PrebuildInfo> {
        let geometries = [self.geometry(geometry)?];
        let info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(structure_type(level))
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .geometries(&geometries);
        let sizes = unsafe {
            self.context
                .acceleration_structure()
                .get_acceleration_structure_build_sizes(
                    vk::AccelerationStructureBuildTypeKHR::DEVICE,
                    &info,
                    &[geometry.count()],
                )
        };
        Ok(PrebuildInfo {
            result_size: sizes.acceleration_structure_size,
            scratch_size: sizes.build_scratch_size,
        })
    }

    fn acceleration_structure_address(
        &mut self,
        result: BufferHandle,
        level: AccelerationStructureLevel,
    ) -> Result<u64> {
        let structure = self.structure(result, level)?;
        let info = vk::AccelerationStructureDeviceAddressInfoKHR::builder()
            .acceleration_structure(structure);
        Ok(unsafe {
            self.context
                .acceleration_structure()
                .get_acceleration_structure_device_address(&info)
        })
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> Result<PipelineHandle> {
        desc.validate()?;
        let layout_desc = desc
            .root_signature()
            .ok_or_else(|| RenderError::InvalidPipeline("missing root signature".into()))?;
        let device = self.context.vk_device().clone();
        let all_stages = vk::ShaderStageFlags::RAYGEN_KHR
            | vk::ShaderStageFlags::MISS_KHR
            | vk::ShaderStageFlags::INTERSECTION_KHR
            | vk::ShaderStageFlags::CLOSEST_HIT_KHR
            | vk::ShaderStageFlags::ANY_HIT_KHR;

        let bindings: Vec<vk::DescriptorSetLayoutBinding> = layout_desc
            .slots
            .iter()
            .map(|slot| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(slot.binding)
                    .descriptor_type(descriptor_type(slot.kind))
                    .descriptor_count(1)
                    .stage_flags(all_stages)
                    .build()
            })
            .collect();
        let set_layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let set_layout = self.check(vk_check!(unsafe {
            device.create_descriptor_set_layout(&set_layout_info, None)
        }))?;
        let set_layouts = [set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        let layout = self.check(vk_check!(unsafe {
            device.create_pipeline_layout(&layout_info, None)
        }))?;

        let mut modules = Vec::new();
        let mut stages = Vec::new();
        let mut stage_index = HashMap::new();
        for (export, stage, code) in desc.shaders() {
            let module = self.check(create_shader_module(&device, code))?;
            modules.push(module);
            stage_index.insert(export.to_string(), stages.len() as u32);
            stages.push(
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(shader_stage_flags(stage))
                    .module(module)
                    .name(entry_point())
                    .build(),
            );
        }

        let index_of = |name: &Option<String>| {
            name.as_ref()
                .and_then(|name| stage_index.get(name).copied())
                .unwrap_or(vk::SHADER_UNUSED_KHR)
        };
        let mut group_names = Vec::new();
        let mut groups = Vec::new();
        for (export, stage, _) in desc.shaders() {
            if matches!(stage, ShaderStage::RayGeneration | ShaderStage::Miss) {
                group_names.push(export.to_string());
                groups.push(
                    vk::RayTracingShaderGroupCreateInfoKHR::builder()
                        .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                        .general_shader(stage_index[export])
                        .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                        .any_hit_shader(vk::SHADER_UNUSED_KHR)
                        .intersection_shader(vk::SHADER_UNUSED_KHR)
                        .build(),
                );
            }
        }
        for group in desc.hit_groups() {
            if let PipelineSubobject::HitGroup {
                name,
                kind,
                intersection,
                any_hit,
                closest_hit,
            } = group
            {
                let ty = match kind {
                    HitGroupKind::Triangles => vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP,
                    HitGroupKind::ProceduralPrimitive => {
                        vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP
                    }
                };
                group_names.push(name.clone());
                groups.push(
                    vk::RayTracingShaderGroupCreateInfoKHR::builder()
                        .ty(ty)
                        .general_shader(vk::SHADER_UNUSED_KHR)
                        .closest_hit_shader(index_of(closest_hit))
                        .any_hit_shader(index_of(any_hit))
                        .intersection_shader(index_of(intersection))
                        .build(),
                );
            }
        }

        let info = vk::RayTracingPipelineCreateInfoKHR::builder()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(desc.max_recursion_depth().unwrap_or(1))
            .layout(layout)
            .build();
        let created = vk_check!(unsafe {
            self.context.ray_tracing().create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[info],
                None,
            )
        });
        for module in modules {
            unsafe { device.destroy_shader_module(module, None) };
        }
        let pipeline = self.check(created)?[0];

        let handle_size = self.capabilities.shader_identifier_size as usize;
        let handles = self.check(vk_check!(unsafe {
            self.context
                .ray_tracing()
                .get_ray_tracing_shader_group_handles(
                    pipeline,
                    0,
                    groups.len() as u32,
                    groups.len() * handle_size,
                )
        }))?;
        let identifiers = group_names
            .into_iter()
            .zip(handles.chunks(handle_size))
            .map(|(name, handle)| (name, ShaderIdentifier(handle.to_vec())))
            .collect();

        log::info!("ray tracing pipeline with {} groups", groups.len());
        Ok(self.pipelines.insert(PipelineObjects {
            pipeline,
            layout,
            set_layout,
            slots: layout_desc
                .slots
                .iter()
                .map(|slot| (slot.binding, slot.kind))
                .collect(),
            identifiers,
        }))
    }

    #[track_caller]
    fn shader_identifier(&self, pipeline: PipelineHandle, export: &str) -> Result<ShaderIdentifier> {
        self.pipelines
            .get(pipeline)
            .and_then(|objects| objects.identifiers.get(export))
            .cloned()
            .ok_or_else(|| {
                self.misuse(
                    "shader_identifier",
                    format!("pipeline has no group named {}", export),
                )
            })
    }

    fn create_binding_set(
        &mut self,
        pipeline: PipelineHandle,
        desc: &BindingSetDesc,
    ) -> Result<BindingSetHandle> {
        let (set_layout, slots) = match self.pipelines.get(pipeline) {
            Some(objects) => (objects.set_layout, objects.slots.clone()),
            None => return Err(self.misuse("create_binding_set", "unknown pipeline")),
        };

        // Top levels may be bound before anything asked for their address.
        let mut structures = HashMap::new();
        for (_, resource) in &desc.entries {
            if let BindingResource::AccelerationStructure(buffer) = *resource {
                let structure = self.structure(buffer, AccelerationStructureLevel::Top)?;
                structures.insert(buffer, [structure]);
            }
        }

        let device = self.context.vk_device().clone();
        let sizes: Vec<vk::DescriptorPoolSize> = slots
            .iter()
            .map(|(_, kind)| vk::DescriptorPoolSize {
                ty: descriptor_type(*kind),
                descriptor_count: 1,
            })
            .collect();
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(1)
            .pool_sizes(&sizes);
        let pool = self.check(vk_check!(unsafe {
            device.create_descriptor_pool(&pool_info, None)
        }))?;
        let set_layouts = [set_layout];
        let allocate_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&set_layouts);
        let set = self.check(vk_check!(unsafe {
            device.allocate_descriptor_sets(&allocate_info)
        }))?[0];

        // Descriptor infos must outlive the write structs pointing at them.
        let mut buffer_infos = Vec::new();
        let mut image_infos = Vec::new();
        for (binding, resource) in &desc.entries {
            match *resource {
                BindingResource::DynamicConstantBuffer { buffer, range } => buffer_infos.push((
                    *binding,
                    [vk::DescriptorBufferInfo {
                        buffer: self.buffer(buffer)?.buffer,
                        offset: 0,
                        range,
                    }],
                )),
                BindingResource::StorageBuffer(buffer) => buffer_infos.push((
                    *binding,
                    [vk::DescriptorBufferInfo {
                        buffer: self.buffer(buffer)?.buffer,
                        offset: 0,
                        range: vk::WHOLE_SIZE,
                    }],
                )),
                BindingResource::StorageTexture(texture) => image_infos.push((
                    *binding,
                    resource.kind(),
                    [vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: self.image(texture)?.1,
                        image_layout: vk::ImageLayout::GENERAL,
                    }],
                )),
                BindingResource::SampledTexture(texture) => image_infos.push((
                    *binding,
                    resource.kind(),
                    [vk::DescriptorImageInfo {
                        sampler: self.sampler,
                        image_view: self.image(texture)?.1,
                        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    }],
                )),
                BindingResource::AccelerationStructure(_) => {}
            }
        }
        let mut structure_writes: Vec<(u32, vk::WriteDescriptorSetAccelerationStructureKHR)> =
            desc.entries
                .iter()
                .filter_map(|(binding, resource)| match resource {
                    BindingResource::AccelerationStructure(buffer) => {
                        structures.get(buffer).map(|structure| {
                            (
                                *binding,
                                vk::WriteDescriptorSetAccelerationStructureKHR::builder()
                                    .acceleration_structures(structure)
                                    .build(),
                            )
                        })
                    }
                    _ => None,
                })
                .collect();

        let kind_of = |binding: u32| {
            slots
                .iter()
                .find(|(slot, _)| *slot == binding)
                .map(|(_, kind)| descriptor_type(*kind))
                .unwrap_or(vk::DescriptorType::STORAGE_BUFFER)
        };
        let mut writes = Vec::new();
        for (binding, info) in &buffer_infos {
            writes.push(
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(*binding)
                    .descriptor_type(kind_of(*binding))
                    .buffer_info(info)
                    .build(),
            );
        }
        for (binding, kind, info) in &image_infos {
            writes.push(
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(*binding)
                    .descriptor_type(descriptor_type(*kind))
                    .image_info(info)
                    .build(),
            );
        }
        for (binding, structure) in structure_writes.iter_mut() {
            let mut write = vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(*binding)
                .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                .push_next(structure)
                .build();
            write.descriptor_count = 1;
            writes.push(write);
        }
        unsafe { device.update_descriptor_sets(&writes, &[]) };

        Ok(self.binding_sets.insert(BindingSetObjects { pool, set }))
    }

    fn create_command_allocator(&mut self) -> Result<AllocatorHandle> {
        let allocator = self.check(CommandAllocator::new(&self.context))?;
        Ok(self.allocators.insert(Allocator {
            allocator,
            last_signal: None,
        }))
    }

    #[track_caller]
    fn reset_command_allocator(&mut self, allocator: AllocatorHandle) -> Result<()> {
        let completed = self.completed_value()?;
        let entry = match self.allocators.get(allocator) {
            Some(entry) => entry,
            None => return Err(self.misuse("reset_command_allocator", "unknown allocator")),
        };
        if entry.last_signal.map_or(false, |signal| signal > completed) {
            return Err(self.misuse(
                "reset_command_allocator",
                "allocator reset while its work is in flight",
            ));
        }
        self.check(entry.allocator.reset())
    }

    fn execute(
        &mut self,
        allocator: AllocatorHandle,
        commands: &[Command],
        signal_value: u64,
    ) -> Result<()> {
        let command_buffer = {
            let entry = self
                .allocators
                .get(allocator)
                .ok_or_else(|| self.misuse("execute", "unknown allocator"))?;
            self.check(entry.allocator.begin())?;
            entry.allocator.native_handle()
        };

        let mut bound = None;
        for command in commands {
            self.record(command_buffer, command, &mut bound)?;
        }
        self.check(self.allocators[allocator].allocator.end())?;

        let wait = if self.writes_to_target(commands) {
            self.acquired.as_mut().and_then(|acquired| {
                let slot = acquired.semaphore_slot;
                acquired.wait.take().map(|semaphore| (slot, semaphore))
            })
        } else {
            None
        };
        self.check(self.submit(
            &[command_buffer],
            wait.map(|(_, semaphore)| semaphore),
            None,
            Some(signal_value),
        ))?;
        if let Some((slot, _)) = wait {
            self.acquire_waits.waited(slot, signal_value);
        }
        self.allocators[allocator].last_signal = Some(signal_value);
        self.last_signal = signal_value;
        Ok(())
    }

    fn signal(&mut self, value: u64) -> Result<()> {
        self.check(self.submit(&[], None, None, Some(value)))?;
        self.last_signal = value;
        Ok(())
    }

    fn completed_value(&self) -> Result<u64> {
        self.check(self.timeline.value())
    }

    fn wait_for_value(&mut self, value: u64) -> Result<()> {
        self.check(self.timeline.wait(value))
    }

    fn current_target_index(&mut self) -> Result<usize> {
        if let Some(acquired) = &self.acquired {
            return Ok(acquired.index as usize);
        }
        // A binary semaphore is signalled again only after its last wait has executed.
        let semaphore_slot = self.swapchain.next_acquire_semaphore();
        let retired_at = self.acquire_waits.retired_at(semaphore_slot);
        if retired_at > 0 {
            self.check(self.timeline.wait(retired_at))?;
        }
        let acquired = self.swapchain.acquire();
        let (index, semaphore) = self.check(acquired)?;
        self.acquired = Some(AcquiredImage {
            index,
            semaphore_slot,
            wait: Some(semaphore),
        });
        Ok(index as usize)
    }

    fn present(&mut self) -> Result<()> {
        self.current_target_index()?;
        let Some(acquired) = self.acquired.take() else {
            return Err(self.misuse("present", "no image acquired"));
        };
        let signal = self.swapchain.present_semaphore(acquired.index);
        self.check(self.submit(&[], acquired.wait, Some(signal), None))?;
        if acquired.wait.is_some() {
            // No timeline value follows this wait.
            self.check(self.context.wait())?;
            self.acquire_waits.waited(acquired.semaphore_slot, 0);
        }
        self.check(self.swapchain.present(self.context.queue(), acquired.index))
    }

    fn drain_debug_messages(&mut self) -> Vec<String> {
        self.vulkan.drain_messages()
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        if let Err(error) = self.context.wait() {
            log::error!("device wait before teardown failed: {}", error);
        }
        let device = self.context.vk_device().clone();
        unsafe {
            for (_, structure) in self.structures.drain() {
                self.context
                    .acceleration_structure()
                    .destroy_acceleration_structure(structure, None);
            }
            for (_, set) in self.binding_sets.drain() {
                device.destroy_descriptor_pool(set.pool, None);
            }
            for (_, pipeline) in self.pipelines.drain() {
                device.destroy_pipeline(pipeline.pipeline, None);
                device.destroy_pipeline_layout(pipeline.layout, None);
                device.destroy_descriptor_set_layout(pipeline.set_layout, None);
            }
            device.destroy_sampler(self.sampler, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_semaphores_retire_independently() {
        let mut waits = AcquireWaits::new(3);
        waits.waited(1, 7);
        assert_eq!(waits.retired_at(0), 0);
        assert_eq!(waits.retired_at(1), 7);

        waits.waited(1, 0);
        assert_eq!(waits.retired_at(1), 0);
    }

    #[test]
    fn copy_states_map_to_transfer_layouts() {
        assert_eq!(
            layout_usage(ResourceState::CopySource).layout,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        );
        assert_eq!(
            layout_usage(ResourceState::CopyDestination).layout,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        );
        assert_eq!(
            layout_usage(ResourceState::Present).layout,
            vk::ImageLayout::PRESENT_SRC_KHR
        );
        assert_eq!(
            layout_usage(ResourceState::UnorderedAccess).layout,
            vk::ImageLayout::GENERAL
        );
    }

    #[test]
    fn every_binding_kind_has_a_descriptor_type() {
        assert_eq!(
            descriptor_type(BindingKind::DynamicConstantBuffer),
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
        );
        assert_eq!(
            descriptor_type(BindingKind::AccelerationStructure),
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR
        );
    }

    #[test]
    fn scratch_buffers_are_storage_buffers() {
        assert!(buffer_usage_flags(BufferUsage::AccelerationStructureScratch)
            .contains(vk::BufferUsageFlags::STORAGE_BUFFER));
        assert!(buffer_usage_flags(BufferUsage::ShaderTable)
            .contains(vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR));
    }
}
