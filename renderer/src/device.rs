//! The seam between the frame pipeline and a concrete GPU.

use crate::acceleration_structure::AccelerationStructureLevel;
use crate::commands::{Command, GeometryInputs};
use crate::error::Result;
use crate::pipeline::PipelineDesc;
use crate::resource_state::ResourceState;

slotmap::new_key_type! {
    pub struct BufferHandle;
    pub struct TextureHandle;
    pub struct TextureViewHandle;
    pub struct AllocatorHandle;
    pub struct PipelineHandle;
    pub struct BindingSetHandle;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLocation {
    DeviceLocal,
    /// CPU visible and GPU readable, mapped for the lifetime of the buffer.
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    Geometry,
    AccelerationStructureScratch,
    AccelerationStructure,
    InstanceDescriptors,
    ShaderTable,
    Constants,
    Storage,
    Staging,
}

#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub label: &'static str,
    pub size: u64,
    pub location: MemoryLocation,
    pub usage: BufferUsage,
    pub initial_state: ResourceState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba32Float,
}

impl TextureFormat {
    pub fn bytes_per_texel(self) -> u64 {
        match self {
            TextureFormat::Rgba8Unorm => 4,
            TextureFormat::Rgba32Float => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureUsage {
    Storage,
    Sampled,
    Present,
}

#[derive(Debug, Clone)]
pub struct TextureDesc {
    pub label: &'static str,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
    pub initial_state: ResourceState,
}

impl TextureDesc {
    pub fn byte_size(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.format.bytes_per_texel()
    }
}

#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    pub adapter_name: String,
    pub shader_identifier_size: u32,
    /// Every shader record size must be a multiple of this.
    pub shader_record_alignment: u32,
    /// Every shader table region must start at a multiple of this.
    pub shader_table_alignment: u32,
    pub max_recursion_depth: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrebuildInfo {
    pub result_size: u64,
    pub scratch_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderIdentifier(pub Vec<u8>);

impl ShaderIdentifier {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    AccelerationStructure,
    StorageTexture,
    DynamicConstantBuffer,
    StorageBuffer,
    SampledTexture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingSlot {
    pub binding: u32,
    pub kind: BindingKind,
}

/// The global root signature: what the shaders expect at each binding.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BindingLayout {
    pub slots: Vec<BindingSlot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingResource {
    AccelerationStructure(BufferHandle),
    StorageTexture(TextureHandle),
    DynamicConstantBuffer { buffer: BufferHandle, range: u64 },
    StorageBuffer(BufferHandle),
    SampledTexture(TextureHandle),
}

impl BindingResource {
    pub fn kind(&self) -> BindingKind {
        match self {
            BindingResource::AccelerationStructure(_) => BindingKind::AccelerationStructure,
            BindingResource::StorageTexture(_) => BindingKind::StorageTexture,
            BindingResource::DynamicConstantBuffer { .. } => BindingKind::DynamicConstantBuffer,
            BindingResource::StorageBuffer(_) => BindingKind::StorageBuffer,
            BindingResource::SampledTexture(_) => BindingKind::SampledTexture,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BindingSetDesc {
    pub entries: Vec<(u32, BindingResource)>,
}

pub trait RayTracingDevice {
    fn capabilities(&self) -> &DeviceCapabilities;

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<BufferHandle>;
    fn destroy_buffer(&mut self, buffer: BufferHandle) -> Result<()>;
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()>;
    fn buffer_address(&self, buffer: BufferHandle) -> Result<u64>;

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureHandle>;
    fn create_target_view(&mut self, texture: TextureHandle) -> Result<TextureViewHandle>;
    /// The swap targets, in the order the display indexes them.
    fn present_targets(&self) -> &[TextureHandle];

    fn acceleration_structure_prebuild_info(
        &self,
        level: AccelerationStructureLevel,
        geometry: &GeometryInputs,
    ) -> Result<PrebuildInfo>;
    /// Address under which `result` is referenced by instance descriptors.
    fn acceleration_structure_address(
        &mut self,
        result: BufferHandle,
        level: AccelerationStructureLevel,
    ) -> Result<u64>;

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> Result<PipelineHandle>;
    fn shader_identifier(&self, pipeline: PipelineHandle, export: &str)
        -> Result<ShaderIdentifier>;
    fn create_binding_set(
        &mut self,
        pipeline: PipelineHandle,
        desc: &BindingSetDesc,
    ) -> Result<BindingSetHandle>;

    fn create_command_allocator(&mut self) -> Result<AllocatorHandle>;
    /// Fails if work recorded through `allocator` has not completed.
    fn reset_command_allocator(&mut self, allocator: AllocatorHandle) -> Result<()>;
    /// Submits commands recorded through `allocator` and signals
    /// `signal_value` once they complete.
    fn execute(
        &mut self,
        allocator: AllocatorHandle,
        commands: &[Command],
        signal_value: u64,
    ) -> Result<()>;

    fn signal(&mut self, value: u64) -> Result<()>;
    fn completed_value(&self) -> Result<u64>;
    fn wait_for_value(&mut self, value: u64) -> Result<()>;

    /// Index of the target the display designates for the next frame.
    fn current_target_index(&mut self) -> Result<usize>;
    fn present(&mut self) -> Result<()>;

    fn drain_debug_messages(&mut self) -> Vec<String>;
}
