//! A software device with a simulated GPU timeline.
//!
//! Work is validated when it is submitted, the way a debug layer would, and
//! its effects land in CPU memory only when the simulated GPU retires it. How
//! quickly that happens is set by [`GpuProgress`], which lets tests put the
//! CPU arbitrarily far ahead of the GPU.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Deserialize;
use slotmap::SlotMap;

use crate::acceleration_structure::{AccelerationStructureLevel, InstanceDescriptor};
use crate::bindings::CONSTANTS_ALIGNMENT;
use crate::commands::{Barrier, BuildAccelerationStructure, Command, GeometryInputs, TableRegion};
use crate::config::RendererConfig;
use crate::device::{
    AllocatorHandle, BindingResource, BindingSetDesc, BindingSetHandle, BufferDesc, BufferHandle,
    BufferUsage, DeviceCapabilities, MemoryLocation, PipelineHandle, PrebuildInfo,
    RayTracingDevice, ShaderIdentifier, TextureDesc, TextureFormat, TextureHandle, TextureUsage,
    TextureViewHandle,
};
use crate::error::{DeviceCallError, RenderError, Result};
use crate::pipeline::{PipelineDesc, PipelineSubobject};
use crate::resource_state::{ResourceId, ResourceState};
use crate::shader_table::align_up;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuProgress {
    /// Nothing retires until the CPU waits for it.
    Stalled,
    /// A submission retires once this many newer ones are queued behind it.
    Latency(usize),
    Immediate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresentOrder {
    RoundRobin,
    /// Repeats the listed target indices.
    Sequence(Vec<usize>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentedFrame {
    pub frame: u64,
    pub target_index: usize,
    pub target: TextureHandle,
}

const STRUCTURE_HEADER_SIZE: usize = 16;
const BOTTOM_LEVEL_MAGIC: [u8; 4] = *b"BLAS";
const TOP_LEVEL_MAGIC: [u8; 4] = *b"TLAS";
const INSTANCE_SIZE: u64 = std::mem::size_of::<InstanceDescriptor>() as u64;
const ADDRESS_BASE: u64 = 0x1_0000_0000;
const MAX_ATTRIBUTE_BYTES: u32 = 32;

#[derive(Debug)]
struct Buffer {
    desc: BufferDesc,
    data: Vec<u8>,
    address: u64,
    written: bool,
}

#[derive(Debug)]
struct Texture {
    desc: TextureDesc,
    texels: Vec<u8>,
}

#[derive(Debug, Default)]
struct Allocator {
    last_signal: Option<u64>,
    resets: u64,
}

#[derive(Debug)]
struct Pipeline {
    desc: PipelineDesc,
    identifiers: HashMap<String, ShaderIdentifier>,
}

#[derive(Debug)]
struct BindingSet {
    pipeline: PipelineHandle,
    desc: BindingSetDesc,
}

#[derive(Debug)]
enum Effect {
    Build {
        level: AccelerationStructureLevel,
        inputs: GeometryInputs,
        result: BufferHandle,
    },
    Dispatch {
        output: TextureHandle,
        index: u64,
    },
    CopyTexture {
        source: TextureHandle,
        destination: TextureHandle,
    },
    CopyBufferToTexture {
        source: BufferHandle,
        destination: TextureHandle,
    },
}

#[derive(Debug, Default)]
struct Submission {
    signal: u64,
    effects: Vec<Effect>,
    referenced: HashSet<BufferHandle>,
    /// (buffer, offset, size) ranges the GPU reads.
    reads: Vec<(BufferHandle, u64, u64)>,
}

/// What a validated command list changes once it is accepted.
#[derive(Debug, Default)]
struct Staged {
    states: HashMap<ResourceId, ResourceState>,
    structures: HashMap<BufferHandle, AccelerationStructureLevel>,
    awaiting_uav: HashSet<BufferHandle>,
    barriers: Vec<Barrier>,
    dispatches: u64,
    submission: Submission,
}

pub struct HeadlessDevice {
    capabilities: DeviceCapabilities,
    progress: GpuProgress,
    present_order: PresentOrder,

    buffers: SlotMap<BufferHandle, Buffer>,
    textures: SlotMap<TextureHandle, Texture>,
    views: SlotMap<TextureViewHandle, TextureHandle>,
    allocators: SlotMap<AllocatorHandle, Allocator>,
    pipelines: SlotMap<PipelineHandle, Pipeline>,
    binding_sets: SlotMap<BindingSetHandle, BindingSet>,
    targets: Vec<TextureHandle>,

    states: HashMap<ResourceId, ResourceState>,
    structures: HashMap<BufferHandle, AccelerationStructureLevel>,
    awaiting_uav: HashSet<BufferHandle>,

    pending: VecDeque<Submission>,
    completed: u64,
    last_signal: u64,
    next_address: u64,

    dispatches_submitted: u64,
    dispatches_executed: u64,
    builds_executed: HashMap<AccelerationStructureLevel, usize>,
    presents: u64,
    presented: Vec<PresentedFrame>,
    barriers: Vec<Barrier>,
    messages: Vec<String>,
    removed: Option<String>,
    failing_write: Option<String>,
}

impl HeadlessDevice {
    pub fn new(width: u32, height: u32, buffer_count: usize, progress: GpuProgress) -> Self {
        let mut device = Self {
            capabilities: DeviceCapabilities {
                adapter_name: "headless".into(),
                shader_identifier_size: 32,
                shader_record_alignment: 32,
                shader_table_alignment: 64,
                max_recursion_depth: 31,
            },
            progress,
            present_order: PresentOrder::RoundRobin,
            buffers: SlotMap::with_key(),
            textures: SlotMap::with_key(),
            views: SlotMap::with_key(),
            allocators: SlotMap::with_key(),
            pipelines: SlotMap::with_key(),
            binding_sets: SlotMap::with_key(),
            targets: Vec::new(),
            states: HashMap::new(),
            structures: HashMap::new(),
            awaiting_uav: HashSet::new(),
            pending: VecDeque::new(),
            completed: 0,
            last_signal: 0,
            next_address: ADDRESS_BASE,
            dispatches_submitted: 0,
            dispatches_executed: 0,
            builds_executed: HashMap::new(),
            presents: 0,
            presented: Vec::new(),
            barriers: Vec::new(),
            messages: Vec::new(),
            removed: None,
            failing_write: None,
        };

        for _ in 0..buffer_count {
            let target = device.insert_texture(TextureDesc {
                label: "present target",
                width,
                height,
                format: TextureFormat::Rgba8Unorm,
                usage: TextureUsage::Present,
                initial_state: ResourceState::Present,
            });
            device.targets.push(target);
        }
        device
    }

    pub fn from_config(config: &RendererConfig) -> Self {
        Self::new(
            config.width,
            config.height,
            config.buffer_count as usize,
            config.headless.progress,
        )
    }

    pub fn with_present_order(mut self, order: PresentOrder) -> Self {
        self.present_order = order;
        self
    }

    pub fn set_progress(&mut self, progress: GpuProgress) {
        self.progress = progress;
        self.apply_progress();
    }

    pub fn set_max_recursion_depth(&mut self, depth: u32) {
        self.capabilities.max_recursion_depth = depth;
    }

    /// Makes the next present report the device as removed.
    pub fn remove_device(&mut self, reason: impl Into<String>) {
        self.removed = Some(reason.into());
    }

    /// Makes the next `write_buffer` fail with `reason`.
    pub fn fail_next_write(&mut self, reason: impl Into<String>) {
        self.failing_write = Some(reason.into());
    }

    // Introspection

    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(buffer).map(|buffer| buffer.data.as_slice())
    }

    pub fn buffer_size(&self, buffer: BufferHandle) -> Option<u64> {
        self.buffers.get(buffer).map(|buffer| buffer.desc.size)
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn texture_texels(&self, texture: TextureHandle) -> Option<&[u8]> {
        self.textures.get(texture).map(|texture| texture.texels.as_slice())
    }

    pub fn texture_desc(&self, texture: TextureHandle) -> Option<&TextureDesc> {
        self.textures.get(texture).map(|texture| &texture.desc)
    }

    pub fn builds_executed(&self, level: AccelerationStructureLevel) -> usize {
        self.builds_executed.get(&level).copied().unwrap_or(0)
    }

    pub fn dispatches_executed(&self) -> u64 {
        self.dispatches_executed
    }

    pub fn allocator_resets(&self, allocator: AllocatorHandle) -> u64 {
        self.allocators
            .get(allocator)
            .map(|allocator| allocator.resets)
            .unwrap_or(0)
    }

    pub fn presented_frames(&self) -> &[PresentedFrame] {
        &self.presented
    }

    pub fn submitted_barriers(&self) -> &[Barrier] {
        &self.barriers
    }

    pub fn pending_submissions(&self) -> usize {
        self.pending.len()
    }

    pub fn instance_descriptors(&self, buffer: BufferHandle) -> Vec<InstanceDescriptor> {
        match self.buffers.get(buffer) {
            Some(buffer) => {
                let whole = buffer.data.len() - buffer.data.len() % INSTANCE_SIZE as usize;
                bytemuck::pod_collect_to_vec(&buffer.data[..whole])
            }
            None => Vec::new(),
        }
    }

    /// Whether `result` holds a built top level whose instances all point at
    /// built bottom levels.
    pub fn top_level_is_valid(&self, result: BufferHandle) -> bool {
        let Some((count, body)) = self.structure(result, TOP_LEVEL_MAGIC) else {
            return false;
        };
        if count == 0 || body.len() < count as usize * INSTANCE_SIZE as usize {
            return false;
        }
        let descriptors: Vec<InstanceDescriptor> =
            bytemuck::pod_collect_to_vec(&body[..count as usize * INSTANCE_SIZE as usize]);
        descriptors.iter().all(|descriptor| {
            self.buffer_at(descriptor.bottom_level_address)
                .and_then(|bottom| self.structure(bottom, BOTTOM_LEVEL_MAGIC))
                .map(|(primitives, _)| primitives > 0)
                .unwrap_or(false)
        })
    }

    fn structure(&self, buffer: BufferHandle, magic: [u8; 4]) -> Option<(u32, &[u8])> {
        let data = &self.buffers.get(buffer)?.data;
        if data.len() < STRUCTURE_HEADER_SIZE || data[0..4] != magic {
            return None;
        }
        let count = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
        Some((count, &data[STRUCTURE_HEADER_SIZE..]))
    }

    fn buffer_at(&self, address: u64) -> Option<BufferHandle> {
        self.buffers
            .iter()
            .find(|(_, buffer)| buffer.address == address)
            .map(|(handle, _)| handle)
    }

    // ── timeline ──

    fn apply_progress(&mut self) {
        match self.progress {
            GpuProgress::Stalled => {}
            GpuProgress::Latency(depth) => {
                while self.pending.len() > depth {
                    self.retire_front();
                }
            }
            GpuProgress::Immediate => {
                while !self.pending.is_empty() {
                    self.retire_front();
                }
            }
        }
    }

    fn retire_front(&mut self) {
        let Some(submission) = self.pending.pop_front() else {
            return;
        };
        for effect in submission.effects {
            self.apply(effect);
        }
        self.completed = submission.signal;
        log::trace!("gpu reached {}", self.completed);
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::Build {
                level,
                inputs,
                result,
            } => {
                let (magic, body) = match level {
                    AccelerationStructureLevel::Bottom => (BOTTOM_LEVEL_MAGIC, Vec::new()),
                    AccelerationStructureLevel::Top => {
                        let len = inputs.count() as usize * INSTANCE_SIZE as usize;
                        let body = self
                            .buffers
                            .get(inputs.buffer())
                            .map(|buffer| buffer.data[..len].to_vec())
                            .unwrap_or_default();
                        (TOP_LEVEL_MAGIC, body)
                    }
                };
                if let Some(buffer) = self.buffers.get_mut(result) {
                    let data = &mut buffer.data;
                    data.iter_mut().for_each(|byte| *byte = 0);
                    data[0..4].copy_from_slice(&magic);
                    data[4..8].copy_from_slice(&(level as u32).to_le_bytes());
                    data[8..12].copy_from_slice(&inputs.count().to_le_bytes());
                    data[STRUCTURE_HEADER_SIZE..STRUCTURE_HEADER_SIZE + body.len()]
                        .copy_from_slice(&body);
                }
                *self.builds_executed.entry(level).or_insert(0) += 1;
            }
            Effect::Dispatch { output, index } => {
                if let Some(texture) = self.textures.get_mut(output) {
                    let width = texture.desc.width as usize;
                    let stride = texture.desc.format.bytes_per_texel() as usize;
                    for (i, texel) in texture.texels.chunks_mut(stride).enumerate() {
                        let (x, y) = (i % width, i / width);
                        texel[0] = x as u8;
                        texel[1] = y as u8;
                        texel[2] = index as u8;
                        texel[3] = 0xff;
                    }
                }
                self.dispatches_executed += 1;
            }
            Effect::CopyTexture {
                source,
                destination,
            } => {
                let texels = self.textures.get(source).map(|t| t.texels.clone());
                if let (Some(texels), Some(destination)) =
                    (texels, self.textures.get_mut(destination))
                {
                    destination.texels = texels;
                }
            }
            Effect::CopyBufferToTexture {
                source,
                destination,
            } => {
                let data = self.buffers.get(source).map(|b| b.data.clone());
                if let (Some(data), Some(destination)) = (data, self.textures.get_mut(destination))
                {
                    let len = destination.texels.len();
                    destination.texels.copy_from_slice(&data[..len]);
                }
            }
        }
    }

    fn push_submission(&mut self, submission: Submission) {
        self.last_signal = submission.signal;
        self.pending.push_back(submission);
        self.apply_progress();
    }

    fn in_flight(&self, buffer: BufferHandle) -> bool {
        self.pending
            .iter()
            .any(|submission| submission.referenced.contains(&buffer))
    }

    // ── validation ──

    #[track_caller]
    fn validation_error(&mut self, call: &str, message: String) -> RenderError {
        log::warn!("validation: {}", message);
        self.messages.push(message);
        let messages = std::mem::take(&mut self.messages);
        DeviceCallError::at_caller(call, "rejected by validation")
            .with_debug_messages(messages)
            .into()
    }

    fn prebuild(
        &self,
        level: AccelerationStructureLevel,
        geometry: &GeometryInputs,
    ) -> std::result::Result<PrebuildInfo, String> {
        let matches_level = matches!(
            (level, geometry),
            (
                AccelerationStructureLevel::Bottom,
                GeometryInputs::ProceduralAabbs { .. }
            ) | (AccelerationStructureLevel::Top, GeometryInputs::Instances { .. })
        );
        if !matches_level {
            return Err(format!("{:?} level built from {:?}", level, geometry));
        }
        if !self.buffers.contains_key(geometry.buffer()) {
            return Err("build input buffer does not exist".into());
        }
        let count = geometry.count() as u64;
        Ok(PrebuildInfo {
            result_size: align_up(STRUCTURE_HEADER_SIZE as u64 + count * INSTANCE_SIZE, 256),
            scratch_size: align_up(128 + count * 32, 256),
        })
    }

    fn validate(
        &self,
        allocator: AllocatorHandle,
        commands: &[Command],
        signal_value: u64,
    ) -> std::result::Result<Staged, String> {
        if !self.allocators.contains_key(allocator) {
            return Err("unknown command allocator".into());
        }
        if signal_value <= self.last_signal {
            return Err(format!(
                "signal value {} does not advance past {}",
                signal_value, self.last_signal
            ));
        }

        let mut staged = Staged {
            states: self.states.clone(),
            structures: self.structures.clone(),
            awaiting_uav: self.awaiting_uav.clone(),
            submission: Submission {
                signal: signal_value,
                ..Submission::default()
            },
            ..Staged::default()
        };
        let mut pipeline: Option<PipelineHandle> = None;
        let mut globals: Option<BindingSetHandle> = None;

        for command in commands {
            match *command {
                Command::Barrier(barrier) => {
                    if let Barrier::Transition { resource, from, to } = barrier {
                        let actual = staged
                            .states
                            .get(&resource)
                            .copied()
                            .ok_or_else(|| format!("barrier on unknown resource {:?}", resource))?;
                        if actual != from {
                            return Err(format!(
                                "barrier on {:?} claims {:?} but the resource is {:?}",
                                resource, from, actual
                            ));
                        }
                        if from == to {
                            return Err(format!("redundant barrier {:?} on {:?}", from, resource));
                        }
                        staged.states.insert(resource, to);
                    }
                    if let Barrier::Uav {
                        resource: ResourceId::Buffer(buffer),
                    } = barrier
                    {
                        staged.awaiting_uav.remove(&buffer);
                    }
                    staged.barriers.push(barrier);
                }
                Command::BuildAccelerationStructure(build) => {
                    self.validate_build(&mut staged, &build)?;
                }
                Command::SetPipeline(handle) => {
                    if !self.pipelines.contains_key(handle) {
                        return Err("set an unknown pipeline".into());
                    }
                    pipeline = Some(handle);
                }
                Command::BindGlobals {
                    bindings,
                    constants_offset,
                } => {
                    let set = self
                        .binding_sets
                        .get(bindings)
                        .ok_or("bound an unknown binding set")?;
                    if pipeline != Some(set.pipeline) {
                        return Err("globals bound without their pipeline".into());
                    }
                    if constants_offset % CONSTANTS_ALIGNMENT != 0 {
                        return Err(format!(
                            "constant offset {} is not {}-byte aligned",
                            constants_offset, CONSTANTS_ALIGNMENT
                        ));
                    }
                    for (_, resource) in &set.desc.entries {
                        match *resource {
                            BindingResource::DynamicConstantBuffer { buffer, range } => {
                                let size = self.buffers.get(buffer).map(|b| b.desc.size).unwrap_or(0);
                                if constants_offset + range > size {
                                    return Err(format!(
                                        "constants at {} overrun a {} byte buffer",
                                        constants_offset, size
                                    ));
                                }
                                staged.submission.referenced.insert(buffer);
                                staged
                                    .submission
                                    .reads
                                    .push((buffer, constants_offset, range));
                            }
                            BindingResource::StorageBuffer(buffer) => {
                                let size = self.buffers.get(buffer).map(|b| b.desc.size).unwrap_or(0);
                                staged.submission.referenced.insert(buffer);
                                staged.submission.reads.push((buffer, 0, size));
                            }
                            BindingResource::AccelerationStructure(buffer) => {
                                staged.submission.referenced.insert(buffer);
                            }
                            BindingResource::StorageTexture(_)
                            | BindingResource::SampledTexture(_) => {}
                        }
                    }
                    globals = Some(bindings);
                }
                Command::DispatchRays(desc) => {
                    if pipeline.is_none() {
                        return Err("dispatch without a pipeline".into());
                    }
                    let set = globals
                        .and_then(|handle| self.binding_sets.get(handle))
                        .ok_or("dispatch without global bindings")?;
                    for region in [desc.ray_generation, desc.miss, desc.hit_group] {
                        self.validate_region(&mut staged, &region)?;
                    }
                    for (_, resource) in &set.desc.entries {
                        match *resource {
                            BindingResource::StorageTexture(output) => {
                                let state = staged.states.get(&ResourceId::Texture(output));
                                if state != Some(&ResourceState::UnorderedAccess) {
                                    return Err(format!(
                                        "dispatch writes an output in {:?}",
                                        state
                                    ));
                                }
                                staged.submission.effects.push(Effect::Dispatch {
                                    output,
                                    index: self.dispatches_submitted + staged.dispatches,
                                });
                            }
                            BindingResource::AccelerationStructure(top) => {
                                if staged.structures.get(&top)
                                    != Some(&AccelerationStructureLevel::Top)
                                {
                                    return Err("dispatch traces a buffer that is not a built top level".into());
                                }
                                if staged.awaiting_uav.contains(&top) {
                                    return Err("dispatch reads a top level before its UAV barrier".into());
                                }
                            }
                            _ => {}
                        }
                    }
                    staged.dispatches += 1;
                }
                Command::CopyTexture {
                    source,
                    destination,
                } => {
                    self.expect_state(&staged, source.into(), ResourceState::CopySource)?;
                    self.expect_state(&staged, destination.into(), ResourceState::CopyDestination)?;
                    let size = |texture| self.textures.get(texture).map(|t| t.texels.len());
                    if size(source) != size(destination) {
                        return Err("texture copy between different sizes".into());
                    }
                    staged.submission.effects.push(Effect::CopyTexture {
                        source,
                        destination,
                    });
                }
                Command::CopyBufferToTexture {
                    source,
                    destination,
                } => {
                    self.expect_state(&staged, destination.into(), ResourceState::CopyDestination)?;
                    let available = self.buffers.get(source).map(|b| b.desc.size).unwrap_or(0);
                    let needed = self
                        .textures
                        .get(destination)
                        .map(|t| t.desc.byte_size())
                        .unwrap_or(u64::MAX);
                    if available < needed {
                        return Err(format!(
                            "buffer of {} bytes cannot fill a {} byte texture",
                            available, needed
                        ));
                    }
                    staged.submission.referenced.insert(source);
                    staged.submission.reads.push((source, 0, needed));
                    staged.submission.effects.push(Effect::CopyBufferToTexture {
                        source,
                        destination,
                    });
                }
            }
        }
        Ok(staged)
    }

    fn validate_build(
        &self,
        staged: &mut Staged,
        build: &BuildAccelerationStructure,
    ) -> std::result::Result<(), String> {
        let input = build.inputs.buffer();
        if build.scratch == build.result || input == build.scratch || input == build.result {
            return Err("acceleration structure build aliases its buffers".into());
        }
        let sizes = self.prebuild(build.level, &build.inputs)?;
        let size_of = |buffer| self.buffers.get(buffer).map(|b: &Buffer| b.desc.size);
        match (size_of(build.scratch), size_of(build.result)) {
            (Some(scratch), Some(result))
                if scratch >= sizes.scratch_size && result >= sizes.result_size => {}
            (Some(_), Some(_)) => return Err("scratch or result buffer is undersized".into()),
            _ => return Err("build references a buffer that does not exist".into()),
        }

        let input_buffer = self.buffers.get(input).ok_or("missing build input")?;
        if !input_buffer.written {
            return Err("build input buffer was never written".into());
        }

        if build.level == AccelerationStructureLevel::Top {
            let len = build.inputs.count() as u64 * INSTANCE_SIZE;
            if input_buffer.desc.size < len {
                return Err("instance buffer is smaller than its instance count".into());
            }
            let descriptors: Vec<InstanceDescriptor> =
                bytemuck::pod_collect_to_vec(&input_buffer.data[..len as usize]);
            for descriptor in &descriptors {
                let bottom = self
                    .buffer_at(descriptor.bottom_level_address)
                    .ok_or_else(|| {
                        format!(
                            "instance references unknown address {:#x}",
                            descriptor.bottom_level_address
                        )
                    })?;
                if staged.structures.get(&bottom) != Some(&AccelerationStructureLevel::Bottom) {
                    return Err("instance references a buffer that is not a bottom level".into());
                }
                if staged.awaiting_uav.contains(&bottom) {
                    return Err("top level built before the bottom level's UAV barrier".into());
                }
                staged.submission.referenced.insert(bottom);
            }
        }

        staged.structures.insert(build.result, build.level);
        staged.awaiting_uav.insert(build.result);
        let submission = &mut staged.submission;
        submission.referenced.extend([input, build.scratch, build.result]);
        submission.reads.push((input, 0, input_buffer.desc.size));
        submission.effects.push(Effect::Build {
            level: build.level,
            inputs: build.inputs,
            result: build.result,
        });
        Ok(())
    }

    fn validate_region(
        &self,
        staged: &mut Staged,
        region: &TableRegion,
    ) -> std::result::Result<(), String> {
        let buffer = self
            .buffers
            .get(region.buffer)
            .ok_or("shader table buffer does not exist")?;
        if region.offset % self.capabilities.shader_table_alignment as u64 != 0 {
            return Err(format!("table region at {} is misaligned", region.offset));
        }
        if region.stride % self.capabilities.shader_record_alignment as u64 != 0
            || region.stride < self.capabilities.shader_identifier_size as u64
        {
            return Err(format!("table stride {} is invalid", region.stride));
        }
        if region.offset + region.size > buffer.desc.size || !buffer.written {
            return Err("table region is outside the written table".into());
        }
        staged.submission.referenced.insert(region.buffer);
        staged
            .submission
            .reads
            .push((region.buffer, region.offset, region.size));
        Ok(())
    }

    fn expect_state(
        &self,
        staged: &Staged,
        resource: ResourceId,
        expected: ResourceState,
    ) -> std::result::Result<(), String> {
        match staged.states.get(&resource) {
            Some(state) if *state == expected => Ok(()),
            state => Err(format!(
                "{:?} is {:?} where {:?} is required",
                resource, state, expected
            )),
        }
    }

    fn insert_texture(&mut self, desc: TextureDesc) -> TextureHandle {
        let texels = vec![0u8; desc.byte_size() as usize];
        let state = desc.initial_state;
        let handle = self.textures.insert(Texture { desc, texels });
        self.states.insert(ResourceId::Texture(handle), state);
        handle
    }

    fn identifier(pipeline: u64, export: &str) -> ShaderIdentifier {
        // FNV-1a over the export name, salted per pipeline and per word.
        let mut bytes = Vec::with_capacity(32);
        for word in 0u64..4 {
            let mut hash: u64 = 0xcbf2_9ce4_8422_2325 ^ pipeline.wrapping_mul(31) ^ word;
            for byte in export.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
            }
            bytes.extend_from_slice(&hash.to_le_bytes());
        }
        ShaderIdentifier(bytes)
    }
}

impl RayTracingDevice for HeadlessDevice {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    #[track_caller]
    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<BufferHandle> {
        if desc.size == 0 {
            return Err(self.validation_error("create_buffer", format!("{} is empty", desc.label)));
        }
        let address = self.next_address;
        self.next_address += align_up(desc.size, 256);
        let handle = self.buffers.insert(Buffer {
            desc: desc.clone(),
            data: vec![0u8; desc.size as usize],
            address,
            written: false,
        });
        self.states
            .insert(ResourceId::Buffer(handle), desc.initial_state);
        log::trace!("buffer {} ({} bytes) at {:#x}", desc.label, desc.size, address);
        Ok(handle)
    }

    #[track_caller]
    fn destroy_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        if !self.buffers.contains_key(buffer) {
            return Err(self.validation_error("destroy_buffer", "unknown buffer".into()));
        }
        if self.in_flight(buffer) {
            let label = self.buffers[buffer].desc.label;
            return Err(self.validation_error(
                "destroy_buffer",
                format!("{} is referenced by work still in flight", label),
            ));
        }
        self.buffers.remove(buffer);
        self.states.remove(&ResourceId::Buffer(buffer));
        self.structures.remove(&buffer);
        self.awaiting_uav.remove(&buffer);
        Ok(())
    }

    #[track_caller]
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        if let Some(reason) = self.failing_write.take() {
            return Err(self.validation_error("write_buffer", reason));
        }
        let (label, location, size) = match self.buffers.get(buffer) {
            Some(b) => (b.desc.label, b.desc.location, b.desc.size),
            None => return Err(self.validation_error("write_buffer", "unknown buffer".into())),
        };
        if location == MemoryLocation::DeviceLocal {
            return Err(self.validation_error(
                "write_buffer",
                format!("CPU write into device-local {}", label),
            ));
        }
        let end = offset + data.len() as u64;
        if end > size {
            return Err(self.validation_error(
                "write_buffer",
                format!("write of {}..{} overruns {} ({} bytes)", offset, end, label, size),
            ));
        }
        let hazard = self.pending.iter().any(|submission| {
            submission
                .reads
                .iter()
                .any(|&(read, start, len)| read == buffer && offset < start + len && start < end)
        });
        if hazard {
            return Err(self.validation_error(
                "write_buffer",
                format!(
                    "CPU write into {} bytes {}..{} that pending GPU work reads",
                    label, offset, end
                ),
            ));
        }

        let target = &mut self.buffers[buffer];
        target.data[offset as usize..end as usize].copy_from_slice(data);
        target.written = true;
        Ok(())
    }

    #[track_caller]
    fn buffer_address(&self, buffer: BufferHandle) -> Result<u64> {
        self.buffers
            .get(buffer)
            .map(|buffer| buffer.address)
            .ok_or_else(|| DeviceCallError::at_caller("buffer_address", "unknown buffer").into())
    }

    #[track_caller]
    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureHandle> {
        if desc.width == 0 || desc.height == 0 {
            return Err(self.validation_error("create_texture", format!("{} is empty", desc.label)));
        }
        Ok(self.insert_texture(desc.clone()))
    }

    #[track_caller]
    fn create_target_view(&mut self, texture: TextureHandle) -> Result<TextureViewHandle> {
        if !self.textures.contains_key(texture) {
            return Err(self.validation_error("create_target_view", "unknown texture".into()));
        }
        Ok(self.views.insert(texture))
    }

    fn present_targets(&self) -> &[TextureHandle] {
        &self.targets
    }

    #[track_caller]
    fn acceleration_structure_prebuild_info(
        &self,
        level: AccelerationStructureLevel,
        geometry: &GeometryInputs,
    ) -> Result<PrebuildInfo> {
        self.prebuild(level, geometry).map_err(|message| {
            DeviceCallError::at_caller("acceleration_structure_prebuild_info", message).into()
        })
    }

    #[track_caller]
    fn acceleration_structure_address(
        &mut self,
        result: BufferHandle,
        _level: AccelerationStructureLevel,
    ) -> Result<u64> {
        match self.buffers.get(result) {
            Some(buffer) if buffer.desc.usage == BufferUsage::AccelerationStructure => {
                Ok(buffer.address)
            }
            _ => Err(self.validation_error(
                "acceleration_structure_address",
                "not an acceleration structure buffer".into(),
            )),
        }
    }

    #[track_caller]
    fn create_pipeline(&mut self, desc: &PipelineDesc) -> Result<PipelineHandle> {
        desc.validate()?;
        if let Some(depth) = desc.max_recursion_depth() {
            if depth > self.capabilities.max_recursion_depth {
                return Err(RenderError::CapabilityMissing(format!(
                    "recursion depth {} exceeds {}",
                    depth, self.capabilities.max_recursion_depth
                )));
            }
        }
        for subobject in &desc.subobjects {
            if let PipelineSubobject::ShaderConfig {
                max_payload_bytes,
                max_attribute_bytes,
            } = *subobject
            {
                if max_payload_bytes == 0 || max_attribute_bytes > MAX_ATTRIBUTE_BYTES {
                    return Err(RenderError::InvalidPipeline(format!(
                        "shader config with {} payload and {} attribute bytes (attributes are limited to {})",
                        max_payload_bytes, max_attribute_bytes, MAX_ATTRIBUTE_BYTES
                    )));
                }
            }
        }
        let serial = self.pipelines.len() as u64 + 1;
        let identifiers = desc
            .exports()
            .into_iter()
            .map(|export| (export.to_string(), Self::identifier(serial, export)))
            .collect();
        Ok(self.pipelines.insert(Pipeline {
            desc: desc.clone(),
            identifiers,
        }))
    }

    #[track_caller]
    fn shader_identifier(&self, pipeline: PipelineHandle, export: &str) -> Result<ShaderIdentifier> {
        self.pipelines
            .get(pipeline)
            .and_then(|pipeline| pipeline.identifiers.get(export))
            .cloned()
            .ok_or_else(|| {
                DeviceCallError::at_caller(
                    "shader_identifier",
                    format!("pipeline does not export {}", export),
                )
                .into()
            })
    }

    #[track_caller]
    fn create_binding_set(
        &mut self,
        pipeline: PipelineHandle,
        desc: &BindingSetDesc,
    ) -> Result<BindingSetHandle> {
        let layout = match self.pipelines.get(pipeline).and_then(|p| p.desc.root_signature()) {
            Some(layout) => layout.clone(),
            None => {
                return Err(self.validation_error(
                    "create_binding_set",
                    "pipeline has no root signature".into(),
                ))
            }
        };
        for slot in &layout.slots {
            let entry = desc
                .entries
                .iter()
                .find(|(binding, _)| *binding == slot.binding);
            let exists = match entry {
                Some((_, resource)) if resource.kind() == slot.kind => match *resource {
                    BindingResource::AccelerationStructure(buffer)
                    | BindingResource::StorageBuffer(buffer)
                    | BindingResource::DynamicConstantBuffer { buffer, .. } => {
                        self.buffers.contains_key(buffer)
                    }
                    BindingResource::StorageTexture(texture)
                    | BindingResource::SampledTexture(texture) => {
                        self.textures.contains_key(texture)
                    }
                },
                _ => false,
            };
            if !exists {
                return Err(self.validation_error(
                    "create_binding_set",
                    format!("binding {} needs a live {:?}", slot.binding, slot.kind),
                ));
            }
        }
        Ok(self.binding_sets.insert(BindingSet {
            pipeline,
            desc: desc.clone(),
        }))
    }

    fn create_command_allocator(&mut self) -> Result<AllocatorHandle> {
        Ok(self.allocators.insert(Allocator::default()))
    }

    #[track_caller]
    fn reset_command_allocator(&mut self, allocator: AllocatorHandle) -> Result<()> {
        let last_signal = match self.allocators.get(allocator) {
            Some(allocator) => allocator.last_signal,
            None => {
                return Err(self.validation_error(
                    "reset_command_allocator",
                    "unknown allocator".into(),
                ))
            }
        };
        if let Some(signal) = last_signal {
            if signal > self.completed {
                return Err(self.validation_error(
                    "reset_command_allocator",
                    format!(
                        "allocator reset while its work is in flight (signal {}, gpu at {})",
                        signal, self.completed
                    ),
                ));
            }
        }
        self.allocators[allocator].resets += 1;
        Ok(())
    }

    #[track_caller]
    fn execute(
        &mut self,
        allocator: AllocatorHandle,
        commands: &[Command],
        signal_value: u64,
    ) -> Result<()> {
        let staged = match self.validate(allocator, commands, signal_value) {
            Ok(staged) => staged,
            Err(message) => return Err(self.validation_error("execute", message)),
        };

        self.states = staged.states;
        self.structures = staged.structures;
        self.awaiting_uav = staged.awaiting_uav;
        self.barriers.extend(staged.barriers);
        self.dispatches_submitted += staged.dispatches;
        self.allocators[allocator].last_signal = Some(signal_value);
        self.push_submission(staged.submission);
        Ok(())
    }

    #[track_caller]
    fn signal(&mut self, value: u64) -> Result<()> {
        if value <= self.last_signal {
            return Err(self.validation_error(
                "signal",
                format!("signal value {} does not advance past {}", value, self.last_signal),
            ));
        }
        self.push_submission(Submission {
            signal: value,
            ..Submission::default()
        });
        Ok(())
    }

    fn completed_value(&self) -> Result<u64> {
        Ok(self.completed)
    }

    #[track_caller]
    fn wait_for_value(&mut self, value: u64) -> Result<()> {
        if value > self.last_signal {
            return Err(self.validation_error(
                "wait_for_value",
                format!("waiting for {} which is never signalled", value),
            ));
        }
        while self.completed < value {
            self.retire_front();
        }
        Ok(())
    }

    fn current_target_index(&mut self) -> Result<usize> {
        let count = self.targets.len().max(1);
        let turn = self.presents as usize;
        Ok(match &self.present_order {
            PresentOrder::Sequence(order) if !order.is_empty() => order[turn % order.len()] % count,
            _ => turn % count,
        })
    }

    #[track_caller]
    fn present(&mut self) -> Result<()> {
        if let Some(reason) = self.removed.clone() {
            return Err(RenderError::DeviceRemoved { reason });
        }
        let target_index = self.current_target_index()?;
        let target = self.targets[target_index];
        if self.states.get(&ResourceId::Texture(target)) != Some(&ResourceState::Present) {
            return Err(self.validation_error(
                "present",
                format!("target {} is not in the present state", target_index),
            ));
        }
        self.presented.push(PresentedFrame {
            frame: self.presents,
            target_index,
            target,
        });
        self.presents += 1;
        Ok(())
    }

    fn drain_debug_messages(&mut self) -> Vec<String> {
        std::mem::take(&mut self.messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandList;

    fn upload_buffer(device: &mut HeadlessDevice, size: u64) -> BufferHandle {
        device
            .create_buffer(&BufferDesc {
                label: "test",
                size,
                location: MemoryLocation::Upload,
                usage: BufferUsage::Storage,
                initial_state: ResourceState::GenericRead,
            })
            .unwrap()
    }

    #[test]
    fn latency_retires_only_old_work() {
        let mut device = HeadlessDevice::new(4, 4, 2, GpuProgress::Latency(2));
        for value in 1..=4 {
            device.signal(value).unwrap();
        }
        assert_eq!(device.completed_value().unwrap(), 2);
        assert_eq!(device.pending_submissions(), 2);
    }

    #[test]
    fn device_local_memory_is_not_cpu_writable() {
        let mut device = HeadlessDevice::new(4, 4, 2, GpuProgress::Immediate);
        let buffer = device
            .create_buffer(&BufferDesc {
                label: "scratch",
                size: 64,
                location: MemoryLocation::DeviceLocal,
                usage: BufferUsage::AccelerationStructureScratch,
                initial_state: ResourceState::UnorderedAccess,
            })
            .unwrap();
        let error = device.write_buffer(buffer, 0, &[1, 2, 3]).unwrap_err();
        assert!(error.to_string().contains("device-local"));
    }

    #[test]
    fn writes_into_ranges_read_by_pending_work_are_rejected() {
        let mut device = HeadlessDevice::new(4, 4, 2, GpuProgress::Stalled);
        let staging = upload_buffer(&mut device, 4 * 4 * 4);
        device.write_buffer(staging, 0, &[7; 64]).unwrap();
        let target = device.present_targets()[0];
        let allocator = device.create_command_allocator().unwrap();

        let mut list = CommandList::new();
        list.begin(allocator);
        list.record(Command::Barrier(Barrier::Transition {
            resource: target.into(),
            from: ResourceState::Present,
            to: ResourceState::CopyDestination,
        }));
        list.record(Command::CopyBufferToTexture {
            source: staging,
            destination: target,
        });
        let closed = list.close().unwrap();
        device.execute(allocator, &closed.commands, 1).unwrap();

        assert!(device.write_buffer(staging, 8, &[0; 4]).is_err());
        assert!(device.destroy_buffer(staging).is_err());

        device.wait_for_value(1).unwrap();
        device.write_buffer(staging, 8, &[0; 4]).unwrap();
        assert_eq!(device.texture_texels(target).unwrap()[0..4], [7, 7, 7, 7]);
    }

    #[test]
    fn barrier_from_the_wrong_state_is_rejected_with_messages() {
        let mut device = HeadlessDevice::new(4, 4, 2, GpuProgress::Immediate);
        let target = device.present_targets()[1];
        let allocator = device.create_command_allocator().unwrap();

        let commands = [Command::Barrier(Barrier::Transition {
            resource: target.into(),
            from: ResourceState::CopyDestination,
            to: ResourceState::Present,
        })];
        let error = device.execute(allocator, &commands, 1).unwrap_err();
        match error {
            RenderError::DeviceCall(error) => {
                assert_eq!(error.call, "execute");
                assert_eq!(error.debug_messages.len(), 1);
                assert!(error.debug_messages[0].contains("claims CopyDestination"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(device.completed_value().unwrap(), 0);
    }

    #[test]
    fn allocator_reset_in_flight_is_rejected() {
        let mut device = HeadlessDevice::new(4, 4, 2, GpuProgress::Stalled);
        let allocator = device.create_command_allocator().unwrap();
        device.execute(allocator, &[], 1).unwrap();

        assert!(device.reset_command_allocator(allocator).is_err());
        device.wait_for_value(1).unwrap();
        device.reset_command_allocator(allocator).unwrap();
        assert_eq!(device.allocator_resets(allocator), 1);
    }

    #[test]
    fn waiting_for_an_unsignalled_value_is_an_error() {
        let mut device = HeadlessDevice::new(4, 4, 2, GpuProgress::Stalled);
        assert!(device.wait_for_value(1).is_err());
    }

    #[test]
    fn present_order_sequence_is_followed() {
        let mut device = HeadlessDevice::new(4, 4, 3, GpuProgress::Immediate)
            .with_present_order(PresentOrder::Sequence(vec![1, 2]));
        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(device.current_target_index().unwrap());
            device.present().unwrap();
        }
        assert_eq!(order, vec![1, 2, 1, 2]);
    }

    #[test]
    fn removed_device_fails_present() {
        let mut device = HeadlessDevice::new(4, 4, 2, GpuProgress::Immediate);
        device.remove_device("driver reset");
        assert!(matches!(
            device.present(),
            Err(RenderError::DeviceRemoved { reason }) if reason == "driver reset"
        ));
    }

    #[test]
    fn identifiers_differ_per_export() {
        let a = HeadlessDevice::identifier(1, "rayGen");
        let b = HeadlessDevice::identifier(1, "miss");
        assert_eq!(a.as_bytes().len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn oversized_attributes_are_rejected() {
        use crate::config::RendererConfig;
        use crate::pipeline::{exports, ray_tracing_pipeline};
        use crate::shaders::ShaderLibrary;

        let mut device = HeadlessDevice::new(4, 4, 2, GpuProgress::Immediate);
        let shaders = ShaderLibrary::empty_modules(&exports::SHADERS);
        let config = RendererConfig {
            max_attribute_bytes: 64,
            ..RendererConfig::default()
        };
        let desc = ray_tracing_pipeline(&shaders, &config).unwrap();
        assert!(matches!(
            device.create_pipeline(&desc),
            Err(RenderError::InvalidPipeline(_))
        ));

        let desc = ray_tracing_pipeline(&shaders, &RendererConfig::default()).unwrap();
        assert!(device.create_pipeline(&desc).is_ok());
    }
}
