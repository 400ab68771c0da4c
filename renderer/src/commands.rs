//! Backend-neutral command stream.
//!
//! Commands are recorded into a [`CommandList`] and replayed by the device at
//! submission time. A list records into exactly one allocator at a time.

use crate::acceleration_structure::AccelerationStructureLevel;
use crate::device::{AllocatorHandle, BindingSetHandle, BufferHandle, PipelineHandle, TextureHandle};
use crate::resource_state::{ResourceId, ResourceState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Barrier {
    Transition {
        resource: ResourceId,
        from: ResourceState,
        to: ResourceState,
    },
    /// Read/write hazard on a resource that stays in the same state.
    Uav { resource: ResourceId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryInputs {
    ProceduralAabbs {
        buffer: BufferHandle,
        count: u32,
        stride: u64,
    },
    Instances {
        buffer: BufferHandle,
        count: u32,
    },
}

impl GeometryInputs {
    pub fn buffer(&self) -> BufferHandle {
        match *self {
            GeometryInputs::ProceduralAabbs { buffer, .. } => buffer,
            GeometryInputs::Instances { buffer, .. } => buffer,
        }
    }

    pub fn count(&self) -> u32 {
        match *self {
            GeometryInputs::ProceduralAabbs { count, .. } => count,
            GeometryInputs::Instances { count, .. } => count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildAccelerationStructure {
    pub level: AccelerationStructureLevel,
    pub inputs: GeometryInputs,
    pub scratch: BufferHandle,
    pub result: BufferHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableRegion {
    pub buffer: BufferHandle,
    pub offset: u64,
    pub size: u64,
    pub stride: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchRaysDesc {
    pub ray_generation: TableRegion,
    pub miss: TableRegion,
    pub hit_group: TableRegion,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Barrier(Barrier),
    BuildAccelerationStructure(BuildAccelerationStructure),
    SetPipeline(PipelineHandle),
    BindGlobals {
        bindings: BindingSetHandle,
        constants_offset: u64,
    },
    DispatchRays(DispatchRaysDesc),
    CopyTexture {
        source: TextureHandle,
        destination: TextureHandle,
    },
    CopyBufferToTexture {
        source: BufferHandle,
        destination: TextureHandle,
    },
}

#[derive(Debug)]
pub struct ClosedList {
    pub allocator: AllocatorHandle,
    pub commands: Vec<Command>,
}

#[derive(Debug, Default)]
pub struct CommandList {
    allocator: Option<AllocatorHandle>,
    commands: Vec<Command>,
}

impl CommandList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, allocator: AllocatorHandle) {
        debug_assert!(self.allocator.is_none(), "command list is already open");
        self.allocator = Some(allocator);
        self.commands.clear();
    }

    pub fn is_open(&self) -> bool {
        self.allocator.is_some()
    }

    pub fn allocator(&self) -> Option<AllocatorHandle> {
        self.allocator
    }

    pub fn record(&mut self, command: Command) {
        assert!(self.is_open(), "recording into a closed command list");
        self.commands.push(command);
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn close(&mut self) -> Option<ClosedList> {
        let allocator = self.allocator.take()?;
        Some(ClosedList {
            allocator,
            commands: std::mem::take(&mut self.commands),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    #[test]
    fn close_hands_back_the_allocator_and_commands() {
        let mut allocators: SlotMap<AllocatorHandle, ()> = SlotMap::with_key();
        let mut pipelines: SlotMap<PipelineHandle, ()> = SlotMap::with_key();
        let allocator = allocators.insert(());
        let pipeline = pipelines.insert(());

        let mut list = CommandList::new();
        assert!(list.close().is_none());

        list.begin(allocator);
        list.record(Command::SetPipeline(pipeline));
        let closed = list.close().unwrap();

        assert_eq!(closed.allocator, allocator);
        assert_eq!(closed.commands, vec![Command::SetPipeline(pipeline)]);
        assert!(!list.is_open());
        assert!(list.commands().is_empty());
    }

    #[test]
    #[should_panic(expected = "closed command list")]
    fn recording_into_a_closed_list_panics() {
        let mut pipelines: SlotMap<PipelineHandle, ()> = SlotMap::with_key();
        let mut list = CommandList::new();
        list.record(Command::SetPipeline(pipelines.insert(())));
    }
}
