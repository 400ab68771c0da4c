//! Explicit per-resource state table.

use std::collections::HashMap;

use crate::commands::{Barrier, Command, CommandList};
use crate::device::{BufferHandle, TextureHandle};
use crate::error::{RenderError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Common,
    CopySource,
    CopyDestination,
    UnorderedAccess,
    RenderTarget,
    Present,
    GenericRead,
    AccelerationStructure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Buffer(BufferHandle),
    Texture(TextureHandle),
}

impl From<BufferHandle> for ResourceId {
    fn from(handle: BufferHandle) -> Self {
        ResourceId::Buffer(handle)
    }
}

impl From<TextureHandle> for ResourceId {
    fn from(handle: TextureHandle) -> Self {
        ResourceId::Texture(handle)
    }
}

/// Whether a single barrier may move a resource between `a` and `b`.
pub fn is_valid_edge(a: ResourceState, b: ResourceState) -> bool {
    use ResourceState::*;

    if a == b {
        return false;
    }
    if a == Common || b == Common {
        return true;
    }
    matches!(
        (a, b),
        (Present, CopyDestination)
            | (CopyDestination, Present)
            | (CopyDestination, CopySource)
            | (CopySource, CopyDestination)
            | (UnorderedAccess, CopySource)
            | (CopySource, UnorderedAccess)
            | (GenericRead, CopyDestination)
            | (CopyDestination, GenericRead)
            | (RenderTarget, Present)
            | (Present, RenderTarget)
    )
}

#[derive(Debug, Default)]
pub struct ResourceStateTracker {
    states: HashMap<ResourceId, ResourceState>,
}

impl ResourceStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, resource: impl Into<ResourceId>, state: ResourceState) {
        self.states.insert(resource.into(), state);
    }

    pub fn forget(&mut self, resource: impl Into<ResourceId>) {
        self.states.remove(&resource.into());
    }

    pub fn state(&self, resource: impl Into<ResourceId>) -> Option<ResourceState> {
        self.states.get(&resource.into()).copied()
    }

    /// Records a barrier moving `resource` from `from` to `to`.
    ///
    /// `from` must match the recorded state. Returns whether a barrier was
    /// emitted; `from == to` emits nothing.
    pub fn transition(
        &mut self,
        list: &mut CommandList,
        resource: impl Into<ResourceId>,
        from: ResourceState,
        to: ResourceState,
    ) -> Result<bool> {
        let resource = resource.into();
        let recorded = self.recorded(resource)?;
        if recorded != from {
            return Err(RenderError::StateMismatch {
                resource,
                recorded,
                expected: from,
            });
        }
        if from == to {
            return Ok(false);
        }
        if !is_valid_edge(from, to) {
            return Err(RenderError::InvalidTransition { resource, from, to });
        }

        list.record(Command::Barrier(Barrier::Transition { resource, from, to }));
        self.states.insert(resource, to);
        Ok(true)
    }

    pub fn transition_to(
        &mut self,
        list: &mut CommandList,
        resource: impl Into<ResourceId>,
        to: ResourceState,
    ) -> Result<bool> {
        let resource = resource.into();
        let from = self.recorded(resource)?;
        self.transition(list, resource, from, to)
    }

    /// Puts back the states that the transitions in a discarded list moved
    /// resources out of.
    pub fn rollback(&mut self, discarded: &[Command]) {
        for command in discarded.iter().rev() {
            if let Command::Barrier(Barrier::Transition { resource, from, .. }) = command {
                self.states.insert(*resource, *from);
            }
        }
    }

    /// Orders every write to `resource` before any later read or write of it.
    pub fn uav_barrier(
        &mut self,
        list: &mut CommandList,
        resource: impl Into<ResourceId>,
    ) -> Result<()> {
        let resource = resource.into();
        self.recorded(resource)?;
        list.record(Command::Barrier(Barrier::Uav { resource }));
        Ok(())
    }

    fn recorded(&self, resource: ResourceId) -> Result<ResourceState> {
        self.states
            .get(&resource)
            .copied()
            .ok_or(RenderError::UntrackedResource(resource))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::AllocatorHandle;
    use slotmap::SlotMap;

    fn open_list() -> CommandList {
        let mut allocators: SlotMap<AllocatorHandle, ()> = SlotMap::with_key();
        let mut list = CommandList::new();
        list.begin(allocators.insert(()));
        list
    }

    fn texture() -> TextureHandle {
        let mut textures: SlotMap<TextureHandle, ()> = SlotMap::with_key();
        textures.insert(())
    }

    #[test]
    fn emits_one_barrier_per_real_change() {
        let mut list = open_list();
        let mut tracker = ResourceStateTracker::new();
        let output = texture();
        tracker.register(output, ResourceState::CopySource);

        assert!(tracker
            .transition(
                &mut list,
                output,
                ResourceState::CopySource,
                ResourceState::UnorderedAccess
            )
            .unwrap());
        assert!(!tracker
            .transition(
                &mut list,
                output,
                ResourceState::UnorderedAccess,
                ResourceState::UnorderedAccess
            )
            .unwrap());

        assert_eq!(list.commands().len(), 1);
        assert_eq!(
            tracker.state(output),
            Some(ResourceState::UnorderedAccess)
        );
    }

    #[test]
    fn rollback_restores_states_from_a_discarded_list() {
        let mut list = open_list();
        let mut tracker = ResourceStateTracker::new();
        let output = texture();
        tracker.register(output, ResourceState::CopySource);

        tracker
            .transition_to(&mut list, output, ResourceState::UnorderedAccess)
            .unwrap();
        tracker
            .transition_to(&mut list, output, ResourceState::CopySource)
            .unwrap();
        tracker
            .transition_to(&mut list, output, ResourceState::CopyDestination)
            .unwrap();

        let discarded = list.close().unwrap();
        tracker.rollback(&discarded.commands);
        assert_eq!(tracker.state(output), Some(ResourceState::CopySource));
    }

    #[test]
    fn rejects_a_stale_belief() {
        let mut list = open_list();
        let mut tracker = ResourceStateTracker::new();
        let target = texture();
        tracker.register(target, ResourceState::Present);

        let error = tracker
            .transition(
                &mut list,
                target,
                ResourceState::CopyDestination,
                ResourceState::Present,
            )
            .unwrap_err();
        assert!(matches!(
            error,
            RenderError::StateMismatch {
                recorded: ResourceState::Present,
                expected: ResourceState::CopyDestination,
                ..
            }
        ));
        assert!(list.commands().is_empty());
    }

    #[test]
    fn rejects_edges_outside_the_graph() {
        let mut list = open_list();
        let mut tracker = ResourceStateTracker::new();
        let output = texture();
        tracker.register(output, ResourceState::UnorderedAccess);

        let error = tracker
            .transition_to(&mut list, output, ResourceState::Present)
            .unwrap_err();
        assert!(matches!(error, RenderError::InvalidTransition { .. }));
        assert_eq!(
            tracker.state(output),
            Some(ResourceState::UnorderedAccess)
        );
    }

    #[test]
    fn untracked_resources_are_an_error() {
        let mut list = open_list();
        let mut tracker = ResourceStateTracker::new();
        let output = texture();
        assert!(matches!(
            tracker.uav_barrier(&mut list, output),
            Err(RenderError::UntrackedResource(_))
        ));
    }

    #[test]
    fn edge_table_is_symmetric_and_irreflexive() {
        use ResourceState::*;
        let all = [
            Common,
            CopySource,
            CopyDestination,
            UnorderedAccess,
            RenderTarget,
            Present,
            GenericRead,
            AccelerationStructure,
        ];
        for a in all {
            assert!(!is_valid_edge(a, a));
            for b in all {
                assert_eq!(is_valid_edge(a, b), is_valid_edge(b, a));
            }
        }
        assert!(!is_valid_edge(UnorderedAccess, Present));
        assert!(!is_valid_edge(AccelerationStructure, UnorderedAccess));
    }
}
