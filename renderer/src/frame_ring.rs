use crate::device::{AllocatorHandle, RayTracingDevice, TextureHandle, TextureViewHandle};
use crate::error::{DeviceCallError, Result};
use crate::fence::{Fence, Ticket, WaitOutcome};
use crate::resource_state::{ResourceState, ResourceStateTracker};

#[derive(Debug)]
pub struct FrameSlot {
    pub allocator: AllocatorHandle,
    pub target: TextureHandle,
    pub target_view: TextureViewHandle,
    /// The newest submission recorded through `allocator`.
    pub last_ticket: Option<Ticket>,
    pub resets: u64,
}

/// One slot per swap target. The display decides which slot is next.
#[derive(Debug)]
pub struct FrameRing {
    slots: Vec<FrameSlot>,
}

impl FrameRing {
    pub fn new<D: RayTracingDevice>(
        device: &mut D,
        tracker: &mut ResourceStateTracker,
    ) -> Result<Self> {
        let targets = device.present_targets().to_vec();
        let mut slots = Vec::with_capacity(targets.len());
        for target in targets {
            let allocator = device.create_command_allocator()?;
            let target_view = device.create_target_view(target)?;
            tracker.register(target, ResourceState::Present);
            slots.push(FrameSlot {
                allocator,
                target,
                target_view,
                last_ticket: None,
                resets: 0,
            });
        }
        log::info!("frame ring with {} slots", slots.len());
        Ok(Self { slots })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, index: usize) -> &FrameSlot {
        &self.slots[index]
    }

    pub fn slots(&self) -> &[FrameSlot] {
        &self.slots
    }

    /// The slot the display designates for the next frame.
    #[track_caller]
    pub fn acquire<D: RayTracingDevice>(&self, device: &mut D) -> Result<usize> {
        let index = device.current_target_index()?;
        if index >= self.slots.len() {
            return Err(DeviceCallError::at_caller(
                "current_target_index",
                format!("index {} outside a ring of {}", index, self.slots.len()),
            )
            .into());
        }
        Ok(index)
    }

    /// Makes the slot's allocator recordable again once the GPU is done with it.
    pub fn reclaim<D: RayTracingDevice>(
        &mut self,
        device: &mut D,
        fence: &mut Fence,
        index: usize,
    ) -> Result<WaitOutcome> {
        let slot = &mut self.slots[index];
        let outcome = match slot.last_ticket {
            Some(ticket) => fence.wait_until(device, ticket)?,
            None => WaitOutcome::AlreadySatisfied,
        };
        if outcome == WaitOutcome::Blocked {
            log::debug!("slot {} was still in flight", index);
        }
        device.reset_command_allocator(slot.allocator)?;
        slot.resets += 1;
        Ok(outcome)
    }

    pub fn mark_submitted(&mut self, index: usize, ticket: Ticket) {
        self.slots[index].last_ticket = Some(ticket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandList;
    use crate::headless::{GpuProgress, HeadlessDevice, PresentOrder};

    #[test]
    fn one_slot_per_present_target() {
        let mut device = HeadlessDevice::new(4, 4, 3, GpuProgress::Immediate);
        let mut tracker = ResourceStateTracker::new();
        let ring = FrameRing::new(&mut device, &mut tracker).unwrap();

        assert_eq!(ring.len(), 3);
        for (slot, target) in ring.slots().iter().zip(device.present_targets()) {
            assert_eq!(slot.target, *target);
            assert_eq!(tracker.state(slot.target), Some(ResourceState::Present));
        }
    }

    #[test]
    fn acquire_follows_the_display() {
        let mut device = HeadlessDevice::new(4, 4, 3, GpuProgress::Immediate)
            .with_present_order(PresentOrder::Sequence(vec![2, 0, 1]));
        let mut tracker = ResourceStateTracker::new();
        let ring = FrameRing::new(&mut device, &mut tracker).unwrap();

        assert_eq!(ring.acquire(&mut device).unwrap(), 2);
    }

    #[test]
    fn reclaim_waits_for_the_slot_ticket() {
        let mut device = HeadlessDevice::new(4, 4, 2, GpuProgress::Stalled);
        let mut tracker = ResourceStateTracker::new();
        let mut fence = Fence::new();
        let mut ring = FrameRing::new(&mut device, &mut tracker).unwrap();

        let mut list = CommandList::new();
        list.begin(ring.slot(0).allocator);
        let ticket = fence.submit(&mut device, &mut list).unwrap();
        ring.mark_submitted(0, ticket);

        assert_eq!(
            ring.reclaim(&mut device, &mut fence, 1).unwrap(),
            WaitOutcome::AlreadySatisfied
        );
        assert_eq!(
            ring.reclaim(&mut device, &mut fence, 0).unwrap(),
            WaitOutcome::Blocked
        );
        assert_eq!(ring.slot(0).resets, 1);
        assert_eq!(device.allocator_resets(ring.slot(0).allocator), 1);
    }
}
