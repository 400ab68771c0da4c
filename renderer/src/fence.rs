//! CPU/GPU handshake.
//!
//! One monotonically increasing counter. Every submission signals
//! `previous + 1`; the CPU learns that GPU work has finished only by observing
//! the counter, never by looking at resources.

use crate::commands::CommandList;
use crate::device::RayTracingDevice;
use crate::error::{DeviceCallError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticket(pub u64);

impl Ticket {
    pub fn value(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    AlreadySatisfied,
    Blocked,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FenceStats {
    pub submissions: u64,
    /// Waits in [`Fence::wait_until`] that had to block. Flushes are not counted.
    pub blocking_waits: u64,
    pub flushes: u64,
}

#[derive(Debug, Default)]
pub struct Fence {
    value: u64,
    stats: FenceStats,
}

impl Fence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_signaled(&self) -> Ticket {
        Ticket(self.value)
    }

    pub fn stats(&self) -> FenceStats {
        self.stats
    }

    /// Closes `list`, submits it and returns the ticket its completion signals.
    #[track_caller]
    pub fn submit<D: RayTracingDevice>(
        &mut self,
        device: &mut D,
        list: &mut CommandList,
    ) -> Result<Ticket> {
        let closed = list
            .close()
            .ok_or_else(|| DeviceCallError::at_caller("submit", "command list is not open"))?;

        let next = self.value + 1;
        device.execute(closed.allocator, &closed.commands, next)?;
        self.value = next;
        self.stats.submissions += 1;

        log::trace!(
            "submitted {} commands as ticket {}",
            closed.commands.len(),
            next
        );
        Ok(Ticket(next))
    }

    pub fn is_complete<D: RayTracingDevice>(&self, device: &D, ticket: Ticket) -> Result<bool> {
        Ok(device.completed_value()? >= ticket.0)
    }

    pub fn wait_until<D: RayTracingDevice>(
        &mut self,
        device: &mut D,
        ticket: Ticket,
    ) -> Result<WaitOutcome> {
        if self.is_complete(device, ticket)? {
            return Ok(WaitOutcome::AlreadySatisfied);
        }

        log::debug!(
            "waiting for ticket {} (gpu at {})",
            ticket.0,
            device.completed_value()?
        );
        device.wait_for_value(ticket.0)?;
        self.stats.blocking_waits += 1;
        debug_assert!(device.completed_value()? >= ticket.0);
        Ok(WaitOutcome::Blocked)
    }

    /// Signals a fresh value behind all submitted work and waits for it.
    pub fn flush<D: RayTracingDevice>(&mut self, device: &mut D) -> Result<Ticket> {
        let next = self.value + 1;
        device.signal(next)?;
        self.value = next;
        if device.completed_value()? < next {
            device.wait_for_value(next)?;
        }
        self.stats.flushes += 1;
        log::debug!("flushed through ticket {}", next);
        Ok(Ticket(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{GpuProgress, HeadlessDevice};

    fn device(progress: GpuProgress) -> HeadlessDevice {
        HeadlessDevice::new(8, 8, 3, progress)
    }

    #[test]
    fn tickets_increase_by_one() {
        let mut device = device(GpuProgress::Stalled);
        let mut fence = Fence::new();
        let allocator = device.create_command_allocator().unwrap();

        let mut tickets = Vec::new();
        for _ in 0..4 {
            let mut list = CommandList::new();
            list.begin(allocator);
            tickets.push(fence.submit(&mut device, &mut list).unwrap());
            fence.wait_until(&mut device, *tickets.last().unwrap()).unwrap();
            device.reset_command_allocator(allocator).unwrap();
        }

        assert_eq!(tickets, vec![Ticket(1), Ticket(2), Ticket(3), Ticket(4)]);
        assert_eq!(fence.stats().submissions, 4);
    }

    #[test]
    fn wait_until_blocks_only_when_needed() {
        let mut device = device(GpuProgress::Stalled);
        let mut fence = Fence::new();
        let allocator = device.create_command_allocator().unwrap();
        let mut list = CommandList::new();
        list.begin(allocator);
        let ticket = fence.submit(&mut device, &mut list).unwrap();

        assert!(!fence.is_complete(&device, ticket).unwrap());
        assert_eq!(
            fence.wait_until(&mut device, ticket).unwrap(),
            WaitOutcome::Blocked
        );
        assert!(device.completed_value().unwrap() >= ticket.0);
        assert_eq!(
            fence.wait_until(&mut device, ticket).unwrap(),
            WaitOutcome::AlreadySatisfied
        );
        assert_eq!(fence.stats().blocking_waits, 1);
    }

    #[test]
    fn flush_retires_everything() {
        let mut device = device(GpuProgress::Stalled);
        let mut fence = Fence::new();
        let allocator = device.create_command_allocator().unwrap();
        let mut list = CommandList::new();
        list.begin(allocator);
        let submitted = fence.submit(&mut device, &mut list).unwrap();

        let flushed = fence.flush(&mut device).unwrap();

        assert!(flushed > submitted);
        assert_eq!(device.completed_value().unwrap(), flushed.0);
        assert_eq!(fence.stats().flushes, 1);
        assert_eq!(fence.stats().blocking_waits, 0);
    }

    #[test]
    fn submitting_a_closed_list_fails() {
        let mut device = device(GpuProgress::Immediate);
        let mut fence = Fence::new();
        let mut list = CommandList::new();
        assert!(fence.submit(&mut device, &mut list).is_err());
        assert_eq!(fence.last_signaled(), Ticket(0));
    }
}
