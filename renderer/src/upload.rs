use crate::commands::CommandList;
use crate::device::{BufferDesc, BufferHandle, BufferUsage, MemoryLocation, RayTracingDevice};
use crate::error::Result;
use crate::fence::{Fence, Ticket};
use crate::resource_state::ResourceState;

/// Runs `record` with a staging buffer holding `data`, submits and flushes
/// the list, then releases the staging buffer. The list is closed on return.
pub fn with_staging<D, F, R>(
    device: &mut D,
    fence: &mut Fence,
    list: &mut CommandList,
    data: &[u8],
    record: F,
) -> Result<(R, Ticket)>
where
    D: RayTracingDevice,
    F: FnOnce(&mut D, &mut CommandList, BufferHandle) -> Result<R>,
{
    let staging = device.create_buffer(&BufferDesc {
        label: "staging",
        size: data.len() as u64,
        location: MemoryLocation::Upload,
        usage: BufferUsage::Staging,
        initial_state: ResourceState::GenericRead,
    })?;

    match fill_and_submit(device, fence, list, staging, data, record) {
        Ok(value) => {
            device.destroy_buffer(staging)?;
            log::debug!("released {} byte staging buffer", data.len());
            Ok(value)
        }
        Err(error) => {
            list.close();
            // Whatever was submitted may still read the buffer.
            match fence.flush(device) {
                Ok(_) => {
                    if let Err(cleanup) = device.destroy_buffer(staging) {
                        log::warn!("staging buffer leaked: {}", cleanup);
                    }
                }
                Err(cleanup) => log::warn!("staging buffer kept, flush failed: {}", cleanup),
            }
            Err(error)
        }
    }
}

fn fill_and_submit<D, F, R>(
    device: &mut D,
    fence: &mut Fence,
    list: &mut CommandList,
    staging: BufferHandle,
    data: &[u8],
    record: F,
) -> Result<(R, Ticket)>
where
    D: RayTracingDevice,
    F: FnOnce(&mut D, &mut CommandList, BufferHandle) -> Result<R>,
{
    device.write_buffer(staging, 0, data)?;
    let value = record(device, list, staging)?;
    let ticket = fence.submit(device, list)?;
    fence.flush(device)?;
    Ok((value, ticket))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{GpuProgress, HeadlessDevice};

    #[test]
    fn failed_upload_releases_staging_and_closes_the_list() {
        let mut device = HeadlessDevice::new(4, 4, 1, GpuProgress::Immediate);
        let mut fence = Fence::new();
        let mut list = CommandList::new();
        list.begin(device.create_command_allocator().unwrap());
        let before = device.live_buffers();

        device.fail_next_write("mapping lost");
        let result = with_staging(&mut device, &mut fence, &mut list, &[1; 16], |_, _, _| Ok(()));

        assert!(result.is_err());
        assert!(!list.is_open());
        assert_eq!(device.live_buffers(), before);
    }
}
