use ash::vk::{
    AccessFlags, CommandBuffer, CommandBufferAllocateInfo, CommandBufferBeginInfo,
    CommandBufferLevel, CommandBufferUsageFlags, CommandPool, CommandPoolCreateInfo,
    CommandPoolResetFlags, DependencyFlags, Image, ImageLayout, ImageMemoryBarrier,
    MemoryBarrier, PipelineStageFlags,
};
use ash::Device;

use crate::device_context::DeviceContext;
use crate::error::VkCallError;
use crate::image_resource::color_subresource_range;
use crate::vk_check;

/// One command pool owning exactly one primary command buffer.
pub struct CommandAllocator {
    device: Device,
    pool: CommandPool,
    command_buffer: CommandBuffer,
}

impl CommandAllocator {
    pub fn new(context: &DeviceContext) -> Result<Self, VkCallError> {
        let device = context.vk_device();
        let pool_info =
            CommandPoolCreateInfo::builder().queue_family_index(context.queue_family_index());
        let pool = vk_check!(unsafe { device.create_command_pool(&pool_info, None) })?;

        let allocate_info = CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = vk_check!(unsafe { device.allocate_command_buffers(&allocate_info) })?;

        Ok(Self {
            device: device.clone(),
            pool,
            command_buffer: buffers[0],
        })
    }

    pub fn native_handle(&self) -> CommandBuffer {
        self.command_buffer
    }

    pub fn reset(&self) -> Result<(), VkCallError> {
        vk_check!(unsafe {
            self.device
                .reset_command_pool(self.pool, CommandPoolResetFlags::empty())
        })
    }

    pub fn begin(&self) -> Result<(), VkCallError> {
        let info =
            CommandBufferBeginInfo::builder().flags(CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        vk_check!(unsafe { self.device.begin_command_buffer(self.command_buffer, &info) })
    }

    pub fn end(&self) -> Result<(), VkCallError> {
        vk_check!(unsafe { self.device.end_command_buffer(self.command_buffer) })
    }
}

impl Drop for CommandAllocator {
    fn drop(&mut self) {
        unsafe {
            self.device
                .free_command_buffers(self.pool, &[self.command_buffer]);
            self.device.destroy_command_pool(self.pool, None);
        }
    }
}

/// Access and stage that a layout is used with.
#[derive(Debug, Clone, Copy)]
pub struct LayoutUsage {
    pub layout: ImageLayout,
    pub access: AccessFlags,
    pub stage: PipelineStageFlags,
}

pub fn color_image_transition(
    device: &Device,
    command_buffer: CommandBuffer,
    image: Image,
    from: LayoutUsage,
    to: LayoutUsage,
) {
    let barrier = ImageMemoryBarrier::builder()
        .old_layout(from.layout)
        .new_layout(to.layout)
        .src_access_mask(from.access)
        .dst_access_mask(to.access)
        .image(image)
        .src_queue_family_index(ash::vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(ash::vk::QUEUE_FAMILY_IGNORED)
        .subresource_range(color_subresource_range())
        .build();

    unsafe {
        device.cmd_pipeline_barrier(
            command_buffer,
            from.stage,
            to.stage,
            DependencyFlags::BY_REGION,
            &[],
            &[],
            &[barrier],
        );
    }
}

pub fn memory_barrier(
    device: &Device,
    command_buffer: CommandBuffer,
    src: (AccessFlags, PipelineStageFlags),
    dst: (AccessFlags, PipelineStageFlags),
) {
    let barrier = MemoryBarrier::builder()
        .src_access_mask(src.0)
        .dst_access_mask(dst.0)
        .build();
    unsafe {
        device.cmd_pipeline_barrier(
            command_buffer,
            src.1,
            dst.1,
            DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        );
    }
}
