use crate::device_context::DeviceContext;
use crate::error::VkCallError;
use crate::memory::memory_type_index;
use crate::vk_check;

use ash::vk::{
    self, DeviceMemory, Extent3D, Format, Image, ImageAspectFlags, ImageCreateInfo, ImageLayout,
    ImageSubresourceRange, ImageType, ImageUsageFlags, ImageView, ImageViewCreateInfo,
    ImageViewType, MemoryAllocateInfo, MemoryPropertyFlags, SampleCountFlags, SharingMode,
};
use ash::Device;

pub fn color_subresource_range() -> ImageSubresourceRange {
    ImageSubresourceRange::builder()
        .aspect_mask(ImageAspectFlags::COLOR)
        .layer_count(1)
        .level_count(1)
        .build()
}

pub fn create_image_view(
    device: &Device,
    image: Image,
    format: Format,
) -> Result<ImageView, VkCallError> {
    let info = ImageViewCreateInfo::builder()
        .image(image)
        .view_type(ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(color_subresource_range());
    vk_check!(unsafe { device.create_image_view(&info, None) })
}

pub struct Image2DResource {
    device: Device,
    image: Image,
    view: ImageView,
    memory: DeviceMemory,
    format: Format,
    width: u32,
    height: u32,
}

impl Image2DResource {
    pub fn new(
        context: &DeviceContext,
        width: u32,
        height: u32,
        format: Format,
        usage: ImageUsageFlags,
    ) -> Result<Self, VkCallError> {
        let image_info = ImageCreateInfo::builder()
            .image_type(ImageType::TYPE_2D)
            .samples(SampleCountFlags::TYPE_1)
            .sharing_mode(SharingMode::EXCLUSIVE)
            .format(format)
            .extent(Extent3D {
                width,
                height,
                depth: 1,
            })
            .array_layers(1)
            .mip_levels(1)
            .initial_layout(ImageLayout::UNDEFINED)
            .usage(usage);

        let device = context.vk_device();
        unsafe {
            let image = vk_check!(device.create_image(&image_info, None))?;
            let memory_requirements = device.get_image_memory_requirements(image);
            let type_index = match memory_type_index(
                memory_requirements.memory_type_bits,
                context.gpu().memory_properties(),
                MemoryPropertyFlags::DEVICE_LOCAL,
            ) {
                Some(type_index) => type_index,
                None => {
                    device.destroy_image(image, None);
                    return Err(VkCallError::new(
                        "memory_type_index",
                        file!(),
                        line!(),
                        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
                    ));
                }
            };
            let allocation_info = MemoryAllocateInfo::builder()
                .memory_type_index(type_index)
                .allocation_size(memory_requirements.size);
            let memory = vk_check!(device.allocate_memory(&allocation_info, None))?;
            vk_check!(device.bind_image_memory(image, memory, 0))?;
            let view = create_image_view(device, image, format)?;

            Ok(Self {
                device: device.clone(),
                image,
                view,
                memory,
                format,
                width,
                height,
            })
        }
    }

    pub fn vk_image(&self) -> Image {
        self.image
    }

    pub fn view(&self) -> ImageView {
        self.view
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

impl Drop for Image2DResource {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image_view(self.view, None);
            self.device.destroy_image(self.image, None);
            self.device.free_memory(self.memory, None);
        }
    }
}
