use ash::extensions::khr::Surface;
use ash::vk::{self, SurfaceKHR};
use ash::Device;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::device_context::DeviceContext;
use crate::error::VkCallError;
use crate::image_resource::create_image_view;
use crate::vk_check;
use crate::vk_instance::Vulkan;

/// Swapchain whose images are filled by transfer copies, not render passes.
pub struct Swapchain {
    device: Device,
    surface_loader: Surface,
    swapchain_loader: ash::extensions::khr::Swapchain,
    surface: SurfaceKHR,
    handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    acquire_semaphores: Vec<vk::Semaphore>,
    present_semaphores: Vec<vk::Semaphore>,
    current_semaphore: usize,
    format: vk::Format,
    width: u32,
    height: u32,
}

impl Swapchain {
    pub fn new(
        vulkan: &Vulkan,
        context: &DeviceContext,
        display: RawDisplayHandle,
        window: RawWindowHandle,
        width: u32,
        height: u32,
    ) -> Result<Self, VkCallError> {
        let surface_loader = Surface::new(vulkan.library(), vulkan.vk_instance());
        let surface = vk_check!(unsafe {
            ash_window::create_surface(
                vulkan.library(),
                vulkan.vk_instance(),
                display,
                window,
                None,
            )
        })?;

        let gpu = *context.gpu().vk_physical_device();
        let supported = vk_check!(unsafe {
            surface_loader.get_physical_device_surface_support(
                gpu,
                context.queue_family_index(),
                surface,
            )
        })?;
        if !supported {
            unsafe { surface_loader.destroy_surface(surface, None) };
            return Err(VkCallError::new(
                "get_physical_device_surface_support",
                file!(),
                line!(),
                vk::Result::ERROR_SURFACE_LOST_KHR,
            ));
        }

        let formats = vk_check!(unsafe {
            surface_loader.get_physical_device_surface_formats(gpu, surface)
        })?;
        let format = formats
            .iter()
            .copied()
            .find(|format| format.format == vk::Format::B8G8R8A8_UNORM)
            .or_else(|| formats.first().copied())
            .ok_or_else(|| {
                VkCallError::new(
                    "get_physical_device_surface_formats",
                    file!(),
                    line!(),
                    vk::Result::ERROR_FORMAT_NOT_SUPPORTED,
                )
            })?;

        let capabilities = vk_check!(unsafe {
            surface_loader.get_physical_device_surface_capabilities(gpu, surface)
        })?;
        let mut desired_image_count = capabilities.min_image_count + 1;
        if capabilities.max_image_count > 0 && desired_image_count > capabilities.max_image_count {
            desired_image_count = capabilities.max_image_count;
        }
        let surface_resolution = match capabilities.current_extent.width {
            std::u32::MAX => vk::Extent2D { width, height },
            _ => capabilities.current_extent,
        };
        let pre_transform = if capabilities
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            capabilities.current_transform
        };

        let swapchain_loader =
            ash::extensions::khr::Swapchain::new(vulkan.vk_instance(), context.vk_device());
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(desired_image_count)
            .image_color_space(format.color_space)
            .image_format(format.format)
            .image_extent(surface_resolution)
            .image_usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(vk::PresentModeKHR::FIFO)
            .clipped(true)
            .image_array_layers(1);

        let device = context.vk_device().clone();
        let handle = vk_check!(unsafe { swapchain_loader.create_swapchain(&create_info, None) })?;
        let images = vk_check!(unsafe { swapchain_loader.get_swapchain_images(handle) })?;
        let image_views = images
            .iter()
            .map(|&image| create_image_view(&device, image, format.format))
            .collect::<Result<Vec<_>, _>>()?;

        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let mut acquire_semaphores = Vec::with_capacity(images.len());
        let mut present_semaphores = Vec::with_capacity(images.len());
        for _ in 0..images.len() {
            acquire_semaphores.push(vk_check!(unsafe {
                device.create_semaphore(&semaphore_info, None)
            })?);
            present_semaphores.push(vk_check!(unsafe {
                device.create_semaphore(&semaphore_info, None)
            })?);
        }

        log::info!(
            "swapchain: {} images, {:?}, {}x{}",
            images.len(),
            format.format,
            surface_resolution.width,
            surface_resolution.height
        );

        Ok(Self {
            device,
            surface_loader,
            swapchain_loader,
            surface,
            handle,
            images,
            image_views,
            acquire_semaphores,
            present_semaphores,
            current_semaphore: 0,
            format: format.format,
            width: surface_resolution.width,
            height: surface_resolution.height,
        })
    }

    /// Acquires the next image. Returns its index and the semaphore that
    /// is signalled once the image is ready to be written.
    pub fn acquire(&mut self) -> Result<(u32, vk::Semaphore), VkCallError> {
        let semaphore = self.acquire_semaphores[self.current_semaphore];
        let (index, _suboptimal) = vk_check!(unsafe {
            self.swapchain_loader.acquire_next_image(
                self.handle,
                std::u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        })?;
        self.current_semaphore = (self.current_semaphore + 1) % self.acquire_semaphores.len();
        Ok((index, semaphore))
    }

    /// Which acquire semaphore the next [`acquire`](Self::acquire) signals.
    pub fn next_acquire_semaphore(&self) -> usize {
        self.current_semaphore
    }

    pub fn present_semaphore(&self, index: u32) -> vk::Semaphore {
        self.present_semaphores[index as usize]
    }

    pub fn present(&self, queue: vk::Queue, index: u32) -> Result<(), VkCallError> {
        let wait = [self.present_semaphores[index as usize]];
        let swapchains = [self.handle];
        let indices = [index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait)
            .swapchains(&swapchains)
            .image_indices(&indices);

        vk_check!(unsafe { self.swapchain_loader.queue_present(queue, &present_info) })
            .map(|_suboptimal| ())
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn image_view(&self, index: usize) -> vk::ImageView {
        self.image_views[index]
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for view in &self.image_views {
                self.device.destroy_image_view(*view, None);
            }
            for semaphore in self
                .acquire_semaphores
                .iter()
                .chain(self.present_semaphores.iter())
            {
                self.device.destroy_semaphore(*semaphore, None);
            }
            self.swapchain_loader.destroy_swapchain(self.handle, None);
            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}
