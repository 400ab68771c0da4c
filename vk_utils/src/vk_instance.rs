use ash::extensions::ext::DebugUtils;
use ash::vk::{
    self, ApplicationInfo, Bool32, DebugUtilsMessageSeverityFlagsEXT,
    DebugUtilsMessageTypeFlagsEXT, DebugUtilsMessengerCallbackDataEXT,
    DebugUtilsMessengerCreateInfoEXT, DebugUtilsMessengerEXT, InstanceCreateInfo, QueueFlags,
};
use ash::{Entry, Instance};
use parking_lot::Mutex;
use raw_window_handle::RawDisplayHandle;
use std::borrow::Cow;
use std::ffi::{CStr, CString};
use std::sync::Arc;

use crate::error::VkCallError;
use crate::gpu::Gpu;
use crate::vk_check;

const VALIDATION_LAYER: &[u8] = b"VK_LAYER_KHRONOS_validation\0";

/// Validation messages waiting to be attached to the next reported failure.
pub type DebugMessageQueue = Arc<Mutex<Vec<String>>>;

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: DebugUtilsMessageSeverityFlagsEXT,
    message_type: DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const DebugUtilsMessengerCallbackDataEXT,
    user_data: *mut std::os::raw::c_void,
) -> Bool32 {
    let callback_data = *p_callback_data;

    let message_id_name = if callback_data.p_message_id_name.is_null() {
        Cow::from("")
    } else {
        CStr::from_ptr(callback_data.p_message_id_name).to_string_lossy()
    };

    let message = if callback_data.p_message.is_null() {
        Cow::from("")
    } else {
        CStr::from_ptr(callback_data.p_message).to_string_lossy()
    };

    let text = format!("{:?} [{}] : {}", message_type, message_id_name, message);

    if message_severity.contains(DebugUtilsMessageSeverityFlagsEXT::ERROR)
        || message_severity.contains(DebugUtilsMessageSeverityFlagsEXT::WARNING)
    {
        log::warn!("{}", text);
        if !user_data.is_null() {
            let queue = &*(user_data as *const Mutex<Vec<String>>);
            queue.lock().push(text);
        }
    } else {
        log::debug!("{}", text);
    }

    vk::FALSE
}

pub struct Vulkan {
    library: Entry,
    instance: Instance,
    debug: Option<(DebugUtils, DebugUtilsMessengerEXT)>,
    messages: DebugMessageQueue,
}

impl Vulkan {
    pub fn new(
        name: &str,
        display: Option<RawDisplayHandle>,
        validation: bool,
    ) -> Result<Self, VkCallError> {
        let library = unsafe { Entry::load() }.map_err(|error| {
            log::error!("unable to load the Vulkan library: {}", error);
            VkCallError::new(
                "Entry::load()",
                file!(),
                line!(),
                vk::Result::ERROR_INITIALIZATION_FAILED,
            )
        })?;

        let c_name = CString::new(name).unwrap_or_default();
        let appinfo = ApplicationInfo::builder()
            .application_name(&c_name)
            .application_version(0)
            .engine_name(&c_name)
            .engine_version(0)
            .api_version(vk::make_api_version(0, 1, 2, 0));

        let mut extension_names_raw: Vec<*const i8> = match display {
            Some(display) => {
                vk_check!(ash_window::enumerate_required_extensions(display))?.to_vec()
            }
            None => Vec::new(),
        };

        let layers_names_raw: Vec<*const i8> = if validation {
            extension_names_raw.push(DebugUtils::name().as_ptr());
            vec![VALIDATION_LAYER.as_ptr() as *const i8]
        } else {
            Vec::new()
        };

        let create_info = InstanceCreateInfo::builder()
            .application_info(&appinfo)
            .enabled_layer_names(&layers_names_raw)
            .enabled_extension_names(&extension_names_raw);

        let instance = vk_check!(unsafe { library.create_instance(&create_info, None) })?;

        let messages: DebugMessageQueue = Arc::new(Mutex::new(Vec::new()));
        let debug = if validation {
            let debug_info = DebugUtilsMessengerCreateInfoEXT::builder()
                .message_severity(
                    DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | DebugUtilsMessageSeverityFlagsEXT::INFO,
                )
                .message_type(
                    DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(vulkan_debug_callback))
                .user_data(Arc::as_ptr(&messages) as *mut std::os::raw::c_void);

            let loader = DebugUtils::new(&library, &instance);
            let messenger =
                vk_check!(unsafe { loader.create_debug_utils_messenger(&debug_info, None) })?;
            Some((loader, messenger))
        } else {
            None
        };

        Ok(Self {
            library,
            instance,
            debug,
            messages,
        })
    }

    pub fn library(&self) -> &Entry {
        &self.library
    }

    pub fn vk_instance(&self) -> &Instance {
        &self.instance
    }

    pub fn drain_messages(&self) -> Vec<String> {
        std::mem::take(&mut *self.messages.lock())
    }

    /// Every physical device with a queue family supporting `flags`.
    pub fn hardware_devices_with_queue_support(
        &self,
        flags: QueueFlags,
    ) -> Result<Vec<Gpu>, VkCallError> {
        let physical_devices = vk_check!(unsafe { self.instance.enumerate_physical_devices() })?;
        Ok(physical_devices
            .into_iter()
            .filter_map(|physical_device| {
                unsafe {
                    self.instance
                        .get_physical_device_queue_family_properties(physical_device)
                }
                .iter()
                .position(|info| info.queue_flags.contains(flags))
                .map(|index| Gpu::new(&self.instance, physical_device, index as u32))
            })
            .collect())
    }
}

impl Drop for Vulkan {
    fn drop(&mut self) {
        unsafe {
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}
