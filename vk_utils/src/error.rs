use ash::vk;

/// A Vulkan call that returned a failure code.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{call}\n[ File: {file} | Line: {line} ]\nError: {result:?}")]
pub struct VkCallError {
    pub call: &'static str,
    pub file: &'static str,
    pub line: u32,
    pub result: vk::Result,
}

impl VkCallError {
    pub fn new(call: &'static str, file: &'static str, line: u32, result: vk::Result) -> Self {
        Self {
            call,
            file,
            line,
            result,
        }
    }

    pub fn is_device_lost(&self) -> bool {
        self.result == vk::Result::ERROR_DEVICE_LOST
    }
}

/// Evaluates a `VkResult` expression and turns a failure into a [`VkCallError`]
/// carrying the call text and its location.
#[macro_export]
macro_rules! vk_check {
    ($call:expr) => {
        $call.map_err(|result| {
            $crate::error::VkCallError::new(stringify!($call), file!(), line!(), result)
        })
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing() -> ash::prelude::VkResult<u32> {
        Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
    }

    #[test]
    fn vk_check_captures_call_site() {
        let error = vk_check!(failing()).unwrap_err();
        assert_eq!(error.call, "failing()");
        assert!(error.file.ends_with("error.rs"));
        assert_eq!(error.result, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert!(error.to_string().contains("[ File: "));
    }

    #[test]
    fn vk_check_passes_success_through() {
        let value: Result<u32, VkCallError> = vk_check!(Ok::<u32, vk::Result>(7));
        assert_eq!(value.unwrap(), 7);
    }
}
