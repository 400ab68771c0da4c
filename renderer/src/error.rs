use std::panic::Location;

use crate::resource_state::{ResourceId, ResourceState};

/// A failed call into the device, with enough context to find the call site.
#[derive(Debug, Clone, thiserror::Error)]
#[error(
    "{call}\n[ File: {file} | Line: {line} ]\nError: {message}{}",
    trailing_lines(.debug_messages)
)]
pub struct DeviceCallError {
    pub call: String,
    pub file: &'static str,
    pub line: u32,
    pub message: String,
    pub debug_messages: Vec<String>,
}

impl DeviceCallError {
    pub fn new(
        call: impl Into<String>,
        file: &'static str,
        line: u32,
        message: impl Into<String>,
    ) -> Self {
        Self {
            call: call.into(),
            file,
            line,
            message: message.into(),
            debug_messages: Vec::new(),
        }
    }

    /// Builds an error located at whoever called the function that failed.
    #[track_caller]
    pub fn at_caller(call: impl Into<String>, message: impl Into<String>) -> Self {
        let location = Location::caller();
        Self::new(call, location.file(), location.line(), message)
    }

    pub fn with_debug_messages(mut self, messages: Vec<String>) -> Self {
        self.debug_messages.extend(messages);
        self
    }
}

fn trailing_lines(messages: &[String]) -> String {
    messages.iter().map(|message| format!("\n{}", message)).collect()
}

impl From<vk_utils::error::VkCallError> for DeviceCallError {
    fn from(error: vk_utils::error::VkCallError) -> Self {
        Self::new(
            error.call,
            error.file,
            error.line,
            format!("{:?}", error.result),
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("ray tracing is not supported on this device: {0}")]
    CapabilityMissing(String),

    #[error(transparent)]
    DeviceCall(#[from] DeviceCallError),

    #[error("device removed: {reason}")]
    DeviceRemoved { reason: String },

    #[error("{resource:?} is recorded as {recorded:?} but the caller expected {expected:?}")]
    StateMismatch {
        resource: ResourceId,
        recorded: ResourceState,
        expected: ResourceState,
    },

    #[error("no transition edge from {from:?} to {to:?} for {resource:?}")]
    InvalidTransition {
        resource: ResourceId,
        from: ResourceState,
        to: ResourceState,
    },

    #[error("{0:?} has no recorded state")]
    UntrackedResource(ResourceId),

    #[error("invalid pipeline description: {0}")]
    InvalidPipeline(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("shader library: {0}")]
    Shader(String),
}

impl From<vk_utils::error::VkCallError> for RenderError {
    fn from(error: vk_utils::error::VkCallError) -> Self {
        RenderError::DeviceCall(error.into())
    }
}

pub type Result<T> = std::result::Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_call_error_reports_location_and_messages() {
        let error = DeviceCallError::new("queue_submit", "device.rs", 42, "ERROR_DEVICE_LOST")
            .with_debug_messages(vec!["validation: fence reused".into()]);
        let text = error.to_string();
        assert!(text.starts_with("queue_submit\n[ File: device.rs | Line: 42 ]"));
        assert!(text.contains("Error: ERROR_DEVICE_LOST"));
        assert!(text.ends_with("validation: fence reused"));
    }

    #[test]
    fn at_caller_points_into_this_file() {
        let error = DeviceCallError::at_caller("write_buffer", "buffer in flight");
        assert!(error.file.ends_with("error.rs"));
    }
}
