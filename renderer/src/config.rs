use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{RenderError, Result};
use crate::headless::GpuProgress;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HeadlessConfig {
    /// Ticks to run before shutting down.
    pub frames: u32,
    pub progress: GpuProgress,
    /// Where to write the last presented frame as PNG.
    pub dump: Option<PathBuf>,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            frames: 10,
            progress: GpuProgress::Latency(2),
            dump: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    pub width: u32,
    pub height: u32,
    /// Number of swap targets, and so the ring depth.
    pub buffer_count: u32,
    pub max_recursion_depth: u32,
    pub max_payload_bytes: u32,
    pub max_attribute_bytes: u32,
    pub noise_seed: u64,
    pub shader_dir: PathBuf,
    pub validation: bool,
    pub headless: HeadlessConfig,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            buffer_count: 3,
            max_recursion_depth: 5,
            max_payload_bytes: 10 * std::mem::size_of::<f32>() as u32,
            max_attribute_bytes: 32,
            noise_seed: 0x5eed,
            shader_dir: PathBuf::from("shaders"),
            validation: cfg!(debug_assertions),
            headless: HeadlessConfig::default(),
        }
    }
}

impl RendererConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|error| RenderError::Config(error.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|error| RenderError::Config(format!("{}: {}", path.display(), error)))?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(RenderError::Config(format!(
                "output size {}x{} is empty",
                self.width, self.height
            )));
        }
        if !(2..=8).contains(&self.buffer_count) {
            return Err(RenderError::Config(format!(
                "buffer_count {} is outside 2..=8",
                self.buffer_count
            )));
        }
        if self.max_recursion_depth == 0 || self.max_recursion_depth > 31 {
            return Err(RenderError::Config(format!(
                "max_recursion_depth {} is outside 1..=31",
                self.max_recursion_depth
            )));
        }
        if self.max_payload_bytes == 0 {
            return Err(RenderError::Config("max_payload_bytes is zero".into()));
        }
        Ok(())
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.width as f32 / self.height as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = RendererConfig::default();
        config.validate().unwrap();
        assert_eq!(config.buffer_count, 3);
        assert_eq!(config.max_payload_bytes, 40);
        assert_eq!(config.max_recursion_depth, 5);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = RendererConfig::from_json(
            r#"{ "width": 320, "height": 200, "headless": { "frames": 4, "progress": "stalled" } }"#,
        )
        .unwrap();
        assert_eq!((config.width, config.height), (320, 200));
        assert_eq!(config.buffer_count, 3);
        assert_eq!(config.headless.frames, 4);
        assert_eq!(config.headless.progress, GpuProgress::Stalled);
    }

    #[test]
    fn latency_progress_parses() {
        let config =
            RendererConfig::from_json(r#"{ "headless": { "progress": { "latency": 3 } } }"#)
                .unwrap();
        assert_eq!(config.headless.progress, GpuProgress::Latency(3));
    }

    #[test]
    fn rejects_out_of_range_values() {
        for json in [
            r#"{ "buffer_count": 1 }"#,
            r#"{ "buffer_count": 9 }"#,
            r#"{ "max_recursion_depth": 0 }"#,
            r#"{ "max_recursion_depth": 32 }"#,
            r#"{ "width": 0 }"#,
        ] {
            assert!(
                matches!(RendererConfig::from_json(json), Err(RenderError::Config(_))),
                "{} should be rejected",
                json
            );
        }
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        assert!(matches!(
            RendererConfig::from_json("{ width: "),
            Err(RenderError::Config(_))
        ));
    }
}
