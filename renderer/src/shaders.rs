use std::collections::HashMap;
use std::path::Path;

use vk_utils::shader_library::load_spirv;

use crate::error::{RenderError, Result};

/// Compiled SPIR-V keyed by export name.
#[derive(Debug, Clone, Default)]
pub struct ShaderLibrary {
    blobs: HashMap<String, Vec<u32>>,
}

/// Header of a SPIR-V 1.5 module with no instructions.
const EMPTY_MODULE: [u32; 5] = [0x0723_0203, 0x0001_0500, 0, 1, 0];

impl ShaderLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `<dir>/<export>.spv` for every export.
    pub fn load(dir: &Path, exports: &[&str]) -> Result<Self> {
        let mut library = Self::new();
        for export in exports {
            let path = dir.join(format!("{}.spv", export));
            let code = load_spirv(&path)
                .map_err(|error| RenderError::Shader(format!("{}: {}", path.display(), error)))?;
            log::debug!("loaded {} ({} words)", path.display(), code.len());
            library.insert(export, code);
        }
        Ok(library)
    }

    /// Instruction-free modules for devices that never execute shader code.
    pub fn empty_modules(exports: &[&str]) -> Self {
        let mut library = Self::new();
        for export in exports {
            library.insert(export, EMPTY_MODULE.to_vec());
        }
        library
    }

    pub fn insert(&mut self, export: &str, code: Vec<u32>) {
        self.blobs.insert(export.to_string(), code);
    }

    pub fn get(&self, export: &str) -> Result<&[u32]> {
        self.blobs
            .get(export)
            .map(Vec::as_slice)
            .ok_or_else(|| RenderError::Shader(format!("no blob for export {}", export)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_export_is_a_shader_error() {
        let library = ShaderLibrary::empty_modules(&["rayGen"]);
        assert!(library.get("rayGen").is_ok());
        assert!(matches!(library.get("miss"), Err(RenderError::Shader(_))));
    }

    #[test]
    fn load_reports_the_missing_file() {
        let dir = std::env::temp_dir().join("renderer-shader-library-missing");
        let error = ShaderLibrary::load(&dir, &["rayGen"]).unwrap_err();
        assert!(error.to_string().contains("rayGen.spv"));
    }
}
