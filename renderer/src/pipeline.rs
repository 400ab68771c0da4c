//! Ray tracing pipeline description as a flat list of subobjects.

use std::collections::HashSet;

use crate::bindings::binding_layout;
use crate::config::RendererConfig;
use crate::device::BindingLayout;
use crate::error::{RenderError, Result};
use crate::shaders::ShaderLibrary;

pub mod exports {
    pub const RAY_GENERATION: &str = "rayGen";
    pub const MISS: &str = "miss";
    pub const INTERSECTION: &str = "intersection";
    pub const CLOSEST_HIT: &str = "chs";
    pub const HIT_GROUP: &str = "HitGroup";

    /// Exports backed by a shader blob.
    pub const SHADERS: [&str; 4] = [RAY_GENERATION, MISS, INTERSECTION, CLOSEST_HIT];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    RayGeneration,
    Miss,
    Intersection,
    AnyHit,
    ClosestHit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitGroupKind {
    Triangles,
    ProceduralPrimitive,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineSubobject {
    ShaderLibrary {
        export: String,
        stage: ShaderStage,
        code: Vec<u32>,
    },
    HitGroup {
        name: String,
        kind: HitGroupKind,
        intersection: Option<String>,
        any_hit: Option<String>,
        closest_hit: Option<String>,
    },
    ShaderConfig {
        max_payload_bytes: u32,
        max_attribute_bytes: u32,
    },
    /// Applies the subobject at `subobject` to the listed exports.
    ExportAssociation {
        exports: Vec<String>,
        subobject: usize,
    },
    PipelineConfig {
        max_recursion_depth: u32,
    },
    GlobalRootSignature(BindingLayout),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineDesc {
    pub subobjects: Vec<PipelineSubobject>,
}

impl PipelineDesc {
    pub fn push(&mut self, subobject: PipelineSubobject) -> usize {
        self.subobjects.push(subobject);
        self.subobjects.len() - 1
    }

    pub fn shaders(&self) -> impl Iterator<Item = (&str, ShaderStage, &[u32])> {
        self.subobjects.iter().filter_map(|subobject| match subobject {
            PipelineSubobject::ShaderLibrary {
                export,
                stage,
                code,
            } => Some((export.as_str(), *stage, code.as_slice())),
            _ => None,
        })
    }

    pub fn hit_groups(&self) -> impl Iterator<Item = &PipelineSubobject> {
        self.subobjects
            .iter()
            .filter(|subobject| matches!(subobject, PipelineSubobject::HitGroup { .. }))
    }

    /// Every name a shader identifier can be requested for.
    pub fn exports(&self) -> Vec<&str> {
        self.subobjects
            .iter()
            .filter_map(|subobject| match subobject {
                PipelineSubobject::ShaderLibrary { export, .. } => Some(export.as_str()),
                PipelineSubobject::HitGroup { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn max_recursion_depth(&self) -> Option<u32> {
        self.subobjects.iter().find_map(|subobject| match subobject {
            PipelineSubobject::PipelineConfig {
                max_recursion_depth,
            } => Some(*max_recursion_depth),
            _ => None,
        })
    }

    pub fn root_signature(&self) -> Option<&BindingLayout> {
        self.subobjects.iter().find_map(|subobject| match subobject {
            PipelineSubobject::GlobalRootSignature(layout) => Some(layout),
            _ => None,
        })
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for name in self.exports() {
            if !names.insert(name) {
                return Err(RenderError::InvalidPipeline(format!(
                    "export {} is defined twice",
                    name
                )));
            }
        }

        let stage_of = |export: &str| {
            self.shaders()
                .find(|(name, _, _)| *name == export)
                .map(|(_, stage, _)| stage)
        };

        for group in self.hit_groups() {
            if let PipelineSubobject::HitGroup {
                name,
                kind,
                intersection,
                any_hit,
                closest_hit,
            } = group
            {
                let imports = [
                    (intersection, ShaderStage::Intersection),
                    (any_hit, ShaderStage::AnyHit),
                    (closest_hit, ShaderStage::ClosestHit),
                ];
                for (import, stage) in imports {
                    if let Some(import) = import {
                        if stage_of(import) != Some(stage) {
                            return Err(RenderError::InvalidPipeline(format!(
                                "hit group {} imports {} which is not a {:?} shader",
                                name, import, stage
                            )));
                        }
                    }
                }
                if *kind == HitGroupKind::ProceduralPrimitive && intersection.is_none() {
                    return Err(RenderError::InvalidPipeline(format!(
                        "procedural hit group {} has no intersection shader",
                        name
                    )));
                }
            }
        }

        for subobject in &self.subobjects {
            if let PipelineSubobject::ExportAssociation { exports, subobject } = subobject {
                if !matches!(
                    self.subobjects.get(*subobject),
                    Some(PipelineSubobject::ShaderConfig { .. })
                ) {
                    return Err(RenderError::InvalidPipeline(format!(
                        "association targets subobject {} which is not a shader config",
                        subobject
                    )));
                }
                if let Some(unknown) = exports.iter().find(|e| !names.contains(e.as_str())) {
                    return Err(RenderError::InvalidPipeline(format!(
                        "association names unknown export {}",
                        unknown
                    )));
                }
            }
        }

        let count = |predicate: fn(&PipelineSubobject) -> bool| {
            self.subobjects.iter().filter(|s| predicate(s)).count()
        };
        if count(|s| matches!(s, PipelineSubobject::PipelineConfig { .. })) != 1 {
            return Err(RenderError::InvalidPipeline(
                "exactly one pipeline config is required".into(),
            ));
        }
        if count(|s| matches!(s, PipelineSubobject::GlobalRootSignature(_))) != 1 {
            return Err(RenderError::InvalidPipeline(
                "exactly one global root signature is required".into(),
            ));
        }
        Ok(())
    }
}

/// The fixed sphere-tracing pipeline.
pub fn ray_tracing_pipeline(shaders: &ShaderLibrary, config: &RendererConfig) -> Result<PipelineDesc> {
    let mut desc = PipelineDesc::default();

    let stages = [
        (exports::RAY_GENERATION, ShaderStage::RayGeneration),
        (exports::MISS, ShaderStage::Miss),
        (exports::INTERSECTION, ShaderStage::Intersection),
        (exports::CLOSEST_HIT, ShaderStage::ClosestHit),
    ];
    for (export, stage) in stages {
        desc.push(PipelineSubobject::ShaderLibrary {
            export: export.to_string(),
            stage,
            code: shaders.get(export)?.to_vec(),
        });
    }

    desc.push(PipelineSubobject::HitGroup {
        name: exports::HIT_GROUP.to_string(),
        kind: HitGroupKind::ProceduralPrimitive,
        intersection: Some(exports::INTERSECTION.to_string()),
        any_hit: None,
        closest_hit: Some(exports::CLOSEST_HIT.to_string()),
    });

    let shader_config = desc.push(PipelineSubobject::ShaderConfig {
        max_payload_bytes: config.max_payload_bytes,
        max_attribute_bytes: config.max_attribute_bytes,
    });
    desc.push(PipelineSubobject::ExportAssociation {
        exports: vec![
            exports::RAY_GENERATION.to_string(),
            exports::MISS.to_string(),
            exports::HIT_GROUP.to_string(),
        ],
        subobject: shader_config,
    });
    desc.push(PipelineSubobject::PipelineConfig {
        max_recursion_depth: config.max_recursion_depth,
    });
    desc.push(PipelineSubobject::GlobalRootSignature(binding_layout()));

    desc.validate()?;
    Ok(desc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_pipeline() -> PipelineDesc {
        let shaders = ShaderLibrary::empty_modules(&exports::SHADERS);
        ray_tracing_pipeline(&shaders, &RendererConfig::default()).unwrap()
    }

    #[test]
    fn fixed_pipeline_exposes_five_exports() {
        let desc = fixed_pipeline();
        assert_eq!(
            desc.exports(),
            vec!["rayGen", "miss", "intersection", "chs", "HitGroup"]
        );
        assert_eq!(desc.max_recursion_depth(), Some(5));
        assert!(desc.root_signature().is_some());
    }

    #[test]
    fn duplicate_exports_are_rejected() {
        let mut desc = fixed_pipeline();
        desc.push(PipelineSubobject::ShaderLibrary {
            export: "miss".into(),
            stage: ShaderStage::Miss,
            code: Vec::new(),
        });
        assert!(matches!(desc.validate(), Err(RenderError::InvalidPipeline(_))));
    }

    #[test]
    fn hit_group_must_import_the_right_stage() {
        let mut desc = fixed_pipeline();
        for subobject in desc.subobjects.iter_mut() {
            if let PipelineSubobject::HitGroup { closest_hit, .. } = subobject {
                *closest_hit = Some(exports::MISS.to_string());
            }
        }
        assert!(matches!(desc.validate(), Err(RenderError::InvalidPipeline(_))));
    }

    #[test]
    fn association_must_target_a_shader_config() {
        let mut desc = fixed_pipeline();
        desc.push(PipelineSubobject::ExportAssociation {
            exports: vec![exports::MISS.to_string()],
            subobject: 0,
        });
        assert!(matches!(desc.validate(), Err(RenderError::InvalidPipeline(_))));
    }

    #[test]
    fn missing_blob_fails_assembly() {
        let shaders = ShaderLibrary::empty_modules(&[exports::RAY_GENERATION]);
        assert!(matches!(
            ray_tracing_pipeline(&shaders, &RendererConfig::default()),
            Err(RenderError::Shader(_))
        ));
    }
}
