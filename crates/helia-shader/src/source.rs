//! Shader source loading, define splicing, compilation and reflection.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ash::vk;
use hashbrown::HashMap;
use helia_core::{resource_path, RenderError, Result};

use crate::cache;

/// Compile-time defines injected into a shader. Ordered so that the spliced
/// text (and therefore the cache key) is deterministic.
pub type DefineMap = BTreeMap<String, String>;

/// Shader stage, detected from the source file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStageKind {
    Vertex,
    TessControl,
    TessEvaluation,
    Geometry,
    Fragment,
    Compute,
    RayGeneration,
    Intersection,
    AnyHit,
    ClosestHit,
    Miss,
}

impl ShaderStageKind {
    /// Detect the stage from a file extension such as `rgen` or `comp`.
    pub fn from_extension(ext: &str) -> Result<Self> {
        Ok(match ext {
            "vert" => Self::Vertex,
            "tesc" => Self::TessControl,
            "tese" => Self::TessEvaluation,
            "geom" => Self::Geometry,
            "frag" => Self::Fragment,
            "comp" => Self::Compute,
            "rgen" => Self::RayGeneration,
            "rint" => Self::Intersection,
            "rahit" => Self::AnyHit,
            "rchit" => Self::ClosestHit,
            "rmiss" => Self::Miss,
            other => {
                return Err(RenderError::Other(format!(
                    "unknown shader extension .{other}"
                )))
            }
        })
    }

    pub fn shaderc_kind(self) -> shaderc::ShaderKind {
        match self {
            Self::Vertex => shaderc::ShaderKind::Vertex,
            Self::TessControl => shaderc::ShaderKind::TessControl,
            Self::TessEvaluation => shaderc::ShaderKind::TessEvaluation,
            Self::Geometry => shaderc::ShaderKind::Geometry,
            Self::Fragment => shaderc::ShaderKind::Fragment,
            Self::Compute => shaderc::ShaderKind::Compute,
            Self::RayGeneration => shaderc::ShaderKind::RayGeneration,
            Self::Intersection => shaderc::ShaderKind::Intersection,
            Self::AnyHit => shaderc::ShaderKind::AnyHit,
            Self::ClosestHit => shaderc::ShaderKind::ClosestHit,
            Self::Miss => shaderc::ShaderKind::Miss,
        }
    }

    pub fn stage_flags(self) -> vk::ShaderStageFlags {
        match self {
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::TessControl => vk::ShaderStageFlags::TESSELLATION_CONTROL,
            Self::TessEvaluation => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
            Self::Geometry => vk::ShaderStageFlags::GEOMETRY,
            Self::Fragment => vk::ShaderStageFlags::FRAGMENT,
            Self::Compute => vk::ShaderStageFlags::COMPUTE,
            Self::RayGeneration => vk::ShaderStageFlags::RAYGEN_KHR,
            Self::Intersection => vk::ShaderStageFlags::INTERSECTION_KHR,
            Self::AnyHit => vk::ShaderStageFlags::ANY_HIT_KHR,
            Self::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            Self::Miss => vk::ShaderStageFlags::MISS_KHR,
        }
    }
}

/// One reflected descriptor binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    /// Zero for unsized (bindless) arrays; sized via count overrides when the
    /// pipeline layout is built.
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

/// A compiled, reflected shader stage.
#[derive(Debug, Clone, Default)]
pub struct ShaderSource {
    pub path: PathBuf,
    pub spirv: Vec<u32>,
    pub stages: vk::ShaderStageFlags,
    pub bindings: Vec<ShaderBinding>,
    pub push_constant_ranges: Vec<vk::PushConstantRange>,
    pub binding_names: HashMap<String, u32>,
}

impl ShaderSource {
    /// Compile a shader from `path` with the given defines spliced in.
    ///
    /// The compilation result is cached process-wide by the final spliced
    /// source text; identical `(path, defines)` pairs compile exactly once.
    pub fn compile(path: impl AsRef<Path>, defines: &DefineMap) -> Result<Self> {
        let path = resource_path(path.as_ref());
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default();
        let kind = ShaderStageKind::from_extension(ext)?;
        let include_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let text = std::fs::read_to_string(&path)
            .map_err(|_| RenderError::AssetMissing(path.display().to_string()))?;
        let spliced = splice_defines(&text, defines);

        if let Some(cached) = cache::lookup(&spliced) {
            return Ok(cached);
        }

        let source = compile_spliced(&path, kind, &spliced, &include_dir)?;
        cache::store(&spliced, &source);
        Ok(source)
    }

    /// Compile without defines.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::compile(path, &DefineMap::new())
    }

    /// Whether this slot holds a compiled stage.
    pub fn is_empty(&self) -> bool {
        self.spirv.is_empty()
    }
}

/// Render the define map as `#define K V` lines. Newlines in values are
/// stripped so a value cannot smuggle in further directives.
fn generate_definition_src(defines: &DefineMap) -> String {
    let mut out = String::new();
    for (key, value) in defines {
        let value: String = value.chars().filter(|&c| c != '\n' && c != '\r').collect();
        out.push_str("#define ");
        out.push_str(key);
        if !value.is_empty() {
            out.push(' ');
            out.push_str(&value);
        }
        out.push('\n');
    }
    out
}

/// Splice defines into GLSL source, immediately after the `#version` line
/// terminator, or prepended when no `#version` directive exists.
pub fn splice_defines(src: &str, defines: &DefineMap) -> String {
    let definition_src = generate_definition_src(defines);
    if definition_src.is_empty() {
        return src.to_string();
    }
    match src.find("#version") {
        None => format!("{definition_src}{src}"),
        Some(offset) => {
            // Insert after the directive's line terminator. A #version on the
            // last line without a newline keeps the terminator we add.
            let line_end = src[offset..]
                .find('\n')
                .map(|end| offset + end + 1)
                .unwrap_or(src.len());
            let mut out = String::with_capacity(src.len() + definition_src.len() + 1);
            out.push_str(&src[..line_end]);
            if !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&definition_src);
            out.push_str(&src[line_end..]);
            out
        }
    }
}

fn compile_spliced(
    path: &Path,
    kind: ShaderStageKind,
    spliced: &str,
    include_dir: &Path,
) -> Result<ShaderSource> {
    let compiler = shaderc::Compiler::new()
        .ok_or_else(|| RenderError::Other("failed to initialize shaderc".to_string()))?;
    let mut options = shaderc::CompileOptions::new()
        .ok_or_else(|| RenderError::Other("failed to create shaderc options".to_string()))?;
    options.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_2 as u32,
    );
    options.set_target_spirv(shaderc::SpirvVersion::V1_5);
    options.set_generate_debug_info();

    let include_root = include_dir.to_path_buf();
    options.set_include_callback(move |name, _ty, _requester, _depth| {
        let local = include_root.join(name);
        let resolved = if local.exists() {
            local
        } else {
            resource_path(name)
        };
        let content = std::fs::read_to_string(&resolved)
            .map_err(|e| format!("cannot open include {name}: {e}"))?;
        Ok(shaderc::ResolvedInclude {
            resolved_name: resolved.display().to_string(),
            content,
        })
    });

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("shader");

    let artifact = compiler
        .compile_into_spirv(spliced, kind.shaderc_kind(), file_name, "main", Some(&options))
        .map_err(|err| classify_compile_error(path, err))?;

    let stages = kind.stage_flags();
    let spirv_bytes = artifact.as_binary_u8().to_vec();
    let (bindings, binding_names, push_constant_ranges) =
        reflect(path, &spirv_bytes, stages)?;

    Ok(ShaderSource {
        path: path.to_path_buf(),
        spirv: artifact.as_binary().to_vec(),
        stages,
        bindings,
        push_constant_ranges,
        binding_names,
    })
}

fn classify_compile_error(path: &Path, err: shaderc::Error) -> RenderError {
    let path = path.display().to_string();
    match err {
        shaderc::Error::CompilationError(_, log) if log.contains("Link") => {
            RenderError::Link { path, log }
        }
        shaderc::Error::CompilationError(_, log) => RenderError::Compile { path, log },
        other => RenderError::Compile {
            path,
            log: other.to_string(),
        },
    }
}

/// Reflect descriptor bindings and push constants from SPIR-V.
///
/// Reflection is authoritative here: the compiler's own metadata misses
/// blocks that contain unsized arrays.
fn reflect(
    path: &Path,
    spirv: &[u8],
    stages: vk::ShaderStageFlags,
) -> Result<(
    Vec<ShaderBinding>,
    HashMap<String, u32>,
    Vec<vk::PushConstantRange>,
)> {
    let reflect_err = |detail: String| RenderError::Reflect {
        path: path.display().to_string(),
        detail,
    };

    let module = rspirv_reflect::Reflection::new_from_spirv(spirv)
        .map_err(|e| reflect_err(e.to_string()))?;

    let mut bindings = Vec::new();
    let mut binding_names = HashMap::new();
    let sets = module
        .get_descriptor_sets()
        .map_err(|e| reflect_err(e.to_string()))?;
    for (set, set_bindings) in sets {
        if set != 0 {
            return Err(reflect_err(format!(
                "descriptor set {set} used; only set 0 is supported"
            )));
        }
        for (slot, info) in set_bindings {
            let count = match info.binding_count {
                rspirv_reflect::BindingCount::One => 1,
                rspirv_reflect::BindingCount::StaticSized(n) => n as u32,
                // Unsized arrays get their real size from count overrides.
                rspirv_reflect::BindingCount::Unbounded => 0,
            };
            bindings.push(ShaderBinding {
                binding: slot,
                descriptor_type: vk::DescriptorType::from_raw(info.ty.0 as i32),
                count,
                stages,
            });
            binding_names.insert(info.name.clone(), slot);
        }
    }

    let mut push_constant_ranges = Vec::new();
    if let Some(range) = module
        .get_push_constant_range()
        .map_err(|e| reflect_err(e.to_string()))?
    {
        push_constant_ranges.push(
            vk::PushConstantRange::default()
                .stage_flags(stages)
                .offset(range.offset)
                .size(range.size),
        );
    }

    Ok((bindings, binding_names, push_constant_ranges))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defines(pairs: &[(&str, &str)]) -> DefineMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn extension_detection() {
        assert_eq!(
            ShaderStageKind::from_extension("rgen").unwrap(),
            ShaderStageKind::RayGeneration
        );
        assert_eq!(
            ShaderStageKind::from_extension("comp").unwrap(),
            ShaderStageKind::Compute
        );
        assert!(ShaderStageKind::from_extension("glslx").is_err());
    }

    #[test]
    fn splice_after_version_keeps_line() {
        let src = "#version 460\nlayout(local_size_x = 16) in;\nvoid main() {}\n";
        let out = splice_defines(&src, &defines(&[("MAX_BOUNCES", "4")]));

        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "#version 460");
        assert_eq!(lines[1], "#define MAX_BOUNCES 4");
        assert_eq!(lines[2], "layout(local_size_x = 16) in;");
    }

    #[test]
    fn splice_without_version_prepends() {
        let src = "void main() {}\n";
        let out = splice_defines(src, &defines(&[("K", "1")]));
        assert!(out.starts_with("#define K 1\n"));
        assert!(out.ends_with(src));
    }

    #[test]
    fn splice_version_on_later_line() {
        let src = "// header\n#version 450\nvoid main() {}\n";
        let out = splice_defines(src, &defines(&[("A", "")]));
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[1], "#version 450");
        assert_eq!(lines[2], "#define A");
    }

    #[test]
    fn define_values_cannot_inject_directives() {
        // A newline inside the value must collapse to a single #define line.
        let out = splice_defines(
            "#version 460\nvoid main() {}\n",
            &defines(&[("K", "1\n#define EVIL 2")]),
        );
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[1], "#define K 1#define EVIL 2");
        assert!(!lines.iter().any(|l| l.starts_with("#define EVIL")));
    }

    #[test]
    fn definition_src_is_sorted_and_deterministic() {
        let a = generate_definition_src(&defines(&[("B", "2"), ("A", "1")]));
        let b = generate_definition_src(&defines(&[("A", "1"), ("B", "2")]));
        assert_eq!(a, b);
        assert_eq!(a, "#define A 1\n#define B 2\n");
    }

    #[test]
    fn empty_defines_leave_source_untouched() {
        let src = "#version 460\nvoid main() {}\n";
        assert_eq!(splice_defines(src, &DefineMap::new()), src);
    }
}
