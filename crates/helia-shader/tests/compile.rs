//! End-to-end compilation tests. These run the real shaderc front-end but
//! need no GPU.

use helia_shader::{DefineMap, ShaderSource};
use std::path::PathBuf;

fn defines(pairs: &[(&str, &str)]) -> DefineMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Write a shader to a unique temp path.
fn write_shader(name: &str, text: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("helia-shader-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, text).unwrap();
    path
}

const COUNTER_COMP: &str = r#"#version 460
layout(local_size_x = 16, local_size_y = 16) in;

layout(binding = 0) buffer counters
{
    uint value[];
};

layout(push_constant) uniform push_constants
{
    uint offset;
} control;

void main()
{
    value[gl_GlobalInvocationID.x] = gl_GlobalInvocationID.y + control.offset
#ifdef K
        + K
#endif
        ;
}
"#;

#[test]
fn compile_reflects_bindings_and_push_constants() {
    let path = write_shader("counter.comp", COUNTER_COMP);
    let source = ShaderSource::compile(&path, &defines(&[])).unwrap();

    assert!(!source.spirv.is_empty());
    // SPIR-V magic number.
    assert_eq!(source.spirv[0], 0x0723_0203);

    assert_eq!(source.binding_names.get("counters"), Some(&0));
    assert_eq!(source.bindings.len(), 1);
    assert_eq!(source.push_constant_ranges.len(), 1);
    assert!(source.push_constant_ranges[0].size >= 4);
}

#[test]
fn identical_inputs_compile_to_identical_binaries() {
    let path = write_shader("cache_determinism.comp", COUNTER_COMP);
    let d = defines(&[("K", "3")]);

    let first = ShaderSource::compile(&path, &d).unwrap();
    let second = ShaderSource::compile(&path, &d).unwrap();

    assert_eq!(first.spirv, second.spirv);
    assert_eq!(first.bindings, second.bindings);
    assert_eq!(first.binding_names, second.binding_names);
}

#[test]
fn different_defines_compile_to_distinct_binaries() {
    let path = write_shader("distinct_defines.comp", COUNTER_COMP);

    let with_k = ShaderSource::compile(&path, &defines(&[("K", "7")])).unwrap();
    let without = ShaderSource::compile(&path, &defines(&[])).unwrap();
    assert_ne!(with_k.spirv, without.spirv);
}

#[test]
fn define_value_newlines_cannot_define_more_symbols() {
    // The injected value collapses to one line, so EVIL never becomes a
    // macro; if it did, the #error below would fire.
    let guarded = r#"#version 460
layout(local_size_x = 1) in;
#ifdef EVIL
#error EVIL must not be defined
#endif
void main() {}
"#;
    let path = write_shader("evil.comp", guarded);
    let result = ShaderSource::compile(&path, &defines(&[("K", "1\n#define EVIL 2")]));
    assert!(result.is_ok());
}

#[test]
fn missing_file_is_asset_missing() {
    let result = ShaderSource::compile("does_not_exist.comp", &defines(&[]));
    match result {
        Err(helia_core::RenderError::AssetMissing(_)) => {}
        other => panic!("expected AssetMissing, got {other:?}"),
    }
}

#[test]
fn broken_source_is_compile_error() {
    let path = write_shader("broken.comp", "#version 460\nvoid main() { this is not glsl }\n");
    match ShaderSource::compile(&path, &defines(&[])) {
        Err(helia_core::RenderError::Compile { log, .. }) => {
            assert!(!log.is_empty());
        }
        other => panic!("expected Compile error, got {other:?}"),
    }
}

#[test]
fn includes_resolve_relative_to_source() {
    let dir_marker = write_shader("common.glsl", "const float SHARED_CONSTANT = 2.0;\n");
    let including = r#"#version 460
#extension GL_GOOGLE_include_directive : enable
layout(local_size_x = 1) in;
#include "common.glsl"
layout(binding = 0) buffer out_data { float value; };
void main() { value = SHARED_CONSTANT; }
"#;
    let _ = dir_marker;
    let path = write_shader("including.comp", including);
    let source = ShaderSource::compile(&path, &defines(&[])).unwrap();
    assert!(!source.spirv.is_empty());
}
