//! Runtime shader pipeline for the Helia renderer.
//!
//! This crate turns GLSL source files into reflected SPIR-V binaries:
//! - feature-flag defines are spliced into the source text
//! - compilation results are cached process-wide by final source text
//! - descriptor bindings and push constants are recovered by SPIR-V
//!   reflection (compiler metadata is not trusted for unsized arrays)
//! - per-stage binding tables are merged into pipeline layouts

pub mod cache;
pub mod merge;
pub mod source;

pub use cache::clear_binary_cache;
pub use merge::{HitGroup, HitGroupKind, MergedBinding, ShaderSet};
pub use source::{DefineMap, ShaderBinding, ShaderSource, ShaderStageKind};
