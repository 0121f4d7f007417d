//! Process-wide resource root.
//!
//! Shader paths are resolved relative to a configurable root directory, so
//! stages can refer to assets like `shader/svgf_temporal.comp` regardless of
//! the working directory.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static RESOURCE_ROOT: OnceLock<PathBuf> = OnceLock::new();

/// Configure the resource root. May be called once per process; later calls
/// are ignored and return `false`.
pub fn set_resource_root(root: impl Into<PathBuf>) -> bool {
    RESOURCE_ROOT.set(root.into()).is_ok()
}

/// Resolve a resource path. Paths that already exist are returned untouched;
/// otherwise the configured root is prepended.
pub fn resource_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if path.exists() {
        return path.to_path_buf();
    }
    match RESOURCE_ROOT.get() {
        Some(root) => root.join(path),
        None => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_paths_pass_through() {
        let dir = std::env::temp_dir();
        assert_eq!(resource_path(&dir), dir);
    }
}
