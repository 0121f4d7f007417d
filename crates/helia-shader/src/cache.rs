//! Process-wide shader binary cache.
//!
//! SPIR-V is platform independent, so compiled binaries are shared across
//! devices. The cache is keyed by the full spliced source text: two
//! different define sets over the same file are distinct entries, and
//! identical inputs compile exactly once. Entries live until an explicit
//! [`clear_binary_cache`] (hot reload) or process exit.

use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::OnceLock;

use crate::source::ShaderSource;

static BINARIES: OnceLock<Mutex<HashMap<String, ShaderSource>>> = OnceLock::new();

fn cache() -> &'static Mutex<HashMap<String, ShaderSource>> {
    BINARIES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Look up a compiled shader by its spliced source text.
pub(crate) fn lookup(spliced_src: &str) -> Option<ShaderSource> {
    cache().lock().get(spliced_src).cloned()
}

/// Store a compiled shader under its spliced source text.
pub(crate) fn store(spliced_src: &str, source: &ShaderSource) {
    cache()
        .lock()
        .insert(spliced_src.to_string(), source.clone());
}

/// Number of cached binaries.
pub fn binary_cache_len() -> usize {
    cache().lock().len()
}

/// Drop every cached binary. Used by the hot-reload path so edited sources
/// recompile.
pub fn clear_binary_cache() {
    let mut cache = cache().lock();
    tracing::debug!("clearing {} cached shader binaries", cache.len());
    cache.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_and_lookup_round_trip() {
        clear_binary_cache();
        assert!(lookup("#version 460\nA").is_none());

        let source = ShaderSource {
            spirv: vec![0x0723_0203, 42],
            ..Default::default()
        };
        store("#version 460\nA", &source);

        let hit = lookup("#version 460\nA").unwrap();
        assert_eq!(hit.spirv, source.spirv);
        // A different spliced text is a different entry.
        assert!(lookup("#version 460\nB").is_none());

        clear_binary_cache();
        assert!(lookup("#version 460\nA").is_none());
    }
}
