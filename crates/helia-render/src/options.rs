//! Stage option records.
//!
//! Option records share fields by composition: per-stage options embed the
//! common ray-tracing options value and add their own fields beside it.

use helia_shader::DefineMap;
use serde::{Deserialize, Serialize};

/// Pixel reconstruction filter for camera rays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilmFilter {
    Point,
    Box,
    BlackmanHarris,
}

/// Options common to every ray-tracing camera stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtStageOptions {
    /// Maximum ray recursion / bounce depth.
    pub max_ray_depth: u32,
    /// Self-intersection epsilon for secondary rays.
    pub min_ray_dist: f32,
    /// Size of the bindless material texture table (count override for the
    /// `textures` binding).
    pub max_textures: u32,
    /// Size of the 3D texture table (`textures3d` binding).
    pub max_3d_textures: u32,
    /// Viewports actually rendered this frame; the rest are filled by
    /// spatial reprojection.
    pub active_viewport_count: u32,
}

impl Default for RtStageOptions {
    fn default() -> Self {
        Self {
            max_ray_depth: 4,
            min_ray_dist: 1.0e-4,
            max_textures: 256,
            max_3d_textures: 32,
            active_viewport_count: 1,
        }
    }
}

impl RtStageOptions {
    /// Defines shared by all ray-tracing camera stages.
    pub fn common_defines(&self, defines: &mut DefineMap) {
        defines.insert(
            "CAMERA_COUNT".to_string(),
            self.active_viewport_count.max(1).to_string(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_defines_include_camera_count() {
        let mut opt = RtStageOptions::default();
        opt.active_viewport_count = 5;
        let mut defines = DefineMap::new();
        opt.common_defines(&mut defines);
        assert_eq!(defines.get("CAMERA_COUNT").map(String::as_str), Some("5"));
    }
}
