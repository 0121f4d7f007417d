//! Camera data and sub-pixel jitter sequences.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec4};

/// Radical inverse in the given base; the workhorse of the low-discrepancy
/// jitter sequence.
fn radical_inverse(mut index: u32, base: u32) -> f32 {
    let inv_base = 1.0 / base as f32;
    let mut result = 0.0;
    let mut fraction = inv_base;
    while index > 0 {
        result += (index % base) as f32 * fraction;
        index /= base;
        fraction *= inv_base;
    }
    result
}

/// A lazy per-viewport sequence of (current, previous) sub-pixel offsets.
///
/// Offsets follow the Halton (2,3) sequence, centered on the pixel, in
/// units of pixels. TAA-family filters (temporal reprojection in SVGF,
/// accumulation in the path tracer film) consume both values.
#[derive(Debug, Clone)]
pub struct JitterSequence {
    index: u32,
    current: Vec2,
    previous: Vec2,
    enabled: bool,
}

impl Default for JitterSequence {
    fn default() -> Self {
        Self::new(true)
    }
}

impl JitterSequence {
    pub fn new(enabled: bool) -> Self {
        Self {
            index: 0,
            current: Vec2::ZERO,
            previous: Vec2::ZERO,
            enabled,
        }
    }

    /// Advance to the next offset. The first step initializes both current
    /// and previous to the same value so reprojection starts neutral.
    pub fn step(&mut self) {
        if !self.enabled {
            return;
        }
        let next = Vec2::new(
            radical_inverse(self.index + 1, 2) - 0.5,
            radical_inverse(self.index + 1, 3) - 0.5,
        );
        self.previous = if self.index == 0 { next } else { self.current };
        self.current = next;
        self.index += 1;
    }

    pub fn current(&self) -> Vec2 {
        self.current
    }

    pub fn previous(&self) -> Vec2 {
        self.previous
    }
}

/// Per-camera uniform block, tightly packed for the `camera` binding.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CameraUniforms {
    pub view: Mat4,
    pub view_inverse: Mat4,
    pub proj: Mat4,
    pub proj_inverse: Mat4,
    pub view_proj: Mat4,
    pub origin: Vec4,
    /// xy = current jitter, zw = previous jitter.
    pub jitter: Vec4,
}

/// One viewport's camera.
#[derive(Debug, Clone)]
pub struct Camera {
    pub view: Mat4,
    pub proj: Mat4,
    jitter: JitterSequence,
}

impl Camera {
    pub fn new(view: Mat4, proj: Mat4) -> Self {
        Self {
            view,
            proj,
            jitter: JitterSequence::default(),
        }
    }

    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.jitter = JitterSequence::new(enabled);
        self
    }

    pub fn view_projection(&self) -> Mat4 {
        self.proj * self.view
    }

    /// Advance the jitter sequence; call once per rendered frame.
    pub fn step_jitter(&mut self) {
        self.jitter.step();
    }

    pub fn jitter(&self) -> Vec2 {
        self.jitter.current()
    }

    pub fn previous_jitter(&self) -> Vec2 {
        self.jitter.previous()
    }

    /// Pack the GPU uniform block.
    pub fn uniforms(&self) -> CameraUniforms {
        let view_inverse = self.view.inverse();
        CameraUniforms {
            view: self.view,
            view_inverse,
            proj: self.proj,
            proj_inverse: self.proj.inverse(),
            view_proj: self.view_projection(),
            origin: view_inverse.col(3),
            jitter: Vec4::new(
                self.jitter.current().x,
                self.jitter.current().y,
                self.jitter.previous().x,
                self.jitter.previous().y,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halton_covers_unit_interval() {
        // First few Halton base-2 values: 1/2, 1/4, 3/4, 1/8...
        assert!((radical_inverse(1, 2) - 0.5).abs() < 1e-6);
        assert!((radical_inverse(2, 2) - 0.25).abs() < 1e-6);
        assert!((radical_inverse(3, 2) - 0.75).abs() < 1e-6);
        assert!((radical_inverse(1, 3) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn jitter_history_pairs() {
        let mut jitter = JitterSequence::default();
        jitter.step();
        // First frame has no real history; previous equals current.
        assert_eq!(jitter.current(), jitter.previous());

        let first = jitter.current();
        jitter.step();
        assert_eq!(jitter.previous(), first);
        assert_ne!(jitter.current(), first);
    }

    #[test]
    fn jitter_offsets_stay_subpixel() {
        let mut jitter = JitterSequence::default();
        for _ in 0..64 {
            jitter.step();
            let offset = jitter.current();
            assert!(offset.x > -0.5 && offset.x < 0.5);
            assert!(offset.y > -0.5 && offset.y < 0.5);
        }
    }

    #[test]
    fn disabled_jitter_stays_centered() {
        let mut jitter = JitterSequence::new(false);
        jitter.step();
        jitter.step();
        assert_eq!(jitter.current(), Vec2::ZERO);
        assert_eq!(jitter.previous(), Vec2::ZERO);
    }

    #[test]
    fn camera_uniforms_fit_expectations() {
        let camera = Camera::new(Mat4::IDENTITY, Mat4::IDENTITY);
        let uniforms = camera.uniforms();
        assert_eq!(uniforms.origin, Vec4::new(0.0, 0.0, 0.0, 1.0));
        assert_eq!(std::mem::size_of::<CameraUniforms>(), 5 * 64 + 2 * 16);
    }
}
