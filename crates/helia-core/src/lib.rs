//! Shared types for the Helia rendering core.
//!
//! This crate provides:
//! - Error kinds used across the renderer
//! - Frame timing aggregation
//! - Process-wide resource root configuration

pub mod error;
pub mod resource;
pub mod timing;

pub use error::{RenderError, Result};
pub use resource::{resource_path, set_resource_root};
pub use timing::{TimingRecord, TimingStats};
