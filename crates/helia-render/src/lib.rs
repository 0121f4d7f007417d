//! Render stages and renderers for the Helia path-traced core.
//!
//! This crate holds:
//! - the scene view stages bind against
//! - the stage base (pre-recorded per-in-flight-frame command buffers)
//! - the concrete stage graphs: path tracer, Whitted, SH probe tracer,
//!   feature (G-buffer) stage, SVGF and BMFR denoisers, spatial
//!   reprojection and tonemapping
//! - renderer assembly wiring stages onto the frame orchestrator

pub mod bmfr;
pub mod camera;
pub mod envmap;
pub mod feature;
pub mod gbuffer;
pub mod options;
pub mod path_tracer;
pub mod renderer;
pub mod rt_stage;
pub mod scene;
pub mod sh_path_tracer;
pub mod spatial_reprojection;
pub mod stage;
pub mod svgf;
pub mod tonemap;
pub mod whitted;

pub use bmfr::{BmfrOptions, BmfrSettings, BmfrStage};
pub use camera::{Camera, CameraUniforms, JitterSequence};
pub use envmap::{AliasTable, EnvironmentProjection};
pub use feature::{Feature, FeatureStage, FeatureStageOptions};
pub use gbuffer::{allocate_gbuffer, GbufferResources, GbufferSpec};
pub use options::{FilmFilter, RtStageOptions};
pub use path_tracer::{PathTracerOptions, PathTracerStage};
pub use renderer::{DenoiserOptions, PathTracerRenderer, PathTracerRendererOptions, Renderer};
pub use scene::{EnvironmentMapView, SceneView, ShGridDesc, ShadowMapView};
pub use sh_path_tracer::{ShGridOutput, ShPathTracerOptions, ShPathTracerStage, MAX_SH_ORDER};
pub use spatial_reprojection::{SpatialReprojectionOptions, SpatialReprojectionStage};
pub use stage::{submit_stage, RenderStage, StageCommands, StageTimer};
pub use svgf::{SvgfOptions, SvgfStage};
pub use tonemap::{viewport_reorder_mask, TonemapOperator, TonemapOptions, TonemapStage};
pub use whitted::{WhittedOptions, WhittedStage};
