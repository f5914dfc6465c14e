//! The media process: hosts media players on behalf of renderers.

pub mod channel_filter;
pub mod child_thread;
pub mod fmp4;
pub mod gl;
pub mod headless;
pub mod log_forward;
pub mod media_source;
pub mod pipeline;
pub mod player;
pub mod player_channel;
pub mod sandbox;

pub use child_thread::{in_process_factory, ChildParams, InProcessMediaFactory, MainEvent, MediaChildThread};
pub use headless::HeadlessPipelineFactory;
pub use pipeline::{Pipeline, PipelineError, PipelineEvent, PipelineFactory};
