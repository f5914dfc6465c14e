//! Renderer side of the out-of-process media stack: per-player dispatchers
//! multiplexed over one channel to the media process.

pub mod browser;
pub mod channel_host;
pub mod client;
pub mod dispatcher;
pub mod error;
pub mod media_source;

pub use browser::BrowserChannel;
pub use channel_host::MediaPlayerChannelHost;
pub use client::{dispatch_event, run_event_loop, MediaPlayerClient};
pub use dispatcher::MediaPlayerDispatcher;
pub use error::RendererError;
pub use media_source::MediaSourceProxy;
