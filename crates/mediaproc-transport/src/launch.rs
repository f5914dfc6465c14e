//! Contract for running the media main loop inside the browser process.

use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use tokio::runtime::Handle;

/// Everything an in-process media thread needs to talk to its host.
pub struct InProcessChildParams {
    pub channel_name: String,
    /// Child end of the host channel socket pair.
    pub stream: UnixStream,
    /// IO runtime shared with the browser.
    pub io: Handle,
    /// Where per-renderer rendezvous sockets are created.
    pub runtime_dir: PathBuf,
}

/// A running in-process media thread.
pub trait InProcessChild: Send {
    /// Ask the thread to stop. Does not wait for it.
    fn stop(&mut self);
}

/// Starts the media main loop on a thread of the current process.
/// Registered by whoever links both the browser and the media side.
pub trait InProcessChildFactory: Send + Sync {
    fn start(&self, params: InProcessChildParams) -> anyhow::Result<Box<dyn InProcessChild>>;
}
