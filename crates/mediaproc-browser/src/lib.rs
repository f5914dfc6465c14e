//! Browser side of the out-of-process media stack: launches and tracks
//! media processes, and hands renderers channels to them.

pub mod command_line;
pub mod config;
pub mod data_manager;
pub mod host;
pub mod io_thread;
pub mod launcher;
pub mod message_filter;
pub mod registry;
pub mod service;
pub mod termination;
pub mod ui;

pub use command_line::CommandLine;
pub use config::MediaHostConfig;
pub use data_manager::{LogMessage, MediaDataManager, MediaDataManagerObserver};
pub use host::{MediaProcessHost, MediaProcessKind};
pub use io_thread::{EstablishOutcome, IoHandle};
pub use message_filter::MediaMessageFilter;
pub use registry::MediaProcessRegistry;
pub use service::MediaHostService;
pub use termination::TerminationStatus;
