//! Wires the browser side of the media stack together: data manager, UI
//! thread, IO loop and host registry.

use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use mediaproc_transport::launch::InProcessChildFactory;
use mediaproc_transport::{ChannelError, ClientId};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::info;

use crate::config::MediaHostConfig;
use crate::data_manager::MediaDataManager;
use crate::host::LaunchContext;
use crate::io_thread::{IoHandle, IoThread};
use crate::message_filter::MediaMessageFilter;
use crate::registry::MediaProcessRegistry;
use crate::ui::{UiHandle, UiThread};

pub struct MediaHostService {
    runtime: Handle,
    io: IoHandle,
    io_thread: IoThread,
    ui: UiThread,
    data_manager: Arc<MediaDataManager>,
}

impl MediaHostService {
    /// Start the UI thread and the IO loop. `in_process_factory` is needed
    /// only when the configuration runs media in process.
    pub fn start(
        runtime: &Handle,
        config: &MediaHostConfig,
        data_manager: Arc<MediaDataManager>,
        in_process_factory: Option<Arc<dyn InProcessChildFactory>>,
    ) -> Result<Self> {
        let runtime_dir = config.runtime_dir();
        std::fs::create_dir_all(&runtime_dir)?;

        let (io, commands) = IoHandle::channel();
        let ui = UiThread::spawn(io.clone(), Arc::clone(&data_manager))?;
        let (events, host_events) = mpsc::unbounded_channel();
        let program = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("mediaproc-shell"));
        let ctx = LaunchContext {
            io: runtime.clone(),
            browser_command_line: Arc::new(config.browser_command_line(program)),
            in_process: config.media_in_process(),
            media_binary: config.process.media_binary.as_ref().map(PathBuf::from),
            runtime_dir,
            in_process_factory,
            events,
            ui: ui.handle(),
            data_manager: Arc::clone(&data_manager),
        };
        let io_thread = IoThread::spawn(runtime, MediaProcessRegistry::new(ctx), commands, host_events);
        info!(in_process = config.media_in_process(), "service: media host service started");
        Ok(Self {
            runtime: runtime.clone(),
            io,
            io_thread,
            ui,
            data_manager,
        })
    }

    pub fn io(&self) -> IoHandle {
        self.io.clone()
    }

    pub fn ui(&self) -> UiHandle {
        self.ui.handle()
    }

    pub fn data_manager(&self) -> &Arc<MediaDataManager> {
        &self.data_manager
    }

    /// Serve media channel requests from the renderer on `stream`.
    pub fn attach_renderer(&self, render_process_id: ClientId, stream: UnixStream) -> Result<MediaMessageFilter, ChannelError> {
        MediaMessageFilter::attach(&self.runtime, self.io.clone(), render_process_id, stream)
    }

    /// Tear down every host, then stop the IO loop and the UI thread.
    pub async fn shutdown(self) {
        self.io.shutdown().await;
        self.io_thread.join().await;
        // Host destruction posted its shim teardown; let it run first.
        let _ = self.ui.handle().call_async(|_| ()).await;
        drop(self.ui);
        info!("service: media host service stopped");
    }
}
