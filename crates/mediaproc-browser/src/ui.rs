//! The browser UI thread and the per-host UI shims it owns.
//!
//! The shim id-map lives in [`UiState`], which only the UI thread can reach:
//! other threads post closures with [`UiHandle::post`] or wait for a result
//! with [`UiHandle::call`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use mediaproc_transport::{ControlMessage, HostId, LogLevel, Message};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::data_manager::MediaDataManager;
use crate::io_thread::IoHandle;

type UiTask = Box<dyn FnOnce(&mut UiState) + Send>;

enum UiMessage {
    Run(UiTask),
    Quit,
}

/// Posts work to the UI thread. Cheap to clone.
#[derive(Clone)]
pub struct UiHandle {
    tx: mpsc::UnboundedSender<UiMessage>,
    thread: ThreadId,
}

impl UiHandle {
    /// Queue `task`. False once the UI thread has stopped.
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce(&mut UiState) + Send + 'static,
    {
        self.tx.send(UiMessage::Run(Box::new(task))).is_ok()
    }

    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// Run `task` on the UI thread and block until it returns. `None` if
    /// the thread has stopped or this is the UI thread itself.
    pub fn call<R, F>(&self, task: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut UiState) -> R + Send + 'static,
    {
        if self.is_current() {
            return None;
        }
        let (tx, rx) = std::sync::mpsc::channel();
        if !self.post(move |ui| {
            let _ = tx.send(task(ui));
        }) {
            return None;
        }
        rx.recv().ok()
    }

    /// Async flavor of [`UiHandle::call`] for callers on the IO runtime.
    pub async fn call_async<R, F>(&self, task: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut UiState) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        if !self.post(move |ui| {
            let _ = tx.send(task(ui));
        }) {
            return None;
        }
        rx.await.ok()
    }

    /// Wait until everything posted so far has run.
    pub fn flush(&self) {
        let _ = self.call(|_| ());
    }
}

/// State owned by the UI thread.
pub struct UiState {
    shims: BTreeMap<HostId, MediaProcessHostUiShim>,
    io: IoHandle,
    data_manager: Arc<MediaDataManager>,
}

impl UiState {
    fn new(io: IoHandle, data_manager: Arc<MediaDataManager>) -> Self {
        Self {
            shims: BTreeMap::new(),
            io,
            data_manager,
        }
    }

    pub fn data_manager(&self) -> &Arc<MediaDataManager> {
        &self.data_manager
    }

    /// Register the shim for a new host.
    pub fn create_shim(&mut self, host_id: HostId) -> &MediaProcessHostUiShim {
        debug_assert!(!self.shims.contains_key(&host_id), "duplicate ui shim {host_id}");
        debug!(host_id, "ui: shim created");
        self.shims.entry(host_id).or_insert_with(|| MediaProcessHostUiShim {
            host_id,
            io: self.io.clone(),
            data_manager: Arc::clone(&self.data_manager),
        })
    }

    /// Drop a host's shim, logging why the host went away.
    pub fn destroy_shim(&mut self, host_id: HostId, reason: &str) {
        if !reason.is_empty() {
            self.data_manager
                .add_log_message(LogLevel::Error, "MediaProcessHostUIShim", reason);
        }
        if self.shims.remove(&host_id).is_some() {
            debug!(host_id, "ui: shim destroyed");
        }
    }

    pub fn destroy_all(&mut self) {
        let count = self.shims.len();
        self.shims.clear();
        if count > 0 {
            info!(count, "ui: destroyed remaining shims");
        }
    }

    pub fn shim(&self, host_id: HostId) -> Option<&MediaProcessHostUiShim> {
        self.shims.get(&host_id)
    }

    /// Any live shim; the lowest host id wins.
    pub fn get_one_instance(&self) -> Option<&MediaProcessHostUiShim> {
        self.shims.values().next()
    }

    pub fn shim_count(&self) -> usize {
        self.shims.len()
    }

    /// Deliver a message a host routed to the UI thread.
    pub fn route_to_shim(&mut self, host_id: HostId, message: Message) {
        match self.shims.get(&host_id) {
            Some(shim) => {
                shim.on_message_received(message);
            }
            None => debug!(host_id, kind = message.name(), "ui: no shim for message"),
        }
    }
}

/// UI-thread face of one media process host.
pub struct MediaProcessHostUiShim {
    host_id: HostId,
    io: IoHandle,
    data_manager: Arc<MediaDataManager>,
}

impl MediaProcessHostUiShim {
    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    /// Forward `message` to the host on the IO thread. Dropped there if the
    /// host is gone.
    pub fn send(&self, message: Message) -> bool {
        self.io.send_to_host(self.host_id, message)
    }

    /// Handle a message from the media process. Only control messages are
    /// accepted.
    pub fn on_message_received(&self, message: Message) -> bool {
        let Message::Control { body } = message else {
            return false;
        };
        match body {
            ControlMessage::LogMessage {
                level,
                header,
                message,
            } => self.data_manager.add_log_message(level, header, message),
            other => error!(host_id = self.host_id, ?other, "ui shim: unhandled control message"),
        }
        true
    }

    pub fn simulate_clean(&self) -> bool {
        self.send(Message::control(ControlMessage::Clean))
    }

    pub fn simulate_crash(&self) -> bool {
        self.send(Message::control(ControlMessage::Crash))
    }

    pub fn simulate_hang(&self) -> bool {
        self.send(Message::control(ControlMessage::Hang))
    }
}

/// The dedicated UI thread. Dropping it destroys all shims and joins.
pub struct UiThread {
    handle: UiHandle,
    thread: Option<JoinHandle<()>>,
    data_manager: Arc<MediaDataManager>,
}

impl UiThread {
    pub fn spawn(io: IoHandle, data_manager: Arc<MediaDataManager>) -> std::io::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<UiMessage>();
        let dm = Arc::clone(&data_manager);
        let thread = thread::Builder::new().name("browser-ui".into()).spawn(move || {
            let mut state = UiState::new(io, dm);
            while let Some(message) = rx.blocking_recv() {
                match message {
                    UiMessage::Run(task) => task(&mut state),
                    UiMessage::Quit => break,
                }
            }
            state.destroy_all();
        })?;
        let handle = UiHandle {
            tx,
            thread: thread.thread().id(),
        };
        data_manager.attach_ui(handle.clone());
        Ok(Self {
            handle,
            thread: Some(thread),
            data_manager,
        })
    }

    pub fn handle(&self) -> UiHandle {
        self.handle.clone()
    }
}

impl Drop for UiThread {
    fn drop(&mut self) {
        self.data_manager.detach_ui();
        let _ = self.handle.tx.send(UiMessage::Quit);
        if let Some(thread) = self.thread.take() {
            if !self.handle.is_current() {
                let _ = thread.join();
            }
        }
    }
}
