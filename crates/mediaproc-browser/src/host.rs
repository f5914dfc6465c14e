//! One media process as seen from the browser's IO thread.
//!
//! A host owns the control channel to its media process, queues messages
//! until the child says hello, and keeps every outstanding
//! `EstablishChannel` callback until it is answered. Dropping a host answers
//! whatever is still pending with an empty handle.

use std::collections::VecDeque;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use mediaproc_transport::launch::{InProcessChild, InProcessChildFactory, InProcessChildParams};
use mediaproc_transport::{
    generate_channel_id, Channel, ChannelError, ChannelEvent, ChannelHandle, ChannelListener,
    ClientId, ControlMessage, HostId, LogLevel, Message, RequestId, SyncPolicy,
};
use tokio::process::{Child, Command};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::command_line::CommandLine;
use crate::data_manager::MediaDataManager;
use crate::launcher::{find_media_binary, media_command_line, MediaLaunch};
use crate::termination::TerminationStatus;
use crate::ui::UiHandle;

/// How long to wait for a dead child to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

const NO_PENDING_REQUEST: &str = "Received a ChannelEstablished message but no requests in queue.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaProcessKind {
    Sandboxed,
    Unsandboxed,
}

impl MediaProcessKind {
    pub const COUNT: usize = 2;

    pub fn index(self) -> usize {
        match self {
            Self::Sandboxed => 0,
            Self::Unsandboxed => 1,
        }
    }
}

/// Channel traffic of one host, tagged for the IO loop.
#[derive(Debug)]
pub struct HostEvent {
    pub host_id: HostId,
    pub event: ChannelEvent,
}

/// Answer to an `EstablishChannel` request. Invoked exactly once; an empty
/// handle means failure.
pub type EstablishChannelCallback = Box<dyn FnOnce(ChannelHandle) + Send>;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to create host channel: {0}")]
    Channel(#[from] ChannelError),
    #[error("mediaproc-media binary not found")]
    BinaryNotFound,
    #[error("failed to spawn media process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("in-process media requested but no factory is registered")]
    NoInProcessFactory,
    #[error("in-process media thread failed to start: {0}")]
    InProcess(#[source] anyhow::Error),
    #[error("initialize could not be sent")]
    Initialize,
}

/// Everything a host needs to launch its media process.
#[derive(Clone)]
pub struct LaunchContext {
    pub io: Handle,
    /// Switches of the browser; the propagated subset reaches the child.
    pub browser_command_line: Arc<CommandLine>,
    /// Single-process or in-process-media mode.
    pub in_process: bool,
    pub media_binary: Option<PathBuf>,
    pub runtime_dir: PathBuf,
    pub in_process_factory: Option<Arc<dyn InProcessChildFactory>>,
    pub events: mpsc::UnboundedSender<HostEvent>,
    pub ui: UiHandle,
    pub data_manager: Arc<MediaDataManager>,
}

pub struct MediaProcessHost {
    host_id: HostId,
    kind: MediaProcessKind,
    ctx: LaunchContext,
    in_process: bool,
    channel: Option<Channel>,
    /// The child's hello has arrived; sends go straight out.
    opened: bool,
    queued: VecDeque<Message>,
    pending: VecDeque<(RequestId, EstablishChannelCallback)>,
    next_request_id: RequestId,
    valid: bool,
    initialized: Option<bool>,
    peer_pid: Option<u32>,
    child: Option<Child>,
    in_process_child: Option<Box<dyn InProcessChild>>,
    exit_status: Option<ExitStatus>,
}

impl MediaProcessHost {
    pub fn new(host_id: HostId, kind: MediaProcessKind, ctx: LaunchContext) -> Self {
        if !ctx.ui.post(move |ui| {
            ui.create_shim(host_id);
        }) {
            debug!(host_id, "host: ui thread gone, no shim");
        }
        Self {
            host_id,
            kind,
            in_process: ctx.in_process,
            ctx,
            channel: None,
            opened: false,
            queued: VecDeque::new(),
            pending: VecDeque::new(),
            next_request_id: 1,
            valid: true,
            initialized: None,
            peer_pid: None,
            child: None,
            in_process_child: None,
            exit_status: None,
        }
    }

    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    pub fn kind(&self) -> MediaProcessKind {
        self.kind
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn in_process(&self) -> bool {
        self.in_process
    }

    pub fn is_channel_open(&self) -> bool {
        self.opened
    }

    /// Result of `Initialize`, once the media process answered.
    pub fn initialized(&self) -> Option<bool> {
        self.initialized
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn queued_messages(&self) -> usize {
        self.queued.len()
    }

    pub fn pid(&self) -> Option<u32> {
        if self.in_process {
            return Some(std::process::id());
        }
        self.child.as_ref().and_then(Child::id).or(self.peer_pid)
    }

    /// Create the control channel, start the media side and queue
    /// `Initialize`.
    pub fn init(&mut self) -> Result<(), LaunchError> {
        let channel_id = generate_channel_id("media");
        let (host_end, child_end) = UnixStream::pair().map_err(ChannelError::from)?;
        let events = self.ctx.events.clone();
        let host_id = self.host_id;
        let listener: ChannelListener = Arc::new(move |event| {
            let _ = events.send(HostEvent { host_id, event });
        });
        self.channel = Some(Channel::from_stream(
            &self.ctx.io,
            channel_id.clone(),
            host_end,
            listener,
            SyncPolicy::Allow,
        )?);

        if self.in_process {
            let factory = self
                .ctx
                .in_process_factory
                .clone()
                .ok_or(LaunchError::NoInProcessFactory)?;
            let child = factory
                .start(InProcessChildParams {
                    channel_name: channel_id,
                    stream: child_end,
                    io: self.ctx.io.clone(),
                    runtime_dir: self.ctx.runtime_dir.clone(),
                })
                .map_err(LaunchError::InProcess)?;
            self.in_process_child = Some(child);
            info!(host_id, "host: media running in process");
        } else {
            self.launch_media_process(&channel_id, child_end)?;
        }

        if !self.send(Message::control(ControlMessage::Initialize)) {
            return Err(LaunchError::Initialize);
        }
        Ok(())
    }

    fn launch_media_process(&mut self, channel_id: &str, child_end: UnixStream) -> Result<(), LaunchError> {
        let binary = find_media_binary(self.ctx.media_binary.as_deref()).ok_or(LaunchError::BinaryNotFound)?;
        let cmd = media_command_line(&MediaLaunch {
            binary: &binary,
            kind: self.kind,
            channel_id,
            runtime_dir: &self.ctx.runtime_dir,
            browser: &self.ctx.browser_command_line,
            data_manager: &self.ctx.data_manager,
        });
        let argv = cmd.argv();
        let (program, args) = argv.split_first().ok_or(LaunchError::BinaryNotFound)?;
        debug!(host_id = self.host_id, ?argv, "host: launching media process");

        // The child finds its end of the control channel on stdin. Our copy
        // of that end closes once the command is dropped.
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::from(OwnedFd::from(child_end)))
            .kill_on_drop(true)
            .spawn()
            .map_err(LaunchError::Spawn)?;
        info!(
            host_id = self.host_id,
            pid = child.id().unwrap_or_default(),
            kind = ?self.kind,
            "host: media process launched"
        );
        self.child = Some(child);
        Ok(())
    }

    /// Send to the media process. Queued until the channel is open. A failed
    /// send answers every pending request with an empty handle.
    pub fn send(&mut self, message: Message) -> bool {
        let Some(channel) = &self.channel else {
            debug!(host_id = self.host_id, kind = message.name(), "host: no channel, dropping");
            return false;
        };
        if !self.opened {
            self.queued.push_back(message);
            return true;
        }
        match channel.send(message) {
            Ok(()) => true,
            Err(e) => {
                warn!(host_id = self.host_id, error = %e, "host: send failed");
                self.send_outstanding_replies();
                false
            }
        }
    }

    /// Ask the media process for a channel to renderer `client_id`.
    pub fn establish_media_channel(&mut self, client_id: ClientId, callback: EstablishChannelCallback) {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        let request = ControlMessage::EstablishChannel {
            request_id,
            client_id,
        };
        if !self.send(Message::control(request)) {
            callback(ChannelHandle::empty());
            return;
        }
        self.pending.push_back((request_id, callback));
    }

    pub fn on_channel_connected(&mut self, peer_pid: u32) {
        debug!(host_id = self.host_id, peer_pid, queued = self.queued.len(), "host: channel open");
        self.opened = true;
        self.peer_pid = Some(peer_pid);
        while let Some(message) = self.queued.pop_front() {
            if !self.send(message) {
                self.queued.clear();
                break;
            }
        }
    }

    pub fn on_message_received(&mut self, message: Message) {
        match message {
            Message::Control {
                body: ControlMessage::Initialized { result },
            } => {
                self.initialized = Some(result);
                if result {
                    debug!(host_id = self.host_id, "host: media process initialized");
                } else {
                    warn!(host_id = self.host_id, "host: media process failed to initialize");
                    self.ctx.data_manager.media_process_init_failed();
                }
            }
            Message::Control {
                body: ControlMessage::ChannelEstablished { request_id, handle },
            } => self.on_channel_established(request_id, handle),
            other => self.route_on_ui_thread(other),
        }
    }

    fn on_channel_established(&mut self, request_id: RequestId, handle: ChannelHandle) {
        match self.pending.iter().position(|(id, _)| *id == request_id) {
            Some(index) => {
                if let Some((_, callback)) = self.pending.remove(index) {
                    callback(handle);
                }
            }
            None => {
                warn!(host_id = self.host_id, request_id, "host: unmatched ChannelEstablished");
                self.route_on_ui_thread(Message::control(ControlMessage::LogMessage {
                    level: LogLevel::Warning,
                    header: "MediaProcessHost".into(),
                    message: NO_PENDING_REQUEST.into(),
                }));
            }
        }
    }

    fn route_on_ui_thread(&self, message: Message) {
        let host_id = self.host_id;
        let _ = self.ctx.ui.post(move |ui| ui.route_to_shim(host_id, message));
    }

    /// The channel broke: no more replies will come.
    pub fn on_channel_error(&mut self) {
        info!(host_id = self.host_id, "host: channel error");
        self.send_outstanding_replies();
    }

    /// Answer everything pending with an empty handle and stop being valid.
    fn send_outstanding_replies(&mut self) {
        self.valid = false;
        while let Some((_, callback)) = self.pending.pop_front() {
            callback(ChannelHandle::empty());
        }
    }

    /// Stop the media process now. The caller takes the host out of the table.
    pub fn force_shutdown(&mut self) {
        info!(host_id = self.host_id, "host: force shutdown");
        self.valid = false;
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.start_kill() {
                debug!(host_id = self.host_id, error = %e, "host: kill failed");
            }
        }
        if let Some(child) = self.in_process_child.as_mut() {
            child.stop();
        }
    }

    /// Wait briefly for a dead child and record how it ended.
    pub async fn reap(&mut self) -> TerminationStatus {
        if let Some(child) = self.child.as_mut() {
            match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => self.exit_status = Some(status),
                Ok(Err(e)) => warn!(host_id = self.host_id, error = %e, "host: wait failed"),
                Err(_) => {
                    warn!(host_id = self.host_id, "host: channel closed but process still running");
                    let _ = child.start_kill();
                    if let Ok(Ok(status)) = tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
                        self.exit_status = Some(status);
                    }
                }
            }
        }
        self.termination_status()
    }

    fn termination_status(&mut self) -> TerminationStatus {
        if self.in_process {
            return TerminationStatus::Unknown;
        }
        if self.exit_status.is_none() {
            if let Some(child) = self.child.as_mut() {
                self.exit_status = child.try_wait().ok().flatten();
            }
        }
        TerminationStatus::from_exit_status(self.exit_status)
    }
}

impl Drop for MediaProcessHost {
    fn drop(&mut self) {
        self.send_outstanding_replies();
        self.queued.clear();
        if let Some(child) = self.in_process_child.as_mut() {
            child.stop();
        }
        let reason = self.termination_status().reason();
        let host_id = self.host_id;
        debug!(host_id, reason = %reason, "host: destroyed");
        let _ = self.ctx.ui.post(move |ui| ui.destroy_shim(host_id, &reason));
    }
}
