//! The browser IO loop: owns the host registry on the tokio runtime.
//!
//! Other threads talk to it through an [`IoHandle`]; host channel traffic
//! arrives as [`HostEvent`]s on the same loop, so the registry is only ever
//! touched from one task.

use mediaproc_transport::{CauseForMediaLaunch, ChannelHandle, ClientId, HostId, Message};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::host::{HostEvent, MediaProcessKind};
use crate::registry::MediaProcessRegistry;

/// Result of an establish request: the host that served it, and the handle
/// (empty on failure).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishOutcome {
    pub host_id: Option<HostId>,
    pub handle: ChannelHandle,
}

impl EstablishOutcome {
    fn failed() -> Self {
        Self {
            host_id: None,
            handle: ChannelHandle::empty(),
        }
    }
}

pub enum IoCommand {
    Get {
        kind: MediaProcessKind,
        cause: CauseForMediaLaunch,
        reply: oneshot::Sender<Option<HostId>>,
    },
    /// Use `preferred` if it is still valid, else the sandboxed host for
    /// `cause`.
    EstablishMediaChannel {
        preferred: Option<HostId>,
        cause: CauseForMediaLaunch,
        client_id: ClientId,
        reply: oneshot::Sender<EstablishOutcome>,
    },
    SendToHost {
        host_id: HostId,
        message: Message,
    },
    SendOnIo {
        kind: MediaProcessKind,
        cause: CauseForMediaLaunch,
        message: Message,
    },
    ProcessIds {
        reply: oneshot::Sender<Vec<u32>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Posts commands to the IO loop. Cheap to clone.
#[derive(Clone)]
pub struct IoHandle {
    tx: mpsc::UnboundedSender<IoCommand>,
}

impl IoHandle {
    /// A handle plus the receiver [`IoThread::spawn`] consumes.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<IoCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn post(&self, command: IoCommand) -> bool {
        self.tx.send(command).is_ok()
    }

    pub async fn get(&self, kind: MediaProcessKind, cause: CauseForMediaLaunch) -> Option<HostId> {
        let (reply, rx) = oneshot::channel();
        if !self.post(IoCommand::Get { kind, cause, reply }) {
            return None;
        }
        rx.await.ok().flatten()
    }

    pub async fn establish_media_channel(
        &self,
        preferred: Option<HostId>,
        cause: CauseForMediaLaunch,
        client_id: ClientId,
    ) -> EstablishOutcome {
        let (reply, rx) = oneshot::channel();
        let command = IoCommand::EstablishMediaChannel {
            preferred,
            cause,
            client_id,
            reply,
        };
        if !self.post(command) {
            return EstablishOutcome::failed();
        }
        rx.await.unwrap_or_else(|_| EstablishOutcome::failed())
    }

    /// Fire-and-forget send to a specific host.
    pub fn send_to_host(&self, host_id: HostId, message: Message) -> bool {
        self.post(IoCommand::SendToHost { host_id, message })
    }

    /// Fire-and-forget send to the host for `kind`, launching it if needed.
    pub fn send_on_io(&self, kind: MediaProcessKind, cause: CauseForMediaLaunch, message: Message) -> bool {
        self.post(IoCommand::SendOnIo {
            kind,
            cause,
            message,
        })
    }

    pub async fn process_ids(&self) -> Vec<u32> {
        let (reply, rx) = oneshot::channel();
        if !self.post(IoCommand::ProcessIds { reply }) {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Drop every host and stop the loop.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.post(IoCommand::Shutdown { reply }) {
            let _ = rx.await;
        }
    }
}

pub struct IoThread {
    task: JoinHandle<()>,
}

impl IoThread {
    pub fn spawn(
        io: &Handle,
        registry: MediaProcessRegistry,
        commands: mpsc::UnboundedReceiver<IoCommand>,
        events: mpsc::UnboundedReceiver<HostEvent>,
    ) -> Self {
        let task = io.spawn(run(registry, commands, events));
        Self { task }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop to end after [`IoHandle::shutdown`].
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

async fn run(
    mut registry: MediaProcessRegistry,
    mut commands: mpsc::UnboundedReceiver<IoCommand>,
    mut events: mpsc::UnboundedReceiver<HostEvent>,
) {
    info!("io: loop started");
    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                if let Some(reply) = handle_command(&mut registry, command) {
                    registry.shutdown();
                    let _ = reply.send(());
                    info!("io: loop finished");
                    return;
                }
            }
            Some(event) = events.recv() => registry.handle_event(event),
        }
    }
    registry.shutdown();
    info!("io: loop finished");
}

/// Returns the shutdown reply when the loop should stop.
fn handle_command(registry: &mut MediaProcessRegistry, command: IoCommand) -> Option<oneshot::Sender<()>> {
    match command {
        IoCommand::Get { kind, cause, reply } => {
            let host_id = registry.get(kind, cause).map(|h| h.host_id());
            let _ = reply.send(host_id);
        }
        IoCommand::EstablishMediaChannel {
            preferred,
            cause,
            client_id,
            reply,
        } => {
            // A stale preferred id falls back to the sandboxed host.
            let preferred = preferred.filter(|&id| registry.from_id(id).is_some());
            let host = match preferred {
                Some(id) => registry.from_id(id),
                None => registry.get(MediaProcessKind::Sandboxed, cause),
            };
            match host {
                Some(host) => {
                    let host_id = host.host_id();
                    host.establish_media_channel(
                        client_id,
                        Box::new(move |handle| {
                            let _ = reply.send(EstablishOutcome {
                                host_id: Some(host_id),
                                handle,
                            });
                        }),
                    );
                }
                None => {
                    debug!(client_id, ?cause, "io: no media host for establish");
                    let _ = reply.send(EstablishOutcome::failed());
                }
            }
        }
        IoCommand::SendToHost { host_id, message } => match registry.from_id(host_id) {
            Some(host) => {
                host.send(message);
            }
            None => debug!(host_id, kind = message.name(), "io: host gone, message dropped"),
        },
        IoCommand::SendOnIo {
            kind,
            cause,
            message,
        } => {
            registry.send_to(kind, cause, message);
        }
        IoCommand::ProcessIds { reply } => {
            let _ = reply.send(registry.process_ids());
        }
        IoCommand::Shutdown { reply } => return Some(reply),
    }
    None
}
