//! Browser end of a renderer's control channel: serves
//! `EstablishMediaChannel` requests.

use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use mediaproc_transport::channel::forward_to;
use mediaproc_transport::{
    CauseForMediaLaunch, Channel, ChannelError, ChannelEvent, ChannelHandle, ClientId,
    ControlMessage, HostId, Message, SyncPolicy,
};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::io_thread::IoHandle;

/// Host ids start at 1.
const NO_HOST: HostId = 0;

struct FilterInner {
    render_process_id: ClientId,
    media_process_id: AtomicI32,
    io: IoHandle,
    channel: Channel,
}

impl FilterInner {
    async fn on_establish_media_channel(&self, cause: CauseForMediaLaunch) -> ChannelHandle {
        let preferred = match self.media_process_id.load(Ordering::Acquire) {
            NO_HOST => None,
            id => Some(id),
        };
        let outcome = self
            .io
            .establish_media_channel(preferred, cause, self.render_process_id)
            .await;
        if let Some(host_id) = outcome.host_id {
            self.media_process_id.store(host_id, Ordering::Release);
        }
        if outcome.handle.is_empty() {
            warn!(render_process_id = self.render_process_id, ?cause, "filter: media channel request failed");
        }
        let reply = ControlMessage::MediaChannelEstablished {
            renderer_id: self.render_process_id,
            handle: outcome.handle.clone(),
        };
        if let Err(e) = self.channel.send(Message::control(reply)) {
            debug!(render_process_id = self.render_process_id, error = %e, "filter: renderer gone before reply");
        }
        outcome.handle
    }
}

pub struct MediaMessageFilter {
    inner: Arc<FilterInner>,
    task: JoinHandle<()>,
}

impl MediaMessageFilter {
    /// Serve the renderer on the other end of `stream`.
    pub fn attach(
        runtime: &Handle,
        io: IoHandle,
        render_process_id: ClientId,
        stream: UnixStream,
    ) -> Result<Self, ChannelError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Channel::from_stream(
            runtime,
            format!("renderer.{render_process_id}"),
            stream,
            forward_to(tx, |e| e),
            SyncPolicy::Allow,
        )?;
        let inner = Arc::new(FilterInner {
            render_process_id,
            media_process_id: AtomicI32::new(NO_HOST),
            io,
            channel,
        });
        let task = runtime.spawn(run(Arc::clone(&inner), rx));
        Ok(Self { inner, task })
    }

    pub fn render_process_id(&self) -> ClientId {
        self.inner.render_process_id
    }

    /// The media host serving this renderer, once one has.
    pub fn media_process_id(&self) -> Option<HostId> {
        match self.inner.media_process_id.load(Ordering::Acquire) {
            NO_HOST => None,
            id => Some(id),
        }
    }

    /// Resolve a media channel for this renderer and send the reply.
    pub async fn on_establish_media_channel(&self, cause: CauseForMediaLaunch) -> ChannelHandle {
        self.inner.on_establish_media_channel(cause).await
    }
}

impl Drop for MediaMessageFilter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(inner: Arc<FilterInner>, mut rx: mpsc::UnboundedReceiver<ChannelEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            ChannelEvent::Connected { peer_pid } => {
                info!(render_process_id = inner.render_process_id, peer_pid, "filter: renderer connected");
            }
            ChannelEvent::Message(Message::Control {
                body: ControlMessage::EstablishMediaChannel { cause },
            }) => {
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    inner.on_establish_media_channel(cause).await;
                });
            }
            ChannelEvent::Message(other) => {
                debug!(render_process_id = inner.render_process_id, kind = other.name(), "filter: unhandled message");
            }
            ChannelEvent::Error => {
                debug!(render_process_id = inner.render_process_id, "filter: renderer channel closed");
                break;
            }
        }
    }
}
