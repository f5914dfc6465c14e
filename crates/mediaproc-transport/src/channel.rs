//! Framed, bidirectional channel over a Unix stream socket.
//!
//! Each channel runs a reader and a writer task on the IO runtime. Sends are
//! non-blocking and may come from any thread; frames leave in the order they
//! were queued. Everything received is handed to the channel's listener.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, warn};

use crate::message::{FrameError, Message, MessageCodec};

/// Something the channel observed on its socket.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The peer's hello frame arrived.
    Connected { peer_pid: u32 },
    Message(Message),
    /// The socket failed or the peer went away. Emitted at most once.
    Error,
}

/// Receives channel events on the IO runtime. Must not block.
pub type ChannelListener = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

/// Build a listener that forwards every event into an mpsc queue.
pub fn forward_to<T, F>(tx: mpsc::UnboundedSender<T>, wrap: F) -> ChannelListener
where
    T: Send + 'static,
    F: Fn(ChannelEvent) -> T + Send + Sync + 'static,
{
    Arc::new(move |event| {
        let _ = tx.send(wrap(event));
    })
}

/// Whether reply-waiting messages may be sent on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    Allow,
    Forbid,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel {0} is closed")]
    Closed(String),
    #[error("sync message '{0}' is not allowed on this channel")]
    SyncForbidden(&'static str),
    #[error("channel handle is empty")]
    EmptyHandle,
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Name token (and rendezvous path) the peer uses to attach to a channel.
/// An empty name is the failure value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelHandle {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl ChannelHandle {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }
}

static NEXT_CHANNEL_SEQ: AtomicU64 = AtomicU64::new(0);

/// Generate a channel name that is unique within this host.
pub fn generate_channel_id(prefix: &str) -> String {
    let seq = NEXT_CHANNEL_SEQ.fetch_add(1, Ordering::Relaxed);
    let nonce: u32 = rand::thread_rng().gen();
    format!("{prefix}.{}.{seq}.{nonce:08x}", std::process::id())
}

const STATE_OPEN: u8 = 0;
const STATE_CLOSED: u8 = 1;
const STATE_ERRORED: u8 = 2;

/// State shared between the channel handle and its IO tasks.
struct Shared {
    name: String,
    state: AtomicU8,
    shutdown: Notify,
    listener: ChannelListener,
}

impl Shared {
    fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_OPEN
    }

    fn is_closed_locally(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_CLOSED
    }

    fn fail(&self) {
        if self
            .state
            .compare_exchange(STATE_OPEN, STATE_ERRORED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!(channel = %self.name, "channel: error");
            (self.listener)(ChannelEvent::Error);
        }
    }

    fn close(&self) {
        let _ = self.state.compare_exchange(
            STATE_OPEN,
            STATE_CLOSED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.shutdown.notify_one();
    }
}

struct Inner {
    outbound: mpsc::UnboundedSender<Bytes>,
    shared: Arc<Shared>,
    policy: SyncPolicy,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Sending end of a channel. Cheap to clone; the socket closes when the
/// last clone is dropped, after queued frames have been flushed.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.shared.name)
            .field("open", &self.inner.shared.is_open())
            .finish()
    }
}

impl Channel {
    /// Wrap an already connected socket.
    pub fn from_stream(
        io: &Handle,
        name: impl Into<String>,
        stream: std::os::unix::net::UnixStream,
        listener: ChannelListener,
        policy: SyncPolicy,
    ) -> Result<Self, ChannelError> {
        stream.set_nonblocking(true)?;
        Ok(Self::start(io, name.into(), listener, policy, async move {
            UnixStream::from_std(stream)
        }))
    }

    /// Bind a rendezvous socket under `dir` and accept exactly one peer.
    ///
    /// Frames sent before the peer attaches are queued. The socket file is
    /// removed once the peer is accepted or the channel is dropped.
    pub fn listen(
        io: &Handle,
        dir: &Path,
        prefix: &str,
        listener: ChannelListener,
        policy: SyncPolicy,
    ) -> Result<(Self, ChannelHandle), ChannelError> {
        let name = generate_channel_id(prefix);
        let path = dir.join(format!("{name}.sock"));
        let std_listener = std::os::unix::net::UnixListener::bind(&path)?;
        std_listener.set_nonblocking(true)?;

        let handle = ChannelHandle {
            name: name.clone(),
            path: Some(path.clone()),
        };
        let socket_file = SocketFile(path);
        let channel = Self::start(io, name, listener, policy, async move {
            let listener = UnixListener::from_std(std_listener)?;
            let (stream, _) = listener.accept().await?;
            drop(socket_file);
            Ok(stream)
        });
        Ok((channel, handle))
    }

    /// Attach to a channel published by [`Channel::listen`].
    pub fn connect(
        io: &Handle,
        handle: &ChannelHandle,
        listener: ChannelListener,
        policy: SyncPolicy,
    ) -> Result<Self, ChannelError> {
        if handle.is_empty() {
            return Err(ChannelError::EmptyHandle);
        }
        let path = handle.path.as_ref().ok_or(ChannelError::EmptyHandle)?;
        let stream = std::os::unix::net::UnixStream::connect(path)?;
        Self::from_stream(io, handle.name.clone(), stream, listener, policy)
    }

    fn start<F>(
        io: &Handle,
        name: String,
        listener: ChannelListener,
        policy: SyncPolicy,
        stream: F,
    ) -> Self
    where
        F: Future<Output = io::Result<UnixStream>> + Send + 'static,
    {
        let (outbound, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            name,
            state: AtomicU8::new(STATE_OPEN),
            shutdown: Notify::new(),
            listener,
        });

        let task_shared = Arc::clone(&shared);
        io.spawn(async move {
            let stream = tokio::select! {
                result = stream => result,
                _ = task_shared.shutdown.notified() => {
                    debug!(channel = %task_shared.name, "channel: closed before connect");
                    return;
                }
            };
            match stream {
                Ok(stream) => run(stream, rx, task_shared).await,
                Err(e) => {
                    warn!(channel = %task_shared.name, error = %e, "channel: connect failed");
                    task_shared.fail();
                }
            }
        });

        Self {
            inner: Arc::new(Inner {
                outbound,
                shared,
                policy,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.shared.name
    }

    /// Whether the channel can still carry messages.
    pub fn is_open(&self) -> bool {
        self.inner.shared.is_open()
    }

    /// Queue a message for the peer. Fails once the channel has closed or
    /// errored; the message is dropped in that case.
    pub fn send(&self, message: Message) -> Result<(), ChannelError> {
        if self.inner.policy == SyncPolicy::Forbid && message.is_sync() {
            error!(
                channel = %self.inner.shared.name,
                "channel: refusing to send a reply-waiting message"
            );
            return Err(ChannelError::SyncForbidden(message.name()));
        }
        if !self.inner.shared.is_open() {
            return Err(ChannelError::Closed(self.inner.shared.name.clone()));
        }
        let frame = message.encode()?;
        self.inner
            .outbound
            .send(frame)
            .map_err(|_| ChannelError::Closed(self.inner.shared.name.clone()))
    }
}

/// Unlinks a rendezvous socket path on drop.
struct SocketFile(PathBuf);

impl Drop for SocketFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

async fn run(stream: UnixStream, rx: mpsc::UnboundedReceiver<Bytes>, shared: Arc<Shared>) {
    let (reader, writer) = stream.into_split();
    let writer_task = tokio::spawn(write_loop(writer, rx, Arc::clone(&shared)));
    read_loop(reader, &shared).await;
    if shared.is_closed_locally() {
        // Let queued frames drain before the socket goes away.
        let _ = writer_task.await;
    } else {
        writer_task.abort();
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    shared: Arc<Shared>,
) {
    let hello = match (Message::Hello {
        pid: std::process::id(),
    })
    .encode()
    {
        Ok(frame) => frame,
        Err(e) => {
            error!(channel = %shared.name, error = %e, "channel: failed to encode hello");
            shared.fail();
            return;
        }
    };
    if let Err(e) = writer.write_all(&hello).await {
        debug!(channel = %shared.name, error = %e, "channel: hello write failed");
        shared.fail();
        return;
    }

    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!(channel = %shared.name, error = %e, "channel: write failed");
            shared.fail();
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(mut reader: OwnedReadHalf, shared: &Shared) {
    let mut codec = MessageCodec::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = tokio::select! {
            result = reader.read(&mut buf) => result,
            _ = shared.shutdown.notified() => return,
        };
        match read {
            Ok(0) => {
                debug!(channel = %shared.name, "channel: peer closed");
                break;
            }
            Ok(n) => {
                codec.feed(&buf[..n]);
                loop {
                    match codec.decode_next() {
                        Ok(Some(Message::Hello { pid })) => {
                            (shared.listener)(ChannelEvent::Connected { peer_pid: pid });
                        }
                        Ok(Some(message)) => (shared.listener)(ChannelEvent::Message(message)),
                        Ok(None) => break,
                        Err(e) => {
                            warn!(channel = %shared.name, error = %e, "channel: bad frame");
                            shared.fail();
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                debug!(channel = %shared.name, error = %e, "channel: read failed");
                break;
            }
        }
    }
    shared.fail();
}
