//! The renderer's end of a media channel.
//!
//! One channel carries the traffic of every player in the renderer. Inbound
//! player events are routed by player id to the dispatcher registered for
//! that player and handed to its task through an mpsc queue, so nothing runs
//! inline on the IO runtime.

use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mediaproc_transport::{
    Channel, ChannelError, ChannelEvent, ChannelHandle, ChannelListener, Message, PlayerEvent,
    PlayerId, PlayerRequest, SyncPolicy,
};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::RendererError;

#[derive(Default)]
struct Routes {
    dispatchers: DashMap<PlayerId, mpsc::UnboundedSender<PlayerEvent>>,
    lost: AtomicBool,
}

impl Routes {
    fn on_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected { peer_pid } => {
                debug!(peer_pid, "renderer: media channel connected");
            }
            ChannelEvent::Message(Message::PlayerEvent { player_id, event }) => {
                match self.dispatchers.get(&player_id) {
                    Some(tx) => {
                        if tx.send(event).is_err() {
                            debug!(player_id, "renderer: player task gone, event dropped");
                        }
                    }
                    None => debug!(player_id, "renderer: no dispatcher for player"),
                }
            }
            ChannelEvent::Message(other) => {
                debug!(kind = other.name(), "renderer: unexpected message on media channel");
            }
            ChannelEvent::Error => {
                warn!(players = self.dispatchers.len(), "renderer: media channel lost");
                self.lost.store(true, Ordering::Release);
                // Dropping the senders ends every player's event queue.
                self.dispatchers.clear();
            }
        }
    }
}

pub struct MediaPlayerChannelHost {
    channel: Channel,
    routes: Arc<Routes>,
    next_player_id: AtomicI32,
}

impl MediaPlayerChannelHost {
    /// Attach to the channel the browser handed out.
    pub fn connect(io: &Handle, handle: &ChannelHandle) -> Result<Arc<Self>, RendererError> {
        let routes = Arc::new(Routes::default());
        let channel = Channel::connect(io, handle, Self::listener(&routes), SyncPolicy::Allow)?;
        info!(channel = %handle.name, "renderer: media channel attached");
        Ok(Self::with_channel(channel, routes))
    }

    /// Wrap an already connected socket.
    pub fn from_stream(
        io: &Handle,
        name: impl Into<String>,
        stream: UnixStream,
    ) -> Result<Arc<Self>, ChannelError> {
        let routes = Arc::new(Routes::default());
        let channel = Channel::from_stream(io, name, stream, Self::listener(&routes), SyncPolicy::Allow)?;
        Ok(Self::with_channel(channel, routes))
    }

    fn listener(routes: &Arc<Routes>) -> ChannelListener {
        let routes = Arc::clone(routes);
        Arc::new(move |event| routes.on_channel_event(event))
    }

    fn with_channel(channel: Channel, routes: Arc<Routes>) -> Arc<Self> {
        Arc::new(Self {
            channel,
            routes,
            next_player_id: AtomicI32::new(1),
        })
    }

    /// A player id not yet handed out by this host.
    pub fn next_player_id(&self) -> PlayerId {
        self.next_player_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Whether the channel to the media process has failed.
    pub fn is_lost(&self) -> bool {
        self.routes.lost.load(Ordering::Acquire)
    }

    pub fn dispatcher_count(&self) -> usize {
        self.routes.dispatchers.len()
    }

    pub(crate) fn add_route(
        &self,
        player_id: PlayerId,
        tx: mpsc::UnboundedSender<PlayerEvent>,
    ) -> Result<(), RendererError> {
        if self.is_lost() {
            return Err(RendererError::Lost);
        }
        match self.routes.dispatchers.entry(player_id) {
            Entry::Occupied(_) => Err(RendererError::DuplicatePlayer(player_id)),
            Entry::Vacant(slot) => {
                slot.insert(tx);
                Ok(())
            }
        }
    }

    pub(crate) fn remove_route(&self, player_id: PlayerId) {
        self.routes.dispatchers.remove(&player_id);
    }

    /// Fire-and-forget request for `player_id`. False once the channel is gone.
    pub fn send(&self, player_id: PlayerId, request: PlayerRequest) -> bool {
        if self.is_lost() {
            return false;
        }
        match self.channel.send(Message::request(player_id, request)) {
            Ok(()) => true,
            Err(e) => {
                debug!(player_id, error = %e, "renderer: request dropped");
                false
            }
        }
    }
}
