//! The per-renderer channel in the media process and the players behind it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use mediaproc_transport::channel::forward_to;
use mediaproc_transport::message::media_error;
use mediaproc_transport::{
    Channel, ChannelError, ChannelHandle, ClientId, Message, PlayerEvent, PlayerId, PlayerRequest,
    SyncPolicy,
};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::child_thread::MainEvent;
use crate::gl::GlHandle;
use crate::pipeline::{PipelineEvent, PipelineEventSink, PipelineFactory};
use crate::player::{MediaPlayer, PlayerEventSender};

pub const CHANNEL_PREFIX: &str = "media_player_channel";

/// One renderer's endpoint. Owns every player that renderer created.
pub struct MediaPlayerChannel {
    client_id: ClientId,
    // Players go before the channel so their teardown can still report.
    players: HashMap<PlayerId, MediaPlayer>,
    channel: Channel,
    handle: ChannelHandle,
    main_tx: mpsc::UnboundedSender<MainEvent>,
    factory: Arc<dyn PipelineFactory>,
    gl: GlHandle,
}

impl MediaPlayerChannel {
    /// Publish a rendezvous socket for `client_id` under `runtime_dir`.
    /// Incoming traffic is posted to the main thread tagged with the client id.
    pub fn init(
        client_id: ClientId,
        io: &Handle,
        runtime_dir: &Path,
        main_tx: mpsc::UnboundedSender<MainEvent>,
        factory: Arc<dyn PipelineFactory>,
        gl: GlHandle,
    ) -> Result<Self, ChannelError> {
        let listener = forward_to(main_tx.clone(), move |event| MainEvent::Renderer {
            client_id,
            event,
        });
        let (channel, handle) = Channel::listen(
            io,
            runtime_dir,
            CHANNEL_PREFIX,
            listener,
            SyncPolicy::Forbid,
        )?;
        info!(client_id, channel = %handle.name, "player channel: listening");
        Ok(Self {
            client_id,
            players: HashMap::new(),
            channel,
            handle,
            main_tx,
            factory,
            gl,
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn handle(&self) -> &ChannelHandle {
        &self.handle
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn player(&self, player_id: PlayerId) -> Option<&MediaPlayer> {
        self.players.get(&player_id)
    }

    /// Route a renderer message to its player. Returns false for messages
    /// this channel does not understand.
    pub fn on_message_received(&mut self, message: Message) -> bool {
        let Message::PlayerRequest { player_id, request } = message else {
            debug!(client_id = self.client_id, kind = message.name(), "player channel: unhandled");
            return false;
        };
        match request {
            PlayerRequest::Create => {
                self.get_or_create(player_id);
            }
            PlayerRequest::Release => self.release(player_id),
            request => {
                if let Some(player) = self.get_or_create(player_id) {
                    player.handle_request(request);
                }
            }
        }
        true
    }

    pub fn on_pipeline_event(&mut self, player_id: PlayerId, event: PipelineEvent) {
        match self.players.get_mut(&player_id) {
            Some(player) => player.on_pipeline_event(event),
            None => debug!(
                client_id = self.client_id,
                player_id, "player channel: event for released player"
            ),
        }
    }

    fn get_or_create(&mut self, player_id: PlayerId) -> Option<&mut MediaPlayer> {
        if !self.players.contains_key(&player_id) {
            let events = PlayerEventSender::new(self.channel.clone(), player_id);
            let sink = PipelineEventSink::new(self.main_tx.clone(), self.client_id, player_id);
            match MediaPlayer::new(
                player_id,
                events.clone(),
                self.factory.as_ref(),
                sink,
                self.gl.clone(),
            ) {
                Ok(player) => {
                    self.players.insert(player_id, player);
                }
                Err(e) => {
                    warn!(client_id = self.client_id, player_id, error = %e, "player channel: create failed");
                    events.send(PlayerEvent::MediaError {
                        code: media_error::FORMAT,
                    });
                    return None;
                }
            }
        }
        self.players.get_mut(&player_id)
    }

    /// Nothing goes back to the renderer; it dropped the player first.
    fn release(&mut self, player_id: PlayerId) {
        if self.players.remove(&player_id).is_none() {
            debug!(client_id = self.client_id, player_id, "player channel: release of unknown player");
        }
    }
}

impl Drop for MediaPlayerChannel {
    fn drop(&mut self) {
        let n = self.players.len();
        self.players.clear();
        info!(client_id = self.client_id, players = n, "player channel: closed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mediaproc_transport::ChannelEvent;
    use tokio::runtime::Runtime;

    use super::*;
    use crate::gl::{GlThread, OffscreenContextProvider};
    use crate::headless::HeadlessPipelineFactory;

    struct Setup {
        channel: Option<MediaPlayerChannel>,
        main_rx: mpsc::UnboundedReceiver<MainEvent>,
        renderer: Channel,
        renderer_rx: mpsc::UnboundedReceiver<ChannelEvent>,
        _gl: GlThread,
        _dir: tempfile::TempDir,
        rt: Runtime,
    }

    fn setup() -> Setup {
        let rt = Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let gl = GlThread::spawn(Box::new(OffscreenContextProvider)).unwrap();
        let (main_tx, main_rx) = mpsc::unbounded_channel();
        let channel = MediaPlayerChannel::init(
            3,
            rt.handle(),
            dir.path(),
            main_tx,
            Arc::new(HeadlessPipelineFactory::default()),
            gl.handle(),
        )
        .unwrap();
        let (tx, renderer_rx) = mpsc::unbounded_channel();
        let renderer = Channel::connect(
            rt.handle(),
            channel.handle(),
            forward_to(tx, |e| e),
            SyncPolicy::Allow,
        )
        .unwrap();
        Setup {
            channel: Some(channel),
            main_rx,
            renderer,
            renderer_rx,
            _gl: gl,
            _dir: dir,
            rt,
        }
    }

    impl Setup {
        fn channel(&mut self) -> &mut MediaPlayerChannel {
            self.channel.as_mut().unwrap()
        }

        /// Wait for the next renderer message on the main queue.
        fn next_request(&mut self) -> Message {
            let rx = &mut self.main_rx;
            self.rt.block_on(async {
                loop {
                    let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                        .await
                        .unwrap()
                        .unwrap();
                    if let MainEvent::Renderer {
                        client_id,
                        event: ChannelEvent::Message(m),
                    } = ev
                    {
                        assert_eq!(client_id, 3);
                        return m;
                    }
                }
            })
        }

        fn next_event_within(&mut self, wait: Duration) -> Option<PlayerEvent> {
            let rx = &mut self.renderer_rx;
            self.rt.block_on(async {
                loop {
                    let ev = tokio::time::timeout(wait, rx.recv()).await.ok()??;
                    if let ChannelEvent::Message(Message::PlayerEvent { event, .. }) = ev {
                        return Some(event);
                    }
                }
            })
        }
    }

    #[test]
    fn requests_arrive_tagged_and_create_players() {
        let mut s = setup();
        s.renderer
            .send(Message::request(11, PlayerRequest::Create))
            .unwrap();
        let msg = s.next_request();
        assert!(s.channel().on_message_received(msg));
        assert_eq!(s.channel().player_count(), 1);
        assert!(s.channel().player(11).is_some());
    }

    #[test]
    fn release_destroys_player_without_reply() {
        let mut s = setup();
        let ch = s.channel();
        ch.on_message_received(Message::request(1, PlayerRequest::Create));
        ch.on_message_received(Message::request(2, PlayerRequest::Create));
        ch.on_message_received(Message::request(1, PlayerRequest::Release));
        ch.on_message_received(Message::request(7, PlayerRequest::Release));
        assert_eq!(ch.player_count(), 1);
        assert!(ch.player(1).is_none());
        assert_eq!(s.next_event_within(Duration::from_millis(300)), None);
    }

    #[test]
    fn pipeline_events_for_released_players_are_dropped() {
        let mut s = setup();
        s.channel()
            .on_pipeline_event(9, PipelineEvent::EndOfStream);
        assert_eq!(s.channel().player_count(), 0);
    }

    #[test]
    fn dropping_channel_releases_players() {
        let mut s = setup();
        s.channel()
            .on_message_received(Message::request(1, PlayerRequest::Create));
        drop(s.channel.take());
        let rx = &mut s.renderer_rx;
        assert!(s.rt.block_on(async {
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    match rx.recv().await {
                        Some(ChannelEvent::Error) | None => return true,
                        _ => {}
                    }
                }
            })
            .await
            .unwrap()
        }));
    }
}
