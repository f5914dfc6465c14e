//! Multiplexes renderer channels inside the media process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use mediaproc_transport::{
    Channel, ChannelEvent, ChannelHandle, ClientId, ControlMessage, Message, PlayerId, RequestId,
};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::child_thread::MainEvent;
use crate::gl::GlHandle;
use crate::pipeline::{PipelineEvent, PipelineFactory};
use crate::player_channel::MediaPlayerChannel;

/// Everything a new player channel is built from.
#[derive(Clone)]
pub struct ChannelContext {
    pub io: Handle,
    pub runtime_dir: PathBuf,
    pub main_tx: mpsc::UnboundedSender<MainEvent>,
    pub factory: Arc<dyn PipelineFactory>,
    pub gl: GlHandle,
}

/// Owns one [`MediaPlayerChannel`] per renderer client.
pub struct MediaChannelFilter {
    channels: HashMap<ClientId, MediaPlayerChannel>,
    browser: Channel,
    ctx: ChannelContext,
}

impl MediaChannelFilter {
    pub fn new(browser: Channel, ctx: ChannelContext) -> Self {
        Self {
            channels: HashMap::new(),
            browser,
            ctx,
        }
    }

    /// Bind a channel for `client_id` and answer the browser with its
    /// handle. A client that already has a channel gets an empty handle.
    pub fn on_establish_channel(&mut self, request_id: RequestId, client_id: ClientId) -> ChannelHandle {
        let handle = if self.channels.contains_key(&client_id) {
            warn!(client_id, "filter: channel already exists for client, rejecting");
            ChannelHandle::empty()
        } else {
            match MediaPlayerChannel::init(
                client_id,
                &self.ctx.io,
                &self.ctx.runtime_dir,
                self.ctx.main_tx.clone(),
                Arc::clone(&self.ctx.factory),
                self.ctx.gl.clone(),
            ) {
                Ok(channel) => {
                    let handle = channel.handle().clone();
                    self.channels.insert(client_id, channel);
                    info!(client_id, channel = %handle.name, "filter: channel established");
                    handle
                }
                Err(e) => {
                    warn!(client_id, error = %e, "filter: failed to bind channel");
                    ChannelHandle::empty()
                }
            }
        };

        let reply = Message::control(ControlMessage::ChannelEstablished {
            request_id,
            handle: handle.clone(),
        });
        if let Err(e) = self.browser.send(reply) {
            warn!(client_id, error = %e, "filter: establish reply lost");
        }
        handle
    }

    pub fn lookup_channel(&self, client_id: ClientId) -> Option<&MediaPlayerChannel> {
        self.channels.get(&client_id)
    }

    pub fn remove_channel(&mut self, client_id: ClientId) -> bool {
        let removed = self.channels.remove(&client_id).is_some();
        if removed {
            debug!(client_id, "filter: channel removed");
        }
        removed
    }

    /// Drop the channel published under `handle`'s name.
    pub fn on_close_channel(&mut self, handle: &ChannelHandle) -> bool {
        let client = self
            .channels
            .iter()
            .find(|(_, ch)| ch.handle().name == handle.name)
            .map(|(id, _)| *id);
        match client {
            Some(client_id) => self.remove_channel(client_id),
            None => {
                debug!(channel = %handle.name, "filter: close for unknown channel");
                false
            }
        }
    }

    pub fn on_renderer_event(&mut self, client_id: ClientId, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected { peer_pid } => {
                debug!(client_id, peer_pid, "filter: renderer connected");
            }
            ChannelEvent::Message(message) => {
                let Some(channel) = self.channels.get_mut(&client_id) else {
                    debug!(client_id, "filter: message for closed channel");
                    return;
                };
                if !channel.on_message_received(message) {
                    warn!(client_id, "filter: unhandled renderer message");
                }
            }
            ChannelEvent::Error => {
                info!(client_id, "filter: renderer channel lost");
                self.remove_channel(client_id);
            }
        }
    }

    pub fn on_pipeline_event(&mut self, client_id: ClientId, player_id: PlayerId, event: PipelineEvent) {
        if let Some(channel) = self.channels.get_mut(&client_id) {
            channel.on_pipeline_event(player_id, event);
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Drop every channel and the players behind them.
    pub fn clear(&mut self) {
        let n = self.channels.len();
        self.channels.clear();
        info!(channels = n, "filter: cleared");
    }
}
