//! Per-player request helpers.
//!
//! A dispatcher is registered in the channel host's routing table for as
//! long as it lives. Dropping it deregisters the player, after which no
//! further events are delivered to its queue.

use std::sync::Arc;
use std::time::Duration;

use mediaproc_transport::message::AppendTimes;
use mediaproc_transport::{PlayerEvent, PlayerId, PlayerRequest, TextureId};
use tokio::sync::mpsc;

use crate::channel_host::MediaPlayerChannelHost;
use crate::error::RendererError;

pub struct MediaPlayerDispatcher {
    host: Arc<MediaPlayerChannelHost>,
    player_id: PlayerId,
}

impl MediaPlayerDispatcher {
    /// Register `player_id` with `host`. The receiver is the player's event
    /// queue; it ends when the dispatcher is dropped or the channel is lost.
    pub fn register(
        host: Arc<MediaPlayerChannelHost>,
        player_id: PlayerId,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PlayerEvent>), RendererError> {
        let (tx, rx) = mpsc::unbounded_channel();
        host.add_route(player_id, tx)?;
        Ok((Self { host, player_id }, rx))
    }

    pub fn player_id(&self) -> PlayerId {
        self.player_id
    }

    pub fn is_lost(&self) -> bool {
        self.host.is_lost()
    }

    fn send(&self, request: PlayerRequest) -> bool {
        self.host.send(self.player_id, request)
    }

    pub fn send_create(&self) -> bool {
        self.send(PlayerRequest::Create)
    }

    pub fn send_load(&self, url: &str, position_update_interval: Duration) -> bool {
        self.send(PlayerRequest::Load {
            url: url.to_owned(),
            position_update_interval_ms: position_update_interval.as_millis() as u64,
        })
    }

    pub fn send_start(&self) -> bool {
        self.send(PlayerRequest::Start)
    }

    pub fn send_pause(&self) -> bool {
        self.send(PlayerRequest::Pause)
    }

    pub fn send_seek(&self, time: Duration) -> bool {
        self.send(PlayerRequest::Seek { time })
    }

    /// The media side answers nothing, so the player's queue ends here.
    pub fn send_release(&self) -> bool {
        let sent = self.send(PlayerRequest::Release);
        self.host.remove_route(self.player_id);
        sent
    }

    pub fn send_release_texture(&self, texture_id: TextureId) -> bool {
        self.send(PlayerRequest::ReleaseTexture { texture_id })
    }

    pub fn send_add_source_id(&self, source_id: &str, media_type: &str, codecs: Vec<String>) -> bool {
        self.send(PlayerRequest::AddSourceId {
            source_id: source_id.to_owned(),
            media_type: media_type.to_owned(),
            codecs,
        })
    }

    pub fn send_remove_source_id(&self, source_id: &str) -> bool {
        self.send(PlayerRequest::RemoveSourceId {
            source_id: source_id.to_owned(),
        })
    }

    pub fn send_set_duration(&self, duration: Duration) -> bool {
        self.send(PlayerRequest::SetDuration { duration })
    }

    pub fn send_mark_end_of_stream(&self) -> bool {
        self.send(PlayerRequest::MarkEndOfStream)
    }

    pub fn send_unmark_end_of_stream(&self) -> bool {
        self.send(PlayerRequest::UnmarkEndOfStream)
    }

    pub fn send_set_sequence_mode(&self, source_id: &str, sequence_mode: bool) -> bool {
        self.send(PlayerRequest::SetSequenceMode {
            source_id: source_id.to_owned(),
            sequence_mode,
        })
    }

    pub fn send_append_data(&self, source_id: &str, data: Vec<u8>, times: AppendTimes) -> bool {
        self.send(PlayerRequest::AppendData {
            source_id: source_id.to_owned(),
            data,
            times,
        })
    }

    pub fn send_abort(&self, source_id: &str) -> bool {
        self.send(PlayerRequest::Abort {
            source_id: source_id.to_owned(),
        })
    }

    pub fn send_set_group_start_timestamp_if_in_sequence_mode(&self, source_id: &str, timestamp_offset_us: i64) -> bool {
        self.send(PlayerRequest::SetGroupStartTimestampIfInSequenceMode {
            source_id: source_id.to_owned(),
            timestamp_offset_us,
        })
    }

    pub fn send_remove_segment(&self, source_id: &str, start: Duration, end: Duration) -> bool {
        self.send(PlayerRequest::RemoveSegment {
            source_id: source_id.to_owned(),
            start,
            end,
        })
    }

    pub fn send_add_key(&self, session_id: &str, key_id: Vec<u8>, key: Vec<u8>) -> bool {
        self.send(PlayerRequest::AddKey {
            session_id: session_id.to_owned(),
            key_id,
            key,
        })
    }
}

impl Drop for MediaPlayerDispatcher {
    fn drop(&mut self) {
        self.host.remove_route(self.player_id);
    }
}
