//! The player-facing callback surface.

use std::time::Duration;

use mediaproc_transport::message::BufferedRange;
use mediaproc_transport::{Mailbox, PlayerEvent, TextureId};
use tokio::sync::mpsc;
use tracing::debug;

/// Receives a player's events on the player's own task. Every method has a
/// no-op default so clients implement only what they render.
pub trait MediaPlayerClient {
    fn on_media_error(&mut self, _code: i32) {}
    fn on_playback_completed(&mut self) {}
    fn on_duration_changed(&mut self, _duration: Duration) {}
    fn on_seek_completed(&mut self, _time: Duration) {}
    fn on_video_size_changed(&mut self, _width: u32, _height: u32) {}
    fn on_time_update(&mut self, _timestamp: Duration, _ticks_us: u64) {}
    fn on_buffering_update(&mut self, _percent: i32) {}
    fn on_player_released(&mut self) {}
    fn on_played(&mut self) {}
    fn on_paused(&mut self) {}
    /// A new frame is ready. The texture must be handed back with
    /// `send_release_texture` once consumed.
    fn on_current_frame(&mut self, _width: u32, _height: u32, _texture_id: TextureId, _mailbox: Mailbox) {}

    fn on_source_selected(&mut self) {}
    fn on_source_added(&mut self, _source_id: &str) {}
    fn on_source_removed(&mut self, _source_id: &str) {}
    fn on_init_segment_received(&mut self, _source_id: &str) {}
    fn on_buffered_range_update(&mut self, _source_id: &str, _ranges: &[BufferedRange]) {}
    fn on_timestamp_offset_update(&mut self, _source_id: &str, _timestamp_offset_us: i64) {}

    fn on_need_key(&mut self, _system_id: &str, _init_data: &[u8]) {}
}

pub fn dispatch_event<C: MediaPlayerClient + ?Sized>(client: &mut C, event: PlayerEvent) {
    match event {
        PlayerEvent::MediaError { code } => client.on_media_error(code),
        PlayerEvent::MediaPlaybackCompleted => client.on_playback_completed(),
        PlayerEvent::MediaDurationChanged { duration } => client.on_duration_changed(duration),
        PlayerEvent::SeekCompleted { time } => client.on_seek_completed(time),
        PlayerEvent::MediaVideoSizeChanged { width, height } => client.on_video_size_changed(width, height),
        PlayerEvent::MediaTimeUpdate { timestamp, ticks_us } => client.on_time_update(timestamp, ticks_us),
        PlayerEvent::MediaBufferingUpdate { percent } => client.on_buffering_update(percent),
        PlayerEvent::MediaPlayerReleased => client.on_player_released(),
        PlayerEvent::DidMediaPlayerPlay => client.on_played(),
        PlayerEvent::DidMediaPlayerPause => client.on_paused(),
        PlayerEvent::SetCurrentFrame {
            width,
            height,
            texture_id,
            mailbox,
        } => client.on_current_frame(width, height, texture_id, mailbox),
        PlayerEvent::SourceSelected => client.on_source_selected(),
        PlayerEvent::DidAddSourceId { source_id } => client.on_source_added(&source_id),
        PlayerEvent::DidRemoveSourceId { source_id } => client.on_source_removed(&source_id),
        PlayerEvent::InitSegmentReceived { source_id } => client.on_init_segment_received(&source_id),
        PlayerEvent::BufferedRangeUpdate { source_id, ranges } => {
            client.on_buffered_range_update(&source_id, &ranges)
        }
        PlayerEvent::TimestampOffsetUpdate {
            source_id,
            timestamp_offset_us,
        } => client.on_timestamp_offset_update(&source_id, timestamp_offset_us),
        PlayerEvent::NeedKey { system_id, init_data } => client.on_need_key(&system_id, &init_data),
    }
}

/// Drain `events` into `client` until its queue ends, or the media side
/// reports the player released. Returns whether that report was seen.
///
/// A renderer-initiated release ends the queue without a report.
pub async fn run_event_loop<C: MediaPlayerClient + ?Sized>(
    client: &mut C,
    mut events: mpsc::UnboundedReceiver<PlayerEvent>,
) -> bool {
    while let Some(event) = events.recv().await {
        let released = event == PlayerEvent::MediaPlayerReleased;
        dispatch_event(client, event);
        if released {
            return true;
        }
    }
    debug!("renderer: player event queue closed");
    false
}
