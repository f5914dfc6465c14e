//! Renderer-side view of a Media Source: source buffer ids, append
//! windows and the state the media process reports back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mediaproc_transport::message::{AppendTimes, BufferedRange};
use mediaproc_transport::PlayerEvent;
use tracing::debug;
use uuid::Uuid;

use crate::dispatcher::MediaPlayerDispatcher;
use crate::error::RendererError;

/// Seconds to a duration; infinity and anything unrepresentable map to `None`.
fn seconds_to_duration(seconds: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(seconds).ok()
}

fn seconds_to_micros(seconds: f64) -> i64 {
    (seconds * 1_000_000.0).round() as i64
}

/// Split a `codecs` parameter such as `"avc1.42E01E, mp4a.40.2"`.
pub fn parse_codecs(codecs: &str) -> Vec<String> {
    codecs
        .split(',')
        .map(|c| c.trim().trim_matches('"').trim())
        .filter(|c| !c.is_empty())
        .map(str::to_owned)
        .collect()
}

#[derive(Debug, Clone, Default)]
struct SourceBufferState {
    buffered: Vec<BufferedRange>,
    timestamp_offset_us: i64,
    init_segment_received: bool,
    append_window_start: Duration,
    append_window_end: Option<Duration>,
}

pub struct MediaSourceProxy {
    dispatcher: Arc<MediaPlayerDispatcher>,
    buffers: HashMap<String, SourceBufferState>,
}

impl MediaSourceProxy {
    pub fn new(dispatcher: Arc<MediaPlayerDispatcher>) -> Self {
        Self {
            dispatcher,
            buffers: HashMap::new(),
        }
    }

    /// Register a new source buffer and return its id. The media process
    /// confirms with `DidAddSourceId`.
    pub fn add_source_buffer(&mut self, media_type: &str, codecs: &str) -> Result<String, RendererError> {
        let id = Uuid::new_v4().to_string();
        if !self
            .dispatcher
            .send_add_source_id(&id, media_type, parse_codecs(codecs))
        {
            return Err(RendererError::NotSupported(media_type.to_owned()));
        }
        self.buffers.insert(id.clone(), SourceBufferState::default());
        Ok(id)
    }

    /// Ask for removal. The entry goes away on `DidRemoveSourceId`.
    pub fn remove_source_buffer(&mut self, id: &str) -> Result<(), RendererError> {
        self.known(id)?;
        self.dispatcher.send_remove_source_id(id);
        Ok(())
    }

    pub fn source_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.buffers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn set_duration(&self, seconds: f64) {
        let duration = seconds_to_duration(seconds.max(0.0)).unwrap_or(Duration::MAX);
        self.dispatcher.send_set_duration(duration);
    }

    pub fn mark_end_of_stream(&self) {
        self.dispatcher.send_mark_end_of_stream();
    }

    pub fn unmark_end_of_stream(&self) {
        self.dispatcher.send_unmark_end_of_stream();
    }

    fn known(&self, id: &str) -> Result<&SourceBufferState, RendererError> {
        self.buffers
            .get(id)
            .ok_or_else(|| RendererError::UnknownSource(id.to_owned()))
    }

    fn known_mut(&mut self, id: &str) -> Result<&mut SourceBufferState, RendererError> {
        self.buffers
            .get_mut(id)
            .ok_or_else(|| RendererError::UnknownSource(id.to_owned()))
    }

    pub fn set_sequence_mode(&self, id: &str, sequence_mode: bool) -> Result<(), RendererError> {
        self.known(id)?;
        self.dispatcher.send_set_sequence_mode(id, sequence_mode);
        Ok(())
    }

    /// Send `data` with the buffer's current append window and offset.
    /// Returns true when an init segment arrived since the previous append.
    pub fn append(&mut self, id: &str, data: Vec<u8>) -> Result<bool, RendererError> {
        let state = self.known_mut(id)?;
        let init_segment_received = std::mem::take(&mut state.init_segment_received);
        let times = AppendTimes {
            append_window_start: state.append_window_start,
            append_window_end: state.append_window_end,
            timestamp_offset_us: state.timestamp_offset_us,
        };
        self.dispatcher.send_append_data(id, data, times);
        Ok(init_segment_received)
    }

    pub fn abort(&self, id: &str) -> Result<(), RendererError> {
        self.known(id)?;
        self.dispatcher.send_abort(id);
        Ok(())
    }

    pub fn remove(&self, id: &str, start: f64, end: f64) -> Result<(), RendererError> {
        self.known(id)?;
        let start = seconds_to_duration(start.max(0.0)).unwrap_or(Duration::MAX);
        let end = seconds_to_duration(end.max(0.0)).unwrap_or(Duration::MAX);
        self.dispatcher.send_remove_segment(id, start, end);
        Ok(())
    }

    /// Also becomes the group start timestamp in sequence mode.
    pub fn set_timestamp_offset(&mut self, id: &str, seconds: f64) -> Result<(), RendererError> {
        let state = self.known_mut(id)?;
        state.timestamp_offset_us = seconds_to_micros(seconds);
        let offset = state.timestamp_offset_us;
        self.dispatcher
            .send_set_group_start_timestamp_if_in_sequence_mode(id, offset);
        Ok(())
    }

    pub fn set_append_window_start(&mut self, id: &str, seconds: f64) -> Result<(), RendererError> {
        self.known_mut(id)?.append_window_start = seconds_to_duration(seconds.max(0.0)).unwrap_or(Duration::MAX);
        Ok(())
    }

    /// `f64::INFINITY` leaves the window open-ended.
    pub fn set_append_window_end(&mut self, id: &str, seconds: f64) -> Result<(), RendererError> {
        self.known_mut(id)?.append_window_end = seconds_to_duration(seconds.max(0.0));
        Ok(())
    }

    pub fn buffered(&self, id: &str) -> Result<Vec<BufferedRange>, RendererError> {
        Ok(self.known(id)?.buffered.clone())
    }

    pub fn timestamp_offset_us(&self, id: &str) -> Result<i64, RendererError> {
        Ok(self.known(id)?.timestamp_offset_us)
    }

    /// Fold a media-source event into local state. Events about a source
    /// this proxy does not know are a format error.
    pub fn on_event(&mut self, event: &PlayerEvent) -> Result<(), RendererError> {
        match event {
            PlayerEvent::DidAddSourceId { source_id } => {
                self.known(source_id)?;
            }
            PlayerEvent::DidRemoveSourceId { source_id } => {
                if self.buffers.remove(source_id).is_none() {
                    return Err(RendererError::UnknownSource(source_id.clone()));
                }
            }
            PlayerEvent::InitSegmentReceived { source_id } => {
                self.known_mut(source_id)?.init_segment_received = true;
            }
            PlayerEvent::BufferedRangeUpdate { source_id, ranges } => {
                self.known_mut(source_id)?.buffered = ranges.clone();
            }
            PlayerEvent::TimestampOffsetUpdate {
                source_id,
                timestamp_offset_us,
            } => {
                self.known_mut(source_id)?.timestamp_offset_us = *timestamp_offset_us;
            }
            other => debug!(?other, "media source: event ignored"),
        }
        Ok(())
    }
}
