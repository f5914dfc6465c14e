//! MSE bookkeeping for a player: source buffers and stream matching.

use std::time::Duration;

use mediaproc_transport::message::BufferedRange;
use tracing::debug;

/// Backend codec descriptions that do not contain their MSE codec string.
const CODEC_TABLE: &[(&str, &str)] = &[("MPEG-4 AAC", "mp4a"), ("On2 VP9", "vp9")];

/// Map a backend codec description to the MSE codec string it stands for.
pub fn mse_codec_for(backend_codec: &str) -> Option<&'static str> {
    CODEC_TABLE
        .iter()
        .find(|(backend, _)| *backend == backend_codec)
        .map(|(_, mse)| *mse)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("adding source buffers is no longer supported")]
    NotSupported,
    #[error("source id already registered")]
    DuplicateId,
    #[error("source id is empty")]
    EmptyId,
}

#[derive(Debug, Clone)]
pub struct SourceBuffer {
    pub id: String,
    pub media_type: String,
    /// First codec of the registration.
    pub codec: String,
    /// Set once an init segment has been matched to this buffer.
    pub initialized: bool,
    pub sequence_mode: bool,
    pub group_start_us: Option<i64>,
    pub timestamp_offset_us: i64,
    buffered: Vec<BufferedRange>,
}

impl SourceBuffer {
    fn new(id: &str, media_type: &str, codecs: &[String]) -> Self {
        Self {
            id: id.to_string(),
            media_type: media_type.to_string(),
            codec: codecs.first().cloned().unwrap_or_default(),
            initialized: false,
            sequence_mode: false,
            group_start_us: None,
            timestamp_offset_us: 0,
            buffered: Vec::new(),
        }
    }

    pub fn buffered(&self) -> &[BufferedRange] {
        &self.buffered
    }

    pub fn set_buffered(&mut self, ranges: Vec<BufferedRange>) {
        self.buffered = ranges;
    }

    /// Cut `[start, end)` out of the buffered ranges.
    pub fn remove_range(&mut self, start: Duration, end: Duration) {
        let mut kept = Vec::with_capacity(self.buffered.len() + 1);
        for r in self.buffered.drain(..) {
            if r.end <= start || r.start >= end {
                kept.push(r);
                continue;
            }
            if r.start < start {
                kept.push(BufferedRange {
                    start: r.start,
                    end: start,
                });
            }
            if r.end > end {
                kept.push(BufferedRange { start: end, end: r.end });
            }
        }
        self.buffered = kept;
    }

    /// Whether a demuxed stream belongs to this buffer.
    fn accepts(&self, stream_type: &str, backend_codec: &str) -> bool {
        if self.initialized || !self.media_type.contains(stream_type) || self.codec.is_empty() {
            return false;
        }
        let lower = backend_codec.to_lowercase();
        let by_table = mse_codec_for(backend_codec).is_some_and(|mse| self.codec.contains(mse));
        by_table || self.codec.contains(&lower) || lower.contains(&self.codec)
    }
}

/// The MediaSource attached to a player once its source element is set up.
#[derive(Debug, Default)]
pub struct MediaSource {
    sources: Vec<SourceBuffer>,
    /// No further source buffers may be added (data appended or EOS seen).
    no_more_pads: bool,
    ended: bool,
    duration: Option<Duration>,
}

impl MediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_source_buffer(
        &mut self,
        id: &str,
        media_type: &str,
        codecs: &[String],
    ) -> Result<(), SourceError> {
        if self.no_more_pads {
            return Err(SourceError::NotSupported);
        }
        if id.is_empty() {
            return Err(SourceError::EmptyId);
        }
        if self.source(id).is_some() {
            return Err(SourceError::DuplicateId);
        }
        self.sources.push(SourceBuffer::new(id, media_type, codecs));
        Ok(())
    }

    pub fn remove_source_buffer(&mut self, id: &str) -> bool {
        let before = self.sources.len();
        self.sources.retain(|s| s.id != id);
        self.sources.len() != before
    }

    pub fn source(&self, id: &str) -> Option<&SourceBuffer> {
        self.sources.iter().find(|s| s.id == id)
    }

    pub fn source_mut(&mut self, id: &str) -> Option<&mut SourceBuffer> {
        self.sources.iter_mut().find(|s| s.id == id)
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.id.clone()).collect()
    }

    pub fn note_append(&mut self) {
        self.no_more_pads = true;
    }

    /// Mark the stream ended; returns every source that needs an EOS.
    pub fn mark_end_of_stream(&mut self) -> Vec<String> {
        self.ended = true;
        self.no_more_pads = true;
        self.source_ids()
    }

    pub fn unmark_end_of_stream(&mut self) {
        self.ended = false;
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn set_duration(&mut self, duration: Duration) {
        self.duration = Some(duration);
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// Assign a demuxed stream to the earliest-registered uninitialized
    /// buffer that accepts it. Returns that buffer's id.
    pub fn match_stream(&mut self, stream_type: &str, backend_codec: &str) -> Option<String> {
        let source = self
            .sources
            .iter_mut()
            .find(|s| s.accepts(stream_type, backend_codec))?;
        source.initialized = true;
        debug!(
            source_id = %source.id,
            stream_type,
            codec = backend_codec,
            "media source: init segment matched"
        );
        Some(source.id.clone())
    }
}
