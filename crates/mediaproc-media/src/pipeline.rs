//! Contract with the media pipeline backend.
//!
//! Pipelines are driven from the media main thread. They report back by
//! posting [`PipelineEvent`]s through a [`PipelineEventSink`], from whatever
//! thread their callbacks run on; the events are handled on the main thread.

use std::time::Duration;

use mediaproc_codec::DecryptError;
use mediaproc_transport::message::{AppendTimes, BufferedRange};
use mediaproc_transport::{ClientId, PlayerId};
use tokio::sync::mpsc;
use url::Url;

use crate::child_thread::MainEvent;
use crate::fmp4::FragmentError;
use crate::gl::Sample;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline is not ready: {0}")]
    InvalidState(&'static str),
    #[error("unknown source {0}")]
    UnknownSource(String),
    #[error("source {0} already exists")]
    DuplicateSource(String),
    #[error("decryption: {0}")]
    Decrypt(#[from] DecryptError),
    #[error("fragment: {0}")]
    Fragment(#[from] FragmentError),
    #[error("backend: {0}")]
    Backend(String),
}

/// Pipeline-reported playback state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Playing,
    Paused,
    Stopped,
    Buffering,
}

/// An elementary stream the demuxer found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    /// `"audio"` or `"video"`.
    pub stream_type: String,
    /// Backend codec description, e.g. `"MPEG-4 AAC"`.
    pub codec: String,
}

/// Callbacks from the pipeline, delivered on the main thread.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StateChanged(PipelineState),
    DurationChanged(Duration),
    VideoDimensionsChanged { width: u32, height: u32 },
    PositionUpdated(Duration),
    BufferingUpdate(i32),
    EndOfStream,
    Error(i32),
    /// A seek settled; `None` when the position could not be queried.
    SeekDone(Option<Duration>),
    MediaInfoUpdated(Vec<StreamInfo>),
    /// The source element was created and is ready for configuration.
    SourceSetup,
    /// Preroll finished.
    AsyncDone,
    FrameReady(Sample),
    BufferedRanges {
        source_id: String,
        ranges: Vec<BufferedRange>,
    },
    NeedKey {
        system_id: String,
        init_data: Vec<u8>,
    },
}

/// Posts pipeline events for one player onto the main thread.
#[derive(Clone)]
pub struct PipelineEventSink {
    tx: mpsc::UnboundedSender<MainEvent>,
    client_id: ClientId,
    player_id: PlayerId,
}

impl PipelineEventSink {
    pub fn new(
        tx: mpsc::UnboundedSender<MainEvent>,
        client_id: ClientId,
        player_id: PlayerId,
    ) -> Self {
        Self {
            tx,
            client_id,
            player_id,
        }
    }

    /// Returns false once the main thread has gone away.
    pub fn post(&self, event: PipelineEvent) -> bool {
        self.tx
            .send(MainEvent::Pipeline {
                client_id: self.client_id,
                player_id: self.player_id,
                event,
            })
            .is_ok()
    }
}

/// A media pipeline for one player.
pub trait Pipeline: Send {
    fn set_uri(&mut self, uri: &Url) -> Result<(), PipelineError>;
    fn set_position_update_interval(&mut self, interval: Duration);
    fn play(&mut self) -> Result<(), PipelineError>;
    fn pause(&mut self) -> Result<(), PipelineError>;
    fn seek(&mut self, position: Duration) -> Result<(), PipelineError>;

    fn add_source(
        &mut self,
        source_id: &str,
        media_type: &str,
        codec: &str,
    ) -> Result<(), PipelineError>;
    fn remove_source(&mut self, source_id: &str);
    fn push_buffer(
        &mut self,
        source_id: &str,
        data: Vec<u8>,
        times: &AppendTimes,
    ) -> Result<(), PipelineError>;
    fn abort(&mut self, source_id: &str);
    fn remove_range(&mut self, source_id: &str, start: Duration, end: Duration);
    fn end_of_stream(&mut self, source_id: &str);
    fn set_duration(&mut self, duration: Duration);

    /// Deliver a content key to the decryptor.
    fn add_key(&mut self, key_id: &[u8], key: &[u8]) -> Result<(), PipelineError>;
}

/// Builds pipelines. Shared by every player in the process.
pub trait PipelineFactory: Send + Sync {
    fn create(&self, sink: PipelineEventSink) -> Result<Box<dyn Pipeline>, PipelineError>;
}
