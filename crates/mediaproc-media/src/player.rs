//! One media player session: the state machine between renderer requests,
//! pipeline callbacks and GL-backed frame delivery.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use mediaproc_transport::message::{media_error, AppendTimes, BufferedRange};
use mediaproc_transport::{Channel, Message, PlayerEvent, PlayerId, PlayerRequest, TextureId};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::gl::{FrameOutcome, GlError, GlHandle, GlSessionId, Sample};
use crate::media_source::MediaSource;
use crate::pipeline::{
    Pipeline, PipelineError, PipelineEvent, PipelineEventSink, PipelineFactory, PipelineState,
    StreamInfo,
};

/// URL scheme that selects a MediaSource load.
pub const MEDIA_SOURCE_SCHEME: &str = "mediasourceblob";

/// Schemes a pipeline may fetch from.
const ALLOWED_SCHEMES: &[&str] = &["http", "https", "blob", "file", "data"];

#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    #[error("pipeline: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("gl: {0}")]
    Gl(#[from] GlError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Loading,
    Paused,
    Playing,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadType {
    Url,
    MediaSource,
}

/// Outbound half of a player: tags events with the player id.
#[derive(Clone)]
pub struct PlayerEventSender {
    channel: Channel,
    player_id: PlayerId,
}

impl PlayerEventSender {
    pub fn new(channel: Channel, player_id: PlayerId) -> Self {
        Self { channel, player_id }
    }

    pub fn send(&self, event: PlayerEvent) -> bool {
        match self.channel.send(Message::event(self.player_id, event)) {
            Ok(()) => true,
            Err(e) => {
                debug!(player_id = self.player_id, error = %e, "player: event dropped");
                false
            }
        }
    }
}

/// Monotonic ticks attached to time updates.
fn ticks_us() -> u64 {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    ORIGIN.get_or_init(Instant::now).elapsed().as_micros() as u64
}

#[derive(Debug, Default)]
struct SeekState {
    in_flight: Option<Duration>,
    /// Latest target requested while a seek was in flight.
    pending: Option<Duration>,
}

pub struct MediaPlayer {
    player_id: PlayerId,
    events: PlayerEventSender,
    pipeline: Option<Box<dyn Pipeline>>,
    gl: GlHandle,
    gl_session: GlSessionId,
    state: PlayerState,
    load_type: Option<LoadType>,
    seek: SeekState,
    duration_known: bool,
    was_preroll: bool,
    media_source: Option<MediaSource>,
}

impl MediaPlayer {
    pub fn new(
        player_id: PlayerId,
        events: PlayerEventSender,
        factory: &dyn PipelineFactory,
        sink: PipelineEventSink,
        gl: GlHandle,
    ) -> Result<Self, PlayerError> {
        let gl_session = gl.call(|gl| gl.setup_context())??;
        let pipeline = match factory.create(sink) {
            Ok(p) => p,
            Err(e) => {
                let _ = gl.call(move |gl| gl.cleanup_context(gl_session));
                return Err(e.into());
            }
        };
        info!(player_id, "player: created");
        Ok(Self {
            player_id,
            events,
            pipeline: Some(pipeline),
            gl,
            gl_session,
            state: PlayerState::Idle,
            load_type: None,
            seek: SeekState::default(),
            duration_known: false,
            was_preroll: false,
            media_source: None,
        })
    }

    pub fn player_id(&self) -> PlayerId {
        self.player_id
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn is_seeking(&self) -> bool {
        self.seek.in_flight.is_some()
    }

    pub fn load_type(&self) -> Option<LoadType> {
        self.load_type
    }

    pub fn media_source(&self) -> Option<&MediaSource> {
        self.media_source.as_ref()
    }

    fn pipeline(&mut self) -> Option<&mut Box<dyn Pipeline>> {
        self.pipeline.as_mut()
    }

    fn send(&self, event: PlayerEvent) {
        self.events.send(event);
    }

    /// Dispatch a renderer request. `Create` and `Release` are handled by
    /// the owning channel.
    pub fn handle_request(&mut self, request: PlayerRequest) {
        match request {
            PlayerRequest::Create | PlayerRequest::Release => {}
            PlayerRequest::Load {
                url,
                position_update_interval_ms,
            } => self.load(&url, Duration::from_millis(position_update_interval_ms)),
            PlayerRequest::Start => self.start(),
            PlayerRequest::Pause => self.pause(),
            PlayerRequest::Seek { time } => self.seek(time),
            PlayerRequest::ReleaseTexture { texture_id } => self.release_texture(texture_id),
            PlayerRequest::AddSourceId {
                source_id,
                media_type,
                codecs,
            } => self.add_source_id(source_id, &media_type, &codecs),
            PlayerRequest::RemoveSourceId { source_id } => self.remove_source_id(source_id),
            PlayerRequest::SetDuration { duration } => self.set_duration(duration),
            PlayerRequest::MarkEndOfStream => self.mark_end_of_stream(),
            PlayerRequest::UnmarkEndOfStream => {
                if let Some(ms) = self.media_source.as_mut() {
                    ms.unmark_end_of_stream();
                }
            }
            PlayerRequest::SetSequenceMode {
                source_id,
                sequence_mode,
            } => {
                if let Some(sb) = self
                    .media_source
                    .as_mut()
                    .and_then(|ms| ms.source_mut(&source_id))
                {
                    sb.sequence_mode = sequence_mode;
                }
            }
            PlayerRequest::AppendData {
                source_id,
                data,
                times,
            } => self.append_data(source_id, data, times),
            PlayerRequest::Abort { source_id } => self.abort(&source_id),
            PlayerRequest::SetGroupStartTimestampIfInSequenceMode {
                source_id,
                timestamp_offset_us,
            } => {
                if let Some(sb) = self
                    .media_source
                    .as_mut()
                    .and_then(|ms| ms.source_mut(&source_id))
                {
                    if sb.sequence_mode {
                        sb.group_start_us = Some(timestamp_offset_us);
                    }
                }
            }
            PlayerRequest::RemoveSegment {
                source_id,
                start,
                end,
            } => self.remove_segment(source_id, start, end),
            PlayerRequest::AddKey {
                session_id,
                key_id,
                key,
            } => {
                let Some(pipeline) = self.pipeline() else { return };
                if let Err(e) = pipeline.add_key(&key_id, &key) {
                    warn!(player_id = self.player_id, session_id, error = %e, "player: key rejected");
                }
            }
        }
    }

    fn load(&mut self, url: &str, interval: Duration) {
        if !matches!(self.state, PlayerState::Idle | PlayerState::Stopped) {
            warn!(player_id = self.player_id, state = ?self.state, "player: load ignored");
            return;
        }
        let parsed = match Url::parse(url) {
            Ok(u) => u,
            Err(e) => {
                warn!(player_id = self.player_id, error = %e, "player: malformed url");
                self.on_error(media_error::FORMAT);
                return;
            }
        };
        let load_type = match parsed.scheme() {
            MEDIA_SOURCE_SCHEME => LoadType::MediaSource,
            scheme if ALLOWED_SCHEMES.contains(&scheme) => LoadType::Url,
            scheme => {
                warn!(player_id = self.player_id, scheme, "player: restricted protocol");
                self.on_error(media_error::FORMAT);
                return;
            }
        };

        self.load_type = Some(load_type);
        self.duration_known = false;
        self.media_source = None;
        let Some(pipeline) = self.pipeline.as_mut() else { return };
        let result = pipeline.set_uri(&parsed).and_then(|()| {
            pipeline.set_position_update_interval(interval);
            pipeline.pause()
        });
        match result {
            Ok(()) => {
                debug!(player_id = self.player_id, ?load_type, "player: loading");
                self.state = PlayerState::Loading;
            }
            Err(e) => {
                warn!(player_id = self.player_id, error = %e, "player: load failed");
                self.on_error(media_error::FORMAT);
            }
        }
    }

    fn start(&mut self) {
        if matches!(self.state, PlayerState::Idle | PlayerState::Error) {
            debug!(player_id = self.player_id, state = ?self.state, "player: start ignored");
            return;
        }
        let Some(pipeline) = self.pipeline() else { return };
        if let Err(e) = pipeline.play() {
            warn!(player_id = self.player_id, error = %e, "player: play failed");
        }
    }

    fn pause(&mut self) {
        if !matches!(self.state, PlayerState::Playing | PlayerState::Paused) {
            debug!(player_id = self.player_id, state = ?self.state, "player: pause ignored");
            return;
        }
        let Some(pipeline) = self.pipeline() else { return };
        if let Err(e) = pipeline.pause() {
            warn!(player_id = self.player_id, error = %e, "player: pause failed");
        }
    }

    fn seek(&mut self, target: Duration) {
        if matches!(self.state, PlayerState::Idle | PlayerState::Error) {
            debug!(player_id = self.player_id, state = ?self.state, "player: seek ignored");
            return;
        }
        if self.seek.in_flight.is_some() {
            debug!(player_id = self.player_id, ?target, "player: seek coalesced");
            self.seek.pending = Some(target);
            return;
        }
        self.issue_seek(target);
    }

    fn issue_seek(&mut self, target: Duration) {
        self.seek.in_flight = Some(target);
        let Some(pipeline) = self.pipeline.as_mut() else { return };
        if let Err(e) = pipeline.seek(target) {
            warn!(player_id = self.player_id, ?target, error = %e, "player: seek failed");
            self.on_error(media_error::DECODE);
        }
    }

    fn on_seek_done(&mut self, position: Option<Duration>) {
        let Some(target) = self.seek.in_flight else {
            debug!(player_id = self.player_id, "player: unexpected seek completion");
            return;
        };
        if let Some(next) = self.seek.pending.take() {
            self.issue_seek(next);
            return;
        }
        self.seek.in_flight = None;
        self.send(PlayerEvent::SeekCompleted {
            time: position.unwrap_or(target),
        });
    }

    fn release_texture(&mut self, texture_id: TextureId) {
        let session = self.gl_session;
        let posted = self.gl.post(move |gl| {
            if !gl.release_texture(session, texture_id) {
                debug!(texture_id, "gl: release for unbound texture");
            }
        });
        if let Err(e) = posted {
            warn!(player_id = self.player_id, error = %e, "player: texture release lost");
        }
    }

    fn add_source_id(&mut self, source_id: String, media_type: &str, codecs: &[String]) {
        let Some(ms) = self.media_source.as_mut() else {
            warn!(player_id = self.player_id, "player: add source without media source");
            self.send(PlayerEvent::DidAddSourceId {
                source_id: String::new(),
            });
            return;
        };
        let mut accepted = match ms.add_source_buffer(&source_id, media_type, codecs) {
            Ok(()) => true,
            Err(e) => {
                warn!(player_id = self.player_id, source_id, error = %e, "player: source rejected");
                false
            }
        };
        if accepted {
            let codec = codecs.first().map(String::as_str).unwrap_or_default();
            if let Some(pipeline) = self.pipeline.as_mut() {
                if let Err(e) = pipeline.add_source(&source_id, media_type, codec) {
                    warn!(player_id = self.player_id, source_id, error = %e, "player: pipeline source failed");
                    ms.remove_source_buffer(&source_id);
                    accepted = false;
                }
            }
        }
        self.send(PlayerEvent::DidAddSourceId {
            source_id: if accepted { source_id } else { String::new() },
        });
    }

    fn remove_source_id(&mut self, source_id: String) {
        let removed = self
            .media_source
            .as_mut()
            .is_some_and(|ms| ms.remove_source_buffer(&source_id));
        if removed {
            if let Some(pipeline) = self.pipeline.as_mut() {
                pipeline.remove_source(&source_id);
            }
        }
        self.send(PlayerEvent::DidRemoveSourceId {
            source_id: if removed { source_id } else { String::new() },
        });
    }

    fn set_duration(&mut self, duration: Duration) {
        let Some(ms) = self.media_source.as_mut() else { return };
        ms.set_duration(duration);
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.set_duration(duration);
        }
    }

    fn mark_end_of_stream(&mut self) {
        let Some(ms) = self.media_source.as_mut() else { return };
        let ids = ms.mark_end_of_stream();
        if let Some(pipeline) = self.pipeline.as_mut() {
            for id in &ids {
                pipeline.end_of_stream(id);
            }
        }
    }

    fn append_data(&mut self, source_id: String, data: Vec<u8>, times: AppendTimes) {
        let Some(ms) = self.media_source.as_mut() else {
            debug!(player_id = self.player_id, "player: append without media source");
            return;
        };
        let Some(sb) = ms.source_mut(&source_id) else {
            warn!(player_id = self.player_id, source_id, "player: append to unknown source");
            return;
        };
        let offset = match sb.group_start_us.take() {
            Some(group_start) if sb.sequence_mode => group_start,
            _ => times.timestamp_offset_us,
        };
        sb.timestamp_offset_us = offset;
        ms.note_append();

        let times = AppendTimes {
            timestamp_offset_us: offset,
            ..times
        };
        let Some(pipeline) = self.pipeline.as_mut() else { return };
        match pipeline.push_buffer(&source_id, data, &times) {
            Ok(()) => self.send(PlayerEvent::TimestampOffsetUpdate {
                source_id,
                timestamp_offset_us: offset,
            }),
            Err(e) => warn!(player_id = self.player_id, source_id, error = %e, "player: append failed"),
        }
    }

    fn abort(&mut self, source_id: &str) {
        let Some(sb) = self
            .media_source
            .as_mut()
            .and_then(|ms| ms.source_mut(source_id))
        else {
            return;
        };
        sb.group_start_us = None;
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.abort(source_id);
        }
    }

    fn remove_segment(&mut self, source_id: String, start: Duration, end: Duration) {
        let Some(sb) = self
            .media_source
            .as_mut()
            .and_then(|ms| ms.source_mut(&source_id))
        else {
            return;
        };
        sb.remove_range(start, end);
        let ranges = sb.buffered().to_vec();
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.remove_range(&source_id, start, end);
        }
        self.send(PlayerEvent::BufferedRangeUpdate { source_id, ranges });
    }

    /// Handle a callback from this player's pipeline.
    pub fn on_pipeline_event(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::StateChanged(state) => self.on_state_changed(state),
            PipelineEvent::DurationChanged(duration) => {
                self.duration_known = true;
                self.send(PlayerEvent::MediaDurationChanged { duration });
            }
            PipelineEvent::VideoDimensionsChanged { width, height } => {
                if width > 0 && height > 0 {
                    self.send(PlayerEvent::MediaVideoSizeChanged { width, height });
                }
            }
            PipelineEvent::PositionUpdated(timestamp) => {
                self.send(PlayerEvent::MediaTimeUpdate {
                    timestamp,
                    ticks_us: ticks_us(),
                });
            }
            PipelineEvent::BufferingUpdate(percent) => {
                self.send(PlayerEvent::MediaBufferingUpdate { percent });
            }
            PipelineEvent::EndOfStream => self.send(PlayerEvent::MediaPlaybackCompleted),
            PipelineEvent::Error(code) => self.on_error(code),
            PipelineEvent::SeekDone(position) => self.on_seek_done(position),
            PipelineEvent::MediaInfoUpdated(streams) => self.on_media_info(&streams),
            PipelineEvent::SourceSetup => self.on_source_setup(),
            PipelineEvent::AsyncDone => self.was_preroll = true,
            PipelineEvent::FrameReady(sample) => self.on_frame_ready(sample),
            PipelineEvent::BufferedRanges { source_id, ranges } => {
                self.on_buffered_ranges(source_id, ranges)
            }
            PipelineEvent::NeedKey {
                system_id,
                init_data,
            } => self.send(PlayerEvent::NeedKey {
                system_id,
                init_data,
            }),
        }
    }

    fn on_state_changed(&mut self, state: PipelineState) {
        match state {
            PipelineState::Playing => {
                self.state = PlayerState::Playing;
                self.send(PlayerEvent::DidMediaPlayerPlay);
            }
            PipelineState::Paused => {
                self.state = PlayerState::Paused;
                self.send(PlayerEvent::DidMediaPlayerPause);
            }
            PipelineState::Stopped => self.state = PlayerState::Stopped,
            PipelineState::Buffering => {
                debug!(player_id = self.player_id, "player: buffering");
            }
        }
    }

    fn on_error(&mut self, code: i32) {
        // Before metadata arrives every failure is a format error.
        let code = if self.duration_known {
            code
        } else {
            media_error::FORMAT
        };
        error!(player_id = self.player_id, code, "player: media error");
        self.state = PlayerState::Error;
        self.seek = SeekState::default();
        self.send(PlayerEvent::MediaError { code });
    }

    fn on_source_setup(&mut self) {
        if self.load_type != Some(LoadType::MediaSource) {
            return;
        }
        if self.media_source.is_some() {
            warn!(player_id = self.player_id, "player: media source already selected");
            return;
        }
        self.media_source = Some(MediaSource::new());
        self.send(PlayerEvent::SourceSelected);
    }

    fn on_media_info(&mut self, streams: &[StreamInfo]) {
        let Some(ms) = self.media_source.as_mut() else { return };
        let matched: Vec<String> = streams
            .iter()
            .filter_map(|s| ms.match_stream(&s.stream_type, &s.codec))
            .collect();
        for source_id in matched {
            self.send(PlayerEvent::InitSegmentReceived { source_id });
        }
    }

    fn on_buffered_ranges(&mut self, source_id: String, ranges: Vec<BufferedRange>) {
        let Some(sb) = self
            .media_source
            .as_mut()
            .and_then(|ms| ms.source_mut(&source_id))
        else {
            return;
        };
        sb.set_buffered(ranges.clone());
        self.send(PlayerEvent::BufferedRangeUpdate { source_id, ranges });
    }

    fn on_frame_ready(&mut self, sample: Sample) {
        let texture_id = sample.texture_id();
        let (width, height) = sample.size();
        let session = self.gl_session;
        let was_preroll = self.was_preroll;
        let outcome = match self
            .gl
            .call(move |gl| gl.bind_frame(session, sample, was_preroll))
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(player_id = self.player_id, error = %e, "player: frame dropped");
                return;
            }
        };
        match outcome {
            FrameOutcome::Bound { mailbox } => self.send(PlayerEvent::SetCurrentFrame {
                width,
                height,
                texture_id,
                mailbox,
            }),
            FrameOutcome::PrerollDuplicate => {
                debug!(player_id = self.player_id, texture_id, "player: preroll frame repeated");
                self.was_preroll = false;
            }
            FrameOutcome::StillBound => {
                warn!(player_id = self.player_id, texture_id, "player: texture not yet released");
            }
            FrameOutcome::InvalidTexture => {
                error!(player_id = self.player_id, "player: sample without texture");
                self.on_error(media_error::DECODE);
            }
            FrameOutcome::NoContext => {
                warn!(player_id = self.player_id, "player: frame without gl context");
            }
        }
    }
}

impl Drop for MediaPlayer {
    fn drop(&mut self) {
        let session = self.gl_session;
        if let Err(e) = self.gl.call(move |gl| gl.cleanup_samples(session)) {
            warn!(player_id = self.player_id, error = %e, "player: sample cleanup failed");
        }
        drop(self.pipeline.take());
        if let Err(e) = self.gl.call(move |gl| gl.cleanup_context(session)) {
            warn!(player_id = self.player_id, error = %e, "player: context cleanup failed");
        }
        info!(player_id = self.player_id, "player: destroyed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use mediaproc_transport::channel::forward_to;
    use mediaproc_transport::{ChannelEvent, SyncPolicy};
    use tokio::runtime::Runtime;
    use tokio::sync::mpsc;

    use super::*;
    use crate::gl::{GlThread, OffscreenContextProvider};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        SetUri(String),
        Play,
        Pause,
        Seek(Duration),
        AddSource(String),
        Push(String, usize),
        Eos(String),
        Key(Vec<u8>),
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Call>>>);

    impl Recorder {
        fn push(&self, call: Call) {
            self.0.lock().unwrap().push(call);
        }
    }

    struct FakePipeline {
        calls: Recorder,
        /// `seek` to this position fails.
        bad_seek: Option<Duration>,
    }

    impl Pipeline for FakePipeline {
        fn set_uri(&mut self, uri: &Url) -> Result<(), PipelineError> {
            self.calls.push(Call::SetUri(uri.to_string()));
            Ok(())
        }
        fn set_position_update_interval(&mut self, _: Duration) {}
        fn play(&mut self) -> Result<(), PipelineError> {
            self.calls.push(Call::Play);
            Ok(())
        }
        fn pause(&mut self) -> Result<(), PipelineError> {
            self.calls.push(Call::Pause);
            Ok(())
        }
        fn seek(&mut self, position: Duration) -> Result<(), PipelineError> {
            self.calls.push(Call::Seek(position));
            if self.bad_seek == Some(position) {
                return Err(PipelineError::Backend("seek rejected".into()));
            }
            Ok(())
        }
        fn add_source(&mut self, id: &str, _: &str, _: &str) -> Result<(), PipelineError> {
            self.calls.push(Call::AddSource(id.into()));
            Ok(())
        }
        fn remove_source(&mut self, _: &str) {}
        fn push_buffer(
            &mut self,
            id: &str,
            data: Vec<u8>,
            _: &AppendTimes,
        ) -> Result<(), PipelineError> {
            self.calls.push(Call::Push(id.into(), data.len()));
            Ok(())
        }
        fn abort(&mut self, _: &str) {}
        fn remove_range(&mut self, _: &str, _: Duration, _: Duration) {}
        fn end_of_stream(&mut self, id: &str) {
            self.calls.push(Call::Eos(id.into()));
        }
        fn set_duration(&mut self, _: Duration) {}
        fn add_key(&mut self, _: &[u8], key: &[u8]) -> Result<(), PipelineError> {
            self.calls.push(Call::Key(key.to_vec()));
            Ok(())
        }
    }

    /// Hands out one pre-built pipeline.
    struct OneShotFactory(Mutex<Option<FakePipeline>>);

    impl PipelineFactory for OneShotFactory {
        fn create(&self, _: PipelineEventSink) -> Result<Box<dyn Pipeline>, PipelineError> {
            self.0
                .lock()
                .unwrap()
                .take()
                .map(|p| Box::new(p) as Box<dyn Pipeline>)
                .ok_or(PipelineError::Backend("exhausted".into()))
        }
    }

    struct Harness {
        player: MediaPlayer,
        calls: Recorder,
        renderer_rx: mpsc::UnboundedReceiver<ChannelEvent>,
        _renderer: Channel,
        _gl: GlThread,
        rt: Runtime,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_bad_seek(None)
        }

        fn with_bad_seek(bad_seek: Option<Duration>) -> Self {
            let rt = Runtime::new().unwrap();
            let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
            let (media_tx, _media_rx) = mpsc::unbounded_channel();
            let media = Channel::from_stream(
                rt.handle(),
                "media",
                a,
                forward_to(media_tx, |e| e),
                SyncPolicy::Forbid,
            )
            .unwrap();
            let (renderer_tx, renderer_rx) = mpsc::unbounded_channel();
            let renderer = Channel::from_stream(
                rt.handle(),
                "renderer",
                b,
                forward_to(renderer_tx, |e| e),
                SyncPolicy::Allow,
            )
            .unwrap();

            let gl = GlThread::spawn(Box::new(OffscreenContextProvider)).unwrap();
            let calls = Recorder::default();
            let factory = OneShotFactory(Mutex::new(Some(FakePipeline {
                calls: calls.clone(),
                bad_seek,
            })));
            let (main_tx, _main_rx) = mpsc::unbounded_channel();
            let player = MediaPlayer::new(
                1,
                PlayerEventSender::new(media, 1),
                &factory,
                PipelineEventSink::new(main_tx, 0, 1),
                gl.handle(),
            )
            .unwrap();
            Self {
                player,
                calls,
                renderer_rx,
                _renderer: renderer,
                _gl: gl,
                rt,
            }
        }

        /// Player events received by the renderer so far (waits briefly).
        fn events(&mut self) -> Vec<PlayerEvent> {
            let rx = &mut self.renderer_rx;
            self.rt.block_on(async {
                let mut out = Vec::new();
                while let Ok(Some(ev)) =
                    tokio::time::timeout(Duration::from_millis(200), rx.recv()).await
                {
                    if let ChannelEvent::Message(Message::PlayerEvent { event, .. }) = ev {
                        out.push(event);
                    }
                }
                out
            })
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.0.lock().unwrap().clone()
        }

        fn load_paused(&mut self, url: &str) {
            self.player.handle_request(PlayerRequest::Load {
                url: url.into(),
                position_update_interval_ms: 250,
            });
            self.player.on_pipeline_event(PipelineEvent::SourceSetup);
            self.player
                .on_pipeline_event(PipelineEvent::StateChanged(PipelineState::Paused));
        }
    }

    #[test]
    fn load_pauses_pipeline_and_enters_loading() {
        let mut h = Harness::new();
        h.player.handle_request(PlayerRequest::Load {
            url: "https://example.com/a.webm".into(),
            position_update_interval_ms: 100,
        });
        assert_eq!(h.player.state(), PlayerState::Loading);
        assert_eq!(h.player.load_type(), Some(LoadType::Url));
        assert_eq!(
            h.calls(),
            vec![Call::SetUri("https://example.com/a.webm".into()), Call::Pause]
        );
    }

    #[test]
    fn restricted_scheme_reports_format_error() {
        let mut h = Harness::new();
        h.player.handle_request(PlayerRequest::Load {
            url: "ftp://example.com/a.webm".into(),
            position_update_interval_ms: 100,
        });
        assert_eq!(h.player.state(), PlayerState::Error);
        assert!(h.calls().is_empty());
        assert_eq!(
            h.events(),
            vec![PlayerEvent::MediaError {
                code: media_error::FORMAT
            }]
        );
    }

    #[test]
    fn error_before_metadata_is_format_error() {
        let mut h = Harness::new();
        h.load_paused("https://example.com/a.mp4");
        h.player.on_pipeline_event(PipelineEvent::Error(media_error::DECODE));
        h.player.handle_request(PlayerRequest::Start);
        let events = h.events();
        assert_eq!(
            events.last(),
            Some(&PlayerEvent::MediaError {
                code: media_error::FORMAT
            })
        );
        assert!(!h.calls().contains(&Call::Play));
    }

    #[test]
    fn error_after_metadata_passes_code_through() {
        let mut h = Harness::new();
        h.load_paused("https://example.com/a.mp4");
        h.player
            .on_pipeline_event(PipelineEvent::DurationChanged(Duration::from_secs(30)));
        h.player.on_pipeline_event(PipelineEvent::Error(media_error::DECODE));
        assert_eq!(
            h.events().last(),
            Some(&PlayerEvent::MediaError {
                code: media_error::DECODE
            })
        );
    }

    #[test]
    fn overlapping_seeks_coalesce_to_one_completion() {
        let mut h = Harness::new();
        h.load_paused("https://example.com/a.mp4");
        let a = Duration::from_secs(10);
        let b = Duration::from_secs(20);
        let c = Duration::from_secs(30);

        h.player.handle_request(PlayerRequest::Seek { time: a });
        h.player.handle_request(PlayerRequest::Seek { time: b });
        h.player.handle_request(PlayerRequest::Seek { time: c });
        assert!(h.player.is_seeking());

        h.player.on_pipeline_event(PipelineEvent::SeekDone(Some(a)));
        assert!(h.player.is_seeking());
        h.player.on_pipeline_event(PipelineEvent::SeekDone(Some(c)));
        assert!(!h.player.is_seeking());

        let seeks: Vec<_> = h
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Seek(_)))
            .collect();
        assert_eq!(seeks, vec![Call::Seek(a), Call::Seek(c)]);

        let completions: Vec<_> = h
            .events()
            .into_iter()
            .filter(|e| matches!(e, PlayerEvent::SeekCompleted { .. }))
            .collect();
        assert_eq!(completions, vec![PlayerEvent::SeekCompleted { time: c }]);
    }

    #[test]
    fn failed_coalesced_seek_reports_media_error() {
        let mut h = Harness::with_bad_seek(Some(Duration::from_secs(20)));
        h.load_paused("https://example.com/a.mp4");
        h.player
            .on_pipeline_event(PipelineEvent::DurationChanged(Duration::from_secs(60)));

        h.player.handle_request(PlayerRequest::Seek {
            time: Duration::from_secs(10),
        });
        h.player.handle_request(PlayerRequest::Seek {
            time: Duration::from_secs(20),
        });
        h.player
            .on_pipeline_event(PipelineEvent::SeekDone(Some(Duration::from_secs(10))));

        assert!(!h.player.is_seeking());
        assert_eq!(h.player.state(), PlayerState::Error);
        assert_eq!(
            h.events().last(),
            Some(&PlayerEvent::MediaError {
                code: media_error::DECODE
            })
        );
    }

    #[test]
    fn failed_first_seek_reports_media_error() {
        let mut h = Harness::with_bad_seek(Some(Duration::from_secs(5)));
        h.load_paused("https://example.com/a.mp4");
        h.player.handle_request(PlayerRequest::Seek {
            time: Duration::from_secs(5),
        });
        assert!(!h.player.is_seeking());
        let events = h.events();
        assert!(events.contains(&PlayerEvent::MediaError {
            code: media_error::FORMAT
        }));
        assert!(!events
            .iter()
            .any(|e| matches!(e, PlayerEvent::SeekCompleted { .. })));
    }

    #[test]
    fn preroll_redelivery_sends_one_frame() {
        let mut h = Harness::new();
        h.load_paused("https://example.com/a.mp4");
        let sample = Sample::new(7, 320, 240);
        h.player
            .on_pipeline_event(PipelineEvent::FrameReady(sample.clone()));
        h.player.on_pipeline_event(PipelineEvent::AsyncDone);
        h.player
            .on_pipeline_event(PipelineEvent::FrameReady(sample.clone()));

        let frames: Vec<_> = h
            .events()
            .into_iter()
            .filter(|e| matches!(e, PlayerEvent::SetCurrentFrame { .. }))
            .collect();
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            frames[0],
            PlayerEvent::SetCurrentFrame {
                texture_id: 7,
                width: 320,
                height: 240,
                ..
            }
        ));
        // Still bound on the GL thread until released.
        assert_eq!(sample.ref_count(), 2);
    }

    #[test]
    fn media_source_load_selects_source_and_matches_streams() {
        let mut h = Harness::new();
        h.load_paused("mediasourceblob:https://example.com/1234");
        assert_eq!(h.player.load_type(), Some(LoadType::MediaSource));
        h.player.handle_request(PlayerRequest::AddSourceId {
            source_id: "audio".into(),
            media_type: "audio/mp4".into(),
            codecs: vec!["mp4a.40.2".into()],
        });
        h.player.handle_request(PlayerRequest::AddSourceId {
            source_id: "video".into(),
            media_type: "video/webm".into(),
            codecs: vec!["vp9".into()],
        });
        h.player
            .on_pipeline_event(PipelineEvent::MediaInfoUpdated(vec![
                StreamInfo {
                    stream_type: "video".into(),
                    codec: "On2 VP9".into(),
                },
                StreamInfo {
                    stream_type: "audio".into(),
                    codec: "MPEG-4 AAC".into(),
                },
            ]));

        let events = h.events();
        assert!(events.contains(&PlayerEvent::SourceSelected));
        assert!(events.contains(&PlayerEvent::DidAddSourceId {
            source_id: "audio".into()
        }));
        let inits: Vec<_> = events
            .into_iter()
            .filter_map(|e| match e {
                PlayerEvent::InitSegmentReceived { source_id } => Some(source_id),
                _ => None,
            })
            .collect();
        assert_eq!(inits, vec!["video".to_string(), "audio".to_string()]);
    }

    #[test]
    fn append_to_unknown_source_is_silent() {
        let mut h = Harness::new();
        h.load_paused("mediasourceblob:https://example.com/1234");
        let _ = h.events();
        h.player.handle_request(PlayerRequest::AppendData {
            source_id: "nope".into(),
            data: vec![1, 2, 3],
            times: AppendTimes::default(),
        });
        assert!(h.events().is_empty());
        assert!(!h.calls().iter().any(|c| matches!(c, Call::Push(..))));
    }

    #[test]
    fn append_reports_offset_and_closes_registration() {
        let mut h = Harness::new();
        h.load_paused("mediasourceblob:https://example.com/1234");
        h.player.handle_request(PlayerRequest::AddSourceId {
            source_id: "audio".into(),
            media_type: "audio/mp4".into(),
            codecs: vec!["mp4a.40.2".into()],
        });
        h.player.handle_request(PlayerRequest::SetSequenceMode {
            source_id: "audio".into(),
            sequence_mode: true,
        });
        h.player
            .handle_request(PlayerRequest::SetGroupStartTimestampIfInSequenceMode {
                source_id: "audio".into(),
                timestamp_offset_us: 5_000_000,
            });
        h.player.handle_request(PlayerRequest::AppendData {
            source_id: "audio".into(),
            data: vec![0; 16],
            times: AppendTimes::default(),
        });
        h.player.handle_request(PlayerRequest::AddSourceId {
            source_id: "late".into(),
            media_type: "video/mp4".into(),
            codecs: vec!["avc1".into()],
        });

        let events = h.events();
        assert!(events.contains(&PlayerEvent::TimestampOffsetUpdate {
            source_id: "audio".into(),
            timestamp_offset_us: 5_000_000,
        }));
        assert_eq!(
            events.last(),
            Some(&PlayerEvent::DidAddSourceId {
                source_id: String::new()
            })
        );
        assert!(h.calls().contains(&Call::Push("audio".into(), 16)));
    }

    #[test]
    fn end_of_stream_reaches_every_source() {
        let mut h = Harness::new();
        h.load_paused("mediasourceblob:https://example.com/1234");
        for id in ["a", "v"] {
            h.player.handle_request(PlayerRequest::AddSourceId {
                source_id: id.into(),
                media_type: "audio/mp4".into(),
                codecs: vec!["mp4a".into()],
            });
        }
        h.player.handle_request(PlayerRequest::MarkEndOfStream);
        let eos: Vec<_> = h
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Eos(_)))
            .collect();
        assert_eq!(eos, vec![Call::Eos("a".into()), Call::Eos("v".into())]);
    }

    #[test]
    fn add_key_reaches_pipeline() {
        let mut h = Harness::new();
        h.player.handle_request(PlayerRequest::AddKey {
            session_id: "s".into(),
            key_id: vec![1; 16],
            key: vec![2; 16],
        });
        assert_eq!(h.calls(), vec![Call::Key(vec![2; 16])]);
    }

    #[test]
    fn zero_size_dimensions_are_not_reported() {
        let mut h = Harness::new();
        h.player
            .on_pipeline_event(PipelineEvent::VideoDimensionsChanged { width: 0, height: 480 });
        h.player
            .on_pipeline_event(PipelineEvent::VideoDimensionsChanged {
                width: 640,
                height: 480,
            });
        assert_eq!(
            h.events(),
            vec![PlayerEvent::MediaVideoSizeChanged {
                width: 640,
                height: 480
            }]
        );
    }

    #[test]
    fn drop_releases_bound_samples() {
        let h = Harness::new();
        let Harness { mut player, _gl, .. } = h;
        let sample = Sample::new(4, 8, 8);
        player.on_pipeline_event(PipelineEvent::FrameReady(sample.clone()));
        assert_eq!(sample.ref_count(), 2);
        drop(player);
        assert_eq!(sample.ref_count(), 1);
    }
}
