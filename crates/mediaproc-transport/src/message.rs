//! Messages exchanged between the browser, the media process and renderers.
//!
//! Wire format: 4-byte big-endian length prefix + JSON payload. Binary
//! payloads (append data, keys, init data) travel base64-encoded.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::channel::ChannelHandle;
use crate::ids::{ClientId, Mailbox, PlayerId, RequestId, TextureId};

/// Maximum frame payload size (64 MiB). Sized for MSE appends.
pub const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

/// Why a media process host is being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CauseForMediaLaunch {
    /// Look up an existing host only; never launch.
    NoLaunch,
    BrowserStartup,
    Renderer,
}

/// Severity of a log line forwarded from the media process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

/// Error codes carried by [`PlayerEvent::MediaError`].
pub mod media_error {
    pub const FORMAT: i32 = 0;
    pub const DECODE: i32 = 1;
    pub const NOT_VALID_FOR_PROGRESSIVE_PLAYBACK: i32 = 2;
    pub const INVALID_CODE: i32 = 3;
}

/// A buffered time range of a source buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedRange {
    pub start: Duration,
    pub end: Duration,
}

/// Append window and offset accompanying an MSE append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AppendTimes {
    pub append_window_start: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub append_window_end: Option<Duration>,
    /// Signed offset applied to appended media, in microseconds.
    #[serde(default)]
    pub timestamp_offset_us: i64,
}

/// Messages without a routing target: process lifecycle and channel setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Browser asks a freshly connected media process to initialize.
    Initialize,
    /// Media process reports the outcome of `Initialize`.
    Initialized { result: bool },

    /// Debug hooks driven from the browser UI.
    Clean,
    Crash,
    Hang,

    /// Browser asks the media process for a dedicated renderer channel.
    EstablishChannel {
        request_id: RequestId,
        client_id: ClientId,
    },
    /// Reply to `EstablishChannel`. An empty handle means failure.
    ChannelEstablished {
        request_id: RequestId,
        handle: ChannelHandle,
    },
    /// Browser tells the media process to drop a renderer channel.
    CloseChannel { handle: ChannelHandle },

    /// Log line forwarded from the media process to the browser.
    LogMessage {
        level: LogLevel,
        header: String,
        message: String,
    },

    /// Renderer asks the browser for a media channel. Reply-waiting.
    EstablishMediaChannel { cause: CauseForMediaLaunch },
    /// Browser reply to `EstablishMediaChannel`.
    MediaChannelEstablished {
        renderer_id: ClientId,
        handle: ChannelHandle,
    },
}

/// Per-player requests sent by a renderer to the media process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlayerRequest {
    Create,
    Load {
        url: String,
        position_update_interval_ms: u64,
    },
    Start,
    Pause,
    Seek { time: Duration },
    Release,
    ReleaseTexture { texture_id: TextureId },

    AddSourceId {
        source_id: String,
        media_type: String,
        codecs: Vec<String>,
    },
    RemoveSourceId { source_id: String },
    SetDuration { duration: Duration },
    MarkEndOfStream,
    UnmarkEndOfStream,
    SetSequenceMode {
        source_id: String,
        sequence_mode: bool,
    },
    AppendData {
        source_id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        times: AppendTimes,
    },
    Abort { source_id: String },
    SetGroupStartTimestampIfInSequenceMode {
        source_id: String,
        timestamp_offset_us: i64,
    },
    RemoveSegment {
        source_id: String,
        start: Duration,
        end: Duration,
    },

    AddKey {
        session_id: String,
        #[serde(with = "base64_bytes")]
        key_id: Vec<u8>,
        #[serde(with = "base64_bytes")]
        key: Vec<u8>,
    },
}

/// Per-player notifications sent by the media process to a renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlayerEvent {
    MediaError { code: i32 },
    MediaPlaybackCompleted,
    MediaDurationChanged { duration: Duration },
    SeekCompleted { time: Duration },
    MediaVideoSizeChanged { width: u32, height: u32 },
    MediaTimeUpdate { timestamp: Duration, ticks_us: u64 },
    MediaBufferingUpdate { percent: i32 },
    MediaPlayerReleased,
    DidMediaPlayerPlay,
    DidMediaPlayerPause,
    SetCurrentFrame {
        width: u32,
        height: u32,
        texture_id: TextureId,
        mailbox: Mailbox,
    },

    SourceSelected,
    DidAddSourceId { source_id: String },
    DidRemoveSourceId { source_id: String },
    InitSegmentReceived { source_id: String },
    BufferedRangeUpdate {
        source_id: String,
        ranges: Vec<BufferedRange>,
    },
    TimestampOffsetUpdate {
        source_id: String,
        timestamp_offset_us: i64,
    },

    NeedKey {
        system_id: String,
        #[serde(with = "base64_bytes")]
        init_data: Vec<u8>,
    },
}

/// Envelope for everything carried by a [`Channel`](crate::Channel).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    /// First frame written by each end; consumed by the channel itself.
    Hello { pid: u32 },
    Control { body: ControlMessage },
    PlayerRequest {
        player_id: PlayerId,
        request: PlayerRequest,
    },
    PlayerEvent {
        player_id: PlayerId,
        event: PlayerEvent,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("message too large: {size} bytes (max {MAX_MESSAGE_SIZE})")]
    MessageTooLarge { size: u32 },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Message {
    pub fn control(body: ControlMessage) -> Self {
        Self::Control { body }
    }

    pub fn request(player_id: PlayerId, request: PlayerRequest) -> Self {
        Self::PlayerRequest { player_id, request }
    }

    pub fn event(player_id: PlayerId, event: PlayerEvent) -> Self {
        Self::PlayerEvent { player_id, event }
    }

    /// The player this message is routed to, if any.
    pub fn routing_id(&self) -> Option<PlayerId> {
        match self {
            Self::PlayerRequest { player_id, .. } | Self::PlayerEvent { player_id, .. } => {
                Some(*player_id)
            }
            Self::Hello { .. } | Self::Control { .. } => None,
        }
    }

    /// Whether the sender blocks for a reply. Forbidden from the media process.
    pub fn is_sync(&self) -> bool {
        matches!(
            self,
            Self::Control {
                body: ControlMessage::EstablishMediaChannel { .. }
            }
        )
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Control { .. } => "control",
            Self::PlayerRequest { .. } => "player_request",
            Self::PlayerEvent { .. } => "player_event",
        }
    }

    /// Encode a message into a length-prefixed frame.
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        if json.len() > MAX_MESSAGE_SIZE as usize {
            return Err(FrameError::MessageTooLarge { size: len });
        }
        let mut buf = BytesMut::with_capacity(4 + json.len());
        buf.put_u32(len);
        buf.put_slice(&json);
        Ok(buf.freeze())
    }

    /// Try to decode a message from a buffer.
    ///
    /// Returns `Ok(Some((message, consumed)))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on protocol/parse errors.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, FrameError> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if len > MAX_MESSAGE_SIZE {
            return Err(FrameError::MessageTooLarge { size: len });
        }
        let total = 4 + len as usize;
        if buf.len() < total {
            return Ok(None);
        }
        let msg: Message = serde_json::from_slice(&buf[4..total])?;
        Ok(Some((msg, total)))
    }
}

/// Incremental decoder for a byte stream of frames.
pub struct MessageCodec {
    read_buf: BytesMut,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            read_buf: BytesMut::with_capacity(8192),
        }
    }

    /// Feed incoming bytes into the codec buffer.
    pub fn feed(&mut self, data: &[u8]) {
        self.read_buf.extend_from_slice(data);
    }

    /// Try to decode the next message from the buffer.
    pub fn decode_next(&mut self) -> Result<Option<Message>, FrameError> {
        match Message::decode(&self.read_buf)? {
            Some((msg, consumed)) => {
                self.read_buf.advance(consumed);
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
