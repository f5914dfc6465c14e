use mediaproc_transport::{ChannelError, PlayerId};

#[derive(Debug, thiserror::Error)]
pub enum RendererError {
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("the browser refused to hand out a media channel")]
    NoMediaChannel,
    #[error("the browser channel closed")]
    BrowserGone,
    #[error("the media channel was lost")]
    Lost,
    #[error("player {0} already has a dispatcher")]
    DuplicatePlayer(PlayerId),
    #[error("media type not supported: {0}")]
    NotSupported(String),
    #[error("unknown source buffer '{0}'")]
    UnknownSource(String),
}
