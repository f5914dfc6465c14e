//! Wire contracts and the framed socket channel shared by the browser,
//! media and renderer sides of the out-of-process media stack.

pub mod channel;
pub mod ids;
pub mod launch;
pub mod message;
pub mod switches;

pub use channel::{
    generate_channel_id, Channel, ChannelError, ChannelEvent, ChannelHandle, ChannelListener,
    SyncPolicy,
};
pub use ids::{ClientId, HostId, Mailbox, PlayerId, RequestId, TextureId};
pub use message::{
    CauseForMediaLaunch, ControlMessage, LogLevel, Message, PlayerEvent, PlayerRequest,
};
