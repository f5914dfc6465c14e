//! The renderer's control channel to the browser.

use std::os::unix::net::UnixStream;

use mediaproc_transport::channel::forward_to;
use mediaproc_transport::{
    CauseForMediaLaunch, Channel, ChannelError, ChannelEvent, ChannelHandle, ControlMessage,
    Message, SyncPolicy,
};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::error::RendererError;

pub struct BrowserChannel {
    channel: Channel,
    /// Held across a request so replies pair with the request that asked.
    events: Mutex<mpsc::UnboundedReceiver<ChannelEvent>>,
}

impl BrowserChannel {
    pub fn from_stream(io: &Handle, name: impl Into<String>, stream: UnixStream) -> Result<Self, ChannelError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Channel::from_stream(io, name, stream, forward_to(tx, |e| e), SyncPolicy::Allow)?;
        Ok(Self {
            channel,
            events: Mutex::new(rx),
        })
    }

    /// Ask the browser for a channel to the media process and wait for the
    /// reply.
    pub async fn establish_media_channel(&self, cause: CauseForMediaLaunch) -> Result<ChannelHandle, RendererError> {
        let mut events = self.events.lock().await;
        self.channel
            .send(Message::control(ControlMessage::EstablishMediaChannel { cause }))?;
        loop {
            match events.recv().await {
                Some(ChannelEvent::Message(Message::Control {
                    body: ControlMessage::MediaChannelEstablished { renderer_id, handle },
                })) => {
                    if handle.is_empty() {
                        return Err(RendererError::NoMediaChannel);
                    }
                    info!(renderer_id, channel = %handle.name, "renderer: media channel granted");
                    return Ok(handle);
                }
                Some(ChannelEvent::Connected { peer_pid }) => {
                    debug!(peer_pid, "renderer: browser connected");
                }
                Some(ChannelEvent::Message(other)) => {
                    debug!(kind = other.name(), "renderer: ignoring browser message");
                }
                Some(ChannelEvent::Error) | None => return Err(RendererError::BrowserGone),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_handle_is_refused() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let browser = BrowserChannel::from_stream(&Handle::current(), "renderer.test", ours).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let peer = Channel::from_stream(&Handle::current(), "browser.peer", theirs, forward_to(tx, |e| e), SyncPolicy::Allow)
            .unwrap();

        let reply = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Some(ChannelEvent::Message(Message::Control {
                        body: ControlMessage::EstablishMediaChannel { cause },
                    })) => {
                        assert_eq!(cause, CauseForMediaLaunch::Renderer);
                        peer.send(Message::control(ControlMessage::MediaChannelEstablished {
                            renderer_id: 3,
                            handle: ChannelHandle::empty(),
                        }))
                        .unwrap();
                        return peer;
                    }
                    Some(_) => {}
                    None => panic!("renderer went away"),
                }
            }
        });

        let result = browser.establish_media_channel(CauseForMediaLaunch::Renderer).await;
        assert!(matches!(result, Err(RendererError::NoMediaChannel)));
        let _peer = reply.await.unwrap();
    }

    #[tokio::test]
    async fn browser_loss_fails_the_request() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let browser = BrowserChannel::from_stream(&Handle::current(), "renderer.test", ours).unwrap();
        drop(theirs);
        let result = browser.establish_media_channel(CauseForMediaLaunch::Renderer).await;
        assert!(matches!(
            result,
            Err(RendererError::BrowserGone) | Err(RendererError::Channel(_))
        ));
    }
}
