//! The media main thread: control handling and event pumping.
//!
//! Every channel listener and pipeline callback posts a [`MainEvent`]; this
//! thread owns the channel filter and handles them one at a time.

use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use mediaproc_transport::channel::forward_to;
use mediaproc_transport::launch::{InProcessChild, InProcessChildFactory, InProcessChildParams};
use mediaproc_transport::{
    Channel, ChannelError, ChannelEvent, ClientId, ControlMessage, Message, PlayerId, SyncPolicy,
};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::channel_filter::{ChannelContext, MediaChannelFilter};
use crate::gl::{GlContextProvider, GlError, GlThread, OffscreenContextProvider};
use crate::headless::HeadlessPipelineFactory;
use crate::pipeline::{PipelineEvent, PipelineFactory};

/// Work for the media main thread.
#[derive(Debug)]
pub enum MainEvent {
    /// Traffic on the channel to the browser.
    Browser(ChannelEvent),
    /// Traffic on a renderer's player channel.
    Renderer {
        client_id: ClientId,
        event: ChannelEvent,
    },
    Pipeline {
        client_id: ClientId,
        player_id: PlayerId,
        event: PipelineEvent,
    },
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum ChildError {
    #[error("host channel: {0}")]
    Channel(#[from] ChannelError),
    #[error("gl: {0}")]
    Gl(#[from] GlError),
    #[error("failed to spawn media thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// What the main loop should do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Inputs for [`MediaChildThread::new`].
pub struct ChildParams {
    pub channel_name: String,
    pub stream: UnixStream,
    pub io: Handle,
    pub runtime_dir: PathBuf,
    pub factory: Arc<dyn PipelineFactory>,
    pub gl_provider: Box<dyn GlContextProvider>,
    /// Running on a thread of the browser process.
    pub in_process: bool,
}

pub struct MediaChildThread {
    // Field order matters: the filter holds GL handles and must drop first.
    filter: MediaChannelFilter,
    browser: Channel,
    main_tx: mpsc::UnboundedSender<MainEvent>,
    main_rx: mpsc::UnboundedReceiver<MainEvent>,
    in_process: bool,
    gl: GlThread,
}

impl MediaChildThread {
    pub fn new(params: ChildParams) -> Result<Self, ChildError> {
        let (main_tx, main_rx) = mpsc::unbounded_channel();
        let browser = Channel::from_stream(
            &params.io,
            params.channel_name,
            params.stream,
            forward_to(main_tx.clone(), MainEvent::Browser),
            SyncPolicy::Forbid,
        )?;
        let gl = GlThread::spawn(params.gl_provider)?;
        let ctx = ChannelContext {
            io: params.io,
            runtime_dir: params.runtime_dir,
            main_tx: main_tx.clone(),
            factory: params.factory,
            gl: gl.handle(),
        };
        Ok(Self {
            filter: MediaChannelFilter::new(browser.clone(), ctx),
            browser,
            main_tx,
            main_rx,
            in_process: params.in_process,
            gl,
        })
    }

    /// Sender for posting onto this thread's queue.
    pub fn sender(&self) -> mpsc::UnboundedSender<MainEvent> {
        self.main_tx.clone()
    }

    pub fn browser_channel(&self) -> &Channel {
        &self.browser
    }

    pub fn filter(&self) -> &MediaChannelFilter {
        &self.filter
    }

    /// Pump events until the browser goes away or shutdown is requested.
    pub fn run(mut self) {
        info!(channel = %self.browser.name(), in_process = self.in_process, "media: main loop started");
        while let Some(event) = self.main_rx.blocking_recv() {
            if self.dispatch(event) == Flow::Exit {
                break;
            }
        }
        info!("media: main loop finished");
    }

    pub fn dispatch(&mut self, event: MainEvent) -> Flow {
        match event {
            MainEvent::Browser(ChannelEvent::Connected { peer_pid }) => {
                debug!(peer_pid, "media: browser connected");
            }
            MainEvent::Browser(ChannelEvent::Message(Message::Control { body })) => {
                self.on_control(body);
            }
            MainEvent::Browser(ChannelEvent::Message(other)) => {
                warn!(kind = other.name(), "media: unexpected message from browser");
            }
            MainEvent::Browser(ChannelEvent::Error) => {
                info!("media: browser channel closed");
                return Flow::Exit;
            }
            MainEvent::Renderer { client_id, event } => {
                self.filter.on_renderer_event(client_id, event);
            }
            MainEvent::Pipeline {
                client_id,
                player_id,
                event,
            } => self.filter.on_pipeline_event(client_id, player_id, event),
            MainEvent::Shutdown => return Flow::Exit,
        }
        Flow::Continue
    }

    fn on_control(&mut self, body: ControlMessage) {
        match body {
            ControlMessage::Initialize => {
                info!("media: initialize");
                self.reply(ControlMessage::Initialized { result: true });
            }
            ControlMessage::Clean => self.filter.clear(),
            ControlMessage::Crash => {
                if self.in_process {
                    warn!("media: ignoring crash request while in process");
                } else {
                    error!("media: crashing on request");
                    std::process::abort();
                }
            }
            ControlMessage::Hang => {
                if self.in_process {
                    warn!("media: ignoring hang request while in process");
                } else {
                    error!("media: hanging on request");
                    loop {
                        thread::park();
                    }
                }
            }
            ControlMessage::EstablishChannel {
                request_id,
                client_id,
            } => {
                self.filter.on_establish_channel(request_id, client_id);
            }
            ControlMessage::CloseChannel { handle } => {
                self.filter.on_close_channel(&handle);
            }
            other => warn!(?other, "media: unhandled control message"),
        }
    }

    fn reply(&self, body: ControlMessage) {
        if let Err(e) = self.browser.send(Message::control(body)) {
            warn!(error = %e, "media: reply to browser lost");
        }
    }
}

/// Runs the media main loop on a thread of the browser process.
pub struct InProcessMediaFactory {
    factory: Arc<dyn PipelineFactory>,
}

impl InProcessMediaFactory {
    pub fn new(factory: Arc<dyn PipelineFactory>) -> Self {
        Self { factory }
    }
}

impl Default for InProcessMediaFactory {
    fn default() -> Self {
        Self::new(Arc::new(HeadlessPipelineFactory))
    }
}

struct InProcessMedia {
    tx: mpsc::UnboundedSender<MainEvent>,
    _thread: JoinHandle<()>,
}

impl InProcessChild for InProcessMedia {
    fn stop(&mut self) {
        let _ = self.tx.send(MainEvent::Shutdown);
    }
}

impl InProcessChildFactory for InProcessMediaFactory {
    fn start(&self, params: InProcessChildParams) -> anyhow::Result<Box<dyn InProcessChild>> {
        let child = MediaChildThread::new(ChildParams {
            channel_name: params.channel_name,
            stream: params.stream,
            io: params.io,
            runtime_dir: params.runtime_dir,
            factory: Arc::clone(&self.factory),
            gl_provider: Box::new(OffscreenContextProvider),
            in_process: true,
        })?;
        let tx = child.sender();
        let thread = thread::Builder::new()
            .name("media-main".into())
            .spawn(move || child.run())?;
        Ok(Box::new(InProcessMedia {
            tx,
            _thread: thread,
        }))
    }
}

/// The factory a browser registers to run media in process.
pub fn in_process_factory() -> Arc<dyn InProcessChildFactory> {
    Arc::new(InProcessMediaFactory::default())
}
