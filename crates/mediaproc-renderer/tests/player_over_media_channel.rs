use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use mediaproc_media::in_process_factory;
use mediaproc_renderer::{
    dispatch_event, run_event_loop, MediaPlayerChannelHost, MediaPlayerClient, MediaPlayerDispatcher,
    MediaSourceProxy,
};
use mediaproc_transport::channel::forward_to;
use mediaproc_transport::launch::{InProcessChild, InProcessChildParams};
use mediaproc_transport::{
    Channel, ChannelEvent, ChannelHandle, ControlMessage, Mailbox, Message, PlayerEvent, SyncPolicy,
    TextureId,
};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// Plays the browser's part: owns the media thread and hands out channels.
struct Browser {
    channel: Channel,
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
    _child: Box<dyn InProcessChild>,
    _dir: tempfile::TempDir,
}

impl Browser {
    fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let (host_end, child_end) = UnixStream::pair().unwrap();
        let child = in_process_factory()
            .start(InProcessChildParams {
                channel_name: "media.renderer-test".into(),
                stream: child_end,
                io: Handle::current(),
                runtime_dir: dir.path().to_path_buf(),
            })
            .unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Channel::from_stream(
            &Handle::current(),
            "media.renderer-test",
            host_end,
            forward_to(tx, |e| e),
            SyncPolicy::Allow,
        )
        .unwrap();
        Self {
            channel,
            rx,
            _child: child,
            _dir: dir,
        }
    }

    async fn establish(&mut self, client_id: i32) -> ChannelHandle {
        self.channel
            .send(Message::control(ControlMessage::EstablishChannel {
                request_id: 1,
                client_id,
            }))
            .unwrap();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
                .await
                .expect("timed out")
                .expect("media thread gone");
            if let ChannelEvent::Message(Message::Control {
                body: ControlMessage::ChannelEstablished { handle, .. },
            }) = event
            {
                return handle;
            }
        }
    }
}

#[derive(Default)]
struct Screen {
    size: Option<(u32, u32)>,
    frames: Vec<TextureId>,
    paused: bool,
    released: bool,
}

impl MediaPlayerClient for Screen {
    fn on_video_size_changed(&mut self, width: u32, height: u32) {
        self.size = Some((width, height));
    }
    fn on_current_frame(&mut self, _width: u32, _height: u32, texture_id: TextureId, _mailbox: Mailbox) {
        self.frames.push(texture_id);
    }
    fn on_paused(&mut self) {
        self.paused = true;
    }
    fn on_player_released(&mut self) {
        self.released = true;
    }
}

async fn next(events: &mut mpsc::UnboundedReceiver<PlayerEvent>) -> PlayerEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out")
        .expect("player queue closed")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn url_player_gets_preroll_then_releases_quietly() {
    let mut browser = Browser::start();
    let handle = browser.establish(10).await;
    let host = MediaPlayerChannelHost::connect(&Handle::current(), &handle).unwrap();
    let player_id = host.next_player_id();
    let (dispatcher, mut events) = MediaPlayerDispatcher::register(Arc::clone(&host), player_id).unwrap();

    assert!(dispatcher.send_create());
    assert!(dispatcher.send_load("https://example.com/clip.mp4", Duration::from_millis(250)));

    let mut screen = Screen::default();
    while !screen.paused {
        dispatch_event(&mut screen, next(&mut events).await);
    }
    assert_eq!(screen.size, Some((640, 360)));
    assert_eq!(screen.frames.len(), 1);

    dispatcher.send_release_texture(screen.frames[0]);
    assert!(dispatcher.send_release());
    assert!(!run_event_loop(&mut screen, events).await);
    assert!(!screen.released);
    assert!(!host.is_lost());
    assert_eq!(host.dispatcher_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn media_source_round_trip() {
    let mut browser = Browser::start();
    let handle = browser.establish(11).await;
    let host = MediaPlayerChannelHost::connect(&Handle::current(), &handle).unwrap();
    let (dispatcher, mut events) = MediaPlayerDispatcher::register(Arc::clone(&host), 1).unwrap();
    let dispatcher = Arc::new(dispatcher);
    let mut source = MediaSourceProxy::new(Arc::clone(&dispatcher));

    dispatcher.send_load("mediasourceblob:https://example.com/ms", Duration::from_millis(250));
    while next(&mut events).await != PlayerEvent::SourceSelected {}

    let id = source.add_source_buffer("video/webm", "vp9").unwrap();
    loop {
        let event = next(&mut events).await;
        let added = matches!(&event, PlayerEvent::DidAddSourceId { .. });
        source.on_event(&event).unwrap();
        if added {
            break;
        }
    }

    assert!(!source.append(&id, vec![0; 64]).unwrap());
    loop {
        let event = next(&mut events).await;
        let buffered = matches!(&event, PlayerEvent::BufferedRangeUpdate { .. });
        source.on_event(&event).unwrap();
        if buffered {
            break;
        }
    }
    // The init segment from the first append is reported on the next one.
    assert!(source.append(&id, vec![0; 64]).unwrap());
    assert!(!source.buffered(&id).unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn losing_the_media_thread_ends_player_queues() {
    let mut browser = Browser::start();
    let handle = browser.establish(12).await;
    let host = MediaPlayerChannelHost::connect(&Handle::current(), &handle).unwrap();
    let (_dispatcher, mut events) = MediaPlayerDispatcher::register(Arc::clone(&host), 1).unwrap();

    drop(browser);
    let end = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out");
    assert_eq!(end, None);
    assert!(host.is_lost());
}
