use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use mediaproc_browser::{
    MediaDataManager, MediaDataManagerObserver, MediaHostConfig, MediaHostService, MediaProcessKind,
    TerminationStatus,
};
use mediaproc_renderer::{
    run_event_loop, BrowserChannel, MediaPlayerChannelHost, MediaPlayerClient, MediaPlayerDispatcher,
};
use mediaproc_transport::{CauseForMediaLaunch, Mailbox, TextureId};
use tokio::runtime::Handle;
use tracing_subscriber::EnvFilter;

mod cli;

/// Renderer id used by the `play` command's in-process renderer.
const SHELL_RENDERER_ID: i32 = 1;
const POSITION_UPDATE_INTERVAL: Duration = Duration::from_millis(250);

struct CrashReporter;

impl MediaDataManagerObserver for CrashReporter {
    fn on_media_process_crashed(&self, status: TerminationStatus) {
        tracing::error!(?status, "{}", status.reason());
    }

    fn on_media_process_init_failure(&self) {
        tracing::error!("Media process failed to initialize");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    let mut config = MediaHostConfig::load(&args.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.filter)),
        )
        .init();

    if args.in_process {
        config.process.in_process = true;
    }

    let data_manager = MediaDataManager::get_instance();
    data_manager.add_observer(Arc::new(CrashReporter));
    let factory = config
        .media_in_process()
        .then(mediaproc_media::in_process_factory);
    let service = MediaHostService::start(&Handle::current(), &config, Arc::clone(&data_manager), factory)?;

    let outcome = match args.command {
        None => run_until_ctrl_c(&service).await,
        Some(cli::Command::Play { url, seconds }) => play(&service, &url, Duration::from_secs(seconds)).await,
    };

    service.shutdown().await;
    if args.dump_log {
        println!("{}", serde_json::to_string_pretty(&data_manager.log_messages_json())?);
    }
    outcome
}

async fn run_until_ctrl_c(service: &MediaHostService) -> Result<()> {
    let io = service.io();
    match io
        .get(MediaProcessKind::Sandboxed, CauseForMediaLaunch::BrowserStartup)
        .await
    {
        Some(host_id) => tracing::info!(host_id, "Media process host started"),
        None => tracing::warn!("Media process could not be started"),
    }
    tracing::info!(pids = ?io.process_ids().await, "Media processes running");

    tokio::signal::ctrl_c().await?;
    println!();
    tracing::info!("Shutting down (ctrl-c)...");
    Ok(())
}

/// Logs what the player reports and hands frames straight back.
struct PlaybackLog<'a> {
    dispatcher: &'a MediaPlayerDispatcher,
    frames: u64,
}

impl MediaPlayerClient for PlaybackLog<'_> {
    fn on_media_error(&mut self, code: i32) {
        tracing::warn!(code, "Media error");
    }
    fn on_playback_completed(&mut self) {
        tracing::info!("Playback completed");
    }
    fn on_duration_changed(&mut self, duration: Duration) {
        tracing::info!(?duration, "Duration changed");
    }
    fn on_seek_completed(&mut self, time: Duration) {
        tracing::info!(?time, "Seek completed");
    }
    fn on_video_size_changed(&mut self, width: u32, height: u32) {
        tracing::info!(width, height, "Video size changed");
    }
    fn on_time_update(&mut self, timestamp: Duration, _ticks_us: u64) {
        tracing::debug!(?timestamp, "Time update");
    }
    fn on_played(&mut self) {
        tracing::info!("Playing");
    }
    fn on_paused(&mut self) {
        tracing::info!("Paused");
    }
    fn on_current_frame(&mut self, width: u32, height: u32, texture_id: TextureId, _mailbox: Mailbox) {
        self.frames += 1;
        tracing::debug!(width, height, texture_id, frames = self.frames, "Frame");
        self.dispatcher.send_release_texture(texture_id);
    }
    fn on_player_released(&mut self) {
        tracing::info!(frames = self.frames, "Player released");
    }
}

async fn play(service: &MediaHostService, url: &str, duration: Duration) -> Result<()> {
    let io = Handle::current();
    let (browser_end, renderer_end) = UnixStream::pair()?;
    let _filter = service.attach_renderer(SHELL_RENDERER_ID, browser_end)?;
    let browser = BrowserChannel::from_stream(&io, format!("renderer.{SHELL_RENDERER_ID}"), renderer_end)?;

    let handle = browser
        .establish_media_channel(CauseForMediaLaunch::Renderer)
        .await?;
    let host = MediaPlayerChannelHost::connect(&io, &handle)?;
    let player_id = host.next_player_id();
    let (dispatcher, events) = MediaPlayerDispatcher::register(Arc::clone(&host), player_id)?;

    dispatcher.send_create();
    dispatcher.send_load(url, POSITION_UPDATE_INTERVAL);
    dispatcher.send_start();
    tracing::info!(player_id, url, ?duration, "Playing");

    let mut client = PlaybackLog {
        dispatcher: &dispatcher,
        frames: 0,
    };
    match tokio::time::timeout(duration, run_event_loop(&mut client, events)).await {
        Ok(_) if host.is_lost() => anyhow::bail!("media channel lost during playback"),
        Ok(_) => {}
        Err(_) => {
            dispatcher.send_release();
        }
    }
    Ok(())
}
