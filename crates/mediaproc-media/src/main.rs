use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use mediaproc_media::child_thread::{ChildParams, MediaChildThread};
use mediaproc_media::gl::OffscreenContextProvider;
use mediaproc_media::headless::HeadlessPipelineFactory;
use mediaproc_media::log_forward::{LogForwardLayer, LogSlot};
use mediaproc_media::sandbox::BrokerPolicy;
use mediaproc_transport::switches;

mod cli;

fn main() -> Result<()> {
    let args = cli::Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_directive()));
    let log_slot = LogSlot::new();
    let forward = (!args.disable_logging).then(|| LogForwardLayer::new(log_slot.clone()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(forward)
        .init();

    if args.process_type.as_deref() != Some(switches::MEDIA_PROCESS) {
        bail!(
            "refusing to run without --{}={}",
            switches::PROCESS_TYPE,
            switches::MEDIA_PROCESS
        );
    }
    if args.media_startup_dialog {
        warn!(pid = std::process::id(), "media: startup dialog requested, attach a debugger now");
    }

    let channel_name = args
        .process_channel_id
        .clone()
        .unwrap_or_else(|| "media".to_string());
    let runtime_dir = args
        .media_runtime_dir
        .clone()
        .unwrap_or_else(std::env::temp_dir);

    let io = tokio::runtime::Builder::new_multi_thread()
        .thread_name("media-io")
        .enable_all()
        .build()?;

    // The browser hands us our end of the host channel as stdin.
    let stream = UnixStream::from(std::io::stdin().as_fd().try_clone_to_owned()?);

    if args.sandbox_enabled() {
        let home = std::env::var("HOME").unwrap_or_default();
        let xdg = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();
        let policy =
            BrokerPolicy::media_default(&home, &xdg).with_env_paths(|var| std::env::var(var).ok());
        info!(
            entries = policy.permissions().len(),
            seccomp = !args.disable_seccomp_filter_sandbox,
            debugging = args.allow_sandbox_debugging,
            "media: broker policy ready"
        );
    } else {
        info!("media: sandbox disabled");
    }

    let child = MediaChildThread::new(ChildParams {
        channel_name,
        stream,
        io: io.handle().clone(),
        runtime_dir,
        factory: Arc::new(HeadlessPipelineFactory),
        gl_provider: Box::new(OffscreenContextProvider),
        in_process: false,
    })?;
    log_slot.attach(child.browser_channel().clone());

    info!(pid = std::process::id(), "mediaproc-media started");
    child.run();
    log_slot.detach();
    Ok(())
}
