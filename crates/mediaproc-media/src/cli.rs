use std::path::PathBuf;

use clap::Parser;

/// Switches the browser passes when it launches the media process.
#[derive(Parser, Debug)]
#[command(name = "mediaproc-media", about = "Out-of-process media player host")]
pub struct Args {
    /// Must be `media`.
    #[arg(long)]
    pub process_type: Option<String>,

    /// Name of the channel to the browser, carried on stdin.
    #[arg(long)]
    pub process_channel_id: Option<String>,

    /// Directory for per-renderer rendezvous sockets.
    #[arg(long)]
    pub media_runtime_dir: Option<PathBuf>,

    #[arg(long)]
    pub disable_media_sandbox: bool,

    #[arg(long)]
    pub no_sandbox: bool,

    #[arg(long)]
    pub disable_seccomp_filter_sandbox: bool,

    #[arg(long)]
    pub allow_sandbox_debugging: bool,

    #[arg(long)]
    pub enable_logging: bool,

    #[arg(long)]
    pub disable_logging: bool,

    /// Log the pid early so a debugger can be attached.
    #[arg(long)]
    pub media_startup_dialog: bool,

    /// Verbosity; anything above zero turns on debug output.
    #[arg(long)]
    pub v: Option<i32>,

    /// Per-module verbosity, as `module=level` pairs.
    #[arg(long)]
    pub vmodule: Option<String>,
}

impl Args {
    pub fn sandbox_enabled(&self) -> bool {
        !(self.no_sandbox || self.disable_media_sandbox)
    }

    /// Default tracing directive derived from `--v` and `--vmodule`.
    pub fn log_directive(&self) -> String {
        let base = match self.v {
            Some(v) if v >= 2 => "mediaproc=trace",
            Some(v) if v >= 1 => "mediaproc=debug",
            _ => "mediaproc=info",
        };
        let mut directive = base.to_string();
        if let Some(vmodule) = &self.vmodule {
            for pair in vmodule.split(',') {
                let Some((module, level)) = pair.split_once('=') else { continue };
                let level = match level.trim().parse::<i32>() {
                    Ok(l) if l >= 2 => "trace",
                    Ok(l) if l >= 1 => "debug",
                    _ => "info",
                };
                directive.push_str(&format!(",{}={level}", module.trim()));
            }
        }
        directive
    }
}
