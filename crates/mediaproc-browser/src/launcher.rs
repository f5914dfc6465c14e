//! Locating and composing the command line of the media child process.

use std::path::{Path, PathBuf};

use mediaproc_transport::switches;
use tracing::{debug, warn};

use crate::command_line::CommandLine;
use crate::data_manager::MediaDataManager;
use crate::host::MediaProcessKind;

pub const MEDIA_BINARY_NAME: &str = "mediaproc-media";

/// Resolve the media binary. A configured path is used as is and never
/// second-guessed; otherwise the binary is expected next to the shell (as
/// cargo lays out a workspace's targets), then on `PATH`.
pub fn find_media_binary(configured: Option<&Path>) -> Option<PathBuf> {
    let shell = std::env::current_exe().ok();
    locate_media_binary(configured, shell.as_deref(), which::which(MEDIA_BINARY_NAME).ok())
}

fn locate_media_binary(configured: Option<&Path>, shell: Option<&Path>, on_path: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = configured {
        if path.is_file() {
            return Some(path.to_path_buf());
        }
        warn!(path = %path.display(), "launcher: configured media binary does not exist");
        return None;
    }
    let sibling = shell
        .and_then(Path::parent)
        .map(|dir| dir.join(MEDIA_BINARY_NAME))
        .filter(|candidate| candidate.is_file());
    let found = sibling.or(on_path);
    match &found {
        Some(path) => debug!(path = %path.display(), "launcher: media binary found"),
        None => warn!("launcher: {MEDIA_BINARY_NAME} is neither beside the shell nor on PATH"),
    }
    found
}

pub struct MediaLaunch<'a> {
    pub binary: &'a Path,
    pub kind: MediaProcessKind,
    pub channel_id: &'a str,
    pub runtime_dir: &'a Path,
    pub browser: &'a CommandLine,
    pub data_manager: &'a MediaDataManager,
}

/// Build the child's command line: process type and channel, sandbox kind,
/// switches propagated from the browser, embedder extras, then the optional
/// launcher wrapper.
pub fn media_command_line(launch: &MediaLaunch<'_>) -> CommandLine {
    let mut cmd = CommandLine::new(launch.binary);
    cmd.append_switch_value(switches::PROCESS_TYPE, switches::MEDIA_PROCESS);
    cmd.append_switch_value(switches::PROCESS_CHANNEL_ID, launch.channel_id);
    cmd.append_switch_value(
        switches::MEDIA_RUNTIME_DIR,
        launch.runtime_dir.to_string_lossy().into_owned(),
    );
    if launch.kind == MediaProcessKind::Unsandboxed {
        cmd.append_switch(switches::DISABLE_MEDIA_SANDBOX);
    }
    cmd.copy_switches_from(launch.browser, switches::PROPAGATED_TO_MEDIA);
    launch.data_manager.append_media_command_line(&mut cmd);
    if let Some(launcher) = launch
        .browser
        .switch_value(switches::MEDIA_LAUNCHER)
        .filter(|l| !l.is_empty())
    {
        cmd.prepend_wrapper(launcher);
    }
    cmd
}
