//! Command-line switches understood by the media process.

pub const PROCESS_TYPE: &str = "process-type";
pub const MEDIA_PROCESS: &str = "media";
pub const PROCESS_CHANNEL_ID: &str = "process-channel-id";

pub const ALLOW_SANDBOX_DEBUGGING: &str = "allow-sandbox-debugging";
pub const DISABLE_MEDIA_SANDBOX: &str = "disable-media-sandbox";
pub const DISABLE_LOGGING: &str = "disable-logging";
pub const DISABLE_SECCOMP_FILTER_SANDBOX: &str = "disable-seccomp-filter-sandbox";
pub const ENABLE_LOGGING: &str = "enable-logging";
pub const MEDIA_STARTUP_DIALOG: &str = "media-startup-dialog";
pub const NO_SANDBOX: &str = "no-sandbox";
pub const V: &str = "v";
pub const VMODULE: &str = "vmodule";

/// Browser-only switches.
pub const IN_PROCESS_MEDIA: &str = "in-process-media";
pub const SINGLE_PROCESS: &str = "single-process";
pub const MEDIA_LAUNCHER: &str = "media-launcher";

/// Directory for per-renderer rendezvous sockets.
pub const MEDIA_RUNTIME_DIR: &str = "media-runtime-dir";

/// Switches copied from the browser's command line to the media process.
pub const PROPAGATED_TO_MEDIA: &[&str] = &[
    ALLOW_SANDBOX_DEBUGGING,
    DISABLE_MEDIA_SANDBOX,
    DISABLE_LOGGING,
    DISABLE_SECCOMP_FILTER_SANDBOX,
    ENABLE_LOGGING,
    MEDIA_STARTUP_DIALOG,
    NO_SANDBOX,
    V,
    VMODULE,
];
