use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use mediaproc_transport::switches;
use serde::{Deserialize, Serialize};

use crate::command_line::CommandLine;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct MediaHostConfig {
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ProcessConfig {
    /// Run the media main loop on a thread of the browser process.
    #[serde(default = "default_false")]
    pub in_process: bool,
    /// Everything in one process; implies `in_process`.
    #[serde(default = "default_false")]
    pub single_process: bool,
    /// Wrapper the media process is started under, e.g. `"gdb --args"`.
    pub launcher: Option<String>,
    /// Explicit path to the `mediaproc-media` binary. Searched for when unset.
    pub media_binary: Option<String>,
    /// Directory for per-renderer rendezvous sockets.
    pub runtime_dir: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SandboxConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub seccomp: bool,
    #[serde(default = "default_false")]
    pub allow_debugging: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            seccomp: true,
            allow_debugging: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default = "default_false")]
    pub enable_logging: bool,
    pub verbosity: Option<i32>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            enable_logging: false,
            verbosity: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

fn default_log_filter() -> String {
    "mediaproc=info".into()
}

fn generate_config_template(config: &MediaHostConfig) -> String {
    format!(
        r#"# mediaproc media host configuration
# Generated automatically on first run. Edit as needed.

[process]
# Run media on a browser thread instead of a child process.
in_process = {in_process}
single_process = {single_process}
# Wrapper for the media process, e.g. "xterm -e gdb --args".
# launcher = ""
# Path to mediaproc-media. Looked up next to this binary and on PATH when unset.
# media_binary = "/usr/local/bin/mediaproc-media"
# runtime_dir = "/run/user/1000/mediaproc"

[sandbox]
enabled = {sandbox_enabled}
seccomp = {seccomp}
allow_debugging = {allow_debugging}

[logging]
filter = "{filter}"
enable_logging = {enable_logging}
# verbosity = 1
"#,
        in_process = config.process.in_process,
        single_process = config.process.single_process,
        sandbox_enabled = config.sandbox.enabled,
        seccomp = config.sandbox.seccomp,
        allow_debugging = config.sandbox.allow_debugging,
        filter = config.logging.filter,
        enable_logging = config.logging.enable_logging,
    )
}

fn env_bool(name: &str, target: &mut bool) {
    if let Ok(value) = std::env::var(name) {
        match value.parse::<bool>() {
            Ok(parsed) => *target = parsed,
            Err(_) => tracing::warn!(
                "Ignoring invalid {} value '{}'; expected true or false",
                name,
                value
            ),
        }
    }
}

impl MediaHostConfig {
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            tracing::info!(
                "Config file not found at '{}', generating defaults...",
                path
            );
            let config = MediaHostConfig::default();
            if let Some(parent) = Path::new(path).parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, generate_config_template(&config))?;
            tracing::info!("Generated default config at '{}'", path);
            config
        };

        // Environment variable overrides
        env_bool("MEDIAPROC_IN_PROCESS", &mut config.process.in_process);
        env_bool("MEDIAPROC_SINGLE_PROCESS", &mut config.process.single_process);
        if let Ok(value) = std::env::var("MEDIAPROC_LAUNCHER") {
            config.process.launcher = Some(value);
        }
        if let Ok(value) = std::env::var("MEDIAPROC_MEDIA_BINARY") {
            config.process.media_binary = Some(value);
        }
        if let Ok(value) = std::env::var("MEDIAPROC_RUNTIME_DIR") {
            config.process.runtime_dir = Some(value);
        }
        env_bool("MEDIAPROC_SANDBOX", &mut config.sandbox.enabled);
        env_bool("MEDIAPROC_SECCOMP", &mut config.sandbox.seccomp);
        env_bool(
            "MEDIAPROC_ALLOW_SANDBOX_DEBUGGING",
            &mut config.sandbox.allow_debugging,
        );
        if let Ok(value) = std::env::var("MEDIAPROC_LOG") {
            config.logging.filter = value;
        }
        env_bool("MEDIAPROC_ENABLE_LOGGING", &mut config.logging.enable_logging);
        if let Ok(value) = std::env::var("MEDIAPROC_VERBOSITY") {
            if let Ok(parsed) = value.parse::<i32>() {
                config.logging.verbosity = Some(parsed);
            }
        }

        Ok(config)
    }

    pub fn media_in_process(&self) -> bool {
        self.process.in_process || self.process.single_process
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.process
            .runtime_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("mediaproc"))
    }

    /// The browser switches this configuration stands for. The media launch
    /// copies the propagated subset of these onto the child's command line.
    pub fn browser_command_line(&self, program: impl Into<PathBuf>) -> CommandLine {
        let mut line = CommandLine::new(program);
        if self.process.single_process {
            line.append_switch(switches::SINGLE_PROCESS);
        }
        if self.process.in_process {
            line.append_switch(switches::IN_PROCESS_MEDIA);
        }
        if let Some(launcher) = &self.process.launcher {
            line.append_switch_value(switches::MEDIA_LAUNCHER, launcher.clone());
        }
        if !self.sandbox.enabled {
            line.append_switch(switches::NO_SANDBOX);
        }
        if !self.sandbox.seccomp {
            line.append_switch(switches::DISABLE_SECCOMP_FILTER_SANDBOX);
        }
        if self.sandbox.allow_debugging {
            line.append_switch(switches::ALLOW_SANDBOX_DEBUGGING);
        }
        if self.logging.enable_logging {
            line.append_switch(switches::ENABLE_LOGGING);
        }
        if let Some(v) = self.logging.verbosity {
            line.append_switch_value(switches::V, v.to_string());
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_the_sandbox_on() {
        let config = MediaHostConfig::default();
        assert!(config.sandbox.enabled);
        assert!(config.sandbox.seccomp);
        assert!(!config.media_in_process());
        assert_eq!(config.browser_command_line("shell").argv(), vec!["shell"]);
    }

    #[test]
    fn missing_file_generates_a_loadable_template() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("mediaproc.toml");
        let path = path.to_str().expect("config path utf8");
        let first = MediaHostConfig::load(path).expect("generate config");
        assert!(Path::new(path).exists());
        let second = MediaHostConfig::load(path).expect("reload config");
        assert_eq!(first.sandbox.enabled, second.sandbox.enabled);
        assert_eq!(first.logging.filter, second.logging.filter);
    }

    #[test]
    fn sections_may_be_omitted() {
        let config: MediaHostConfig = toml::from_str(
            r#"
            [process]
            single_process = true
            launcher = "gdb --args"
            "#,
        )
        .expect("parse");
        assert!(config.media_in_process());
        assert!(config.sandbox.enabled);
        let line = config.browser_command_line("shell");
        assert!(line.has_switch(switches::SINGLE_PROCESS));
        assert_eq!(line.switch_value(switches::MEDIA_LAUNCHER), Some("gdb --args"));
    }

    #[test]
    fn sandbox_and_logging_map_to_switches() {
        let mut config = MediaHostConfig::default();
        config.sandbox.enabled = false;
        config.sandbox.seccomp = false;
        config.logging.verbosity = Some(2);
        let line = config.browser_command_line("shell");
        assert!(line.has_switch(switches::NO_SANDBOX));
        assert!(line.has_switch(switches::DISABLE_SECCOMP_FILTER_SANDBOX));
        assert_eq!(line.switch_value(switches::V), Some("2"));
    }

    #[test]
    fn env_override_sets_in_process() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config_path = temp.path().join("mediaproc-test.toml");
        std::env::set_var("MEDIAPROC_IN_PROCESS", "true");
        std::env::set_var("MEDIAPROC_VERBOSITY", "not-a-number");
        let config = MediaHostConfig::load(config_path.to_str().expect("config path utf8"))
            .expect("load config");
        std::env::remove_var("MEDIAPROC_IN_PROCESS");
        std::env::remove_var("MEDIAPROC_VERBOSITY");
        assert!(config.process.in_process);
        assert_eq!(config.logging.verbosity, None);
    }
}
