//! How a media process ended.

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use serde::Serialize;

const SIGTERM: i32 = 15;
const SIGKILL: i32 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "code", rename_all = "snake_case")]
pub enum TerminationStatus {
    Normal,
    Abnormal(i32),
    Killed,
    Crashed,
    /// Still running, never started, or not reaped yet.
    Unknown,
}

impl TerminationStatus {
    pub fn from_exit_status(status: Option<ExitStatus>) -> Self {
        let Some(status) = status else {
            return Self::Unknown;
        };
        if let Some(code) = status.code() {
            return if code == 0 {
                Self::Normal
            } else {
                Self::Abnormal(code)
            };
        }
        match status.signal() {
            Some(SIGKILL) | Some(SIGTERM) => Self::Killed,
            Some(_) => Self::Crashed,
            None => Self::Unknown,
        }
    }

    /// Whether this ending should be reported as a crash.
    pub fn is_crash(&self) -> bool {
        matches!(self, Self::Abnormal(_) | Self::Killed | Self::Crashed)
    }

    /// Text logged when the host goes away. Empty when nothing is known.
    pub fn reason(&self) -> String {
        match self {
            Self::Normal => "The media process exited normally.".into(),
            Self::Abnormal(code) => format!("The media process exited with code {code}."),
            Self::Killed => "The media process is killed.".into(),
            Self::Crashed => "The media process crashed.".into(),
            Self::Unknown => String::new(),
        }
    }
}
