//! Browser-wide media state: the media log, observers and launch hooks.
//!
//! Everything here may be called from any thread. Observer callbacks for
//! crashes always run on the UI thread once one is attached.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use chrono::{DateTime, Utc};
use mediaproc_transport::LogLevel;
use serde::Serialize;
use tracing::{debug, warn};

use crate::command_line::CommandLine;
use crate::termination::TerminationStatus;
use crate::ui::UiHandle;

/// Oldest entries are dropped past this many.
pub const MAX_LOG_MESSAGES: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogMessage {
    pub level: LogLevel,
    pub header: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Notified about media process lifecycle. All methods default to no-ops.
pub trait MediaDataManagerObserver: Send + Sync {
    fn on_media_process_crashed(&self, _status: TerminationStatus) {}
    fn on_media_process_init_failure(&self) {}
    fn on_log_message_added(&self, _message: &LogMessage) {}
}

pub type MediaCommandLineHook = Arc<dyn Fn(&mut CommandLine) + Send + Sync>;

#[derive(Default)]
struct State {
    log_messages: Vec<LogMessage>,
    observers: Vec<Arc<dyn MediaDataManagerObserver>>,
    command_line_hook: Option<MediaCommandLineHook>,
    ui: Option<UiHandle>,
}

#[derive(Default)]
pub struct MediaDataManager {
    state: Mutex<State>,
}

static INSTANCE: OnceLock<Arc<MediaDataManager>> = OnceLock::new();

impl MediaDataManager {
    /// The process-wide instance.
    pub fn get_instance() -> Arc<Self> {
        Arc::clone(INSTANCE.get_or_init(|| Arc::new(Self::default())))
    }

    /// A standalone instance, for embedding and tests.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Route crash notifications through `ui` from now on.
    pub fn attach_ui(&self, ui: UiHandle) {
        self.lock().ui = Some(ui);
    }

    pub fn detach_ui(&self) {
        self.lock().ui = None;
    }

    pub fn add_observer(&self, observer: Arc<dyn MediaDataManagerObserver>) {
        self.lock().observers.push(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn MediaDataManagerObserver>) {
        self.lock().observers.retain(|o| !Arc::ptr_eq(o, observer));
    }

    fn observers(&self) -> Vec<Arc<dyn MediaDataManagerObserver>> {
        self.lock().observers.clone()
    }

    pub fn add_log_message(&self, level: LogLevel, header: impl Into<String>, message: impl Into<String>) {
        let entry = LogMessage {
            level,
            header: header.into(),
            message: message.into(),
            timestamp: Utc::now(),
        };
        let observers = {
            let mut state = self.lock();
            state.log_messages.push(entry.clone());
            let len = state.log_messages.len();
            if len > MAX_LOG_MESSAGES {
                state.log_messages.drain(..len - MAX_LOG_MESSAGES);
            }
            state.observers.clone()
        };
        for observer in observers {
            observer.on_log_message_added(&entry);
        }
    }

    /// A copy of the log.
    pub fn log_messages(&self) -> Vec<LogMessage> {
        self.lock().log_messages.clone()
    }

    pub fn log_messages_json(&self) -> serde_json::Value {
        let messages = self.log_messages();
        serde_json::to_value(&messages).unwrap_or_else(|e| {
            warn!(error = %e, "data manager: failed to serialize log");
            serde_json::Value::Array(Vec::new())
        })
    }

    /// Extra switches for every media process launch.
    pub fn set_media_command_line_hook(&self, hook: MediaCommandLineHook) {
        self.lock().command_line_hook = Some(hook);
    }

    pub fn append_media_command_line(&self, command_line: &mut CommandLine) {
        let hook = self.lock().command_line_hook.clone();
        if let Some(hook) = hook {
            hook(command_line);
        }
    }

    /// Report a media process crash. Observers hear about it on the UI thread.
    pub fn process_crashed(self: &Arc<Self>, status: TerminationStatus) {
        let ui = self.lock().ui.clone();
        if let Some(ui) = ui.filter(|ui| !ui.is_current()) {
            let this = Arc::clone(self);
            if !ui.post(move |_| this.process_crashed(status)) {
                debug!(?status, "data manager: ui thread gone, crash not reported");
            }
            return;
        }
        for observer in self.observers() {
            observer.on_media_process_crashed(status);
        }
    }

    pub fn media_process_init_failed(&self) {
        for observer in self.observers() {
            observer.on_media_process_init_failure();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct Counter {
        crashes: Mutex<Vec<TerminationStatus>>,
        init_failures: AtomicUsize,
        logged: AtomicUsize,
    }

    impl MediaDataManagerObserver for Counter {
        fn on_media_process_crashed(&self, status: TerminationStatus) {
            self.crashes.lock().unwrap().push(status);
        }

        fn on_media_process_init_failure(&self) {
            self.init_failures.fetch_add(1, Ordering::SeqCst);
        }

        fn on_log_message_added(&self, _message: &LogMessage) {
            self.logged.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn log_is_bounded_and_copied() {
        let dm = MediaDataManager::new();
        for i in 0..MAX_LOG_MESSAGES + 5 {
            dm.add_log_message(LogLevel::Info, "test", format!("line {i}"));
        }
        let log = dm.log_messages();
        assert_eq!(log.len(), MAX_LOG_MESSAGES);
        assert_eq!(log[0].message, "line 5");
        dm.add_log_message(LogLevel::Error, "test", "later");
        assert_eq!(log.len(), MAX_LOG_MESSAGES);
    }

    #[test]
    fn log_serializes_to_a_json_list() {
        let dm = MediaDataManager::new();
        dm.add_log_message(LogLevel::Warning, "MediaProcessHost", "late reply");
        let json = dm.log_messages_json();
        assert_eq!(json[0]["level"], "warning");
        assert_eq!(json[0]["header"], "MediaProcessHost");
        assert_eq!(json[0]["message"], "late reply");
        assert!(json[0]["timestamp"].is_string());
    }

    #[test]
    fn observers_can_be_removed() {
        let dm = MediaDataManager::new();
        let counter = Arc::new(Counter::default());
        let observer: Arc<dyn MediaDataManagerObserver> = counter.clone();
        dm.add_observer(Arc::clone(&observer));
        dm.process_crashed(TerminationStatus::Crashed);
        dm.media_process_init_failed();
        dm.add_log_message(LogLevel::Info, "h", "m");
        dm.remove_observer(&observer);
        dm.process_crashed(TerminationStatus::Killed);
        assert_eq!(*counter.crashes.lock().unwrap(), vec![TerminationStatus::Crashed]);
        assert_eq!(counter.init_failures.load(Ordering::SeqCst), 1);
        assert_eq!(counter.logged.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn command_line_hook_runs_on_append() {
        let dm = MediaDataManager::new();
        let mut line = CommandLine::new("media");
        dm.append_media_command_line(&mut line);
        assert_eq!(line.argv(), vec!["media"]);
        dm.set_media_command_line_hook(Arc::new(|line: &mut CommandLine| {
            line.append_switch("use-fake-audio")
        }));
        dm.append_media_command_line(&mut line);
        assert!(line.has_switch("use-fake-audio"));
    }

    #[test]
    fn instance_is_shared() {
        assert!(Arc::ptr_eq(&MediaDataManager::get_instance(), &MediaDataManager::get_instance()));
    }
}
