//! Forwards warnings and errors from the media process to the browser log.

use std::cell::Cell;
use std::fmt;
use std::sync::{Arc, Mutex};

use mediaproc_transport::{Channel, ControlMessage, LogLevel, Message};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

thread_local! {
    static FORWARDING: Cell<bool> = const { Cell::new(false) };
}

/// Where forwarded log lines go. Empty until the browser channel exists.
#[derive(Clone, Default)]
pub struct LogSlot(Arc<Mutex<Option<Channel>>>);

impl LogSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, channel: Channel) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = Some(channel);
        }
    }

    pub fn detach(&self) {
        if let Ok(mut slot) = self.0.lock() {
            slot.take();
        }
    }

    fn send(&self, level: LogLevel, header: String, message: String) {
        let channel = match self.0.lock() {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        if let Some(channel) = channel.filter(Channel::is_open) {
            let _ = channel.send(Message::control(ControlMessage::LogMessage {
                level,
                header,
                message,
            }));
        }
    }
}

/// `tracing` layer that sends WARN and ERROR events as `LogMessage`s.
pub struct LogForwardLayer {
    slot: LogSlot,
}

impl LogForwardLayer {
    pub fn new(slot: LogSlot) -> Self {
        Self { slot }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.push(format!("{}={value:?}", field.name()));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={value}", field.name()));
        }
    }
}

fn log_level(level: &Level) -> Option<LogLevel> {
    match *level {
        Level::ERROR => Some(LogLevel::Error),
        Level::WARN => Some(LogLevel::Warning),
        _ => None,
    }
}

impl<S: Subscriber> Layer<S> for LogForwardLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let Some(level) = log_level(meta.level()) else { return };
        // Sending may itself log; never forward from inside a forward.
        if FORWARDING.with(|f| f.replace(true)) {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let mut message = visitor.message;
        if !visitor.fields.is_empty() {
            message.push_str(" (");
            message.push_str(&visitor.fields.join(", "));
            message.push(')');
        }
        let header = format!("[media:{}]", meta.target());
        self.slot.send(level, header, message);
        FORWARDING.with(|f| f.set(false));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mediaproc_transport::channel::forward_to;
    use mediaproc_transport::{ChannelEvent, SyncPolicy};
    use tokio::sync::mpsc;
    use tracing_subscriber::layer::SubscriberExt;

    use super::*;

    #[tokio::test]
    async fn warnings_and_errors_are_forwarded() {
        let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        let io = tokio::runtime::Handle::current();
        let (tx, _rx) = mpsc::unbounded_channel();
        let media = Channel::from_stream(&io, "log", a, forward_to(tx, |e| e), SyncPolicy::Forbid).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _browser = Channel::from_stream(&io, "log", b, forward_to(tx, |e| e), SyncPolicy::Allow).unwrap();

        let slot = LogSlot::new();
        slot.attach(media);
        let subscriber = tracing_subscriber::registry().with(LogForwardLayer::new(slot));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("not forwarded");
            tracing::warn!(player_id = 3, "player: stalled");
            tracing::error!("gl: lost context");
        });

        let mut got = Vec::new();
        while got.len() < 2 {
            let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let ChannelEvent::Message(Message::Control {
                body: ControlMessage::LogMessage { level, message, .. },
            }) = ev
            {
                got.push((level, message));
            }
        }
        assert_eq!(
            got,
            vec![
                (LogLevel::Warning, "player: stalled (player_id=3)".to_string()),
                (LogLevel::Error, "gl: lost context".to_string()),
            ]
        );
    }

    #[test]
    fn detached_slot_drops_lines() {
        let slot = LogSlot::new();
        slot.detach();
        slot.send(LogLevel::Error, "h".into(), "m".into());
    }
}
