use std::fmt;
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::error::SignalingFailure;
use crate::peer::{MediaConnectionState, RemoteStream};
use crate::session::SessionState;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    Aborted,
    Shutdown,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndReason::LocalHangup => "local hang-up",
            EndReason::RemoteHangup => "remote hang-up",
            EndReason::Aborted => "aborted",
            EndReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Уведомления для слоя представления.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    CallIdChanged(String),
    StateChanged(SessionState),
    RemoteStreamReady(RemoteStream),
    MediaConnection(MediaConnectionState),
    ConnectionProblem,
    ConnectionRecovered,
    ConnectionFailed,
    CallEnded { call_id: String, reason: EndReason },
    Failure(SignalingFailure),
}

/// Рассылает `CallEvent` и хранит текущий идентификатор звонка.
#[derive(Clone)]
pub struct EventEmitter {
    events: broadcast::Sender<CallEvent>,
    call_id: watch::Sender<String>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEmitter {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (call_id, _) = watch::channel(String::new());
        Self { events, call_id }
    }

    pub fn emit(&self, event: CallEvent) {
        debug!("emit {event:?}");
        // Нет подписчиков: это нормально.
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub fn set_call_id(&self, id: impl Into<String>) {
        let id = id.into();
        let changed = self.call_id.send_if_modified(|current| {
            if *current == id {
                false
            } else {
                *current = id.clone();
                true
            }
        });
        if changed {
            self.emit(CallEvent::CallIdChanged(id));
        }
    }

    pub fn call_id(&self) -> String {
        self.call_id.borrow().clone()
    }

    pub fn watch_call_id(&self) -> watch::Receiver<String> {
        self.call_id.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn call_id_changes_are_broadcast_once() {
        let emitter = EventEmitter::new();
        let mut rx = emitter.subscribe();

        emitter.set_call_id("abc123");
        emitter.set_call_id("abc123");
        emitter.set_call_id("");

        assert_eq!(
            rx.recv().await.expect("event"),
            CallEvent::CallIdChanged("abc123".into())
        );
        assert_eq!(
            rx.recv().await.expect("event"),
            CallEvent::CallIdChanged(String::new())
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(emitter.call_id(), "");
    }
}
