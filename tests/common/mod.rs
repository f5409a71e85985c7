#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use p2pcall_lib::config::{CallConfig, RetryPolicy};
use p2pcall_lib::coordinator::{CallCoordinator, Signal};
use p2pcall_lib::error::MediaError;
use p2pcall_lib::events::{CallEvent, EventEmitter};
use p2pcall_lib::peer::{
    Candidate, EndpointEvent, EndpointEventSink, EndpointFactory, MediaConnectionState,
    MediaEndpoint, RemoteTrack, SessionDescription,
};
use p2pcall_lib::store::MemoryStore;

/// Конфиг без ICE серверов и с backoff в миллисекунды.
pub fn test_config() -> CallConfig {
    CallConfig {
        ice_servers: Vec::new(),
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
        },
        ..CallConfig::default()
    }
}

#[derive(Default)]
struct FakeState {
    local: Option<SessionDescription>,
    remote_sets: usize,
    remote_candidates: Vec<Candidate>,
    closed: bool,
}

/// Endpoint в памяти. Отдаёт одного кандидата после local description и
/// сообщает remote track и `Connected`, когда обе стороны установлены.
pub struct FakeEndpoint {
    serial: usize,
    deny_media: bool,
    reject_candidates: bool,
    fail_close: bool,
    sink: EndpointEventSink,
    state: Mutex<FakeState>,
}

impl FakeEndpoint {
    pub fn candidate(serial: usize) -> Candidate {
        Candidate {
            candidate: format!("candidate:{serial} 1 udp 2122260223 10.0.0.{serial} 5000 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    pub fn own_candidate(&self) -> Candidate {
        Self::candidate(self.serial)
    }

    pub fn emit(&self, event: EndpointEvent) {
        (self.sink)(event);
    }

    pub fn remote_sets(&self) -> usize {
        self.state.lock().unwrap().remote_sets
    }

    pub fn remote_candidates(&self) -> Vec<Candidate> {
        self.state.lock().unwrap().remote_candidates.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    fn maybe_connect(&self) {
        let ready = {
            let state = self.state.lock().unwrap();
            state.local.is_some() && state.remote_sets == 1
        };
        if ready {
            self.emit(EndpointEvent::RemoteTrack(RemoteTrack {
                id: format!("track-{}", self.serial),
                kind: "video".into(),
                stream_id: format!("stream-{}", self.serial),
            }));
            self.emit(EndpointEvent::ConnectionState(MediaConnectionState::Connected));
        }
    }

    fn check_open(&self) -> Result<(), MediaError> {
        if self.is_closed() {
            Err(MediaError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MediaEndpoint for FakeEndpoint {
    async fn attach_local_tracks(&self) -> Result<(), MediaError> {
        if self.deny_media {
            return Err(MediaError::AccessDenied {
                reason: "camera blocked".into(),
            });
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        self.check_open()?;
        Ok(SessionDescription::offer(format!("offer-{}", self.serial)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        self.check_open()?;
        Ok(SessionDescription::answer(format!("answer-{}", self.serial)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        self.check_open()?;
        self.state.lock().unwrap().local = Some(desc);
        self.emit(EndpointEvent::LocalCandidate(self.own_candidate()));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, _desc: SessionDescription) -> Result<(), MediaError> {
        self.check_open()?;
        self.state.lock().unwrap().remote_sets += 1;
        self.maybe_connect();
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: Candidate) -> Result<(), MediaError> {
        if self.reject_candidates {
            return Err(MediaError::Candidate {
                reason: "malformed".into(),
            });
        }
        self.state.lock().unwrap().remote_candidates.push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.state.lock().unwrap().closed = true;
        if self.fail_close {
            return Err(MediaError::Negotiation {
                reason: "transport stuck".into(),
            });
        }
        Ok(())
    }
}

/// Выдаёт пронумерованные [`FakeEndpoint`] и хранит их для проверок.
#[derive(Default)]
pub struct FakeFactory {
    deny_media: bool,
    reject_candidates: bool,
    fail_close: bool,
    fail_create: Mutex<bool>,
    created: Mutex<Vec<Arc<FakeEndpoint>>>,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn denying_media() -> Arc<Self> {
        Arc::new(Self {
            deny_media: true,
            ..Self::default()
        })
    }

    pub fn rejecting_candidates() -> Arc<Self> {
        Arc::new(Self {
            reject_candidates: true,
            ..Self::default()
        })
    }

    /// Endpoint, у которых `close()` всё освобождает, но возвращает ошибку.
    pub fn failing_close() -> Arc<Self> {
        Arc::new(Self {
            fail_close: true,
            ..Self::default()
        })
    }

    pub fn set_fail_create(&self, fail: bool) {
        *self.fail_create.lock().unwrap() = fail;
    }

    pub fn created(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn endpoint(&self, index: usize) -> Arc<FakeEndpoint> {
        self.created.lock().unwrap()[index].clone()
    }

    pub fn last(&self) -> Arc<FakeEndpoint> {
        let created = self.created.lock().unwrap();
        created[created.len() - 1].clone()
    }
}

#[async_trait]
impl EndpointFactory for FakeFactory {
    async fn create(&self, events: EndpointEventSink) -> Result<Arc<dyn MediaEndpoint>, MediaError> {
        if *self.fail_create.lock().unwrap() {
            return Err(MediaError::Negotiation {
                reason: "no transport".into(),
            });
        }
        let mut created = self.created.lock().unwrap();
        let endpoint = Arc::new(FakeEndpoint {
            serial: created.len() + 1,
            deny_media: self.deny_media,
            reject_candidates: self.reject_candidates,
            fail_close: self.fail_close,
            sink: events,
            state: Mutex::new(FakeState::default()),
        });
        created.push(endpoint.clone());
        Ok(endpoint as Arc<dyn MediaEndpoint>)
    }
}

/// Участник с ручным управлением: тест сам решает, когда обрабатывать очередь.
pub struct Participant {
    pub coordinator: CallCoordinator,
    pub inbox: mpsc::UnboundedReceiver<Signal>,
    pub events: tokio::sync::broadcast::Receiver<CallEvent>,
}

impl Participant {
    pub async fn new(store: &MemoryStore, factory: Arc<FakeFactory>) -> Self {
        Self::with_config(&test_config(), store, factory).await
    }

    pub async fn with_config(
        config: &CallConfig,
        store: &MemoryStore,
        factory: Arc<FakeFactory>,
    ) -> Self {
        let emitter = EventEmitter::new();
        let events = emitter.subscribe();
        let (coordinator, inbox) =
            CallCoordinator::new(config, Arc::new(store.clone()), factory, emitter)
                .await
                .expect("coordinator");
        Self {
            coordinator,
            inbox,
            events,
        }
    }

    /// Обрабатывает сигналы, пока очередь не опустеет.
    pub async fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(signal) = self.inbox.try_recv() {
            self.coordinator.handle_signal(signal).await;
            handled += 1;
        }
        handled
    }

    /// Все события с прошлого вызова.
    pub fn drain_events(&mut self) -> Vec<CallEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            seen.push(event);
        }
        seen
    }
}
