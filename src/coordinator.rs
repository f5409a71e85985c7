//! Сигналинг caller/callee через общую запись звонка.
//!
//! Координатор никогда не выполняется параллельно сам с собой: задача
//! контроллера подаёт ему команды и [`Signal`]ы из очереди по одному.
//! Колбэки store и endpoint только кладут сигналы в очередь, помеченные
//! эпохой, в которой они были зарегистрированы. Teardown увеличивает эпоху,
//! и всё, что ещё лежит в очереди для старой сессии, отбрасывается.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::config::{CallConfig, RetryPolicy};
use crate::error::{CallError, MediaError, SignalingFailure, StoreError};
use crate::events::{CallEvent, EndReason, EventEmitter};
use crate::logger::{self, dump_candidate};
use crate::peer::{
    Candidate, EndpointEvent, EndpointEventSink, EndpointFactory, MediaConnectionState,
    MediaEndpoint, RemoteStream, RemoteTrack, SessionDescription,
};
use crate::session::{ActiveCall, CallPhase, Role, Session, SessionState};
use crate::store::{
    CallCallback, CallFields, CallRecord, CandidateCallback, DocumentStore, Subscription,
    TerminationSignal, WriteMode,
};

/// Работа для координатора от подписок store, media endpoint и его
/// собственных таймеров.
#[derive(Debug, Clone)]
pub enum Signal {
    CallUpdated { epoch: u64, record: CallRecord },
    RemoteCandidate { epoch: u64, candidate: Candidate },
    Endpoint { epoch: u64, event: EndpointEvent },
    GraceExpired { epoch: u64 },
}

impl Signal {
    pub fn epoch(&self) -> u64 {
        match self {
            Signal::CallUpdated { epoch, .. }
            | Signal::RemoteCandidate { epoch, .. }
            | Signal::Endpoint { epoch, .. }
            | Signal::GraceExpired { epoch } => *epoch,
        }
    }
}

pub struct CallCoordinator {
    store: Arc<dyn DocumentStore>,
    factory: Arc<dyn EndpointFactory>,
    retry: RetryPolicy,
    grace_period: Duration,
    endpoint: Option<Arc<dyn MediaEndpoint>>,
    session: Session,
    epoch: u64,
    inbox: mpsc::UnboundedSender<Signal>,
    events: EventEmitter,
    remote_stream: RemoteStream,
}

impl CallCoordinator {
    /// Создаёт координатор и первый media endpoint. Возвращённый receiver
    /// нужно вычитывать в [`CallCoordinator::handle_signal`].
    pub async fn new(
        config: &CallConfig,
        store: Arc<dyn DocumentStore>,
        factory: Arc<dyn EndpointFactory>,
        events: EventEmitter,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Signal>), CallError> {
        let (inbox, rx) = mpsc::unbounded_channel();
        let mut coordinator = Self {
            store,
            factory,
            retry: config.retry,
            grace_period: config.grace_period(),
            endpoint: None,
            session: Session::Idle,
            epoch: 0,
            inbox,
            events,
            remote_stream: RemoteStream::default(),
        };
        coordinator.endpoint = Some(coordinator.build_endpoint().await?);
        Ok((coordinator, rx))
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn call_id(&self) -> Option<&str> {
        self.session.call_id()
    }

    pub fn role(&self) -> Option<Role> {
        self.session.role()
    }

    pub fn remote_stream(&self) -> &RemoteStream {
        &self.remote_stream
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn has_endpoint(&self) -> bool {
        self.endpoint.is_some()
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    // ========== OPERATIONS ==========

    /// Шаг 1 (caller): создаём запись звонка, публикуем OFFER и ждём ANSWER.
    /// Возвращает идентификатор звонка, который передаётся собеседнику.
    pub async fn start_call(&mut self) -> Result<String, CallError> {
        self.ensure_idle()?;
        let endpoint = self.endpoint().await?;
        let call_id = self.store.create_call().await?;
        info!("Starting call {call_id} as caller");

        self.bind(call_id.clone(), Role::Caller);
        match self.negotiate_as_caller(&endpoint, &call_id).await {
            Ok(()) => {
                self.events.set_call_id(call_id.clone());
                Ok(call_id)
            }
            Err(e) => {
                error!("Starting call {call_id} failed: {e}");
                self.end_call(EndReason::Aborted).await;
                Err(e)
            }
        }
    }

    /// Шаг 2 (callee): отвечаем на OFFER, лежащий под `call_id`.
    pub async fn join_call(&mut self, call_id: &str) -> Result<(), CallError> {
        self.ensure_idle()?;
        let call_id = call_id.trim();
        if call_id.is_empty() {
            return Err(CallError::EmptyCallId);
        }
        self.events.set_call_id(call_id);

        let record = match self.store.get_call(call_id).await {
            Ok(record) => record,
            Err(StoreError::NotFound { .. }) => {
                warn!("Offer not found for call {call_id}");
                return Err(CallError::NotFound {
                    call_id: call_id.to_owned(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let Some(offer) = record.offer else {
            warn!("Offer not found for call {call_id}");
            return Err(CallError::NotFound {
                call_id: call_id.to_owned(),
            });
        };
        if record.termination_signal.is_some() {
            return Err(CallError::CallEnded {
                call_id: call_id.to_owned(),
            });
        }
        if record.answer.is_some() {
            return Err(CallError::AlreadyAnswered {
                call_id: call_id.to_owned(),
            });
        }

        let endpoint = self.endpoint().await?;
        info!("Joining call {call_id} as callee");
        self.bind(call_id.to_owned(), Role::Callee);
        match self.negotiate_as_callee(&endpoint, call_id, offer).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("Joining call {call_id} failed: {e}");
                self.end_call(EndReason::Aborted).await;
                Err(e)
            }
        }
    }

    /// Показывает идентификатор, введённый пользователем до `join_call`.
    /// Только в состоянии Idle.
    pub fn enter_call_id(&mut self, input: &str) -> Result<(), CallError> {
        self.ensure_idle()?;
        self.events.set_call_id(input);
        Ok(())
    }

    /// Сообщает собеседнику о завершении и разбирает всё локально. Можно
    /// вызывать и в Idle.
    pub async fn hang_up(&mut self) {
        if self.session.is_idle() {
            debug!("Hang up while idle");
            self.events.set_call_id("");
            return;
        }
        self.end_call(EndReason::LocalHangup).await;
    }

    /// Завершает активный звонок и освобождает endpoint без замены.
    pub async fn shutdown(&mut self) {
        info!("Shutting down call coordinator");
        self.end_call(EndReason::Shutdown).await;
    }

    /// Обрабатывает один сигнал из очереди.
    pub async fn handle_signal(&mut self, signal: Signal) {
        if signal.epoch() != self.epoch {
            trace!(
                "Dropping signal from epoch {} (current {})",
                signal.epoch(),
                self.epoch
            );
            return;
        }
        match signal {
            Signal::CallUpdated { record, .. } => self.on_call_updated(record).await,
            Signal::RemoteCandidate { candidate, .. } => self.on_remote_candidate(candidate).await,
            Signal::Endpoint { event, .. } => match event {
                EndpointEvent::LocalCandidate(candidate) => {
                    self.on_local_candidate(candidate).await
                }
                EndpointEvent::RemoteTrack(track) => self.on_remote_track(track),
                EndpointEvent::ConnectionState(state) => self.on_connection_state(state),
            },
            Signal::GraceExpired { .. } => self.on_grace_expired(),
        }
    }

    // ========== NEGOTIATION ==========

    async fn negotiate_as_caller(
        &mut self,
        endpoint: &Arc<dyn MediaEndpoint>,
        call_id: &str,
    ) -> Result<(), CallError> {
        let sub = self.subscribe_remote_candidates(call_id, Role::Caller).await?;
        self.track(sub);

        self.attach_local_tracks(endpoint).await;
        let offer = endpoint.create_offer().await?;
        endpoint.set_local_description(offer.clone()).await?;
        debug!("Offer created for {call_id}");

        self.write_call_fields(call_id, CallFields::offer(offer)).await?;
        self.set_phase(CallPhase::OfferSet);

        let sub = self.subscribe_call_updates(call_id).await?;
        self.track(sub);
        self.set_phase(CallPhase::AnswerPending);
        Ok(())
    }

    async fn negotiate_as_callee(
        &mut self,
        endpoint: &Arc<dyn MediaEndpoint>,
        call_id: &str,
        offer: SessionDescription,
    ) -> Result<(), CallError> {
        self.attach_local_tracks(endpoint).await;
        endpoint.set_remote_description(offer).await?;
        if let Some(call) = self.session.active_mut() {
            call.remote_description_set = true;
        }

        let answer = endpoint.create_answer().await?;
        endpoint.set_local_description(answer.clone()).await?;
        debug!("Answer created for {call_id}");

        self.write_call_fields(call_id, CallFields::answer(answer)).await?;
        self.set_phase(CallPhase::AnswerSet);

        let sub = self.subscribe_remote_candidates(call_id, Role::Callee).await?;
        self.track(sub);
        let sub = self.subscribe_call_updates(call_id).await?;
        self.track(sub);
        self.set_phase(CallPhase::Connected);
        Ok(())
    }

    // ========== SIGNAL HANDLERS ==========

    async fn on_call_updated(&mut self, record: CallRecord) {
        let Some(call) = self.session.active() else {
            return;
        };
        if let Some(signal) = &record.termination_signal {
            info!("Call {} was ended by the {}", call.call_id, signal.by);
            self.teardown(EndReason::RemoteHangup, true).await;
            return;
        }
        if call.role != Role::Caller {
            return;
        }
        let Some(answer) = record.answer else {
            return;
        };
        if call.remote_description_set {
            debug!("Answer for {} already applied, ignoring", call.call_id);
            return;
        }
        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };
        match endpoint.set_remote_description(answer).await {
            Ok(()) => {
                if let Some(call) = self.session.active_mut() {
                    call.remote_description_set = true;
                    info!("Answer applied for call {}", call.call_id);
                }
                self.set_phase(CallPhase::Connected);
            }
            Err(e) => error!("setRemoteDescription(answer) failed: {e}"),
        }
    }

    async fn on_remote_candidate(&mut self, candidate: Candidate) {
        let Some(call) = self.session.active_mut() else {
            return;
        };
        let bucket = call.role.remote_bucket();
        call.remote_candidates.record(&candidate);
        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };
        dump_candidate("REMOTE", &candidate);
        if let Err(e) = endpoint.add_remote_candidate(candidate).await {
            self.report(SignalingFailure::TransientSignaling {
                reason: format!("addIceCandidate ({bucket}) failed: {e}"),
            });
        }
    }

    async fn on_local_candidate(&mut self, candidate: Candidate) {
        let Some(call) = self.session.active_mut() else {
            debug!("Dropping local candidate gathered while idle");
            return;
        };
        let bucket = call.role.local_bucket();
        let call_id = call.call_id.clone();
        call.local_candidates.record(&candidate);
        match self.store.append_candidate(&call_id, bucket, candidate).await {
            Ok(()) => debug!("ICE candidate saved to {bucket}"),
            Err(e) => self.report(SignalingFailure::TransientSignaling {
                reason: format!("Failed to save ICE candidate to {bucket}: {e}"),
            }),
        }
    }

    fn on_remote_track(&mut self, track: RemoteTrack) {
        if self.session.is_idle() {
            return;
        }
        if self.remote_stream.add_track(track) {
            info!("Remote stream ready");
            self.events
                .emit(CallEvent::RemoteStreamReady(self.remote_stream.clone()));
        }
    }

    fn on_connection_state(&mut self, state: MediaConnectionState) {
        self.events.emit(CallEvent::MediaConnection(state));
        let Some(call) = self.session.active_mut() else {
            return;
        };
        match state {
            MediaConnectionState::Connected => {
                call.media_connected = true;
                if let Some(timer) = call.grace_timer.take() {
                    timer.abort();
                    info!("Media connection recovered for {}", call.call_id);
                    self.events.emit(CallEvent::ConnectionRecovered);
                }
            }
            MediaConnectionState::Disconnected | MediaConnectionState::Failed => {
                call.media_connected = false;
                if call.grace_timer.is_some() {
                    debug!("Grace period already running, ignoring {state}");
                    return;
                }
                warn!(
                    "Media connection {state} for {}, waiting {}s for recovery",
                    call.call_id,
                    self.grace_period.as_secs()
                );
                self.events.emit(CallEvent::ConnectionProblem);
                let inbox = self.inbox.clone();
                let epoch = self.epoch;
                let grace = self.grace_period;
                call.grace_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    let _ = inbox.send(Signal::GraceExpired { epoch });
                }));
            }
            _ => {}
        }
    }

    fn on_grace_expired(&mut self) {
        let Some(call) = self.session.active_mut() else {
            return;
        };
        call.grace_timer = None;
        if call.media_connected {
            return;
        }
        warn!("Media connection for {} did not recover", call.call_id);
        self.events.emit(CallEvent::ConnectionFailed);
    }

    // ========== TEARDOWN ==========

    /// Пишет termination signal, если этой стороне есть что отзывать, затем
    /// teardown. Локальная очистка выполняется даже при ошибке записи.
    async fn end_call(&mut self, reason: EndReason) {
        if let Some(call) = self.session.active() {
            let published = !matches!(call.phase, CallPhase::RoleBound);
            if reason != EndReason::Aborted || published {
                let call_id = call.call_id.clone();
                let signal = TerminationSignal::now(call.role);
                if let Err(e) = self
                    .write_call_fields(&call_id, CallFields::termination(signal))
                    .await
                {
                    warn!("Could not notify peer that {call_id} ended: {e}");
                }
            }
        }
        self.teardown(reason, reason != EndReason::Shutdown).await;
    }

    /// Отменяет подписки, закрывает endpoint и очищает сессию. С `recycle`
    /// сразу создаётся новый endpoint для следующего звонка.
    async fn teardown(&mut self, reason: EndReason, recycle: bool) {
        let previous = std::mem::take(&mut self.session);
        self.epoch += 1;

        let ended = match previous {
            Session::Active(mut call) => {
                let cancelled = call.release();
                debug!(
                    "Cancelled {cancelled} subscription(s) for call {}",
                    call.call_id
                );
                call.local_candidates.log("Local");
                call.remote_candidates.log("Remote");
                Some(call.call_id)
            }
            Session::Idle => None,
        };

        if let Some(endpoint) = self.endpoint.take() {
            if let Err(e) = endpoint.close().await {
                warn!("Failed to close media endpoint: {e}");
            }
        }
        self.remote_stream.clear();
        if ended.is_some() {
            self.events
                .emit(CallEvent::StateChanged(SessionState::Terminated));
        }

        if recycle {
            match self.build_endpoint().await {
                Ok(endpoint) => self.endpoint = Some(endpoint),
                Err(e) => error!("Failed to prepare a new media endpoint, will retry on next call: {e}"),
            }
        }

        self.events.set_call_id("");
        if let Some(call_id) = ended {
            info!("Call {call_id} ended ({reason})");
            self.events.emit(CallEvent::CallEnded { call_id, reason });
            self.events.emit(CallEvent::StateChanged(SessionState::Idle));
        }
    }

    // ========== HELPERS ==========

    fn ensure_idle(&self) -> Result<(), CallError> {
        match self.session.call_id() {
            Some(call_id) => Err(CallError::SessionBusy {
                call_id: call_id.to_owned(),
            }),
            None => Ok(()),
        }
    }

    fn bind(&mut self, call_id: String, role: Role) {
        self.session = Session::Active(ActiveCall::new(call_id, role));
        self.events
            .emit(CallEvent::StateChanged(SessionState::RoleBound));
    }

    fn set_phase(&mut self, phase: CallPhase) {
        if let Some(call) = self.session.active_mut() {
            call.phase = phase;
            self.events.emit(CallEvent::StateChanged(self.session.state()));
        }
    }

    fn track(&mut self, sub: Subscription) {
        debug!("Subscribed to {}", sub.label());
        match self.session.active_mut() {
            Some(call) => call.subscriptions.push(sub),
            None => sub.cancel(),
        }
    }

    fn report(&self, failure: SignalingFailure) {
        logger::report(&failure);
        self.events.emit(CallEvent::Failure(failure));
    }

    async fn attach_local_tracks(&self, endpoint: &Arc<dyn MediaEndpoint>) {
        if let Err(e) = endpoint.attach_local_tracks().await {
            self.report(SignalingFailure::MediaAccessDenied {
                reason: e.to_string(),
            });
        }
    }

    async fn endpoint(&mut self) -> Result<Arc<dyn MediaEndpoint>, MediaError> {
        if let Some(endpoint) = &self.endpoint {
            return Ok(endpoint.clone());
        }
        let endpoint = self.build_endpoint().await?;
        self.endpoint = Some(endpoint.clone());
        Ok(endpoint)
    }

    async fn build_endpoint(&self) -> Result<Arc<dyn MediaEndpoint>, MediaError> {
        let epoch = self.epoch;
        let inbox = self.inbox.clone();
        let sink: EndpointEventSink = Arc::new(move |event| {
            let _ = inbox.send(Signal::Endpoint { epoch, event });
        });
        self.factory.create(sink).await
    }

    async fn subscribe_remote_candidates(
        &self,
        call_id: &str,
        role: Role,
    ) -> Result<Subscription, StoreError> {
        let epoch = self.epoch;
        let inbox = self.inbox.clone();
        let on_added: CandidateCallback = Arc::new(move |candidate| {
            let _ = inbox.send(Signal::RemoteCandidate { epoch, candidate });
        });
        self.store
            .subscribe_candidates(call_id, role.remote_bucket(), on_added)
            .await
    }

    async fn subscribe_call_updates(&self, call_id: &str) -> Result<Subscription, StoreError> {
        let epoch = self.epoch;
        let inbox = self.inbox.clone();
        let on_update: CallCallback = Arc::new(move |record| {
            let _ = inbox.send(Signal::CallUpdated { epoch, record });
        });
        self.store.subscribe_call(call_id, on_update).await
    }

    /// Merge-запись с экспоненциальным backoff. У каждого поля один писатель,
    /// поэтому неудачная запись повторяется, а не сливается.
    async fn write_call_fields(&self, call_id: &str, fields: CallFields) -> Result<(), StoreError> {
        let field = fields.names();
        let mut attempt = 1;
        loop {
            match self
                .store
                .set_call_fields(call_id, fields.clone(), WriteMode::Merge)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e @ StoreError::NotFound { .. }) => return Err(e),
                Err(e) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!("Writing {field} to {call_id} failed ({e}), retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.report(SignalingFailure::WriteConflict {
                        field,
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                    return Err(e);
                }
            }
        }
    }
}
