pub mod memory;
pub mod types;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::error::StoreError;
use crate::peer::Candidate;

pub use memory::MemoryStore;
pub use types::{CallFields, CallRecord, CandidateBucket, TerminationSignal, WriteMode};

pub type CallCallback = Arc<dyn Fn(CallRecord) + Send + Sync>;
pub type CandidateCallback = Arc<dyn Fn(Candidate) + Send + Sync>;

/// Синхронизируемое хранилище записей звонков и их кандидатов.
///
/// В пределах одной подписки уведомления приходят в порядке применения
/// изменений. Колбэки не должны обращаться обратно к store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Создаёт пустую запись звонка и возвращает её идентификатор.
    async fn create_call(&self) -> Result<String, StoreError>;

    async fn get_call(&self, call_id: &str) -> Result<CallRecord, StoreError>;

    async fn set_call_fields(
        &self,
        call_id: &str,
        fields: CallFields,
        mode: WriteMode,
    ) -> Result<(), StoreError>;

    async fn append_candidate(
        &self,
        call_id: &str,
        bucket: CandidateBucket,
        candidate: Candidate,
    ) -> Result<(), StoreError>;

    /// Вызывает `on_added` для уже лежащих кандидатов, затем для каждого
    /// нового.
    async fn subscribe_candidates(
        &self,
        call_id: &str,
        bucket: CandidateBucket,
        on_added: CandidateCallback,
    ) -> Result<Subscription, StoreError>;

    /// Вызывает `on_update` с текущей записью, затем после каждого изменения.
    async fn subscribe_call(
        &self,
        call_id: &str,
        on_update: CallCallback,
    ) -> Result<Subscription, StoreError>;
}

/// Активная подписка. Отменяется через `cancel()` или при drop.
pub struct Subscription {
    label: String,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(label: impl Into<String>, cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            label: label.into(),
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            tracing::debug!("Cancelling subscription {}", self.label);
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("label", &self.label)
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
