use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::error::StoreError;
use crate::peer::Candidate;
use crate::store::types::CALLS_COLLECTION;
use crate::store::{
    CallCallback, CallFields, CallRecord, CandidateBucket, CandidateCallback, DocumentStore,
    Subscription, WriteMode,
};
use crate::utils::random_id;

/// Document store в памяти процесса. Клоны разделяют одни документы, поэтому
/// два участника с клонами одного store видят записи друг друга.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    calls: HashMap<String, CallDoc>,
    watchers: HashMap<u64, Watcher>,
    next_watcher: u64,
    failing_writes: u32,
    fail_appends: bool,
}

#[derive(Default)]
struct CallDoc {
    record: CallRecord,
    offer_candidates: Vec<Candidate>,
    answer_candidates: Vec<Candidate>,
}

impl CallDoc {
    fn bucket(&self, bucket: CandidateBucket) -> &Vec<Candidate> {
        match bucket {
            CandidateBucket::Offer => &self.offer_candidates,
            CandidateBucket::Answer => &self.answer_candidates,
        }
    }

    fn bucket_mut(&mut self, bucket: CandidateBucket) -> &mut Vec<Candidate> {
        match bucket {
            CandidateBucket::Offer => &mut self.offer_candidates,
            CandidateBucket::Answer => &mut self.answer_candidates,
        }
    }
}

struct Watcher {
    call_id: String,
    target: WatchTarget,
}

enum WatchTarget {
    Call(CallCallback),
    Candidates(CandidateBucket, CandidateCallback),
}

impl Inner {
    fn notify_call(&self, call_id: &str) {
        let Some(doc) = self.calls.get(call_id) else {
            return;
        };
        for watcher in self.watchers.values().filter(|w| w.call_id == call_id) {
            if let WatchTarget::Call(cb) = &watcher.target {
                cb(doc.record.clone());
            }
        }
    }

    fn notify_candidate(&self, call_id: &str, bucket: CandidateBucket, candidate: &Candidate) {
        for watcher in self.watchers.values().filter(|w| w.call_id == call_id) {
            if let WatchTarget::Candidates(b, cb) = &watcher.target {
                if *b == bucket {
                    cb(candidate.clone());
                }
            }
        }
    }

    fn doc(&self, call_id: &str) -> Result<&CallDoc, StoreError> {
        self.calls.get(call_id).ok_or_else(|| StoreError::NotFound {
            call_id: call_id.to_owned(),
        })
    }

    fn doc_mut(&mut self, call_id: &str) -> Result<&mut CallDoc, StoreError> {
        self.calls.get_mut(call_id).ok_or_else(|| StoreError::NotFound {
            call_id: call_id.to_owned(),
        })
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, inner: &mut Inner, call_id: &str, target: WatchTarget) -> Subscription {
        let id = inner.next_watcher;
        inner.next_watcher += 1;
        let label = match &target {
            WatchTarget::Call(_) => format!("{CALLS_COLLECTION}/{call_id}"),
            WatchTarget::Candidates(bucket, _) => format!("{CALLS_COLLECTION}/{call_id}/{bucket}"),
        };
        inner.watchers.insert(
            id,
            Watcher {
                call_id: call_id.to_owned(),
                target,
            },
        );
        let store = Arc::downgrade(&self.inner);
        Subscription::new(label, move || {
            if let Some(store) = store.upgrade() {
                store
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .watchers
                    .remove(&id);
            }
        })
    }

    /// Следующие `n` записей в запись звонка упадут с write conflict.
    pub fn fail_next_writes(&self, n: u32) {
        self.lock().failing_writes = n;
    }

    /// Добавление кандидатов падает, пока не выключим.
    pub fn fail_candidate_appends(&self, fail: bool) {
        self.lock().fail_appends = fail;
    }

    /// Повторно отправляет текущую запись всем подписчикам, как при
    /// повторной доставке обновления.
    pub fn redeliver(&self, call_id: &str) {
        self.lock().notify_call(call_id);
    }

    pub fn active_subscriptions(&self) -> usize {
        self.lock().watchers.len()
    }

    pub fn record(&self, call_id: &str) -> Option<CallRecord> {
        self.lock().calls.get(call_id).map(|doc| doc.record.clone())
    }

    pub fn candidates(&self, call_id: &str, bucket: CandidateBucket) -> Vec<Candidate> {
        self.lock()
            .calls
            .get(call_id)
            .map(|doc| doc.bucket(bucket).clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create_call(&self) -> Result<String, StoreError> {
        let mut inner = self.lock();
        let mut call_id = random_id();
        while inner.calls.contains_key(&call_id) {
            call_id = random_id();
        }
        inner.calls.insert(call_id.clone(), CallDoc::default());
        debug!("Created {CALLS_COLLECTION}/{call_id}");
        Ok(call_id)
    }

    async fn get_call(&self, call_id: &str) -> Result<CallRecord, StoreError> {
        Ok(self.lock().doc(call_id)?.record.clone())
    }

    async fn set_call_fields(
        &self,
        call_id: &str,
        fields: CallFields,
        mode: WriteMode,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.failing_writes > 0 {
            inner.failing_writes -= 1;
            return Err(StoreError::WriteConflict {
                reason: format!("injected conflict writing {}", fields.names()),
            });
        }
        trace!("Writing {} to {call_id} ({mode:?})", fields.names());
        let doc = inner.doc_mut(call_id)?;
        match mode {
            WriteMode::Merge => fields.merge_into(&mut doc.record),
            WriteMode::Replace => doc.record = fields.into_record(),
        }
        inner.notify_call(call_id);
        Ok(())
    }

    async fn append_candidate(
        &self,
        call_id: &str,
        bucket: CandidateBucket,
        candidate: Candidate,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.fail_appends {
            return Err(StoreError::Unavailable {
                reason: format!("injected failure appending to {bucket}"),
            });
        }
        inner
            .doc_mut(call_id)?
            .bucket_mut(bucket)
            .push(candidate.clone());
        inner.notify_candidate(call_id, bucket, &candidate);
        Ok(())
    }

    async fn subscribe_candidates(
        &self,
        call_id: &str,
        bucket: CandidateBucket,
        on_added: CandidateCallback,
    ) -> Result<Subscription, StoreError> {
        let mut inner = self.lock();
        for candidate in inner.doc(call_id)?.bucket(bucket) {
            on_added(candidate.clone());
        }
        Ok(self.register(&mut inner, call_id, WatchTarget::Candidates(bucket, on_added)))
    }

    async fn subscribe_call(
        &self,
        call_id: &str,
        on_update: CallCallback,
    ) -> Result<Subscription, StoreError> {
        let mut inner = self.lock();
        on_update(inner.doc(call_id)?.record.clone());
        Ok(self.register(&mut inner, call_id, WatchTarget::Call(on_update)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::SessionDescription;
    use crate::session::Role;
    use crate::store::TerminationSignal;

    fn cand(n: u32) -> Candidate {
        Candidate {
            candidate: format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    fn collect_candidates() -> (CandidateCallback, Arc<Mutex<Vec<Candidate>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: CandidateCallback = Arc::new(move |c| sink.lock().unwrap().push(c));
        (cb, seen)
    }

    #[tokio::test]
    async fn get_unknown_call_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get_call("missing").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn merge_keeps_offer_and_replace_overwrites() {
        let store = MemoryStore::new();
        let id = store.create_call().await.unwrap();
        store
            .set_call_fields(&id, CallFields::offer(SessionDescription::offer("o")), WriteMode::Replace)
            .await
            .unwrap();
        store
            .set_call_fields(&id, CallFields::answer(SessionDescription::answer("a")), WriteMode::Merge)
            .await
            .unwrap();
        let record = store.get_call(&id).await.unwrap();
        assert!(record.offer.is_some() && record.answer.is_some());

        store
            .set_call_fields(
                &id,
                CallFields::termination(TerminationSignal::now(Role::Caller)),
                WriteMode::Replace,
            )
            .await
            .unwrap();
        let record = store.get_call(&id).await.unwrap();
        assert!(record.offer.is_none());
        assert!(record.is_terminated());
    }

    #[tokio::test]
    async fn candidate_subscription_replays_existing_entries_in_order() {
        let store = MemoryStore::new();
        let id = store.create_call().await.unwrap();
        store.append_candidate(&id, CandidateBucket::Offer, cand(1)).await.unwrap();
        store.append_candidate(&id, CandidateBucket::Answer, cand(9)).await.unwrap();

        let (cb, seen) = collect_candidates();
        let sub = store
            .subscribe_candidates(&id, CandidateBucket::Offer, cb)
            .await
            .unwrap();
        store.append_candidate(&id, CandidateBucket::Offer, cand(2)).await.unwrap();
        store.append_candidate(&id, CandidateBucket::Answer, cand(8)).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![cand(1), cand(2)]);
        assert_eq!(store.active_subscriptions(), 1);

        sub.cancel();
        store.append_candidate(&id, CandidateBucket::Offer, cand(3)).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(store.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn call_subscription_sees_snapshot_updates_and_redelivery() {
        let store = MemoryStore::new();
        let id = store.create_call().await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: CallCallback = Arc::new(move |r| sink.lock().unwrap().push(r));

        let sub = store.subscribe_call(&id, cb).await.unwrap();
        store
            .set_call_fields(&id, CallFields::offer(SessionDescription::offer("o")), WriteMode::Replace)
            .await
            .unwrap();
        store.redeliver(&id);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], CallRecord::default());
        assert_eq!(seen[1], seen[2]);
        drop(sub);
        assert_eq!(store.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn injected_faults() {
        let store = MemoryStore::new();
        let id = store.create_call().await.unwrap();
        store.fail_next_writes(1);
        let write = CallFields::offer(SessionDescription::offer("o"));
        assert!(matches!(
            store.set_call_fields(&id, write.clone(), WriteMode::Merge).await,
            Err(StoreError::WriteConflict { .. })
        ));
        assert!(store.set_call_fields(&id, write, WriteMode::Merge).await.is_ok());

        store.fail_candidate_appends(true);
        assert!(store
            .append_candidate(&id, CandidateBucket::Offer, cand(1))
            .await
            .is_err());
        assert!(store.candidates(&id, CandidateBucket::Offer).is_empty());
    }
}
