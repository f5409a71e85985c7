//! Два участника в одном процессе с общим [`MemoryStore`].
//!
//! Полный цикл start / join / hang-up на настоящих webrtc endpoint. Медиа
//! соединение не гарантируется: без сети ICE может не подключиться, это
//! логируется, но запуск не падает.

use anyhow::{bail, Context};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

use crate::config::CallConfig;
use crate::controller::CallController;
use crate::events::{CallEvent, EndReason};
use crate::peer::ice::analyze_candidates;
use crate::peer::{MediaConnectionState, RtcEndpointFactory};
use crate::store::{CandidateBucket, MemoryStore};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const HANGUP_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run_loopback(config: &CallConfig) -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let factory = Arc::new(RtcEndpointFactory::from_config(config));

    let caller = CallController::launch(config, store.clone(), factory.clone())
        .await
        .context("caller setup")?;
    let callee = CallController::launch(config, store.clone(), factory)
        .await
        .context("callee setup")?;
    let mut caller_events = caller.subscribe();
    let mut callee_events = callee.subscribe();

    let call_id = caller.start().await.context("start call")?;
    info!("Caller published offer for {call_id}");
    callee.join(&call_id).await.context("join call")?;
    info!("Callee answered {call_id}");

    let connected = |e: &CallEvent| {
        matches!(e, CallEvent::MediaConnection(MediaConnectionState::Connected))
    };
    let (a, b) = tokio::join!(
        wait_for(&mut caller_events, CONNECT_TIMEOUT, connected),
        wait_for(&mut callee_events, CONNECT_TIMEOUT, connected),
    );
    if a.is_some() && b.is_some() {
        info!("Media connected on both sides");
    } else {
        warn!("Media did not connect within {CONNECT_TIMEOUT:?}, continuing with hang-up");
    }
    for bucket in [CandidateBucket::Offer, CandidateBucket::Answer] {
        analyze_candidates(&store.candidates(&call_id, bucket)).log(bucket.collection_name());
    }

    caller.end().await.context("hang up")?;
    let ended = wait_for(&mut callee_events, HANGUP_TIMEOUT, |e| {
        matches!(
            e,
            CallEvent::CallEnded {
                reason: EndReason::RemoteHangup,
                ..
            }
        )
    })
    .await;
    if ended.is_none() {
        bail!("callee never saw the hang-up for {call_id}");
    }
    info!(
        "Callee observed remote hang-up; {} call record(s) in store",
        store.call_count()
    );

    caller.shutdown().await?;
    callee.shutdown().await?;
    Ok(())
}

/// Ждёт первое событие, подходящее под `pred`, пропуская lag.
pub async fn wait_for(
    rx: &mut broadcast::Receiver<CallEvent>,
    timeout: Duration,
    pred: impl Fn(&CallEvent) -> bool,
) -> Option<CallEvent> {
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("Skipped {n} call events"),
                Err(RecvError::Closed) => return None,
            }
        }
    };
    tokio::time::timeout(timeout, wait).await.ok().flatten()
}
