use tracing::{debug, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::SignalingFailure;
use crate::peer::Candidate;

/// Устанавливает fmt subscriber. `RUST_LOG` важнее `default_filter`.
/// Повторные вызовы игнорируются.
pub fn init_logging(default_filter: &str) {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}

/// Trickle-дамп одного кандидата.
pub fn dump_candidate(label: &str, cand: &Candidate) {
    debug!(
        "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?} username_fragment={:?}",
        cand.candidate, cand.sdp_mid, cand.sdp_mline_index, cand.username_fragment
    );
}

/// Сюда попадают ошибки, которые только логируются.
pub fn report(failure: &SignalingFailure) {
    warn!(kind = failure.kind(), "{failure}");
}
