pub mod config;
pub mod controller;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod logger;
pub mod loopback;
pub mod peer;
pub mod session;
pub mod store;
pub mod utils;

pub use config::CallConfig;
pub use controller::CallController;
pub use coordinator::{CallCoordinator, Signal};
pub use error::{CallError, MediaError, SignalingFailure, StoreError};
pub use events::{CallEvent, EndReason, EventEmitter};
pub use session::{Role, SessionState};
pub use store::{DocumentStore, MemoryStore};

use anyhow::Context;

/// Конфиг, логирование и loopback звонок.
pub fn run() -> anyhow::Result<()> {
    let config = CallConfig::from_env()?;
    logger::init_logging(&config.log_filter);

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    runtime.block_on(loopback::run_loopback(&config))
}
