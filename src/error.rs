use thiserror::Error;

/// Ошибки адаптера document store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Call record not found: {call_id}")]
    NotFound { call_id: String },

    #[error("Write conflict: {reason}")]
    WriteConflict { reason: String },

    #[error("Store unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Ошибки media endpoint.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MediaError {
    #[error("Local media unavailable: {reason}")]
    AccessDenied { reason: String },

    #[error("Session description negotiation failed: {reason}")]
    Negotiation { reason: String },

    #[error("Candidate rejected: {reason}")]
    Candidate { reason: String },

    #[error("Endpoint closed")]
    Closed,
}

/// Ошибки для слоя представления.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    #[error("No offer found for call {call_id}")]
    NotFound { call_id: String },

    #[error("Call identifier must not be empty")]
    EmptyCallId,

    #[error("Call {call_id} is still active")]
    SessionBusy { call_id: String },

    #[error("Call {call_id} was already answered")]
    AlreadyAnswered { call_id: String },

    #[error("Call {call_id} has ended")]
    CallEnded { call_id: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Call controller stopped")]
    ControllerStopped,
}

/// Нефатальные сбои: логируются и рассылаются, наверх не пробрасываются.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SignalingFailure {
    #[error("Transient signaling failure: {reason}")]
    TransientSignaling { reason: String },

    #[error("Local media access denied: {reason}")]
    MediaAccessDenied { reason: String },

    #[error("Write of {field} failed after {attempts} attempt(s): {reason}")]
    WriteConflict {
        field: &'static str,
        attempts: u32,
        reason: String,
    },
}

impl SignalingFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingFailure::TransientSignaling { .. } => "transient_signaling",
            SignalingFailure::MediaAccessDenied { .. } => "media_access_denied",
            SignalingFailure::WriteConflict { .. } => "write_conflict",
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Failed to parse config: {reason}")]
    Parse { reason: String },

    #[error("Configuration invalid: {reason}")]
    Invalid { reason: String },
}
