pub mod connection;
pub mod ice;
pub mod types;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::MediaError;

pub use connection::{RtcEndpoint, RtcEndpointFactory};
pub use types::{
    Candidate, EndpointEvent, MediaConnectionState, RemoteStream, RemoteTrack, SdpType,
    SessionDescription,
};

/// Колбэк, в который endpoint отдаёт события.
pub type EndpointEventSink = Arc<dyn Fn(EndpointEvent) + Send + Sync>;

/// Локальное медиа и транспорт до собеседника для одного звонка.
///
/// Endpoint сам буферизует удалённые кандидаты, пришедшие до remote
/// description.
#[async_trait]
pub trait MediaEndpoint: Send + Sync {
    /// Добавляет локальные audio/video треки. Ошибка не фатальна.
    async fn attach_local_tracks(&self) -> Result<(), MediaError>;

    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError>;

    async fn add_remote_candidate(&self, candidate: Candidate) -> Result<(), MediaError>;

    /// Останавливает локальные треки и освобождает транспорт.
    async fn close(&self) -> Result<(), MediaError>;
}

/// Новый endpoint на каждую сессию.
#[async_trait]
pub trait EndpointFactory: Send + Sync {
    async fn create(&self, events: EndpointEventSink) -> Result<Arc<dyn MediaEndpoint>, MediaError>;
}
