use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::CallConfig;
use crate::coordinator::{CallCoordinator, Signal};
use crate::error::CallError;
use crate::events::{CallEvent, EventEmitter};
use crate::peer::EndpointFactory;
use crate::session::SessionState;
use crate::store::DocumentStore;

const COMMAND_CAPACITY: usize = 16;

enum Command {
    Start(oneshot::Sender<Result<String, CallError>>),
    Join(String, oneshot::Sender<Result<(), CallError>>),
    EnterCallId(String, oneshot::Sender<Result<(), CallError>>),
    End(oneshot::Sender<()>),
    State(oneshot::Sender<SessionState>),
    Shutdown(oneshot::Sender<()>),
}

/// Start / join / end для слоя представления.
///
/// Владеет одним [`CallCoordinator`] в отдельной задаче, команды и
/// уведомления store обрабатываются по одному. Drop контроллера
/// останавливает координатор и освобождает media endpoint.
pub struct CallController {
    commands: mpsc::Sender<Command>,
    events: EventEmitter,
    task: JoinHandle<()>,
}

impl CallController {
    /// Создаёт первый media endpoint и запускает задачу координатора.
    pub async fn launch(
        config: &CallConfig,
        store: Arc<dyn DocumentStore>,
        factory: Arc<dyn EndpointFactory>,
    ) -> Result<Self, CallError> {
        let events = EventEmitter::new();
        let (coordinator, inbox) =
            CallCoordinator::new(config, store, factory, events.clone()).await?;
        let (commands, rx) = mpsc::channel(COMMAND_CAPACITY);
        let task = tokio::spawn(run(coordinator, rx, inbox));
        Ok(Self {
            commands,
            events,
            task,
        })
    }

    /// Новый звонок в роли caller, возвращает его идентификатор.
    pub async fn start(&self) -> Result<String, CallError> {
        self.request(Command::Start).await?
    }

    /// Подключение к существующему звонку в роли callee.
    pub async fn join(&self, call_id: &str) -> Result<(), CallError> {
        let call_id = call_id.to_owned();
        self.request(|reply| Command::Join(call_id, reply)).await?
    }

    /// Идентификатор, который пользователь вводит перед `join`.
    pub async fn enter_call_id(&self, call_id: &str) -> Result<(), CallError> {
        let call_id = call_id.to_owned();
        self.request(|reply| Command::EnterCallId(call_id, reply))
            .await?
    }

    /// Кладёт трубку (если есть звонок) и очищает идентификатор.
    pub async fn end(&self) -> Result<(), CallError> {
        self.request(Command::End).await
    }

    pub async fn state(&self) -> Result<SessionState, CallError> {
        self.request(Command::State).await
    }

    /// Пустая строка в Idle.
    pub fn current_call_id(&self) -> String {
        self.events.call_id()
    }

    pub fn watch_call_id(&self) -> watch::Receiver<String> {
        self.events.watch_call_id()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Завершает звонок, освобождает endpoint и дожидается задачи.
    pub async fn shutdown(self) -> Result<(), CallError> {
        let result = self.request(Command::Shutdown).await;
        let _ = self.task.await;
        result
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| CallError::ControllerStopped)?;
        rx.await.map_err(|_| CallError::ControllerStopped)
    }
}

async fn run(
    mut coordinator: CallCoordinator,
    mut commands: mpsc::Receiver<Command>,
    mut inbox: mpsc::UnboundedReceiver<Signal>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    info!("Call controller dropped");
                    coordinator.shutdown().await;
                    return;
                };
                match command {
                    Command::Start(reply) => {
                        let _ = reply.send(coordinator.start_call().await);
                    }
                    Command::Join(call_id, reply) => {
                        let _ = reply.send(coordinator.join_call(&call_id).await);
                    }
                    Command::EnterCallId(call_id, reply) => {
                        let _ = reply.send(coordinator.enter_call_id(&call_id));
                    }
                    Command::End(reply) => {
                        coordinator.hang_up().await;
                        let _ = reply.send(());
                    }
                    Command::State(reply) => {
                        let _ = reply.send(coordinator.state());
                    }
                    Command::Shutdown(reply) => {
                        coordinator.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                }
            }
            Some(signal) = inbox.recv() => coordinator.handle_signal(signal).await,
        }
    }
}
