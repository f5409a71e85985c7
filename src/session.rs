use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::task::JoinHandle;

use crate::peer::ice::CandidateSummary;
use crate::store::{CandidateBucket, Subscription};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Caller,
    Callee,
}

impl Role {
    /// Куда эта роль пишет свои кандидаты.
    pub fn local_bucket(self) -> CandidateBucket {
        match self {
            Role::Caller => CandidateBucket::Offer,
            Role::Callee => CandidateBucket::Answer,
        }
    }

    /// Откуда эта роль читает кандидаты собеседника.
    pub fn remote_bucket(self) -> CandidateBucket {
        match self {
            Role::Caller => CandidateBucket::Answer,
            Role::Callee => CandidateBucket::Offer,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Caller => "caller",
            Role::Callee => "callee",
        })
    }
}

/// Наблюдаемое состояние сессии.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    RoleBound,
    OfferSet,
    AnswerPending,
    AnswerSet,
    Connected,
    Terminated,
}

/// Прогресс звонка. Caller: RoleBound, OfferSet, AnswerPending, Connected.
/// Callee: RoleBound, AnswerSet, Connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    RoleBound,
    OfferSet,
    AnswerPending,
    AnswerSet,
    Connected,
}

/// Всё, чем владеет один звонок.
pub struct ActiveCall {
    pub call_id: String,
    pub role: Role,
    pub phase: CallPhase,
    pub remote_description_set: bool,
    pub subscriptions: Vec<Subscription>,
    pub grace_timer: Option<JoinHandle<()>>,
    pub media_connected: bool,
    pub local_candidates: CandidateSummary,
    pub remote_candidates: CandidateSummary,
}

impl ActiveCall {
    pub fn new(call_id: String, role: Role) -> Self {
        Self {
            call_id,
            role,
            phase: CallPhase::RoleBound,
            remote_description_set: false,
            subscriptions: Vec::new(),
            grace_timer: None,
            media_connected: false,
            local_candidates: CandidateSummary::default(),
            remote_candidates: CandidateSummary::default(),
        }
    }

    /// Отменяет подписки и grace-таймер. Возвращает число отменённых
    /// подписок.
    pub fn release(&mut self) -> usize {
        let count = self.subscriptions.len();
        for sub in self.subscriptions.drain(..) {
            sub.cancel();
        }
        if let Some(timer) = self.grace_timer.take() {
            timer.abort();
        }
        count
    }
}

/// Единственная сессия участника. Заменяется целиком при каждом переходе,
/// роль, запись и подписки меняются вместе.
#[derive(Default)]
pub enum Session {
    #[default]
    Idle,
    Active(ActiveCall),
}

impl Session {
    pub fn state(&self) -> SessionState {
        match self {
            Session::Idle => SessionState::Idle,
            Session::Active(call) => match call.phase {
                CallPhase::RoleBound => SessionState::RoleBound,
                CallPhase::OfferSet => SessionState::OfferSet,
                CallPhase::AnswerPending => SessionState::AnswerPending,
                CallPhase::AnswerSet => SessionState::AnswerSet,
                CallPhase::Connected => SessionState::Connected,
            },
        }
    }

    pub fn active(&self) -> Option<&ActiveCall> {
        match self {
            Session::Active(call) => Some(call),
            Session::Idle => None,
        }
    }

    pub fn active_mut(&mut self) -> Option<&mut ActiveCall> {
        match self {
            Session::Active(call) => Some(call),
            Session::Idle => None,
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        self.active().map(|c| c.call_id.as_str())
    }

    pub fn role(&self) -> Option<Role> {
        self.active().map(|c| c.role)
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Session::Idle)
    }
}
