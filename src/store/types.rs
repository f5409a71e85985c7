use serde::{Deserialize, Serialize};
use std::fmt;

use crate::peer::SessionDescription;
use crate::session::Role;

/// Коллекция с документами звонков.
pub const CALLS_COLLECTION: &str = "calls";

/// Метка, которую пишет сторона, положившая трубку первой.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TerminationSignal {
    pub by: Role,
    /// Unix миллисекунды.
    pub at: i64,
}

impl TerminationSignal {
    pub fn now(by: Role) -> Self {
        Self {
            by,
            at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Документ звонка.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_signal: Option<TerminationSignal>,
}

impl CallRecord {
    pub fn is_terminated(&self) -> bool {
        self.termination_signal.is_some()
    }
}

/// Частичный документ для записи. Поля `None` при merge не трогаются.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallFields {
    pub offer: Option<SessionDescription>,
    pub answer: Option<SessionDescription>,
    pub termination_signal: Option<TerminationSignal>,
}

impl CallFields {
    pub fn offer(desc: SessionDescription) -> Self {
        Self {
            offer: Some(desc),
            ..Default::default()
        }
    }

    pub fn answer(desc: SessionDescription) -> Self {
        Self {
            answer: Some(desc),
            ..Default::default()
        }
    }

    pub fn termination(signal: TerminationSignal) -> Self {
        Self {
            termination_signal: Some(signal),
            ..Default::default()
        }
    }

    /// Имена полей в этой записи, для логов.
    pub fn names(&self) -> &'static str {
        match (
            self.offer.is_some(),
            self.answer.is_some(),
            self.termination_signal.is_some(),
        ) {
            (true, false, false) => "offer",
            (false, true, false) => "answer",
            (false, false, true) => "terminationSignal",
            (false, false, false) => "nothing",
            _ => "several fields",
        }
    }

    pub fn merge_into(self, record: &mut CallRecord) {
        if let Some(offer) = self.offer {
            record.offer = Some(offer);
        }
        if let Some(answer) = self.answer {
            record.answer = Some(answer);
        }
        if let Some(signal) = self.termination_signal {
            record.termination_signal = Some(signal);
        }
    }

    pub fn into_record(self) -> CallRecord {
        CallRecord {
            offer: self.offer,
            answer: self.answer,
            termination_signal: self.termination_signal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Меняются только указанные поля.
    Merge,
    /// Документ перезаписывается целиком.
    Replace,
}

/// Подколлекция кандидатов записи звонка.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateBucket {
    #[serde(rename = "offerCandidates")]
    Offer,
    #[serde(rename = "answerCandidates")]
    Answer,
}

impl CandidateBucket {
    pub fn collection_name(self) -> &'static str {
        match self {
            CandidateBucket::Offer => "offerCandidates",
            CandidateBucket::Answer => "answerCandidates",
        }
    }
}

impl fmt::Display for CandidateBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.collection_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_untouched_fields() {
        let mut record = CallFields::offer(SessionDescription::offer("o")).into_record();
        CallFields::answer(SessionDescription::answer("a")).merge_into(&mut record);
        CallFields::termination(TerminationSignal::now(Role::Callee)).merge_into(&mut record);

        assert_eq!(record.offer, Some(SessionDescription::offer("o")));
        assert_eq!(record.answer, Some(SessionDescription::answer("a")));
        assert!(record.is_terminated());
    }

    #[test]
    fn record_serializes_like_the_document() {
        let record = CallFields::offer(SessionDescription::offer("v=0")).into_record();
        let json = serde_json::to_value(&record).expect("serializes");
        assert_eq!(json["offer"]["type"], "offer");
        assert!(json.get("answer").is_none());
        assert!(json.get("terminationSignal").is_none());
    }
}
