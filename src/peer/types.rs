use serde::{Deserialize, Serialize};
use std::fmt;

/// Offer или answer.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description в том виде, как лежит в записи звонка: `{type, sdp}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub r#type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            r#type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            r#type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE кандидат в JSON форме.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    pub username_fragment: Option<String>,
}

impl Candidate {
    /// Тип из атрибута `typ`: `host`, `srflx`, `prflx` или `relay`.
    pub fn kind(&self) -> Option<&str> {
        let mut parts = self.candidate.split_whitespace();
        while let Some(part) = parts.next() {
            if part == "typ" {
                return parts.next();
            }
        }
        None
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: String,
    pub stream_id: String,
}

/// Удалённые треки, собранные в один поток.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteStream {
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    /// Добавляет трек без дублей. true для первого трека.
    pub fn add_track(&mut self, track: RemoteTrack) -> bool {
        if self.tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        self.tracks.push(track);
        self.tracks.len() == 1
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for MediaConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MediaConnectionState::New => "new",
            MediaConnectionState::Connecting => "connecting",
            MediaConnectionState::Connected => "connected",
            MediaConnectionState::Disconnected => "disconnected",
            MediaConnectionState::Failed => "failed",
            MediaConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Всё, что endpoint сообщает сам.
#[derive(Debug, Clone, PartialEq)]
pub enum EndpointEvent {
    LocalCandidate(Candidate),
    RemoteTrack(RemoteTrack),
    ConnectionState(MediaConnectionState),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_json_matches_browser_shape() {
        let json = r#"{"candidate":"candidate:1 1 udp 2122260223 192.168.1.4 54321 typ host",
                       "sdpMid":"0","sdpMLineIndex":0,"usernameFragment":null}"#;
        let cand: Candidate = serde_json::from_str(json).expect("valid candidate");
        assert_eq!(cand.sdp_mid.as_deref(), Some("0"));
        assert_eq!(cand.sdp_mline_index, Some(0));
        assert_eq!(cand.kind(), Some("host"));
    }

    #[test]
    fn description_serializes_type_field() {
        let value = serde_json::to_value(SessionDescription::offer("v=0")).expect("serializes");
        assert_eq!(value["type"], "offer");
        assert_eq!(value["sdp"], "v=0");
    }

    #[test]
    fn remote_stream_reports_first_track_once() {
        let mut stream = RemoteStream::default();
        let audio = RemoteTrack {
            id: "a".into(),
            kind: "audio".into(),
            stream_id: "s".into(),
        };
        let video = RemoteTrack {
            id: "v".into(),
            kind: "video".into(),
            stream_id: "s".into(),
        };
        assert!(stream.add_track(audio.clone()));
        assert!(!stream.add_track(audio));
        assert!(!stream.add_track(video));
        assert_eq!(stream.tracks.len(), 2);
        stream.clear();
        assert!(stream.is_empty());
    }
}
