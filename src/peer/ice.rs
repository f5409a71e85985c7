use tracing::{info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::peer::types::Candidate;

pub fn to_candidate(init: RTCIceCandidateInit) -> Candidate {
    Candidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

pub fn to_candidate_init(candidate: Candidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

/// Количество кандидатов по типам для одного звонка.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
    pub other: usize,
}

impl CandidateSummary {
    pub fn record(&mut self, candidate: &Candidate) {
        match candidate.kind() {
            Some("host") => self.host += 1,
            Some("srflx") => self.srflx += 1,
            Some("relay") => self.relay += 1,
            _ => self.other += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.host + self.srflx + self.relay + self.other
    }

    pub fn log(&self, label: &str) {
        info!(
            "{label} candidates: {} host, {} srflx, {} relay, {} other",
            self.host, self.srflx, self.relay, self.other
        );
        if self.total() > 0 && self.srflx == 0 && self.relay == 0 {
            warn!("{label}: only host candidates, connection through NAT may fail");
        }
    }
}

pub fn analyze_candidates(candidates: &[Candidate]) -> CandidateSummary {
    let mut summary = CandidateSummary::default();
    for candidate in candidates {
        summary.record(candidate);
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(line: &str) -> Candidate {
        Candidate {
            candidate: line.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[test]
    fn counts_candidate_types() {
        let summary = analyze_candidates(&[
            cand("candidate:1 1 udp 2122260223 10.0.0.2 5000 typ host"),
            cand("candidate:2 1 udp 1686052607 203.0.113.7 6000 typ srflx raddr 10.0.0.2 rport 5000"),
            cand("candidate:3 1 udp 41885439 198.51.100.1 7000 typ relay"),
            cand("garbage"),
        ]);
        assert_eq!(
            summary,
            CandidateSummary {
                host: 1,
                srflx: 1,
                relay: 1,
                other: 1
            }
        );
        assert_eq!(summary.total(), 4);
    }

    #[test]
    fn init_conversion_keeps_fields() {
        let c = cand("candidate:1 1 udp 1 10.0.0.2 5000 typ host");
        let back = to_candidate(to_candidate_init(c.clone()));
        assert_eq!(back, c);
    }
}
