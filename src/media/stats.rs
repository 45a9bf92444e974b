use ranchat_core::ice::{CandidatePairStats, CandidateStats, IceStatsSnapshot};
use std::collections::HashMap;
use webrtc::stats::{ICECandidateStats, StatsReport, StatsReportType};

/// Flattens a webrtc-rs stats report into the pieces path selection needs.
///
/// webrtc-rs does not surface a selected-pair reference on its transport
/// stats, so selection falls back to the nominated pair.
pub fn snapshot_from_report(report: &StatsReport) -> IceStatsSnapshot {
    let mut pairs = Vec::new();
    let mut candidates = HashMap::new();

    for stat in report.reports.values() {
        match stat {
            StatsReportType::CandidatePair(pair) => pairs.push(CandidatePairStats {
                id: pair.id.clone(),
                local_candidate_id: pair.local_candidate_id.clone(),
                remote_candidate_id: pair.remote_candidate_id.clone(),
                nominated: pair.nominated,
                current_round_trip_time: positive(pair.current_round_trip_time),
                available_outgoing_bitrate: positive(pair.available_outgoing_bitrate),
            }),
            StatsReportType::LocalCandidate(c) | StatsReportType::RemoteCandidate(c) => {
                candidates.insert(c.id.clone(), candidate(c));
            }
            _ => {}
        }
    }
    pairs.sort_by(|a, b| a.id.cmp(&b.id));

    IceStatsSnapshot {
        selected_pair_id: None,
        pairs,
        candidates,
    }
}

fn candidate(stats: &ICECandidateStats) -> CandidateStats {
    CandidateStats {
        id: stats.id.clone(),
        candidate_type: stats.candidate_type.to_string(),
        protocol: transport_protocol(&stats.network_type.to_string()),
    }
}

/// `udp4`/`tcp6` style network types to a bare protocol name.
fn transport_protocol(network_type: &str) -> String {
    network_type
        .trim_end_matches(|c: char| c.is_ascii_digit())
        .to_ascii_lowercase()
}

fn positive(value: f64) -> Option<f64> {
    (value.is_finite() && value > 0.0).then_some(value)
}
