//! Selected ICE path diagnostics.

use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidatePairStats {
    pub id: String,
    pub local_candidate_id: String,
    pub remote_candidate_id: String,
    pub nominated: bool,
    /// Seconds.
    pub current_round_trip_time: Option<f64>,
    /// Bits per second.
    pub available_outgoing_bitrate: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateStats {
    pub id: String,
    /// `host`, `srflx`, `prflx` or `relay`.
    pub candidate_type: String,
    /// `udp` or `tcp`.
    pub protocol: String,
}

/// The parts of a stats report needed to describe the active path.
#[derive(Debug, Clone, Default)]
pub struct IceStatsSnapshot {
    /// Explicit reference to the selected pair, when the stack reports one.
    pub selected_pair_id: Option<String>,
    pub pairs: Vec<CandidatePairStats>,
    pub candidates: HashMap<String, CandidateStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IcePathInfo {
    pub local_candidate_type: String,
    pub remote_candidate_type: String,
    pub protocol: String,
    pub round_trip_time_ms: Option<f64>,
    pub outgoing_bitrate_kbps: Option<f64>,
}

impl IcePathInfo {
    pub fn is_relayed(&self) -> bool {
        self.local_candidate_type == "relay" || self.remote_candidate_type == "relay"
    }
}

/// Finds the pair carrying media: the explicit reference first, else the nominated pair.
pub fn select_candidate_pair(snapshot: &IceStatsSnapshot) -> Option<&CandidatePairStats> {
    snapshot
        .selected_pair_id
        .as_deref()
        .and_then(|id| snapshot.pairs.iter().find(|pair| pair.id == id))
        .or_else(|| snapshot.pairs.iter().find(|pair| pair.nominated))
}

pub fn describe_ice_path(snapshot: &IceStatsSnapshot) -> Option<IcePathInfo> {
    let pair = select_candidate_pair(snapshot)?;
    let local = snapshot.candidates.get(&pair.local_candidate_id);
    let remote = snapshot.candidates.get(&pair.remote_candidate_id);
    let candidate_type = |c: Option<&CandidateStats>| {
        c.map(|c| c.candidate_type.clone())
            .unwrap_or_else(|| "unknown".to_string())
    };

    Some(IcePathInfo {
        local_candidate_type: candidate_type(local),
        remote_candidate_type: candidate_type(remote),
        protocol: local
            .map(|c| c.protocol.clone())
            .unwrap_or_else(|| "unknown".to_string()),
        round_trip_time_ms: pair.current_round_trip_time.map(|s| s * 1000.0),
        outgoing_bitrate_kbps: pair.available_outgoing_bitrate.map(|bps| bps / 1000.0),
    })
}
