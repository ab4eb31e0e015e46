//! Transport statistics snapshot model
//!
//! A [`StatsSnapshot`] is an ordered list of typed reports, the shape a
//! peer-connection statistics query returns. Two views are derived from it:
//! the selected candidate pair ([`SelectedPairStats`]) and an aggregate of the
//! audio RTP counters ([`QualitySample`]).

use std::fmt;

use serde::{Deserialize, Serialize};

/// One `candidate-pair` report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CandidatePairStats {
    pub id: String,
    /// `frozen`, `waiting`, `in-progress`, `succeeded` or `failed`
    pub state: Option<String>,
    pub local_candidate_id: Option<String>,
    pub remote_candidate_id: Option<String>,
    /// Only some stacks report this flag
    pub selected: Option<bool>,
    pub nominated: bool,
    pub writable: bool,
    /// Seconds
    pub current_round_trip_time: Option<f64>,
}

/// One `transport` report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportStats {
    pub id: String,
    pub selected_candidate_pair_id: Option<String>,
}

/// One `local-candidate` or `remote-candidate` report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CandidateStats {
    pub id: String,
    pub candidate_type: Option<String>,
    #[serde(alias = "ip")]
    pub address: Option<String>,
    pub port: Option<u16>,
}

/// One `outbound-rtp` report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundRtpStats {
    pub id: String,
    /// `audio` or `video`
    pub kind: String,
    pub bytes_sent: u64,
}

/// One `inbound-rtp` report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InboundRtpStats {
    pub id: String,
    pub kind: String,
    pub bytes_received: u64,
    pub packets_lost: i64,
    /// Seconds
    pub jitter: Option<f64>,
}

/// A typed statistics report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StatsReport {
    CandidatePair(CandidatePairStats),
    Transport(TransportStats),
    LocalCandidate(CandidateStats),
    RemoteCandidate(CandidateStats),
    OutboundRtp(OutboundRtpStats),
    InboundRtp(InboundRtpStats),
}

impl StatsReport {
    pub fn id(&self) -> &str {
        match self {
            Self::CandidatePair(r) => &r.id,
            Self::Transport(r) => &r.id,
            Self::LocalCandidate(r) | Self::RemoteCandidate(r) => &r.id,
            Self::OutboundRtp(r) => &r.id,
            Self::InboundRtp(r) => &r.id,
        }
    }
}

/// The result of one statistics query, in provider order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSnapshot {
    pub reports: Vec<StatsReport>,
}

impl StatsSnapshot {
    pub fn new(reports: Vec<StatsReport>) -> Self {
        Self { reports }
    }

    /// Look a report up by id
    pub fn get(&self, id: &str) -> Option<&StatsReport> {
        self.reports.iter().find(|r| r.id() == id)
    }

    fn pairs(&self) -> impl Iterator<Item = &CandidatePairStats> {
        self.reports.iter().filter_map(|r| match r {
            StatsReport::CandidatePair(pair) => Some(pair),
            _ => None,
        })
    }

    fn pair(&self, id: &str) -> Option<&CandidatePairStats> {
        self.pairs().find(|p| p.id == id)
    }

    fn candidate(&self, id: Option<&str>) -> Option<&CandidateStats> {
        match self.get(id?)? {
            StatsReport::LocalCandidate(c) | StatsReport::RemoteCandidate(c) => Some(c),
            _ => None,
        }
    }

    /// Resolve the candidate pair carrying media
    ///
    /// Priority: the pair a transport report points at, then a pair flagged
    /// `selected`, then the last `succeeded` pair that is nominated or
    /// writable.
    pub fn selected_pair(&self) -> Option<&CandidatePairStats> {
        let by_transport = self.reports.iter().find_map(|r| match r {
            StatsReport::Transport(t) => t
                .selected_candidate_pair_id
                .as_deref()
                .and_then(|id| self.pair(id)),
            _ => None,
        });
        by_transport
            .or_else(|| self.pairs().find(|p| p.selected == Some(true)))
            .or_else(|| {
                self.pairs()
                    .filter(|p| {
                        p.state.as_deref() == Some("succeeded") && (p.nominated || p.writable)
                    })
                    .last()
            })
    }

    /// The selected pair with its endpoints looked up
    pub fn selected_pair_stats(&self) -> Option<SelectedPairStats> {
        let pair = self.selected_pair()?;
        Some(SelectedPairStats {
            pair_id: pair.id.clone(),
            pair_state: pair.state.clone(),
            local: self
                .candidate(pair.local_candidate_id.as_deref())
                .map(CandidateEndpoint::from),
            remote: self
                .candidate(pair.remote_candidate_id.as_deref())
                .map(CandidateEndpoint::from),
        })
    }

    /// Aggregate the audio RTP counters of this snapshot
    pub fn quality_sample(&self) -> QualitySample {
        let mut sample = QualitySample::default();
        for report in &self.reports {
            match report {
                StatsReport::OutboundRtp(r) if r.kind == "audio" => {
                    sample.bytes_sent += r.bytes_sent;
                }
                StatsReport::InboundRtp(r) if r.kind == "audio" => {
                    sample.bytes_received += r.bytes_received;
                    sample.packets_lost += r.packets_lost;
                    if r.jitter.is_some() {
                        sample.jitter = r.jitter;
                    }
                }
                StatsReport::CandidatePair(p) if p.selected == Some(true) || p.nominated => {
                    if p.current_round_trip_time.is_some() {
                        sample.round_trip_time = p.current_round_trip_time;
                    }
                }
                _ => {}
            }
        }
        sample
    }
}

/// One end of the selected pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateEndpoint {
    pub candidate_type: Option<String>,
    pub address: Option<String>,
    pub port: Option<u16>,
}

impl From<&CandidateStats> for CandidateEndpoint {
    fn from(c: &CandidateStats) -> Self {
        Self {
            candidate_type: c.candidate_type.clone(),
            address: c.address.clone(),
            port: c.port,
        }
    }
}

impl fmt::Display for CandidateEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:",
            self.candidate_type.as_deref().unwrap_or("?"),
            self.address.as_deref().unwrap_or("?"),
        )?;
        match self.port {
            Some(port) => write!(f, "{port}"),
            None => f.write_str("?"),
        }
    }
}

/// The resolved network path of a connected transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedPairStats {
    pub pair_id: String,
    pub pair_state: Option<String>,
    pub local: Option<CandidateEndpoint>,
    pub remote: Option<CandidateEndpoint>,
}

impl fmt::Display for SelectedPairStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let endpoint = |e: &Option<CandidateEndpoint>| {
            e.as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "unknown".to_string())
        };
        write!(
            f,
            "selected-pair {} local={} remote={}",
            self.pair_state.as_deref().unwrap_or("?"),
            endpoint(&self.local),
            endpoint(&self.remote),
        )
    }
}

/// Live audio transport quality at one sampling tick
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualitySample {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_lost: i64,
    /// Latest inbound jitter, seconds
    pub jitter: Option<f64>,
    /// Round-trip time of the selected/nominated pair, seconds
    pub round_trip_time: Option<f64>,
}

impl fmt::Display for QualitySample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = |v: Option<f64>| v.map(|v| format!("{v:.4}")).unwrap_or_else(|| "?".into());
        write!(
            f,
            "rtp sent={} recv={} lost={} jitter={} rtt={}",
            self.bytes_sent,
            self.bytes_received,
            self.packets_lost,
            secs(self.jitter),
            secs(self.round_trip_time),
        )
    }
}
