//! Connectivity diagnostics
//!
//! [`ConnectivityDiagnostics`] watches the transports of negotiation sessions
//! without influencing them. Per transport it reports gathered candidates,
//! connectivity changes, the candidate pair that ended up carrying media and a
//! periodic quality sample while the path is up.
//!
//! Bookkeeping lives in a side table keyed by [`TransportId`]; the transports
//! themselves are never touched beyond subscribing and querying stats.

pub mod candidate;
pub mod stats;

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PhoneConfig;
use crate::events::{EventEmitter, PhoneEvent};
use crate::transport::{
    IceConnectionState, PeerConnectionState, PeerTransport, TransportEvent, TransportId,
};

pub use candidate::{CandidateRecord, CandidateType};
pub use stats::{QualitySample, SelectedPairStats, StatsSnapshot};

/// One diagnostics record, always tagged with the label given at bind time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "diagnostic", rename_all = "snake_case")]
pub enum DiagnosticEvent {
    Candidate {
        label: String,
        record: CandidateRecord,
    },
    GatheringComplete {
        label: String,
    },
    CandidateError {
        label: String,
        code: u16,
        text: String,
    },
    IceStateChanged {
        label: String,
        state: IceConnectionState,
    },
    ConnectionStateChanged {
        label: String,
        state: PeerConnectionState,
    },
    TrackArrived {
        label: String,
        kind: String,
        stream_id: Option<String>,
    },
    SelectedPair {
        label: String,
        pair: SelectedPairStats,
    },
    QualitySample {
        label: String,
        sample: QualitySample,
    },
    SamplerStarted {
        label: String,
    },
    SamplerStopped {
        label: String,
    },
    /// A stats query failed; never fatal
    QueryFailed {
        label: String,
        operation: String,
        reason: String,
    },
}

impl DiagnosticEvent {
    pub fn label(&self) -> &str {
        match self {
            Self::Candidate { label, .. }
            | Self::GatheringComplete { label }
            | Self::CandidateError { label, .. }
            | Self::IceStateChanged { label, .. }
            | Self::ConnectionStateChanged { label, .. }
            | Self::TrackArrived { label, .. }
            | Self::SelectedPair { label, .. }
            | Self::QualitySample { label, .. }
            | Self::SamplerStarted { label }
            | Self::SamplerStopped { label }
            | Self::QueryFailed { label, .. } => label,
        }
    }
}

impl fmt::Display for DiagnosticEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] ", self.label())?;
        match self {
            Self::Candidate { record, .. } => write!(f, "{record}"),
            Self::GatheringComplete { .. } => f.write_str("candidate gathering complete"),
            Self::CandidateError { code, text, .. } => write!(f, "candidate error {code} {text}"),
            Self::IceStateChanged { state, .. } => write!(f, "ice={state}"),
            Self::ConnectionStateChanged { state, .. } => write!(f, "conn={state}"),
            Self::TrackArrived {
                kind, stream_id, ..
            } => write!(
                f,
                "track {kind} stream={}",
                stream_id.as_deref().unwrap_or("none")
            ),
            Self::SelectedPair { pair, .. } => write!(f, "{pair}"),
            Self::QualitySample { sample, .. } => write!(f, "{sample}"),
            Self::SamplerStarted { .. } => f.write_str("stats sampler started"),
            Self::SamplerStopped { .. } => f.write_str("stats sampler stopped"),
            Self::QueryFailed {
                operation, reason, ..
            } => write!(f, "{operation} failed: {reason}"),
        }
    }
}

/// Floor for the sampling period; a zero period cannot drive a timer
const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

struct Binding {
    label: String,
    transport: Arc<dyn PeerTransport>,
    listener: JoinHandle<()>,
    sampler: Option<JoinHandle<()>>,
}

struct Inner {
    bindings: DashMap<TransportId, Binding>,
    events: EventEmitter,
    interval: Duration,
    preview_len: usize,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for entry in self.bindings.iter_mut() {
            entry.listener.abort();
            if let Some(sampler) = &entry.sampler {
                sampler.abort();
            }
        }
    }
}

/// Observer of transport connectivity, shared by every call
#[derive(Clone)]
pub struct ConnectivityDiagnostics {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectivityDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectivityDiagnostics")
            .field("bound", &self.inner.bindings.len())
            .field("interval", &self.inner.interval)
            .finish()
    }
}

impl ConnectivityDiagnostics {
    pub fn new(config: &PhoneConfig, events: EventEmitter) -> Self {
        Self {
            inner: Arc::new(Inner {
                bindings: DashMap::new(),
                events,
                interval: config.stats_interval.max(MIN_SAMPLE_INTERVAL),
                preview_len: config.candidate_preview_len,
            }),
        }
    }

    /// Start observing a transport
    ///
    /// Returns `false` without doing anything when the transport is already
    /// bound.
    pub fn bind(&self, transport: Arc<dyn PeerTransport>, label: impl Into<String>) -> bool {
        let id = transport.id();
        let label = label.into();

        let entry = match self.inner.bindings.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                debug!(%id, label = %label, "transport already bound");
                return false;
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => entry,
        };

        // Subscribe before the task exists so no early event is missed
        let rx = transport.events();
        let listener = tokio::spawn(listen(
            Arc::downgrade(&self.inner),
            id,
            label.clone(),
            transport.clone(),
            rx,
        ));
        entry.insert(Binding {
            label: label.clone(),
            transport,
            listener,
            sampler: None,
        });

        info!(%id, label = %label, "diagnostics bound");
        true
    }

    /// Stop observing a transport, releasing its listener and sampler
    pub fn unbind(&self, id: TransportId) -> bool {
        let Some((_, binding)) = self.inner.bindings.remove(&id) else {
            return false;
        };
        binding.listener.abort();
        if let Some(sampler) = binding.sampler {
            sampler.abort();
            self.inner.emit(DiagnosticEvent::SamplerStopped {
                label: binding.label.clone(),
            });
        }
        debug!(%id, label = %binding.label, "diagnostics unbound");
        true
    }

    pub fn is_bound(&self, id: TransportId) -> bool {
        self.inner.bindings.contains_key(&id)
    }

    pub fn bound_count(&self) -> usize {
        self.inner.bindings.len()
    }

    pub fn sampler_running(&self, id: TransportId) -> bool {
        self.inner
            .bindings
            .get(&id)
            .is_some_and(|b| b.sampler.is_some())
    }
}

async fn listen(
    inner: Weak<Inner>,
    id: TransportId,
    label: String,
    transport: Arc<dyn PeerTransport>,
    mut rx: broadcast::Receiver<TransportEvent>,
) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(label = %label, skipped, "diagnostics listener lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_event(id, &label, &transport, event);
    }
    debug!(label = %label, "diagnostics listener finished");
}

impl Inner {
    fn emit(&self, event: DiagnosticEvent) {
        debug!(target: "webphone::diagnostics", "{event}");
        self.events.emit(PhoneEvent::Diagnostic(event));
    }

    fn handle_event(
        self: &Arc<Self>,
        id: TransportId,
        label: &str,
        transport: &Arc<dyn PeerTransport>,
        event: TransportEvent,
    ) {
        let label = label.to_string();
        match event {
            TransportEvent::CandidateGenerated { candidate } => {
                let record = CandidateRecord::parse(&candidate, self.preview_len);
                self.emit(DiagnosticEvent::Candidate { label, record });
            }
            TransportEvent::CandidateGatheringComplete => {
                self.emit(DiagnosticEvent::GatheringComplete { label });
            }
            TransportEvent::CandidateError { code, text } => {
                warn!(label = %label, code, text = %text, "ice candidate error");
                self.emit(DiagnosticEvent::CandidateError { label, code, text });
            }
            TransportEvent::IceConnectionStateChanged(state) => {
                self.emit(DiagnosticEvent::IceStateChanged {
                    label: label.clone(),
                    state,
                });
                if state.is_connected() {
                    self.query_selected_pair(label, transport.clone());
                    self.start_sampler(id);
                } else if state.is_down() {
                    self.stop_sampler(id);
                }
            }
            TransportEvent::ConnectionStateChanged(state) => {
                self.emit(DiagnosticEvent::ConnectionStateChanged {
                    label: label.clone(),
                    state,
                });
                if state.is_connected() {
                    self.query_selected_pair(label, transport.clone());
                    self.start_sampler(id);
                } else if state.is_down() {
                    self.stop_sampler(id);
                }
            }
            TransportEvent::TrackArrived { kind, stream } => {
                self.emit(DiagnosticEvent::TrackArrived {
                    label,
                    kind,
                    stream_id: stream.map(|s| s.id().to_string()),
                });
            }
        }
    }

    fn query_selected_pair(&self, label: String, transport: Arc<dyn PeerTransport>) {
        let events = self.events.clone();
        tokio::spawn(async move {
            let event = match transport.stats().await {
                Ok(snapshot) => match snapshot.selected_pair_stats() {
                    Some(pair) => DiagnosticEvent::SelectedPair { label, pair },
                    None => {
                        debug!(label = %label, "no selected candidate pair yet");
                        return;
                    }
                },
                Err(e) => {
                    warn!(label = %label, error = %e, "selected pair query failed");
                    DiagnosticEvent::QueryFailed {
                        label,
                        operation: "selected-pair".to_string(),
                        reason: e.to_string(),
                    }
                }
            };
            debug!(target: "webphone::diagnostics", "{event}");
            events.emit(PhoneEvent::Diagnostic(event));
        });
    }

    fn start_sampler(&self, id: TransportId) -> bool {
        let Some(mut binding) = self.bindings.get_mut(&id) else {
            return false;
        };
        if binding.sampler.is_some() {
            return false;
        }

        let label = binding.label.clone();
        let transport = binding.transport.clone();
        let events = self.events.clone();
        let period = self.interval;
        binding.sampler = Some(tokio::spawn(sample(label.clone(), transport, events, period)));
        drop(binding);

        info!(label = %label, ?period, "stats sampler started");
        self.emit(DiagnosticEvent::SamplerStarted { label });
        true
    }

    fn stop_sampler(&self, id: TransportId) -> bool {
        let (label, sampler) = match self.bindings.get_mut(&id) {
            Some(mut binding) => (binding.label.clone(), binding.sampler.take()),
            None => return false,
        };
        let Some(sampler) = sampler else {
            return false;
        };
        sampler.abort();
        info!(label = %label, "stats sampler stopped");
        self.emit(DiagnosticEvent::SamplerStopped { label });
        true
    }
}

async fn sample(
    label: String,
    transport: Arc<dyn PeerTransport>,
    events: EventEmitter,
    period: Duration,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        ticker.tick().await;
        if transport.connection_state() == PeerConnectionState::Closed {
            continue;
        }
        let event = match transport.stats().await {
            Ok(snapshot) => DiagnosticEvent::QualitySample {
                label: label.clone(),
                sample: snapshot.quality_sample(),
            },
            Err(e) => DiagnosticEvent::QueryFailed {
                label: label.clone(),
                operation: "stats-sample".to_string(),
                reason: e.to_string(),
            },
        };
        debug!(target: "webphone::diagnostics", "{event}");
        events.emit(PhoneEvent::Diagnostic(event));
    }
}
