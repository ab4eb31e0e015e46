//! Registration lifecycle
//!
//! ```text
//! Idle -> Starting -> Connecting -> Registering -> Registered | RegisterFailed
//! Registered -> Unregistering -> Idle
//! RegisterFailed -> Idle
//! any -> Idle (stop)
//! ```
//!
//! Every move goes through [`RegistrationState::next`]. A failed registration
//! stays failed until the caller starts again; nothing here retries.

use std::fmt;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::call::CallController;
use crate::config::{Credentials, normalize_server};
use crate::context::AppSessionContext;
use crate::error::{PhoneError, PhoneResult};
use crate::events::PhoneEvent;
use crate::signaling::{RegisterOutcome, TransportState, UserAgentOptions};
use crate::uri::SipUri;

/// Registration state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationState {
    Idle,
    Starting,
    Connecting,
    Registering,
    Registered,
    RegisterFailed,
    Unregistering,
}

/// Named registration transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationTransition {
    Start,
    Connect,
    Register,
    Accept,
    Reject,
    TransportFailed,
    Unregister,
    Stop,
}

impl RegistrationState {
    /// Target of `transition` from this state, if it is allowed
    pub fn next(self, transition: RegistrationTransition) -> Option<Self> {
        use RegistrationState::*;
        use RegistrationTransition as T;

        match (self, transition) {
            (_, T::Stop) => Some(Idle),
            (Idle, T::Start) => Some(Starting),
            (Starting, T::Connect) => Some(Connecting),
            (Starting | Connecting, T::TransportFailed) => Some(Idle),
            (Connecting, T::Register) => Some(Registering),
            (Registering, T::Accept) => Some(Registered),
            (Registering, T::Reject) => Some(RegisterFailed),
            (Registered, T::Unregister) => Some(Unregistering),
            _ => None,
        }
    }

    pub fn is_registered(self) -> bool {
        self == Self::Registered
    }

    /// A start is in flight
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Starting | Self::Connecting | Self::Registering)
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "Idle",
            Self::Starting => "Starting",
            Self::Connecting => "Connecting",
            Self::Registering => "Registering",
            Self::Registered => "Registered",
            Self::RegisterFailed => "RegisterFailed",
            Self::Unregistering => "Unregistering",
        };
        f.write_str(s)
    }
}

/// Details of the current (or last) registration attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationInfo {
    /// Address of record, `sip:user@domain`
    pub uri: String,
    /// Normalized WebSocket server
    pub server: String,
    pub state: RegistrationState,
    /// Summary of the accepting response, e.g. `200 OK`
    pub response_summary: Option<String>,
    pub failure_reason: Option<String>,
    pub registered_at: Option<DateTime<Utc>>,
}

impl RegistrationInfo {
    pub fn new(uri: &SipUri, server: impl Into<String>) -> Self {
        Self {
            uri: uri.to_string(),
            server: server.into(),
            state: RegistrationState::Starting,
            response_summary: None,
            failure_reason: None,
            registered_at: None,
        }
    }
}

/// Drives one identity through registration
#[derive(Clone)]
pub struct RegistrationController {
    ctx: Arc<AppSessionContext>,
    calls: CallController,
}

impl RegistrationController {
    pub fn new(ctx: Arc<AppSessionContext>, calls: CallController) -> Self {
        Self { ctx, calls }
    }

    pub fn state(&self) -> RegistrationState {
        self.ctx.registration_state()
    }

    pub fn info(&self) -> Option<RegistrationInfo> {
        self.ctx.registration_info()
    }

    pub fn transport_state(&self) -> Option<TransportState> {
        self.ctx.transport_state()
    }

    /// A user agent exists (any state other than fully stopped)
    pub fn is_live(&self) -> bool {
        self.ctx.with_slots(|s| s.user_agent.is_some())
    }

    /// Apply a transition; `generation` guards against stale completions
    ///
    /// Returns `false` when the transition is not allowed from the current
    /// state or the generation moved on.
    fn transition(
        &self,
        generation: Option<u64>,
        transition: RegistrationTransition,
        reason: Option<String>,
    ) -> bool {
        let moved = self.ctx.with_slots(|s| {
            if generation.is_some_and(|g| g != s.generation) {
                return None;
            }
            let previous = s.registration_state;
            let current = previous.next(transition)?;
            s.registration_state = current;
            if let Some(info) = s.registration.as_mut() {
                info.state = current;
            }
            Some((previous, current))
        });

        let Some((previous, current)) = moved else {
            debug!(?transition, "registration transition ignored");
            return false;
        };
        if previous != current {
            info!(
                %previous,
                %current,
                reason = reason.as_deref().unwrap_or(""),
                "registration state"
            );
            self.ctx.emit(PhoneEvent::RegistrationStateChanged {
                previous,
                current,
                reason,
            });
        }
        true
    }

    fn is_current(&self, generation: u64) -> bool {
        self.ctx.with_slots(|s| s.generation == generation)
    }

    fn superseded() -> PhoneError {
        PhoneError::signaling("registration superseded by a newer start or stop")
    }

    /// Connect and register `credentials`
    ///
    /// A live registration is fully stopped first. The call resolves once the
    /// registrar answered; rejection is returned as
    /// [`PhoneError::RegisterRejected`] and also recorded as
    /// [`RegistrationState::RegisterFailed`].
    pub async fn start(&self, credentials: &Credentials) -> PhoneResult<()> {
        let config = self.ctx.config();
        let server = normalize_server(&credentials.server, &credentials.domain);
        info!(
            ext = %credentials.identity,
            domain = %credentials.domain,
            password = %config.mask(&credentials.secret),
            wss = %server,
            ice_policy = %config.ice_transport_policy(),
            "start and register"
        );

        if !credentials.is_complete() {
            return Err(PhoneError::MissingCredentials);
        }
        if self.is_live() {
            info!("restarting: stopping current registration first");
            self.stop().await;
        }

        let uri = SipUri::new(&credentials.identity, &credentials.domain).map_err(|e| {
            PhoneError::InvalidIdentity {
                reason: e.to_string(),
            }
        })?;

        let generation = self.ctx.with_slots(|s| {
            s.generation += 1;
            s.registration = Some(RegistrationInfo::new(&uri, server.clone()));
            s.domain = credentials.domain.clone();
            s.generation
        });
        self.transition(Some(generation), RegistrationTransition::Start, None);
        self.ctx.set_status("Starting...");

        let user_agent = self.ctx.factory.create(UserAgentOptions {
            uri: uri.clone(),
            authorization_username: credentials.identity.clone(),
            authorization_password: credentials.secret.clone(),
            server,
            ice_servers: config.ice_servers.clone(),
            ice_transport_policy: config.ice_transport_policy(),
        });
        let watcher = tokio::spawn(watch_transport(
            Arc::downgrade(&self.ctx),
            generation,
            user_agent.transport_events(),
        ));
        let installed = self.ctx.with_slots(|s| {
            if s.generation != generation {
                return false;
            }
            s.user_agent = Some(user_agent.clone());
            s.transport_watcher = Some(watcher);
            s.transport_state = Some(TransportState::Connecting);
            true
        });
        if !installed {
            return Err(Self::superseded());
        }
        self.ctx.emit(PhoneEvent::TransportStateChanged {
            state: TransportState::Connecting,
        });
        self.transition(Some(generation), RegistrationTransition::Connect, None);

        if let Err(e) = user_agent.start().await {
            let reason = e.to_string();
            warn!(error = %reason, "ua.start() failed");
            let owned = self.ctx.with_slots(|s| {
                if s.generation != generation {
                    return false;
                }
                s.user_agent = None;
                s.transport_state = None;
                if let Some(watcher) = s.transport_watcher.take() {
                    watcher.abort();
                }
                true
            });
            if !owned {
                return Err(Self::superseded());
            }
            self.transition(
                Some(generation),
                RegistrationTransition::TransportFailed,
                Some(reason.clone()),
            );
            self.ctx.set_status("UA start failed");
            return Err(PhoneError::TransportStartFailed { reason });
        }
        debug!("ua.start() done");

        if !self.transition(Some(generation), RegistrationTransition::Register, None) {
            return Err(Self::superseded());
        }
        self.ctx.set_status("Registering...");

        let outcome = user_agent.register().await;
        if !self.is_current(generation) {
            debug!("discarding register response for a superseded registration");
            return Err(Self::superseded());
        }

        match outcome {
            Ok(RegisterOutcome::Accepted(response)) => {
                let summary = response.summary();
                info!(response = %summary, "registerer accepted");
                self.ctx.with_slots(|s| {
                    if let Some(info) = s.registration.as_mut() {
                        info.response_summary = (!summary.is_empty()).then(|| summary.clone());
                        info.failure_reason = None;
                        info.registered_at = Some(Utc::now());
                    }
                });
                self.transition(
                    Some(generation),
                    RegistrationTransition::Accept,
                    Some(summary.clone()),
                );
                self.ctx.set_status(with_detail("Registered", &summary));
                Ok(())
            }
            Ok(RegisterOutcome::Rejected(response)) => {
                let summary = response.summary();
                warn!(response = %summary, "registerer rejected");
                Err(self.register_failed(generation, summary))
            }
            Err(e) => {
                warn!(error = %e, "register() failed");
                Err(self.register_failed(generation, e.to_string()))
            }
        }
    }

    fn register_failed(&self, generation: u64, reason: String) -> PhoneError {
        self.ctx.with_slots(|s| {
            if let Some(info) = s.registration.as_mut() {
                info.failure_reason = Some(reason.clone());
            }
        });
        self.transition(
            Some(generation),
            RegistrationTransition::Reject,
            Some(reason.clone()),
        );
        self.ctx.set_status(with_detail("Register failed", &reason));
        PhoneError::RegisterRejected { reason }
    }

    /// Hang up, unregister, tear the transport down and return to Idle
    ///
    /// Unregister and transport-stop failures are logged and ignored. Safe to
    /// call when nothing is running.
    pub async fn stop(&self) {
        debug!("stop and unregister");
        self.calls.hangup().await;

        let (user_agent, watcher, was) = self.ctx.with_slots(|s| {
            s.generation += 1;
            (
                s.user_agent.take(),
                s.transport_watcher.take(),
                s.registration_state,
            )
        });
        if let Some(watcher) = watcher {
            watcher.abort();
        }

        if let Some(user_agent) = user_agent {
            if was.is_registered() {
                self.transition(None, RegistrationTransition::Unregister, None);
            }
            if !matches!(
                was,
                RegistrationState::Starting | RegistrationState::Connecting
            ) {
                match user_agent.unregister().await {
                    Ok(()) => debug!("unregister() sent"),
                    Err(e) => debug!(error = %e, "unregister() failed, ignoring"),
                }
            }
            match user_agent.stop().await {
                Ok(()) => debug!("ua.stop() done"),
                Err(e) => debug!(error = %e, "ua.stop() failed, ignoring"),
            }
        }

        let cleared = self.ctx.with_slots(|s| s.transport_state.take().is_some());
        if cleared {
            self.ctx.emit(PhoneEvent::TransportStateChanged {
                state: TransportState::Disconnected,
            });
        }
        self.transition(None, RegistrationTransition::Stop, None);
        self.ctx.set_status("Idle");
    }
}

fn with_detail(head: &str, detail: &str) -> String {
    if detail.is_empty() {
        head.to_string()
    } else {
        format!("{head} ({detail})")
    }
}

/// Mirror signaling transport state into the context
async fn watch_transport(
    ctx: Weak<AppSessionContext>,
    generation: u64,
    mut rx: broadcast::Receiver<TransportState>,
) {
    loop {
        let state = match rx.recv().await {
            Ok(state) => state,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(ctx) = ctx.upgrade() else { break };
        let current = ctx.with_slots(|s| {
            if s.generation != generation {
                return false;
            }
            s.transport_state = Some(state);
            true
        });
        if !current {
            break;
        }
        debug!(%state, "transport");
        ctx.emit(PhoneEvent::TransportStateChanged { state });
    }
}
