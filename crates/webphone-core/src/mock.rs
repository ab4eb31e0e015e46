//! In-memory collaborators
//!
//! Scriptable stand-ins for the signaling library, the media transport and
//! the audio devices. They record what the core asked of them so tests can
//! check resource accounting, and they drive the same event sequences a real
//! user agent would.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, broadcast};

use crate::diagnostics::stats::StatsSnapshot;
use crate::error::{MediaError, SignalingError, StatsError};
use crate::media::{LocalStream, MediaCapture, PlaybackSink, RemoteStream};
use crate::signaling::{
    InviteOptions, OutboundSession, RegisterOutcome, SessionEvent, SessionState, SipResponse,
    TransportState, UserAgent, UserAgentFactory, UserAgentOptions,
};
use crate::transport::{
    IceConnectionState, PeerConnectionState, PeerTransport, TransportEvent, TransportId,
};
use crate::uri::SipUri;

const CHANNEL_CAPACITY: usize = 64;

/// What the registrar answers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterScript {
    Accept(SipResponse),
    Reject(SipResponse),
    Fail(String),
}

/// How the far end treats an INVITE
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallScript {
    /// Nothing happens after the INVITE is sent
    Silent,
    /// 180 Ringing, 200 OK, media up
    Answer,
    /// 180 Ringing followed by the given final response
    Reject(SipResponse),
    /// `invite()` itself fails
    InviteError(String),
}

/// Behaviour of every user agent a [`MockUserAgentFactory`] builds
#[derive(Debug, Clone)]
pub struct UserAgentScript {
    pub start_error: Option<String>,
    pub register: RegisterScript,
    /// `register()` waits for a permit here before answering
    pub register_gate: Option<Arc<Semaphore>>,
    pub unregister_error: Option<String>,
    pub stop_error: Option<String>,
    pub inviter_error: Option<String>,
    pub call: CallScript,
    pub bye_error: Option<String>,
    pub cancel_error: Option<String>,
}

impl Default for UserAgentScript {
    fn default() -> Self {
        Self {
            start_error: None,
            register: RegisterScript::Accept(SipResponse::new(200, "OK")),
            register_gate: None,
            unregister_error: None,
            stop_error: None,
            inviter_error: None,
            call: CallScript::Answer,
            bye_error: None,
            cancel_error: None,
        }
    }
}

/// Wait for one permit of `gate`, if there is one
async fn pass(gate: Option<&Arc<Semaphore>>) {
    if let Some(gate) = gate {
        if let Ok(permit) = gate.acquire().await {
            permit.forget();
        }
    }
}

fn fail(error: &Option<String>) -> Result<(), SignalingError> {
    match error {
        Some(message) => Err(SignalingError::Other(message.clone())),
        None => Ok(()),
    }
}

/// Peer transport with scripted stats
pub struct MockPeerTransport {
    id: TransportId,
    events: broadcast::Sender<TransportEvent>,
    stats: Mutex<Result<StatsSnapshot, StatsError>>,
    state: Mutex<PeerConnectionState>,
    stats_calls: AtomicUsize,
}

impl MockPeerTransport {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Arc::new(Self {
            id: TransportId::new(),
            events,
            stats: Mutex::new(Ok(StatsSnapshot::default())),
            state: Mutex::new(PeerConnectionState::New),
            stats_calls: AtomicUsize::new(0),
        })
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    pub fn set_stats(&self, snapshot: StatsSnapshot) {
        *self.stats.lock() = Ok(snapshot);
    }

    pub fn fail_stats(&self, error: StatsError) {
        *self.stats.lock() = Err(error);
    }

    pub fn set_connection_state(&self, state: PeerConnectionState) {
        *self.state.lock() = state;
    }

    pub fn stats_calls(&self) -> usize {
        self.stats_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerTransport for MockPeerTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn stats(&self) -> Result<StatsSnapshot, StatsError> {
        self.stats_calls.fetch_add(1, Ordering::SeqCst);
        self.stats.lock().clone()
    }

    fn connection_state(&self) -> PeerConnectionState {
        *self.state.lock()
    }
}

/// Outbound session following a [`CallScript`]
pub struct MockSession {
    target: SipUri,
    options: InviteOptions,
    script: CallScript,
    bye_error: Option<String>,
    cancel_error: Option<String>,
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    transport: Arc<MockPeerTransport>,
    remote: RemoteStream,
    answered: Mutex<bool>,
    pub invites: AtomicUsize,
    pub byes: AtomicUsize,
    pub cancels: AtomicUsize,
}

impl MockSession {
    fn new(target: SipUri, options: InviteOptions, script: &UserAgentScript) -> Arc<Self> {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Arc::new(Self {
            target,
            options,
            script: script.call.clone(),
            bye_error: script.bye_error.clone(),
            cancel_error: script.cancel_error.clone(),
            state: Mutex::new(SessionState::Initial),
            events,
            transport: MockPeerTransport::new(),
            remote: RemoteStream::new(format!("remote-{}", uuid::Uuid::new_v4())),
            answered: Mutex::new(false),
            invites: AtomicUsize::new(0),
            byes: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
        })
    }

    pub fn target(&self) -> &SipUri {
        &self.target
    }

    pub fn options(&self) -> &InviteOptions {
        &self.options
    }

    pub fn transport(&self) -> Arc<MockPeerTransport> {
        self.transport.clone()
    }

    pub fn remote(&self) -> RemoteStream {
        self.remote.clone()
    }

    /// Deliver a session event as the library would
    pub fn emit(&self, event: SessionEvent) {
        if let SessionEvent::StateChanged(state) = &event {
            *self.state.lock() = *state;
        }
        let _ = self.events.send(event);
    }

    /// Answer the call and bring media up
    pub fn answer(&self) {
        self.accept();
        self.connect_media();
    }

    /// 200 OK and Established, with no transport activity
    pub fn accept(&self) {
        *self.answered.lock() = true;
        self.emit(SessionEvent::Accepted(SipResponse::new(200, "OK")));
        self.emit(SessionEvent::StateChanged(SessionState::Established));
    }

    /// Deliver the remote audio track on the transport only
    pub fn deliver_track(&self) {
        self.transport.emit(TransportEvent::TrackArrived {
            kind: "audio".into(),
            stream: Some(self.remote.clone()),
        });
    }

    /// Gather, connect ICE and deliver the remote track
    pub fn connect_media(&self) {
        self.transport.set_connection_state(PeerConnectionState::Connected);
        self.transport.emit(TransportEvent::CandidateGenerated {
            candidate: "candidate:1 1 udp 2122260223 192.168.1.20 50123 typ host generation 0"
                .into(),
        });
        self.transport.emit(TransportEvent::CandidateGatheringComplete);
        self.transport
            .emit(TransportEvent::IceConnectionStateChanged(IceConnectionState::Connected));
        self.transport
            .emit(TransportEvent::ConnectionStateChanged(PeerConnectionState::Connected));
        self.deliver_track();
    }

    /// Reject with `response`
    pub fn reject(&self, response: SipResponse) {
        self.emit(SessionEvent::Rejected(response));
        self.emit(SessionEvent::StateChanged(SessionState::Terminated));
    }

    fn close_media(&self) {
        self.transport.set_connection_state(PeerConnectionState::Closed);
        self.transport
            .emit(TransportEvent::ConnectionStateChanged(PeerConnectionState::Closed));
    }
}

#[async_trait]
impl OutboundSession for MockSession {
    async fn invite(&self) -> Result<(), SignalingError> {
        self.invites.fetch_add(1, Ordering::SeqCst);
        if let CallScript::InviteError(message) = &self.script {
            return Err(SignalingError::Transport(message.clone()));
        }
        self.emit(SessionEvent::StateChanged(SessionState::Establishing));
        match &self.script {
            CallScript::Answer => {
                self.emit(SessionEvent::Progress(SipResponse::new(180, "Ringing")));
                self.answer();
            }
            CallScript::Reject(response) => {
                self.emit(SessionEvent::Progress(SipResponse::new(180, "Ringing")));
                self.reject(response.clone());
            }
            CallScript::Silent | CallScript::InviteError(_) => {}
        }
        Ok(())
    }

    async fn cancel(&self) -> Result<(), SignalingError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        fail(&self.cancel_error)?;
        self.emit(SessionEvent::Rejected(SipResponse::new(
            487,
            "Request Terminated",
        )));
        self.emit(SessionEvent::StateChanged(SessionState::Terminated));
        Ok(())
    }

    async fn bye(&self) -> Result<(), SignalingError> {
        self.byes.fetch_add(1, Ordering::SeqCst);
        fail(&self.bye_error)?;
        self.emit(SessionEvent::StateChanged(SessionState::Terminated));
        self.close_media();
        Ok(())
    }

    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn peer_transport(&self) -> Option<Arc<dyn PeerTransport>> {
        Some(self.transport.clone())
    }

    fn remote_stream(&self) -> Option<RemoteStream> {
        self.answered.lock().then(|| self.remote.clone())
    }
}

/// Counters shared by a factory and the agents it built
#[derive(Debug, Default)]
pub struct AgentCounters {
    pub created: AtomicUsize,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub registers: AtomicUsize,
    pub unregisters: AtomicUsize,
    pub live: AtomicUsize,
    pub max_live: AtomicUsize,
}

impl AgentCounters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// User agent following a [`UserAgentScript`]
pub struct MockUserAgent {
    options: UserAgentOptions,
    script: UserAgentScript,
    counters: Arc<AgentCounters>,
    transport: broadcast::Sender<TransportState>,
    started: Mutex<bool>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

impl MockUserAgent {
    pub fn options(&self) -> &UserAgentOptions {
        &self.options
    }

    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.sessions.lock().clone()
    }

    pub fn last_session(&self) -> Option<Arc<MockSession>> {
        self.sessions.lock().last().cloned()
    }

    fn set_transport(&self, state: TransportState) {
        let _ = self.transport.send(state);
    }
}

#[async_trait]
impl UserAgent for MockUserAgent {
    async fn start(&self) -> Result<(), SignalingError> {
        self.counters.starts.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.script.start_error {
            self.set_transport(TransportState::Disconnected);
            return Err(SignalingError::Transport(message.clone()));
        }
        *self.started.lock() = true;
        let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_live.fetch_max(live, Ordering::SeqCst);
        self.set_transport(TransportState::Connected);
        Ok(())
    }

    async fn stop(&self) -> Result<(), SignalingError> {
        self.counters.stops.fetch_add(1, Ordering::SeqCst);
        let was_started = std::mem::replace(&mut *self.started.lock(), false);
        if was_started {
            self.counters.live.fetch_sub(1, Ordering::SeqCst);
            self.set_transport(TransportState::Disconnected);
        }
        fail(&self.script.stop_error)
    }

    async fn register(&self) -> Result<RegisterOutcome, SignalingError> {
        self.counters.registers.fetch_add(1, Ordering::SeqCst);
        pass(self.script.register_gate.as_ref()).await;
        match &self.script.register {
            RegisterScript::Accept(response) => Ok(RegisterOutcome::Accepted(response.clone())),
            RegisterScript::Reject(response) => Ok(RegisterOutcome::Rejected(response.clone())),
            RegisterScript::Fail(message) => Err(SignalingError::Other(message.clone())),
        }
    }

    async fn unregister(&self) -> Result<(), SignalingError> {
        self.counters.unregisters.fetch_add(1, Ordering::SeqCst);
        fail(&self.script.unregister_error)
    }

    fn transport_events(&self) -> broadcast::Receiver<TransportState> {
        self.transport.subscribe()
    }

    fn create_inviter(
        &self,
        target: &SipUri,
        options: InviteOptions,
    ) -> Result<Arc<dyn OutboundSession>, SignalingError> {
        if let Some(message) = &self.script.inviter_error {
            return Err(SignalingError::InvalidState(message.clone()));
        }
        let session = MockSession::new(target.clone(), options, &self.script);
        self.sessions.lock().push(session.clone());
        Ok(session)
    }
}

/// Builds [`MockUserAgent`]s and keeps them for inspection
#[derive(Default)]
pub struct MockUserAgentFactory {
    script: Mutex<UserAgentScript>,
    counters: Arc<AgentCounters>,
    agents: Mutex<Vec<Arc<MockUserAgent>>>,
}

impl MockUserAgentFactory {
    pub fn new(script: UserAgentScript) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            ..Default::default()
        })
    }

    /// Change the script used by agents created from now on
    pub fn set_script(&self, script: UserAgentScript) {
        *self.script.lock() = script;
    }

    pub fn counters(&self) -> &AgentCounters {
        &self.counters
    }

    pub fn agents(&self) -> Vec<Arc<MockUserAgent>> {
        self.agents.lock().clone()
    }

    pub fn last_agent(&self) -> Option<Arc<MockUserAgent>> {
        self.agents.lock().last().cloned()
    }

    pub fn last_session(&self) -> Option<Arc<MockSession>> {
        self.last_agent()?.last_session()
    }
}

impl UserAgentFactory for MockUserAgentFactory {
    fn create(&self, options: UserAgentOptions) -> Arc<dyn UserAgent> {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        let (transport, _) = broadcast::channel(CHANNEL_CAPACITY);
        let agent = Arc::new(MockUserAgent {
            options,
            script: self.script.lock().clone(),
            counters: self.counters.clone(),
            transport,
            started: Mutex::new(false),
            sessions: Mutex::new(Vec::new()),
        });
        self.agents.lock().push(agent.clone());
        agent
    }
}

/// Microphone that counts acquisitions and releases
#[derive(Debug, Default)]
pub struct MockMediaCapture {
    deny: Mutex<Option<String>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    acquired: AtomicUsize,
    released: Mutex<Vec<String>>,
}

impl MockMediaCapture {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Refuse every following `acquire`
    pub fn deny(&self, reason: impl Into<String>) {
        *self.deny.lock() = Some(reason.into());
    }

    /// Park every following `acquire` until the returned gate hands out
    /// a permit
    pub fn hold(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().clone()
    }

    /// Streams acquired and not yet released
    pub fn outstanding(&self) -> usize {
        self.acquired() - self.released.lock().len()
    }
}

#[async_trait]
impl MediaCapture for MockMediaCapture {
    async fn acquire(&self) -> Result<LocalStream, MediaError> {
        let gate = self.gate.lock().clone();
        pass(gate.as_ref()).await;
        if let Some(reason) = self.deny.lock().clone() {
            return Err(MediaError::PermissionDenied(reason));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(LocalStream::generate())
    }

    fn release(&self, stream: LocalStream) {
        self.released.lock().push(stream.id().to_string());
    }
}

/// Speaker that records what was attached
#[derive(Debug, Default)]
pub struct MockPlayback {
    attached: Mutex<Vec<String>>,
}

impl MockPlayback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attached(&self) -> Vec<String> {
        self.attached.lock().clone()
    }
}

impl PlaybackSink for MockPlayback {
    fn attach(&self, stream: &RemoteStream) {
        self.attached.lock().push(stream.id().to_string());
    }
}
