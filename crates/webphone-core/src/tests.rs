//! Controller scenarios
//!
//! Registration and call lifecycles driven end to end against the in-memory
//! collaborators, with particular attention to media accounting: every
//! capture stream acquired for a call must be released exactly once.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::call::{CallState, EndReason};
use crate::config::{Credentials, IceTransportPolicy, PhoneConfig};
use crate::error::PhoneError;
use crate::events::PhoneEvent;
use crate::mock::{
    AgentCounters, CallScript, MockMediaCapture, MockPlayback, MockUserAgentFactory,
    RegisterScript, UserAgentScript,
};
use crate::phone::WebPhone;
use crate::registration::RegistrationState;
use crate::sdp::{SdpType, SessionDescription};
use crate::signaling::{SipResponse, TransportState};
use crate::transport::PeerTransport;

struct Harness {
    phone: WebPhone,
    factory: Arc<MockUserAgentFactory>,
    capture: Arc<MockMediaCapture>,
    playback: Arc<MockPlayback>,
    rx: broadcast::Receiver<PhoneEvent>,
}

fn harness(script: UserAgentScript) -> Harness {
    harness_with(PhoneConfig::default(), script)
}

fn harness_with(config: PhoneConfig, script: UserAgentScript) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("webphone_core=debug")
        .with_test_writer()
        .try_init();

    let factory = MockUserAgentFactory::new(script);
    let capture = MockMediaCapture::new();
    let playback = MockPlayback::new();
    let phone = WebPhone::builder()
        .config(config)
        .user_agent_factory(factory.clone())
        .media_capture(capture.clone())
        .playback(playback.clone())
        .build()
        .unwrap();
    let rx = phone.receiver();
    Harness {
        phone,
        factory,
        capture,
        playback,
        rx,
    }
}

fn credentials() -> Credentials {
    Credentials::new("1001", "s3cret", "example.com", "phone.example.com")
}

fn call_script(call: CallScript) -> UserAgentScript {
    UserAgentScript {
        call,
        ..Default::default()
    }
}

async fn wait_for(
    rx: &mut broadcast::Receiver<PhoneEvent>,
    what: &str,
    pred: impl Fn(&PhoneEvent) -> bool,
) -> PhoneEvent {
    let found = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await;
    found.unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

async fn wait_call_state(rx: &mut broadcast::Receiver<PhoneEvent>, state: CallState) {
    wait_for(rx, &format!("call state {state}"), |e| {
        matches!(e, PhoneEvent::CallStateChanged { current, .. } if *current == state)
    })
    .await;
}

/// Let spawned pumps drain their channels
async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

async fn registered(script: UserAgentScript) -> Harness {
    let h = harness(script);
    h.phone.start(&credentials()).await.unwrap();
    h
}

// ===== Registration =====

#[tokio::test]
async fn test_empty_secret_is_missing_credentials() {
    let h = harness(UserAgentScript::default());

    let result = h
        .phone
        .start(&Credentials::new("1001", "", "example.com", ""))
        .await;

    assert_eq!(result, Err(PhoneError::MissingCredentials));
    assert_eq!(AgentCounters::get(&h.factory.counters().created), 0);
    assert!(h.phone.registration_info().is_none());
    assert!(h.phone.transport_state().is_none());
    assert_eq!(h.phone.registration_state(), RegistrationState::Idle);
    assert_eq!(h.phone.status_text(), "Missing ext/domain/password");
}

#[tokio::test]
async fn test_start_registers() {
    let mut h = harness(UserAgentScript::default());

    h.phone.start(&credentials()).await.unwrap();
    wait_for(&mut h.rx, "transport connected", |e| {
        matches!(
            e,
            PhoneEvent::TransportStateChanged {
                state: TransportState::Connected
            }
        )
    })
    .await;

    assert_eq!(h.phone.registration_state(), RegistrationState::Registered);
    assert_eq!(h.phone.status_text(), "Registered (200 OK)");
    assert_eq!(h.phone.transport_state(), Some(TransportState::Connected));

    let info = h.phone.registration_info().unwrap();
    assert_eq!(info.uri, "sip:1001@example.com");
    assert_eq!(info.server, "wss://phone.example.com/ws");
    assert_eq!(info.response_summary.as_deref(), Some("200 OK"));
    assert!(info.registered_at.is_some());

    let agent = h.factory.last_agent().unwrap();
    assert_eq!(agent.options().authorization_username, "1001");
    assert_eq!(agent.options().ice_transport_policy, IceTransportPolicy::All);
}

#[tokio::test]
async fn test_registration_walks_every_state() {
    let mut h = harness(UserAgentScript::default());
    h.phone.start(&credentials()).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = h.rx.try_recv() {
        if let PhoneEvent::RegistrationStateChanged { current, .. } = event {
            seen.push(current);
        }
    }
    assert_eq!(
        seen,
        vec![
            RegistrationState::Starting,
            RegistrationState::Connecting,
            RegistrationState::Registering,
            RegistrationState::Registered,
        ]
    );
}

#[tokio::test]
async fn test_invalid_identity() {
    let h = harness(UserAgentScript::default());

    let result = h
        .phone
        .start(&Credentials::new("10 01", "s3cret", "example.com", ""))
        .await;

    assert!(matches!(result, Err(PhoneError::InvalidIdentity { .. })));
    assert_eq!(AgentCounters::get(&h.factory.counters().created), 0);
}

#[tokio::test]
async fn test_force_relay_reaches_user_agent() {
    let h = harness_with(
        PhoneConfig::default().with_force_relay(true),
        UserAgentScript::default(),
    );
    h.phone.start(&credentials()).await.unwrap();

    let agent = h.factory.last_agent().unwrap();
    assert_eq!(agent.options().ice_transport_policy, IceTransportPolicy::Relay);
    assert_eq!(agent.options().ice_servers.len(), 2);
}

#[tokio::test]
async fn test_restart_stops_before_reconnecting() {
    let h = registered(UserAgentScript::default()).await;

    h.phone.start(&credentials()).await.unwrap();

    let counters = h.factory.counters();
    assert_eq!(AgentCounters::get(&counters.created), 2);
    assert_eq!(AgentCounters::get(&counters.stops), 1);
    assert_eq!(AgentCounters::get(&counters.unregisters), 1);
    assert_eq!(AgentCounters::get(&counters.max_live), 1);
    assert_eq!(AgentCounters::get(&counters.live), 1);
    assert_eq!(h.phone.registration_state(), RegistrationState::Registered);
}

#[tokio::test]
async fn test_late_register_response_after_restart_is_discarded() {
    let gate = Arc::new(Semaphore::new(0));
    let mut h = harness(UserAgentScript {
        register_gate: Some(gate.clone()),
        ..Default::default()
    });
    let creds = credentials();

    let restart = async {
        settle().await;
        h.phone.start(&creds).await
    };
    let release = async {
        settle().await;
        settle().await;
        gate.add_permits(2);
    };
    let (first, second, ()) = tokio::join!(h.phone.start(&creds), restart, release);

    assert!(matches!(first, Err(PhoneError::Signaling { .. })));
    assert_eq!(second, Ok(()));
    assert_eq!(h.phone.registration_state(), RegistrationState::Registered);

    let counters = h.factory.counters();
    assert_eq!(AgentCounters::get(&counters.created), 2);
    assert_eq!(AgentCounters::get(&counters.max_live), 1);

    let mut registered = 0;
    loop {
        match h.rx.try_recv() {
            Ok(PhoneEvent::RegistrationStateChanged {
                current: RegistrationState::Registered,
                ..
            }) => registered += 1,
            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    assert_eq!(registered, 1);
}

#[tokio::test]
async fn test_late_register_response_after_stop_is_discarded() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(UserAgentScript {
        register_gate: Some(gate.clone()),
        ..Default::default()
    });
    let creds = credentials();

    let interrupt = async {
        settle().await;
        h.phone.stop().await;
        gate.add_permits(1);
    };
    let (result, ()) = tokio::join!(h.phone.start(&creds), interrupt);

    assert!(matches!(result, Err(PhoneError::Signaling { .. })));
    assert_eq!(h.phone.registration_state(), RegistrationState::Idle);
    assert_eq!(h.phone.status_text(), "Idle");
    assert!(h.phone.transport_state().is_none());
    assert_eq!(AgentCounters::get(&h.factory.counters().unregisters), 1);
}

#[test]
fn test_builder_rejects_zero_stats_interval() {
    let result = WebPhone::builder()
        .config(PhoneConfig::default().with_stats_interval(Duration::ZERO))
        .user_agent_factory(MockUserAgentFactory::new(UserAgentScript::default()))
        .media_capture(MockMediaCapture::new())
        .playback(MockPlayback::new())
        .build();

    assert!(matches!(result, Err(PhoneError::Configuration { .. })));
}

#[tokio::test]
async fn test_register_rejected_does_not_retry() {
    let h = harness(UserAgentScript {
        register: RegisterScript::Reject(SipResponse::new(403, "Forbidden")),
        ..Default::default()
    });

    let result = h.phone.start(&credentials()).await;
    settle().await;

    assert_eq!(
        result,
        Err(PhoneError::RegisterRejected {
            reason: "403 Forbidden".into()
        })
    );
    assert_eq!(h.phone.registration_state(), RegistrationState::RegisterFailed);
    assert_eq!(h.phone.status_text(), "Register failed (403 Forbidden)");
    assert_eq!(
        h.phone.registration_info().unwrap().failure_reason.as_deref(),
        Some("403 Forbidden")
    );
    assert_eq!(AgentCounters::get(&h.factory.counters().registers), 1);

    // Failure is terminal until the next start
    h.factory.set_script(UserAgentScript::default());
    h.phone.start(&credentials()).await.unwrap();
    assert_eq!(h.phone.registration_state(), RegistrationState::Registered);
    assert_eq!(AgentCounters::get(&h.factory.counters().max_live), 1);
}

#[tokio::test]
async fn test_transport_start_failure_resets_to_idle() {
    let h = harness(UserAgentScript {
        start_error: Some("connection refused".into()),
        ..Default::default()
    });

    let result = h.phone.start(&credentials()).await;

    assert!(matches!(result, Err(PhoneError::TransportStartFailed { .. })));
    assert_eq!(h.phone.registration_state(), RegistrationState::Idle);
    assert!(!h.phone.registration().is_live());
    assert_eq!(h.phone.status_text(), "UA start failed");
    assert_eq!(AgentCounters::get(&h.factory.counters().registers), 0);
}

#[tokio::test]
async fn test_stop_swallows_teardown_failures() {
    let h = registered(UserAgentScript {
        unregister_error: Some("408 Request Timeout".into()),
        stop_error: Some("socket already closed".into()),
        ..Default::default()
    })
    .await;

    h.phone.stop().await;

    let counters = h.factory.counters();
    assert_eq!(AgentCounters::get(&counters.unregisters), 1);
    assert_eq!(AgentCounters::get(&counters.stops), 1);
    assert_eq!(h.phone.registration_state(), RegistrationState::Idle);
    assert!(h.phone.transport_state().is_none());
    assert_eq!(h.phone.status_text(), "Idle");
}

#[tokio::test]
async fn test_stop_when_idle_is_safe() {
    let h = harness(UserAgentScript::default());
    h.phone.stop().await;
    h.phone.stop().await;
    assert_eq!(h.phone.registration_state(), RegistrationState::Idle);
}

#[tokio::test]
async fn test_shutdown_clears_context() {
    let h = registered(UserAgentScript::default()).await;

    h.phone.shutdown().await;

    assert!(h.phone.registration_info().is_none());
    assert!(h.phone.last_call().is_none());
    assert_eq!(h.phone.status_text(), "Idle");
    assert_eq!(AgentCounters::get(&h.factory.counters().live), 0);
}

// ===== Call placement =====

#[tokio::test]
async fn test_place_without_registration() {
    let h = harness(UserAgentScript::default());

    let result = h.phone.place_call("2002").await;

    assert_eq!(result, Err(PhoneError::NotRegistered));
    assert_eq!(h.capture.acquired(), 0);
    assert_eq!(h.phone.status_text(), "Not registered");
}

#[tokio::test]
async fn test_place_missing_destination() {
    let h = registered(UserAgentScript::default()).await;

    let result = h.phone.place_call("   ").await;

    assert_eq!(result, Err(PhoneError::MissingDestination));
    assert_eq!(h.capture.acquired(), 0);
}

#[tokio::test]
async fn test_place_while_call_active() {
    let h = registered(call_script(CallScript::Silent)).await;

    h.phone.place_call("2002").await.unwrap();
    let second = h.phone.place_call("2003").await;

    assert_eq!(second, Err(PhoneError::CallAlreadyActive));
    assert_eq!(h.capture.acquired(), 1);
    assert_eq!(h.capture.outstanding(), 1);
}

#[tokio::test]
async fn test_permission_denied_creates_no_session() {
    let h = registered(UserAgentScript::default()).await;
    h.capture.deny("NotAllowedError");

    let result = h.phone.place_call("2002").await;

    assert!(matches!(result, Err(PhoneError::PermissionDenied { .. })));
    assert!(h.factory.last_session().is_none());
    assert!(h.phone.active_call().is_none());
}

#[tokio::test]
async fn test_invalid_destination_releases_capture() {
    let h = registered(UserAgentScript::default()).await;

    let result = h.phone.place_call("20 02").await;

    assert!(matches!(result, Err(PhoneError::InvalidDestination { .. })));
    assert_eq!(h.capture.acquired(), 1);
    assert_eq!(h.capture.released().len(), 1);
    assert!(h.factory.last_session().is_none());
}

#[tokio::test]
async fn test_inviter_error_releases_capture() {
    let h = registered(UserAgentScript {
        inviter_error: Some("no transport".into()),
        ..Default::default()
    })
    .await;

    let result = h.phone.place_call("2002").await;

    assert!(matches!(result, Err(PhoneError::InviteFailed { .. })));
    assert_eq!(h.capture.outstanding(), 0);
    assert!(h.phone.active_call().is_none());
}

#[tokio::test]
async fn test_codec_filter_installed_on_invite() {
    let h = registered(call_script(CallScript::Silent)).await;
    h.phone.place_call("2002").await.unwrap();

    let session = h.factory.last_session().unwrap();
    assert_eq!(session.target().to_string(), "sip:2002@example.com");
    assert!(session.options().local_stream.is_some());
    assert!(session.options().audio);
    assert!(!session.options().video);
    assert_eq!(session.options().modifiers.len(), 1);

    let offer = SessionDescription::new(
        SdpType::Offer,
        "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 0 8 101\r\na=rtpmap:0 PCMU/8000\r\na=rtpmap:8 PCMA/8000\r\na=rtpmap:101 telephone-event/8000\r\na=fmtp:101 0-16\r\n",
    );
    let filtered = session.options().modifiers[0].modify(offer);
    assert_eq!(
        filtered.sdp,
        "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 0 8\r\na=rtpmap:0 PCMU/8000\r\na=rtpmap:8 PCMA/8000\r\n"
    );
}

// ===== Call lifecycle =====

#[tokio::test]
async fn test_answered_call_attaches_remote_audio_once() {
    let mut h = registered(call_script(CallScript::Answer)).await;

    let call_id = h.phone.place_call("2002").await.unwrap();
    wait_call_state(&mut h.rx, CallState::Established).await;
    settle().await;

    let session = h.factory.last_session().unwrap();
    assert_eq!(h.playback.attached(), vec![session.remote().id().to_string()]);
    assert_eq!(h.phone.call_state(), CallState::Established);
    assert_eq!(h.phone.status_text(), "Call established");
    assert!(h.phone.diagnostics().is_bound(session.transport().id()));

    let active = h.phone.active_call().unwrap();
    assert_eq!(active.call_id, call_id);
    assert!(active.connected_at.is_some());

    h.phone.hangup().await;

    assert_eq!(session.byes.load(Ordering::SeqCst), 1);
    assert_eq!(h.capture.released().len(), 1);
    assert!(h.phone.active_call().is_none());
    assert!(!h.phone.diagnostics().is_bound(session.transport().id()));
    let last = h.phone.last_call().unwrap();
    assert_eq!(last.end_reason, Some(EndReason::Hangup));
    assert!(last.duration().is_some());
    assert_eq!(h.phone.status_text(), "Idle");
}

#[tokio::test]
async fn test_accept_without_track_event_attaches_remote_audio() {
    let mut h = registered(call_script(CallScript::Silent)).await;
    h.phone.place_call("2002").await.unwrap();
    let session = h.factory.last_session().unwrap();

    session.accept();
    wait_call_state(&mut h.rx, CallState::Established).await;
    settle().await;

    assert_eq!(h.playback.attached(), vec![session.remote().id().to_string()]);

    h.phone.hangup().await;
    assert_eq!(h.capture.outstanding(), 0);
}

#[tokio::test]
async fn test_track_event_attaches_before_answer() {
    let mut h = registered(call_script(CallScript::Silent)).await;
    h.phone.place_call("2002").await.unwrap();
    let session = h.factory.last_session().unwrap();
    let remote = session.remote().id().to_string();

    session.deliver_track();
    settle().await;

    assert_eq!(h.playback.attached(), vec![remote.clone()]);
    assert_eq!(h.phone.call_state(), CallState::Dialing);

    // A repeated track and the later answer reuse the attached stream
    session.deliver_track();
    session.accept();
    wait_call_state(&mut h.rx, CallState::Established).await;
    settle().await;

    assert_eq!(h.playback.attached(), vec![remote]);

    h.phone.hangup().await;
    assert_eq!(h.capture.outstanding(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_places_claim_one_slot() {
    let h = registered(call_script(CallScript::Silent)).await;
    let gate = h.capture.hold();

    let first = tokio::spawn({
        let phone = h.phone.clone();
        async move { phone.place_call("2002").await }
    });
    let second = tokio::spawn({
        let phone = h.phone.clone();
        async move { phone.place_call("2003").await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    gate.add_permits(2);

    let results = [first.await.unwrap(), second.await.unwrap()];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .any(|r| *r == Err(PhoneError::CallAlreadyActive))
    );

    // The loser's microphone went back and its session never left
    assert_eq!(h.capture.outstanding(), 1);
    assert_eq!(h.capture.released().len(), h.capture.acquired() - 1);
    let invites: usize = h
        .factory
        .last_agent()
        .unwrap()
        .sessions()
        .iter()
        .map(|s| s.invites.load(Ordering::SeqCst))
        .sum();
    assert_eq!(invites, 1);
    assert!(h.phone.active_call().is_some());

    h.phone.hangup().await;
    assert_eq!(h.capture.outstanding(), 0);
}

#[tokio::test]
async fn test_ringing_is_reported() {
    let mut h = registered(call_script(CallScript::Answer)).await;
    h.phone.place_call("2002").await.unwrap();

    wait_call_state(&mut h.rx, CallState::Ringing).await;
    wait_call_state(&mut h.rx, CallState::Established).await;
}

#[tokio::test]
async fn test_rejected_call_releases_once() {
    let mut h = registered(call_script(CallScript::Reject(SipResponse::new(
        486,
        "Busy Here",
    ))))
    .await;

    h.phone.place_call("2002").await.unwrap();
    wait_call_state(&mut h.rx, CallState::Idle).await;
    settle().await;

    assert_eq!(h.capture.released().len(), 1);
    assert_eq!(h.capture.outstanding(), 0);
    assert!(h.phone.active_call().is_none());
    assert_eq!(h.phone.status_text(), "Call failed (486 Busy Here)");
    assert_eq!(
        h.phone.last_call().unwrap().end_reason,
        Some(EndReason::Rejected("486 Busy Here".into()))
    );
    assert!(h.playback.attached().is_empty());
}

#[tokio::test]
async fn test_bye_failure_still_releases_once() {
    let mut h = registered(UserAgentScript {
        bye_error: Some("transport closed".into()),
        ..call_script(CallScript::Answer)
    })
    .await;
    h.phone.place_call("2002").await.unwrap();
    wait_call_state(&mut h.rx, CallState::Established).await;

    h.phone.hangup().await;
    settle().await;

    assert_eq!(h.capture.released().len(), 1);
    assert!(h.phone.active_call().is_none());
}

#[tokio::test]
async fn test_cancel_failure_still_releases_once() {
    let h = registered(UserAgentScript {
        cancel_error: Some("481 Call Does Not Exist".into()),
        ..call_script(CallScript::Silent)
    })
    .await;
    h.phone.place_call("2002").await.unwrap();

    h.phone.hangup().await;
    settle().await;

    let session = h.factory.last_session().unwrap();
    assert_eq!(session.cancels.load(Ordering::SeqCst), 1);
    assert_eq!(session.byes.load(Ordering::SeqCst), 0);
    assert_eq!(h.capture.released().len(), 1);
    assert!(h.phone.active_call().is_none());
}

#[tokio::test]
async fn test_invite_error_releases_once() {
    let h = registered(call_script(CallScript::InviteError("ws closed".into()))).await;

    let result = h.phone.place_call("2002").await;
    settle().await;

    assert!(matches!(result, Err(PhoneError::InviteFailed { .. })));
    assert_eq!(h.capture.released().len(), 1);
    assert!(h.phone.active_call().is_none());
    assert_eq!(h.phone.status_text(), "Call failed (invite error)");
}

#[tokio::test]
async fn test_reject_racing_hangup_releases_once() {
    let h = registered(call_script(CallScript::Silent)).await;
    h.phone.place_call("2002").await.unwrap();
    let session = h.factory.last_session().unwrap();

    session.reject(SipResponse::new(487, "Request Terminated"));
    h.phone.hangup().await;
    settle().await;

    assert_eq!(h.capture.released().len(), 1);
    assert!(h.phone.active_call().is_none());
}

#[tokio::test]
async fn test_hangup_when_idle_is_noop() {
    let mut h = registered(UserAgentScript::default()).await;
    settle().await;
    while h.rx.try_recv().is_ok() {}
    let status = h.phone.status_text();

    h.phone.hangup().await;

    assert!(matches!(h.rx.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(h.phone.call_state(), CallState::Idle);
    assert_eq!(h.phone.status_text(), status);
}

#[tokio::test]
async fn test_stop_hangs_up_active_call() {
    let mut h = registered(call_script(CallScript::Answer)).await;
    h.phone.place_call("2002").await.unwrap();
    wait_call_state(&mut h.rx, CallState::Established).await;

    h.phone.stop().await;
    settle().await;

    let session = h.factory.last_session().unwrap();
    assert_eq!(session.byes.load(Ordering::SeqCst), 1);
    assert_eq!(h.capture.outstanding(), 0);
    assert_eq!(h.phone.registration_state(), RegistrationState::Idle);
    assert!(h.phone.active_call().is_none());
}

#[tokio::test]
async fn test_remote_bye_terminates_call() {
    let mut h = registered(call_script(CallScript::Answer)).await;
    h.phone.place_call("2002").await.unwrap();
    wait_call_state(&mut h.rx, CallState::Established).await;

    let session = h.factory.last_session().unwrap();
    session.emit(crate::signaling::SessionEvent::StateChanged(
        crate::signaling::SessionState::Terminated,
    ));
    wait_call_state(&mut h.rx, CallState::Idle).await;

    assert_eq!(h.capture.released().len(), 1);
    assert_eq!(
        h.phone.last_call().unwrap().end_reason,
        Some(EndReason::SessionTerminated)
    );
}
