//! Register, call and hang up through the public facade
#![cfg(feature = "mock")]

use std::time::Duration;

use futures::StreamExt;
use webphone_core::diagnostics::{CandidateType, DiagnosticEvent};
use webphone_core::mock::{
    CallScript, MockMediaCapture, MockPlayback, MockUserAgentFactory, UserAgentScript,
};
use webphone_core::{
    CallState, Credentials, EventStream, PhoneConfig, PhoneError, PhoneEvent, RegistrationState,
    WebPhone,
};

fn phone(script: UserAgentScript) -> (WebPhone, std::sync::Arc<MockMediaCapture>) {
    let capture = MockMediaCapture::new();
    let phone = WebPhone::builder()
        .config(PhoneConfig::default())
        .user_agent_factory(MockUserAgentFactory::new(script))
        .media_capture(capture.clone())
        .playback(MockPlayback::new())
        .build()
        .unwrap();
    (phone, capture)
}

async fn next_matching(
    events: &mut EventStream,
    pred: impl Fn(&PhoneEvent) -> bool,
) -> PhoneEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(item) = events.next().await {
            if let Ok(event) = item {
                if pred(&event) {
                    return event;
                }
            }
        }
        panic!("event stream ended");
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn test_builder_requires_collaborators() {
    let result = WebPhone::builder().build();
    assert!(matches!(result, Err(PhoneError::Configuration { .. })));
}

#[tokio::test]
async fn test_full_call_flow() {
    let (phone, capture) = phone(UserAgentScript::default());
    let mut events = phone.subscribe();
    let mut diagnostics = phone.subscribe();

    phone
        .start(&Credentials::new(" 1001 ", "s3cret", "example.com", ""))
        .await
        .unwrap();
    assert_eq!(phone.registration_state(), RegistrationState::Registered);
    assert_eq!(
        phone.registration_info().unwrap().server,
        "wss://example.com/ws"
    );

    let call_id = phone.place_call("2002").await.unwrap();

    let established = next_matching(&mut events, |e| {
        matches!(e, PhoneEvent::CallStateChanged { current: CallState::Established, .. })
    })
    .await;
    match established {
        PhoneEvent::CallStateChanged { call_id: id, .. } => assert_eq!(id, call_id),
        _ => unreachable!(),
    }

    let candidate = next_matching(&mut diagnostics, |e| {
        matches!(e, PhoneEvent::Diagnostic(DiagnosticEvent::Candidate { .. }))
    })
    .await;
    match candidate {
        PhoneEvent::Diagnostic(DiagnosticEvent::Candidate { label, record }) => {
            assert_eq!(label, "outbound");
            assert_eq!(record.candidate_type, CandidateType::Host);
        }
        _ => unreachable!(),
    }

    phone.hangup().await;
    next_matching(&mut events, |e| {
        matches!(e, PhoneEvent::LocalMediaReleased { .. })
    })
    .await;

    assert_eq!(capture.outstanding(), 0);
    assert_eq!(phone.call_state(), CallState::Idle);

    phone.shutdown().await;
    assert_eq!(phone.registration_state(), RegistrationState::Idle);
    assert_eq!(phone.status_text(), "Idle");
}

#[tokio::test]
async fn test_two_phones_are_independent() {
    let (alice, _) = phone(UserAgentScript::default());
    let (bob, _) = phone(UserAgentScript {
        call: CallScript::Silent,
        ..Default::default()
    });

    alice
        .start(&Credentials::new("1001", "a", "example.com", ""))
        .await
        .unwrap();

    assert_eq!(alice.registration_state(), RegistrationState::Registered);
    assert_eq!(bob.registration_state(), RegistrationState::Idle);
    assert_eq!(bob.place_call("1001").await, Err(PhoneError::NotRegistered));
}
