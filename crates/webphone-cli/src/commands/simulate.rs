//! simulate - Scripted registration and call run
//!
//! Drives a [`WebPhone`] wired to the in-memory collaborators so the whole
//! lifecycle (registration, dialing, media diagnostics, hangup) can be
//! watched from a terminal without a SIP server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use webphone_core::diagnostics::stats::{
    CandidatePairStats, CandidateStats, InboundRtpStats, OutboundRtpStats, StatsReport,
    StatsSnapshot, TransportStats,
};
use webphone_core::mock::{
    CallScript, MockMediaCapture, MockPlayback, MockUserAgentFactory, RegisterScript,
    UserAgentScript,
};
use webphone_core::signaling::SipResponse;
use webphone_core::{Credentials, PhoneConfig, PhoneEvent, WebPhone};

use crate::Outcome;

/// Parameters of one simulated run
#[derive(Debug)]
pub struct Run {
    pub ext: String,
    pub password: String,
    pub domain: String,
    pub server: String,
    pub dial: String,
    pub outcome: Outcome,
    pub register_reject: Option<u16>,
    pub hold: Duration,
    pub json: bool,
}

fn script(run: &Run) -> UserAgentScript {
    let register = match run.register_reject {
        Some(code) => RegisterScript::Reject(SipResponse::new(code, reason_for(code))),
        None => RegisterScript::Accept(SipResponse::new(200, "OK")),
    };
    // Answered calls are driven by hand so stats are in place before ICE connects
    let call = match run.outcome {
        Outcome::Answer | Outcome::Silent => CallScript::Silent,
        Outcome::Busy => CallScript::Reject(SipResponse::new(486, "Busy Here")),
        Outcome::InviteError => CallScript::InviteError("websocket closed".into()),
    };
    UserAgentScript {
        register,
        call,
        ..Default::default()
    }
}

fn reason_for(code: u16) -> &'static str {
    match code {
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        503 => "Service Unavailable",
        _ => "Rejected",
    }
}

/// Stats a relayed audio call would report
fn relay_snapshot() -> StatsSnapshot {
    StatsSnapshot::new(vec![
        StatsReport::Transport(TransportStats {
            id: "T01".into(),
            selected_candidate_pair_id: Some("CP01".into()),
        }),
        StatsReport::CandidatePair(CandidatePairStats {
            id: "CP01".into(),
            state: Some("succeeded".into()),
            local_candidate_id: Some("L01".into()),
            remote_candidate_id: Some("R01".into()),
            nominated: true,
            current_round_trip_time: Some(0.042),
            ..Default::default()
        }),
        StatsReport::LocalCandidate(CandidateStats {
            id: "L01".into(),
            candidate_type: Some("relay".into()),
            address: Some("203.0.113.7".into()),
            port: Some(49170),
        }),
        StatsReport::RemoteCandidate(CandidateStats {
            id: "R01".into(),
            candidate_type: Some("srflx".into()),
            address: Some("198.51.100.23".into()),
            port: Some(61022),
        }),
        StatsReport::OutboundRtp(OutboundRtpStats {
            id: "OA01".into(),
            kind: "audio".into(),
            bytes_sent: 48_000,
        }),
        StatsReport::InboundRtp(InboundRtpStats {
            id: "IA01".into(),
            kind: "audio".into(),
            bytes_received: 46_720,
            packets_lost: 3,
            jitter: Some(0.004),
        }),
    ])
}

fn print_event(event: &PhoneEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!("failed to encode event: {}", e),
        }
        return;
    }
    match event {
        PhoneEvent::RegistrationStateChanged {
            previous,
            current,
            reason,
        } => match reason {
            Some(reason) => println!("registration: {previous} -> {current} ({reason})"),
            None => println!("registration: {previous} -> {current}"),
        },
        PhoneEvent::TransportStateChanged { state } => println!("transport: {state}"),
        PhoneEvent::CallStateChanged {
            previous,
            current,
            reason,
            ..
        } => match reason {
            Some(reason) => println!("call: {previous} -> {current} ({reason})"),
            None => println!("call: {previous} -> {current}"),
        },
        PhoneEvent::RemoteMediaAttached { stream_id, .. } => {
            println!("media: remote audio attached ({stream_id})")
        }
        PhoneEvent::LocalMediaReleased { stream_id } => {
            println!("media: microphone released ({stream_id})")
        }
        PhoneEvent::Diagnostic(diagnostic) => println!("ice: {diagnostic}"),
    }
}

/// Execute simulate command
pub async fn execute(mut config: PhoneConfig, run: Run) -> anyhow::Result<()> {
    // One second samples keep a short hold interesting
    if config.stats_interval > Duration::from_secs(1) {
        config = config.with_stats_interval(Duration::from_secs(1));
    }

    let factory = MockUserAgentFactory::new(script(&run));
    let capture = MockMediaCapture::new();
    let playback = MockPlayback::new();
    let phone = WebPhone::builder()
        .config(config)
        .user_agent_factory(factory.clone())
        .media_capture(capture.clone())
        .playback(playback)
        .build()
        .context("building phone")?;

    let mut events = phone.subscribe();
    let json = run.json;
    let printer = tokio::spawn(async move {
        while let Some(item) = events.next().await {
            match item {
                Ok(event) => print_event(&event, json),
                Err(e) => warn!("event printer lagged: {}", e),
            }
        }
    });

    let credentials = Credentials::new(&run.ext, &run.password, &run.domain, &run.server);
    info!("Registering {}@{}", run.ext.trim(), run.domain.trim());
    let result = simulate_call(&phone, &factory, &credentials, &run).await;

    phone.shutdown().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    printer.abort();

    info!(
        "Microphone streams acquired {}, still held {}",
        capture.acquired(),
        capture.outstanding()
    );
    println!("status: {}", phone.status_text());
    result
}

async fn simulate_call(
    phone: &WebPhone,
    factory: &Arc<MockUserAgentFactory>,
    credentials: &Credentials,
    run: &Run,
) -> anyhow::Result<()> {
    phone.start(credentials).await.context("registration")?;
    if let Some(info) = phone.registration_info() {
        info!("Registered {} via {}", info.uri, info.server);
    }

    let call_id = phone.place_call(&run.dial).await.context("placing call")?;
    info!("Call {} placed to {}", call_id, run.dial);

    if run.outcome == Outcome::Answer {
        if let Some(session) = factory.last_session() {
            session.transport().set_stats(relay_snapshot());
            session.answer();
        }
    }

    tokio::time::sleep(run.hold).await;

    if let Some(call) = phone.active_call() {
        info!("Hanging up {} ({})", call.destination, call.state);
        phone.hangup().await;
    }
    if let Some(last) = phone.last_call() {
        match (&last.end_reason, last.duration()) {
            (Some(reason), Some(duration)) => {
                info!("Call ended: {} after {}s", reason, duration.num_seconds())
            }
            (Some(reason), None) => info!("Call ended: {}", reason),
            _ => info!("Call ended"),
        }
    }
    Ok(())
}
