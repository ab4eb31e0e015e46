//! Phone facade
//!
//! [`WebPhone`] wires one [`AppSessionContext`] to a registration controller
//! and a call controller and exposes the operations a front end needs.
//! Instances are fully independent of each other.

use std::sync::Arc;

use tracing::info;

use crate::call::{CallController, CallId, CallInfo, CallState};
use crate::config::{Credentials, PhoneConfig};
use crate::context::AppSessionContext;
use crate::diagnostics::ConnectivityDiagnostics;
use crate::error::{ErrorCategory, PhoneError, PhoneResult};
use crate::events::{EventStream, PhoneEvent};
use crate::media::{MediaCapture, PlaybackSink};
use crate::registration::{RegistrationController, RegistrationInfo, RegistrationState};
use crate::signaling::{TransportState, UserAgentFactory};

/// Builder for [`WebPhone`]
#[derive(Default)]
pub struct WebPhoneBuilder {
    config: PhoneConfig,
    factory: Option<Arc<dyn UserAgentFactory>>,
    capture: Option<Arc<dyn MediaCapture>>,
    playback: Option<Arc<dyn PlaybackSink>>,
}

impl WebPhoneBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: PhoneConfig) -> Self {
        self.config = config;
        self
    }

    /// Signaling library entry point (required)
    pub fn user_agent_factory(mut self, factory: Arc<dyn UserAgentFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Microphone provider (required)
    pub fn media_capture(mut self, capture: Arc<dyn MediaCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Remote audio output (required)
    pub fn playback(mut self, playback: Arc<dyn PlaybackSink>) -> Self {
        self.playback = Some(playback);
        self
    }

    pub fn build(self) -> PhoneResult<WebPhone> {
        let factory = self
            .factory
            .ok_or_else(|| PhoneError::config("a user agent factory is required"))?;
        let capture = self
            .capture
            .ok_or_else(|| PhoneError::config("a media capture provider is required"))?;
        let playback = self
            .playback
            .ok_or_else(|| PhoneError::config("a playback sink is required"))?;
        self.config.validate()?;

        Ok(WebPhone::new(AppSessionContext::new(
            self.config,
            factory,
            capture,
            playback,
        )))
    }
}

/// A browser-style phone: one identity, at most one call
#[derive(Clone)]
pub struct WebPhone {
    ctx: Arc<AppSessionContext>,
    registration: RegistrationController,
    calls: CallController,
}

impl WebPhone {
    pub fn builder() -> WebPhoneBuilder {
        WebPhoneBuilder::new()
    }

    fn new(ctx: Arc<AppSessionContext>) -> Self {
        let calls = CallController::new(ctx.clone());
        let registration = RegistrationController::new(ctx.clone(), calls.clone());
        Self {
            ctx,
            registration,
            calls,
        }
    }

    /// Surface a validation or media failure on the status line
    fn report<T>(&self, result: PhoneResult<T>) -> PhoneResult<T> {
        if let Err(e) = &result {
            if e.is_validation() || e.category() == ErrorCategory::Media {
                self.ctx.set_status(e.to_string());
            }
        }
        result
    }

    /// Register `credentials`, restarting cleanly if already registered
    pub async fn start(&self, credentials: &Credentials) -> PhoneResult<()> {
        let result = self.registration.start(credentials).await;
        self.report(result)
    }

    /// Hang up, unregister and disconnect
    pub async fn stop(&self) {
        self.registration.stop().await;
    }

    /// Full stop, then drop every piece of session state
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.registration.stop().await;
        self.ctx.reset();
    }

    /// Call `destination` on the registered domain
    pub async fn place_call(&self, destination: &str) -> PhoneResult<CallId> {
        let result = self.calls.place(destination).await;
        self.report(result)
    }

    pub async fn hangup(&self) {
        self.calls.hangup().await;
    }

    pub fn registration(&self) -> &RegistrationController {
        &self.registration
    }

    pub fn calls(&self) -> &CallController {
        &self.calls
    }

    pub fn diagnostics(&self) -> &ConnectivityDiagnostics {
        self.ctx.diagnostics()
    }

    pub fn config(&self) -> &PhoneConfig {
        self.ctx.config()
    }

    pub fn registration_state(&self) -> RegistrationState {
        self.registration.state()
    }

    pub fn registration_info(&self) -> Option<RegistrationInfo> {
        self.registration.info()
    }

    pub fn transport_state(&self) -> Option<TransportState> {
        self.registration.transport_state()
    }

    pub fn call_state(&self) -> CallState {
        self.calls.state()
    }

    pub fn active_call(&self) -> Option<CallInfo> {
        self.calls.active_call()
    }

    pub fn last_call(&self) -> Option<CallInfo> {
        self.calls.last_call()
    }

    /// Human-readable status line, e.g. `Registered (200 OK)`
    pub fn status_text(&self) -> String {
        self.ctx.status()
    }

    /// Subscribe to every event this phone emits
    pub fn subscribe(&self) -> EventStream {
        self.ctx.events().subscribe()
    }

    /// Raw receiver, for callers that prefer `recv()` over a stream
    pub fn receiver(&self) -> tokio::sync::broadcast::Receiver<PhoneEvent> {
        self.ctx.events().receiver()
    }
}
