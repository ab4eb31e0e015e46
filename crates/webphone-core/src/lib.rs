//! # webphone-core
//!
//! Coordination core of a SIP-over-WebSocket phone: it registers one identity,
//! places one outbound audio call at a time and watches the media path.
//!
//! The signaling library, the media transport and the audio devices are
//! supplied from outside through the traits in [`signaling`], [`transport`]
//! and [`media`]. What lives here:
//!
//! - [`sdp::CodecFilter`]: rewrites offers and answers so only allow-listed
//!   audio codecs are negotiated
//! - [`diagnostics::ConnectivityDiagnostics`]: candidate, ICE and selected-pair
//!   reporting plus periodic transport-quality samples
//! - [`registration::RegistrationController`] and [`call::CallController`]:
//!   explicit state machines that tolerate failure at every step and release
//!   the microphone exactly once per call
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # #[cfg(feature = "mock")]
//! # async fn demo() -> webphone_core::PhoneResult<()> {
//! use webphone_core::mock::{MockMediaCapture, MockPlayback, MockUserAgentFactory};
//! use webphone_core::{Credentials, PhoneConfig, WebPhone};
//!
//! let phone = WebPhone::builder()
//!     .config(PhoneConfig::default().with_dtmf(true))
//!     .user_agent_factory(MockUserAgentFactory::new(Default::default()))
//!     .media_capture(MockMediaCapture::new())
//!     .playback(MockPlayback::new())
//!     .build()?;
//!
//! phone
//!     .start(&Credentials::new("1001", "secret", "example.com", ""))
//!     .await?;
//! let call_id = phone.place_call("2002").await?;
//! println!("{call_id}: {}", phone.status_text());
//! phone.hangup().await;
//! phone.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod media;
pub mod phone;
pub mod registration;
pub mod sdp;
pub mod signaling;
pub mod transport;
pub mod uri;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

#[cfg(test)]
mod tests;

// Re-export main types
pub use call::{CallController, CallId, CallInfo, CallState, EndReason};
pub use config::{Credentials, IceServerConfig, IceTransportPolicy, PhoneConfig};
pub use context::AppSessionContext;
pub use diagnostics::{ConnectivityDiagnostics, DiagnosticEvent};
pub use error::{ErrorCategory, PhoneError, PhoneResult};
pub use events::{EventEmitter, EventStream, PhoneEvent};
pub use phone::{WebPhone, WebPhoneBuilder};
pub use registration::{RegistrationController, RegistrationInfo, RegistrationState};
pub use sdp::{CodecFilter, SdpType, SessionDescription, SessionDescriptionModifier};
pub use uri::SipUri;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
