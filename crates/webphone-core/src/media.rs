//! Local capture and remote playback collaborators
//!
//! The core never touches audio devices. It asks a [`MediaCapture`] provider
//! for an audio-only [`LocalStream`] when a call is placed and hands it back
//! exactly once when the call ends; remote audio is handed to a
//! [`PlaybackSink`].

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MediaError;

/// Handle to a captured local audio stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalStream {
    id: String,
}

impl LocalStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// A stream with a fresh random id
    pub fn generate() -> Self {
        Self::new(format!("local-{}", Uuid::new_v4()))
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for LocalStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Handle to a remote media stream delivered by the transport
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteStream {
    id: String,
}

impl RemoteStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Microphone access
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Acquire an audio-only capture stream
    async fn acquire(&self) -> Result<LocalStream, MediaError>;

    /// Stop every track of a previously acquired stream
    fn release(&self, stream: LocalStream);
}

/// Remote audio output
pub trait PlaybackSink: Send + Sync {
    /// Route a remote stream to the speaker; replaces any previous stream
    fn attach(&self, stream: &RemoteStream);
}
