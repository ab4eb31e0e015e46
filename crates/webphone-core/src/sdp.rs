//! SDP codec filtering
//!
//! This module owns the only wire format the phone core touches: SDP text.
//! [`CodecFilter`] rewrites the first audio media section of an offer or answer
//! so that only payload types whose codec is in the allow-list survive, both on
//! the `m=` line and in the payload-scoped attributes (`a=rtpmap:`, `a=fmtp:`,
//! `a=rtcp-fb:`). Everything else is passed through byte for byte.
//!
//! The filter never produces an audio section without a payload type: when the
//! allow-list matches nothing, the input is returned unchanged. Filtering is
//! idempotent.
//!
//! # Example
//!
//! ```rust
//! use webphone_core::sdp::{CodecFilter, SdpType, SessionDescription};
//!
//! let offer = SessionDescription::new(
//!     SdpType::Offer,
//!     "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111 0 8\r\na=rtpmap:111 opus/48000/2\r\na=rtpmap:0 PCMU/8000\r\na=rtpmap:8 PCMA/8000\r\n",
//! );
//! let filtered = CodecFilter::new(["pcmu", "pcma"]).apply(&offer);
//!
//! assert!(filtered.sdp.contains("m=audio 9 UDP/TLS/RTP/SAVPF 0 8\r\n"));
//! assert!(!filtered.sdp.contains("opus"));
//! ```

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::PhoneConfig;

const RTPMAP: &str = "a=rtpmap:";
const FMTP: &str = "a=fmtp:";
const RTCP_FB: &str = "a=rtcp-fb:";

/// Offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// An SDP offer or answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// Raw SDP text
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(sdp_type: SdpType, sdp: impl Into<String>) -> Self {
        Self {
            sdp_type,
            sdp: sdp.into(),
        }
    }

    /// Line separator used by this description (CRLF unless only LF is present)
    pub fn line_separator(&self) -> &'static str {
        line_separator(&self.sdp)
    }

    /// The description split into lines
    pub fn lines(&self) -> Vec<&str> {
        self.sdp.split(self.line_separator()).collect()
    }

    /// Codec mappings of the first audio section, in `a=rtpmap:` order
    pub fn audio_codecs(&self) -> Vec<PayloadMapping> {
        let lines = self.lines();
        match audio_section(&lines) {
            Some(section) => payload_mappings(&lines[section.start..section.end]),
            None => Vec::new(),
        }
    }
}

/// A contiguous run of lines starting at an `m=` line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaSection {
    /// Index of the `m=` line
    pub start: usize,
    /// Index one past the last line of the section
    pub end: usize,
}

/// Payload type id to codec name, from one `a=rtpmap:` line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadMapping {
    /// Numeric payload type as written in the SDP
    pub payload_type: String,
    /// Lowercased encoding name (text before the first `/`)
    pub codec: String,
}

/// Rewrites session descriptions before they are sent or applied
pub trait SessionDescriptionModifier: Send + Sync {
    fn modify(&self, description: SessionDescription) -> SessionDescription;
}

/// Restricts the first audio section to an allow-list of codecs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecFilter {
    allowed: BTreeSet<String>,
    enabled: bool,
}

impl CodecFilter {
    /// Create an enabled filter; codec names are compared case-insensitively
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed: allowed
                .into_iter()
                .map(|c| c.as_ref().to_ascii_lowercase())
                .collect(),
            enabled: true,
        }
    }

    /// Build the filter described by the phone configuration
    pub fn from_config(config: &PhoneConfig) -> Self {
        Self {
            allowed: config.allowed_codecs.clone(),
            enabled: config.codec_filter_enabled,
        }
    }

    /// A filter that passes everything through
    pub fn disabled() -> Self {
        Self {
            allowed: BTreeSet::new(),
            enabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Filter a description, returning a clone of the input when nothing changes
    pub fn apply(&self, description: &SessionDescription) -> SessionDescription {
        if !self.enabled || description.sdp.is_empty() {
            return description.clone();
        }
        match self.filter_text(&description.sdp) {
            Some(sdp) => SessionDescription::new(description.sdp_type, sdp),
            None => description.clone(),
        }
    }

    /// Filter raw SDP text; `None` means the input must be used unchanged
    pub fn filter_text(&self, sdp: &str) -> Option<String> {
        let separator = line_separator(sdp);
        let lines: Vec<&str> = sdp.split(separator).collect();
        let section = audio_section(&lines)?;
        let audio = &lines[section.start..section.end];

        let kept: HashSet<&str> = audio
            .iter()
            .filter_map(|line| parse_rtpmap(line))
            .filter(|(_, codec)| self.allowed.contains(codec))
            .map(|(pt, _)| pt)
            .collect();
        if kept.is_empty() {
            return None;
        }

        let mut tokens = audio[0].split(' ');
        let prefix: Vec<&str> = tokens.by_ref().take(3).collect();
        let payloads: Vec<&str> = tokens.filter(|pt| kept.contains(pt)).collect();
        if payloads.is_empty() {
            return None;
        }

        let m_line = prefix
            .iter()
            .chain(payloads.iter())
            .copied()
            .collect::<Vec<_>>()
            .join(" ");

        let mut out: Vec<&str> = Vec::with_capacity(lines.len());
        out.extend_from_slice(&lines[..section.start]);
        out.push(&m_line);
        for line in &audio[1..] {
            match scoped_payload(line) {
                Some(pt) if !kept.contains(pt) => continue,
                _ => out.push(*line),
            }
        }
        out.extend_from_slice(&lines[section.end..]);

        Some(out.join(separator))
    }
}

impl SessionDescriptionModifier for CodecFilter {
    fn modify(&self, description: SessionDescription) -> SessionDescription {
        if !self.enabled {
            return description;
        }
        self.apply(&description)
    }
}

fn line_separator(sdp: &str) -> &'static str {
    if sdp.contains("\r\n") || !sdp.contains('\n') {
        "\r\n"
    } else {
        "\n"
    }
}

/// Every media section of a description, in order
pub fn media_sections(lines: &[&str]) -> Vec<MediaSection> {
    let starts: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| line.starts_with("m="))
        .map(|(i, _)| i)
        .collect();
    starts
        .iter()
        .enumerate()
        .map(|(n, &start)| MediaSection {
            start,
            end: starts.get(n + 1).copied().unwrap_or(lines.len()),
        })
        .collect()
}

fn audio_section(lines: &[&str]) -> Option<MediaSection> {
    media_sections(lines)
        .into_iter()
        .find(|s| lines[s.start].starts_with("m=audio "))
}

/// Mappings declared by the `a=rtpmap:` lines of one section
pub fn payload_mappings(section: &[&str]) -> Vec<PayloadMapping> {
    section
        .iter()
        .filter_map(|line| parse_rtpmap(line))
        .map(|(pt, codec)| PayloadMapping {
            payload_type: pt.to_string(),
            codec,
        })
        .collect()
}

fn parse_rtpmap(line: &str) -> Option<(&str, String)> {
    let rest = line.strip_prefix(RTPMAP)?;
    let mut parts = rest.split(' ');
    let pt = parts.next()?;
    let encoding = parts.next().unwrap_or("");
    let codec = encoding.split('/').next().unwrap_or("").to_ascii_lowercase();
    Some((pt, codec))
}

/// Payload type a line is scoped to, for `a=rtpmap:`, `a=fmtp:` and `a=rtcp-fb:`
fn scoped_payload(line: &str) -> Option<&str> {
    [RTPMAP, FMTP, RTCP_FB]
        .iter()
        .find_map(|prefix| line.strip_prefix(prefix))
        .map(|rest| rest.split(' ').next().unwrap_or(""))
}
