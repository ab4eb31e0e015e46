//! ICE candidate classification

use std::fmt;

use serde::{Deserialize, Serialize};

/// Candidate type as announced by the `typ` token of a candidate line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateType {
    Host,
    Srflx,
    Relay,
    Unknown,
}

impl CandidateType {
    /// Classify a raw candidate line by its `typ <word>` token
    pub fn classify(candidate: &str) -> Self {
        let mut tokens = candidate.split_whitespace();
        while let Some(token) = tokens.next() {
            if token != "typ" {
                continue;
            }
            let word: String = tokens
                .next()
                .unwrap_or("")
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .collect();
            return match word.as_str() {
                "host" => Self::Host,
                "srflx" => Self::Srflx,
                "relay" => Self::Relay,
                _ => Self::Unknown,
            };
        }
        Self::Unknown
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Host => "host",
            Self::Srflx => "srflx",
            Self::Relay => "relay",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A gathered candidate, ready for reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub candidate_type: CandidateType,
    /// Raw line, cut to the preview length
    pub raw_line: String,
}

impl CandidateRecord {
    pub fn parse(candidate: &str, preview_len: usize) -> Self {
        Self {
            candidate_type: CandidateType::classify(candidate),
            raw_line: preview(candidate, preview_len),
        }
    }
}

impl fmt::Display for CandidateRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "candidate typ={} {}", self.candidate_type, self.raw_line)
    }
}

/// Cut `text` to `max` characters, marking the cut with `...`
pub fn preview(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
