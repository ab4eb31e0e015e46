//! candidate - Classify ICE candidate lines

use webphone_core::PhoneConfig;
use webphone_core::diagnostics::CandidateRecord;

/// Execute candidate command
pub fn execute(config: &PhoneConfig, lines: &[String], preview: Option<usize>) {
    let preview = preview.unwrap_or(config.candidate_preview_len);
    for line in lines {
        println!("{}", CandidateRecord::parse(line, preview));
    }
}
