//! filter-sdp - Apply the codec filter to an SDP file

use std::io::Read;
use std::path::Path;

use anyhow::Context;
use tracing::info;
use webphone_core::sdp::{CodecFilter, SdpType, SessionDescription, SessionDescriptionModifier};
use webphone_core::PhoneConfig;

/// Execute filter-sdp command
pub fn execute(
    config: PhoneConfig,
    file: &Path,
    allow: Option<Vec<String>>,
    dtmf: bool,
    answer: bool,
) -> anyhow::Result<()> {
    let text = read_sdp(file)?;
    let filtered = filter_sdp(config, text, allow, dtmf, answer);
    print!("{}", filtered.sdp);
    Ok(())
}

/// Read SDP text from `file`, or stdin for `-`
fn read_sdp(file: &Path) -> anyhow::Result<String> {
    if file.as_os_str() == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("reading SDP from stdin")?;
        Ok(text)
    } else {
        std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))
    }
}

fn filter_sdp(
    mut config: PhoneConfig,
    text: String,
    allow: Option<Vec<String>>,
    dtmf: bool,
    answer: bool,
) -> SessionDescription {
    if let Some(codecs) = allow {
        config = config.with_allowed_codecs(codecs);
    }
    if dtmf {
        config = config.with_dtmf(true);
    }
    let sdp_type = if answer { SdpType::Answer } else { SdpType::Offer };
    let description = SessionDescription::new(sdp_type, text);

    let before = description.audio_codecs();
    let filtered = CodecFilter::from_config(&config).modify(description);
    let after = filtered.audio_codecs();
    info!(
        allowed = ?config.allowed_codecs,
        before = before.len(),
        after = after.len(),
        "filtered audio section"
    );
    filtered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> String {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/offer.sdp");
        read_sdp(&path).unwrap()
    }

    fn codecs(description: &SessionDescription) -> Vec<String> {
        description
            .audio_codecs()
            .into_iter()
            .map(|m| m.codec)
            .collect()
    }

    #[test]
    fn default_policy_keeps_g711() {
        let filtered = filter_sdp(PhoneConfig::default(), fixture(), None, false, false);

        assert_eq!(codecs(&filtered), vec!["pcmu", "pcma"]);
        assert!(filtered.lines().contains(&"m=audio 9 UDP/TLS/RTP/SAVPF 0 8"));
        assert!(!filtered.sdp.contains("opus"));
        assert!(!filtered.sdp.contains("a=rtcp-fb:111"));
        assert!(filtered.sdp.contains("a=ice-ufrag:F7gI\r\n"));
        assert!(filtered.sdp.ends_with("a=rtpmap:8 PCMA/8000\r\n"));
        assert_eq!(filtered.sdp_type, SdpType::Offer);
    }

    #[test]
    fn allow_list_and_dtmf_flags_apply() {
        let filtered = filter_sdp(
            PhoneConfig::default(),
            fixture(),
            Some(vec!["PCMA".into()]),
            true,
            true,
        );

        assert_eq!(codecs(&filtered), vec!["pcma", "telephone-event"]);
        assert!(filtered.lines().contains(&"m=audio 9 UDP/TLS/RTP/SAVPF 8 101"));
        assert!(filtered.lines().contains(&"a=fmtp:101 0-16"));
        assert_eq!(filtered.sdp_type, SdpType::Answer);
    }

    #[test]
    fn unknown_codecs_leave_the_offer_alone() {
        let text = fixture();
        let filtered = filter_sdp(
            PhoneConfig::default(),
            text.clone(),
            Some(vec!["g722".into()]),
            false,
            false,
        );
        assert_eq!(filtered.sdp, text);
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = read_sdp(Path::new("/nonexistent/offer.sdp")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/offer.sdp"));
    }
}
