//! Codec filtering through the public API

use webphone_core::config::PhoneConfig;
use webphone_core::sdp::{CodecFilter, SdpType, SessionDescription, SessionDescriptionModifier};

const OFFER: &str = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111 0 8 101\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtcp:9 IN IP4 0.0.0.0\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=fmtp:111 minptime=10;useinbandfec=1\r\n\
a=rtcp-fb:111 transport-cc\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:8 PCMA/8000\r\n\
a=rtpmap:101 telephone-event/8000\r\n\
a=fmtp:101 0-16\r\n\
a=sendrecv\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
a=rtpmap:96 VP8/90000\r\n";

fn offer() -> SessionDescription {
    SessionDescription::new(SdpType::Offer, OFFER)
}

#[test]
fn test_g711_only_offer() {
    let filter = CodecFilter::from_config(&PhoneConfig::default());
    let out = filter.modify(offer());

    assert_eq!(out.sdp_type, SdpType::Offer);
    assert!(out.sdp.contains("\r\nm=audio 9 UDP/TLS/RTP/SAVPF 0 8\r\n"));
    assert!(out.sdp.contains("a=rtpmap:0 PCMU/8000"));
    assert!(out.sdp.contains("a=rtpmap:8 PCMA/8000"));
    assert!(!out.sdp.contains("opus"));
    assert!(!out.sdp.contains("a=fmtp:111"));
    assert!(!out.sdp.contains("a=rtcp-fb:111"));
    assert!(!out.sdp.contains("telephone-event"));
    assert!(!out.sdp.contains("a=fmtp:101"));
    // Session-level and non-payload audio attributes survive
    assert!(out.sdp.contains("a=rtcp:9 IN IP4 0.0.0.0"));
    assert!(out.sdp.contains("a=sendrecv"));
}

#[test]
fn test_video_section_untouched() {
    let filter = CodecFilter::from_config(&PhoneConfig::default());
    let out = filter.modify(offer());

    assert!(out.sdp.ends_with("m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=rtpmap:96 VP8/90000\r\n"));
}

#[test]
fn test_filter_is_idempotent() {
    let filter = CodecFilter::from_config(&PhoneConfig::default());
    let once = filter.modify(offer());
    let twice = filter.modify(once.clone());

    assert_eq!(once, twice);
}

#[test]
fn test_dtmf_kept_when_enabled() {
    let config = PhoneConfig::default().with_dtmf(true);
    let out = CodecFilter::from_config(&config).modify(offer());

    assert!(out.sdp.contains("m=audio 9 UDP/TLS/RTP/SAVPF 0 8 101\r\n"));
    assert!(out.sdp.contains("a=fmtp:101 0-16"));
}

#[test]
fn test_no_allowed_codec_returns_input() {
    let config = PhoneConfig::default().with_allowed_codecs(["g722"]);
    let out = CodecFilter::from_config(&config).modify(offer());

    assert_eq!(out.sdp, OFFER);
}

#[test]
fn test_disabled_filter_passes_through() {
    let config = PhoneConfig::default().with_codec_filter(false);
    let filter = CodecFilter::from_config(&config);

    assert!(!filter.is_enabled());
    assert_eq!(filter.modify(offer()).sdp, OFFER);
}

#[test]
fn test_answer_is_filtered_too() {
    let answer = SessionDescription::new(
        SdpType::Answer,
        "v=0\r\nm=audio 9 RTP/AVP 8 0 101\r\na=rtpmap:8 PCMA/8000\r\na=rtpmap:0 PCMU/8000\r\na=rtpmap:101 telephone-event/8000\r\n",
    );
    let out = CodecFilter::new(["PCMU", "PCMA"]).modify(answer);

    assert_eq!(out.sdp_type, SdpType::Answer);
    assert_eq!(
        out.sdp,
        "v=0\r\nm=audio 9 RTP/AVP 8 0\r\na=rtpmap:8 PCMA/8000\r\na=rtpmap:0 PCMU/8000\r\n"
    );
}

#[test]
fn test_config_from_json_drives_filter() {
    let config = PhoneConfig::from_json_str(
        r#"{ "allowed_codecs": ["pcma"], "stats_interval_ms": 5000 }"#,
    )
    .unwrap();
    let out = CodecFilter::from_config(&config).modify(offer());

    assert!(out.sdp.contains("m=audio 9 UDP/TLS/RTP/SAVPF 8\r\n"));
    assert!(!out.sdp.contains("a=rtpmap:0 "));
    assert_eq!(config.stats_interval.as_secs(), 5);
}
