use serde::{Deserialize, Serialize};

/// RTP header extension URI negotiated for RFC 6464 audio levels.
pub const SDES_AUDIO_LEVEL_URI: &str = "urn:ietf:params:rtp-hdrext:ssrc-audio-level";
/// RTP header extension URI negotiated for transport-wide sequence numbers.
pub const TRANSPORT_CC_URI: &str =
    "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01";

pub const MIME_TYPE_VP8: &str = "video/VP8";
pub const MIME_TYPE_H264: &str = "video/H264";
pub const MIME_TYPE_OPUS: &str = "audio/opus";

/// A single entry of a codec's negotiated `a=rtcp-fb` list.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcpFeedback {
    pub typ: String,
    pub parameter: String,
}

/// Negotiated codec capability, the slice of the SDP the media core needs.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpCodecCapability {
    pub mime_type: String,
    pub clock_rate: u32,
    pub channels: u16,
    pub sdp_fmtp_line: String,
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

impl RtpCodecCapability {
    pub fn is_video(&self) -> bool {
        self.mime_type.to_lowercase().starts_with("video/")
    }

    pub fn is_audio(&self) -> bool {
        self.mime_type.to_lowercase().starts_with("audio/")
    }
}

/// A negotiated header extension id.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpHeaderExtensionParameter {
    pub uri: String,
    pub id: u8,
}

/// Everything a buffer needs to know about the stream it is binding to.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpParameters {
    pub header_extensions: Vec<RtpHeaderExtensionParameter>,
    pub codecs: Vec<RtpCodecCapability>,
}
