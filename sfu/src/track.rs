use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::down_track::DownTrack;
use crate::error::Result;
pub use buffer::params::{
    RtcpFeedback, RtpCodecCapability, RtpHeaderExtensionParameter, RtpParameters,
};

/// RID values simulcast publishers use for their encodings.
pub const QUARTER_RESOLUTION: &str = "q";
pub const HALF_RESOLUTION: &str = "h";
pub const FULL_RESOLUTION: &str = "f";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// Descriptor of an upstream track as reported by the transport when media
/// arrives. The RTP bytes themselves flow into the per-SSRC buffer; this
/// carries the identifiers and negotiated parameters around it.
#[derive(Debug, Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    /// Simulcast RID: "", "q", "h" or "f".
    pub rid: String,
    pub ssrc: u32,
    pub codec: RtpCodecCapability,
    /// Full negotiated parameters, forwarded to the buffer on bind.
    pub params: RtpParameters,
}

impl RemoteTrack {
    pub fn kind(&self) -> TrackKind {
        if self.codec.is_audio() {
            TrackKind::Audio
        } else {
            TrackKind::Video
        }
    }
}

/// Writer for outbound RTP, implemented by the transport per negotiated
/// sender. A send onto a torn-down transport must error with
/// [`Error::ErrClosedPipe`](crate::error::Error::ErrClosedPipe) so the
/// routing layer can retire the downtrack.
#[async_trait]
pub trait TrackLocalWriter: fmt::Debug + Send + Sync {
    /// write_rtp writes one rewritten RTP packet to the subscriber.
    async fn write_rtp(&self, p: &rtp::packet::Packet) -> Result<usize>;

    /// write sends an already-marshaled RTP packet.
    async fn write(&self, b: &[u8]) -> Result<usize>;
}

/// Context the transport passes to [`DownTrack::bind`] once negotiation has
/// settled on SSRC and payload type.
#[derive(Clone)]
pub struct TrackLocalContext {
    pub id: String,
    pub params: RtpParameters,
    pub ssrc: u32,
    pub payload_type: u8,
    pub write_stream: Arc<dyn TrackLocalWriter>,
}

/// The slice of a subscriber's transport the router drives: adding and
/// removing sendonly senders and pushing RTCP (sender reports, SDES) to the
/// subscriber.
#[async_trait]
pub trait SubscriberTransport: Send + Sync {
    /// Creates a sendonly sender for `track`. The transport calls
    /// [`DownTrack::bind`] when negotiation completes.
    async fn add_down_track(&self, track: Arc<DownTrack>) -> Result<()>;

    async fn remove_down_track(&self, track: &DownTrack) -> Result<()>;

    async fn write_rtcp(
        &self,
        pkts: &[Box<dyn rtcp::packet::Packet + Send + Sync>],
    ) -> Result<()>;
}
