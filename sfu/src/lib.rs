#![warn(rust_2018_idioms)]
#![allow(dead_code)]

//! Media routing core of a selective forwarding unit.
//!
//! RTP enters through per-SSRC jitter buffers (the `buffer` crate), fans out
//! through a [`TrackReceiver`](receiver::TrackReceiver) per source track to
//! one [`DownTrack`](down_track::DownTrack) per subscriber, and leaves
//! through the transport's [`TrackLocalWriter`](track::TrackLocalWriter)s.
//! RTCP flows the other way: subscriber feedback is translated per downtrack
//! and aggregated per publisher by its [`Router`](router::Router); jitter
//! buffer and TWCC feedback join the same channel. [`Session`]s group peers
//! and keep everyone subscribed to everyone.
//!
//! The WebRTC transport itself (ICE, DTLS, SRTP, SDP) stays outside; it
//! feeds decrypted RTP/RTCP into the [`buffer::Factory`] and implements the
//! seams in [`track`].

pub mod audio_observer;
pub mod down_track;
pub mod error;
mod helpers;
pub mod mock;
pub mod peer;
pub mod publisher;
pub mod receiver;
pub mod router;
pub mod sequencer;
pub mod session;
#[allow(clippy::module_inception)]
pub mod sfu;
pub mod simulcast;
pub mod stats;
pub mod subscriber;
pub mod track;

pub use crate::audio_observer::AudioObserver;
pub use crate::down_track::{DownTrack, DownTrackType};
pub use crate::error::{Error, Result};
pub use crate::helpers::{ntp_to_millis, to_ntp_time};
pub use crate::peer::{JoinConfig, Peer};
pub use crate::publisher::Publisher;
pub use crate::receiver::{Receiver, TrackReceiver};
pub use crate::router::{Router, RouterConfig, RtcpWriterFn};
pub use crate::sequencer::{PacketMeta, Sequencer};
pub use crate::session::Session;
pub use crate::sfu::{Config, Sfu};
pub use crate::simulcast::{SimulcastConfig, Vp8ResumePolicy};
pub use crate::subscriber::Subscriber;
pub use crate::track::{
    RemoteTrack, RtcpFeedback, RtpCodecCapability, RtpHeaderExtensionParameter, RtpParameters,
    SubscriberTransport, TrackKind, TrackLocalContext, TrackLocalWriter, FULL_RESOLUTION,
    HALF_RESOLUTION, QUARTER_RESOLUTION,
};
