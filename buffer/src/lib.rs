#![warn(rust_2018_idioms)]
#![allow(dead_code)]

//! RTP ingest buffers for the SFU media core.
//!
//! A [`Factory`](factory::Factory) hands out one [`Buffer`](buffer::Buffer)
//! and one [`RtcpReader`](rtcp_reader::RtcpReader) per SSRC. The transport
//! writes decrypted RTP/RTCP bytes into them; the routing layer reads ordered
//! [`ExtPacket`](buffer::ExtPacket)s back out and receives NACK/PLI/REMB and
//! receiver-report feedback through the buffer's hooks.

pub mod bucket;
#[allow(clippy::module_inception)]
pub mod buffer;
pub mod error;
pub mod factory;
pub mod helpers;
pub mod nack;
pub mod params;
pub mod pool;
pub mod rtcp_reader;

pub use crate::bucket::{Bucket, MAX_PKT_SIZE};
pub use crate::buffer::{Buffer, ExtPacket, Options, Stats};
pub use crate::error::{Error, Result};
pub use crate::factory::Factory;
pub use crate::helpers::{is_h264_keyframe, is_later_timestamp, is_timestamp_wrap_around, Vp8};
pub use crate::nack::NackQueue;
pub use crate::params::{
    RtcpFeedback, RtpCodecCapability, RtpHeaderExtensionParameter, RtpParameters,
    SDES_AUDIO_LEVEL_URI, TRANSPORT_CC_URI,
};
pub use crate::pool::BytePool;
pub use crate::rtcp_reader::RtcpReader;
