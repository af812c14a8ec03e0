
use crate::error::{Error, Result};

/// VP8 payload descriptor, RFC 7741 §4.2.
///
/// ```text
///       0 1 2 3 4 5 6 7                      0 1 2 3 4 5 6 7
///      +-+-+-+-+-+-+-+-+                   +-+-+-+-+-+-+-+-+
///      |X|R|N|S|R| PID | (REQUIRED)        |X|R|N|S|R| PID | (REQUIRED)
///      +-+-+-+-+-+-+-+-+                   +-+-+-+-+-+-+-+-+
/// X:   |I|L|T|K| RSV   | (OPTIONAL)   X:   |I|L|T|K| RSV   | (OPTIONAL)
///      +-+-+-+-+-+-+-+-+                   +-+-+-+-+-+-+-+-+
/// I:   |M| PictureID   | (OPTIONAL)   I:   |M| PictureID   | (OPTIONAL)
///      +-+-+-+-+-+-+-+-+                   +-+-+-+-+-+-+-+-+
/// L:   |   TL0PICIDX   | (OPTIONAL)        |   PictureID   |
///      +-+-+-+-+-+-+-+-+                   +-+-+-+-+-+-+-+-+
/// T/K: |TID|Y| KEYIDX  | (OPTIONAL)   L:   |   TL0PICIDX   | (OPTIONAL)
///      +-+-+-+-+-+-+-+-+                   +-+-+-+-+-+-+-+-+
///                                     T/K: |TID|Y| KEYIDX  | (OPTIONAL)
///                                          +-+-+-+-+-+-+-+-+
/// ```
///
/// Unlike the depacketizers in the `rtp` crate this keeps the byte offsets of
/// PictureID and TL0PICIDX so the forwarding path can rewrite them in place.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Vp8 {
    /// True when the T bit advertises temporal scalability.
    pub temporal_supported: bool,
    /// 7 or 15 bit picture id.
    pub picture_id: u16,
    /// Byte offset of the picture id field, 0 when absent.
    pub pic_id_idx: usize,
    /// True when the picture id is the 15-bit form.
    pub m_bit: bool,
    /// Temporal level zero index.
    pub tl0_pic_idx: u8,
    /// Byte offset of TL0PICIDX, 0 when absent.
    pub tlz_idx: usize,
    /// Temporal layer id.
    pub tid: u8,
    pub is_key_frame: bool,
}

impl Vp8 {
    pub fn unmarshal(&mut self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Err(Error::ErrNilPacket);
        }

        let mut idx = 0usize;
        let s = payload[idx] & 0x10 > 0;
        if payload[idx] & 0x80 > 0 {
            // extended control bits
            idx += 1;
            if payload.len() < idx + 1 {
                return Err(Error::ErrShortPacket);
            }
            self.temporal_supported = payload[idx] & 0x20 > 0;
            let k = payload[idx] & 0x10 > 0;
            let l = payload[idx] & 0x40 > 0;
            if payload[idx] & 0x80 > 0 {
                // picture id present
                idx += 1;
                if payload.len() < idx + 1 {
                    return Err(Error::ErrShortPacket);
                }
                self.pic_id_idx = idx;
                let pid = payload[idx] & 0x7f;
                if payload[idx] & 0x80 > 0 {
                    // 15 bit picture id
                    idx += 1;
                    if payload.len() < idx + 1 {
                        return Err(Error::ErrShortPacket);
                    }
                    self.m_bit = true;
                    self.picture_id = ((pid as u16) << 8) | payload[idx] as u16;
                } else {
                    self.picture_id = pid as u16;
                }
            }
            if l {
                idx += 1;
                if payload.len() < idx + 1 {
                    return Err(Error::ErrShortPacket);
                }
                self.tlz_idx = idx;
                self.tl0_pic_idx = payload[idx];
            }
            if self.temporal_supported || k {
                idx += 1;
                if payload.len() < idx + 1 {
                    return Err(Error::ErrShortPacket);
                }
                self.tid = (payload[idx] >> 6) & 0x3;
            }
            idx += 1;
            if payload.len() < idx + 1 {
                return Err(Error::ErrShortPacket);
            }
            // P bit of the first payload octet is clear on key frames
            self.is_key_frame = payload[idx] & 0x01 == 0 && s;
        } else {
            idx += 1;
            if payload.len() < idx + 1 {
                return Err(Error::ErrShortPacket);
            }
            self.is_key_frame = payload[idx] & 0x01 == 0 && s;
        }
        Ok(())
    }
}

const NALU_TYPE_BITMASK: u8 = 0x1f;
const NALU_TYPE_IDR: u8 = 5;
const NALU_TYPE_SPS: u8 = 7;
const NALU_TYPE_STAP_A: u8 = 24;
const NALU_TYPE_FU_A: u8 = 28;

/// Reports whether an H.264 RTP payload contains (part of) a keyframe, by
/// inspecting single NALUs, STAP-A aggregates and FU-A start fragments.
pub fn is_h264_keyframe(payload: &[u8]) -> bool {
    if payload.is_empty() {
        return false;
    }
    let nalu = payload[0] & NALU_TYPE_BITMASK;
    match nalu {
        0 => false,
        1..=23 => nalu == NALU_TYPE_IDR || nalu == NALU_TYPE_SPS,
        NALU_TYPE_STAP_A => {
            let mut curr = 1usize;
            while curr + 2 < payload.len() {
                let size = ((payload[curr] as usize) << 8) | payload[curr + 1] as usize;
                curr += 2;
                if size == 0 || curr >= payload.len() {
                    return false;
                }
                let t = payload[curr] & NALU_TYPE_BITMASK;
                if t == NALU_TYPE_IDR || t == NALU_TYPE_SPS {
                    return true;
                }
                curr += size;
            }
            false
        }
        NALU_TYPE_FU_A => {
            if payload.len() < 2 {
                return false;
            }
            let start = payload[1] & 0x80 > 0;
            start && payload[1] & NALU_TYPE_BITMASK == NALU_TYPE_IDR
        }
        _ => false,
    }
}

/// True when `timestamp` is lower than `prev_timestamp` because the 32 bit
/// clock wrapped between them.
pub fn is_timestamp_wrap_around(timestamp: u32, prev_timestamp: u32) -> bool {
    timestamp < 0x0001_0000 && prev_timestamp > 0xffff_0000
}

/// Wrap-aware "is `timestamp1` later than `timestamp2`".
pub fn is_later_timestamp(timestamp1: u32, timestamp2: u32) -> bool {
    if timestamp1 > timestamp2 {
        if is_timestamp_wrap_around(timestamp2, timestamp1) {
            return false;
        }
        return true;
    }
    is_timestamp_wrap_around(timestamp1, timestamp2)
}
