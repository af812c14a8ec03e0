
use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

/// Largest RTP packet the bucket will store, and the stride of one slot.
pub const MAX_PKT_SIZE: usize = 1500;

/// Ring buffer of raw RTP packets addressed by sequence number.
///
/// Each slot holds one packet prefixed by its 2-byte big-endian length. The
/// newest packet lives at `step`; older packets are found by walking
/// backwards from `head_sn`. A slot is only trusted if the sequence number
/// embedded in the stored RTP header matches the one asked for.
pub struct Bucket {
    buf: Vec<u8>,

    init: bool,
    step: usize,
    head_sn: u16,
    max_steps: usize,
}

impl Bucket {
    /// Builds a bucket on top of `buf`, usually a recycled allocation from
    /// the factory pool. Capacity is `buf.len() / MAX_PKT_SIZE - 1` packets.
    pub fn new(mut buf: Vec<u8>) -> Self {
        let max_steps = buf.len() / MAX_PKT_SIZE - 1;
        // Recycled allocations may still carry a previous track's packets;
        // stale length prefixes would defeat the slot validity checks.
        buf.fill(0);
        Bucket {
            buf,
            init: false,
            step: 0,
            head_sn: 0,
            max_steps,
        }
    }

    /// Takes the storage back out, for recycling on close.
    pub fn into_buf(self) -> Vec<u8> {
        self.buf
    }

    pub fn head_sequence_number(&self) -> u16 {
        self.head_sn
    }

    /// Stores `pkt` under `sn`. `latest` marks an in-order arrival at the new
    /// head; anything else is placed by walking back from the current head.
    pub fn add_packet(&mut self, pkt: &[u8], sn: u16, latest: bool) -> Result<()> {
        if pkt.len() > MAX_PKT_SIZE - 2 {
            return Err(Error::ErrPacketTooLarge);
        }
        if !self.init {
            self.head_sn = sn.wrapping_sub(1);
            self.init = true;
        }
        if !latest {
            return self.set(sn, pkt);
        }
        let diff = sn.wrapping_sub(self.head_sn);
        self.head_sn = sn;
        for _ in 1..diff {
            self.step += 1;
            if self.step >= self.max_steps {
                self.step = 0;
            }
        }
        self.push(pkt);
        Ok(())
    }

    /// Copies the packet stored under `sn` into `buf`, returning its length.
    pub fn get_packet(&self, buf: &mut [u8], sn: u16) -> Result<usize> {
        let p = self.get(sn).ok_or(Error::ErrPacketNotFound)?;
        if buf.len() < p.len() {
            return Err(Error::ErrBufferTooSmall);
        }
        buf[..p.len()].copy_from_slice(p);
        Ok(p.len())
    }

    fn push(&mut self, pkt: &[u8]) {
        let off = self.step * MAX_PKT_SIZE;
        BigEndian::write_u16(&mut self.buf[off..off + 2], pkt.len() as u16);
        self.buf[off + 2..off + 2 + pkt.len()].copy_from_slice(pkt);
        self.step += 1;
        if self.step > self.max_steps {
            self.step = 0;
        }
    }

    fn position(&self, sn: u16) -> Option<usize> {
        let back = self.head_sn.wrapping_sub(sn) as isize + 1;
        let mut pos = self.step as isize - back;
        if pos < 0 {
            if -pos > self.max_steps as isize + 1 {
                return None;
            }
            pos += self.max_steps as isize + 1;
        }
        let off = pos as usize * MAX_PKT_SIZE;
        if off + MAX_PKT_SIZE > self.buf.len() {
            return None;
        }
        Some(off)
    }

    fn get(&self, sn: u16) -> Option<&[u8]> {
        let off = self.position(sn)?;
        if BigEndian::read_u16(&self.buf[off + 4..off + 6]) != sn {
            return None;
        }
        let sz = BigEndian::read_u16(&self.buf[off..off + 2]) as usize;
        if sz < 2 || off + 2 + sz > self.buf.len() {
            return None;
        }
        Some(&self.buf[off + 2..off + 2 + sz])
    }

    fn set(&mut self, sn: u16, pkt: &[u8]) -> Result<()> {
        if self.head_sn.wrapping_sub(sn) >= self.max_steps as u16 + 1 {
            return Err(Error::ErrPacketTooOld);
        }
        let off = self.position(sn).ok_or(Error::ErrPacketTooOld)?;
        let stored_len = BigEndian::read_u16(&self.buf[off..off + 2]) as usize;
        if stored_len != 0 {
            let stored_sn = BigEndian::read_u16(&self.buf[off + 4..off + 6]);
            if stored_sn == sn {
                return Err(Error::ErrRtxPacket);
            }
            // The slot aliases a different sequence number. Only reuse it once
            // the stored packet has aged out of the live window.
            if (self.head_sn.wrapping_sub(stored_sn) as usize) < self.max_steps + 1 {
                return Err(Error::ErrPacketTooOld);
            }
        }
        BigEndian::write_u16(&mut self.buf[off..off + 2], pkt.len() as u16);
        self.buf[off + 2..off + 2 + pkt.len()].copy_from_slice(pkt);
        Ok(())
    }
}
