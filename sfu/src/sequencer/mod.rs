#[cfg(test)]
mod sequencer_test;

/// Rewritten sequence numbers remembered for NACK translation.
const MAX_PACKET_META_HISTORY: usize = 500;
/// Retransmissions served per sequence number before the request is ignored.
const MAX_META_NACKS: u8 = 3;

/// Where one rewritten packet came from, kept so a subscriber NACK can be
/// translated back to the source stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PacketMeta {
    /// Sequence number the publisher sent.
    pub source_seq_no: u16,
    /// Sequence number the subscriber saw.
    pub target_seq_no: u16,
    /// Rewritten timestamp the packet went out with.
    pub timestamp: u32,
    /// Spatial layer the packet was forwarded from.
    pub layer: u8,
    nacked: u8,
    /// Codec-specific sidecar; VP8 packs picture id and TL0PICIDX here.
    misc: u32,
}

impl PacketMeta {
    pub fn set_vp8_payload_meta(&mut self, tlz_idx: u8, picture_id: u16) {
        self.misc = (tlz_idx as u32) << 16 | picture_id as u32;
    }

    pub fn vp8_payload_meta(&self) -> (u8, u16) {
        ((self.misc >> 16) as u8, self.misc as u16)
    }
}

/// Ring of [`PacketMeta`] addressed by rewritten (target) sequence number,
/// same head/step arithmetic as the ingest bucket.
#[derive(Debug)]
pub struct Sequencer {
    seq: Vec<PacketMeta>,
    init: bool,
    step: usize,
    head_sn: u16,
}

impl Default for Sequencer {
    fn default() -> Self {
        Sequencer::new()
    }
}

impl Sequencer {
    pub fn new() -> Self {
        Sequencer {
            seq: vec![PacketMeta::default(); MAX_PACKET_META_HISTORY],
            init: false,
            step: 0,
            head_sn: 0,
        }
    }

    /// Records the mapping for one forwarded packet. `head` marks in-order
    /// delivery; retransmitted source packets land in their original slot.
    pub fn push(
        &mut self,
        sn: u16,
        off_sn: u16,
        timestamp: u32,
        layer: u8,
        head: bool,
    ) -> Option<&mut PacketMeta> {
        if !self.init {
            self.head_sn = off_sn.wrapping_sub(1);
            self.init = true;
        }

        let slot = if head {
            let diff = off_sn.wrapping_sub(self.head_sn);
            self.head_sn = off_sn;
            for _ in 1..diff {
                self.step += 1;
                if self.step >= MAX_PACKET_META_HISTORY {
                    self.step = 0;
                }
            }
            let slot = self.step;
            self.step += 1;
            if self.step >= MAX_PACKET_META_HISTORY {
                self.step = 0;
            }
            slot
        } else {
            let back = self.head_sn.wrapping_sub(off_sn) as isize + 1;
            let mut pos = self.step as isize - back;
            if pos < 0 {
                if -pos > MAX_PACKET_META_HISTORY as isize {
                    log::trace!("sequencer history too short for sn {off_sn}");
                    return None;
                }
                pos += MAX_PACKET_META_HISTORY as isize;
            }
            pos as usize
        };

        self.seq[slot] = PacketMeta {
            source_seq_no: sn,
            target_seq_no: off_sn,
            timestamp,
            layer,
            nacked: 0,
            misc: 0,
        };
        Some(&mut self.seq[slot])
    }

    /// Looks up the source metadata for NACKed target sequence numbers,
    /// dropping entries that were never recorded or have been retransmitted
    /// too many times already.
    pub fn get_seq_no_pairs(&mut self, seq_nos: &[u16]) -> Vec<PacketMeta> {
        let mut metas = Vec::with_capacity(seq_nos.len());
        for &sn in seq_nos {
            let back = self.head_sn.wrapping_sub(sn) as isize + 1;
            let mut pos = self.step as isize - back;
            if pos < 0 {
                if -pos > MAX_PACKET_META_HISTORY as isize {
                    continue;
                }
                pos += MAX_PACKET_META_HISTORY as isize;
            }
            let meta = &mut self.seq[pos as usize];
            if meta.target_seq_no == sn && meta.nacked < MAX_META_NACKS {
                meta.nacked += 1;
                metas.push(*meta);
            }
        }
        metas
    }
}
