#[cfg(test)]
mod nack_test;

use rtcp::transport_feedbacks::transport_layer_nack::NackPair;

/// Max number of times a missing packet will be NACKed before escalating.
const MAX_NACK_TIMES: u8 = 3;
/// Max missing sequence numbers kept under consideration.
const MAX_NACK_CACHE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Nack {
    sn: u32,
    nacked: u8,
}

/// Sorted queue of missing extended sequence numbers.
///
/// `pairs` turns the queue into RFC 4585 NACK pairs, retiring entries that
/// have been asked for [`MAX_NACK_TIMES`] already and flagging those for a
/// keyframe request instead.
#[derive(Debug, Default)]
pub struct NackQueue {
    nacks: Vec<Nack>,
    kf_sn: u32,
}

impl NackQueue {
    pub fn new() -> Self {
        NackQueue {
            nacks: Vec::with_capacity(MAX_NACK_CACHE + 1),
            kf_sn: 0,
        }
    }

    pub fn push(&mut self, ext_sn: u32) {
        let i = match self.nacks.binary_search_by_key(&ext_sn, |n| n.sn) {
            Ok(_) => return,
            Err(i) => i,
        };
        self.nacks.insert(i, Nack { sn: ext_sn, nacked: 0 });
        if self.nacks.len() > MAX_NACK_CACHE {
            self.nacks.remove(0);
        }
    }

    pub fn remove(&mut self, ext_sn: u32) {
        if let Ok(i) = self.nacks.binary_search_by_key(&ext_sn, |n| n.sn) {
            self.nacks.remove(i);
        }
    }

    /// Emits NACK pairs for everything still missing, skipping the two most
    /// recent sequence numbers to allow for reordering. Returns the pairs and
    /// whether a keyframe should be requested for entries that exhausted
    /// their retries.
    pub fn pairs(&mut self, head_sn: u32) -> (Vec<NackPair>, bool) {
        if self.nacks.is_empty() {
            return (vec![], false);
        }

        let mut ask_kf = false;
        let mut pairs = Vec::new();
        let mut current: Option<NackPair> = None;
        let mut kept = Vec::with_capacity(self.nacks.len());

        for nck in self.nacks.iter().copied() {
            if nck.nacked >= MAX_NACK_TIMES {
                // give up on retransmission, one keyframe request per seq
                if nck.sn > self.kf_sn {
                    self.kf_sn = nck.sn;
                    ask_kf = true;
                }
                continue;
            }
            if nck.sn >= head_sn.wrapping_sub(2) {
                // too fresh, reordering may still deliver it
                kept.push(nck);
                continue;
            }

            kept.push(Nack {
                sn: nck.sn,
                nacked: nck.nacked + 1,
            });

            let sn = nck.sn as u16;
            match current.as_mut() {
                Some(np) if sn.wrapping_sub(np.packet_id) <= 16 => {
                    np.lost_packets |= 1 << (sn.wrapping_sub(np.packet_id) - 1);
                }
                Some(np) => {
                    pairs.push(*np);
                    current = Some(NackPair::new(sn));
                }
                None => current = Some(NackPair::new(sn)),
            }
        }
        if let Some(np) = current {
            pairs.push(np);
        }

        self.nacks = kept;
        (pairs, ask_kf)
    }
}
