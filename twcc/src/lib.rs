#![warn(rust_2018_idioms)]

//! Transport-wide congestion control responder.
//!
//! Collects `(transport-wide sequence number, arrival time)` observations
//! from the ingest path and periodically folds them into RTCP transport
//! feedback packets as specified in
//! <https://datatracker.ietf.org/doc/html/draft-holmer-rmcat-transport-wide-cc-extensions-01>.


use std::future::Future;
use std::pin::Pin;

use rtcp::transport_feedbacks::transport_layer_cc::{
    PacketStatusChunk, RecvDelta, RunLengthChunk, StatusChunkTypeTcc, StatusVectorChunk,
    SymbolSizeTypeTcc, SymbolTypeTcc, TransportLayerCc,
};
use tokio::sync::Mutex;

/// Regular feedback interval.
const REPORT_DELTA: i64 = 100_000_000;
/// Shorter interval applied once a frame boundary (marker bit) is seen.
const REPORT_DELTA_AFTER_MARK: i64 = 50_000_000;
/// Observations required before any feedback is produced.
const MIN_PACKETS: usize = 20;
/// Observation count that forces a feedback regardless of elapsed time.
const FORCE_PACKETS: usize = 100;

pub type OnFeedbackFn = Box<
    dyn (FnMut(
            Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>,
        ) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>)
        + Send
        + Sync,
>;

#[derive(Debug, Clone, Copy)]
struct RtpExtInfo {
    ext_tsn: u32,
    /// Arrival time in microseconds; 0 marks a synthetic "not received" entry.
    timestamp: i64,
}

/// Builds transport feedback for one media stream.
///
/// `push` is fed from the jitter buffer's transport-wide-CC hook; completed
/// feedback packets leave through `on_feedback`.
pub struct Responder {
    internal: Mutex<ResponderInternal>,
    on_feedback_handler: Mutex<Option<OnFeedbackFn>>,
}

struct ResponderInternal {
    ext_info: Vec<RtpExtInfo>,
    last_report: i64,
    cycles: u32,
    last_ext_sn: u32,
    pkt_cnt: u8,
    last_sn: u16,
    m_ssrc: u32,
    s_ssrc: u32,
}

impl Responder {
    pub fn new(media_ssrc: u32) -> Self {
        Responder {
            internal: Mutex::new(ResponderInternal {
                ext_info: Vec::with_capacity(101),
                last_report: 0,
                cycles: 0,
                last_ext_sn: 0,
                pkt_cnt: 0,
                last_sn: 0,
                m_ssrc: media_ssrc,
                s_ssrc: rand::random::<u32>(),
            }),
            on_feedback_handler: Mutex::new(None),
        }
    }

    pub async fn on_feedback(&self, f: OnFeedbackFn) {
        let mut handler = self.on_feedback_handler.lock().await;
        *handler = Some(f);
    }

    /// Records one observation and, when the emission policy is satisfied,
    /// fires the feedback hook.
    pub async fn push(&self, sn: u16, time_ns: i64, marker: bool) {
        let pkts = {
            let mut t = self.internal.lock().await;
            t.push(sn, time_ns, marker)
        };
        if pkts.is_empty() {
            return;
        }
        let mut handler = self.on_feedback_handler.lock().await;
        if let Some(f) = handler.as_mut() {
            f(pkts).await;
        }
    }
}

impl ResponderInternal {
    fn push(
        &mut self,
        sn: u16,
        time_ns: i64,
        marker: bool,
    ) -> Vec<Box<dyn rtcp::packet::Packet + Send + Sync>> {
        if sn < 0x0fff && self.last_sn > 0xf000 {
            self.cycles = self.cycles.wrapping_add(1 << 16);
        }
        self.ext_info.push(RtpExtInfo {
            ext_tsn: self.cycles | sn as u32,
            timestamp: time_ns / 1_000,
        });
        if self.last_report == 0 {
            self.last_report = time_ns;
        }
        self.last_sn = sn;

        let delta = time_ns - self.last_report;
        let mut pkts: Vec<Box<dyn rtcp::packet::Packet + Send + Sync>> = Vec::new();
        if self.ext_info.len() >= MIN_PACKETS
            && (delta >= REPORT_DELTA
                || self.ext_info.len() > FORCE_PACKETS
                || (marker && delta >= REPORT_DELTA_AFTER_MARK))
        {
            for fb in self.build_feedback() {
                pkts.push(Box::new(fb));
            }
            self.last_report = time_ns;
        }
        pkts
    }

    fn build_feedback(&mut self) -> Vec<TransportLayerCc> {
        if self.ext_info.is_empty() {
            return vec![];
        }

        self.ext_info.sort_by_key(|i| i.ext_tsn);
        let infos = std::mem::take(&mut self.ext_info);

        // Losses that fall between two reports are carried as synthetic
        // entries so the sender sees every sequence number exactly once.
        let mut tcc_pkts: Vec<RtpExtInfo> = Vec::with_capacity(infos.len() * 6 / 5);
        for info in infos {
            if info.ext_tsn < self.last_ext_sn {
                continue;
            }
            // a repeated transport sequence number must not re-enter the
            // status walk
            if let Some(last) = tcc_pkts.last() {
                if info.ext_tsn == last.ext_tsn {
                    continue;
                }
            }
            if self.last_ext_sn != 0 {
                for missing in self.last_ext_sn + 1..info.ext_tsn {
                    tcc_pkts.push(RtpExtInfo {
                        ext_tsn: missing,
                        timestamp: 0,
                    });
                }
            }
            self.last_ext_sn = info.ext_tsn;
            tcc_pkts.push(info);
        }
        if tcc_pkts.is_empty() {
            return vec![];
        }

        let first_recv_ts = match tcc_pkts.iter().find(|p| p.timestamp != 0) {
            Some(p) => p.timestamp,
            None => return vec![],
        };

        let mut out = Vec::new();
        let mut feedback = Feedback::new(self.s_ssrc, self.m_ssrc, self.pkt_cnt);
        self.pkt_cnt = self.pkt_cnt.wrapping_add(1);
        feedback.set_base(tcc_pkts[0].ext_tsn as u16, first_recv_ts);

        for pkt in &tcc_pkts {
            let ok = if pkt.timestamp != 0 {
                feedback.add_received(pkt.ext_tsn as u16, pkt.timestamp)
            } else {
                feedback.add_not_received(pkt.ext_tsn as u16);
                true
            };
            if !ok {
                // delta overflowed 16 bits, start a fresh packet
                out.push(feedback.take_rtcp());
                feedback = Feedback::new(self.s_ssrc, self.m_ssrc, self.pkt_cnt);
                self.pkt_cnt = self.pkt_cnt.wrapping_add(1);
                feedback.set_base(pkt.ext_tsn as u16, pkt.timestamp);
                feedback.add_received(pkt.ext_tsn as u16, pkt.timestamp);
            }
        }
        out.push(feedback.take_rtcp());
        out
    }
}

struct Feedback {
    rtcp: TransportLayerCc,
    base_sequence_number: u16,
    ref_timestamp_64ms: i64,
    last_timestamp_us: i64,
    next_sequence_number: u16,
    sequence_number_count: u16,
    last_chunk: Chunk,
    chunks: Vec<PacketStatusChunk>,
    deltas: Vec<RecvDelta>,
}

impl Feedback {
    fn new(sender_ssrc: u32, media_ssrc: u32, fb_pkt_count: u8) -> Self {
        Feedback {
            rtcp: TransportLayerCc {
                sender_ssrc,
                media_ssrc,
                fb_pkt_count,
                ..Default::default()
            },
            base_sequence_number: 0,
            ref_timestamp_64ms: 0,
            last_timestamp_us: 0,
            next_sequence_number: 0,
            sequence_number_count: 0,
            last_chunk: Chunk::default(),
            chunks: vec![],
            deltas: vec![],
        }
    }

    fn set_base(&mut self, sequence_number: u16, time_us: i64) {
        self.base_sequence_number = sequence_number;
        self.next_sequence_number = sequence_number;
        self.ref_timestamp_64ms = time_us / 64_000;
        self.last_timestamp_us = self.ref_timestamp_64ms * 64_000;
    }

    fn take_rtcp(&mut self) -> TransportLayerCc {
        self.rtcp.packet_status_count = self.sequence_number_count;
        self.rtcp.reference_time = self.ref_timestamp_64ms as u32;
        self.rtcp.base_sequence_number = self.base_sequence_number;
        while !self.last_chunk.deltas.is_empty() {
            self.chunks.push(self.last_chunk.encode());
        }
        self.rtcp.packet_chunks.extend_from_slice(&self.chunks);
        self.rtcp.recv_deltas.clone_from(&self.deltas);
        self.rtcp.clone()
    }

    fn add_not_received(&mut self, sequence_number: u16) {
        while self.next_sequence_number != sequence_number {
            self.push_symbol(SymbolTypeTcc::PacketNotReceived as u16);
        }
        self.push_symbol(SymbolTypeTcc::PacketNotReceived as u16);
    }

    fn add_received(&mut self, sequence_number: u16, timestamp_us: i64) -> bool {
        let delta_us = timestamp_us - self.last_timestamp_us;
        let delta250 = delta_us / 250;
        if delta250 < i16::MIN as i64 || delta250 > i16::MAX as i64 {
            return false;
        }

        while self.next_sequence_number != sequence_number {
            self.push_symbol(SymbolTypeTcc::PacketNotReceived as u16);
        }

        let symbol = if (0..=0xff).contains(&delta250) {
            SymbolTypeTcc::PacketReceivedSmallDelta
        } else {
            SymbolTypeTcc::PacketReceivedLargeDelta
        };
        self.push_symbol(symbol as u16);
        self.deltas.push(RecvDelta {
            type_tcc_packet: symbol,
            delta: delta_us,
        });
        self.last_timestamp_us = timestamp_us;
        true
    }

    fn push_symbol(&mut self, symbol: u16) {
        if !self.last_chunk.can_add(symbol) {
            self.chunks.push(self.last_chunk.encode());
        }
        self.last_chunk.add(symbol);
        self.sequence_number_count = self.sequence_number_count.wrapping_add(1);
        self.next_sequence_number = self.next_sequence_number.wrapping_add(1);
    }
}

const MAX_RUN_LENGTH_CAP: usize = 0x1fff; // 13 bit run length
const MAX_ONE_BIT_CAP: usize = 14;
const MAX_TWO_BIT_CAP: usize = 7;

/// Packs consecutive packet status symbols into the densest chunk encoding
/// that still represents them: run-length when uniform, one-bit vectors when
/// no large deltas occur, two-bit vectors otherwise.
#[derive(Default)]
struct Chunk {
    has_large_delta: bool,
    has_different_types: bool,
    deltas: Vec<u16>,
}

impl Chunk {
    fn can_add(&self, symbol: u16) -> bool {
        if self.deltas.len() < MAX_TWO_BIT_CAP {
            return true;
        }
        if self.deltas.len() < MAX_ONE_BIT_CAP
            && !self.has_large_delta
            && symbol != SymbolTypeTcc::PacketReceivedLargeDelta as u16
        {
            return true;
        }
        if self.deltas.len() < MAX_RUN_LENGTH_CAP
            && !self.has_different_types
            && symbol == self.deltas[0]
        {
            return true;
        }
        false
    }

    fn add(&mut self, symbol: u16) {
        self.deltas.push(symbol);
        self.has_large_delta =
            self.has_large_delta || symbol == SymbolTypeTcc::PacketReceivedLargeDelta as u16;
        self.has_different_types = self.has_different_types || symbol != self.deltas[0];
    }

    fn encode(&mut self) -> PacketStatusChunk {
        if !self.has_different_types {
            let p = PacketStatusChunk::RunLengthChunk(RunLengthChunk {
                type_tcc: StatusChunkTypeTcc::RunLengthChunk,
                packet_status_symbol: self.deltas[0].into(),
                run_length: self.deltas.len() as u16,
            });
            self.reset();
            return p;
        }
        if self.deltas.len() == MAX_ONE_BIT_CAP {
            let p = PacketStatusChunk::StatusVectorChunk(StatusVectorChunk {
                type_tcc: StatusChunkTypeTcc::StatusVectorChunk,
                symbol_size: SymbolSizeTypeTcc::OneBit,
                symbol_list: self.deltas.iter().map(|x| SymbolTypeTcc::from(*x)).collect(),
            });
            self.reset();
            return p;
        }

        let min_cap = std::cmp::min(MAX_TWO_BIT_CAP, self.deltas.len());
        let svc = PacketStatusChunk::StatusVectorChunk(StatusVectorChunk {
            type_tcc: StatusChunkTypeTcc::StatusVectorChunk,
            symbol_size: SymbolSizeTypeTcc::TwoBit,
            symbol_list: self.deltas[..min_cap]
                .iter()
                .map(|x| SymbolTypeTcc::from(*x))
                .collect(),
        });
        self.deltas.drain(..min_cap);
        self.has_different_types = false;
        self.has_large_delta = false;
        if !self.deltas.is_empty() {
            let first = self.deltas[0];
            for d in &self.deltas {
                if *d != first {
                    self.has_different_types = true;
                }
                if *d == SymbolTypeTcc::PacketReceivedLargeDelta as u16 {
                    self.has_large_delta = true;
                }
            }
        }
        svc
    }

    fn reset(&mut self) {
        self.deltas.clear();
        self.has_large_delta = false;
        self.has_different_types = false;
    }
}
