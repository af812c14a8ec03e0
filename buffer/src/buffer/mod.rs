#[cfg(test)]
mod buffer_test;

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ByteOrder};
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use rtcp::receiver_report::ReceiverReport;
use rtcp::reception_report::ReceptionReport;
use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use rtp::extension::audio_level_extension::AudioLevelExtension;
use rtp::extension::transport_cc_extension::TransportCcExtension;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::MissedTickBehavior;
use util::marshal::Unmarshal;

use crate::bucket::Bucket;
use crate::error::{Error, Result};
use crate::helpers::{is_h264_keyframe, is_later_timestamp, Vp8};
use crate::nack::NackQueue;
use crate::params::{RtpParameters, SDES_AUDIO_LEVEL_URI, TRANSPORT_CC_URI};
use crate::pool::BytePool;

/// Packets accepted before `bind` provides codec parameters.
const MAX_PENDING_PACKETS: usize = 500;
/// Cap on ordered packets awaiting a reader.
const MAX_EXT_PACKETS: usize = 500;
/// Receiver report / REMB cadence.
const REPORT_DELTA: i64 = 1_000_000_000;
/// NACK sweep cadence.
const FEEDBACK_INTERVAL: Duration = Duration::from_millis(100);

pub type OnTransportWideCcFn = Box<
    dyn (FnMut(u16, i64, bool) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>)
        + Send
        + Sync,
>;
pub type OnAudioLevelFn =
    Box<dyn (FnMut(u8) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync>;
pub type OnFeedbackFn = Box<
    dyn (FnMut(
            Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>,
        ) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>)
        + Send
        + Sync,
>;
pub type OnBufferCloseFn =
    Box<dyn (FnMut() -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync>;

/// Limits applied when binding a buffer to a stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct Options {
    /// Ingest cap in bits per second; 0 disables limiting.
    pub max_bit_rate: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub last_expected: u32,
    pub last_received: u32,
    pub lost_rate: f32,
    pub packet_count: u32,
    pub jitter: f64,
    pub total_byte: u64,
}

/// An RTP packet leaving the buffer in sequence order, annotated with what
/// the forwarding path needs to know about it.
#[derive(Debug, Clone)]
pub struct ExtPacket {
    /// True when this packet advanced the highest sequence number.
    pub head: bool,
    /// Sequence number cycle count at arrival, in units of 1 << 16.
    pub cycle: u32,
    /// Arrival wall clock, unix nanoseconds.
    pub arrival: i64,
    pub packet: rtp::packet::Packet,
    pub key_frame: bool,
    /// Parsed VP8 descriptor; zeroed for other codecs.
    pub payload: Vp8,
}

#[derive(Default)]
struct WriteEvents {
    queued: bool,
    twcc: Option<(u16, i64, bool)>,
    audio_level: Option<u8>,
    max_temporal_layer: Option<i32>,
}

/// Per-SSRC jitter buffer.
///
/// Single writer (the transport's RTP path), single reader (a receiver layer
/// fan-out task). `write` reorders into the bucket, tracks loss for the NACK
/// queue and queues [`ExtPacket`]s; `read_extended` hands them out in arrival
/// order, parking until the writer wakes it. A timer task sweeps the NACK
/// queue and emits receiver reports through `on_feedback`.
pub struct Buffer {
    media_ssrc: u32,
    closed: AtomicBool,
    internal: Mutex<BufferInternal>,
    notify: Notify,

    bitrate: AtomicU64,
    max_temporal_layer: AtomicI32,

    video_pool: Arc<BytePool>,
    audio_pool: Arc<BytePool>,

    on_feedback_handler: Mutex<Option<OnFeedbackFn>>,
    on_audio_level_handler: Mutex<Option<OnAudioLevelFn>>,
    on_twcc_handler: Mutex<Option<OnTransportWideCcFn>>,
    on_close_handler: Mutex<Option<OnBufferCloseFn>>,
    close_tx: Mutex<Option<mpsc::Sender<()>>>,
}

#[derive(Default)]
struct BufferInternal {
    bound: bool,
    video: bool,
    mime: String,
    clock_rate: u32,
    max_bitrate: u64,

    bucket: Option<Bucket>,
    nacker: Option<NackQueue>,
    pending_packets: Vec<Vec<u8>>,
    ext_packets: VecDeque<ExtPacket>,

    remb: bool,
    twcc_fb: bool,
    twcc_ext: u8,
    audio_level_ext: u8,

    base_sn: u16,
    max_seq_no: u16,
    cycles: u32,

    last_transit: u32,
    latest_timestamp: u32,
    latest_timestamp_time: i64,

    stats: Stats,
    bitrate_helper: u64,
    last_report: i64,

    sr_rtp: u32,
    sr_ntp: u64,
    last_sr_time: i64,

    max_temporal_layer: i32,
}

fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

impl Buffer {
    pub fn new(media_ssrc: u32, video_pool: Arc<BytePool>, audio_pool: Arc<BytePool>) -> Self {
        Buffer {
            media_ssrc,
            closed: AtomicBool::new(false),
            internal: Mutex::new(BufferInternal::default()),
            notify: Notify::new(),
            bitrate: AtomicU64::new(0),
            max_temporal_layer: AtomicI32::new(0),
            video_pool,
            audio_pool,
            on_feedback_handler: Mutex::new(None),
            on_audio_level_handler: Mutex::new(None),
            on_twcc_handler: Mutex::new(None),
            on_close_handler: Mutex::new(None),
            close_tx: Mutex::new(None),
        }
    }

    pub fn media_ssrc(&self) -> u32 {
        self.media_ssrc
    }

    /// Binds the buffer to its negotiated stream parameters and starts the
    /// feedback timer. Packets written before this point are replayed.
    pub async fn bind(self: &Arc<Self>, params: RtpParameters, o: Options) {
        let (close_tx, close_rx) = mpsc::channel(1);
        let mut replay_events = Vec::new();
        {
            let mut b = self.internal.lock().await;
            let codec = params.codecs.first().cloned().unwrap_or_default();
            b.mime = codec.mime_type.to_lowercase();
            b.video = b.mime.starts_with("video/");
            b.clock_rate = codec.clock_rate;
            b.max_bitrate = o.max_bit_rate;

            for ext in &params.header_extensions {
                match ext.uri.as_str() {
                    SDES_AUDIO_LEVEL_URI => b.audio_level_ext = ext.id,
                    TRANSPORT_CC_URI if b.video => b.twcc_ext = ext.id,
                    _ => {}
                }
            }
            for fb in &codec.rtcp_feedback {
                match fb.typ.as_str() {
                    "nack" if fb.parameter.is_empty() => b.nacker = Some(NackQueue::new()),
                    "goog-remb" => b.remb = true,
                    "transport-cc" => b.twcc_fb = true,
                    _ => {}
                }
            }

            let pool = if b.video {
                &self.video_pool
            } else {
                &self.audio_pool
            };
            b.bucket = Some(Bucket::new(pool.get()));
            b.bound = true;

            let pending = std::mem::take(&mut b.pending_packets);
            for pp in pending {
                replay_events.push(b.calc(&pp, unix_nanos()));
            }
        }
        for ev in replay_events {
            self.dispatch_events(ev).await;
        }

        {
            let mut tx = self.close_tx.lock().await;
            *tx = Some(close_tx);
        }
        let buffer = Arc::clone(self);
        tokio::spawn(async move {
            Buffer::feedback_loop(buffer, close_rx).await;
        });
    }

    /// Ingests one raw RTP packet from the transport.
    pub async fn write(&self, pkt: &[u8]) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ErrIoEof);
        }
        let events = {
            let mut b = self.internal.lock().await;
            if !b.bound {
                if b.pending_packets.len() >= MAX_PENDING_PACKETS {
                    log::debug!("ssrc {}: pending queue full, packet dropped", self.media_ssrc);
                } else {
                    b.pending_packets.push(pkt.to_vec());
                }
                return Ok(pkt.len());
            }
            b.calc(pkt, unix_nanos())
        };
        self.dispatch_events(events).await;
        Ok(pkt.len())
    }

    async fn dispatch_events(&self, events: WriteEvents) {
        if let Some(tl) = events.max_temporal_layer {
            self.max_temporal_layer.store(tl, Ordering::Release);
        }
        if let Some((sn, time_ns, marker)) = events.twcc {
            let mut handler = self.on_twcc_handler.lock().await;
            if let Some(f) = handler.as_mut() {
                f(sn, time_ns, marker).await;
            }
        }
        if let Some(level) = events.audio_level {
            let mut handler = self.on_audio_level_handler.lock().await;
            if let Some(f) = handler.as_mut() {
                f(level).await;
            }
        }
        if events.queued {
            self.notify.notify_one();
        }
    }

    /// Next in-order packet with its forwarding annotations. Parks until the
    /// writer queues one; errors with [`Error::ErrIoEof`] once the buffer is
    /// closed and drained.
    pub async fn read_extended(&self) -> Result<ExtPacket> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut b = self.internal.lock().await;
                if let Some(ep) = b.ext_packets.pop_front() {
                    return Ok(ep);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::ErrIoEof);
            }
            notified.await;
        }
    }

    /// Fetches the raw packet stored under `sn` for retransmission.
    pub async fn get_packet(&self, buf: &mut [u8], sn: u16) -> Result<usize> {
        let b = self.internal.lock().await;
        match &b.bucket {
            Some(bucket) => bucket.get_packet(buf, sn),
            None => Err(Error::ErrPacketNotFound),
        }
    }

    pub async fn set_sender_report_data(&self, rtp_time: u32, ntp_time: u64) {
        let mut b = self.internal.lock().await;
        b.sr_rtp = rtp_time;
        b.sr_ntp = ntp_time;
        b.last_sr_time = unix_nanos();
    }

    /// Last sender report pair plus the instant it was received.
    pub async fn get_sender_report_data(&self) -> (u32, u64, i64) {
        let b = self.internal.lock().await;
        (b.sr_rtp, b.sr_ntp, b.last_sr_time)
    }

    pub async fn stats(&self) -> Stats {
        let b = self.internal.lock().await;
        b.stats
    }

    /// Receive bitrate in bits per second over the last report interval.
    pub fn bitrate(&self) -> u64 {
        self.bitrate.load(Ordering::Acquire)
    }

    /// Highest VP8 temporal layer observed on this stream.
    pub fn max_temporal_layer(&self) -> i32 {
        self.max_temporal_layer.load(Ordering::Acquire)
    }

    pub async fn on_feedback(&self, f: OnFeedbackFn) {
        let mut handler = self.on_feedback_handler.lock().await;
        *handler = Some(f);
    }

    pub async fn on_audio_level(&self, f: OnAudioLevelFn) {
        let mut handler = self.on_audio_level_handler.lock().await;
        *handler = Some(f);
    }

    pub async fn on_transport_wide_cc(&self, f: OnTransportWideCcFn) {
        let mut handler = self.on_twcc_handler.lock().await;
        *handler = Some(f);
    }

    pub async fn on_close(&self, f: OnBufferCloseFn) {
        let mut handler = self.on_close_handler.lock().await;
        *handler = Some(f);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut tx = self.close_tx.lock().await;
            tx.take();
        }
        {
            let mut b = self.internal.lock().await;
            if let Some(bucket) = b.bucket.take() {
                let pool = if b.video {
                    &self.video_pool
                } else {
                    &self.audio_pool
                };
                pool.put(bucket.into_buf());
            }
            b.pending_packets.clear();
        }
        self.notify.notify_waiters();
        let mut handler = self.on_close_handler.lock().await;
        if let Some(f) = handler.as_mut() {
            f().await;
        }
    }

    async fn feedback_loop(buffer: Arc<Buffer>, mut close_rx: mpsc::Receiver<()>) {
        let mut ticker = tokio::time::interval(FEEDBACK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = close_rx.recv() => return,
                _ = ticker.tick() => {
                    let (pkts, bitrate) = {
                        let mut b = buffer.internal.lock().await;
                        b.build_feedback(unix_nanos(), buffer.media_ssrc)
                    };
                    if let Some(br) = bitrate {
                        buffer.bitrate.store(br, Ordering::Release);
                    }
                    if pkts.is_empty() {
                        continue;
                    }
                    let mut handler = buffer.on_feedback_handler.lock().await;
                    if let Some(f) = handler.as_mut() {
                        f(pkts).await;
                    }
                }
            }
        }
    }
}

impl BufferInternal {
    fn calc(&mut self, pkt: &[u8], arrival_time: i64) -> WriteEvents {
        let mut events = WriteEvents::default();
        if pkt.len() < 12 {
            log::debug!("rtp packet shorter than header, dropped");
            return events;
        }
        let sn = BigEndian::read_u16(&pkt[2..4]);

        if self.stats.packet_count == 0 {
            self.base_sn = sn;
            self.max_seq_no = sn;
            self.last_report = arrival_time;
        } else if sn.wrapping_sub(self.max_seq_no) & 0x8000 == 0 {
            // ahead of the head, possibly with a gap behind it
            if sn < self.max_seq_no {
                self.cycles = self.cycles.wrapping_add(1 << 16);
            }
            if let Some(nacker) = self.nacker.as_mut() {
                let diff = sn.wrapping_sub(self.max_seq_no);
                let (cycles, max_seq_no) = (self.cycles, self.max_seq_no);
                for i in 1..diff {
                    let msn = sn.wrapping_sub(i);
                    // a missing sn behind a wrap belongs to the previous cycle
                    let ext_sn = if msn > max_seq_no && msn & 0x8000 > 0 && max_seq_no & 0x8000 == 0
                    {
                        cycles.wrapping_sub(1 << 16) | msn as u32
                    } else {
                        cycles | msn as u32
                    };
                    nacker.push(ext_sn);
                }
            }
            self.max_seq_no = sn;
        } else if let Some(nacker) = self.nacker.as_mut() {
            // late arrival fills a hole
            let (cycles, max_seq_no) = (self.cycles, self.max_seq_no);
            let ext_sn = if sn > max_seq_no && sn & 0x8000 > 0 && max_seq_no & 0x8000 == 0 {
                cycles.wrapping_sub(1 << 16) | sn as u32
            } else {
                cycles | sn as u32
            };
            nacker.remove(ext_sn);
        }
        let head = sn == self.max_seq_no;

        if let Some(bucket) = self.bucket.as_mut() {
            match bucket.add_packet(pkt, sn, head) {
                Ok(()) => {}
                Err(Error::ErrRtxPacket) | Err(Error::ErrPacketTooOld) => {
                    log::trace!("duplicate or ancient packet sn {sn}, dropped");
                    return events;
                }
                Err(e) => {
                    log::debug!("bucket rejected sn {sn}: {e}");
                    return events;
                }
            }
        }

        let mut raw = pkt;
        let packet = match rtp::packet::Packet::unmarshal(&mut raw) {
            Ok(p) => p,
            Err(e) => {
                log::debug!("rtp unmarshal failed: {e}");
                return events;
            }
        };

        self.stats.total_byte += pkt.len() as u64;
        self.bitrate_helper += pkt.len() as u64;
        self.stats.packet_count += 1;

        let mut ep = ExtPacket {
            head,
            cycle: self.cycles,
            arrival: arrival_time,
            packet,
            key_frame: false,
            payload: Vp8::default(),
        };

        match self.mime.as_str() {
            "video/vp8" => {
                let mut vp8 = Vp8::default();
                if vp8.unmarshal(&ep.packet.payload).is_ok() {
                    ep.key_frame = vp8.is_key_frame;
                    if vp8.temporal_supported && vp8.tid as i32 > self.max_temporal_layer {
                        self.max_temporal_layer = vp8.tid as i32;
                        events.max_temporal_layer = Some(self.max_temporal_layer);
                    }
                    ep.payload = vp8;
                }
            }
            "video/h264" => ep.key_frame = is_h264_keyframe(&ep.packet.payload),
            _ => {}
        }

        if self.latest_timestamp_time == 0
            || is_later_timestamp(ep.packet.header.timestamp, self.latest_timestamp)
        {
            self.latest_timestamp = ep.packet.header.timestamp;
            self.latest_timestamp_time = arrival_time;
        }

        // interarrival jitter, RFC 3550 A.8
        if self.clock_rate > 0 {
            let arrival = ((arrival_time / 1_000_000) as u32).wrapping_mul(self.clock_rate / 1000);
            let transit = arrival.wrapping_sub(ep.packet.header.timestamp);
            if self.last_transit != 0 {
                let mut d = transit.wrapping_sub(self.last_transit) as i32;
                if d < 0 {
                    d = -d;
                }
                self.stats.jitter += (d as f64 - self.stats.jitter) / 16.0;
            }
            self.last_transit = transit;
        }

        if self.twcc_fb && self.twcc_ext != 0 {
            if let Some(mut ext) = ep.packet.header.get_extension(self.twcc_ext) {
                if let Ok(tcc) = TransportCcExtension::unmarshal(&mut ext) {
                    events.twcc = Some((
                        tcc.transport_sequence,
                        arrival_time,
                        ep.packet.header.marker,
                    ));
                }
            }
        }
        if self.audio_level_ext != 0 {
            if let Some(mut ext) = ep.packet.header.get_extension(self.audio_level_ext) {
                if let Ok(al) = AudioLevelExtension::unmarshal(&mut ext) {
                    events.audio_level = Some(al.level);
                }
            }
        }

        if self.ext_packets.len() >= MAX_EXT_PACKETS {
            self.ext_packets.pop_front();
            log::trace!("reader stalled, oldest queued packet dropped");
        }
        self.ext_packets.push_back(ep);
        events.queued = true;
        events
    }

    fn build_feedback(
        &mut self,
        now: i64,
        media_ssrc: u32,
    ) -> (Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>, Option<u64>) {
        let mut pkts: Vec<Box<dyn rtcp::packet::Packet + Send + Sync>> = Vec::new();
        if !self.bound || self.stats.packet_count == 0 {
            return (pkts, None);
        }

        let head = self.cycles | self.max_seq_no as u32;
        if let Some(nacker) = self.nacker.as_mut() {
            let (pairs, ask_kf) = nacker.pairs(head);
            if !pairs.is_empty() {
                pkts.push(Box::new(TransportLayerNack {
                    sender_ssrc: 0,
                    media_ssrc,
                    nacks: pairs,
                }));
            }
            if ask_kf {
                pkts.push(Box::new(PictureLossIndication {
                    sender_ssrc: 0,
                    media_ssrc,
                }));
            }
        }

        let mut bitrate = None;
        if now - self.last_report >= REPORT_DELTA {
            let elapsed = (now - self.last_report) as u64;
            if elapsed > 0 {
                let br = self.bitrate_helper * 8 * 1_000_000_000 / elapsed;
                bitrate = Some(br);
                self.bitrate_helper = 0;
            }
            let report = self.build_reception_report(now, media_ssrc);
            pkts.push(Box::new(ReceiverReport {
                reports: vec![report],
                ..Default::default()
            }));
            if self.remb && !self.twcc_fb {
                let br = bitrate.unwrap_or(0);
                pkts.push(Box::new(self.build_remb(media_ssrc, br)));
            }
            self.last_report = now;
        }

        (pkts, bitrate)
    }

    fn build_reception_report(&mut self, now: i64, media_ssrc: u32) -> ReceptionReport {
        let ext_max_seq = self.cycles | self.max_seq_no as u32;
        let expected = ext_max_seq.wrapping_sub(self.base_sn as u32).wrapping_add(1);
        let lost = expected.saturating_sub(self.stats.packet_count);

        let expected_interval = expected.wrapping_sub(self.stats.last_expected);
        self.stats.last_expected = expected;
        let received_interval = self
            .stats
            .packet_count
            .wrapping_sub(self.stats.last_received);
        self.stats.last_received = self.stats.packet_count;
        let lost_interval = expected_interval as i64 - received_interval as i64;

        self.stats.lost_rate = if expected_interval > 0 && lost_interval > 0 {
            lost_interval as f32 / expected_interval as f32
        } else {
            0.0
        };
        let fraction_lost = if expected_interval != 0 && lost_interval > 0 {
            ((lost_interval << 8) / expected_interval as i64) as u8
        } else {
            0
        };

        let mut dlsr = 0u32;
        if self.last_sr_time != 0 {
            let delay_ms = ((now - self.last_sr_time) / 1_000_000) as u32;
            dlsr = (delay_ms / 1000) << 16 | (delay_ms % 1000) * 65536 / 1000;
        }

        ReceptionReport {
            ssrc: media_ssrc,
            fraction_lost,
            total_lost: lost,
            last_sequence_number: ext_max_seq,
            jitter: self.stats.jitter as u32,
            last_sender_report: (self.sr_ntp >> 16) as u32,
            delay: dlsr,
        }
    }

    fn build_remb(&mut self, media_ssrc: u32, br: u64) -> ReceiverEstimatedMaximumBitrate {
        let mut br = br as f64;
        if self.stats.lost_rate < 0.02 {
            br = br * 1.09 + 2000.0;
        }
        if self.stats.lost_rate > 0.1 {
            br *= 1.0 - 0.5 * self.stats.lost_rate as f64;
        }
        if self.max_bitrate > 0 && br > self.max_bitrate as f64 {
            br = self.max_bitrate as f64;
        }
        if br < 100_000.0 {
            br = 100_000.0;
        }
        self.stats.total_byte = 0;

        ReceiverEstimatedMaximumBitrate {
            sender_ssrc: 0,
            bitrate: br as f32,
            ssrcs: vec![media_ssrc],
        }
    }
}
