#[cfg(test)]
mod down_track_test;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, SystemTime};

use bytes::{Bytes, BytesMut};
use rtcp::payload_feedbacks::full_intra_request::{FirEntry, FullIntraRequest};
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use rtcp::receiver_report::ReceiverReport;
use rtcp::sender_report::SenderReport;
use rtcp::source_description::{SdesType, SourceDescriptionChunk, SourceDescriptionItem};
use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use tokio::sync::Mutex as AsyncMutex;

use buffer::{ExtPacket, Vp8};

use crate::error::{Error, Result};
use crate::helpers::{ntp_to_millis, to_ntp_time, unix_nanos};
use crate::receiver::Receiver;
use crate::sequencer::Sequencer;
use crate::simulcast::{SimulcastConfig, SimulcastTrackHelpers, Vp8ResumePolicy};
use crate::track::{RtpCodecCapability, TrackKind, TrackLocalContext, TrackLocalWriter};

/// Hold-off after a loss-driven spatial downswitch.
const SPATIAL_DOWN_DELAY: Duration = Duration::from_secs(10);
/// Hold-off after a spatial upswitch.
const SPATIAL_UP_DELAY: Duration = Duration::from_secs(10);
/// Temporal moves settle faster.
const TEMPORAL_UP_DELAY: Duration = Duration::from_secs(3);
const TEMPORAL_DOWN_DELAY: Duration = Duration::from_secs(5);

pub type OnCloseFn =
    Box<dyn (FnMut() -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync>;
pub type OnBindFn =
    Box<dyn (FnMut() -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownTrackType {
    SimpleDownTrack,
    SimulcastDownTrack,
}

#[derive(Debug)]
struct RewriteState {
    track_type: DownTrackType,
    last_sn: u16,
    last_ts: u32,
    sn_offset: u16,
    ts_offset: u32,
}

enum MungeOutcome {
    Drop,
    Forward {
        payload: Bytes,
        pic_id: u16,
        tlz: u8,
    },
}

enum LayerMove {
    SpatialUp(usize),
    SpatialDown(usize),
    TemporalUp(i32),
    TemporalDown(i32),
}

/// Outgoing track toward one subscriber for one source track.
///
/// Rewrites SSRC, payload type, sequence numbers and timestamps so the
/// subscriber sees a single continuous RTP stream regardless of which
/// simulcast layer is feeding it, translates the subscriber's RTCP back into
/// upstream terms, and drives layer selection from REMB/receiver reports.
pub struct DownTrack {
    id: String,
    peer_id: String,
    stream_id: String,
    codec: RtpCodecCapability,
    kind: TrackKind,

    ssrc: AtomicU32,
    payload_type: AtomicU32,
    bound: AtomicBool,
    closed: AtomicBool,
    enabled: AtomicBool,
    re_sync: AtomicBool,
    last_ssrc: AtomicU32,

    /// target << 16 | current
    spatial_layer: AtomicU32,
    temporal_layer: AtomicU32,
    max_spatial_layer: AtomicI32,
    max_temporal_layer: AtomicI32,

    octet_count: AtomicU32,
    packet_count: AtomicU32,

    rewrite: Mutex<RewriteState>,
    sequencer: Mutex<Sequencer>,
    simulcast: Mutex<SimulcastTrackHelpers>,
    resume_policy: Vp8ResumePolicy,

    receiver: Weak<dyn Receiver + Send + Sync>,
    write_stream: RwLock<Option<Arc<dyn TrackLocalWriter>>>,

    on_close_handler: AsyncMutex<Option<OnCloseFn>>,
    on_bind_handler: AsyncMutex<Option<OnBindFn>>,
}

impl DownTrack {
    pub fn new(
        codec: RtpCodecCapability,
        receiver: Weak<dyn Receiver + Send + Sync>,
        peer_id: String,
        id: String,
        stream_id: String,
        simulcast_cfg: SimulcastConfig,
    ) -> Self {
        let kind = if codec.is_audio() {
            TrackKind::Audio
        } else {
            TrackKind::Video
        };
        let mut helpers = SimulcastTrackHelpers::new();
        helpers.temporal_enabled = simulcast_cfg.enable_temporal_layer;
        DownTrack {
            id,
            peer_id,
            stream_id,
            codec,
            kind,
            ssrc: AtomicU32::new(0),
            payload_type: AtomicU32::new(0),
            bound: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
            re_sync: AtomicBool::new(false),
            last_ssrc: AtomicU32::new(0),
            spatial_layer: AtomicU32::new(0),
            temporal_layer: AtomicU32::new(0),
            max_spatial_layer: AtomicI32::new(0),
            max_temporal_layer: AtomicI32::new(0),
            octet_count: AtomicU32::new(0),
            packet_count: AtomicU32::new(0),
            rewrite: Mutex::new(RewriteState {
                track_type: DownTrackType::SimpleDownTrack,
                last_sn: 0,
                last_ts: 0,
                sn_offset: 0,
                ts_offset: 0,
            }),
            sequencer: Mutex::new(Sequencer::new()),
            simulcast: Mutex::new(helpers),
            resume_policy: simulcast_cfg.vp8_resume_policy,
            receiver,
            write_stream: RwLock::new(None),
            on_close_handler: AsyncMutex::new(None),
            on_bind_handler: AsyncMutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn codec(&self) -> &RtpCodecCapability {
        &self.codec
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc.load(Ordering::Acquire)
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type.load(Ordering::Acquire) as u8
    }

    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::Acquire)
    }

    pub(crate) fn write_stream(&self) -> Option<Arc<dyn TrackLocalWriter>> {
        self.write_stream.read().ok().and_then(|g| g.clone())
    }

    pub fn track_type(&self) -> DownTrackType {
        self.rewrite
            .lock()
            .map(|r| r.track_type)
            .unwrap_or(DownTrackType::SimpleDownTrack)
    }

    pub(crate) fn set_track_type(&self, t: DownTrackType) {
        if let Ok(mut r) = self.rewrite.lock() {
            r.track_type = t;
        }
    }

    pub(crate) fn set_initial_layers(&self, spatial: i32, temporal: i32) {
        let s = spatial as u32 & 0xffff;
        let t = temporal as u32 & 0xffff;
        self.spatial_layer.store(s << 16 | s, Ordering::SeqCst);
        self.temporal_layer.store(t << 16 | t, Ordering::SeqCst);
    }

    pub(crate) fn set_max_layers(&self, spatial: i32, temporal: i32) {
        self.max_spatial_layer.store(spatial, Ordering::SeqCst);
        self.max_temporal_layer.store(temporal, Ordering::SeqCst);
    }

    pub(crate) fn set_last_ssrc(&self, ssrc: u32) {
        self.last_ssrc.store(ssrc, Ordering::Release);
    }

    pub fn last_ssrc(&self) -> u32 {
        self.last_ssrc.load(Ordering::Acquire)
    }

    pub fn current_spatial_layer(&self) -> usize {
        (self.spatial_layer.load(Ordering::SeqCst) & 0xffff) as usize
    }

    pub fn target_spatial_layer(&self) -> usize {
        (self.spatial_layer.load(Ordering::SeqCst) >> 16) as usize
    }

    pub fn current_temporal_layer(&self) -> i32 {
        (self.temporal_layer.load(Ordering::SeqCst) & 0xffff) as i32
    }

    pub fn target_temporal_layer(&self) -> i32 {
        (self.temporal_layer.load(Ordering::SeqCst) >> 16) as i32
    }

    /// Called by the subscriber's transport once the sender is negotiated.
    pub async fn bind(&self, ctx: TrackLocalContext) {
        self.ssrc.store(ctx.ssrc, Ordering::Release);
        self.payload_type
            .store(ctx.payload_type as u32, Ordering::Release);
        if let Ok(mut ws) = self.write_stream.write() {
            *ws = Some(Arc::clone(&ctx.write_stream));
        }
        if self.kind == TrackKind::Video {
            // deliver nothing until a keyframe lines the decoder up
            self.re_sync.store(true, Ordering::Release);
        }
        self.bound.store(true, Ordering::Release);
        let mut handler = self.on_bind_handler.lock().await;
        if let Some(f) = handler.as_mut() {
            f().await;
        }
    }

    pub async fn unbind(&self) {
        self.bound.store(false, Ordering::Release);
        if let Ok(mut ws) = self.write_stream.write() {
            *ws = None;
        }
    }

    /// Disables (or re-enables) forwarding. Re-enabling a video track forces
    /// a resync so output resumes on a keyframe.
    pub fn mute(&self, val: bool) {
        if self.enabled.load(Ordering::Acquire) != val {
            return;
        }
        self.enabled.store(!val, Ordering::Release);
        if !val && self.kind == TrackKind::Video {
            self.re_sync.store(true, Ordering::Release);
        }
    }

    pub fn is_muted(&self) -> bool {
        !self.enabled.load(Ordering::Acquire)
    }

    pub async fn on_close(&self, f: OnCloseFn) {
        let mut handler = self.on_close_handler.lock().await;
        *handler = Some(f);
    }

    pub async fn on_bind(&self, f: OnBindFn) {
        let mut handler = self.on_bind_handler.lock().await;
        *handler = Some(f);
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.unbind().await;
        let mut handler = self.on_close_handler.lock().await;
        if let Some(f) = handler.as_mut() {
            f().await;
        }
    }

    pub(crate) fn update_stats(&self, packet_len: u32) {
        self.octet_count.fetch_add(packet_len, Ordering::AcqRel);
        self.packet_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Forwards one packet from `layer`. Errors bubble up so the receiver can
    /// retire a dead track.
    pub async fn write_rtp(&self, ext: &ExtPacket, layer: usize) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ErrClosedPipe);
        }
        if !self.enabled.load(Ordering::Acquire) || !self.bound.load(Ordering::Acquire) {
            return Ok(());
        }
        match self.track_type() {
            DownTrackType::SimpleDownTrack => self.write_simple_rtp(ext).await,
            DownTrackType::SimulcastDownTrack => self.write_simulcast_rtp(ext, layer).await,
        }
    }

    async fn write_simple_rtp(&self, ext: &ExtPacket) -> Result<()> {
        let ws = match self.write_stream() {
            Some(ws) => ws,
            None => return Ok(()),
        };

        if self.re_sync.load(Ordering::Acquire) {
            if self.kind == TrackKind::Video && !ext.key_frame {
                self.ask_keyframe(ext.packet.header.ssrc).await;
                return Ok(());
            }
            {
                let mut rw = self.rewrite.lock().map_err(poisoned)?;
                if rw.last_sn != 0 {
                    rw.sn_offset = ext
                        .packet
                        .header
                        .sequence_number
                        .wrapping_sub(rw.last_sn)
                        .wrapping_sub(1);
                    rw.ts_offset = ext
                        .packet
                        .header
                        .timestamp
                        .wrapping_sub(rw.last_ts)
                        .wrapping_sub(1);
                }
            }
            self.last_ssrc
                .store(ext.packet.header.ssrc, Ordering::Release);
            self.re_sync.store(false, Ordering::Release);
        }

        self.update_stats(ext.packet.payload.len() as u32);

        let (new_sn, new_ts) = {
            let mut rw = self.rewrite.lock().map_err(poisoned)?;
            let new_sn = ext
                .packet
                .header
                .sequence_number
                .wrapping_sub(rw.sn_offset);
            let new_ts = ext.packet.header.timestamp.wrapping_sub(rw.ts_offset);
            if ext.head {
                rw.last_sn = new_sn;
                rw.last_ts = new_ts;
            }
            (new_sn, new_ts)
        };
        if let Ok(mut seq) = self.sequencer.lock() {
            seq.push(
                ext.packet.header.sequence_number,
                new_sn,
                new_ts,
                0,
                ext.head,
            );
        }

        let mut hdr = ext.packet.header.clone();
        hdr.sequence_number = new_sn;
        hdr.timestamp = new_ts;
        hdr.ssrc = self.ssrc();
        hdr.payload_type = self.payload_type();
        ws.write_rtp(&rtp::packet::Packet {
            header: hdr,
            payload: ext.packet.payload.clone(),
        })
        .await?;
        Ok(())
    }

    async fn write_simulcast_rtp(&self, ext: &ExtPacket, layer: usize) -> Result<()> {
        let ws = match self.write_stream() {
            Some(ws) => ws,
            None => return Ok(()),
        };
        let src_ssrc = ext.packet.header.ssrc;
        let re_sync = self.re_sync.load(Ordering::Acquire);

        if self.last_ssrc() != src_ssrc || re_sync {
            if !re_sync && layer != self.target_spatial_layer() {
                // leftover packet from a slot this track is leaving
                return Ok(());
            }
            if !ext.key_frame {
                self.ask_keyframe(src_ssrc).await;
                return Ok(());
            }
            self.commit_switch(ext, layer)?;
            self.last_ssrc.store(src_ssrc, Ordering::Release);
            self.re_sync.store(false, Ordering::Release);
        }

        if layer != self.current_spatial_layer() {
            return Ok(());
        }

        let mut payload = ext.packet.payload.clone();
        let mut vp8_meta: Option<(u8, u16)> = None;
        let temporal_active = {
            let sim = self.simulcast.lock().map_err(poisoned)?;
            sim.temporal_enabled
        };
        if self.is_vp8() && temporal_active && ext.payload.temporal_supported {
            match self.munge_vp8(ext)? {
                MungeOutcome::Drop => {
                    // keep the outgoing stream gapless over the dropped frame
                    let mut rw = self.rewrite.lock().map_err(poisoned)?;
                    rw.sn_offset = rw.sn_offset.wrapping_add(1);
                    return Ok(());
                }
                MungeOutcome::Forward {
                    payload: p,
                    pic_id,
                    tlz,
                } => {
                    payload = p;
                    vp8_meta = Some((tlz, pic_id));
                }
            }
        }

        self.update_stats(ext.packet.payload.len() as u32);

        let (new_sn, new_ts) = {
            let mut rw = self.rewrite.lock().map_err(poisoned)?;
            let new_sn = ext
                .packet
                .header
                .sequence_number
                .wrapping_sub(rw.sn_offset);
            let new_ts = ext.packet.header.timestamp.wrapping_sub(rw.ts_offset);
            if ext.head {
                rw.last_sn = new_sn;
                rw.last_ts = new_ts;
            }
            (new_sn, new_ts)
        };
        if let Ok(mut seq) = self.sequencer.lock() {
            if let Some(meta) = seq.push(
                ext.packet.header.sequence_number,
                new_sn,
                new_ts,
                layer as u8,
                ext.head,
            ) {
                if let Some((tlz, pic_id)) = vp8_meta {
                    meta.set_vp8_payload_meta(tlz, pic_id);
                }
            }
        }
        if let Ok(mut sim) = self.simulcast.lock() {
            sim.l_ts_calc = ext.arrival;
        }

        let mut hdr = ext.packet.header.clone();
        hdr.sequence_number = new_sn;
        hdr.timestamp = new_ts;
        hdr.ssrc = self.ssrc();
        hdr.payload_type = self.payload_type();
        ws.write_rtp(&rtp::packet::Packet {
            header: hdr,
            payload,
        })
        .await?;
        Ok(())
    }

    /// First keyframe of the new source: compute offsets that keep the
    /// outgoing sequence space and clock continuous across the jump.
    fn commit_switch(&self, ext: &ExtPacket, layer: usize) -> Result<()> {
        let mut rw = self.rewrite.lock().map_err(poisoned)?;
        let mut sim = self.simulcast.lock().map_err(poisoned)?;

        if sim.l_ts_calc != 0 {
            let tdiff_ms = (ext.arrival - sim.l_ts_calc) / 1_000_000;
            let mut td = (tdiff_ms * (self.codec.clock_rate as i64 / 1000)) as u32;
            if td == 0 {
                td = 1;
            }
            rw.ts_offset = ext
                .packet
                .header
                .timestamp
                .wrapping_sub(rw.last_ts.wrapping_add(td));
            rw.sn_offset = ext
                .packet
                .header
                .sequence_number
                .wrapping_sub(rw.last_sn)
                .wrapping_sub(1);
        }

        if self.is_vp8() {
            let same_layer = layer == self.current_spatial_layer();
            let resumed = same_layer && self.last_ssrc() == ext.packet.header.ssrc;
            if !resumed || self.resume_policy == Vp8ResumePolicy::ReAnchor {
                sim.anchor_vp8(ext.payload.picture_id, ext.payload.tl0_pic_idx);
            }
            sim.temporal_supported = ext.payload.temporal_supported;
        }
        sim.l_ts_calc = ext.arrival;
        Ok(())
    }

    fn munge_vp8(&self, ext: &ExtPacket) -> Result<MungeOutcome> {
        let vp8 = &ext.payload;

        let packed = self.temporal_layer.load(Ordering::SeqCst);
        let mut current = packed & 0xffff;
        let target = packed >> 16;
        if target != current && vp8.tid as u32 <= target {
            // layer move commits on the first packet at or below the target
            self.temporal_layer
                .store(target << 16 | target, Ordering::SeqCst);
            current = target;
        }
        if vp8.tid as u32 > current {
            return Ok(MungeOutcome::Drop);
        }

        let (pic_id, tlz) = {
            let mut sim = self.simulcast.lock().map_err(poisoned)?;
            let pic_id = vp8
                .picture_id
                .wrapping_sub(sim.ref_pic_id)
                .wrapping_add(sim.p_ref_pic_id)
                .wrapping_add(1)
                & 0x7fff;
            let tlz = vp8
                .tl0_pic_idx
                .wrapping_sub(sim.ref_tlz_idx)
                .wrapping_add(sim.p_ref_tlz_idx)
                .wrapping_add(1);
            if ext.head {
                sim.l_pic_id = pic_id;
                sim.l_tlz_idx = tlz;
            }
            (pic_id, tlz)
        };

        let mut buf = BytesMut::from(&ext.packet.payload[..]);
        modify_vp8_payload(&mut buf[..], vp8, pic_id, tlz);
        Ok(MungeOutcome::Forward {
            payload: buf.freeze(),
            pic_id,
            tlz,
        })
    }

    async fn ask_keyframe(&self, media_ssrc: u32) {
        if let Some(recv) = self.receiver.upgrade() {
            recv.send_rtcp(vec![Box::new(PictureLossIndication {
                sender_ssrc: self.ssrc(),
                media_ssrc,
            })])
            .await;
        }
    }

    fn is_vp8(&self) -> bool {
        self.codec.mime_type.eq_ignore_ascii_case("video/vp8")
    }

    /// Handles the RTCP a subscriber sent for this track.
    pub async fn handle_rtcp(self: &Arc<Self>, raw: &[u8]) -> Result<()> {
        if !self.enabled.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut buf = raw;
        let pkts = rtcp::packet::unmarshal(&mut buf)?;

        let mut fwd: Vec<Box<dyn rtcp::packet::Packet + Send + Sync>> = Vec::new();
        let mut pli_once = true;
        let mut fir_once = true;
        let mut max_rate_packet_loss = 0u8;
        let mut expected_min_bitrate = 0u64;

        for pkt in &pkts {
            let any = pkt.as_any();
            if any.downcast_ref::<PictureLossIndication>().is_some() {
                if pli_once {
                    fwd.push(Box::new(PictureLossIndication {
                        sender_ssrc: self.ssrc(),
                        media_ssrc: self.last_ssrc(),
                    }));
                    pli_once = false;
                }
            } else if let Some(fir) = any.downcast_ref::<FullIntraRequest>() {
                if fir_once {
                    fwd.push(Box::new(FullIntraRequest {
                        sender_ssrc: self.ssrc(),
                        media_ssrc: self.last_ssrc(),
                        fir: fir
                            .fir
                            .iter()
                            .map(|e| FirEntry {
                                ssrc: self.last_ssrc(),
                                sequence_number: e.sequence_number,
                            })
                            .collect(),
                    }));
                    fir_once = false;
                }
            } else if let Some(rr) = any.downcast_ref::<ReceiverReport>() {
                for r in &rr.reports {
                    if r.fraction_lost > max_rate_packet_loss {
                        max_rate_packet_loss = r.fraction_lost;
                    }
                }
            } else if let Some(remb) = any.downcast_ref::<ReceiverEstimatedMaximumBitrate>() {
                let br = remb.bitrate as u64;
                if expected_min_bitrate == 0 || br < expected_min_bitrate {
                    expected_min_bitrate = br;
                }
            } else if let Some(nack) = any.downcast_ref::<TransportLayerNack>() {
                let mut seq_nos = Vec::new();
                for pair in &nack.nacks {
                    seq_nos.extend(pair.packet_list());
                }
                let metas = match self.sequencer.lock() {
                    Ok(mut seq) => seq.get_seq_no_pairs(&seq_nos),
                    Err(_) => Vec::new(),
                };
                if !metas.is_empty() {
                    if let Some(recv) = self.receiver.upgrade() {
                        if let Err(e) = recv.retransmit_packets(Arc::clone(self), metas).await {
                            log::debug!("retransmit dispatch failed: {e}");
                        }
                    }
                }
            }
        }

        if self.track_type() == DownTrackType::SimulcastDownTrack
            && (max_rate_packet_loss != 0 || expected_min_bitrate != 0)
        {
            self.handle_layer_change(max_rate_packet_loss, expected_min_bitrate)
                .await;
        }
        if !fwd.is_empty() {
            if let Some(recv) = self.receiver.upgrade() {
                recv.send_rtcp(fwd).await;
            }
        }
        Ok(())
    }

    async fn handle_layer_change(
        self: &Arc<Self>,
        max_rate_packet_loss: u8,
        expected_min_bitrate: u64,
    ) {
        let csl = self.current_spatial_layer();
        let ctl = self.current_temporal_layer();
        if csl != self.target_spatial_layer() || ctl != self.target_temporal_layer() {
            // a switch is already in flight
            return;
        }
        let recv = match self.receiver.upgrade() {
            Some(r) => r,
            None => return,
        };

        let now = unix_nanos();
        let mv = {
            let mut sim = match self.simulcast.lock() {
                Ok(s) => s,
                Err(_) => return,
            };
            if now < sim.switch_delay {
                None
            } else {
                let brs = recv.get_bitrate();
                let cbr = brs[csl];
                let mctl = recv.get_max_temporal_layer()[csl];
                let max_sl = self.max_spatial_layer.load(Ordering::SeqCst);
                let max_tl = self.max_temporal_layer.load(Ordering::SeqCst);
                let loss_pct = max_rate_packet_loss as u32 * 100 / 256;

                if loss_pct >= 25 {
                    if csl > 0 {
                        sim.switch_delay = now + SPATIAL_DOWN_DELAY.as_nanos() as i64;
                        Some(LayerMove::SpatialDown(csl - 1))
                    } else if ctl > 0 {
                        sim.switch_delay = now + TEMPORAL_DOWN_DELAY.as_nanos() as i64;
                        Some(LayerMove::TemporalDown(ctl - 1))
                    } else {
                        None
                    }
                } else if loss_pct <= 5 {
                    if ctl < mctl
                        && ctl + 1 <= max_tl
                        && expected_min_bitrate.saturating_mul(4) >= cbr.saturating_mul(3)
                    {
                        sim.switch_delay = now + TEMPORAL_UP_DELAY.as_nanos() as i64;
                        Some(LayerMove::TemporalUp(ctl + 1))
                    } else if (csl as i32) < max_sl
                        && csl + 1 <= 2
                        && recv.has_spatial_layer(csl + 1)
                        && expected_min_bitrate.saturating_mul(2) >= cbr.saturating_mul(3)
                    {
                        sim.switch_delay = now + SPATIAL_UP_DELAY.as_nanos() as i64;
                        Some(LayerMove::SpatialUp(csl + 1))
                    } else {
                        None
                    }
                } else {
                    None
                }
            }
        };

        match mv {
            Some(LayerMove::SpatialUp(l)) | Some(LayerMove::SpatialDown(l)) => {
                if let Err(e) = self.switch_spatial_layer(l, false).await {
                    log::debug!("spatial switch to {l} rejected: {e}");
                }
            }
            Some(LayerMove::TemporalUp(t)) | Some(LayerMove::TemporalDown(t)) => {
                self.switch_temporal_layer(t, false);
            }
            None => {}
        }
    }

    /// Requests a move to `target`; the receiver commits it on the next
    /// keyframe of that layer.
    pub async fn switch_spatial_layer(
        self: &Arc<Self>,
        target: usize,
        set_as_max: bool,
    ) -> Result<()> {
        if self.track_type() != DownTrackType::SimulcastDownTrack {
            return Err(Error::ErrSpatialLayerNotFound);
        }
        let packed = self.spatial_layer.load(Ordering::SeqCst);
        let current = packed & 0xffff;
        let pending_target = packed >> 16;
        if current == target as u32 {
            return Ok(());
        }
        if pending_target != current {
            return Err(Error::ErrSpatialLayerBusy);
        }
        let recv = self
            .receiver
            .upgrade()
            .ok_or(Error::ErrNoReceiverFound)?;
        recv.switch_down_track(self, target).await?;
        self.spatial_layer
            .store((target as u32) << 16 | current, Ordering::SeqCst);
        if set_as_max {
            self.max_spatial_layer.store(target as i32, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Called by the receiver once the keyframe-gated move has happened.
    pub fn switch_spatial_layer_done(&self, layer: usize) {
        let l = layer as u32;
        self.spatial_layer.store(l << 16 | l, Ordering::SeqCst);
    }

    pub fn switch_temporal_layer(&self, target: i32, set_as_max: bool) {
        let packed = self.temporal_layer.load(Ordering::SeqCst);
        let current = packed & 0xffff;
        let pending_target = packed >> 16;
        if pending_target != current {
            return;
        }
        self.temporal_layer
            .store((target as u32) << 16 | current, Ordering::SeqCst);
        if set_as_max {
            self.max_temporal_layer
                .store(target, Ordering::SeqCst);
        }
    }

    /// Builds the periodic sender report that lets subscribers sync A/V.
    pub async fn create_sender_report(&self) -> Option<SenderReport> {
        if !self.is_bound() {
            return None;
        }
        let recv = self.receiver.upgrade()?;
        let (sr_rtp, sr_ntp) = recv
            .get_sender_report_time(self.current_spatial_layer())
            .await;
        if sr_rtp == 0 {
            return None;
        }

        let now_ntp = to_ntp_time(SystemTime::now());
        let diff_ms = ntp_to_millis(now_ntp).saturating_sub(ntp_to_millis(sr_ntp));
        let diff_ts = diff_ms * self.codec.clock_rate as u64 / 1000;
        let ts_offset = self
            .rewrite
            .lock()
            .map(|r| r.ts_offset)
            .unwrap_or_default();
        let rtp_time = sr_rtp.wrapping_sub(ts_offset).wrapping_add(diff_ts as u32);

        Some(SenderReport {
            ssrc: self.ssrc(),
            ntp_time: now_ntp,
            rtp_time,
            packet_count: self.packet_count.load(Ordering::Acquire),
            octet_count: self.octet_count.load(Ordering::Acquire),
            ..Default::default()
        })
    }

    pub fn create_sdes_chunk(&self) -> SourceDescriptionChunk {
        SourceDescriptionChunk {
            source: self.ssrc(),
            items: vec![SourceDescriptionItem {
                sdes_type: SdesType::SdesCname,
                text: Bytes::from(self.stream_id.clone()),
            }],
        }
    }
}

impl std::fmt::Debug for DownTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownTrack")
            .field("id", &self.id)
            .field("peer_id", &self.peer_id)
            .field("stream_id", &self.stream_id)
            .field("ssrc", &self.ssrc())
            .field("bound", &self.is_bound())
            .finish()
    }
}

pub(crate) fn modify_vp8_payload(buf: &mut [u8], vp8: &Vp8, pic_id: u16, tlz: u8) {
    if vp8.pic_id_idx > 0 {
        let idx = vp8.pic_id_idx;
        if vp8.m_bit {
            buf[idx] = 0x80 | ((pic_id >> 8) as u8 & 0x7f);
            buf[idx + 1] = pic_id as u8;
        } else {
            buf[idx] = (pic_id & 0x7f) as u8;
        }
    }
    if vp8.tlz_idx > 0 {
        buf[vp8.tlz_idx] = tlz;
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> Error {
    Error::Other("lock poisoned".to_string())
}
