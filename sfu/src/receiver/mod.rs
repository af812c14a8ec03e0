#[cfg(test)]
mod receiver_test;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use lazy_static::lazy_static;
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use tokio::sync::{mpsc, Mutex};
use util::marshal::Unmarshal;
use waitgroup::WaitGroup;

use buffer::{Buffer, BytePool, Vp8};

use crate::down_track::{DownTrack, DownTrackType};
use crate::error::{Error, Result};
use crate::sequencer::PacketMeta;
use crate::track::{
    RemoteTrack, RtpCodecCapability, TrackKind, FULL_RESOLUTION, HALF_RESOLUTION,
};

/// Jobs queued to a receiver's NACK worker.
const NACK_QUEUE_DEPTH: usize = 32;
/// Retransmit scratch buffers, shared process-wide.
const SCRATCH_PKT_SIZE: usize = 1460;

lazy_static! {
    static ref PACKET_FACTORY: BytePool = BytePool::new(SCRATCH_PKT_SIZE);
}

pub type OnReceiverCloseFn =
    Box<dyn (FnMut() -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync>;

/// What a [`DownTrack`] and the router need from the object fanning a source
/// track out.
#[async_trait]
pub trait Receiver: Send + Sync {
    fn track_id(&self) -> &str;
    fn stream_id(&self) -> &str;
    fn codec(&self) -> RtpCodecCapability;
    fn kind(&self) -> TrackKind;
    fn ssrc(&self, layer: usize) -> u32;
    fn is_simulcast(&self) -> bool;
    /// Per-layer receive bitrate, zero where no layer exists.
    fn get_bitrate(&self) -> [u64; 3];
    /// Highest observed temporal layer per spatial layer.
    fn get_max_temporal_layer(&self) -> [i32; 3];
    fn has_spatial_layer(&self, layer: usize) -> bool;

    async fn add_down_track(&self, track: Arc<DownTrack>, best_quality_first: bool);
    /// Stages a keyframe-gated move of `track` to `layer`.
    async fn switch_down_track(&self, track: &Arc<DownTrack>, layer: usize) -> Result<()>;
    async fn delete_down_track(&self, layer: usize, id: &str);
    /// Forwards RTCP toward the publisher through the router.
    async fn send_rtcp(&self, pkts: Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>);
    /// Queues retransmission of `packets` to `track` on the NACK worker.
    async fn retransmit_packets(
        &self,
        track: Arc<DownTrack>,
        packets: Vec<PacketMeta>,
    ) -> Result<()>;
    /// Last sender-report (rtp, ntp) pair seen on `layer`.
    async fn get_sender_report_time(&self, layer: usize) -> (u32, u64);
}

struct NackJob {
    track: Arc<DownTrack>,
    packets: Vec<PacketMeta>,
}

/// Per-source-track fan-out: up to three simulcast slots, each with its own
/// jitter buffer and reader task pushing to an atomically published list of
/// downtracks.
pub struct TrackReceiver {
    peer_id: String,
    track_id: String,
    stream_id: String,
    kind: TrackKind,
    codec: RtpCodecCapability,
    is_simulcast: bool,
    closed: AtomicBool,

    buffers: RwLock<[Option<Arc<Buffer>>; 3]>,
    up_tracks: RwLock<[Option<RemoteTrack>; 3]>,
    available: [AtomicBool; 3],
    /// Copy-on-write snapshots: the fan-out loop iterates these without
    /// taking any lock.
    down_tracks: [ArcSwap<Vec<Arc<DownTrack>>>; 3],
    pending: [AtomicBool; 3],
    /// Serializes all list mutations (the "receiver lock").
    write_state: Mutex<WriteState>,

    rtcp_tx: mpsc::Sender<Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>>,
    nack_tx: Mutex<Option<mpsc::Sender<NackJob>>>,

    wg: Mutex<Option<WaitGroup>>,
    on_close_handler: Mutex<Option<OnReceiverCloseFn>>,
}

#[derive(Default)]
struct WriteState {
    pending_tracks: [Vec<Arc<DownTrack>>; 3],
}

impl TrackReceiver {
    pub fn new(
        track: &RemoteTrack,
        peer_id: String,
        rtcp_tx: mpsc::Sender<Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>>,
    ) -> Arc<Self> {
        let (nack_tx, nack_rx) = mpsc::channel(NACK_QUEUE_DEPTH);
        let receiver = Arc::new(TrackReceiver {
            peer_id,
            track_id: track.id.clone(),
            stream_id: track.stream_id.clone(),
            kind: track.kind(),
            codec: track.codec.clone(),
            is_simulcast: !track.rid.is_empty(),
            closed: AtomicBool::new(false),
            buffers: RwLock::new([None, None, None]),
            up_tracks: RwLock::new([None, None, None]),
            available: [
                AtomicBool::new(false),
                AtomicBool::new(false),
                AtomicBool::new(false),
            ],
            down_tracks: [
                ArcSwap::from_pointee(Vec::new()),
                ArcSwap::from_pointee(Vec::new()),
                ArcSwap::from_pointee(Vec::new()),
            ],
            pending: [
                AtomicBool::new(false),
                AtomicBool::new(false),
                AtomicBool::new(false),
            ],
            write_state: Mutex::new(WriteState::default()),
            rtcp_tx,
            nack_tx: Mutex::new(Some(nack_tx)),
            wg: Mutex::new(Some(WaitGroup::new())),
            on_close_handler: Mutex::new(None),
        });

        let worker = Arc::clone(&receiver);
        tokio::spawn(async move {
            worker.nack_worker(nack_rx).await;
        });
        receiver
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub async fn on_close(&self, f: OnReceiverCloseFn) {
        let mut handler = self.on_close_handler.lock().await;
        *handler = Some(f);
    }

    /// Assigns an upstream encoding to its slot and starts the fan-out task.
    pub async fn add_up_track(
        self: &Arc<Self>,
        track: RemoteTrack,
        buff: Arc<Buffer>,
        best_quality_first: bool,
    ) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let layer = match track.rid.as_str() {
            FULL_RESOLUTION => 2,
            HALF_RESOLUTION => 1,
            _ => 0,
        };
        {
            let mut up_tracks = match self.up_tracks.write() {
                Ok(g) => g,
                Err(_) => return,
            };
            let mut buffers = match self.buffers.write() {
                Ok(g) => g,
                Err(_) => return,
            };
            up_tracks[layer] = Some(track);
            buffers[layer] = Some(Arc::clone(&buff));
        }
        self.available[layer].store(true, Ordering::Release);

        // re-slot subscribers parked on a worse choice than the new encoding
        if self.is_simulcast {
            if best_quality_first && (!self.available[2].load(Ordering::Acquire) || layer == 2) {
                self.reslot_down_tracks(0..layer, layer).await;
            } else if !best_quality_first
                && (!self.available[0].load(Ordering::Acquire) || layer == 0)
            {
                self.reslot_down_tracks(layer + 1..3, layer).await;
            }
        }

        let recv = Arc::clone(self);
        let worker = {
            let wg = self.wg.lock().await;
            wg.as_ref().map(|w| w.worker())
        };
        tokio::spawn(async move {
            let _w = worker;
            recv.write_rtp_loop(layer, buff).await;
        });
    }

    /// Stages a switch to `new_layer` for every downtrack currently in the
    /// given slots.
    async fn reslot_down_tracks(
        self: &Arc<Self>,
        slots: std::ops::Range<usize>,
        new_layer: usize,
    ) {
        let mut moves: Vec<Arc<DownTrack>> = Vec::new();
        for l in slots {
            for dt in self.down_tracks[l].load().iter() {
                moves.push(Arc::clone(dt));
            }
        }
        for dt in moves {
            if let Err(e) = dt.switch_spatial_layer(new_layer, false).await {
                log::debug!("reslot of {} to {new_layer} rejected: {e}", dt.id());
            }
        }
    }

    async fn write_rtp_loop(self: Arc<Self>, layer: usize, buff: Arc<Buffer>) {
        let pli_sender_ssrc = rand::random::<u32>();
        loop {
            let pkt = match buff.read_extended().await {
                Ok(p) => p,
                Err(_) => break, // upstream gone
            };
            if self.closed.load(Ordering::Acquire) {
                break;
            }

            if self.is_simulcast && self.pending[layer].load(Ordering::Acquire) {
                if pkt.key_frame {
                    let mut state = self.write_state.lock().await;
                    let pending = std::mem::take(&mut state.pending_tracks[layer]);
                    for dt in pending {
                        let from = dt.current_spatial_layer();
                        self.remove_from_slot(from, dt.id());
                        self.store_down_track(layer, Arc::clone(&dt));
                        dt.switch_spatial_layer_done(layer);
                    }
                    self.pending[layer].store(false, Ordering::Release);
                } else {
                    self.send_rtcp(vec![Box::new(PictureLossIndication {
                        sender_ssrc: pli_sender_ssrc,
                        media_ssrc: self.ssrc(layer),
                    })])
                    .await;
                }
            }

            let snapshot = self.down_tracks[layer].load_full();
            for dt in snapshot.iter() {
                if let Err(err) = dt.write_rtp(&pkt, layer).await {
                    match err {
                        Error::ErrClosedPipe | Error::ErrIoEof => {
                            {
                                let _state = self.write_state.lock().await;
                                self.remove_from_slot(layer, dt.id());
                            }
                            dt.close().await;
                        }
                        err => log::error!("writing to down track {}: {err}", dt.id()),
                    }
                }
            }
        }
    }

    fn store_down_track(&self, layer: usize, track: Arc<DownTrack>) {
        let current = self.down_tracks[layer].load();
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(track);
        self.down_tracks[layer].store(Arc::new(next));
    }

    fn remove_from_slot(&self, layer: usize, id: &str) {
        let current = self.down_tracks[layer].load();
        let next: Vec<Arc<DownTrack>> = current
            .iter()
            .filter(|dt| dt.id() != id)
            .cloned()
            .collect();
        self.down_tracks[layer].store(Arc::new(next));
    }

    async fn nack_worker(self: Arc<Self>, mut rx: mpsc::Receiver<NackJob>) {
        while let Some(job) = rx.recv().await {
            let mut scratch = PACKET_FACTORY.get();
            for meta in &job.packets {
                let buff = {
                    match self.buffers.read() {
                        Ok(buffers) => buffers[meta.layer as usize].clone(),
                        Err(_) => None,
                    }
                };
                let buff = match buff {
                    Some(b) => b,
                    None => break,
                };
                let n = match buff.get_packet(&mut scratch, meta.source_seq_no).await {
                    Ok(n) => n,
                    Err(_) => continue, // aged out of the bucket
                };
                let mut raw = &scratch[..n];
                let mut pkt = match rtp::packet::Packet::unmarshal(&mut raw) {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                pkt.header.sequence_number = meta.target_seq_no;
                pkt.header.timestamp = meta.timestamp;
                pkt.header.ssrc = job.track.ssrc();
                pkt.header.payload_type = job.track.payload_type();

                // re-apply the VP8 rewrite this packet originally went out with
                if job.track.codec().mime_type.eq_ignore_ascii_case("video/vp8")
                    && job.track.track_type() == DownTrackType::SimulcastDownTrack
                {
                    let mut vp8 = Vp8::default();
                    if vp8.unmarshal(&pkt.payload).is_ok() {
                        let (tlz, pic_id) = meta.vp8_payload_meta();
                        let mut payload = bytes::BytesMut::from(&pkt.payload[..]);
                        crate::down_track::modify_vp8_payload(&mut payload[..], &vp8, pic_id, tlz);
                        pkt.payload = payload.freeze();
                    }
                }

                if let Some(ws) = job.track.write_stream() {
                    match ws.write_rtp(&pkt).await {
                        Ok(_) => job.track.update_stats(pkt.payload.len() as u32),
                        Err(e) => log::debug!("retransmit write failed: {e}"),
                    }
                }
            }
            PACKET_FACTORY.put(scratch);
        }
    }

    /// Tears the receiver down: stops fan-out tasks, closes all downtracks,
    /// drains the NACK worker and fires the close hook.
    pub async fn close_tracks(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut nack_tx = self.nack_tx.lock().await;
            nack_tx.take();
        }

        let buffers: Vec<Arc<Buffer>> = {
            match self.buffers.read() {
                Ok(g) => g.iter().flatten().cloned().collect(),
                Err(_) => Vec::new(),
            }
        };
        for b in buffers {
            b.close().await;
        }

        for layer in 0..3 {
            let dts = self.down_tracks[layer].swap(Arc::new(Vec::new()));
            for dt in dts.iter() {
                dt.close().await;
            }
        }

        let wg = {
            let mut wg = self.wg.lock().await;
            wg.take()
        };
        if let Some(wg) = wg {
            wg.wait().await;
        }

        let mut handler = self.on_close_handler.lock().await;
        if let Some(f) = handler.as_mut() {
            f().await;
        }
    }
}

#[async_trait]
impl Receiver for TrackReceiver {
    fn track_id(&self) -> &str {
        &self.track_id
    }

    fn stream_id(&self) -> &str {
        &self.stream_id
    }

    fn codec(&self) -> RtpCodecCapability {
        self.codec.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn ssrc(&self, layer: usize) -> u32 {
        self.up_tracks
            .read()
            .ok()
            .and_then(|tracks| tracks.get(layer).and_then(|t| t.as_ref().map(|t| t.ssrc)))
            .unwrap_or(0)
    }

    fn is_simulcast(&self) -> bool {
        self.is_simulcast
    }

    fn get_bitrate(&self) -> [u64; 3] {
        let mut brs = [0u64; 3];
        if let Ok(buffers) = self.buffers.read() {
            for (i, b) in buffers.iter().enumerate() {
                if let Some(b) = b {
                    brs[i] = b.bitrate();
                }
            }
        }
        brs
    }

    fn get_max_temporal_layer(&self) -> [i32; 3] {
        let mut mtls = [0i32; 3];
        if let Ok(buffers) = self.buffers.read() {
            for (i, b) in buffers.iter().enumerate() {
                if let Some(b) = b {
                    mtls[i] = b.max_temporal_layer();
                }
            }
        }
        mtls
    }

    fn has_spatial_layer(&self, layer: usize) -> bool {
        layer < 3 && self.available[layer].load(Ordering::Acquire)
    }

    async fn add_down_track(&self, track: Arc<DownTrack>, best_quality_first: bool) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut layer = 0usize;
        if self.is_simulcast {
            for (i, available) in self.available.iter().enumerate() {
                if available.load(Ordering::Acquire) {
                    layer = i;
                    if !best_quality_first {
                        break;
                    }
                }
            }
            track.set_track_type(DownTrackType::SimulcastDownTrack);
            track.set_initial_layers(layer as i32, 2);
            track.set_max_layers(2, 2);
            track.set_last_ssrc(self.ssrc(layer));
        } else {
            track.set_track_type(DownTrackType::SimpleDownTrack);
            track.set_initial_layers(0, 0);
        }
        let _state = self.write_state.lock().await;
        self.store_down_track(layer, track);
    }

    async fn switch_down_track(&self, track: &Arc<DownTrack>, layer: usize) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ErrNoReceiverFound);
        }
        if layer >= 3 || !self.available[layer].load(Ordering::Acquire) {
            return Err(Error::ErrSpatialLayerNotFound);
        }
        let mut state = self.write_state.lock().await;
        state.pending_tracks[layer].push(Arc::clone(track));
        self.pending[layer].store(true, Ordering::Release);
        Ok(())
    }

    async fn delete_down_track(&self, layer: usize, id: &str) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut state = self.write_state.lock().await;
        for pending in state.pending_tracks.iter_mut() {
            pending.retain(|dt| dt.id() != id);
        }
        if layer < 3 {
            self.remove_from_slot(layer, id);
        }
    }

    async fn send_rtcp(&self, pkts: Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>) {
        if let Err(e) = self.rtcp_tx.send(pkts).await {
            log::debug!("rtcp channel closed: {e}");
        }
    }

    async fn retransmit_packets(
        &self,
        track: Arc<DownTrack>,
        packets: Vec<PacketMeta>,
    ) -> Result<()> {
        let nack_tx = self.nack_tx.lock().await;
        let tx = nack_tx.as_ref().ok_or(Error::ErrClosedPipe)?;
        if tx.try_send(NackJob { track, packets }).is_err() {
            log::debug!("nack worker saturated, retransmit request dropped");
        }
        Ok(())
    }

    async fn get_sender_report_time(&self, layer: usize) -> (u32, u64) {
        let buff = {
            match self.buffers.read() {
                Ok(buffers) => buffers.get(layer).and_then(|b| b.clone()),
                Err(_) => None,
            }
        };
        match buff {
            Some(b) => {
                let (rtp, ntp, _) = b.get_sender_report_data().await;
                (rtp, ntp)
            }
            None => (0, 0),
        }
    }
}
