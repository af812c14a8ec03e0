
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::sender_report::SenderReport;
use rtcp::source_description::{SdesType, SourceDescription};
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};

use buffer::{Factory, Options};

use crate::audio_observer::AudioObserver;
use crate::down_track::DownTrack;
use crate::error::Result;
use crate::receiver::{Receiver, TrackReceiver};
use crate::simulcast::SimulcastConfig;
use crate::stats;
use crate::subscriber::Subscriber;
use crate::track::{RemoteTrack, TrackKind};

/// Backpressure bound on the RTCP fan-in toward the publisher.
const RTCP_CHANNEL_CAPACITY: usize = 10;

pub type RtcpWriterFn = Box<
    dyn (FnMut(
            Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>)
        + Send
        + Sync,
>;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Maintain per-stream stats and A/V drift tracking.
    pub with_stats: bool,
    /// Per-track ingest cap in kbps; exceeding it shapes REMB feedback.
    pub max_bandwidth: u64,
    /// Video ingest window, in packets.
    pub max_packet_track: usize,
    /// Audio observer interval in milliseconds.
    pub audio_level_interval: u64,
    /// dBov threshold above which a level does not count as speech.
    pub audio_level_threshold: u8,
    /// Percentage of an interval's packets required to qualify.
    pub audio_level_filter: u32,
    pub simulcast: SimulcastConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            with_stats: false,
            max_bandwidth: 1500,
            max_packet_track: 500,
            audio_level_interval: 1000,
            audio_level_threshold: 40,
            audio_level_filter: 20,
            simulcast: SimulcastConfig::default(),
        }
    }
}

/// Per-publisher aggregation: owns the receivers for that publisher's
/// tracks, the RTCP fan-in channel flushed to the publisher's transport, and
/// at most one TWCC responder created with the first video track.
pub struct Router {
    id: String,
    config: RouterConfig,
    buffer_factory: Arc<Factory>,
    audio_observer: Arc<AudioObserver>,
    stats: Option<Arc<stats::Registry>>,

    receivers: Mutex<HashMap<String, Arc<TrackReceiver>>>,
    twcc: Mutex<Option<Arc<twcc::Responder>>>,

    rtcp_tx: mpsc::Sender<Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>>,
    rtcp_rx: Mutex<Option<mpsc::Receiver<Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>>>>,
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl Router {
    pub fn new(
        id: String,
        buffer_factory: Arc<Factory>,
        config: RouterConfig,
        audio_observer: Arc<AudioObserver>,
    ) -> Arc<Self> {
        let (rtcp_tx, rtcp_rx) = mpsc::channel(RTCP_CHANNEL_CAPACITY);
        let stats = if config.with_stats {
            Some(Arc::new(stats::Registry::new()))
        } else {
            None
        };
        Arc::new(Router {
            id,
            config,
            buffer_factory,
            audio_observer,
            stats,
            receivers: Mutex::new(HashMap::new()),
            twcc: Mutex::new(None),
            rtcp_tx,
            rtcp_rx: Mutex::new(Some(rtcp_rx)),
            stop_tx: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Starts the drain task flushing queued RTCP batches to the publisher's
    /// transport.
    pub async fn start(&self, mut writer: RtcpWriterFn) {
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        {
            let mut guard = self.stop_tx.lock().await;
            *guard = Some(stop_tx);
        }
        let rx = {
            let mut guard = self.rtcp_rx.lock().await;
            guard.take()
        };
        let mut rx = match rx {
            Some(rx) => rx,
            None => return,
        };
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => return,
                    pkts = rx.recv() => {
                        match pkts {
                            Some(pkts) => {
                                if let Err(e) = writer(pkts).await {
                                    log::error!("write rtcp to publisher: {e}");
                                }
                            }
                            None => return,
                        }
                    }
                }
            }
        });
    }

    /// Wires the buffers for a new upstream track and hands back its
    /// receiver. `true` when the receiver was created by this call and must
    /// be published to the session.
    pub async fn add_receiver(
        self: &Arc<Self>,
        track: RemoteTrack,
    ) -> Result<(Arc<TrackReceiver>, bool)> {
        let buff = self.buffer_factory.get_or_new_buffer(track.ssrc).await;
        let rtcp_reader = self
            .buffer_factory
            .get_or_new_rtcp_reader(track.ssrc)
            .await;

        let rtcp_tx = self.rtcp_tx.clone();
        buff.on_feedback(Box::new(move |pkts| {
            let tx = rtcp_tx.clone();
            Box::pin(async move {
                let _ = tx.send(pkts).await;
            })
        }))
        .await;

        match track.kind() {
            TrackKind::Audio => {
                self.audio_observer.add_stream(track.stream_id.clone()).await;
                let observer = Arc::clone(&self.audio_observer);
                let stream_id = track.stream_id.clone();
                buff.on_audio_level(Box::new(move |level| {
                    let observer = Arc::clone(&observer);
                    let stream_id = stream_id.clone();
                    Box::pin(async move {
                        observer.observe(&stream_id, level).await;
                    })
                }))
                .await;
            }
            TrackKind::Video => {
                let responder = {
                    let mut twcc_guard = self.twcc.lock().await;
                    match twcc_guard.as_ref() {
                        Some(r) => Arc::clone(r),
                        None => {
                            let responder = Arc::new(twcc::Responder::new(track.ssrc));
                            let tx = self.rtcp_tx.clone();
                            responder
                                .on_feedback(Box::new(move |pkts| {
                                    let tx = tx.clone();
                                    Box::pin(async move {
                                        let _ = tx.send(pkts).await;
                                    })
                                }))
                                .await;
                            *twcc_guard = Some(Arc::clone(&responder));
                            responder
                        }
                    }
                };
                buff.on_transport_wide_cc(Box::new(move |sn, time_ns, marker| {
                    let responder = Arc::clone(&responder);
                    Box::pin(async move {
                        responder.push(sn, time_ns, marker).await;
                    })
                }))
                .await;
            }
        }

        if let Some(reg) = &self.stats {
            reg.add_stream(track.ssrc, track.codec.clock_rate).await;
        }

        // publisher RTCP: sender reports feed A/V sync, SDES names the group
        {
            let buff_sr = Arc::clone(&buff);
            let stats = self.stats.clone();
            rtcp_reader
                .on_packet(Box::new(move |bytes| {
                    let buff = Arc::clone(&buff_sr);
                    let stats = stats.clone();
                    Box::pin(async move {
                        let mut raw = &bytes[..];
                        let pkts = match rtcp::packet::unmarshal(&mut raw) {
                            Ok(pkts) => pkts,
                            Err(e) => {
                                log::debug!("publisher rtcp unmarshal: {e}");
                                return;
                            }
                        };
                        for pkt in pkts {
                            let any = pkt.as_any();
                            if let Some(sr) = any.downcast_ref::<SenderReport>() {
                                buff.set_sender_report_data(sr.rtp_time, sr.ntp_time).await;
                                if let Some(reg) = &stats {
                                    reg.on_sender_report(sr.ssrc, sr.rtp_time, sr.ntp_time)
                                        .await;
                                }
                            } else if let Some(sdes) = any.downcast_ref::<SourceDescription>() {
                                if let Some(reg) = &stats {
                                    for chunk in &sdes.chunks {
                                        for item in &chunk.items {
                                            if item.sdes_type == SdesType::SdesCname {
                                                reg.set_cname(
                                                    chunk.source,
                                                    String::from_utf8_lossy(&item.text)
                                                        .to_string(),
                                                )
                                                .await;
                                            }
                                        }
                                    }
                                }
                            }
                        }
                    })
                }))
                .await;
        }

        let (recv, created) = {
            let mut receivers = self.receivers.lock().await;
            match receivers.get(&track.id) {
                Some(r) => (Arc::clone(r), false),
                None => {
                    let recv =
                        TrackReceiver::new(&track, self.id.clone(), self.rtcp_tx.clone());
                    let router: Weak<Router> = Arc::downgrade(self);
                    let track_id = track.id.clone();
                    let stream_id = track.stream_id.clone();
                    let is_audio = track.kind() == TrackKind::Audio;
                    let ssrc = track.ssrc;
                    recv.on_close(Box::new(move || {
                        let router = router.clone();
                        let track_id = track_id.clone();
                        let stream_id = stream_id.clone();
                        Box::pin(async move {
                            if let Some(r) = router.upgrade() {
                                {
                                    let mut receivers = r.receivers.lock().await;
                                    receivers.remove(&track_id);
                                }
                                if is_audio {
                                    r.audio_observer.remove_stream(&stream_id).await;
                                }
                                if let Some(reg) = &r.stats {
                                    reg.remove_stream(ssrc).await;
                                }
                            }
                        })
                    }))
                    .await;
                    receivers.insert(track.id.clone(), Arc::clone(&recv));
                    (recv, true)
                }
            }
        };

        recv.add_up_track(
            track.clone(),
            Arc::clone(&buff),
            self.config.simulcast.best_quality_first,
        )
        .await;
        buff.bind(
            track.params.clone(),
            Options {
                max_bit_rate: self.config.max_bandwidth * 1000,
            },
        )
        .await;

        Ok((recv, created))
    }

    /// Subscribes `sub` to one receiver, or to every receiver this router
    /// has. Renegotiation fires once at the end, not per track.
    pub async fn add_down_tracks(
        self: &Arc<Self>,
        sub: &Arc<Subscriber>,
        recv: Option<Arc<dyn Receiver + Send + Sync>>,
    ) -> Result<()> {
        if sub.no_auto_subscribe() {
            log::debug!("peer {} turned off automatic subscription", sub.id());
            return Ok(());
        }
        if let Some(recv) = recv {
            self.add_down_track(sub, recv).await?;
            sub.negotiate();
            return Ok(());
        }
        let receivers: Vec<Arc<TrackReceiver>> = {
            let receivers = self.receivers.lock().await;
            receivers.values().cloned().collect()
        };
        if !receivers.is_empty() {
            for recv in receivers {
                self.add_down_track(sub, recv as Arc<dyn Receiver + Send + Sync>)
                    .await?;
            }
            sub.negotiate();
        }
        Ok(())
    }

    /// Idempotent by `(stream_id, track_id)`: a second call hands back the
    /// existing downtrack without another sender or renegotiation.
    pub async fn add_down_track(
        self: &Arc<Self>,
        sub: &Arc<Subscriber>,
        recv: Arc<dyn Receiver + Send + Sync>,
    ) -> Result<Option<Arc<DownTrack>>> {
        for dt in sub.get_tracks(recv.stream_id()).await {
            if dt.id() == recv.track_id() {
                return Ok(Some(dt));
            }
        }

        let dt = Arc::new(DownTrack::new(
            recv.codec(),
            Arc::downgrade(&recv),
            sub.id().to_string(),
            recv.track_id().to_string(),
            recv.stream_id().to_string(),
            self.config.simulcast,
        ));
        sub.transport().add_down_track(Arc::clone(&dt)).await?;

        // teardown must drain both owners and renegotiate the subscriber
        {
            let sub_weak = Arc::downgrade(sub);
            let recv_weak = Arc::downgrade(&recv);
            let dt_weak = Arc::downgrade(&dt);
            dt.on_close(Box::new(move || {
                let sub_weak = sub_weak.clone();
                let recv_weak = recv_weak.clone();
                let dt_weak = dt_weak.clone();
                Box::pin(async move {
                    let dt = match dt_weak.upgrade() {
                        Some(dt) => dt,
                        None => return,
                    };
                    if let Some(recv) = recv_weak.upgrade() {
                        recv.delete_down_track(dt.current_spatial_layer(), dt.id())
                            .await;
                    }
                    if let Some(sub) = sub_weak.upgrade() {
                        if let Err(e) = sub.transport().remove_down_track(&dt).await {
                            log::debug!("remove down track from transport: {e}");
                        }
                        sub.remove_down_track(dt.stream_id(), dt.id()).await;
                        sub.negotiate();
                    }
                })
            }))
            .await;
        }

        recv.add_down_track(Arc::clone(&dt), self.config.simulcast.best_quality_first)
            .await;
        sub.add_down_track(recv.stream_id().to_string(), Arc::clone(&dt))
            .await;

        if recv.kind() == TrackKind::Video {
            // late joiners need a fresh picture to start decoding
            recv.send_rtcp(vec![Box::new(PictureLossIndication {
                sender_ssrc: rand::random::<u32>(),
                media_ssrc: recv.ssrc(dt.current_spatial_layer()),
            })])
            .await;
        }
        Ok(Some(dt))
    }

    pub async fn stop(&self) {
        {
            let mut stop_tx = self.stop_tx.lock().await;
            stop_tx.take();
        }
        let receivers: Vec<Arc<TrackReceiver>> = {
            let mut receivers = self.receivers.lock().await;
            receivers.drain().map(|(_, r)| r).collect()
        };
        for recv in receivers {
            recv.close_tracks().await;
        }
    }
}
