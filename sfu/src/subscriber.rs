use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use rtcp::source_description::SourceDescription;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;

use crate::down_track::DownTrack;
use crate::track::SubscriberTransport;

/// Join/leave bursts coalesce into one renegotiation.
const NEGOTIATION_DEBOUNCE: Duration = Duration::from_millis(250);
/// Downtrack sender report cadence.
const SENDER_REPORT_INTERVAL: Duration = Duration::from_secs(5);

pub type OnNegotiateFn =
    Box<dyn (FnMut() -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync>;

/// The subscribing role of a peer: the set of downtracks it receives, the
/// debounced renegotiation trigger, and the periodic SR/SDES reports that
/// let the client sync audio and video.
pub struct Subscriber {
    id: String,
    no_auto_subscribe: bool,
    transport: Arc<dyn SubscriberTransport>,

    tracks: Mutex<HashMap<String, Vec<Arc<DownTrack>>>>,
    negotiate_tx: mpsc::Sender<()>,
    on_negotiate_handler: Mutex<Option<OnNegotiateFn>>,
    close_tx: Mutex<Option<mpsc::Sender<()>>>,
    closed: AtomicBool,
}

impl Subscriber {
    pub fn new(
        id: String,
        transport: Arc<dyn SubscriberTransport>,
        no_auto_subscribe: bool,
    ) -> Arc<Self> {
        let (negotiate_tx, negotiate_rx) = mpsc::channel(16);
        let (close_tx, close_rx) = mpsc::channel(1);
        let sub = Arc::new(Subscriber {
            id,
            no_auto_subscribe,
            transport,
            tracks: Mutex::new(HashMap::new()),
            negotiate_tx,
            on_negotiate_handler: Mutex::new(None),
            close_tx: Mutex::new(Some(close_tx)),
            closed: AtomicBool::new(false),
        });

        let debounce = Arc::downgrade(&sub);
        tokio::spawn(async move {
            Subscriber::debounce_loop(debounce, negotiate_rx, close_rx).await;
        });
        let reports = Arc::downgrade(&sub);
        tokio::spawn(async move {
            Subscriber::sender_report_loop(reports).await;
        });
        sub
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn no_auto_subscribe(&self) -> bool {
        self.no_auto_subscribe
    }

    pub fn transport(&self) -> Arc<dyn SubscriberTransport> {
        Arc::clone(&self.transport)
    }

    pub async fn on_negotiate(&self, f: OnNegotiateFn) {
        let mut handler = self.on_negotiate_handler.lock().await;
        *handler = Some(f);
    }

    /// Requests renegotiation; bursts within the debounce window fold into
    /// one callback.
    pub fn negotiate(&self) {
        let _ = self.negotiate_tx.try_send(());
    }

    pub async fn add_down_track(&self, stream_id: String, track: Arc<DownTrack>) {
        let mut tracks = self.tracks.lock().await;
        tracks.entry(stream_id).or_default().push(track);
    }

    pub async fn remove_down_track(&self, stream_id: &str, track_id: &str) {
        let mut tracks = self.tracks.lock().await;
        if let Some(list) = tracks.get_mut(stream_id) {
            list.retain(|dt| dt.id() != track_id);
            if list.is_empty() {
                tracks.remove(stream_id);
            }
        }
    }

    pub async fn get_tracks(&self, stream_id: &str) -> Vec<Arc<DownTrack>> {
        let tracks = self.tracks.lock().await;
        tracks.get(stream_id).cloned().unwrap_or_default()
    }

    pub async fn down_tracks(&self) -> Vec<Arc<DownTrack>> {
        let tracks = self.tracks.lock().await;
        tracks.values().flatten().cloned().collect()
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut close_tx = self.close_tx.lock().await;
            close_tx.take();
        }
        let tracks = self.down_tracks().await;
        for dt in tracks {
            dt.close().await;
        }
    }

    async fn debounce_loop(
        sub: Weak<Subscriber>,
        mut negotiate_rx: mpsc::Receiver<()>,
        mut close_rx: mpsc::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = close_rx.recv() => return,
                trigger = negotiate_rx.recv() => {
                    if trigger.is_none() {
                        return;
                    }
                    // absorb the rest of the burst
                    loop {
                        tokio::select! {
                            more = negotiate_rx.recv() => {
                                if more.is_none() {
                                    return;
                                }
                            }
                            _ = tokio::time::sleep(NEGOTIATION_DEBOUNCE) => break,
                        }
                    }
                    let sub = match sub.upgrade() {
                        Some(s) => s,
                        None => return,
                    };
                    let mut handler = sub.on_negotiate_handler.lock().await;
                    if let Some(f) = handler.as_mut() {
                        f().await;
                    }
                }
            }
        }
    }

    async fn sender_report_loop(sub: Weak<Subscriber>) {
        let mut ticker = tokio::time::interval(SENDER_REPORT_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let sub = match sub.upgrade() {
                Some(s) => s,
                None => return,
            };
            if sub.closed.load(Ordering::Acquire) {
                return;
            }

            let tracks = sub.down_tracks().await;
            let mut pkts: Vec<Box<dyn rtcp::packet::Packet + Send + Sync>> = Vec::new();
            let mut chunks = Vec::new();
            for dt in tracks {
                if let Some(sr) = dt.create_sender_report().await {
                    pkts.push(Box::new(sr));
                    chunks.push(dt.create_sdes_chunk());
                }
            }
            if pkts.is_empty() {
                continue;
            }
            pkts.push(Box::new(SourceDescription { chunks }));
            if let Err(e) = sub.transport.write_rtcp(&pkts).await {
                log::debug!("subscriber {} sender reports: {e}", sub.id);
            }
        }
    }
}
