
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;

use crate::audio_observer::AudioObserver;
use crate::peer::Peer;
use crate::receiver::{Receiver, TrackReceiver};
use crate::router::{Router, RouterConfig};

pub type OnSessionCloseFn =
    Box<dyn (FnMut() -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync>;
pub type OnAudioLevelsFn = Box<
    dyn (FnMut(Vec<String>) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync,
>;

/// A set of peers routing media to each other. Every publisher's track is
/// offered to every other peer's subscriber; the session dissolves when the
/// last peer leaves.
pub struct Session {
    id: String,
    peers: Mutex<HashMap<String, Arc<Peer>>>,
    closed: AtomicBool,
    audio_observer: Arc<AudioObserver>,
    on_close_handler: Mutex<Option<OnSessionCloseFn>>,
    on_audio_levels_handler: Mutex<Option<OnAudioLevelsFn>>,
    close_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl Session {
    pub fn new(id: String, config: &RouterConfig) -> Arc<Self> {
        let audio_observer = Arc::new(AudioObserver::new(
            config.audio_level_threshold,
            config.audio_level_interval,
            config.audio_level_filter,
        ));
        let (close_tx, close_rx) = mpsc::channel(1);
        let session = Arc::new(Session {
            id,
            peers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            audio_observer,
            on_close_handler: Mutex::new(None),
            on_audio_levels_handler: Mutex::new(None),
            close_tx: Mutex::new(Some(close_tx)),
        });

        let weak = Arc::downgrade(&session);
        let interval = Duration::from_millis(config.audio_level_interval.max(100));
        tokio::spawn(async move {
            Session::audio_level_loop(weak, interval, close_rx).await;
        });
        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn audio_observer(&self) -> Arc<AudioObserver> {
        Arc::clone(&self.audio_observer)
    }

    pub async fn on_close(&self, f: OnSessionCloseFn) {
        let mut handler = self.on_close_handler.lock().await;
        *handler = Some(f);
    }

    /// Registers a handler for loudest-speaker changes.
    pub async fn on_audio_levels(&self, f: OnAudioLevelsFn) {
        let mut handler = self.on_audio_levels_handler.lock().await;
        *handler = Some(f);
    }

    pub async fn add_peer(&self, peer: Arc<Peer>) {
        let mut peers = self.peers.lock().await;
        peers.insert(peer.id().to_string(), peer);
    }

    pub async fn peers(&self) -> Vec<Arc<Peer>> {
        let peers = self.peers.lock().await;
        peers.values().cloned().collect()
    }

    /// Removes a peer; the last one out closes the session.
    pub async fn remove_peer(&self, peer_id: &str) {
        let empty = {
            let mut peers = self.peers.lock().await;
            peers.remove(peer_id);
            peers.is_empty()
        };
        if empty {
            self.close().await;
        }
    }

    /// Offers a freshly created receiver to every other peer's subscriber.
    pub async fn publish(&self, router: &Arc<Router>, recv: Arc<TrackReceiver>) {
        for peer in self.peers().await {
            if peer.id() == router.id() {
                continue;
            }
            let sub = match peer.subscriber().await {
                Some(s) => s,
                None => continue,
            };
            if let Err(e) = self
                .clone_recv_and_add(router, &sub, Arc::clone(&recv))
                .await
            {
                log::error!("publish {} to {}: {e}", recv.track_id(), peer.id());
            }
        }
    }

    async fn clone_recv_and_add(
        &self,
        router: &Arc<Router>,
        sub: &Arc<crate::subscriber::Subscriber>,
        recv: Arc<TrackReceiver>,
    ) -> crate::error::Result<()> {
        router
            .add_down_tracks(sub, Some(recv as Arc<dyn Receiver + Send + Sync>))
            .await
    }

    /// Subscribes a newly joined peer to every existing publisher.
    pub async fn subscribe(&self, peer: &Arc<Peer>) {
        let sub = match peer.subscriber().await {
            Some(s) => s,
            None => return,
        };
        for other in self.peers().await {
            if other.id() == peer.id() {
                continue;
            }
            let publisher = match other.publisher().await {
                Some(p) => p,
                None => continue,
            };
            if let Err(e) = publisher.router().add_down_tracks(&sub, None).await {
                log::error!("subscribe {} to {}: {e}", peer.id(), other.id());
            }
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut close_tx = self.close_tx.lock().await;
            close_tx.take();
        }
        let mut handler = self.on_close_handler.lock().await;
        if let Some(f) = handler.as_mut() {
            f().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn audio_level_loop(
        session: Weak<Session>,
        interval: Duration,
        mut close_rx: mpsc::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = close_rx.recv() => return,
                _ = ticker.tick() => {
                    let session = match session.upgrade() {
                        Some(s) => s,
                        None => return,
                    };
                    if let Some(levels) = session.audio_observer.calc().await {
                        let mut handler = session.on_audio_levels_handler.lock().await;
                        if let Some(f) = handler.as_mut() {
                            f(levels).await;
                        }
                    }
                }
            }
        }
    }
}
