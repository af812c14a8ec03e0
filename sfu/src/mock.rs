//! In-memory transport doubles for exercising the routing core without a
//! WebRTC stack, in the spirit of the mock interceptors upstream ships.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::down_track::DownTrack;
use crate::error::{Error, Result};
use crate::track::{
    RtpParameters, SubscriberTransport, TrackLocalContext, TrackLocalWriter,
};

/// Collects everything a downtrack writes; can simulate a dead transport.
#[derive(Debug)]
pub struct MockTrackWriter {
    pub packets: Mutex<Vec<rtp::packet::Packet>>,
    closed: AtomicBool,
    notify_tx: Mutex<Option<mpsc::UnboundedSender<rtp::packet::Packet>>>,
}

impl MockTrackWriter {
    pub fn new() -> Arc<Self> {
        Arc::new(MockTrackWriter {
            packets: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            notify_tx: Mutex::new(None),
        })
    }

    /// Streams written packets to the returned receiver as well.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<rtp::packet::Packet> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut guard) = self.notify_tx.lock() {
            *guard = Some(tx);
        }
        rx
    }

    /// Further writes fail with [`Error::ErrClosedPipe`].
    pub fn kill(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn written(&self) -> Vec<rtp::packet::Packet> {
        self.packets.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl Default for MockTrackWriter {
    fn default() -> Self {
        MockTrackWriter {
            packets: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            notify_tx: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TrackLocalWriter for MockTrackWriter {
    async fn write_rtp(&self, p: &rtp::packet::Packet) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ErrClosedPipe);
        }
        if let Ok(mut packets) = self.packets.lock() {
            packets.push(p.clone());
        }
        if let Ok(guard) = self.notify_tx.lock() {
            if let Some(tx) = guard.as_ref() {
                let _ = tx.send(p.clone());
            }
        }
        Ok(p.payload.len())
    }

    async fn write(&self, b: &[u8]) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ErrClosedPipe);
        }
        Ok(b.len())
    }
}

/// Subscriber transport that binds every downtrack immediately with a fresh
/// SSRC and records RTCP pushed to the subscriber.
pub struct MockSubscriberTransport {
    next_ssrc: AtomicU32,
    pub writers: Mutex<HashMap<String, Arc<MockTrackWriter>>>,
    pub removed: Mutex<Vec<String>>,
    pub rtcp_count: AtomicU32,
}

impl MockSubscriberTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(MockSubscriberTransport {
            next_ssrc: AtomicU32::new(rand::random::<u32>() | 1),
            writers: Mutex::new(HashMap::new()),
            removed: Mutex::new(Vec::new()),
            rtcp_count: AtomicU32::new(0),
        })
    }

    pub fn writer_for(&self, track_id: &str) -> Option<Arc<MockTrackWriter>> {
        self.writers
            .lock()
            .ok()
            .and_then(|w| w.get(track_id).cloned())
    }
}

#[async_trait]
impl SubscriberTransport for MockSubscriberTransport {
    async fn add_down_track(&self, track: Arc<DownTrack>) -> Result<()> {
        let writer = MockTrackWriter::new();
        let ssrc = self.next_ssrc.fetch_add(1, Ordering::AcqRel);
        if let Ok(mut writers) = self.writers.lock() {
            writers.insert(track.id().to_string(), Arc::clone(&writer));
        }
        track
            .bind(TrackLocalContext {
                id: track.id().to_string(),
                params: RtpParameters::default(),
                ssrc,
                payload_type: 96,
                write_stream: writer,
            })
            .await;
        Ok(())
    }

    async fn remove_down_track(&self, track: &DownTrack) -> Result<()> {
        if let Ok(mut removed) = self.removed.lock() {
            removed.push(track.id().to_string());
        }
        Ok(())
    }

    async fn write_rtcp(
        &self,
        _pkts: &[Box<dyn rtcp::packet::Packet + Send + Sync>],
    ) -> Result<()> {
        self.rtcp_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
