use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

pub type OnRtcpPacketFn = Box<
    dyn (FnMut(Bytes) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync,
>;
pub type OnRtcpCloseFn =
    Box<dyn (FnMut() -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync>;

/// Sink for a publisher's incoming RTCP byte stream, one per SSRC.
///
/// The transport writes raw compound packets; whoever registered `on_packet`
/// (the router) parses them. Mirrors the write side of the RTP `Buffer` so
/// the factory can hand both out as a pair.
pub struct RtcpReader {
    ssrc: u32,
    closed: AtomicBool,
    on_packet: Mutex<Option<OnRtcpPacketFn>>,
    on_close: Mutex<Option<OnRtcpCloseFn>>,
}

impl RtcpReader {
    pub fn new(ssrc: u32) -> Self {
        RtcpReader {
            ssrc,
            closed: AtomicBool::new(false),
            on_packet: Mutex::new(None),
            on_close: Mutex::new(None),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub async fn on_packet(&self, f: OnRtcpPacketFn) {
        let mut handler = self.on_packet.lock().await;
        *handler = Some(f);
    }

    pub async fn on_close(&self, f: OnRtcpCloseFn) {
        let mut handler = self.on_close.lock().await;
        *handler = Some(f);
    }

    pub async fn write(&self, pkt: &[u8]) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ErrIoEof);
        }
        let bytes = Bytes::copy_from_slice(pkt);
        let mut handler = self.on_packet.lock().await;
        if let Some(f) = handler.as_mut() {
            f(bytes).await;
        }
        Ok(pkt.len())
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut handler = self.on_close.lock().await;
        if let Some(f) = handler.as_mut() {
            f().await;
        }
    }
}
