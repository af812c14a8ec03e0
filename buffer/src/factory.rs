use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::Mutex;

use crate::bucket::MAX_PKT_SIZE;
use crate::buffer::Buffer;
use crate::pool::BytePool;
use crate::rtcp_reader::RtcpReader;

/// Audio streams keep a much smaller reorder window than video.
const AUDIO_POOL_PACKETS: usize = 25;

/// Hands out the per-SSRC [`Buffer`]/[`RtcpReader`] pair and recycles their
/// storage. Entries unregister themselves through their close hooks.
pub struct Factory {
    video_pool: Arc<BytePool>,
    audio_pool: Arc<BytePool>,
    rtp_buffers: Mutex<HashMap<u32, Arc<Buffer>>>,
    rtcp_readers: Mutex<HashMap<u32, Arc<RtcpReader>>>,
}

impl Factory {
    /// `tracking_packets` sizes the video ingest window; 500 is the usual
    /// choice.
    pub fn new(tracking_packets: usize) -> Arc<Self> {
        Arc::new(Factory {
            video_pool: Arc::new(BytePool::new(tracking_packets * MAX_PKT_SIZE)),
            audio_pool: Arc::new(BytePool::new(AUDIO_POOL_PACKETS * MAX_PKT_SIZE)),
            rtp_buffers: Mutex::new(HashMap::new()),
            rtcp_readers: Mutex::new(HashMap::new()),
        })
    }

    pub async fn get_or_new_buffer(self: &Arc<Self>, ssrc: u32) -> Arc<Buffer> {
        let mut buffers = self.rtp_buffers.lock().await;
        if let Some(b) = buffers.get(&ssrc) {
            return Arc::clone(b);
        }
        let buffer = Arc::new(Buffer::new(
            ssrc,
            Arc::clone(&self.video_pool),
            Arc::clone(&self.audio_pool),
        ));
        let factory: Weak<Factory> = Arc::downgrade(self);
        buffer
            .on_close(Box::new(move || {
                let factory = factory.clone();
                Box::pin(async move {
                    if let Some(f) = factory.upgrade() {
                        let mut buffers = f.rtp_buffers.lock().await;
                        buffers.remove(&ssrc);
                    }
                })
            }))
            .await;
        buffers.insert(ssrc, Arc::clone(&buffer));
        buffer
    }

    pub async fn get_or_new_rtcp_reader(self: &Arc<Self>, ssrc: u32) -> Arc<RtcpReader> {
        let mut readers = self.rtcp_readers.lock().await;
        if let Some(r) = readers.get(&ssrc) {
            return Arc::clone(r);
        }
        let reader = Arc::new(RtcpReader::new(ssrc));
        let factory: Weak<Factory> = Arc::downgrade(self);
        reader
            .on_close(Box::new(move || {
                let factory = factory.clone();
                Box::pin(async move {
                    if let Some(f) = factory.upgrade() {
                        let mut readers = f.rtcp_readers.lock().await;
                        readers.remove(&ssrc);
                    }
                })
            }))
            .await;
        readers.insert(ssrc, Arc::clone(&reader));
        reader
    }

    pub async fn get_buffer_pair(
        &self,
        ssrc: u32,
    ) -> (Option<Arc<Buffer>>, Option<Arc<RtcpReader>>) {
        let buffers = self.rtp_buffers.lock().await;
        let readers = self.rtcp_readers.lock().await;
        (buffers.get(&ssrc).cloned(), readers.get(&ssrc).cloned())
    }

    pub async fn get_buffer(&self, ssrc: u32) -> Option<Arc<Buffer>> {
        let buffers = self.rtp_buffers.lock().await;
        buffers.get(&ssrc).cloned()
    }

    pub async fn get_rtcp_reader(&self, ssrc: u32) -> Option<Arc<RtcpReader>> {
        let readers = self.rtcp_readers.lock().await;
        readers.get(&ssrc).cloned()
    }
}
