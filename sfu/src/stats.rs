use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::helpers::ntp_to_millis;

struct StreamStat {
    cname: String,
    clock_rate: u32,
    has_sr: bool,
    sr_ntp: u64,
    sr_rtp: u32,
}

/// A/V sync bookkeeping, enabled by `with_stats`.
///
/// Streams that share a CNAME belong to one participant; comparing where
/// each stream's RTP clock sits against its NTP wall clock at the latest
/// sender report exposes drift between that participant's audio and video.
pub struct Registry {
    streams: Mutex<HashMap<u32, StreamStat>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub async fn add_stream(&self, ssrc: u32, clock_rate: u32) {
        let mut streams = self.streams.lock().await;
        streams.entry(ssrc).or_insert(StreamStat {
            cname: String::new(),
            clock_rate,
            has_sr: false,
            sr_ntp: 0,
            sr_rtp: 0,
        });
    }

    pub async fn remove_stream(&self, ssrc: u32) {
        let mut streams = self.streams.lock().await;
        streams.remove(&ssrc);
    }

    /// Learned from SDES chunks on the publisher's RTCP stream.
    pub async fn set_cname(&self, ssrc: u32, cname: String) {
        let mut streams = self.streams.lock().await;
        if let Some(s) = streams.get_mut(&ssrc) {
            s.cname = cname;
        }
    }

    /// Records a sender report and recomputes drift across the CNAME group.
    /// Returns the worst drift in milliseconds for observability and tests.
    pub async fn on_sender_report(&self, ssrc: u32, rtp_time: u32, ntp_time: u64) -> Option<u64> {
        let mut streams = self.streams.lock().await;
        let cname = match streams.get_mut(&ssrc) {
            Some(s) => {
                s.has_sr = true;
                s.sr_ntp = ntp_time;
                s.sr_rtp = rtp_time;
                s.cname.clone()
            }
            None => return None,
        };
        if cname.is_empty() {
            return None;
        }

        // wall-clock position of RTP time zero, per stream
        let offsets: Vec<i64> = streams
            .values()
            .filter(|s| s.cname == cname && s.has_sr && s.clock_rate > 0)
            .map(|s| {
                ntp_to_millis(s.sr_ntp) as i64 - (s.sr_rtp as i64 * 1000 / s.clock_rate as i64)
            })
            .collect();
        if offsets.len() < 2 {
            return None;
        }
        let min = offsets.iter().min()?;
        let max = offsets.iter().max()?;
        let drift = (max - min) as u64;
        if drift > 0 {
            log::debug!("cname {cname}: a/v drift {drift} ms");
        }
        Some(drift)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}
