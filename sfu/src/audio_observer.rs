use tokio::sync::Mutex;

struct AudioStream {
    id: String,
    sum: i64,
    total: i64,
}

struct AudioObserverInternal {
    streams: Vec<AudioStream>,
    previous: Vec<String>,
}

/// Tracks which audio streams are speaking, from the RFC 6464 levels the
/// jitter buffers extract.
///
/// Levels are dBov attenuation: lower means louder. A stream counts toward
/// an interval once it produced at least `expected` packets under the
/// threshold; `calc` returns the qualifying streams loudest-first, or `None`
/// when the set did not change.
pub struct AudioObserver {
    threshold: u8,
    expected: i64,
    internal: Mutex<AudioObserverInternal>,
}

impl AudioObserver {
    /// `interval` in milliseconds, `filter` as a percentage of the packets
    /// expected in one interval (20 ms audio framing assumed).
    pub fn new(threshold: u8, interval: u64, filter: u32) -> Self {
        let threshold = threshold.min(127);
        let filter = filter.min(100);
        AudioObserver {
            threshold,
            expected: (interval as i64) * (filter as i64) / 2000,
            internal: Mutex::new(AudioObserverInternal {
                streams: Vec::new(),
                previous: Vec::new(),
            }),
        }
    }

    pub async fn add_stream(&self, stream_id: String) {
        let mut internal = self.internal.lock().await;
        if internal.streams.iter().any(|s| s.id == stream_id) {
            return;
        }
        internal.streams.push(AudioStream {
            id: stream_id,
            sum: 0,
            total: 0,
        });
    }

    pub async fn remove_stream(&self, stream_id: &str) {
        let mut internal = self.internal.lock().await;
        internal.streams.retain(|s| s.id != stream_id);
        internal.previous.clear();
    }

    pub async fn observe(&self, stream_id: &str, dbov: u8) {
        if dbov > self.threshold {
            return;
        }
        let mut internal = self.internal.lock().await;
        if let Some(s) = internal.streams.iter_mut().find(|s| s.id == stream_id) {
            s.sum += dbov as i64;
            s.total += 1;
        }
    }

    /// Closes the interval: returns the speaking streams sorted loudest
    /// first, or `None` if nothing changed since last time.
    pub async fn calc(&self) -> Option<Vec<String>> {
        let mut internal = self.internal.lock().await;
        let expected = self.expected;

        let mut speakers: Vec<(i64, String)> = internal
            .streams
            .iter()
            .filter(|s| s.total >= expected && s.total > 0)
            .map(|s| (s.sum / s.total, s.id.clone()))
            .collect();
        speakers.sort();
        let ids: Vec<String> = speakers.into_iter().map(|(_, id)| id).collect();

        for s in internal.streams.iter_mut() {
            s.sum = 0;
            s.total = 0;
        }

        if internal.previous == ids {
            return None;
        }
        internal.previous = ids.clone();
        Some(ids)
    }
}
