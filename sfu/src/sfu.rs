use std::collections::HashMap;
use std::sync::{Arc, Weak};

use serde::Deserialize;
use tokio::sync::Mutex;

use buffer::Factory;

use crate::router::RouterConfig;
use crate::session::Session;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub router: RouterConfig,
}

/// Top-level registry: sessions by id plus the shared buffer factory the
/// transport writes RTP/RTCP into.
pub struct Sfu {
    config: Config,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    buffer_factory: Arc<Factory>,
}

impl Sfu {
    pub fn new(config: Config) -> Arc<Self> {
        let tracking = if config.router.max_packet_track == 0 {
            500
        } else {
            config.router.max_packet_track
        };
        Arc::new(Sfu {
            config,
            sessions: Mutex::new(HashMap::new()),
            buffer_factory: Factory::new(tracking),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn buffer_factory(&self) -> Arc<Factory> {
        Arc::clone(&self.buffer_factory)
    }

    /// Looks a session up, creating it lazily. A closed session removes
    /// itself, so a later lookup under the same id starts fresh.
    pub async fn get_session(self: &Arc<Self>, id: &str) -> Arc<Session> {
        let mut sessions = self.sessions.lock().await;
        if let Some(s) = sessions.get(id) {
            return Arc::clone(s);
        }
        let session = Session::new(id.to_string(), &self.config.router);
        let sfu: Weak<Sfu> = Arc::downgrade(self);
        let sid = id.to_string();
        session
            .on_close(Box::new(move || {
                let sfu = sfu.clone();
                let sid = sid.clone();
                Box::pin(async move {
                    if let Some(sfu) = sfu.upgrade() {
                        let mut sessions = sfu.sessions.lock().await;
                        sessions.remove(&sid);
                        log::info!("session {sid} closed");
                    }
                })
            }))
            .await;
        sessions.insert(id.to_string(), Arc::clone(&session));
        session
    }

    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        let sessions = self.sessions.lock().await;
        sessions.values().cloned().collect()
    }
}
