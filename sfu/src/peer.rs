use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::publisher::Publisher;
use crate::router::RtcpWriterFn;
use crate::session::Session;
use crate::sfu::Sfu;
use crate::subscriber::Subscriber;
use crate::track::SubscriberTransport;

#[derive(Debug, Default, Clone, Copy)]
pub struct JoinConfig {
    /// Peer will not publish media.
    pub no_publish: bool,
    /// Peer will not receive media at all.
    pub no_subscribe: bool,
    /// Peer subscribes explicitly instead of to everything.
    pub no_auto_subscribe: bool,
}

/// One client: a publisher role and a subscriber role, owned by exactly one
/// session.
pub struct Peer {
    id: String,
    session: Mutex<Option<Arc<Session>>>,
    publisher: Mutex<Option<Arc<Publisher>>>,
    subscriber: Mutex<Option<Arc<Subscriber>>>,
    closed: AtomicBool,

    sub_transport: Arc<dyn SubscriberTransport>,
    rtcp_writer: Mutex<Option<RtcpWriterFn>>,
}

impl Peer {
    /// `rtcp_writer` delivers publisher-bound RTCP to the peer's transport;
    /// `sub_transport` is the sender-management surface of its subscriber
    /// side.
    pub fn new(
        id: String,
        rtcp_writer: RtcpWriterFn,
        sub_transport: Arc<dyn SubscriberTransport>,
    ) -> Arc<Self> {
        Arc::new(Peer {
            id,
            session: Mutex::new(None),
            publisher: Mutex::new(None),
            subscriber: Mutex::new(None),
            closed: AtomicBool::new(false),
            sub_transport,
            rtcp_writer: Mutex::new(Some(rtcp_writer)),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn session(&self) -> Option<Arc<Session>> {
        self.session.lock().await.clone()
    }

    pub async fn publisher(&self) -> Option<Arc<Publisher>> {
        self.publisher.lock().await.clone()
    }

    pub async fn subscriber(&self) -> Option<Arc<Subscriber>> {
        self.subscriber.lock().await.clone()
    }

    /// Joins (creating on demand) the session `sid` and wires both roles.
    pub async fn join(self: &Arc<Self>, sfu: &Arc<Sfu>, sid: &str, cfg: JoinConfig) -> Result<()> {
        {
            let session = self.session.lock().await;
            if session.is_some() {
                return Err(Error::Other(format!(
                    "peer {} already joined a session",
                    self.id
                )));
            }
        }
        let session = sfu.get_session(sid).await;

        if !cfg.no_subscribe {
            let sub = Subscriber::new(
                self.id.clone(),
                Arc::clone(&self.sub_transport),
                cfg.no_auto_subscribe,
            );
            let mut subscriber = self.subscriber.lock().await;
            *subscriber = Some(sub);
        }
        if !cfg.no_publish {
            let writer = {
                let mut writer = self.rtcp_writer.lock().await;
                writer.take()
            };
            if let Some(writer) = writer {
                let publisher = Publisher::new(
                    self.id.clone(),
                    &session,
                    sfu.buffer_factory(),
                    sfu.config().router.clone(),
                    writer,
                )
                .await;
                let mut guard = self.publisher.lock().await;
                *guard = Some(publisher);
            }
        }

        session.add_peer(Arc::clone(self)).await;
        log::info!("peer {} joined session {sid}", self.id);
        if !cfg.no_subscribe {
            session.subscribe(self).await;
        }

        let mut guard = self.session.lock().await;
        *guard = Some(session);
        Ok(())
    }

    /// Leaves the session and tears both roles down; the session closes
    /// itself when this was the last peer.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let session = {
            let mut session = self.session.lock().await;
            session.take()
        };
        if let Some(session) = session {
            session.remove_peer(&self.id).await;
        }
        let publisher = {
            let mut publisher = self.publisher.lock().await;
            publisher.take()
        };
        if let Some(publisher) = publisher {
            publisher.close().await;
        }
        let subscriber = {
            let mut subscriber = self.subscriber.lock().await;
            subscriber.take()
        };
        if let Some(subscriber) = subscriber {
            subscriber.close().await;
        }
    }
}
