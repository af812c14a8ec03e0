use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use buffer::Factory;

use crate::error::Result;
use crate::router::{Router, RouterConfig, RtcpWriterFn};
use crate::session::Session;
use crate::track::RemoteTrack;

/// The publishing role of a peer: one router plus the wiring that announces
/// freshly created receivers to the session.
pub struct Publisher {
    id: String,
    router: Arc<Router>,
    session: Weak<Session>,
    closed: AtomicBool,
}

impl Publisher {
    pub async fn new(
        id: String,
        session: &Arc<Session>,
        buffer_factory: Arc<Factory>,
        config: RouterConfig,
        rtcp_writer: RtcpWriterFn,
    ) -> Arc<Self> {
        let router = Router::new(
            id.clone(),
            buffer_factory,
            config,
            session.audio_observer(),
        );
        router.start(rtcp_writer).await;
        Arc::new(Publisher {
            id,
            router,
            session: Arc::downgrade(session),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Transport callback for a new upstream track: builds the receiver and,
    /// when new, offers it to every other peer in the session.
    pub async fn track_published(&self, track: RemoteTrack) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let (recv, created) = self.router.add_receiver(track).await?;
        if created {
            if let Some(session) = self.session.upgrade() {
                session.publish(&self.router, recv).await;
            }
        }
        Ok(())
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.router.stop().await;
    }
}
