//! TCP accept loop handing each FreeSWITCH `socket` connection to a call session

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{info, info_span, warn, Instrument};

use crate::http::CallFlowFetcher;
use crate::restxml::ElementRegistry;
use crate::session::{CallSession, SessionConfig};

/// Accepts outbound event socket connections, one [`CallSession`] each.
pub struct OutboundServer {
    config: Arc<SessionConfig>,
    fetcher: Arc<dyn CallFlowFetcher>,
    elements: Arc<ElementRegistry>,
    next_request_id: AtomicU64,
}

impl std::fmt::Debug for OutboundServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundServer")
            .field("config", &self.config)
            .field("elements", &self.elements)
            .finish_non_exhaustive()
    }
}

impl OutboundServer {
    pub fn new(
        config: Arc<SessionConfig>,
        fetcher: Arc<dyn CallFlowFetcher>,
        elements: ElementRegistry,
    ) -> Self {
        Self {
            config,
            fetcher,
            elements: Arc::new(elements),
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Session for the next accepted connection.
    pub fn session(&self) -> CallSession {
        let request_id = self
            .next_request_id
            .fetch_add(1, Ordering::Relaxed);
        CallSession::new(
            self.config
                .clone(),
            self.fetcher
                .clone(),
            self.elements
                .clone(),
            request_id,
        )
    }

    /// Accept connections until the task is dropped.
    pub async fn serve(&self, listener: TcpListener) {
        self.serve_with_shutdown(listener, std::future::pending())
            .await
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Sessions already running are left to finish on their own.
    pub async fn serve_with_shutdown<F>(&self, listener: TcpListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        if let Ok(addr) = listener.local_addr() {
            info!("Outbound server listening on {}", addr);
        }
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Outbound server shutting down");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_session(stream, peer),
                    Err(e) => warn!("Failed to accept: {}", e),
                },
            }
        }
    }

    fn spawn_session(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }
        let session = self.session();
        let span = info_span!("call", request_id = session.request_id(), %peer);
        tokio::spawn(
            async move {
                info!("New outbound connection");
                let end = session
                    .run(stream)
                    .await;
                info!("Connection closed: {:?}", end);
            }
            .instrument(span),
        );
    }
}
