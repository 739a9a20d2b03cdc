use crate::pipe::DirectionalPipe;
use crate::transport::TransportBuilder;
use crate::ProxyError;
use chrono::Utc;
use flux_traits::{ConditionModel, Direction};
use mod_metrics::MetricsCollector;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept so descriptor exhaustion does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Listening,
    ShuttingDown,
}

/// Everything a connection handler needs, shared by all of them.
#[derive(Clone)]
struct ConnectionContext {
    upstream: Arc<str>,
    conditions: Arc<dyn ConditionModel>,
    metrics: Arc<MetricsCollector>,
}

/// Accepts downstream clients and relays each one to the fixed upstream
/// through a pair of directional pipes.
///
/// Every accepted connection runs on its own task. `shutdown` stops
/// accepting and then waits for the handlers already running; it never cuts
/// an established connection.
pub struct ProxyServer {
    listen_addr: String,
    ctx: ConnectionContext,
    state: Mutex<ServerState>,
    local_addr: Mutex<Option<SocketAddr>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl ProxyServer {
    pub fn new(
        listen_addr: impl Into<String>,
        upstream_addr: impl Into<String>,
        conditions: Arc<dyn ConditionModel>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let upstream: String = upstream_addr.into();
        Self {
            listen_addr: listen_addr.into(),
            ctx: ConnectionContext {
                upstream: Arc::from(upstream),
                conditions,
                metrics,
            },
            state: Mutex::new(ServerState::Stopped),
            local_addr: Mutex::new(None),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    /// Address actually bound, once `bind` has succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Tasks still tracked: live connection handlers plus the accept loop.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    pub async fn bind(&self) -> Result<TcpListener, ProxyError> {
        let listener = TcpListener::bind(&self.listen_addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: self.listen_addr.clone(),
                source,
            })?;
        let bound = listener.local_addr().ok();
        *self.local_addr.lock() = bound;
        info!(
            "ProxyServer: listening on {} -> upstream {} ({})",
            bound.map_or_else(|| self.listen_addr.clone(), |a| a.to_string()),
            self.ctx.upstream,
            self.ctx.conditions.name()
        );
        Ok(listener)
    }

    /// Binds and runs the accept loop until `shutdown`. Bind failure is the
    /// only error; it is returned before anything is accepted.
    pub async fn start(&self) -> Result<(), ProxyError> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        let listener = self.bind().await?;
        self.serve(listener).await;
        Ok(())
    }

    /// Accept loop over an already bound listener.
    pub async fn serve(&self, listener: TcpListener) {
        // Holding a token keeps `shutdown` waiting until this loop has exited,
        // so no handler can be spawned after the drain completes.
        let _loop_token = self.tracker.token();
        {
            let mut state = self.state.lock();
            if self.cancel.is_cancelled() {
                return;
            }
            *state = ServerState::Listening;
        }

        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    self.tracker.spawn(handle_connection(self.ctx.clone(), stream, peer));
                }
                Err(e) if self.cancel.is_cancelled() => {
                    debug!("ProxyServer: accept interrupted by shutdown: {}", e);
                    break;
                }
                Err(e) => {
                    warn!("ProxyServer: accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        drop(listener);
        info!("ProxyServer: stopped accepting connections.");
    }

    /// Stops accepting, then waits for every in-flight connection to finish.
    /// Safe to call before `start` and more than once.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if !self.cancel.is_cancelled() {
                info!(
                    "ProxyServer: shutting down, draining {} task(s).",
                    self.in_flight()
                );
            }
            *state = ServerState::ShuttingDown;
            self.cancel.cancel();
        }

        self.tracker.close();
        self.tracker.wait().await;

        *self.state.lock() = ServerState::Stopped;
        info!("ProxyServer: shutdown complete.");
    }
}

fn session_id(peer: SocketAddr) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("{}-{}", peer, nanos)
}

async fn handle_connection(ctx: ConnectionContext, downstream: TcpStream, peer: SocketAddr) {
    let id: Arc<str> = Arc::from(session_id(peer));
    ctx.metrics.start_connection(&id);

    match TransportBuilder::connect_upstream(&ctx.upstream).await {
        Ok(upstream) => {
            debug!("[{}] connected to upstream {}", id, ctx.upstream);
            relay(&ctx, id.clone(), downstream, upstream).await;
        }
        Err(e) => {
            warn!("[{}] {}", id, e);
            drop(downstream);
        }
    }

    if let Some(session) = ctx.metrics.end_connection(&id) {
        info!(
            "[{}] closed: {} bytes up, {} bytes down, {} chunks lost",
            id, session.bytes_upstream, session.bytes_downstream, session.packets_lost
        );
    }
}

/// Runs both directions on their own tasks and returns once both are done.
/// Whichever direction stops first severs both sockets, which wakes the
/// other direction out of its blocked read.
async fn relay(ctx: &ConnectionContext, id: Arc<str>, downstream: TcpStream, upstream: TcpStream) {
    if let Err(e) = downstream.set_nodelay(true) {
        debug!("[{}] could not set TCP_NODELAY downstream: {}", id, e);
    }

    let (mut down_rx, mut down_tx) = downstream.into_split();
    let (mut up_rx, mut up_tx) = upstream.into_split();

    let outbound = DirectionalPipe::new(
        Direction::Upstream,
        id.clone(),
        ctx.conditions.clone(),
        ctx.metrics.clone(),
    );
    let inbound = DirectionalPipe::new(
        Direction::Downstream,
        id.clone(),
        ctx.conditions.clone(),
        ctx.metrics.clone(),
    );

    let to_upstream = tokio::spawn(async move {
        let summary = outbound.run(&mut down_rx, &mut up_tx).await;
        TransportBuilder::sever(down_rx.as_ref());
        TransportBuilder::sever(up_tx.as_ref());
        summary
    });
    let to_downstream = tokio::spawn(async move {
        let summary = inbound.run(&mut up_rx, &mut down_tx).await;
        TransportBuilder::sever(up_rx.as_ref());
        TransportBuilder::sever(down_tx.as_ref());
        summary
    });

    let (first, second) = tokio::join!(to_upstream, to_downstream);
    for joined in [first, second] {
        match joined {
            Ok(summary) => debug!(
                "[{}] {} finished: {} bytes in {} chunks, {} dropped, {:?}",
                id, summary.direction, summary.bytes, summary.chunks, summary.dropped, summary.end
            ),
            Err(e) => error!("[{}] pipe task failed: {}", id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux_traits::Passthrough;

    fn server(listen: &str, upstream: &str) -> ProxyServer {
        ProxyServer::new(
            listen,
            upstream,
            Arc::new(Passthrough),
            Arc::new(MetricsCollector::new()),
        )
    }

    #[test]
    fn session_ids_carry_the_peer_address() {
        let peer: SocketAddr = "10.1.2.3:4567".parse().unwrap();
        let id = session_id(peer);
        assert!(id.starts_with("10.1.2.3:4567-"));
    }

    #[tokio::test]
    async fn shutdown_without_start_is_a_noop() {
        let proxy = server("127.0.0.1:0", "127.0.0.1:1");
        proxy.shutdown().await;
        assert_eq!(proxy.state(), ServerState::Stopped);

        // Starting after shutdown returns immediately without binding.
        proxy.start().await.unwrap();
        assert!(proxy.local_addr().is_none());
        proxy.shutdown().await;
    }

    #[tokio::test]
    async fn bind_failure_is_fatal() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = occupied.local_addr().unwrap().to_string();

        let proxy = server(&addr, "127.0.0.1:1");
        let err = proxy.start().await.unwrap_err();
        assert!(matches!(err, ProxyError::Bind { .. }), "{err}");
        assert_eq!(proxy.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn state_follows_the_lifecycle() {
        let proxy = Arc::new(server("127.0.0.1:0", "127.0.0.1:1"));
        let listener = proxy.bind().await.unwrap();

        let serving = {
            let proxy = proxy.clone();
            tokio::spawn(async move { proxy.serve(listener).await })
        };
        while proxy.state() != ServerState::Listening {
            tokio::task::yield_now().await;
        }

        proxy.shutdown().await;
        serving.await.unwrap();
        assert_eq!(proxy.state(), ServerState::Stopped);
    }
}
