use anyhow::{Context, Result};
use flux_traits::MetricsConfig;
use hyper::header::{ALLOW, CONTENT_TYPE};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use mod_metrics::MetricsCollector;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Read-only HTTP view over the collector.
///
/// `GET <path>` returns the aggregate, `GET <path>/connections` the live
/// sessions. With metrics disabled every request gets a 503.
pub struct ApiServer {
    config: MetricsConfig,
    collector: Arc<MetricsCollector>,
}

impl ApiServer {
    pub fn new(config: MetricsConfig, collector: Arc<MetricsCollector>) -> Self {
        Self { config, collector }
    }

    pub fn respond<B>(&self, req: &Request<B>) -> Response<Body> {
        if !self.config.enabled {
            return json(
                StatusCode::SERVICE_UNAVAILABLE,
                &serde_json::json!({ "error": "metrics disabled" }),
            );
        }

        let base = self.config.path.trim_end_matches('/');
        let path = req.uri().path().trim_end_matches('/');
        let is_stats = path == base;
        let is_connections = path.strip_prefix(base) == Some("/connections");

        if !is_stats && !is_connections {
            return json(StatusCode::NOT_FOUND, &serde_json::json!({ "error": "not found" }));
        }
        if req.method() != Method::GET {
            let mut resp = json(
                StatusCode::METHOD_NOT_ALLOWED,
                &serde_json::json!({ "error": "method not allowed" }),
            );
            resp.headers_mut().insert(ALLOW, hyper::header::HeaderValue::from_static("GET"));
            return resp;
        }

        if is_stats {
            json(StatusCode::OK, &self.collector.get_stats())
        } else {
            json(StatusCode::OK, &self.collector.sessions())
        }
    }

    /// Binds `listen_address` and serves until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> Result<(SocketAddr, JoinHandle<()>)> {
        let addr: SocketAddr = self
            .config
            .listen_address
            .parse()
            .with_context(|| format!("invalid metrics listen address {:?}", self.config.listen_address))?;

        let api = Arc::new(self);
        let make_svc = make_service_fn(move |conn: &AddrStream| {
            let api = api.clone();
            let peer = conn.remote_addr();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let api = api.clone();
                    async move {
                        debug!("ApiServer: {} {} from {}", req.method(), req.uri().path(), peer);
                        Ok::<_, Infallible>(api.respond(&req))
                    }
                }))
            }
        });

        let server = Server::try_bind(&addr)
            .with_context(|| format!("failed to bind metrics endpoint on {addr}"))?
            .serve(make_svc);
        let bound = server.local_addr();
        info!("ApiServer: metrics available on http://{}", bound);

        let handle = tokio::spawn(async move {
            let graceful = server.with_graceful_shutdown(async move { cancel.cancelled().await });
            if let Err(e) = graceful.await {
                error!("ApiServer: server error: {}", e);
            }
            info!("ApiServer: stopped.");
        });

        Ok((bound, handle))
    }
}

fn json<T: Serialize + ?Sized>(status: StatusCode, body: &T) -> Response<Body> {
    match serde_json::to_vec(body) {
        Ok(bytes) => {
            let mut resp = Response::new(Body::from(bytes));
            *resp.status_mut() = status;
            resp.headers_mut().insert(
                CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("application/json"),
            );
            resp
        }
        Err(e) => {
            error!("ApiServer: failed to encode response: {}", e);
            let mut resp = Response::new(Body::empty());
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            resp
        }
    }
}
