//! Minimal HTTP upstream for exercising the proxy by hand.

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use clap::Parser;
use hyper::header::{CONTENT_TYPE, SERVER};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use std::convert::Infallible;
use std::net::SocketAddr;

#[derive(Parser, Debug)]
#[command(about = "Echo-style JSON server to sit behind the proxy")]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9090")]
    listen: SocketAddr,
}

async fn answer(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    tracing::info!("Received request: {} {}", req.method(), req.uri().path());

    // The timestamp lets a client measure the delay the proxy added.
    let body = serde_json::json!({
        "message": "Hello from test server!",
        "path": req.uri().path(),
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
    });

    let mut resp = Response::new(Body::from(body.to_string()));
    resp.headers_mut()
        .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("application/json"));
    resp.headers_mut()
        .insert(SERVER, hyper::header::HeaderValue::from_static("TestServer"));
    Ok(resp)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let cli = Cli::parse();

    let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(answer)) });
    let server = Server::try_bind(&cli.listen)
        .with_context(|| format!("binding {}", cli.listen))?
        .serve(make_svc);

    tracing::info!("Starting test server on {}", server.local_addr());
    server
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("test server failed")?;
    Ok(())
}
