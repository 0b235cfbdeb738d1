//! Prometheus exposition endpoint.
//!
//! The scrape surface is served from a dedicated thread with its own
//! single-threaded runtime so a wedged poll cycle never blocks scrapes. The
//! listener is bound synchronously so a bad address fails startup instead of
//! dying silently inside the serving thread.

use std::io;
use std::net::SocketAddr;
use std::thread;

use axum::Router;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus::{Encoder, Registry, TextEncoder};
use tracing::{error, info};

/// Binds `addr` and serves `/metrics` from a background thread. Returns the
/// actually bound address, which differs from `addr` when port 0 was given.
pub fn spawn(
    addr: SocketAddr,
    registry: Registry,
) -> io::Result<(SocketAddr, thread::JoinHandle<()>)> {
    let listener = std::net::TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    let bound = listener.local_addr()?;
    info!(addr = %bound, "serving metrics");

    let handle = thread::Builder::new()
        .name("exposition".to_string())
        .spawn(move || serve(listener, registry))?;
    Ok((bound, handle))
}

fn serve(listener: std::net::TcpListener, registry: Registry) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "could not build exposition runtime");
            return;
        }
    };
    runtime.block_on(async move {
        let listener = match tokio::net::TcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, "could not register exposition listener");
                return;
            }
        };
        let app = Router::new()
            .route("/metrics", get(metrics))
            .with_state(registry);
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "exposition server failed");
        }
    });
}

async fn metrics(State(registry): State<Registry>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        error!(error = %e, "could not encode metric families");
    }
    (
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
}
