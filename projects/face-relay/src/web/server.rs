use crate::web::api::{get_camera, list_cameras, Cameras};
use anyhow::Result;
use axum::{routing::get, Router};
use std::net::{IpAddr, SocketAddr, TcpListener};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub fn router(cameras: Cameras) -> Router {
    Router::new()
        .route("/api/cameras", get(list_cameras))
        .route("/api/cameras/:id", get(get_camera))
        .layer(TraceLayer::new_for_http())
        .with_state(cameras)
}

pub async fn run_server(host: IpAddr, port: u16, cameras: Cameras) -> Result<()> {
    let mut current_port = port;
    let listener = loop {
        let addr = SocketAddr::new(host, current_port);
        match TcpListener::bind(addr) {
            Ok(listener) => {
                // Tokio requires a non-blocking socket
                listener.set_nonblocking(true)?;
                info!("Successfully bound to {}", addr);
                break listener;
            }
            Err(e) => {
                warn!("Failed to bind to {}: {}. Trying next port...", addr, e);
                current_port = current_port
                    .checked_add(1)
                    .ok_or_else(|| anyhow::anyhow!("No available ports found"))?;
            }
        }
    };

    let tokio_listener = tokio::net::TcpListener::from_std(listener)?;
    info!(
        "Status API listening on http://{:?}",
        tokio_listener.local_addr()?
    );

    axum::serve(tokio_listener, router(cameras)).await?;

    Ok(())
}
