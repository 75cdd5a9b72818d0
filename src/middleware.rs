use crate::key_generator::extract_client_ip;
use axum::{
    extract::{ConnectInfo, Request},
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::info;

/// Client address as seen by the service, after proxy headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

/// Logging middleware for request/response tracking.
///
/// Also resolves the client address once and stores it as a [`ClientIp`]
/// request extension for the handlers.
pub async fn logging_middleware(mut request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let client_ip = get_client_ip(&request);
    request.extensions_mut().insert(ClientIp(client_ip.clone()));

    info!(
        target: "admission::middleware",
        method = %method,
        uri = %uri,
        client_ip = %client_ip,
        "Incoming request"
    );

    let started = Instant::now();
    let response = next.run(request).await;

    info!(
        target: "admission::middleware",
        method = %method,
        uri = %uri,
        status = %response.status(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Request completed"
    );

    response
}

fn get_client_ip(request: &Request) -> String {
    if let Some(ip) = extract_client_ip(request.headers()) {
        return ip;
    }

    // Fallback to connection info
    match request.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => addr.ip().to_string(),
        None => "unknown".to_string(),
    }
}
