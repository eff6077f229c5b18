/// Authentication Middleware
///
/// Axum middleware resolving the client address and the caller identity,
/// injecting both into request extensions.
use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;

use crate::security::normalize_request_ip;
use crate::server::AppState;

/// Normalized address of the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

/// Resolves the caller address: first `x-forwarded-for` hop when the proxy
/// is trusted, else the socket peer.
pub fn resolve_client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_proxy: bool,
) -> String {
    if trust_proxy
        && let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok())
        && let Some(ip) = forwarded.split(',').next()
        && !ip.trim().is_empty()
    {
        return normalize_request_ip(ip);
    }

    peer.map(|addr| normalize_request_ip(&addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Inserts [`ClientIp`] for every request.
pub async fn client_ip_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ip = resolve_client_ip(req.headers(), peer, state.config.server.trust_proxy);
    req.extensions_mut().insert(ClientIp(ip));
    next.run(req).await
}

/// Requires a valid identity or answers with 401.
pub async fn required_auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let ip = req
        .extensions()
        .get::<ClientIp>()
        .map(|ClientIp(ip)| ip.clone())
        .unwrap_or_else(|| "unknown".to_string());

    match state.authenticator.authenticate(req.headers(), &ip).await {
        Ok(identity) => {
            req.extensions_mut().insert(identity);
            next.run(req).await
        }
        Err(err) => err.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_forwarded_header_only_when_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        let peer: SocketAddr = "10.0.0.1:5555".parse().unwrap();

        assert_eq!(resolve_client_ip(&headers, Some(peer), true), "203.0.113.7");
        assert_eq!(resolve_client_ip(&headers, Some(peer), false), "10.0.0.1");
    }

    #[test]
    fn test_mapped_peer_is_normalized() {
        let peer: SocketAddr = "[::ffff:192.168.1.4]:80".parse().unwrap();
        assert_eq!(resolve_client_ip(&HeaderMap::new(), Some(peer), false), "192.168.1.4");
        assert_eq!(resolve_client_ip(&HeaderMap::new(), None, false), "unknown");
    }
}
