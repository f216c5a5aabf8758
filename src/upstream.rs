//! Upstream client (C1): one persistent connection per configured URL.
//! See SPEC_FULL.md §4.1.
//!
//! DESIGN:
//! - URL parsing is manual (`rfind`/`find`-based, mirroring the C++ original's
//!   `websocket_client.cpp`) rather than via a generic URL crate, since the
//!   only schemes this repeater ever sees are `ws://`/`wss://` and the
//!   surrounding config never carries query strings or userinfo.
//! - Reconnection is a constant 5s delay, no backoff, no jitter (spec §9):
//!   OKX endpoints are assumed reliable enough that complicating the retry
//!   policy isn't worth it yet.
//! - Shutdown is cooperative via `CancellationToken`, raced against the
//!   connect/read paths with `tokio::select!` so a signal during either a
//!   reconnect sleep or a live read unwinds the task promptly.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::error::StartupError;
use crate::metrics::METRICS;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// A parsed `ws://`/`wss://` endpoint: scheme, host, port and path, split out
/// the way the C++ original does it so the connector can rebuild a request
/// with an explicit `Host` header and SNI name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamEndpoint {
    pub tls: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl UpstreamEndpoint {
    /// Parses a raw `okx_connections` entry. Case-sensitive on the scheme
    /// prefix (`ws://`/`wss://` only, lowercase) per spec §9.
    pub fn parse(url: &str) -> Result<UpstreamEndpoint, StartupError> {
        let (tls, default_port, rest) = if let Some(rest) = url.strip_prefix("wss://") {
            (true, 443u16, rest)
        } else if let Some(rest) = url.strip_prefix("ws://") {
            (false, 80u16, rest)
        } else {
            return Err(StartupError::InvalidUrl {
                url: url.to_string(),
                reason: "missing ws:// or wss:// scheme",
            });
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], rest[idx..].to_string()),
            None => (rest, "/".to_string()),
        };

        if authority.is_empty() {
            return Err(StartupError::InvalidUrl {
                url: url.to_string(),
                reason: "empty host",
            });
        }

        let (host, port) = match authority.rfind(':') {
            Some(idx) => {
                let host = &authority[..idx];
                let port_str = &authority[idx + 1..];
                let port: u16 = port_str.parse().map_err(|_| StartupError::InvalidUrl {
                    url: url.to_string(),
                    reason: "invalid port",
                })?;
                (host.to_string(), port)
            }
            None => (authority.to_string(), default_port),
        };

        if host.is_empty() {
            return Err(StartupError::InvalidUrl {
                url: url.to_string(),
                reason: "empty host",
            });
        }

        Ok(UpstreamEndpoint {
            tls,
            host,
            port,
            path,
        })
    }

    fn url_string(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{scheme}://{}:{}{}", self.host, self.port, self.path)
    }
}

/// Runs a single upstream connection forever, reconnecting on any error or
/// disconnect, until `shutdown` is cancelled. `on_frame` is called with the
/// raw text payload of every received `Message::Text` frame, unmodified
/// (conservation of bytes, spec §8) — it never sees binary/ping/pong frames.
pub async fn run<F>(
    endpoint: UpstreamEndpoint,
    subscription_message: String,
    debug: bool,
    on_frame: F,
    shutdown: CancellationToken,
) where
    F: Fn(String) + Send + Sync,
{
    loop {
        if shutdown.is_cancelled() {
            return;
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            result = connect_and_drain(&endpoint, &subscription_message, debug, &on_frame, &shutdown) => {
                if let Err(err) = result {
                    if debug {
                        log::debug!("[Upstream {}] {err}", endpoint.url_string());
                    }
                }
            }
        }

        METRICS
            .upstream_reconnects
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = sleep(RECONNECT_DELAY) => {}
        }
    }
}

/// Pairs with the `fetch_add` taken right before a connection's read loop
/// starts: decrements `upstream_connections_active` on every exit from
/// `connect_and_drain` past that point (error, clean close, or shutdown),
/// regardless of which `return`/`?` fires. A failed `connect_async` never
/// creates one, so a connection that never came up never decrements.
struct ActiveConnectionGuard;

impl Drop for ActiveConnectionGuard {
    fn drop(&mut self) {
        METRICS
            .upstream_connections_active
            .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
    }
}

async fn connect_and_drain<F>(
    endpoint: &UpstreamEndpoint,
    subscription_message: &str,
    debug: bool,
    on_frame: &F,
    shutdown: &CancellationToken,
) -> anyhow::Result<()>
where
    F: Fn(String) + Send + Sync,
{
    let url = endpoint.url_string();
    let mut request = url.as_str().into_client_request()?;
    request.headers_mut().insert(
        "User-Agent",
        format!("okx-repeater/{}", env!("CARGO_PKG_VERSION")).parse()?,
    );

    let (ws_stream, _response) = timeout(
        CONNECT_TIMEOUT,
        tokio_tungstenite::connect_async(request),
    )
    .await
    .map_err(|_| anyhow::anyhow!("connect timed out after {CONNECT_TIMEOUT:?}"))??;

    if debug {
        log::debug!("[Upstream {url}] connected");
    }
    METRICS
        .upstream_connections_active
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let _active_guard = ActiveConnectionGuard;

    let (mut write, mut read) = ws_stream.split();
    write.send(Message::Text(subscription_message.into())).await?;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = write.close().await;
                return Ok(());
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        METRICS.frames_received.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        on_frame(text.as_str().to_string());
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(Message::Binary(_) | Message::Frame(_))) => {}
                    Some(Err(err)) => return Err(err.into()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wss_with_explicit_port_and_path() {
        let e = UpstreamEndpoint::parse("wss://ws.okx.com:8443/ws/v5/public").unwrap();
        assert!(e.tls);
        assert_eq!(e.host, "ws.okx.com");
        assert_eq!(e.port, 8443);
        assert_eq!(e.path, "/ws/v5/public");
    }

    #[test]
    fn parses_ws_default_port() {
        let e = UpstreamEndpoint::parse("ws://localhost/feed").unwrap();
        assert!(!e.tls);
        assert_eq!(e.port, 80);
        assert_eq!(e.path, "/feed");
    }

    #[test]
    fn parses_wss_default_port_and_defaults_path_to_slash() {
        let e = UpstreamEndpoint::parse("wss://example.com").unwrap();
        assert_eq!(e.port, 443);
        assert_eq!(e.path, "/");
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(UpstreamEndpoint::parse("http://example.com").is_err());
    }

    #[test]
    fn rejects_uppercase_scheme() {
        assert!(UpstreamEndpoint::parse("WSS://example.com").is_err());
    }

    #[test]
    fn rejects_empty_host() {
        assert!(UpstreamEndpoint::parse("wss:///path").is_err());
    }

    #[test]
    fn rejects_invalid_port() {
        assert!(UpstreamEndpoint::parse("wss://example.com:notaport/").is_err());
    }

    #[test]
    fn round_trips_through_url_string() {
        let e = UpstreamEndpoint::parse("wss://ws.okx.com:8443/ws/v5/public").unwrap();
        assert_eq!(e.url_string(), "wss://ws.okx.com:8443/ws/v5/public");
    }
}
