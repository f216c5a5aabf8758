//! Downstream session (C4): one task per accepted WebSocket connection.
//! See SPEC_FULL.md §4.4.
//!
//! DESIGN:
//! - A session owns exactly one `tokio::select!` loop that interleaves
//!   draining the socket (discarding anything a client sends, since this is
//!   a one-way feed) and draining its outbound queue. Because both duties
//!   live in the same task, nothing else ever touches the socket
//!   concurrently — no per-session lock is needed, mirroring the C++
//!   original's strand-serialized `WebSocketSession`.
//! - The queue is unbounded (spec §9: slow-consumer policy is deliberately
//!   simple for now — a stalled client accumulates memory rather than being
//!   disconnected or dropping frames).
//! - The session removes itself from the registry on exactly one exit path,
//!   whichever fires first (read error/close, write error, or queue sender
//!   dropped).

use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::Registry;
use crate::metrics::METRICS;

/// Spawns a task that drives `ws` to completion. Registers an outbound
/// queue with `registry` for the lifetime of the connection and
/// unregisters it on any exit path.
pub fn spawn(
    ws: WebSocketStream<TcpStream>,
    peer: SocketAddr,
    registry: Registry,
    debug: bool,
) {
    tokio::spawn(async move {
        let (tx, mut rx) = mpsc::unbounded_channel::<std::sync::Arc<Message>>();
        let tx = std::sync::Arc::new(tx);
        let id = registry.join(std::sync::Arc::downgrade(&tx));

        METRICS.sessions_active.fetch_add(1, Ordering::Relaxed);
        METRICS.sessions_total.fetch_add(1, Ordering::Relaxed);
        if debug {
            log::debug!("[Session {peer}] joined, id={id}");
        }

        let (mut write, mut read) = ws.split();

        loop {
            tokio::select! {
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            if debug {
                                log::debug!("[Session {peer}] read error: {err}");
                            }
                            break;
                        }
                    }
                }
                outgoing = rx.recv() => {
                    match outgoing {
                        Some(msg) => {
                            if let Err(err) = write.send((*msg).clone()).await {
                                if debug {
                                    log::debug!("[Session {peer}] write error: {err}");
                                }
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        let _ = write.close().await;
        registry.leave(id);
        METRICS.sessions_active.fetch_sub(1, Ordering::Relaxed);
        if debug {
            log::debug!("[Session {peer}] left");
        }
    });
}

/// Per-session outbound queue handle. The registry holds only `Weak`
/// references to these; a session's own task is the sole strong owner
/// (mirroring the C++ original's `std::weak_ptr<WebSocketSession>` table).
pub type Outbox = UnboundedSender<std::sync::Arc<Message>>;
