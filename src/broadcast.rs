//! Broadcast server (C3): accepts downstream WebSocket connections and fans
//! out admitted frames to every live session. See SPEC_FULL.md §4.3.
//!
//! DESIGN:
//! - The session registry stores only `Weak<Outbox>` handles, snapshotted
//!   under a short-lived lock and then released before any upgrade-and-send
//!   happens, directly mirroring the C++ original's
//!   `std::vector<std::weak_ptr<WebSocketSession>>` broadcast routine
//!   (`websocket_server.cpp::broadcast`). A session that has already exited
//!   fails to upgrade and is silently skipped rather than actively pruned
//!   here — `leave()` is what keeps the registry tight.
//! - `SO_REUSEADDR` is set explicitly via `socket2` before binding, for
//!   parity with the original's `acceptor.set_option(reuse_address(true))`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::error::StartupError;
use crate::session::{self, Outbox};

type SessionId = u64;

#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<HashMap<SessionId, Weak<Outbox>>>>,
    next_id: Arc<AtomicU64>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, outbox: Weak<Outbox>) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().expect("registry lock poisoned").insert(id, outbox);
        id
    }

    pub fn leave(&self, id: SessionId) {
        self.inner.lock().expect("registry lock poisoned").remove(&id);
    }

    /// Snapshots all live `Weak` handles, then releases the lock — the
    /// upgrade-and-send step below never runs while holding it.
    fn snapshot(&self) -> Vec<Weak<Outbox>> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Forwards `text` to every currently live session. The payload is
    /// wrapped once in an `Arc` and shared across every recipient — never
    /// cloned per-session (conservation of bytes, spec §8).
    pub fn broadcast(&self, text: String) {
        let message = Arc::new(Message::Text(text.into()));
        for weak in self.snapshot() {
            if let Some(outbox) = weak.upgrade() {
                let _ = outbox.send(message.clone());
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").len()
    }
}

pub struct Server {
    listener: TcpListener,
    registry: Registry,
}

impl Server {
    /// Binds the downstream listener at `addr`, setting `SO_REUSEADDR`
    /// before bind for parity with the original C++ acceptor.
    pub async fn bind(addr: SocketAddr) -> Result<Server, StartupError> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|source| StartupError::Bind { addr, source })?;
        socket
            .set_reuse_address(true)
            .map_err(|source| StartupError::Bind { addr, source })?;
        socket
            .set_nonblocking(true)
            .map_err(|source| StartupError::Bind { addr, source })?;
        socket
            .bind(&addr.into())
            .map_err(|source| StartupError::Bind { addr, source })?;
        socket
            .listen(1024)
            .map_err(|source| StartupError::Bind { addr, source })?;

        let listener = TcpListener::from_std(socket.into())
            .map_err(|source| StartupError::Bind { addr, source })?;

        Ok(Server {
            listener,
            registry: Registry::new(),
        })
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener
            .local_addr()
            .expect("bound listener always has a local address")
    }

    /// Accepts connections until `shutdown` is cancelled, spawning one
    /// session task per accepted socket.
    pub async fn run(self, debug: bool, shutdown: CancellationToken) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    let registry = self.registry.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws) => session::spawn(ws, peer, registry, debug),
                            Err(err) => {
                                if debug {
                                    log::debug!("[Broadcast] handshake with {peer} failed: {err}");
                                }
                            }
                        }
                    });
                }
            }
        }
    }

    /// Forwards `text` to every live session's outbound queue.
    pub fn broadcast(&self, text: String) {
        self.registry.broadcast(text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn registry_tracks_join_and_leave() {
        let registry = Registry::new();
        let (tx, _rx) = mpsc::unbounded_channel::<Arc<Message>>();
        let tx = Arc::new(tx);
        let id = registry.join(Arc::downgrade(&tx));
        assert_eq!(registry.len(), 1);
        registry.leave(id);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn dropped_session_fails_to_upgrade_but_stays_until_explicit_leave() {
        let registry = Registry::new();
        let (tx, _rx) = mpsc::unbounded_channel::<Arc<Message>>();
        let tx = Arc::new(tx);
        registry.join(Arc::downgrade(&tx));
        drop(tx);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].upgrade().is_none());
    }

    #[tokio::test]
    async fn broadcast_fans_out_to_every_live_session() {
        let registry = Registry::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel::<Arc<Message>>();
        let (tx2, mut rx2) = mpsc::unbounded_channel::<Arc<Message>>();
        let tx1 = Arc::new(tx1);
        let tx2 = Arc::new(tx2);
        registry.join(Arc::downgrade(&tx1));
        registry.join(Arc::downgrade(&tx2));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Server {
            listener,
            registry: registry.clone(),
        };
        server.broadcast("hello".to_string());

        let m1 = rx1.recv().await.unwrap();
        let m2 = rx2.recv().await.unwrap();
        assert_eq!(m1.to_text().unwrap(), "hello");
        assert_eq!(m2.to_text().unwrap(), "hello");
        assert!(Arc::ptr_eq(&m1, &m2));
    }
}
