//! Server Poller
//!
//! The server keeps every live connection in a [`ConnectionRegistry`]. The
//! connection-manager reactor adds and removes entries; one poller thread
//! runs passes over all of them.
//!
//! ```text
//!  reactor thread                 ConnectionRegistry              poller thread
//!  ──────────────                 ──────────────────              ─────────────
//!  connect request ─ register ──> ┌────────────────┐ <── pass ──  for each conn:
//!                                 │ id -> Conn     │                poll CQ
//!  disconnected ─── deregister ─> │ id -> Conn     │                advance
//!                                 └────────────────┘
//! ```
//!
//! A pass holds the registry lock, so a connection is never torn down while
//! its completions are being applied. An error on one connection fails that
//! connection only.

use super::shared::Shared;
use super::wait::WaitStrategy;
use crate::connection::{Connection, ConnectionId};
use crate::error::{Result, RpcError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Live server connections, keyed by id.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Shared<HashMap<ConnectionId, Connection>>,
    passes: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `conn`.
    ///
    /// A connection already registered under the same id is replaced and
    /// torn down.
    pub fn register(&self, conn: Connection) {
        let id = conn.id();
        let displaced = self.connections.lock().insert(id, conn);
        if let Some(mut old) = displaced {
            let err = RpcError::DuplicateConnection(id);
            warn!(conn = %id, error = %err, "Replaced registered connection");
            old.teardown();
        } else {
            debug!(conn = %id, "Connection registered");
        }
    }

    /// Removes the connection with `id` and hands it to the caller.
    pub fn deregister(&self, id: ConnectionId) -> Result<Connection> {
        self.connections
            .lock()
            .remove(&id)
            .ok_or(RpcError::ConnectionGone(id))
    }

    /// Runs `f` on the connection with `id`.
    pub fn with_connection<R>(
        &self,
        id: ConnectionId,
        f: impl FnOnce(&mut Connection) -> R,
    ) -> Result<R> {
        let mut connections = self.connections.lock();
        let conn = connections
            .get_mut(&id)
            .ok_or(RpcError::ConnectionGone(id))?;
        Ok(f(conn))
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of every registered connection, in ascending order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.connections.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Polls every registered connection once.
    ///
    /// Returns the number of completions handled. A connection whose poll
    /// fails is marked failed and stays registered until its disconnect
    /// event arrives.
    pub fn poll_pass(&self) -> usize {
        let mut connections = self.connections.lock_for_pass();
        let mut handled = 0;
        for conn in connections.values_mut() {
            match conn.poll() {
                Ok(n) => handled += n,
                Err(e) => {
                    conn.fail(&e);
                    handled += 1;
                }
            }
        }
        self.passes.fetch_add(1, Ordering::Relaxed);
        handled
    }

    /// Polling passes run so far.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Removes every connection.
    pub fn drain(&self) -> Vec<Connection> {
        self.connections
            .lock()
            .drain()
            .map(|(_, conn)| conn)
            .collect()
    }
}

/// Runs registry passes on a dedicated thread.
pub struct ServerPoller {
    registry: Arc<ConnectionRegistry>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ServerPoller {
    /// Spawns the poller thread over `registry`.
    pub fn start(
        registry: Arc<ConnectionRegistry>,
        mut strategy: Box<dyn WaitStrategy>,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let handle = {
            let registry = Arc::clone(&registry);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("flashrpc-server-poller".to_string())
                .spawn(move || {
                    debug!("Server poller started");
                    while running.load(Ordering::Acquire) {
                        if registry.poll_pass() > 0 {
                            strategy.reset();
                        } else {
                            strategy.idle();
                        }
                    }
                    debug!(passes = registry.passes(), "Server poller stopped");
                })
                .map_err(|e| RpcError::Reactor(format!("failed to spawn server poller: {e}")))?
        };

        Ok(Self {
            registry,
            running,
            thread: Some(handle),
        })
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Stops the poller thread and waits for it.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("Server poller thread panicked");
            }
        }
    }
}

impl Drop for ServerPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PollMode;
    use crate::connection::ResourceSet;
    use crate::handler::EchoHandler;
    use crate::poller::strategy_for;
    use crate::transport::{Device, EventChannel};
    use std::time::{Duration, Instant};

    fn server_connection(channel: &EventChannel) -> Connection {
        let mut cm_id = channel.create_id();
        let resources = ResourceSet::acquire(&mut cm_id, 1).unwrap();
        Connection::server(cm_id, resources, Arc::new(EchoHandler))
    }

    #[test]
    fn test_register_and_deregister() {
        let device = Device::open("registry-basic");
        let channel = EventChannel::with_device(Arc::clone(&device));
        let registry = ConnectionRegistry::new();

        let conn = server_connection(&channel);
        let id = conn.id();
        registry.register(conn);
        assert!(registry.contains(id));
        assert_eq!(registry.ids(), vec![id]);

        let mut conn = registry.deregister(id).unwrap();
        assert!(registry.is_empty());
        assert!(conn.teardown().is_empty());
        assert!(device.resource_counts().is_empty());

        assert!(matches!(
            registry.deregister(id),
            Err(RpcError::ConnectionGone(gone)) if gone == id
        ));
    }

    #[test]
    fn test_pass_over_idle_connections() {
        let device = Device::open("registry-idle");
        let channel = EventChannel::with_device(Arc::clone(&device));
        let registry = ConnectionRegistry::new();
        for _ in 0..3 {
            registry.register(server_connection(&channel));
        }
        assert_eq!(registry.poll_pass(), 0);
        assert_eq!(registry.passes(), 1);

        drop(registry.drain());
        assert!(device.resource_counts().is_empty());
    }

    #[test]
    fn test_concurrent_mutation_during_passes() {
        let device = Device::open("registry-concurrent");
        let channel = Arc::new(EventChannel::with_device(Arc::clone(&device)));
        let registry = Arc::new(ConnectionRegistry::new());
        let mut poller =
            ServerPoller::start(Arc::clone(&registry), strategy_for(PollMode::Busy)).unwrap();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let channel = Arc::clone(&channel);
                thread::spawn(move || {
                    for _ in 0..25 {
                        let conn = server_connection(&channel);
                        let id = conn.id();
                        registry.register(conn);
                        let mut conn = registry.deregister(id).unwrap();
                        conn.teardown();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let start = Instant::now();
        while registry.passes() == 0 && start.elapsed() < Duration::from_secs(5) {
            thread::yield_now();
        }
        poller.stop();
        assert!(registry.passes() > 0);
        assert!(registry.is_empty());
        assert!(device.resource_counts().is_empty());
    }
}
