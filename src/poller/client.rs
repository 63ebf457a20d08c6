//! Client Poller
//!
//! A client holds at most one connection. The caller's thread submits
//! requests; a dedicated poller thread drains the connection's completion
//! queue and hands each response back through the [`RequestGate`].
//!
//! ```text
//!  caller                         RequestGate                 poller thread
//!    │ acquire() ─────────────────> busy = true                     │
//!    │ submit (post send)                                           │ send completed
//!    │ <── ticket                                                   │  -> post recv
//!    │ wait(ticket) ──────────────> blocks                          │ recv completed
//!    │                              busy = false, response <────────│  -> complete()
//!    │ <── response
//! ```
//!
//! The gate is released only by the response completion, so there is never
//! more than one request in flight.

use super::shared::Shared;
use super::wait::WaitStrategy;
use crate::connection::Connection;
use crate::error::{Result, RpcError};
use crate::protocol::Message;
use crate::transport::lock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Identifies one submitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestTicket(u64);

impl RequestTicket {
    pub fn sequence(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Default)]
struct GateState {
    /// A request is outstanding
    busy: bool,
    /// Tickets handed out so far
    issued: u64,
    /// Responses delivered so far
    completed: u64,
    /// The latest response and the ticket it answers
    response: Option<(u64, Message)>,
    /// Set once the connection can no longer answer
    failure: Option<String>,
}

/// Serializes requests on a client connection.
#[derive(Debug, Default)]
pub struct RequestGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl RequestGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the gate, blocking while a request is outstanding.
    ///
    /// There is no timeout. Fails once the connection has failed.
    pub fn acquire(&self) -> Result<RequestTicket> {
        let mut state = lock(&self.state);
        loop {
            if let Some(reason) = &state.failure {
                return Err(RpcError::ConnectionFailed(reason.clone()));
            }
            if !state.busy {
                break;
            }
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        state.busy = true;
        state.issued += 1;
        Ok(RequestTicket(state.issued))
    }

    /// Gives the gate back when the request behind `ticket` never went out.
    pub fn abandon(&self, ticket: RequestTicket) {
        let mut state = lock(&self.state);
        if state.busy && state.issued == ticket.0 {
            state.busy = false;
            self.changed.notify_all();
        }
    }

    /// Delivers the response to the outstanding request and releases the gate.
    pub fn complete(&self, response: Message) {
        let mut state = lock(&self.state);
        state.completed += 1;
        state.response = Some((state.issued, response));
        state.busy = false;
        self.changed.notify_all();
    }

    /// Fails every current and future waiter with `reason`.
    pub fn fail(&self, reason: String) {
        let mut state = lock(&self.state);
        if state.failure.is_none() {
            state.failure = Some(reason);
        }
        state.busy = false;
        self.changed.notify_all();
    }

    /// Returns true while a request is outstanding.
    pub fn is_busy(&self) -> bool {
        lock(&self.state).busy
    }

    /// Blocks until the response to `ticket` arrives.
    ///
    /// A response that was already delivered is returned at once. Fails with
    /// [`RpcError::ResponseSuperseded`] when a later request's response took
    /// its place.
    pub fn wait(&self, ticket: RequestTicket) -> Result<Message> {
        let mut state = lock(&self.state);
        loop {
            if matches!(&state.response, Some((id, _)) if *id == ticket.0) {
                if let Some((_, response)) = state.response.take() {
                    return Ok(response);
                }
            }
            if state.completed >= ticket.0 {
                return Err(RpcError::ResponseSuperseded(ticket.0));
            }
            if let Some(reason) = &state.failure {
                return Err(RpcError::ConnectionFailed(reason.clone()));
            }
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }
}

type Slot = Arc<Shared<Option<Connection>>>;

/// Polls the client's single connection on a dedicated thread.
pub struct ClientPoller {
    slot: Slot,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ClientPoller {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Shared::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    /// Puts `conn` in the slot.
    ///
    /// Fails with [`RpcError::AlreadyConnected`] when the slot is taken; the
    /// rejected connection is torn down.
    pub fn register(&self, conn: Connection) -> Result<()> {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return Err(RpcError::AlreadyConnected);
        }
        debug!(conn = %conn.id(), "Client connection registered");
        *slot = Some(conn);
        Ok(())
    }

    /// Takes the connection out of the slot.
    pub fn deregister(&self) -> Option<Connection> {
        self.slot.lock().take()
    }

    pub fn is_registered(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Runs `f` on the registered connection.
    pub fn with_connection<R>(&self, f: impl FnOnce(&mut Connection) -> R) -> Result<R> {
        let mut slot = self.slot.lock();
        let conn = slot.as_mut().ok_or(RpcError::NotConnected)?;
        Ok(f(conn))
    }

    /// Starts the poller thread. Does nothing when it already runs.
    pub fn start(&mut self, mut strategy: Box<dyn WaitStrategy>) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::Release);
        let slot = Arc::clone(&self.slot);
        let running = Arc::clone(&self.running);

        let handle = thread::Builder::new()
            .name("flashrpc-client-poller".to_string())
            .spawn(move || {
                debug!("Client poller started");
                while running.load(Ordering::Acquire) {
                    let found = poll_slot(&slot);
                    if found > 0 {
                        strategy.reset();
                    } else {
                        strategy.idle();
                    }
                }
                debug!("Client poller stopped");
            })
            .map_err(|e| RpcError::Reactor(format!("failed to spawn client poller: {e}")))?;
        self.thread = Some(handle);
        Ok(())
    }

    /// Stops the poller thread and waits for it.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("Client poller thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }
}

impl Default for ClientPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ClientPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One pass over the slot. Returns the number of completions handled.
fn poll_slot(slot: &Shared<Option<Connection>>) -> usize {
    let mut guard = slot.lock_for_pass();
    let Some(conn) = guard.as_mut() else {
        return 0;
    };
    match conn.poll() {
        Ok(n) => n,
        Err(e) => {
            conn.fail(&e);
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_gate_serializes_requests() {
        let gate = Arc::new(RequestGate::new());
        let first = gate.acquire().unwrap();
        assert!(gate.is_busy());

        let second = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.acquire().unwrap())
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!second.is_finished());

        gate.complete(Message::response(b"one").unwrap());
        let second = second.join().unwrap();
        assert!(second > first);
        assert_eq!(gate.wait(first).unwrap().payload(), b"one");
    }

    #[test]
    fn test_wait_blocks_until_complete() {
        let gate = Arc::new(RequestGate::new());
        let ticket = gate.acquire().unwrap();

        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.wait(ticket))
        };
        thread::sleep(Duration::from_millis(20));
        gate.complete(Message::response(b"ok").unwrap());

        let response = waiter.join().unwrap().unwrap();
        assert_eq!(response.payload(), b"ok");
        assert!(!gate.is_busy());
    }

    #[test]
    fn test_superseded_response() {
        let gate = RequestGate::new();
        let first = gate.acquire().unwrap();
        gate.complete(Message::response(b"1").unwrap());
        let second = gate.acquire().unwrap();
        gate.complete(Message::response(b"2").unwrap());

        assert!(matches!(
            gate.wait(first),
            Err(RpcError::ResponseSuperseded(1))
        ));
        assert_eq!(gate.wait(second).unwrap().payload(), b"2");
    }

    #[test]
    fn test_failure_wakes_waiters() {
        let gate = Arc::new(RequestGate::new());
        let ticket = gate.acquire().unwrap();

        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.wait(ticket))
        };
        gate.fail("link went down".to_string());

        assert!(matches!(
            waiter.join().unwrap(),
            Err(RpcError::ConnectionFailed(_))
        ));
        assert!(gate.acquire().is_err());
    }

    #[test]
    fn test_abandon_releases_gate() {
        let gate = RequestGate::new();
        let ticket = gate.acquire().unwrap();
        gate.abandon(ticket);
        assert!(!gate.is_busy());
        assert!(gate.acquire().is_ok());
    }

    #[test]
    fn test_empty_slot() {
        let poller = ClientPoller::new();
        assert!(!poller.is_registered());
        assert!(matches!(
            poller.with_connection(|conn| conn.id()),
            Err(RpcError::NotConnected)
        ));
        assert!(poller.deregister().is_none());
    }

    #[test]
    fn test_start_and_stop() {
        let mut poller = ClientPoller::new();
        poller
            .start(crate::poller::strategy_for(crate::config::PollMode::Backoff))
            .unwrap();
        assert!(poller.is_running());
        poller.stop();
        assert!(!poller.is_running());
    }
}
