//! Poller Module
//!
//! Completion queues are drained by dedicated poller threads, never by the
//! threads that manage connections:
//!
//! - [`ServerPoller`] runs passes over every connection in a
//!   [`ConnectionRegistry`]
//! - [`ClientPoller`] polls the client's single connection and hands
//!   responses back through a [`RequestGate`]
//!
//! What a poller does between passes that found nothing is a
//! [`WaitStrategy`], picked from [`PollMode`](crate::config::PollMode).

pub mod client;
pub mod server;
pub mod shared;
pub mod wait;

pub use client::{ClientPoller, RequestGate, RequestTicket};
pub use server::{ConnectionRegistry, ServerPoller};
pub use wait::{strategy_for, Backoff, BusyPoll, WaitStrategy};
