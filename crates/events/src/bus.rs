//! Commit notification abstraction (mechanics only).
//!
//! After an event is committed to an aggregate stream, its envelope is published on a
//! bus so that background consumers (the snapshot worker, in this workspace) can react
//! without sitting on the write path.
//!
//! ## Delivery
//!
//! - **Publish after commit**: a published envelope is always already durable
//! - **At-least-once**: consumers must tolerate duplicates
//! - **Best effort**: a lost notification only delays background work; the log
//!   remains the source of truth and consumers re-read it. Buses may drop messages
//!   for a subscriber that falls behind
//!
//! Consumers must be idempotent - processing the same notification twice should
//! produce the same result (or be a no-op).

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::Duration;

/// A subscription to a bus.
///
/// Each subscription receives a copy of every message published after it was
/// created (broadcast semantics). Use it from one thread.
///
/// ```ignore
/// let subscription = bus.subscribe();
/// loop {
///     match subscription.recv_timeout(Duration::from_millis(250)) {
///         Ok(envelope) => handle(envelope),
///         Err(RecvTimeoutError::Timeout) => continue, // check for shutdown
///         Err(RecvTimeoutError::Disconnected) => break, // bus dropped
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Pub/sub abstraction for committed-event notifications.
///
/// ```text
/// append → commit → invalidate cache → EventBus::publish → SnapshotWorker
/// ```
///
/// `publish()` failures are reported to the publisher, which logs them: the event is
/// already committed, so a failed notification is never a failed append.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
