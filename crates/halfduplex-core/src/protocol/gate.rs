//! Mutual-exclusion gate
//!
//! Serializes everything that writes to the transport. Waiters are served in
//! the order they called [`Gate::acquire`].

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::ProtocolError;

/// Capacity-one, FIFO-fair gate
#[derive(Debug, Clone)]
pub struct Gate {
    permits: Arc<Semaphore>,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    /// Create an open, unheld gate
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
        }
    }

    /// Wait for exclusive access.
    ///
    /// Fails with [`ProtocolError::Closed`] once the gate has been closed,
    /// including for callers already queued.
    pub async fn acquire(&self) -> Result<GateGuard, ProtocolError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProtocolError::Closed)?;
        tracing::trace!("gate acquired");
        Ok(GateGuard { _permit: permit })
    }

    /// Whether someone currently holds the gate
    pub fn is_held(&self) -> bool {
        !self.permits.is_closed() && self.permits.available_permits() == 0
    }

    /// Refuse all current and future waiters. An existing holder keeps its guard.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Whether [`Gate::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}

/// Exclusive hold on a [`Gate`].
///
/// Consuming the guard is the only way to release, so a hold can never be
/// released twice. Dropping it on an error path releases it too.
#[must_use = "the gate is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct GateGuard {
    _permit: OwnedSemaphorePermit,
}

impl GateGuard {
    /// Hand the gate to the next waiter
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        tracing::trace!("gate released");
    }
}
