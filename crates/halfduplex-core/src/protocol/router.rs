//! Response routing
//!
//! Every framed line goes to whatever occupies the handler slot: the armed
//! request while one exists, the spontaneous-message observers otherwise.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::oneshot;

use super::request::PendingRequest;
use super::{Line, Logger};

/// Callback for lines nobody asked for
pub type Observer = Arc<dyn Fn(&Line) + Send + Sync>;

enum Slot {
    Spontaneous,
    Armed(PendingRequest),
}

/// Owner of the handler slot and the observer list
pub(crate) struct Router {
    slot: Mutex<Slot>,
    observers: RwLock<Vec<Observer>>,
    logger: Option<Arc<dyn Logger>>,
}

impl Router {
    pub(crate) fn new(logger: Option<Arc<dyn Logger>>) -> Self {
        Self {
            slot: Mutex::new(Slot::Spontaneous),
            observers: RwLock::new(Vec::new()),
            logger,
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install a request expecting `expected` lines.
    ///
    /// Callers hold the gate, so the slot is always spontaneous here.
    pub(crate) fn arm(&self, expected: usize) -> oneshot::Receiver<Vec<Line>> {
        let (request, complete) = PendingRequest::new(expected);
        let mut slot = self.lock_slot();
        debug_assert!(matches!(*slot, Slot::Spontaneous), "request already armed");
        *slot = Slot::Armed(request);
        tracing::trace!(expected, "request armed");
        complete
    }

    /// Take the armed request out of the slot and restore spontaneous
    /// dispatch. Returns `None` if the request already completed.
    pub(crate) fn disarm(&self) -> Option<PendingRequest> {
        let mut slot = self.lock_slot();
        match std::mem::replace(&mut *slot, Slot::Spontaneous) {
            Slot::Armed(request) => Some(request),
            Slot::Spontaneous => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self) -> bool {
        matches!(*self.lock_slot(), Slot::Armed(_))
    }

    /// Route one incoming line
    pub(crate) fn deliver(&self, line: Line) {
        let mut slot = self.lock_slot();
        if let Slot::Armed(request) = &mut *slot {
            if request.push(line) {
                if let Slot::Armed(request) = std::mem::replace(&mut *slot, Slot::Spontaneous) {
                    request.complete();
                }
            }
            return;
        }
        drop(slot);
        self.dispatch(&line);
    }

    /// Hand a spontaneous line to every observer, in registration order.
    ///
    /// A panicking observer is reported and skipped; later observers still
    /// see the line.
    fn dispatch(&self, line: &Line) {
        // Snapshot so observers may register further observers
        let observers: Vec<Observer> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        if observers.is_empty() {
            tracing::trace!(%line, "ignored line");
            return;
        }

        for (index, observer) in observers.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| observer(line))).is_err() {
                tracing::warn!(observer = index, "message observer panicked");
                if let Some(logger) = &self.logger {
                    logger.error(&format!("Message observer {} panicked on line {}", index, line));
                }
            }
        }
    }

    pub(crate) fn add_observer(&self, observer: Observer) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub(crate) fn clear_observers(&self) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub(crate) fn observer_count(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
