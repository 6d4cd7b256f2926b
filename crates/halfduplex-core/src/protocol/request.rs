//! Pending requests and the timeout race
//!
//! A request is armed with the number of lines it expects. It settles once,
//! either when the router hands it the last expected line or when its
//! deadline elapses, whichever happens first.

use std::time::Duration;
use tokio::sync::oneshot;

use super::router::Router;
use super::{Line, ProtocolError};

/// How a request ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Settlement {
    /// Every expected line arrived before the deadline
    Complete(Vec<Line>),
    /// The deadline elapsed after some, but not all, expected lines
    Partial(Vec<Line>),
    /// The deadline elapsed without a single line
    TimedOut,
}

impl Settlement {
    pub(crate) fn from_lines(lines: Vec<Line>, expected: usize) -> Self {
        if lines.is_empty() {
            Settlement::TimedOut
        } else if lines.len() >= expected {
            Settlement::Complete(lines)
        } else {
            Settlement::Partial(lines)
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Settlement::Complete(_) => "complete",
            Settlement::Partial(_) => "partial",
            Settlement::TimedOut => "timeout",
        }
    }

    /// Partial answers are successes; only silence is an error
    pub(crate) fn into_result(self) -> Result<Vec<Line>, ProtocolError> {
        match self {
            Settlement::Complete(lines) | Settlement::Partial(lines) => Ok(lines),
            Settlement::TimedOut => Err(ProtocolError::Timeout),
        }
    }
}

/// Accumulator for one in-flight request
#[derive(Debug)]
pub(crate) struct PendingRequest {
    expected: usize,
    lines: Vec<Line>,
    complete: oneshot::Sender<Vec<Line>>,
}

impl PendingRequest {
    pub(crate) fn new(expected: usize) -> (Self, oneshot::Receiver<Vec<Line>>) {
        let (complete, receiver) = oneshot::channel();
        let request = Self {
            expected: expected.max(1),
            lines: Vec::with_capacity(expected.max(1)),
            complete,
        };
        (request, receiver)
    }

    #[cfg(test)]
    pub(crate) fn expected(&self) -> usize {
        self.expected
    }

    /// Append a line, returning true once the expected count is reached
    pub(crate) fn push(&mut self, line: Line) -> bool {
        self.lines.push(line);
        self.lines.len() >= self.expected
    }

    /// Resolve the waiting side with everything collected
    pub(crate) fn complete(self) {
        // The waiter only disappears if its task was aborted
        let _ = self.complete.send(self.lines);
    }

    pub(crate) fn into_settlement(self) -> Settlement {
        Settlement::from_lines(self.lines, self.expected)
    }
}

/// Race the armed request against its deadline.
///
/// The timer is dropped as soon as the request completes. When the deadline
/// wins, the request is taken out of the router, which restores spontaneous
/// dispatch; if the router completed it in the meantime, that result is used.
pub(crate) async fn race(
    router: &Router,
    mut complete: oneshot::Receiver<Vec<Line>>,
    expected: usize,
    timeout: Duration,
) -> Settlement {
    tokio::select! {
        biased;
        lines = &mut complete => Settlement::from_lines(lines.unwrap_or_default(), expected),
        () = tokio::time::sleep(timeout) => match router.disarm() {
            Some(pending) => pending.into_settlement(),
            None => Settlement::from_lines(complete.await.unwrap_or_default(), expected),
        },
    }
}
