use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::Error;

/// Lifecycle shared by every transport.
///
/// `Unstarted -> Starting -> Ready -> Closed`, with `Failed` reachable from `Starting` (start
/// error) and `Ready` (process exit, stream abort). `Closed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    Unstarted,
    Starting,
    Ready,
    Closed,
    Failed,
}

impl TransportState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Unstarted, Self::Starting)
                | (Self::Starting, Self::Ready)
                | (Self::Starting, Self::Failed)
                | (Self::Ready, Self::Closed)
                | (Self::Ready, Self::Failed)
        )
    }
}

/// State cell plus the cancellation token that `close` trips.
///
/// Cloned into every background task of a transport.
#[derive(Debug, Clone)]
pub(crate) struct Lifecycle {
    state: Arc<Mutex<TransportState>>,
    cancel: CancellationToken,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TransportState::Unstarted)),
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn state(&self) -> TransportState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves to `next` if the transition is legal. Returns whether it happened.
    pub(crate) fn advance(&self, next: TransportState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.can_transition_to(next) {
            return false;
        }
        *state = next;
        true
    }

    /// Marks a mid-life failure. Returns false when the transport was already closed.
    pub(crate) fn fail(&self) -> bool {
        self.advance(TransportState::Failed)
    }

    /// Trips the cancellation token and moves to `Closed` when possible.
    pub(crate) fn begin_close(&self) -> bool {
        self.cancel.cancel();
        self.advance(TransportState::Closed)
    }

    pub(crate) fn ensure_ready(&self) -> Result<(), Error> {
        match self.state() {
            TransportState::Ready => Ok(()),
            TransportState::Closed => Err(Error::Closed),
            TransportState::Failed => Err(Error::SendFailed(
                "transport failed; no further messages can be sent".to_string(),
            )),
            TransportState::Unstarted | TransportState::Starting => Err(Error::SendFailed(
                "transport is not ready".to_string(),
            )),
        }
    }

    pub(crate) fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    #[cfg(test)]
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
