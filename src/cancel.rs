//! Cooperative cancellation shared between a caller and worker threads.
//!
//! A [`CancelSource`] owns the cancellation; every [`CancelToken`] cloned
//! from it observes the same state. The token is backed by a channel so
//! producer threads can `select!` between sending work and noticing
//! cancellation; it is cancelled exactly when the channel disconnects.

use std::sync::{Mutex, OnceLock};

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};

/// Owning side. Cancelling, or dropping the source, cancels every token.
pub struct CancelSource {
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

impl CancelSource {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx: Mutex::new(Some(tx)), rx }
    }

    pub fn token(&self) -> CancelToken {
        CancelToken { rx: self.rx.clone() }
    }

    /// Cancel all tokens. Idempotent.
    pub fn cancel(&self) {
        self.tx.lock().unwrap().take();
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Observing side. Cheap to clone; check with [`CancelToken::is_cancelled`]
/// or select on [`CancelToken::channel`].
#[derive(Clone)]
pub struct CancelToken {
    rx: Receiver<()>,
}

impl CancelToken {
    /// A token that never cancels.
    pub fn never() -> CancelToken {
        static NEVER: OnceLock<(Sender<()>, Receiver<()>)> = OnceLock::new();
        let (_, rx) = NEVER.get_or_init(|| bounded(1));
        CancelToken { rx: rx.clone() }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// The underlying channel: ready (disconnected) once cancelled, for
    /// use in `select!`.
    pub(crate) fn channel(&self) -> &Receiver<()> {
        &self.rx
    }
}
