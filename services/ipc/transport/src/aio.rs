//! Asynchronous operation handles.
//!
//! An [`Aio`] carries at most one outstanding send or receive. When the
//! operation finishes, its callback runs on a transport worker thread with the
//! outcome. The callback may immediately submit the next operation on the same
//! handle, which is how self-sustaining receive loops and send chains are built.

use crate::{runtime, TransportError};
use ipc_wire::Message;
use std::future::Future;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::trace;

/// Outcome of a completed operation
#[derive(Debug)]
pub enum AioResult {
    /// A send finished; on failure the undelivered message is handed back
    Send(Result<(), (Message, TransportError)>),
    /// A receive finished
    Recv(Result<Message, TransportError>),
}

impl AioResult {
    /// Error of the operation, if it failed
    pub fn error(&self) -> Option<&TransportError> {
        match self {
            AioResult::Send(Err((_, e))) | AioResult::Recv(Err(e)) => Some(e),
            _ => None,
        }
    }
}

type Callback = dyn Fn(&Aio, AioResult) + Send + Sync;

#[derive(Default)]
struct AioState {
    /// An operation has been submitted and has not completed
    pending: bool,
    /// The callback is executing
    in_callback: bool,
    /// Sticky cancellation latch
    canceled: bool,
    /// Fires the cancellation of the pending operation
    cancel_tx: Option<oneshot::Sender<()>>,
}

struct AioInner {
    state: Mutex<AioState>,
    idle: Condvar,
    callback: Box<Callback>,
    handle: Handle,
}

/// Handle for one in-flight asynchronous operation at a time
#[derive(Clone)]
pub struct Aio {
    inner: Arc<AioInner>,
}

impl std::fmt::Debug for Aio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Aio")
            .field("pending", &state.pending)
            .field("in_callback", &state.in_callback)
            .field("canceled", &state.canceled)
            .finish()
    }
}

impl Aio {
    /// Allocate a handle whose completions are delivered to `callback`.
    ///
    /// Fails only when the transport runtime cannot be started.
    pub fn new<F>(callback: F) -> Result<Self, TransportError>
    where
        F: Fn(&Aio, AioResult) + Send + Sync + 'static,
    {
        Ok(Self {
            inner: Arc::new(AioInner {
                state: Mutex::new(AioState::default()),
                idle: Condvar::new(),
                callback: Box::new(callback),
                handle: runtime::handle()?,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, AioState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether an operation is outstanding or its callback is still running
    pub fn is_busy(&self) -> bool {
        let state = self.lock();
        state.pending || state.in_callback
    }

    /// Whether [`Aio::cancel`] has been called
    pub fn is_canceled(&self) -> bool {
        self.lock().canceled
    }

    /// Abort the outstanding operation.
    ///
    /// Its callback still runs, observing [`TransportError::Canceled`].
    /// Cancellation is sticky: every operation submitted afterwards completes
    /// immediately with `Canceled`, so a callback that re-arms cannot keep the
    /// handle alive.
    pub fn cancel(&self) {
        let mut state = self.lock();
        state.canceled = true;
        if let Some(tx) = state.cancel_tx.take() {
            let _ = tx.send(());
            trace!("Canceled pending aio operation");
        }
    }

    /// Block until no operation is pending and no callback is running.
    ///
    /// Must not be called from this handle's own callback.
    pub fn wait(&self) {
        let mut state = self.lock();
        while state.pending || state.in_callback {
            state = self
                .inner
                .idle
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Claim the handle for a new operation
    pub(crate) fn reserve(&self) -> Result<Ticket, TransportError> {
        let mut state = self.lock();
        if state.pending {
            return Err(TransportError::Busy);
        }
        state.pending = true;

        let (cancel_tx, cancel_rx) = oneshot::channel();
        if state.canceled {
            let _ = cancel_tx.send(());
        } else {
            state.cancel_tx = Some(cancel_tx);
        }

        Ok(Ticket {
            aio: Some(self.clone()),
            cancel_rx: Some(cancel_rx),
        })
    }

    fn complete(&self, result: AioResult) {
        {
            let mut state = self.lock();
            state.pending = false;
            state.cancel_tx = None;
            state.in_callback = true;
        }

        let _guard = CallbackGuard { aio: self };
        (self.inner.callback)(self, result);
    }

    fn release(&self) {
        let mut state = self.lock();
        state.pending = false;
        state.cancel_tx = None;
        drop(state);
        self.inner.idle.notify_all();
    }
}

/// Clears `in_callback` even if the callback panics
struct CallbackGuard<'a> {
    aio: &'a Aio,
}

impl Drop for CallbackGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.aio.lock();
        state.in_callback = false;
        drop(state);
        self.aio.inner.idle.notify_all();
    }
}

/// A reserved handle, ready to run exactly one operation
pub(crate) struct Ticket {
    aio: Option<Aio>,
    cancel_rx: Option<oneshot::Receiver<()>>,
}

impl Ticket {
    /// Run the operation on the transport runtime and deliver its result.
    ///
    /// The operation receives the cancellation signal and must resolve
    /// promptly once it fires.
    pub(crate) fn launch<Op, Fut>(mut self, op: Op)
    where
        Op: FnOnce(oneshot::Receiver<()>) -> Fut,
        Fut: Future<Output = AioResult> + Send + 'static,
    {
        let (Some(aio), Some(cancel_rx)) = (self.aio.take(), self.cancel_rx.take()) else {
            return;
        };
        let fut = op(cancel_rx);
        let handle = aio.inner.handle.clone();
        handle.spawn(async move {
            let result = fut.await;
            aio.complete(result);
        });
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if let Some(aio) = self.aio.take() {
            aio.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn recv_after(delay: Duration) -> impl FnOnce(oneshot::Receiver<()>) -> std::pin::Pin<Box<dyn Future<Output = AioResult> + Send>> {
        move |cancel| {
            Box::pin(async move {
                tokio::select! {
                    biased;
                    _ = cancel => AioResult::Recv(Err(TransportError::Canceled)),
                    _ = tokio::time::sleep(delay) => AioResult::Recv(Ok(Message::new())),
                }
            })
        }
    }

    #[test]
    fn test_completion_runs_callback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let aio = Aio::new(move |_, result| {
            assert!(matches!(result, AioResult::Recv(Ok(_))));
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        aio.reserve().unwrap().launch(recv_after(Duration::from_millis(5)));
        aio.wait();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!aio.is_busy());
    }

    #[test]
    fn test_second_reserve_is_busy() {
        let aio = Aio::new(|_, _| {}).unwrap();
        let ticket = aio.reserve().unwrap();
        assert!(matches!(aio.reserve(), Err(TransportError::Busy)));

        // An unused ticket gives the handle back
        drop(ticket);
        assert!(!aio.is_busy());
        assert!(aio.reserve().is_ok());
    }

    #[test]
    fn test_cancel_is_observed_and_sticky() {
        let canceled = Arc::new(AtomicUsize::new(0));
        let seen = canceled.clone();
        let aio = Aio::new(move |aio, result| {
            if matches!(result.error(), Some(TransportError::Canceled)) {
                // Re-arming after cancellation must complete straight away
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    aio.reserve().unwrap().launch(recv_after(Duration::from_secs(3600)));
                }
            }
        })
        .unwrap();

        aio.reserve().unwrap().launch(recv_after(Duration::from_secs(3600)));
        aio.cancel();
        aio.wait();

        assert_eq!(canceled.load(Ordering::SeqCst), 2);
        assert!(aio.is_canceled());
    }
}
