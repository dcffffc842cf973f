//! Transport worker threads.

use crate::TransportError;
use once_cell::sync::Lazy;
use std::future::Future;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::debug;

/// Runtime shared by every socket in the process
static RUNTIME: Lazy<Result<Runtime, String>> = Lazy::new(|| {
    let workers = std::thread::available_parallelism()
        .map(|n| n.get().clamp(2, 8))
        .unwrap_or(2);
    debug!("Starting transport runtime with {} worker threads", workers);

    Builder::new_multi_thread()
        .worker_threads(workers)
        .thread_name("ipc-transport")
        .enable_all()
        .build()
        .map_err(|e| e.to_string())
});

/// Handle to the transport runtime
pub(crate) fn handle() -> Result<Handle, TransportError> {
    RUNTIME
        .as_ref()
        .map(|rt| rt.handle().clone())
        .map_err(|e| TransportError::Runtime(e.clone()))
}

/// Run `fut` on the transport runtime and block the calling thread until it finishes.
///
/// Never call this from a task that the same future waits on.
pub(crate) fn block_on<F>(handle: &Handle, fut: F) -> Result<F::Output, TransportError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let (tx, rx) = std::sync::mpsc::sync_channel(1);
    handle.spawn(async move {
        let _ = tx.send(fut.await);
    });
    rx.recv().map_err(|_| TransportError::Closed)
}
