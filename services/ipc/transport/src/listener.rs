//! Incoming connections.

use crate::socket::{next_id, SocketCore};
use crate::stream::Acceptor;
use crate::{pipe, runtime, Address, TransportError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(50);

#[derive(Default)]
struct ListenerState {
    task: Option<JoinHandle<()>>,
    local_url: Option<String>,
}

/// Accepts pipes for a socket on one address. Dropping the listener closes it.
pub struct Listener {
    core: Arc<SocketCore>,
    id: u64,
    url: String,
    address: Address,
    state: Mutex<ListenerState>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("url", &self.url)
            .finish()
    }
}

impl Listener {
    pub(crate) fn new(core: Arc<SocketCore>, url: &str, address: Address) -> Self {
        Self {
            core,
            id: next_id(),
            url: url.to_string(),
            address,
            state: Mutex::new(ListenerState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ListenerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Endpoint id, matches [`crate::Socket::pipes_for`]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Address as given
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Address actually bound once started, e.g. with the port picked for `tcp://host:0`
    pub fn local_url(&self) -> Option<String> {
        self.state().local_url.clone()
    }

    /// Bind the address and accept in the background.
    ///
    /// Binding happens before this returns, so an address that is taken is
    /// reported here as [`TransportError::AddressInUse`].
    pub fn start(&self) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.task.is_some() {
            return Err(TransportError::Busy);
        }
        if self.core.is_closed() {
            return Err(TransportError::Closed);
        }

        let acceptor = {
            let _ctx = self.core.handle.enter();
            Acceptor::bind(&self.address)?
        };
        state.local_url = acceptor.local_url();
        info!(
            "Listening on {}",
            state.local_url.as_deref().unwrap_or(&self.url)
        );

        state.task = Some(
            self.core
                .handle
                .spawn(accept_loop(self.core.clone(), self.id, acceptor)),
        );
        Ok(())
    }

    /// Unbind and drop every accepted pipe. Returns once the address is free.
    pub fn close(&self) {
        let Some(task) = self.state().task.take() else {
            return;
        };
        task.abort();
        let _ = runtime::block_on(&self.core.handle, async move {
            let _ = task.await;
        });
        debug!("Closed listener {} for {}", self.id, self.url);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

async fn accept_loop(core: Arc<SocketCore>, id: u64, mut acceptor: Acceptor) {
    // Dropping the set aborts every pipe, so closing the listener takes them down too
    let mut pipes = JoinSet::new();
    let closed = core.closed();
    tokio::pin!(closed);

    loop {
        tokio::select! {
            _ = &mut closed => break,
            accepted = acceptor.accept() => match accepted {
                Ok(stream) => {
                    let core = core.clone();
                    pipes.spawn(async move {
                        let peer = stream.peer();
                        match pipe::establish(&core, id, stream).await {
                            Ok((stream, registration)) => {
                                debug!("Accepted pipe from {}", peer);
                                pipe::run(core, stream, registration).await;
                            }
                            Err(e) => debug!("Rejected pipe from {}: {}", peer, e),
                        }
                    });
                }
                Err(TransportError::Closed) => break,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                }
            },
            Some(_) = pipes.join_next(), if !pipes.is_empty() => {}
        }
    }

    acceptor.unbind();
}
