//! Outgoing connections with automatic reconnect.

use crate::socket::{next_id, SocketCore};
use crate::{pipe, runtime, stream, Address, TransportError};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Default minimum delay between connection attempts
pub const DEFAULT_RECONNECT_MIN: Duration = Duration::from_millis(100);

/// Floor for the reconnect delay so a zero setting cannot spin
const RECONNECT_FLOOR: Duration = Duration::from_millis(1);

/// How [`Dialer::start`] treats the first connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialMode {
    /// Wait for the first attempt and report its outcome
    Blocking,
    /// Return at once and connect in the background
    NonBlocking,
}

/// Dials one address on behalf of a socket and keeps the pipe alive.
///
/// Failed attempts back off exponentially from the minimum reconnect
/// interval up to the maximum. A pipe that is lost later is redialed after the
/// minimum interval. Dropping the dialer closes it.
pub struct Dialer {
    core: Arc<SocketCore>,
    id: u64,
    url: String,
    address: Address,
    reconnect_min: Duration,
    reconnect_max: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("reconnect_min", &self.reconnect_min)
            .field("reconnect_max", &self.reconnect_max)
            .finish()
    }
}

impl Dialer {
    pub(crate) fn new(core: Arc<SocketCore>, url: &str, address: Address) -> Self {
        Self {
            core,
            id: next_id(),
            url: url.to_string(),
            address,
            reconnect_min: DEFAULT_RECONNECT_MIN,
            reconnect_max: Duration::ZERO,
            task: Mutex::new(None),
        }
    }

    fn task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Endpoint id, matches [`crate::Socket::pipes_for`]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Address being dialed
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Delay before the first retry and before redialing a lost pipe
    pub fn set_reconnect_min(&mut self, interval: Duration) {
        self.reconnect_min = interval;
    }

    /// Upper bound of the retry backoff; anything below the minimum disables backoff
    pub fn set_reconnect_max(&mut self, interval: Duration) {
        self.reconnect_max = interval;
    }

    /// Whether the dialer currently has a connected pipe
    pub fn is_connected(&self) -> bool {
        self.core.pipes_for(self.id) > 0
    }

    /// Start dialing.
    ///
    /// With [`DialMode::Blocking`] the first attempt's error is returned, but
    /// the dialer keeps retrying in the background until closed.
    pub fn start(&self, mode: DialMode) -> Result<(), TransportError> {
        let report_rx = {
            let mut task = self.task();
            if task.is_some() {
                return Err(TransportError::Busy);
            }
            if self.core.is_closed() {
                return Err(TransportError::Closed);
            }

            let (report_tx, report_rx) = std::sync::mpsc::sync_channel(1);
            let report = match mode {
                DialMode::Blocking => Some(report_tx),
                DialMode::NonBlocking => None,
            };

            let min = self.reconnect_min.max(RECONNECT_FLOOR);
            let max = self.reconnect_max.max(min);
            *task = Some(self.core.handle.spawn(dial_loop(
                self.core.clone(),
                self.id,
                self.url.clone(),
                self.address.clone(),
                (min, max),
                report,
            )));
            report_rx
        };

        match mode {
            DialMode::Blocking => report_rx.recv().map_err(|_| TransportError::Closed)?,
            DialMode::NonBlocking => Ok(()),
        }
    }

    /// Stop dialing and drop the pipe. Returns once the dial task has finished.
    pub fn close(&self) {
        let Some(task) = self.task().take() else {
            return;
        };
        task.abort();
        // The task is gone once the join completes, so its pipe is detached
        let _ = runtime::block_on(&self.core.handle, async move {
            let _ = task.await;
        });
        debug!("Closed dialer {} for {}", self.id, self.url);
    }
}

impl Drop for Dialer {
    fn drop(&mut self) {
        self.close();
    }
}

async fn dial_loop(
    core: Arc<SocketCore>,
    id: u64,
    url: String,
    address: Address,
    (min, max): (Duration, Duration),
    mut report: Option<SyncSender<Result<(), TransportError>>>,
) {
    let mut backoff = min;

    loop {
        let attempt = async {
            let stream = stream::connect(&address).await?;
            pipe::establish(&core, id, stream).await
        };

        match attempt.await {
            Ok((stream, registration)) => {
                info!("Dialer {} connected to {}", id, url);
                backoff = min;
                if let Some(tx) = report.take() {
                    let _ = tx.send(Ok(()));
                }

                pipe::run(core.clone(), stream, registration).await;
                if core.is_closed() {
                    return;
                }
                debug!("Lost pipe to {}; redialing in {:?}", url, min);
                tokio::select! {
                    _ = tokio::time::sleep(min) => {}
                    _ = core.closed() => return,
                }
            }
            Err(e) => {
                debug!("Failed to dial {}: {}; retrying in {:?}", url, e, backoff);
                if let Some(tx) = report.take() {
                    let _ = tx.send(Err(e));
                }
                if core.is_closed() {
                    return;
                }
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = core.closed() => return,
                }
                backoff = (backoff * 2).min(max);
            }
        }
    }
}
