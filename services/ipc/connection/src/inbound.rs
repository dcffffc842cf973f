//! Receive loop and the polled inbound queue.

use crate::connection::{Connection, Shared};
use ipc_transport::{Aio, AioResult, Socket};
use std::sync::Weak;
use tracing::trace;

/// Completion handler of the receive handle
pub(crate) fn handler(
    shared: Weak<Shared>,
    socket: Socket,
) -> impl Fn(&Aio, AioResult) + Send + Sync + 'static {
    move |aio: &Aio, result: AioResult| {
        if let Some(shared) = shared.upgrade() {
            shared.on_received(aio, &socket, result);
        }
    }
}

impl Shared {
    fn on_received(&self, aio: &Aio, socket: &Socket, result: AioResult) {
        match result {
            AioResult::Recv(Ok(msg)) => {
                let body = msg.into_vec();
                trace!("Queued inbound message of {} bytes", body.len());
                self.inbound().push_back(body);
            }
            AioResult::Recv(Err(e)) => self.transient("receiving inbound message failed", &e),
            AioResult::Send(_) => {}
        }

        if self.is_running() {
            if let Err(e) = socket.recv_async(aio) {
                self.transient("failed to re-arm the receive loop", &e);
            }
        }
    }
}

impl Connection {
    /// Pop the oldest received message, if any. Never blocks.
    pub fn dequeue_received(&self) -> Option<Vec<u8>> {
        self.shared.inbound().pop_front()
    }
}
