//! Send queue, drained one message at a time.
//!
//! `sending` is the drain token. It is only tested or changed together with
//! the queue under the outbound lock, so exactly one party drains at a time:
//! either the `send` call that found the pipeline idle or the completion
//! handler of the previous send.

use crate::connection::{Connection, Shared};
use crate::error::IpcError;
use ipc_transport::{Aio, AioResult, Socket};
use ipc_wire::Message;
use std::sync::atomic::Ordering;
use std::sync::Weak;
use tracing::trace;

/// Completion handler of the send handle
pub(crate) fn handler(
    shared: Weak<Shared>,
    socket: Socket,
    max_message_size: usize,
) -> impl Fn(&Aio, AioResult) + Send + Sync + 'static {
    move |aio: &Aio, result: AioResult| {
        if let Some(shared) = shared.upgrade() {
            shared.on_sent(aio, &socket, max_message_size, result);
        }
    }
}

impl Shared {
    fn on_sent(&self, aio: &Aio, socket: &Socket, limit: usize, result: AioResult) {
        // Handle of a stopped run; the drain token belongs to whoever runs now
        if aio.is_canceled() {
            trace!("Ignoring completion of a canceled send handle");
            return;
        }
        // The undelivered message is dropped with the result
        if let AioResult::Send(Err((_, e))) = &result {
            self.transient("sending outbound message failed", e);
        }
        self.pump(aio, socket, limit);
    }

    /// Hand `msg` to the transport; false if it was refused outright
    fn submit(&self, aio: &Aio, socket: &Socket, msg: Message) -> bool {
        match socket.send_async(aio, msg) {
            Ok(()) => true,
            Err((_, e)) => {
                self.transient("sending outbound message failed", &e);
                false
            }
        }
    }

    /// Issue the next queued message, or release the drain token when the
    /// queue is empty or the connection is stopping. Messages that cannot be
    /// turned into a transport message are skipped. A canceled handle never
    /// drains.
    fn pump(&self, aio: &Aio, socket: &Socket, limit: usize) {
        loop {
            let next = {
                let mut queue = self.outbound();
                if aio.is_canceled() {
                    return;
                }
                let next = if self.is_running() {
                    queue.pop_front()
                } else {
                    None
                };
                match next {
                    Some(next) => next,
                    None => {
                        self.sending.store(false, Ordering::SeqCst);
                        return;
                    }
                }
            };

            match Message::from_payload(&next, limit) {
                Ok(msg) => {
                    trace!("Sending queued message of {} bytes", msg.len());
                    if self.submit(aio, socket, msg) {
                        return;
                    }
                }
                Err(e) => self.warn(
                    "message allocation failed while sending an outbound message",
                    Some(&e),
                ),
            }
        }
    }

    fn send(&self, payload: &[u8]) -> Result<(), IpcError> {
        let (io, first) = {
            let mut queue = self.outbound();
            // Looked up under the queue lock: `stop` takes the handles before
            // it clears the queue, so these always belong to this queue's run
            let io = match self.io() {
                Some(io) if self.is_running() => io,
                _ => {
                    drop(queue);
                    let err = IpcError::NotRunning;
                    self.error("cannot send on a stopped connection", Some(&err));
                    return Err(err);
                }
            };
            queue.push_back(payload.to_vec());
            if self.sending.load(Ordering::SeqCst) {
                return Ok(());
            }
            self.sending.store(true, Ordering::SeqCst);
            (io, queue.pop_front())
        };
        // The queue was empty while idle, so this is the payload just pushed
        let Some(first) = first else {
            return Ok(());
        };

        match Message::from_payload(&first, io.max_message_size) {
            Ok(msg) => {
                if !self.submit(&io.out_aio, &io.socket, msg) {
                    self.pump(&io.out_aio, &io.socket, io.max_message_size);
                }
                Ok(())
            }
            Err(e) => {
                self.warn(
                    "message allocation failed while sending an outbound message",
                    Some(&e),
                );
                // Others may have queued behind us meanwhile
                self.pump(&io.out_aio, &io.socket, io.max_message_size);
                Err(e.into())
            }
        }
    }
}

impl Connection {
    /// Queue a copy of `payload` for sending.
    ///
    /// Messages reach the transport in call order with at most one send in
    /// flight. Returns `Ok` once queued; a payload larger than the configured
    /// maximum that would have been sent straight away is rejected here, one
    /// that was queued behind others is dropped with a warning when its turn
    /// comes.
    pub fn send(&self, payload: impl AsRef<[u8]>) -> Result<(), IpcError> {
        self.shared.send(payload.as_ref())
    }
}
