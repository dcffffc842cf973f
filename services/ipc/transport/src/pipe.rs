//! Pipes: one handshaken stream between two sockets.

use crate::socket::{Outbox, PipeRegistration, SocketCore};
use crate::stream::IoStream;
use crate::TransportError;
use bytes::BytesMut;
use ipc_wire::{encode_frame, FrameDecoder, Handshake, Message, Protocol, HANDSHAKE_SIZE};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Time allowed for the peer to answer our handshake
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Exchange handshake headers and check the peer's protocol
pub(crate) async fn handshake(
    mut stream: IoStream,
    protocol: Protocol,
) -> Result<IoStream, TransportError> {
    let exchange = async {
        stream
            .write_all(&Handshake::new(protocol).to_bytes())
            .await?;
        let mut raw = [0u8; HANDSHAKE_SIZE];
        stream.read_exact(&mut raw).await?;
        Handshake::decode(&raw)?.verify_peer(protocol)?;
        Ok::<_, TransportError>(())
    };

    tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange)
        .await
        .map_err(|_| TransportError::TimedOut)??;
    Ok(stream)
}

/// Handshake `stream` and attach it to the socket on behalf of `endpoint`
pub(crate) async fn establish(
    core: &Arc<SocketCore>,
    endpoint: u64,
    stream: IoStream,
) -> Result<(IoStream, PipeRegistration), TransportError> {
    let stream = handshake(stream, core.protocol).await?;
    let registration = core.attach_pipe(endpoint)?;
    Ok((stream, registration))
}

/// Move frames until either direction fails or the socket closes
pub(crate) async fn run(core: Arc<SocketCore>, stream: IoStream, mut registration: PipeRegistration) {
    let peer = stream.peer();
    let id = registration.id;
    let limit = registration.recv_limit;
    let (reader, writer) = tokio::io::split(stream);

    let result = tokio::select! {
        r = read_loop(reader, core.recv_tx.clone(), limit) => r,
        r = write_loop(writer, &mut registration.outbox) => r,
        _ = core.closed() => Ok(()),
    };

    match result {
        Ok(()) => debug!("Pipe {} to {} finished", id, peer),
        Err(e) => debug!("Pipe {} to {} dropped: {}", id, peer, e),
    }
}

async fn read_loop<R>(
    mut reader: R,
    inbound: mpsc::Sender<Message>,
    limit: usize,
) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::with_limit(limit);
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        while let Some(msg) = decoder.decode(&mut buf)? {
            trace!("Received frame of {} bytes", msg.len());
            inbound.send(msg).await.map_err(|_| TransportError::Closed)?;
        }
        if reader.read_buf(&mut buf).await? == 0 {
            return Err(TransportError::ConnectionReset);
        }
    }
}

async fn write_loop<W>(mut writer: W, outbox: &mut Outbox) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = outbox.next().await {
        writer.write_all(&encode_frame(msg.body())).await?;
        writer.flush().await?;
        trace!("Sent frame of {} bytes", msg.len());
    }
    Ok(())
}
