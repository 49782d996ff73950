//! TCP transport

use super::{
    decode_frame, encode_frame, ConnectionHandle, ConnectionId, Inbound, Outgoing, TransportError,
    TransportEvent,
};
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Open a TCP connection to `addr` without driving it yet.
///
/// Owners that need to record a connection before its first event arrives dial
/// first and hand the stream to [`spawn_connection`] once they are ready.
pub async fn dial(addr: &str, timeout: Duration) -> Result<TcpStream, TransportError> {
    tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", addr, e)))
}

/// Connect to a remote endpoint and start driving the connection.
///
/// Events from the peer are delivered to `inbox`; no `Connected` event is sent for
/// outbound connections since the caller already holds the handle.
pub async fn connect(
    addr: &str,
    inbox: mpsc::Sender<Inbound>,
    timeout: Duration,
) -> Result<ConnectionHandle, TransportError> {
    let stream = dial(addr, timeout).await?;
    Ok(spawn_connection(stream, inbox))
}

/// Accept connections forever, announcing each one on `inbox` before any of its events.
pub async fn accept_loop(
    listener: TcpListener,
    inbox: mpsc::Sender<Inbound>,
) -> Result<(), TransportError> {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let handle = ConnectionHandle::new(ConnectionId::next(), tx);
                debug!("New connection {} from {}", handle.id(), peer_addr);

                let id = handle.id();
                if inbox
                    .send(Inbound {
                        conn: id,
                        event: TransportEvent::Connected(handle),
                    })
                    .await
                    .is_err()
                {
                    return Err(TransportError::Closed);
                }
                tokio::spawn(drive(id, stream, rx, inbox.clone()));
            }
            Err(e) => {
                error!("Accept error: {}", e);
            }
        }
    }
}

/// Start a task driving an established stream
pub fn spawn_connection(stream: TcpStream, inbox: mpsc::Sender<Inbound>) -> ConnectionHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = ConnectionHandle::new(ConnectionId::next(), tx);
    tokio::spawn(drive(handle.id(), stream, rx, inbox));
    handle
}

async fn drive(
    id: ConnectionId,
    stream: TcpStream,
    outgoing: mpsc::UnboundedReceiver<Outgoing>,
    inbox: mpsc::Sender<Inbound>,
) {
    // Small control frames should not wait on Nagle
    stream.set_nodelay(true).ok();

    match pump(id, stream, outgoing, &inbox).await {
        Ok(()) => debug!("{} closed", id),
        Err(e) => debug!("{} closed with error: {}", id, e),
    }

    let _ = inbox
        .send(Inbound {
            conn: id,
            event: TransportEvent::Disconnect,
        })
        .await;
}

async fn pump(
    id: ConnectionId,
    mut stream: TcpStream,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    inbox: &mpsc::Sender<Inbound>,
) -> Result<(), TransportError> {
    let (mut read_half, mut write_half) = stream.split();
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    let result = loop {
        tokio::select! {
            read = read_half.read_buf(&mut buf) => {
                match read {
                    Ok(0) => break Ok(()),
                    Ok(_) => {
                        while let Some(envelope) = decode_frame(&mut buf)? {
                            trace!("{} <- {}", id, envelope.event);
                            inbox
                                .send(Inbound { conn: id, event: TransportEvent::Message(envelope) })
                                .await
                                .map_err(|_| TransportError::Closed)?;
                        }
                    }
                    Err(e) => break Err(TransportError::Io(e)),
                }
            }
            cmd = outgoing.recv() => {
                match cmd {
                    Some(Outgoing::Emit(envelope)) => {
                        trace!("{} -> {}", id, envelope.event);
                        let frame = match encode_frame(&envelope) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!("{} dropping {}: {}", id, envelope.event, e);
                                continue;
                            }
                        };
                        write_half.write_all(&frame).await?;
                    }
                    Some(Outgoing::Disconnect) | None => break Ok(()),
                }
            }
        }
    };

    write_half.shutdown().await.ok();
    result
}
