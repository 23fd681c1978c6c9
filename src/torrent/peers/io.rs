use std::{error::Error, fmt::Display, time::Duration};

use protocol::{
    error::MessageError,
    message::{check_length_prefix, Message},
};
use tokio::{
    io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::torrent::events::Event;

use super::{keep_alive::KeepAliveTimer, link::LinkError};

/// Spawns the reader and writer tasks for an established connection.
///
/// The reader decodes frames and posts them to `event_tx` until the stream fails,
/// goes silent for `read_timeout`, or the queue is gone. The writer drains `out_rx`
/// one frame at a time and resets the keep-alive timer after every successful write.
/// Either side reports a failure as `Event::PeerClosed`.
pub fn spawn<S>(
    stream: S,
    session_id: Uuid,
    out_rx: mpsc::UnboundedReceiver<Message>,
    event_tx: mpsc::UnboundedSender<Event>,
    read_timeout: Duration,
    keep_alive: KeepAliveTimer,
) -> (JoinHandle<()>, JoinHandle<()>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = io::split(stream);

    let reader = tokio::spawn(read_loop(read_half, session_id, event_tx.clone(), read_timeout));
    let writer = tokio::spawn(write_loop(
        write_half,
        session_id,
        out_rx,
        event_tx,
        keep_alive,
    ));

    (reader, writer)
}

async fn read_loop<R>(
    mut read_half: R,
    session_id: Uuid,
    event_tx: mpsc::UnboundedSender<Event>,
    read_timeout: Duration,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let result = match timeout(read_timeout, read_message(&mut read_half)).await {
            Ok(result) => result,
            Err(_) => Err(IoError::Timeout),
        };

        match result {
            Ok(message) => {
                trace!(%session_id, ?message, "Received peer message");
                if event_tx
                    .send(Event::PeerMessage {
                        session_id,
                        message,
                    })
                    .is_err()
                {
                    debug!(%session_id, "Event queue closed, stopping reader");
                    return;
                }
            }
            Err(e) => {
                debug!(%session_id, error = %e, "Reader stopped");
                let _ = event_tx.send(Event::PeerClosed {
                    session_id,
                    error: LinkError::Io(e),
                });
                return;
            }
        }
    }
}

async fn write_loop<W>(
    mut write_half: W,
    session_id: Uuid,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
    event_tx: mpsc::UnboundedSender<Event>,
    keep_alive: KeepAliveTimer,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = out_rx.recv().await {
        if let Err(e) = write_message(&mut write_half, &message).await {
            warn!(%session_id, error = %e, "Failed to send message");
            let _ = event_tx.send(Event::PeerClosed {
                session_id,
                error: LinkError::Io(e),
            });
            return;
        }
        keep_alive.reset();
    }

    let _ = write_half.shutdown().await;
}

/// Reads one length-prefixed frame.
///
/// A zero prefix yields KeepAlive without consuming anything past the prefix.
pub async fn read_message<T>(read_half: &mut T) -> Result<Message, IoError>
where
    T: AsyncRead + Unpin,
{
    let mut length_buffer = [0u8; 4];
    read_exact(read_half, &mut length_buffer).await?;

    let message_length = check_length_prefix(u32::from_be_bytes(length_buffer))?;
    if message_length == 0 {
        return Ok(Message::KeepAlive);
    }

    let mut body = vec![0u8; message_length];
    read_exact(read_half, &mut body).await?;

    Ok(Message::from_body(&body)?)
}

pub async fn write_message<T>(write_half: &mut T, message: &Message) -> Result<(), IoError>
where
    T: AsyncWrite + Unpin,
{
    write_half.write_all(&message.serialize()).await?;
    write_half.flush().await?;

    Ok(())
}

async fn read_exact<T>(read_half: &mut T, buf: &mut [u8]) -> Result<(), IoError>
where
    T: AsyncRead + Unpin,
{
    match read_half.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(IoError::IncompleteMessage),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug)]
pub enum IoError {
    Message(MessageError),
    IncompleteMessage,
    Timeout,
    Io(io::Error),
}

impl IoError {
    /// True when the peer sent bytes that do not form a valid frame.
    pub fn is_protocol(&self) -> bool {
        matches!(self, IoError::Message(_))
    }
}

impl Display for IoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoError::Message(err) => write!(f, "Message error: {}", err),
            IoError::IncompleteMessage => {
                write!(f, "Connection closed before reading full message")
            }
            IoError::Timeout => write!(f, "Peer was silent for too long"),
            IoError::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl From<MessageError> for IoError {
    fn from(err: MessageError) -> Self {
        IoError::Message(err)
    }
}

impl From<io::Error> for IoError {
    fn from(err: io::Error) -> Self {
        IoError::Io(err)
    }
}

impl Error for IoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            IoError::Message(err) => Some(err),
            IoError::Io(err) => Some(err),
            _ => None,
        }
    }
}
