use std::time::Duration;

use protocol::{
    error::HandshakeError,
    handshake::{Handshake, HANDSHAKE_LEN},
};
use tokio::{
    io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};

/// Outbound side: send our handshake first, then wait for the reply.
pub async fn exchange_handshake<S>(
    stream: &mut S,
    local: &Handshake,
    handshake_timeout: Duration,
) -> Result<Handshake, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&local.serialize()).await?;
    stream.flush().await?;

    let remote = read_handshake(stream, handshake_timeout).await?;
    remote.verify(&local.info_hash)?;

    Ok(remote)
}

/// Inbound side: read the remote handshake, check it names our torrent, then reply.
pub async fn accept_handshake<S>(
    stream: &mut S,
    local: &Handshake,
    handshake_timeout: Duration,
) -> Result<Handshake, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let remote = read_handshake(stream, handshake_timeout).await?;
    remote.verify(&local.info_hash)?;

    stream.write_all(&local.serialize()).await?;
    stream.flush().await?;

    Ok(remote)
}

async fn read_handshake<S>(
    stream: &mut S,
    handshake_timeout: Duration,
) -> Result<Handshake, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = [0u8; HANDSHAKE_LEN];
    match timeout(handshake_timeout, stream.read_exact(&mut buffer)).await {
        Ok(Ok(_)) => Handshake::deserialize(&buffer),
        Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Err(HandshakeError::InvalidLength)
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(HandshakeError::Timeout),
    }
}
