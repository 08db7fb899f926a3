//! Minimal async client for the relay protocol.
//!
//! A [`Connection`] wraps any byte stream in a [`NetstringCodec`] and speaks
//! the client side of the acknowledgment handshake. The relay closes the
//! connection after each request, so one `Connection` serves exactly one
//! request.

use crate::{ACK, ClientMessage, Error, NetstringCodec, Result, ServerMessage};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;

pub struct Connection<S> {
    framed: Framed<S, NetstringCodec>,
}

impl Connection<TcpStream> {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream))
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            framed: Framed::new(stream, NetstringCodec::new()),
        }
    }

    pub async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        self.send_raw(message.to_bytes()?).await
    }

    /// Sends an arbitrary payload as one frame.
    pub async fn send_raw(&mut self, payload: impl Into<Bytes>) -> Result<()> {
        self.framed.send(payload.into()).await
    }

    pub async fn ack(&mut self) -> Result<()> {
        self.send_raw(ACK).await
    }

    /// Reads the next server message, or `None` once the server has closed
    /// the connection.
    pub async fn recv(&mut self) -> Result<Option<ServerMessage>> {
        match self.framed.next().await {
            Some(frame) => Ok(Some(ServerMessage::from_slice(&frame?)?)),
            None => Ok(None),
        }
    }

    /// Reads the next server message and acknowledges it if required.
    ///
    /// Acknowledging an `error` is best effort: when the error answers an
    /// undecodable request the server has already hung up.
    pub async fn recv_and_ack(&mut self) -> Result<Option<ServerMessage>> {
        let Some(message) = self.recv().await? else {
            return Ok(None);
        };
        match &message {
            ServerMessage::Error { .. } => {
                let _ = self.ack().await;
            }
            m if m.requires_ack() => self.ack().await?,
            _ => {}
        }
        Ok(Some(message))
    }

    /// Sends `message` and collects every reply until the server closes the
    /// connection or sends a terminal message.
    pub async fn run(&mut self, message: &ClientMessage) -> Result<Vec<ServerMessage>> {
        self.send(message).await?;
        let mut replies = Vec::new();
        loop {
            match self.recv_and_ack().await {
                Ok(Some(reply)) => {
                    let terminal = reply.is_terminal();
                    replies.push(reply);
                    if terminal {
                        break;
                    }
                }
                Ok(None) => break,
                // The server may hang up right after an error frame.
                Err(Error::Io(_)) if matches!(replies.last(), Some(ServerMessage::Error { .. })) => {
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(replies)
    }
}
