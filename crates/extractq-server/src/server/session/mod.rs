//! Per-connection protocol engine.
//!
//! A connection carries exactly one request. The first frame is either a
//! ping, answered with `pong`, or a place request, which is queued and then
//! relayed message by message from the job's output channel. Every relayed
//! message waits for the client's `ack` before the next is sent.
//!
//! A connection that fails, whether from a write error, a bad
//! acknowledgment or a timeout, is dropped on its own. The job it was
//! relaying keeps running so the chunks still end up in the cache.

use crate::server::scheduler::{Job, JobEvent, SHUTTING_DOWN, Scheduler, output_channel};
use core::time::Duration;
use extractq_core::{ACK, ClientMessage, NetstringCodec, ServerMessage};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::Instrument;

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub max_frame_bytes: usize,
    /// `None` waits for acknowledgments indefinitely.
    pub ack_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: extractq_core::DEFAULT_MAX_FRAME_BYTES,
            ack_timeout: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] extractq_core::Error),

    #[error("Client disconnected while an acknowledgment was pending")]
    Disconnected,

    #[error("No acknowledgment within {0:?}")]
    AckTimeout(Duration),
}

type Connection<S> = Framed<S, NetstringCodec>;

/// Serves one client connection to completion. Failures are logged and end
/// only this connection.
pub async fn handle_connection<S>(
    stream: S,
    client: SocketAddr,
    scheduler: Scheduler,
    config: SessionConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let span = tracing::info_span!("session", %client);
    async move {
        tracing::debug!("Connection opened");
        match run_session(stream, client, &scheduler, config).await {
            Ok(()) => tracing::debug!("Connection closed"),
            Err(e) => tracing::warn!(error = %e, "Connection dropped"),
        }
    }
    .instrument(span)
    .await;
}

async fn run_session<S>(
    stream: S,
    client: SocketAddr,
    scheduler: &Scheduler,
    config: SessionConfig,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = Framed::new(
        stream,
        NetstringCodec::with_max_frame_bytes(config.max_frame_bytes),
    );

    let request = match conn.next().await {
        None => return Ok(()),
        Some(Err(e)) => {
            tracing::warn!(error = %e, "Unreadable request frame");
            return send_final(&mut conn, &ServerMessage::error(format!("invalid frame: {e}")))
                .await;
        }
        Some(Ok(payload)) => match ClientMessage::decode(&payload) {
            Ok(ClientMessage::Ping) => {
                return send_final(&mut conn, &ServerMessage::Pong).await;
            }
            Ok(ClientMessage::Place(request)) => request,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed request");
                return send_final(&mut conn, &ServerMessage::error(rejection(&e))).await;
            }
        },
    };

    let (output, mut events) = output_channel();
    let chunks = request.chunks.len();
    let job_id = scheduler.submit(Job::new(request, output, client));
    tracing::info!(job_id, chunks, "Request queued");

    send_acked(&mut conn, &ServerMessage::Connected, config.ack_timeout).await?;

    let mut failed = false;
    loop {
        match events.recv().await {
            Some(JobEvent::Message(message)) => {
                failed |= matches!(message, ServerMessage::Error { .. });
                send_acked(&mut conn, &message, config.ack_timeout).await?;
            }
            Some(JobEvent::Finished) if failed => return Ok(()),
            Some(JobEvent::Finished) => return send_final(&mut conn, &ServerMessage::Done).await,
            None => {
                return send_final(&mut conn, &ServerMessage::error(SHUTTING_DOWN)).await;
            }
        }
    }
}

fn rejection(e: &extractq_core::Error) -> String {
    match e {
        extractq_core::Error::Json(_) => "invalid JSON".to_string(),
        extractq_core::Error::InvalidRequest { reason } => format!("invalid request: {reason}"),
        other => other.to_string(),
    }
}

/// Sends a message that ends the conversation; no acknowledgment is read.
async fn send_final<S>(conn: &mut Connection<S>, message: &ServerMessage) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.send(message.to_bytes()?).await?;
    Ok(())
}

async fn send_acked<S>(
    conn: &mut Connection<S>,
    message: &ServerMessage,
    ack_timeout: Option<Duration>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.send(message.to_bytes()?).await?;

    let reply = match ack_timeout {
        Some(limit) => tokio::time::timeout(limit, conn.next())
            .await
            .map_err(|_| SessionError::AckTimeout(limit))?,
        None => conn.next().await,
    };

    match reply {
        Some(Ok(frame)) if frame.as_ref() == ACK => Ok(()),
        Some(Ok(frame)) => Err(extractq_core::Error::AckViolation {
            got: String::from_utf8_lossy(&frame).into_owned(),
        }
        .into()),
        Some(Err(e)) => Err(e.into()),
        None => Err(SessionError::Disconnected),
    }
}
