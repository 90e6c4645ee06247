//! Bidirectional byte pump between a client and a backend.
//!
//! Two copy loops run concurrently, each with a fixed-size buffer. End of
//! stream on one side is forwarded as a write shutdown to the other side.
//!
//! The backend finishing (EOF or error) ends the whole pipe, so a client
//! that keeps its socket open cannot pin the connection. A client EOF only
//! half-closes: the backend may keep answering for as long as its replies
//! keep moving, and a reply stream idle for the linger period ends the pipe.
//! An I/O error in either direction tears the whole pipe down.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

/// Size of the copy buffer used for each direction.
pub const PIPE_BUFFER_SIZE: usize = 4096;

/// How long a backend may stay silent after the client half-closed.
pub const HALF_CLOSE_LINGER: Duration = Duration::from_secs(30);

/// Outcome of a finished pipe.
#[derive(Debug, Default)]
pub struct PipeReport {
    /// Bytes copied client → backend.
    pub to_backend: u64,
    /// Bytes copied backend → client.
    pub to_client: u64,
    /// Error in the client → backend direction.
    pub to_backend_error: Option<io::Error>,
    /// Error in the backend → client direction. Cleared when the client had
    /// already closed its side cleanly.
    pub to_client_error: Option<io::Error>,
    /// The backend went silent for the linger period after the client
    /// half-closed.
    pub lingered_out: bool,
}

impl PipeReport {
    pub fn is_clean(&self) -> bool {
        self.to_backend_error.is_none() && self.to_client_error.is_none()
    }
}

async fn copy_half<R, W>(reader: &mut R, writer: &mut W, copied: &AtomicU64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PIPE_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            if let Err(e) = writer.shutdown().await {
                tracing::trace!(error = %e, "Shutdown after EOF failed");
            }
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        copied.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Copy bytes both ways with [`HALF_CLOSE_LINGER`].
pub async fn pipe<C, B>(client: C, backend: B) -> PipeReport
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    pipe_with_linger(client, backend, HALF_CLOSE_LINGER).await
}

/// Copy bytes both ways until the backend side finishes, either side fails,
/// or the backend stays silent for `linger` after the client half-closed.
pub async fn pipe_with_linger<C, B>(client: C, backend: B, linger: Duration) -> PipeReport
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_r, mut client_w) = tokio::io::split(client);
    let (mut backend_r, mut backend_w) = tokio::io::split(backend);
    let to_backend = AtomicU64::new(0);
    let to_client = AtomicU64::new(0);

    let mut upstream_result = None;
    let mut downstream_result = None;
    let mut lingered_out = false;
    {
        let upstream = copy_half(&mut client_r, &mut backend_w, &to_backend);
        let downstream = copy_half(&mut backend_r, &mut client_w, &to_client);
        tokio::pin!(upstream, downstream);

        // Set once the client half-closed: (deadline, bytes seen at last check).
        let mut lingering: Option<(Instant, u64)> = None;

        loop {
            let deadline = lingering.map_or_else(Instant::now, |(at, _)| at);
            tokio::select! {
                result = &mut upstream, if upstream_result.is_none() => {
                    let failed = result.is_err();
                    upstream_result = Some(result);
                    if failed {
                        break;
                    }
                    lingering = Some((Instant::now() + linger, to_client.load(Ordering::Relaxed)));
                }
                result = &mut downstream => {
                    downstream_result = Some(result);
                    break;
                }
                _ = tokio::time::sleep_until(deadline), if lingering.is_some() => {
                    let seen = to_client.load(Ordering::Relaxed);
                    match lingering {
                        Some((_, last)) if last == seen => {
                            lingered_out = true;
                            break;
                        }
                        _ => lingering = Some((Instant::now() + linger, seen)),
                    }
                }
            }
        }
    }

    let client_closed_cleanly = matches!(upstream_result, Some(Ok(())));
    PipeReport {
        to_backend: to_backend.load(Ordering::Relaxed),
        to_client: to_client.load(Ordering::Relaxed),
        to_backend_error: upstream_result.and_then(Result::err),
        to_client_error: if client_closed_cleanly {
            None
        } else {
            downstream_result.and_then(Result::err)
        },
        lingered_out,
    }
}
