//! Connection dispatcher.
//!
//! One query per connection:
//!
//! 1. arm the timeout guard at accept
//! 2. read until the first line terminator (or end of stream)
//! 3. latch the guard, parse the line, run the backend on the blocking pool
//! 4. write the single outbound frame and shut the socket down
//!
//! Whatever follows the first line is never read.

use crate::backend::Backend;
use crate::protocol;
use crate::response::{CloseReason, Outbound, Response, Session};
use crate::stats::ServerStats;
use crate::timeout::{TimeoutGuard, Timeouts};
use crate::timer::Scheduler;
use bytes::BytesMut;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, trace};

/// Initial read buffer size
const BUFFER_SIZE: usize = 256;

/// Notice written when the query line exceeds the configured limit
pub const LINE_TOO_LONG_NOTICE: &str = "Query line too long";

/// Everything a connection needs from the server
pub struct ConnectionContext {
    pub timeouts: Timeouts,
    pub max_line_length: usize,
    pub scheduler: Arc<dyn Scheduler>,
    pub backend: Arc<dyn Backend>,
    pub stats: Arc<ServerStats>,
}

/// Outcome of reading the query line
#[derive(Debug, PartialEq, Eq)]
enum QueryLine {
    Complete(String),
    TooLong,
    /// Peer closed before sending anything
    Eof,
}

/// Handle a single client connection
pub async fn handle_connection<S>(stream: S, ctx: Arc<ConnectionContext>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (session, mut outbound) = Session::new();
    let guard = TimeoutGuard::arm(ctx.timeouts, ctx.scheduler.as_ref(), session.clone());

    let frame = tokio::select! {
        // A timer closed the connection before a query arrived.
        frame = outbound.recv() => frame,

        line = read_query(&mut reader, &guard, ctx.max_line_length) => match line? {
            QueryLine::Complete(line) => {
                if guard.query_received() {
                    dispatch(&line, session, &ctx).await;
                }
                outbound.recv().await
            }
            QueryLine::TooLong => {
                session.write_and_close(LINE_TOO_LONG_NOTICE, CloseReason::LineTooLong);
                outbound.recv().await
            }
            QueryLine::Eof => {
                trace!("Connection closed by client");
                return Ok(());
            }
        },
    };

    if let Some(Outbound { payload, reason }) = frame {
        ctx.stats.record_close(reason);
        writer.write_all(&payload).await?;
    }
    writer.shutdown().await
}

/// Parse the query and run the backend off the I/O threads.
async fn dispatch(line: &str, session: Session, ctx: &ConnectionContext) {
    let request = protocol::parse(line);
    debug!(%request, "Query received");
    ctx.stats.query_received();

    let backend = Arc::clone(&ctx.backend);
    let response = Response::new(session);
    let lookup = tokio::task::spawn_blocking(move || backend.lookup(&request, response));

    // A panicking backend drops its Response, which still flushes.
    if let Err(e) = lookup.await {
        error!(error = %e, "Backend lookup failed");
    }
}

/// Read up to the first `\n`, or to end of stream.
async fn read_query<R>(
    reader: &mut R,
    guard: &TimeoutGuard,
    max_line_length: usize,
) -> io::Result<QueryLine>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

    loop {
        if let Some(end) = buffer.iter().position(|&b| b == b'\n') {
            let line = strip_cr(&buffer[..end]);
            if line.len() > max_line_length {
                return Ok(QueryLine::TooLong);
            }
            return Ok(QueryLine::Complete(decode_line(line)));
        }

        // A trailing `\r` may belong to the terminator still in flight.
        if strip_cr(&buffer).len() > max_line_length {
            return Ok(QueryLine::TooLong);
        }

        let n = reader.read_buf(&mut buffer).await?;
        if n == 0 {
            return Ok(if buffer.is_empty() {
                QueryLine::Eof
            } else {
                QueryLine::Complete(decode_line(&buffer))
            });
        }
        guard.data_received();
    }
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Drop an optional `\r` and decode, replacing invalid bytes.
fn decode_line(line: &[u8]) -> String {
    String::from_utf8_lossy(strip_cr(line)).into_owned()
}
