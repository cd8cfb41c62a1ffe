//! Per-connection output path.
//!
//! A [`Session`] is the write-and-close capability of one connection. The
//! timeout guard and the [`Response`] buffer share it; whichever closes the
//! connection first wins and every later close is a no-op.
//!
//! A [`Response`] accumulates `\r\n`-terminated lines and hands them to the
//! session as a single frame, without the trailing terminator, when
//! finished.

use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// Line terminator used on the wire
pub const LINE_TERMINATOR: &[u8] = b"\r\n";

/// Why a connection was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The backend finished its response
    Finished,
    /// No data arrived before the idle deadline
    IdleTimeout,
    /// No query line arrived before the max-wait deadline
    QueryTimeout,
    /// The query line exceeded the configured maximum length
    LineTooLong,
}

/// The single frame written before a connection closes
#[derive(Debug)]
pub struct Outbound {
    pub payload: Bytes,
    pub reason: CloseReason,
}

/// Write-and-close handle for one connection
#[derive(Debug, Clone)]
pub struct Session {
    closed: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Session {
    /// Create a session and the receiver the connection task drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session {
            closed: Arc::new(AtomicBool::new(false)),
            tx,
        };
        (session, rx)
    }

    /// Queue `payload` as the final write and close the connection.
    ///
    /// Returns `false` without sending anything if the session was already
    /// closed.
    pub fn write_and_close(&self, payload: impl Into<Bytes>, reason: CloseReason) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            trace!(?reason, "Session already closed");
            return false;
        }

        // A dropped receiver means the connection is already gone.
        let _ = self.tx.send(Outbound {
            payload: payload.into(),
            reason,
        });
        true
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Line accumulator for one connection's reply
#[derive(Debug)]
pub struct Response {
    session: Option<Session>,
    buffer: BytesMut,
}

impl Response {
    pub fn new(session: Session) -> Self {
        Self {
            session: Some(session),
            buffer: BytesMut::new(),
        }
    }

    /// Append one line.
    pub fn send_line(&mut self, line: &str) {
        self.buffer.extend_from_slice(line.as_bytes());
        self.buffer.extend_from_slice(LINE_TERMINATOR);
    }

    /// Append a `key: value` line.
    pub fn send(&mut self, key: &str, value: &str) {
        self.send_line(&format!("{key}: {value}"));
    }

    /// Flush the accumulated lines as one write and close the connection.
    pub fn finish(mut self) {
        self.flush();
    }

    fn flush(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        let mut payload = std::mem::take(&mut self.buffer);
        if payload.ends_with(LINE_TERMINATOR) {
            payload.truncate(payload.len() - LINE_TERMINATOR.len());
        }

        session.write_and_close(payload.freeze(), CloseReason::Finished);
    }
}

impl Drop for Response {
    // Covers a backend that returns early or panics without finishing.
    fn drop(&mut self) {
        if self.session.is_some() {
            trace!("Flushing unfinished response");
            self.flush();
        }
    }
}
