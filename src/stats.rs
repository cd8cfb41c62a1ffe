//! Server statistics, published as a managed object.
//!
//! The counters are read live each time the statistics object is queried,
//! e.g. `fingerd:type=Server,name=Statistics@localhost`.

use crate::directory::{DirectoryError, ManagedObject, ObjectName};
use crate::response::CloseReason;
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Name under which the statistics object is registered
pub const STATISTICS_OBJECT: &str = "fingerd:type=Server,name=Statistics";

/// Connection and query counters
#[derive(Debug)]
pub struct ServerStats {
    started_at: DateTime<Utc>,
    accepted: AtomicU64,
    active: AtomicU64,
    queries: AtomicU64,
    idle_timeouts: AtomicU64,
    query_timeouts: AtomicU64,
    oversized_lines: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started_at: Utc::now(),
            accepted: AtomicU64::new(0),
            active: AtomicU64::new(0),
            queries: AtomicU64::new(0),
            idle_timeouts: AtomicU64::new(0),
            query_timeouts: AtomicU64::new(0),
            oversized_lines: AtomicU64::new(0),
        })
    }

    pub fn connection_opened(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn query_received(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    /// Count how a connection ended. Timeouts are expected and logged at info.
    pub fn record_close(&self, reason: CloseReason) {
        match reason {
            CloseReason::Finished => {}
            CloseReason::IdleTimeout => {
                info!("Connection closed due to idle timeout");
                self.idle_timeouts.fetch_add(1, Ordering::Relaxed);
            }
            CloseReason::QueryTimeout => {
                info!("Connection closed due to query timeout");
                self.query_timeouts.fetch_add(1, Ordering::Relaxed);
            }
            CloseReason::LineTooLong => {
                info!("Connection closed due to oversized query line");
                self.oversized_lines.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    pub fn idle_timeouts(&self) -> u64 {
        self.idle_timeouts.load(Ordering::Relaxed)
    }

    pub fn query_timeouts(&self) -> u64 {
        self.query_timeouts.load(Ordering::Relaxed)
    }

    pub fn oversized_lines(&self) -> u64 {
        self.oversized_lines.load(Ordering::Relaxed)
    }

    /// Managed object exposing these counters.
    pub fn managed_object(self: &Arc<Self>) -> Result<ManagedObject, DirectoryError> {
        let started_at = self
            .started_at
            .to_rfc3339_opts(SecondsFormat::Secs, true);

        let object = ManagedObject::new(ObjectName::parse(STATISTICS_OBJECT)?)
            .with_attribute("StartTime", started_at)
            .with_computed("UptimeSeconds", {
                let stats = Arc::clone(self);
                move || Ok((Utc::now() - stats.started_at).num_seconds().to_string())
            });

        let counters: [(&str, fn(&ServerStats) -> u64); 6] = [
            ("ConnectionsAccepted", ServerStats::accepted),
            ("ActiveConnections", ServerStats::active),
            ("QueriesReceived", ServerStats::queries),
            ("IdleTimeouts", ServerStats::idle_timeouts),
            ("QueryTimeouts", ServerStats::query_timeouts),
            ("OversizedLines", ServerStats::oversized_lines),
        ];

        Ok(counters.into_iter().fold(object, |object, (name, read)| {
            let stats = Arc::clone(self);
            object.with_computed(name, move || Ok(read(&stats).to_string()))
        }))
    }
}
