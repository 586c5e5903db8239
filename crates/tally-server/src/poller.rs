//! Fixed-cadence loop: aggregate, publish, wait, forever.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tally_core::{ConnectError, Tally};
use tally_store::{Aggregator, Connect, StoreConnector, VoteSource};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::hub::BroadcastHub;

/// Counters shared with the health endpoint.
#[derive(Debug, Default)]
pub struct PollStats {
    ticks: AtomicU64,
    failed: AtomicU64,
    published: AtomicU64,
    last: RwLock<Option<(Tally, DateTime<Utc>)>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PollStatsSnapshot {
    pub ticks: u64,
    pub failed: u64,
    pub published: u64,
    pub last_tally: Option<Tally>,
    pub last_published_at: Option<DateTime<Utc>>,
}

impl PollStats {
    fn record_published(&self, tally: Tally) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.published.fetch_add(1, Ordering::Relaxed);
        *self.last.write() = Some((tally, Utc::now()));
    }

    fn record_failure(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PollStatsSnapshot {
        let last = self.last.read().clone();
        PollStatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            last_published_at: last.as_ref().map(|(_, at)| *at),
            last_tally: last.map(|(tally, _)| tally),
        }
    }
}

/// Drives the aggregator on a fixed cadence and hands each tally to the hub.
pub struct Poller<C: Connect> {
    connector: Arc<StoreConnector<C>>,
    aggregator: Aggregator,
    hub: Arc<BroadcastHub>,
    interval: Duration,
    stats: Arc<PollStats>,
}

impl<C> Poller<C>
where
    C: Connect,
    C::Conn: VoteSource,
{
    pub fn new(
        connector: Arc<StoreConnector<C>>,
        aggregator: Aggregator,
        hub: Arc<BroadcastHub>,
        interval: Duration,
    ) -> Self {
        Self {
            connector,
            aggregator,
            hub,
            interval,
            stats: Arc::new(PollStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PollStats> {
        Arc::clone(&self.stats)
    }

    /// Run until `cancel` fires.
    ///
    /// A failed query only skips that tick's publish. The next tick starts
    /// `interval` after the current result was in hand, whatever it was. The
    /// loop ends early only when a lost connection cannot be re-acquired.
    pub async fn run(self, mut conn: C::Conn, cancel: CancellationToken) -> Result<(), ConnectError> {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            categories = %self.aggregator.categories(),
            "poller started"
        );

        loop {
            let result = self.aggregator.aggregate(&conn).await;
            let handled_at = Instant::now();

            match result {
                Ok(tally) => {
                    let report = self.hub.publish(&tally);
                    debug!(
                        total = tally.total(),
                        delivered = report.delivered,
                        failed = report.failed,
                        "published scores"
                    );
                    self.stats.record_published(tally);
                }
                Err(e) => {
                    self.stats.record_failure();
                    warn!(error = %e, kind = e.error_kind(), "poll query failed, skipping publish");

                    if e.is_connection_lost() {
                        self.connector.mark_disconnected();
                        drop(conn);
                        conn = tokio::select! {
                            _ = cancel.cancelled() => break,
                            acquired = self.connector.acquire() => match acquired {
                                Ok(acquired) => acquired.conn,
                                Err(fatal) => {
                                    error!(error = %fatal, "store lost for good, poller stopping");
                                    return Err(fatal);
                                }
                            },
                        };
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(handled_at + self.interval) => {}
            }
        }

        info!("poller stopped");
        Ok(())
    }
}
