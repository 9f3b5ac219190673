//! Periodic destination list refresh.

use crate::fetch::{FetchError, ListSource};
use crate::pool::DestinationPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Fetches a new destination list every `period` and swaps it into the pool.
///
/// A failed fetch leaves the pool exactly as it was, so traffic keeps using the
/// last good list (or the DNS fallback if there never was one).
pub struct RefreshScheduler<S> {
    source: S,
    pool: Arc<DestinationPool>,
    period: Duration,
}

impl<S: ListSource> RefreshScheduler<S> {
    pub fn new(source: S, pool: Arc<DestinationPool>, period: Duration) -> Self {
        Self {
            source,
            pool,
            period,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// One fetch-and-swap. Returns the size of the newly installed set; a set
    /// the pool refuses counts as [`FetchError::Empty`].
    pub async fn refresh_once(&self) -> Result<usize, FetchError> {
        let set = self.source.fetch().await?;
        let count = set.len();
        if !self.pool.replace(set) {
            return Err(FetchError::Empty);
        }
        info!(count, "loaded IPv6 destination addresses");
        Ok(count)
    }

    /// Refresh forever. The first tick fires one `period` from now; the initial
    /// load is expected to have been done with [`refresh_once`](Self::refresh_once).
    pub async fn run(self) {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.refresh_once().await {
                Ok(_) => debug!("destination list updated"),
                Err(e) => warn!(error = %e, kind = e.type_name(), "destination list update failed"),
            }
        }
    }
}

impl<S: ListSource + 'static> RefreshScheduler<S> {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
