use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::PersistentStore;

/// Floor for the sweep interval so a near-zero TTL never degenerates into a
/// busy loop.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) fn sweep_interval(ttl: Duration) -> Duration {
    ttl.max(MIN_SWEEP_INTERVAL)
}

/// Background purge of the inactive-song holding area.
///
/// Sweeps immediately on start, then once per TTL, each time bulk-deleting
/// every inactive song older than the TTL. Exits when the root context is
/// cancelled.
pub async fn run(store: Arc<dyn PersistentStore>, ttl: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(sweep_interval(ttl));
    info!("inactive-song janitor started, ttl {ttl:?}");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("inactive-song janitor stopped");
                return;
            }
            _ = ticker.tick() => sweep(store.as_ref(), ttl).await,
        }
    }
}

async fn sweep(store: &dyn PersistentStore, ttl: Duration) {
    let cutoff = SystemTime::now() - ttl;
    match store.remove_inactive_songs_before(cutoff).await {
        Ok(0) => {}
        Ok(removed) => debug!("janitor purged {removed} inactive songs"),
        Err(err) => warn!("janitor sweep failed: {err}"),
    }
}
