use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::service::RaceService;

pub const TICK_INTERVAL: Duration = Duration::from_secs(1);
const TOKEN_PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Drive race countdowns and time limits. Expired tokens are dropped
/// along the way.
pub fn start_ticker(service: Arc<RaceService>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_purge = Instant::now();
        loop {
            interval.tick().await;
            match service.tick_all(Utc::now()).await {
                Ok(0) => {}
                Ok(n) => tracing::debug!(changed = n, "ticker advanced races"),
                Err(e) => tracing::error!(error = %e, "ticker failed"),
            }
            if last_purge.elapsed() >= TOKEN_PURGE_INTERVAL {
                last_purge = Instant::now();
                match service.purge_expired_tokens(Utc::now()).await {
                    Ok(n) if n > 0 => tracing::info!(purged = n, "expired tokens purged"),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "token purge failed"),
                }
            }
        }
    })
}
