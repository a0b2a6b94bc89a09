//! Supervised periodic reaper task

use crate::reaper::sweeper::ExpiryReaper;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Handle to a running reaper loop
pub struct ReaperTask {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl ReaperTask {
    /// Run `reaper.sweep()` every `interval` plus up to `jitter` of random delay
    pub fn spawn(reaper: Arc<ExpiryReaper>, interval: Duration, jitter: Duration) -> Self {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let handle = tokio::spawn(async move {
            info!(
                "Expiry reaper started ({}s interval, up to {}s jitter)",
                interval.as_secs(),
                jitter.as_secs()
            );

            loop {
                let delay = interval + random_jitter(jitter);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }

                let report = reaper.sweep().await;
                debug!("Reaper pass finished: {:?}", report);
            }

            info!("Expiry reaper stopped");
        });

        Self { shutdown, handle }
    }

    /// Whether the loop has exited
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the loop and wait for it to exit
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            warn!("Expiry reaper task ended abnormally: {}", e);
        }
    }
}

fn random_jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let millis = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::InMemoryActivityFeed;
    use crate::metrics::MetricsCollector;
    use crate::reaper::sweeper::ReaperConfig;
    use crate::store::{InMemoryMatchStore, RequestStore};
    use crate::types::{MatchRequest, RequestStatus};
    use chrono::{Duration as ChronoDuration, Utc};

    #[test]
    fn test_jitter_is_bounded() {
        assert_eq!(random_jitter(Duration::ZERO), Duration::ZERO);
        for _ in 0..100 {
            assert!(random_jitter(Duration::from_millis(50)) <= Duration::from_millis(50));
        }
    }

    #[tokio::test]
    async fn test_task_sweeps_and_stops() {
        let store = Arc::new(InMemoryMatchStore::new());
        let stale = MatchRequest::pending("alice", None, Utc::now() - ChronoDuration::hours(1));
        store.insert_request(stale.clone()).unwrap();

        let reaper = Arc::new(ExpiryReaper::new(
            store.clone(),
            Arc::new(InMemoryActivityFeed::new()),
            ReaperConfig::default(),
            Arc::new(MetricsCollector::default()),
        ));

        let task = ReaperTask::spawn(reaper, Duration::from_millis(10), Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!task.is_finished());
        task.stop().await;

        assert_eq!(
            store.get_request(stale.id).unwrap().unwrap().status,
            RequestStatus::Expired
        );
    }
}
