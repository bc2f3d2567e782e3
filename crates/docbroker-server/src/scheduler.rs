//! Background triggers: periodic sync, daily publication drain, queue worker and subscription
//! maintenance. Every loop exits when the shutdown channel flips to `true`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, NaiveTime, Utc};
use docbroker_core::{BrokerError, FeedType};
use docbroker_sync::{DeltaSyncEngine, PublicationQueue, WebhookPipeline};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::services::Services;

/// Spawn every background loop enabled in `config`.
pub fn spawn_all(
    services: &Services,
    config: &Config,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();

    if config.sync_interval_secs > 0 {
        tasks.push(tokio::spawn(sync_loop(
            services.engine.clone(),
            Duration::from_secs(config.sync_interval_secs),
            shutdown.clone(),
        )));
    } else {
        info!("  Periodic sync: DISABLED");
    }

    tasks.push(tokio::spawn(drain_loop(
        services.ctx.publications.clone(),
        config.publication_drain_hour,
        shutdown.clone(),
    )));

    tasks.push(tokio::spawn(queue_worker(
        services.pipeline.clone(),
        Duration::from_secs(config.queue_poll_secs.max(1)),
        config.queue_batch_size.max(1),
        shutdown.clone(),
    )));

    tasks.push(tokio::spawn(maintenance_loop(
        services.pipeline.clone(),
        Duration::from_secs(config.subscription_check_hours.max(1) * 3600),
        shutdown,
    )));

    tasks
}

/// Sleep for `duration` unless shutdown comes first. Returns whether shutdown was requested.
async fn wait_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    let changed = tokio::select! {
        _ = tokio::time::sleep(duration) => return false,
        changed = shutdown.changed() => changed,
    };
    changed.is_err() || *shutdown.borrow()
}

/// New, Updated and Deleted in sequence on every tick.
pub async fn sync_loop(
    engine: Arc<DeltaSyncEngine>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Sync loop started (every {}s)", period.as_secs());
    loop {
        for feed in FeedType::ALL {
            if *shutdown.borrow() {
                break;
            }
            match engine.run(feed).await {
                Ok(report) => info!(
                    "Sync {}: {} item(s), {} succeeded, {} deferred, {} skipped, {} failed",
                    feed,
                    report.items.len(),
                    report.succeeded,
                    report.deferred.len(),
                    report.skipped.len(),
                    report.failed.len()
                ),
                Err(BrokerError::AlreadyRunning(_)) => {
                    debug!("Sync {} already running, skipping tick", feed)
                }
                Err(e) => error!("Sync {} failed: {}", feed, e),
            }
        }

        if wait_or_shutdown(period, &mut shutdown).await {
            break;
        }
    }
    info!("Sync loop stopped");
}

/// The next occurrence of `hour`:00 UTC strictly after `now`.
pub fn next_run(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let at = NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or(NaiveTime::MIN);
    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        today
    } else {
        today
            .checked_add_days(Days::new(1))
            .unwrap_or(today)
    }
}

/// Drain the publication queue once a day at `hour` UTC.
pub async fn drain_loop(
    publications: Arc<PublicationQueue>,
    hour: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let now = Utc::now();
        let due = next_run(now, hour);
        info!("Next publication drain at {}", due);
        let wait = (due - now).to_std().unwrap_or_default();
        if wait_or_shutdown(wait, &mut shutdown).await {
            break;
        }

        match publications.drain().await {
            Ok(report) => info!(
                "Publication drain: {} exported, {} postponed, {} failed",
                report.succeeded.len(),
                report.postponed.len(),
                report.failed.len()
            ),
            Err(e) => error!("Publication drain failed: {}", e),
        }
    }
    info!("Publication drain loop stopped");
}

/// Poll the notification queue. A full batch is followed by another poll without waiting.
pub async fn queue_worker(
    pipeline: Arc<WebhookPipeline>,
    poll: Duration,
    batch_size: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Queue worker started (batch {}, poll {}s)", batch_size, poll.as_secs());
    loop {
        if *shutdown.borrow() {
            break;
        }
        match pipeline.drain_queue(batch_size).await {
            Ok(acked) if acked >= batch_size => continue,
            Ok(acked) if acked > 0 => debug!("Processed {} queued batch(es)", acked),
            Ok(_) => {}
            Err(e) => warn!("Queue poll failed: {}", e),
        }
        if wait_or_shutdown(poll, &mut shutdown).await {
            break;
        }
    }
    info!("Queue worker stopped");
}

/// Create missing subscriptions and renew expiring ones.
pub async fn maintenance_loop(
    pipeline: Arc<WebhookPipeline>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        match pipeline.maintain_subscriptions().await {
            Ok(0) => debug!("Subscriptions up to date"),
            Ok(renewed) => info!("Renewed {} subscription(s)", renewed),
            Err(e) => error!("Subscription maintenance failed: {}", e),
        }
        if wait_or_shutdown(period, &mut shutdown).await {
            break;
        }
    }
    info!("Subscription maintenance stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_next_run_later_today() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 3, 30, 0).unwrap();
        assert_eq!(
            next_run(now, 5),
            Utc.with_ymd_and_hms(2024, 6, 1, 5, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_next_run_rolls_to_tomorrow() {
        let now = Utc.with_ymd_and_hms(2024, 6, 30, 5, 0, 0).unwrap();
        assert_eq!(
            next_run(now, 5),
            Utc.with_ymd_and_hms(2024, 7, 1, 5, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_wait_returns_on_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move {
            wait_or_shutdown(Duration::from_secs(3600), &mut rx).await
        });
        tx.send(true).unwrap();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_elapses() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(!wait_or_shutdown(Duration::from_millis(5), &mut rx).await);
    }
}
