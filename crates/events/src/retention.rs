use chrono::{Duration as ChronoDuration, Local, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info};
use wagate_core::error::{Error, Result};
use wagate_core::repos::EventRepository;

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// 0 disables deletion entirely.
    pub retention_days: u32,
    pub cleanup_interval: Duration,
    /// Local wall-clock "HH:MM" after which the daily run fires.
    pub cleanup_time: String,
}

pub fn parse_cleanup_time(raw: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .map_err(|e| Error::validation(format!("invalid cleanup_time {:?}", raw)).with_source(e))
}

/// Deletes events past the retention horizon. The tick loop checks on
/// `cleanup_interval`, but deletion fires at most once per day, at or after
/// the configured wall-clock time.
pub struct RetentionJob {
    repo: Arc<dyn EventRepository>,
    retention_days: u32,
    cleanup_interval: Duration,
    cleanup_time: NaiveTime,
    last_run_day: StdMutex<Option<NaiveDate>>,
}

impl RetentionJob {
    pub fn new(repo: Arc<dyn EventRepository>, config: &RetentionConfig) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            repo,
            retention_days: config.retention_days,
            cleanup_interval: config.cleanup_interval.max(Duration::from_secs(1)),
            cleanup_time: parse_cleanup_time(&config.cleanup_time)?,
            last_run_day: StdMutex::new(None),
        }))
    }

    /// Whether the daily run should fire at `now` (local wall clock).
    fn is_due(&self, now: NaiveDateTime) -> bool {
        if self.retention_days == 0 {
            return false;
        }
        if now.time() < self.cleanup_time {
            return false;
        }
        *self.last_run_day.lock().unwrap() != Some(now.date())
    }

    async fn run_once(&self, today: NaiveDate) {
        let cutoff = Utc::now() - ChronoDuration::days(self.retention_days as i64);
        match self.repo.delete_older_than(cutoff).await {
            Ok(removed) => {
                *self.last_run_day.lock().unwrap() = Some(today);
                info!(removed, cutoff = %cutoff, "event retention cleanup completed");
            }
            Err(e) => {
                // Leave last_run_day untouched so the next tick retries.
                error!(error = %e, "event retention cleanup failed");
            }
        }
    }

    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if self.retention_days == 0 {
                info!("event retention disabled (retention_days = 0)");
                return;
            }
            info!(
                retention_days = self.retention_days,
                cleanup_time = %self.cleanup_time,
                "event retention job started"
            );
            let mut ticker = interval(self.cleanup_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = Local::now().naive_local();
                        if self.is_due(now) {
                            self.run_once(now.date()).await;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("event retention job stopped");
                            return;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use wagate_core::event::{Event, EventFilter, EventType};
    use wagate_persistence::memory::MemoryEventRepository;

    fn job(retention_days: u32, cleanup_time: &str) -> (Arc<RetentionJob>, Arc<MemoryEventRepository>) {
        let repo = Arc::new(MemoryEventRepository::new());
        let job = RetentionJob::new(
            repo.clone(),
            &RetentionConfig {
                retention_days,
                cleanup_interval: Duration::from_secs(60),
                cleanup_time: cleanup_time.into(),
            },
        )
        .unwrap();
        (job, repo)
    }

    fn at(date: &str, time: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(&format!("{} {}", date, time), "%Y-%m-%d %H:%M")
            .unwrap()
    }

    #[test]
    fn cleanup_time_parsing() {
        assert!(parse_cleanup_time("03:00").is_ok());
        assert!(parse_cleanup_time("23:59").is_ok());
        assert!(parse_cleanup_time("24:00").is_err());
        assert!(parse_cleanup_time("3 am").is_err());
        assert!(parse_cleanup_time("").is_err());
    }

    #[test]
    fn fires_once_per_day_at_or_after_configured_time() {
        let (job, _repo) = job(30, "03:00");
        assert!(!job.is_due(at("2026-08-01", "02:59")));
        assert!(job.is_due(at("2026-08-01", "03:00")));
        assert!(job.is_due(at("2026-08-01", "17:45")));

        *job.last_run_day.lock().unwrap() = Some(at("2026-08-01", "03:00").date());
        assert!(!job.is_due(at("2026-08-01", "23:00")));
        // next day it is due again
        assert!(job.is_due(at("2026-08-02", "03:01")));
    }

    #[test]
    fn zero_retention_disables() {
        let (job, _repo) = job(0, "03:00");
        assert!(!job.is_due(at("2026-08-01", "12:00")));
    }

    #[tokio::test]
    async fn run_once_deletes_past_horizon_only() {
        let (job, repo) = job(30, "03:00");

        let mut old = Event::new(EventType::MessageReceived, "s1", &serde_json::json!({}));
        old.timestamp = Utc::now() - ChronoDuration::days(45);
        repo.create(&old).await.unwrap();
        let fresh = Event::new(EventType::MessageReceived, "s1", &serde_json::json!({}));
        repo.create(&fresh).await.unwrap();

        job.run_once(Local::now().date_naive()).await;

        let all = EventFilter::default().validate().unwrap();
        let remaining = repo.list(&all).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, fresh.id);
        assert!(job.last_run_day.lock().unwrap().is_some());
    }
}
