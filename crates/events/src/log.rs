use crate::publisher::EventPublisher;
use serde::Serialize;
use std::sync::Arc;
use wagate_core::error::{Error, Result};
use wagate_core::event::{Event, EventFilter, MAX_EVENT_QUERY_LIMIT};
use wagate_core::repos::EventRepository;

/// Hard cap on events loaded by a single replay call.
pub const REPLAY_CAP: i64 = MAX_EVENT_QUERY_LIMIT;

#[derive(Debug, Clone, Serialize)]
pub struct ReplayOutcome {
    pub found: usize,
    pub replayed: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Query and replay surface over the durable event log.
pub struct EventLogService {
    repo: Arc<dyn EventRepository>,
}

impl EventLogService {
    pub fn new(repo: Arc<dyn EventRepository>) -> Self {
        Self { repo }
    }

    pub async fn get(&self, id: &str) -> Result<Event> {
        self.repo.get(id).await
    }

    /// Newest first, limit clamped to 1..=1000 (default 100).
    pub async fn list(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        let query = filter.validate()?;
        self.repo.list(&query).await
    }

    pub async fn count(&self, filter: &EventFilter) -> Result<i64> {
        let query = filter.validate()?;
        self.repo.count(&query).await
    }

    /// Re-publish matching events through the substrate. The filter must be
    /// scoped (session, type or time bound) and at most [`REPLAY_CAP`] events
    /// load per call. Replayed events are not written back into the log.
    pub async fn replay(
        &self,
        filter: &EventFilter,
        dry_run: bool,
        publisher: &EventPublisher,
    ) -> Result<ReplayOutcome> {
        if !filter.has_scope() {
            return Err(Error::validation(
                "replay requires at least one of session_id, event_type, since, until",
            ));
        }
        let mut query = filter.validate()?;
        query.limit = filter.limit.unwrap_or(REPLAY_CAP).min(REPLAY_CAP);

        let events = self.repo.list(&query).await?;
        let found = events.len();
        if dry_run {
            return Ok(ReplayOutcome {
                found,
                replayed: 0,
                failed: 0,
                last_error: None,
            });
        }

        let mut replayed = 0usize;
        for event in events {
            publisher.publish_replayed(event).await;
            replayed += 1;
        }
        Ok(ReplayOutcome {
            found,
            replayed,
            failed: found - replayed,
            last_error: None,
        })
    }
}
