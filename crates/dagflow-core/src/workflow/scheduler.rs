//! Cron scheduler wrapping `tokio-cron-scheduler` for cron triggers.
//!
//! Provides:
//! - Cron expression normalization (5-field, 6-field, or human-readable)
//! - Next-fire computation and missed-run detection via `croner`
//! - Per-trigger job lifecycle (schedule, unschedule, start, stop)

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dagflow_types::error::EngineError;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler error: {0}")]
    JobError(String),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
}

impl From<SchedulerError> for EngineError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::InvalidSchedule(_) => EngineError::InvalidArgument(e.to_string()),
            SchedulerError::JobError(_) => EngineError::Internal(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Expression handling
// ---------------------------------------------------------------------------

/// Normalize a schedule string to a 6-field cron expression (with seconds).
///
/// Supported patterns (case-insensitive):
/// - "*/5 * * * *"          -> "0 */5 * * * *"
/// - "30 */5 * * * *"       -> unchanged
/// - "every N seconds"      -> "*/N * * * * *"
/// - "every N minutes"      -> "0 */N * * * *"
/// - "every N hours"        -> "0 0 */N * * *"
/// - "every minute" / "minutely", "every hour" / "hourly", "every day" / "daily"
/// - "every day at HH:MM"   -> "0 MM HH * * *"
pub fn normalize_schedule(input: &str) -> Result<String, SchedulerError> {
    let trimmed = input.trim();
    let invalid = || SchedulerError::InvalidSchedule(input.to_string());

    let parts: Vec<&str> = trimmed.split_whitespace().collect();
    match parts.len() {
        5 => return Ok(format!("0 {}", parts.join(" "))),
        6 => return Ok(parts.join(" ")),
        _ => {}
    }

    let lower = trimmed.to_lowercase();
    match lower.as_str() {
        "every minute" | "minutely" => return Ok("0 * * * * *".to_string()),
        "every hour" | "hourly" => return Ok("0 0 * * * *".to_string()),
        "every day" | "daily" => return Ok("0 0 0 * * *".to_string()),
        _ => {}
    }

    let Some(rest) = lower.strip_prefix("every ") else {
        return Err(SchedulerError::InvalidSchedule(format!(
            "unrecognized schedule format: '{trimmed}'"
        )));
    };

    if let Some(at) = rest.strip_prefix("day at ") {
        let (h, m) = at.split_once(':').ok_or_else(invalid)?;
        let hour: u32 = h.trim().parse().map_err(|_| invalid())?;
        let minute: u32 = m.trim().parse().map_err(|_| invalid())?;
        if hour < 24 && minute < 60 {
            return Ok(format!("0 {minute} {hour} * * *"));
        }
        return Err(invalid());
    }

    let words: Vec<&str> = rest.split_whitespace().collect();
    if let [n, unit] = words.as_slice() {
        let n: u32 = n.parse().map_err(|_| invalid())?;
        if n == 0 {
            return Err(SchedulerError::InvalidSchedule(
                "interval must be > 0".to_string(),
            ));
        }
        return match unit.trim_end_matches('s') {
            "second" => Ok(format!("*/{n} * * * * *")),
            "minute" => Ok(format!("0 */{n} * * * *")),
            "hour" => Ok(format!("0 0 */{n} * * *")),
            _ => Err(invalid()),
        };
    }

    Err(invalid())
}

fn parse_cron(expr: &str) -> Result<croner::Cron, SchedulerError> {
    let normalized = normalize_schedule(expr)?;
    normalized
        .parse::<croner::Cron>()
        .map_err(|e| SchedulerError::InvalidSchedule(format!("{expr}: {e}")))
}

/// Validate a schedule string without scheduling it.
pub fn validate_schedule(expr: &str) -> Result<(), SchedulerError> {
    parse_cron(expr).map(|_| ())
}

/// The first fire time strictly after `after`.
pub fn next_fire_time(expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, SchedulerError> {
    parse_cron(expr)?
        .iter_after(after)
        .next()
        .ok_or_else(|| SchedulerError::InvalidSchedule(format!("{expr}: never fires")))
}

/// The most recent fire time after `last_fired` and strictly before `now`,
/// or `None` when nothing was missed. Searches backwards from `now`, so the
/// cost does not depend on how long the engine was down.
pub fn latest_missed_fire(expr: &str, last_fired: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let cron = parse_cron(expr).ok()?;
    let latest = cron.find_previous_occurrence(&now, false).ok()?;
    (latest > last_fired).then_some(latest)
}

// ---------------------------------------------------------------------------
// CronScheduler
// ---------------------------------------------------------------------------

/// Callback invoked when a trigger's cron fires: `(trigger_id, fired_at)`.
pub type CronCallback =
    Arc<dyn Fn(i64, DateTime<Utc>) -> futures_util::future::BoxFuture<'static, ()> + Send + Sync>;

struct ScheduledTrigger {
    job_id: Uuid,
    cron_expr: String,
}

/// Cron scheduler that wraps `tokio-cron-scheduler::JobScheduler`, one job
/// per active cron trigger.
pub struct CronScheduler {
    inner: Arc<RwLock<Option<JobScheduler>>>,
    triggers: Arc<RwLock<HashMap<i64, ScheduledTrigger>>>,
}

impl CronScheduler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
            triggers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start the scheduler. Must be called before scheduling triggers.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| SchedulerError::JobError(e.to_string()))?;
        scheduler
            .start()
            .await
            .map_err(|e| SchedulerError::JobError(e.to_string()))?;

        *self.inner.write().await = Some(scheduler);
        tracing::info!("cron scheduler started");
        Ok(())
    }

    /// Stop the scheduler and forget all jobs.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if let Some(mut scheduler) = self.inner.write().await.take() {
            scheduler
                .shutdown()
                .await
                .map_err(|e| SchedulerError::JobError(e.to_string()))?;
            tracing::info!("cron scheduler stopped");
        }
        self.triggers.write().await.clear();
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.inner.read().await.is_some()
    }

    /// Schedule `trigger_id` on `schedule`, replacing any existing job for it.
    pub async fn schedule_trigger(
        &self,
        trigger_id: i64,
        schedule: &str,
        callback: CronCallback,
    ) -> Result<(), SchedulerError> {
        let cron_expr = normalize_schedule(schedule)?;

        let inner = self.inner.read().await;
        let scheduler = inner
            .as_ref()
            .ok_or_else(|| SchedulerError::JobError("scheduler not started".to_string()))?;

        let mut triggers = self.triggers.write().await;
        if let Some(existing) = triggers.get(&trigger_id) {
            if existing.cron_expr == cron_expr {
                return Ok(());
            }
            scheduler
                .remove(&existing.job_id)
                .await
                .map_err(|e| SchedulerError::JobError(e.to_string()))?;
        }

        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _lock| {
            let cb = callback.clone();
            Box::pin(async move {
                let now = Utc::now();
                tracing::debug!(trigger_id, %now, "cron trigger fired");
                cb(trigger_id, now).await;
            })
        })
        .map_err(|e| SchedulerError::InvalidSchedule(e.to_string()))?;

        let job_id = job.guid();
        scheduler
            .add(job)
            .await
            .map_err(|e| SchedulerError::JobError(e.to_string()))?;
        triggers.insert(trigger_id, ScheduledTrigger { job_id, cron_expr });

        tracing::info!(trigger_id, %job_id, "cron trigger scheduled");
        Ok(())
    }

    /// Remove a trigger's job. Returns `false` when it was not scheduled.
    pub async fn unschedule_trigger(&self, trigger_id: i64) -> Result<bool, SchedulerError> {
        let Some(entry) = self.triggers.write().await.remove(&trigger_id) else {
            return Ok(false);
        };
        if let Some(scheduler) = self.inner.read().await.as_ref() {
            scheduler
                .remove(&entry.job_id)
                .await
                .map_err(|e| SchedulerError::JobError(e.to_string()))?;
        }
        tracing::info!(trigger_id, "cron trigger unscheduled");
        Ok(true)
    }

    pub async fn scheduled_count(&self) -> usize {
        self.triggers.read().await.len()
    }
}

impl Default for CronScheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
