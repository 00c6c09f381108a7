//! In-process background job queue.
//!
//! Jobs are futures producing JSON. Each gets a UUID task id that callers
//! poll for state and result; a Tokio semaphore bounds how many run at once.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use anchor_core::db::unix_timestamp;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{RwLock, Semaphore, watch};
use tracing::{debug, info, warn};

const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Lifecycle of a job as reported to pollers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Queued, waiting for a permit. Also reported for unknown ids.
    Pending,
    Started,
    Success,
    Failure,
}

impl JobState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Started => "STARTED",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }

    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

/// Errors from the job queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("Job failed: {0}")]
    Failed(String),

    #[error("Job queue has been closed")]
    Closed,
}

struct JobEntry {
    state: JobState,
    outcome: Option<Result<Value, String>>,
    finished_at: Option<i64>,
    done: watch::Receiver<bool>,
}

impl JobEntry {
    fn result(&self) -> Option<Result<Value, JobError>> {
        self.outcome
            .as_ref()
            .map(|o| o.clone().map_err(JobError::Failed))
    }
}

type Entries = Arc<RwLock<HashMap<String, JobEntry>>>;

/// Bounded-concurrency job runner with pollable results.
#[derive(Clone)]
pub struct JobQueue {
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    entries: Entries,
}

impl JobQueue {
    /// Create a queue running at most `max_concurrency` jobs at once (0 picks the default).
    pub fn new(max_concurrency: usize) -> Self {
        let limit = if max_concurrency == 0 {
            DEFAULT_MAX_CONCURRENCY
        } else {
            max_concurrency
        };

        info!(max_concurrency = limit, "Job queue created");

        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            max_concurrency: limit,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub const fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Queue `job` and return its task id.
    ///
    /// A panicking job is recorded as `FAILURE`.
    pub async fn submit<F, E>(&self, kind: &'static str, job: F) -> String
    where
        F: Future<Output = Result<Value, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let id = uuid::Uuid::new_v4().to_string();
        let (done_tx, done_rx) = watch::channel(false);
        self.entries.write().await.insert(
            id.clone(),
            JobEntry {
                state: JobState::Pending,
                outcome: None,
                finished_at: None,
                done: done_rx,
            },
        );
        debug!(task_id = %id, kind, "Job submitted");

        let entries = Arc::clone(&self.entries);
        let semaphore = Arc::clone(&self.semaphore);
        let task_id = id.clone();
        tokio::spawn(async move {
            let outcome = match semaphore.acquire_owned().await {
                Ok(_permit) => {
                    set_state(&entries, &task_id, JobState::Started).await;
                    match tokio::spawn(job).await {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(e) => Err(format!("job panicked: {e}")),
                    }
                }
                Err(_) => Err(JobError::Closed.to_string()),
            };

            let state = if outcome.is_ok() {
                JobState::Success
            } else {
                JobState::Failure
            };
            if let Err(e) = &outcome {
                warn!(task_id = %task_id, kind, error = %e, "Job failed");
            } else {
                debug!(task_id = %task_id, kind, "Job finished");
            }

            if let Some(entry) = entries.write().await.get_mut(&task_id) {
                entry.state = state;
                entry.outcome = Some(outcome);
                entry.finished_at = Some(unix_timestamp());
            }
            let _ = done_tx.send(true);
        });

        id
    }

    /// Current state of a job; unknown ids report `PENDING`.
    pub async fn state(&self, task_id: &str) -> JobState {
        self.entries
            .read()
            .await
            .get(task_id)
            .map_or(JobState::Pending, |e| e.state)
    }

    /// Result of a finished job, or `None` while it is still queued or running.
    pub async fn try_result(&self, task_id: &str) -> Result<Option<Value>, JobError> {
        let entries = self.entries.read().await;
        let entry = entries
            .get(task_id)
            .ok_or_else(|| JobError::UnknownJob(task_id.to_string()))?;
        entry.result().transpose()
    }

    /// Wait for a job to finish and return its result.
    pub async fn result(&self, task_id: &str) -> Result<Value, JobError> {
        let mut done = self
            .entries
            .read()
            .await
            .get(task_id)
            .map(|e| e.done.clone())
            .ok_or_else(|| JobError::UnknownJob(task_id.to_string()))?;

        done.wait_for(|finished| *finished)
            .await
            .map_err(|_| JobError::Closed)?;

        self.entries
            .read()
            .await
            .get(task_id)
            .and_then(JobEntry::result)
            .ok_or_else(|| JobError::UnknownJob(task_id.to_string()))?
    }

    /// Drop finished jobs older than `ttl_secs`. Returns how many were removed.
    pub async fn evict_finished(&self, now: i64, ttl_secs: i64) -> usize {
        let cutoff = now - ttl_secs;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.finished_at.is_none_or(|t| t > cutoff));
        let removed = before - entries.len();
        drop(entries);
        if removed > 0 {
            debug!(removed, "Evicted finished jobs");
        }
        removed
    }

    /// Number of jobs currently tracked.
    pub async fn tracked_count(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENCY)
    }
}

async fn set_state(entries: &Entries, task_id: &str, state: JobState) {
    if let Some(entry) = entries.write().await.get_mut(task_id) {
        entry.state = state;
    }
}
