//! Publishes local submissions to the federation gateway.
//!
//! Each iteration loads the submissions newer than the checkpoint, uploads
//! their keys as one signed batch and then moves the checkpoint to the newest
//! submission time seen. The loop stops once it has caught up, when the batch
//! cap is reached or when another iteration would not fit in the invocation.

use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::client::{InteropClient, InteropError};
use crate::config::{UPLOAD_BATCH_SAFETY_MARGIN, UploadConfig};
use crate::context::SyncContext;
use crate::events::{Direction, SyncEvent};
use crate::submissions::{ExposureUploadFactory, SubmissionError, SubmissionRepository};
use crate::types::{ExposureKey, TestType};
use crate::validation::validate_upload;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum UploadError {
    #[error("interop error: {0}")]
    Interop(#[from] InteropError),

    #[error("could not load submissions: {0}")]
    Submissions(#[from] SubmissionError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("loaded submissions have no submission time")]
    MissingSubmissionTime,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UploadSettings {
    pub max_subsequent_batch_upload_count: usize,
    pub initial_upload_history_days: i64,
    /// 0 selects legacy unlimited mode.
    pub max_upload_batch_size: usize,
    pub risk_level_override: Option<i32>,
}

impl From<&UploadConfig> for UploadSettings {
    fn from(config: &UploadConfig) -> Self {
        UploadSettings {
            max_subsequent_batch_upload_count: config.max_subsequent_batch_upload_count,
            initial_upload_history_days: config.initial_upload_history_days,
            max_upload_batch_size: config.max_upload_batch_size,
            risk_level_override: config.risk_level_override(),
        }
    }
}

impl UploadSettings {
    pub fn is_legacy_unlimited(&self) -> bool {
        self.max_upload_batch_size == 0
    }

    /// Submissions loaded per iteration before timestamp grouping.
    pub fn batch_limit(&self) -> usize {
        if self.is_legacy_unlimited() {
            usize::MAX
        } else {
            self.max_upload_batch_size
                .saturating_sub(UPLOAD_BATCH_SAFETY_MARGIN)
        }
    }

    /// Hard cap on submissions loaded per iteration.
    pub fn max_results(&self) -> usize {
        if self.is_legacy_unlimited() {
            usize::MAX
        } else {
            self.max_upload_batch_size
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    LegacyUnlimited,
    CheckpointUnchanged,
    CaughtUp,
    MaxIterations,
    TimeBudget,
}

/// Outcome of one upload iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IterationResult {
    pub last_uploaded_submission_time: DateTime<Utc>,
    pub submission_count: usize,
}

/// Running totals across iterations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Progress {
    pub since: DateTime<Utc>,
    pub submission_count: usize,
    pub iterations: usize,
    pub slowest_iteration: TimeDelta,
}

impl Progress {
    fn start(since: DateTime<Utc>) -> Self {
        Progress {
            since,
            submission_count: 0,
            iterations: 0,
            slowest_iteration: TimeDelta::zero(),
        }
    }

    fn record(self, result: &IterationResult, elapsed: TimeDelta) -> Self {
        Progress {
            since: result.last_uploaded_submission_time,
            submission_count: self.submission_count + result.submission_count,
            iterations: self.iterations + 1,
            slowest_iteration: self.slowest_iteration.max(elapsed),
        }
    }
}

/// Decides whether another iteration should run. `before` is the checkpoint
/// the finished iteration started from; conditions are checked in order.
pub fn next_step(
    settings: &UploadSettings,
    before: DateTime<Utc>,
    result: &IterationResult,
    progress: &Progress,
    remaining: TimeDelta,
) -> Option<StopReason> {
    if settings.is_legacy_unlimited() {
        Some(StopReason::LegacyUnlimited)
    } else if result.last_uploaded_submission_time == before {
        Some(StopReason::CheckpointUnchanged)
    } else if result.submission_count < settings.batch_limit() {
        Some(StopReason::CaughtUp)
    } else if progress.iterations >= settings.max_subsequent_batch_upload_count {
        Some(StopReason::MaxIterations)
    } else if progress.slowest_iteration >= remaining {
        Some(StopReason::TimeBudget)
    } else {
        None
    }
}

pub struct UploadService {
    client: Arc<dyn InteropClient>,
    submissions: Arc<dyn SubmissionRepository>,
    checkpoints: Arc<dyn CheckpointStore>,
    factory: ExposureUploadFactory,
    settings: UploadSettings,
    context: SyncContext,
}

impl UploadService {
    pub fn new(
        client: Arc<dyn InteropClient>,
        submissions: Arc<dyn SubmissionRepository>,
        checkpoints: Arc<dyn CheckpointStore>,
        factory: ExposureUploadFactory,
        settings: UploadSettings,
        context: SyncContext,
    ) -> Self {
        UploadService {
            client,
            submissions,
            checkpoints,
            factory,
            settings,
            context,
        }
    }

    /// Uploads until caught up or out of budget. Returns the number of
    /// submissions processed.
    pub async fn run(&self) -> Result<usize, UploadError> {
        let mut progress = Progress::start(self.starting_point().await?);

        let reason = loop {
            let started = self.context.clock.now();
            let result = self.upload_one_batch(progress.since).await?;
            let elapsed = self.context.clock.now() - started;

            let before = progress.since;
            progress = progress.record(&result, elapsed);

            let remaining = self.context.remaining.remaining();
            if let Some(reason) = next_step(&self.settings, before, &result, &progress, remaining)
            {
                break reason;
            }
        };

        if reason == StopReason::TimeBudget {
            tracing::warn!(
                slowest_iteration_ms = progress.slowest_iteration.num_milliseconds(),
                "There is not enough time to complete another upload iteration"
            );
        }
        tracing::debug!(?reason, iterations = progress.iterations, "Upload loop stopped");

        self.context.events.emit(SyncEvent::SyncFinished {
            direction: Direction::Upload,
            processed: progress.submission_count,
        });
        Ok(progress.submission_count)
    }

    async fn starting_point(&self) -> Result<DateTime<Utc>, UploadError> {
        let checkpoint = self.checkpoints.get_upload_checkpoint().await?;
        let from_checkpoint = checkpoint.is_some();
        let since = match checkpoint {
            Some(checkpoint) => checkpoint.last_uploaded_submission_time,
            None => {
                let now = self.context.clock.now();
                TimeDelta::try_days(self.settings.initial_upload_history_days)
                    .and_then(|history| now.checked_sub_signed(history))
                    .unwrap_or(DateTime::<Utc>::MIN_UTC)
            }
        };

        self.context.events.emit(SyncEvent::UploadStarted {
            since,
            from_checkpoint,
        });
        Ok(since)
    }

    async fn upload_one_batch(
        &self,
        since: DateTime<Utc>,
    ) -> Result<IterationResult, UploadError> {
        let submissions = self
            .submissions
            .load_all_submissions(since, self.settings.batch_limit(), self.settings.max_results())
            .await?;

        if submissions.is_empty() {
            tracing::info!(%since, "No submissions to upload");
            return Ok(IterationResult {
                last_uploaded_submission_time: since,
                submission_count: 0,
            });
        }

        let newest = submissions
            .iter()
            .map(|submission| submission.submission_time)
            .max()
            .ok_or(UploadError::MissingSubmissionTime)?;

        let keys: Vec<ExposureKey> = submissions
            .iter()
            .flat_map(|submission| self.factory.create(submission))
            .filter_map(|key| self.validate(key))
            .collect();

        if keys.is_empty() {
            tracing::info!(
                submissions = submissions.len(),
                "Submissions contained no valid keys"
            );
        } else {
            let outcome = self.client.upload(&keys).await?;
            if outcome.inserted_exposures < keys.len() as u64 {
                self.context.events.emit(SyncEvent::UploadIncomplete {
                    sent: keys.len(),
                    inserted: outcome.inserted_exposures,
                });
            }
            self.emit_uploaded_keys(&keys);
        }

        self.checkpoints.set_upload_checkpoint(newest).await?;
        self.context
            .events
            .emit(SyncEvent::UploadCheckpointCommitted {
                last_uploaded_submission_time: newest,
            });

        Ok(IterationResult {
            last_uploaded_submission_time: newest,
            submission_count: submissions.len(),
        })
    }

    fn validate(&self, key: ExposureKey) -> Option<ExposureKey> {
        match validate_upload(key) {
            Ok(valid) => {
                let key = valid.into_inner();
                Some(match self.settings.risk_level_override {
                    Some(level) => key.with_transmission_risk_level(level),
                    None => key,
                })
            }
            Err(reason) => {
                self.context.events.emit(SyncEvent::InvalidKey {
                    direction: Direction::Upload,
                    reason,
                });
                None
            }
        }
    }

    fn emit_uploaded_keys(&self, keys: &[ExposureKey]) {
        let mut by_test_type: BTreeMap<TestType, usize> = BTreeMap::new();
        for key in keys {
            *by_test_type.entry(key.test_type).or_default() += 1;
        }
        for (test_type, count) in by_test_type {
            self.context
                .events
                .emit(SyncEvent::UploadedKeys { test_type, count });
        }
    }
}
