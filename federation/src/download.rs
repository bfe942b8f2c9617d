//! Ingests keys published by other national backends.
//!
//! Pages are fetched one at a time for a single date. Every page is
//! validated, split by origin and persisted before the checkpoint moves to
//! its batch tag, so an interrupted run resumes after the last stored page.

use crate::blob_store::{BlobStore, BlobStoreError};
use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::client::{DownloadOutcome, InteropClient, InteropError};
use crate::config::DownloadConfig;
use crate::context::SyncContext;
use crate::events::{Direction, SyncEvent};
use crate::types::{
    BatchTag, ExposureBatch, ExposureDownload, ReportType, StoredTemporaryExposureKeyPayload,
    TestType,
};
use crate::validation::DownloadValidator;
use chrono::{NaiveDate, TimeDelta};
use std::collections::BTreeMap;
use std::sync::Arc;
use url::form_urlencoded::byte_serialize;

#[derive(thiserror::Error, Debug)]
pub enum DownloadError {
    #[error("interop error: {0}")]
    Interop(#[from] InteropError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("could not store keys: {0}")]
    BlobStore(#[from] BlobStoreError),

    #[error("could not serialize keys: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Validates downloaded pages and writes one blob per allowed origin.
pub struct FederatedKeyStore {
    blob_store: Arc<dyn BlobStore>,
    prefix: String,
    valid_origins: Vec<String>,
    context: SyncContext,
}

impl FederatedKeyStore {
    pub fn new(
        blob_store: Arc<dyn BlobStore>,
        prefix: String,
        valid_origins: Vec<String>,
        context: SyncContext,
    ) -> Self {
        FederatedKeyStore {
            blob_store,
            prefix,
            valid_origins,
            context,
        }
    }

    /// Only lab results reported as confirmed tests are federated.
    fn is_accepted_kind(exposure: &ExposureDownload) -> bool {
        exposure.test_type == TestType::LabResult
            && exposure.report_type == ReportType::ConfirmedTest
    }

    fn group_by_origin(batch: &ExposureBatch) -> BTreeMap<&str, Vec<&ExposureDownload>> {
        let mut groups: BTreeMap<&str, Vec<&ExposureDownload>> = BTreeMap::new();
        for exposure in batch.exposures.iter().filter(|e| Self::is_accepted_kind(e)) {
            groups
                .entry(exposure.origin.as_str())
                .or_default()
                .push(exposure);
        }
        groups
    }

    /// Returns the number of blobs written.
    pub async fn accept_batch(&self, batch: &ExposureBatch) -> Result<usize, DownloadError> {
        let now = self.context.clock.now();
        let validator = DownloadValidator::new(now);
        let date = now.format("%Y%m%d").to_string();

        let mut written = 0;
        for (origin, exposures) in Self::group_by_origin(batch) {
            // Statistics cover every origin, including the ones dropped below
            let valid = self.validate_origin_group(&validator, origin, &exposures);

            if !self.valid_origins.iter().any(|allowed| allowed == origin) {
                self.context.events.emit(SyncEvent::InvalidOrigin {
                    origin: origin.into(),
                    batch_tag: batch.batch_tag.clone(),
                    key_count: exposures.len(),
                });
                continue;
            }

            if valid.is_empty() {
                self.context.events.emit(SyncEvent::EmptyOriginSkipped {
                    origin: origin.into(),
                    batch_tag: batch.batch_tag.clone(),
                });
                continue;
            }

            let payload = StoredTemporaryExposureKeyPayload {
                temporary_exposure_keys: valid.into_iter().map(Into::into).collect(),
            };
            let path = self.object_path(origin, &date, &batch.batch_tag);
            self.blob_store
                .put(&path, serde_json::to_vec(&payload)?)
                .await?;
            written += 1;
        }
        Ok(written)
    }

    /// Validates every key once, reporting per test type counts and each
    /// rejection.
    fn validate_origin_group<'a>(
        &self,
        validator: &DownloadValidator,
        origin: &str,
        exposures: &[&'a ExposureDownload],
    ) -> Vec<&'a ExposureDownload> {
        let mut counts: BTreeMap<TestType, (usize, usize)> = BTreeMap::new();
        let mut valid = Vec::new();

        for &exposure in exposures {
            let (accepted, rejected) = counts.entry(exposure.test_type).or_default();
            match validator.validate(exposure) {
                Ok(key) => {
                    *accepted += 1;
                    valid.push(key.into_inner());
                }
                Err(reason) => {
                    *rejected += 1;
                    self.context.events.emit(SyncEvent::InvalidKey {
                        direction: Direction::Download,
                        reason,
                    });
                }
            }
        }

        for (test_type, (accepted, rejected)) in counts {
            self.context.events.emit(SyncEvent::DownloadedKeys {
                origin: origin.into(),
                test_type,
                valid: accepted,
                invalid: rejected,
            });
        }
        valid
    }

    /// The batch tag is gateway controlled, so it is encoded into a single
    /// file name.
    fn object_path(&self, origin: &str, date: &str, batch_tag: &BatchTag) -> String {
        let file_name: String = byte_serialize(batch_tag.as_str().as_bytes()).collect();
        format!("{}/{origin}/{date}/{file_name}.json", self.prefix)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DownloadSettings {
    pub max_subsequent_batch_download_count: usize,
    pub initial_download_history_days: i64,
    pub risk_level_override: Option<i32>,
}

impl From<&DownloadConfig> for DownloadSettings {
    fn from(config: &DownloadConfig) -> Self {
        DownloadSettings {
            max_subsequent_batch_download_count: config.max_subsequent_batch_download_count,
            initial_download_history_days: config.initial_download_history_days,
            risk_level_override: config.risk_level_override(),
        }
    }
}

pub struct DownloadService {
    client: Arc<dyn InteropClient>,
    key_store: FederatedKeyStore,
    checkpoints: Arc<dyn CheckpointStore>,
    settings: DownloadSettings,
    context: SyncContext,
}

impl DownloadService {
    pub fn new(
        client: Arc<dyn InteropClient>,
        key_store: FederatedKeyStore,
        checkpoints: Arc<dyn CheckpointStore>,
        settings: DownloadSettings,
        context: SyncContext,
    ) -> Self {
        DownloadService {
            client,
            key_store,
            checkpoints,
            settings,
            context,
        }
    }

    /// Downloads and stores pages until the gateway has nothing more for the
    /// date or the invocation runs out of budget. Returns the number of pages
    /// processed.
    pub async fn run(&self) -> Result<usize, DownloadError> {
        let (date, mut batch_tag) = self.starting_point().await?;

        let mut processed = 0;
        let mut slowest = TimeDelta::zero();
        loop {
            if processed >= self.settings.max_subsequent_batch_download_count {
                tracing::info!(processed, "Reached the maximum number of pages per invocation");
                break;
            }
            if processed > 0 && slowest >= self.context.remaining.remaining() {
                tracing::warn!(
                    slowest_page_ms = slowest.num_milliseconds(),
                    "There is not enough time to download another page"
                );
                break;
            }

            let started = self.context.clock.now();
            let batch = match self.client.download(date, batch_tag.as_ref()).await? {
                DownloadOutcome::NoContent => break,
                DownloadOutcome::HasBatch(batch) => self.apply_risk_override(batch),
            };

            self.context.events.emit(SyncEvent::DownloadedBatch {
                batch_tag: batch.batch_tag.clone(),
                date,
                exposures: batch.exposures.len(),
            });

            self.key_store.accept_batch(&batch).await?;

            // The next invocation pages forward from the processing date
            let batch_date = self.context.clock.today();
            self.checkpoints
                .set_download_checkpoint(&batch.batch_tag, batch_date)
                .await?;
            self.context
                .events
                .emit(SyncEvent::DownloadCheckpointCommitted {
                    batch_tag: batch.batch_tag.clone(),
                    batch_date,
                });

            processed += 1;
            slowest = slowest.max(self.context.clock.now() - started);
            batch_tag = Some(batch.batch_tag);
        }

        self.context.events.emit(SyncEvent::SyncFinished {
            direction: Direction::Download,
            processed,
        });
        Ok(processed)
    }

    async fn starting_point(&self) -> Result<(NaiveDate, Option<BatchTag>), DownloadError> {
        let (date, batch_tag) = match self.checkpoints.get_download_checkpoint().await? {
            Some(checkpoint) => (checkpoint.batch_date, Some(checkpoint.batch_tag)),
            None => {
                let today = self.context.clock.today();
                let date = u64::try_from(self.settings.initial_download_history_days)
                    .ok()
                    .and_then(|days| today.checked_sub_days(chrono::Days::new(days)))
                    .unwrap_or(NaiveDate::MIN);
                (date, None)
            }
        };

        self.context.events.emit(SyncEvent::DownloadStarted {
            date,
            batch_tag: batch_tag.clone(),
        });
        Ok((date, batch_tag))
    }

    fn apply_risk_override(&self, batch: ExposureBatch) -> ExposureBatch {
        match self.settings.risk_level_override {
            Some(level) => ExposureBatch {
                batch_tag: batch.batch_tag,
                exposures: batch
                    .exposures
                    .into_iter()
                    .map(|exposure| exposure.with_transmission_risk_level(level))
                    .collect(),
            },
            None => batch,
        }
    }
}
