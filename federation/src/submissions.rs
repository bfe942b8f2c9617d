//! Local mobile submissions, the source of outbound keys.

use crate::types::{
    ExposureKey, ReportType, StoredTemporaryExposureKeyPayload, Submission, TestType,
};
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(thiserror::Error, Debug)]
pub enum SubmissionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("could not parse submission {object_key}: {source}")]
    Parse {
        object_key: String,
        source: serde_json::Error,
    },

    #[error("item limit needs to be greater than 0")]
    InvalidLimit,

    #[error("submission loader failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("submission store is poisoned")]
    Poisoned,
}

#[async_trait]
pub trait SubmissionRepository: Send + Sync {
    /// Submissions strictly newer than `since_exclusive`, oldest first, bounded
    /// by [`limit_by_submission_time`].
    async fn load_all_submissions(
        &self,
        since_exclusive: DateTime<Utc>,
        item_limit: usize,
        max_results: usize,
    ) -> Result<Vec<Submission>, SubmissionError>;
}

/// Sorts by submission time and keeps the first `item_limit` entries. Entries
/// sharing the timestamp of the last one kept are kept too, so a timestamp is
/// never split across two loads, but never more than `max_results` in total.
pub fn limit_by_submission_time<T, F>(
    mut items: Vec<T>,
    item_limit: usize,
    max_results: usize,
    submission_time: F,
) -> Result<Vec<T>, SubmissionError>
where
    F: Fn(&T) -> DateTime<Utc>,
{
    if item_limit == 0 {
        return Err(SubmissionError::InvalidLimit);
    }

    items.sort_by_key(|item| submission_time(item));

    let mut limited = Vec::new();
    let mut last_time = None;
    for item in items {
        if limited.len() >= max_results {
            break;
        }
        let time = submission_time(&item);
        if limited.len() >= item_limit && last_time != Some(time) {
            break;
        }
        last_time = Some(time);
        limited.push(item);
    }
    Ok(limited)
}

/// Turns local submissions into outbound keys for one region.
#[derive(Clone, Debug)]
pub struct ExposureUploadFactory {
    region: String,
}

impl ExposureUploadFactory {
    pub fn new<S: Into<String>>(region: S) -> Self {
        ExposureUploadFactory {
            region: region.into(),
        }
    }

    pub fn create(&self, submission: &Submission) -> Vec<ExposureKey> {
        let test_type = submission
            .object_key
            .split('/')
            .find_map(TestType::from_path_segment)
            .unwrap_or(TestType::LabResult);
        let report_type = match test_type {
            TestType::LabResult => ReportType::ConfirmedTest,
            _ => ReportType::Unknown,
        };

        submission
            .payload
            .temporary_exposure_keys
            .iter()
            .map(|key| ExposureKey {
                key_data: key.key.clone(),
                rolling_start_number: key.rolling_start_number,
                transmission_risk_level: key.transmission_risk,
                rolling_period: key.rolling_period,
                regions: vec![self.region.clone()],
                test_type,
                report_type,
                days_since_onset: key.days_since_onset_of_symptoms,
            })
            .collect()
    }
}

/// Reads submissions stored as JSON files below a root directory. The object
/// key is the `/` separated path relative to the root and the submission time
/// is the file modification time.
pub struct FilesystemSubmissionRepository {
    root: PathBuf,
    prefixes: Vec<String>,
}

impl FilesystemSubmissionRepository {
    /// Only object keys starting with one of `prefixes` are eligible.
    pub fn new<P: Into<PathBuf>>(root: P, prefixes: Vec<String>) -> Self {
        FilesystemSubmissionRepository {
            root: root.into(),
            prefixes,
        }
    }
}

struct Candidate {
    path: PathBuf,
    object_key: String,
    modified: DateTime<Utc>,
}

fn collect_candidates(
    root: &Path,
    dir: &Path,
    prefixes: &[String],
    since_exclusive: DateTime<Utc>,
    out: &mut Vec<Candidate>,
) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            collect_candidates(root, &path, prefixes, since_exclusive, out)?;
            continue;
        }

        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let object_key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if !prefixes.iter().any(|prefix| object_key.starts_with(prefix)) {
            continue;
        }

        // Checkpoints keep whole seconds
        let modified = DateTime::<Utc>::from(metadata.modified()?).trunc_subsecs(0);
        if modified > since_exclusive {
            out.push(Candidate {
                path,
                object_key,
                modified,
            });
        }
    }
    Ok(())
}

fn load_from_disk(
    root: &Path,
    prefixes: &[String],
    since_exclusive: DateTime<Utc>,
    item_limit: usize,
    max_results: usize,
) -> Result<Vec<Submission>, SubmissionError> {
    let mut candidates = Vec::new();
    match collect_candidates(root, root, prefixes, since_exclusive, &mut candidates) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    }

    let candidates =
        limit_by_submission_time(candidates, item_limit, max_results, |c| c.modified)?;

    candidates
        .into_iter()
        .map(|candidate| {
            let bytes = std::fs::read(&candidate.path)?;
            let payload: StoredTemporaryExposureKeyPayload = serde_json::from_slice(&bytes)
                .map_err(|source| SubmissionError::Parse {
                    object_key: candidate.object_key.clone(),
                    source,
                })?;
            Ok(Submission {
                submission_time: candidate.modified,
                object_key: candidate.object_key,
                payload,
            })
        })
        .collect()
}

#[async_trait]
impl SubmissionRepository for FilesystemSubmissionRepository {
    async fn load_all_submissions(
        &self,
        since_exclusive: DateTime<Utc>,
        item_limit: usize,
        max_results: usize,
    ) -> Result<Vec<Submission>, SubmissionError> {
        let root = self.root.clone();
        let prefixes = self.prefixes.clone();

        let submissions = tokio::task::spawn_blocking(move || {
            load_from_disk(&root, &prefixes, since_exclusive, item_limit, max_results)
        })
        .await??;

        tracing::debug!(count = submissions.len(), %since_exclusive, "Loaded submissions");
        Ok(submissions)
    }
}

/// Holds submissions in memory and applies the same filtering and limiting as
/// the filesystem repository.
#[derive(Default)]
pub struct InMemorySubmissionRepository {
    submissions: Mutex<Vec<Submission>>,
}

impl InMemorySubmissionRepository {
    pub fn new(submissions: Vec<Submission>) -> Self {
        InMemorySubmissionRepository {
            submissions: Mutex::new(submissions),
        }
    }
}

#[async_trait]
impl SubmissionRepository for InMemorySubmissionRepository {
    async fn load_all_submissions(
        &self,
        since_exclusive: DateTime<Utc>,
        item_limit: usize,
        max_results: usize,
    ) -> Result<Vec<Submission>, SubmissionError> {
        let newer = self
            .submissions
            .lock()
            .map_err(|_| SubmissionError::Poisoned)?
            .iter()
            .filter(|s| s.submission_time > since_exclusive)
            .cloned()
            .collect();
        limit_by_submission_time(newer, item_limit, max_results, |s| s.submission_time)
    }
}
