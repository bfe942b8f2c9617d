//! Structured event stream for sync invocations.
//!
//! Engines report what happened through [`Events`] rather than logging
//! directly, so that tests can assert on the exact sequence of events.

use crate::metrics_defs::{
    DOWNLOAD_BATCHES, DOWNLOAD_KEYS_ACCEPTED, DOWNLOAD_KEYS_REJECTED, DOWNLOAD_ORIGIN_REJECTED,
    UPLOAD_BATCHES, UPLOAD_INCOMPLETE, UPLOAD_KEYS, UPLOAD_KEYS_REJECTED,
};
use crate::types::{BatchTag, TestType};
use crate::validation::RejectionReason;
use chrono::{DateTime, NaiveDate, Utc};
use shared::counter;
use std::fmt;
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    OutgoingHttpRequest {
        method: &'static str,
        url: String,
        status: u16,
    },
    UnprocessableJson {
        url: String,
        error: String,
    },
    InvalidKey {
        direction: Direction,
        reason: RejectionReason,
    },
    UploadStarted {
        since: DateTime<Utc>,
        from_checkpoint: bool,
    },
    UploadedKeys {
        test_type: TestType,
        count: usize,
    },
    UploadIncomplete {
        sent: usize,
        inserted: u64,
    },
    UploadCheckpointCommitted {
        last_uploaded_submission_time: DateTime<Utc>,
    },
    DownloadStarted {
        date: NaiveDate,
        batch_tag: Option<BatchTag>,
    },
    DownloadedBatch {
        batch_tag: BatchTag,
        date: NaiveDate,
        exposures: usize,
    },
    DownloadedKeys {
        origin: String,
        test_type: TestType,
        valid: usize,
        invalid: usize,
    },
    InvalidOrigin {
        origin: String,
        batch_tag: BatchTag,
        key_count: usize,
    },
    EmptyOriginSkipped {
        origin: String,
        batch_tag: BatchTag,
    },
    DownloadCheckpointCommitted {
        batch_tag: BatchTag,
        batch_date: NaiveDate,
    },
    SyncDisabled {
        direction: Direction,
        workspace: String,
    },
    SyncFinished {
        direction: Direction,
        processed: usize,
    },
}

pub trait Events: Send + Sync {
    fn emit(&self, event: SyncEvent);
}

/// Writes every event to the tracing subscriber and updates the matching
/// metric.
pub struct TracingEvents;

impl Events for TracingEvents {
    fn emit(&self, event: SyncEvent) {
        match event {
            SyncEvent::OutgoingHttpRequest {
                method,
                url,
                status,
            } => tracing::info!(method, %url, status, "Outgoing request to federation gateway"),
            SyncEvent::UnprocessableJson { url, error } => {
                tracing::warn!(%url, %error, "Unprocessable response body from federation gateway")
            }
            SyncEvent::InvalidKey { direction, reason } => {
                tracing::info!(%direction, rule = reason.rule(), %reason, "Dropped invalid key");
                let def = match direction {
                    Direction::Upload => UPLOAD_KEYS_REJECTED,
                    Direction::Download => DOWNLOAD_KEYS_REJECTED,
                };
                counter!(def, "rule" => reason.rule()).increment(1);
            }
            SyncEvent::UploadStarted {
                since,
                from_checkpoint,
            } => tracing::info!(%since, from_checkpoint, "Uploading submissions"),
            SyncEvent::UploadedKeys { test_type, count } => {
                tracing::info!(%test_type, count, "Uploaded keys");
                counter!(UPLOAD_KEYS, "test_type" => test_type.as_str()).increment(count as u64);
            }
            SyncEvent::UploadIncomplete { sent, inserted } => {
                tracing::warn!(sent, inserted, "Gateway inserted fewer keys than were sent");
                counter!(UPLOAD_INCOMPLETE).increment(1);
            }
            SyncEvent::UploadCheckpointCommitted {
                last_uploaded_submission_time,
            } => {
                tracing::info!(%last_uploaded_submission_time, "Upload checkpoint committed");
                counter!(UPLOAD_BATCHES).increment(1);
            }
            SyncEvent::DownloadStarted { date, batch_tag } => {
                tracing::info!(%date, batch_tag = ?batch_tag, "Downloading keys")
            }
            SyncEvent::DownloadedBatch {
                batch_tag,
                date,
                exposures,
            } => tracing::info!(%batch_tag, %date, exposures, "Downloaded batch"),
            SyncEvent::DownloadedKeys {
                origin,
                test_type,
                valid,
                invalid,
            } => {
                tracing::info!(%origin, %test_type, valid, invalid, "Downloaded keys");
                counter!(DOWNLOAD_KEYS_ACCEPTED, "origin" => origin).increment(valid as u64);
            }
            SyncEvent::InvalidOrigin {
                origin,
                batch_tag,
                key_count,
            } => {
                tracing::warn!(%origin, %batch_tag, key_count, "Discarded keys from origin that is not allowed");
                counter!(DOWNLOAD_ORIGIN_REJECTED, "origin" => origin).increment(1);
            }
            SyncEvent::EmptyOriginSkipped { origin, batch_tag } => {
                tracing::info!(%origin, %batch_tag, "No valid keys for origin")
            }
            SyncEvent::DownloadCheckpointCommitted {
                batch_tag,
                batch_date,
            } => {
                tracing::info!(%batch_tag, %batch_date, "Download checkpoint committed");
                counter!(DOWNLOAD_BATCHES).increment(1);
            }
            SyncEvent::SyncDisabled {
                direction,
                workspace,
            } => tracing::info!(%direction, %workspace, "Sync is disabled for this workspace"),
            SyncEvent::SyncFinished {
                direction,
                processed,
            } => tracing::info!(%direction, processed, "Sync finished"),
        }
    }
}

/// Keeps every emitted event in memory.
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<SyncEvent>>,
}

impl RecordingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SyncEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl Events for RecordingEvents {
    fn emit(&self, event: SyncEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
