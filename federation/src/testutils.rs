use crate::client::{DownloadOutcome, InteropClient, InteropError, UploadOutcome};
use crate::clock::{Clock, RemainingTime};
use crate::jws::{Signer, SignerError};
use crate::types::{
    BatchTag, ExposureBatch, ExposureDownload, ExposureKey, ReportType, TestType,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        FixedClock {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: TimeDelta) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

pub struct FixedRemaining(pub TimeDelta);

impl RemainingTime for FixedRemaining {
    fn remaining(&self) -> TimeDelta {
        self.0
    }
}

/// Returns a constant signature.
pub struct FixedSigner;

#[async_trait]
impl Signer for FixedSigner {
    async fn sign(&self, _content: &[u8]) -> Result<Vec<u8>, SignerError> {
        Ok(b"signature".to_vec())
    }
}

/// 2020-09-15 23:50:00 UTC
pub fn sample_now() -> DateTime<Utc> {
    DateTime::from_timestamp(2667023 * 600, 0).unwrap()
}

pub fn sample_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 9, 15).unwrap()
}

pub fn exposure_key(key_data: &str) -> ExposureKey {
    ExposureKey {
        key_data: key_data.into(),
        rolling_start_number: 2666736,
        transmission_risk_level: 3,
        rolling_period: 144,
        regions: vec!["GB".into()],
        test_type: TestType::LabResult,
        report_type: ReportType::ConfirmedTest,
        days_since_onset: 0,
    }
}

/// A key that is valid at [`sample_now`].
pub fn exposure_download(key_data: &str, origin: &str) -> ExposureDownload {
    ExposureDownload {
        key_data: Some(key_data.into()),
        rolling_start_number: 2666736,
        transmission_risk_level: 3,
        rolling_period: 144,
        origin: origin.into(),
        regions: vec!["GB".into()],
        test_type: TestType::LabResult,
        report_type: ReportType::ConfirmedTest,
        days_since_onset: 0,
    }
}

/// Distinct 16 byte keys in base64.
pub fn key_data(n: u8) -> String {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    STANDARD.encode([n; 16])
}

pub fn batch(tag: &str, exposures: Vec<ExposureDownload>) -> ExposureBatch {
    ExposureBatch {
        batch_tag: BatchTag::new(tag),
        exposures,
    }
}

/// Gateway stub. Download pages are keyed by the batch tag sent with the
/// request, unknown tags answer with no content. Every call can advance a
/// clock to simulate slow requests.
#[derive(Default)]
pub struct StubInteropClient {
    pages: HashMap<Option<BatchTag>, ExposureBatch>,
    inserted_override: Option<u64>,
    fail_uploads: bool,
    clock_step: Option<(Arc<FixedClock>, TimeDelta)>,
    downloads: Mutex<Vec<(NaiveDate, Option<BatchTag>)>>,
    uploads: Mutex<Vec<Vec<ExposureKey>>>,
}

impl StubInteropClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers a request made with `after` with `page`.
    pub fn with_page(mut self, after: Option<&str>, page: ExposureBatch) -> Self {
        self.pages.insert(after.map(BatchTag::new), page);
        self
    }

    pub fn with_inserted(mut self, inserted: u64) -> Self {
        self.inserted_override = Some(inserted);
        self
    }

    pub fn failing_uploads(mut self) -> Self {
        self.fail_uploads = true;
        self
    }

    pub fn with_clock_step(mut self, clock: Arc<FixedClock>, step: TimeDelta) -> Self {
        self.clock_step = Some((clock, step));
        self
    }

    pub fn downloads(&self) -> Vec<(NaiveDate, Option<BatchTag>)> {
        self.downloads.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<Vec<ExposureKey>> {
        self.uploads.lock().unwrap().clone()
    }

    fn tick(&self) {
        if let Some((clock, step)) = &self.clock_step {
            clock.advance(*step);
        }
    }
}

#[async_trait]
impl InteropClient for StubInteropClient {
    async fn download(
        &self,
        date: NaiveDate,
        batch_tag: Option<&BatchTag>,
    ) -> Result<DownloadOutcome, InteropError> {
        self.tick();
        self.downloads
            .lock()
            .unwrap()
            .push((date, batch_tag.cloned()));

        Ok(match self.pages.get(&batch_tag.cloned()) {
            Some(page) => DownloadOutcome::HasBatch(page.clone()),
            None => DownloadOutcome::NoContent,
        })
    }

    async fn upload(&self, keys: &[ExposureKey]) -> Result<UploadOutcome, InteropError> {
        self.tick();
        if self.fail_uploads {
            return Err(InteropError::UnexpectedStatus {
                url: "http://interop.test/diagnosiskeys/upload".into(),
                status: 500,
            });
        }
        self.uploads.lock().unwrap().push(keys.to_vec());
        Ok(UploadOutcome {
            inserted_exposures: self.inserted_override.unwrap_or(keys.len() as u64),
        })
    }
}
