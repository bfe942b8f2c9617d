use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque pagination cursor issued by the federation gateway. It is scoped to a
/// calendar date and only ever echoed back to the gateway.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchTag(String);

impl BatchTag {
    pub fn new<S: Into<String>>(value: S) -> Self {
        BatchTag(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("unknown {kind} value {value}")]
pub struct UnknownVariant {
    kind: &'static str,
    value: u8,
}

/// Kind of test that produced the positive result behind a key.
/// Encoded as an integer on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum TestType {
    LabResult,
    RapidResult,
    RapidSelfReported,
}

impl TestType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            TestType::LabResult => "LAB_RESULT",
            TestType::RapidResult => "RAPID_RESULT",
            TestType::RapidSelfReported => "RAPID_SELF_REPORTED",
        }
    }

    /// Parses the test type segment used in submission object keys,
    /// e.g. `mobile/RAPID_RESULT/<id>.json`.
    pub fn from_path_segment(segment: &str) -> Option<Self> {
        match segment {
            "LAB_RESULT" => Some(TestType::LabResult),
            "RAPID_RESULT" => Some(TestType::RapidResult),
            "RAPID_SELF_REPORTED" => Some(TestType::RapidSelfReported),
            _ => None,
        }
    }
}

impl fmt::Display for TestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<TestType> for u8 {
    fn from(value: TestType) -> Self {
        match value {
            TestType::LabResult => 1,
            TestType::RapidResult => 2,
            TestType::RapidSelfReported => 3,
        }
    }
}

impl TryFrom<u8> for TestType {
    type Error = UnknownVariant;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(TestType::LabResult),
            2 => Ok(TestType::RapidResult),
            3 => Ok(TestType::RapidSelfReported),
            _ => Err(UnknownVariant {
                kind: "test type",
                value,
            }),
        }
    }
}

/// Diagnosis report type as defined by the exposure notification framework.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ReportType {
    Unknown,
    ConfirmedTest,
    ConfirmedClinicalDiagnosis,
    SelfReport,
    Recursive,
    Revoked,
}

impl From<ReportType> for u8 {
    fn from(value: ReportType) -> Self {
        match value {
            ReportType::Unknown => 0,
            ReportType::ConfirmedTest => 1,
            ReportType::ConfirmedClinicalDiagnosis => 2,
            ReportType::SelfReport => 3,
            ReportType::Recursive => 4,
            ReportType::Revoked => 5,
        }
    }
}

impl TryFrom<u8> for ReportType {
    type Error = UnknownVariant;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ReportType::Unknown),
            1 => Ok(ReportType::ConfirmedTest),
            2 => Ok(ReportType::ConfirmedClinicalDiagnosis),
            3 => Ok(ReportType::SelfReport),
            4 => Ok(ReportType::Recursive),
            5 => Ok(ReportType::Revoked),
            _ => Err(UnknownVariant {
                kind: "report type",
                value,
            }),
        }
    }
}

/// A diagnosis key as sent to the gateway.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposureKey {
    pub key_data: String,
    pub rolling_start_number: i64,
    pub transmission_risk_level: i32,
    pub rolling_period: i32,
    pub regions: Vec<String>,
    pub test_type: TestType,
    pub report_type: ReportType,
    pub days_since_onset: i32,
}

impl ExposureKey {
    pub fn with_transmission_risk_level(self, transmission_risk_level: i32) -> Self {
        ExposureKey {
            transmission_risk_level,
            ..self
        }
    }
}

/// A diagnosis key as published by the gateway, tagged with the country or
/// region that emitted it. Numeric fields are deliberately wide so that
/// out-of-range values reach the validators instead of failing the whole page.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposureDownload {
    pub key_data: Option<String>,
    pub rolling_start_number: i64,
    pub transmission_risk_level: i32,
    pub rolling_period: i32,
    pub origin: String,
    #[serde(default)]
    pub regions: Vec<String>,
    pub test_type: TestType,
    pub report_type: ReportType,
    #[serde(default)]
    pub days_since_onset: i32,
}

impl ExposureDownload {
    pub fn with_transmission_risk_level(self, transmission_risk_level: i32) -> Self {
        ExposureDownload {
            transmission_risk_level,
            ..self
        }
    }
}

/// One page of the gateway's download feed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposureBatch {
    pub batch_tag: BatchTag,
    pub exposures: Vec<ExposureDownload>,
}

/// Key record in the local storage format shared by mobile submissions and
/// persisted federated batches.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredTemporaryExposureKey {
    pub key: String,
    pub rolling_start_number: i64,
    pub rolling_period: i32,
    pub transmission_risk: i32,
    #[serde(default)]
    pub days_since_onset_of_symptoms: i32,
}

impl From<&ExposureDownload> for StoredTemporaryExposureKey {
    fn from(download: &ExposureDownload) -> Self {
        StoredTemporaryExposureKey {
            key: download.key_data.clone().unwrap_or_default(),
            rolling_start_number: download.rolling_start_number,
            rolling_period: download.rolling_period,
            transmission_risk: download.transmission_risk_level,
            days_since_onset_of_symptoms: download.days_since_onset,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredTemporaryExposureKeyPayload {
    pub temporary_exposure_keys: Vec<StoredTemporaryExposureKey>,
}

/// A mobile submission read from the local submission store.
#[derive(Clone, Debug, PartialEq)]
pub struct Submission {
    pub submission_time: DateTime<Utc>,
    pub object_key: String,
    pub payload: StoredTemporaryExposureKeyPayload,
}
