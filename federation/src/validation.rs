//! Key validators shared by both sync directions.
//!
//! Outbound keys are issued by our own mobile clients, so the upload rules only
//! check their shape. Inbound keys come from other national backends and are
//! checked against size, range and time window rules before being stored.

use crate::clock::interval_number;
use crate::types::{ExposureDownload, ExposureKey};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, TimeDelta, Utc};

/// Exact raw length of a temporary exposure key.
pub const KEY_LENGTH: usize = 16;
/// Inbound keys must decode to fewer bytes than this.
pub const MAX_DOWNLOAD_KEY_LENGTH: usize = 32;
pub const MAX_ROLLING_PERIOD: i32 = 144;
pub const MAX_TRANSMISSION_RISK_LEVEL: i32 = 7;
pub const KEY_HISTORY_DAYS: i64 = 14;

#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum RejectionReason {
    #[error("key data is missing")]
    MissingKeyData,

    #[error("key data is not valid base64")]
    NotBase64,

    #[error("key data decodes to {0} bytes, expected {KEY_LENGTH}")]
    WrongKeyLength(usize),

    #[error("key data decodes to {0} bytes, expected fewer than {MAX_DOWNLOAD_KEY_LENGTH}")]
    KeyTooLong(usize),

    #[error("rolling period {0} is outside 1..={MAX_ROLLING_PERIOD}")]
    RollingPeriod(i32),

    #[error("transmission risk level {0} is outside 0..={MAX_TRANSMISSION_RISK_LEVEL}")]
    TransmissionRiskLevel(i32),

    #[error(
        "rolling start number {rolling_start_number} with rolling period {rolling_period} is outside the key history window ending at interval {current_interval}"
    )]
    RollingStartNumber {
        rolling_start_number: i64,
        rolling_period: i32,
        current_interval: i64,
    },
}

impl RejectionReason {
    /// Short rule name used to tag metrics.
    pub const fn rule(&self) -> &'static str {
        match self {
            RejectionReason::MissingKeyData
            | RejectionReason::NotBase64
            | RejectionReason::WrongKeyLength(_)
            | RejectionReason::KeyTooLong(_) => "key_data",
            RejectionReason::RollingPeriod(_) => "rolling_period",
            RejectionReason::TransmissionRiskLevel(_) => "transmission_risk_level",
            RejectionReason::RollingStartNumber { .. } => "rolling_start_number",
        }
    }
}

/// A key that passed validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidKey<T>(T);

impl<T> ValidKey<T> {
    pub fn get(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

fn decode_key(key_data: Option<&str>) -> Result<Vec<u8>, RejectionReason> {
    let key_data = key_data.ok_or(RejectionReason::MissingKeyData)?;
    STANDARD
        .decode(key_data)
        .map_err(|_| RejectionReason::NotBase64)
}

/// Outbound rule: base64 that decodes to exactly 16 bytes.
pub fn validate_upload(key: ExposureKey) -> Result<ValidKey<ExposureKey>, RejectionReason> {
    let decoded = decode_key(Some(&key.key_data))?;
    if decoded.len() != KEY_LENGTH {
        return Err(RejectionReason::WrongKeyLength(decoded.len()));
    }
    Ok(ValidKey(key))
}

/// Inbound rules, evaluated against a fixed point in time.
#[derive(Clone, Copy, Debug)]
pub struct DownloadValidator {
    current_interval: i64,
    expiry_interval: i64,
}

impl DownloadValidator {
    pub fn new(now: DateTime<Utc>) -> Self {
        DownloadValidator {
            current_interval: interval_number(now),
            expiry_interval: interval_number(now - TimeDelta::days(KEY_HISTORY_DAYS)),
        }
    }

    pub fn validate<'a>(
        &self,
        exposure: &'a ExposureDownload,
    ) -> Result<ValidKey<&'a ExposureDownload>, RejectionReason> {
        let decoded = decode_key(exposure.key_data.as_deref())?;
        if decoded.len() >= MAX_DOWNLOAD_KEY_LENGTH {
            return Err(RejectionReason::KeyTooLong(decoded.len()));
        }

        if !(1..=MAX_ROLLING_PERIOD).contains(&exposure.rolling_period) {
            return Err(RejectionReason::RollingPeriod(exposure.rolling_period));
        }

        if !(0..=MAX_TRANSMISSION_RISK_LEVEL).contains(&exposure.transmission_risk_level) {
            return Err(RejectionReason::TransmissionRiskLevel(
                exposure.transmission_risk_level,
            ));
        }

        self.validate_window(exposure.rolling_start_number, exposure.rolling_period)?;

        Ok(ValidKey(exposure))
    }

    /// A key is usable while its validity window ends no earlier than 14 days
    /// ago and it does not start in the future.
    pub fn validate_window(
        &self,
        rolling_start_number: i64,
        rolling_period: i32,
    ) -> Result<(), RejectionReason> {
        let within_window = rolling_start_number
            .checked_add(i64::from(rolling_period))
            .is_some_and(|window_end| window_end >= self.expiry_interval)
            && rolling_start_number <= self.current_interval;
        if within_window {
            Ok(())
        } else {
            Err(RejectionReason::RollingStartNumber {
                rolling_start_number,
                rolling_period,
                current_interval: self.current_interval,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ReportType, TestType};

    // 2020-09-15 23:50:00 UTC
    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(2667023 * 600, 0).unwrap()
    }

    fn download(key_data: &str, rolling_start_number: i64, rolling_period: i32) -> ExposureDownload {
        ExposureDownload {
            key_data: Some(key_data.into()),
            rolling_start_number,
            transmission_risk_level: 3,
            rolling_period,
            origin: "GB-EAW".into(),
            regions: vec!["GB".into()],
            test_type: TestType::LabResult,
            report_type: ReportType::ConfirmedTest,
            days_since_onset: 0,
        }
    }

    fn upload(key_data: &str) -> ExposureKey {
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

    #[test]
    fn test_upload_key_shape() {
        assert!(validate_upload(upload("W2zb3BeMWt6Xr2u0ABG32Q==")).is_ok());
        assert_eq!(
            validate_upload(upload("not base64!")),
            Err(RejectionReason::NotBase64)
        );
        // 12 bytes
        assert_eq!(
            validate_upload(upload("AAAAAAAAAAAAAAAA")),
            Err(RejectionReason::WrongKeyLength(12))
        );
    }

    #[test]
    fn test_download_key_size() {
        let validator = DownloadValidator::new(now());
        assert!(validator.validate(&download("AAAAAAAAAAAAAAAA", 2666736, 144)).is_ok());

        // 32 bytes
        let too_long = STANDARD.encode([0u8; 32]);
        assert_eq!(
            validator.validate(&download(&too_long, 2666736, 144)),
            Err(RejectionReason::KeyTooLong(32))
        );

        let mut missing = download("", 2666736, 144);
        missing.key_data = None;
        assert_eq!(
            validator.validate(&missing),
            Err(RejectionReason::MissingKeyData)
        );
    }

    #[test]
    fn test_rolling_period_bounds() {
        let validator = DownloadValidator::new(now());
        let key = "W2zb3BeMWt6Xr2u0ABG32Q==";

        assert_eq!(
            validator.validate(&download(key, 2666736, 0)),
            Err(RejectionReason::RollingPeriod(0))
        );
        assert!(validator.validate(&download(key, 2666736, 1)).is_ok());
        assert!(validator.validate(&download(key, 2666736, 144)).is_ok());
        assert_eq!(
            validator.validate(&download(key, 2666736, 145)),
            Err(RejectionReason::RollingPeriod(145))
        );
    }

    #[test]
    fn test_transmission_risk_level_bounds() {
        let validator = DownloadValidator::new(now());
        let key = download("W2zb3BeMWt6Xr2u0ABG32Q==", 2666736, 144);

        assert!(validator.validate(&key.clone().with_transmission_risk_level(0)).is_ok());
        assert!(validator.validate(&key.clone().with_transmission_risk_level(7)).is_ok());
        assert_eq!(
            validator.validate(&key.clone().with_transmission_risk_level(8)).map(|_| ()),
            Err(RejectionReason::TransmissionRiskLevel(8))
        );
        assert_eq!(
            validator.validate(&key.with_transmission_risk_level(-1)).map(|_| ()),
            Err(RejectionReason::TransmissionRiskLevel(-1))
        );
    }

    #[test]
    fn test_rolling_start_number_window() {
        let validator = DownloadValidator::new(now());

        // 2020-09-14 00:00:00 UTC, last key in the 14 day history
        assert!(validator.validate_window(2666736, 144).is_ok());
        // 2020-09-01 00:00:00 UTC, first key in the 14 day history
        assert!(validator.validate_window(2664864, 144).is_ok());
        // 2020-08-31 00:00:00 UTC
        assert!(validator.validate_window(2664720, 144).is_err());
        // current day key
        assert!(validator.validate_window(2666880, 144).is_ok());
        // 2020-09-01 key that expired half way through the day
        assert!(validator.validate_window(2664864, 72).is_err());
        // starts in the future
        assert!(validator.validate_window(2667024, 144).is_err());
    }

    #[test]
    fn test_window_boundary_is_inclusive() {
        let now = now();
        let validator = DownloadValidator::new(now);
        let expiry = interval_number(now - TimeDelta::days(KEY_HISTORY_DAYS));

        // rolling_start_number + rolling_period lands exactly 14 days ago
        assert!(validator.validate_window(expiry - 144, 144).is_ok());
        // one interval earlier
        assert_eq!(
            validator.validate_window(expiry - 145, 144),
            Err(RejectionReason::RollingStartNumber {
                rolling_start_number: expiry - 145,
                rolling_period: 144,
                current_interval: 2667023,
            })
        );
    }

    #[test]
    fn test_rejection_rule_names() {
        assert_eq!(RejectionReason::NotBase64.rule(), "key_data");
        assert_eq!(RejectionReason::RollingPeriod(0).rule(), "rolling_period");
    }

    #[test]
    fn test_rolling_start_number_overflow_is_rejected() {
        let validator = DownloadValidator::new(now());
        let key = "W2zb3BeMWt6Xr2u0ABG32Q==";

        assert_eq!(
            validator.validate(&download(key, i64::MAX, 144)),
            Err(RejectionReason::RollingStartNumber {
                rolling_start_number: i64::MAX,
                rolling_period: 144,
                current_interval: 2667023,
            })
        );
        assert!(matches!(
            validator.validate_window(i64::MIN, 144),
            Err(RejectionReason::RollingStartNumber { .. })
        ));
    }
}
