//! HTTP client for the federation gateway.

use crate::events::{Events, SyncEvent};
use crate::jws::{Jws, SignerError};
use crate::metrics_defs::INTEROP_REQUEST_DURATION;
use crate::types::{BatchTag, ExposureBatch, ExposureKey};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use shared::histogram;
use std::sync::Arc;
use std::time::Instant;
use url::Url;
use uuid::Uuid;

#[derive(thiserror::Error, Debug)]
pub enum InteropError {
    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("request to {url} failed with status code {status}")]
    UnexpectedStatus { url: String, status: u16 },

    #[error("unprocessable response body from {url}: {source}")]
    UnprocessableBody {
        url: String,
        source: serde_json::Error,
    },

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("could not sign upload: {0}")]
    Signing(#[from] SignerError),

    #[error("uploads need a signing key")]
    SigningUnavailable,

    #[error("could not serialize upload: {0}")]
    Serialization(serde_json::Error),
}

#[derive(Clone, Debug, PartialEq)]
pub enum DownloadOutcome {
    HasBatch(ExposureBatch),
    NoContent,
}

/// Gateway acknowledgement of an upload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UploadOutcome {
    pub inserted_exposures: u64,
}

#[async_trait]
pub trait InteropClient: Send + Sync {
    /// Fetches one page of keys published on `date`, continuing after
    /// `batch_tag` when given.
    async fn download(
        &self,
        date: NaiveDate,
        batch_tag: Option<&BatchTag>,
    ) -> Result<DownloadOutcome, InteropError>;

    /// Signs and sends `keys` as a single batch.
    async fn upload(&self, keys: &[ExposureKey]) -> Result<UploadOutcome, InteropError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadRequest {
    batch_tag: String,
    payload: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    inserted_exposures: u64,
}

type RequestIds = Arc<dyn Fn() -> Uuid + Send + Sync>;

#[derive(Clone)]
pub struct HttpInteropClient {
    client: reqwest::Client,
    base_url: String,
    auth_token: String,
    jws: Option<Jws>,
    events: Arc<dyn Events>,
    request_ids: RequestIds,
}

impl HttpInteropClient {
    pub fn new(
        base_url: &Url,
        auth_token: String,
        jws: Option<Jws>,
        events: Arc<dyn Events>,
    ) -> Self {
        HttpInteropClient {
            client: reqwest::Client::new(),
            base_url: base_url.as_str().trim_end_matches('/').to_string(),
            auth_token,
            jws,
            events,
            request_ids: Arc::new(Uuid::new_v4),
        }
    }

    /// Replaces the generator of upload request ids.
    pub fn with_request_ids<F>(mut self, request_ids: F) -> Self
    where
        F: Fn() -> Uuid + Send + Sync + 'static,
    {
        self.request_ids = Arc::new(request_ids);
        self
    }

    fn record(&self, method: &'static str, url: &Url, status: StatusCode, started: Instant) {
        histogram!(
            INTEROP_REQUEST_DURATION,
            "method" => method,
            "status" => status.as_str().to_string()
        )
        .record(started.elapsed().as_secs_f64());

        self.events.emit(SyncEvent::OutgoingHttpRequest {
            method,
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    fn parse_body<T: for<'de> Deserialize<'de>>(
        &self,
        url: &Url,
        body: &str,
    ) -> Result<T, InteropError> {
        serde_json::from_str(body).map_err(|source| {
            self.events.emit(SyncEvent::UnprocessableJson {
                url: url.to_string(),
                error: source.to_string(),
            });
            InteropError::UnprocessableBody {
                url: url.to_string(),
                source,
            }
        })
    }
}

#[async_trait]
impl InteropClient for HttpInteropClient {
    async fn download(
        &self,
        date: NaiveDate,
        batch_tag: Option<&BatchTag>,
    ) -> Result<DownloadOutcome, InteropError> {
        let mut url = Url::parse(&format!(
            "{}/diagnosiskeys/download/{}",
            self.base_url,
            date.format("%Y-%m-%d")
        ))?;
        if let Some(tag) = batch_tag {
            url.query_pairs_mut().append_pair("batchTag", tag.as_str());
        }

        let started = Instant::now();
        let response = self
            .client
            .get(url.clone())
            .bearer_auth(&self.auth_token)
            .send()
            .await?;
        let status = response.status();
        self.record("GET", &url, status, started);

        match status {
            StatusCode::OK => {
                let body = response.text().await?;
                Ok(DownloadOutcome::HasBatch(self.parse_body(&url, &body)?))
            }
            StatusCode::NO_CONTENT => Ok(DownloadOutcome::NoContent),
            _ => Err(InteropError::UnexpectedStatus {
                url: url.to_string(),
                status: status.as_u16(),
            }),
        }
    }

    async fn upload(&self, keys: &[ExposureKey]) -> Result<UploadOutcome, InteropError> {
        let jws = self.jws.as_ref().ok_or(InteropError::SigningUnavailable)?;
        let url = Url::parse(&format!("{}/diagnosiskeys/upload", self.base_url))?;

        let payload = serde_json::to_string(keys).map_err(InteropError::Serialization)?;
        let request = UploadRequest {
            batch_tag: (self.request_ids)().to_string(),
            payload: jws.sign(&payload).await?,
        };

        let started = Instant::now();
        let response = self
            .client
            .post(url.clone())
            .bearer_auth(&self.auth_token)
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        self.record("POST", &url, status, started);

        if status != StatusCode::OK {
            return Err(InteropError::UnexpectedStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        let response: UploadResponse = self.parse_body(&url, &body)?;
        Ok(UploadOutcome {
            inserted_exposures: response.inserted_exposures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingEvents;
    use crate::testutils::{FixedSigner, exposure_key};
    use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const REQUEST_ID: &str = "4b5d2c1e-8f4a-4c3b-9a77-0e6b9c3f2d10";

    fn client(server: &MockServer, events: Arc<RecordingEvents>) -> HttpInteropClient {
        let base_url = Url::parse(&format!("{}/", server.uri())).unwrap();
        HttpInteropClient::new(
            &base_url,
            "token".into(),
            Some(Jws::new(Arc::new(FixedSigner))),
            events,
        )
        .with_request_ids(|| Uuid::parse_str(REQUEST_ID).unwrap())
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 9, 15).unwrap()
    }

    #[tokio::test]
    async fn test_download_batch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/diagnosiskeys/download/2020-09-15"))
            .and(query_param_is_missing("batchTag"))
            .and(header("Authorization", "Bearer token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "batchTag": "75b326f7-ae6f-42f6-9354-00c0a6b797b3",
                "exposures": [{
                    "keyData": "ogNW4Ra+Zdds1ZOb+vjl9g==",
                    "rollingStartNumber": 2666736,
                    "transmissionRiskLevel": 4,
                    "rollingPeriod": 144,
                    "origin": "JE",
                    "regions": ["GB"],
                    "testType": 1,
                    "reportType": 1,
                    "daysSinceOnset": 0
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let events = Arc::new(RecordingEvents::new());
        let outcome = client(&server, events.clone())
            .download(date(), None)
            .await
            .unwrap();

        let DownloadOutcome::HasBatch(batch) = outcome else {
            panic!("expected a batch, got {outcome:?}");
        };
        assert_eq!(batch.batch_tag.as_str(), "75b326f7-ae6f-42f6-9354-00c0a6b797b3");
        assert_eq!(batch.exposures.len(), 1);
        assert_eq!(batch.exposures[0].origin, "JE");

        assert_eq!(
            events.events(),
            vec![SyncEvent::OutgoingHttpRequest {
                method: "GET",
                url: format!("{}/diagnosiskeys/download/2020-09-15", server.uri()),
                status: 200,
            }]
        );
    }

    #[tokio::test]
    async fn test_download_with_batch_tag_no_content() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/diagnosiskeys/download/2020-09-15"))
            .and(query_param("batchTag", "T1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = client(&server, Arc::new(RecordingEvents::new()))
            .download(date(), Some(&BatchTag::new("T1")))
            .await
            .unwrap();
        assert_eq!(outcome, DownloadOutcome::NoContent);
    }

    #[tokio::test]
    async fn test_download_unexpected_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = client(&server, Arc::new(RecordingEvents::new()))
            .download(date(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InteropError::UnexpectedStatus { status: 500, .. }
        ));
        assert!(err.to_string().ends_with("failed with status code 500"));
    }

    #[tokio::test]
    async fn test_download_unprocessable_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"batchTag\":"))
            .mount(&server)
            .await;

        let events = Arc::new(RecordingEvents::new());
        let err = client(&server, events.clone())
            .download(date(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, InteropError::UnprocessableBody { .. }));
        assert!(
            events
                .events()
                .iter()
                .any(|e| matches!(e, SyncEvent::UnprocessableJson { .. }))
        );
    }

    #[tokio::test]
    async fn test_upload_signed_batch() {
        let keys = vec![exposure_key("W2zb3BeMWt6Xr2u0ABG32Q==")];
        let payload = serde_json::to_string(&keys).unwrap();
        let signed = format!(
            "{}.{}.{}",
            URL_SAFE_NO_PAD.encode(r#"{"alg":"ES256"}"#),
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(b"signature"),
        );

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/diagnosiskeys/upload"))
            .and(header("Authorization", "Bearer token"))
            .and(body_json(json!({
                "batchTag": REQUEST_ID,
                "payload": signed,
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "batchTag": "75b326f7-ae6f-42f6-9354-00c0a6b797b3",
                "insertedExposures": 1
            })))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = client(&server, Arc::new(RecordingEvents::new()))
            .upload(&keys)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            UploadOutcome {
                inserted_exposures: 1
            }
        );
    }

    #[tokio::test]
    async fn test_upload_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = client(&server, Arc::new(RecordingEvents::new()))
            .upload(&[exposure_key("W2zb3BeMWt6Xr2u0ABG32Q==")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InteropError::UnexpectedStatus { status: 401, .. }
        ));
    }

    #[tokio::test]
    async fn test_upload_without_signer() {
        let server = MockServer::start().await;
        let base_url = Url::parse(&server.uri()).unwrap();
        let client = HttpInteropClient::new(
            &base_url,
            "token".into(),
            None,
            Arc::new(RecordingEvents::new()),
        );

        assert!(matches!(
            client.upload(&[]).await,
            Err(InteropError::SigningUnavailable)
        ));
    }
}
