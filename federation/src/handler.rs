//! One invocation of each sync direction, wired to the local filesystem and
//! the federation gateway.

use crate::blob_store::FilesystemBlobStore;
use crate::checkpoint::FilesystemCheckpointStore;
use crate::client::HttpInteropClient;
use crate::clock::{Clock, Deadline, SystemClock};
use crate::config::{ConfigError, FederationConfig, ValidationError};
use crate::context::SyncContext;
use crate::download::{DownloadError, DownloadService, DownloadSettings, FederatedKeyStore};
use crate::events::{Direction, Events, SyncEvent};
use crate::jws::{Jws, P256Signer, SignerError};
use crate::submissions::{ExposureUploadFactory, FilesystemSubmissionRepository};
use crate::upload::{UploadError, UploadService, UploadSettings};
use chrono::TimeDelta;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum HandlerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("could not load the signing key: {0}")]
    Signer(#[from] SignerError),

    #[error("upload failed: {0}")]
    Upload(#[from] UploadError),

    #[error("download failed: {0}")]
    Download(#[from] DownloadError),
}

fn sync_context(config: &FederationConfig, events: Arc<dyn Events>) -> SyncContext {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let budget = i64::try_from(config.invocation_timeout_secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX);
    SyncContext {
        clock: clock.clone(),
        remaining: Arc::new(Deadline::new(clock, budget)),
        events,
    }
}

/// Reports the flag and returns false when the direction is off here.
fn is_enabled(config: &FederationConfig, direction: Direction, events: &dyn Events) -> bool {
    let flag = config.feature_flag(direction);
    if !flag.is_enabled() {
        events.emit(SyncEvent::SyncDisabled {
            direction,
            workspace: flag.workspace().to_string(),
        });
        return false;
    }
    true
}

/// Uploads local submissions. Returns the number of submissions processed.
pub async fn handle_upload(
    config: &FederationConfig,
    events: Arc<dyn Events>,
) -> Result<usize, HandlerError> {
    if !is_enabled(config, Direction::Upload, events.as_ref()) {
        return Ok(0);
    }

    let upload = config.upload_config()?;
    let settings = UploadSettings::from(upload);
    if settings.is_legacy_unlimited() {
        tracing::warn!(
            "Upload batch size is 0, all pending submissions are sent in a single unbounded request"
        );
    }

    let key_file = config
        .interop
        .signing_key_file
        .as_ref()
        .ok_or(ValidationError::MissingSigningKey(Direction::Upload))?;
    let jws = Jws::new(Arc::new(P256Signer::from_pem_file(key_file)?));

    let context = sync_context(config, events);
    let client = HttpInteropClient::new(
        &config.interop.base_url,
        config.interop.resolve_auth_token()?,
        Some(jws),
        context.events.clone(),
    );

    let service = UploadService::new(
        Arc::new(client),
        Arc::new(FilesystemSubmissionRepository::new(
            upload.submission_dir.clone(),
            upload.federated_key_upload_prefixes.clone(),
        )),
        Arc::new(FilesystemCheckpointStore::new(config.state_dir.clone())),
        ExposureUploadFactory::new(upload.region.clone()),
        settings,
        context,
    );
    Ok(service.run().await?)
}

/// Downloads and stores keys from other backends. Returns the number of pages
/// processed.
pub async fn handle_download(
    config: &FederationConfig,
    events: Arc<dyn Events>,
) -> Result<usize, HandlerError> {
    if !is_enabled(config, Direction::Download, events.as_ref()) {
        return Ok(0);
    }

    let download = config.download_config()?;
    let context = sync_context(config, events);

    // Downloads are never signed.
    let client = HttpInteropClient::new(
        &config.interop.base_url,
        config.interop.resolve_auth_token()?,
        None,
        context.events.clone(),
    );
    let key_store = FederatedKeyStore::new(
        Arc::new(FilesystemBlobStore::new(download.blob_dir.clone())),
        download.federated_key_download_prefix.clone(),
        download.valid_origins.clone(),
        context.clone(),
    );

    let service = DownloadService::new(
        Arc::new(client),
        key_store,
        Arc::new(FilesystemCheckpointStore::new(config.state_dir.clone())),
        DownloadSettings::from(download),
        context,
    );
    Ok(service.run().await?)
}
