//! Resumable sync state. Upload and download each own one record, so the two
//! directions never contend.

use crate::types::BatchTag;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const UPLOAD_CHECKPOINT_FILE: &str = "upload_checkpoint.json";
const DOWNLOAD_CHECKPOINT_FILE: &str = "download_checkpoint.json";

#[derive(thiserror::Error, Debug)]
pub enum CheckpointError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt checkpoint record: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("checkpoint store is poisoned")]
    Poisoned,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadCheckpoint {
    #[serde(rename = "lastUploadTimestamp", with = "chrono::serde::ts_seconds")]
    pub last_uploaded_submission_time: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadCheckpoint {
    pub batch_tag: BatchTag,
    pub batch_date: NaiveDate,
}

/// Writes must be the last step of a successful iteration.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get_upload_checkpoint(&self) -> Result<Option<UploadCheckpoint>, CheckpointError>;

    async fn set_upload_checkpoint(
        &self,
        last_uploaded_submission_time: DateTime<Utc>,
    ) -> Result<(), CheckpointError>;

    async fn get_download_checkpoint(&self)
    -> Result<Option<DownloadCheckpoint>, CheckpointError>;

    async fn set_download_checkpoint(
        &self,
        batch_tag: &BatchTag,
        batch_date: NaiveDate,
    ) -> Result<(), CheckpointError>;
}

/// Stores each record as a small JSON file in a state directory.
pub struct FilesystemCheckpointStore {
    dir: PathBuf,
}

impl FilesystemCheckpointStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        FilesystemCheckpointStore { dir: dir.into() }
    }

    async fn read<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, CheckpointError> {
        match tokio::fs::read(self.dir.join(name)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write<T: Serialize + Sync>(&self, name: &str, record: &T) -> Result<(), CheckpointError> {
        let bytes = serde_json::to_vec(record)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        // Replace atomically so an interrupted write never leaves a torn record
        let path = self.dir.join(name);
        let tmp = tmp_path(&path);
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[async_trait]
impl CheckpointStore for FilesystemCheckpointStore {
    async fn get_upload_checkpoint(&self) -> Result<Option<UploadCheckpoint>, CheckpointError> {
        self.read(UPLOAD_CHECKPOINT_FILE).await
    }

    async fn set_upload_checkpoint(
        &self,
        last_uploaded_submission_time: DateTime<Utc>,
    ) -> Result<(), CheckpointError> {
        self.write(
            UPLOAD_CHECKPOINT_FILE,
            &UploadCheckpoint {
                last_uploaded_submission_time,
            },
        )
        .await
    }

    async fn get_download_checkpoint(
        &self,
    ) -> Result<Option<DownloadCheckpoint>, CheckpointError> {
        self.read(DOWNLOAD_CHECKPOINT_FILE).await
    }

    async fn set_download_checkpoint(
        &self,
        batch_tag: &BatchTag,
        batch_date: NaiveDate,
    ) -> Result<(), CheckpointError> {
        self.write(
            DOWNLOAD_CHECKPOINT_FILE,
            &DownloadCheckpoint {
                batch_tag: batch_tag.clone(),
                batch_date,
            },
        )
        .await
    }
}

#[derive(Default)]
pub struct InMemoryCheckpointStore {
    upload: Mutex<Option<UploadCheckpoint>>,
    download: Mutex<Option<DownloadCheckpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_download_checkpoint(checkpoint: DownloadCheckpoint) -> Self {
        InMemoryCheckpointStore {
            upload: Mutex::new(None),
            download: Mutex::new(Some(checkpoint)),
        }
    }

    pub fn with_upload_checkpoint(last_uploaded_submission_time: DateTime<Utc>) -> Self {
        InMemoryCheckpointStore {
            upload: Mutex::new(Some(UploadCheckpoint {
                last_uploaded_submission_time,
            })),
            download: Mutex::new(None),
        }
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get_upload_checkpoint(&self) -> Result<Option<UploadCheckpoint>, CheckpointError> {
        Ok(*self.upload.lock().map_err(|_| CheckpointError::Poisoned)?)
    }

    async fn set_upload_checkpoint(
        &self,
        last_uploaded_submission_time: DateTime<Utc>,
    ) -> Result<(), CheckpointError> {
        *self.upload.lock().map_err(|_| CheckpointError::Poisoned)? = Some(UploadCheckpoint {
            last_uploaded_submission_time,
        });
        Ok(())
    }

    async fn get_download_checkpoint(
        &self,
    ) -> Result<Option<DownloadCheckpoint>, CheckpointError> {
        Ok(self
            .download
            .lock()
            .map_err(|_| CheckpointError::Poisoned)?
            .clone())
    }

    async fn set_download_checkpoint(
        &self,
        batch_tag: &BatchTag,
        batch_date: NaiveDate,
    ) -> Result<(), CheckpointError> {
        *self.download.lock().map_err(|_| CheckpointError::Poisoned)? = Some(DownloadCheckpoint {
            batch_tag: batch_tag.clone(),
            batch_date,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_filesystem_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemCheckpointStore::new(dir.path().join("state"));

        assert_eq!(store.get_upload_checkpoint().await.unwrap(), None);
        assert_eq!(store.get_download_checkpoint().await.unwrap(), None);

        let at = DateTime::from_timestamp(1_600_000_000, 0).unwrap();
        store.set_upload_checkpoint(at).await.unwrap();

        let date = NaiveDate::from_ymd_opt(2020, 9, 15).unwrap();
        store
            .set_download_checkpoint(&BatchTag::new("T1"), date)
            .await
            .unwrap();

        assert_eq!(
            store.get_upload_checkpoint().await.unwrap(),
            Some(UploadCheckpoint {
                last_uploaded_submission_time: at
            })
        );
        assert_eq!(
            store.get_download_checkpoint().await.unwrap(),
            Some(DownloadCheckpoint {
                batch_tag: BatchTag::new("T1"),
                batch_date: date,
            })
        );
    }

    #[tokio::test]
    async fn test_record_format() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemCheckpointStore::new(dir.path());

        store
            .set_upload_checkpoint(DateTime::from_timestamp(1_600_000_000, 0).unwrap())
            .await
            .unwrap();
        store
            .set_download_checkpoint(
                &BatchTag::new("T1"),
                NaiveDate::from_ymd_opt(2020, 9, 15).unwrap(),
            )
            .await
            .unwrap();

        let upload = std::fs::read_to_string(dir.path().join(UPLOAD_CHECKPOINT_FILE)).unwrap();
        assert_eq!(upload, r#"{"lastUploadTimestamp":1600000000}"#);

        let download = std::fs::read_to_string(dir.path().join(DOWNLOAD_CHECKPOINT_FILE)).unwrap();
        assert_eq!(download, r#"{"batchTag":"T1","batchDate":"2020-09-15"}"#);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DOWNLOAD_CHECKPOINT_FILE), "{").unwrap();

        let store = FilesystemCheckpointStore::new(dir.path());
        assert!(matches!(
            store.get_download_checkpoint().await,
            Err(CheckpointError::Codec(_))
        ));
    }
}
