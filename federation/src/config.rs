use crate::events::Direction;
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use url::Url;

/// Per-call headroom left for submissions that arrive while a batch is
/// being uploaded.
pub const UPLOAD_BATCH_SAFETY_MARGIN: usize = 4;
pub const DEFAULT_INVOCATION_TIMEOUT_SECS: u64 = 900;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("either an auth token or an auth token file is required")]
    MissingAuthToken,

    #[error("{0} needs a signing key file")]
    MissingSigningKey(Direction),

    #[error("no {0} section is configured")]
    MissingSection(Direction),

    #[error("max subsequent batch count for {0} must be greater than 0")]
    ZeroIterations(Direction),

    #[error("default risk level {0} is outside 0..=7")]
    RiskLevel(i32),

    #[error("max upload batch size {0} must be 0 or greater than {UPLOAD_BATCH_SAFETY_MARGIN}")]
    UploadBatchSize(usize),

    #[error("initial history days cannot be negative: {0}")]
    NegativeHistory(i64),

    #[error("invocation timeout cannot be 0")]
    ZeroTimeout,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    MissingVar(&'static str),

    #[error("invalid value {value:?} for {name}")]
    InvalidVar { name: &'static str, value: String },

    #[error("could not read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Validation(#[from] ValidationError),
}

/// Connection to the federation gateway.
#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct InteropConfig {
    pub base_url: Url,
    pub auth_token: Option<String>,
    /// File holding the bearer token, read at start-up.
    pub auth_token_file: Option<PathBuf>,
    /// PKCS#8 PEM P-256 key used to sign uploads.
    pub signing_key_file: Option<PathBuf>,
}

impl InteropConfig {
    pub fn resolve_auth_token(&self) -> Result<String, ConfigError> {
        if let Some(token) = &self.auth_token {
            return Ok(token.clone());
        }
        let path = self
            .auth_token_file
            .as_ref()
            .ok_or(ValidationError::MissingAuthToken)?;
        let token = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(token.trim().to_string())
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct UploadConfig {
    pub enabled_workspaces: Vec<String>,
    pub max_subsequent_batch_upload_count: usize,
    pub initial_upload_history_days: i64,
    /// 0 disables batch size limiting (legacy unlimited mode).
    pub max_upload_batch_size: usize,
    #[serde(default)]
    pub risk_level_default_enabled: bool,
    #[serde(default)]
    pub risk_level_default: i32,
    pub region: String,
    pub federated_key_upload_prefixes: Vec<String>,
    pub submission_dir: PathBuf,
}

impl UploadConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_subsequent_batch_upload_count == 0 {
            return Err(ValidationError::ZeroIterations(Direction::Upload));
        }
        if self.max_upload_batch_size != 0
            && self.max_upload_batch_size <= UPLOAD_BATCH_SAFETY_MARGIN
        {
            return Err(ValidationError::UploadBatchSize(self.max_upload_batch_size));
        }
        if self.initial_upload_history_days < 0 {
            return Err(ValidationError::NegativeHistory(
                self.initial_upload_history_days,
            ));
        }
        validate_risk_level(self.risk_level_default_enabled, self.risk_level_default)
    }

    pub fn risk_level_override(&self) -> Option<i32> {
        self.risk_level_default_enabled
            .then_some(self.risk_level_default)
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct DownloadConfig {
    pub enabled_workspaces: Vec<String>,
    pub max_subsequent_batch_download_count: usize,
    pub initial_download_history_days: i64,
    #[serde(default)]
    pub risk_level_default_enabled: bool,
    #[serde(default)]
    pub risk_level_default: i32,
    /// Origins whose keys may be stored.
    pub valid_origins: Vec<String>,
    pub federated_key_download_prefix: String,
    pub blob_dir: PathBuf,
}

impl DownloadConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_subsequent_batch_download_count == 0 {
            return Err(ValidationError::ZeroIterations(Direction::Download));
        }
        if self.initial_download_history_days < 0 {
            return Err(ValidationError::NegativeHistory(
                self.initial_download_history_days,
            ));
        }
        validate_risk_level(self.risk_level_default_enabled, self.risk_level_default)
    }

    pub fn risk_level_override(&self) -> Option<i32> {
        self.risk_level_default_enabled
            .then_some(self.risk_level_default)
    }
}

fn validate_risk_level(enabled: bool, level: i32) -> Result<(), ValidationError> {
    if enabled && !(0..=7).contains(&level) {
        return Err(ValidationError::RiskLevel(level));
    }
    Ok(())
}

fn default_invocation_timeout_secs() -> u64 {
    DEFAULT_INVOCATION_TIMEOUT_SECS
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct FederationConfig {
    /// Name of the deployment this process runs in.
    pub workspace: String,
    pub interop: InteropConfig,
    /// Directory holding the checkpoint records.
    pub state_dir: PathBuf,
    #[serde(default = "default_invocation_timeout_secs")]
    pub invocation_timeout_secs: u64,
    pub upload: Option<UploadConfig>,
    pub download: Option<DownloadConfig>,
}

impl FederationConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.interop.auth_token.is_none() && self.interop.auth_token_file.is_none() {
            return Err(ValidationError::MissingAuthToken);
        }
        if self.invocation_timeout_secs == 0 {
            return Err(ValidationError::ZeroTimeout);
        }
        if let Some(upload) = &self.upload {
            upload.validate()?;
            if self.interop.signing_key_file.is_none() {
                return Err(ValidationError::MissingSigningKey(Direction::Upload));
            }
        }
        if let Some(download) = &self.download {
            download.validate()?;
        }
        Ok(())
    }

    pub fn upload_config(&self) -> Result<&UploadConfig, ValidationError> {
        self.upload
            .as_ref()
            .ok_or(ValidationError::MissingSection(Direction::Upload))
    }

    pub fn download_config(&self) -> Result<&DownloadConfig, ValidationError> {
        self.download
            .as_ref()
            .ok_or(ValidationError::MissingSection(Direction::Download))
    }

    pub fn feature_flag(&self, direction: Direction) -> FeatureFlag {
        let enabled_workspaces = match direction {
            Direction::Upload => self.upload.as_ref().map(|c| &c.enabled_workspaces),
            Direction::Download => self.download.as_ref().map(|c| &c.enabled_workspaces),
        };
        FeatureFlag::new(
            self.workspace.clone(),
            enabled_workspaces.cloned().unwrap_or_default(),
        )
    }

    /// Reads the configuration for one sync direction from the process
    /// environment.
    pub fn from_env(direction: Direction) -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok(), direction)
    }

    /// Builds the configuration for one sync direction from named variables.
    /// Only the section for `direction` is populated.
    pub fn from_lookup<F>(lookup: F, direction: Direction) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let interop = InteropConfig {
            base_url: vars.parsed("INTEROP_BASE_URL")?,
            auth_token: vars.optional("INTEROP_AUTH_TOKEN"),
            auth_token_file: vars.optional("INTEROP_AUTH_TOKEN_FILE").map(PathBuf::from),
            signing_key_file: vars.optional("SIGNING_KEY_FILE").map(PathBuf::from),
        };

        let invocation_timeout_secs = match vars.optional("INVOCATION_TIMEOUT_SECS") {
            Some(_) => vars.parsed("INVOCATION_TIMEOUT_SECS")?,
            None => DEFAULT_INVOCATION_TIMEOUT_SECS,
        };

        let (upload, download) = match direction {
            Direction::Upload => (
                Some(UploadConfig {
                    enabled_workspaces: vars.list("UPLOAD_ENABLED_WORKSPACES")?,
                    max_subsequent_batch_upload_count: vars
                        .parsed("MAX_SUBSEQUENT_BATCH_UPLOAD_COUNT")?,
                    initial_upload_history_days: vars.parsed("INITIAL_UPLOAD_HISTORY_DAYS")?,
                    max_upload_batch_size: vars.parsed("MAX_UPLOAD_BATCH_SIZE")?,
                    risk_level_default_enabled: vars
                        .parsed("UPLOAD_RISK_LEVEL_DEFAULT_ENABLED")?,
                    risk_level_default: vars.parsed("UPLOAD_RISK_LEVEL_DEFAULT")?,
                    region: vars.required("REGION")?,
                    federated_key_upload_prefixes: vars.list("FEDERATED_KEY_UPLOAD_PREFIXES")?,
                    submission_dir: vars.required("SUBMISSION_DIR")?.into(),
                }),
                None,
            ),
            Direction::Download => (
                None,
                Some(DownloadConfig {
                    enabled_workspaces: vars.list("DOWNLOAD_ENABLED_WORKSPACES")?,
                    max_subsequent_batch_download_count: vars
                        .parsed("MAX_SUBSEQUENT_BATCH_DOWNLOAD_COUNT")?,
                    initial_download_history_days: vars
                        .parsed("INITIAL_DOWNLOAD_HISTORY_DAYS")?,
                    risk_level_default_enabled: vars
                        .parsed("DOWNLOAD_RISK_LEVEL_DEFAULT_ENABLED")?,
                    risk_level_default: vars.parsed("DOWNLOAD_RISK_LEVEL_DEFAULT")?,
                    valid_origins: vars.list("VALID_DOWNLOAD_ORIGINS")?,
                    federated_key_download_prefix: vars
                        .required("FEDERATED_KEY_DOWNLOAD_PREFIX")?,
                    blob_dir: vars.required("BLOB_DIR")?.into(),
                }),
            ),
        };

        let config = FederationConfig {
            workspace: vars.required("WORKSPACE")?,
            interop,
            state_dir: vars.required("STATE_DIR")?.into(),
            invocation_timeout_secs,
            upload,
            download,
        };
        config.validate()?;
        Ok(config)
    }
}

struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn optional(&self, name: &'static str) -> Option<String> {
        (self.0)(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        self.optional(name).ok_or(ConfigError::MissingVar(name))
    }

    fn parsed<T: FromStr>(&self, name: &'static str) -> Result<T, ConfigError> {
        let value = self.required(name)?;
        value
            .parse()
            .map_err(|_| ConfigError::InvalidVar { name, value })
    }

    /// Comma separated list. Present but empty is an empty list.
    fn list(&self, name: &'static str) -> Result<Vec<String>, ConfigError> {
        let value = (self.0)(name).ok_or(ConfigError::MissingVar(name))?;
        Ok(value
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(String::from)
            .collect())
    }
}

/// Gates a sync direction on the workspace it runs in.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureFlag {
    workspace: String,
    enabled_workspaces: Vec<String>,
}

impl FeatureFlag {
    pub fn new(workspace: String, enabled_workspaces: Vec<String>) -> Self {
        FeatureFlag {
            workspace,
            enabled_workspaces,
        }
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled_workspaces.contains(&self.workspace)
    }
}
