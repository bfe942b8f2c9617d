//! Compact JWS construction for signed uploads.
//!
//! The token is outbound only: this side never verifies signatures. The
//! signing key lives behind the [`Signer`] trait so the private key can be
//! held by a local PEM file or an external signing service.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use p256::ecdsa::SigningKey;
use p256::ecdsa::signature::Signer as _;
use p256::pkcs8::DecodePrivateKey;
use std::path::Path;
use std::sync::Arc;

const HEADER: &str = r#"{"alg":"ES256"}"#;

#[derive(thiserror::Error, Debug)]
pub enum SignerError {
    #[error("could not read signing key: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid signing key: {0}")]
    InvalidKey(String),

    #[error("signing failed: {0}")]
    Signing(String),
}

#[async_trait]
pub trait Signer: Send + Sync {
    /// Returns the raw signature over `content`.
    async fn sign(&self, content: &[u8]) -> Result<Vec<u8>, SignerError>;
}

#[derive(Clone)]
pub struct Jws {
    signer: Arc<dyn Signer>,
}

impl Jws {
    pub fn new(signer: Arc<dyn Signer>) -> Self {
        Jws { signer }
    }

    /// Produces `header.payload.signature`, each part base64url without padding.
    /// The signature covers the first two parts joined by a dot.
    pub async fn sign(&self, payload: &str) -> Result<String, SignerError> {
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(HEADER),
            URL_SAFE_NO_PAD.encode(payload)
        );
        let signature = self.signer.sign(signing_input.as_bytes()).await?;
        Ok(format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }
}

/// ES256 signer backed by a P-256 private key.
pub struct P256Signer {
    key: SigningKey,
}

impl P256Signer {
    pub fn new(key: SigningKey) -> Self {
        P256Signer { key }
    }

    pub fn from_pkcs8_pem(pem: &str) -> Result<Self, SignerError> {
        let key =
            SigningKey::from_pkcs8_pem(pem).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        Ok(P256Signer { key })
    }

    pub fn from_pem_file(path: &Path) -> Result<Self, SignerError> {
        let pem = std::fs::read_to_string(path)?;
        Self::from_pkcs8_pem(&pem)
    }
}

#[async_trait]
impl Signer for P256Signer {
    async fn sign(&self, content: &[u8]) -> Result<Vec<u8>, SignerError> {
        let signature: p256::ecdsa::Signature = self
            .key
            .try_sign(content)
            .map_err(|e| SignerError::Signing(e.to_string()))?;
        // JWS wants the fixed size r || s form, not DER
        Ok(signature.to_bytes().to_vec())
    }
}
