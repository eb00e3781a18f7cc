//! Artifact download and release signature verification.

use std::io::Read;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Where release artifacts come from.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Downloads `url` into `dest`, replacing any existing file.
    async fn fetch_to(&self, url: &str, dest: &Path) -> Result<u64>;

    /// Fetches a small document (a signature) into memory.
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>>;
}

/// Artifact source over plain HTTP(S).
pub struct HttpArtifactSource {
    client: reqwest::Client,
}

impl HttpArtifactSource {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("GET {url} returned {status}");
        }
        Ok(response)
    }
}

#[async_trait]
impl ArtifactSource for HttpArtifactSource {
    async fn fetch_to(&self, url: &str, dest: &Path) -> Result<u64> {
        let mut response = self.get(url).await?;
        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("failed to create {}", dest.display()))?;

        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        debug!(url, bytes = written, path = %dest.display(), "Downloaded artifact");
        Ok(written)
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.get(url).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("invalid public key: {0}")]
    InvalidKey(String),

    #[error("malformed signature")]
    Malformed,

    #[error("signature does not match artifact")]
    Mismatch,

    #[error("failed to read artifact: {0}")]
    Io(#[from] std::io::Error),
}

/// Checks release signatures against the signer's Ed25519 key.
///
/// The signed message is the SHA-256 digest of the artifact file.
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    key: VerifyingKey,
}

impl SignatureVerifier {
    pub fn new(key: VerifyingKey) -> Self {
        Self { key }
    }

    /// Parses a 32-byte public key given as hex or base64.
    pub fn from_encoded(encoded: &str) -> Result<Self, SignatureError> {
        let bytes = decode_text(encoded.trim())
            .ok_or_else(|| SignatureError::InvalidKey("expected hex or base64".to_string()))?;
        let bytes: [u8; PUBLIC_KEY_LENGTH] = bytes.try_into().map_err(|b: Vec<u8>| {
            SignatureError::InvalidKey(format!("expected {PUBLIC_KEY_LENGTH} bytes, got {}", b.len()))
        })?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
        Ok(Self { key })
    }

    /// Verifies `signature` (raw 64 bytes, hex or base64) over the artifact.
    pub fn verify_file(&self, path: &Path, signature: &[u8]) -> Result<(), SignatureError> {
        let signature = parse_signature(signature).ok_or(SignatureError::Malformed)?;
        let digest = file_digest(path)?;
        self.key
            .verify(&digest, &signature)
            .map_err(|_| SignatureError::Mismatch)
    }
}

pub fn file_digest(path: &Path) -> std::io::Result<[u8; 32]> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

fn parse_signature(raw: &[u8]) -> Option<Signature> {
    if let Ok(bytes) = <[u8; SIGNATURE_LENGTH]>::try_from(raw) {
        return Some(Signature::from_bytes(&bytes));
    }
    let text = std::str::from_utf8(raw).ok()?.trim();
    let bytes: [u8; SIGNATURE_LENGTH] = decode_text(text)?.try_into().ok()?;
    Some(Signature::from_bytes(&bytes))
}

fn decode_text(text: &str) -> Option<Vec<u8>> {
    hex::decode(text)
        .ok()
        .or_else(|| base64::engine::general_purpose::STANDARD.decode(text).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use std::io::Write;

    fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    fn artifact(content: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file
    }

    fn sign(key: &SigningKey, path: &Path) -> Signature {
        key.sign(&file_digest(path).unwrap())
    }

    #[test]
    fn test_verifies_raw_hex_and_base64_signatures() {
        let key = signing_key();
        let file = artifact(b"release 1.2.3");
        let verifier = SignatureVerifier::new(key.verifying_key());
        let sig = sign(&key, file.path());

        let raw = sig.to_bytes();
        let hexed = hex::encode(raw);
        let b64 = base64::engine::general_purpose::STANDARD.encode(raw);

        verifier.verify_file(file.path(), &raw).unwrap();
        verifier.verify_file(file.path(), format!("{hexed}\n").as_bytes()).unwrap();
        verifier.verify_file(file.path(), b64.as_bytes()).unwrap();
    }

    #[test]
    fn test_rejects_tampered_artifact() {
        let key = signing_key();
        let file = artifact(b"release 1.2.3");
        let sig = sign(&key, file.path());

        let tampered = artifact(b"release 1.2.4");
        let verifier = SignatureVerifier::new(key.verifying_key());
        let err = verifier.verify_file(tampered.path(), &sig.to_bytes()).unwrap_err();
        assert!(matches!(err, SignatureError::Mismatch));
    }

    #[test]
    fn test_rejects_other_signer() {
        let file = artifact(b"release");
        let other = SigningKey::from_bytes(&[9u8; 32]);
        let sig = sign(&other, file.path());

        let verifier = SignatureVerifier::new(signing_key().verifying_key());
        assert!(verifier.verify_file(file.path(), &sig.to_bytes()).is_err());
    }

    #[test]
    fn test_rejects_garbage_signature() {
        let file = artifact(b"release");
        let verifier = SignatureVerifier::new(signing_key().verifying_key());
        let err = verifier.verify_file(file.path(), b"not a signature").unwrap_err();
        assert!(matches!(err, SignatureError::Malformed));
    }

    #[test]
    fn test_public_key_encodings() {
        let public = signing_key().verifying_key().to_bytes();
        assert!(SignatureVerifier::from_encoded(&hex::encode(public)).is_ok());
        assert!(
            SignatureVerifier::from_encoded(&base64::engine::general_purpose::STANDARD.encode(public))
                .is_ok()
        );
        assert!(matches!(
            SignatureVerifier::from_encoded("abcd"),
            Err(SignatureError::InvalidKey(_))
        ));
    }
}
