//! # Authorization Module
//!
//! Operator tokens guarding command submission.
//!
//! An operator trades the shared passphrase for a random token once; every
//! command must carry a token the [`AuthStore`] knows. Tokens survive
//! restarts in a JSON file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use rand::RngCore;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};

/// Random bytes per token before hex encoding
pub const TOKEN_BYTES: usize = 32;

/// Persistent set of authorized tokens
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuthStore: Send + Sync {
    async fn is_authorized(&self, token: &str) -> bool;

    async fn add(&self, token: String) -> Result<()>;

    /// Forget `token`. Unknown tokens are not an error.
    async fn remove(&self, token: &str) -> Result<()>;
}

/// Token store kept in a JSON array on disk
///
/// The whole file is rewritten on every change.
#[derive(Debug)]
pub struct FileAuthStore {
    path: PathBuf,
    tokens: Mutex<Vec<String>>,
}

impl FileAuthStore {
    /// Load the store at `path`, creating an empty one if it does not exist.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Decode`] if the file is not a JSON array of strings,
    /// [`GatewayError::Io`] if it cannot be read or created.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let tokens = match tokio::fs::read(&path).await {
            Ok(contents) => serde_json::from_slice(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Creating empty token store at {}", path.display());
                write_tokens(&path, &[]).await?;
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };

        debug!("Loaded {} authorized tokens from {}", tokens.len(), path.display());
        Ok(Self {
            path,
            tokens: Mutex::new(tokens),
        })
    }
}

async fn write_tokens(path: &Path, tokens: &[String]) -> Result<()> {
    let contents = serde_json::to_vec(tokens)?;
    tokio::fs::write(path, contents).await?;
    Ok(())
}

#[async_trait]
impl AuthStore for FileAuthStore {
    async fn is_authorized(&self, token: &str) -> bool {
        self.tokens.lock().await.iter().any(|known| known == token)
    }

    async fn add(&self, token: String) -> Result<()> {
        let mut tokens = self.tokens.lock().await;
        if !tokens.contains(&token) {
            tokens.push(token);
            write_tokens(&self.path, &tokens).await?;
        }
        Ok(())
    }

    async fn remove(&self, token: &str) -> Result<()> {
        let mut tokens = self.tokens.lock().await;
        let before = tokens.len();
        tokens.retain(|known| known != token);
        if tokens.len() != before {
            write_tokens(&self.path, &tokens).await?;
        }
        Ok(())
    }
}

/// Generate a fresh hex-encoded token.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Passphrase exchange and token checks in front of an [`AuthStore`]
#[derive(Clone)]
pub struct AuthGate {
    store: Arc<dyn AuthStore>,
    passphrase: String,
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate").finish_non_exhaustive()
    }
}

impl AuthGate {
    pub fn new(store: Arc<dyn AuthStore>, passphrase: impl Into<String>) -> Self {
        Self {
            store,
            passphrase: passphrase.into(),
        }
    }

    pub async fn is_authorized(&self, token: &str) -> bool {
        self.store.is_authorized(token).await
    }

    /// Exchange the passphrase for a new stored token.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Unauthorized`] for a wrong passphrase.
    pub async fn authorize(&self, passphrase: &str) -> Result<String> {
        if passphrase != self.passphrase {
            warn!("Rejected authorization attempt with wrong passphrase");
            return Err(GatewayError::Unauthorized);
        }

        let token = generate_token();
        self.store.add(token.clone()).await?;
        info!("Issued new operator token");
        Ok(token)
    }

    pub async fn revoke(&self, token: &str) -> Result<()> {
        self.store.remove(token).await?;
        info!("Revoked operator token");
        Ok(())
    }
}
