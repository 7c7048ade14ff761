use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use crate::error::{AuthError, AuthResult};

/// JSON credential file with atomic replacement.
///
/// Writes go to `<path>.tmp` and are renamed over the target, so a reader
/// observes either the previous content or the new content, never a
/// truncated file. A per-store mutex serializes writers in-process.
pub struct CredentialStore<T> {
    path: PathBuf,
    write_lock: Mutex<()>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> CredentialStore<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> AuthResult<Option<T>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(AuthError::Storage(err.to_string())),
        };
        let value = serde_json::from_slice(&raw)
            .map_err(|err| AuthError::Invalid(err.to_string()))?;
        Ok(Some(value))
    }

    pub async fn save(&self, value: &T) -> AuthResult<()> {
        let _guard = self.write_lock.lock().await;
        let raw = serde_json::to_vec_pretty(value)
            .map_err(|err| AuthError::Invalid(err.to_string()))?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| AuthError::Storage(err.to_string()))?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &raw)
            .await
            .map_err(|err| AuthError::Storage(err.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|err| AuthError::Storage(err.to_string()))?;
        Ok(())
    }
}
