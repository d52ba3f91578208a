//! A file-backed token store

use std::{
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};

use super::{StoreError, TokenStore};
use crate::{RefreshToken, RefreshTokenRef};

const REFRESH_TOKEN_KEY: &str = "refresh_token";

/// A refresh token store that uses a local JSON file
///
/// Other keys present in the file are left untouched. Writes go to a
/// sibling temporary file, readable only by the owner, which then replaces
/// the original in a single rename.
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileTokenStore {
    /// Constructs a new file token store
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// The path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_document(&self) -> Result<Option<Map<String, Value>>, io::Error> {
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };

        #[cfg(unix)]
        self.warn_if_exposed().await;

        let document = serde_json::from_slice(&data)?;
        Ok(Some(document))
    }

    #[cfg(unix)]
    async fn warn_if_exposed(&self) {
        use std::os::unix::fs::PermissionsExt;

        if let Ok(meta) = fs::metadata(&self.path).await {
            let mode = meta.permissions().mode();
            if mode & 0o077 != 0 {
                tracing::warn!(
                    path = %self.path.display(),
                    mode = format_args!("{:o}", mode & 0o777),
                    "credential file is accessible to other users; consider `chmod 600`"
                );
            }
        }
    }

    async fn write_document(&self, document: &Map<String, Value>) -> Result<(), io::Error> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700)).await?;
            }
        }

        let mut temp_name = self.path.file_name().unwrap_or_default().to_owned();
        temp_name.push(".tmp");
        let temp_path = self.path.with_file_name(temp_name);

        let mut file_opts = fs::OpenOptions::new();
        file_opts.create(true).truncate(true).write(true);

        #[cfg(unix)]
        file_opts.mode(0o600);

        let mut file = file_opts.open(&temp_path).await?;
        let data = serde_json::to_vec_pretty(document)?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &self.path).await
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn load(&self) -> Result<Option<RefreshToken>, StoreError> {
        let token = self
            .read_document()
            .await?
            .and_then(|mut doc| match doc.remove(REFRESH_TOKEN_KEY) {
                Some(Value::String(token)) if !token.is_empty() => Some(RefreshToken::new(token)),
                _ => None,
            });

        tracing::debug!(
            path = %self.path.display(),
            found = token.is_some(),
            "loaded refresh token from file"
        );
        Ok(token)
    }

    async fn save(&self, refresh_token: &RefreshTokenRef) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let mut document = match self.read_document().await {
            Ok(doc) => doc.unwrap_or_default(),
            Err(error) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = (&error as &dyn std::error::Error),
                    "existing credential file is unreadable, replacing it"
                );
                Map::new()
            }
        };

        document.insert(
            REFRESH_TOKEN_KEY.to_owned(),
            Value::String(refresh_token.as_str().to_owned()),
        );

        self.write_document(&document).await?;
        tracing::debug!(path = %self.path.display(), "persisted refresh token");
        Ok(())
    }
}
