use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::fs;

use crate::error::StoreError;

/// Almacenamiento de bytes por clave (fuente, segmentos, resultados).
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
}

/* ---------------- en memoria ---------------- */

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> StoreError {
    StoreError::Transport("mutex envenenado".into())
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        validate_key(key)?;
        let mut blobs = self.blobs.lock().map_err(|_| poisoned())?;
        blobs.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let blobs = self.blobs.lock().map_err(|_| poisoned())?;
        blobs
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let blobs = self.blobs.lock().map_err(|_| poisoned())?;
        Ok(blobs.contains_key(key))
    }
}

/* ---------------- en disco ---------------- */

/// Un archivo por clave debajo de `root`, ej: /data/blobs/tasks/<id>/segments/00000
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // escribir a un temporal y renombrar: un lector nunca ve un blob a medias
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.path_for(key)?;
        Ok(fs::try_exists(&path).await?)
    }
}

/// Claves relativas, sin `..` ni componentes vacíos.
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() || key.starts_with('/') || key.contains("//") || key.ends_with('/') {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    let ok = Path::new(key)
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if !ok {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_put_get_exists() {
        let store = MemoryBlobStore::new();
        assert!(!store.exists("a/b").await.unwrap());

        store.put("a/b", b"hola".to_vec()).await.unwrap();
        assert!(store.exists("a/b").await.unwrap());
        assert_eq!(store.get("a/b").await.unwrap(), b"hola");
        assert!(matches!(
            store.get("a/c").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn fs_store_creates_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        store
            .put("tasks/t1/segments/00000", vec![1, 2, 3])
            .await
            .unwrap();

        assert!(dir.path().join("tasks/t1/segments/00000").is_file());
        assert_eq!(
            store.get("tasks/t1/segments/00000").await.unwrap(),
            vec![1, 2, 3]
        );
        assert!(store.exists("tasks/t1/segments/00000").await.unwrap());
    }

    #[tokio::test]
    async fn fs_store_overwrites_existing_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        store.put("k", b"uno".to_vec()).await.unwrap();
        store.put("k", b"dos".to_vec()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), b"dos");
    }

    #[tokio::test]
    async fn fs_store_missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert!(matches!(
            store.get("nope").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(!store.exists("nope").await.unwrap());
    }

    #[test]
    fn rejects_keys_escaping_the_root() {
        for bad in ["", "/etc/passwd", "../x", "a/../../b", "a//b", "a/", "./a"] {
            assert!(validate_key(bad).is_err(), "{bad}");
        }
        assert!(validate_key("tasks/t1/summary.txt").is_ok());
    }
}
