use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;

use super::{Kv, RecordStore, StorageResult};

/// JSON-file-backed storage. One file holds the root KV namespace
/// (`kv.json`); each record store gets its own `<store>.json` file of
/// `{id: value}`. Writes are atomic: a temp file is written and renamed
/// over the target, so a crash mid-write never leaves a corrupt file.
pub struct FileStorage {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileStorage {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn kv_path(&self) -> PathBuf {
        self.dir.join("kv.json")
    }

    fn store_path(&self, store: &str) -> PathBuf {
        self.dir.join(format!("{store}.json"))
    }

    async fn read_map(path: &Path) -> StorageResult<HashMap<String, String>> {
        match fs::read_to_string(path).await {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_map_atomic(&self, path: &Path, map: &HashMap<String, String>) -> StorageResult<()> {
        let contents = serde_json::to_string(map)?;
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, contents).await?;
        fs::rename(&temp_path, path).await?;
        Ok(())
    }
}

#[async_trait(?Send)]
impl Kv for FileStorage {
    async fn init(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let map = Self::read_map(&self.kv_path()).await?;
        Ok(map.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut map = Self::read_map(&self.kv_path()).await?;
        map.insert(key.to_string(), value.to_string());
        self.write_map_atomic(&self.kv_path(), &map).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut map = Self::read_map(&self.kv_path()).await?;
        map.remove(key);
        self.write_map_atomic(&self.kv_path(), &map).await
    }

    async fn clear(&self) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        self.write_map_atomic(&self.kv_path(), &HashMap::new()).await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let map = Self::read_map(&self.kv_path()).await?;
        Ok(map.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }
}

#[async_trait(?Send)]
impl RecordStore for FileStorage {
    async fn set_record(&self, store: &str, id: &str, value: &str) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.store_path(store);
        let mut map = Self::read_map(&path).await?;
        map.insert(id.to_string(), value.to_string());
        self.write_map_atomic(&path, &map).await
    }

    async fn get_record(&self, store: &str, id: &str) -> StorageResult<Option<String>> {
        let map = Self::read_map(&self.store_path(store)).await?;
        Ok(map.get(id).cloned())
    }

    async fn delete_record(&self, store: &str, id: &str) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.store_path(store);
        let mut map = Self::read_map(&path).await?;
        map.remove(id);
        self.write_map_atomic(&path, &map).await
    }

    async fn get_records(&self, store: &str) -> StorageResult<Vec<(String, String)>> {
        let map = Self::read_map(&self.store_path(store)).await?;
        Ok(map.into_iter().collect())
    }

    async fn set_records(&self, store: &str, records: Vec<(String, String)>) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.store_path(store);
        let mut map = Self::read_map(&path).await?;
        for (id, value) in records {
            map.insert(id, value);
        }
        self.write_map_atomic(&path, &map).await
    }

    async fn delete_records(&self, store: &str, ids: &[String]) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.store_path(store);
        let mut map = Self::read_map(&path).await?;
        for id in ids {
            map.remove(id);
        }
        self.write_map_atomic(&path, &map).await
    }

    async fn clear_store(&self, store: &str) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        self.write_map_atomic(&self.store_path(store), &HashMap::new()).await
    }
}
