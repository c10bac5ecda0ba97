//! File-backed cache stores.
//!
//! Each store is a directory named after the URL-encoded store name. It
//! holds an `index.json` with every entry's metadata and one raw body file
//! per entry. The index is rewritten through a temp file and renamed into
//! place; that rename is the commit point for writes, so a reader never
//! sees a half-written store and a batch lands whole or not at all.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::storage::{missing_store, CacheEntry, CacheStorage, RequestKey};
use crate::ServiceWorkerError;

const INDEX: &str = "index.json";
const INDEX_TMP: &str = "index.json.tmp";
const BODY_EXTENSION: &str = "body";

/// Everything about an entry except its body.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    url: String,
    status: u16,
    headers: Vec<(String, String)>,
    cached_at: u64,
    body_file: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreIndex {
    name: String,
    next_id: u64,
    entries: BTreeMap<RequestKey, IndexEntry>,
}

impl StoreIndex {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    fn allocate_body_file(&mut self) -> String {
        let id = self.next_id;
        self.next_id += 1;
        format!("{id:016x}.{BODY_EXTENSION}")
    }
}

/// Stores persisted under a root directory.
#[derive(Debug)]
pub struct DiskCacheStorage {
    root: PathBuf,
    // Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl DiskCacheStorage {
    /// Use `root`, creating it if needed.
    pub async fn open_dir(root: impl Into<PathBuf>) -> Result<Self, ServiceWorkerError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "Disk cache storage ready");
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn store_dir(&self, cache: &str) -> PathBuf {
        self.root.join(urlencoding::encode(cache).into_owned())
    }

    async fn read_index(&self, cache: &str) -> Result<Option<StoreIndex>, ServiceWorkerError> {
        match fs::read(self.store_dir(cache).join(INDEX)).await {
            Ok(raw) => serde_json::from_slice(&raw).map(Some).map_err(|e| {
                ServiceWorkerError::CacheError(format!("corrupt store {cache:?}: {e}"))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn existing_index(&self, cache: &str) -> Result<StoreIndex, ServiceWorkerError> {
        self.read_index(cache)
            .await?
            .ok_or_else(|| missing_store(cache))
    }

    async fn commit_index(&self, index: &StoreIndex) -> Result<(), ServiceWorkerError> {
        let dir = self.store_dir(&index.name);
        let tmp = dir.join(INDEX_TMP);
        let raw =
            serde_json::to_vec(index).map_err(|e| ServiceWorkerError::CacheError(e.to_string()))?;

        fs::write(&tmp, raw).await?;
        fs::rename(&tmp, dir.join(INDEX)).await?;
        trace!(cache = %index.name, entries = index.entries.len(), "Index committed");
        Ok(())
    }

    /// Write a body file per entry and record it in `index`. Written paths
    /// go to `written`; the returned paths are bodies the entries replace.
    async fn stage(
        &self,
        index: &mut StoreIndex,
        entries: Vec<(RequestKey, CacheEntry)>,
        written: &mut Vec<PathBuf>,
    ) -> Result<Vec<PathBuf>, ServiceWorkerError> {
        let dir = self.store_dir(&index.name);
        let mut replaced = Vec::new();

        for (key, entry) in entries {
            let body_file = index.allocate_body_file();
            let path = dir.join(&body_file);
            fs::write(&path, &entry.body).await?;
            written.push(path);

            let meta = IndexEntry {
                url: entry.url,
                status: entry.status,
                headers: entry.headers,
                cached_at: entry.cached_at,
                body_file,
            };
            if let Some(old) = index.entries.insert(key, meta) {
                replaced.push(dir.join(old.body_file));
            }
        }
        Ok(replaced)
    }

    async fn write_entries(
        &self,
        cache: &str,
        entries: Vec<(RequestKey, CacheEntry)>,
    ) -> Result<(), ServiceWorkerError> {
        let _guard = self.write_lock.lock().await;
        let mut index = self.existing_index(cache).await?;

        let mut written = Vec::with_capacity(entries.len());
        let committed = match self.stage(&mut index, entries, &mut written).await {
            Ok(replaced) => self.commit_index(&index).await.map(|()| replaced),
            Err(err) => Err(err),
        };

        match committed {
            Ok(replaced) => {
                remove_bodies(&replaced).await;
                Ok(())
            }
            Err(err) => {
                remove_bodies(&written).await;
                Err(err)
            }
        }
    }
}

async fn remove_bodies(paths: &[PathBuf]) {
    for path in paths {
        match fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => debug!(file = %path.display(), error = %e, "Leaving orphaned body"),
        }
    }
}

#[async_trait]
impl CacheStorage for DiskCacheStorage {
    async fn open(&self, cache: &str) -> Result<bool, ServiceWorkerError> {
        let _guard = self.write_lock.lock().await;
        if self.read_index(cache).await?.is_some() {
            return Ok(false);
        }
        // A directory without an index is the residue of an interrupted delete.
        let dir = self.store_dir(cache);
        if fs::try_exists(&dir).await? {
            fs::remove_dir_all(&dir).await?;
        }
        fs::create_dir_all(&dir).await?;
        self.commit_index(&StoreIndex::new(cache)).await?;
        Ok(true)
    }

    async fn has(&self, cache: &str) -> Result<bool, ServiceWorkerError> {
        Ok(fs::try_exists(self.store_dir(cache).join(INDEX)).await?)
    }

    async fn get(
        &self,
        cache: &str,
        key: &RequestKey,
    ) -> Result<Option<CacheEntry>, ServiceWorkerError> {
        let Some(meta) = self
            .read_index(cache)
            .await?
            .and_then(|mut index| index.entries.remove(key))
        else {
            return Ok(None);
        };

        let body = match fs::read(self.store_dir(cache).join(&meta.body_file)).await {
            Ok(body) => body,
            // Replaced or deleted after the index was read.
            Err(e) if e.kind() == ErrorKind::NotFound => {
                trace!(cache, key = %key, "Body vanished during lookup");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Some(CacheEntry {
            url: meta.url,
            status: meta.status,
            headers: meta.headers,
            body,
            cached_at: meta.cached_at,
        }))
    }

    async fn put(
        &self,
        cache: &str,
        key: RequestKey,
        entry: CacheEntry,
    ) -> Result<(), ServiceWorkerError> {
        self.write_entries(cache, vec![(key, entry)]).await
    }

    async fn put_all(
        &self,
        cache: &str,
        entries: Vec<(RequestKey, CacheEntry)>,
    ) -> Result<(), ServiceWorkerError> {
        self.write_entries(cache, entries).await
    }

    async fn delete(&self, cache: &str, key: &RequestKey) -> Result<bool, ServiceWorkerError> {
        let _guard = self.write_lock.lock().await;
        let Some(mut index) = self.read_index(cache).await? else {
            return Ok(false);
        };
        let Some(old) = index.entries.remove(key) else {
            return Ok(false);
        };
        self.commit_index(&index).await?;
        remove_bodies(&[self.store_dir(cache).join(old.body_file)]).await;
        Ok(true)
    }

    async fn delete_cache(&self, cache: &str) -> Result<bool, ServiceWorkerError> {
        let _guard = self.write_lock.lock().await;
        let dir = self.store_dir(cache);
        // Dropping the index first makes the store vanish in one step.
        match fs::remove_file(dir.join(INDEX)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        fs::remove_dir_all(&dir).await?;
        Ok(true)
    }

    async fn list_names(&self) -> Result<Vec<String>, ServiceWorkerError> {
        let mut names = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if !fs::try_exists(path.join(INDEX)).await? {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            match urlencoding::decode(file_name) {
                Ok(name) => names.push(name.into_owned()),
                Err(e) => debug!(dir = %path.display(), error = %e, "Skipping foreign directory"),
            }
        }
        names.sort();
        Ok(names)
    }

    async fn keys(&self, cache: &str) -> Result<Vec<RequestKey>, ServiceWorkerError> {
        Ok(self
            .read_index(cache)
            .await?
            .map(|index| index.entries.into_keys().collect())
            .unwrap_or_default())
    }
}
