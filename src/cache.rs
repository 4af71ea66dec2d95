use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::codec::{JsonCodec, ValueCodec};
use crate::error::CacheError;

/// Metadata stored next to every entry's output blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMeta {
    pub codec_tag: String,
    pub compress_level: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub args_json: Value,
}

/// Handle to a content-addressed on-disk store of task outputs.
///
/// Entries are keyed by `(task_name, task_id)` and live under the store
/// root as independent directories:
///
/// ```text
/// entries/<task_name>/<task_id>/value.bin
/// entries/<task_name>/<task_id>/meta.json
/// entries/<task_name>/<task_id>/scratch/
/// entries/<task_name>/<task_id>/stdout.log
/// entries/<task_name>/<task_id>/stderr.log
/// tmp/
/// ```
///
/// Writes are staged in `tmp/` and published by rename; `meta.json` is the
/// commit point, so readers never observe a partial entry. The handle is
/// cheap to clone and shared across workers.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    root: Utf8PathBuf,
    codec: Arc<dyn ValueCodec>,
    locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
    staging: AtomicU64,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("root", &self.inner.root)
            .field("codec", &self.inner.codec.tag())
            .finish()
    }
}

impl Cache {
    /// Opens (creating if necessary) a store rooted at `path`, with the
    /// default JSON codec. Leftover staging files from interrupted writes
    /// are deleted.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        Self::open_with_codec(path, Arc::new(JsonCodec))
    }

    /// Opens a store that round-trips values through the given codec.
    pub fn open_with_codec(
        path: impl AsRef<Path>,
        codec: Arc<dyn ValueCodec>,
    ) -> Result<Self, CacheError> {
        let root = Utf8PathBuf::try_from(path.as_ref().to_path_buf())?;

        fs::create_dir_all(root.join("entries"))?;

        // Staged files are worthless after a crash; an interrupted store
        // never published its rename.
        let tmp = root.join("tmp");
        if tmp.exists() {
            fs::remove_dir_all(&tmp)?;
        }
        fs::create_dir_all(&tmp)?;

        Ok(Self {
            inner: Arc::new(CacheInner {
                root,
                codec,
                locks: Mutex::new(HashMap::new()),
                staging: AtomicU64::new(0),
            }),
        })
    }

    /// The store root directory.
    pub fn root(&self) -> &Utf8Path {
        &self.inner.root
    }

    fn entry_dir(&self, task_name: &str, task_id: &str) -> Utf8PathBuf {
        self.inner
            .root
            .join("entries")
            .join(task_name)
            .join(task_id)
    }

    fn key_lock(&self, task_name: &str, task_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.inner.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry((task_name.to_string(), task_id.to_string()))
            .or_default()
            .clone()
    }

    fn stage_path(&self, suffix: &str) -> Utf8PathBuf {
        let seq = self.inner.staging.fetch_add(1, Ordering::Relaxed);
        self.inner
            .root
            .join("tmp")
            .join(format!("{}-{seq}.{suffix}", std::process::id()))
    }

    fn read_meta(&self, task_name: &str, task_id: &str) -> Result<EntryMeta, CacheError> {
        let dir = self.entry_dir(task_name, task_id);
        let meta_path = dir.join("meta.json");

        let bytes = match fs::read(&meta_path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(CacheError::Miss {
                    task_name: task_name.to_string(),
                    task_id: task_id.to_string(),
                });
            }
            Err(err) => return Err(err.into()),
        };

        let meta: EntryMeta =
            serde_json::from_slice(&bytes).map_err(|err| CacheError::Corrupt {
                task_name: task_name.to_string(),
                task_id: task_id.to_string(),
                reason: format!("unreadable meta.json: {err}"),
            })?;

        if meta.codec_tag != self.inner.codec.tag() {
            return Err(CacheError::Corrupt {
                task_name: task_name.to_string(),
                task_id: task_id.to_string(),
                reason: format!(
                    "entry written with codec '{}', store uses '{}'",
                    meta.codec_tag,
                    self.inner.codec.tag()
                ),
            });
        }

        Ok(meta)
    }

    /// True iff a complete entry exists: readable metadata under the
    /// store's codec and a published output blob. Corrupt entries count as
    /// absent and are logged.
    pub fn has(&self, task_name: &str, task_id: &str) -> bool {
        match self.read_meta(task_name, task_id) {
            Ok(_) => self.entry_dir(task_name, task_id).join("value.bin").exists(),
            Err(err @ CacheError::Corrupt { .. }) => {
                warn!("treating cache entry as missing: {err}");
                false
            }
            Err(_) => false,
        }
    }

    /// Loads the raw output blob and metadata of an entry.
    pub fn load(&self, task_name: &str, task_id: &str) -> Result<(Vec<u8>, EntryMeta), CacheError> {
        let meta = self.read_meta(task_name, task_id)?;
        let value_path = self.entry_dir(task_name, task_id).join("value.bin");

        let blob = match fs::read(&value_path) {
            Ok(blob) => blob,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(CacheError::Miss {
                    task_name: task_name.to_string(),
                    task_id: task_id.to_string(),
                });
            }
            Err(err) => return Err(err.into()),
        };

        Ok((blob, meta))
    }

    /// Loads and decodes an entry's output value.
    pub fn load_value(&self, task_name: &str, task_id: &str) -> Result<Value, CacheError> {
        let (blob, _meta) = self.load(task_name, task_id)?;
        self.inner.codec.decode(&blob).map_err(|err| {
            let corrupt = CacheError::Corrupt {
                task_name: task_name.to_string(),
                task_id: task_id.to_string(),
                reason: format!("undecodable value.bin: {err}"),
            };
            warn!("{corrupt}");
            corrupt
        })
    }

    /// Encodes and persists an output value atomically.
    ///
    /// The blob and metadata are staged in `tmp/`, fsynced, and published by
    /// rename with `meta.json` last. Once this returns, `has` observes the
    /// entry from any worker. Writers to one key are serialised.
    pub fn store_value(
        &self,
        task_name: &str,
        task_id: &str,
        value: &Value,
        compress_level: Option<i32>,
        args_json: Value,
    ) -> Result<(), CacheError> {
        let blob = self.inner.codec.encode(value, compress_level)?;
        let meta = EntryMeta {
            codec_tag: self.inner.codec.tag().to_string(),
            compress_level,
            created_at: Utc::now(),
            args_json,
        };

        let lock = self.key_lock(task_name, task_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let dir = self.entry_dir(task_name, task_id);
        fs::create_dir_all(dir.join("scratch"))?;

        let staged_value = self.stage_path("bin");
        write_synced(&staged_value, &blob)?;
        fs::rename(&staged_value, dir.join("value.bin"))?;

        let staged_meta = self.stage_path("json");
        write_synced(&staged_meta, &serde_json::to_vec_pretty(&meta).map_err(std::io::Error::other)?)?;
        fs::rename(&staged_meta, dir.join("meta.json"))?;

        Ok(())
    }

    /// The entry's scratch directory, created on first access.
    pub fn scratch_dir(&self, task_name: &str, task_id: &str) -> Result<Utf8PathBuf, CacheError> {
        let dir = self.entry_dir(task_name, task_id).join("scratch");
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Empties the entry's scratch directory. Called right before a body is
    /// about to (re)compute.
    pub(crate) fn reset_scratch(&self, task_name: &str, task_id: &str) -> Result<Utf8PathBuf, CacheError> {
        let dir = self.entry_dir(task_name, task_id).join("scratch");
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// The entry's stdout and stderr log paths, for redirection by the
    /// dispatcher. The entry directory is created if needed.
    pub fn paths_for(
        &self,
        task_name: &str,
        task_id: &str,
    ) -> Result<(Utf8PathBuf, Utf8PathBuf), CacheError> {
        let dir = self.entry_dir(task_name, task_id);
        fs::create_dir_all(&dir)?;
        Ok((dir.join("stdout.log"), dir.join("stderr.log")))
    }

    /// Removes one entry and its scratch directory. Absent entries are fine.
    pub fn drop_entry(&self, task_name: &str, task_id: &str) -> Result<(), CacheError> {
        let lock = self.key_lock(task_name, task_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let dir = self.entry_dir(task_name, task_id);
        if !dir.exists() {
            return Ok(());
        }

        // Unpublish the commit point first so a reader racing with the
        // removal sees a clean miss rather than a half-deleted entry.
        let meta = dir.join("meta.json");
        if meta.exists() {
            fs::remove_file(&meta)?;
        }
        fs::remove_dir_all(&dir)?;

        Ok(())
    }

    /// Removes every entry under a task type.
    pub fn drop_all(&self, task_name: &str) -> Result<(), CacheError> {
        let dir = self.inner.root.join("entries").join(task_name);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Lists the entry ids currently stored under a task type.
    pub fn entries(&self, task_name: &str) -> Result<Vec<String>, CacheError> {
        let dir = self.inner.root.join("entries").join(task_name);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in dir.read_dir_utf8()? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                ids.push(entry.file_name().to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

fn write_synced(path: &Utf8Path, bytes: &[u8]) -> Result<(), CacheError> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}
