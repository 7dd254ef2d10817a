//! File-backed result cache for judge outputs.
//!
//! Write-through JSON-object store keyed by
//! `"{question_id}:{config_hash}:{model_name}"`. The file loads lazily and
//! exactly once; a corrupt or missing file reads as an empty cache and is
//! overwritten on the next save. Writes stay in memory until [`ResultCache::save`],
//! which persists atomically via a `path.tmp → path` rename.

use crate::core::ClassificationDecision;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One cache entry: the decision plus its write timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Cached judge output.
    pub result: ClassificationDecision,
    /// RFC 3339 timestamp of the write.
    pub cached_at: String,
}

#[derive(Default)]
struct CacheState {
    loaded: bool,
    data: BTreeMap<String, CacheEntry>,
}

/// Content-addressed cache of classification decisions.
pub struct ResultCache {
    path: PathBuf,
    state: Mutex<CacheState>,
}

fn cache_key(question_id: i64, config_hash: &str, model_name: &str) -> String {
    format!("{question_id}:{config_hash}:{model_name}")
}

impl ResultCache {
    /// Creates a cache backed by the given file path. No I/O happens until
    /// the first read or save.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(CacheState::default()),
        }
    }

    /// The backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_loaded(&self, state: &mut CacheState) {
        if state.loaded {
            return;
        }
        state.loaded = true;
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(data) => state.data = data,
                Err(error) => {
                    tracing::warn!(path = %self.path.display(), %error, "cache file corrupt, starting empty");
                    state.data = BTreeMap::new();
                }
            },
            Err(_) => state.data = BTreeMap::new(),
        }
    }

    /// Looks up a cached decision.
    #[must_use]
    pub fn get(
        &self,
        question_id: i64,
        config_hash: &str,
        model_name: &str,
    ) -> Option<ClassificationDecision> {
        self.get_entry(question_id, config_hash, model_name)
            .map(|entry| entry.result)
    }

    /// Looks up a full cache entry (decision plus timestamp).
    #[must_use]
    pub fn get_entry(
        &self,
        question_id: i64,
        config_hash: &str,
        model_name: &str,
    ) -> Option<CacheEntry> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        self.ensure_loaded(&mut state);
        state
            .data
            .get(&cache_key(question_id, config_hash, model_name))
            .cloned()
    }

    /// Stores a decision, stamping `cached_at` with the current time.
    /// In-memory until [`Self::save`].
    pub fn set(
        &self,
        question_id: i64,
        config_hash: &str,
        model_name: &str,
        result: ClassificationDecision,
    ) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        self.ensure_loaded(&mut state);
        state.data.insert(
            cache_key(question_id, config_hash, model_name),
            CacheEntry {
                result,
                cached_at: chrono::Utc::now().to_rfc3339(),
            },
        );
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        self.ensure_loaded(&mut state);
        state.data.len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persists the cache atomically: serialize to `path.tmp`, then rename
    /// over `path`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the write or rename fails.
    pub fn save(&self) -> Result<()> {
        let state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let serialized = serde_json::to_string_pretty(&state.data)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| Error::Io(e.to_string()))?;
            }
        }
        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, serialized).map_err(|e| Error::Io(e.to_string()))?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| Error::Io(e.to_string()))?;
        Ok(())
    }
}
