//! Catalog of published files.
//!
//! Every completed upload is recorded here under a fresh `file_id`, so a later
//! download can name the file by id instead of by path.
//!
//! ## Features
//!
//! - Maps `file_id` to [`FileInfo`] (path, size, digest, metadata)
//! - Persists to a versioned JSON file, replaced atomically on save
//! - Lists entries newest first and removes them on request
//! - Drains entries older than the retention period

use std::collections::HashMap;
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum::Checksum;
use crate::error::{Error, Result};

/// File name of the catalog inside the state directory.
pub const CATALOG_FILE: &str = "catalog.json";

/// A file published into the storage root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Catalog identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    /// File name, without directories
    pub file_name: String,
    /// Path relative to the storage root, `/`-separated
    pub file_path: String,
    /// Size in bytes
    pub file_size: u64,
    /// Content type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Whole-file digest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
    /// Free-form metadata supplied at completion
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Publication time
    pub created_at: DateTime<Utc>,
}

/// Serializable wrapper for the catalog file.
#[derive(Debug, Serialize, Deserialize)]
struct CatalogDatabase {
    /// Version of the catalog format
    version: u32,
    /// Catalogued files
    files: Vec<FileInfo>,
}

/// Persistent `file_id` -> [`FileInfo`] map.
#[derive(Debug)]
pub struct FileCatalog {
    path: PathBuf,
    files: HashMap<String, FileInfo>,
}

impl FileCatalog {
    /// Open the catalog stored in `state_dir`, starting empty when absent.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing catalog cannot be read or parsed.
    pub fn open(state_dir: &Path) -> Result<Self> {
        Self::load_from(state_dir.join(CATALOG_FILE))
    }

    /// Load from a specific path.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing catalog cannot be read or parsed.
    pub fn load_from(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self {
                path,
                files: HashMap::new(),
            });
        }

        let file = fs::File::open(&path).map_err(|e| {
            Error::ConfigError(format!(
                "Failed to open catalog at {}: {e}",
                path.display()
            ))
        })?;

        let db: CatalogDatabase = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            Error::ConfigError(format!(
                "Failed to parse catalog at {}: {e}",
                path.display()
            ))
        })?;

        let files = db
            .files
            .into_iter()
            .filter_map(|info| info.file_id.clone().map(|id| (id, info)))
            .collect::<HashMap<_, _>>();

        tracing::debug!(path = %path.display(), files = files.len(), "Loaded file catalog");

        Ok(Self { path, files })
    }

    /// Write the catalog to disk via a temporary file and rename.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be written.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut files: Vec<FileInfo> = self.files.values().cloned().collect();
        files.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let db = CatalogDatabase { version: 1, files };

        let temp_path = self.path.with_extension("json.tmp");
        let file = fs::File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &db)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    /// Record a published file, assigning a `file_id` if it has none.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be saved.
    pub fn insert(&mut self, mut info: FileInfo) -> Result<FileInfo> {
        let id = info
            .file_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();

        // A re-published path replaces its previous entry.
        self.files
            .retain(|existing_id, existing| existing_id == &id || existing.file_path != info.file_path);
        self.files.insert(id, info.clone());
        self.save()?;
        Ok(info)
    }

    /// Look up a file by id.
    #[must_use]
    pub fn get(&self, file_id: &str) -> Option<&FileInfo> {
        self.files.get(file_id)
    }

    /// Look up a file by its relative path.
    #[must_use]
    pub fn find_by_path(&self, file_path: &str) -> Option<&FileInfo> {
        self.files.values().find(|info| info.file_path == file_path)
    }

    /// All entries, newest first.
    #[must_use]
    pub fn list(&self) -> Vec<&FileInfo> {
        let mut files: Vec<&FileInfo> = self.files.values().collect();
        files.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.file_path.cmp(&b.file_path))
        });
        files
    }

    /// Remove an entry and return it.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be saved.
    pub fn remove(&mut self, file_id: &str) -> Result<Option<FileInfo>> {
        let removed = self.files.remove(file_id);
        if removed.is_some() {
            self.save()?;
        }
        Ok(removed)
    }

    /// Remove entries created before `now - max_age` and return them.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be saved.
    pub fn drain_older_than(&mut self, max_age: chrono::Duration) -> Result<Vec<FileInfo>> {
        let cutoff = Utc::now() - max_age;
        let expired: Vec<String> = self
            .files
            .iter()
            .filter(|(_, info)| info.created_at < cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        if expired.is_empty() {
            return Ok(Vec::new());
        }

        let drained: Vec<FileInfo> = expired
            .iter()
            .filter_map(|id| self.files.remove(id))
            .collect();
        self.save()?;

        tracing::debug!(removed = drained.len(), "Drained expired catalog entries");
        Ok(drained)
    }

    /// Number of catalogued files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Path of the catalog file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
