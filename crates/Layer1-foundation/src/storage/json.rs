//! JSON file storage

use crate::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Directory name used for project and global configuration
pub const CONFIG_DIR: &str = "cmdgate";

/// JSON documents under a base directory
#[derive(Debug, Clone)]
pub struct JsonStore {
    base_dir: PathBuf,
}

impl JsonStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Global config (`~/.config/cmdgate/`)
    pub fn global() -> Result<Self> {
        let dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Cannot find config directory".to_string()))?
            .join(CONFIG_DIR);
        Ok(Self::new(dir))
    }

    /// Project config (`.cmdgate/`)
    pub fn project(root: impl Into<PathBuf>) -> Self {
        Self::new(root.into().join(format!(".{}", CONFIG_DIR)))
    }

    pub fn current_project() -> Result<Self> {
        let cwd = std::env::current_dir()
            .map_err(|e| Error::Config(format!("Cannot get current directory: {}", e)))?;
        Ok(Self::project(cwd))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn file_path(&self, filename: &str) -> PathBuf {
        self.base_dir.join(filename)
    }

    fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            std::fs::create_dir_all(&self.base_dir).map_err(|e| {
                Error::Storage(format!(
                    "Failed to create directory {}: {}",
                    self.base_dir.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    pub fn load<T: DeserializeOwned>(&self, filename: &str) -> Result<T> {
        let path = self.file_path(filename);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::Storage(format!("Failed to read {}: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Storage(format!("Failed to parse {}: {}", path.display(), e)))
    }

    pub fn load_or_default<T: DeserializeOwned + Default>(&self, filename: &str) -> T {
        self.load(filename).unwrap_or_default()
    }

    pub fn load_optional<T: DeserializeOwned>(&self, filename: &str) -> Result<Option<T>> {
        let path = self.file_path(filename);
        if !path.exists() {
            return Ok(None);
        }
        self.load(filename).map(Some)
    }

    /// Save atomically: the document is written to a sibling temp file and
    /// renamed over the target, so readers see the old or the new content.
    pub fn save<T: Serialize>(&self, filename: &str, data: &T) -> Result<()> {
        self.ensure_dir()?;
        self.write_atomic(filename, data)
    }

    /// Atomic save into a directory that must already exist. A directory
    /// removed or renamed away by someone else is reported, never recreated.
    pub fn replace<T: Serialize>(&self, filename: &str, data: &T) -> Result<()> {
        if !self.base_dir.is_dir() {
            return Err(Error::NotFound(format!(
                "Directory {}",
                self.base_dir.display()
            )));
        }
        self.write_atomic(filename, data)
    }

    fn write_atomic<T: Serialize>(&self, filename: &str, data: &T) -> Result<()> {
        let path = self.file_path(filename);
        let tmp = self
            .base_dir
            .join(format!(".{}.tmp-{}", filename, Uuid::new_v4().simple()));

        let content = serde_json::to_string_pretty(data)?;
        std::fs::write(&tmp, content)
            .map_err(|e| Error::Storage(format!("Failed to write {}: {}", tmp.display(), e)))?;

        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(Error::Storage(format!(
                "Failed to replace {}: {}",
                path.display(),
                e
            )));
        }
        Ok(())
    }

    pub fn exists(&self, filename: &str) -> bool {
        self.file_path(filename).exists()
    }

    pub fn remove(&self, filename: &str) -> Result<()> {
        let path = self.file_path(filename);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| {
                Error::Storage(format!("Failed to remove {}: {}", path.display(), e))
            })?;
        }
        Ok(())
    }

    /// Remove leftover temp files from interrupted saves
    pub fn clean_temp_files(&self) -> Result<usize> {
        if !self.base_dir.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') && name.contains(".tmp-") {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Doc {
        name: String,
        count: u32,
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path().join("nested"));

        let doc = Doc {
            name: "a".into(),
            count: 3,
        };
        store.save("doc.json", &doc).unwrap();

        let loaded: Doc = store.load("doc.json").unwrap();
        assert_eq!(loaded, doc);
        assert_eq!(store.clean_temp_files().unwrap(), 0);
    }

    #[test]
    fn test_replace_never_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let gone = JsonStore::new(dir.path().join("moved"));
        let doc = Doc {
            name: "b".into(),
            count: 1,
        };

        assert!(matches!(gone.replace("doc.json", &doc), Err(Error::NotFound(_))));
        assert!(!gone.base_dir().exists());

        std::fs::create_dir_all(gone.base_dir()).unwrap();
        gone.replace("doc.json", &doc).unwrap();
        assert_eq!(gone.load::<Doc>("doc.json").unwrap(), doc);
    }

    #[test]
    fn test_load_optional_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        let loaded: Option<Doc> = store.load_optional("missing.json").unwrap();
        assert!(loaded.is_none());
        let fallback: Doc = store.load_or_default("missing.json");
        assert_eq!(fallback, Doc::default());
    }

    #[test]
    fn test_clean_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        std::fs::write(dir.path().join(".job.json.tmp-abc"), "{").unwrap();
        std::fs::write(dir.path().join("job.json"), "{}").unwrap();

        assert_eq!(store.clean_temp_files().unwrap(), 1);
        assert!(store.exists("job.json"));
    }
}
