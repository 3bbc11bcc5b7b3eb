//! Atomic JSON documents under the data directory.
//!
//! Every mutation writes the whole document to a temporary file in the same
//! directory and renames it over the target, so a crash never leaves a
//! half-written file.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use pdubridge_common::error::{Error, Result};

/// File store rooted at the bridge data directory.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        std::fs::create_dir_all(root.join("reports"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn devices_path(&self) -> PathBuf {
        self.root.join("pdus.json")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.root.join("bridge_settings.json")
    }

    pub fn history_path(&self) -> PathBuf {
        self.root.join("history.db")
    }

    pub fn rules_path(&self, device_id: &str) -> PathBuf {
        self.root.join(format!("rules_{}.json", device_id))
    }

    pub fn outlet_names_path(&self, device_id: &str) -> PathBuf {
        self.root.join(format!("outlet_names_{}.json", device_id))
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.root.join("reports")
    }

    /// Read a JSON document; `None` when the file does not exist.
    pub fn read<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| Error::internal(format!("corrupt file '{}': {}", path.display(), e)))
    }

    /// Write a JSON document atomically (write-temp-rename).
    pub fn write<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let content = serde_json::to_string_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Remove a document; missing files are not an error.
    pub fn remove(&self, path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop every per-device document for a deleted device.
    pub fn remove_device_files(&self, device_id: &str) -> Result<()> {
        self.remove(&self.rules_path(device_id))?;
        self.remove(&self.outlet_names_path(device_id))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        value: u32,
    }

    #[test]
    fn test_roundtrip_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let data = DataDir::new(dir.path()).unwrap();
        let path = data.rules_path("d1");

        assert_eq!(data.read::<Doc>(&path).unwrap(), None);

        data.write(&path, &Doc { value: 7 }).unwrap();
        assert_eq!(data.read::<Doc>(&path).unwrap(), Some(Doc { value: 7 }));

        // No stray temp file after the rename.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_remove_device_files() {
        let dir = tempfile::tempdir().unwrap();
        let data = DataDir::new(dir.path()).unwrap();

        data.write(&data.rules_path("d1"), &Doc { value: 1 }).unwrap();
        data.write(&data.outlet_names_path("d1"), &Doc { value: 2 })
            .unwrap();

        data.remove_device_files("d1").unwrap();
        assert!(!data.rules_path("d1").exists());
        assert!(!data.outlet_names_path("d1").exists());

        // Removing twice stays quiet.
        data.remove_device_files("d1").unwrap();
    }
}
