//! Machine record persistence.

use chrono::{DateTime, Utc};
use flarewrap_common::{FlarewrapResult, StorageLayout};
use serde::{Deserialize, Serialize};

use super::{Machine, Strategy};
use crate::pipeline::RootfsArtifact;

/// What a successful start left behind for a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRecord {
    /// The machine as started.
    pub machine: Machine,
    /// Strategy the rootfs was built with.
    pub strategy: Strategy,
    /// The rootfs artifact.
    pub artifact: RootfsArtifact,
    /// Run that produced the artifact.
    pub run_id: String,
    /// When the artifact was finished.
    pub created_at: DateTime<Utc>,
}

/// Manages machine records under `machines/`.
#[derive(Debug, Clone)]
pub struct MachineStore {
    layout: StorageLayout,
}

impl MachineStore {
    /// Create a store over a working directory layout.
    #[must_use]
    pub const fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    /// Save a record, replacing any earlier one for the machine.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, record: &MachineRecord) -> FlarewrapResult<()> {
        let name = record.machine.name.as_str();
        let path = self.layout.machine_record(name);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(record)?;
        std::fs::write(&path, json)?;

        tracing::debug!(machine = %name, path = %path.display(), "Saved machine record");
        Ok(())
    }

    /// Load a machine's record, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the record exists but cannot be read.
    pub fn load(&self, name: &str) -> FlarewrapResult<Option<MachineRecord>> {
        let path = self.layout.machine_record(name);
        if !path.exists() {
            return Ok(None);
        }

        let json = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    /// Delete a machine's record and its per-machine directory.
    ///
    /// # Errors
    ///
    /// Returns an error if something exists but cannot be removed.
    pub fn delete(&self, name: &str) -> FlarewrapResult<()> {
        let path = self.layout.machine_record(name);
        if path.exists() {
            std::fs::remove_file(&path)?;
            tracing::debug!(machine = %name, path = %path.display(), "Deleted machine record");
        }

        let dir = self.layout.machine_dir(name);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// List machines with a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the machines directory cannot be read.
    pub fn list(&self) -> FlarewrapResult<Vec<String>> {
        let mut machines = Vec::new();
        let dir = self.layout.machines();

        if !dir.exists() {
            return Ok(machines);
        }

        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str().and_then(|n| n.strip_suffix(".json")) {
                machines.push(name.to_string());
            }
        }

        machines.sort();
        Ok(machines)
    }

    /// Check if a machine has a record.
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.layout.machine_record(name).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::BlockImage;
    use tempfile::tempdir;

    fn record(name: &str) -> MachineRecord {
        MachineRecord {
            machine: Machine::new(1, 256, 64, name, "alpine").unwrap(),
            strategy: Strategy::BlockImage,
            artifact: RootfsArtifact::BlockImage(BlockImage {
                path: format!("/fw/rootfs/{name}-rootfs.ext4").into(),
                size_mb: 64,
                fs_type: "ext4".to_string(),
            }),
            run_id: "0123456789ab".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn save_load_list_delete() {
        let temp = tempdir().unwrap();
        let store = MachineStore::new(StorageLayout::new(temp.path()));

        store.save(&record("one")).unwrap();
        store.save(&record("two")).unwrap();
        assert_eq!(store.list().unwrap(), vec!["one", "two"]);
        let loaded = store.load("one").unwrap().unwrap();
        assert_eq!(loaded.machine, record("one").machine);
        assert_eq!(loaded.artifact, record("one").artifact);

        store.delete("one").unwrap();
        assert!(!store.exists("one"));
        assert!(store.load("one").unwrap().is_none());
        // Deleting twice is fine
        store.delete("one").unwrap();
    }
}
