// ABOUTME: File-backed machine record store, one directory per machine
// ABOUTME: Atomic record writes and enumeration that skips corrupt entries

use crate::error::{MachineError, Result};
use crate::types::MachineRecord;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

pub const MACHINE_DIR_PREFIX: &str = "container-";
pub const RECORD_FILE: &str = "instance_info.json";
pub const FILES_DIR: &str = "files";

/// Machine ids only ever contain `[A-Za-z0-9_-]`; anything else could walk out of the workspace.
pub fn validate_machine_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(MachineError::Validation(
            "Machine ID cannot be empty".to_string(),
        ));
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(MachineError::Validation(format!(
            "Invalid machine ID '{}': only letters, digits, hyphens and underscores are allowed",
            id
        )));
    }

    Ok(())
}

#[derive(Debug, Clone)]
pub struct MachineStore {
    workspace: PathBuf,
}

impl MachineStore {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn machine_dir(&self, id: &str) -> Result<PathBuf> {
        validate_machine_id(id)?;
        Ok(self
            .workspace
            .join(format!("{}{}", MACHINE_DIR_PREFIX, id)))
    }

    /// Sandbox root for the machine's user content
    pub fn files_dir(&self, id: &str) -> Result<PathBuf> {
        Ok(self.machine_dir(id)?.join(FILES_DIR))
    }

    pub async fn exists(&self, id: &str) -> bool {
        match self.machine_dir(id) {
            Ok(dir) => fs::try_exists(dir.join(RECORD_FILE)).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Create the machine directory, its file root and the record as a unit.
    /// Nothing is left behind if any step fails.
    pub async fn create(&self, record: &MachineRecord) -> Result<()> {
        let dir = self.machine_dir(&record.id)?;

        if fs::try_exists(&dir).await? {
            return Err(MachineError::AlreadyExists(record.id.clone()));
        }

        if let Err(e) = self.populate(&dir, record).await {
            if let Err(cleanup) = fs::remove_dir_all(&dir).await {
                warn!(
                    "Failed to clean up partially created machine directory {}: {}",
                    dir.display(),
                    cleanup
                );
            }
            return Err(e);
        }

        debug!("Created machine directory {}", dir.display());
        Ok(())
    }

    async fn populate(&self, dir: &Path, record: &MachineRecord) -> Result<()> {
        fs::create_dir_all(dir.join(FILES_DIR)).await?;
        self.save(record).await
    }

    pub async fn load(&self, id: &str) -> Result<MachineRecord> {
        let path = self.machine_dir(id)?.join(RECORD_FILE);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(MachineError::MachineNotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&contents)?)
    }

    /// Overwrite the record through a temp file and rename, so readers never
    /// observe a half-written record.
    pub async fn save(&self, record: &MachineRecord) -> Result<()> {
        let dir = self.machine_dir(&record.id)?;
        let json = serde_json::to_vec_pretty(record)?;

        let tmp = dir.join(format!(".{}.{}.tmp", RECORD_FILE, uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, &json).await?;
        if let Err(e) = fs::rename(&tmp, dir.join(RECORD_FILE)).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// All readable records, oldest first. Unreadable entries are logged and skipped.
    pub async fn list(&self) -> Result<Vec<MachineRecord>> {
        let mut entries = match fs::read_dir(&self.workspace).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(id) = name.strip_prefix(MACHINE_DIR_PREFIX) else {
                continue;
            };
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }

            match self.load(id).await {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping machine directory {}: {}", name, e),
            }
        }

        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        let dir = self.machine_dir(id)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(MachineError::MachineNotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MachineStatus;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn store() -> (TempDir, MachineStore) {
        let tmp = TempDir::new().unwrap();
        let store = MachineStore::new(tmp.path().join("workspace"));
        (tmp, store)
    }

    #[tokio::test]
    async fn test_create_and_load_round_trip() {
        let (_tmp, store) = store();
        let record = MachineRecord::new("web", 2, 2, "python:3.11").unwrap();

        store.create(&record).await.unwrap();

        assert_eq!(store.load(&record.id).await.unwrap(), record);
        assert!(store.files_dir(&record.id).unwrap().is_dir());
        assert!(store.exists(&record.id).await);
    }

    #[tokio::test]
    async fn test_create_rejects_existing_directory() {
        let (_tmp, store) = store();
        let record = MachineRecord::new("web", 2, 2, "python:3.11").unwrap();
        store.create(&record).await.unwrap();

        let err = store.create(&record).await.unwrap_err();
        assert!(matches!(err, MachineError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_save_overwrites_without_leftovers() {
        let (_tmp, store) = store();
        let mut record = MachineRecord::new("web", 2, 2, "python:3.11").unwrap();
        store.create(&record).await.unwrap();

        record.status = MachineStatus::Running;
        store.save(&record).await.unwrap();

        assert_eq!(
            store.load(&record.id).await.unwrap().status,
            MachineStatus::Running
        );
        let leftovers: Vec<_> = std::fs::read_dir(store.machine_dir(&record.id).unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_list_missing_workspace_is_empty() {
        let (_tmp, store) = store();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_skips_corrupt_records() {
        let (_tmp, store) = store();
        let good = MachineRecord::new("good", 1, 1, "alpine").unwrap();
        store.create(&good).await.unwrap();

        let corrupt = store.workspace().join("container-broken");
        std::fs::create_dir_all(&corrupt).unwrap();
        std::fs::write(corrupt.join(RECORD_FILE), "{ not json").unwrap();
        std::fs::create_dir_all(store.workspace().join("container-empty")).unwrap();
        std::fs::create_dir_all(store.workspace().join("unrelated")).unwrap();

        let records = store.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, good.id);
    }

    #[tokio::test]
    async fn test_load_and_remove_missing_machine() {
        let (_tmp, store) = store();
        assert!(matches!(
            store.load("nope").await,
            Err(MachineError::MachineNotFound(_))
        ));
        assert!(matches!(
            store.remove("nope").await,
            Err(MachineError::MachineNotFound(_))
        ));
    }

    #[test]
    fn test_machine_id_traversal_rejected() {
        let (_tmp, store) = store();
        assert!(store.machine_dir("../etc").is_err());
        assert!(store.machine_dir("a/b").is_err());
        assert!(store.machine_dir("").is_err());
    }
}
