// ABOUTME: Sandboxed file operations confined to a machine's file root
// ABOUTME: Listing, uploads with archive expansion, deletion, editing and git clones

use crate::activity::ActivityLog;
use crate::error::{MachineError, Result};
use crate::runtime::docker_cli::run_captured;
use crate::types::{FileEntry, FileKind};
use flate2::read::GzDecoder;
use std::io::{ErrorKind, Read};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
}

const ARCHIVE_SUFFIXES: [(&str, ArchiveFormat); 4] = [
    (".zip", ArchiveFormat::Zip),
    (".tar.gz", ArchiveFormat::TarGz),
    (".tgz", ArchiveFormat::TarGz),
    (".tar", ArchiveFormat::Tar),
];

#[derive(Debug, Clone)]
pub struct MachineFiles {
    root: PathBuf,
    machine_id: Option<String>,
    activity: Option<ActivityLog>,
}

impl MachineFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            machine_id: None,
            activity: None,
        }
    }

    /// Record uploads, clones and deletions in the activity log
    pub fn with_activity(mut self, machine_id: &str, activity: ActivityLog) -> Self {
        self.machine_id = Some(machine_id.to_string());
        self.activity = Some(activity);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a client-supplied path against the file root.
    ///
    /// `""`, `"."` and `"/"` name the root itself. Any other absolute path, or a
    /// relative path whose `..` components climb above the root, is rejected
    /// before the filesystem is touched. Every component that already exists is
    /// then inspected without following links: a symlink is accepted only when its
    /// target exists and lies under the root, so dangling links are refused too.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        let trimmed = path.trim();
        if trimmed.is_empty() || trimmed == "." || trimmed == "/" {
            return Ok(self.root.clone());
        }

        let mut normalized = PathBuf::new();
        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        warn!("Rejected path escaping the file root: {}", path);
                        return Err(MachineError::path_escape(path));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    warn!("Rejected absolute path outside the file root: {}", path);
                    return Err(MachineError::path_escape(path));
                }
            }
        }

        let resolved = self.root.join(&normalized);
        self.confine(&normalized, path)?;
        Ok(resolved)
    }

    /// Walk `relative` below the root and refuse symlinks that lead outside it
    fn confine(&self, relative: &Path, path: &str) -> Result<()> {
        // Nothing below a missing root can exist yet
        let real_root = match self.root.canonicalize() {
            Ok(real_root) => real_root,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut current = self.root.clone();
        for part in relative.components() {
            current.push(part);
            let metadata = match std::fs::symlink_metadata(&current) {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == ErrorKind::NotFound => break,
                Err(e) => return Err(e.into()),
            };
            if !metadata.file_type().is_symlink() {
                continue;
            }
            match current.canonicalize() {
                Ok(real) if real.starts_with(&real_root) => {}
                _ => {
                    warn!("Rejected path through a symlink leaving the file root: {}", path);
                    return Err(MachineError::path_escape(path));
                }
            }
        }
        Ok(())
    }

    /// Folders first, then files, each alphabetical ignoring case
    pub async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let dir = self.resolve(path)?;

        if dir == self.root {
            fs::create_dir_all(&dir).await?;
        }

        let metadata = match fs::metadata(&dir).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(MachineError::FileNotFound(path.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        if !metadata.is_dir() {
            return Err(MachineError::Validation(format!(
                "Path is not a directory: {}",
                path
            )));
        }

        let mut entries = Vec::new();
        let mut dir_entries = fs::read_dir(&dir).await?;
        while let Some(entry) = dir_entries.next_entry().await? {
            let file_type = match entry.file_type().await {
                Ok(t) => t,
                Err(e) => {
                    warn!("Skipping unreadable entry {:?}: {}", entry.file_name(), e);
                    continue;
                }
            };
            let kind = if file_type.is_dir() {
                FileKind::Folder
            } else if file_type.is_file() {
                FileKind::File
            } else {
                continue;
            };
            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                kind,
            });
        }

        entries.sort_by(|a, b| {
            let rank = |k: FileKind| if k == FileKind::Folder { 0 } else { 1 };
            rank(a.kind)
                .cmp(&rank(b.kind))
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });

        Ok(entries)
    }

    /// Write `contents` as `file_name` inside the directory `path`, creating it if needed.
    pub async fn upload_file(&self, path: &str, file_name: &str, contents: &[u8]) -> Result<PathBuf> {
        let dir = self.resolve(path)?;
        let name = validate_file_name(file_name)?;

        let target = self.resolve(&child_path(path, name))?;
        fs::create_dir_all(&dir).await?;
        fs::write(&target, contents).await?;

        info!("Uploaded {} ({} bytes)", target.display(), contents.len());
        self.record(&format!("Uploaded file '{}' to '{}'.", file_name, display_path(path)))
            .await;
        Ok(target)
    }

    /// Expand a `.zip`, `.tar`, `.tar.gz` or `.tgz` archive into `<path>/<archive stem>/`.
    ///
    /// The archive is unpacked into a staging directory first. A single top-level
    /// directory is promoted one level; otherwise every top-level entry is moved
    /// directly into the destination. Existing entries with the same name are replaced.
    /// Symlinks and hard links inside the archive are skipped.
    pub async fn upload_archive(&self, path: &str, archive_name: &str, contents: Vec<u8>) -> Result<PathBuf> {
        let dir = self.resolve(path)?;
        let name = validate_file_name(archive_name)?;
        let (stem, format) = archive_stem(name).ok_or_else(|| {
            MachineError::Validation(format!(
                "Unsupported archive format: {} (expected .zip, .tar, .tar.gz or .tgz)",
                archive_name
            ))
        })?;

        let destination = self.resolve(&child_path(path, stem))?;
        fs::create_dir_all(&dir).await?;
        let staging_parent = self.root.parent().unwrap_or(&self.root).to_path_buf();

        let dest = destination.clone();
        tokio::task::spawn_blocking(move || {
            extract_archive(&contents, format, &staging_parent, &dest)
        })
        .await
        .map_err(|e| MachineError::Archive(format!("Extraction task failed: {}", e)))??;

        info!(
            "Extracted {} into {}",
            archive_name,
            destination.display()
        );
        self.record(&format!(
            "Uploaded and extracted '{}' to '{}/'.",
            archive_name,
            display_child(path, stem)
        ))
        .await;
        Ok(destination)
    }

    pub async fn delete_file(&self, path: &str) -> Result<()> {
        let target = self.resolve_non_root(path)?;
        let metadata = self.existing(&target, path).await?;
        if metadata.is_dir() {
            return Err(MachineError::Validation(format!(
                "{} is a folder; use folder deletion instead",
                path
            )));
        }

        fs::remove_file(&target).await?;
        info!("Deleted file {}", target.display());
        self.record(&format!("Deleted file '{}'.", path)).await;
        Ok(())
    }

    pub async fn delete_folder(&self, path: &str) -> Result<()> {
        let target = self.resolve_non_root(path)?;
        let metadata = self.existing(&target, path).await?;
        if !metadata.is_dir() {
            return Err(MachineError::Validation(format!(
                "{} is not a folder",
                path
            )));
        }

        fs::remove_dir_all(&target).await?;
        info!("Deleted folder {}", target.display());
        self.record(&format!("Deleted folder '{}'.", path)).await;
        Ok(())
    }

    pub async fn read_file(&self, path: &str) -> Result<String> {
        let target = self.resolve_non_root(path)?;
        let metadata = self.existing(&target, path).await?;
        if metadata.is_dir() {
            return Err(MachineError::Validation(format!("{} is a folder", path)));
        }
        Ok(fs::read_to_string(&target).await?)
    }

    /// Create or overwrite a file. The parent directory must already exist.
    pub async fn write_file(&self, path: &str, contents: &str) -> Result<()> {
        let target = self.resolve_non_root(path)?;
        if fs::metadata(&target).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(MachineError::Validation(format!("{} is a folder", path)));
        }
        match target.parent() {
            Some(parent) if fs::try_exists(parent).await.unwrap_or(false) => {}
            _ => return Err(MachineError::FileNotFound(path.to_string())),
        }

        fs::write(&target, contents).await?;
        debug!("Wrote {} bytes to {}", contents.len(), target.display());
        Ok(())
    }

    /// `git clone <url> <path>/<repo name>`; the name is the URL's last segment without `.git`.
    pub async fn clone_repository(&self, path: &str, url: &str) -> Result<PathBuf> {
        let dir = self.resolve(path)?;
        let repo_name = repository_name(url)?;

        fs::create_dir_all(&dir).await?;
        let target = dir.join(&repo_name);
        if fs::try_exists(&target).await.unwrap_or(false) {
            return Err(MachineError::AlreadyExists(display_child(path, &repo_name)));
        }

        let args = vec![
            "clone".to_string(),
            "--".to_string(),
            url.to_string(),
            target.to_string_lossy().to_string(),
        ];
        run_captured("git", &args, None).await?;

        info!("Cloned {} into {}", url, target.display());
        self.record(&format!(
            "Cloned Git repository '{}' to '{}'.",
            url,
            display_child(path, &repo_name)
        ))
        .await;
        Ok(target)
    }

    fn resolve_non_root(&self, path: &str) -> Result<PathBuf> {
        let target = self.resolve(path)?;
        if target == self.root {
            return Err(MachineError::Validation(
                "Cannot operate on the file root itself".to_string(),
            ));
        }
        Ok(target)
    }

    async fn existing(&self, target: &Path, path: &str) -> Result<std::fs::Metadata> {
        match fs::metadata(target).await {
            Ok(metadata) => Ok(metadata),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(MachineError::FileNotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn record(&self, message: &str) {
        if let (Some(id), Some(activity)) = (&self.machine_id, &self.activity) {
            activity.append(&format!("Machine {}: {}", id, message)).await;
        }
    }
}

fn display_path(path: &str) -> &str {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

/// Client-style path of `name` inside the directory `path`
fn child_path(path: &str, name: &str) -> String {
    match display_path(path) {
        "/" => name.to_string(),
        parent => format!("{}/{}", parent, name),
    }
}

fn display_child(path: &str, name: &str) -> String {
    match display_path(path) {
        "/" => format!("/{}", name),
        parent => format!("{}/{}", parent, name),
    }
}

/// Upload names must be a single plain path component.
fn validate_file_name(name: &str) -> Result<&str> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(name),
        _ => Err(MachineError::Validation(format!(
            "Invalid file name: {:?}",
            name
        ))),
    }
}

fn archive_stem(name: &str) -> Option<(&str, ArchiveFormat)> {
    let lower = name.to_ascii_lowercase();
    ARCHIVE_SUFFIXES.iter().find_map(|(suffix, format)| {
        if lower.ends_with(suffix) && lower.len() > suffix.len() {
            Some((&name[..name.len() - suffix.len()], *format))
        } else {
            None
        }
    })
}

pub fn is_archive(name: &str) -> bool {
    archive_stem(name).is_some()
}

/// Repository directory name from a clone URL
pub fn repository_name(url: &str) -> Result<String> {
    let last = url
        .trim()
        .trim_end_matches('/')
        .rsplit(|c| c == '/' || c == ':')
        .next()
        .unwrap_or_default();
    let name = last.strip_suffix(".git").unwrap_or(last);

    if name.is_empty() || name == "." || name == ".." {
        return Err(MachineError::Validation(format!(
            "Could not determine repository name from URL: {}",
            url
        )));
    }
    Ok(name.to_string())
}

fn invalid_archive(e: impl std::fmt::Display) -> MachineError {
    MachineError::Archive(format!("Not a valid archive: {}", e))
}

fn extract_archive(contents: &[u8], format: ArchiveFormat, staging_parent: &Path, destination: &Path) -> Result<()> {
    let staging = tempfile::Builder::new()
        .prefix(".extract-")
        .tempdir_in(staging_parent)?;

    match format {
        ArchiveFormat::Zip => unpack_zip(contents, staging.path())?,
        ArchiveFormat::TarGz => unpack_tar(GzDecoder::new(contents), staging.path())?,
        ArchiveFormat::Tar => unpack_tar(contents, staging.path())?,
    }

    // Entry types are read without following links
    let mut top_level = Vec::new();
    for entry in std::fs::read_dir(staging.path())? {
        let entry = entry?;
        top_level.push((entry.path(), entry.file_type()?));
    }

    let source = match top_level.as_slice() {
        [(single, kind)] if kind.is_dir() => single.clone(),
        _ => staging.path().to_path_buf(),
    };

    std::fs::create_dir_all(destination)?;
    for entry in std::fs::read_dir(&source)? {
        let entry = entry?;
        let target = destination.join(entry.file_name());
        if let Ok(metadata) = std::fs::symlink_metadata(&target) {
            if metadata.is_dir() {
                std::fs::remove_dir_all(&target)?;
            } else {
                std::fs::remove_file(&target)?;
            }
        }
        std::fs::rename(entry.path(), &target)?;
    }

    Ok(())
}

fn unpack_tar(reader: impl Read, staging: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries().map_err(invalid_archive)? {
        let mut entry = entry.map_err(invalid_archive)?;
        let kind = entry.header().entry_type();
        if kind.is_symlink() || kind.is_hard_link() {
            warn!(
                "Skipping link entry {:?} in uploaded archive",
                entry.path().map(|p| p.into_owned()).ok()
            );
            continue;
        }
        // Entries with `..` or absolute paths are skipped by unpack_in
        entry.unpack_in(staging).map_err(invalid_archive)?;
    }
    Ok(())
}

fn unpack_zip(contents: &[u8], staging: &Path) -> Result<()> {
    const S_IFMT: u32 = 0o170000;
    const S_IFLNK: u32 = 0o120000;

    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(contents)).map_err(invalid_archive)?;
    for index in 0..archive.len() {
        let mut file = archive.by_index(index).map_err(invalid_archive)?;

        if file.unix_mode().map(|mode| mode & S_IFMT == S_IFLNK).unwrap_or(false) {
            warn!("Skipping symlink {} in uploaded archive", file.name());
            continue;
        }
        let Some(relative) = file.enclosed_name() else {
            warn!("Skipping unsafe entry {} in uploaded archive", file.name());
            continue;
        };

        let target = staging.join(relative);
        if file.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut file, &mut out)?;
    }
    Ok(())
}
