use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use walkdir::WalkDir;

use dataswarm_core::errors::*;
use dataswarm_core::types::{is_valid_id, new_id};

const DELETING: &str = "deleting";

/// Layout of the worker's directory:
///
/// ```text
/// task/<task-id>/meta         task record
/// task/<task-id>/sandbox/     working directory of the process
/// blob/<blob-id>/meta         blob metadata
/// blob/<blob-id>/data         contents
/// task/deleting, blob/deleting  entries being removed
/// ```
pub struct Workspace {
    path: PathBuf,
}

impl Workspace {
    pub fn new(path: &Path) -> Result<Self> {
        for dir in &["task", "blob"] {
            fs::create_dir_all(path.join(dir).join(DELETING))?;
        }
        // Symlinks in sandboxes point into blob/, so the root must be absolute
        let path = fs::canonicalize(path)?;
        Ok(Workspace { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn task_root(&self) -> PathBuf {
        self.path.join("task")
    }

    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.task_root().join(task_id)
    }

    pub fn task_meta(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join("meta")
    }

    pub fn task_sandbox(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join("sandbox")
    }

    pub fn blob_root(&self) -> PathBuf {
        self.path.join("blob")
    }

    pub fn blob_dir(&self, blob_id: &str) -> PathBuf {
        self.blob_root().join(blob_id)
    }

    pub fn blob_meta(&self, blob_id: &str) -> PathBuf {
        self.blob_dir(blob_id).join("meta")
    }

    pub fn blob_data(&self, blob_id: &str) -> PathBuf {
        self.blob_dir(blob_id).join("data")
    }

    /// Remove a task or blob directory. It is first renamed into the `deleting` directory
    /// next to it, so an interrupted removal never leaves a half-deleted live entry.
    pub fn remove_entry(&self, dir: &Path) -> io::Result<()> {
        let parent = match dir.parent() {
            Some(parent) => parent.join(DELETING),
            None => return Ok(()),
        };
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let target = parent.join(format!("{}.{}", name, new_id()));
        match fs::rename(dir, &target) {
            Ok(()) => fs::remove_dir_all(&target),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Finish removals interrupted by a crash.
    pub fn purge_deleting(&self) {
        for root in &[self.task_root(), self.blob_root()] {
            let deleting = root.join(DELETING);
            let entries = match fs::read_dir(&deleting) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Cannot read {:?}: {}", deleting, e);
                    continue;
                }
            };
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                debug!("Purging {:?}", path);
                let removed = if path.is_dir() {
                    fs::remove_dir_all(&path)
                } else {
                    fs::remove_file(&path)
                };
                if let Err(e) = removed {
                    warn!("Cannot purge {:?}: {}", path, e);
                }
            }
        }
    }

    /// Ids of the entries under `root`, skipping anything that is not a valid id.
    pub fn list_ids(&self, root: &Path) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(root)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if is_valid_id(&name) {
                ids.push(name);
            } else if name != DELETING {
                warn!("Ignoring unexpected entry {:?} in {:?}", name, root);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Bytes used by everything in the workspace.
    pub fn usage(&self) -> u64 {
        WalkDir::new(&self.path)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter_map(|e| e.metadata().ok())
            .filter(|m| m.is_file())
            .map(|m| m.len())
            .sum()
    }
}

/// Write `value` to `path` so that readers see either the old or the new contents.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&::serde_json::to_vec_pretty(value)?)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read(path)?;
    Ok(::serde_json::from_slice(&data)?)
}

/// Destination for contents that are read off the wire and dropped.
pub fn discard_sink() -> io::Result<fs::File> {
    fs::OpenOptions::new().write(true).open("/dev/null")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn layout_and_removal() {
        let dir = TempDir::new("workspace").unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        assert!(ws.path().is_absolute());
        assert!(ws.task_root().join("deleting").is_dir());

        let blob = ws.blob_dir("b1");
        fs::create_dir_all(&blob).unwrap();
        fs::write(ws.blob_data("b1"), b"hello").unwrap();
        assert_eq!(ws.usage(), 5);
        assert_eq!(ws.list_ids(&ws.blob_root()).unwrap(), vec!["b1".to_string()]);

        ws.remove_entry(&blob).unwrap();
        assert!(!blob.exists());
        assert!(ws.list_ids(&ws.blob_root()).unwrap().is_empty());
        assert_eq!(fs::read_dir(ws.blob_root().join("deleting")).unwrap().count(), 0);
        // already gone
        ws.remove_entry(&blob).unwrap();
    }

    #[test]
    fn purge_leftovers() {
        let dir = TempDir::new("workspace").unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        let leftover = ws.task_root().join("deleting").join("t1.x");
        fs::create_dir_all(leftover.join("sandbox")).unwrap();
        ws.purge_deleting();
        assert!(!leftover.exists());
    }

    #[test]
    fn json_files() {
        let dir = TempDir::new("workspace").unwrap();
        let path = dir.path().join("meta");
        write_json(&path, &json!({"a": 1})).unwrap();
        let value: ::serde_json::Value = read_json(&path).unwrap();
        assert_eq!(value["a"], 1);
        assert!(!path.with_extension("tmp").exists());
        assert!(read_json::<::serde_json::Value>(&dir.path().join("missing")).is_err());
    }
}
