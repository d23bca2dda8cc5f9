use std::collections::HashMap;
use std::fs;

use serde_json::Value;

use dataswarm_core::comm::ResultCode;
use dataswarm_core::errors::{Error, Result};
use dataswarm_core::types::{is_valid_id, BlobId, BlobMeta, BlobState};

use super::workspace::{read_json, write_json, Workspace};

type BlobResult<T> = ::std::result::Result<T, ResultCode>;

const MB: u64 = 1024 * 1024;

/// Megabytes needed to hold `bytes`, rounded up.
pub fn size_mb(bytes: u64) -> u64 {
    (bytes + MB - 1) / MB
}

/// Blobs stored at this worker, with the disk space they reserve.
#[derive(Default)]
pub struct BlobTable {
    blobs: HashMap<BlobId, BlobMeta>,
    /// MB
    disk_in_use: u64,
}

impl BlobTable {
    pub fn new() -> Self {
        Default::default()
    }

    /// Rebuild the table from the workspace after a restart.
    pub fn recover(workspace: &Workspace) -> Result<Self> {
        let mut table = BlobTable::new();
        for blob_id in workspace.list_ids(&workspace.blob_root())? {
            let meta: BlobMeta = match read_json(&workspace.blob_meta(&blob_id)) {
                Ok(meta) => meta,
                Err(e) => {
                    warn!("Blob {} has no usable metadata ({}), removing it", blob_id, e);
                    let _ = workspace.remove_entry(&workspace.blob_dir(&blob_id));
                    continue;
                }
            };
            if meta.state == BlobState::Deleting {
                let _ = workspace.remove_entry(&workspace.blob_dir(&blob_id));
                continue;
            }
            table.disk_in_use += size_mb(meta.size);
            table.blobs.insert(blob_id, meta);
        }
        info!("Recovered {} blob(s)", table.blobs.len());
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn disk_in_use(&self) -> u64 {
        self.disk_in_use
    }

    pub fn lookup(&self, blob_id: &str) -> Option<&BlobMeta> {
        self.blobs.get(blob_id)
    }

    /// Reserve space and create an empty, writable blob. `available` is the free disk in MB.
    pub fn create(
        &mut self,
        workspace: &Workspace,
        blob_id: &str,
        size: u64,
        metadata: Value,
        available: u64,
    ) -> BlobResult<()> {
        if !is_valid_id(blob_id) {
            return Err(ResultCode::BadParams);
        }
        if self.blobs.contains_key(blob_id) {
            return Err(ResultCode::BlobIdExists);
        }
        if size_mb(size) > available {
            return Err(ResultCode::TooFull);
        }
        let meta = BlobMeta::new(blob_id, size, metadata);
        self.store(workspace, meta, |dir| {
            fs::File::create(dir.join("data")).map(|_| ())
        })
    }

    /// Create `blob_id` as a writable copy of the contents of `source`.
    pub fn copy(
        &mut self,
        workspace: &Workspace,
        blob_id: &str,
        source: &str,
        available: u64,
    ) -> BlobResult<()> {
        if !is_valid_id(blob_id) {
            return Err(ResultCode::BadParams);
        }
        if self.blobs.contains_key(blob_id) {
            return Err(ResultCode::BlobIdExists);
        }
        let (size, metadata) = match self.blobs.get(source) {
            Some(meta) => {
                let actual = fs::metadata(workspace.blob_data(source))
                    .map(|m| m.len())
                    .unwrap_or(0);
                (::std::cmp::max(meta.size, actual), meta.metadata.clone())
            }
            None => return Err(ResultCode::NoSuchBlobId),
        };
        if size_mb(size) > available {
            return Err(ResultCode::TooFull);
        }
        let source_data = workspace.blob_data(source);
        let meta = BlobMeta::new(blob_id, size, metadata);
        self.store(workspace, meta, |dir| {
            fs::copy(&source_data, dir.join("data")).map(|_| ())
        })
    }

    fn store<F>(&mut self, workspace: &Workspace, meta: BlobMeta, fill: F) -> BlobResult<()>
    where
        F: FnOnce(&::std::path::Path) -> ::std::io::Result<()>,
    {
        let dir = workspace.blob_dir(&meta.blob_id);
        let stored = fs::create_dir(&dir)
            .and_then(|_| fill(&dir))
            .map_err(Error::from)
            .and_then(|_| write_json(&workspace.blob_meta(&meta.blob_id), &meta));
        if let Err(e) = stored {
            warn!("Cannot create blob {}: {}", meta.blob_id, e);
            let _ = workspace.remove_entry(&dir);
            return Err(ResultCode::Unable);
        }
        debug!("Blob {} created ({} bytes reserved)", meta.blob_id, meta.size);
        self.disk_in_use += size_mb(meta.size);
        self.blobs.insert(meta.blob_id.clone(), meta);
        Ok(())
    }

    /// Open the contents of a writable blob for replacement.
    pub fn prepare_put(&self, workspace: &Workspace, blob_id: &str) -> BlobResult<fs::File> {
        match self.blobs.get(blob_id) {
            Some(meta) if meta.state == BlobState::RW => {}
            Some(_) => return Err(ResultCode::BadState),
            None => return Err(ResultCode::NoSuchBlobId),
        }
        fs::File::create(workspace.blob_data(blob_id)).map_err(|e| {
            warn!("Cannot open blob {} for writing: {}", blob_id, e);
            ResultCode::Unable
        })
    }

    /// Open the contents for reading; returns the file and its length.
    pub fn get(&self, workspace: &Workspace, blob_id: &str) -> BlobResult<(fs::File, u64)> {
        match self.blobs.get(blob_id) {
            Some(meta) if meta.state != BlobState::Deleting => {}
            Some(_) => return Err(ResultCode::BadState),
            None => return Err(ResultCode::NoSuchBlobId),
        }
        let file = fs::File::open(workspace.blob_data(blob_id)).map_err(|e| {
            warn!("Cannot open blob {}: {}", blob_id, e);
            ResultCode::Unable
        })?;
        let length = file.metadata().map(|m| m.len()).map_err(|_| ResultCode::Unable)?;
        Ok((file, length))
    }

    /// Make the contents immutable. Returns true if the state changed.
    pub fn commit(&mut self, workspace: &Workspace, blob_id: &str) -> BlobResult<bool> {
        let meta = self.blobs.get_mut(blob_id).ok_or(ResultCode::NoSuchBlobId)?;
        match meta.state {
            BlobState::RO => return Ok(false),
            BlobState::RW => {}
            BlobState::Deleting => return Err(ResultCode::BadState),
        }
        // the contents may differ from the size declared at create
        let stored = fs::metadata(workspace.blob_data(blob_id))
            .map_err(Error::from)
            .and_then(|data| {
                let mut committed = meta.clone();
                committed.state = BlobState::RO;
                committed.size = data.len();
                write_json(&workspace.blob_meta(blob_id), &committed)?;
                Ok(committed)
            });
        let committed = match stored {
            Ok(committed) => committed,
            Err(e) => {
                warn!("Cannot commit blob {}: {}", blob_id, e);
                return Err(ResultCode::Unable);
            }
        };
        self.disk_in_use =
            self.disk_in_use.saturating_sub(size_mb(meta.size)) + size_mb(committed.size);
        debug!("Blob {} committed ({} bytes)", blob_id, committed.size);
        *meta = committed;
        Ok(true)
    }

    pub fn delete(&mut self, workspace: &Workspace, blob_id: &str) -> BlobResult<()> {
        if !is_valid_id(blob_id) {
            return Err(ResultCode::BadParams);
        }
        let meta = self.blobs.remove(blob_id).ok_or(ResultCode::NoSuchBlobId)?;
        self.disk_in_use = self.disk_in_use.saturating_sub(size_mb(meta.size));
        if let Err(e) = workspace.remove_entry(&workspace.blob_dir(blob_id)) {
            warn!("Cannot remove blob {}: {}", blob_id, e);
        }
        debug!("Blob {} deleted", blob_id);
        Ok(())
    }

    pub fn list(&self) -> Value {
        let blobs: ::serde_json::Map<String, Value> = self
            .blobs
            .iter()
            .map(|(id, meta)| (id.clone(), json!(meta)))
            .collect();
        Value::Object(blobs)
    }
}
