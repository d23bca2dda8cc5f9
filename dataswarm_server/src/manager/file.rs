use std::path::PathBuf;

use serde_json::Value;

use dataswarm_core::types::BlobId;

/// Manager-level lifecycle of a file; each file is stored as one blob per replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    /// Waiting for a first replica to be created.
    Allocating,
    /// Replicas exist and may be written.
    Mutable,
    /// Every replica is being committed.
    Committing,
    /// Contents are final.
    Immutable,
    /// Every replica is being removed.
    Deleting,
    Deleted,
}

#[derive(Debug)]
pub struct FileRecord {
    pub file_id: BlobId,
    pub state: FileState,
    /// Bytes; reserved on workers when replicas are created.
    pub size: u64,
    pub metadata: Value,
    /// The staging copy in the manager's workdir holds the contents.
    pub staged: bool,
    /// Create the first replica with blob-copy from this file.
    pub copy_of: Option<BlobId>,
    pub staging: PathBuf,
}

impl FileRecord {
    pub fn new(file_id: BlobId, size: u64, metadata: Value, staging: PathBuf) -> Self {
        FileRecord {
            file_id,
            state: FileState::Allocating,
            size,
            metadata,
            staged: false,
            copy_of: None,
            staging,
        }
    }

    /// Path an incoming transfer is written to before it replaces the staging copy.
    pub fn partial_path(&self) -> PathBuf {
        self.staging.with_extension("part")
    }

    /// Contents may still be replaced by a client.
    pub fn accepts_contents(&self) -> bool {
        match self.state {
            FileState::Allocating | FileState::Mutable => true,
            _ => false,
        }
    }

    pub fn is_removed(&self) -> bool {
        match self.state {
            FileState::Deleting | FileState::Deleted => true,
            _ => false,
        }
    }

    pub fn info(&self) -> Value {
        json!({
            "file-id": self.file_id,
            "state": self.state,
            "size": self.size,
            "staged": self.staged,
        })
    }
}
