use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use serde_json::Value;

use dataswarm_core::mq::ConnId;
use dataswarm_core::replica::{BlobRepState, Rep, TaskRepState};
use dataswarm_core::types::{BlobId, Resources, RpcId, TaskId};

/// What an outstanding RPC was sent for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcKind {
    Blob(BlobId, BlobRepState),
    Task(TaskId, TaskRepState),
    BlobList,
    TaskList,
}

#[derive(Debug, Clone)]
pub struct RpcOp {
    pub kind: RpcKind,
    pub sent: Instant,
}

/// A blob transfer expected as the next message from the worker.
#[derive(Debug, Clone)]
pub struct Incoming {
    pub file_id: BlobId,
    /// Where the contents are written; `None` drops them.
    pub partial: Option<PathBuf>,
}

/// Manager-side view of one connected worker.
pub struct WorkerRep {
    id: ConnId,
    pub addr: String,
    pub hostname: String,

    /// Total resources announced at handshake.
    pub resources: Resources,
    /// Resources reserved by tasks assigned to this worker.
    pub in_use: Resources,

    pub blobs: HashMap<BlobId, Rep<BlobRepState>>,
    pub tasks: HashMap<TaskId, Rep<TaskRepState>>,
    pub rpcs: HashMap<RpcId, RpcOp>,

    pub incoming: Option<Incoming>,
    pub last_status: Option<Value>,
}

impl WorkerRep {
    pub fn new(id: ConnId, addr: String, hostname: String, resources: Resources) -> Self {
        WorkerRep {
            id,
            addr,
            hostname,
            resources,
            in_use: Resources::default(),
            blobs: HashMap::new(),
            tasks: HashMap::new(),
            rpcs: HashMap::new(),
            incoming: None,
            last_status: None,
        }
    }

    #[inline]
    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn fits(&self, request: &Resources) -> bool {
        let mut needed = self.in_use;
        needed.add(request);
        needed.is_subset_of(&self.resources)
    }

    pub fn reserve(&mut self, request: &Resources) {
        self.in_use.add(request);
    }

    pub fn release(&mut self, request: &Resources) {
        self.in_use.remove(request);
    }

    /// Send time of the oldest unanswered RPC.
    pub fn oldest_rpc(&self) -> Option<Instant> {
        self.rpcs.values().map(|op| op.sent).min()
    }

    pub fn blob_state(&self, blob_id: &str) -> Option<&Rep<BlobRepState>> {
        self.blobs.get(blob_id)
    }

    /// A blob-get for `file_id` is outstanding or its contents are arriving.
    pub fn is_fetching(&self, file_id: &str) -> bool {
        if let Some(ref incoming) = self.incoming {
            if incoming.file_id == file_id {
                return true;
            }
        }
        self.blobs.get(file_id).map_or(false, |rep| {
            rep.is_pending() && rep.in_transition() == BlobRepState::Get
        })
    }

    pub fn info(&self) -> Value {
        json!({
            "addr": self.addr,
            "hostname": self.hostname,
            "resources": self.resources,
            "in-use": self.in_use,
            "blobs": self.blobs.len(),
            "tasks": self.tasks.len(),
        })
    }
}

impl fmt::Display for WorkerRep {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "worker {} ({})", self.hostname, self.addr)
    }
}
