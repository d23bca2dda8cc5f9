use std::collections::VecDeque;

use dataswarm_core::mq::ConnId;
use dataswarm_core::types::{BlobId, RpcId, TaskId};

/// File contents a client announced with `file-put` or `file-submit`.
#[derive(Debug, Clone)]
pub struct Upload {
    pub rpc_id: RpcId,
    /// `None` when the request was refused; the contents are dropped.
    pub file_id: Option<BlobId>,
    /// Reply with the file id (`file-submit`).
    pub reply_with_id: bool,
    pub refusal: Option<::dataswarm_core::comm::ResultCode>,
}

pub struct ClientRep {
    id: ConnId,
    pub addr: String,
    /// The client never blocks in `wait`.
    pub nowait: bool,
    /// Id of a `wait` request to answer when one of the client's tasks finishes.
    pub waiting: Option<RpcId>,
    /// Finished tasks not yet reported through `wait`.
    pub finished: VecDeque<TaskId>,
    pub upload: Option<Upload>,
}

impl ClientRep {
    pub fn new(id: ConnId, addr: String, nowait: bool) -> Self {
        ClientRep {
            id,
            addr,
            nowait,
            waiting: None,
            finished: VecDeque::new(),
            upload: None,
        }
    }

    #[inline]
    pub fn id(&self) -> ConnId {
        self.id
    }
}
