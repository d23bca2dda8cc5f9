//! Lifecycle of a blob copy at one worker, and of the manager's view of RPC-driven objects.
//!
//! Two layers live here: the `(state, event) -> state` table for replicas, and `Rep`, which
//! tracks one outstanding RPC per object through `state`, `in_transition` and `result`.

use std::fmt::Debug;

use crate::comm::ResultCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ReplicaState {
    Creating,
    Ready,
    Deleting,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicaEvent {
    /// A remote operation on the copy succeeded.
    CacheUpdate,
    /// The copy is known to be bad or lost.
    CacheInvalid,
    /// Removal was requested.
    Unlink,
}

/// Transition table. `None` means the event is not accepted in that state.
pub fn next_replica_state(state: ReplicaState, event: ReplicaEvent) -> Option<ReplicaState> {
    use self::ReplicaEvent::*;
    use self::ReplicaState::*;
    match (state, event) {
        (Creating, CacheUpdate) => Some(Ready),
        (Creating, CacheInvalid) => Some(Deleted),
        (Creating, Unlink) => Some(Deleting),
        // blob-commit confirms a copy that is already usable
        (Ready, CacheUpdate) => Some(Ready),
        (Ready, CacheInvalid) => Some(Deleted),
        (Ready, Unlink) => Some(Deleting),
        (Deleting, CacheInvalid) => Some(Deleted),
        _ => None,
    }
}

/// One copy of a file at one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replica {
    state: ReplicaState,
    pub size: u64,
}

impl Replica {
    pub fn new(size: u64) -> Self {
        Replica {
            state: ReplicaState::Creating,
            size,
        }
    }

    #[inline]
    pub fn state(&self) -> ReplicaState {
        self.state
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.state == ReplicaState::Ready
    }

    /// Apply `event`. An undefined transition is logged and leaves the state unchanged.
    pub fn change_state_on_event(&mut self, event: ReplicaEvent) -> bool {
        match next_replica_state(self.state, event) {
            Some(next) => {
                self.state = next;
                true
            }
            None => {
                warn!(
                    "Invalid replica transition: {:?} on event {:?}",
                    self.state, event
                );
                false
            }
        }
    }
}

/// States of an object driven by RPCs at one worker.
pub trait RepState: Copy + Eq + Debug {
    fn initial() -> Self;

    /// Whether an RPC moving from `from` to `to` may be started.
    fn can_begin(from: Self, to: Self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlobRepState {
    New,
    Created,
    Put,
    Copied,
    Committed,
    Get,
    Deleted,
}

impl BlobRepState {
    /// Position in the lifecycle; `Put` and `Copied` are alternatives at the same stage.
    pub fn rank(self) -> u8 {
        match self {
            BlobRepState::New => 0,
            BlobRepState::Created => 1,
            BlobRepState::Put | BlobRepState::Copied => 2,
            BlobRepState::Committed => 3,
            BlobRepState::Get => 4,
            BlobRepState::Deleted => 5,
        }
    }

    /// The blob exists at the worker and is not being removed.
    pub fn is_created(self) -> bool {
        self.rank() >= 1 && self != BlobRepState::Deleted
    }

    /// The blob holds immutable contents.
    pub fn is_committed(self) -> bool {
        self == BlobRepState::Committed || self == BlobRepState::Get
    }
}

impl RepState for BlobRepState {
    fn initial() -> Self {
        BlobRepState::New
    }

    fn can_begin(from: Self, to: Self) -> bool {
        use self::BlobRepState::*;
        match (from, to) {
            (Deleted, _) => false,
            (_, Deleted) => true,
            (New, Created) => true,
            // blob-copy creates the destination blob
            (New, Copied) => true,
            (Created, Put) | (Created, Copied) | (Created, Committed) => true,
            (Put, Committed) | (Copied, Committed) => true,
            (Committed, Get) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskRepState {
    New,
    Submitted,
    Completed,
    Retrieved,
    Removed,
}

impl RepState for TaskRepState {
    fn initial() -> Self {
        TaskRepState::New
    }

    fn can_begin(from: Self, to: Self) -> bool {
        use self::TaskRepState::*;
        match (from, to) {
            (Removed, _) => false,
            (_, Removed) => true,
            (New, Submitted) | (Submitted, Completed) | (Completed, Retrieved) => true,
            _ => false,
        }
    }
}

/// Manager-side record of one object at one worker.
///
/// `state` is the last confirmed stage, `in_transition` the target of the current (or last)
/// RPC and `result` its outcome. While `result` is `Pending` no other RPC may be started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rep<S: RepState> {
    state: S,
    in_transition: S,
    result: ResultCode,
}

impl<S: RepState> Default for Rep<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: RepState> Rep<S> {
    pub fn new() -> Self {
        Rep {
            state: S::initial(),
            in_transition: S::initial(),
            result: ResultCode::Success,
        }
    }

    #[inline]
    pub fn state(&self) -> S {
        self.state
    }

    #[inline]
    pub fn in_transition(&self) -> S {
        self.in_transition
    }

    #[inline]
    pub fn result(&self) -> ResultCode {
        self.result
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.result == ResultCode::Pending
    }

    /// The last RPC failed; `state` is frozen at its last confirmed value.
    #[inline]
    pub fn is_failed(&self) -> bool {
        !self.is_pending() && !self.result.is_success()
    }

    /// Mark an RPC towards `target` as outstanding. Refused while another one is pending
    /// or if the lifecycle does not allow it.
    pub fn begin(&mut self, target: S) -> bool {
        if self.is_pending() {
            debug!("{:?} -> {:?} refused: rpc pending", self.state, target);
            return false;
        }
        if !S::can_begin(self.state, target) {
            debug!("{:?} -> {:?} refused: not a forward transition", self.state, target);
            return false;
        }
        self.in_transition = target;
        self.result = ResultCode::Pending;
        true
    }

    /// Record the response to the outstanding RPC.
    pub fn complete(&mut self, code: ResultCode) -> bool {
        if !self.is_pending() || code == ResultCode::Pending {
            return false;
        }
        self.result = code;
        if code.is_success() {
            self.state = self.in_transition;
        }
        true
    }

    /// Record an advance the worker reported on its own (e.g. a finished task).
    pub fn confirm(&mut self, target: S) -> bool {
        if self.is_pending() || !S::can_begin(self.state, target) {
            return false;
        }
        self.state = target;
        self.in_transition = target;
        self.result = ResultCode::Success;
        true
    }

    /// The relation between the three fields that every operation preserves.
    pub fn is_consistent(&self) -> bool {
        match self.result {
            ResultCode::Pending => self.state != self.in_transition,
            ResultCode::Success => self.state == self.in_transition,
            _ => true,
        }
    }
}
