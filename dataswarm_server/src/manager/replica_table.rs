use std::collections::HashMap;

use rand::seq::SliceRandom;
use rand::Rng;

use dataswarm_core::mq::ConnId;
use dataswarm_core::replica::{Replica, ReplicaEvent, ReplicaState};
use dataswarm_core::types::BlobId;

/// Which workers hold a copy of which file.
#[derive(Default)]
pub struct ReplicaTable {
    files: HashMap<BlobId, HashMap<ConnId, Replica>>,
}

impl ReplicaTable {
    pub fn new() -> Self {
        Default::default()
    }

    /// Record a new copy in `Creating`. Returns false if the worker already has one.
    pub fn insert(&mut self, file_id: &str, worker: ConnId, size: u64) -> bool {
        let replicas = self.files.entry(file_id.to_string()).or_default();
        if replicas.contains_key(&worker) {
            return false;
        }
        replicas.insert(worker, Replica::new(size));
        true
    }

    pub fn remove(&mut self, file_id: &str, worker: ConnId) -> Option<Replica> {
        let (replica, empty) = {
            let replicas = self.files.get_mut(file_id)?;
            (replicas.remove(&worker), replicas.is_empty())
        };
        if empty {
            self.files.remove(file_id);
        }
        replica
    }

    pub fn lookup(&self, file_id: &str, worker: ConnId) -> Option<&Replica> {
        self.files.get(file_id).and_then(|r| r.get(&worker))
    }

    /// Apply `event` to one replica. A replica that reaches `Deleted` leaves the table.
    pub fn event(&mut self, file_id: &str, worker: ConnId, event: ReplicaEvent) -> bool {
        let (changed, deleted) = match self.files.get_mut(file_id).and_then(|r| r.get_mut(&worker))
        {
            Some(replica) => {
                let changed = replica.change_state_on_event(event);
                (changed, replica.state() == ReplicaState::Deleted)
            }
            None => return false,
        };
        if deleted {
            self.remove(file_id, worker);
        }
        changed
    }

    /// Workers holding any replica of `file_id`, in a stable order.
    pub fn workers(&self, file_id: &str) -> Vec<ConnId> {
        let mut workers: Vec<ConnId> = self
            .files
            .get(file_id)
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default();
        workers.sort();
        workers
    }

    /// A random worker with a ready replica of `file_id` that also passes `filter`.
    pub fn find_worker<R, F>(&self, file_id: &str, rng: &mut R, filter: F) -> Option<ConnId>
    where
        R: Rng,
        F: Fn(ConnId) -> bool,
    {
        let mut candidates: Vec<ConnId> = self
            .files
            .get(file_id)?
            .iter()
            .filter(|&(w, r)| r.is_ready() && filter(*w))
            .map(|(w, _)| *w)
            .collect();
        candidates.sort();
        candidates.choose(rng).cloned()
    }

    pub fn count_replicas(&self, file_id: &str, state: ReplicaState) -> usize {
        self.files
            .get(file_id)
            .map_or(0, |r| r.values().filter(|r| r.state() == state).count())
    }

    pub fn count_all(&self, file_id: &str) -> usize {
        self.files.get(file_id).map_or(0, HashMap::len)
    }

    pub fn exists_somewhere(&self, file_id: &str) -> bool {
        self.count_replicas(file_id, ReplicaState::Ready) > 0
    }

    /// Invalidate every replica held by a lost worker. Returns the affected files.
    pub fn remove_worker(&mut self, worker: ConnId) -> Vec<BlobId> {
        let file_ids: Vec<BlobId> = self
            .files
            .iter()
            .filter(|(_, r)| r.contains_key(&worker))
            .map(|(f, _)| f.clone())
            .collect();
        for file_id in &file_ids {
            self.event(file_id, worker, ReplicaEvent::CacheInvalid);
        }
        file_ids
    }
}
