//! Periodic passes that move tasks and files towards their target states.
//!
//! Every pass looks at the current state of each object and starts at most one RPC per
//! (object, worker) pair; RPC results arrive later through `rpc.rs`. Running the passes
//! repeatedly without new events does not start duplicate work.

use rand::seq::SliceRandom;

use dataswarm_core::mq::ConnId;
use dataswarm_core::replica::{BlobRepState, TaskRepState};
use dataswarm_core::types::{BlobId, TaskId, TaskSpec, TaskState};

use super::file::{FileRecord, FileState};
use super::state::Manager;

impl Manager {
    pub(super) fn schedule(&mut self) {
        let mut task_ids: Vec<TaskId> = self.tasks.keys().cloned().collect();
        task_ids.sort();
        for task_id in &task_ids {
            self.schedule_task(task_id);
        }

        let mut file_ids: Vec<BlobId> = self.files.keys().cloned().collect();
        file_ids.sort();
        for file_id in &file_ids {
            self.schedule_file(file_id);
        }

        self.schedule_fetches();
    }

    fn schedule_task(&mut self, task_id: &str) {
        let (state, worker) = match self.tasks.get(task_id) {
            Some(task) => (task.record.state, task.worker),
            None => return,
        };
        match state {
            TaskState::Ready => self.schedule_ready_task(task_id, worker),
            TaskState::Running => {
                if let Some(worker) = worker {
                    self.retrieve_task(task_id, worker);
                }
            }
            TaskState::Deleting => self.remove_task(task_id, worker),
            TaskState::Done | TaskState::Failed | TaskState::Deleted => {}
        }
    }

    fn schedule_ready_task(&mut self, task_id: &str, worker: Option<ConnId>) {
        let spec = match self.tasks.get(task_id) {
            Some(task) => task.record.spec.clone(),
            None => return,
        };
        let missing = spec
            .namespace
            .keys()
            .find(|f| self.files.get(*f).map_or(true, FileRecord::is_removed))
            .cloned();
        if let Some(file_id) = missing {
            warn!("Task {} mounts missing file {}", task_id, file_id);
            self.fail_task(task_id);
            return;
        }

        let worker = match worker {
            Some(worker) => worker,
            None => match self.choose_worker(&spec) {
                Some(worker) => {
                    self.assign_task(task_id, worker);
                    worker
                }
                None => return,
            },
        };
        let submittable = self
            .workers
            .get(&worker)
            .and_then(|w| w.tasks.get(task_id))
            .map_or(false, |rep| {
                !rep.is_pending() && rep.state() == TaskRepState::New
            });
        if !submittable {
            return;
        }

        // Every mount gets a chance to make progress in this pass
        let mut satisfied = true;
        for (file_id, mount) in &spec.namespace {
            let ready = if mount.flags.is_read_only() {
                self.ensure_input(worker, file_id)
            } else {
                self.ensure_output(worker, file_id)
            };
            satisfied &= ready;
        }
        if !satisfied {
            return;
        }

        let params = match ::serde_json::to_value(&spec) {
            Ok(params) => params,
            Err(e) => {
                error!("Cannot encode task {}: {}", task_id, e);
                return;
            }
        };
        self.task_rpc(worker, task_id, TaskRepState::Submitted, "task-submit", params);
    }

    /// A worker that has room for the task and already holds every output file that has
    /// replicas somewhere.
    fn choose_worker(&mut self, spec: &TaskSpec) -> Option<ConnId> {
        let outputs: Vec<&BlobId> = spec
            .namespace
            .iter()
            .filter(|(_, mount)| !mount.flags.is_read_only())
            .map(|(file_id, _)| file_id)
            .collect();
        let replicas = &self.replicas;
        let mut candidates: Vec<ConnId> = self
            .workers
            .values()
            .filter(|w| w.fits(&spec.resources))
            .filter(|w| {
                outputs.iter().all(|f| {
                    replicas.count_all(f) == 0 || replicas.lookup(f, w.id()).is_some()
                })
            })
            .map(|w| w.id())
            .collect();
        candidates.sort();
        candidates.choose(&mut self.rng).cloned()
    }

    /// The input is committed at `worker`.
    fn ensure_input(&mut self, worker: ConnId, file_id: &str) -> bool {
        match self.files.get(file_id) {
            Some(file) if file.state == FileState::Immutable => {}
            _ => return false,
        }
        self.drive_to_committed(worker, file_id, true)
    }

    /// The output exists at `worker` and can still be written.
    fn ensure_output(&mut self, worker: ConnId, file_id: &str) -> bool {
        match self.files.get(file_id) {
            Some(file) if file.state == FileState::Mutable => {}
            _ => return false,
        }
        let rep = self
            .workers
            .get(&worker)
            .and_then(|w| w.blob_state(file_id))
            .cloned();
        match rep {
            None => {
                self.create_replica(worker, file_id);
                false
            }
            Some(rep) => {
                !rep.is_pending() && rep.state().is_created() && !rep.state().is_committed()
            }
        }
    }

    /// Take one step towards a committed replica of `file_id` at `worker`. With
    /// `need_contents`, a fresh replica is filled from the staging copy first.
    fn drive_to_committed(&mut self, worker: ConnId, file_id: &str, need_contents: bool) -> bool {
        let staged = self.files.get(file_id).map_or(false, |f| f.staged);
        // contents that exist only at other workers are fetched and staged first
        let fetch = need_contents && !staged && self.committed_elsewhere(file_id, worker);
        let rep = self
            .workers
            .get(&worker)
            .and_then(|w| w.blob_state(file_id))
            .cloned();
        let rep = match rep {
            Some(rep) => rep,
            None => {
                if fetch {
                    self.fetches.insert(file_id.to_string());
                } else {
                    self.create_replica(worker, file_id);
                }
                return false;
            }
        };
        if rep.is_pending() {
            return false;
        }
        match rep.state() {
            state if state.is_committed() => return true,
            BlobRepState::Created => {
                if staged {
                    self.put_replica(worker, file_id);
                } else if fetch {
                    self.fetches.insert(file_id.to_string());
                } else {
                    self.commit_replica(worker, file_id);
                }
            }
            BlobRepState::Put | BlobRepState::Copied => {
                self.commit_replica(worker, file_id);
            }
            _ => {}
        }
        false
    }

    fn committed_elsewhere(&self, file_id: &str, worker: ConnId) -> bool {
        self.replicas.workers(file_id).iter().any(|&w| {
            w != worker
                && self
                    .workers
                    .get(&w)
                    .and_then(|w| w.blob_state(file_id))
                    .map_or(false, |rep| rep.state().is_committed())
        })
    }

    fn retrieve_task(&mut self, task_id: &str, worker: ConnId) {
        let completed = self
            .workers
            .get(&worker)
            .and_then(|w| w.tasks.get(task_id))
            .map_or(false, |rep| {
                !rep.is_pending() && rep.state() == TaskRepState::Completed
            });
        if completed {
            let params = json!({ "task-id": task_id });
            self.task_rpc(worker, task_id, TaskRepState::Retrieved, "task-get", params);
        }
    }

    fn remove_task(&mut self, task_id: &str, worker: Option<ConnId>) {
        let rep = worker.and_then(|w| {
            self.workers
                .get(&w)
                .and_then(|w| w.tasks.get(task_id))
                .cloned()
        });
        match (worker, rep) {
            (Some(worker), Some(rep)) => {
                if rep.is_pending() {
                    return;
                }
                if rep.state() == TaskRepState::New {
                    // never reached the worker
                    self.forget_task(task_id);
                    return;
                }
                let params = json!({ "task-id": task_id });
                self.task_rpc(worker, task_id, TaskRepState::Removed, "task-remove", params);
            }
            _ => self.forget_task(task_id),
        }
    }

    fn schedule_file(&mut self, file_id: &str) {
        let (state, staged, copy_of) = match self.files.get(file_id) {
            Some(file) => (file.state, file.staged, file.copy_of.clone()),
            None => return,
        };
        match state {
            FileState::Allocating => self.allocate_file(file_id, copy_of),
            FileState::Mutable => {
                if !staged && self.replicas.count_all(file_id) == 0 {
                    info!("File {} lost all replicas, allocating again", file_id);
                    self.set_file_state(file_id, FileState::Allocating);
                }
            }
            FileState::Committing => {
                for worker in self.replicas.workers(file_id) {
                    self.drive_to_committed(worker, file_id, false);
                }
                if self.all_replicas(file_id, |s| s.is_committed()) {
                    info!("File {} is immutable", file_id);
                    self.set_file_state(file_id, FileState::Immutable);
                }
            }
            FileState::Deleting => {
                for worker in self.replicas.workers(file_id) {
                    let busy = self
                        .workers
                        .get(&worker)
                        .and_then(|w| w.blob_state(file_id))
                        .map_or(false, |rep| {
                            rep.is_pending() || rep.state() == BlobRepState::Deleted
                        });
                    if !busy {
                        self.delete_replica(worker, file_id);
                    }
                }
                if self.replicas.count_all(file_id) == 0 {
                    self.purge_file(file_id);
                }
            }
            FileState::Immutable | FileState::Deleted => {}
        }
    }

    fn allocate_file(&mut self, file_id: &str, copy_of: Option<BlobId>) {
        if self.replicas.count_all(file_id) > 0 {
            if self.all_replicas(file_id, |s| s.is_created() && !s.is_committed()) {
                debug!("File {} is mutable", file_id);
                self.set_file_state(file_id, FileState::Mutable);
            }
            return;
        }
        match copy_of {
            Some(source) => {
                let workers = &self.workers;
                let holder = self.replicas.find_worker(&source, &mut self.rng, |w| {
                    workers
                        .get(&w)
                        .and_then(|w| w.blob_state(&source))
                        .map_or(false, |rep| !rep.is_pending() && rep.state().is_committed())
                });
                match holder {
                    Some(worker) => {
                        self.copy_replica(worker, file_id, &source);
                    }
                    None => debug!("No replica of {} to copy into {}", source, file_id),
                }
            }
            None => {
                let worker = match self.writer_of(file_id) {
                    Some(worker) => Some(worker),
                    None => {
                        let mut workers: Vec<ConnId> = self.workers.keys().cloned().collect();
                        workers.sort();
                        workers.choose(&mut self.rng).cloned()
                    }
                };
                if let Some(worker) = worker {
                    self.create_replica(worker, file_id);
                }
            }
        }
    }

    /// Worker of an assigned task that mounts `file_id` for writing.
    fn writer_of(&self, file_id: &str) -> Option<ConnId> {
        let mut writers: Vec<ConnId> = self
            .tasks
            .values()
            .filter(|t| {
                t.record
                    .spec
                    .namespace
                    .get(file_id)
                    .map_or(false, |m| !m.flags.is_read_only())
            })
            .filter_map(|t| t.worker)
            .filter(|w| self.workers.contains_key(w))
            .collect();
        writers.sort();
        writers.into_iter().next()
    }

    /// Every replica of `file_id` is settled in a state satisfying `check`. A file without
    /// replicas passes.
    fn all_replicas<F>(&self, file_id: &str, check: F) -> bool
    where
        F: Fn(BlobRepState) -> bool,
    {
        self.replicas.workers(file_id).iter().all(|w| {
            self.workers
                .get(w)
                .and_then(|w| w.blob_state(file_id))
                .map_or(false, |rep| !rep.is_pending() && check(rep.state()))
        })
    }

    fn set_file_state(&mut self, file_id: &str, state: FileState) {
        if let Some(file) = self.files.get_mut(file_id) {
            file.state = state;
        }
    }

    /// Drop a deleted file and its staging copy.
    fn purge_file(&mut self, file_id: &str) {
        if let Some(file) = self.files.remove(file_id) {
            let _ = ::std::fs::remove_file(&file.staging);
            let _ = ::std::fs::remove_file(file.partial_path());
            self.fetches.remove(file_id);
            info!("File {} deleted", file_id);
        }
    }

    /// Bring committed contents back to the staging area, one transfer per file.
    fn schedule_fetches(&mut self) {
        let mut file_ids: Vec<BlobId> = self.fetches.iter().cloned().collect();
        file_ids.sort();
        for file_id in file_ids {
            let (state, staged) = match self.files.get(&file_id) {
                Some(file) => (file.state, file.staged),
                None => {
                    self.fetches.remove(&file_id);
                    continue;
                }
            };
            if staged || state == FileState::Deleting || state == FileState::Deleted {
                self.fetches.remove(&file_id);
                continue;
            }
            if state != FileState::Immutable
                || self.workers.values().any(|w| w.is_fetching(&file_id))
            {
                continue;
            }
            let workers = &self.workers;
            let holder = self.replicas.find_worker(&file_id, &mut self.rng, |w| {
                workers
                    .get(&w)
                    .and_then(|w| w.blob_state(&file_id))
                    .map_or(false, |rep| {
                        !rep.is_pending() && rep.state() == BlobRepState::Committed
                    })
            });
            match holder {
                Some(worker) => {
                    debug!("Fetching {} from {}", file_id, worker);
                    self.fetch_replica(worker, &file_id);
                }
                None => debug!("No replica of {} to fetch", file_id),
            }
        }
    }
}
