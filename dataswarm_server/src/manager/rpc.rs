//! Manager side of the worker protocol: outgoing blob/task RPCs and their results.

use std::fs;

use serde_json::Value;

use dataswarm_core::comm::{self, Envelope, ResultCode};
use dataswarm_core::errors::ErrorKind;
use dataswarm_core::mq::{ConnId, Message};
use dataswarm_core::replica::{BlobRepState, ReplicaEvent, ReplicaState, TaskRepState};
use dataswarm_core::types::{RpcId, TaskRecord, TaskState};

use super::state::Manager;
use super::worker_rep::{Incoming, RpcKind, RpcOp};

impl Manager {
    fn send_rpc(&mut self, worker: ConnId, method: &str, params: Value, kind: RpcKind) -> bool {
        let rpc_id = self.next_rpc_id();
        let msg = comm::request(method, params, rpc_id);
        if !self.send(worker, &msg) {
            return false;
        }
        let sent = self.clock.now();
        match self.workers.get_mut(&worker) {
            Some(w) => {
                w.rpcs.insert(rpc_id, RpcOp { kind, sent });
                true
            }
            None => false,
        }
    }

    /// Start moving the blob rep of `file_id` at `worker` towards `target`.
    fn blob_rpc(
        &mut self,
        worker: ConnId,
        file_id: &str,
        target: BlobRepState,
        method: &str,
        params: Value,
    ) -> bool {
        match self.workers.get_mut(&worker) {
            Some(w) => {
                let began = w.blobs.entry(file_id.to_string()).or_default().begin(target);
                if !began {
                    debug!("Blob {} at {}: cannot begin {:?}", file_id, w, target);
                    return false;
                }
                debug!("Blob {} at {}: {}", file_id, w, method);
            }
            None => return false,
        }
        let kind = RpcKind::Blob(file_id.to_string(), target);
        if self.send_rpc(worker, method, params, kind) {
            return true;
        }
        if let Some(rep) = self
            .workers
            .get_mut(&worker)
            .and_then(|w| w.blobs.get_mut(file_id))
        {
            rep.complete(ResultCode::Unable);
        }
        false
    }

    pub(super) fn task_rpc(
        &mut self,
        worker: ConnId,
        task_id: &str,
        target: TaskRepState,
        method: &str,
        params: Value,
    ) -> bool {
        match self
            .workers
            .get_mut(&worker)
            .and_then(|w| w.tasks.get_mut(task_id))
        {
            Some(rep) => {
                if !rep.begin(target) {
                    return false;
                }
            }
            None => return false,
        }
        debug!("Task {} at {}: {}", task_id, worker, method);
        let kind = RpcKind::Task(task_id.to_string(), target);
        if self.send_rpc(worker, method, params, kind) {
            return true;
        }
        if let Some(rep) = self
            .workers
            .get_mut(&worker)
            .and_then(|w| w.tasks.get_mut(task_id))
        {
            rep.complete(ResultCode::Unable);
        }
        false
    }

    /// Ask a newly connected worker for what it already holds.
    pub(super) fn list_worker(&mut self, worker: ConnId) {
        if self.send_rpc(worker, "blob-list", json!({}), RpcKind::BlobList) {
            self.send_rpc(worker, "task-list", json!({}), RpcKind::TaskList);
        }
    }

    pub(super) fn create_replica(&mut self, worker: ConnId, file_id: &str) -> bool {
        let params = match self.files.get(file_id) {
            Some(file) => json!({
                "blob-id": file_id,
                "size": file.size,
                "metadata": file.metadata,
            }),
            None => return false,
        };
        let size = params["size"].as_u64().unwrap_or(0);
        self.replicas.insert(file_id, worker, size);
        if self.blob_rpc(worker, file_id, BlobRepState::Created, "blob-create", params) {
            return true;
        }
        self.drop_replica(worker, file_id);
        false
    }

    /// Create the replica at `worker` as a copy of `source`, which that worker holds.
    pub(super) fn copy_replica(&mut self, worker: ConnId, file_id: &str, source: &str) -> bool {
        let size = match self.files.get(file_id) {
            Some(file) => file.size,
            None => return false,
        };
        self.replicas.insert(file_id, worker, size);
        let params = json!({ "blob-id": file_id, "blob-id-source": source });
        if self.blob_rpc(worker, file_id, BlobRepState::Copied, "blob-copy", params) {
            return true;
        }
        self.drop_replica(worker, file_id);
        false
    }

    /// Upload the staging copy of `file_id` into the replica at `worker`.
    pub(super) fn put_replica(&mut self, worker: ConnId, file_id: &str) -> bool {
        let staging = match self.files.get(file_id) {
            Some(file) if file.staged => file.staging.clone(),
            _ => return false,
        };
        let contents = match fs::File::open(&staging) {
            Ok(contents) => contents,
            Err(e) => {
                warn!("Cannot open staging copy of {}: {}", file_id, e);
                if let Some(file) = self.files.get_mut(file_id) {
                    file.staged = false;
                }
                return false;
            }
        };
        let params = json!({ "blob-id": file_id });
        if !self.blob_rpc(worker, file_id, BlobRepState::Put, "blob-put", params) {
            return false;
        }
        if let Some(conn) = self.group.get_mut(worker) {
            if let Err(e) = conn.send_fd(contents, 0) {
                warn!("Cannot send {} to {}: {}", file_id, worker, e);
            }
        }
        true
    }

    pub(super) fn commit_replica(&mut self, worker: ConnId, file_id: &str) -> bool {
        let params = json!({ "blob-id": file_id });
        self.blob_rpc(worker, file_id, BlobRepState::Committed, "blob-commit", params)
    }

    pub(super) fn delete_replica(&mut self, worker: ConnId, file_id: &str) -> bool {
        let unlinked = self
            .replicas
            .lookup(file_id, worker)
            .map_or(true, |r| r.state() == ReplicaState::Deleting);
        if !unlinked {
            self.replicas.event(file_id, worker, ReplicaEvent::Unlink);
        }
        let params = json!({ "blob-id": file_id });
        self.blob_rpc(worker, file_id, BlobRepState::Deleted, "blob-delete", params)
    }

    /// Ask `worker` to send back the contents of its replica of `file_id`.
    pub(super) fn fetch_replica(&mut self, worker: ConnId, file_id: &str) -> bool {
        let params = json!({ "blob-id": file_id });
        self.blob_rpc(worker, file_id, BlobRepState::Get, "blob-get", params)
    }

    fn drop_replica(&mut self, worker: ConnId, file_id: &str) {
        self.replicas.event(file_id, worker, ReplicaEvent::CacheInvalid);
        if let Some(w) = self.workers.get_mut(&worker) {
            w.blobs.remove(file_id);
        }
    }

    pub(super) fn handle_worker_message(&mut self, worker: ConnId, msg: Message) {
        let buf = match msg {
            Message::File { length, .. } => {
                self.receive_blob(worker, length);
                return;
            }
            Message::Buffer(buf) => buf,
        };
        let envelope = match comm::decode(&buf) {
            Ok(envelope) => envelope,
            Err(code) => {
                let e = ErrorKind::Protocol(format!("malformed message: {}", code.as_str()));
                self.protocol_violation(worker, e.into());
                return;
            }
        };
        match envelope {
            Envelope::Response { id, result } => {
                self.handle_rpc_result(worker, id, ResultCode::Success, result)
            }
            Envelope::Error { id, code, message, data } => {
                let code = ResultCode::from_code(code).unwrap_or(ResultCode::Unable);
                debug!("Worker {} refused rpc {}: {}", worker, id, message);
                self.handle_rpc_result(worker, id, code, data.unwrap_or(Value::Null))
            }
            Envelope::Notification { method, params } => {
                self.handle_worker_notification(worker, &method, &params)
            }
            Envelope::Request { method, .. } => {
                let e = ErrorKind::Protocol(format!("worker sent a {} request", method));
                self.protocol_violation(worker, e.into());
            }
        }
    }

    fn handle_worker_notification(&mut self, worker: ConnId, method: &str, params: &Value) {
        match method {
            "task-update" => {
                let update = comm::message::param_str(params, "task-id").and_then(|task_id| {
                    comm::message::param_parse::<TaskState>(params, "state")
                        .map(|state| (task_id, state))
                });
                let (task_id, state) = match update {
                    Ok(update) => update,
                    Err(_) => {
                        warn!("Invalid task-update from worker {}", worker);
                        return;
                    }
                };
                debug!("Task {} is {:?} at {}", task_id, state, worker);
                if !state.is_finished() {
                    return;
                }
                if let Some(rep) = self
                    .workers
                    .get_mut(&worker)
                    .and_then(|w| w.tasks.get_mut(task_id))
                {
                    if !rep.confirm(TaskRepState::Completed) {
                        debug!("Task {} completion ignored in {:?}", task_id, rep.state());
                    }
                }
            }
            "blob-update" => {
                debug!("Blob update from {}: {}", worker, params);
            }
            "status-report" => {
                if let Some(w) = self.workers.get_mut(&worker) {
                    w.last_status = Some(params.clone());
                }
            }
            other => warn!("Unknown notification {} from worker {}", other, worker),
        }
    }

    fn handle_rpc_result(&mut self, worker: ConnId, rpc_id: RpcId, code: ResultCode, data: Value) {
        let op = match self
            .workers
            .get_mut(&worker)
            .and_then(|w| w.rpcs.remove(&rpc_id))
        {
            Some(op) => op,
            None => {
                let e = ErrorKind::Protocol(format!("answer to unknown rpc {}", rpc_id));
                self.protocol_violation(worker, e.into());
                return;
            }
        };
        match op.kind {
            RpcKind::Blob(file_id, target) => self.blob_result(worker, &file_id, target, code),
            RpcKind::Task(task_id, target) => self.task_result(worker, &task_id, target, code, data),
            RpcKind::BlobList | RpcKind::TaskList => {
                if code.is_success() {
                    debug!("Listing from {}: {}", worker, data);
                } else {
                    warn!("Listing at {} failed: {}", worker, code.as_str());
                }
            }
        }
    }

    fn blob_result(&mut self, worker: ConnId, file_id: &str, target: BlobRepState, code: ResultCode) {
        let code = match (target, code) {
            (BlobRepState::Created, ResultCode::BlobIdExists)
            | (BlobRepState::Deleted, ResultCode::NoSuchBlobId) => ResultCode::Success,
            (_, code) => code,
        };
        let completed = match self
            .workers
            .get_mut(&worker)
            .and_then(|w| w.blobs.get_mut(file_id))
        {
            Some(rep) => rep.complete(code),
            None => false,
        };
        if !completed {
            debug!("Stale {:?} result for blob {} at {}", target, file_id, worker);
            return;
        }
        if !code.is_success() {
            warn!(
                "Blob {} at {}: {:?} failed: {}",
                file_id,
                worker,
                target,
                code.as_str()
            );
        }
        match target {
            BlobRepState::Created | BlobRepState::Copied => {
                if code.is_success() {
                    self.replicas.event(file_id, worker, ReplicaEvent::CacheUpdate);
                } else {
                    self.drop_replica(worker, file_id);
                }
            }
            BlobRepState::Committed => {
                if code.is_success() {
                    self.replicas.event(file_id, worker, ReplicaEvent::CacheUpdate);
                }
            }
            BlobRepState::Get => {
                if code.is_success() {
                    self.expect_blob(worker, file_id);
                }
            }
            BlobRepState::Deleted => {
                if code.is_success() {
                    self.drop_replica(worker, file_id);
                }
            }
            BlobRepState::New | BlobRepState::Put => {}
        }
    }

    /// A successful blob-get response is followed by the contents.
    fn expect_blob(&mut self, worker: ConnId, file_id: &str) {
        let partial = self
            .files
            .get(file_id)
            .filter(|f| !f.is_removed())
            .map(|f| f.partial_path());
        let opened = match partial {
            Some(path) => fs::File::create(&path).map(|f| (f, Some(path))),
            None => discard_sink().map(|f| (f, None)),
        };
        let (sink, partial) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                warn!("Cannot store contents of {}: {}", file_id, e);
                self.disconnect(worker);
                return;
            }
        };
        let stored = match self.group.get_mut(worker) {
            Some(conn) => conn.store_fd(sink, 0),
            None => return,
        };
        match stored {
            Ok(()) => {
                if let Some(w) = self.workers.get_mut(&worker) {
                    w.incoming = Some(Incoming {
                        file_id: file_id.to_string(),
                        partial,
                    });
                }
            }
            Err(e) => {
                warn!("Cannot receive {} from {}: {}", file_id, worker, e);
                self.disconnect(worker);
            }
        }
    }

    fn receive_blob(&mut self, worker: ConnId, length: u64) {
        let incoming = match self.workers.get_mut(&worker).and_then(|w| w.incoming.take()) {
            Some(incoming) => incoming,
            None => {
                let e = ErrorKind::Protocol(format!("{} bytes of unrequested contents", length));
                self.protocol_violation(worker, e.into());
                return;
            }
        };
        let partial = match incoming.partial {
            Some(partial) => partial,
            None => return,
        };
        match self.files.get_mut(&incoming.file_id) {
            Some(file) if !file.is_removed() => match fs::rename(&partial, &file.staging) {
                Ok(()) => {
                    file.staged = true;
                    file.size = length;
                    info!("File {} fetched ({} bytes)", file.file_id, length);
                }
                Err(e) => warn!("Cannot stage {}: {}", file.file_id, e),
            },
            _ => {
                let _ = fs::remove_file(&partial);
            }
        }
    }

    fn task_result(
        &mut self,
        worker: ConnId,
        task_id: &str,
        target: TaskRepState,
        code: ResultCode,
        data: Value,
    ) {
        let code = match (target, code) {
            (TaskRepState::Submitted, ResultCode::TaskIdExists)
            | (TaskRepState::Removed, ResultCode::NoSuchTaskId) => ResultCode::Success,
            (_, code) => code,
        };
        let completed = match self
            .workers
            .get_mut(&worker)
            .and_then(|w| w.tasks.get_mut(task_id))
        {
            Some(rep) => rep.complete(code),
            None => false,
        };
        if !completed {
            debug!("Stale {:?} result for task {} at {}", target, task_id, worker);
            return;
        }
        if !code.is_success() {
            warn!(
                "Task {} at {}: {:?} failed: {}",
                task_id,
                worker,
                target,
                code.as_str()
            );
        }
        match target {
            TaskRepState::Submitted => {
                if code.is_success() {
                    let mut outputs = Vec::new();
                    if let Some(task) = self.tasks.get_mut(task_id) {
                        if task.record.state == TaskState::Ready {
                            task.record.state = TaskState::Running;
                            info!("Task {} running at {}", task_id, worker);
                        }
                        outputs.extend(
                            task.record
                                .spec
                                .namespace
                                .iter()
                                .filter(|(_, m)| !m.flags.is_read_only())
                                .map(|(f, _)| f.clone()),
                        );
                    }
                    // the task's output replaces any staged contents
                    for file_id in outputs {
                        if let Some(file) = self.files.get_mut(&file_id) {
                            file.staged = false;
                        }
                    }
                    self.notify_task(task_id);
                } else {
                    self.unassign_task(task_id);
                }
            }
            TaskRepState::Retrieved => {
                if !code.is_success() {
                    return;
                }
                let record: Option<TaskRecord> = ::serde_json::from_value(data).ok();
                let running = match self.tasks.get_mut(task_id) {
                    Some(task) if task.record.state == TaskState::Running => {
                        match record {
                            Some(record) if record.state.is_finished() => {
                                task.record.state = record.state;
                                task.record.exit_code = record.exit_code;
                                task.record.signal = record.signal;
                            }
                            _ => {
                                warn!("Worker {} returned no final state for {}", worker, task_id);
                                task.record.state = TaskState::Failed;
                            }
                        }
                        true
                    }
                    _ => false,
                };
                if running {
                    info!("Task {} finished at {}", task_id, worker);
                    self.finish_task(task_id);
                }
            }
            TaskRepState::Removed => {
                if code.is_success() {
                    self.forget_task(task_id);
                }
            }
            TaskRepState::New | TaskRepState::Completed => {}
        }
    }
}

/// Destination for contents that are read off the wire and dropped.
pub(super) fn discard_sink() -> ::std::io::Result<fs::File> {
    fs::OpenOptions::new().write(true).open("/dev/null")
}
