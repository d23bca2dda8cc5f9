//! Requests from clients: task and file management, `wait` and status queries.

use std::fs;
use std::mem;

use serde_json::Value;

use dataswarm_core::comm::message::{param_str, param_u64};
use dataswarm_core::comm::{self, Envelope, ResultCode};
use dataswarm_core::errors::ErrorKind;
use dataswarm_core::mq::{ConnId, Message};
use dataswarm_core::types::{is_valid_id, new_id, BlobId, RpcId, TaskRecord, TaskSpec, TaskState};

use super::client_rep::Upload;
use super::file::{FileRecord, FileState};
use super::rpc::discard_sink;
use super::state::{Manager, PendingGet};

/// How a client request is answered.
enum Reply {
    Now(Option<Value>),
    /// The handler answers later (after contents arrive or a task finishes).
    Later,
}

type OpResult = ::std::result::Result<Reply, ResultCode>;

impl Manager {
    pub(super) fn handle_client_message(&mut self, client: ConnId, msg: Message) {
        let buf = match msg {
            Message::File { length, .. } => {
                self.receive_upload(client, length);
                return;
            }
            Message::Buffer(buf) => buf,
        };
        let (rpc_id, method, params) = match comm::decode(&buf) {
            Ok(Envelope::Request { id, method, params }) => (id, method, params),
            Ok(other) => {
                let e = ErrorKind::Protocol(format!("client sent a {:?}", other.method()));
                self.protocol_violation(client, e.into());
                return;
            }
            Err(code) => {
                let e = ErrorKind::Protocol(format!("malformed message: {}", code.as_str()));
                self.protocol_violation(client, e.into());
                return;
            }
        };
        debug!("Client {} calls {}", client, method);
        let outcome = match method.as_str() {
            "task-submit" => self.client_task_submit(client, &params),
            "task-delete" => self.client_task_delete(&params),
            "task-retrieve" => self.client_task_retrieve(&params),
            "file-create" => self.client_file_create(&params),
            "file-put" => self.client_file_put(client, rpc_id, &params),
            "file-submit" => self.client_file_submit(client, rpc_id, &params),
            "file-commit" => self.client_file_commit(&params),
            "file-delete" => self.client_file_delete(&params),
            "file-copy" => self.client_file_copy(&params),
            "file-get" => self.client_file_get(client, rpc_id, &params),
            "wait" => self.client_wait(client, rpc_id),
            "queue-empty" => Ok(Reply::Now(Some(json!({ "empty": self.queue_empty() })))),
            "status" => Ok(Reply::Now(Some(self.status()))),
            _ => Err(ResultCode::BadMethod),
        };
        match outcome {
            Ok(Reply::Now(data)) => {
                self.respond(client, rpc_id, ResultCode::Success, data);
            }
            Ok(Reply::Later) => {}
            Err(code) => {
                debug!("Client {} {} failed: {}", client, method, code.as_str());
                self.respond(client, rpc_id, code, None);
            }
        }
    }

    fn client_task_submit(&mut self, client: ConnId, params: &Value) -> OpResult {
        let mut spec: TaskSpec =
            ::serde_json::from_value(params.clone()).map_err(|_| ResultCode::BadParams)?;
        if spec.task_id.is_empty() {
            spec.task_id = new_id();
        }
        if !is_valid_id(&spec.task_id) || !spec.validate() {
            return Err(ResultCode::BadParams);
        }
        if self.tasks.contains_key(&spec.task_id) {
            return Err(ResultCode::TaskIdExists);
        }
        for file_id in spec.namespace.keys() {
            match self.files.get(file_id) {
                Some(file) if !file.is_removed() => {}
                _ => return Err(ResultCode::NoSuchBlobId),
            }
        }
        let task_id = self.add_task(TaskRecord::new(spec), Some(client));
        Ok(Reply::Now(Some(json!({ "task-id": task_id }))))
    }

    fn client_task_delete(&mut self, params: &Value) -> OpResult {
        let task_id = param_str(params, "task-id")?;
        let task = self.tasks.get_mut(task_id).ok_or(ResultCode::NoSuchTaskId)?;
        if task.record.state != TaskState::Deleting {
            debug!("Task {} marked for deletion", task_id);
            task.record.state = TaskState::Deleting;
        }
        Ok(Reply::Now(None))
    }

    fn client_task_retrieve(&mut self, params: &Value) -> OpResult {
        let task_id = param_str(params, "task-id")?;
        let task = self.tasks.get(task_id).ok_or(ResultCode::NoSuchTaskId)?;
        Ok(Reply::Now(Some(task.info())))
    }

    /// Register a new file in `Allocating` and return its id.
    pub(super) fn declare_file(&mut self, size: u64, metadata: Value) -> BlobId {
        let file_id = new_id();
        let staging = self.staging_dir.join(&file_id);
        debug!("File {} declared ({} bytes)", file_id, size);
        self.files.insert(
            file_id.clone(),
            FileRecord::new(file_id.clone(), size, metadata, staging),
        );
        file_id
    }

    fn file_params(params: &Value) -> (u64, Value) {
        let size = param_u64(params, "size").unwrap_or(0);
        let metadata = params.get("metadata").cloned().unwrap_or(Value::Null);
        (size, metadata)
    }

    fn client_file_create(&mut self, params: &Value) -> OpResult {
        let (size, metadata) = Self::file_params(params);
        let file_id = self.declare_file(size, metadata);
        Ok(Reply::Now(Some(json!({ "file-id": file_id }))))
    }

    fn client_file_put(&mut self, client: ConnId, rpc_id: RpcId, params: &Value) -> OpResult {
        let checked = param_str(params, "file-id").and_then(|file_id| {
            match self.files.get(file_id) {
                Some(file) if file.accepts_contents() => Ok(file_id.to_string()),
                Some(_) => Err(ResultCode::BadState),
                None => Err(ResultCode::NoSuchBlobId),
            }
        });
        let upload = match checked {
            Ok(file_id) => Upload {
                rpc_id,
                file_id: Some(file_id),
                reply_with_id: false,
                refusal: None,
            },
            Err(code) => Upload {
                rpc_id,
                file_id: None,
                reply_with_id: false,
                refusal: Some(code),
            },
        };
        self.expect_upload(client, upload)
    }

    fn client_file_submit(&mut self, client: ConnId, rpc_id: RpcId, params: &Value) -> OpResult {
        let (size, metadata) = Self::file_params(params);
        let file_id = self.declare_file(size, metadata);
        self.expect_upload(
            client,
            Upload {
                rpc_id,
                file_id: Some(file_id),
                reply_with_id: true,
                refusal: None,
            },
        )
    }

    /// The message after a `file-put` or `file-submit` carries the contents; route it into
    /// the partial staging file, or drop it if the request was refused.
    fn expect_upload(&mut self, client: ConnId, mut upload: Upload) -> OpResult {
        let partial = upload
            .file_id
            .as_ref()
            .and_then(|f| self.files.get(f))
            .map(FileRecord::partial_path);
        let sink = match partial {
            Some(path) => fs::File::create(&path).or_else(|e| {
                warn!("Cannot create {:?}: {}", path, e);
                upload.file_id = None;
                upload.refusal = Some(ResultCode::Unable);
                discard_sink()
            }),
            None => discard_sink(),
        };
        let stored = match (sink, self.group.get_mut(client)) {
            (Ok(sink), Some(conn)) => conn.store_fd(sink, 0).is_ok(),
            _ => false,
        };
        if !stored {
            warn!("Cannot receive contents from client {}, disconnecting", client);
            self.disconnect(client);
            return Ok(Reply::Later);
        }
        if let Some(c) = self.clients.get_mut(&client) {
            c.upload = Some(upload);
        }
        Ok(Reply::Later)
    }

    fn receive_upload(&mut self, client: ConnId, length: u64) {
        let upload = match self.clients.get_mut(&client).and_then(|c| c.upload.take()) {
            Some(upload) => upload,
            None => {
                let e = ErrorKind::Protocol(format!("{} bytes of unrequested contents", length));
                self.protocol_violation(client, e.into());
                return;
            }
        };
        if let Some(code) = upload.refusal {
            self.respond(client, upload.rpc_id, code, None);
            return;
        }
        let file_id = match upload.file_id {
            Some(file_id) => file_id,
            None => return,
        };
        let staged = match self.files.get_mut(&file_id) {
            Some(file) if file.accepts_contents() => {
                match fs::rename(file.partial_path(), &file.staging) {
                    Ok(()) => {
                        file.staged = true;
                        file.size = length;
                        info!("File {} uploaded ({} bytes)", file_id, length);
                        Ok(())
                    }
                    Err(e) => {
                        warn!("Cannot stage {}: {}", file_id, e);
                        Err(ResultCode::Unable)
                    }
                }
            }
            Some(file) => {
                let _ = fs::remove_file(file.partial_path());
                Err(ResultCode::BadState)
            }
            None => Err(ResultCode::NoSuchBlobId),
        };
        match staged {
            Ok(()) => {
                let data = if upload.reply_with_id {
                    Some(json!({ "file-id": file_id }))
                } else {
                    None
                };
                self.respond(client, upload.rpc_id, ResultCode::Success, data);
            }
            Err(code) => {
                self.respond(client, upload.rpc_id, code, None);
            }
        }
    }

    /// Freeze the contents of a file; replicas are committed by the scheduler.
    pub(super) fn commit_file(&mut self, file_id: &str) -> ::std::result::Result<(), ResultCode> {
        let file = self.files.get_mut(file_id).ok_or(ResultCode::NoSuchBlobId)?;
        match file.state {
            FileState::Allocating | FileState::Mutable => {
                debug!("File {} committing", file_id);
                file.state = FileState::Committing;
                Ok(())
            }
            FileState::Committing | FileState::Immutable => Ok(()),
            FileState::Deleting | FileState::Deleted => Err(ResultCode::BadState),
        }
    }

    fn client_file_commit(&mut self, params: &Value) -> OpResult {
        let file_id = param_str(params, "file-id")?;
        self.commit_file(file_id)?;
        Ok(Reply::Now(None))
    }

    fn client_file_delete(&mut self, params: &Value) -> OpResult {
        let file_id = param_str(params, "file-id")?;
        let file = self.files.get_mut(file_id).ok_or(ResultCode::NoSuchBlobId)?;
        if !file.is_removed() {
            debug!("File {} marked for deletion", file_id);
            file.state = FileState::Deleting;
        }
        Ok(Reply::Now(None))
    }

    fn client_file_copy(&mut self, params: &Value) -> OpResult {
        let source_id = param_str(params, "file-id")?;
        let (size, metadata, staged, source_staging) = match self.files.get(source_id) {
            Some(source) if source.state == FileState::Immutable => (
                source.size,
                source.metadata.clone(),
                source.staged,
                source.staging.clone(),
            ),
            Some(_) => return Err(ResultCode::BadState),
            None => return Err(ResultCode::NoSuchBlobId),
        };
        let file_id = self.declare_file(size, metadata);
        let copied = staged && {
            let file = self.files.get(&file_id).map(|f| f.staging.clone());
            match file.map(|dest| fs::copy(&source_staging, dest)) {
                Some(Ok(_)) => true,
                Some(Err(e)) => {
                    warn!("Cannot copy staging copy of {}: {}", source_id, e);
                    false
                }
                None => false,
            }
        };
        if let Some(file) = self.files.get_mut(&file_id) {
            if copied {
                file.staged = true;
            } else {
                file.copy_of = Some(source_id.to_string());
            }
        }
        Ok(Reply::Now(Some(json!({ "file-id": file_id }))))
    }

    fn client_file_get(&mut self, client: ConnId, rpc_id: RpcId, params: &Value) -> OpResult {
        let file_id = param_str(params, "file-id")?;
        match self.files.get(file_id).map(|f| f.state) {
            Some(FileState::Committing) | Some(FileState::Immutable) => {}
            Some(_) => return Err(ResultCode::BadState),
            None => return Err(ResultCode::NoSuchBlobId),
        }
        self.fetches.insert(file_id.to_string());
        self.file_gets.push(PendingGet {
            client,
            rpc_id,
            file_id: file_id.to_string(),
        });
        Ok(Reply::Later)
    }

    /// Answer `file-get` requests whose contents are now staged.
    pub(super) fn serve_file_gets(&mut self) {
        let gets = mem::replace(&mut self.file_gets, Vec::new());
        for get in gets {
            if !self.clients.contains_key(&get.client) {
                continue;
            }
            let ready = match self.files.get(&get.file_id) {
                Some(file) if file.is_removed() => Err(ResultCode::NoSuchBlobId),
                Some(file) if file.state == FileState::Immutable && file.staged => {
                    Ok(Some((file.staging.clone(), file.size)))
                }
                Some(_) => Ok(None),
                None => Err(ResultCode::NoSuchBlobId),
            };
            match ready {
                Ok(Some((staging, size))) => self.send_file(&get, &staging, size),
                Ok(None) => {
                    self.fetches.insert(get.file_id.clone());
                    self.file_gets.push(get);
                }
                Err(code) => {
                    self.respond(get.client, get.rpc_id, code, None);
                }
            }
        }
    }

    fn send_file(&mut self, get: &PendingGet, staging: &::std::path::Path, size: u64) {
        let contents = match fs::File::open(staging) {
            Ok(contents) => contents,
            Err(e) => {
                warn!("Cannot open staging copy of {}: {}", get.file_id, e);
                self.respond(get.client, get.rpc_id, ResultCode::Unable, None);
                return;
            }
        };
        let data = json!({ "file-id": get.file_id, "size": size });
        if !self.respond(get.client, get.rpc_id, ResultCode::Success, Some(data)) {
            return;
        }
        if let Some(conn) = self.group.get_mut(get.client) {
            if let Err(e) = conn.send_fd(contents, 0) {
                warn!("Cannot send {} to client {}: {}", get.file_id, get.client, e);
            }
        }
    }

    fn client_wait(&mut self, client: ConnId, rpc_id: RpcId) -> OpResult {
        let finished = match self.clients.get_mut(&client) {
            Some(c) if c.nowait => return Err(ResultCode::BadMethod),
            Some(c) => match c.finished.pop_front() {
                Some(task_id) => Some(task_id),
                None => {
                    c.waiting = Some(rpc_id);
                    None
                }
            },
            None => return Err(ResultCode::Unable),
        };
        match finished {
            Some(task_id) => Ok(Reply::Now(Some(self.finished_task_info(&task_id)))),
            None => Ok(Reply::Later),
        }
    }

    /// No task is waiting, running or being removed.
    fn queue_empty(&self) -> bool {
        self.tasks.values().all(|t| match t.record.state {
            TaskState::Ready | TaskState::Running | TaskState::Deleting => false,
            _ => true,
        })
    }

    pub fn status(&self) -> Value {
        let mut tasks = json!({});
        for task in self.tasks.values() {
            let key = ::serde_json::to_value(task.record.state)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            let count = tasks[&key].as_u64().unwrap_or(0);
            tasks[&key] = json!(count + 1);
        }
        let workers: Vec<Value> = self.workers.values().map(|w| w.info()).collect();
        json!({
            "workers": workers,
            "clients": self.clients.len(),
            "tasks": tasks,
            "files": self.files.len(),
            "fetches": self.fetches.len(),
        })
    }
}
