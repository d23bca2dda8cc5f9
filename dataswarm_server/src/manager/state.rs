use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;

use dataswarm_core::catalog::{self, CatalogHost, MANAGER_TYPE};
use dataswarm_core::comm::{self, Envelope, ResultCode};
use dataswarm_core::errors::{Error, ErrorKind, Result};
use dataswarm_core::mq::{ConnId, Connection, Message, PollGroup};
use dataswarm_core::sys::get_hostname;
use dataswarm_core::types::{BlobId, Resources, RpcId, TaskId, TaskRecord, TaskState};
use dataswarm_core::utils::{Clock, Interval};
use dataswarm_core::VERSION;

use super::client_rep::ClientRep;
use super::file::FileRecord;
use super::replica_table::ReplicaTable;
use super::testmode::TestRoutine;
use super::worker_rep::WorkerRep;
use crate::config::ManagerConfig;

/// Role of a connection, known after its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    Pending,
    Worker,
    Client,
}

pub struct TaskEntry {
    pub record: TaskRecord,
    pub worker: Option<ConnId>,
    /// Resources currently held at `worker` on behalf of this task.
    pub reserved: Option<Resources>,
    /// Clients told about state changes.
    pub subscribers: Vec<ConnId>,
    pub submitted: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
}

impl TaskEntry {
    pub fn info(&self) -> Value {
        let mut info = self.record.update_params();
        info["command"] = json!(self.record.spec.command);
        info["submitted"] = json!(self.submitted.to_rfc3339());
        if let Some(finished) = self.finished {
            info["finished"] = json!(finished.to_rfc3339());
        }
        info
    }
}

/// A `file-get` answered once the contents are staged at the manager.
pub struct PendingGet {
    pub client: ConnId,
    pub rpc_id: RpcId,
    pub file_id: BlobId,
}

pub struct Manager {
    pub(super) config: ManagerConfig,
    pub(super) clock: Box<dyn Clock>,
    pub(super) rng: StdRng,

    pub(super) group: PollGroup<Peer>,
    listener: ConnId,
    port: u16,
    hostname: String,
    pub(super) staging_dir: PathBuf,

    /// Accepted connections waiting for their handshake.
    pending: HashMap<ConnId, Instant>,
    pub(super) workers: HashMap<ConnId, WorkerRep>,
    pub(super) clients: HashMap<ConnId, ClientRep>,

    pub(super) tasks: HashMap<TaskId, TaskEntry>,
    pub(super) files: HashMap<BlobId, FileRecord>,
    pub(super) replicas: ReplicaTable,
    /// Files whose contents should be brought back to the staging area.
    pub(super) fetches: HashSet<BlobId>,
    pub(super) file_gets: Vec<PendingGet>,
    next_rpc_id: RpcId,

    catalog_hosts: Vec<CatalogHost>,
    catalog_interval: Interval,

    pub(super) test: Option<TestRoutine>,
}

impl Manager {
    pub fn new(config: ManagerConfig, clock: Box<dyn Clock>) -> Result<Self> {
        let workdir = match config.workdir {
            Some(ref dir) => dir.clone(),
            None => bail!("Manager needs a working directory"),
        };
        let staging_dir = workdir.join("files");
        fs::create_dir_all(&staging_dir)?;

        let listener = match config.port_range {
            Some((low, high)) => Connection::serve_range(None, low, high)?,
            None => Connection::serve(None, config.port)?,
        };
        let port = listener.local_addr()?.port();
        let mut group = PollGroup::new();
        let listener = group.add(listener);

        let catalog_hosts = catalog::parse_hosts(&config.catalog.join(","))?;
        let catalog_interval = Interval::new(config.update_interval());
        let test = config.test_input.clone().map(TestRoutine::new);

        Ok(Manager {
            config,
            clock,
            rng: StdRng::from_entropy(),
            group,
            listener,
            port,
            hostname: get_hostname(),
            staging_dir,
            pending: HashMap::new(),
            workers: HashMap::new(),
            clients: HashMap::new(),
            tasks: HashMap::new(),
            files: HashMap::new(),
            replicas: ReplicaTable::new(),
            fetches: HashSet::new(),
            file_gets: Vec::new(),
            next_rpc_id: 1,
            catalog_hosts,
            catalog_interval,
            test,
        })
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// One pass of the event loop. Returns false when the manager should stop.
    pub fn turn(&mut self) -> Result<bool> {
        self.update_catalog();
        self.handle_connections();
        self.handle_messages();
        self.handle_errors();
        self.check_timeouts();
        self.schedule();
        self.serve_file_gets();
        if self.advance_test() {
            return Ok(false);
        }
        let stoptime = Instant::now() + self.config.poll_ceiling();
        self.group.poll_wait(stoptime)?;
        Ok(true)
    }

    pub fn catalog_report(&self) -> Value {
        let count = |state: TaskState| {
            self.tasks
                .values()
                .filter(|t| t.record.state == state)
                .count()
        };
        json!({
            "type": MANAGER_TYPE,
            "project": self.config.name,
            "name": self.hostname,
            "port": self.port,
            "version": VERSION,
            "workers": self.workers.len(),
            "tasks_waiting": count(TaskState::Ready),
            "tasks_running": count(TaskState::Running),
        })
    }

    fn update_catalog(&mut self) {
        if self.catalog_hosts.is_empty() || !self.catalog_interval.check(self.clock.now()) {
            return;
        }
        let report = self.catalog_report();
        match catalog::send_update(&self.catalog_hosts, &report) {
            Ok(n) => debug!("Catalog update sent to {} host(s)", n),
            Err(e) => warn!("Catalog update failed: {}", e),
        }
    }

    fn handle_connections(&mut self) {
        if self.group.poll_acceptable().is_none() {
            return;
        }
        loop {
            let mut conn = match self.group.get_mut(self.listener).and_then(|l| l.accept()) {
                Some(conn) => conn,
                None => break,
            };
            if let Err(e) = conn.store_buffer(Vec::new(), 0) {
                warn!("Cannot receive on new connection: {}", e);
                continue;
            }
            let addr = peer_name(&conn);
            conn.set_tag(Peer::Pending);
            let id = self.group.add(conn);
            debug!("New connection {} from {}", id, addr);
            self.pending.insert(id, self.clock.now());
        }
    }

    fn handle_messages(&mut self) {
        while let Some(id) = self.group.poll_readable() {
            let (msg, peer) = match self.group.get_mut(id) {
                Some(conn) => match conn.recv() {
                    Some(msg) => (msg, conn.tag().cloned().unwrap_or(Peer::Pending)),
                    None => break,
                },
                None => break,
            };
            match peer {
                Peer::Pending => self.handle_handshake(id, msg),
                Peer::Worker => self.handle_worker_message(id, msg),
                Peer::Client => self.handle_client_message(id, msg),
            }
            self.rearm(id);
        }
    }

    fn handle_errors(&mut self) {
        while let Some(id) = self.group.poll_error() {
            let errno = self.group.get(id).and_then(|c| c.error());
            match errno {
                Some(errno) => info!("Connection {} closed: {}", id, errno.desc()),
                None => info!("Connection {} closed", id),
            }
            self.disconnect(id);
        }
    }

    fn check_timeouts(&mut self) {
        let now = self.clock.now();
        let connect_timeout = self.config.connect_timeout();
        let expired: Vec<ConnId> = self
            .pending
            .iter()
            .filter(|&(_, &since)| now.saturating_duration_since(since) >= connect_timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            warn!("Connection {} did not complete its handshake, disconnecting", id);
            self.disconnect(id);
        }

        let stall_timeout = self.config.stall_timeout();
        let stalled: Vec<ConnId> = self
            .workers
            .values()
            .filter(|w| {
                w.oldest_rpc()
                    .map_or(false, |sent| now.saturating_duration_since(sent) >= stall_timeout)
            })
            .map(WorkerRep::id)
            .collect();
        for id in stalled {
            warn!("Worker {} stopped answering, disconnecting", id);
            self.disconnect(id);
        }
    }

    /// Declare storage for the next message unless a handler already did.
    pub(super) fn rearm(&mut self, id: ConnId) {
        if let Some(conn) = self.group.get_mut(id) {
            if !conn.is_error() && !conn.has_storage() {
                if let Err(e) = conn.store_buffer(Vec::new(), 0) {
                    debug!("Cannot receive on {}: {}", id, e);
                }
            }
        }
    }

    fn handle_handshake(&mut self, id: ConnId, msg: Message) {
        let (rpc_id, params) = match parse_handshake(msg) {
            Ok(handshake) => handshake,
            Err(e) => {
                self.protocol_violation(id, e);
                return;
            }
        };

        let addr = self.group.get(id).map(peer_name).unwrap_or_default();
        let peer = match params.get("type").and_then(Value::as_str) {
            Some("worker") => {
                let resources: Resources = params
                    .get("resources")
                    .cloned()
                    .and_then(|r| ::serde_json::from_value(r).ok())
                    .unwrap_or_default();
                let hostname = params
                    .get("hostname")
                    .and_then(Value::as_str)
                    .unwrap_or(&addr)
                    .to_string();
                let worker = WorkerRep::new(id, addr, hostname, resources);
                info!(
                    "New {} with {} cores, {} MB memory, {} MB disk",
                    worker, resources.cores, resources.memory, resources.disk
                );
                self.workers.insert(id, worker);
                Peer::Worker
            }
            Some("client") => {
                let nowait = params
                    .get("nowait")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                info!("New client {} from {}", id, addr);
                self.clients.insert(id, ClientRep::new(id, addr, nowait));
                Peer::Client
            }
            other => {
                let e = ErrorKind::Protocol(format!("unknown peer type {:?}", other));
                self.protocol_violation(id, e.into());
                return;
            }
        };
        let is_worker = peer == Peer::Worker;
        self.pending.remove(&id);
        if let Some(conn) = self.group.get_mut(id) {
            conn.set_tag(peer);
        }
        if let Some(rpc_id) = rpc_id {
            self.respond(id, rpc_id, ResultCode::Success, None);
        }
        if is_worker {
            self.list_worker(id);
        }
    }

    /// Drop a peer that broke the protocol.
    pub(super) fn protocol_violation(&mut self, id: ConnId, error: Error) {
        warn!("Connection {}: {}, disconnecting", id, error);
        self.disconnect(id);
    }

    /// Close `id` and forget everything bound to it.
    pub(super) fn disconnect(&mut self, id: ConnId) {
        if self.workers.contains_key(&id) {
            self.remove_worker(id);
        } else if self.clients.contains_key(&id) {
            self.remove_client(id);
        }
        self.pending.remove(&id);
        self.group.close(id);
    }

    fn remove_worker(&mut self, id: ConnId) {
        let worker = match self.workers.remove(&id) {
            Some(worker) => worker,
            None => return,
        };
        info!("Removing {}", worker);

        let lost = self.replicas.remove_worker(id);
        debug!("{} replica(s) lost with {}", lost.len(), worker);
        if let Some(partial) = worker.incoming.and_then(|i| i.partial) {
            let _ = fs::remove_file(partial);
        }

        let mut assigned: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.worker == Some(id))
            .map(|(task_id, _)| task_id.clone())
            .collect();
        assigned.sort();
        for task_id in assigned {
            let forget = match self.tasks.get_mut(&task_id) {
                Some(task) => {
                    task.worker = None;
                    task.reserved = None;
                    match task.record.state {
                        TaskState::Ready | TaskState::Running => {
                            info!("Task {} returns to the queue", task_id);
                            task.record.state = TaskState::Ready;
                            false
                        }
                        TaskState::Deleting => true,
                        _ => false,
                    }
                }
                None => false,
            };
            if forget {
                self.tasks.remove(&task_id);
                info!("Task {} deleted", task_id);
            }
        }
    }

    fn remove_client(&mut self, id: ConnId) {
        let client = match self.clients.remove(&id) {
            Some(client) => client,
            None => return,
        };
        info!("Client {} from {} disconnected", id, client.addr);
        if let Some(file_id) = client.upload.and_then(|u| u.file_id) {
            if let Some(file) = self.files.get(&file_id) {
                let _ = fs::remove_file(file.partial_path());
            }
        }
        self.file_gets.retain(|get| get.client != id);
    }

    pub(super) fn next_rpc_id(&mut self) -> RpcId {
        let id = self.next_rpc_id;
        self.next_rpc_id += 1;
        id
    }

    /// Queue `msg` on connection `id`. Returns false if it could not be queued.
    pub(super) fn send(&mut self, id: ConnId, msg: &Value) -> bool {
        match self.group.get_mut(id) {
            Some(conn) => match comm::send_json(conn, msg) {
                Ok(()) => true,
                Err(e) => {
                    debug!("Send to {} failed: {}", id, e);
                    false
                }
            },
            None => false,
        }
    }

    pub(super) fn respond(
        &mut self,
        id: ConnId,
        rpc_id: RpcId,
        code: ResultCode,
        data: Option<Value>,
    ) -> bool {
        let msg = comm::response(rpc_id, code, data);
        self.send(id, &msg)
    }

    pub(super) fn add_task(&mut self, record: TaskRecord, subscriber: Option<ConnId>) -> TaskId {
        let task_id = record.id().to_string();
        info!("Task {} submitted: {}", task_id, record.spec.command);
        self.tasks.insert(
            task_id.clone(),
            TaskEntry {
                record,
                worker: None,
                reserved: None,
                subscribers: subscriber.into_iter().collect(),
                submitted: Utc::now(),
                finished: None,
            },
        );
        task_id
    }

    pub(super) fn assign_task(&mut self, task_id: &str, worker: ConnId) {
        let resources = match self.tasks.get_mut(task_id) {
            Some(task) => {
                task.worker = Some(worker);
                task.reserved = Some(task.record.spec.resources);
                task.record.spec.resources
            }
            None => return,
        };
        if let Some(w) = self.workers.get_mut(&worker) {
            w.reserve(&resources);
            w.tasks.insert(task_id.to_string(), Default::default());
            debug!("Task {} assigned to {}", task_id, w);
        }
    }

    /// Give back whatever the task holds at its worker and detach it.
    pub(super) fn unassign_task(&mut self, task_id: &str) {
        let (worker, reserved) = match self.tasks.get_mut(task_id) {
            Some(task) => (task.worker.take(), task.reserved.take()),
            None => return,
        };
        if let Some(w) = worker.and_then(|w| self.workers.get_mut(&w)) {
            if let Some(reserved) = reserved {
                w.release(&reserved);
            }
            w.tasks.remove(task_id);
        }
    }

    /// The task's process is over: cores and memory go back to the worker, disk stays
    /// until the task is removed.
    pub(super) fn finish_task(&mut self, task_id: &str) {
        let (worker, freed) = match self.tasks.get_mut(task_id) {
            Some(task) => {
                task.finished = Some(Utc::now());
                let freed = task.reserved.map(|r| r.without_disk());
                task.reserved = task.reserved.map(|r| r.disk_only());
                (task.worker, freed)
            }
            None => return,
        };
        if let (Some(w), Some(freed)) = (worker.and_then(|w| self.workers.get_mut(&w)), freed) {
            w.release(&freed);
        }
        self.notify_task(task_id);
    }

    /// Mark a task that can never run as failed.
    pub(super) fn fail_task(&mut self, task_id: &str) {
        self.unassign_task(task_id);
        match self.tasks.get_mut(task_id) {
            Some(task) => task.record.state = TaskState::Failed,
            None => return,
        }
        self.finish_task(task_id);
    }

    /// Drop a removed task from the manager.
    pub(super) fn forget_task(&mut self, task_id: &str) {
        self.unassign_task(task_id);
        if self.tasks.remove(task_id).is_some() {
            info!("Task {} deleted", task_id);
        }
    }

    /// Send a task-update to every client following the task; finished tasks are also
    /// queued for `wait`.
    pub(super) fn notify_task(&mut self, task_id: &str) {
        let (params, finished, subscribers) = match self.tasks.get(task_id) {
            Some(task) => (
                task.record.update_params(),
                task.record.state.is_finished(),
                task.subscribers.clone(),
            ),
            None => return,
        };
        let msg = comm::notification("task-update", params);
        let mut alive = Vec::with_capacity(subscribers.len());
        for client in subscribers {
            if !self.clients.contains_key(&client) || !self.send(client, &msg) {
                continue;
            }
            alive.push(client);
            if finished {
                if let Some(c) = self.clients.get_mut(&client) {
                    c.finished.push_back(task_id.to_string());
                }
                self.answer_wait(client);
            }
        }
        if let Some(task) = self.tasks.get_mut(task_id) {
            task.subscribers = alive;
        }
    }

    /// Answer a deferred `wait` if the client has a finished task to report.
    pub(super) fn answer_wait(&mut self, client: ConnId) {
        let (rpc_id, task_id) = match self.clients.get_mut(&client) {
            Some(c) if c.waiting.is_some() => match c.finished.pop_front() {
                Some(task_id) => (c.waiting.take(), task_id),
                None => return,
            },
            _ => return,
        };
        let data = self.finished_task_info(&task_id);
        if let Some(rpc_id) = rpc_id {
            self.respond(client, rpc_id, ResultCode::Success, Some(data));
        }
    }

    pub(super) fn finished_task_info(&self, task_id: &str) -> Value {
        match self.tasks.get(task_id) {
            Some(task) => task.record.update_params(),
            None => json!({ "task-id": task_id, "state": TaskState::Deleted }),
        }
    }
}

/// Split a handshake into its request id (none for a notification) and params.
fn parse_handshake(msg: Message) -> Result<(Option<RpcId>, Value)> {
    let buf = match msg {
        Message::Buffer(buf) => buf,
        Message::File { length, .. } => {
            bail!(ErrorKind::Protocol(format!("{} bytes of contents before the handshake", length)))
        }
    };
    match comm::decode(&buf) {
        Ok(Envelope::Request { id, method, params }) if method == "handshake" => {
            Ok((Some(id), params))
        }
        Ok(Envelope::Notification { method, params }) if method == "handshake" => {
            Ok((None, params))
        }
        Ok(other) => bail!(ErrorKind::Protocol(format!(
            "expected a handshake, got {}",
            other.method().unwrap_or("a response")
        ))),
        Err(code) => bail!(ErrorKind::Protocol(format!(
            "malformed handshake: {}",
            code.as_str()
        ))),
    }
}

fn peer_name<T>(conn: &Connection<T>) -> String {
    conn.peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
