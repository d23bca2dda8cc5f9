use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::seq::SliceRandom;
use serde_json::Value;

use dataswarm_core::catalog::{self, DEFAULT_CATALOG_HOST};
use dataswarm_core::comm::message::{param_str, param_u64};
use dataswarm_core::comm::{self, Envelope, ResultCode};
use dataswarm_core::errors::*;
use dataswarm_core::mq::{ConnState, Connection, Message};
use dataswarm_core::sys::{get_hostname, measure_resources};
use dataswarm_core::types::{BlobId, Resources, RpcId, TaskSpec};
use dataswarm_core::utils::{Backoff, Clock, Interval};
use dataswarm_core::VERSION;

use super::blob_table::BlobTable;
use super::task_table::TaskTable;
use super::workspace::{discard_sink, Workspace};
use crate::config::WorkerConfig;

/// Longest a single `turn` waits inside `run`.
const POLL_SLICE: Duration = Duration::from_secs(1);

type Reply = ::std::result::Result<Option<Value>, ResultCode>;

/// Contents announced by a blob-put, expected as the next message.
struct IncomingPut {
    rpc_id: RpcId,
    blob_id: BlobId,
    /// The put was refused; contents are dropped and this code is returned.
    refusal: Option<ResultCode>,
    started: Instant,
}

pub struct Worker {
    config: WorkerConfig,
    clock: Box<dyn Clock>,
    workspace: Workspace,
    hostname: String,

    resources: Resources,
    /// Held by tasks (cores and memory while running, disk until removal).
    in_use: Resources,
    blobs: BlobTable,
    tasks: TaskTable,

    conn: Option<Connection<()>>,
    connected: bool,
    backoff: Backoff,
    /// Last moment a manager connection was up.
    last_contact: Instant,
    incoming: Option<IncomingPut>,
    status_interval: Interval,
    next_rpc_id: RpcId,
}

impl Worker {
    pub fn new(config: WorkerConfig, clock: Box<dyn Clock>) -> Result<Self> {
        let root = match config.workspace {
            Some(ref dir) => dir.clone(),
            None => bail!("Worker needs a workspace directory"),
        };
        let workspace = Workspace::new(&root)?;
        workspace.purge_deleting();
        let blobs = BlobTable::recover(&workspace)?;
        let tasks = TaskTable::recover(&workspace)?;

        let measured = measure_resources(workspace.path())?;
        let resources = config.resources(&measured);
        let in_use = tasks.reserved_total();
        info!(
            "Worker resources: {} cores, {} MB memory, {} MB disk",
            resources.cores, resources.memory, resources.disk
        );

        let backoff = Backoff::new(config.min_connect_retry(), config.max_connect_retry());
        let status_interval = Interval::new(config.status_report_interval());
        let last_contact = clock.now();
        Ok(Worker {
            config,
            clock,
            workspace,
            hostname: get_hostname(),
            resources,
            in_use,
            blobs,
            tasks,
            conn: None,
            connected: false,
            backoff,
            last_contact,
            incoming: None,
            status_interval,
            next_rpc_id: 1,
        })
    }

    pub fn run(&mut self) -> Result<()> {
        while self.turn(Instant::now() + POLL_SLICE)? {}
        self.tasks.kill_all();
        Ok(())
    }

    /// Serve the manager until `stoptime` and advance local tasks. Returns false once the
    /// worker has been without a manager for longer than the idle timeout.
    pub fn turn(&mut self, stoptime: Instant) -> Result<bool> {
        let now = self.clock.now();
        if self.conn.is_none() {
            if now.saturating_duration_since(self.last_contact) >= self.config.idle_timeout() {
                info!("No manager for {:?}, exiting", self.config.idle_timeout());
                return Ok(false);
            }
            if self.backoff.ready(now) {
                self.connect();
            }
        }

        let waited = self.conn.as_mut().map(|conn| conn.wait(stoptime));
        match waited {
            Some(Ok(_)) => {
                self.check_connected();
                self.handle_messages();
            }
            Some(Err(e)) => self.connection_lost(&e.to_string()),
            None => {
                let now = Instant::now();
                if stoptime > now {
                    thread::sleep(stoptime - now);
                }
            }
        }

        self.advance_tasks();
        self.check_transfer();
        self.report_status();
        Ok(true)
    }

    fn resolve_manager(&self) -> Result<(String, u16)> {
        if let Some(ref address) = self.config.manager {
            let pos = match address.rfind(':') {
                Some(pos) => pos,
                None => bail!("Manager address {:?} has no port", address),
            };
            let port = address[pos + 1..]
                .parse::<u16>()
                .map_err(|_| format!("Invalid port in {:?}", address))?;
            return Ok((address[..pos].to_string(), port));
        }
        let name = match self.config.name {
            Some(ref name) => name,
            None => bail!("Neither a manager address nor a project name is configured"),
        };
        let mut hosts = catalog::parse_hosts(&self.config.catalog.join(","))?;
        if hosts.is_empty() {
            hosts = catalog::parse_hosts(DEFAULT_CATALOG_HOST)?;
        }
        let managers = catalog::find_managers(&hosts, name, self.config.catalog_timeout())?;
        match managers.choose(&mut ::rand::thread_rng()) {
            Some(manager) => Ok(manager.clone()),
            None => bail!("No manager of project {:?} in the catalog", name),
        }
    }

    fn connect(&mut self) {
        let connected = self.resolve_manager().and_then(|(host, port)| {
            info!("Connecting to manager at {}:{}", host, port);
            let mut conn = Connection::connect(&host, port)?;
            let params = json!({
                "type": "worker",
                "hostname": self.hostname,
                "resources": self.resources,
                "version": VERSION,
            });
            let rpc_id = self.next_rpc_id();
            comm::send_json(&mut conn, &comm::request("handshake", params, rpc_id))?;
            conn.store_buffer(Vec::new(), 0)?;
            Ok(conn)
        });
        match connected {
            Ok(conn) => self.conn = Some(conn),
            Err(e) => {
                let delay = self.backoff.failed(self.clock.now());
                warn!("Cannot connect to manager: {}; retrying in {:?}", e, delay);
            }
        }
    }

    fn check_connected(&mut self) {
        let up = self
            .conn
            .as_ref()
            .map_or(false, |c| c.state() == ConnState::Connected);
        if up {
            if !self.connected {
                info!("Connected to manager");
                self.connected = true;
                self.backoff.succeeded();
            }
            self.last_contact = self.clock.now();
        }
    }

    fn connection_lost(&mut self, reason: &str) {
        warn!("Connection to manager lost: {}", reason);
        self.conn = None;
        self.connected = false;
        self.incoming = None;
        let delay = self.backoff.failed(self.clock.now());
        debug!("Reconnecting in {:?}", delay);
    }

    fn next_rpc_id(&mut self) -> RpcId {
        let id = self.next_rpc_id;
        self.next_rpc_id += 1;
        id
    }

    fn send(&mut self, msg: &Value) {
        if let Some(conn) = self.conn.as_mut() {
            if let Err(e) = comm::send_json(conn, msg) {
                debug!("Cannot send to manager: {}", e);
            }
        }
    }

    fn handle_messages(&mut self) {
        while let Some(msg) = self.conn.as_mut().and_then(|c| c.recv()) {
            self.handle_message(msg);
            if let Some(conn) = self.conn.as_mut() {
                if !conn.is_error() && !conn.has_storage() {
                    if let Err(e) = conn.store_buffer(Vec::new(), 0) {
                        debug!("Cannot receive from manager: {}", e);
                    }
                }
            }
        }
    }

    fn handle_message(&mut self, msg: Message) {
        let buf = match msg {
            Message::File { length, .. } => {
                self.finish_put(length);
                return;
            }
            Message::Buffer(buf) => buf,
        };
        match comm::decode(&buf) {
            Ok(Envelope::Request { id, method, params }) => {
                self.handle_request(id, &method, &params)
            }
            Ok(Envelope::Response { id, .. }) => debug!("Manager accepted rpc {}", id),
            Ok(Envelope::Error { id, message, .. }) => {
                warn!("Manager refused rpc {}: {}", id, message)
            }
            Ok(Envelope::Notification { method, .. }) => {
                debug!("Ignoring {} notification from manager", method)
            }
            Err(code) => warn!("Malformed message from manager: {}", code.as_str()),
        }
    }

    fn handle_request(&mut self, rpc_id: RpcId, method: &str, params: &Value) {
        debug!("Manager calls {}", method);
        let reply = match method {
            "task-submit" => self.task_submit(params),
            "task-get" => self.task_get(params),
            "task-remove" => self.task_remove(params),
            "task-list" => Ok(Some(self.tasks.list())),
            "blob-create" => self.blob_create(params),
            "blob-put" => {
                self.blob_put(rpc_id, params);
                return;
            }
            "blob-get" => {
                self.blob_get(rpc_id, params);
                return;
            }
            "blob-commit" => self.blob_commit(params),
            "blob-delete" => self.blob_delete(params),
            "blob-copy" => self.blob_copy(params),
            "blob-list" => Ok(Some(self.blobs.list())),
            _ => Err(ResultCode::BadMethod),
        };
        let response = match reply {
            Ok(data) => comm::response(rpc_id, ResultCode::Success, data),
            Err(code) => {
                debug!("{} failed: {}", method, code.as_str());
                comm::response(rpc_id, code, None)
            }
        };
        self.send(&response);
        if method == "blob-commit" {
            if let Some(meta) = param_str(params, "blob-id")
                .ok()
                .and_then(|id| self.blobs.lookup(id))
            {
                let update = comm::notification("blob-update", meta.update_params());
                self.send(&update);
            }
        }
    }

    fn task_submit(&mut self, params: &Value) -> Reply {
        let spec: TaskSpec =
            ::serde_json::from_value(params.clone()).map_err(|_| ResultCode::BadParams)?;
        self.tasks.submit(&self.workspace, spec, &self.resources)?;
        Ok(None)
    }

    fn task_get(&mut self, params: &Value) -> Reply {
        let task_id = param_str(params, "task-id")?;
        let record = self.tasks.get(task_id).ok_or(ResultCode::NoSuchTaskId)?;
        Ok(Some(json!(record)))
    }

    fn task_remove(&mut self, params: &Value) -> Reply {
        let task_id = param_str(params, "task-id")?;
        self.tasks
            .remove(&self.workspace, task_id, &mut self.in_use)?;
        Ok(None)
    }

    /// Disk in MB not held by blobs or tasks.
    fn free_disk(&self) -> u64 {
        self.resources
            .disk
            .saturating_sub(self.blobs.disk_in_use())
            .saturating_sub(self.in_use.disk)
    }

    fn blob_create(&mut self, params: &Value) -> Reply {
        let blob_id = param_str(params, "blob-id")?;
        let size = param_u64(params, "size").unwrap_or(0);
        let metadata = params.get("metadata").cloned().unwrap_or(Value::Null);
        let available = self.free_disk();
        self.blobs
            .create(&self.workspace, blob_id, size, metadata, available)?;
        Ok(None)
    }

    fn blob_commit(&mut self, params: &Value) -> Reply {
        let blob_id = param_str(params, "blob-id")?;
        self.blobs.commit(&self.workspace, blob_id)?;
        Ok(None)
    }

    fn blob_delete(&mut self, params: &Value) -> Reply {
        let blob_id = param_str(params, "blob-id")?;
        self.blobs.delete(&self.workspace, blob_id)?;
        Ok(None)
    }

    fn blob_copy(&mut self, params: &Value) -> Reply {
        let blob_id = param_str(params, "blob-id")?;
        let source = param_str(params, "blob-id-source")?;
        let available = self.free_disk();
        self.blobs
            .copy(&self.workspace, blob_id, source, available)?;
        Ok(None)
    }

    /// The request is followed by the contents; they land in the blob, or are dropped
    /// when the put is refused. The response is sent once they have arrived.
    fn blob_put(&mut self, rpc_id: RpcId, params: &Value) {
        let blob_id = param_str(params, "blob-id").map(str::to_string);
        let target = blob_id
            .clone()
            .and_then(|id| self.blobs.prepare_put(&self.workspace, &id));
        let (sink, refusal) = match target {
            Ok(file) => (Ok(file), None),
            Err(code) => (discard_sink(), Some(code)),
        };
        let stored = match (sink, self.conn.as_mut()) {
            (Ok(sink), Some(conn)) => conn.store_fd(sink, 0).map_err(|e| e.to_string()),
            (Err(e), _) => Err(e.to_string()),
            (_, None) => return,
        };
        if let Err(e) = stored {
            self.connection_lost(&format!("cannot receive blob contents: {}", e));
            return;
        }
        self.incoming = Some(IncomingPut {
            rpc_id,
            blob_id: blob_id.unwrap_or_default(),
            refusal,
            started: self.clock.now(),
        });
    }

    fn finish_put(&mut self, length: u64) {
        let incoming = match self.incoming.take() {
            Some(incoming) => incoming,
            None => {
                self.connection_lost("unexpected blob contents");
                return;
            }
        };
        let response = match incoming.refusal {
            Some(code) => comm::response(incoming.rpc_id, code, None),
            None => {
                debug!("Blob {} received ({} bytes)", incoming.blob_id, length);
                comm::response(
                    incoming.rpc_id,
                    ResultCode::Success,
                    Some(json!({ "blob-id": incoming.blob_id, "size": length })),
                )
            }
        };
        self.send(&response);
    }

    /// A successful response is followed by the contents.
    fn blob_get(&mut self, rpc_id: RpcId, params: &Value) {
        let opened = param_str(params, "blob-id")
            .and_then(|id| self.blobs.get(&self.workspace, id).map(|f| (id, f)));
        match opened {
            Ok((blob_id, (file, length))) => {
                let data = json!({ "blob-id": blob_id, "size": length });
                self.send(&comm::response(rpc_id, ResultCode::Success, Some(data)));
                if let Some(conn) = self.conn.as_mut() {
                    if let Err(e) = conn.send_fd(file, 0) {
                        warn!("Cannot send blob {}: {}", blob_id, e);
                    }
                }
            }
            Err(code) => self.send(&comm::response(rpc_id, code, None)),
        }
    }

    fn check_transfer(&mut self) {
        let stalled = self.incoming.as_ref().map_or(false, |i| {
            self.clock.now().saturating_duration_since(i.started) >= self.config.long_timeout()
        });
        if stalled {
            self.connection_lost("blob transfer timed out");
        }
    }

    fn advance_tasks(&mut self) {
        let mut capacity = self.resources;
        capacity.disk = capacity.disk.saturating_sub(self.blobs.disk_in_use());
        let updates = self
            .tasks
            .advance(&self.workspace, &capacity, &mut self.in_use);
        for record in updates {
            let update = comm::notification("task-update", record.update_params());
            self.send(&update);
        }
    }

    fn report_status(&mut self) {
        if !self.connected || !self.status_interval.check(self.clock.now()) {
            return;
        }
        let params = json!({
            "hostname": self.hostname,
            "resources": self.resources,
            "in-use": self.in_use,
            "blobs": self.blobs.len(),
            "blob-disk": self.blobs.disk_in_use(),
            "tasks": self.tasks.len(),
            "workspace-usage": self.workspace.usage() / (1024 * 1024),
            "time": Utc::now().to_rfc3339(),
        });
        self.send(&comm::notification("status-report", params));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataswarm_core::utils::ManualClock;
    use std::net::TcpListener;
    use tempdir::TempDir;

    fn config(dir: &TempDir, manager: &str) -> WorkerConfig {
        WorkerConfig {
            workspace: Some(dir.path().to_path_buf()),
            manager: Some(manager.to_string()),
            cores: Some(1),
            memory: Some(100),
            disk: Some(100),
            idle_timeout: 10.0,
            min_connect_retry: 1.0,
            max_connect_retry: 4.0,
            ..Default::default()
        }
    }

    /// An address nothing listens on.
    fn closed_port() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        format!("127.0.0.1:{}", port)
    }

    #[test]
    fn exits_when_idle() {
        let dir = TempDir::new("worker").unwrap();
        let clock = ManualClock::new();
        let mut worker =
            Worker::new(config(&dir, &closed_port()), Box::new(clock.clone())).unwrap();
        let slice = Duration::from_millis(20);
        assert!(worker.turn(Instant::now() + slice).unwrap());
        clock.advance(Duration::from_secs(5));
        assert!(worker.turn(Instant::now() + slice).unwrap());
        assert!(!worker.connected);
        clock.advance(Duration::from_secs(6));
        assert!(!worker.turn(Instant::now() + slice).unwrap());
    }

    #[test]
    fn bad_manager_address() {
        let dir = TempDir::new("worker").unwrap();
        let worker = Worker::new(config(&dir, "nohost"), Box::new(ManualClock::new())).unwrap();
        assert!(worker.resolve_manager().is_err());
        assert_eq!(worker.resources, Resources::new(1, 100, 100));
    }
}
