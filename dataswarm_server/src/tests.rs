use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tempdir::TempDir;

use dataswarm_core::comm::{self, Envelope, ResultCode};
use dataswarm_core::mq::{Connection, Message};
use dataswarm_core::types::{TaskRecord, TaskSpec, TaskState};
use dataswarm_core::utils::{Clock, ManualClock, SystemClock};

use crate::config::{ManagerConfig, WorkerConfig};
use crate::manager::Manager;
use crate::worker::Worker;

const SLICE: Duration = Duration::from_millis(5);
const DEADLINE: Duration = Duration::from_secs(30);

/// Worker that acknowledges every request without doing any work.
struct FakeWorker {
    conn: Connection<()>,
    /// Report submitted tasks as done.
    complete: bool,
    /// Never answer requests.
    mute: bool,
    /// The manager closed the connection.
    closed: bool,
    submissions: HashMap<String, usize>,
}

impl FakeWorker {
    fn connect(port: u16, complete: bool) -> Self {
        let mut conn = Connection::connect("127.0.0.1", port).unwrap();
        let handshake = comm::request(
            "handshake",
            json!({
                "type": "worker",
                "hostname": "fake",
                "resources": {"cores": 4, "memory": 1000, "disk": 1000},
            }),
            1,
        );
        comm::send_json(&mut conn, &handshake).unwrap();
        conn.store_buffer(Vec::new(), 0).unwrap();
        FakeWorker {
            conn,
            complete,
            mute: false,
            closed: false,
            submissions: HashMap::new(),
        }
    }

    fn mute(port: u16) -> Self {
        let mut fake = FakeWorker::connect(port, false);
        fake.mute = true;
        fake
    }

    fn step(&mut self) {
        if self.closed {
            return;
        }
        match self.conn.wait(Instant::now() + SLICE) {
            Ok(true) => {}
            Ok(false) => return,
            Err(_) => {
                self.closed = true;
                return;
            }
        }
        while let Some(msg) = self.conn.recv() {
            self.conn.store_buffer(Vec::new(), 0).unwrap();
            let buf = match msg {
                Message::Buffer(buf) => buf,
                Message::File { .. } => continue,
            };
            let (id, method, params) = match comm::decode(&buf).unwrap() {
                Envelope::Request { id, method, params } => (id, method, params),
                _ => continue,
            };
            let task_id = params["task-id"].as_str().unwrap_or_default().to_string();
            if self.mute {
                if method == "task-submit" {
                    *self.submissions.entry(task_id).or_insert(0) += 1;
                }
                continue;
            }
            let data = if method == "task-get" {
                let mut record = TaskRecord::new(TaskSpec::new(&task_id, "true"));
                record.state = TaskState::Done;
                record.exit_code = Some(0);
                Some(json!(record))
            } else {
                None
            };
            comm::send_json(&mut self.conn, &comm::response(id, ResultCode::Success, data))
                .unwrap();
            if method == "task-submit" {
                *self.submissions.entry(task_id.clone()).or_insert(0) += 1;
                if self.complete {
                    let update = json!({"task-id": task_id, "state": "done", "exit-code": 0});
                    comm::send_json(&mut self.conn, &comm::notification("task-update", update))
                        .unwrap();
                }
            }
        }
    }
}

struct Cluster {
    manager: Manager,
    worker: Option<Worker>,
    fake: Option<FakeWorker>,
    _dirs: Vec<TempDir>,
}

impl Cluster {
    fn start(test_input: Option<PathBuf>, with_worker: bool) -> Self {
        Cluster::build(test_input, with_worker, Box::new(SystemClock))
    }

    /// Manager alone, on a clock the test controls.
    fn with_clock(clock: &ManualClock) -> Self {
        Cluster::build(None, false, Box::new(clock.clone()))
    }

    fn build(test_input: Option<PathBuf>, with_worker: bool, clock: Box<dyn Clock>) -> Self {
        let manager_dir = TempDir::new("manager").unwrap();
        let config = ManagerConfig {
            port: 0,
            workdir: Some(manager_dir.path().to_path_buf()),
            poll_ceiling: 0.005,
            test_input,
            ..Default::default()
        };
        let manager = Manager::new(config, clock).unwrap();
        let mut dirs = vec![manager_dir];

        let worker = if with_worker {
            let worker_dir = TempDir::new("worker").unwrap();
            let config = WorkerConfig {
                workspace: Some(worker_dir.path().to_path_buf()),
                manager: Some(format!("127.0.0.1:{}", manager.port())),
                cores: Some(2),
                memory: Some(1024),
                disk: Some(1024),
                min_connect_retry: 0.05,
                max_connect_retry: 0.2,
                status_report_interval: 0.2,
                ..Default::default()
            };
            let worker = Worker::new(config, Box::new(SystemClock)).unwrap();
            dirs.push(worker_dir);
            Some(worker)
        } else {
            None
        };

        Cluster {
            manager,
            worker,
            fake: None,
            _dirs: dirs,
        }
    }

    /// One turn of every participant; false once the manager is done.
    fn step(&mut self) -> bool {
        let running = self.manager.turn().unwrap();
        if let Some(ref mut worker) = self.worker {
            worker.turn(Instant::now() + SLICE).unwrap();
        }
        if let Some(ref mut fake) = self.fake {
            fake.step();
        }
        running
    }
}

struct Client {
    conn: Connection<()>,
    next_id: i64,
}

impl Client {
    fn connect(cluster: &Cluster) -> Self {
        let mut conn = Connection::connect("127.0.0.1", cluster.manager.port()).unwrap();
        comm::send_json(
            &mut conn,
            &comm::notification("handshake", json!({"type": "client"})),
        )
        .unwrap();
        conn.store_buffer(Vec::new(), 0).unwrap();
        Client { conn, next_id: 1 }
    }

    fn send(&mut self, method: &str, params: Value) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        comm::send_json(&mut self.conn, &comm::request(method, params, id)).unwrap();
        id
    }

    fn next_message(&mut self, cluster: &mut Cluster) -> Message {
        let deadline = Instant::now() + DEADLINE;
        while Instant::now() < deadline {
            if self.conn.wait(Instant::now() + SLICE).unwrap() {
                if let Some(msg) = self.conn.recv() {
                    self.conn.store_buffer(Vec::new(), 0).unwrap();
                    return msg;
                }
            }
            cluster.step();
        }
        panic!("No message from manager");
    }

    /// Wait for the response to request `id`; errors yield their code.
    fn response(&mut self, cluster: &mut Cluster, id: i64) -> Result<Value, i64> {
        loop {
            let buf = match self.next_message(cluster) {
                Message::Buffer(buf) => buf,
                Message::File { .. } => panic!("Unexpected file from manager"),
            };
            match comm::decode(&buf).unwrap() {
                Envelope::Response { id: r, result } if r == id => return Ok(result),
                Envelope::Error { id: r, code, .. } if r == id => return Err(code),
                _ => {}
            }
        }
    }

    fn call(&mut self, cluster: &mut Cluster, method: &str, params: Value) -> Result<Value, i64> {
        let id = self.send(method, params);
        self.response(cluster, id)
    }
}

/// A text file and its line count.
fn sample_input(dir: &Path) -> (PathBuf, usize) {
    let path = dir.join("words");
    let mut file = fs::File::create(&path).unwrap();
    let lines = 1500;
    for i in 0..lines {
        writeln!(file, "word{}", i).unwrap();
    }
    (path, lines)
}

fn id_of(value: &Value, key: &str) -> String {
    value[key].as_str().unwrap().to_string()
}

/// Step the cluster until the manager closes `conn`; false if it never does.
fn closed_by_manager(cluster: &mut Cluster, conn: &mut Connection<()>) -> bool {
    let deadline = Instant::now() + DEADLINE;
    while Instant::now() < deadline {
        cluster.step();
        if conn.wait(Instant::now() + SLICE).is_err() {
            return true;
        }
        while conn.recv().is_some() {
            conn.store_buffer(Vec::new(), 0).unwrap();
        }
    }
    false
}

#[test]
fn client_runs_task_on_worker() {
    let scratch = TempDir::new("input").unwrap();
    let (input, lines) = sample_input(scratch.path());
    let mut cluster = Cluster::start(None, true);
    let mut client = Client::connect(&cluster);

    let size = fs::metadata(&input).unwrap().len();
    let id = client.send("file-submit", json!({ "size": size }));
    client
        .conn
        .send_fd(fs::File::open(&input).unwrap(), 0)
        .unwrap();
    let input_id = id_of(&client.response(&mut cluster, id).unwrap(), "file-id");
    client
        .call(&mut cluster, "file-commit", json!({ "file-id": input_id }))
        .unwrap();

    // Contents of a committed file cannot be replaced; the upload is swallowed.
    let id = client.send("file-put", json!({ "file-id": input_id }));
    client.conn.send_buffer(b"junk".to_vec(), 0).unwrap();
    assert_eq!(
        client.response(&mut cluster, id),
        Err(ResultCode::BadState.code())
    );

    let output_id = id_of(
        &client.call(&mut cluster, "file-create", json!({})).unwrap(),
        "file-id",
    );

    let mut namespace = Map::new();
    namespace.insert(
        input_id.clone(),
        json!({"type": "path", "path": "myinput", "mode": "R"}),
    );
    namespace.insert(output_id.clone(), json!({"type": "stdout", "mode": "W"}));
    let submitted = client
        .call(
            &mut cluster,
            "task-submit",
            json!({
                "command": "wc -l < myinput",
                "namespace": namespace,
            }),
        )
        .unwrap();
    let task_id = id_of(&submitted, "task-id");

    let finished = client.call(&mut cluster, "wait", json!({})).unwrap();
    assert_eq!(finished["task-id"], task_id.as_str());
    assert_eq!(finished["state"], "done");
    assert_eq!(finished["exit-code"], 0);

    client
        .call(&mut cluster, "file-commit", json!({ "file-id": output_id }))
        .unwrap();
    let got = client
        .call(&mut cluster, "file-get", json!({ "file-id": output_id }))
        .unwrap();
    assert_eq!(got["file-id"], output_id.as_str());
    let contents = match client.next_message(&mut cluster) {
        Message::Buffer(buf) => String::from_utf8(buf).unwrap(),
        Message::File { .. } => panic!("Contents stored in a file"),
    };
    assert_eq!(contents.trim(), lines.to_string());

    let retrieved = client
        .call(&mut cluster, "task-retrieve", json!({ "task-id": task_id }))
        .unwrap();
    assert_eq!(retrieved["state"], "done");
    let empty = client.call(&mut cluster, "queue-empty", json!({})).unwrap();
    assert_eq!(empty["empty"], true);

    client
        .call(&mut cluster, "task-delete", json!({ "task-id": task_id }))
        .unwrap();
    let deadline = Instant::now() + DEADLINE;
    loop {
        assert!(Instant::now() < deadline, "Task was never removed");
        match client.call(&mut cluster, "task-retrieve", json!({ "task-id": task_id })) {
            Err(code) => {
                assert_eq!(code, ResultCode::NoSuchTaskId.code());
                break;
            }
            Ok(_) => cluster.step(),
        };
    }

    let status = client.call(&mut cluster, "status", json!({})).unwrap();
    assert_eq!(status["workers"].as_array().unwrap().len(), 1);
    assert_eq!(status["clients"], 1);
}

#[test]
fn unknown_method_is_refused() {
    let mut cluster = Cluster::start(None, false);
    let mut client = Client::connect(&cluster);
    assert_eq!(
        client.call(&mut cluster, "frobnicate", json!({})),
        Err(ResultCode::BadMethod.code())
    );
    assert_eq!(
        client.call(&mut cluster, "task-retrieve", json!({ "task-id": "nope" })),
        Err(ResultCode::NoSuchTaskId.code())
    );
    assert_eq!(
        client.call(&mut cluster, "task-submit", json!({ "namespace": {} })),
        Err(ResultCode::BadParams.code())
    );
    let empty = client.call(&mut cluster, "queue-empty", json!({})).unwrap();
    assert_eq!(empty["empty"], true);
}

#[test]
fn self_test_counts_lines() {
    let scratch = TempDir::new("input").unwrap();
    let (input, lines) = sample_input(scratch.path());
    let mut cluster = Cluster::start(Some(input), true);
    let deadline = Instant::now() + DEADLINE;
    while cluster.step() {
        assert!(Instant::now() < deadline, "Self test did not finish");
    }
    assert_eq!(
        cluster.manager.test_output().map(str::trim),
        Some(lines.to_string().as_str())
    );
}

#[test]
fn tasks_are_submitted_once() {
    let mut cluster = Cluster::start(None, false);
    cluster.fake = Some(FakeWorker::connect(cluster.manager.port(), true));
    let mut client = Client::connect(&cluster);

    let mut task_ids = Vec::new();
    for _ in 0..5 {
        let submitted = client
            .call(&mut cluster, "task-submit", json!({ "command": "true" }))
            .unwrap();
        task_ids.push(id_of(&submitted, "task-id"));
    }
    for _ in 0..5 {
        let finished = client.call(&mut cluster, "wait", json!({})).unwrap();
        assert_eq!(finished["state"], "done");
    }
    for _ in 0..20 {
        cluster.step();
    }

    let fake = cluster.fake.as_ref().unwrap();
    assert_eq!(fake.submissions.len(), 5);
    for task_id in &task_ids {
        assert_eq!(fake.submissions.get(task_id), Some(&1));
    }
}

#[test]
fn task_moves_to_another_worker_when_lost() {
    let mut cluster = Cluster::start(None, false);
    cluster.fake = Some(FakeWorker::connect(cluster.manager.port(), false));
    let mut client = Client::connect(&cluster);

    let submitted = client
        .call(&mut cluster, "task-submit", json!({ "command": "true" }))
        .unwrap();
    let task_id = id_of(&submitted, "task-id");

    let deadline = Instant::now() + DEADLINE;
    while !cluster.fake.as_ref().unwrap().submissions.contains_key(&task_id) {
        assert!(Instant::now() < deadline, "Task never reached the worker");
        cluster.step();
    }
    let retrieved = client
        .call(&mut cluster, "task-retrieve", json!({ "task-id": task_id }))
        .unwrap();
    assert_eq!(retrieved["state"], "running");

    cluster.fake = None;
    cluster.fake = Some(FakeWorker::connect(cluster.manager.port(), true));
    let finished = client.call(&mut cluster, "wait", json!({})).unwrap();
    assert_eq!(finished["task-id"], task_id.as_str());
    assert_eq!(finished["state"], "done");
    assert_eq!(
        cluster.fake.as_ref().unwrap().submissions.get(&task_id),
        Some(&1)
    );
}

#[test]
fn silent_connection_is_dropped() {
    let clock = ManualClock::new();
    let mut cluster = Cluster::with_clock(&clock);
    let mut client = Client::connect(&cluster);
    let mut silent: Connection<()> =
        Connection::connect("127.0.0.1", cluster.manager.port()).unwrap();
    silent.store_buffer(Vec::new(), 0).unwrap();

    for _ in 0..20 {
        cluster.step();
        assert!(silent.wait(Instant::now() + SLICE).is_ok());
    }
    let empty = client.call(&mut cluster, "queue-empty", json!({})).unwrap();
    assert_eq!(empty["empty"], true);

    clock.advance(Duration::from_secs(6));
    assert!(closed_by_manager(&mut cluster, &mut silent));
    // The client completed its handshake in time and stays connected.
    let status = client.call(&mut cluster, "status", json!({})).unwrap();
    assert_eq!(status["clients"], 1);
}

#[test]
fn unknown_peer_type_is_dropped() {
    let mut cluster = Cluster::start(None, false);
    let mut conn: Connection<()> =
        Connection::connect("127.0.0.1", cluster.manager.port()).unwrap();
    let handshake = comm::request("handshake", json!({"type": "bogus"}), 1);
    comm::send_json(&mut conn, &handshake).unwrap();
    conn.store_buffer(Vec::new(), 0).unwrap();
    assert!(closed_by_manager(&mut cluster, &mut conn));

    let mut client = Client::connect(&cluster);
    let status = client.call(&mut cluster, "status", json!({})).unwrap();
    assert_eq!(status["clients"], 1);
    assert!(status["workers"].as_array().unwrap().is_empty());
}

#[test]
fn stalled_worker_loses_its_task() {
    let clock = ManualClock::new();
    let mut cluster = Cluster::with_clock(&clock);
    cluster.fake = Some(FakeWorker::mute(cluster.manager.port()));
    let mut client = Client::connect(&cluster);

    let submitted = client
        .call(&mut cluster, "task-submit", json!({ "command": "true" }))
        .unwrap();
    let task_id = id_of(&submitted, "task-id");
    let deadline = Instant::now() + DEADLINE;
    while !cluster.fake.as_ref().unwrap().submissions.contains_key(&task_id) {
        assert!(Instant::now() < deadline, "Task never reached the worker");
        cluster.step();
    }
    assert!(!cluster.fake.as_ref().unwrap().closed);

    clock.advance(Duration::from_secs(31));
    let deadline = Instant::now() + DEADLINE;
    while !cluster.fake.as_ref().unwrap().closed {
        assert!(Instant::now() < deadline, "Stalled worker was kept");
        cluster.step();
    }
    let retrieved = client
        .call(&mut cluster, "task-retrieve", json!({ "task-id": task_id }))
        .unwrap();
    assert_eq!(retrieved["state"], "ready");

    cluster.fake = Some(FakeWorker::connect(cluster.manager.port(), true));
    let finished = client.call(&mut cluster, "wait", json!({})).unwrap();
    assert_eq!(finished["task-id"], task_id.as_str());
    assert_eq!(finished["state"], "done");
}
