use std::collections::HashMap;
use std::fs;

use serde_json::Value;

use dataswarm_core::comm::ResultCode;
use dataswarm_core::errors::{Error, Result};
use dataswarm_core::types::{is_valid_id, Resources, TaskId, TaskRecord, TaskSpec, TaskState};

use super::process::{Exit, Process};
use super::workspace::{read_json, write_json, Workspace};

type TaskResult<T> = ::std::result::Result<T, ResultCode>;

/// Tasks known to this worker, their processes and the resources they hold.
#[derive(Default)]
pub struct TaskTable {
    tasks: HashMap<TaskId, TaskRecord>,
    processes: HashMap<TaskId, Process>,
    /// Cores and memory while running, disk until removal.
    reserved: HashMap<TaskId, Resources>,
}

impl TaskTable {
    pub fn new() -> Self {
        Default::default()
    }

    /// Rebuild the table after a restart. Tasks that were running are failed; their
    /// processes are gone.
    pub fn recover(workspace: &Workspace) -> Result<Self> {
        let mut table = TaskTable::new();
        for task_id in workspace.list_ids(&workspace.task_root())? {
            let mut record: TaskRecord = match read_json(&workspace.task_meta(&task_id)) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Task {} has no usable record ({}), removing it", task_id, e);
                    let _ = workspace.remove_entry(&workspace.task_dir(&task_id));
                    continue;
                }
            };
            match record.state {
                TaskState::Running => {
                    info!("Task {} was running before restart, marking it failed", task_id);
                    record.state = TaskState::Failed;
                    write_json(&workspace.task_meta(&task_id), &record)?;
                    table.reserved.insert(task_id.clone(), record.spec.resources.disk_only());
                }
                TaskState::Done | TaskState::Failed => {
                    table.reserved.insert(task_id.clone(), record.spec.resources.disk_only());
                }
                _ => {}
            }
            table.tasks.insert(task_id, record);
        }
        info!("Recovered {} task(s)", table.tasks.len());
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn get(&self, task_id: &str) -> Option<&TaskRecord> {
        self.tasks.get(task_id)
    }

    /// Sum of the resources held by tasks.
    pub fn reserved_total(&self) -> Resources {
        let mut total = Resources::default();
        for r in self.reserved.values() {
            total.add(r);
        }
        total
    }

    /// Accept a task. It is persisted before the call returns, and starts in a later
    /// `advance` once resources allow.
    pub fn submit(
        &mut self,
        workspace: &Workspace,
        spec: TaskSpec,
        total: &Resources,
    ) -> TaskResult<()> {
        if !is_valid_id(&spec.task_id) || !spec.validate() {
            return Err(ResultCode::BadParams);
        }
        if self.tasks.contains_key(&spec.task_id) {
            return Err(ResultCode::TaskIdExists);
        }
        if !spec.resources.is_subset_of(total) {
            return Err(ResultCode::TooFull);
        }
        let record = TaskRecord::new(spec);
        let task_id = record.id().to_string();
        let stored = fs::create_dir(workspace.task_dir(&task_id))
            .map_err(Error::from)
            .and_then(|_| write_json(&workspace.task_meta(&task_id), &record));
        if let Err(e) = stored {
            warn!("Cannot store task {}: {}", task_id, e);
            let _ = workspace.remove_entry(&workspace.task_dir(&task_id));
            return Err(ResultCode::Unable);
        }
        debug!("Task {} accepted", task_id);
        self.tasks.insert(task_id, record);
        Ok(())
    }

    /// Kill the task if it runs, free its resources and delete its directory.
    pub fn remove(
        &mut self,
        workspace: &Workspace,
        task_id: &str,
        in_use: &mut Resources,
    ) -> TaskResult<TaskRecord> {
        let record = self.tasks.remove(task_id).ok_or(ResultCode::NoSuchTaskId)?;
        if let Some(mut process) = self.processes.remove(task_id) {
            if let Err(e) = process.kill() {
                warn!("Cannot kill task {}: {}", task_id, e);
            }
        }
        if let Some(reserved) = self.reserved.remove(task_id) {
            in_use.remove(&reserved);
        }
        if let Err(e) = workspace.remove_entry(&workspace.task_dir(task_id)) {
            warn!("Cannot remove task {}: {}", task_id, e);
        }
        debug!("Task {} removed", task_id);
        Ok(record)
    }

    pub fn list(&self) -> Value {
        let tasks: ::serde_json::Map<String, Value> = self
            .tasks
            .iter()
            .map(|(id, record)| (id.clone(), record.update_params()))
            .collect();
        Value::Object(tasks)
    }

    /// Reap finished processes and start ready tasks that fit in `capacity`. Returns the
    /// records whose state changed.
    pub fn advance(
        &mut self,
        workspace: &Workspace,
        capacity: &Resources,
        in_use: &mut Resources,
    ) -> Vec<TaskRecord> {
        let mut changed = Vec::new();

        let mut running: Vec<TaskId> = self.processes.keys().cloned().collect();
        running.sort();
        for task_id in running {
            let exit = match self.processes.get_mut(&task_id).map(Process::check) {
                Some(Ok(Some(exit))) => Some(exit),
                Some(Ok(None)) | None => continue,
                Some(Err(e)) => {
                    warn!("Cannot check task {}: {}", task_id, e);
                    None
                }
            };
            self.processes.remove(&task_id);
            if let Some(reserved) = self.reserved.get_mut(&task_id) {
                in_use.remove(&reserved.without_disk());
                *reserved = reserved.disk_only();
            }
            let (state, exit) = match exit {
                Some(exit) => (TaskState::Done, exit),
                None => (
                    TaskState::Failed,
                    Exit {
                        exit_code: None,
                        signal: None,
                    },
                ),
            };
            info!(
                "Task {} finished: exit code {:?}, signal {:?}",
                task_id, exit.exit_code, exit.signal
            );
            if let Some(record) = self.set_state(workspace, &task_id, state, exit) {
                changed.push(record);
            }
        }

        let mut ready: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|r| r.state == TaskState::Ready)
            .map(|r| r.id().to_string())
            .collect();
        ready.sort();
        for task_id in ready {
            let spec = match self.tasks.get(&task_id) {
                Some(record) => record.spec.clone(),
                None => continue,
            };
            let mut needed = *in_use;
            needed.add(&spec.resources);
            if !needed.is_subset_of(capacity) {
                continue;
            }
            let no_exit = Exit {
                exit_code: None,
                signal: None,
            };
            let state = match Process::start(workspace, &spec) {
                Ok(process) => {
                    info!("Task {} running as pid {}", task_id, process.id());
                    in_use.add(&spec.resources);
                    self.reserved.insert(task_id.clone(), spec.resources);
                    self.processes.insert(task_id.clone(), process);
                    TaskState::Running
                }
                Err(e) => {
                    warn!("Task {} cannot start: {}", task_id, e);
                    TaskState::Failed
                }
            };
            if let Some(record) = self.set_state(workspace, &task_id, state, no_exit) {
                changed.push(record);
            }
        }
        changed
    }

    fn set_state(
        &mut self,
        workspace: &Workspace,
        task_id: &str,
        state: TaskState,
        exit: Exit,
    ) -> Option<TaskRecord> {
        let record = self.tasks.get_mut(task_id)?;
        record.state = state;
        record.exit_code = exit.exit_code;
        record.signal = exit.signal;
        if let Err(e) = write_json(&workspace.task_meta(task_id), &*record) {
            warn!("Cannot persist task {}: {}", task_id, e);
        }
        Some(record.clone())
    }

    /// Kill every running process.
    pub fn kill_all(&mut self) {
        for (task_id, mut process) in self.processes.drain() {
            if let Err(e) = process.kill() {
                warn!("Cannot kill task {}: {}", task_id, e);
            }
        }
    }
}
