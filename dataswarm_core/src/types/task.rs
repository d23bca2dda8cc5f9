use std::collections::BTreeMap;

use super::{BlobId, Mount, Resources, TaskId};

/// Everything needed to run a task, as submitted by a client and forwarded to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSpec {
    #[serde(rename = "task-id")]
    #[serde(default)]
    pub task_id: TaskId,

    pub command: String,

    /// Blobs visible to the task, keyed by blob id.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    #[serde(default)]
    pub namespace: BTreeMap<BlobId, Mount>,

    #[serde(default)]
    pub resources: Resources,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl TaskSpec {
    pub fn new(task_id: &str, command: &str) -> Self {
        TaskSpec {
            task_id: task_id.to_string(),
            command: command.to_string(),
            namespace: BTreeMap::new(),
            resources: Resources::default(),
            environment: BTreeMap::new(),
        }
    }

    pub fn mount(mut self, blob_id: &str, mount: Mount) -> Self {
        self.namespace.insert(blob_id.to_string(), mount);
        self
    }

    pub fn validate(&self) -> bool {
        !self.command.is_empty() && self.namespace.values().all(Mount::validate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Waiting to run (manager: waiting for a worker).
    Ready,
    Running,
    /// The process exited; see the exit status.
    Done,
    /// Could not be run to completion (setup failure, lost while running).
    Failed,
    /// Removal requested (manager only).
    Deleting,
    Deleted,
}

impl TaskState {
    pub fn is_finished(self) -> bool {
        match self {
            TaskState::Done | TaskState::Failed => true,
            _ => false,
        }
    }
}

/// A task together with its execution state, as persisted in `task/<id>/meta`
/// and reported in `task-update` notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub spec: TaskSpec,
    pub state: TaskState,
    #[serde(rename = "exit-code")]
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub signal: Option<i32>,
}

impl TaskRecord {
    pub fn new(spec: TaskSpec) -> Self {
        TaskRecord {
            spec,
            state: TaskState::Ready,
            exit_code: None,
            signal: None,
        }
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.spec.task_id
    }

    /// Params of the `task-update` notification for this record.
    pub fn update_params(&self) -> ::serde_json::Value {
        json!({
            "task-id": self.spec.task_id,
            "state": self.state,
            "exit-code": self.exit_code,
            "signal": self.signal,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MountFlags, MountType};

    #[test]
    fn spec_json() {
        let spec = TaskSpec::new("t1", "wc -l myinput")
            .mount("abc123", Mount::path("myinput", MountFlags::READ))
            .mount("out", Mount::stream(MountType::Stdout, MountFlags::WRITE));
        let value = ::serde_json::to_value(&spec).unwrap();
        assert_eq!(value["task-id"], "t1");
        assert_eq!(value["namespace"]["abc123"]["path"], "myinput");
        assert!(value.get("environment").is_none());
        let back: TaskSpec = ::serde_json::from_value(value).unwrap();
        assert_eq!(back, spec);
        assert!(spec.validate());
    }

    #[test]
    fn unknown_keys_rejected() {
        let r = ::serde_json::from_value::<TaskSpec>(json!({"command": "x", "bogus": 1}));
        assert!(r.is_err());
        let minimal: TaskSpec = ::serde_json::from_value(json!({"command": "true"})).unwrap();
        assert_eq!(minimal.task_id, "");
        assert_eq!(minimal.resources, Resources::default());
    }

    #[test]
    fn update_params() {
        let mut record = TaskRecord::new(TaskSpec::new("t2", "true"));
        record.state = TaskState::Done;
        record.exit_code = Some(0);
        let p = record.update_params();
        assert_eq!(p["state"], "done");
        assert_eq!(p["exit-code"], 0);
        assert!(TaskState::Failed.is_finished());
        assert!(!TaskState::Running.is_finished());
    }
}
