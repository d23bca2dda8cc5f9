//! Self-test run by `dataswarm manager --test`: stage a file, count its lines on the first
//! worker that connects and bring the result back.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;

use dataswarm_core::errors::Result;
use dataswarm_core::types::{new_id, BlobId, Mount, MountFlags, MountType, TaskId};
use dataswarm_core::types::{TaskRecord, TaskSpec, TaskState};

use super::file::FileState;
use super::state::Manager;

pub const TEST_COMMAND: &str = "wc -l < myinput";

#[derive(Debug, Clone)]
enum Stage {
    WaitingForWorker,
    Running { task_id: TaskId, output: BlobId },
    Fetching { output: BlobId },
    Finished,
}

pub struct TestRoutine {
    input: PathBuf,
    stage: Stage,
    output: Option<String>,
}

impl TestRoutine {
    pub fn new(input: PathBuf) -> Self {
        TestRoutine {
            input,
            stage: Stage::WaitingForWorker,
            output: None,
        }
    }

    pub fn output(&self) -> Option<&str> {
        self.output.as_ref().map(String::as_str)
    }
}

impl Manager {
    /// Returns true once the test routine is over.
    pub(super) fn advance_test(&mut self) -> bool {
        let mut routine = match self.test.take() {
            Some(routine) => routine,
            None => return false,
        };
        let next = self.test_step(&mut routine);
        routine.stage = next;
        let finished = match routine.stage {
            Stage::Finished => true,
            _ => false,
        };
        self.test = Some(routine);
        finished
    }

    /// Output of the finished test routine.
    pub fn test_output(&self) -> Option<&str> {
        self.test.as_ref().and_then(TestRoutine::output)
    }

    fn test_step(&mut self, routine: &mut TestRoutine) -> Stage {
        match routine.stage.clone() {
            Stage::WaitingForWorker => {
                if self.workers.is_empty() {
                    return Stage::WaitingForWorker;
                }
                match self.start_test(&routine.input) {
                    Ok((task_id, output)) => Stage::Running { task_id, output },
                    Err(e) => {
                        error!("Test: cannot stage {:?}: {}", routine.input, e);
                        Stage::Finished
                    }
                }
            }
            Stage::Running { task_id, output } => {
                let state = self.tasks.get(&task_id).map(|t| t.record.state);
                match state {
                    Some(state) if state.is_finished() => {
                        let exit_code = self.tasks.get(&task_id).and_then(|t| t.record.exit_code);
                        info!("Test: task {:?} with exit code {:?}", state, exit_code);
                        if state == TaskState::Failed {
                            return Stage::Finished;
                        }
                        if self.commit_file(&output).is_err() {
                            return Stage::Finished;
                        }
                        self.fetches.insert(output.clone());
                        Stage::Fetching { output }
                    }
                    Some(_) => Stage::Running { task_id, output },
                    None => {
                        error!("Test: task {} disappeared", task_id);
                        Stage::Finished
                    }
                }
            }
            Stage::Fetching { output } => {
                let staging = match self.files.get(&output) {
                    Some(file) if file.state == FileState::Immutable && file.staged => {
                        file.staging.clone()
                    }
                    Some(_) => return Stage::Fetching { output },
                    None => {
                        error!("Test: output file {} disappeared", output);
                        return Stage::Finished;
                    }
                };
                match fs::read_to_string(&staging) {
                    Ok(text) => {
                        info!("Test: {:?} has {} lines", routine.input, text.trim());
                        routine.output = Some(text);
                    }
                    Err(e) => error!("Test: cannot read output: {}", e),
                }
                Stage::Finished
            }
            Stage::Finished => Stage::Finished,
        }
    }

    fn start_test(&mut self, input: &Path) -> Result<(TaskId, BlobId)> {
        let input_id = self.declare_file(0, Value::Null);
        let copied = match self.files.get(&input_id) {
            Some(file) => fs::copy(input, &file.staging)?,
            None => 0,
        };
        if let Some(file) = self.files.get_mut(&input_id) {
            file.staged = true;
            file.size = copied;
        }
        info!("Test: staged {:?} as {} ({} bytes)", input, input_id, copied);
        self.commit_file(&input_id)
            .map_err(|code| format!("cannot commit {}: {}", input_id, code.as_str()))?;

        let output_id = self.declare_file(0, Value::Null);
        let spec = TaskSpec::new(&new_id(), TEST_COMMAND)
            .mount(&input_id, Mount::path("myinput", MountFlags::READ))
            .mount(&output_id, Mount::stream(MountType::Stdout, MountFlags::WRITE));
        let task_id = self.add_task(TaskRecord::new(spec), None);
        Ok((task_id, output_id))
    }
}
