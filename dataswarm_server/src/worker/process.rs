use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::symlink;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

use dataswarm_core::errors::Result;
use dataswarm_core::types::{MountFlags, MountType, TaskSpec};

use super::workspace::Workspace;

/// How a task process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exit {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for Exit {
    fn from(status: ExitStatus) -> Self {
        Exit {
            exit_code: status.code(),
            signal: status.signal(),
        }
    }
}

/// A running task: `sh -c <command>` in its own process group, inside the task sandbox.
pub struct Process {
    child: Child,
    started: DateTime<Utc>,
}

impl Process {
    pub fn start(workspace: &Workspace, spec: &TaskSpec) -> Result<Self> {
        let sandbox = workspace.task_sandbox(&spec.task_id);
        let tmpdir = sandbox.join(".tmp");
        fs::create_dir_all(&tmpdir)?;

        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg(&spec.command)
            .current_dir(&sandbox)
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .env_remove("DISPLAY");

        for (blob_id, mount) in &spec.namespace {
            let data = workspace.blob_data(blob_id);
            match mount.kind {
                MountType::Path => {
                    let path = mount.path.as_ref().map(String::as_str).unwrap_or_default();
                    let link = sandbox.join(path);
                    if let Some(parent) = link.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    let _ = fs::remove_file(&link);
                    symlink(&data, &link)?;
                }
                MountType::Stdin => {
                    command.stdin(open_mount(&data, mount.flags)?);
                }
                MountType::Stdout => {
                    command.stdout(open_mount(&data, mount.flags)?);
                }
                MountType::Stderr => {
                    command.stderr(open_mount(&data, mount.flags)?);
                }
            }
        }

        let resources = &spec.resources;
        for &(name, value) in &[
            ("CORES", resources.cores),
            ("MEMORY", resources.memory),
            ("DISK", resources.disk),
        ] {
            if value > 0 {
                command.env(name, value.to_string());
            }
        }
        command.envs(&spec.environment);
        for name in &["TMPDIR", "TEMP", "TMP"] {
            command.env(name, &tmpdir);
        }

        let child = command.spawn()?;
        debug!("Task {} started as pid {}", spec.task_id, child.id());
        Ok(Process {
            child,
            started: Utc::now(),
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    /// The exit status if the process has ended.
    pub fn check(&mut self) -> Result<Option<Exit>> {
        Ok(self.child.try_wait()?.map(Exit::from))
    }

    /// Kill the whole process group and reap the child.
    pub fn kill(&mut self) -> Result<()> {
        match killpg(Pid::from_raw(self.child.id() as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(e.into()),
        }
        self.child.wait()?;
        Ok(())
    }
}

/// Open the blob contents behind a stdio mount.
fn open_mount(path: &Path, flags: MountFlags) -> Result<File> {
    let mut options = OpenOptions::new();
    if flags.is_read_only() {
        options.read(true);
    } else if flags.contains(MountFlags::APPEND) {
        options.read(true).write(true).create(true).append(true);
    } else {
        options.read(true).write(true).create(true).truncate(true);
    }
    Ok(options.open(path)?)
}
