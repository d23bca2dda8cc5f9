use std::path::Path;

use nix::sys::statvfs::statvfs;
use nix::unistd::gethostname;

use crate::errors::Result;
use crate::types::Resources;

pub fn get_hostname() -> String {
    match gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            warn!("gethostname failed: {}", e);
            "localhost".to_string()
        }
    }
}

/// Free space (MB) on the filesystem holding `path`.
pub fn available_disk(path: &Path) -> Result<u64> {
    let stat = statvfs(path)?;
    let bytes = stat.blocks_available() as u64 * stat.fragment_size() as u64;
    Ok(bytes / (1024 * 1024))
}

/// Cores, memory (MB) and disk (MB, free space at `workspace`) of this machine.
pub fn measure_resources(workspace: &Path) -> Result<Resources> {
    let cores = num_cpus::get() as u64;
    let memory = match ::sys_info::mem_info() {
        Ok(info) => info.total / 1024,
        Err(e) => {
            warn!("Cannot measure memory: {}", e);
            0
        }
    };
    let disk = available_disk(workspace)?;
    debug!(
        "Measured {} cores, {} MB memory, {} MB disk",
        cores, memory, disk
    );
    Ok(Resources::new(cores, memory, disk))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn measures_something() {
        assert!(!get_hostname().is_empty());
        let dir = ::tempdir::TempDir::new("sys").unwrap();
        let r = measure_resources(dir.path()).unwrap();
        assert!(r.cores >= 1);
    }
}
