use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dataswarm_core::errors::Result;
use dataswarm_core::types::Resources;

pub const DEFAULT_MANAGER_PORT: u16 = 9123;
pub const DEFAULT_PROJECT_NAME: &str = "dataswarm";

fn read_toml<T>(path: &Path) -> Result<T>
where
    for<'de> T: ::serde::de::Deserialize<'de>,
{
    let mut file = ::std::fs::File::open(path)?;
    let mut content = String::new();
    file.read_to_string(&mut content)?;
    ::toml::from_str(&content).map_err(|e| format!("Cannot parse toml: {}", e).into())
}

#[inline]
fn seconds(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

/// Manager settings. Durations are in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManagerConfig {
    /// Listening port; 0 picks any free port.
    pub port: u16,
    /// Listen on the first free port of this range instead of `port`.
    pub port_range: Option<(u16, u16)>,
    /// Project name advertised to the catalog.
    pub name: String,
    pub update_interval: f64,
    pub connect_timeout: f64,
    pub stall_timeout: f64,
    /// Catalog servers (`host[:port]`); empty disables advertisement.
    pub catalog: Vec<String>,
    /// Staging directory for file contents.
    pub workdir: Option<PathBuf>,
    pub poll_ceiling: f64,
    /// Run the built-in end-to-end routine with this input file.
    pub test_input: Option<PathBuf>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            port: DEFAULT_MANAGER_PORT,
            port_range: None,
            name: DEFAULT_PROJECT_NAME.to_string(),
            update_interval: 60.0,
            connect_timeout: 5.0,
            stall_timeout: 30.0,
            catalog: Vec::new(),
            workdir: None,
            poll_ceiling: 10.0,
            test_input: None,
        }
    }
}

impl ManagerConfig {
    pub fn read_file(path: &Path) -> Result<Self> {
        read_toml(path)
    }

    pub fn update_interval(&self) -> Duration {
        seconds(self.update_interval)
    }

    pub fn connect_timeout(&self) -> Duration {
        seconds(self.connect_timeout)
    }

    pub fn stall_timeout(&self) -> Duration {
        seconds(self.stall_timeout)
    }

    pub fn poll_ceiling(&self) -> Duration {
        seconds(self.poll_ceiling)
    }
}

/// Worker settings. Durations are in seconds, memory and disk in MB.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub workspace: Option<PathBuf>,
    /// `host:port` of the manager.
    pub manager: Option<String>,
    /// Project name of the manager, resolved through the catalog.
    pub name: Option<String>,
    pub catalog: Vec<String>,
    pub min_connect_retry: f64,
    pub max_connect_retry: f64,
    pub catalog_timeout: f64,
    /// Exit after this long without a manager.
    pub idle_timeout: f64,
    /// Longest accepted duration of one incoming blob transfer.
    pub long_timeout: f64,
    pub status_report_interval: f64,
    pub cores: Option<u64>,
    pub memory: Option<u64>,
    pub disk: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            workspace: None,
            manager: None,
            name: None,
            catalog: Vec::new(),
            min_connect_retry: 1.0,
            max_connect_retry: 60.0,
            catalog_timeout: 60.0,
            idle_timeout: 300.0,
            long_timeout: 3600.0,
            status_report_interval: 60.0,
            cores: None,
            memory: None,
            disk: None,
        }
    }
}

impl WorkerConfig {
    pub fn read_file(path: &Path) -> Result<Self> {
        read_toml(path)
    }

    pub fn min_connect_retry(&self) -> Duration {
        seconds(self.min_connect_retry)
    }

    pub fn max_connect_retry(&self) -> Duration {
        seconds(self.max_connect_retry)
    }

    pub fn catalog_timeout(&self) -> Duration {
        seconds(self.catalog_timeout)
    }

    pub fn idle_timeout(&self) -> Duration {
        seconds(self.idle_timeout)
    }

    pub fn long_timeout(&self) -> Duration {
        seconds(self.long_timeout)
    }

    pub fn status_report_interval(&self) -> Duration {
        seconds(self.status_report_interval)
    }

    /// Configured resources, with missing components taken from `measured`.
    pub fn resources(&self, measured: &Resources) -> Resources {
        Resources::new(
            self.cores.unwrap_or(measured.cores),
            self.memory.unwrap_or(measured.memory),
            self.disk.unwrap_or(measured.disk),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn manager_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.port, 9123);
        assert_eq!(config.name, "dataswarm");
        assert_eq!(config.poll_ceiling(), Duration::from_secs(10));
        assert_eq!(config.update_interval(), Duration::from_secs(60));
    }

    #[test]
    fn read_partial_files() {
        let dir = ::tempdir::TempDir::new("config").unwrap();
        let path = dir.path().join("manager.toml");
        let mut file = ::std::fs::File::create(&path).unwrap();
        writeln!(file, "port = 0\nname = \"proj\"\ncatalog = [\"localhost:9097\"]\nport_range = [9000, 9010]").unwrap();
        let config = ManagerConfig::read_file(&path).unwrap();
        assert_eq!(config.port, 0);
        assert_eq!(config.name, "proj");
        assert_eq!(config.catalog, vec!["localhost:9097".to_string()]);
        assert_eq!(config.port_range, Some((9000, 9010)));
        assert_eq!(config.stall_timeout, 30.0);

        let path = dir.path().join("worker.toml");
        let mut file = ::std::fs::File::create(&path).unwrap();
        writeln!(file, "manager = \"localhost:9123\"\ncores = 2\nmin_connect_retry = 0.5").unwrap();
        let config = WorkerConfig::read_file(&path).unwrap();
        assert_eq!(config.manager.as_ref().map(String::as_str), Some("localhost:9123"));
        assert_eq!(config.min_connect_retry(), Duration::from_millis(500));
        let r = config.resources(&Resources::new(8, 1000, 5000));
        assert_eq!(r, Resources::new(2, 1000, 5000));
    }

    #[test]
    fn unknown_keys_rejected() {
        let dir = ::tempdir::TempDir::new("config").unwrap();
        let path = dir.path().join("bad.toml");
        ::std::fs::write(&path, "prot = 1\n").unwrap();
        assert!(ManagerConfig::read_file(&path).is_err());
    }
}
