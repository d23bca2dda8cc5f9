extern crate atty;
extern crate chrono;
#[macro_use]
extern crate clap;
extern crate env_logger;
#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate log;
extern crate nix;
extern crate rand;
extern crate serde;
#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate serde_json;
extern crate toml;
extern crate walkdir;

#[cfg(test)]
extern crate tempdir;

extern crate dataswarm_core;

mod config;
mod manager;
mod worker;

#[cfg(test)]
mod tests;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::exit;

use clap::{App, Arg, ArgMatches, SubCommand};
use nix::unistd::getpid;

use dataswarm_core::errors::*;
use dataswarm_core::sys::get_hostname;
use dataswarm_core::utils::SystemClock;
use dataswarm_core::VERSION;

use crate::config::{ManagerConfig, WorkerConfig};

fn default_working_directory(basename: &str) -> PathBuf {
    let pid = getpid();
    let hostname = get_hostname();
    PathBuf::from("/tmp").join(format!("dataswarm-{}-{}-{}", basename, hostname, pid))
}

fn ensure_directory(dir: &Path, name: &str) -> Result<()> {
    if !dir.exists() {
        debug!("{} not found, creating ... {:?}", name, dir);
        if let Err(e) = ::std::fs::create_dir_all(dir) {
            bail!("{} {:?} cannot by created: {}", name, dir, e);
        }
    } else if !dir.is_dir() {
        bail!("{} {:?} exists but it is not a directory", name, dir);
    }
    Ok(())
}

fn parse_catalog_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn read_config<T, F>(cmd_args: &ArgMatches, read: F) -> T
where
    T: Default,
    F: FnOnce(&Path) -> Result<T>,
{
    match cmd_args.value_of("CONFIG") {
        Some(path) => {
            info!("Reading config file: {}", path);
            read(Path::new(path)).unwrap_or_else(|e| {
                error!("Reading config file failed: {}", e);
                exit(1);
            })
        }
        None => T::default(),
    }
}

fn run_manager(_global_args: &ArgMatches, cmd_args: &ArgMatches) {
    let mut config: ManagerConfig = read_config(cmd_args, ManagerConfig::read_file);

    if cmd_args.is_present("PORT") {
        config.port = value_t_or_exit!(cmd_args, "PORT", u16);
    }
    if let Some(range) = cmd_args.value_of("PORT_RANGE") {
        let bounds: Vec<&str> = range.splitn(2, ':').collect();
        match (
            bounds.get(0).and_then(|s| s.parse().ok()),
            bounds.get(1).and_then(|s| s.parse().ok()),
        ) {
            (Some(low), Some(high)) if low <= high => config.port_range = Some((low, high)),
            _ => {
                error!("Invalid port range '{}', expected LOW:HIGH", range);
                exit(1);
            }
        }
    }
    if let Some(name) = cmd_args.value_of("NAME") {
        config.name = name.to_string();
    }
    if let Some(catalog) = cmd_args.value_of("CATALOG") {
        config.catalog = parse_catalog_list(catalog);
    }
    if cmd_args.is_present("UPDATE_INTERVAL") {
        config.update_interval = value_t_or_exit!(cmd_args, "UPDATE_INTERVAL", f64);
    }
    if let Some(path) = cmd_args.value_of("TEST") {
        config.test_input = Some(PathBuf::from(path));
    }

    let workdir = cmd_args
        .value_of("WORK_DIR")
        .map(PathBuf::from)
        .or_else(|| config.workdir.clone())
        .unwrap_or_else(|| default_working_directory("manager"));
    ensure_directory(&workdir, "working directory").unwrap_or_else(|e| {
        error!("{}", e);
        exit(1);
    });
    config.workdir = Some(workdir);

    info!("Starting Dataswarm {} manager", VERSION);
    info!("Project name: {}", config.name);

    let mut manager =
        manager::Manager::new(config, Box::new(SystemClock)).unwrap_or_else(|e| {
            error!("Cannot start manager: {}", e);
            exit(1);
        });
    info!("Listening on port {}", manager.port());

    loop {
        match manager.turn() {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                error!("Manager failed: {}", e);
                exit(1);
            }
        }
    }
    info!("Manager finished");
}

fn run_worker(_global_args: &ArgMatches, cmd_args: &ArgMatches) {
    let mut config: WorkerConfig = read_config(cmd_args, WorkerConfig::read_file);

    if let Some(address) = cmd_args.value_of("MANAGER_ADDRESS") {
        config.manager = Some(address.to_string());
    }
    if let Some(name) = cmd_args.value_of("NAME") {
        config.name = Some(name.to_string());
    }
    if let Some(catalog) = cmd_args.value_of("CATALOG") {
        config.catalog = parse_catalog_list(catalog);
    }
    if cmd_args.is_present("CORES") {
        config.cores = Some(value_t_or_exit!(cmd_args, "CORES", u64));
    }
    if cmd_args.is_present("MEMORY") {
        config.memory = Some(value_t_or_exit!(cmd_args, "MEMORY", u64));
    }
    if cmd_args.is_present("DISK") {
        config.disk = Some(value_t_or_exit!(cmd_args, "DISK", u64));
    }
    if cmd_args.is_present("MIN_RETRY") {
        config.min_connect_retry = value_t_or_exit!(cmd_args, "MIN_RETRY", f64);
    }
    if cmd_args.is_present("MAX_RETRY") {
        config.max_connect_retry = value_t_or_exit!(cmd_args, "MAX_RETRY", f64);
    }
    if cmd_args.is_present("IDLE_TIMEOUT") {
        config.idle_timeout = value_t_or_exit!(cmd_args, "IDLE_TIMEOUT", f64);
    }

    if config.manager.is_some() && config.name.is_some() {
        error!("A manager address and --name are mutually exclusive");
        exit(1);
    }
    if config.manager.is_none() && config.name.is_none() {
        error!("Either a manager address or --name must be given");
        exit(1);
    }

    let workspace = cmd_args
        .value_of("WORKSPACE")
        .map(PathBuf::from)
        .or_else(|| config.workspace.clone())
        .unwrap_or_else(|| default_working_directory("worker"));
    ensure_directory(&workspace, "workspace").unwrap_or_else(|e| {
        error!("{}", e);
        exit(1);
    });
    config.workspace = Some(workspace);

    info!("Starting Dataswarm {} worker", VERSION);

    let mut worker = worker::Worker::new(config, Box::new(SystemClock)).unwrap_or_else(|e| {
        error!("Cannot start worker: {}", e);
        exit(1);
    });
    if let Err(e) = worker.run() {
        error!("Worker failed: {}", e);
        exit(1);
    }
    info!("Worker finished");
}

fn init_log() {
    // Default level is INFO
    if ::std::env::var("RUST_LOG").is_err() {
        ::std::env::set_var("RUST_LOG", "info");
    }
    if ::atty::is(::atty::Stream::Stdout) {
        ::env_logger::Builder::new()
            .format(|buf, record| {
                use env_logger::fmt::Color;
                use log::Level;

                let ts = ::chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                let level = record.level();
                let mut level_style = buf.style();

                match level {
                    Level::Trace => level_style.set_color(Color::White),
                    Level::Debug => level_style.set_color(Color::Blue),
                    Level::Info => level_style.set_color(Color::Green),
                    Level::Warn => level_style.set_color(Color::Yellow),
                    Level::Error => level_style.set_color(Color::Red).set_bold(true),
                };
                let mut target_style = buf.style();
                target_style.set_color(Color::Cyan);
                writeln!(
                    buf,
                    "{:>5} {} {} {}",
                    level_style.value(level),
                    ts,
                    target_style.value(record.target()),
                    record.args()
                )
            })
            .parse_filters(&::std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()))
            .init();
    } else {
        ::env_logger::init();
    }
}

fn main() {
    init_log();

    // We do not use clap macro to build parser,
    // since it cannot handle "-" in name of long arguments
    let args = App::new("Dataswarm")
        .version(VERSION)
        .about("Manager and worker of a distributed task and data system")
        .subcommand( // ---- MANAGER ----
            SubCommand::with_name("manager")
                .about("Dataswarm manager")
                .arg(Arg::with_name("PORT")
                    .short("p")
                    .long("port")
                    .help("Listening port, 0 for any free port (default 9123)")
                    .takes_value(true))
                .arg(Arg::with_name("PORT_RANGE")
                    .long("port-range")
                    .value_name("LOW:HIGH")
                    .help("Listen on the first free port in this range")
                    .takes_value(true))
                .arg(Arg::with_name("NAME")
                    .short("N")
                    .long("name")
                    .help("Project name advertised to the catalog (default dataswarm)")
                    .takes_value(true))
                .arg(Arg::with_name("CATALOG")
                    .long("catalog")
                    .value_name("HOSTS")
                    .help("Comma separated catalog servers (host[:port])")
                    .takes_value(true))
                .arg(Arg::with_name("UPDATE_INTERVAL")
                    .long("update-interval")
                    .value_name("SECONDS")
                    .help("Catalog update interval (default 60)")
                    .takes_value(true))
                .arg(Arg::with_name("WORK_DIR")
                    .long("workdir")
                    .value_name("DIR")
                    .help("Staging directory (default /tmp/dataswarm-manager-$HOSTNAME-$PID)")
                    .takes_value(true))
                .arg(Arg::with_name("CONFIG")
                    .long("config")
                    .help("Path to configuration file")
                    .takes_value(true))
                .arg(Arg::with_name("TEST")
                    .long("test")
                    .value_name("FILE")
                    .help("Run the end-to-end routine on FILE with the first worker, then exit")
                    .takes_value(true)))
        .subcommand( // ---- WORKER ----
            SubCommand::with_name("worker")
                .about("Dataswarm worker")
                .arg(Arg::with_name("MANAGER_ADDRESS")
                    .help("Manager address host:port"))
                .arg(Arg::with_name("NAME")
                    .short("N")
                    .long("name")
                    .help("Find the manager of this project (regex) through the catalog")
                    .takes_value(true))
                .arg(Arg::with_name("CATALOG")
                    .long("catalog")
                    .value_name("HOSTS")
                    .help("Comma separated catalog servers (host[:port])")
                    .takes_value(true))
                .arg(Arg::with_name("WORKSPACE")
                    .long("workspace")
                    .value_name("DIR")
                    .help("Workspace directory (default /tmp/dataswarm-worker-$HOSTNAME-$PID)")
                    .takes_value(true))
                .arg(Arg::with_name("CORES")
                    .long("cores")
                    .value_name("N")
                    .help("Number of cores (default = detect)")
                    .takes_value(true))
                .arg(Arg::with_name("MEMORY")
                    .long("memory")
                    .value_name("MB")
                    .help("Memory in MB (default = detect)")
                    .takes_value(true))
                .arg(Arg::with_name("DISK")
                    .long("disk")
                    .value_name("MB")
                    .help("Disk in MB (default = free space of the workspace)")
                    .takes_value(true))
                .arg(Arg::with_name("MIN_RETRY")
                    .long("min-connect-retry")
                    .value_name("SECONDS")
                    .help("First reconnect delay (default 1)")
                    .takes_value(true))
                .arg(Arg::with_name("MAX_RETRY")
                    .long("max-connect-retry")
                    .value_name("SECONDS")
                    .help("Longest reconnect delay (default 60)")
                    .takes_value(true))
                .arg(Arg::with_name("IDLE_TIMEOUT")
                    .long("idle-timeout")
                    .value_name("SECONDS")
                    .help("Exit after this long without a manager (default 300)")
                    .takes_value(true))
                .arg(Arg::with_name("CONFIG")
                    .long("config")
                    .help("Path to configuration file")
                    .takes_value(true)))
        .get_matches();

    match args.subcommand() {
        ("manager", Some(cmd_args)) => run_manager(&args, cmd_args),
        ("worker", Some(cmd_args)) => run_worker(&args, cmd_args),
        _ => {
            error!("No subcommand provided.");
            ::std::process::exit(1);
        }
    }
}
