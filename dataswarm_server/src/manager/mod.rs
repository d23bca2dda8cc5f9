mod client_ops;
mod client_rep;
mod file;
mod replica_table;
mod rpc;
mod scheduler;
mod state;
mod testmode;
mod worker_rep;

pub use self::state::Manager;
