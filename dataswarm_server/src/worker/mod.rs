mod blob_table;
mod process;
mod state;
mod task_table;
mod workspace;

pub use self::state::Worker;
