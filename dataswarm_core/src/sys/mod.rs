pub(crate) mod sys;

pub use self::sys::{available_disk, get_hostname, measure_resources};
