pub(crate) mod backoff;
pub(crate) mod clock;

pub use self::backoff::Backoff;
pub use self::clock::{Clock, Interval, ManualClock, SystemClock};
