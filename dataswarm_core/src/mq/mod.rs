//! Framed message queue over non-blocking TCP sockets.
//!
//! A message is a byte buffer or the contents of a file, split into frames of at most
//! 64KB (see `frame`). Connections never block on their own; progress happens while the
//! owner waits on a single connection (`Connection::wait`) or on a `PollGroup`.

mod connection;
pub mod frame;
mod message;
mod poll;

pub use self::connection::{ConnState, Connection};
pub use self::message::Message;
pub use self::poll::{ConnId, PollGroup};
