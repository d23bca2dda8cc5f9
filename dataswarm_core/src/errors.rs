#![allow(renamed_and_removed_lints)]

use nix::errno::Errno;

// Create the Error, ErrorKind, ResultExt, and Result types
error_chain!{
    types {
        Error, ErrorKind, ResultExt;
    }
    foreign_links {
        Io(::std::io::Error);
        Json(::serde_json::Error);
        Nix(::nix::Error);
        Regex(::regex::Error);
        Http(::reqwest::Error);
        AddrParse(::std::net::AddrParseError);
    }

    errors {
        Transport(errno: Errno) {
            description("message queue transport error")
            display("transport error: {}", errno.desc())
        }
        Protocol(msg: String) {
            description("protocol violation")
            display("protocol violation: {}", msg)
        }
    }
}

// Explicit alias just to make the IDEs happier
pub type Result<T> = ::std::result::Result<T, Error>;

impl Error {
    /// Errno carried by a transport error, if this is one.
    pub fn errno(&self) -> Option<Errno> {
        match *self.kind() {
            ErrorKind::Transport(errno) => Some(errno),
            ErrorKind::Nix(errno) => Some(errno),
            ErrorKind::Io(ref e) => e.raw_os_error().map(Errno::from_i32),
            _ => None,
        }
    }
}
