#[macro_use]
extern crate bitflags;
extern crate byteorder;
#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate log;
extern crate nix;
extern crate num_cpus;
extern crate rand;
extern crate regex;
extern crate reqwest;
extern crate serde;
#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate serde_json;
extern crate socket2;
extern crate sys_info;

#[cfg(test)]
extern crate tempdir;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod catalog;
pub mod comm;
pub mod errors;
pub mod mq;
pub mod replica;
pub mod sys;
pub mod types;
pub mod utils;
