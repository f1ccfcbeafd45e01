#![doc = include_str!("../README.md")]

#[macro_use]
extern crate log;

#[macro_use]
mod macros;

mod config;
mod connection;
mod error;
mod promise;
mod protocol;
mod types;
mod utils;

pub use crate::config::{LogEvent, Logger, Opts};
pub use crate::connection::{BatchFlags, Connection, State};
pub use crate::error::{Error, ErrorCode, ErrorKind};
pub use crate::promise::{OneshotPromise, Promise, ReplyResult};
pub use crate::protocol::request::{arg_to_key, Request};
pub use crate::types::Value;

pub extern crate bytes;
pub extern crate bytes_utils;
