//! Pipelined client for line oriented dictionary servers (RFC 2229 style).
//!
//! A [`Connection`] keeps one socket open and lets any number of requests
//! be in flight on it. Commands are written in the order they were queued
//! and responses are handed to the requests in that same order.

pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod handler;
pub mod request;
pub mod shutdown;
pub mod status;

pub use codec::{CommandEncoder, QuotingEncoder, Response, ResponseParser, TokenParser};
pub use config::{Config, TextEncoding};
pub use connection::{Connection, ConnectionManager};
pub use handler::{Disposition, Handler};
pub use request::{Entry, Exchange, Pending, Reply, Request, Transcript, UnhandledPolicy};
pub use status::StatusCode;

use snafu::prelude::*;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("failed to load configuration: {}", source))]
    ConfigError { source: config::Error },
    #[snafu(display("failed on connection: {}", source))]
    ConnectError { source: connection::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
