use snafu::prelude::*;

use crate::codec::Response;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("already finished"))]
    AlreadyFinishedError,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// What a handler wants after seeing a response line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The exchange is over; the handler leaves the in-flight queue.
    Consumed,
    /// More response lines belong to this handler.
    Pending,
    /// A dot-terminated text block follows and goes to [`Handler::handle_text`].
    Text,
}

/// One logical request/response exchange on a pipelined connection.
///
/// The connection only talks to requests through this trait. Handlers are
/// fed strictly in the order their commands reached the wire.
pub trait Handler: Send + 'static {
    /// A final request ends the session; nothing queued behind it is sent.
    fn is_final(&self) -> bool {
        false
    }

    fn handle_response(&mut self, response: &Response) -> Disposition;

    /// Receives the lines of a text block, dot-stuffing already undone.
    fn handle_text(&mut self, lines: Vec<String>) -> Disposition {
        let _ = lines;
        Disposition::Pending
    }

    /// Marks the exchange finished. Called exactly once by the connection;
    /// a second call fails.
    fn set_finished(&mut self) -> Result<()>;

    fn has_finished(&self) -> bool;
}
