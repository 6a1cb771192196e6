use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::codec::Response;
use crate::handler::{self, AlreadyFinishedSnafu, Disposition, Handler};
use crate::status::{StatusCode, SERVER_OFFLINE};

/// An exchange's verdict on one response line or text block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Completed successfully; [`Exchange::result`] will be asked for the payload.
    Done,
    More,
    Text,
    /// Not a code this exchange knows; the request's default policy decides.
    Unhandled,
}

/// What happens to a code that neither the exchange nor the soft error
/// handling recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnhandledPolicy {
    /// Log it and end the exchange without a result.
    #[default]
    Consume,
    /// Log it and keep waiting. Every later request on the connection
    /// stalls behind this one until the connection goes away.
    Stall,
}

/// The command specific half of a request.
pub trait Exchange: Send + 'static {
    type Output: Send + 'static;

    fn is_final(&self) -> bool {
        false
    }

    fn on_response(&mut self, response: &Response) -> Reply;

    fn on_text(&mut self, lines: Vec<String>) -> Reply {
        let _ = lines;
        Reply::More
    }

    /// Called once, when the request finishes after a [`Reply::Done`].
    fn result(&mut self) -> Option<Self::Output>;
}

/// Generic [`Handler`] that adds soft error handling and completion
/// signalling around an [`Exchange`].
pub struct Request<E: Exchange> {
    exchange: E,
    policy: UnhandledPolicy,
    succeeded: bool,
    finished: Arc<AtomicBool>,
    sender: Option<oneshot::Sender<Option<E::Output>>>,
}

impl<E: Exchange> Request<E> {
    pub fn new(exchange: E) -> (Request<E>, Pending<E::Output>) {
        let (sender, receiver) = oneshot::channel();
        let finished = Arc::new(AtomicBool::new(false));

        let request = Request {
            exchange,
            policy: UnhandledPolicy::default(),
            succeeded: false,
            finished: finished.clone(),
            sender: Some(sender),
        };

        (request, Pending { finished, receiver })
    }

    pub fn with_policy(mut self, policy: UnhandledPolicy) -> Request<E> {
        self.policy = policy;
        self
    }

    fn dispose(&mut self, reply: Reply, code: Option<StatusCode>) -> Disposition {
        match reply {
            Reply::Done => {
                self.succeeded = true;
                Disposition::Consumed
            }
            Reply::More => Disposition::Pending,
            Reply::Text => Disposition::Text,
            Reply::Unhandled => self.unhandled(code),
        }
    }

    fn unhandled(&self, code: Option<StatusCode>) -> Disposition {
        match code {
            Some(code) if code.is_soft_error() => {
                if code == SERVER_OFFLINE {
                    warn!("server is offline");
                } else {
                    warn!("temporary server problem");
                }
                return Disposition::Consumed;
            }
            Some(code) => warn!("unhandled response code: {}", code),
            None => warn!("unhandled text block"),
        }

        match self.policy {
            UnhandledPolicy::Consume => Disposition::Consumed,
            UnhandledPolicy::Stall => Disposition::Pending,
        }
    }
}

impl<E: Exchange> Handler for Request<E> {
    fn is_final(&self) -> bool {
        self.exchange.is_final()
    }

    fn handle_response(&mut self, response: &Response) -> Disposition {
        let reply = self.exchange.on_response(response);
        self.dispose(reply, Some(response.code))
    }

    fn handle_text(&mut self, lines: Vec<String>) -> Disposition {
        let reply = self.exchange.on_text(lines);
        self.dispose(reply, None)
    }

    fn set_finished(&mut self) -> handler::Result<()> {
        if self.finished.swap(true, Ordering::AcqRel) {
            AlreadyFinishedSnafu.fail()?
        }

        let result = if self.succeeded {
            self.exchange.result()
        } else {
            None
        };
        debug!(succeeded = self.succeeded, "request finished");

        if let Some(sender) = self.sender.take() {
            // the caller may have stopped waiting
            let _ = sender.send(result);
        }
        Ok(())
    }

    fn has_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

/// Caller side of a [`Request`]. Resolves to `None` when the request
/// finished without a result.
#[derive(Debug)]
pub struct Pending<T> {
    finished: Arc<AtomicBool>,
    receiver: oneshot::Receiver<Option<T>>,
}

impl<T> Pending<T> {
    pub fn has_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Blocks the current thread until the request finishes. Must not be
    /// called from inside an async context.
    pub fn wait(self) -> Option<T> {
        self.receiver.blocking_recv().ok().flatten()
    }
}

impl<T> Future for Pending<T> {
    type Output = Option<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.ok().flatten())
    }
}

/// One response line and the text block that followed it, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub response: Response,
    pub text: Vec<String>,
}

/// Records everything the server says about one command until its
/// completion code.
#[derive(Debug, Default)]
pub struct Transcript {
    entries: Vec<Entry>,
    closing: bool,
}

impl Transcript {
    pub fn new() -> Transcript {
        Transcript::default()
    }

    /// For a command that ends the session, such as `QUIT`.
    pub fn closing() -> Transcript {
        Transcript {
            entries: Vec::new(),
            closing: true,
        }
    }
}

impl Exchange for Transcript {
    type Output = Vec<Entry>;

    fn is_final(&self) -> bool {
        self.closing
    }

    fn on_response(&mut self, response: &Response) -> Reply {
        let code = response.code;
        if code.is_soft_error() {
            return Reply::Unhandled;
        }

        self.entries.push(Entry {
            response: response.clone(),
            text: Vec::new(),
        });

        if code.announces_text() {
            Reply::Text
        } else if code.is_completion() {
            Reply::Done
        } else {
            Reply::More
        }
    }

    fn on_text(&mut self, lines: Vec<String>) -> Reply {
        match self.entries.last_mut() {
            Some(entry) => {
                entry.text = lines;
                Reply::More
            }
            None => Reply::Unhandled,
        }
    }

    fn result(&mut self) -> Option<Vec<Entry>> {
        Some(std::mem::take(&mut self.entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{self, StatusCode};

    fn response(code: u16, tokens: &[&str]) -> Response {
        Response::new(
            StatusCode::new(code),
            tokens.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn ts_on_finish_twice() {
        let (mut request, pending) = Request::new(Transcript::new());
        assert!(!request.has_finished());
        assert!(!pending.has_finished());

        request.set_finished().unwrap();
        assert!(request.has_finished());
        assert!(pending.has_finished());

        assert!(matches!(
            request.set_finished(),
            Err(handler::Error::AlreadyFinishedError)
        ));
        assert_eq!(pending.wait(), None);
    }

    #[tokio::test]
    async fn ts_on_transcript() {
        let (mut request, pending) = Request::new(Transcript::new());

        assert_eq!(
            request.handle_response(&response(150, &["1", "definitions"])),
            Disposition::Pending
        );
        assert_eq!(
            request.handle_response(&response(151, &["hello", "wn", "WordNet"])),
            Disposition::Text
        );
        assert_eq!(
            request.handle_text(vec!["hello".to_string(), "  n 1: greeting".to_string()]),
            Disposition::Pending
        );
        assert_eq!(
            request.handle_response(&response(250, &["ok"])),
            Disposition::Consumed
        );
        request.set_finished().unwrap();

        let entries = pending.await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].response.code, status::DEFINITION_FOLLOWS);
        assert_eq!(entries[1].text[1], "  n 1: greeting");
        assert_eq!(entries[2].response.code, status::OK);
    }

    #[tokio::test]
    async fn ts_on_soft_errors() {
        for code in [420, 421] {
            let (mut request, pending) = Request::new(Transcript::new());
            assert_eq!(
                request.handle_response(&response(code, &["busy"])),
                Disposition::Consumed
            );
            request.set_finished().unwrap();
            assert_eq!(pending.await, None);
        }
    }

    struct OnlyOk;

    impl Exchange for OnlyOk {
        type Output = ();

        fn on_response(&mut self, response: &Response) -> Reply {
            if response.code == status::OK {
                Reply::Done
            } else {
                Reply::Unhandled
            }
        }

        fn result(&mut self) -> Option<()> {
            Some(())
        }
    }

    #[tokio::test]
    async fn ts_on_unhandled_policy() {
        let (mut request, pending) = Request::new(OnlyOk);
        assert_eq!(
            request.handle_response(&response(552, &["no", "match"])),
            Disposition::Consumed
        );
        request.set_finished().unwrap();
        assert_eq!(pending.await, None);

        let (request, pending) = Request::new(OnlyOk);
        let mut request = request.with_policy(UnhandledPolicy::Stall);
        assert_eq!(
            request.handle_response(&response(552, &["no", "match"])),
            Disposition::Pending
        );
        assert_eq!(
            request.handle_response(&response(250, &["ok"])),
            Disposition::Consumed
        );
        request.set_finished().unwrap();
        assert_eq!(pending.await, Some(()));
    }

    #[tokio::test]
    async fn ts_on_dropped_request() {
        let (request, pending) = Request::new(OnlyOk);
        drop(request);
        assert_eq!(pending.await, None);
    }

    #[test]
    fn ts_on_closing() {
        assert!(!Request::new(Transcript::new()).0.is_final());
        assert!(Request::new(Transcript::closing()).0.is_final());
    }
}
