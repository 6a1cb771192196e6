use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use snafu::{prelude::*, ResultExt};
use tokio::runtime::{Handle, TryCurrentError};
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tracing::{debug, error, info, instrument, warn};

use crate::channel::{self, ChannelState, LineChannel, LineReader, StateWatch};
use crate::codec::{self, CommandEncoder, QuotingEncoder, Response, ResponseParser, TokenParser};
use crate::config::{Config, TextEncoding};
use crate::handler::{Disposition, Handler};
use crate::request::{Exchange, Pending, Request};
use crate::shutdown::Shutdown;
use crate::status;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("no tokio runtime to drive the connection: {}", source))]
    RuntimeError { source: TryCurrentError },
    #[snafu(display("{}", source))]
    CommandError { source: codec::Error },
    #[snafu(display("{}", source))]
    LineError { source: channel::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

struct PendingCommand {
    handler: Box<dyn Handler>,
    args: Vec<String>,
}

type Slot = Mutex<Option<Arc<Connection>>>;

// A receiver parked here means its pump is not running.
struct Pumps {
    requests: Option<mpsc::UnboundedReceiver<PendingCommand>>,
    responses: Option<mpsc::UnboundedReceiver<Box<dyn Handler>>>,
}

enum Transmit {
    Sent,
    /// No channel could be had, or the pump was interrupted.
    Abandoned(Box<dyn Handler>),
    Failed(Box<dyn Handler>),
}

fn finish(mut handler: Box<dyn Handler>) {
    if let Err(e) = handler.set_finished() {
        error!("finishing request: {}", e);
    }
}

fn flush<T>(queue: &mut mpsc::UnboundedReceiver<T>, handler: impl Fn(T) -> Box<dyn Handler>) {
    while let Ok(item) = queue.try_recv() {
        finish(handler(item));
    }
}

/// One pipelined session with a dictionary server.
///
/// Commands go out through the request pump in enqueue order, responses
/// come back through the response pump and are matched to handlers strictly
/// in the order their commands were written.
pub struct Connection {
    id: u64,
    runtime: Handle,
    encoder: Arc<dyn CommandEncoder>,
    parser: Arc<dyn ResponseParser>,
    encoding: TextEncoding,
    registry: Weak<Slot>,

    // The mutation lock: opening, writing and tearing down the socket.
    channel: AsyncMutex<LineChannel>,
    state: StateWatch,
    reader: AsyncMutex<Option<LineReader>>,

    closing: AtomicBool,
    notify_shutdown: broadcast::Sender<()>,

    requests: mpsc::UnboundedSender<PendingCommand>,
    in_flight: mpsc::UnboundedSender<Box<dyn Handler>>,
    pumps: Mutex<Pumps>,
}

impl Connection {
    fn new(
        config: &Config,
        encoder: Arc<dyn CommandEncoder>,
        parser: Arc<dyn ResponseParser>,
        runtime: Handle,
        registry: Weak<Slot>,
    ) -> Connection {
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let (in_flight, in_flight_rx) = mpsc::unbounded_channel();
        let (notify_shutdown, _) = broadcast::channel(1);

        let channel = LineChannel::new(config.address(), config.encoding);
        let state = channel.watch();

        Connection {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            runtime,
            encoder,
            parser,
            encoding: config.encoding,
            registry,
            channel: AsyncMutex::new(channel),
            state,
            reader: AsyncMutex::new(None),
            closing: AtomicBool::new(false),
            notify_shutdown,
            requests,
            in_flight,
            pumps: Mutex::new(Pumps {
                requests: Some(requests_rx),
                responses: Some(in_flight_rx),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ChannelState {
        if self.is_closed() {
            ChannelState::Closed
        } else {
            self.state.get()
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn shutdown_listener(&self) -> Shutdown {
        let notify = self.notify_shutdown.subscribe();
        Shutdown::new(notify, self.is_closed())
    }

    /// Queues a command for `handler`. Returns at once; the outcome is
    /// reported through the handler.
    pub fn enqueue<I>(self: &Arc<Self>, handler: Box<dyn Handler>, args: I)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let command = PendingCommand {
            handler,
            args: args.into_iter().map(Into::into).collect(),
        };

        if let Err(mpsc::error::SendError(command)) = self.requests.send(command) {
            finish(command.handler);
            return;
        }

        self.start_request_pump();
    }

    /// Builds a [`Request`] around `exchange` and queues it.
    pub fn request<E, I>(self: &Arc<Self>, args: I, exchange: E) -> Pending<E::Output>
    where
        E: Exchange,
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let (request, pending) = Request::new(exchange);
        self.enqueue(Box::new(request), args);
        pending
    }

    fn start_request_pump(self: &Arc<Self>) {
        let mut pumps = self.pumps.lock();

        if self.is_closed() {
            if let Some(queue) = pumps.requests.as_mut() {
                flush(queue, |command| command.handler);
            }
            return;
        }

        if let Some(queue) = pumps.requests.take() {
            let shutdown = self.shutdown_listener();
            let connection = self.clone();
            self.runtime
                .spawn(async move { connection.run_request_pump(queue, shutdown).await });
        }
    }

    // Caller holds the channel lock, so the connection can not close under us.
    fn start_response_pump(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }

        if let Some(queue) = self.pumps.lock().responses.take() {
            let shutdown = self.shutdown_listener();
            let connection = self.clone();
            self.runtime
                .spawn(async move { connection.run_response_pump(queue, shutdown).await });
        }
    }

    fn encode(&self, args: &[String]) -> Result<Bytes> {
        let line = self.encoder.encode(args).context(CommandSnafu)?;
        debug!("command: {}", line);
        channel::encode_line(self.encoding, &line).context(LineSnafu)
    }

    #[instrument(name = "request_pump", skip_all, fields(connection = self.id))]
    async fn run_request_pump(
        self: Arc<Self>,
        mut queue: mpsc::UnboundedReceiver<PendingCommand>,
        mut shutdown: Shutdown,
    ) {
        info!("request pump starting");

        loop {
            let command = tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("request pump interrupted");
                    break;
                }
                command = queue.recv() => command,
            };

            let Some(PendingCommand { handler, args }) = command else {
                break;
            };
            let is_final = handler.is_final();

            let line = match self.encode(&args) {
                Ok(line) => line,
                Err(e) => {
                    warn!("{}", e);
                    finish(handler);
                    if is_final {
                        break;
                    }
                    continue;
                }
            };

            match self.transmit(&line, handler, &mut shutdown).await {
                Transmit::Sent => {}
                Transmit::Abandoned(handler) => {
                    finish(handler);
                    break;
                }
                Transmit::Failed(handler) => {
                    finish(handler);
                    self.close().await;
                    break;
                }
            }

            if is_final {
                info!("final request sent");
                break;
            }
        }

        // Drain and park atomically so an enqueue racing with this exit
        // either gets drained here or restarts the pump.
        let mut pumps = self.pumps.lock();
        flush(&mut queue, |command| command.handler);
        pumps.requests = Some(queue);
        info!("request pump finished");
    }

    async fn transmit(
        self: &Arc<Self>,
        line: &[u8],
        handler: Box<dyn Handler>,
        shutdown: &mut Shutdown,
    ) -> Transmit {
        let mut channel = self.channel.lock().await;
        if self.is_closed() {
            return Transmit::Abandoned(handler);
        }

        let Some(writer) = channel.writer().await else {
            return Transmit::Abandoned(handler);
        };

        let written = tokio::select! {
            biased;
            _ = shutdown.recv() => None,
            written = writer.write_line(line) => Some(written),
        };

        match written {
            None => Transmit::Abandoned(handler),
            Some(Err(e)) => {
                error!("socket write error: {}", e);
                Transmit::Failed(handler)
            }
            Some(Ok(())) => {
                if let Err(mpsc::error::SendError(handler)) = self.in_flight.send(handler) {
                    return Transmit::Abandoned(handler);
                }
                self.start_response_pump();
                Transmit::Sent
            }
        }
    }

    /// Reads one line from the server, opening the socket if needed.
    ///
    /// Returns `None` at end of stream, after a read error, or once the
    /// connection is closed. Lines taken here never reach the response pump.
    pub async fn read_line(&self) -> Option<String> {
        let mut shutdown = self.shutdown_listener();
        self.next_line(&mut shutdown).await
    }

    async fn next_line(&self, shutdown: &mut Shutdown) -> Option<String> {
        let mut reader = self.reader.lock().await;

        if reader.is_none() {
            if shutdown.is_shutdown() {
                return None;
            }
            *reader = self.channel.lock().await.take_reader().await;
        }
        let reader = reader.as_mut()?;

        loop {
            let read = tokio::select! {
                biased;
                _ = shutdown.recv() => return None,
                read = reader.read_line() => read,
            };

            match read {
                Ok(Some(line)) => return Some(line),
                Ok(None) => {
                    warn!("server disconnected");
                    return None;
                }
                Err(e) if !e.is_fatal() => warn!("{}", e),
                Err(e) => {
                    error!("socket read error: {}", e);
                    return None;
                }
            }
        }
    }

    // Collects a dot-terminated text block.
    async fn read_text(&self, shutdown: &mut Shutdown) -> Option<Vec<String>> {
        let mut lines = Vec::new();
        loop {
            let line = self.next_line(shutdown).await?;
            if line == "." {
                return Some(lines);
            }

            if line.starts_with("..") {
                lines.push(line[1..].to_string());
            } else {
                lines.push(line);
            }
        }
    }

    // Codes that belong to the connection rather than to any request.
    fn handle_connection_response(&self, response: &Response) -> bool {
        if response.code == status::SERVER_BANNER {
            info!("server banner: {}", response.tokens.join(" "));
            return true;
        }
        false
    }

    async fn next_handler(
        &self,
        queue: &mut mpsc::UnboundedReceiver<Box<dyn Handler>>,
    ) -> Option<Box<dyn Handler>> {
        if let Ok(handler) = queue.try_recv() {
            return Some(handler);
        }

        // A response can overtake the hand-off of its handler; the writer
        // holds the channel lock until the hand-off is done.
        let _channel = self.channel.lock().await;
        queue.try_recv().ok()
    }

    #[instrument(name = "response_pump", skip_all, fields(connection = self.id))]
    async fn run_response_pump(
        self: Arc<Self>,
        mut queue: mpsc::UnboundedReceiver<Box<dyn Handler>>,
        mut shutdown: Shutdown,
    ) {
        info!("response pump starting");
        let mut head: Option<Box<dyn Handler>> = None;

        'read: loop {
            let Some(line) = self.next_line(&mut shutdown).await else {
                break;
            };
            info!("response: {}", line);

            let response = match self.parser.parse(&line) {
                Ok(response) => response,
                Err(e) => {
                    warn!("{}", e);
                    continue;
                }
            };

            if self.handle_connection_response(&response) {
                continue;
            }

            if head.is_none() {
                head = self.next_handler(&mut queue).await;
            }
            let Some(handler) = head.as_mut() else {
                warn!("unexpected response, no request handler: {}", line);
                continue;
            };

            let mut disposition = handler.handle_response(&response);
            while disposition == Disposition::Text {
                let Some(lines) = self.read_text(&mut shutdown).await else {
                    break 'read;
                };
                disposition = handler.handle_text(lines);
            }

            if disposition == Disposition::Consumed {
                if let Some(handler) = head.take() {
                    finish(handler);
                }
            }
        }

        info!("response pump finished");
        self.close().await;

        // Nothing enters the in-flight queue once the connection is closed
        // and the channel lock has been released by any writer.
        drop(self.channel.lock().await);

        if let Some(handler) = head.take() {
            finish(handler);
        }
        let mut pumps = self.pumps.lock();
        flush(&mut queue, |handler| handler);
        pumps.responses = Some(queue);
    }

    fn unregister(&self) {
        let Some(slot) = self.registry.upgrade() else {
            return;
        };

        let mut current = slot.lock();
        if current
            .as_ref()
            .map_or(false, |current| std::ptr::eq(Arc::as_ptr(current), self))
        {
            *current = None;
        }
    }

    /// Tears the connection down. Every request still queued or in flight
    /// finishes without a result, and the manager forgets this connection.
    /// Calling it again has no effect.
    pub async fn close(&self) {
        self.unregister();

        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(connection = self.id, "connection closing");

        // wakes pumps blocked on their queue, a read, or a write
        let _ = self.notify_shutdown.send(());

        self.channel.lock().await.teardown().await;
        self.reader.lock().await.take();

        let mut pumps = self.pumps.lock();
        if let Some(queue) = pumps.responses.as_mut() {
            flush(queue, |handler| handler);
        }
        if let Some(queue) = pumps.requests.as_mut() {
            flush(queue, |command| command.handler);
        }
    }
}

/// Hands out the one live [`Connection`], creating it on demand.
pub struct ConnectionManager {
    config: Config,
    encoder: Arc<dyn CommandEncoder>,
    parser: Arc<dyn ResponseParser>,
    current: Arc<Slot>,
}

impl ConnectionManager {
    pub fn new(config: Config) -> ConnectionManager {
        let encoder = Arc::new(QuotingEncoder::new(config.max_line_length));
        ConnectionManager::with_codec(config, encoder, Arc::new(TokenParser))
    }

    pub fn with_codec(
        config: Config,
        encoder: Arc<dyn CommandEncoder>,
        parser: Arc<dyn ResponseParser>,
    ) -> ConnectionManager {
        ConnectionManager {
            config,
            encoder,
            parser,
            current: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The current connection, created if there is none. The socket is
    /// only opened once a command is sent. Must be called from within a
    /// tokio runtime, which then drives the connection's pumps.
    pub fn get(&self) -> Result<Arc<Connection>> {
        let runtime = Handle::try_current().context(RuntimeSnafu)?;

        let mut current = self.current.lock();
        if let Some(connection) = current.as_ref() {
            return Ok(connection.clone());
        }

        let connection = Arc::new(Connection::new(
            &self.config,
            self.encoder.clone(),
            self.parser.clone(),
            runtime,
            Arc::downgrade(&self.current),
        ));
        info!(connection = connection.id(), "connection created");
        *current = Some(connection.clone());
        Ok(connection)
    }

    /// The current connection without creating one.
    pub fn current(&self) -> Option<Arc<Connection>> {
        self.current.lock().clone()
    }

    pub async fn close(&self) {
        let current = self.current.lock().take();
        if let Some(connection) = current {
            connection.close().await;
        }
    }
}
