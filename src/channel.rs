use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use snafu::{prelude::*, ResultExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{error, info, warn};

use crate::codec::TERMINATOR;
use crate::config::{self, TextEncoding};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("connection reset by peer"))]
    ResetError,
    #[snafu(display("failed for io error {}", source))]
    IoError { source: io::Error },
    #[snafu(display("failed to encode command: {}", source))]
    EncodeError { source: config::Error },
    #[snafu(display("response line is not valid {}: {:?}", encoding, line))]
    DecodeError { encoding: &'static str, line: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the error leaves the stream itself unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ResetError | Error::IoError { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unconnected,
    Connecting,
    Open,
    Closed,
}

/// Lock free view of a channel's state, readable while the channel itself
/// is locked by a connect or a write.
#[derive(Debug, Clone)]
pub struct StateWatch(Arc<AtomicU8>);

impl StateWatch {
    fn new(state: ChannelState) -> StateWatch {
        StateWatch(Arc::new(AtomicU8::new(state as u8)))
    }

    fn set(&self, state: ChannelState) {
        self.0.store(state as u8, Ordering::Release);
    }

    pub fn get(&self) -> ChannelState {
        match self.0.load(Ordering::Acquire) {
            0 => ChannelState::Unconnected,
            1 => ChannelState::Connecting,
            2 => ChannelState::Open,
            _ => ChannelState::Closed,
        }
    }
}

/// Appends the line terminator and converts to the wire encoding.
pub fn encode_line(encoding: TextEncoding, line: &str) -> Result<Bytes> {
    let text = encoding.encode(line).context(EncodeSnafu)?;
    let mut buf = BytesMut::with_capacity(text.len() + TERMINATOR.len());
    buf.extend_from_slice(&text);
    buf.extend_from_slice(TERMINATOR.as_bytes());
    Ok(buf.freeze())
}

#[derive(Debug)]
pub struct LineReader {
    stream: OwnedReadHalf,
    encoding: TextEncoding,
    buffer: BytesMut,
}

impl LineReader {
    pub fn new(stream: OwnedReadHalf, encoding: TextEncoding) -> LineReader {
        LineReader {
            stream,
            encoding,
            buffer: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// `Ok(None)` means the peer closed the stream on a line boundary.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(line) = self.parse_line()? {
                return Ok(Some(line));
            }

            let len = self
                .stream
                .read_buf(&mut self.buffer)
                .await
                .context(IoSnafu)?;

            if 0 == len {
                if self.buffer.is_empty() {
                    return Ok(None);
                } else {
                    return ResetSnafu.fail();
                }
            }
        }
    }

    fn parse_line(&mut self) -> Result<Option<String>> {
        let end = match self.buffer.iter().position(|&b| b == b'\n') {
            Some(end) => end,
            None => return Ok(None),
        };

        let mut raw = self.buffer.split_to(end + 1);
        raw.truncate(end);
        if raw.last() == Some(&b'\r') {
            raw.truncate(end - 1);
        }

        match self.encoding.decode(raw.chunk()) {
            Some(line) => Ok(Some(line)),
            None => DecodeSnafu {
                encoding: self.encoding.name(),
                line: String::from_utf8_lossy(raw.chunk()).into_owned(),
            }
            .fail(),
        }
    }
}

#[derive(Debug)]
pub struct LineWriter {
    stream: BufWriter<OwnedWriteHalf>,
}

impl LineWriter {
    pub fn new(stream: OwnedWriteHalf) -> LineWriter {
        LineWriter {
            stream: BufWriter::new(stream),
        }
    }

    /// `line` must already carry the terminator, see [`encode_line`].
    pub async fn write_line(&mut self, line: &[u8]) -> Result<()> {
        self.stream.write_all(line).await.context(IoSnafu)?;
        self.stream.flush().await.context(IoSnafu)?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await.context(IoSnafu)
    }
}

/// The socket behind a connection, opened on first use.
///
/// Once a socket has been opened and torn down the channel stays `Closed`;
/// a fresh connection is needed to talk to the server again.
#[derive(Debug)]
pub struct LineChannel {
    address: String,
    encoding: TextEncoding,
    state: StateWatch,
    writer: Option<LineWriter>,
    reader: Option<LineReader>,
}

impl LineChannel {
    pub fn new(address: String, encoding: TextEncoding) -> LineChannel {
        LineChannel {
            address,
            encoding,
            state: StateWatch::new(ChannelState::Unconnected),
            writer: None,
            reader: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state.get()
    }

    pub fn watch(&self) -> StateWatch {
        self.state.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    // Returns false when there is no channel to use right now.
    async fn open(&mut self) -> bool {
        match self.state() {
            ChannelState::Open => return true,
            ChannelState::Closed => return false,
            ChannelState::Unconnected | ChannelState::Connecting => {}
        }

        self.state.set(ChannelState::Connecting);
        info!("client connecting to {}", self.address);

        match TcpStream::connect(&self.address).await {
            Ok(socket) => {
                let (read, write) = socket.into_split();
                self.reader = Some(LineReader::new(read, self.encoding));
                self.writer = Some(LineWriter::new(write));
                self.state.set(ChannelState::Open);
                info!("client connected to {}", self.address);
                true
            }
            Err(e) => {
                // a later attempt may succeed
                self.state.set(ChannelState::Unconnected);
                error!("client connect error: {}", e);
                false
            }
        }
    }

    pub async fn writer(&mut self) -> Option<&mut LineWriter> {
        if !self.open().await {
            return None;
        }
        self.writer.as_mut()
    }

    /// Hands the read half out; it can be taken once per socket.
    pub async fn take_reader(&mut self) -> Option<LineReader> {
        if !self.open().await {
            return None;
        }
        self.reader.take()
    }

    pub async fn teardown(&mut self) {
        let was_open = match self.state() {
            ChannelState::Closed => return,
            state => state == ChannelState::Open,
        };
        self.state.set(ChannelState::Closed);
        self.reader = None;

        if let Some(mut writer) = self.writer.take() {
            info!("client disconnecting");
            if let Err(e) = writer.shutdown().await {
                warn!("writer close error: {}", e);
            }
        }

        if was_open {
            info!("client disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn ts_on_encode_line() {
        let line = encode_line(TextEncoding::Utf8, "DEFINE wn hello").unwrap();
        assert_eq!(&line[..], b"DEFINE wn hello\r\n");

        assert!(encode_line(TextEncoding::Latin1, "DEFINE * €").is_err());
    }

    #[tokio::test]
    async fn ts_on_read_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"220 hel").await.unwrap();
            socket.flush().await.unwrap();
            socket.write_all(b"lo\r\n250 ok\n\xff\r\n.\r\ntail").await.unwrap();
        });

        let mut channel = LineChannel::new(addr.to_string(), TextEncoding::Utf8);
        assert_eq!(channel.state(), ChannelState::Unconnected);

        let mut reader = channel.take_reader().await.unwrap();
        assert_eq!(channel.state(), ChannelState::Open);
        assert!(channel.take_reader().await.is_none());

        assert_eq!(reader.read_line().await.unwrap().unwrap(), "220 hello");
        assert_eq!(reader.read_line().await.unwrap().unwrap(), "250 ok");

        let err = reader.read_line().await.unwrap_err();
        assert!(!err.is_fatal());

        assert_eq!(reader.read_line().await.unwrap().unwrap(), ".");

        let err = reader.read_line().await.unwrap_err();
        assert!(matches!(err, Error::ResetError));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn ts_on_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut channel = LineChannel::new(addr.to_string(), TextEncoding::Utf8);
        assert!(channel.writer().await.is_none());
        assert_eq!(channel.state(), ChannelState::Unconnected);

        channel.teardown().await;
        assert!(channel.is_closed());
        assert!(channel.writer().await.is_none());
    }
}
