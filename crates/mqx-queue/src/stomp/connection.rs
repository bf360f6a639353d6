use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::debug;

use super::frame::{Command, Frame, DEFAULT_MAX_FRAME_SIZE};
use crate::{QueueError, Result};

/// Connection settings for a STOMP broker.
#[derive(Debug, Clone)]
pub struct StompSettings {
    /// `host:port` of the broker
    pub address: String,
    /// Value of the `host` header; the virtual host on most brokers
    pub virtual_host: String,
    pub login: Option<String>,
    pub passcode: Option<String>,
    /// Largest frame accepted from the broker
    pub max_frame_size: usize,
}

impl StompSettings {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            virtual_host: "/".to_string(),
            login: None,
            passcode: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_virtual_host(mut self, virtual_host: impl Into<String>) -> Self {
        self.virtual_host = virtual_host.into();
        self
    }

    pub fn with_credentials(mut self, login: impl Into<String>, passcode: impl Into<String>) -> Self {
        self.login = Some(login.into());
        self.passcode = Some(passcode.into());
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }
}

impl Default for StompSettings {
    fn default() -> Self {
        Self::new("127.0.0.1:61613")
    }
}

/// Server details from the CONNECTED frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerInfo {
    pub version: Option<String>,
    pub server: Option<String>,
    pub session: Option<String>,
}

/// A framed STOMP connection over any byte stream.
pub struct StompConnection<S> {
    stream: BufWriter<S>,
    buffer: BytesMut,
    max_frame_size: usize,
    // Set after a malformed frame; input is dropped up to the next NUL.
    discarding: bool,
}

impl StompConnection<TcpStream> {
    /// Open a TCP connection and complete the STOMP handshake.
    pub async fn connect(settings: &StompSettings) -> Result<(Self, ServerInfo)> {
        let tcp_stream = TcpStream::connect(&settings.address)
            .await
            .map_err(|e| QueueError::Connection(format!("{}: {}", settings.address, e)))?;
        let mut connection = StompConnection::new(tcp_stream).with_max_frame_size(settings.max_frame_size);
        let info = connection.handshake(settings).await?;
        Ok((connection, info))
    }
}

impl<S> StompConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufWriter::new(stream),
            buffer: BytesMut::with_capacity(64 * 1024),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            discarding: false,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Send CONNECT and wait for CONNECTED.
    pub async fn handshake(&mut self, settings: &StompSettings) -> Result<ServerInfo> {
        let mut connect = Frame::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", settings.virtual_host.as_str())
            .header("heart-beat", "0,0");
        if let Some(login) = &settings.login {
            connect.push_header("login", login.as_str());
        }
        if let Some(passcode) = &settings.passcode {
            connect.push_header("passcode", passcode.as_str());
        }
        self.write_frame(&connect).await?;

        let frame = self
            .read_frame()
            .await?
            .ok_or_else(|| QueueError::ConnectionClosed("closed during STOMP handshake".to_string()))?;
        match frame.command {
            Command::Connected => {
                let info = ServerInfo {
                    version: frame.get_header("version").map(str::to_string),
                    server: frame.get_header("server").map(str::to_string),
                    session: frame.get_header("session").map(str::to_string),
                };
                debug!(version = ?info.version, server = ?info.server, "STOMP session established");
                Ok(info)
            }
            Command::Error => Err(QueueError::Protocol(error_text(&frame))),
            other => Err(QueueError::Protocol(format!(
                "expected CONNECTED, broker sent {}",
                other
            ))),
        }
    }

    /// Read the next frame. `Ok(None)` means the peer closed cleanly.
    ///
    /// A malformed or oversized frame is reported once as
    /// [`QueueError::Protocol`]; its bytes are skipped up to the next NUL and
    /// the following call resumes with the frame after it.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if self.discarding {
                self.discard_to_nul();
            }
            if !self.discarding {
                if let Some(frame) = self.parse_frame()? {
                    return Ok(Some(frame));
                }
                if self.buffer.len() > self.max_frame_size {
                    self.discarding = true;
                    return Err(QueueError::Protocol(format!(
                        "frame exceeds the {} byte frame limit",
                        self.max_frame_size
                    )));
                }
            }

            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                if self.discarding || !self.buffer.iter().all(|b| *b == b'\n' || *b == b'\r') {
                    return Err(QueueError::ConnectionClosed(
                        "connection reset in the middle of a frame".to_string(),
                    ));
                }
                return Ok(None);
            }
        }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.stream.write_all(&frame.encode()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Send DISCONNECT and shut the stream down. Errors are ignored.
    pub async fn disconnect(&mut self) {
        let _ = self.write_frame(&Frame::new(Command::Disconnect)).await;
        let _ = self.stream.shutdown().await;
    }

    fn parse_frame(&mut self) -> Result<Option<Frame>> {
        match Frame::parse_with_limit(&self.buffer[..], self.max_frame_size) {
            Ok(Some((frame, len))) => {
                self.buffer.advance(len);
                Ok(Some(frame))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.discarding = true;
                Err(e)
            }
        }
    }

    fn discard_to_nul(&mut self) {
        match self.buffer.iter().position(|b| *b == 0) {
            Some(offset) => {
                self.buffer.advance(offset + 1);
                self.discarding = false;
            }
            None => self.buffer.clear(),
        }
    }
}

/// Text of an ERROR frame: the `message` header plus the body, if any.
pub(crate) fn error_text(frame: &Frame) -> String {
    let summary = frame.get_header("message").unwrap_or("broker error");
    let body = String::from_utf8_lossy(&frame.body);
    let body = body.trim();
    if body.is_empty() {
        summary.to_string()
    } else {
        format!("{}: {}", summary, body)
    }
}
