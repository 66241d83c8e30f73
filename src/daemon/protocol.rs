//! Control protocol between clients and the tunnel daemon
//!
//! Every exchange is a single TCP connection carrying exactly one request byte
//! from the client and at most one reply byte from the daemon.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Wire byte for a tunnel request
pub const CONNECT_BYTE: u8 = b'C';

/// Wire byte for a tunnel release
pub const DISCONNECT_BYTE: u8 = b'D';

/// Wire byte sent when a `Connect` could not be honoured
pub const FAILED_BYTE: u8 = b'E';

/// Errors produced while reading or writing control messages
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed before a message byte arrived")]
    Closed,

    #[error("Unknown message byte: {0:#04x}")]
    UnknownByte(u8),
}

/// Requests sent from a client to the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Request {
    /// Client needs the tunnel
    Connect,
    /// Client is done with the tunnel
    Disconnect,
}

impl Request {
    /// The byte this request is sent as
    pub fn as_byte(self) -> u8 {
        match self {
            Request::Connect => CONNECT_BYTE,
            Request::Disconnect => DISCONNECT_BYTE,
        }
    }

    /// Decode a request byte
    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            CONNECT_BYTE => Ok(Request::Connect),
            DISCONNECT_BYTE => Ok(Request::Disconnect),
            other => Err(ProtocolError::UnknownByte(other)),
        }
    }
}

impl TryFrom<u8> for Request {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Self::from_byte(byte)
    }
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Request::Connect => write!(f, "connect"),
            Request::Disconnect => write!(f, "disconnect"),
        }
    }
}

/// Replies sent from the daemon to a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// The requested transition completed; echoes the request byte
    Ack(Request),
    /// The tunnel could not be brought up
    Failed,
}

impl Reply {
    /// The byte this reply is sent as
    pub fn as_byte(self) -> u8 {
        match self {
            Reply::Ack(request) => request.as_byte(),
            Reply::Failed => FAILED_BYTE,
        }
    }

    /// Decode a reply byte
    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            FAILED_BYTE => Ok(Reply::Failed),
            other => Request::from_byte(other).map(Reply::Ack),
        }
    }

    /// Whether this reply acknowledges the given request
    pub fn acknowledges(self, request: Request) -> bool {
        self == Reply::Ack(request)
    }
}

/// Read exactly one request byte from a control connection
pub async fn read_request<R>(reader: &mut R) -> Result<Request, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    Request::from_byte(read_byte(reader).await?)
}

/// Read exactly one reply byte from a control connection
pub async fn read_reply<R>(reader: &mut R) -> Result<Reply, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    Reply::from_byte(read_byte(reader).await?)
}

/// Write a request byte and flush
pub async fn write_request<W>(writer: &mut W, request: Request) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    write_byte(writer, request.as_byte()).await
}

/// Write a reply byte and flush
pub async fn write_reply<W>(writer: &mut W, reply: Reply) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    write_byte(writer, reply.as_byte()).await
}

async fn read_byte<R>(reader: &mut R) -> Result<u8, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 1];
    match reader.read(&mut buf).await? {
        0 => Err(ProtocolError::Closed),
        _ => Ok(buf[0]),
    }
}

async fn write_byte<W>(writer: &mut W, byte: u8) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&[byte]).await?;
    writer.flush().await?;
    Ok(())
}
