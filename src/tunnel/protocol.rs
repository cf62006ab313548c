//! Length-prefixed binary frame codec for the tunnel control channel (§6).
//!
//! Frame: `u32 length | u8 kind | payload`, network byte order. `length`
//! counts the kind byte plus the JSON payload that follows it.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Result};

pub const PROTOCOL_VERSION: u32 = 1;
const MAX_FRAME_BYTES: u32 = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Kind {
    Hello = 1,
    HelloAck = 2,
    Auth = 3,
    AuthAck = 4,
    RegisterService = 5,
    RegisterServiceAck = 6,
    UnregisterService = 7,
    Heartbeat = 8,
    HeartbeatAck = 9,
    OpenStream = 10,
    Data = 11,
    CloseStream = 12,
    ErrorFrame = 13,
}

impl TryFrom<u8> for Kind {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        Ok(match v {
            1 => Kind::Hello,
            2 => Kind::HelloAck,
            3 => Kind::Auth,
            4 => Kind::AuthAck,
            5 => Kind::RegisterService,
            6 => Kind::RegisterServiceAck,
            7 => Kind::UnregisterService,
            8 => Kind::Heartbeat,
            9 => Kind::HeartbeatAck,
            10 => Kind::OpenStream,
            11 => Kind::Data,
            12 => Kind::CloseStream,
            13 => Kind::ErrorFrame,
            other => return Err(Error::protocol(format!("unknown frame kind {other}"))),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub client_id: String,
    pub version: u32,
    pub os: String,
    pub declared_ip: String,
    pub mac: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloAck {
    pub server_version: u32,
    pub accepted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auth {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthAck {
    pub ok: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Tcp,
    Udp,
    Http,
    Https,
    Stcp,
    Sudp,
    Xtcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterService {
    pub service_id: String,
    pub kind: ServiceKind,
    pub local_port: u16,
    pub remote_port: Option<u16>,
    pub subdomain: Option<String>,
    pub custom_domain: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterServiceAck {
    pub service_id: String,
    pub ok: bool,
    pub remote_port: Option<u16>,
    pub vhost: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterService {
    pub service_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenStream {
    pub stream_id: u64,
    pub service_id: String,
    pub remote_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataHeader {
    pub stream_id: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Eof,
    Error,
    Timeout,
    ClientRequested,
    ServerRequested,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseStream {
    pub stream_id: u64,
    pub reason: CloseReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub code: String,
    pub msg: String,
}

pub async fn write_json_frame<W: AsyncWrite + Unpin, P: Serialize>(writer: &mut W, kind: Kind, payload: &P) -> Result<()> {
    let body = serde_json::to_vec(payload)?;
    write_frame(writer, kind, &body).await
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, kind: Kind, body: &[u8]) -> Result<()> {
    let len = (body.len() + 1) as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&[kind as u8]).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Writes a `DATA` frame: stream id followed by raw bytes, so relaying
/// bulk payload never pays JSON (de)serialization cost.
pub async fn write_data_frame<W: AsyncWrite + Unpin>(writer: &mut W, stream_id: u64, chunk: &[u8]) -> Result<()> {
    let len = (8 + chunk.len() + 1) as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&[Kind::Data as u8]).await?;
    writer.write_all(&stream_id.to_be_bytes()).await?;
    writer.write_all(chunk).await?;
    writer.flush().await?;
    Ok(())
}

pub struct RawFrame {
    pub kind: Kind,
    pub body: Vec<u8>,
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<RawFrame> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len == 0 || len > MAX_FRAME_BYTES {
        return Err(Error::protocol(format!("frame length {len} out of bounds")));
    }
    let mut kind_buf = [0u8; 1];
    reader.read_exact(&mut kind_buf).await?;
    let kind = Kind::try_from(kind_buf[0])?;
    let mut body = vec![0u8; (len - 1) as usize];
    reader.read_exact(&mut body).await?;
    Ok(RawFrame { kind, body })
}

pub fn decode_data_frame(body: &[u8]) -> Result<(u64, &[u8])> {
    if body.len() < 8 {
        return Err(Error::protocol("data frame shorter than stream id"));
    }
    let stream_id = u64::from_be_bytes(body[..8].try_into().unwrap());
    Ok((stream_id, &body[8..]))
}

pub fn decode_json<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_hello_frame() {
        let mut buf = Vec::new();
        write_json_frame(&mut buf, Kind::Hello, &Hello {
            client_id: "c1".into(),
            version: PROTOCOL_VERSION,
            os: "linux".into(),
            declared_ip: "10.0.0.5".into(),
            mac: None,
        }).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let frame = read_frame(&mut cursor).await.unwrap();
        assert_eq!(frame.kind, Kind::Hello);
        let hello: Hello = decode_json(&frame.body).unwrap();
        assert_eq!(hello.client_id, "c1");
    }

    #[tokio::test]
    async fn round_trips_data_frame() {
        let mut buf = Vec::new();
        write_data_frame(&mut buf, 42, b"PING\n").await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let frame = read_frame(&mut cursor).await.unwrap();
        assert_eq!(frame.kind, Kind::Data);
        let (stream_id, chunk) = decode_data_frame(&frame.body).unwrap();
        assert_eq!(stream_id, 42);
        assert_eq!(chunk, b"PING\n");
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_BYTES + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor).await.is_err());
    }
}
