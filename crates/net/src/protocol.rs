//! Wire format of the peer protocol.
//!
//! A request is the ASCII command name and `\n`, followed (for commands that
//! carry one) by a frame: a 4-byte big-endian length and that many bytes of
//! bincode. Replies use the same frame. One connection may carry several
//! requests back to back.

use crate::error::NetError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shardkv_common::VClock;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame accepted in either direction.
pub const MAX_FRAME: usize = 64 << 20;

/// Longest command line read before giving up on the connection.
const MAX_COMMAND_LINE: u64 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// TimeDigest in, pruned TimeDigest out.
    Time,
    /// EntryBatch in, no reply.
    Entry,
    /// ShardSnapshot in, no reply.
    Shard,
    /// No payload, no reply.
    Help,
    Contains,
    Get,
    Put,
    Delete,
}

impl Command {
    pub const ALL: [Command; 8] = [
        Command::Time,
        Command::Entry,
        Command::Shard,
        Command::Help,
        Command::Contains,
        Command::Get,
        Command::Put,
        Command::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Time => "time",
            Command::Entry => "entry",
            Command::Shard => "shard",
            Command::Help => "help",
            Command::Contains => "contains",
            Command::Get => "get",
            Command::Put => "put",
            Command::Delete => "delete",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }

    pub fn has_payload(&self) -> bool {
        !matches!(self, Command::Help)
    }

    pub fn expects_reply(&self) -> bool {
        !matches!(self, Command::Entry | Command::Shard | Command::Help)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Single-key payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainsRequest {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainsResponse {
    pub alive: bool,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRequest {
    pub key: String,
    /// Causal context the caller already holds.
    pub clock: VClock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetResponse {
    /// `None` if the key is absent or deleted.
    pub value: Option<Vec<u8>>,
    pub clock: VClock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutRequest {
    pub key: String,
    pub value: Vec<u8>,
    pub clock: VClock,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutResponse {
    pub applied: bool,
    /// The key held a live value before this write.
    pub replaced: bool,
    pub clock: VClock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub key: String,
    pub clock: VClock,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub applied: bool,
    pub clock: VClock,
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, NetError> {
    Ok(bincode::serialize(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, NetError> {
    Ok(bincode::deserialize(bytes)?)
}

pub async fn write_command<W: AsyncWrite + Unpin>(w: &mut W, cmd: Command) -> Result<(), NetError> {
    w.write_all(cmd.as_str().as_bytes()).await?;
    w.write_all(b"\n").await?;
    Ok(())
}

/// Read one command line. `Ok(None)` on a clean EOF between requests.
pub async fn read_command<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<Option<String>, NetError> {
    let mut line = Vec::new();
    let n = (&mut *r).take(MAX_COMMAND_LINE).read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    if line.pop() != Some(b'\n') {
        return Err(NetError::UnknownCommand(
            String::from_utf8_lossy(&line).into_owned(),
        ));
    }
    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> Result<(), NetError> {
    if payload.len() > MAX_FRAME {
        return Err(NetError::FrameTooLarge(payload.len()));
    }
    w.write_u32(payload.len() as u32).await?;
    w.write_all(payload).await?;
    Ok(())
}

pub async fn read_frame<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<Vec<u8>, NetError> {
    let len = match r.read_u32().await {
        Ok(n) => n as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(NetError::Closed),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME {
        return Err(NetError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardkv_common::TimeDigest;
    use tokio::io::BufReader;

    #[test]
    fn test_command_names() {
        for cmd in Command::ALL {
            assert_eq!(Command::parse(cmd.as_str()), Some(cmd));
        }
        assert_eq!(Command::parse("GET"), None);
        assert!(!Command::Help.has_payload());
        assert!(Command::Time.expects_reply());
        assert!(!Command::Entry.expects_reply());
    }

    #[tokio::test]
    async fn test_request_layout() {
        let mut digest = TimeDigest::new();
        digest.insert("k".into(), 7);
        let payload = encode(&digest).unwrap();

        let mut wire = Vec::new();
        write_command(&mut wire, Command::Time).await.unwrap();
        write_frame(&mut wire, &payload).await.unwrap();

        assert!(wire.starts_with(b"time\n"));
        assert_eq!(&wire[5..9], &(payload.len() as u32).to_be_bytes());

        let mut reader = BufReader::new(wire.as_slice());
        assert_eq!(read_command(&mut reader).await.unwrap().as_deref(), Some("time"));
        let back: TimeDigest = decode(&read_frame(&mut reader).await.unwrap()).unwrap();
        assert_eq!(back, digest);
        assert_eq!(read_command(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&((MAX_FRAME as u32) + 1).to_be_bytes());
        let mut reader = BufReader::new(wire.as_slice());
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(NetError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_runaway_command_line_rejected() {
        let wire = vec![b'x'; 100];
        let mut reader = BufReader::new(wire.as_slice());
        assert!(matches!(
            read_command(&mut reader).await,
            Err(NetError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_payload_codec() {
        let req = PutRequest {
            key: "k".into(),
            value: b"v".to_vec(),
            clock: VClock::new().increment("a"),
            timestamp: 9,
        };
        let back: PutRequest = decode(&encode(&req).unwrap()).unwrap();
        assert_eq!(back, req);
        assert!(decode::<PutRequest>(&[1, 2]).is_err());
    }
}
