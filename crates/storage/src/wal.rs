//! Append-only write-ahead log.
//!
//! Each record is `[crc32 LE][len LE][json payload]\n`. Replay returns every
//! record up to the first truncated or corrupt one and ignores the rest.

use crate::record::WalRecord;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("WAL I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("WAL serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// When the log is forced to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// After every append.
    Always,
    /// Only when the owner calls `sync`.
    Batch,
    /// Never; the OS decides.
    None,
}

impl FsyncPolicy {
    /// Parse a config string. Unknown values fall back to `Batch`.
    pub fn from_str_config(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "always" => Self::Always,
            "none" => Self::None,
            _ => Self::Batch,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::Batch => "batch",
            Self::None => "none",
        }
    }
}

fn encode(record: &WalRecord) -> Result<Vec<u8>, WalError> {
    let payload = serde_json::to_vec(record)?;
    let mut buf = Vec::with_capacity(payload.len() + 9);
    buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    buf.push(b'\n');
    Ok(buf)
}

/// Fill `buf` completely. `Ok(false)` means the file ended first.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

#[derive(Debug)]
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    fsync: FsyncPolicy,
    appended: u64,
}

impl Wal {
    /// Open or create the log at `path` for appending.
    pub fn open(path: &Path, fsync: FsyncPolicy) -> Result<Self, WalError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            fsync,
            appended: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, record: &WalRecord) -> Result<(), WalError> {
        self.writer.write_all(&encode(record)?)?;
        self.writer.flush()?;
        if self.fsync == FsyncPolicy::Always {
            self.writer.get_ref().sync_data()?;
        }
        self.appended += 1;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Records appended since this handle was opened.
    pub fn appended(&self) -> u64 {
        self.appended
    }

    /// Read back every intact record in write order.
    pub fn replay(path: &Path) -> Result<Vec<WalRecord>, WalError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();

        loop {
            let mut header = [0u8; 8];
            if !fill(&mut reader, &mut header)? {
                break;
            }
            let crc = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;

            let mut payload = vec![0u8; len + 1];
            if !fill(&mut reader, &mut payload)? {
                tracing::warn!(record = records.len(), "WAL truncated mid-record; stopping replay");
                break;
            }
            payload.pop();

            let actual = crc32fast::hash(&payload);
            if actual != crc {
                tracing::warn!(
                    record = records.len(),
                    expected = format_args!("{crc:#010x}"),
                    actual = format_args!("{actual:#010x}"),
                    "WAL checksum mismatch; stopping replay"
                );
                break;
            }
            match serde_json::from_slice::<WalRecord>(&payload) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(record = records.len(), error = %e, "undecodable WAL record; stopping replay");
                    break;
                }
            }
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardkv_common::{Entry, VClock};
    use tempfile::TempDir;

    fn record(key: &str, value: &str) -> WalRecord {
        let clock = VClock::new().increment("n1");
        WalRecord::new(key, Entry::live(value.as_bytes().to_vec(), 1, clock, 42))
    }

    #[test]
    fn test_append_and_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        {
            let mut wal = Wal::open(&path, FsyncPolicy::Always).unwrap();
            for k in ["k1", "k2", "k3"] {
                wal.append(&record(k, "v")).unwrap();
            }
            assert_eq!(wal.appended(), 3);
        }
        let records = Wal::replay(&path).unwrap();
        let keys: Vec<_> = records.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["k1", "k2", "k3"]);
        assert_eq!(records[0], record("k1", "v"));
    }

    #[test]
    fn test_replay_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(Wal::replay(&dir.path().join("absent.log")).unwrap().is_empty());
    }

    #[test]
    fn test_replay_stops_at_truncated_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        {
            let mut wal = Wal::open(&path, FsyncPolicy::None).unwrap();
            for k in ["k1", "k2", "k3"] {
                wal.append(&record(k, "v")).unwrap();
            }
        }
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        let len = file.metadata().unwrap().len();
        file.set_len(len - 4).unwrap();

        let records = Wal::replay(&path).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_replay_stops_at_corrupt_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        {
            let mut wal = Wal::open(&path, FsyncPolicy::None).unwrap();
            wal.append(&record("k1", "v")).unwrap();
            wal.append(&record("k2", "v")).unwrap();
        }
        // Flip a payload byte of the second record.
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 3;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let records = Wal::replay(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "k1");
    }

    #[test]
    fn test_tombstone_survives_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        let tomb = WalRecord::new("k", Entry::tombstone(2, VClock::new().increment("a"), 7));
        {
            let mut wal = Wal::open(&path, FsyncPolicy::Batch).unwrap();
            wal.append(&tomb).unwrap();
            wal.sync().unwrap();
        }
        let records = Wal::replay(&path).unwrap();
        assert!(records[0].entry.tombstone);
        assert_eq!(records[0], tomb);
    }

    #[test]
    fn test_fsync_policy_parse() {
        assert_eq!(FsyncPolicy::from_str_config("Always"), FsyncPolicy::Always);
        assert_eq!(FsyncPolicy::from_str_config("none"), FsyncPolicy::None);
        assert_eq!(FsyncPolicy::from_str_config("whatever"), FsyncPolicy::Batch);
        assert_eq!(FsyncPolicy::Batch.as_str(), "batch");
    }
}
