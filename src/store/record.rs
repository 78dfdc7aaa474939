//! Log record definitions
//!
//! Every mutation is appended to the data log as one frame:
//!
//! ```text
//! ┌───────────┬───────────┬────────────────────────┐
//! │ len (u32) │ crc (u32) │ bincode(Record) (len)  │
//! └───────────┴───────────┴────────────────────────┘
//! ```
//!
//! A frame whose header or payload is cut short, or whose checksum does not
//! match, ends the readable log.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Bytes before the payload: length + checksum
pub const FRAME_HEADER_SIZE: u64 = 8;

/// Refuse frames claiming more than this; a torn length word can read as anything
const MAX_FRAME_PAYLOAD: u32 = 64 << 20;

/// A single logged mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    /// Set a key to a value
    Put {
        seq: u64,
        key: Vec<u8>,
        value: Vec<u8>,
    },

    /// Remove a key
    Delete { seq: u64, key: Vec<u8> },
}

impl Record {
    pub fn seq(&self) -> u64 {
        match self {
            Record::Put { seq, .. } | Record::Delete { seq, .. } => *seq,
        }
    }

    pub fn key(&self) -> &[u8] {
        match self {
            Record::Put { key, .. } | Record::Delete { key, .. } => key,
        }
    }

    /// Serialize into a complete frame
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let payload = bincode::serialize(self)?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE as usize + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Read and verify the frame at `offset`
    pub fn read_at(file: &mut File, offset: u64) -> Result<Self, StoreError> {
        file.seek(SeekFrom::Start(offset))?;
        match read_frame(file)? {
            FrameRead::Record(record, _) => Ok(record),
            FrameRead::End => Err(StoreError::Corruption(format!(
                "no record at offset {}",
                offset
            ))),
            FrameRead::Torn(reason) => Err(StoreError::Corruption(format!(
                "record at offset {}: {}",
                offset, reason
            ))),
        }
    }
}

/// A record located in a log file
#[derive(Debug)]
pub struct LoggedRecord {
    pub offset: u64,
    pub frame_len: u64,
    pub record: Record,
}

/// Result of scanning a log file
#[derive(Debug)]
pub struct LogScan {
    pub records: Vec<LoggedRecord>,

    /// Length of the readable prefix
    pub valid_len: u64,

    /// Why reading stopped before the end of the file, if it did
    pub torn: Option<String>,
}

/// Read every intact frame from the start of `path`
pub fn scan_log(path: &Path) -> Result<LogScan, StoreError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    let mut offset = 0u64;

    let torn = loop {
        match read_frame(&mut reader)? {
            FrameRead::Record(record, frame_len) => {
                records.push(LoggedRecord {
                    offset,
                    frame_len,
                    record,
                });
                offset += frame_len;
            }
            FrameRead::End => break None,
            FrameRead::Torn(reason) => break Some(reason),
        }
    };

    Ok(LogScan {
        records,
        valid_len: offset,
        torn,
    })
}

enum FrameRead {
    Record(Record, u64),
    End,
    Torn(String),
}

fn read_frame(reader: &mut impl Read) -> Result<FrameRead, StoreError> {
    let mut header = [0u8; FRAME_HEADER_SIZE as usize];
    match read_full(reader, &mut header)? {
        0 => return Ok(FrameRead::End),
        n if n < header.len() => {
            return Ok(FrameRead::Torn(format!("partial frame header ({} bytes)", n)))
        }
        _ => {}
    }

    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_FRAME_PAYLOAD {
        return Ok(FrameRead::Torn(format!("implausible frame length {}", len)));
    }

    let mut payload = vec![0u8; len as usize];
    let read = read_full(reader, &mut payload)?;
    if read < payload.len() {
        return Ok(FrameRead::Torn(format!(
            "partial payload ({} of {} bytes)",
            read, len
        )));
    }
    if crc32fast::hash(&payload) != crc {
        return Ok(FrameRead::Torn("checksum mismatch".to_string()));
    }

    match bincode::deserialize::<Record>(&payload) {
        Ok(record) => Ok(FrameRead::Record(record, FRAME_HEADER_SIZE + len as u64)),
        Err(e) => Ok(FrameRead::Torn(format!("undecodable record: {}", e))),
    }
}

/// Fill `buf` as far as the reader allows, returning the bytes read
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize, StoreError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn put(seq: u64, key: &str, value: &str) -> Record {
        Record::Put {
            seq,
            key: key.as_bytes().to_vec(),
            value: value.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_scan_reads_frames_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        let mut file = File::create(&path).unwrap();
        file.write_all(&put(1, "a", "1").encode().unwrap()).unwrap();
        file.write_all(
            &Record::Delete {
                seq: 2,
                key: b"a".to_vec(),
            }
            .encode()
            .unwrap(),
        )
        .unwrap();
        drop(file);

        let scan = scan_log(&path).unwrap();
        assert!(scan.torn.is_none());
        assert_eq!(scan.records.len(), 2);
        assert_eq!(scan.records[1].record.seq(), 2);
        assert_eq!(scan.valid_len, std::fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn test_scan_stops_at_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        let first = put(1, "a", "1").encode().unwrap();
        let second = put(2, "b", "2").encode().unwrap();

        let mut file = File::create(&path).unwrap();
        file.write_all(&first).unwrap();
        file.write_all(&second[..second.len() - 3]).unwrap();
        drop(file);

        let scan = scan_log(&path).unwrap();
        assert_eq!(scan.records.len(), 1);
        assert_eq!(scan.valid_len, first.len() as u64);
        assert!(scan.torn.is_some());
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        let mut frame = put(1, "key", "value").encode().unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        std::fs::write(&path, &frame).unwrap();

        let scan = scan_log(&path).unwrap();
        assert!(scan.records.is_empty());
        assert_eq!(scan.torn.as_deref(), Some("checksum mismatch"));

        let mut file = File::open(&path).unwrap();
        assert!(matches!(
            Record::read_at(&mut file, 0),
            Err(StoreError::Corruption(_))
        ));
    }
}
