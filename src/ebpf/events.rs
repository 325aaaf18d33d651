//! Decoding of ring buffer records into [`FcntlEvent`]s and their display forms

use hooktail_common::{FcntlEvent, COMM_LEN};
use serde::Serialize;
use thiserror::Error;

/// Size of one encoded record: comm + pid + tgid
pub const EVENT_SIZE: usize = COMM_LEN + 4 + 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed event: expected {expected} bytes, got {actual} bytes")]
    SizeMismatch { expected: usize, actual: usize },
}

/// Decode one little-endian record in field order comm, pid, tgid
pub fn decode_event(data: &[u8]) -> Result<FcntlEvent, DecodeError> {
    if data.len() != EVENT_SIZE {
        return Err(DecodeError::SizeMismatch {
            expected: EVENT_SIZE,
            actual: data.len(),
        });
    }

    let mut comm = [0u8; COMM_LEN];
    comm.copy_from_slice(&data[..COMM_LEN]);

    Ok(FcntlEvent {
        comm,
        pid: read_u32_le(&data[COMM_LEN..COMM_LEN + 4]),
        tgid: read_u32_le(&data[COMM_LEN + 4..EVENT_SIZE]),
    })
}

pub fn encode_event(event: &FcntlEvent) -> [u8; EVENT_SIZE] {
    let mut out = [0u8; EVENT_SIZE];
    out[..COMM_LEN].copy_from_slice(&event.comm);
    out[COMM_LEN..COMM_LEN + 4].copy_from_slice(&event.pid.to_le_bytes());
    out[COMM_LEN + 4..].copy_from_slice(&event.tgid.to_le_bytes());
    out
}

fn read_u32_le(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

/// Task name up to the first NUL, lossily converted
pub fn comm_str(comm: &[u8; COMM_LEN]) -> String {
    let end = comm.iter().position(|&b| b == 0).unwrap_or(COMM_LEN);
    String::from_utf8_lossy(&comm[..end]).into_owned()
}

/// Build a NUL-padded comm field, truncating names longer than the kernel allows
pub fn comm_from_str(name: &str) -> [u8; COMM_LEN] {
    let mut comm = [0u8; COMM_LEN];
    let len = name.len().min(COMM_LEN - 1);
    comm[..len].copy_from_slice(&name.as_bytes()[..len]);
    comm
}

/// Printable view of an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventRow {
    pub comm: String,
    pub pid: u32,
    pub tgid: u32,
}

impl From<&FcntlEvent> for EventRow {
    fn from(event: &FcntlEvent) -> Self {
        Self {
            comm: comm_str(&event.comm),
            pid: event.pid,
            tgid: event.tgid,
        }
    }
}

pub fn table_header() -> String {
    format!("{:<16} {:<8} {:<8}", "Comm", "PID", "TGID")
}

impl std::fmt::Display for EventRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:<16} {:<8} {:<8}", self.comm, self.pid, self.tgid)
    }
}
