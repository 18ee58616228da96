//! Commitlog record definitions and framing

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::schema::TableId;

/// Frame header: Position (8) + CRC (4) + Len (4)
pub const HEADER_SIZE: usize = 16;

/// Payload of one log record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitLogRecord {
    pub table_id: TableId,
    /// bincode-serialized `Mutation`
    pub mutation: Vec<u8>,
}

impl CommitLogRecord {
    pub fn new(table_id: TableId, mutation: Vec<u8>) -> Self {
        Self { table_id, mutation }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn compute_crc(data: &[u8]) -> u32 {
        crc32fast::hash(data)
    }

    /// Full frame for `data` written at segment offset `position`
    pub fn frame(position: u64, data: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(HEADER_SIZE + data.len());
        frame.extend_from_slice(&position.to_le_bytes());
        frame.extend_from_slice(&Self::compute_crc(data).to_le_bytes());
        frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
        frame.extend_from_slice(data);
        frame
    }
}
