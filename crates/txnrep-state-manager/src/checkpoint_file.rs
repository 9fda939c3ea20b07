//! State manager checkpoint file
//!
//! Format:
//!
//! ```text
//! +--------------------------------------------------------------+
//! | header (36 bytes, little endian)                              |
//! |   magic u32 | version u32 | prepare_lsn i64 | count u64       |
//! |   crc32c u32 | created_at_ms u64                              |
//! +--------------------------------------------------------------+
//! | bincode Vec<SerializableMetadata>                             |
//! +--------------------------------------------------------------+
//! ```
//!
//! Files are written to a temporary path, flushed, synced and renamed.

use crate::metadata::SerializableMetadata;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use txnrep_common::{Error, Lsn, Result, checksum};

/// Fixed-size header in front of the checkpoint body
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointHeader {
    pub magic: u32,
    pub version: u32,
    pub prepare_lsn: Lsn,
    pub record_count: u64,
    pub checksum: u32,
    pub created_at: u64,
}

impl CheckpointHeader {
    pub const MAGIC: u32 = 0x534D_4350; // "SMCP"
    pub const VERSION: u32 = 1;
    pub const SIZE: usize = 36;

    #[must_use]
    pub fn new(prepare_lsn: Lsn, record_count: u64) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            prepare_lsn,
            record_count,
            checksum: 0,
            created_at: u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default(),
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.prepare_lsn.to_le_bytes());
        buf[16..24].copy_from_slice(&self.record_count.to_le_bytes());
        buf[24..28].copy_from_slice(&self.checksum.to_le_bytes());
        buf[28..36].copy_from_slice(&self.created_at.to_le_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::corrupt(format!(
                "checkpoint header is {} bytes, expected {}",
                data.len(),
                Self::SIZE
            )));
        }
        let u32_at = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let u64_at = |at: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data[at..at + 8]);
            u64::from_le_bytes(bytes)
        };

        let magic = u32_at(0);
        if magic != Self::MAGIC {
            return Err(Error::corrupt(format!("bad checkpoint magic {magic:#010x}")));
        }
        let version = u32_at(4);
        if version != Self::VERSION {
            return Err(Error::corrupt(format!("unsupported checkpoint version {version}")));
        }
        Ok(Self {
            magic,
            version,
            prepare_lsn: u64_at(8).cast_signed(),
            record_count: u64_at(16),
            checksum: u32_at(24),
            created_at: u64_at(28),
        })
    }
}

/// Header plus records of one checkpoint
#[derive(Clone, Debug)]
pub struct CheckpointFile {
    pub header: CheckpointHeader,
    pub records: Vec<SerializableMetadata>,
}

impl CheckpointFile {
    #[must_use]
    pub fn new(prepare_lsn: Lsn, records: Vec<SerializableMetadata>) -> Self {
        Self {
            header: CheckpointHeader::new(prepare_lsn, records.len() as u64),
            records,
        }
    }

    /// Write to `path` through a sibling temporary file
    pub fn write(&self, path: &Path, sync: bool) -> Result<()> {
        let body = bincode::serialize(&self.records)
            .map_err(|e| Error::Serialization(format!("failed to serialize checkpoint: {e}")))?;
        let mut header = self.header.clone();
        header.record_count = self.records.len() as u64;
        header.checksum = checksum::body_crc(&body);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let temp_path = path.with_extension("writing");
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&temp_path)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(&header.to_bytes())?;
            writer.write_all(&body)?;
            writer.flush()?;
            if sync {
                writer.get_ref().sync_all()?;
            }
        }
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    pub fn read(path: &Path, verify_checksum: bool) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);

        let mut header_buf = [0u8; CheckpointHeader::SIZE];
        reader.read_exact(&mut header_buf).map_err(|e| {
            Error::corrupt(format!("failed to read header of {}: {e}", path.display()))
        })?;
        let header = CheckpointHeader::from_bytes(&header_buf)?;

        let mut body = Vec::new();
        reader.read_to_end(&mut body)?;
        if verify_checksum {
            checksum::verify_body(&body, header.checksum)?;
        }

        let records: Vec<SerializableMetadata> = bincode::deserialize(&body).map_err(|e| {
            Error::Deserialization(format!("failed to deserialize checkpoint: {e}"))
        })?;
        if records.len() as u64 != header.record_count {
            return Err(Error::corrupt(format!(
                "checkpoint declares {} records but holds {}",
                header.record_count,
                records.len()
            )));
        }
        Ok(Self { header, records })
    }
}
