//! Export container for saved sessions
//!
//! File structure:
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  Header (length-prefixed MsgPack)       │
//! │  - Magic, version, rate, sample count   │
//! ├─────────────────────────────────────────┤
//! │  Section 0: metadata.json               │
//! │  - Length prefix (u64 LE) + bytes       │
//! ├─────────────────────────────────────────┤
//! │  Section 1: minimap.json                │
//! ├─────────────────────────────────────────┤
//! │  Section 2: session.raw                 │
//! ├─────────────────────────────────────────┤
//! │  Footer (fixed 64 bytes)                │
//! │  - Magic, checksum, completion flag     │
//! └─────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, SeekFrom, Write};
use xxhash_rust::xxh64::Xxh64;

use crate::common::unix_time_ms;

/// Magic bytes of an export container
pub const FILE_MAGIC: [u8; 8] = *b"PPKSES01";

/// Current container format version
pub const CONTAINER_VERSION: u32 = 1;

/// Footer magic bytes (different from header to detect truncation)
pub const FOOTER_MAGIC: [u8; 8] = *b"PPKEND01";

/// Fixed footer size in bytes
pub const FOOTER_SIZE: usize = 64;

/// Number of sections in a container
pub const SECTION_COUNT: usize = 3;

/// Length prefix of one section
const SECTION_PREFIX: u64 = 8;

/// Largest encoded header accepted when reading
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Copy buffer for the raw log section
const COPY_CHUNK: usize = 1 << 20;

/// Sections in file order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Metadata = 0,
    Minimap = 1,
    Log = 2,
}

impl Section {
    pub fn file_name(&self) -> &'static str {
        match self {
            Section::Metadata => super::METADATA_FILE,
            Section::Minimap => super::MINIMAP_FILE,
            Section::Log => super::LOG_FILE,
        }
    }
}

/// Container header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerHeader {
    pub version: u32,
    /// Sidecar format version of the exported session
    pub format_version: u32,
    pub samples_per_second: f64,
    /// Session start, Unix milliseconds
    pub start_system_time: i64,
    pub sample_count: u64,
}

impl ContainerHeader {
    /// Serialize header to bytes (with magic prefix)
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&FILE_MAGIC);
        let header_bytes = rmp_serde::to_vec(self)?;
        let len = header_bytes.len() as u32;
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&header_bytes);
        Ok(buf)
    }

    /// Read header from a reader
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, FileFormatError> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if magic != FILE_MAGIC {
            return Err(FileFormatError::InvalidMagic);
        }

        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_HEADER_SIZE {
            return Err(FileFormatError::HeaderTooLarge(len));
        }

        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;
        rmp_serde::from_slice(&data).map_err(FileFormatError::Deserialization)
    }
}

/// Container footer
///
/// Fixed 64-byte structure at the end of the file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContainerFooter {
    pub magic: [u8; 8],
    /// xxHash64 of all sections including their length prefixes
    pub checksum: u64,
    /// Bytes of all sections including their length prefixes
    pub section_bytes: u64,
    pub sample_count: u64,
    pub samples_per_second: f64,
    /// Export completion time (Unix milliseconds)
    pub export_time_ms: i64,
    /// Write completion flag (1 = complete)
    pub write_complete: u8,
}

impl Default for ContainerFooter {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerFooter {
    pub fn new() -> Self {
        Self {
            magic: FOOTER_MAGIC,
            checksum: 0,
            section_bytes: 0,
            sample_count: 0,
            samples_per_second: 0.0,
            export_time_ms: 0,
            write_complete: 0,
        }
    }

    /// Mark as complete and set the export time
    pub fn finalize(&mut self) {
        self.write_complete = 1;
        self.export_time_ms = unix_time_ms();
    }

    pub fn is_complete(&self) -> bool {
        self.write_complete == 1
    }

    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[0..8].copy_from_slice(&self.magic);
        buf[8..16].copy_from_slice(&self.checksum.to_le_bytes());
        buf[16..24].copy_from_slice(&self.section_bytes.to_le_bytes());
        buf[24..32].copy_from_slice(&self.sample_count.to_le_bytes());
        buf[32..40].copy_from_slice(&self.samples_per_second.to_le_bytes());
        buf[40..48].copy_from_slice(&self.export_time_ms.to_le_bytes());
        buf[48] = self.write_complete;
        // 49..64 reserved
        buf
    }

    pub fn from_bytes(data: &[u8; FOOTER_SIZE]) -> Result<Self, FileFormatError> {
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&data[0..8]);
        if magic != FOOTER_MAGIC {
            return Err(FileFormatError::InvalidFooterMagic);
        }
        let word = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&data[at..at + 8]);
            b
        };
        Ok(Self {
            magic,
            checksum: u64::from_le_bytes(word(8)),
            section_bytes: u64::from_le_bytes(word(16)),
            sample_count: u64::from_le_bytes(word(24)),
            samples_per_second: f64::from_le_bytes(word(32)),
            export_time_ms: i64::from_le_bytes(word(40)),
            write_complete: data[48],
        })
    }
}

/// Streaming checksum over section bytes
///
/// Independent of how the input is split into updates.
pub struct ChecksumCalculator {
    hasher: Xxh64,
    bytes_processed: u64,
}

impl Default for ChecksumCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl ChecksumCalculator {
    pub fn new() -> Self {
        Self {
            hasher: Xxh64::new(0),
            bytes_processed: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes_processed += data.len() as u64;
    }

    pub fn finalize(&self) -> u64 {
        self.hasher.digest()
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }
}

/// Container format errors
#[derive(Debug, thiserror::Error)]
pub enum FileFormatError {
    #[error("Data too short to contain valid structure")]
    TooShort,

    #[error("Invalid file magic bytes")]
    InvalidMagic,

    #[error("Invalid footer magic bytes")]
    InvalidFooterMagic,

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checksum mismatch: expected {expected:016x}, got {actual:016x}")]
    ChecksumMismatch { expected: u64, actual: u64 },

    #[error("Incomplete file (footer indicates crash during write)")]
    IncompleteFile,

    #[error("Section {0:?} extends past the footer")]
    TruncatedSection(Section),

    #[error("Header of {0} bytes exceeds the {MAX_HEADER_SIZE} byte limit")]
    HeaderTooLarge(usize),
}

/// Write a complete container
///
/// `log` must yield exactly `log_len` bytes.
pub fn write_container<W: Write, R: Read>(
    writer: &mut W,
    header: &ContainerHeader,
    metadata: &[u8],
    minimap: &[u8],
    log: &mut R,
    log_len: u64,
) -> Result<ContainerFooter, FileFormatError> {
    writer.write_all(&header.to_bytes()?)?;

    let mut checksum = ChecksumCalculator::new();
    for section in [metadata, minimap] {
        let prefix = (section.len() as u64).to_le_bytes();
        writer.write_all(&prefix)?;
        writer.write_all(section)?;
        checksum.update(&prefix);
        checksum.update(section);
    }

    let prefix = log_len.to_le_bytes();
    writer.write_all(&prefix)?;
    checksum.update(&prefix);
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut remaining = log_len;
    while remaining > 0 {
        let n = (remaining as usize).min(buf.len());
        log.read_exact(&mut buf[..n])?;
        writer.write_all(&buf[..n])?;
        checksum.update(&buf[..n]);
        remaining -= n as u64;
    }

    let mut footer = ContainerFooter::new();
    footer.checksum = checksum.finalize();
    footer.section_bytes = checksum.bytes_processed();
    footer.sample_count = header.sample_count;
    footer.samples_per_second = header.samples_per_second;
    footer.finalize();
    writer.write_all(&footer.to_bytes())?;
    writer.flush()?;
    Ok(footer)
}

/// Result of container validation
#[derive(Debug)]
pub struct ContainerValidation {
    pub is_valid: bool,
    pub header: Option<ContainerHeader>,
    pub footer: Option<ContainerFooter>,
    /// Lengths of the sections that could be located
    pub section_lengths: Vec<u64>,
    pub errors: Vec<String>,
}

/// Reader for export containers
pub struct ContainerReader<R> {
    reader: R,
    header: ContainerHeader,
    header_size: u64,
    file_size: u64,
}

impl<R: Read + Seek> ContainerReader<R> {
    /// Open a container and read its header
    pub fn new(mut reader: R) -> Result<Self, FileFormatError> {
        let file_size = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;
        let header = ContainerHeader::read_from(&mut reader)?;
        let header_size = reader.stream_position()?;
        Ok(Self {
            reader,
            header,
            header_size,
            file_size,
        })
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    pub fn read_footer(&mut self) -> Result<ContainerFooter, FileFormatError> {
        if self.file_size < self.header_size + FOOTER_SIZE as u64 {
            return Err(FileFormatError::TooShort);
        }
        self.reader.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut buf = [0u8; FOOTER_SIZE];
        self.reader.read_exact(&mut buf)?;
        ContainerFooter::from_bytes(&buf)
    }

    fn data_end(&self) -> u64 {
        self.file_size.saturating_sub(FOOTER_SIZE as u64)
    }

    /// Offset of the section payload and its length
    fn locate(&mut self, section: Section) -> Result<(u64, u64), FileFormatError> {
        let mut pos = self.header_size;
        let truncated = || FileFormatError::TruncatedSection(section);
        for index in 0..=section as usize {
            let start = pos.checked_add(SECTION_PREFIX).ok_or_else(truncated)?;
            if start > self.data_end() {
                return Err(truncated());
            }
            self.reader.seek(SeekFrom::Start(pos))?;
            let mut len_bytes = [0u8; 8];
            self.reader.read_exact(&mut len_bytes)?;
            let len = u64::from_le_bytes(len_bytes);
            let end = start.checked_add(len).ok_or_else(truncated)?;
            if end > self.data_end() {
                return Err(truncated());
            }
            if index == section as usize {
                return Ok((start, len));
            }
            pos = end;
        }
        Err(truncated())
    }

    /// Read a whole section into memory
    pub fn read_section(&mut self, section: Section) -> Result<Vec<u8>, FileFormatError> {
        let (start, len) = self.locate(section)?;
        self.reader.seek(SeekFrom::Start(start))?;
        let mut data = vec![0u8; len as usize];
        self.reader.read_exact(&mut data)?;
        Ok(data)
    }

    /// Stream a section into `writer`; returns the bytes copied
    pub fn copy_section<W: Write>(
        &mut self,
        section: Section,
        writer: &mut W,
    ) -> Result<u64, FileFormatError> {
        let (start, len) = self.locate(section)?;
        self.reader.seek(SeekFrom::Start(start))?;
        let mut limited = (&mut self.reader).take(len);
        let copied = std::io::copy(&mut limited, writer)?;
        if copied != len {
            return Err(FileFormatError::TruncatedSection(section));
        }
        Ok(copied)
    }

    /// Checksum of everything between header and footer
    fn compute_checksum(&mut self) -> Result<(u64, u64), FileFormatError> {
        self.reader.seek(SeekFrom::Start(self.header_size))?;
        let mut remaining = self.data_end().saturating_sub(self.header_size);
        let mut checksum = ChecksumCalculator::new();
        let mut buf = vec![0u8; COPY_CHUNK];
        while remaining > 0 {
            let n = (remaining as usize).min(buf.len());
            self.reader.read_exact(&mut buf[..n])?;
            checksum.update(&buf[..n]);
            remaining -= n as u64;
        }
        Ok((checksum.finalize(), checksum.bytes_processed()))
    }

    /// Check footer, checksum and section layout
    pub fn validate(&mut self) -> ContainerValidation {
        let mut result = ContainerValidation {
            is_valid: false,
            header: Some(self.header.clone()),
            footer: None,
            section_lengths: Vec::with_capacity(SECTION_COUNT),
            errors: Vec::new(),
        };

        for section in [Section::Metadata, Section::Minimap, Section::Log] {
            match self.locate(section) {
                Ok((_, len)) => result.section_lengths.push(len),
                Err(e) => {
                    result.errors.push(e.to_string());
                    break;
                }
            }
        }

        let footer = match self.read_footer() {
            Ok(footer) => footer,
            Err(e) => {
                result.errors.push(format!("Failed to read footer: {}", e));
                return result;
            }
        };
        result.footer = Some(footer);
        if !footer.is_complete() {
            result.errors.push(FileFormatError::IncompleteFile.to_string());
            return result;
        }

        match self.compute_checksum() {
            Ok((actual, bytes)) => {
                if actual != footer.checksum {
                    result.errors.push(
                        FileFormatError::ChecksumMismatch {
                            expected: footer.checksum,
                            actual,
                        }
                        .to_string(),
                    );
                } else if bytes != footer.section_bytes {
                    result.errors.push(format!(
                        "Section size mismatch: footer says {}, found {}",
                        footer.section_bytes, bytes
                    ));
                }
            }
            Err(e) => result.errors.push(format!("Checksum verification error: {}", e)),
        }

        result.is_valid = result.errors.is_empty() && result.section_lengths.len() == SECTION_COUNT;
        result
    }
}
