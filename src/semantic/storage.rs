//! Binary storage for index artifacts.
//!
//! File format (`recipes.index` or `embeddings.bin`):
//!
//! Header (64 bytes):
//! - version: u8 (1)
//! - kind: u8 (1 = accelerated index blob, 2 = row-major f32 matrix)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - payload_len: u64 (little-endian)
//! - payload_checksum: u32 (CRC32 of the payload)
//! - metadata_checksum: u32 (CRC32 of the metadata file written by the same build)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Payload:
//! - accelerated: opaque index serialization
//! - matrix: entry_count * dimensions f32 (little-endian), row order
//!
//! The metadata artifact is a JSON array of `RecipeDoc`, one per row. An index
//! artifact only pairs with the metadata file whose bytes hash to its
//! `metadata_checksum`.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::recipes::RecipeDoc;
use crate::semantic::index::IndexKind;

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes
const HEADER_SIZE: usize = 64;

const KIND_ACCELERATED: u8 = 1;
const KIND_MATRIX: u8 = 2;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Header of an index artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactHeader {
    pub kind: IndexKind,
    pub model_id: [u8; 32],
    pub dimensions: usize,
    pub entry_count: usize,
    pub metadata_checksum: u32,
    payload_len: u64,
    payload_checksum: u32,
}

/// A fully read index artifact.
#[derive(Debug)]
pub struct Artifact {
    pub header: ArtifactHeader,
    pub payload: Vec<u8>,
}

impl Artifact {
    /// Decode a matrix payload into row-major floats.
    pub fn matrix(&self) -> Result<Vec<f32>, VectorStorageError> {
        if self.header.kind != IndexKind::Flat {
            return Err(VectorStorageError::InvalidFormat(
                "artifact does not hold a matrix".to_string(),
            ));
        }

        let expected = self.header.entry_count * self.header.dimensions * 4;
        if self.payload.len() != expected {
            return Err(VectorStorageError::InvalidFormat(format!(
                "matrix payload is {} bytes, expected {}",
                self.payload.len(),
                expected
            )));
        }

        Ok(self
            .payload
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }
}

/// Storage manager for one index artifact file.
pub struct VectorStorage {
    path: PathBuf,
}

impl VectorStorage {
    /// Create a new storage manager for the given path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Get the storage file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the storage file exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load header and payload, verifying both checksums.
    pub fn load(&self) -> Result<Artifact, VectorStorageError> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        let header = Self::decode_header(&mut reader)?;

        let payload_len = usize::try_from(header.payload_len).map_err(|_| {
            VectorStorageError::InvalidFormat("payload too large".to_string())
        })?;
        let mut payload = vec![0u8; payload_len];
        reader.read_exact(&mut payload)?;

        if crc32fast::hash(&payload) != header.payload_checksum {
            return Err(VectorStorageError::ChecksumMismatch);
        }

        Ok(Artifact { header, payload })
    }

    /// Save an accelerated index blob.
    pub fn save_accelerated(
        &self,
        model_id: &[u8; 32],
        metadata_checksum: u32,
        dimensions: usize,
        entry_count: usize,
        blob: &[u8],
    ) -> Result<(), VectorStorageError> {
        let header = HeaderFields {
            kind: KIND_ACCELERATED,
            model_id,
            metadata_checksum,
            dimensions,
            entry_count,
        };
        self.save(header, blob)
    }

    /// Save a row-major f32 matrix.
    pub fn save_matrix(
        &self,
        model_id: &[u8; 32],
        metadata_checksum: u32,
        dimensions: usize,
        matrix: &[f32],
    ) -> Result<(), VectorStorageError> {
        if dimensions == 0 || matrix.len() % dimensions != 0 {
            return Err(VectorStorageError::InvalidFormat(format!(
                "{} floats do not form rows of {}",
                matrix.len(),
                dimensions
            )));
        }

        let payload: Vec<u8> = matrix.iter().flat_map(|v| v.to_le_bytes()).collect();
        let header = HeaderFields {
            kind: KIND_MATRIX,
            model_id,
            metadata_checksum,
            dimensions,
            entry_count: matrix.len() / dimensions,
        };
        self.save(header, &payload)
    }

    /// Delete the storage file if it exists.
    pub fn delete(&self) -> Result<(), VectorStorageError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    /// Uses atomic write: temp file -> fsync -> rename
    fn save(&self, header: HeaderFields<'_>, payload: &[u8]) -> Result<(), VectorStorageError> {
        let dimensions = header.dimensions;
        let dimensions = u16::try_from(dimensions).map_err(|_| {
            VectorStorageError::InvalidFormat(format!("{dimensions} dimensions do not fit the header"))
        })?;

        let temp_path = self.path.with_extension("tmp");

        let result = Self::write_to_file(&temp_path, &header, dimensions, payload)
            .and_then(|()| std::fs::rename(&temp_path, &self.path).map_err(VectorStorageError::from));

        if result.is_err() {
            // Clean up temp file on error
            let _ = std::fs::remove_file(&temp_path);
        }

        result
    }

    fn write_to_file(
        path: &Path,
        header: &HeaderFields<'_>,
        dimensions: u16,
        payload: &[u8],
    ) -> Result<(), VectorStorageError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let mut header_bytes = [0u8; HEADER_SIZE];
        header_bytes[0] = FORMAT_VERSION;
        header_bytes[1] = header.kind;
        header_bytes[2..34].copy_from_slice(header.model_id);
        header_bytes[34..36].copy_from_slice(&dimensions.to_le_bytes());
        header_bytes[36..44].copy_from_slice(&(header.entry_count as u64).to_le_bytes());
        header_bytes[44..52].copy_from_slice(&(payload.len() as u64).to_le_bytes());
        header_bytes[52..56].copy_from_slice(&crc32fast::hash(payload).to_le_bytes());
        header_bytes[56..60].copy_from_slice(&header.metadata_checksum.to_le_bytes());

        let checksum = crc32fast::hash(&header_bytes[0..60]);
        header_bytes[60..64].copy_from_slice(&checksum.to_le_bytes());

        writer.write_all(&header_bytes)?;
        writer.write_all(payload)?;

        // Flush and sync
        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        Ok(())
    }

    fn decode_header(reader: &mut impl Read) -> Result<ArtifactHeader, VectorStorageError> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header_bytes)?;

        let version = header_bytes[0];
        if version > FORMAT_VERSION {
            return Err(VectorStorageError::VersionMismatch(version, FORMAT_VERSION));
        }

        let stored_checksum = u32::from_le_bytes(le_array(&header_bytes[60..64]));
        if crc32fast::hash(&header_bytes[0..60]) != stored_checksum {
            return Err(VectorStorageError::ChecksumMismatch);
        }

        let kind = match header_bytes[1] {
            KIND_ACCELERATED => IndexKind::Accelerated,
            KIND_MATRIX => IndexKind::Flat,
            other => {
                return Err(VectorStorageError::InvalidFormat(format!(
                    "unknown artifact kind {other}"
                )))
            }
        };

        let mut model_id = [0u8; 32];
        model_id.copy_from_slice(&header_bytes[2..34]);

        Ok(ArtifactHeader {
            kind,
            model_id,
            dimensions: u16::from_le_bytes(le_array(&header_bytes[34..36])) as usize,
            entry_count: u64::from_le_bytes(le_array(&header_bytes[36..44])) as usize,
            metadata_checksum: u32::from_le_bytes(le_array(&header_bytes[56..60])),
            payload_len: u64::from_le_bytes(le_array(&header_bytes[44..52])),
            payload_checksum: u32::from_le_bytes(le_array(&header_bytes[52..56])),
        })
    }
}

/// Header fields chosen by the writer; lengths and checksums are derived.
struct HeaderFields<'a> {
    kind: u8,
    model_id: &'a [u8; 32],
    metadata_checksum: u32,
    dimensions: usize,
    entry_count: usize,
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

/// Serialized metadata, ready to be written, with the checksum index artifacts
/// of the same build record.
pub struct EncodedMetadata {
    bytes: Vec<u8>,
    checksum: u32,
}

impl EncodedMetadata {
    /// Pretty-printed JSON array of `docs`.
    pub fn encode(docs: &[RecipeDoc]) -> Result<Self, VectorStorageError> {
        let bytes = serde_json::to_vec_pretty(docs)?;
        let checksum = crc32fast::hash(&bytes);
        Ok(Self { bytes, checksum })
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }
}

/// Metadata as read back from disk.
#[derive(Debug)]
pub struct LoadedMetadata {
    pub docs: Vec<RecipeDoc>,
    /// CRC32 of the file bytes
    pub checksum: u32,
}

/// Storage for the metadata artifact (ordered recipe documents).
pub struct MetadataStorage {
    path: PathBuf,
}

impl MetadataStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read the file once; the checksum covers exactly the parsed bytes.
    pub fn load(&self) -> Result<LoadedMetadata, VectorStorageError> {
        let bytes = std::fs::read(&self.path)?;
        let checksum = crc32fast::hash(&bytes);
        let docs = serde_json::from_slice(&bytes)?;
        Ok(LoadedMetadata { docs, checksum })
    }

    /// Written through a temp file and renamed into place.
    pub fn save(&self, metadata: &EncodedMetadata) -> Result<(), VectorStorageError> {
        crate::storage::write_atomic(&self.path, &metadata.bytes)?;
        Ok(())
    }
}
