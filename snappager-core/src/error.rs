//! Custom error types for snappager.
//!
//! Explicit enum error types only. No `Box<dyn Error>`, no `anyhow::Result`.
//! Transient kernel races (`EAGAIN`, `EEXIST`) never show up here: they are
//! resolved where the ioctl is issued.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for the demand-paging engine.
#[derive(Debug, Error)]
pub enum PagerError {
    // =========================================================================
    // Configuration Errors - Fail-Fast on Invalid Config
    // =========================================================================
    #[error("Hard validation error: {0}")]
    HardValidation(#[from] HardValidationError),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    ConfigParse { message: String },

    // =========================================================================
    // Handshake Errors - Non-retryable once the bounded read retry is spent
    // =========================================================================
    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    // =========================================================================
    // Fault Servicing Errors
    // =========================================================================
    #[error("Fault error: {0}")]
    Fault(#[from] FaultError),

    #[error("Chunk error: {0}")]
    Chunk(#[from] ChunkError),

    #[error("Working set error: {0}")]
    WorkingSet(#[from] WorkingSetError),

    // =========================================================================
    // System Errors
    // =========================================================================
    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("System call failed: {syscall} - {message}")]
    Syscall {
        syscall: &'static str,
        message: String,
    },
}

impl PagerError {
    /// True when the hypervisor closed the handshake socket.
    ///
    /// This is the only graceful shutdown signal of a runtime.
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Handshake(HandshakeError::Eof))
    }

    /// True when a fault that failed with this error may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Chunk(ChunkError::Download { .. }))
    }
}

/// Hard validation errors prevent the handler from starting at all.
#[derive(Debug, Error)]
pub enum HardValidationError {
    #[error("Missing required field: {field} in {context}")]
    MissingRequiredField {
        field: &'static str,
        context: String,
    },

    #[error("Invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid page size: {page_size} (must be a positive power of two)")]
    InvalidPageSize { page_size: u64 },

    #[error("Invalid chunk hash: {value} - {reason}")]
    InvalidChunkHash { value: String, reason: String },
}

/// Errors raised while receiving the region table and userfaultfd from the hypervisor.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Handshake peer closed the connection")]
    Eof,

    #[error("Failed to receive handshake message: {reason}")]
    Recv { reason: String },

    #[error("No userfaultfd received after {attempts} attempts, last body: '{body}'")]
    MissingUffd { attempts: u32, body: String },

    #[error("Cannot deserialize memory mappings: {reason}, body: '{body}'")]
    InvalidMappings { reason: String, body: String },

    #[error("No memory regions received")]
    NoRegions,

    #[error("Memory size mismatch: expected {expected} bytes, regions cover {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Invalid page size in region table: {page_size}")]
    InvalidPageSize { page_size: u64 },

    #[error("Regions at {first:#x} and {second:#x} overlap")]
    OverlappingRegions { first: u64, second: u64 },
}

/// Errors raised while reading or resolving a single fault.
#[derive(Debug, Error)]
pub enum FaultError {
    #[error("Failed to read uffd event: {source}")]
    ReadEvent {
        #[source]
        source: std::io::Error,
    },

    #[error("Incomplete uffd message: got {got} bytes, expected {expected}")]
    ShortRead { got: usize, expected: usize },

    #[error("Address {addr:#x} is not within any guest region mapping")]
    UnmappedAddress { addr: u64 },

    #[error("Source range {offset:#x}+{len:#x} exceeds backing memory of {size:#x} bytes")]
    SourceOutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("Recipe offset {offset:#x} exceeds recipe of {size:#x} bytes")]
    RecipeOutOfBounds { offset: u64, size: u64 },
}

/// Errors from the remote content-addressed chunk store.
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("Failed to download chunk {hash}: {reason}")]
    Download { hash: String, reason: String },

    #[error("Chunk {hash} is {len} bytes, need at least {needed}")]
    TooShort { hash: String, len: usize, needed: usize },

    #[error("Invalid chunk size: {chunk_size} - {reason}")]
    InvalidChunkSize { chunk_size: u64, reason: String },

    #[error("Lazy restore requested without a chunk store")]
    StoreMissing,
}

/// Errors while loading the working-set CSV.
#[derive(Debug, Error)]
pub enum WorkingSetError {
    #[error("Failed to read working set {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed working set row {line}: '{row}' - {reason}")]
    MalformedRow {
        line: usize,
        row: String,
        reason: String,
    },
}

/// Result type alias using PagerError.
pub type PagerResult<T> = Result<T, PagerError>;
