//! Low-level primitives for building the storage engine.
//!
//! Includes byte utilities, positioned file I/O, and the write-ahead
//! transaction log.

/// Byte-level utilities and encoding/decoding.
///
/// Fixed-width little-endian writers, a bounds-checked reader, and type tags.
pub mod bytes;

/// I/O abstractions and utilities.
///
/// Interfaces for reading/writing data and file operations.
pub mod io;

/// Write-ahead transaction log for crash recovery.
///
/// Records logical operations so interrupted work can be undone or redone.
pub mod wal;
