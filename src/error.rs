// src/error.rs

//! Error types for the railyard archive engine

use thiserror::Error;

/// Errors produced by the archive and database engine
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database error
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The database schema version does not match this binary
    #[error("Database has incompatible schema version {found} (expected {expected}); run rebuild")]
    IncompatibleVersion { found: i32, expected: i32 },

    /// Another process holds the archive lock
    #[error("Archive lock at '{0}' is held by another process")]
    LockHeld(String),

    /// The sequence already exists in the database
    #[error("Duplicate sequence '{0}'")]
    DuplicateSequence(String),

    /// The sequence is not in the database
    #[error("Unknown sequence '{0}'")]
    UnknownSequence(String),

    /// The package is not in the database
    #[error("Unknown package {name}-{version}")]
    UnknownPackage { name: String, version: String },

    /// A file's checksum does not match the recorded one
    #[error("Checksum mismatch for '{file}': expected {expected}, found {found}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        found: String,
    },

    /// The package is still referenced by a manifest or a delta edge
    #[error("Package {name}-{version} is still in use")]
    PackageInUse { name: String, version: String },

    /// A delta package file already exists where one is being created
    #[error("Delta package '{0}' already exists")]
    DeltaExists(String),

    /// Manifest load, store, or content error
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Manifest signing failure
    #[error("Signing error: {0}")]
    Signing(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;
