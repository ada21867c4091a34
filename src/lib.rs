// src/lib.rs

//! Railyard release-archive manager
//!
//! Railyard ingests software build outputs, stores their packages in a
//! filesystem archive, tracks trains, sequences, packages, delta updates,
//! update scripts and service-restart lists in an embedded SQLite database,
//! and emits signed manifests consumed by downstream update clients.
//!
//! # Architecture
//!
//! - Archive-first: on-disk state (packages, manifests, notes, LATEST) is
//!   committed before the database row for a release
//! - Single writer: every mutation happens under an exclusive advisory lock
//!   on `<archive>/.lock`; readers are not coordinated and must tolerate
//!   observing the archive mid-update
//! - The database is derived state: `rebuild` reconstructs it from the
//!   manifest files alone

pub mod cli;
pub mod commands;
pub mod config;
pub mod db;
pub mod delete;
mod error;
pub mod extract;
pub mod hash;
pub mod ingest;
pub mod layout;
pub mod lock;
pub mod manifest;
pub mod pkgfile;
pub mod rebuild;
pub mod release;
pub mod verify;

pub use error::{Error, Result};
pub use ingest::{IngestOutcome, PackageIngestor};
pub use lock::ArchiveLock;
pub use manifest::{compare_manifests, DeltaDesc, Manifest, ManifestPackage};
