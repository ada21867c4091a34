// src/db/schema.rs

//! Database schema for the release archive
//!
//! The schema is versioned by a single row in `schema_version`. A version
//! mismatch on open is fatal; the recovery path is `rebuild`, which drops
//! the database and reconstructs it from the manifest files.

use crate::error::{Error, Result};
use rusqlite::Connection;
use tracing::debug;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Create all tables for a fresh database and record the schema version.
///
/// Idempotent: safe to call on a database that is already initialized at
/// the current version.
pub fn create_schema(conn: &Connection) -> Result<()> {
    debug!("Creating schema version {}", SCHEMA_VERSION);

    conn.execute_batch(
        "
        -- Trains: named rolling release channels
        CREATE TABLE IF NOT EXISTS trains (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE
        );

        -- Sequences: one publication event on a train. The id is the
        -- authoritative release ordering; the sequence string is not.
        CREATE TABLE IF NOT EXISTS sequences (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sequence TEXT NOT NULL UNIQUE,
            train INTEGER NOT NULL REFERENCES trains(id)
        );

        -- Packages: (name, version) with unpacked checksum
        CREATE TABLE IF NOT EXISTS packages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            version TEXT NOT NULL,
            requires_reboot INTEGER NOT NULL DEFAULT 1,
            checksum TEXT,
            UNIQUE(name, version)
        );

        -- Manifest rows: ordered (sequence, package) associations.
        -- A manifest is reconstituted by selecting rows for a sequence
        -- ordered by id ascending.
        CREATE TABLE IF NOT EXISTS manifests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sequence INTEGER NOT NULL REFERENCES sequences(id),
            pkg INTEGER NOT NULL REFERENCES packages(id)
        );

        CREATE INDEX IF NOT EXISTS idx_manifests_sequence ON manifests(sequence);
        CREATE INDEX IF NOT EXISTS idx_manifests_pkg ON manifests(pkg);

        -- Delta edges: pkg_base -> pkg_new of the same package name.
        -- requires_reboot overrides the package default for this edge.
        CREATE TABLE IF NOT EXISTS package_updates (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pkg_new INTEGER NOT NULL REFERENCES packages(id),
            pkg_base INTEGER NOT NULL REFERENCES packages(id),
            requires_reboot INTEGER,
            checksum TEXT,
            UNIQUE(pkg_new, pkg_base)
        );

        CREATE INDEX IF NOT EXISTS idx_package_updates_new ON package_updates(pkg_new);
        CREATE INDEX IF NOT EXISTS idx_package_updates_base ON package_updates(pkg_base);

        -- Delta scripts: name -> sha256(text); the text lives on disk.
        -- The reserved name 'reboot' with checksum '-' encodes a forced
        -- reboot and overrides everything else.
        CREATE TABLE IF NOT EXISTS package_delta_scripts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pkg INTEGER NOT NULL REFERENCES packages(id),
            script_name TEXT NOT NULL,
            checksum TEXT NOT NULL,
            UNIQUE(pkg, script_name)
        );

        -- Service-restart rows for updates landing on this package version
        CREATE TABLE IF NOT EXISTS package_service_restarts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pkg INTEGER NOT NULL REFERENCES packages(id),
            service_name TEXT NOT NULL,
            restart INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_service_restarts_pkg
            ON package_service_restarts(pkg);

        -- Notes: (sequence, name) -> filename under <train>/Notes/
        CREATE TABLE IF NOT EXISTS release_notes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            note_name TEXT NOT NULL,
            note_file TEXT NOT NULL,
            sequence INTEGER NOT NULL REFERENCES sequences(id),
            UNIQUE(note_name, sequence)
        );

        -- Notices: at most one free-form text per sequence, embedded in
        -- the manifest rather than stored as a file
        CREATE TABLE IF NOT EXISTS notices (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            text TEXT NOT NULL,
            sequence INTEGER NOT NULL UNIQUE REFERENCES sequences(id)
        );

        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        );
        ",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (id, version) VALUES (1, ?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}

/// Read the stored schema version, or None for a database with no tables
pub fn stored_version(conn: &Connection) -> Result<Option<i32>> {
    let has_table: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
        [],
        |row| row.get(0),
    )?;
    if !has_table {
        return Ok(None);
    }
    let version = conn.query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
        row.get(0)
    })?;
    Ok(Some(version))
}

/// Fail with `IncompatibleVersion` unless the stored version matches
pub fn check_version(conn: &Connection) -> Result<()> {
    match stored_version(conn)? {
        None | Some(SCHEMA_VERSION) => Ok(()),
        Some(found) => Err(Error::IncompatibleVersion {
            found,
            expected: SCHEMA_VERSION,
        }),
    }
}
