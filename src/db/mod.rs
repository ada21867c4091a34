// src/db/mod.rs

//! Relational store for trains, sequences, packages, delta updates,
//! scripts, service-restart lists, notes and notices
//!
//! Every mutation of release state goes through [`ReleaseDB`]. The store is
//! single-writer; callers serialize through the archive lock. Foreign keys
//! are enforced, and multi-row inserts (`add_release`) are transactional.

pub mod schema;

use crate::error::{Error, Result};
use crate::hash;
use crate::manifest::Manifest;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// A row in the `packages` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRow {
    pub id: i64,
    pub name: String,
    pub version: String,
    pub requires_reboot: bool,
    pub checksum: Option<String>,
}

impl PackageRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            version: row.get(2)?,
            requires_reboot: row.get(3)?,
            checksum: row.get(4)?,
        })
    }
}

/// A delta edge seen from its `pkg_new` side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRow {
    pub base_version: String,
    pub checksum: Option<String>,
    pub requires_reboot: Option<bool>,
}

/// A row in the `sequences` table with its train resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceRow {
    pub sequence: String,
    pub train: String,
}

/// The release database
pub struct ReleaseDB {
    conn: Connection,
}

const PACKAGE_COLS: &str = "p.id, p.name, p.version, p.requires_reboot, p.checksum";

impl ReleaseDB {
    /// Open (or create) the database at `path`.
    ///
    /// Fails with [`Error::IncompatibleVersion`] when the stored schema
    /// version does not match this binary; `rebuild` is the recovery path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an in-memory database (tests)
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        schema::check_version(&conn)?;
        schema::create_schema(&conn)?;
        Ok(Self { conn })
    }

    // ------------------------------------------------------------------
    // Releases

    /// Insert a whole release: train (idempotent), sequence, manifest rows,
    /// notes and notice, in one transaction.
    ///
    /// Fails with [`Error::DuplicateSequence`] if the sequence string is
    /// already present (sequence strings are unique across all trains).
    pub fn add_release(&mut self, manifest: &Manifest) -> Result<()> {
        let sequence = manifest.sequence().to_string();
        let exists: bool = self.conn.query_row(
            "SELECT COUNT(*) > 0 FROM sequences WHERE sequence = ?1",
            [&sequence],
            |row| row.get(0),
        )?;
        if exists {
            return Err(Error::DuplicateSequence(sequence));
        }

        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT OR IGNORE INTO trains (name) VALUES (?1)",
            [manifest.train()],
        )?;
        tx.execute(
            "INSERT INTO sequences (sequence, train)
             SELECT ?1, id FROM trains WHERE name = ?2",
            params![sequence, manifest.train()],
        )?;
        let seq_id = tx.last_insert_rowid();

        for pkg in manifest.packages() {
            tx.execute(
                "INSERT OR IGNORE INTO packages (name, version, requires_reboot, checksum)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    pkg.name,
                    pkg.version,
                    pkg.requires_reboot.unwrap_or(true),
                    pkg.checksum
                ],
            )?;
            tx.execute(
                "INSERT INTO manifests (sequence, pkg)
                 SELECT ?1, id FROM packages WHERE name = ?2 AND version = ?3",
                params![seq_id, pkg.name, pkg.version],
            )?;
        }

        for (name, file) in manifest.notes() {
            tx.execute(
                "INSERT INTO release_notes (note_name, note_file, sequence) VALUES (?1, ?2, ?3)",
                params![name, file, seq_id],
            )?;
        }

        if let Some(notice) = manifest.notice() {
            tx.execute(
                "INSERT INTO notices (text, sequence) VALUES (?1, ?2)",
                params![notice, seq_id],
            )?;
        }

        tx.commit()?;
        debug!(
            "Added release {} on train {} ({} packages)",
            sequence,
            manifest.train(),
            manifest.packages().len()
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Packages

    /// Insert a package row if absent, returning its id
    pub fn add_package(
        &self,
        name: &str,
        version: &str,
        requires_reboot: bool,
        checksum: &str,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT OR IGNORE INTO packages (name, version, requires_reboot, checksum)
             VALUES (?1, ?2, ?3, ?4)",
            params![name, version, requires_reboot, checksum],
        )?;
        let id = self.conn.query_row(
            "SELECT id FROM packages WHERE name = ?1 AND version = ?2",
            params![name, version],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Replace a package row's stored checksum
    pub fn set_package_checksum(&self, pkg_id: i64, checksum: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE packages SET checksum = ?1 WHERE id = ?2",
            params![checksum, pkg_id],
        )?;
        Ok(())
    }

    /// Every package row, ordered by (name, version)
    pub fn all_packages(&self) -> Result<Vec<PackageRow>> {
        let sql = format!(
            "SELECT {PACKAGE_COLS} FROM packages p ORDER BY p.name, p.version"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], PackageRow::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Look up a package by (name, version)
    pub fn find_package(&self, name: &str, version: &str) -> Result<Option<PackageRow>> {
        let sql = format!(
            "SELECT {PACKAGE_COLS} FROM packages p WHERE p.name = ?1 AND p.version = ?2"
        );
        let row = self
            .conn
            .query_row(&sql, params![name, version], PackageRow::from_row)
            .optional()?;
        Ok(row)
    }

    /// Packages of a sequence, ordered by manifest row; optionally
    /// restricted to one package name
    pub fn packages_for_sequence(
        &self,
        sequence: &str,
        name: Option<&str>,
    ) -> Result<Vec<PackageRow>> {
        let sql = format!(
            "SELECT {PACKAGE_COLS}
             FROM manifests m
             JOIN sequences s ON m.sequence = s.id
             JOIN packages p ON m.pkg = p.id
             WHERE s.sequence = ?1 {}
             ORDER BY m.id ASC",
            if name.is_some() { "AND p.name = ?2" } else { "" }
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = match name {
            Some(n) => stmt.query_map(params![sequence, n], PackageRow::from_row)?,
            None => stmt.query_map(params![sequence], PackageRow::from_row)?,
        };
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Count of manifest rows still referencing a package
    pub fn manifest_refs_for_package(&self, pkg_id: i64) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM manifests WHERE pkg = ?1",
            [pkg_id],
            |row| row.get(0),
        )?)
    }

    /// Sequences whose manifests reference a package
    pub fn sequences_for_package(&self, pkg_id: i64) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.sequence FROM manifests m
             JOIN sequences s ON m.sequence = s.id
             WHERE m.pkg = ?1 ORDER BY s.id ASC",
        )?;
        let rows = stmt.query_map([pkg_id], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ------------------------------------------------------------------
    // Delta updates

    /// Record a delta edge from `base_version` to `version` of `name`.
    ///
    /// Both endpoint packages must already exist.
    pub fn add_package_update(
        &self,
        name: &str,
        version: &str,
        base_version: &str,
        checksum: Option<&str>,
        requires_reboot: Option<bool>,
    ) -> Result<()> {
        let new = self
            .find_package(name, version)?
            .ok_or_else(|| Error::UnknownPackage {
                name: name.to_string(),
                version: version.to_string(),
            })?;
        let base = self
            .find_package(name, base_version)?
            .ok_or_else(|| Error::UnknownPackage {
                name: name.to_string(),
                version: base_version.to_string(),
            })?;
        self.conn.execute(
            "INSERT OR IGNORE INTO package_updates (pkg_new, pkg_base, requires_reboot, checksum)
             VALUES (?1, ?2, ?3, ?4)",
            params![new.id, base.id, requires_reboot, checksum],
        )?;
        Ok(())
    }

    /// The delta edge from `base_version` to `version`, if recorded
    pub fn package_update(
        &self,
        name: &str,
        version: &str,
        base_version: &str,
    ) -> Result<Option<UpdateRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT base.version, u.checksum, u.requires_reboot
                 FROM package_updates u
                 JOIN packages newp ON u.pkg_new = newp.id
                 JOIN packages base ON u.pkg_base = base.id
                 WHERE newp.name = ?1 AND newp.version = ?2 AND base.version = ?3",
                params![name, version, base_version],
                |row| {
                    Ok(UpdateRow {
                        base_version: row.get(0)?,
                        checksum: row.get(1)?,
                        requires_reboot: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Delta edges landing on this package version, most recent first.
    /// `limit` 0 means all.
    pub fn updates_for_package(
        &self,
        name: &str,
        version: &str,
        limit: usize,
    ) -> Result<Vec<UpdateRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT base.version, u.checksum, u.requires_reboot
             FROM package_updates u
             JOIN packages newp ON u.pkg_new = newp.id
             JOIN packages base ON u.pkg_base = base.id
             WHERE newp.name = ?1 AND newp.version = ?2
             ORDER BY u.id DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![name, version, Self::sql_limit(limit)], |row| {
            Ok(UpdateRow {
                base_version: row.get(0)?,
                checksum: row.get(1)?,
                requires_reboot: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Versions reachable *from* this package version via delta edges,
    /// most recent first. `limit` 0 means all.
    pub fn updates_from_package(
        &self,
        name: &str,
        version: &str,
        limit: usize,
    ) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT newp.version
             FROM package_updates u
             JOIN packages newp ON u.pkg_new = newp.id
             JOIN packages base ON u.pkg_base = base.id
             WHERE base.name = ?1 AND base.version = ?2
             ORDER BY u.id DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![name, version, Self::sql_limit(limit)], |row| {
            row.get(0)
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ------------------------------------------------------------------
    // Sequences and trains

    /// Recent sequences, most recent first unless `oldest_first`.
    /// `train` None means all trains; `limit` 0 means all sequences.
    pub fn recent_sequences_for_train(
        &self,
        train: Option<&str>,
        limit: usize,
        oldest_first: bool,
    ) -> Result<Vec<SequenceRow>> {
        let sql = format!(
            "SELECT s.sequence, t.name
             FROM sequences s JOIN trains t ON s.train = t.id
             {} ORDER BY s.id DESC LIMIT ?1",
            if train.is_some() { "WHERE t.name = ?2" } else { "" }
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let map = |row: &Row| -> rusqlite::Result<SequenceRow> {
            Ok(SequenceRow {
                sequence: row.get(0)?,
                train: row.get(1)?,
            })
        };
        let rows = match train {
            Some(t) => stmt.query_map(params![Self::sql_limit(limit), t], map)?,
            None => stmt.query_map(params![Self::sql_limit(limit)], map)?,
        };
        let mut out = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        if oldest_first {
            out.reverse();
        }
        Ok(out)
    }

    /// Versions of a package published on a train, most recent first.
    ///
    /// A version appearing in several sequences is ordered by its most
    /// recent manifest row (MAX over the manifest index); this is the
    /// deterministic tie-break for repeated versions.
    pub fn recent_package_versions_for_train(
        &self,
        name: &str,
        train: &str,
        limit: usize,
    ) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT p.version
             FROM manifests m
             JOIN sequences s ON m.sequence = s.id
             JOIN trains t ON s.train = t.id
             JOIN packages p ON m.pkg = p.id
             WHERE t.name = ?1 AND p.name = ?2
             GROUP BY p.version
             ORDER BY MAX(m.id) DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![train, name, Self::sql_limit(limit)], |row| {
            row.get(0)
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// The train a sequence was published on
    pub fn train_for_sequence(&self, sequence: &str) -> Result<Option<String>> {
        let row = self
            .conn
            .query_row(
                "SELECT t.name FROM sequences s JOIN trains t ON s.train = t.id
                 WHERE s.sequence = ?1",
                [sequence],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row)
    }

    /// All train names, order unspecified
    pub fn trains(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT name FROM trains")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ------------------------------------------------------------------
    // Delta scripts

    /// Store a delta script for a package as `name -> sha256(text)`.
    ///
    /// The literal text "reboot" is the forced-reboot sentinel and is
    /// stored with checksum "-".
    pub fn add_package_script(&self, pkg_id: i64, script_name: &str, text: &str) -> Result<()> {
        let checksum = if text == "reboot" {
            "-".to_string()
        } else {
            hash::checksum_bytes(text.as_bytes())
        };
        self.conn.execute(
            "INSERT OR REPLACE INTO package_delta_scripts (pkg, script_name, checksum)
             VALUES (?1, ?2, ?3)",
            params![pkg_id, script_name, checksum],
        )?;
        Ok(())
    }

    /// Scripts of a package as `name -> checksum`.
    ///
    /// If any stored checksum is "-", or the requested name is "reboot",
    /// the whole set collapses to the single entry `reboot -> reboot`.
    pub fn scripts_for_package(
        &self,
        pkg_id: i64,
        name: Option<&str>,
    ) -> Result<BTreeMap<String, String>> {
        let sql = format!(
            "SELECT script_name, checksum FROM package_delta_scripts
             WHERE pkg = ?1 {} ORDER BY id ASC",
            if name.is_some() { "AND script_name = ?2" } else { "" }
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let map = |row: &Row| -> rusqlite::Result<(String, String)> {
            Ok((row.get(0)?, row.get(1)?))
        };
        let rows = match name {
            Some(n) => stmt.query_map(params![pkg_id, n], map)?,
            None => stmt.query_map(params![pkg_id], map)?,
        };

        let mut out = BTreeMap::new();
        for row in rows {
            let (script, checksum) = row?;
            if checksum == "-" || script == "reboot" {
                let mut reboot = BTreeMap::new();
                reboot.insert("reboot".to_string(), "reboot".to_string());
                return Ok(reboot);
            }
            out.insert(script, checksum);
        }
        if name == Some("reboot") && !out.is_empty() {
            let mut reboot = BTreeMap::new();
            reboot.insert("reboot".to_string(), "reboot".to_string());
            return Ok(reboot);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Service restarts

    /// Add one service-restart row for updates landing on this package
    pub fn add_service_for_package_update(
        &self,
        pkg_id: i64,
        service: &str,
        restart: bool,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO package_service_restarts (pkg, service_name, restart)
             VALUES (?1, ?2, ?3)",
            params![pkg_id, service, restart],
        )?;
        Ok(())
    }

    /// Replace the full service-restart set for a package
    pub fn set_services_for_package(
        &self,
        pkg_id: i64,
        services: &BTreeMap<String, bool>,
    ) -> Result<()> {
        self.conn.execute(
            "DELETE FROM package_service_restarts WHERE pkg = ?1",
            [pkg_id],
        )?;
        for (service, restart) in services {
            self.add_service_for_package_update(pkg_id, service, *restart)?;
        }
        Ok(())
    }

    /// Service-restart rows of a package as `service -> restart`
    pub fn services_for_package_update(&self, pkg_id: i64) -> Result<BTreeMap<String, bool>> {
        let mut stmt = self.conn.prepare(
            "SELECT service_name, restart FROM package_service_restarts WHERE pkg = ?1",
        )?;
        let rows = stmt.query_map([pkg_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (service, restart) = row?;
            out.insert(service, restart);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Notes and notices

    /// Notes of a sequence as `note name -> filename`
    pub fn notes_for_sequence(&self, sequence: &str) -> Result<BTreeMap<String, String>> {
        let mut stmt = self.conn.prepare(
            "SELECT n.note_name, n.note_file
             FROM release_notes n JOIN sequences s ON n.sequence = s.id
             WHERE s.sequence = ?1",
        )?;
        let rows = stmt.query_map([sequence], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (name, file) = row?;
            out.insert(name, file);
        }
        Ok(out)
    }

    /// The notice text of a sequence, if any
    pub fn notice_for_sequence(&self, sequence: &str) -> Result<Option<String>> {
        let row = self
            .conn
            .query_row(
                "SELECT n.text FROM notices n JOIN sequences s ON n.sequence = s.id
                 WHERE s.sequence = ?1",
                [sequence],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row)
    }

    // ------------------------------------------------------------------
    // Cascading deletes (drivers live in the delete module)

    /// Delete all manifest rows of a sequence
    pub fn delete_manifest_rows(&self, sequence: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM manifests WHERE sequence IN
             (SELECT id FROM sequences WHERE sequence = ?1)",
            [sequence],
        )?;
        Ok(())
    }

    /// Delete one note row, scoped by (sequence, note name)
    pub fn delete_note(&self, sequence: &str, note_name: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM release_notes WHERE note_name = ?1 AND sequence IN
             (SELECT id FROM sequences WHERE sequence = ?2)",
            params![note_name, sequence],
        )?;
        Ok(())
    }

    /// Delete the notice row of a sequence, if present
    pub fn delete_notice(&self, sequence: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM notices WHERE sequence IN
             (SELECT id FROM sequences WHERE sequence = ?1)",
            [sequence],
        )?;
        Ok(())
    }

    /// Delete all delta edges whose new side is this package
    pub fn delete_updates_to_package(&self, pkg_id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM package_updates WHERE pkg_new = ?1", [pkg_id])?;
        Ok(())
    }

    /// Delete a single delta edge
    pub fn delete_update_edge(&self, pkg_new: i64, pkg_base: i64) -> Result<()> {
        self.conn.execute(
            "DELETE FROM package_updates WHERE pkg_new = ?1 AND pkg_base = ?2",
            params![pkg_new, pkg_base],
        )?;
        Ok(())
    }

    /// Delete all service-restart rows of a package
    pub fn delete_services_for_package(&self, pkg_id: i64) -> Result<()> {
        self.conn.execute(
            "DELETE FROM package_service_restarts WHERE pkg = ?1",
            [pkg_id],
        )?;
        Ok(())
    }

    /// Delete all delta-script rows of a package, scoped by the package id
    pub fn delete_scripts_for_package(&self, pkg_id: i64) -> Result<()> {
        self.conn.execute(
            "DELETE FROM package_delta_scripts WHERE pkg = ?1",
            [pkg_id],
        )?;
        Ok(())
    }

    /// Delete a package row
    pub fn delete_package_row(&self, pkg_id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM packages WHERE id = ?1", [pkg_id])?;
        Ok(())
    }

    /// Delete a sequence row
    pub fn delete_sequence_row(&self, sequence: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM sequences WHERE sequence = ?1", [sequence])?;
        Ok(())
    }

    /// SQLite treats a negative LIMIT as "no limit"
    fn sql_limit(limit: usize) -> i64 {
        if limit == 0 {
            -1
        } else {
            limit as i64
        }
    }
}
