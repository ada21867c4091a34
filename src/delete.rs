// src/delete.rs

//! Removal of releases, packages and delta edges
//!
//! Deletion cascades: manifest rows first, then notes and the notice,
//! then each package that no other sequence references, together with its
//! delta files, scripts, service rows and on-disk artifacts. A package
//! that is still the base of someone else's delta edge survives; it is
//! needed for delta regeneration.
//!
//! File unlink failures during a cascade are logged and skipped; the rows
//! still go away and `check` finds any debris.

use crate::db::{PackageRow, ReleaseDB};
use crate::error::{Error, Result};
use crate::layout;
use crate::pkgfile;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Drives removal of sequences, packages and update edges
pub struct Deleter<'a> {
    db: &'a ReleaseDB,
    archive: &'a Path,
    project: &'a str,
}

impl<'a> Deleter<'a> {
    pub fn new(db: &'a ReleaseDB, archive: &'a Path, project: &'a str) -> Self {
        Self {
            db,
            archive,
            project,
        }
    }

    /// Remove one sequence and everything only it references.
    ///
    /// The caller holds the archive lock.
    pub fn remove_release(&self, sequence: &str) -> Result<()> {
        let train = self
            .db
            .train_for_sequence(sequence)?
            .ok_or_else(|| Error::UnknownSequence(sequence.to_string()))?;
        info!("Removing release {} from train {}", sequence, train);

        let packages = self.db.packages_for_sequence(sequence, None)?;
        let notes = self.db.notes_for_sequence(sequence)?;

        self.db.delete_manifest_rows(sequence)?;

        for (note_name, note_file) in &notes {
            let path = layout::notes_dir(self.archive, &train).join(note_file);
            if let Err(e) = fs::remove_file(&path) {
                warn!("Unable to remove note file {}: {}", path.display(), e);
            }
            self.db.delete_note(sequence, note_name)?;
        }
        self.db.delete_notice(sequence)?;

        let mut seen = std::collections::BTreeSet::new();
        for pkg in &packages {
            if seen.insert(pkg.id) {
                self.remove_package_if_orphaned(pkg)?;
            }
        }

        let manifest = layout::manifest_path(self.archive, self.project, &train, sequence);
        if let Err(e) = fs::remove_file(&manifest) {
            warn!("Unable to remove manifest {}: {}", manifest.display(), e);
        }
        self.db.delete_sequence_row(sequence)?;
        Ok(())
    }

    /// Remove a single package version.
    ///
    /// Refuses with [`Error::PackageInUse`] while any manifest row or any
    /// delta edge based on this version still exists.
    pub fn remove_package(&self, name: &str, version: &str) -> Result<()> {
        let pkg = self
            .db
            .find_package(name, version)?
            .ok_or_else(|| Error::UnknownPackage {
                name: name.to_string(),
                version: version.to_string(),
            })?;

        if self.db.manifest_refs_for_package(pkg.id)? > 0
            || !self.db.updates_from_package(name, version, 1)?.is_empty()
        {
            return Err(Error::PackageInUse {
                name: name.to_string(),
                version: version.to_string(),
            });
        }
        self.delete_package_artifacts(&pkg)
    }

    /// Remove one delta edge and its delta file
    pub fn remove_package_update(
        &self,
        name: &str,
        base_version: &str,
        version: &str,
    ) -> Result<()> {
        let new = self
            .db
            .find_package(name, version)?
            .ok_or_else(|| Error::UnknownPackage {
                name: name.to_string(),
                version: version.to_string(),
            })?;
        let base = self
            .db
            .find_package(name, base_version)?
            .ok_or_else(|| Error::UnknownPackage {
                name: name.to_string(),
                version: base_version.to_string(),
            })?;

        self.db.delete_update_edge(new.id, base.id)?;
        let delta = layout::package_path(
            self.archive,
            &pkgfile::delta_file_name(name, base_version, version),
        );
        if let Err(e) = fs::remove_file(&delta) {
            warn!("Unable to remove delta file {}: {}", delta.display(), e);
        }
        Ok(())
    }

    /// Remove the oldest sequences of a train, keeping `keep`
    pub fn prune(&self, train: &str, keep: usize) -> Result<usize> {
        let sequences = self.db.recent_sequences_for_train(Some(train), 0, true)?;
        if sequences.len() <= keep {
            debug!(
                "Train {} has {} sequences, nothing to prune",
                train,
                sequences.len()
            );
            return Ok(0);
        }
        let victims = &sequences[..sequences.len() - keep];
        for seq in victims {
            self.remove_release(&seq.sequence)?;
        }
        Ok(victims.len())
    }

    /// Remove the newest `count` sequences of a train and repoint LATEST
    /// at the surviving newest, or drop it if none survive
    pub fn rollback(&self, train: &str, count: usize) -> Result<usize> {
        let victims = self
            .db
            .recent_sequences_for_train(Some(train), count, false)?;
        for seq in &victims {
            self.remove_release(&seq.sequence)?;
        }

        match self
            .db
            .recent_sequences_for_train(Some(train), 1, false)?
            .first()
        {
            Some(newest) => {
                layout::make_latest(self.archive, self.project, train, &newest.sequence)?
            }
            None => layout::remove_latest(self.archive, train)?,
        }
        Ok(victims.len())
    }

    /// The per-package cascade of a release removal: skip the package when
    /// another sequence still references it or it is still a delta base
    fn remove_package_if_orphaned(&self, pkg: &PackageRow) -> Result<()> {
        if self.db.manifest_refs_for_package(pkg.id)? > 0 {
            debug!(
                "Package {}-{} still referenced by other sequences, keeping",
                pkg.name, pkg.version
            );
            return Ok(());
        }

        // Deltas landing on this version go away with it
        for update in self.db.updates_for_package(&pkg.name, &pkg.version, 0)? {
            let delta = layout::package_path(
                self.archive,
                &pkgfile::delta_file_name(&pkg.name, &update.base_version, &pkg.version),
            );
            if let Err(e) = fs::remove_file(&delta) {
                warn!("Unable to remove delta file {}: {}", delta.display(), e);
            }
        }
        self.db.delete_updates_to_package(pkg.id)?;

        if !self
            .db
            .updates_from_package(&pkg.name, &pkg.version, 1)?
            .is_empty()
        {
            debug!(
                "Package {}-{} is still a delta base, keeping the file",
                pkg.name, pkg.version
            );
            return Ok(());
        }

        self.delete_package_artifacts(pkg)
    }

    /// Remove a package's rows, files and auxiliary directory
    fn delete_package_artifacts(&self, pkg: &PackageRow) -> Result<()> {
        self.db.delete_services_for_package(pkg.id)?;
        self.db.delete_scripts_for_package(pkg.id)?;

        let aux = layout::package_aux_dir(self.archive, &pkg.name, &pkg.version);
        if aux.is_dir() {
            match fs::read_dir(&aux) {
                Ok(entries) => {
                    for entry in entries.flatten() {
                        if let Err(e) = fs::remove_file(entry.path()) {
                            warn!("Unable to remove {}: {}", entry.path().display(), e);
                        }
                    }
                }
                Err(e) => warn!("Unable to list {}: {}", aux.display(), e),
            }
            if let Err(e) = fs::remove_dir(&aux) {
                warn!("Unable to remove directory {}: {}", aux.display(), e);
            }
            // The per-name parent may now be empty too
            if let Some(parent) = aux.parent() {
                let _ = fs::remove_dir(parent);
            }
        }

        let file = layout::package_path(
            self.archive,
            &pkgfile::file_name(&pkg.name, &pkg.version),
        );
        if let Err(e) = fs::remove_file(&file) {
            warn!("Unable to remove package file {}: {}", file.display(), e);
        }
        self.db.delete_package_row(pkg.id)?;
        debug!("Removed package {}-{}", pkg.name, pkg.version);
        Ok(())
    }
}
