// src/verify.rs

//! Archive consistency checking
//!
//! A read-only walk comparing three views of the archive: the directory
//! tree, the manifest files, and the database. Every mismatch is recorded;
//! the walk never stops at the first problem. `check` exits 0 regardless,
//! reporting through stderr.

use crate::db::ReleaseDB;
use crate::error::Result;
use crate::hash;
use crate::layout;
use crate::manifest::Manifest;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Read-only archive/database consistency checker
pub struct Verifier<'a> {
    db: &'a ReleaseDB,
    archive: &'a Path,
    project: &'a str,
}

impl<'a> Verifier<'a> {
    pub fn new(db: &'a ReleaseDB, archive: &'a Path, project: &'a str) -> Self {
        Self {
            db,
            archive,
            project,
        }
    }

    /// Walk the whole archive and return every inconsistency found
    pub fn check(&self) -> Result<Vec<String>> {
        let mut issues = Vec::new();
        let trains = self.db.trains()?;

        self.check_top_level(&trains, &mut issues)?;

        // file name -> declared checksum, across all manifests
        let mut expected_packages: BTreeMap<String, String> = BTreeMap::new();
        // file name -> sequences referencing it, for reporting
        let mut referencing: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for train in &trains {
            self.check_train(train, &mut expected_packages, &mut referencing, &mut issues)?;
        }

        self.check_packages_dir(&expected_packages, &referencing, &mut issues)?;
        Ok(issues)
    }

    /// The archive root should hold exactly Packages plus one directory
    /// per train; trains.txt and dotfiles (lock, database) are tolerated
    fn check_top_level(&self, trains: &[String], issues: &mut Vec<String>) -> Result<()> {
        let mut expected: BTreeSet<String> = trains.iter().cloned().collect();
        expected.insert("Packages".to_string());

        let mut found = BTreeSet::new();
        for entry in fs::read_dir(self.archive)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == "trains.txt" || name.starts_with('.') {
                continue;
            }
            if !entry.file_type()?.is_dir() {
                issues.push(format!("{} is not a directory", entry.path().display()));
                continue;
            }
            found.insert(name);
        }

        for missing in expected.difference(&found) {
            issues.push(format!("Missing archive top-level entry {}", missing));
        }
        for unexpected in found.difference(&expected) {
            issues.push(format!("Unexpected archive top-level entry {}", unexpected));
        }
        Ok(())
    }

    /// One train: its directory must hold exactly the manifests of its
    /// sequences plus LATEST and an optional ChangeLog.txt; its manifests
    /// feed the expected-package map; its Notes directory must match the
    /// notes its manifests declare
    fn check_train(
        &self,
        train: &str,
        expected_packages: &mut BTreeMap<String, String>,
        referencing: &mut BTreeMap<String, BTreeSet<String>>,
        issues: &mut Vec<String>,
    ) -> Result<()> {
        let train_dir = layout::train_dir(self.archive, train);
        debug!("Checking train {}", train);

        let sequences = self.db.recent_sequences_for_train(Some(train), 0, true)?;
        let mut expected: BTreeSet<String> = sequences
            .iter()
            .map(|s| layout::manifest_file_name(self.project, &s.sequence))
            .collect();
        // A train rolled back to empty has no LATEST either
        if !sequences.is_empty() {
            expected.insert("LATEST".to_string());
        }

        let mut found = BTreeSet::new();
        match fs::read_dir(&train_dir) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry?;
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if name == "Notes" || name == "ChangeLog.txt" {
                        continue;
                    }
                    found.insert(name);
                }
            }
            Err(e) => {
                issues.push(format!("Unable to read train directory {}: {}", train, e));
                return Ok(());
            }
        }

        for missing in expected.difference(&found) {
            issues.push(format!(
                "Expected sequence file {} not found in train {}",
                missing, train
            ));
        }
        for unexpected in found.difference(&expected) {
            issues.push(format!("Unexpected entry in train {}: {}", train, unexpected));
        }

        let mut referenced_notes: BTreeSet<String> = BTreeSet::new();
        for seq in &sequences {
            let path = layout::manifest_path(self.archive, self.project, train, &seq.sequence);
            let manifest = match Manifest::load_path(&path) {
                Ok(m) => m,
                Err(e) => {
                    issues.push(format!("Unable to load manifest {}: {}", path.display(), e));
                    continue;
                }
            };
            self.collect_manifest_packages(
                &manifest,
                &seq.sequence,
                train,
                expected_packages,
                referencing,
                issues,
            );
            for note_file in manifest.notes().values() {
                referenced_notes.insert(note_file.clone());
                if !layout::notes_dir(self.archive, train).join(note_file).is_file() {
                    issues.push(format!(
                        "Note file {} referenced by sequence {} is missing",
                        note_file, seq.sequence
                    ));
                }
            }
        }

        // Every file under Notes/ must be referenced by some manifest
        let notes_dir = layout::notes_dir(self.archive, train);
        if notes_dir.is_dir() {
            for entry in fs::read_dir(&notes_dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if !referenced_notes.contains(&name) {
                    issues.push(format!("Unreferenced note file {} in train {}", name, train));
                }
            }
        }
        Ok(())
    }

    /// Record a manifest's packages and deltas in the expected map,
    /// flagging checksum conflicts between manifests
    fn collect_manifest_packages(
        &self,
        manifest: &Manifest,
        sequence: &str,
        train: &str,
        expected_packages: &mut BTreeMap<String, String>,
        referencing: &mut BTreeMap<String, BTreeSet<String>>,
        issues: &mut Vec<String>,
    ) {
        for pkg in manifest.packages() {
            let file = pkg.file_name();
            referencing
                .entry(file.clone())
                .or_default()
                .insert(sequence.to_string());
            match expected_packages.get(&file) {
                Some(known) if known != &pkg.checksum => {
                    issues.push(format!(
                        "Package {}-{} already found with a different checksum \
                         (again in sequence {} on train {})",
                        pkg.name, pkg.version, sequence, train
                    ));
                }
                Some(_) => {}
                None => {
                    expected_packages.insert(file, pkg.checksum.clone());
                }
            }

            for update in &pkg.updates {
                let delta = pkg.delta_file_name(&update.base_version);
                referencing
                    .entry(delta.clone())
                    .or_default()
                    .insert(sequence.to_string());
                match expected_packages.get(&delta) {
                    Some(known) if known != &update.checksum => {
                        issues.push(format!(
                            "Package update {} {}->{} already found with a different checksum \
                             (again in sequence {} on train {})",
                            pkg.name, update.base_version, pkg.version, sequence, train
                        ));
                    }
                    Some(_) => {}
                    None => {
                        expected_packages.insert(delta, update.checksum.clone());
                    }
                }
            }
        }
    }

    /// Compare the Packages directory against everything the manifests
    /// declare; checksums must match and nothing may be unaccounted for.
    ///
    /// A file no manifest references is still legitimate while the
    /// database accounts for it: a package kept as the base of a delta
    /// edge after its own releases were removed, and the deltas landing
    /// on it.
    fn check_packages_dir(
        &self,
        expected_packages: &BTreeMap<String, String>,
        referencing: &BTreeMap<String, BTreeSet<String>>,
        issues: &mut Vec<String>,
    ) -> Result<()> {
        let packages_dir = layout::packages_dir(self.archive);
        let db_files = self.database_package_files()?;
        let mut found: BTreeSet<String> = BTreeSet::new();

        if packages_dir.is_dir() {
            for entry in fs::read_dir(&packages_dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                // Per-package aux directories live alongside the tarballs
                if entry.file_type()?.is_dir() {
                    continue;
                }
                found.insert(name.clone());

                let Some(expected) = expected_packages.get(&name) else {
                    if db_files.contains(&name) {
                        debug!("Package file {} kept by the database only", name);
                    } else {
                        issues.push(format!("Unexpected package file {}", name));
                    }
                    continue;
                };
                if expected.is_empty() {
                    continue;
                }
                let actual = hash::checksum_file(&entry.path())?;
                if &actual != expected {
                    let sequences = referencing
                        .get(&name)
                        .map(|s| s.iter().cloned().collect::<Vec<_>>().join(", "))
                        .unwrap_or_default();
                    issues.push(format!(
                        "Package {} has a different checksum than expected (sequences: {})",
                        name, sequences
                    ));
                }
            }
        }

        for missing in expected_packages.keys() {
            if !found.contains(missing) {
                issues.push(format!("Did not find expected package file {}", missing));
            }
        }
        Ok(())
    }

    /// Every file name the database accounts for: one per package row
    /// plus one per recorded delta edge
    fn database_package_files(&self) -> Result<BTreeSet<String>> {
        let mut out = BTreeSet::new();
        for pkg in self.db.all_packages()? {
            out.insert(crate::pkgfile::file_name(&pkg.name, &pkg.version));
            for update in self.db.updates_for_package(&pkg.name, &pkg.version, 0)? {
                out.insert(crate::pkgfile::delta_file_name(
                    &pkg.name,
                    &update.base_version,
                    &pkg.version,
                ));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestPackage;
    use crate::pkgfile;
    use tempfile::TempDir;

    fn publish(
        db: &mut ReleaseDB,
        archive: &Path,
        train: &str,
        sequence: &str,
        pkgs: &[(&str, &str, &str)],
    ) {
        let mut m = Manifest::new(train, sequence);
        fs::create_dir_all(layout::packages_dir(archive)).unwrap();
        fs::create_dir_all(layout::train_dir(archive, train)).unwrap();
        for (name, version, content) in pkgs {
            let path = layout::package_path(archive, &pkgfile::file_name(name, version));
            fs::write(&path, content).unwrap();
            let checksum = hash::checksum_file(&path).unwrap();
            m.push_package(ManifestPackage::new(name, version, &checksum));
        }
        m.store_path(&layout::manifest_path(archive, "FOO", train, sequence))
            .unwrap();
        layout::make_latest(archive, "FOO", train, sequence).unwrap();
        db.add_release(&m).unwrap();
    }

    #[test]
    fn test_clean_archive_passes() {
        let dir = TempDir::new().unwrap();
        let mut db = ReleaseDB::open_in_memory().unwrap();
        publish(&mut db, dir.path(), "stable", "1", &[("pkgA", "1.0", "v1")]);

        let verifier = Verifier::new(&db, dir.path(), "FOO");
        assert_eq!(verifier.check().unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_corrupted_package_reported_with_sequences() {
        let dir = TempDir::new().unwrap();
        let mut db = ReleaseDB::open_in_memory().unwrap();
        publish(&mut db, dir.path(), "stable", "1", &[("pkgA", "1.0", "v1")]);

        fs::write(
            layout::package_path(dir.path(), &pkgfile::file_name("pkgA", "1.0")),
            "truncated",
        )
        .unwrap();

        let verifier = Verifier::new(&db, dir.path(), "FOO");
        let issues = verifier.check().unwrap();
        assert_eq!(issues.len(), 1);
        assert!(issues[0]
            .contains("Package pkgA-1.0.tgz has a different checksum than expected"));
        assert!(issues[0].contains("1"));
    }

    #[test]
    fn test_missing_and_unexpected_files_reported() {
        let dir = TempDir::new().unwrap();
        let mut db = ReleaseDB::open_in_memory().unwrap();
        publish(&mut db, dir.path(), "stable", "1", &[("pkgA", "1.0", "v1")]);

        fs::remove_file(layout::package_path(
            dir.path(),
            &pkgfile::file_name("pkgA", "1.0"),
        ))
        .unwrap();
        fs::write(layout::package_path(dir.path(), "stray-9.9.tgz"), "stray").unwrap();
        fs::write(dir.path().join("junk"), "junk").unwrap();

        let verifier = Verifier::new(&db, dir.path(), "FOO");
        let issues = verifier.check().unwrap();
        assert!(issues
            .iter()
            .any(|i| i.contains("Did not find expected package file pkgA-1.0.tgz")));
        assert!(issues
            .iter()
            .any(|i| i.contains("Unexpected package file stray-9.9.tgz")));
        assert!(issues.iter().any(|i| i.contains("junk")));
    }

    #[test]
    fn test_missing_manifest_reported() {
        let dir = TempDir::new().unwrap();
        let mut db = ReleaseDB::open_in_memory().unwrap();
        publish(&mut db, dir.path(), "stable", "1", &[("pkgA", "1.0", "v1")]);
        fs::remove_file(layout::manifest_path(dir.path(), "FOO", "stable", "1")).unwrap();

        let verifier = Verifier::new(&db, dir.path(), "FOO");
        let issues = verifier.check().unwrap();
        assert!(issues
            .iter()
            .any(|i| i.contains("Expected sequence file FOO-1 not found in train stable")));
    }

    #[test]
    fn test_delta_base_without_manifest_accepted() {
        let dir = TempDir::new().unwrap();
        let mut db = ReleaseDB::open_in_memory().unwrap();
        publish(&mut db, dir.path(), "stable", "2", &[("pkgA", "2.0", "v2")]);

        // A base version no manifest references any more, kept on disk
        // because the 1.0 -> 2.0 delta still needs it
        let base = layout::package_path(dir.path(), &pkgfile::file_name("pkgA", "1.0"));
        fs::write(&base, "v1").unwrap();
        let delta =
            layout::package_path(dir.path(), &pkgfile::delta_file_name("pkgA", "1.0", "2.0"));
        fs::write(&delta, "delta").unwrap();
        db.add_package("pkgA", "1.0", true, &hash::checksum_bytes(b"v1"))
            .unwrap();
        db.add_package_update("pkgA", "2.0", "1.0", Some("dck"), None)
            .unwrap();

        let verifier = Verifier::new(&db, dir.path(), "FOO");
        assert_eq!(verifier.check().unwrap(), Vec::<String>::new());

        // A file neither the manifests nor the database account for is
        // still flagged
        fs::write(layout::package_path(dir.path(), "stray-9.9.tgz"), "stray").unwrap();
        let issues = verifier.check().unwrap();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("Unexpected package file stray-9.9.tgz"));
    }

    #[test]
    fn test_train_emptied_by_rollback_accepted() {
        let dir = TempDir::new().unwrap();
        let mut db = ReleaseDB::open_in_memory().unwrap();
        publish(&mut db, dir.path(), "stable", "1", &[("pkgA", "1.0", "v1")]);

        // Remove the whole release the way rollback does, leaving the
        // empty train directory behind
        db.delete_manifest_rows("1").unwrap();
        db.delete_sequence_row("1").unwrap();
        let pkg = db.find_package("pkgA", "1.0").unwrap().unwrap();
        db.delete_package_row(pkg.id).unwrap();
        fs::remove_file(layout::package_path(
            dir.path(),
            &pkgfile::file_name("pkgA", "1.0"),
        ))
        .unwrap();
        fs::remove_file(layout::manifest_path(dir.path(), "FOO", "stable", "1")).unwrap();
        layout::remove_latest(dir.path(), "stable").unwrap();

        let verifier = Verifier::new(&db, dir.path(), "FOO");
        assert_eq!(verifier.check().unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_unreferenced_note_reported() {
        let dir = TempDir::new().unwrap();
        let mut db = ReleaseDB::open_in_memory().unwrap();
        publish(&mut db, dir.path(), "stable", "1", &[("pkgA", "1.0", "v1")]);

        let notes = layout::notes_dir(dir.path(), "stable");
        fs::create_dir_all(&notes).unwrap();
        fs::write(notes.join("ReleaseNotes-zzz.txt"), "orphan").unwrap();

        let verifier = Verifier::new(&db, dir.path(), "FOO");
        let issues = verifier.check().unwrap();
        assert!(issues
            .iter()
            .any(|i| i.contains("Unreferenced note file ReleaseNotes-zzz.txt")));
    }
}
