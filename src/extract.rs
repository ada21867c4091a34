// src/extract.rs

//! Extraction of a published release back into a build-style directory
//!
//! The inverse of `add`: given a sequence, recreate a source tree that
//! `add` would accept — the manifest, the package files, note sidecars,
//! NOTICE, RESTART and per-package script directories. With `full` the
//! delta packages of each package come along too.

use crate::db::ReleaseDB;
use crate::error::{Error, Result};
use crate::layout;
use crate::manifest::Manifest;
use crate::pkgfile;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Recreates shippable source trees from the archive
pub struct Extractor<'a> {
    db: &'a ReleaseDB,
    archive: &'a Path,
    project: &'a str,
}

impl<'a> Extractor<'a> {
    pub fn new(db: &'a ReleaseDB, archive: &'a Path, project: &'a str) -> Self {
        Self {
            db,
            archive,
            project,
        }
    }

    /// Extract a release named as `<train>/<sequence>` or plain
    /// `<sequence>` into `dest`
    pub fn extract(&self, spec: &str, dest: &Path, full: bool) -> Result<()> {
        let (train, sequence) = self.resolve(spec)?;
        let manifest_path = layout::manifest_path(self.archive, self.project, &train, &sequence);
        let manifest = Manifest::load_path(&manifest_path)?;
        info!(
            "Extracting {} from train {} to {}",
            sequence,
            train,
            dest.display()
        );

        fs::create_dir_all(dest)?;
        fs::copy(
            &manifest_path,
            dest.join(format!("{}-MANIFEST", self.project)),
        )?;

        let pkg_dest = dest.join("Packages");
        fs::create_dir_all(&pkg_dest)?;
        for pkg in manifest.packages() {
            let file = pkg.file_name();
            fs::copy(
                layout::package_path(self.archive, &file),
                pkg_dest.join(&file),
            )?;
            if full {
                for update in &pkg.updates {
                    let delta = pkg.delta_file_name(&update.base_version);
                    fs::copy(
                        layout::package_path(self.archive, &delta),
                        pkg_dest.join(&delta),
                    )?;
                }
            }
            self.extract_scripts(&pkg.name, &pkg.version, &pkg_dest)?;
        }

        for (note_name, note_file) in manifest.notes() {
            let source = layout::notes_dir(self.archive, &train).join(note_file);
            fs::copy(&source, dest.join(note_name))?;
        }

        if let Some(notice) = manifest.notice() {
            fs::write(dest.join("NOTICE"), notice)?;
        }

        self.write_restart_file(&manifest, dest)?;
        Ok(())
    }

    /// Resolve the user-supplied release spec to (train, sequence)
    fn resolve(&self, spec: &str) -> Result<(String, String)> {
        if let Some((train, sequence)) = spec.split_once('/') {
            return Ok((train.to_string(), sequence.to_string()));
        }
        let train = self
            .db
            .train_for_sequence(spec)?
            .ok_or_else(|| Error::UnknownSequence(spec.to_string()))?;
        Ok((train, spec.to_string()))
    }

    /// Copy the per-package script files into
    /// `<dest>/Packages/<name>-<version>/`, where `add` rediscovers them
    fn extract_scripts(&self, name: &str, version: &str, pkg_dest: &Path) -> Result<()> {
        let aux = layout::package_aux_dir(self.archive, name, version);
        if !aux.is_dir() {
            return Ok(());
        }
        let script_dest = pkg_dest.join(format!("{}-{}", name, version));
        for entry in fs::read_dir(&aux)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name == "Services" || !entry.file_type()?.is_file() {
                continue;
            }
            fs::create_dir_all(&script_dest)?;
            fs::copy(entry.path(), script_dest.join(&file_name))?;
            debug!("Extracted script {} for {}-{}", file_name, name, version);
        }
        Ok(())
    }

    /// Reassemble a RESTART sidecar from the service rows of the
    /// release's packages
    fn write_restart_file(&self, manifest: &Manifest, dest: &Path) -> Result<()> {
        let mut tokens = Vec::new();
        for pkg in manifest.packages() {
            let Some(row) = self.db.find_package(&pkg.name, &pkg.version)? else {
                continue;
            };
            for (service, restart) in self.db.services_for_package_update(row.id)? {
                let token = if restart {
                    service
                } else {
                    format!("{}=no", service)
                };
                if !tokens.contains(&token) {
                    tokens.push(token);
                }
            }
        }
        if tokens.is_empty() {
            return Ok(());
        }
        fs::write(dest.join("RESTART"), tokens.join("\n") + "\n")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestPackage;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn publish(db: &mut ReleaseDB, archive: &Path) {
        fs::create_dir_all(layout::packages_dir(archive)).unwrap();
        fs::create_dir_all(layout::train_dir(archive, "stable")).unwrap();

        fs::write(
            layout::package_path(archive, &pkgfile::file_name("pkgA", "1.0")),
            "payload",
        )
        .unwrap();

        let mut m = Manifest::new("stable", "1");
        m.push_package(ManifestPackage::new("pkgA", "1.0", "ck"));
        m.set_notice(Some("read this first".to_string()));

        let notes = layout::notes_dir(archive, "stable");
        fs::create_dir_all(&notes).unwrap();
        fs::write(notes.join("ReleaseNotes-abc.txt"), "notes body").unwrap();
        m.set_note("ReleaseNotes", "ReleaseNotes-abc.txt");

        m.store_path(&layout::manifest_path(archive, "FOO", "stable", "1"))
            .unwrap();
        db.add_release(&m).unwrap();

        let pkg = db.find_package("pkgA", "1.0").unwrap().unwrap();
        let mut services = BTreeMap::new();
        services.insert("sshd".to_string(), true);
        services.insert("cron".to_string(), false);
        db.set_services_for_package(pkg.id, &services).unwrap();

        fs::create_dir_all(layout::package_aux_dir(archive, "pkgA", "1.0")).unwrap();
        fs::write(
            layout::script_path(archive, "pkgA", "1.0", "post-upgrade"),
            "echo done",
        )
        .unwrap();
    }

    #[test]
    fn test_extract_recreates_source_tree() {
        let dir = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let mut db = ReleaseDB::open_in_memory().unwrap();
        publish(&mut db, dir.path());

        let extractor = Extractor::new(&db, dir.path(), "FOO");
        extractor.extract("1", dest.path(), false).unwrap();

        assert!(dest.path().join("FOO-MANIFEST").exists());
        assert_eq!(
            fs::read_to_string(dest.path().join("Packages/pkgA-1.0.tgz")).unwrap(),
            "payload"
        );
        assert_eq!(
            fs::read_to_string(dest.path().join("ReleaseNotes")).unwrap(),
            "notes body"
        );
        assert_eq!(
            fs::read_to_string(dest.path().join("NOTICE")).unwrap(),
            "read this first"
        );
        assert_eq!(
            fs::read_to_string(dest.path().join("Packages/pkgA-1.0/post-upgrade")).unwrap(),
            "echo done"
        );

        let restart = fs::read_to_string(dest.path().join("RESTART")).unwrap();
        assert!(restart.contains("sshd"));
        assert!(restart.contains("cron=no"));
    }

    #[test]
    fn test_extract_with_train_prefix() {
        let dir = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let mut db = ReleaseDB::open_in_memory().unwrap();
        publish(&mut db, dir.path());

        let extractor = Extractor::new(&db, dir.path(), "FOO");
        extractor.extract("stable/1", dest.path(), false).unwrap();
        assert!(dest.path().join("FOO-MANIFEST").exists());
    }

    #[test]
    fn test_extract_unknown_sequence() {
        let dir = TempDir::new().unwrap();
        let db = ReleaseDB::open_in_memory().unwrap();
        let extractor = Extractor::new(&db, dir.path(), "FOO");
        assert!(matches!(
            extractor.extract("missing", dir.path(), false),
            Err(Error::UnknownSequence(_))
        ));
    }
}
