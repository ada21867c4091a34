// src/layout.rs

//! Canonical paths inside a release archive
//!
//! Layout:
//!
//! ```text
//! <archive>/Packages/<name>-<version>.tgz            whole package
//! <archive>/Packages/<name>-<base>-<version>.tgz     delta package
//! <archive>/Packages/<name>/<version>/               per-package aux dir
//! <archive>/Packages/<name>/<version>/Services       service-restart JSON
//! <archive>/Packages/<name>/<version>/<script>       delta script text
//! <archive>/<train>/<project>-<sequence>             manifest
//! <archive>/<train>/LATEST                           symlink to newest manifest
//! <archive>/<train>/Notes/<name>-<random>.txt        note files
//! <archive>/<train>/ChangeLog.txt                    optional changelog
//! <archive>/.lock                                    lockfile
//! ```

use crate::error::Result;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Lockfile inside the archive root
pub fn lock_path(archive: &Path) -> PathBuf {
    archive.join(".lock")
}

/// The shared Packages directory
pub fn packages_dir(archive: &Path) -> PathBuf {
    archive.join("Packages")
}

/// Path of a package or delta-package file by its canonical filename
pub fn package_path(archive: &Path, file_name: &str) -> PathBuf {
    packages_dir(archive).join(file_name)
}

/// Per-package auxiliary directory holding scripts and the service list
pub fn package_aux_dir(archive: &Path, name: &str, version: &str) -> PathBuf {
    packages_dir(archive).join(name).join(version)
}

/// The per-package service-restart JSON file
pub fn services_path(archive: &Path, name: &str, version: &str) -> PathBuf {
    package_aux_dir(archive, name, version).join("Services")
}

/// A delta script file in the per-package directory
pub fn script_path(archive: &Path, name: &str, version: &str, script: &str) -> PathBuf {
    package_aux_dir(archive, name, version).join(script)
}

/// Directory of a train
pub fn train_dir(archive: &Path, train: &str) -> PathBuf {
    archive.join(train)
}

/// Canonical manifest filename for a sequence
pub fn manifest_file_name(project: &str, sequence: &str) -> String {
    format!("{}-{}", project, sequence)
}

/// Path of a sequence's manifest file
pub fn manifest_path(archive: &Path, project: &str, train: &str, sequence: &str) -> PathBuf {
    train_dir(archive, train).join(manifest_file_name(project, sequence))
}

/// Per-train notes directory
pub fn notes_dir(archive: &Path, train: &str) -> PathBuf {
    train_dir(archive, train).join("Notes")
}

/// Per-train changelog file
pub fn changelog_path(archive: &Path, train: &str) -> PathBuf {
    train_dir(archive, train).join("ChangeLog.txt")
}

/// The LATEST symlink of a train
pub fn latest_path(archive: &Path, train: &str) -> PathBuf {
    train_dir(archive, train).join("LATEST")
}

/// Point `<archive>/<train>/LATEST` at the manifest of `sequence`.
///
/// Any existing symlink is unlinked first; a missing one is not an error.
pub fn make_latest(archive: &Path, project: &str, train: &str, sequence: &str) -> Result<()> {
    let link = latest_path(archive, train);
    match fs::remove_file(&link) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    std::os::unix::fs::symlink(manifest_file_name(project, sequence), &link)?;
    Ok(())
}

/// Remove the LATEST symlink of a train, tolerating its absence
pub fn remove_latest(archive: &Path, train: &str) -> Result<()> {
    match fs::remove_file(latest_path(archive, train)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Write the per-package `Services` JSON file
pub fn write_services_file(
    archive: &Path,
    name: &str,
    version: &str,
    services: &BTreeMap<String, bool>,
) -> Result<()> {
    let dir = package_aux_dir(archive, name, version);
    fs::create_dir_all(&dir)?;
    let json = serde_json::to_string_pretty(services)?;
    fs::write(services_path(archive, name, version), json)?;
    Ok(())
}

/// Read the per-package `Services` JSON file, if present
pub fn read_services_file(
    archive: &Path,
    name: &str,
    version: &str,
) -> Result<Option<BTreeMap<String, bool>>> {
    let path = services_path(archive, name, version);
    match fs::read_to_string(&path) {
        Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
