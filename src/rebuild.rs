// src/rebuild.rs

//! Database reconstruction from manifest files
//!
//! The manifests on disk are the durable record; the database is derived
//! state. `rebuild` drops the database and replays every manifest in
//! publication order (file mtime, then path), re-ingesting each package in
//! archive-only mode. With `--copy` the archive tree is first duplicated
//! to a new root and the fresh database is built there.

use crate::db::ReleaseDB;
use crate::error::Result;
use crate::ingest::PackageIngestor;
use crate::layout;
use crate::manifest::Manifest;
use crate::verify::Verifier;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Options for a rebuild run
#[derive(Debug, Default)]
pub struct RebuildOptions {
    /// Duplicate the archive to this root and rebuild there
    pub copy: Option<PathBuf>,
    /// Run the verifier after rebuilding
    pub verify: bool,
    /// Skip the rebuild when the database opens cleanly
    pub if_needed: bool,
}

/// Rebuild the database at `db_path` for the archive.
///
/// Returns verifier findings when `verify` was requested, otherwise an
/// empty list. The caller holds the archive lock.
pub fn rebuild(
    archive: &Path,
    db_path: &Path,
    project: &str,
    opts: &RebuildOptions,
) -> Result<Vec<String>> {
    if opts.if_needed && db_path.exists() && ReleaseDB::open(db_path).is_ok() {
        info!("Database opens cleanly, rebuild not needed");
        return Ok(Vec::new());
    }

    let (archive, db_path) = match &opts.copy {
        Some(new_root) => {
            copy_archive(archive, new_root)?;
            let file = db_path
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".release.db"));
            (new_root.clone(), new_root.join(file))
        }
        None => {
            match fs::remove_file(db_path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            (archive.to_path_buf(), db_path.to_path_buf())
        }
    };

    let mut db = ReleaseDB::open(&db_path)?;
    let manifests = manifest_files(&archive)?;
    info!("Rebuilding from {} manifest files", manifests.len());

    for path in manifests {
        if let Err(e) = replay_manifest(&mut db, &archive, &path) {
            warn!("Skipping manifest {}: {}", path.display(), e);
        }
    }

    if opts.verify {
        let verifier = Verifier::new(&db, &archive, project);
        return verifier.check();
    }
    Ok(Vec::new())
}

/// Re-ingest one manifest: packages first, the release row last
fn replay_manifest(db: &mut ReleaseDB, archive: &Path, path: &Path) -> Result<()> {
    let manifest = Manifest::load_path(path)?;
    debug!(
        "Replaying {} (train {}, {} packages)",
        manifest.sequence(),
        manifest.train(),
        manifest.packages().len()
    );

    {
        let ingestor = PackageIngestor::new(db, archive, manifest.train(), false);
        for pkg in manifest.packages() {
            ingestor.ingest_archived(pkg)?;
        }
    }
    db.add_release(&manifest)?;
    Ok(())
}

/// Every manifest file across all trains, sorted by (mtime, path).
///
/// Trains are the top-level directories other than Packages; LATEST
/// symlinks, ChangeLog.txt and the Notes directory are not manifests.
fn manifest_files(archive: &Path) -> Result<Vec<PathBuf>> {
    let mut found: Vec<(SystemTime, PathBuf)> = Vec::new();

    for entry in fs::read_dir(archive)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "Packages" || name == "trains.txt" || name.starts_with('.') {
            continue;
        }
        if !entry.file_type()?.is_dir() {
            continue;
        }

        for file in fs::read_dir(entry.path())? {
            let file = file?;
            let file_name = file.file_name().to_string_lossy().into_owned();
            if file_name == "LATEST" || file_name == "ChangeLog.txt" {
                continue;
            }
            if !file.file_type()?.is_file() {
                continue;
            }
            let mtime = file.metadata()?.modified()?;
            found.push((mtime, file.path()));
        }
    }

    found.sort();
    Ok(found.into_iter().map(|(_, path)| path).collect())
}

/// Duplicate the archive tree (skipping dotfiles) into a new root,
/// preserving symlinks
fn copy_archive(source: &Path, dest: &Path) -> Result<()> {
    info!("Copying archive {} to {}", source.display(), dest.display());
    fs::create_dir_all(dest)?;

    for entry in WalkDir::new(source).min_depth(1) {
        let entry = entry.map_err(std::io::Error::from)?;
        let name = entry.file_name().to_string_lossy();
        if name.starts_with('.') {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(source)
            .expect("walkdir yields paths under its root");
        let target = dest.join(relative);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            match fs::remove_file(&target) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
