// src/release.rs

//! Release processing
//!
//! `add` takes a build output directory, ingests its packages into the
//! archive, writes notes and the manifest, updates LATEST, appends the
//! changelog, and finally records the release in the database. On-disk
//! state always lands before the database row; downstream clients reading
//! the archive mid-add see a consistent prefix.

use crate::db::ReleaseDB;
use crate::error::{Error, Result};
use crate::ingest::PackageIngestor;
use crate::layout;
use crate::manifest::{compare_manifests, Manifest, ManifestPackage};
use ed25519_dalek::SigningKey;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Sidecar note files picked up from the source directory
const NOTE_NAMES: [&str; 2] = ["ReleaseNotes", "ChangeLog"];

/// Orchestrates `add` for whole build directories
pub struct ReleaseProcessor<'a> {
    db: &'a mut ReleaseDB,
    archive: &'a Path,
    project: &'a str,
    signing_key: Option<&'a SigningKey>,
    /// Changelog input: a file path, or "-" for stdin
    changelog: Option<&'a str>,
    fail_on_error: bool,
}

impl<'a> ReleaseProcessor<'a> {
    pub fn new(
        db: &'a mut ReleaseDB,
        archive: &'a Path,
        project: &'a str,
        signing_key: Option<&'a SigningKey>,
        changelog: Option<&'a str>,
        fail_on_error: bool,
    ) -> Self {
        Self {
            db,
            archive,
            project,
            signing_key,
            changelog,
            fail_on_error,
        }
    }

    /// Ingest one build directory as a new release.
    ///
    /// The caller holds the archive lock.
    pub fn add(&mut self, source_dir: &Path) -> Result<()> {
        let manifest_src = source_dir.join(format!("{}-MANIFEST", self.project));
        let mut manifest = Manifest::load_path(&manifest_src)?;
        // Note entries and signatures in a build manifest are stale
        // leftovers (e.g. from an extracted release); they are recreated
        manifest.clear_notes();
        let train = manifest.train().to_string();
        info!(
            "Processing release {} on train {} from {}",
            manifest.sequence(),
            train,
            source_dir.display()
        );

        let note_texts = read_notes(source_dir);
        if let Some(notice) = read_optional(source_dir, "NOTICE") {
            manifest.set_notice(Some(notice));
        }
        let restart_services = read_optional(source_dir, "RESTART")
            .map(|text| parse_restart(&text))
            .unwrap_or_default();
        if let Some(token) = read_optional(source_dir, "FORCEREBOOT") {
            manifest.set_reboot(parse_bool_token(token.trim()));
        }

        fs::create_dir_all(layout::train_dir(self.archive, &train))?;

        // Reserve the manifest path, disambiguating the sequence string;
        // an identical manifest already published is a no-op
        let Some(manifest_path) = self.reserve_manifest_path(&mut manifest, &train)? else {
            return Ok(());
        };

        match self.finish_add(source_dir, &mut manifest, &train, &manifest_path, &note_texts, &restart_services) {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = fs::remove_file(&manifest_path);
                Err(e)
            }
        }
    }

    fn finish_add(
        &mut self,
        source_dir: &Path,
        manifest: &mut Manifest,
        train: &str,
        manifest_path: &Path,
        note_texts: &BTreeMap<String, String>,
        restart_services: &BTreeMap<String, bool>,
    ) -> Result<()> {
        // Per-package ingest, accumulating the possibly-substituted list
        let mut ingested: Vec<ManifestPackage> = Vec::new();
        {
            let ingestor =
                PackageIngestor::new(self.db, self.archive, train, self.fail_on_error);
            for pkg in manifest.packages() {
                let scripts = read_package_scripts(source_dir, &pkg.name, &pkg.version)?;
                let outcome = ingestor.ingest(pkg, source_dir, &scripts, restart_services)?;
                ingested.push(outcome.into_package());
            }
        }
        manifest.set_packages(ingested);

        // A republication of the latest release under a new sequence string
        // changes nothing; drop the reserved file and stop here
        if let Some(latest) = self.load_latest_manifest(train)? {
            if compare_manifests(manifest, &latest).is_empty() {
                info!(
                    "Release {} is identical to published {}, nothing to do",
                    manifest.sequence(),
                    latest.sequence()
                );
                fs::remove_file(manifest_path)?;
                return Ok(());
            }
        }

        // Notes go under <train>/Notes/ with randomized names; the manifest
        // records the basename
        for (note_name, text) in note_texts {
            match write_note_file(self.archive, train, note_name, text) {
                Ok(basename) => manifest.set_note(note_name, &basename),
                Err(e) => warn!("Unable to save note {} in archive: {}", note_name, e),
            }
        }

        if let Some(key) = self.signing_key {
            manifest.sign_with_key(key)?;
        }

        manifest.store_path(manifest_path)?;
        layout::make_latest(self.archive, self.project, train, manifest.sequence())?;

        if let Some(input) = self.changelog {
            self.append_changelog(train, manifest.sequence(), input)?;
        }

        self.db.add_release(manifest)?;
        info!(
            "Added release {} on train {} ({} packages)",
            manifest.sequence(),
            train,
            manifest.packages().len()
        );
        Ok(())
    }

    /// Create the manifest file with O_EXCL, trying `<sequence>`,
    /// `<sequence>-1`, `<sequence>-2`, ... and updating the manifest's
    /// sequence to the winning value.
    ///
    /// Returns None when the colliding file holds an identical manifest,
    /// which makes the whole add a no-op.
    fn reserve_manifest_path(
        &self,
        manifest: &mut Manifest,
        train: &str,
    ) -> Result<Option<PathBuf>> {
        let base = manifest.sequence().to_string();
        let mut suffix = 0u32;
        loop {
            let candidate = if suffix == 0 {
                base.clone()
            } else {
                format!("{}-{}", base, suffix)
            };
            let path = layout::manifest_path(self.archive, self.project, train, &candidate);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => {
                    manifest.set_sequence(&candidate);
                    if suffix != 0 {
                        debug!("Sequence {} disambiguated to {}", base, candidate);
                    }
                    return Ok(Some(path));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let existing = Manifest::load_path(&path)?;
                    if compare_manifests(manifest, &existing).is_empty() {
                        info!("Release {} already published, nothing to do", candidate);
                        return Ok(None);
                    }
                    suffix += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// The manifest LATEST points at, if the symlink exists
    fn load_latest_manifest(&self, train: &str) -> Result<Option<Manifest>> {
        let link = layout::latest_path(self.archive, train);
        match fs::read_link(&link) {
            Ok(target) => {
                let path = layout::train_dir(self.archive, train).join(target);
                Ok(Some(Manifest::load_path(&path)?))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Append the changelog input between START/END marker lines
    fn append_changelog(&self, train: &str, sequence: &str, input: &str) -> Result<()> {
        let content = if input == "-" {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        } else {
            fs::read_to_string(input)?
        };

        let path = layout::changelog_path(self.archive, train);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "### START {}", sequence)?;
        file.write_all(content.as_bytes())?;
        if !content.ends_with('\n') {
            writeln!(file)?;
        }
        writeln!(file, "### END {}", sequence)?;
        Ok(())
    }
}

/// Sidecar ReleaseNotes and ChangeLog files, if present
fn read_notes(source_dir: &Path) -> BTreeMap<String, String> {
    let mut notes = BTreeMap::new();
    for name in NOTE_NAMES {
        if let Some(text) = read_optional(source_dir, name) {
            notes.insert(name.to_string(), text);
        }
    }
    notes
}

fn read_optional(dir: &Path, name: &str) -> Option<String> {
    fs::read_to_string(dir.join(name)).ok()
}

/// Delta scripts shipped beside the package: regular files under
/// `<source>/Packages/<name>-<version>/`, ordered by file name
fn read_package_scripts(
    source_dir: &Path,
    name: &str,
    version: &str,
) -> Result<Vec<(String, String)>> {
    let dir = source_dir
        .join("Packages")
        .join(format!("{}-{}", name, version));
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut scripts = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let script_name = entry.file_name().to_string_lossy().into_owned();
        let text = fs::read_to_string(entry.path())?;
        scripts.push((script_name, text));
    }
    scripts.sort();
    Ok(scripts)
}

/// Create `<archive>/<train>/Notes/<name>-XXXXXX.txt` with the given
/// content, mode 0664, returning the basename
fn write_note_file(archive: &Path, train: &str, name: &str, text: &str) -> Result<String> {
    let dir = layout::notes_dir(archive, train);
    fs::create_dir_all(&dir)?;
    let mut file = tempfile::Builder::new()
        .prefix(&format!("{}-", name))
        .suffix(".txt")
        .tempfile_in(&dir)?;
    file.write_all(text.as_bytes())?;

    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(file.path(), fs::Permissions::from_mode(0o664))?;

    let (_, path) = file
        .keep()
        .map_err(|e| Error::Io(e.error))?;
    let basename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    debug!("Created note file {} for note {}", basename, name);
    Ok(basename)
}

/// Parse a RESTART file: whitespace-separated `service[=bool]` tokens,
/// defaulting to true
fn parse_restart(text: &str) -> BTreeMap<String, bool> {
    let mut out = BTreeMap::new();
    for token in text.split_whitespace() {
        match token.split_once('=') {
            Some((service, value)) => {
                let restart = parse_bool_token(value).unwrap_or(true);
                out.insert(service.to_string(), restart);
            }
            None => {
                out.insert(token.to_string(), true);
            }
        }
    }
    out
}

/// Lenient boolean token: YES/TRUE/1 and NO/FALSE/0 in any case
fn parse_bool_token(token: &str) -> Option<bool> {
    match token.to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" => Some(true),
        "no" | "false" | "0" => Some(false),
        _ => None,
    }
}
