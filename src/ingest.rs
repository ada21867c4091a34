// src/ingest.rs

//! Per-package ingest
//!
//! For a single (package, train) pair: verify or record the checksum, copy
//! the package into the archive, generate delta packages against prior
//! versions on the same train, compose delta scripts and service-restart
//! lists along the version chain, and record everything in the database.
//!
//! Callers hold the archive lock for the whole mutation window.

use crate::db::ReleaseDB;
use crate::error::{Error, Result};
use crate::hash;
use crate::layout;
use crate::manifest::ManifestPackage;
use crate::pkgfile;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// How many prior versions on the train get delta packages
const PRIOR_VERSION_LIMIT: usize = 5;

/// Copy buffer for package files
const COPY_BUF_SIZE: usize = 1024 * 1024;

/// What happened to a package during ingest
#[derive(Debug)]
pub enum IngestOutcome {
    /// The package was copied in and recorded
    Ingested(ManifestPackage),
    /// The package file was already archived; the manifest entry was
    /// reconstructed from the database
    Reused(ManifestPackage),
    /// The new version did not differ from the previous one; the release
    /// silently republishes the prior version
    NoOpDowngrade(ManifestPackage),
}

impl IngestOutcome {
    /// The package entry to put on the manifest being built
    pub fn into_package(self) -> ManifestPackage {
        match self {
            Self::Ingested(pkg) | Self::Reused(pkg) | Self::NoOpDowngrade(pkg) => pkg,
        }
    }
}

/// A delta edge discovered during ingest, recorded in step order
struct Edge {
    base_version: String,
    checksum: String,
    size: u64,
    requires_reboot: Option<bool>,
}

/// Ingests one package at a time into an archive and database
pub struct PackageIngestor<'a> {
    db: &'a ReleaseDB,
    archive: &'a Path,
    train: &'a str,
    fail_on_error: bool,
}

impl<'a> PackageIngestor<'a> {
    pub fn new(db: &'a ReleaseDB, archive: &'a Path, train: &'a str, fail_on_error: bool) -> Self {
        Self {
            db,
            archive,
            train,
            fail_on_error,
        }
    }

    /// Ingest a manifest-declared package from a build output directory.
    ///
    /// `scripts` are the caller's delta scripts in order; `restart_services`
    /// the caller's service-restart requests. On failure every file this
    /// call created is unlinked before returning.
    pub fn ingest(
        &self,
        pkg: &ManifestPackage,
        source_dir: &Path,
        scripts: &[(String, String)],
        restart_services: &BTreeMap<String, bool>,
    ) -> Result<IngestOutcome> {
        let mut created: Vec<PathBuf> = Vec::new();
        let result = self.ingest_inner(pkg, source_dir, scripts, restart_services, &mut created);
        if result.is_err() {
            for path in created {
                let _ = fs::remove_file(&path);
            }
        }
        result
    }

    fn ingest_inner(
        &self,
        declared: &ManifestPackage,
        source_dir: &Path,
        scripts: &[(String, String)],
        restart_services: &BTreeMap<String, bool>,
        created: &mut Vec<PathBuf>,
    ) -> Result<IngestOutcome> {
        let mut pkg = declared.clone();
        // Declared update lists and service lists are recomputed here, not
        // trusted from the build manifest
        pkg.updates.clear();
        pkg.restart_services = None;
        let file_name = pkg.file_name();
        let src = source_dir.join("Packages").join(&file_name);

        // Step 1: verify or record the checksum
        let computed = hash::checksum_file(&src)?;
        if !pkg.checksum.is_empty() && pkg.checksum != computed {
            if self.fail_on_error {
                return Err(Error::ChecksumMismatch {
                    file: src.display().to_string(),
                    expected: pkg.checksum.clone(),
                    found: computed,
                });
            }
            warn!(
                "Package {}-{}: manifest checksum {} disagrees with computed {}, using computed",
                pkg.name, pkg.version, pkg.checksum, computed
            );
        }
        pkg.checksum = computed;

        // Step 2: already-present short-circuit
        fs::create_dir_all(layout::packages_dir(self.archive))?;
        let dest = layout::package_path(self.archive, &file_name);
        if dest.exists() {
            let found = hash::checksum_file(&dest)?;
            if found != pkg.checksum {
                if self.fail_on_error {
                    return Err(Error::ChecksumMismatch {
                        file: dest.display().to_string(),
                        expected: pkg.checksum.clone(),
                        found,
                    });
                }
                warn!(
                    "Archived {} disagrees with incoming checksum, keeping archived copy",
                    file_name
                );
            }
            if !scripts.is_empty() {
                warn!(
                    "Scripts for {}-{} ignored: package already archived",
                    pkg.name, pkg.version
                );
            }
            debug!("Package {} already archived, reusing", file_name);
            let existing = self.reconstruct_from_db(&pkg.name, &pkg.version, &pkg.checksum)?;
            return Ok(IngestOutcome::Reused(existing));
        }

        // Step 3: copy into the archive; a file appearing here is a bug
        copy_file(&src, &dest)?;
        created.push(dest.clone());

        // Step 4: service discovery and pruning
        let block = pkgfile::get_package_services(&dest)?;
        let pruned: BTreeMap<String, bool> = restart_services
            .iter()
            .filter(|(name, _)| block.services.contains(name))
            .filter(|(name, restart)| block.restart.get(name.as_str()) != Some(restart))
            .map(|(name, restart)| (name.clone(), *restart))
            .collect();
        let service_list = if pruned.is_empty() { None } else { Some(pruned) };

        // Step 5: delta packages against prior versions on this train
        let priors: Vec<String> = self
            .db
            .recent_package_versions_for_train(&pkg.name, self.train, PRIOR_VERSION_LIMIT)?
            .into_iter()
            .filter(|version| *version != pkg.version)
            .collect();

        let pkg_default_reboot = pkg.requires_reboot.unwrap_or(true);
        let mut edges: Vec<Edge> = Vec::new();

        if let Some(newest_prior) = priors.first() {
            let old_path =
                layout::package_path(self.archive, &pkgfile::file_name(&pkg.name, newest_prior));
            let delta_path =
                layout::package_path(self.archive, &pkg.delta_file_name(newest_prior));

            match pkgfile::diff_package_files(&old_path, &dest, &delta_path, scripts, false)? {
                None => {
                    // No-op downgrade: this publication silently becomes a
                    // republication of the prior version
                    fs::remove_file(&dest)?;
                    info!(
                        "{}: no diffs between {} and {}, downgrading to prior version",
                        pkg.name, newest_prior, pkg.version
                    );
                    let prior =
                        self.reconstruct_from_db(&pkg.name, newest_prior, "")?;
                    return Ok(IngestOutcome::NoOpDowngrade(prior));
                }
                Some(summary) => {
                    created.push(delta_path.clone());
                    let checksum = hash::checksum_file(&delta_path)?;
                    let size = fs::metadata(&delta_path)?.len();
                    let requires_reboot = if scripts.iter().any(|(n, _)| n == "reboot") {
                        Some(true)
                    } else if !scripts.is_empty() {
                        Some(false)
                    } else if let Some(restart) = restart_services.get("reboot") {
                        Some(*restart)
                    } else {
                        None
                    };
                    debug!(
                        "Delta {} -> {}: {} changed, {} removed",
                        newest_prior, pkg.version, summary.changed, summary.removed
                    );
                    edges.push(Edge {
                        base_version: newest_prior.clone(),
                        checksum,
                        size,
                        requires_reboot,
                    });
                }
            }

            // Chain to older prior versions
            for i in 1..priors.len() {
                if let Some(edge) = self.chain_delta(
                    &pkg,
                    &priors,
                    i,
                    &dest,
                    scripts,
                    service_list.as_ref(),
                    pkg_default_reboot,
                    created,
                )? {
                    edges.push(edge);
                }
            }
        }

        // Step 6: package row, services, scripts
        if let Some(existing) = self.db.find_package(&pkg.name, &pkg.version)? {
            if existing.checksum.as_deref() != Some(pkg.checksum.as_str()) {
                if self.fail_on_error {
                    return Err(Error::ChecksumMismatch {
                        file: file_name,
                        expected: existing.checksum.unwrap_or_default(),
                        found: pkg.checksum,
                    });
                }
                warn!(
                    "Stored checksum for {}-{} disagrees with incoming, updating",
                    pkg.name, pkg.version
                );
                self.db.set_package_checksum(existing.id, &pkg.checksum)?;
            }
        }
        let pkg_id =
            self.db
                .add_package(&pkg.name, &pkg.version, pkg_default_reboot, &pkg.checksum)?;

        if let Some(services) = &service_list {
            self.db.set_services_for_package(pkg_id, services)?;
            layout::write_services_file(self.archive, &pkg.name, &pkg.version, services)?;
            pkg.set_restart_services(Some(services.clone()));
        }

        for (script_name, text) in scripts {
            let path = layout::script_path(self.archive, &pkg.name, &pkg.version, script_name);
            if let Err(e) = fs::create_dir_all(path.parent().expect("script path has parent"))
                .and_then(|_| fs::write(&path, text))
            {
                warn!("Unable to save script {} for {}: {}", script_name, pkg.name, e);
                continue;
            }
            created.push(path);
            self.db.add_package_script(pkg_id, script_name, text)?;
        }

        // Step 7: delta edges. A NULL reboot override persists the
        // package's own default.
        for edge in &edges {
            self.db.add_package_update(
                &pkg.name,
                &pkg.version,
                &edge.base_version,
                Some(&edge.checksum),
                Some(edge.requires_reboot.unwrap_or(pkg_default_reboot)),
            )?;
            pkg.add_update(
                &edge.base_version,
                &edge.checksum,
                Some(edge.size),
                edge.requires_reboot,
            );
        }

        pkg.size = Some(fs::metadata(&dest)?.len());
        Ok(IngestOutcome::Ingested(pkg))
    }

    /// Build the forced delta from `priors[i]` to `pkg`, accumulating
    /// scripts and service-restart lists along the intermediate versions.
    #[allow(clippy::too_many_arguments)]
    fn chain_delta(
        &self,
        pkg: &ManifestPackage,
        priors: &[String],
        i: usize,
        dest: &Path,
        scripts: &[(String, String)],
        service_list: Option<&BTreeMap<String, bool>>,
        pkg_default_reboot: bool,
        created: &mut Vec<PathBuf>,
    ) -> Result<Option<Edge>> {
        let base_version = &priors[i];
        let old_path =
            layout::package_path(self.archive, &pkgfile::file_name(&pkg.name, base_version));
        if !old_path.exists() {
            warn!(
                "Prior package {}-{} missing from archive, skipping delta",
                pkg.name, base_version
            );
            return Ok(None);
        }

        // Walk the upgrade hops oldest first: each hop's effects are those
        // attached to the hop's target version.
        let mut targets: Vec<&str> = priors[..i].iter().rev().map(String::as_str).collect();
        targets.push(&pkg.version);

        let mut merged_services: Option<BTreeMap<String, bool>> = None;
        let mut acc_scripts: Vec<(String, String)> = Vec::new();
        let mut any_reboot = false;

        for target in targets {
            let (t_scripts, t_services, t_reboot) = if target == pkg.version {
                let sv = service_list.cloned().unwrap_or_default();
                let rb = scripts.iter().any(|(n, _)| n == "reboot")
                    || (scripts.is_empty() && sv.is_empty() && pkg_default_reboot);
                (scripts.to_vec(), sv, rb)
            } else {
                self.hop_effects(&pkg.name, target)?
            };

            // Union with true-wins; a hop with nothing explicit falls the
            // whole chain back to the package default
            if t_services.is_empty() {
                merged_services = None;
            } else {
                let merged = merged_services.get_or_insert_with(BTreeMap::new);
                for (service, restart) in t_services {
                    let entry = merged.entry(service).or_insert(restart);
                    *entry = *entry || restart;
                }
            }

            for (name, text) in t_scripts {
                if name == "reboot" {
                    continue;
                }
                if name.starts_with("pre-") {
                    acc_scripts.insert(0, (name, text));
                } else {
                    acc_scripts.push((name, text));
                }
            }

            any_reboot |= t_reboot;
        }

        let needs_reboot = any_reboot
            && merged_services.as_ref().map_or(true, BTreeMap::is_empty)
            && pkg_default_reboot;
        let (delta_scripts, requires_reboot) = if needs_reboot {
            // Collapse the script set to the reboot sentinel
            (
                vec![("reboot".to_string(), "reboot".to_string())],
                Some(true),
            )
        } else {
            let rb = if !acc_scripts.is_empty() {
                Some(false)
            } else if let Some(restart) =
                merged_services.as_ref().and_then(|m| m.get("reboot"))
            {
                Some(*restart)
            } else {
                None
            };
            (acc_scripts, rb)
        };

        let delta_path = layout::package_path(self.archive, &pkg.delta_file_name(base_version));
        // Forced: the delta path is preserved even when the diff is empty
        pkgfile::diff_package_files(&old_path, dest, &delta_path, &delta_scripts, true)?;
        created.push(delta_path.clone());

        let checksum = hash::checksum_file(&delta_path)?;
        let size = fs::metadata(&delta_path)?.len();
        Ok(Some(Edge {
            base_version: base_version.clone(),
            checksum,
            size,
            requires_reboot,
        }))
    }

    /// Scripts (with text), service list, and reboot requirement attached
    /// to one archived package version
    fn hop_effects(
        &self,
        name: &str,
        version: &str,
    ) -> Result<(Vec<(String, String)>, BTreeMap<String, bool>, bool)> {
        let Some(row) = self.db.find_package(name, version)? else {
            warn!("Package {}-{} missing from database", name, version);
            return Ok((Vec::new(), BTreeMap::new(), false));
        };

        let hashes = self.db.scripts_for_package(row.id, None)?;
        let is_reboot = hashes.get("reboot").map(String::as_str) == Some("reboot");

        let mut scripts = Vec::new();
        if !is_reboot {
            for script_name in hashes.keys() {
                let path = layout::script_path(self.archive, name, version, script_name);
                match fs::read_to_string(&path) {
                    Ok(text) => scripts.push((script_name.clone(), text)),
                    Err(e) => warn!(
                        "Unable to read script {} of {}-{}: {}",
                        script_name, name, version, e
                    ),
                }
            }
        }

        let services = self.db.services_for_package_update(row.id)?;
        let reboot =
            is_reboot || (scripts.is_empty() && services.is_empty() && row.requires_reboot);
        Ok((scripts, services, reboot))
    }

    /// Rebuild-mode ingest: the archive already holds the files; recompute
    /// checksums, rediscover services and scripts from disk, and recreate
    /// rows from the manifest's own update descriptors.
    pub fn ingest_archived(&self, pkg: &ManifestPackage) -> Result<()> {
        let dest = layout::package_path(self.archive, &pkg.file_name());
        let checksum = hash::checksum_file(&dest)?;
        let default_reboot = pkg.requires_reboot.unwrap_or(true);
        let pkg_id = self
            .db
            .add_package(&pkg.name, &pkg.version, default_reboot, &checksum)?;

        if let Some(services) = layout::read_services_file(self.archive, &pkg.name, &pkg.version)? {
            self.db.set_services_for_package(pkg_id, &services)?;
        }

        let aux = layout::package_aux_dir(self.archive, &pkg.name, &pkg.version);
        if aux.is_dir() {
            for entry in fs::read_dir(&aux)? {
                let entry = entry?;
                let script_name = entry.file_name().to_string_lossy().into_owned();
                if script_name == "Services" || !entry.file_type()?.is_file() {
                    continue;
                }
                let text = fs::read_to_string(entry.path())?;
                self.db.add_package_script(pkg_id, &script_name, &text)?;
            }
        }

        for update in &pkg.updates {
            if self.db.find_package(&pkg.name, &update.base_version)?.is_none() {
                let base_path = layout::package_path(
                    self.archive,
                    &pkgfile::file_name(&pkg.name, &update.base_version),
                );
                let base_checksum = if base_path.exists() {
                    hash::checksum_file(&base_path)?
                } else {
                    String::new()
                };
                self.db
                    .add_package(&pkg.name, &update.base_version, true, &base_checksum)?;
            }
            let delta_path = layout::package_path(
                self.archive,
                &pkg.delta_file_name(&update.base_version),
            );
            let delta_checksum = if delta_path.exists() {
                hash::checksum_file(&delta_path)?
            } else {
                update.checksum.clone()
            };
            self.db.add_package_update(
                &pkg.name,
                &pkg.version,
                &update.base_version,
                Some(&delta_checksum),
                Some(update.requires_reboot.unwrap_or(default_reboot)),
            )?;
        }

        Ok(())
    }

    /// Build the manifest entry for an archived package from the database,
    /// including all of its recorded delta edges
    fn reconstruct_from_db(
        &self,
        name: &str,
        version: &str,
        fallback_checksum: &str,
    ) -> Result<ManifestPackage> {
        let file_name = pkgfile::file_name(name, version);
        let row = self.db.find_package(name, version)?;

        let mut pkg = match &row {
            Some(row) => {
                let mut pkg = ManifestPackage::new(
                    name,
                    version,
                    row.checksum.as_deref().unwrap_or(fallback_checksum),
                );
                pkg.requires_reboot = Some(row.requires_reboot);
                pkg
            }
            None => {
                // File exists but the database has no row: record it now
                let path = layout::package_path(self.archive, &file_name);
                let checksum = if fallback_checksum.is_empty() {
                    hash::checksum_file(&path)?
                } else {
                    fallback_checksum.to_string()
                };
                self.db.add_package(name, version, true, &checksum)?;
                ManifestPackage::new(name, version, &checksum)
            }
        };

        let path = layout::package_path(self.archive, &file_name);
        if let Ok(meta) = fs::metadata(&path) {
            pkg.size = Some(meta.len());
        }

        for update in self.db.updates_for_package(name, version, 0)? {
            let delta_path = layout::package_path(
                self.archive,
                &pkgfile::delta_file_name(name, &update.base_version, version),
            );
            let size = fs::metadata(&delta_path).map(|m| m.len()).ok();
            pkg.add_update(
                &update.base_version,
                update.checksum.as_deref().unwrap_or(""),
                size,
                update.requires_reboot,
            );
        }

        if let Some(row) = &row {
            let services = self.db.services_for_package_update(row.id)?;
            if !services.is_empty() {
                pkg.set_restart_services(Some(services));
            }
        }

        Ok(pkg)
    }
}

/// Copy a file with a bounded buffer; the destination must not exist
fn copy_file(src: &Path, dest: &Path) -> Result<()> {
    let mut input = File::open(src)?;
    let mut output = OpenOptions::new().write(true).create_new(true).open(dest)?;
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        output.write_all(&buf[..n])?;
    }
    Ok(())
}
