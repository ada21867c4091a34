// src/pkgfile.rs

//! Package file handling
//!
//! Packages are gzipped tarballs. A full package may carry a `+SERVICES`
//! member declaring the services it provides and their default restart
//! behaviour. A delta package holds the entries that changed between two
//! versions, a `+REMOVALS` member listing paths that went away, and
//! `+SCRIPTS/<name>` members for the update scripts that apply to the
//! upgrade.

use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::Path;
use tar::{Archive, Builder, EntryType, Header};
use tracing::debug;

/// Extension of package and delta-package files
pub const PKG_EXT: &str = "tgz";

/// Member declaring the package's service block
const SERVICES_MEMBER: &str = "+SERVICES";
/// Delta member listing removed paths
const REMOVALS_MEMBER: &str = "+REMOVALS";
/// Prefix of delta members carrying update scripts
const SCRIPTS_PREFIX: &str = "+SCRIPTS/";

/// Canonical filename of a whole package
pub fn file_name(name: &str, version: &str) -> String {
    format!("{}-{}.{}", name, version, PKG_EXT)
}

/// Canonical filename of a delta package
pub fn delta_file_name(name: &str, base_version: &str, version: &str) -> String {
    format!("{}-{}-{}.{}", name, base_version, version, PKG_EXT)
}

/// The `+SERVICES` block of a package
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceBlock {
    #[serde(rename = "Services", default)]
    pub services: Vec<String>,
    #[serde(rename = "Restart", default)]
    pub restart: BTreeMap<String, bool>,
}

impl ServiceBlock {
    pub fn is_empty(&self) -> bool {
        self.services.is_empty() && self.restart.is_empty()
    }
}

/// Summary of a computed delta
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffSummary {
    pub changed: usize,
    pub removed: usize,
}

/// Read the service block of a package, or an empty block if the package
/// does not declare one
pub fn get_package_services(path: &Path) -> Result<ServiceBlock> {
    let mut archive = open_archive(path)?;
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_string_lossy() == SERVICES_MEMBER {
            let mut text = String::new();
            entry.read_to_string(&mut text)?;
            return serde_json::from_str(&text)
                .map_err(|e| Error::Manifest(format!("{}: bad +SERVICES: {}", path.display(), e)));
        }
    }
    Ok(ServiceBlock::default())
}

/// Write a delta package transforming `old_path` into `new_path`.
///
/// Returns `None` without writing anything when the two packages do not
/// differ and `force` is false. Scripts are carried into the delta in the
/// given order. An already-existing `out_path` is a logic bug and fails.
pub fn diff_package_files(
    old_path: &Path,
    new_path: &Path,
    out_path: &Path,
    scripts: &[(String, String)],
    force: bool,
) -> Result<Option<DiffSummary>> {
    let old_digests = entry_digests(old_path)?;
    let new_digests = entry_digests(new_path)?;

    let changed: BTreeSet<String> = new_digests
        .iter()
        .filter(|(path, digest)| old_digests.get(*path) != Some(digest))
        .map(|(path, _)| path.clone())
        .collect();
    let removed: Vec<String> = old_digests
        .keys()
        .filter(|path| !new_digests.contains_key(*path))
        .cloned()
        .collect();

    if changed.is_empty() && removed.is_empty() && !force {
        debug!(
            "No differences between {} and {}",
            old_path.display(),
            new_path.display()
        );
        return Ok(None);
    }

    if out_path.exists() {
        return Err(Error::DeltaExists(out_path.display().to_string()));
    }
    let out = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(out_path)?;
    let mut builder = Builder::new(GzEncoder::new(out, Compression::default()));

    if !removed.is_empty() {
        let listing = removed.join("\n") + "\n";
        append_member(&mut builder, REMOVALS_MEMBER, listing.as_bytes())?;
    }
    for (name, text) in scripts {
        append_member(
            &mut builder,
            &format!("{}{}", SCRIPTS_PREFIX, name),
            text.as_bytes(),
        )?;
    }

    let mut archive = open_archive(new_path)?;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();
        if changed.contains(&path) {
            let header = entry.header().clone();
            builder.append(&header, &mut entry)?;
        }
    }

    builder.into_inner()?.finish()?;

    let summary = DiffSummary {
        changed: changed.len(),
        removed: removed.len(),
    };
    debug!(
        "Delta {}: {} changed, {} removed",
        out_path.display(),
        summary.changed,
        summary.removed
    );
    Ok(Some(summary))
}

fn open_archive(path: &Path) -> Result<Archive<GzDecoder<File>>> {
    Ok(Archive::new(GzDecoder::new(File::open(path)?)))
}

/// Map of entry path -> content digest for a package tarball.
///
/// Non-regular entries (directories, symlinks) are keyed by their header
/// metadata so type changes register as differences.
fn entry_digests(path: &Path) -> Result<BTreeMap<String, String>> {
    let mut archive = open_archive(path)?;
    let mut out = BTreeMap::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.to_string_lossy().into_owned();
        let digest = match entry.header().entry_type() {
            EntryType::Regular => {
                let mut hasher = Sha256::new();
                let mut buf = [0u8; 64 * 1024];
                loop {
                    let n = entry.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                hex::encode(hasher.finalize())
            }
            other => format!(
                "{:?}:{}",
                other,
                entry
                    .link_name()?
                    .map(|l| l.to_string_lossy().into_owned())
                    .unwrap_or_default()
            ),
        };
        out.insert(entry_path, digest);
    }
    Ok(out)
}

fn append_member<W: std::io::Write>(
    builder: &mut Builder<W>,
    name: &str,
    data: &[u8],
) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_entry_type(EntryType::Regular);
    builder.append_data(&mut header, name, data)?;
    Ok(())
}
