// tests/common/mod.rs

//! Shared helpers for archive integration tests

use flate2::write::GzEncoder;
use flate2::Compression;
use railyard::manifest::{Manifest, ManifestPackage};
use std::fs::{self, File};
use std::path::Path;
use tar::{Builder, EntryType, Header};

/// Build a gzipped tarball at `path` from (member, content) pairs
pub fn build_tarball(path: &Path, members: &[(&str, &str)]) {
    let out = File::create(path).unwrap();
    let mut builder = Builder::new(GzEncoder::new(out, Compression::default()));
    for (name, content) in members {
        let mut header = Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Regular);
        builder
            .append_data(&mut header, *name, content.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}

/// One package in a fabricated build directory
pub struct SourcePackage<'a> {
    pub name: &'a str,
    pub version: &'a str,
    /// Tarball members as (path, content)
    pub members: &'a [(&'a str, &'a str)],
    /// Delta scripts shipped beside the tarball
    pub scripts: &'a [(&'a str, &'a str)],
}

impl<'a> SourcePackage<'a> {
    pub fn new(name: &'a str, version: &'a str, members: &'a [(&'a str, &'a str)]) -> Self {
        Self {
            name,
            version,
            members,
            scripts: &[],
        }
    }
}

/// Fabricate a build output directory: Packages/ with tarballs and script
/// directories, plus a manifest with computed checksums
pub fn make_source(
    dir: &Path,
    project: &str,
    train: &str,
    sequence: &str,
    packages: &[SourcePackage],
) {
    let pkg_dir = dir.join("Packages");
    fs::create_dir_all(&pkg_dir).unwrap();

    let mut manifest = Manifest::new(train, sequence);
    for pkg in packages {
        let file = pkg_dir.join(format!("{}-{}.tgz", pkg.name, pkg.version));
        build_tarball(&file, pkg.members);
        let checksum = railyard::hash::checksum_file(&file).unwrap();
        manifest.push_package(ManifestPackage::new(pkg.name, pkg.version, &checksum));

        if !pkg.scripts.is_empty() {
            let script_dir = pkg_dir.join(format!("{}-{}", pkg.name, pkg.version));
            fs::create_dir_all(&script_dir).unwrap();
            for (name, text) in pkg.scripts {
                fs::write(script_dir.join(name), text).unwrap();
            }
        }
    }
    manifest
        .store_path(&dir.join(format!("{}-MANIFEST", project)))
        .unwrap();
}
