// src/manifest.rs

//! Manifest documents
//!
//! A manifest is a JSON document listing the packages of one sequence on
//! one train, plus notes, an optional notice, an optional forced-reboot
//! flag, and an optional Ed25519 signature. Field names keep the
//! historical PascalCase wire format so existing archives stay readable.

use crate::error::{Error, Result};
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::Path;

/// One delta update entry on a manifest package: the base version the
/// delta upgrades from, and the delta file's checksum
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaDesc {
    #[serde(rename = "Version")]
    pub base_version: String,
    #[serde(rename = "Checksum")]
    pub checksum: String,
    #[serde(rename = "Size", default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(
        rename = "RequiresReboot",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub requires_reboot: Option<bool>,
}

/// A package entry in a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestPackage {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Checksum")]
    pub checksum: String,
    #[serde(
        rename = "RequiresReboot",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub requires_reboot: Option<bool>,
    #[serde(rename = "Size", default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(rename = "Updates", default, skip_serializing_if = "Vec::is_empty")]
    pub updates: Vec<DeltaDesc>,
    #[serde(
        rename = "RestartServices",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub restart_services: Option<BTreeMap<String, bool>>,
}

impl ManifestPackage {
    pub fn new(name: &str, version: &str, checksum: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            checksum: checksum.to_string(),
            requires_reboot: None,
            size: None,
            updates: Vec::new(),
            restart_services: None,
        }
    }

    /// Append a delta update entry
    pub fn add_update(
        &mut self,
        base_version: &str,
        checksum: &str,
        size: Option<u64>,
        requires_reboot: Option<bool>,
    ) -> &DeltaDesc {
        self.updates.push(DeltaDesc {
            base_version: base_version.to_string(),
            checksum: checksum.to_string(),
            size,
            requires_reboot,
        });
        self.updates.last().expect("just pushed")
    }

    pub fn set_restart_services(&mut self, services: Option<BTreeMap<String, bool>>) {
        self.restart_services = services;
    }

    /// Canonical archive filename of the whole package
    pub fn file_name(&self) -> String {
        crate::pkgfile::file_name(&self.name, &self.version)
    }

    /// Canonical archive filename of the delta from `base_version`
    pub fn delta_file_name(&self, base_version: &str) -> String {
        crate::pkgfile::delta_file_name(&self.name, base_version, &self.version)
    }
}

/// A manifest document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "Train")]
    train: String,
    #[serde(rename = "Sequence")]
    sequence: String,
    #[serde(rename = "Packages", default)]
    packages: Vec<ManifestPackage>,
    #[serde(rename = "Notes", default, skip_serializing_if = "BTreeMap::is_empty")]
    notes: BTreeMap<String, String>,
    #[serde(rename = "Notice", default, skip_serializing_if = "Option::is_none")]
    notice: Option<String>,
    #[serde(rename = "Reboot", default, skip_serializing_if = "Option::is_none")]
    reboot: Option<bool>,
    #[serde(rename = "Signature", default, skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
}

impl Manifest {
    pub fn new(train: &str, sequence: &str) -> Self {
        Self {
            train: train.to_string(),
            sequence: sequence.to_string(),
            packages: Vec::new(),
            notes: BTreeMap::new(),
            notice: None,
            reboot: None,
            signature: None,
        }
    }

    pub fn train(&self) -> &str {
        &self.train
    }

    pub fn sequence(&self) -> &str {
        &self.sequence
    }

    pub fn set_sequence(&mut self, sequence: &str) {
        self.sequence = sequence.to_string();
    }

    pub fn packages(&self) -> &[ManifestPackage] {
        &self.packages
    }

    pub fn push_package(&mut self, pkg: ManifestPackage) {
        self.packages.push(pkg);
    }

    pub fn set_packages(&mut self, packages: Vec<ManifestPackage>) {
        self.packages = packages;
    }

    pub fn notes(&self) -> &BTreeMap<String, String> {
        &self.notes
    }

    pub fn set_note(&mut self, name: &str, file: &str) {
        self.notes.insert(name.to_string(), file.to_string());
    }

    pub fn clear_notes(&mut self) {
        self.notes.clear();
    }

    pub fn notice(&self) -> Option<&str> {
        self.notice.as_deref()
    }

    pub fn set_notice(&mut self, notice: Option<String>) {
        self.notice = notice;
    }

    pub fn reboot(&self) -> Option<bool> {
        self.reboot
    }

    pub fn set_reboot(&mut self, reboot: Option<bool>) {
        self.reboot = reboot;
    }

    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    /// Load a manifest from a file
    pub fn load_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Manifest(format!("{}: {}", path.display(), e)))
    }

    /// Serialize to a writer
    pub fn store_file<W: Write>(&self, writer: &mut W) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        writer.write_all(json.as_bytes())?;
        writer.write_all(b"\n")?;
        Ok(())
    }

    /// Serialize to a file, replacing any existing content
    pub fn store_path(&self, path: &Path) -> Result<()> {
        let mut file = std::fs::File::create(path)?;
        self.store_file(&mut file)
    }

    /// The bytes a signature covers: the manifest serialized with the
    /// Signature field cleared
    fn signing_bytes(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        Ok(serde_json::to_vec(&unsigned)?)
    }

    /// Sign the manifest with an Ed25519 key, storing the signature as
    /// base64 in the Signature field
    pub fn sign_with_key(&mut self, key: &SigningKey) -> Result<()> {
        let bytes = self.signing_bytes()?;
        let signature = key.sign(&bytes);
        self.signature = Some(
            base64::engine::general_purpose::STANDARD.encode(signature.to_bytes()),
        );
        Ok(())
    }

    /// Check the stored signature against a verifying key
    pub fn verify_signature(&self, key: &VerifyingKey) -> Result<bool> {
        let Some(stored) = &self.signature else {
            return Ok(false);
        };
        let raw = base64::engine::general_purpose::STANDARD
            .decode(stored)
            .map_err(|e| Error::Signing(format!("bad signature encoding: {}", e)))?;
        let raw: [u8; 64] = raw
            .try_into()
            .map_err(|_| Error::Signing("bad signature length".to_string()))?;
        let signature = Signature::from_bytes(&raw);
        Ok(key.verify(&self.signing_bytes()?, &signature).is_ok())
    }
}

/// One semantic difference between two manifests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestDiff {
    Train { a: String, b: String },
    PackageCount { a: usize, b: usize },
    Package { position: usize, a: String, b: String },
    Notice,
    Reboot,
}

impl fmt::Display for ManifestDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Train { a, b } => write!(f, "train differs: {} vs {}", a, b),
            Self::PackageCount { a, b } => {
                write!(f, "package count differs: {} vs {}", a, b)
            }
            Self::Package { position, a, b } => {
                write!(f, "package {} differs: {} vs {}", position, a, b)
            }
            Self::Notice => write!(f, "notice differs"),
            Self::Reboot => write!(f, "reboot flag differs"),
        }
    }
}

/// Compare two manifests semantically.
///
/// Returns an empty list iff they describe the same release content:
/// same train, same ordered (name, version, checksum) package list, same
/// notice and reboot flag. The sequence string, delta descriptors, sizes,
/// note filenames and signature are presentation details and are ignored.
pub fn compare_manifests(a: &Manifest, b: &Manifest) -> Vec<ManifestDiff> {
    let mut diffs = Vec::new();

    if a.train != b.train {
        diffs.push(ManifestDiff::Train {
            a: a.train.clone(),
            b: b.train.clone(),
        });
    }

    if a.packages.len() != b.packages.len() {
        diffs.push(ManifestDiff::PackageCount {
            a: a.packages.len(),
            b: b.packages.len(),
        });
    } else {
        for (i, (pa, pb)) in a.packages.iter().zip(&b.packages).enumerate() {
            if pa.name != pb.name || pa.version != pb.version || pa.checksum != pb.checksum {
                diffs.push(ManifestDiff::Package {
                    position: i,
                    a: format!("{}-{}", pa.name, pa.version),
                    b: format!("{}-{}", pb.name, pb.version),
                });
            }
        }
    }

    if a.notice != b.notice {
        diffs.push(ManifestDiff::Notice);
    }
    if a.reboot != b.reboot {
        diffs.push(ManifestDiff::Reboot);
    }

    diffs
}
