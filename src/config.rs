// src/config.rs

//! Project configuration
//!
//! A TOML file maps project names to their archive settings:
//!
//! ```toml
//! [projects.FOO]
//! archive = "/srv/releases/${PROJECT}"
//! database = "/srv/releases/${PROJECT}/.release.db"
//! key = "/etc/railyard/${PROJECT}.key"
//! ```
//!
//! Values are expanded with `${VAR}` environment substitution; `PROJECT`
//! is set to the project name for the duration of the expansion only.
//! Command-line flags override anything from the file.

use crate::error::{Error, Result};
use base64::Engine;
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default database filename inside the archive root
pub const DEFAULT_DB_FILE: &str = ".release.db";

/// The whole configuration file
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectConfig>,
}

/// Per-project settings; all optional, flags fill the gaps
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changelog: Option<String>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn store(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("serializing config: {}", e)))?;
        fs::write(path, text)?;
        Ok(())
    }

    /// Settings for one project with `${VAR}` expansion applied.
    ///
    /// `PROJECT` is visible to the expansion only while this runs.
    pub fn project(&self, name: &str) -> ProjectConfig {
        let Some(raw) = self.projects.get(name) else {
            return ProjectConfig::default();
        };
        let previous = env::var_os("PROJECT");
        env::set_var("PROJECT", name);
        let expanded = ProjectConfig {
            archive: raw.archive.as_deref().map(expand_env),
            database: raw.database.as_deref().map(expand_env),
            key: raw.key.as_deref().map(expand_env),
            changelog: raw.changelog.as_deref().map(expand_env),
        };
        match previous {
            Some(value) => env::set_var("PROJECT", value),
            None => env::remove_var("PROJECT"),
        }
        expanded
    }
}

/// Fully resolved settings a command runs with
#[derive(Debug)]
pub struct Settings {
    pub archive: PathBuf,
    pub database: PathBuf,
    pub project: String,
    pub signing_key: Option<SigningKey>,
    pub changelog: Option<String>,
}

impl Settings {
    /// Merge command-line values over the config file for `project`.
    ///
    /// The archive path is required from one of the two sources; the
    /// database defaults to a dotfile inside the archive.
    pub fn resolve(
        project: &str,
        config: &ConfigFile,
        archive_flag: Option<&Path>,
        database_flag: Option<&Path>,
        key_flag: Option<&Path>,
        changelog_flag: Option<&str>,
    ) -> Result<Self> {
        let from_file = config.project(project);

        let archive = archive_flag
            .map(Path::to_path_buf)
            .or_else(|| from_file.archive.as_deref().map(PathBuf::from))
            .ok_or_else(|| {
                Error::Config(format!(
                    "no archive configured for project {} (use --archive)",
                    project
                ))
            })?;

        let database = database_flag
            .map(Path::to_path_buf)
            .or_else(|| from_file.database.as_deref().map(PathBuf::from))
            .unwrap_or_else(|| archive.join(DEFAULT_DB_FILE));

        let key_path = key_flag
            .map(Path::to_path_buf)
            .or_else(|| from_file.key.as_deref().map(PathBuf::from));
        let signing_key = match key_path {
            Some(path) => Some(load_signing_key(&path)?),
            None => None,
        };

        let changelog = changelog_flag
            .map(str::to_string)
            .or(from_file.changelog);

        debug!(
            "Resolved project {}: archive {}, database {}",
            project,
            archive.display(),
            database.display()
        );
        Ok(Self {
            archive,
            database,
            project: project.to_string(),
            signing_key,
            changelog,
        })
    }
}

/// Load an Ed25519 signing key: a file holding the 32-byte seed as 64 hex
/// characters or as base64
pub fn load_signing_key(path: &Path) -> Result<SigningKey> {
    let text = fs::read_to_string(path)?;
    let text = text.trim();

    let seed: Vec<u8> = if text.len() == 64 && text.chars().all(|c| c.is_ascii_hexdigit()) {
        hex::decode(text).map_err(|e| Error::Signing(format!("{}: {}", path.display(), e)))?
    } else {
        base64::engine::general_purpose::STANDARD
            .decode(text)
            .map_err(|e| Error::Signing(format!("{}: {}", path.display(), e)))?
    };

    let seed: [u8; 32] = seed
        .try_into()
        .map_err(|_| Error::Signing(format!("{}: key must be 32 bytes", path.display())))?;
    Ok(SigningKey::from_bytes(&seed))
}

/// Replace `${NAME}` with the value of the environment variable NAME;
/// unset variables expand to the empty string
fn expand_env(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                if let Ok(val) = env::var(name) {
                    out.push_str(&val);
                }
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}
