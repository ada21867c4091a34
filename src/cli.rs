// src/cli.rs
//! CLI definitions for the railyard release-archive manager
//!
//! This module contains all command-line interface definitions using clap.
//! The actual command implementations are in the `commands` module.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "railyard")]
#[command(version)]
#[command(about = "Release-train archive manager with delta updates and signed manifests", long_about = None)]
pub struct Cli {
    /// Archive root directory
    #[arg(short = 'a', long, global = true)]
    pub archive: Option<PathBuf>,

    /// Database path (default: .release.db inside the archive)
    #[arg(short = 'D', long, global = true)]
    pub database: Option<PathBuf>,

    /// Project name, used in manifest filenames
    #[arg(short = 'P', long, global = true, default_value = "Railyard")]
    pub project: String,

    /// Ed25519 signing key file (hex or base64 seed)
    #[arg(short = 'K', long, global = true)]
    pub key: Option<PathBuf>,

    /// Configuration file with per-project settings
    #[arg(short = 'C', long, global = true)]
    pub config: Option<PathBuf>,

    /// Changelog to append during add: a file path, or - for stdin
    #[arg(long, global = true)]
    pub changelog: Option<String>,

    /// Enable debug logging (repeat for trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub debug: u8,

    /// Enable verbose logging
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ingest one or more build output directories as new releases
    Add {
        /// Build directories, each holding <PROJECT>-MANIFEST and Packages/
        #[arg(required = true)]
        sources: Vec<PathBuf>,

        /// Log and continue on checksum disagreements instead of failing
        #[arg(long)]
        force: bool,
    },

    /// Check the archive and database for self-consistency
    Check,

    /// Rebuild the database from the manifest files in the archive
    Rebuild {
        /// Copy the archive to this directory and rebuild there
        #[arg(long)]
        copy: Option<PathBuf>,

        /// Run check after rebuilding
        #[arg(long)]
        verify: bool,

        /// Only rebuild when the database does not open cleanly
        #[arg(long)]
        ifneeded: bool,
    },

    /// Print every release, oldest first
    Dump {
        /// Restrict to one train
        #[arg(long)]
        train: Option<String>,
    },

    /// Delete a sequence, a package version, or a delta edge
    Delete {
        #[command(subcommand)]
        target: DeleteTarget,
    },

    /// Remove the newest releases of a train
    Rollback {
        /// How many releases to remove
        #[arg(long, default_value_t = 1)]
        count: usize,

        /// Train to roll back
        train: String,
    },

    /// Remove the oldest releases of a train
    Prune {
        /// How many releases to keep
        #[arg(long, default_value_t = 10)]
        keep: usize,

        /// Train to prune
        train: String,
    },

    /// Recreate a build-style directory from a published release
    Extract {
        /// Destination directory (default: ./<sequence>)
        #[arg(long)]
        dest: Option<PathBuf>,

        /// Also extract delta packages
        #[arg(long)]
        full: bool,

        /// Release to extract: <train>/<sequence> or <sequence>
        release: String,
    },

    /// Show or edit a project's configuration
    Project {
        /// Project name
        name: String,

        /// key=value settings to store (archive, database, key, changelog);
        /// with none, print the current settings
        settings: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum DeleteTarget {
    /// Delete whole sequences with full cascade
    Sequence {
        #[arg(required = true)]
        sequences: Vec<String>,
    },

    /// Delete a package version, or with two versions the delta edge
    /// between them
    Package {
        name: String,

        /// <version>, or <base_version> <version> for a delta edge
        #[arg(required = true, num_args = 1..=2)]
        versions: Vec<String>,
    },
}
