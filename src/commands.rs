// src/commands.rs
//! Command handlers for the railyard CLI

use crate::cli::{Cli, Commands, DeleteTarget};
use crate::config::{ConfigFile, Settings};
use crate::db::ReleaseDB;
use crate::delete::Deleter;
use crate::extract::Extractor;
use crate::lock::ArchiveLock;
use crate::rebuild::{self, RebuildOptions};
use crate::release::ReleaseProcessor;
use crate::verify::Verifier;
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::PathBuf;
use tracing::info;

/// Dispatch a parsed command line
pub fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => ConfigFile::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ConfigFile::default(),
    };

    // The project editor works on the config file alone
    if let Commands::Project { name, settings } = &cli.command {
        return project_command(cli.config.as_deref().map(PathBuf::from), config, name, settings);
    }

    let settings = Settings::resolve(
        &cli.project,
        &config,
        cli.archive.as_deref(),
        cli.database.as_deref(),
        cli.key.as_deref(),
        cli.changelog.as_deref(),
    )?;

    match cli.command {
        Commands::Add { sources, force } => {
            fs::create_dir_all(&settings.archive)?;
            let _lock = ArchiveLock::acquire(&settings.archive, "add", true)?;
            let mut db = ReleaseDB::open(&settings.database)?;
            let mut processor = ReleaseProcessor::new(
                &mut db,
                &settings.archive,
                &settings.project,
                settings.signing_key.as_ref(),
                settings.changelog.as_deref(),
                !force,
            );
            for source in &sources {
                processor
                    .add(source)
                    .with_context(|| format!("adding {}", source.display()))?;
            }
            Ok(())
        }

        Commands::Check => {
            let db = ReleaseDB::open(&settings.database)?;
            let verifier = Verifier::new(&db, &settings.archive, &settings.project);
            let issues = verifier.check()?;
            for issue in &issues {
                eprintln!("{}", issue);
            }
            if issues.is_empty() {
                info!("Archive is consistent");
            }
            // check reports through stderr, never the exit code
            Ok(())
        }

        Commands::Rebuild {
            copy,
            verify,
            ifneeded,
        } => {
            let _lock = ArchiveLock::acquire(&settings.archive, "rebuild", true)?;
            let opts = RebuildOptions {
                copy,
                verify,
                if_needed: ifneeded,
            };
            let issues =
                rebuild::rebuild(&settings.archive, &settings.database, &settings.project, &opts)?;
            for issue in &issues {
                eprintln!("{}", issue);
            }
            Ok(())
        }

        Commands::Dump { train } => {
            let db = ReleaseDB::open(&settings.database)?;
            for seq in db.recent_sequences_for_train(train.as_deref(), 0, true)? {
                let packages = db.packages_for_sequence(&seq.sequence, None)?;
                let entries: Vec<String> = packages
                    .iter()
                    .map(|p| format!("{}-{}", p.name, p.version))
                    .collect();
                println!("TRAIN={} {} {}", seq.train, seq.sequence, entries.join(" "));
            }
            Ok(())
        }

        Commands::Delete { target } => {
            let _lock = ArchiveLock::acquire(&settings.archive, "delete", true)?;
            let db = ReleaseDB::open(&settings.database)?;
            let deleter = Deleter::new(&db, &settings.archive, &settings.project);
            match target {
                DeleteTarget::Sequence { sequences } => {
                    for sequence in &sequences {
                        deleter.remove_release(sequence)?;
                    }
                }
                DeleteTarget::Package { name, versions } => match versions.as_slice() {
                    [version] => deleter.remove_package(&name, version)?,
                    [base_version, version] => {
                        deleter.remove_package_update(&name, base_version, version)?
                    }
                    _ => bail!("delete package takes one or two versions"),
                },
            }
            Ok(())
        }

        Commands::Rollback { count, train } => {
            let _lock = ArchiveLock::acquire(&settings.archive, "rollback", true)?;
            let db = ReleaseDB::open(&settings.database)?;
            let deleter = Deleter::new(&db, &settings.archive, &settings.project);
            let removed = deleter.rollback(&train, count)?;
            println!("Rolled back {} release(s) on train {}", removed, train);
            Ok(())
        }

        Commands::Prune { keep, train } => {
            let _lock = ArchiveLock::acquire(&settings.archive, "prune", true)?;
            let db = ReleaseDB::open(&settings.database)?;
            let deleter = Deleter::new(&db, &settings.archive, &settings.project);
            let removed = deleter.prune(&train, keep)?;
            println!("Pruned {} release(s) from train {}", removed, train);
            Ok(())
        }

        Commands::Extract {
            dest,
            full,
            release,
        } => {
            let db = ReleaseDB::open(&settings.database)?;
            let dest = dest.unwrap_or_else(|| {
                PathBuf::from(release.rsplit('/').next().unwrap_or(&release))
            });
            let extractor = Extractor::new(&db, &settings.archive, &settings.project);
            extractor.extract(&release, &dest, full)?;
            Ok(())
        }

        Commands::Project { .. } => unreachable!("handled above"),
    }
}

/// `project <name>` prints the stored settings; with `key=value` pairs it
/// updates them in the config file
fn project_command(
    config_path: Option<PathBuf>,
    mut config: ConfigFile,
    name: &str,
    settings: &[String],
) -> Result<()> {
    if settings.is_empty() {
        let project = config.project(name);
        println!("[projects.{}]", name);
        for (key, value) in [
            ("archive", &project.archive),
            ("database", &project.database),
            ("key", &project.key),
            ("changelog", &project.changelog),
        ] {
            if let Some(value) = value {
                println!("{} = \"{}\"", key, value);
            }
        }
        return Ok(());
    }

    let Some(path) = config_path else {
        bail!("editing project settings requires --config");
    };

    let entry = config.projects.entry(name.to_string()).or_default();
    for setting in settings {
        let Some((key, value)) = setting.split_once('=') else {
            bail!("expected key=value, got {:?}", setting);
        };
        let slot = match key {
            "archive" => &mut entry.archive,
            "database" => &mut entry.database,
            "key" => &mut entry.key,
            "changelog" => &mut entry.changelog,
            other => bail!("unknown project setting {:?}", other),
        };
        *slot = if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        };
    }
    config.store(&path)?;
    info!("Updated project {} in {}", name, path.display());
    Ok(())
}
