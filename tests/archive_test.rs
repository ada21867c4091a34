// tests/archive_test.rs

//! End-to-end archive scenarios: publishing, deltas, republication,
//! rollback, verification and extraction

mod common;

use common::{make_source, SourcePackage};
use railyard::db::ReleaseDB;
use railyard::delete::Deleter;
use railyard::extract::Extractor;
use railyard::layout;
use railyard::release::ReleaseProcessor;
use railyard::verify::Verifier;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const PROJECT: &str = "FOO";

fn add(db: &mut ReleaseDB, archive: &Path, source: &Path) {
    let mut processor = ReleaseProcessor::new(db, archive, PROJECT, None, None, true);
    processor.add(source).unwrap();
}

fn open_db(archive: &Path) -> ReleaseDB {
    ReleaseDB::open(&archive.join(".release.db")).unwrap()
}

fn sequences(db: &ReleaseDB, train: &str) -> Vec<String> {
    db.recent_sequences_for_train(Some(train), 0, true)
        .unwrap()
        .into_iter()
        .map(|s| s.sequence)
        .collect()
}

#[test]
fn test_fresh_add() {
    let archive = TempDir::new().unwrap();
    let src = TempDir::new().unwrap();
    make_source(
        src.path(),
        PROJECT,
        "stable",
        "1",
        &[SourcePackage::new("pkgA", "1.0", &[("bin/tool", "v1")])],
    );

    let mut db = open_db(archive.path());
    add(&mut db, archive.path(), src.path());

    let pkg_file = layout::package_path(archive.path(), "pkgA-1.0.tgz");
    assert!(pkg_file.exists());
    let row = db.find_package("pkgA", "1.0").unwrap().unwrap();
    assert_eq!(
        row.checksum.as_deref().unwrap(),
        railyard::hash::checksum_file(&pkg_file).unwrap()
    );

    assert!(layout::manifest_path(archive.path(), PROJECT, "stable", "1").exists());
    let latest = fs::read_link(layout::latest_path(archive.path(), "stable")).unwrap();
    assert_eq!(latest.to_string_lossy(), "FOO-1");

    assert_eq!(sequences(&db, "stable"), vec!["1"]);
    assert_eq!(db.packages_for_sequence("1", None).unwrap().len(), 1);
}

#[test]
fn test_second_add_creates_delta() {
    let archive = TempDir::new().unwrap();
    let mut db = open_db(archive.path());

    let src1 = TempDir::new().unwrap();
    make_source(
        src1.path(),
        PROJECT,
        "stable",
        "1",
        &[SourcePackage::new("pkgA", "1.0", &[("bin/tool", "v1")])],
    );
    add(&mut db, archive.path(), src1.path());

    let src2 = TempDir::new().unwrap();
    make_source(
        src2.path(),
        PROJECT,
        "stable",
        "2",
        &[SourcePackage::new("pkgA", "2.0", &[("bin/tool", "v2")])],
    );
    add(&mut db, archive.path(), src2.path());

    assert!(layout::package_path(archive.path(), "pkgA-2.0.tgz").exists());
    let delta = layout::package_path(archive.path(), "pkgA-1.0-2.0.tgz");
    assert!(delta.exists());

    let edge = db.package_update("pkgA", "2.0", "1.0").unwrap().unwrap();
    assert_eq!(
        edge.checksum.as_deref().unwrap(),
        railyard::hash::checksum_file(&delta).unwrap()
    );

    // The published manifest advertises the delta
    let manifest = railyard::Manifest::load_path(&layout::manifest_path(
        archive.path(),
        PROJECT,
        "stable",
        "2",
    ))
    .unwrap();
    assert_eq!(manifest.packages()[0].updates.len(), 1);
    assert_eq!(manifest.packages()[0].updates[0].base_version, "1.0");

    let latest = fs::read_link(layout::latest_path(archive.path(), "stable")).unwrap();
    assert_eq!(latest.to_string_lossy(), "FOO-2");
    assert_eq!(sequences(&db, "stable"), vec!["1", "2"]);
}

#[test]
fn test_republish_same_source_is_noop() {
    let archive = TempDir::new().unwrap();
    let mut db = open_db(archive.path());

    let src = TempDir::new().unwrap();
    make_source(
        src.path(),
        PROJECT,
        "stable",
        "1",
        &[SourcePackage::new("pkgA", "1.0", &[("bin/tool", "v1")])],
    );
    add(&mut db, archive.path(), src.path());
    add(&mut db, archive.path(), src.path());

    assert_eq!(sequences(&db, "stable"), vec!["1"]);
}

#[test]
fn test_republish_under_new_sequence_is_noop() {
    let archive = TempDir::new().unwrap();
    let mut db = open_db(archive.path());

    let members: &[(&str, &str)] = &[("bin/tool", "v1")];
    let src1 = TempDir::new().unwrap();
    make_source(
        src1.path(),
        PROJECT,
        "stable",
        "1",
        &[SourcePackage::new("pkgA", "1.0", members)],
    );
    add(&mut db, archive.path(), src1.path());

    // Same content, different sequence string
    let src2 = TempDir::new().unwrap();
    make_source(
        src2.path(),
        PROJECT,
        "stable",
        "1b",
        &[SourcePackage::new("pkgA", "1.0", members)],
    );
    add(&mut db, archive.path(), src2.path());

    assert_eq!(sequences(&db, "stable"), vec!["1"]);
    assert!(!layout::manifest_path(archive.path(), PROJECT, "stable", "1b").exists());
}

#[test]
fn test_no_op_downgrade_reverts_to_prior_version() {
    let archive = TempDir::new().unwrap();
    let mut db = open_db(archive.path());

    let members: &[(&str, &str)] = &[("bin/tool", "v1")];
    let src1 = TempDir::new().unwrap();
    make_source(
        src1.path(),
        PROJECT,
        "stable",
        "1",
        &[SourcePackage::new("pkgA", "1.0", members)],
    );
    add(&mut db, archive.path(), src1.path());

    // A new version whose contents diff to nothing against 1.0
    let src2 = TempDir::new().unwrap();
    make_source(
        src2.path(),
        PROJECT,
        "stable",
        "2",
        &[SourcePackage::new("pkgA", "1.1", members)],
    );
    add(&mut db, archive.path(), src2.path());

    // The publication silently became a republication of 1.0
    assert_eq!(sequences(&db, "stable"), vec!["1"]);
    assert!(db.find_package("pkgA", "1.1").unwrap().is_none());
    assert!(!layout::package_path(archive.path(), "pkgA-1.1.tgz").exists());
    assert!(!layout::package_path(archive.path(), "pkgA-1.0-1.1.tgz").exists());
    assert!(!layout::manifest_path(archive.path(), PROJECT, "stable", "2").exists());
}

#[test]
fn test_rollback_restores_previous_state() {
    let archive = TempDir::new().unwrap();
    let mut db = open_db(archive.path());

    let src1 = TempDir::new().unwrap();
    make_source(
        src1.path(),
        PROJECT,
        "stable",
        "1",
        &[SourcePackage::new("pkgA", "1.0", &[("bin/tool", "v1")])],
    );
    add(&mut db, archive.path(), src1.path());

    let src2 = TempDir::new().unwrap();
    make_source(
        src2.path(),
        PROJECT,
        "stable",
        "2",
        &[SourcePackage::new("pkgA", "2.0", &[("bin/tool", "v2")])],
    );
    add(&mut db, archive.path(), src2.path());

    let deleter = Deleter::new(&db, archive.path(), PROJECT);
    assert_eq!(deleter.rollback("stable", 1).unwrap(), 1);

    assert!(!layout::package_path(archive.path(), "pkgA-2.0.tgz").exists());
    assert!(!layout::package_path(archive.path(), "pkgA-1.0-2.0.tgz").exists());
    assert!(db.package_update("pkgA", "2.0", "1.0").unwrap().is_none());
    assert!(db.find_package("pkgA", "2.0").unwrap().is_none());
    assert!(db.find_package("pkgA", "1.0").unwrap().is_some());
    assert!(!layout::manifest_path(archive.path(), PROJECT, "stable", "2").exists());

    let latest = fs::read_link(layout::latest_path(archive.path(), "stable")).unwrap();
    assert_eq!(latest.to_string_lossy(), "FOO-1");
    assert_eq!(sequences(&db, "stable"), vec!["1"]);

    // The archive is still internally consistent
    let verifier = Verifier::new(&db, archive.path(), PROJECT);
    assert_eq!(verifier.check().unwrap(), Vec::<String>::new());
}

#[test]
fn test_reboot_script_forces_reboot_edge() {
    let archive = TempDir::new().unwrap();
    let mut db = open_db(archive.path());

    for (seq, version, content) in [("1", "1.0", "v1"), ("2", "2.0", "v2")] {
        let src = TempDir::new().unwrap();
        make_source(
            src.path(),
            PROJECT,
            "stable",
            seq,
            &[SourcePackage::new("pkgA", version, &[("bin/tool", content)])],
        );
        add(&mut db, archive.path(), src.path());
    }

    let src3 = TempDir::new().unwrap();
    make_source(
        src3.path(),
        PROJECT,
        "stable",
        "3",
        &[SourcePackage {
            name: "pkgA",
            version: "3.0",
            members: &[("bin/tool", "v3")],
            scripts: &[("reboot", "reboot")],
        }],
    );
    add(&mut db, archive.path(), src3.path());

    let edge = db.package_update("pkgA", "3.0", "2.0").unwrap().unwrap();
    assert_eq!(edge.requires_reboot, Some(true));
    // The chained delta from 1.0 also exists
    assert!(db.package_update("pkgA", "3.0", "1.0").unwrap().is_some());
    assert!(layout::package_path(archive.path(), "pkgA-1.0-3.0.tgz").exists());

    let pkg = db.find_package("pkgA", "3.0").unwrap().unwrap();
    let scripts = db.scripts_for_package(pkg.id, None).unwrap();
    assert_eq!(scripts.len(), 1);
    assert_eq!(scripts["reboot"], "reboot");
}

#[test]
fn test_check_reports_corruption() {
    let archive = TempDir::new().unwrap();
    let mut db = open_db(archive.path());

    let src = TempDir::new().unwrap();
    make_source(
        src.path(),
        PROJECT,
        "stable",
        "1",
        &[SourcePackage::new("pkgA", "1.0", &[("bin/tool", "v1")])],
    );
    add(&mut db, archive.path(), src.path());

    fs::write(
        layout::package_path(archive.path(), "pkgA-1.0.tgz"),
        "truncated",
    )
    .unwrap();

    let verifier = Verifier::new(&db, archive.path(), PROJECT);
    let issues = verifier.check().unwrap();
    assert!(issues
        .iter()
        .any(|i| i.contains("Package pkgA-1.0.tgz has a different checksum than expected")));
}

#[test]
fn test_extract_then_add_into_fresh_archive() {
    let archive = TempDir::new().unwrap();
    let mut db = open_db(archive.path());

    let src = TempDir::new().unwrap();
    fs::create_dir_all(src.path()).unwrap();
    make_source(
        src.path(),
        PROJECT,
        "stable",
        "1",
        &[SourcePackage::new("pkgA", "1.0", &[("bin/tool", "v1")])],
    );
    fs::write(src.path().join("NOTICE"), "important").unwrap();
    fs::write(src.path().join("ReleaseNotes"), "long form notes").unwrap();
    add(&mut db, archive.path(), src.path());

    let extracted = TempDir::new().unwrap();
    let extractor = Extractor::new(&db, archive.path(), PROJECT);
    extractor.extract("1", extracted.path(), false).unwrap();

    // The extracted tree is a valid build directory for a fresh archive
    let fresh = TempDir::new().unwrap();
    let mut fresh_db = open_db(fresh.path());
    add(&mut fresh_db, fresh.path(), extracted.path());

    assert_eq!(sequences(&fresh_db, "stable"), vec!["1"]);
    assert!(layout::package_path(fresh.path(), "pkgA-1.0.tgz").exists());
    let manifest = railyard::Manifest::load_path(&layout::manifest_path(
        fresh.path(),
        PROJECT,
        "stable",
        "1",
    ))
    .unwrap();
    assert_eq!(manifest.notice(), Some("important"));
    assert_eq!(manifest.packages().len(), 1);

    let verifier = Verifier::new(&fresh_db, fresh.path(), PROJECT);
    assert_eq!(verifier.check().unwrap(), Vec::<String>::new());
}

#[test]
fn test_restart_services_recorded() {
    let archive = TempDir::new().unwrap();
    let mut db = open_db(archive.path());

    let src = TempDir::new().unwrap();
    make_source(
        src.path(),
        PROJECT,
        "stable",
        "1",
        &[SourcePackage::new(
            "pkgA",
            "1.0",
            &[
                ("bin/tool", "v1"),
                (
                    "+SERVICES",
                    r#"{"Services": ["sshd", "cron"], "Restart": {"sshd": false}}"#,
                ),
            ],
        )],
    );
    // sshd differs from the package default, cron matches nothing declared
    fs::write(src.path().join("RESTART"), "sshd unknown=no").unwrap();
    add(&mut db, archive.path(), src.path());

    let pkg = db.find_package("pkgA", "1.0").unwrap().unwrap();
    let services = db.services_for_package_update(pkg.id).unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services["sshd"], true);

    // Persisted beside the package for rebuild
    let on_disk = layout::read_services_file(archive.path(), "pkgA", "1.0")
        .unwrap()
        .unwrap();
    assert_eq!(on_disk, services);
}

#[test]
fn test_rebuild_reproduces_database() {
    let archive = TempDir::new().unwrap();
    {
        let mut db = open_db(archive.path());
        for (seq, version, content) in [("1", "1.0", "v1"), ("2", "2.0", "v2")] {
            let src = TempDir::new().unwrap();
            make_source(
                src.path(),
                PROJECT,
                "stable",
                seq,
                &[SourcePackage::new("pkgA", version, &[("bin/tool", content)])],
            );
            add(&mut db, archive.path(), src.path());
        }
    }

    let db_path = archive.path().join(".release.db");
    fs::remove_file(&db_path).unwrap();

    let opts = railyard::rebuild::RebuildOptions {
        verify: true,
        ..Default::default()
    };
    let issues = railyard::rebuild::rebuild(archive.path(), &db_path, PROJECT, &opts).unwrap();
    assert!(issues.is_empty(), "verifier found: {:?}", issues);

    let db = ReleaseDB::open(&db_path).unwrap();
    assert_eq!(sequences(&db, "stable"), vec!["1", "2"]);
    assert!(db.find_package("pkgA", "1.0").unwrap().is_some());
    assert!(db.package_update("pkgA", "2.0", "1.0").unwrap().is_some());
}

/// Member (name, content) pairs of a delta tarball, in entry order
fn delta_members(path: &Path) -> Vec<(String, String)> {
    use std::io::Read;
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(
        fs::File::open(path).unwrap(),
    ));
    let mut out = Vec::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let name = entry.path().unwrap().to_string_lossy().into_owned();
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        out.push((name, content));
    }
    out
}

#[test]
fn test_chain_delta_merges_scripts_and_services() {
    let archive = TempDir::new().unwrap();
    let mut db = open_db(archive.path());

    let src1 = TempDir::new().unwrap();
    make_source(
        src1.path(),
        PROJECT,
        "stable",
        "1",
        &[SourcePackage::new("pkgA", "1.0", &[("bin/tool", "v1")])],
    );
    add(&mut db, archive.path(), src1.path());

    // 2.0 carries an ordered script pair and flips sshd off
    let src2 = TempDir::new().unwrap();
    make_source(
        src2.path(),
        PROJECT,
        "stable",
        "2",
        &[SourcePackage {
            name: "pkgA",
            version: "2.0",
            members: &[
                ("bin/tool", "v2"),
                (
                    "+SERVICES",
                    r#"{"Services": ["sshd"], "Restart": {"sshd": true}}"#,
                ),
            ],
            scripts: &[("pre-flight", "stop things"), ("upgrade", "step two")],
        }],
    );
    fs::write(src2.path().join("RESTART"), "sshd=no").unwrap();
    add(&mut db, archive.path(), src2.path());

    // 3.0 adds its own script and flips sshd back on
    let src3 = TempDir::new().unwrap();
    make_source(
        src3.path(),
        PROJECT,
        "stable",
        "3",
        &[SourcePackage {
            name: "pkgA",
            version: "3.0",
            members: &[
                ("bin/tool", "v3"),
                (
                    "+SERVICES",
                    r#"{"Services": ["sshd"], "Restart": {"sshd": false}}"#,
                ),
            ],
            scripts: &[("post-upgrade", "step three")],
        }],
    );
    fs::write(src3.path().join("RESTART"), "sshd").unwrap();
    add(&mut db, archive.path(), src3.path());

    // The chained delta accumulates every hop's scripts, pre-* first,
    // then the changed entries of 3.0
    let members = delta_members(&layout::package_path(
        archive.path(),
        "pkgA-1.0-3.0.tgz",
    ));
    let names: Vec<&str> = members.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "+SCRIPTS/pre-flight",
            "+SCRIPTS/upgrade",
            "+SCRIPTS/post-upgrade",
            "bin/tool",
            "+SERVICES",
        ]
    );
    assert_eq!(members[0].1, "stop things");
    assert_eq!(members[1].1, "step two");
    assert_eq!(members[2].1, "step three");

    // Scripts along the chain mean the upgrade does not force a reboot
    let chained = db.package_update("pkgA", "3.0", "1.0").unwrap().unwrap();
    assert_eq!(chained.requires_reboot, Some(false));
    let direct = db.package_update("pkgA", "3.0", "2.0").unwrap().unwrap();
    assert_eq!(direct.requires_reboot, Some(false));

    // The published manifest carries the same merged edge metadata
    let manifest = railyard::Manifest::load_path(&layout::manifest_path(
        archive.path(),
        PROJECT,
        "stable",
        "3",
    ))
    .unwrap();
    let update = manifest.packages()[0]
        .updates
        .iter()
        .find(|u| u.base_version == "1.0")
        .unwrap();
    assert_eq!(update.requires_reboot, Some(false));
}

#[test]
fn test_chain_plain_hop_clears_service_merge() {
    let archive = TempDir::new().unwrap();
    let mut db = open_db(archive.path());

    let src1 = TempDir::new().unwrap();
    make_source(
        src1.path(),
        PROJECT,
        "stable",
        "1",
        &[SourcePackage::new("pkgA", "1.0", &[("bin/tool", "v1")])],
    );
    add(&mut db, archive.path(), src1.path());

    // 2.0 declares a service restart instead of a reboot
    let src2 = TempDir::new().unwrap();
    make_source(
        src2.path(),
        PROJECT,
        "stable",
        "2",
        &[SourcePackage::new(
            "pkgA",
            "2.0",
            &[
                ("bin/tool", "v2"),
                (
                    "+SERVICES",
                    r#"{"Services": ["sshd"], "Restart": {"sshd": true}}"#,
                ),
            ],
        )],
    );
    fs::write(src2.path().join("RESTART"), "sshd=no").unwrap();
    add(&mut db, archive.path(), src2.path());

    // 3.0 says nothing explicit, so the whole 1.0 -> 3.0 chain falls
    // back to the package default and forces a reboot
    let src3 = TempDir::new().unwrap();
    make_source(
        src3.path(),
        PROJECT,
        "stable",
        "3",
        &[SourcePackage::new("pkgA", "3.0", &[("bin/tool", "v3")])],
    );
    add(&mut db, archive.path(), src3.path());

    let chained = db.package_update("pkgA", "3.0", "1.0").unwrap().unwrap();
    assert_eq!(chained.requires_reboot, Some(true));

    let members = delta_members(&layout::package_path(
        archive.path(),
        "pkgA-1.0-3.0.tgz",
    ));
    assert!(members
        .iter()
        .any(|(n, c)| n == "+SCRIPTS/reboot" && c == "reboot"));
}

#[test]
fn test_check_clean_after_prune_keeps_delta_base() {
    let archive = TempDir::new().unwrap();
    let mut db = open_db(archive.path());

    for (seq, version, content) in [("1", "1.0", "v1"), ("2", "2.0", "v2")] {
        let src = TempDir::new().unwrap();
        make_source(
            src.path(),
            PROJECT,
            "stable",
            seq,
            &[SourcePackage::new("pkgA", version, &[("bin/tool", content)])],
        );
        add(&mut db, archive.path(), src.path());
    }

    let deleter = Deleter::new(&db, archive.path(), PROJECT);
    assert_eq!(deleter.prune("stable", 1).unwrap(), 1);

    // The base survives for the sake of the 1.0 -> 2.0 delta and is not
    // an inconsistency
    assert!(layout::package_path(archive.path(), "pkgA-1.0.tgz").exists());
    assert!(db.find_package("pkgA", "1.0").unwrap().is_some());

    let verifier = Verifier::new(&db, archive.path(), PROJECT);
    assert_eq!(verifier.check().unwrap(), Vec::<String>::new());
}

#[test]
fn test_check_clean_after_full_rollback() {
    let archive = TempDir::new().unwrap();
    let mut db = open_db(archive.path());

    let src = TempDir::new().unwrap();
    make_source(
        src.path(),
        PROJECT,
        "stable",
        "1",
        &[SourcePackage::new("pkgA", "1.0", &[("bin/tool", "v1")])],
    );
    add(&mut db, archive.path(), src.path());

    let deleter = Deleter::new(&db, archive.path(), PROJECT);
    assert_eq!(deleter.rollback("stable", 1).unwrap(), 1);
    assert!(!layout::latest_path(archive.path(), "stable").exists());

    let verifier = Verifier::new(&db, archive.path(), PROJECT);
    assert_eq!(verifier.check().unwrap(), Vec::<String>::new());
}
