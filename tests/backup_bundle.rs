mod test_support;

use serde_json::json;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use test_support::{create_session, error_code, open_workspace, request, request_ok, temp_dir};

#[test]
fn bundle_export_and_import_roundtrip_through_the_sidecar() {
    let (mut sidecar, workspace) = open_workspace("timetable-bundle-src");
    let out_dir = temp_dir("timetable-bundle-out");
    let restored = temp_dir("timetable-bundle-dst");

    let id = create_session(&mut sidecar, 3, "09:00", "10:00");
    let bundle_path = out_dir.join("workspace.zip");
    let export = request_ok(
        &mut sidecar,
        "1",
        "backup.exportWorkspaceBundle",
        json!({ "outPath": bundle_path.to_string_lossy() }),
    );
    assert_eq!(export["bundleFormat"], "timetable-workspace-v1");
    assert_eq!(export["entryCount"], 3);

    let f = File::open(&bundle_path).expect("open bundle");
    let mut archive = zip::ZipArchive::new(f).expect("open zip archive");
    let mut manifest = String::new();
    archive
        .by_name("manifest.json")
        .expect("manifest entry")
        .read_to_string(&mut manifest)
        .expect("read manifest");
    let manifest: serde_json::Value = serde_json::from_str(&manifest).expect("manifest json");
    assert_eq!(manifest["format"], "timetable-workspace-v1");
    assert_eq!(manifest["dbSha256"], export["dbSha256"]);
    archive
        .by_name("db/timetable.sqlite3")
        .expect("database entry in bundle");

    let import = request_ok(
        &mut sidecar,
        "2",
        "backup.importWorkspaceBundle",
        json!({ "inPath": bundle_path.to_string_lossy(), "workspacePath": restored.to_string_lossy() }),
    );
    assert_eq!(import["bundleFormatDetected"], "timetable-workspace-v1");

    let health = request_ok(&mut sidecar, "3", "health", json!({}));
    assert_eq!(health["workspacePath"], &*restored.to_string_lossy());
    let sessions = request_ok(&mut sidecar, "4", "sessions.list", json!({}));
    assert_eq!(sessions["sessions"][0]["id"], id.as_str());

    drop(sidecar);
    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(restored);
}

#[test]
fn import_rejects_missing_and_foreign_files() {
    let (mut sidecar, workspace) = open_workspace("timetable-bundle-reject");

    let resp = request(
        &mut sidecar,
        "1",
        "backup.importWorkspaceBundle",
        json!({ "inPath": workspace.join("nope.zip").to_string_lossy() }),
    );
    assert_eq!(error_code(&resp), Some("not_found"));

    let junk = workspace.join("junk.txt");
    std::fs::write(&junk, "hello").expect("write junk");
    let resp = request(
        &mut sidecar,
        "2",
        "backup.importWorkspaceBundle",
        json!({ "inPath": junk.to_string_lossy() }),
    );
    assert_eq!(error_code(&resp), Some("io_failed"));

    // The open workspace survives a rejected import.
    request_ok(&mut sidecar, "3", "setup.get", json!({}));

    drop(sidecar);
    let _ = std::fs::remove_dir_all(workspace);
}

fn rewrite_bundle(src: &Path, dst: &Path, manifest: serde_json::Value, tamper_db: bool) {
    let mut archive = zip::ZipArchive::new(File::open(src).expect("open bundle")).expect("zip");
    let mut db = Vec::new();
    archive
        .by_name("db/timetable.sqlite3")
        .expect("database entry")
        .read_to_end(&mut db)
        .expect("read database entry");
    if tamper_db {
        let last = db.len() - 1;
        db[last] ^= 0x5a;
    }
    let mut out = zip::ZipWriter::new(File::create(dst).expect("create bundle"));
    let opts = zip::write::FileOptions::default();
    out.start_file("manifest.json", opts).expect("manifest entry");
    out.write_all(manifest.to_string().as_bytes())
        .expect("write manifest");
    out.start_file("db/timetable.sqlite3", opts)
        .expect("database entry");
    out.write_all(&db).expect("write database");
    out.finish().expect("finish bundle");
}

#[test]
fn unverified_bundles_leave_the_open_workspace_in_place() {
    let (mut sidecar, workspace) = open_workspace("timetable-bundle-unverified");
    let out_dir = temp_dir("timetable-bundle-unverified-out");

    let id = create_session(&mut sidecar, 1, "08:00", "09:00");
    let good = out_dir.join("good.zip");
    let export = request_ok(
        &mut sidecar,
        "1",
        "backup.exportWorkspaceBundle",
        json!({ "outPath": good.to_string_lossy() }),
    );

    let tampered = out_dir.join("tampered.zip");
    rewrite_bundle(
        &good,
        &tampered,
        json!({ "format": "timetable-workspace-v1", "dbSha256": export["dbSha256"] }),
        true,
    );
    let unsigned = out_dir.join("unsigned.zip");
    rewrite_bundle(
        &good,
        &unsigned,
        json!({ "format": "timetable-workspace-v1" }),
        false,
    );

    for (n, bundle) in [&tampered, &unsigned].into_iter().enumerate() {
        let resp = request(
            &mut sidecar,
            &format!("import-{n}"),
            "backup.importWorkspaceBundle",
            json!({ "inPath": bundle.to_string_lossy() }),
        );
        assert_eq!(error_code(&resp), Some("io_failed"), "{resp}");

        let sessions = request_ok(&mut sidecar, &format!("list-{n}"), "sessions.list", json!({}));
        assert_eq!(sessions["sessions"][0]["id"], id.as_str());
        assert!(workspace.join("timetable.sqlite3").is_file());
        assert!(!workspace.join("timetable.sqlite3.importing").exists());
    }

    drop(sidecar);
    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(out_dir);
}
