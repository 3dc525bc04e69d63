use crate::db::DB_FILE_NAME;
use anyhow::{anyhow, Context};
use chrono::{SecondsFormat, Utc};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/timetable.sqlite3";
const META_WORKSPACE_ENTRY: &str = "meta/workspace.json";
pub const BUNDLE_FORMAT_V1: &str = "timetable-workspace-v1";
pub const BUNDLE_FORMAT_RAW_SQLITE: &str = "raw-sqlite3";

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
    pub db_sha256: String,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format_detected: String,
}

fn sha256_file(path: &Path) -> anyhow::Result<String> {
    let mut f = File::open(path)
        .with_context(|| format!("failed to open {}", path.to_string_lossy()))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut f, &mut hasher).context("failed to hash database")?;
    Ok(hex(&hasher.finalize()))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(DB_FILE_NAME);
    if !db_path.is_file() {
        return Err(anyhow!(
            "workspace database not found: {}",
            db_path.to_string_lossy()
        ));
    }

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }

    let db_sha256 = sha256_file(&db_path)?;

    let out_file = File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = json!({
        "format": BUNDLE_FORMAT_V1,
        "version": 1,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        "dbSha256": db_sha256,
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;

    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    let mut db_file = File::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.to_string_lossy()))?;
    std::io::copy(&mut db_file, &mut zip).context("failed to write database entry")?;

    let workspace_meta = json!({
        "sourceWorkspace": workspace_path.to_string_lossy(),
    });
    zip.start_file(META_WORKSPACE_ENTRY, opts)
        .context("failed to start workspace metadata entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&workspace_meta)
            .context("failed to serialize workspace metadata")?
            .as_bytes(),
    )
    .context("failed to write workspace metadata entry")?;

    zip.finish().context("failed to finalize zip bundle")?;

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT_V1.to_string(),
        entry_count: 3,
        db_sha256,
    })
}

pub fn import_workspace_bundle(
    in_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<ImportSummary> {
    std::fs::create_dir_all(workspace_path).with_context(|| {
        format!(
            "failed to create workspace {}",
            workspace_path.to_string_lossy()
        )
    })?;
    let dst = workspace_path.join(DB_FILE_NAME);

    if !is_zip_file(in_path)? {
        if !is_sqlite_file(in_path)? {
            return Err(anyhow!(
                "not a workspace bundle or sqlite database: {}",
                in_path.to_string_lossy()
            ));
        }
        std::fs::copy(in_path, &dst).with_context(|| {
            format!(
                "failed to copy sqlite backup from {} to {}",
                in_path.to_string_lossy(),
                dst.to_string_lossy()
            )
        })?;
        return Ok(ImportSummary {
            bundle_format_detected: BUNDLE_FORMAT_RAW_SQLITE.to_string(),
        });
    }

    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.to_string_lossy()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let mut manifest_text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?
        .read_to_string(&mut manifest_text)
        .context("failed to read manifest.json")?;
    let manifest: serde_json::Value =
        serde_json::from_str(&manifest_text).context("manifest.json is invalid JSON")?;
    let format = manifest
        .get("format")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if format != BUNDLE_FORMAT_V1 {
        return Err(anyhow!("unsupported bundle format: {}", format));
    }
    let expected_sha = manifest
        .get("dbSha256")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("bundle manifest missing dbSha256"))?;

    let tmp_dst = workspace_path.join(format!("{}.importing", DB_FILE_NAME));
    if tmp_dst.exists() {
        let _ = std::fs::remove_file(&tmp_dst);
    }

    let mut db_out = File::create(&tmp_dst).with_context(|| {
        format!(
            "failed to create temp database {}",
            tmp_dst.to_string_lossy()
        )
    })?;
    {
        let mut db_entry = archive
            .by_name(DB_ENTRY)
            .context("bundle missing db/timetable.sqlite3")?;
        std::io::copy(&mut db_entry, &mut db_out).context("failed to extract database entry")?;
    }
    db_out
        .flush()
        .context("failed to flush extracted database")?;
    drop(db_out);

    // Nothing below may touch the live database until the extracted copy checks out.
    if let Err(e) = verify_extracted_db(&tmp_dst, &expected_sha) {
        let _ = std::fs::remove_file(&tmp_dst);
        return Err(e);
    }

    if dst.exists() {
        std::fs::remove_file(&dst).with_context(|| {
            format!(
                "failed to remove existing database {}",
                dst.to_string_lossy()
            )
        })?;
    }
    std::fs::rename(&tmp_dst, &dst).with_context(|| {
        format!(
            "failed to move extracted database to {}",
            dst.to_string_lossy()
        )
    })?;

    Ok(ImportSummary {
        bundle_format_detected: BUNDLE_FORMAT_V1.to_string(),
    })
}

fn verify_extracted_db(path: &Path, expected_sha: &str) -> anyhow::Result<()> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(anyhow!(
            "database checksum mismatch (expected {}, got {})",
            expected_sha,
            actual
        ));
    }
    if !is_sqlite_file(path)? {
        return Err(anyhow!("bundle database entry is not a sqlite database"));
    }
    Ok(())
}

fn read_signature(path: &Path, buf: &mut [u8]) -> anyhow::Result<bool> {
    let mut f = File::open(path)
        .with_context(|| format!("failed to open input file {}", path.to_string_lossy()))?;
    let mut filled = 0;
    while filled < buf.len() {
        let n = f
            .read(&mut buf[filled..])
            .context("failed to read file signature")?;
        if n == 0 {
            return Ok(false);
        }
        filled += n;
    }
    Ok(true)
}

fn is_zip_file(path: &Path) -> anyhow::Result<bool> {
    let mut sig = [0u8; 4];
    Ok(read_signature(path, &mut sig)? && sig == [0x50, 0x4B, 0x03, 0x04])
}

fn is_sqlite_file(path: &Path) -> anyhow::Result<bool> {
    let mut sig = [0u8; 16];
    Ok(read_signature(path, &mut sig)? && &sig == b"SQLite format 3\0")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    #[test]
    fn export_then_import_restores_database_bytes() {
        let src = temp_dir("timetable-backup-src");
        let dst = temp_dir("timetable-backup-dst");
        let conn = crate::db::open_db(&src).expect("open db");
        conn.execute(
            "INSERT INTO subjects(id, name, color, created_at) VALUES('s1', 'Maths', NULL, 'x')",
            [],
        )
        .expect("insert");
        drop(conn);

        let bundle = src.join("out").join("backup.zip");
        let summary = export_workspace_bundle(&src, &bundle).expect("export");
        assert_eq!(summary.bundle_format, BUNDLE_FORMAT_V1);
        assert_eq!(summary.db_sha256.len(), 64);

        let imported = import_workspace_bundle(&bundle, &dst).expect("import");
        assert_eq!(imported.bundle_format_detected, BUNDLE_FORMAT_V1);
        assert_eq!(
            std::fs::read(src.join(DB_FILE_NAME)).expect("src bytes"),
            std::fs::read(dst.join(DB_FILE_NAME)).expect("dst bytes")
        );

        let _ = std::fs::remove_dir_all(src);
        let _ = std::fs::remove_dir_all(dst);
    }

    #[test]
    fn import_rejects_unknown_files() {
        let dir = temp_dir("timetable-backup-junk");
        let junk = dir.join("junk.bin");
        std::fs::write(&junk, b"definitely not a database").expect("write");
        let e = import_workspace_bundle(&junk, &dir.join("ws")).unwrap_err();
        assert!(e.to_string().contains("not a workspace bundle"));
        let _ = std::fs::remove_dir_all(dir);
    }

    fn write_bundle(path: &Path, manifest: serde_json::Value, db_bytes: &[u8]) {
        let mut zip = ZipWriter::new(File::create(path).expect("create bundle"));
        let opts = FileOptions::default().compression_method(CompressionMethod::Stored);
        zip.start_file(MANIFEST_ENTRY, opts).expect("manifest entry");
        zip.write_all(manifest.to_string().as_bytes())
            .expect("write manifest");
        zip.start_file(DB_ENTRY, opts).expect("db entry");
        zip.write_all(db_bytes).expect("write db");
        zip.finish().expect("finish bundle");
    }

    /// Workspace with one subject row; returns its path and current db bytes.
    fn seeded_workspace(prefix: &str) -> (PathBuf, Vec<u8>) {
        let ws = temp_dir(prefix);
        let conn = crate::db::open_db(&ws).expect("open db");
        conn.execute(
            "INSERT INTO subjects(id, name, color, created_at) VALUES('keep', 'Keep', NULL, 'x')",
            [],
        )
        .expect("insert");
        drop(conn);
        let bytes = std::fs::read(ws.join(DB_FILE_NAME)).expect("db bytes");
        (ws, bytes)
    }

    fn assert_workspace_untouched(ws: &Path, before: &[u8]) {
        assert_eq!(
            std::fs::read(ws.join(DB_FILE_NAME)).expect("db bytes after"),
            before
        );
        assert!(!ws.join(format!("{}.importing", DB_FILE_NAME)).exists());
        let conn = crate::db::open_db(ws).expect("reopen db");
        let name: String = conn
            .query_row("SELECT name FROM subjects WHERE id = 'keep'", [], |r| {
                r.get(0)
            })
            .expect("subject still there");
        assert_eq!(name, "Keep");
    }

    #[test]
    fn import_rejects_database_changed_after_export() {
        let (ws, before) = seeded_workspace("timetable-backup-tampered");
        let other = temp_dir("timetable-backup-tampered-src");
        let conn = crate::db::open_db(&other).expect("open other");
        drop(conn);
        let bundle = other.join("good.zip");
        let summary = export_workspace_bundle(&other, &bundle).expect("export");

        let mut db_bytes = std::fs::read(other.join(DB_FILE_NAME)).expect("other bytes");
        let last = db_bytes.len() - 1;
        db_bytes[last] ^= 0xff;
        let tampered = other.join("tampered.zip");
        write_bundle(
            &tampered,
            json!({ "format": BUNDLE_FORMAT_V1, "dbSha256": summary.db_sha256 }),
            &db_bytes,
        );

        let e = import_workspace_bundle(&tampered, &ws).unwrap_err();
        assert!(e.to_string().contains("checksum mismatch"), "{e:#}");
        assert_workspace_untouched(&ws, &before);

        let _ = std::fs::remove_dir_all(ws);
        let _ = std::fs::remove_dir_all(other);
    }

    #[test]
    fn import_requires_manifest_checksum() {
        let (ws, before) = seeded_workspace("timetable-backup-nosha");
        let bundle = ws.join("nosha.zip");
        // A perfectly valid database; only the checksum is missing.
        write_bundle(&bundle, json!({ "format": BUNDLE_FORMAT_V1 }), &before);

        let e = import_workspace_bundle(&bundle, &ws).unwrap_err();
        assert!(e.to_string().contains("missing dbSha256"), "{e:#}");
        assert_workspace_untouched(&ws, &before);

        let blank = ws.join("blank.zip");
        write_bundle(
            &blank,
            json!({ "format": BUNDLE_FORMAT_V1, "dbSha256": "  " }),
            &before,
        );
        assert!(import_workspace_bundle(&blank, &ws).is_err());
        assert_workspace_untouched(&ws, &before);

        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn import_rejects_checksummed_non_sqlite_entry() {
        let (ws, before) = seeded_workspace("timetable-backup-garbage");
        let garbage = b"this is not a sqlite database at all".to_vec();
        let mut hasher = Sha256::new();
        hasher.update(&garbage);
        let sha = hex(&hasher.finalize());
        let bundle = ws.join("garbage.zip");
        write_bundle(
            &bundle,
            json!({ "format": BUNDLE_FORMAT_V1, "dbSha256": sha.to_ascii_uppercase() }),
            &garbage,
        );

        let e = import_workspace_bundle(&bundle, &ws).unwrap_err();
        assert!(e.to_string().contains("not a sqlite database"), "{e:#}");
        assert_workspace_untouched(&ws, &before);

        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn hex_is_lowercase_and_padded() {
        assert_eq!(hex(&[0x00, 0x0f, 0xab]), "000fab");
    }
}
