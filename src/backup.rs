use anyhow::{anyhow, bail, Context};
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::config;
use crate::db::{self, DB_FILE_NAME};

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/gradebook.sqlite3";
const PROMOTIONS_ENTRY: &str = "promotions.json";
const STAGING_FILE_NAME: &str = "gradebook.sqlite3.importing";
const REQUIRED_TABLES: [&str; 3] = ["settings", "promotion_cycles", "promotion_records"];
pub const ARCHIVE_FORMAT_V1: &str = "gradebook-archive-v1";

/// Per-cycle record counts, written at export and re-derived on import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleSummary {
    pub cycle_id: String,
    pub record_count: u64,
    pub pending: u64,
    pub promoted: u64,
    pub repeating: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArchiveManifest {
    format: String,
    app_version: String,
    exported_at: String,
    db_sha256: String,
    grading_config: serde_json::Value,
    cycles: Vec<CycleSummary>,
}

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub archive_format: String,
    pub entry_count: usize,
    pub db_sha256: String,
    pub cycles: Vec<CycleSummary>,
}

/// A verified database waiting next to the live one. Nothing in the
/// workspace changes until [`StagedImport::commit`].
#[derive(Debug)]
pub struct StagedImport {
    staged_path: PathBuf,
    db_path: PathBuf,
    pub db_sha256: String,
    pub cycles: Vec<CycleSummary>,
}

impl StagedImport {
    pub fn commit(self) -> anyhow::Result<()> {
        std::fs::rename(&self.staged_path, &self.db_path).with_context(|| {
            format!(
                "failed to move imported database to {}",
                self.db_path.to_string_lossy()
            )
        })
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn cycle_summaries(conn: &Connection) -> anyhow::Result<Vec<CycleSummary>> {
    let mut stmt = conn.prepare(
        "SELECT c.id,
                COUNT(r.id),
                COALESCE(SUM(CASE WHEN r.status = 'pending' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN r.status = 'promoted' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN r.status = 'repeating' THEN 1 ELSE 0 END), 0)
         FROM promotion_cycles c
         LEFT JOIN promotion_records r ON r.cycle_id = c.id
         GROUP BY c.id
         ORDER BY c.id",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok(CycleSummary {
                cycle_id: r.get(0)?,
                record_count: r.get::<_, i64>(1)? as u64,
                pending: r.get::<_, i64>(2)? as u64,
                promoted: r.get::<_, i64>(3)? as u64,
                repeating: r.get::<_, i64>(4)? as u64,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn promotion_rows(conn: &Connection) -> anyhow::Result<Vec<serde_json::Value>> {
    let mut stmt = conn.prepare(
        "SELECT cycle_id, student_id, current_class_id, suggested_class_id, qualifies,
                action, target_class_id, status, overridden, override_reason, decided_at
         FROM promotion_records
         ORDER BY cycle_id, student_id",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok(serde_json::json!({
                "cycleId": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "currentClassId": r.get::<_, String>(2)?,
                "suggestedClassId": r.get::<_, String>(3)?,
                "qualifiesForPromotion": r.get::<_, i64>(4)? != 0,
                "action": r.get::<_, String>(5)?,
                "targetClassId": r.get::<_, String>(6)?,
                "status": r.get::<_, String>(7)?,
                "overridden": r.get::<_, i64>(8)? != 0,
                "overrideReason": r.get::<_, Option<String>>(9)?,
                "decidedAt": r.get::<_, Option<String>>(10)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Writes the workspace database plus a readable copy of its promotion
/// records. The manifest carries the grading configuration and per-cycle
/// counts so an import can be checked against them.
pub fn export_workspace_archive(
    conn: &Connection,
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(DB_FILE_NAME);
    if !db_path.is_file() {
        bail!(
            "workspace database not found: {}",
            db_path.to_string_lossy()
        );
    }
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }

    let grading_config = config::load(conn).map_err(|e| anyhow!(e))?;
    let cycles = cycle_summaries(conn).context("failed to summarize promotion cycles")?;
    let records = promotion_rows(conn).context("failed to read promotion records")?;

    let db_bytes = std::fs::read(&db_path)
        .with_context(|| format!("failed to read database {}", db_path.to_string_lossy()))?;
    let db_sha256 = sha256_hex(&db_bytes);

    let manifest = ArchiveManifest {
        format: ARCHIVE_FORMAT_V1.to_string(),
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        exported_at: chrono::Utc::now().to_rfc3339(),
        db_sha256: db_sha256.clone(),
        grading_config: serde_json::to_value(&grading_config)
            .context("failed to serialize grading config")?,
        cycles: cycles.clone(),
    };

    let out_file = File::create(out_path).with_context(|| {
        format!("failed to create output file {}", out_path.to_string_lossy())
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let entries: [(&str, Vec<u8>); 3] = [
        (
            MANIFEST_ENTRY,
            serde_json::to_vec_pretty(&manifest).context("failed to serialize manifest")?,
        ),
        (
            PROMOTIONS_ENTRY,
            serde_json::to_vec_pretty(&records).context("failed to serialize promotions")?,
        ),
        (DB_ENTRY, db_bytes),
    ];
    for (name, bytes) in &entries {
        zip.start_file(*name, opts)
            .with_context(|| format!("failed to start entry {}", name))?;
        zip.write_all(bytes)
            .with_context(|| format!("failed to write entry {}", name))?;
    }
    zip.finish().context("failed to finalize archive")?;

    Ok(ExportSummary {
        archive_format: ARCHIVE_FORMAT_V1.to_string(),
        entry_count: entries.len(),
        db_sha256,
        cycles,
    })
}

fn read_entry(archive: &mut ZipArchive<File>, name: &str) -> anyhow::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    archive
        .by_name(name)
        .with_context(|| format!("archive is missing {}", name))?
        .read_to_end(&mut bytes)
        .with_context(|| format!("failed to read {}", name))?;
    Ok(bytes)
}

fn verify_staged_database(path: &Path, manifest: &ArchiveManifest) -> anyhow::Result<()> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .context("archived database cannot be opened")?;

    let integrity: String = conn
        .query_row("PRAGMA integrity_check", [], |r| r.get(0))
        .context("archived database is not a SQLite database")?;
    if integrity != "ok" {
        bail!("archived database failed integrity check: {}", integrity);
    }
    for table in REQUIRED_TABLES {
        if !db::table_exists(&conn, table)? {
            bail!("archived database has no {} table", table);
        }
    }

    config::load(&conn)
        .and_then(|cfg| cfg.validate())
        .map_err(|e| anyhow!("archived grading config is invalid: {}", e))?;

    let cycles = cycle_summaries(&conn).context("failed to summarize archived cycles")?;
    if cycles != manifest.cycles {
        bail!("promotion cycles in the archived database do not match the manifest");
    }
    Ok(())
}

/// Reads and checks an archive, leaving the extracted database next to the
/// workspace database without touching it.
pub fn stage_workspace_archive(
    in_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<StagedImport> {
    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open archive {}", in_path.to_string_lossy()))?;
    let mut archive = ZipArchive::new(in_file).context("not a gradebook archive")?;

    let manifest: ArchiveManifest = serde_json::from_slice(&read_entry(&mut archive, MANIFEST_ENTRY)?)
        .context("manifest.json is invalid")?;
    if manifest.format != ARCHIVE_FORMAT_V1 {
        bail!("unsupported archive format: {}", manifest.format);
    }

    let db_bytes = read_entry(&mut archive, DB_ENTRY)?;
    let db_sha256 = sha256_hex(&db_bytes);
    if !db_sha256.eq_ignore_ascii_case(&manifest.db_sha256) {
        bail!(
            "database checksum mismatch: manifest {} archive {}",
            manifest.db_sha256,
            db_sha256
        );
    }

    std::fs::create_dir_all(workspace_path).with_context(|| {
        format!(
            "failed to create workspace {}",
            workspace_path.to_string_lossy()
        )
    })?;
    let staged_path = workspace_path.join(STAGING_FILE_NAME);
    {
        let mut out = File::create(&staged_path).with_context(|| {
            format!(
                "failed to create staging file {}",
                staged_path.to_string_lossy()
            )
        })?;
        out.write_all(&db_bytes)
            .and_then(|_| out.flush())
            .context("failed to write staged database")?;
    }

    if let Err(e) = verify_staged_database(&staged_path, &manifest) {
        let _ = std::fs::remove_file(&staged_path);
        return Err(e);
    }

    Ok(StagedImport {
        staged_path,
        db_path: workspace_path.join(DB_FILE_NAME),
        db_sha256,
        cycles: manifest.cycles,
    })
}
