use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::models::Page;
use crate::services::calibration::CalibrationReport;
use crate::types::{ExtractionStats, PageExtraction};

/// Local history of calibration runs, applied observations and extraction statistics.
pub struct Db {
    conn: Mutex<Connection>,
}

/// Aggregated extraction statistics across recorded runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodTotals {
    pub runs: usize,
    pub fields: usize,
    pub by_method: BTreeMap<String, usize>,
    pub failed: usize,
    pub fallback: usize,
    pub requires_review: usize,
    pub mean_confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationRunRow {
    pub id: i64,
    pub created_at: String,
    pub template_path: String,
    pub document: String,
    pub status: String,
    pub observations: usize,
    /// Observation ids written into the template by `apply`.
    pub applied: Vec<String>,
}

impl Db {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
            }
        }
        let conn = Connection::open(&db_path)?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            INSERT INTO schema_version (version) SELECT 1 WHERE NOT EXISTS (SELECT 1 FROM schema_version LIMIT 1);
            CREATE TABLE IF NOT EXISTS calibration_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL,
                template_path TEXT NOT NULL,
                document TEXT NOT NULL,
                report TEXT NOT NULL,
                status TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS applied_observations (
                run_id INTEGER NOT NULL,
                observation_id TEXT NOT NULL,
                applied_at TEXT NOT NULL,
                backup_path TEXT,
                PRIMARY KEY (run_id, observation_id),
                FOREIGN KEY (run_id) REFERENCES calibration_runs(id)
            );
            ",
        )?;

        // Migration 002: per-page extraction statistics (run once when version < 2)
        let current_version: i64 = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |r| r.get(0))
            .unwrap_or(1);
        if current_version < 2 {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS extraction_runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    created_at TEXT NOT NULL,
                    template_path TEXT NOT NULL,
                    document TEXT NOT NULL,
                    page TEXT NOT NULL,
                    stats TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_calibration_runs_template ON calibration_runs(template_path);
                UPDATE schema_version SET version = 2;
                ",
            )?;
        }

        Ok(Db {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_calibration_run(
        &self,
        template_path: &Path,
        document: &str,
        report: &CalibrationReport,
    ) -> Result<i64> {
        let created_at = chrono::Utc::now().to_rfc3339();
        let body = serde_json::to_string(report).map_err(|e| Error::json(template_path, e))?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO calibration_runs (created_at, template_path, document, report, status) VALUES (?, ?, ?, ?, 'pending')",
            params![created_at, template_path.to_string_lossy(), document, body],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn load_calibration_run(&self, id: i64) -> Result<CalibrationReport> {
        let body: Option<String> = self
            .conn()
            .query_row("SELECT report FROM calibration_runs WHERE id = ?", [id], |r| r.get(0))
            .optional()?;
        let body = body.ok_or_else(|| Error::NotFound(format!("calibration run {}", id)))?;
        serde_json::from_str(&body).map_err(|e| Error::json(format!("calibration run {}", id), e))
    }

    /// Newest first.
    pub fn calibration_runs(&self, template_path: Option<&Path>) -> Result<Vec<CalibrationRunRow>> {
        let conn = self.conn();
        let base = "SELECT id, created_at, template_path, document, status, report FROM calibration_runs";
        let filter = template_path.map(|p| p.to_string_lossy().to_string());
        let sql = match filter {
            Some(_) => format!("{} WHERE template_path = ?1 ORDER BY id DESC", base),
            None => format!("{} ORDER BY id DESC", base),
        };
        let mut stmt = conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| {
            let report: String = row.get(5)?;
            let observations = serde_json::from_str::<CalibrationReport>(&report)
                .map(|r| r.observations.len())
                .unwrap_or(0);
            Ok(CalibrationRunRow {
                id: row.get(0)?,
                created_at: row.get(1)?,
                template_path: row.get(2)?,
                document: row.get(3)?,
                status: row.get(4)?,
                observations,
                applied: Vec::new(),
            })
        };
        let mut rows = match filter {
            Some(path) => stmt.query_map([path], map_row)?.collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt.query_map([], map_row)?.collect::<rusqlite::Result<Vec<_>>>()?,
        };
        for row in rows.iter_mut() {
            row.applied = applied_ids(&conn, row.id)?;
        }
        Ok(rows)
    }

    /// Record which observations of a run were written into the template.
    pub fn mark_applied(&self, run_id: i64, observation_ids: &[String], backup: Option<&Path>) -> Result<usize> {
        let applied_at = chrono::Utc::now().to_rfc3339();
        let backup = backup.map(|p| p.to_string_lossy().to_string());
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        for id in observation_ids {
            inserted += tx.execute(
                "INSERT OR IGNORE INTO applied_observations (run_id, observation_id, applied_at, backup_path) VALUES (?, ?, ?, ?)",
                params![run_id, id, applied_at, backup],
            )?;
        }
        tx.execute(
            "UPDATE calibration_runs SET status = 'applied' WHERE id = ?",
            [run_id],
        )?;
        tx.commit()?;
        Ok(inserted)
    }

    pub fn record_extraction(&self, template_path: &Path, document: &str, extraction: &PageExtraction) -> Result<i64> {
        let created_at = chrono::Utc::now().to_rfc3339();
        let stats = serde_json::to_string(&extraction.stats).map_err(|e| Error::json(template_path, e))?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO extraction_runs (created_at, template_path, document, page, stats) VALUES (?, ?, ?, ?, ?)",
            params![
                created_at,
                template_path.to_string_lossy(),
                document,
                extraction.page.as_str(),
                stats
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Sum recorded extraction statistics, optionally for one page side.
    pub fn method_totals(&self, page: Option<Page>) -> Result<MethodTotals> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT page, stats FROM extraction_runs ORDER BY id")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut totals = MethodTotals::default();
        let mut weighted_confidence = 0.0;
        for (row_page, body) in rows {
            if page.is_some_and(|p| p.as_str() != row_page) {
                continue;
            }
            let stats: ExtractionStats = match serde_json::from_str(&body) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("[db] skipping unreadable extraction stats: {}", e);
                    continue;
                }
            };
            totals.runs += 1;
            totals.fields += stats.total;
            totals.failed += stats.failed;
            totals.fallback += stats.fallback;
            totals.requires_review += stats.requires_review;
            for (method, n) in stats.by_method {
                *totals.by_method.entry(method).or_default() += n;
            }
            weighted_confidence += stats.overall_confidence * stats.total as f64;
        }
        if totals.fields > 0 {
            totals.mean_confidence = weighted_confidence / totals.fields as f64;
        }
        Ok(totals)
    }
}

fn applied_ids(conn: &Connection, run_id: i64) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT observation_id FROM applied_observations WHERE run_id = ? ORDER BY observation_id",
    )?;
    let ids = stmt
        .query_map([run_id], |r| r.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Region;
    use crate::services::calibration::{CalibrationObservation, MatchSource};

    fn report() -> CalibrationReport {
        let obs = CalibrationObservation {
            id: "front/firstName".to_string(),
            page: Page::Front,
            field_name: "firstName".to_string(),
            label: Some("First Name".to_string()),
            method: MatchSource::Label,
            matched_text: "Ana".to_string(),
            old_region: Region::new(0.1, 0.1, 0.2, 0.05),
            new_region: Region::new(0.12, 0.1, 0.2, 0.05),
            distance: 0.02,
            confidence: 92.0,
            ocr_confidence: 0.9,
        };
        CalibrationReport {
            observations: vec![obs],
            ..Default::default()
        }
    }

    fn stats(method: &str, total: usize, confidence: f64) -> ExtractionStats {
        let mut by_method = BTreeMap::new();
        by_method.insert(method.to_string(), total);
        ExtractionStats {
            total,
            by_method,
            overall_confidence: confidence,
            ..Default::default()
        }
    }

    #[test]
    fn calibration_run_round_trip_and_applied_marks() {
        let db = Db::in_memory().unwrap();
        let path = Path::new("/forms/hts.json");
        let id = db.record_calibration_run(path, "scan-1.json", &report()).unwrap();
        assert_eq!(db.load_calibration_run(id).unwrap(), report());

        let ids = vec!["front/firstName".to_string()];
        assert_eq!(db.mark_applied(id, &ids, None).unwrap(), 1);
        assert_eq!(db.mark_applied(id, &ids, None).unwrap(), 0);

        let runs = db.calibration_runs(Some(path)).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, "applied");
        assert_eq!(runs[0].observations, 1);
        assert_eq!(runs[0].applied, ids);
    }

    #[test]
    fn unknown_run_is_not_found() {
        let db = Db::in_memory().unwrap();
        assert!(matches!(db.load_calibration_run(42), Err(Error::NotFound(_))));
    }

    #[test]
    fn method_totals_sum_by_page() {
        let db = Db::in_memory().unwrap();
        let path = Path::new("t.json");
        for (page, method, total, conf) in [
            (Page::Front, "query", 3, 0.9),
            (Page::Front, "coordinate", 1, 0.5),
            (Page::Back, "query", 2, 0.8),
        ] {
            let extraction = PageExtraction {
                page,
                results: vec![],
                stats: stats(method, total, conf),
            };
            db.record_extraction(path, "doc", &extraction).unwrap();
        }
        let all = db.method_totals(None).unwrap();
        assert_eq!(all.runs, 3);
        assert_eq!(all.by_method["query"], 5);
        let front = db.method_totals(Some(Page::Front)).unwrap();
        assert_eq!(front.fields, 4);
        assert!((front.mean_confidence - (0.9 * 3.0 + 0.5) / 4.0).abs() < 1e-9);
    }

    #[test]
    fn reopening_a_file_keeps_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("history.db");
        {
            let db = Db::new(path.clone()).unwrap();
            db.record_calibration_run(Path::new("t.json"), "doc", &report()).unwrap();
        }
        let db = Db::new(path).unwrap();
        assert_eq!(db.calibration_runs(None).unwrap().len(), 1);
    }
}
