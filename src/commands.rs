use serde::Serialize;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::TemplateCache;
use crate::config::Settings;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::models::{FieldSpec, Page, Template};
use crate::ocr;
use crate::persist::{Mutation, TemplateStore};
use crate::services::calibration::{self, ApplyReport, CalibrationObservation, CalibrationReport};
use crate::services::coverage::{self, CoverageReport, RegionConflict};
use crate::services::migration::{self, MigrationReport};
use crate::services::resolver::{self, FieldSource};
use crate::services::extractor;
use crate::types::{OcrDocument, PageExtraction};

const MAX_SCAN_BYTES: u64 = 50 * 1024 * 1024;
const CONCURRENCY: usize = 5;

/// An open template document: on-disk store plus the in-process snapshot readers use.
pub struct Workspace {
    store: TemplateStore,
    cache: TemplateCache,
}

impl Workspace {
    pub fn open(path: impl Into<PathBuf>, backup_keep: usize) -> Result<Self> {
        let store = TemplateStore::new(path, backup_keep);
        let template = store.load()?;
        if template.ocr_mapping.is_deprecated() {
            tracing::debug!("[workspace] {} ocrMapping is deprecated, structure is authoritative", store.path().display());
        }
        Ok(Workspace {
            store,
            cache: TemplateCache::new(template),
        })
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub fn template(&self) -> Arc<Template> {
        self.cache.snapshot()
    }

    pub fn store(&self) -> &TemplateStore {
        &self.store
    }

    /// Persist a change (lock, backup, atomic write) and publish the result to readers.
    fn mutate<R>(&self, reason: &str, change: impl FnOnce(&Template) -> Result<(Template, R)>) -> Result<Mutation<R>> {
        self.cache.update(|_| {
            let mutation = self.store.mutate(reason, change)?;
            Ok((mutation.template.clone(), mutation))
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldLookup {
    pub page: Page,
    pub name: String,
    pub source: FieldSource,
    pub spec: FieldSpec,
}

/// Effective definition of one field, or `None` when neither representation has it.
pub fn resolve_field(ws: &Workspace, page: Page, name: &str) -> Option<FieldLookup> {
    let template = ws.template();
    resolver::resolve_effective(&template, page, name).map(|found| FieldLookup {
        page,
        name: name.to_string(),
        source: found.source,
        spec: found.spec.into_owned(),
    })
}

/// Every query prompt the template declares, for live OCR requests.
pub fn template_queries(template: &Template) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for page in Page::ALL {
        for found in resolver::resolve_page(template, page) {
            if let Some(query) = found.spec.query.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
                if !out.iter().any(|q| q == query) {
                    out.push(query.to_string());
                }
            }
        }
    }
    out
}

/// Size and magic-number check before a scan is uploaded.
pub fn validate_scan_file(path: &Path) -> Result<()> {
    let metadata = fs::metadata(path).map_err(|e| Error::io(path, e))?;
    if metadata.len() > MAX_SCAN_BYTES {
        return Err(Error::Ocr(format!("{} is too large (max 50MB)", path.display())));
    }
    let mut header = [0u8; 8];
    let mut f = fs::File::open(path).map_err(|e| Error::io(path, e))?;
    let read = f.read(&mut header).map_err(|e| Error::io(path, e))?;
    let known = [
        &b"%PDF-"[..],
        &[0x89, b'P', b'N', b'G'][..],
        &[0xFF, 0xD8, 0xFF][..],
        &b"II*\0"[..],
        &b"MM\0*"[..],
    ];
    if read < 3 || !known.iter().any(|magic| header[..read].starts_with(magic)) {
        return Err(Error::Ocr(format!(
            "{} is not a PDF, PNG, JPEG or TIFF scan",
            path.display()
        )));
    }
    Ok(())
}

/// OCR input from a JSON file, or a live Azure call for scans.
pub fn load_document(ws: &Workspace, settings: &Settings, path: &Path) -> Result<OcrDocument> {
    let is_json = path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    if !is_json {
        validate_scan_file(path)?;
    }
    let queries = template_queries(&ws.template());
    ocr::load_ocr_input(path, settings, &queries)
}

/// Pages present in `doc`, optionally restricted to one side.
fn selected_pages(doc: &OcrDocument, only: Option<Page>) -> Vec<Page> {
    doc.pages()
        .map(|(p, _)| p)
        .filter(|p| only.map_or(true, |o| o == *p))
        .collect()
}

/// Extract both sides concurrently against one template snapshot.
pub fn extract_document(ws: &Workspace, settings: &Settings, doc: &OcrDocument, only: Option<Page>) -> Vec<PageExtraction> {
    let template = ws.template();
    let pages = selected_pages(doc, only);
    std::thread::scope(|scope| {
        let handles: Vec<_> = pages
            .iter()
            .filter_map(|&page| doc.page(page).map(|ocr| (page, ocr)))
            .map(|(page, ocr)| {
                let template = Arc::clone(&template);
                scope.spawn(move || extractor::extract_page(&template, page, ocr, &settings.extraction))
            })
            .collect();
        handles.into_iter().filter_map(|h| h.join().ok()).collect()
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentExtraction {
    pub document: String,
    pub pages: Vec<PageExtraction>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedDocument {
    pub document: String,
    pub error: String,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchExtraction {
    pub successes: Vec<DocumentExtraction>,
    pub failures: Vec<FailedDocument>,
}

/// Extract a batch of documents, a few at a time. A failed document never aborts the batch.
/// Per-page statistics are recorded in `db` when given.
pub fn extract_batch(
    ws: &Workspace,
    settings: &Settings,
    documents: &[PathBuf],
    only: Option<Page>,
    db: Option<&Db>,
) -> BatchExtraction {
    let mut batch = BatchExtraction::default();
    for chunk in documents.chunks(CONCURRENCY) {
        let outcomes: Vec<(PathBuf, Result<Vec<PageExtraction>>)> = std::thread::scope(|scope| {
            let handles: Vec<_> = chunk
                .iter()
                .map(|path| {
                    scope.spawn(move || -> Result<Vec<PageExtraction>> {
                        let doc = load_document(ws, settings, path)?;
                        Ok(extract_document(ws, settings, &doc, only))
                    })
                })
                .collect();
            chunk
                .iter()
                .cloned()
                .zip(handles)
                .map(|(path, h)| {
                    let outcome = h
                        .join()
                        .unwrap_or_else(|_| Err(Error::Ocr("extraction worker panicked".to_string())));
                    (path, outcome)
                })
                .collect()
        });

        for (path, outcome) in outcomes {
            let document = path.display().to_string();
            match outcome {
                Ok(pages) => {
                    if let Some(db) = db {
                        for page in &pages {
                            if let Err(e) = db.record_extraction(ws.path(), &document, page) {
                                tracing::warn!("[extract] could not record stats for {}: {}", document, e);
                            }
                        }
                    }
                    batch.successes.push(DocumentExtraction { document, pages });
                }
                Err(e) => {
                    tracing::warn!("[extract] {} failed: {}", document, e);
                    batch.failures.push(FailedDocument {
                        document,
                        error: e.to_string(),
                    });
                }
            }
        }
    }
    batch
}

/// Calibration proposals for every page present in `doc`.
pub fn calibrate_document(ws: &Workspace, settings: &Settings, doc: &OcrDocument, only: Option<Page>) -> CalibrationReport {
    let template = ws.template();
    let mut report = CalibrationReport::default();
    for page in selected_pages(doc, only) {
        if let Some(ocr) = doc.page(page) {
            report.merge(calibration::calibrate(&template, page, ocr, &settings.calibration));
        }
    }
    tracing::info!(
        "[calibrate] {} of {} fields matched, mean drift {:.3}, {} drifted",
        report.summary.matched,
        report.summary.considered,
        report.summary.mean_distance,
        report.summary.drifted
    );
    report
}

/// Which observations a reviewer approved: explicit ids win, otherwise the confidence cut.
pub fn select_observations(
    report: &CalibrationReport,
    ids: Option<&[String]>,
    min_confidence: Option<f64>,
) -> Result<Vec<CalibrationObservation>> {
    let wanted: Vec<String> = match (ids, min_confidence) {
        (Some(ids), _) => ids.to_vec(),
        (None, Some(min)) => calibration::auto_select(report, min),
        (None, None) => {
            return Err(Error::Config(
                "nothing approved: pass observation ids, a review workbook or --min-confidence".to_string(),
            ))
        }
    };
    for id in &wanted {
        if !report.observations.iter().any(|o| &o.id == id) {
            tracing::warn!("[apply] {} is not in the calibration report", id);
        }
    }
    Ok(report
        .observations
        .iter()
        .filter(|o| wanted.contains(&o.id))
        .cloned()
        .collect())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyOutcome {
    #[serde(flatten)]
    pub report: ApplyReport,
    pub backup: Option<PathBuf>,
}

/// Write approved regions into the template. A backup is taken before anything is written.
pub fn apply_observations(ws: &Workspace, approved: &[CalibrationObservation]) -> Result<ApplyOutcome> {
    let mutation = ws.mutate("calibration-apply", |current| Ok(calibration::apply(current, approved)))?;
    tracing::info!(
        "[apply] {} applied, {} skipped ({} structure, {} legacy updates)",
        mutation.outcome.applied.len(),
        mutation.outcome.skipped.len(),
        mutation.outcome.structure_updates,
        mutation.outcome.legacy_updates
    );
    Ok(ApplyOutcome {
        report: mutation.outcome,
        backup: mutation.backup,
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationOutcome {
    #[serde(flatten)]
    pub report: MigrationReport,
    pub dry_run: bool,
    pub backup: Option<PathBuf>,
}

pub fn migrate_template(ws: &Workspace, dry_run: bool) -> Result<MigrationOutcome> {
    let now = chrono::Utc::now();
    if dry_run {
        let (_, report) = migration::migrate(&ws.template(), now);
        return Ok(MigrationOutcome {
            report,
            dry_run,
            backup: None,
        });
    }
    let mutation = ws.mutate("migration", |current| Ok(migration::migrate(current, now)))?;
    tracing::info!(
        "[migrate] {} entries merged, {} legacy fields moved to {}",
        mutation.outcome.migrated_count,
        mutation.outcome.unmapped.len(),
        crate::models::MIGRATED_SECTION
    );
    Ok(MigrationOutcome {
        report: mutation.outcome,
        dry_run,
        backup: mutation.backup,
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Validation {
    pub coverage: CoverageReport,
    pub conflicts: Vec<RegionConflict>,
    pub passed: bool,
}

/// Coverage gate plus region consistency between the two representations.
pub fn validate_template(ws: &Workspace) -> Validation {
    let template = ws.template();
    let coverage = coverage::validate_coverage(&template);
    let conflicts = coverage::check_consistency(&template);
    let passed = coverage.is_complete() && conflicts.is_empty();
    Validation {
        coverage,
        conflicts,
        passed,
    }
}

/// Restore a backup (newest when `target` is `None`) and republish it to readers.
pub fn rollback(ws: &Workspace, target: Option<&Path>) -> Result<PathBuf> {
    ws.cache.update(|_| {
        let source = ws.store.rollback(target)?;
        Ok((ws.store.load()?, source))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn workspace(dir: &Path) -> Workspace {
        let path = dir.join("hts.json");
        let doc = json!({
            "ocrMapping": { "front": { "fields": {
                "firstName": { "label": "First Name", "region": { "x": 0.1, "y": 0.2, "width": 0.3, "height": 0.02 } },
                "clientName": { "query": "Client name", "region": { "x": 0.1, "y": 0.4, "width": 0.3, "height": 0.02 } }
            }}},
            "structure": { "front": { "sections": { "personal": { "fields": ["firstName", "clientName"] } } } }
        });
        fs::write(&path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();
        Workspace::open(path, 5).unwrap()
    }

    #[test]
    fn resolve_field_borrows_legacy_region() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        let found = resolve_field(&ws, Page::Front, "firstName").unwrap();
        assert!(matches!(found.source, FieldSource::Structure { .. }));
        assert_eq!(found.spec.region.unwrap().x, 0.1);
        assert!(resolve_field(&ws, Page::Back, "firstName").is_none());
    }

    #[test]
    fn queries_are_collected_once() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        assert_eq!(template_queries(&ws.template()), vec!["Client name".to_string()]);
    }

    #[test]
    fn migration_publishes_new_snapshot_and_backs_up() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        let before = ws.template();
        let outcome = migrate_template(&ws, false).unwrap();
        assert_eq!(outcome.report.migrated_count, 2);
        assert!(outcome.backup.is_some());
        assert!(!before.is_migrated());
        assert!(ws.template().is_migrated());

        rollback(&ws, None).unwrap();
        assert!(!ws.template().is_migrated());
    }

    #[test]
    fn dry_run_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        let outcome = migrate_template(&ws, true).unwrap();
        assert!(outcome.report.changed());
        assert!(ws.store().list_backups().unwrap().is_empty());
        assert!(!ws.store().load().unwrap().is_migrated());
    }

    #[test]
    fn selection_needs_ids_or_threshold() {
        let report = CalibrationReport::default();
        assert!(select_observations(&report, None, None).is_err());
        assert!(select_observations(&report, None, Some(80.0)).unwrap().is_empty());
    }

    #[test]
    fn scan_validation_checks_magic() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("scan.pdf");
        fs::write(&pdf, b"%PDF-1.7\n...").unwrap();
        assert!(validate_scan_file(&pdf).is_ok());
        let txt = dir.path().join("notes.pdf");
        fs::write(&txt, b"hello world").unwrap();
        assert!(matches!(validate_scan_file(&txt), Err(Error::Ocr(_))));
    }

    #[test]
    fn batch_reports_failures_without_aborting() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        let good = dir.path().join("ocr.json");
        fs::write(
            &good,
            serde_json::to_string(&json!({
                "queries": [{ "id": "Client name", "text": "Ana Silva", "confidence": 0.95 }]
            }))
            .unwrap(),
        )
        .unwrap();
        let missing = dir.path().join("missing.json");
        let settings = Settings::from_lookup(|_| None);
        let db = Db::in_memory().unwrap();

        let batch = extract_batch(&ws, &settings, &[good, missing], None, Some(&db));
        assert_eq!(batch.successes.len(), 1);
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.successes[0].pages.len(), 1);
        assert_eq!(db.method_totals(None).unwrap().runs, 1);
    }
}
