use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use crate::commands::{self, Workspace};
use crate::config::Settings;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::excel;
use crate::models::Page;
use crate::persist;
use crate::services::calibration::CalibrationReport;

#[derive(Parser)]
#[command(name = "hts-form-scanner")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Field extraction, coordinate calibration and migration for HTS form templates", long_about = None)]
pub struct Cli {
    /// History database (calibration runs, extraction stats)
    #[arg(long, global = true, env = "HTS_SCANNER_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the effective definition of one field
    Resolve {
        #[arg(long, short, env = "HTS_TEMPLATE")]
        template: PathBuf,
        #[arg(long, default_value = "front")]
        page: Page,
        name: String,
    },
    /// Extract field values from one or more OCR results or scans
    Extract {
        #[arg(long, short, env = "HTS_TEMPLATE")]
        template: PathBuf,
        /// OCR JSON, saved Azure response, or a PDF/image scan
        #[arg(required = true)]
        documents: Vec<PathBuf>,
        #[arg(long)]
        page: Option<Page>,
        /// Do not record statistics in the history database
        #[arg(long)]
        no_record: bool,
    },
    /// Propose region corrections from a reference document
    Calibrate {
        #[arg(long, short, env = "HTS_TEMPLATE")]
        template: PathBuf,
        document: PathBuf,
        #[arg(long)]
        page: Option<Page>,
        /// Write the proposals to a JSON report
        #[arg(long)]
        out: Option<PathBuf>,
        /// Write a review workbook with an Approve column
        #[arg(long)]
        xlsx: Option<PathBuf>,
        /// Pre-approve rows at or above this confidence in the workbook
        #[arg(long, requires = "xlsx")]
        prefill: Option<f64>,
        #[arg(long)]
        no_record: bool,
    },
    /// Write approved corrections into the template (backup first)
    Apply {
        #[arg(long, short, env = "HTS_TEMPLATE")]
        template: PathBuf,
        /// Calibration run recorded in the history database
        #[arg(long, conflicts_with = "report", required_unless_present = "report")]
        run: Option<i64>,
        /// Calibration report JSON written by `calibrate --out`
        #[arg(long)]
        report: Option<PathBuf>,
        /// Observation ids to apply, comma separated
        #[arg(long, value_delimiter = ',')]
        ids: Vec<String>,
        /// Review workbook; rows marked in the Approve column are applied
        #[arg(long, conflicts_with = "ids")]
        xlsx: Option<PathBuf>,
        /// Apply every drifted observation at or above this confidence
        #[arg(long)]
        min_confidence: Option<f64>,
    },
    /// Merge the legacy flat map into the nested structure
    Migrate {
        #[arg(long, short, env = "HTS_TEMPLATE")]
        template: PathBuf,
        #[arg(long)]
        dry_run: bool,
    },
    /// Coverage and consistency gate; exits non-zero when it fails
    Validate {
        #[arg(long, short, env = "HTS_TEMPLATE")]
        template: PathBuf,
    },
    /// Restore a template backup
    Rollback {
        #[arg(long, short, env = "HTS_TEMPLATE")]
        template: PathBuf,
        /// Backup to restore; the newest when omitted
        #[arg(long, conflicts_with = "list")]
        backup: Option<PathBuf>,
        /// Only list available backups
        #[arg(long)]
        list: bool,
    },
    /// Aggregated extraction statistics
    Stats {
        #[arg(long)]
        page: Option<Page>,
    },
    /// Recorded calibration runs
    Runs {
        #[arg(long, short)]
        template: Option<PathBuf>,
    },
}

pub fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut settings = Settings::from_env();
    if let Some(db) = cli.db {
        settings.db_path = db;
    }
    match execute(cli.command, &settings) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let body = serde_json::to_string_pretty(value).map_err(|e| Error::json("stdout", e))?;
    println!("{}", body);
    Ok(())
}

fn open_db(settings: &Settings) -> Result<Db> {
    Db::new(settings.db_path.clone())
}

fn execute(command: Commands, settings: &Settings) -> Result<ExitCode> {
    match command {
        Commands::Resolve { template, page, name } => {
            let ws = Workspace::open(template, settings.backup_keep)?;
            match commands::resolve_field(&ws, page, &name) {
                Some(found) => print_json(&found)?,
                None => {
                    print_json(&json!({ "page": page, "name": name, "found": false }))?;
                    return Ok(ExitCode::from(1));
                }
            }
        }
        Commands::Extract {
            template,
            documents,
            page,
            no_record,
        } => {
            let ws = Workspace::open(template, settings.backup_keep)?;
            let db = if no_record { None } else { Some(open_db(settings)?) };
            let batch = commands::extract_batch(&ws, settings, &documents, page, db.as_ref());
            print_json(&batch)?;
            if batch.successes.is_empty() && !batch.failures.is_empty() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Calibrate {
            template,
            document,
            page,
            out,
            xlsx,
            prefill,
            no_record,
        } => {
            let ws = Workspace::open(template, settings.backup_keep)?;
            let doc = commands::load_document(&ws, settings, &document)?;
            let report = commands::calibrate_document(&ws, settings, &doc, page);
            if let Some(out) = &out {
                write_report(out, &report)?;
            }
            if let Some(xlsx) = &xlsx {
                excel::export_calibration_report(&report, xlsx, prefill)?;
            }
            let run_id = if no_record {
                None
            } else {
                let name = document.display().to_string();
                Some(open_db(settings)?.record_calibration_run(ws.path(), &name, &report)?)
            };
            print_json(&json!({ "runId": run_id, "report": report }))?;
        }
        Commands::Apply {
            template,
            run,
            report,
            ids,
            xlsx,
            min_confidence,
        } => {
            let db = run.map(|_| open_db(settings)).transpose()?;
            let calibration: CalibrationReport = match (run, &report, &db) {
                (Some(id), _, Some(db)) => db.load_calibration_run(id)?,
                (_, Some(path), _) => persist::read_json(path)?,
                _ => return Err(Error::Config("pass --run or --report".to_string())),
            };
            let approved_ids = match &xlsx {
                Some(path) => Some(excel::read_approvals(path)?),
                None if !ids.is_empty() => Some(ids),
                None => None,
            };
            let approved =
                commands::select_observations(&calibration, approved_ids.as_deref(), min_confidence)?;

            let ws = Workspace::open(template, settings.backup_keep)?;
            let outcome = commands::apply_observations(&ws, &approved)?;
            if let (Some(id), Some(db)) = (run, &db) {
                db.mark_applied(id, &outcome.report.applied, outcome.backup.as_deref())?;
            }
            print_json(&outcome)?;
        }
        Commands::Migrate { template, dry_run } => {
            let ws = Workspace::open(template, settings.backup_keep)?;
            let outcome = commands::migrate_template(&ws, dry_run)?;
            print_json(&outcome)?;
        }
        Commands::Validate { template } => {
            let ws = Workspace::open(template, settings.backup_keep)?;
            let validation = commands::validate_template(&ws);
            print_json(&validation)?;
            if !validation.passed {
                return Ok(ExitCode::from(2));
            }
        }
        Commands::Rollback {
            template,
            backup,
            list,
        } => {
            let ws = Workspace::open(template, settings.backup_keep)?;
            if list {
                print_json(&ws.store().list_backups()?)?;
            } else {
                let restored = commands::rollback(&ws, backup.as_deref())?;
                print_json(&json!({ "restoredFrom": restored }))?;
            }
        }
        Commands::Stats { page } => {
            print_json(&open_db(settings)?.method_totals(page)?)?;
        }
        Commands::Runs { template } => {
            print_json(&open_db(settings)?.calibration_runs(template.as_deref())?)?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn write_report(path: &Path, report: &CalibrationReport) -> Result<()> {
    let body = serde_json::to_string_pretty(report).map_err(|e| Error::json(path, e))?;
    std::fs::write(path, body).map_err(|e| Error::io(path, e))
}
