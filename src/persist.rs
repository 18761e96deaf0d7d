//! Template document on disk: atomic rewrites, full-snapshot backups,
//! rollback and a single-writer lock file.

use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::models::Template;

const BACKUP_DIR: &str = "backups";

pub struct TemplateStore {
    path: PathBuf,
    backup_keep: usize,
}

/// Outcome of [`TemplateStore::mutate`].
#[derive(Debug)]
pub struct Mutation<R> {
    pub template: Template,
    pub outcome: R,
    /// Snapshot taken before the write; `None` when nothing changed.
    pub backup: Option<PathBuf>,
}

impl TemplateStore {
    pub fn new(path: impl Into<PathBuf>, backup_keep: usize) -> Self {
        Self {
            path: path.into(),
            backup_keep: backup_keep.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Template> {
        load_template(&self.path)
    }

    /// Pretty JSON written to `<file>.tmp`, then renamed over the live file.
    pub fn save(&self, template: &Template) -> Result<()> {
        let body = serde_json::to_string_pretty(template).map_err(|e| Error::json(&self.path, e))?;
        write_atomic(&self.path, body.as_bytes())
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(|p| p.join(BACKUP_DIR))
            .unwrap_or_else(|| PathBuf::from(BACKUP_DIR))
    }

    /// Copy the live document into the backup dir, then prune old snapshots.
    pub fn backup(&self, reason: &str) -> Result<PathBuf> {
        let bytes = fs::read(&self.path).map_err(|e| Error::io(&self.path, e))?;
        let dir = self.backup_dir();
        fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;

        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let reason = sanitize(reason);
        let mut target = dir.join(format!("{}-{}-{}.json", self.stem(), stamp, reason));
        let mut n = 1;
        while target.exists() {
            target = dir.join(format!("{}-{}-{}-{}.json", self.stem(), stamp, reason, n));
            n += 1;
        }
        write_atomic(&target, &bytes)?;
        tracing::info!("[persist] backup written to {}", target.display());
        self.prune()?;
        Ok(target)
    }

    /// Backups of this document, newest first.
    pub fn list_backups(&self) -> Result<Vec<PathBuf>> {
        let dir = self.backup_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let prefix = format!("{}-", self.stem());
        let mut found = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| Error::io(&dir, e))? {
            let entry = entry.map_err(|e| Error::io(&dir, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            if name.ends_with(".json") && rest.starts_with(|c: char| c.is_ascii_digit()) {
                found.push(entry.path());
            }
        }
        found.sort();
        found.reverse();
        Ok(found)
    }

    /// Restore the newest backup, or `target` when given. The current document is backed up first.
    pub fn rollback(&self, target: Option<&Path>) -> Result<PathBuf> {
        let _lock = self.lock()?;
        let source = match target {
            Some(path) => path.to_path_buf(),
            None => self
                .list_backups()?
                .into_iter()
                .next()
                .ok_or_else(|| Error::NotFound(format!("backup for {}", self.path.display())))?,
        };
        let restored = load_template(&source)?;
        if self.path.exists() {
            self.backup("pre-rollback")?;
        }
        self.save(&restored)?;
        tracing::info!("[persist] {} restored from {}", self.path.display(), source.display());
        Ok(source)
    }

    /// Take the writer lock. Fails fast when another writer holds it.
    pub fn lock(&self) -> Result<WriteLock> {
        WriteLock::acquire(&self.path)
    }

    /// Load, transform and write back under the lock, backing up first.
    /// Nothing is written when `change` returns an identical template.
    pub fn mutate<R>(
        &self,
        reason: &str,
        change: impl FnOnce(&Template) -> Result<(Template, R)>,
    ) -> Result<Mutation<R>> {
        let _lock = self.lock()?;
        let current = self.load()?;
        let (next, outcome) = change(&current)?;
        next.validate()?;
        if next == current {
            tracing::info!("[persist] {} unchanged, nothing written", self.path.display());
            return Ok(Mutation {
                template: next,
                outcome,
                backup: None,
            });
        }
        let backup = self.backup(reason)?;
        self.save(&next)?;
        Ok(Mutation {
            template: next,
            outcome,
            backup: Some(backup),
        })
    }

    fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "template".to_string())
    }

    fn prune(&self) -> Result<()> {
        for stale in self.list_backups()?.into_iter().skip(self.backup_keep) {
            fs::remove_file(&stale).map_err(|e| Error::io(&stale, e))?;
            tracing::debug!("[persist] pruned {}", stale.display());
        }
        Ok(())
    }
}

pub fn load_template(path: &Path) -> Result<Template> {
    let raw = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let value: serde_json::Value = serde_json::from_str(&raw).map_err(|e| Error::json(path, e))?;
    Template::from_value(value)
}

/// Read any JSON document (OCR results, calibration reports).
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    serde_json::from_str(&raw).map_err(|e| Error::json(path, e))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    {
        let mut file = fs::File::create(&tmp).map_err(|e| Error::io(&tmp, e))?;
        file.write_all(bytes).map_err(|e| Error::io(&tmp, e))?;
        file.sync_all().map_err(|e| Error::io(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| Error::io(path, e))
}

fn sanitize(reason: &str) -> String {
    let cleaned: String = reason
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let cleaned = cleaned.trim_matches('-').to_string();
    if cleaned.is_empty() {
        "manual".to_string()
    } else {
        cleaned
    }
}

/// `<file>.lock`, created exclusively and removed on drop.
#[derive(Debug)]
pub struct WriteLock {
    path: PathBuf,
}

impl WriteLock {
    fn acquire(template: &Path) -> Result<Self> {
        let mut name = template.as_os_str().to_os_string();
        name.push(".lock");
        let path = PathBuf::from(name);
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let lock = WriteLock { path };
                writeln!(file, "{}", std::process::id()).map_err(|e| Error::io(&lock.path, e))?;
                Ok(lock)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(Error::Locked(path)),
            Err(e) => Err(Error::io(&path, e)),
        }
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!("[persist] could not remove lock {}: {}", self.path.display(), e);
        }
    }
}
