//! Error type shared by the template engine, the OCR adapter and the CLI.
//!
//! Only conditions that make the whole operation meaningless are errors.
//! Resolution misses, extraction misses, unmapped legacy fields and coverage
//! gaps are returned as structured results instead.

use std::path::PathBuf;
use thiserror::Error;

use crate::models::Page;

#[derive(Debug, Error)]
pub enum Error {
    /// The template document lacks a required root key or is otherwise unusable.
    #[error("malformed template: {0}")]
    MalformedTemplate(String),

    /// A parent field declares the same name in both `subfields` and `options`.
    #[error("template authoring error on {page} page: '{parent}' declares '{name}' in both subfields and options")]
    AmbiguousChild {
        page: Page,
        parent: String,
        name: String,
    },

    #[error("could not access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The OCR collaborator call failed for the whole document.
    #[error("OCR failed: {0}")]
    Ocr(String),

    #[error("history database: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("spreadsheet: {0}")]
    Spreadsheet(String),

    /// Another writer holds the template lock.
    #[error("template is locked by another writer ({0})")]
    Locked(PathBuf),

    #[error("{0} not found")]
    NotFound(String),

    #[error("configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Error::Json {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
