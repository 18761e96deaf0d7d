//! Runtime settings from the environment (and `.env` files).

use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::services::calibration::CalibrationSettings;
use crate::services::extractor::ExtractionSettings;
use crate::services::similarity::LabelMatcher;

const APP_DIR: &str = "hts-form-scanner";

#[derive(Debug, Clone)]
pub struct Settings {
    pub azure_key: Option<String>,
    pub azure_endpoint: Option<String>,
    pub db_path: PathBuf,
    pub extraction: ExtractionSettings,
    pub calibration: CalibrationSettings,
    /// Number of template backups retained per document.
    pub backup_keep: usize,
}

impl Settings {
    /// Load `.env` from the working directory and the app data dir, then read the environment.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        if let Some(dir) = app_data_dir() {
            let env_path = dir.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let unit = |v: &f64| (0.0..=1.0).contains(v);
        let positive = |v: &f64| *v > 0.0;

        let min_similarity = parse_or(&lookup, "OCR_LABEL_MIN_SIMILARITY", 0.6, unit);
        let matcher = LabelMatcher::new(min_similarity);
        let extraction = ExtractionSettings {
            query_min_confidence: parse_or(&lookup, "OCR_QUERY_MIN_CONFIDENCE", 0.70, unit),
            review_threshold: parse_or(&lookup, "OCR_REVIEW_THRESHOLD", 0.70, unit),
            region_tolerance: parse_or(&lookup, "OCR_REGION_TOLERANCE", 0.02, unit),
            checkbox_text_band: parse_or(&lookup, "OCR_CHECKBOX_TEXT_BAND", 0.01, unit),
            matcher,
        };
        let calibration = CalibrationSettings {
            max_distance: parse_or(&lookup, "CALIBRATION_MAX_DISTANCE", 0.25, positive),
            matcher,
        };
        let db_path = non_empty("HTS_SCANNER_DB")
            .map(PathBuf::from)
            .unwrap_or_else(default_db_path);

        Settings {
            azure_key: non_empty("AZURE_OCR_KEY"),
            azure_endpoint: non_empty("AZURE_OCR_ENDPOINT"),
            db_path,
            extraction,
            calibration,
            backup_keep: parse_or(&lookup, "OCR_BACKUP_KEEP", 20usize, |n| *n > 0),
        }
    }

    /// Key and endpoint for live OCR calls.
    pub fn azure(&self) -> Result<(&str, &str)> {
        let key = self
            .azure_key
            .as_deref()
            .ok_or_else(|| Error::Config("AZURE_OCR_KEY not set in .env".to_string()))?;
        let endpoint = self
            .azure_endpoint
            .as_deref()
            .ok_or_else(|| Error::Config("AZURE_OCR_ENDPOINT not set in .env".to_string()))?;
        Ok((key, endpoint))
    }
}

fn parse_or<T: FromStr + Copy + std::fmt::Display>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    valid: impl Fn(&T) -> bool,
) -> T {
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(v) if valid(&v) => v,
        _ => {
            tracing::warn!("[config] invalid {}='{}', using default {}", key, raw, default);
            default
        }
    }
}

pub fn app_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join(APP_DIR))
}

fn default_db_path() -> PathBuf {
    app_data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hts_form_scanner.db")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Settings {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let s = settings(&[]);
        assert_eq!(s.calibration.max_distance, 0.25);
        assert_eq!(s.extraction.query_min_confidence, 0.70);
        assert_eq!(s.backup_keep, 20);
        assert!(s.azure().is_err());
    }

    #[test]
    fn overrides_and_invalid_values() {
        let s = settings(&[
            ("CALIBRATION_MAX_DISTANCE", "0.1"),
            ("OCR_REGION_TOLERANCE", "banana"),
            ("OCR_BACKUP_KEEP", "0"),
            ("HTS_SCANNER_DB", "/tmp/x.db"),
            ("AZURE_OCR_KEY", "k"),
            ("AZURE_OCR_ENDPOINT", "https://example.test/"),
        ]);
        assert_eq!(s.calibration.max_distance, 0.1);
        assert_eq!(s.extraction.region_tolerance, 0.02);
        assert_eq!(s.backup_keep, 20);
        assert_eq!(s.db_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(s.azure().unwrap(), ("k", "https://example.test/"));
    }
}
