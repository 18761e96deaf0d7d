//! Drift measurement between template regions and OCR-observed positions.
//!
//! `calibrate` only proposes. `apply` is the sole way observations reach a
//! template, and it works on a copy; the caller persists it behind a backup.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::models::{FieldEntry, FieldRef, FieldSpec, Page, Region, Template};
use crate::services::resolver;
use crate::services::similarity::LabelMatcher;
use crate::types::OcrPageResult;

/// Drift above which a field is counted as mismatched in the summary.
pub const DRIFT_THRESHOLD: f64 = 0.05;

/// Drift below which auto-selection leaves a field alone.
pub const SIGNIFICANT_DRIFT: f64 = 0.02;

#[derive(Debug, Clone, Copy)]
pub struct CalibrationSettings {
    /// Distance (page-relative) at which confidence reaches zero.
    pub max_distance: f64,
    pub matcher: LabelMatcher,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            max_distance: 0.25,
            matcher: LabelMatcher::default(),
        }
    }
}

/// How the observed position was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchSource {
    Query,
    Label,
    NearbyLabel,
    Pattern,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationObservation {
    /// `page/fieldName`
    pub id: String,
    pub page: Page,
    pub field_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub method: MatchSource,
    pub matched_text: String,
    pub old_region: Region,
    pub new_region: Region,
    pub distance: f64,
    /// 0..=100
    pub confidence: f64,
    #[serde(default)]
    pub ocr_confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationSummary {
    pub considered: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub mean_distance: f64,
    pub drifted: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationReport {
    pub observations: Vec<CalibrationObservation>,
    pub summary: CalibrationSummary,
}

impl CalibrationReport {
    pub fn merge(&mut self, other: CalibrationReport) {
        let matched = self.summary.matched + other.summary.matched;
        let total_distance = self.summary.mean_distance * self.summary.matched as f64
            + other.summary.mean_distance * other.summary.matched as f64;
        self.observations.extend(other.observations);
        self.summary.considered += other.summary.considered;
        self.summary.matched = matched;
        self.summary.unmatched += other.summary.unmatched;
        self.summary.drifted += other.summary.drifted;
        self.summary.mean_distance = if matched == 0 {
            0.0
        } else {
            total_distance / matched as f64
        };
    }
}

/// `100 * max(0, 1 - distance / max_distance)`, clipped to 0..=100.
pub fn confidence_for(distance: f64, max_distance: f64) -> f64 {
    if max_distance <= 0.0 {
        return 0.0;
    }
    (100.0 * (1.0 - distance / max_distance)).clamp(0.0, 100.0)
}

struct Candidate {
    source: MatchSource,
    text: String,
    location: Region,
    ocr_confidence: f64,
}

/// Propose corrections for every field on `page` that declares a region.
pub fn calibrate(
    template: &Template,
    page: Page,
    ocr: &OcrPageResult,
    settings: &CalibrationSettings,
) -> CalibrationReport {
    let mut report = CalibrationReport::default();
    let mut total_distance = 0.0;

    for found in resolver::resolve_page(template, page) {
        let Some(old_region) = found.spec.region else {
            continue;
        };
        report.summary.considered += 1;

        let candidates = candidates_for(&found.spec, &old_region, ocr, settings);
        let best = candidates
            .into_iter()
            .map(|c| (old_region.center_distance(&c.location), c))
            .fold(None::<(f64, Candidate)>, |best, (d, c)| match best {
                Some((bd, b)) if bd < d || (bd == d && b.ocr_confidence >= c.ocr_confidence) => {
                    Some((bd, b))
                }
                _ => Some((d, c)),
            });

        let Some((distance, candidate)) = best else {
            tracing::debug!("[calibration] {}/{}: no matching text", page, found.name());
            report.summary.unmatched += 1;
            continue;
        };

        let centre = candidate.location.center();
        let new_region = Region::new(
            centre.x - old_region.width / 2.0,
            centre.y - old_region.height / 2.0,
            old_region.width,
            old_region.height,
        )
        .rounded(3);

        report.summary.matched += 1;
        total_distance += distance;
        if distance > DRIFT_THRESHOLD {
            report.summary.drifted += 1;
        }
        report.observations.push(CalibrationObservation {
            id: FieldRef::new(page, found.name()).to_string(),
            page,
            field_name: found.name().to_string(),
            label: found.spec.label.clone(),
            method: candidate.source,
            matched_text: candidate.text,
            old_region,
            new_region,
            distance,
            confidence: confidence_for(distance, settings.max_distance),
            ocr_confidence: candidate.ocr_confidence,
        });
    }

    if report.summary.matched > 0 {
        report.summary.mean_distance = total_distance / report.summary.matched as f64;
    }
    tracing::info!(
        "[calibration] {} page: {} considered, {} matched, {} drifted past {}",
        page,
        report.summary.considered,
        report.summary.matched,
        report.summary.drifted,
        DRIFT_THRESHOLD
    );
    report
}

fn candidates_for(
    field: &FieldSpec,
    old_region: &Region,
    ocr: &OcrPageResult,
    settings: &CalibrationSettings,
) -> Vec<Candidate> {
    let mut out = Vec::new();
    let mut label_tokens = Vec::new();

    if let Some(query) = field.query.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
        for answer in ocr.queries.iter().filter(|a| a.id == query) {
            if let Some(location) = answer.bounding_box {
                out.push(Candidate {
                    source: MatchSource::Query,
                    text: answer.text.clone(),
                    location,
                    ocr_confidence: answer.confidence,
                });
            }
        }
    }

    let labels = [
        (MatchSource::Label, field.label.as_deref()),
        (MatchSource::NearbyLabel, field.nearby_label_text()),
    ];
    for (source, label) in labels {
        let Some(label) = label.filter(|l| !l.trim().is_empty()) else {
            continue;
        };
        for pair in &ocr.key_values {
            if settings.matcher.score(label, &pair.key).is_none() {
                continue;
            }
            if let Some(location) = pair.value_box {
                out.push(Candidate {
                    source,
                    text: pair.value.clone(),
                    location,
                    ocr_confidence: pair.confidence,
                });
            }
        }
        if source == MatchSource::NearbyLabel {
            for token in &ocr.tokens {
                if settings.matcher.score(label, &token.text).is_some() {
                    // The value sits right of its printed label.
                    let printed = token.bounding_box;
                    label_tokens.push(Candidate {
                        source,
                        text: token.text.clone(),
                        location: Region::new(
                            printed.right(),
                            printed.y,
                            old_region.width,
                            printed.height,
                        ),
                        ocr_confidence: token.confidence.unwrap_or(1.0),
                    });
                }
            }
        }
    }

    if let Some(pattern) = field.pattern.as_deref().filter(|p| !p.is_empty()) {
        match Regex::new(pattern) {
            Ok(re) => {
                for token in ocr.tokens.iter().filter(|t| re.is_match(t.text.trim())) {
                    out.push(Candidate {
                        source: MatchSource::Pattern,
                        text: token.text.clone(),
                        location: token.bounding_box,
                        ocr_confidence: token.confidence.unwrap_or(1.0),
                    });
                }
            }
            Err(e) => {
                tracing::warn!("[calibration] {}: invalid pattern '{}': {}", field.name, pattern, e)
            }
        }
    }
    if out.is_empty() {
        out = label_tokens;
    }
    out
}

/// Ids of observations worth applying without review.
pub fn auto_select(report: &CalibrationReport, min_confidence: f64) -> Vec<String> {
    report
        .observations
        .iter()
        .filter(|o| o.confidence >= min_confidence && o.distance > SIGNIFICANT_DRIFT)
        .map(|o| o.id.clone())
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyReport {
    pub applied: Vec<String>,
    /// Observations naming a field found in neither representation.
    pub skipped: Vec<String>,
    pub structure_updates: usize,
    pub legacy_updates: usize,
}

/// Write the approved observations' regions into a copy of the template.
pub fn apply(template: &Template, approved: &[CalibrationObservation]) -> (Template, ApplyReport) {
    let mut next = template.clone();
    let mut report = ApplyReport::default();
    let mut seen = HashSet::new();

    for obs in approved {
        if !seen.insert(obs.id.clone()) {
            continue;
        }
        let mut touched = false;

        if let Some(path) = resolver::locate(&next, obs.page, &obs.field_name) {
            if let Some(entry) = resolver::entry_at_mut(&mut next, obs.page, &path) {
                match entry {
                    FieldEntry::Spec(spec) => move_field(spec, obs),
                    FieldEntry::Name(name) => {
                        let mut spec = FieldSpec::named(name.clone());
                        spec.region = Some(obs.new_region);
                        *entry = FieldEntry::Spec(Box::new(spec));
                    }
                }
                report.structure_updates += 1;
                touched = true;
            }
        }

        if let Some(legacy) = next.ocr_mapping.page_mut(obs.page) {
            if let Some(spec) = legacy.fields.get_mut(&obs.field_name) {
                move_field(spec, obs);
                report.legacy_updates += 1;
                touched = true;
            }
        }

        if touched {
            tracing::info!(
                "[calibration] {} region -> ({:.3}, {:.3}) {:.3}x{:.3}",
                obs.id,
                obs.new_region.x,
                obs.new_region.y,
                obs.new_region.width,
                obs.new_region.height
            );
            report.applied.push(obs.id.clone());
        } else {
            tracing::warn!("[calibration] {} not found in structure or ocrMapping, skipped", obs.id);
            report.skipped.push(obs.id.clone());
        }
    }
    (next, report)
}

/// Set the measured `region` to the proposal; a `boundingBox` moves by the same offset.
fn move_field(spec: &mut FieldSpec, obs: &CalibrationObservation) {
    spec.region = Some(obs.new_region);
    if let Some(bounding_box) = spec.bounding_box {
        let from = obs.old_region.center();
        let to = obs.new_region.center();
        spec.bounding_box = Some(bounding_box.translate(to.x - from.x, to.y - from.y).rounded(3));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{KeyValuePair, OcrToken, QueryAnswer};
    use serde_json::json;

    fn template() -> Template {
        Template::from_value(json!({
            "ocrMapping": { "front": { "fields": {
                "firstName": { "label": "First Name", "region": { "x": 0.1, "y": 0.2, "width": 0.2, "height": 0.02 } },
                "age": { "label": "Age", "pattern": "^\\d{1,3}$", "region": { "x": 0.6, "y": 0.2, "width": 0.1, "height": 0.02 } },
                "signature": { "label": "Signature", "region": { "x": 0.1, "y": 0.9, "width": 0.3, "height": 0.05 } }
            }}},
            "structure": { "front": { "sections": { "n": { "fields": ["firstName", "lastName"] } } } }
        }))
        .unwrap()
    }

    fn kv(key: &str, value: &str, value_box: Region) -> KeyValuePair {
        KeyValuePair {
            key: key.to_string(),
            value: value.to_string(),
            key_box: None,
            value_box: Some(value_box),
            confidence: 0.9,
        }
    }

    #[test]
    fn confidence_formula() {
        assert_eq!(confidence_for(0.0, 0.25), 100.0);
        assert!((confidence_for(0.125, 0.25) - 50.0).abs() < 1e-9);
        assert_eq!(confidence_for(0.3, 0.25), 0.0);
    }

    #[test]
    fn nearest_candidate_is_chosen_and_unmatched_omitted() {
        let ocr = OcrPageResult {
            key_values: vec![
                kv("First Name:", "Juan", Region::new(0.13, 0.21, 0.2, 0.02)),
                kv("First name", "Juan", Region::new(0.5, 0.5, 0.2, 0.02)),
            ],
            tokens: vec![OcrToken {
                text: "34".to_string(),
                bounding_box: Region::new(0.6, 0.2, 0.02, 0.02),
                confidence: Some(0.99),
            }],
            ..OcrPageResult::default()
        };
        let report = calibrate(&template(), Page::Front, &ocr, &CalibrationSettings::default());
        assert_eq!(report.summary.considered, 3);
        assert_eq!(report.summary.matched, 2);
        assert_eq!(report.summary.unmatched, 1);

        let first = &report.observations[0];
        assert_eq!(first.id, "front/firstName");
        assert_eq!(first.method, MatchSource::Label);
        assert_eq!(first.new_region, Region::new(0.13, 0.21, 0.2, 0.02));
        assert!((first.distance - (0.03f64.powi(2) + 0.01f64.powi(2)).sqrt()).abs() < 1e-9);

        let age = &report.observations[1];
        assert_eq!(age.method, MatchSource::Pattern);
        assert!(report.observations.iter().all(|o| o.field_name != "signature"));
    }

    #[test]
    fn ties_prefer_higher_ocr_confidence() {
        let t = Template::from_value(json!({
            "ocrMapping": {},
            "structure": { "front": { "sections": { "s": { "fields": [
                { "name": "testDate", "query": "Date of test?", "label": "Date",
                  "region": { "x": 0.375, "y": 0.375, "width": 0.25, "height": 0.25 } }
            ]}}}}
        }))
        .unwrap();
        let ocr = OcrPageResult {
            queries: vec![QueryAnswer {
                id: "Date of test?".to_string(),
                text: "01/02/2025".to_string(),
                confidence: 0.95,
                bounding_box: Some(Region::new(0.5, 0.375, 0.25, 0.25)),
            }],
            key_values: vec![KeyValuePair {
                key: "Date".to_string(),
                value: "01/02/2O25".to_string(),
                key_box: None,
                value_box: Some(Region::new(0.25, 0.375, 0.25, 0.25)),
                confidence: 0.6,
            }],
            ..OcrPageResult::default()
        };
        let report = calibrate(&t, Page::Front, &ocr, &CalibrationSettings::default());
        assert_eq!(report.observations[0].method, MatchSource::Query);
    }

    #[test]
    fn apply_updates_both_representations() {
        let t = template();
        let obs = CalibrationObservation {
            id: "front/firstName".to_string(),
            page: Page::Front,
            field_name: "firstName".to_string(),
            label: None,
            method: MatchSource::Label,
            matched_text: "Juan".to_string(),
            old_region: Region::new(0.1, 0.2, 0.2, 0.02),
            new_region: Region::new(0.13, 0.21, 0.2, 0.02),
            distance: 0.03,
            confidence: 88.0,
            ocr_confidence: 0.9,
        };
        let mut ghost = obs.clone();
        ghost.id = "front/ghost".to_string();
        ghost.field_name = "ghost".to_string();

        let (next, report) = apply(&t, &[obs, ghost]);
        assert_eq!(report.applied, vec!["front/firstName".to_string()]);
        assert_eq!(report.skipped, vec!["front/ghost".to_string()]);
        let structural = resolver::resolve_in_structure(&next, Page::Front, "firstName").unwrap();
        assert_eq!(structural.spec.region, Some(Region::new(0.13, 0.21, 0.2, 0.02)));
        let legacy = resolver::resolve_in_legacy(&next, Page::Front, "firstName").unwrap();
        assert_eq!(legacy.spec.region, Some(Region::new(0.13, 0.21, 0.2, 0.02)));
        assert_eq!(
            t.legacy_fields(Page::Front).unwrap().get("firstName").unwrap().region,
            Some(Region::new(0.1, 0.2, 0.2, 0.02))
        );
    }

    #[test]
    fn auto_select_needs_confidence_and_real_drift() {
        let base = CalibrationObservation {
            id: "front/a".to_string(),
            page: Page::Front,
            field_name: "a".to_string(),
            label: None,
            method: MatchSource::Label,
            matched_text: String::new(),
            old_region: Region::new(0.0, 0.0, 0.1, 0.1),
            new_region: Region::new(0.0, 0.0, 0.1, 0.1),
            distance: 0.03,
            confidence: 88.0,
            ocr_confidence: 1.0,
        };
        let mut tiny = base.clone();
        tiny.id = "front/b".to_string();
        tiny.distance = 0.01;
        let mut weak = base.clone();
        weak.id = "front/c".to_string();
        weak.confidence = 40.0;
        let report = CalibrationReport {
            observations: vec![base, tiny, weak],
            summary: CalibrationSummary::default(),
        };
        assert_eq!(auto_select(&report, 85.0), vec!["front/a".to_string()]);
    }

    #[test]
    fn drift_is_measured_from_region_and_gone_after_apply() {
        let t = Template::from_value(json!({
            "ocrMapping": {},
            "structure": { "front": { "sections": { "s": { "fields": [
                { "name": "firstName", "label": "First Name",
                  "region": { "x": 0.1, "y": 0.1, "width": 0.1, "height": 0.02 },
                  "boundingBox": { "x": 0.5, "y": 0.5, "width": 0.1, "height": 0.02 } }
            ]}}}}
        }))
        .unwrap();
        let ocr = OcrPageResult {
            key_values: vec![kv("First Name", "Ana", Region::new(0.12, 0.12, 0.1, 0.02))],
            ..OcrPageResult::default()
        };
        let settings = CalibrationSettings::default();

        let first = calibrate(&t, Page::Front, &ocr, &settings);
        let obs = &first.observations[0];
        assert_eq!(obs.old_region, Region::new(0.1, 0.1, 0.1, 0.02));
        assert!((obs.distance - 0.02f64.hypot(0.02)).abs() < 1e-9);

        let (next, _) = apply(&t, &first.observations);
        let moved = resolver::resolve_in_structure(&next, Page::Front, "firstName").unwrap();
        assert_eq!(moved.spec.region, Some(Region::new(0.12, 0.12, 0.1, 0.02)));
        assert_eq!(moved.spec.bounding_box, Some(Region::new(0.52, 0.52, 0.1, 0.02)));

        let second = calibrate(&next, Page::Front, &ocr, &settings);
        assert!(second.observations[0].distance < 1e-9);
        assert_eq!(second.summary.drifted, 0);
    }

    #[test]
    fn printed_label_only_places_field_beside_it() {
        let t = Template::from_value(json!({
            "ocrMapping": {},
            "structure": { "front": { "sections": { "s": { "fields": [
                { "name": "testSite", "nearbyLabel": { "text": "Testing site" },
                  "region": { "x": 0.3, "y": 0.4, "width": 0.2, "height": 0.02 } }
            ]}}}}
        }))
        .unwrap();
        let ocr = OcrPageResult {
            tokens: vec![OcrToken {
                text: "Testing site".to_string(),
                bounding_box: Region::new(0.1, 0.41, 0.15, 0.02),
                confidence: Some(0.95),
            }],
            ..OcrPageResult::default()
        };
        let report = calibrate(&t, Page::Front, &ocr, &CalibrationSettings::default());
        let obs = &report.observations[0];
        assert_eq!(obs.method, MatchSource::NearbyLabel);
        assert_eq!(obs.new_region, Region::new(0.25, 0.41, 0.2, 0.02));

        let mut with_pair = ocr.clone();
        with_pair.key_values = vec![kv("Testing site", "Clinic", Region::new(0.31, 0.4, 0.2, 0.02))];
        let report = calibrate(&t, Page::Front, &with_pair, &CalibrationSettings::default());
        assert_eq!(report.observations[0].matched_text, "Clinic");
    }
}
