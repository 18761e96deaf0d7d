//! Per-field extraction with a fixed fallback chain.
//!
//! The declared `extractionMethod` runs first; when it yields nothing the
//! coordinate strategy is tried before the field is marked failed. Misses are
//! never errors, they are counted in [`ExtractionStats`].

use regex::Regex;
use std::collections::HashSet;

use crate::models::{ExtractionMethod, FieldEntry, FieldKind, FieldSpec, Page, Region, Template};
use crate::services::resolver;
use crate::services::similarity::LabelMatcher;
use crate::types::{
    ExtractionResult, ExtractionStats, FieldValue, MethodUsed, OcrPageResult, OcrToken,
    PageExtraction, SelectionMark,
};

#[derive(Debug, Clone, Copy)]
pub struct ExtractionSettings {
    pub query_min_confidence: f64,
    pub review_threshold: f64,
    /// Grows every region on each side before containment tests.
    pub region_tolerance: f64,
    /// Half-height of the band scanned to the right of a checked box.
    pub checkbox_text_band: f64,
    pub matcher: LabelMatcher,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            query_min_confidence: 0.70,
            review_threshold: 0.70,
            region_tolerance: 0.02,
            checkbox_text_band: 0.01,
            matcher: LabelMatcher::default(),
        }
    }
}

struct Hit {
    value: FieldValue,
    confidence: f64,
}

/// Extract one field from one page of OCR output.
pub fn extract(field: &FieldSpec, ocr: &OcrPageResult, settings: &ExtractionSettings) -> ExtractionResult {
    let declared = field.declared_method();
    let primary = match &declared {
        ExtractionMethod::Query => by_query(field, ocr, settings).map(|h| (h, MethodUsed::Query)),
        ExtractionMethod::FormField => {
            by_form_field(field, ocr, settings).map(|h| (h, MethodUsed::FormField))
        }
        ExtractionMethod::Coordinate => {
            by_coordinate(field, ocr, settings).map(|h| (h, MethodUsed::Coordinate))
        }
        ExtractionMethod::CheckboxDetection => {
            by_checkbox(field, ocr, settings).map(|h| (h, MethodUsed::CheckboxDetection))
        }
        ExtractionMethod::TextAfterCheckbox => {
            by_text_after_checkbox(field, ocr, settings).map(|h| (h, MethodUsed::TextAfterCheckbox))
        }
        ExtractionMethod::Other(name) => {
            tracing::debug!(
                "[extract] {}: unknown method '{}', using coordinate fallback",
                field.name,
                name
            );
            None
        }
    };

    let (hit, method, fallback_used) = match primary {
        Some((hit, method)) => (Some(hit), method, false),
        None if declared != ExtractionMethod::Coordinate => {
            match by_coordinate(field, ocr, settings) {
                Some(hit) => (Some(hit), MethodUsed::Coordinate, true),
                None => (None, MethodUsed::Failed, true),
            }
        }
        None => (None, MethodUsed::Failed, false),
    };

    let (value, confidence) = match hit {
        Some(hit) => (Some(hit.value), hit.confidence.clamp(0.0, 1.0)),
        None => (None, 0.0),
    };
    if method == MethodUsed::Failed {
        tracing::debug!("[extract] {}: no strategy matched", field.name);
    }
    ExtractionResult {
        field_name: field.name.clone(),
        value,
        method,
        confidence,
        requires_review: method == MethodUsed::Failed || confidence < settings.review_threshold,
        fallback_used,
    }
}

/// Extract every extractable field on a page and summarize.
pub fn extract_page(
    template: &Template,
    page: Page,
    ocr: &OcrPageResult,
    settings: &ExtractionSettings,
) -> PageExtraction {
    let consumed = checkbox_option_names(template, page);
    let mut results = Vec::new();
    let mut required = HashSet::new();

    for name in template.field_names(page) {
        if consumed.contains(&name) {
            continue;
        }
        let Some(found) = resolver::resolve_effective(template, page, &name) else {
            continue;
        };
        let spec = hydrate_options(template, page, &found.spec);
        if !spec.is_extractable() {
            continue;
        }
        if spec.is_required() {
            required.insert(name.clone());
        }
        results.push(extract(&spec, ocr, settings));
    }

    let stats = summarize(&results, &required);
    tracing::info!(
        "[extract] {} page: {} fields, {} failed, {} via fallback, overall {:.2}",
        page,
        stats.total,
        stats.failed,
        stats.fallback,
        stats.overall_confidence
    );
    PageExtraction {
        page,
        results,
        stats,
    }
}

/// Per-document counters. Required fields weigh double in the overall confidence.
pub fn summarize(results: &[ExtractionResult], required: &HashSet<String>) -> ExtractionStats {
    let mut stats = ExtractionStats {
        total: results.len(),
        ..ExtractionStats::default()
    };
    let mut weighted = 0.0;
    let mut weights = 0.0;
    for result in results {
        let is_required = required.contains(&result.field_name);
        if result.method == MethodUsed::Failed {
            stats.failed += 1;
            if is_required {
                stats.required_failures.push(result.field_name.clone());
            }
        } else {
            *stats
                .by_method
                .entry(result.method.as_str().to_string())
                .or_insert(0) += 1;
        }
        if result.fallback_used {
            stats.fallback += 1;
        }
        if result.requires_review {
            stats.requires_review += 1;
        }
        let weight = if is_required { 2.0 } else { 1.0 };
        weighted += result.confidence * weight;
        weights += weight;
    }
    if weights > 0.0 {
        stats.overall_confidence = weighted / weights;
    }
    stats
}

fn by_query(field: &FieldSpec, ocr: &OcrPageResult, settings: &ExtractionSettings) -> Option<Hit> {
    let query = field.query.as_deref().map(str::trim).filter(|q| !q.is_empty())?;
    let answer = ocr.queries.iter().find(|a| a.id == query)?;
    let text = answer.text.trim();
    if text.is_empty() || answer.confidence < settings.query_min_confidence {
        return None;
    }
    Some(Hit {
        value: FieldValue::Text(text.to_string()),
        confidence: answer.confidence,
    })
}

fn by_form_field(field: &FieldSpec, ocr: &OcrPageResult, settings: &ExtractionSettings) -> Option<Hit> {
    let label = Some(field.label_text())
        .filter(|l| !l.trim().is_empty())
        .or_else(|| field.nearby_label_text())?;
    let candidates = ocr.key_values.iter().filter(|kv| !kv.value.trim().is_empty());
    let (pair, score) = settings.matcher.best(label, candidates, |kv| kv.key.as_str())?;
    let text = pair.value.trim().to_string();
    let confidence = pair.confidence * score * pattern_factor(field, &text);
    Some(Hit {
        value: FieldValue::Text(text),
        confidence,
    })
}

fn by_coordinate(field: &FieldSpec, ocr: &OcrPageResult, settings: &ExtractionSettings) -> Option<Hit> {
    let area = field.effective_region()?.expand(settings.region_tolerance);
    let inside: Vec<&OcrToken> = ocr
        .tokens
        .iter()
        .filter(|t| area.contains(&t.bounding_box.center()))
        .collect();
    if inside.is_empty() {
        return None;
    }
    let ordered = reading_order(inside);
    let text = ordered
        .iter()
        .map(|t| t.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if text.is_empty() {
        return None;
    }
    let confidence = mean_confidence(&ordered) * pattern_factor(field, &text);
    Some(Hit {
        value: FieldValue::Text(text),
        confidence,
    })
}

fn by_checkbox(field: &FieldSpec, ocr: &OcrPageResult, settings: &ExtractionSettings) -> Option<Hit> {
    let options: Vec<(&str, Region)> = field
        .options
        .iter()
        .flatten()
        .filter_map(FieldEntry::as_spec)
        .filter_map(|o| Some((o.key()?, o.effective_region()?)))
        .collect();

    if options.is_empty() {
        let area = field.effective_region()?.expand(settings.region_tolerance);
        let mark = best_mark(marks_in(ocr, &area))?;
        return Some(Hit {
            value: FieldValue::Checked(mark.selected),
            confidence: mark.confidence,
        });
    }

    let mut seen_any = false;
    let mut selected: Vec<(&str, f64)> = Vec::new();
    for (name, region) in &options {
        let area = region.expand(settings.region_tolerance);
        if let Some(mark) = best_mark(marks_in(ocr, &area)) {
            seen_any = true;
            if mark.selected {
                selected.push((*name, mark.confidence));
            }
        }
    }
    if !seen_any {
        return None;
    }
    if selected.is_empty() {
        return Some(Hit {
            value: FieldValue::Selected(Vec::new()),
            confidence: settings.review_threshold,
        });
    }
    if field.field_type == Some(FieldKind::CheckboxGroup) {
        let confidence = selected.iter().map(|(_, c)| c).sum::<f64>() / selected.len() as f64;
        return Some(Hit {
            value: FieldValue::Selected(selected.iter().map(|(n, _)| n.to_string()).collect()),
            confidence,
        });
    }
    let (name, confidence) = selected
        .iter()
        .copied()
        .fold(None::<(&str, f64)>, |best, cur| match best {
            Some(b) if b.1 >= cur.1 => Some(b),
            _ => Some(cur),
        })?;
    Some(Hit {
        value: FieldValue::Text(name.to_string()),
        confidence,
    })
}

fn by_text_after_checkbox(
    field: &FieldSpec,
    ocr: &OcrPageResult,
    settings: &ExtractionSettings,
) -> Option<Hit> {
    let area = field.effective_region()?.expand(settings.region_tolerance);
    let mut checked: Vec<&SelectionMark> = marks_in(ocr, &area).filter(|m| m.selected).collect();
    checked.sort_by(|a, b| {
        let (ca, cb) = (a.bounding_box.center(), b.bounding_box.center());
        ca.y.total_cmp(&cb.y).then(ca.x.total_cmp(&cb.x))
    });
    let mark = checked.first()?;
    let anchor = mark.bounding_box.center();
    let band = settings.checkbox_text_band;
    let on_line = |r: &Region| (r.center().y - anchor.y).abs() <= band;

    let stop = ocr
        .selection_marks
        .iter()
        .filter(|m| on_line(&m.bounding_box) && m.bounding_box.x > mark.bounding_box.right())
        .map(|m| m.bounding_box.x)
        .fold(f64::INFINITY, f64::min);

    let mut after: Vec<&OcrToken> = ocr
        .tokens
        .iter()
        .filter(|t| {
            let c = t.bounding_box.center();
            on_line(&t.bounding_box) && c.x > mark.bounding_box.right() && c.x < stop
        })
        .collect();
    if after.is_empty() {
        return None;
    }
    after.sort_by(|a, b| a.bounding_box.x.total_cmp(&b.bounding_box.x));
    let text = after
        .iter()
        .map(|t| t.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if text.is_empty() {
        return None;
    }
    let confidence = mean_confidence(&after) * pattern_factor(field, &text);
    Some(Hit {
        value: FieldValue::Text(text),
        confidence,
    })
}

fn marks_in<'a>(ocr: &'a OcrPageResult, area: &'a Region) -> impl Iterator<Item = &'a SelectionMark> {
    ocr.selection_marks
        .iter()
        .filter(move |m| area.contains(&m.bounding_box.center()))
}

fn best_mark<'a>(marks: impl Iterator<Item = &'a SelectionMark>) -> Option<&'a SelectionMark> {
    marks.fold(None, |best: Option<&SelectionMark>, m| match best {
        Some(b) if b.confidence >= m.confidence => Some(b),
        _ => Some(m),
    })
}

/// Top-to-bottom lines, left-to-right within a line. Tokens share a line when
/// their vertical centers are within half a token height.
pub(crate) fn reading_order(mut tokens: Vec<&OcrToken>) -> Vec<&OcrToken> {
    tokens.sort_by(|a, b| a.bounding_box.center().y.total_cmp(&b.bounding_box.center().y));
    let mut lines: Vec<Vec<&OcrToken>> = Vec::new();
    for token in tokens {
        let cy = token.bounding_box.center().y;
        let joins = lines.last().and_then(|line| line.first()).map(|head| {
            let limit = head.bounding_box.height.max(token.bounding_box.height) / 2.0;
            (cy - head.bounding_box.center().y).abs() <= limit
        });
        match (joins, lines.last_mut()) {
            (Some(true), Some(line)) => line.push(token),
            _ => lines.push(vec![token]),
        }
    }
    lines
        .into_iter()
        .flat_map(|mut line| {
            line.sort_by(|a, b| a.bounding_box.x.total_cmp(&b.bounding_box.x));
            line
        })
        .collect()
}

fn mean_confidence(tokens: &[&OcrToken]) -> f64 {
    if tokens.is_empty() {
        return 0.0;
    }
    tokens.iter().map(|t| t.confidence.unwrap_or(1.0)).sum::<f64>() / tokens.len() as f64
}

/// 1.0 when the text matches `pattern` (or there is none), 0.5 otherwise.
fn pattern_factor(field: &FieldSpec, text: &str) -> f64 {
    let Some(pattern) = field.pattern.as_deref().filter(|p| !p.is_empty()) else {
        return 1.0;
    };
    match Regex::new(pattern) {
        Ok(re) if re.is_match(text) => 1.0,
        Ok(_) => 0.5,
        Err(e) => {
            tracing::warn!("[extract] {}: invalid pattern '{}': {}", field.name, pattern, e);
            1.0
        }
    }
}

/// Names of options consumed by their checkbox parent rather than extracted alone.
fn checkbox_option_names(template: &Template, page: Page) -> HashSet<String> {
    fn walk(entries: &[FieldEntry], out: &mut HashSet<String>) {
        for entry in entries {
            let Some(spec) = entry.as_spec() else {
                continue;
            };
            if spec.is_checkbox() {
                out.extend(spec.options.iter().flatten().filter_map(|o| o.key().map(str::to_string)));
            }
            walk(spec.subfields.as_deref().unwrap_or(&[]), out);
            walk(spec.options.as_deref().unwrap_or(&[]), out);
        }
    }
    let mut out = HashSet::new();
    if let Some(structure) = template.structure.page(page) {
        for (_, section) in structure.sections.iter() {
            walk(&section.fields, &mut out);
        }
    }
    out
}

/// Replace bare or region-less options with their resolved specs so
/// per-option checkbox detection sees legacy coordinates before migration.
fn hydrate_options(template: &Template, page: Page, spec: &FieldSpec) -> FieldSpec {
    let mut spec = spec.clone();
    if let Some(options) = spec.options.as_mut() {
        for option in options.iter_mut() {
            let needs_lookup = option
                .as_spec()
                .map(|o| o.effective_region().is_none())
                .unwrap_or(true);
            if !needs_lookup {
                continue;
            }
            let Some(key) = option.key().map(str::to_string) else {
                continue;
            };
            if let Some(found) = resolver::resolve_in_legacy(template, page, &key) {
                let mut merged = option.to_spec();
                if merged.name.is_empty() {
                    merged.name = key;
                }
                merged.region = merged.region.or(found.spec.region);
                merged.bounding_box = merged.bounding_box.or(found.spec.bounding_box);
                *option = FieldEntry::Spec(Box::new(merged));
            }
        }
    }
    spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{KeyValuePair, QueryAnswer};
    use serde_json::json;

    fn token(text: &str, x: f64, y: f64) -> OcrToken {
        OcrToken {
            text: text.to_string(),
            bounding_box: Region::new(x, y, 0.05, 0.015),
            confidence: Some(0.9),
        }
    }

    fn mark(x: f64, y: f64, selected: bool) -> SelectionMark {
        SelectionMark {
            bounding_box: Region::new(x, y, 0.015, 0.015),
            selected,
            confidence: 0.95,
        }
    }

    fn spec(value: serde_json::Value) -> FieldSpec {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn query_answer_wins() {
        let field = spec(json!({ "name": "firstName", "extractionMethod": "query", "query": "What is the first name?" }));
        let ocr = OcrPageResult {
            queries: vec![QueryAnswer {
                id: "What is the first name?".to_string(),
                text: "Juan".to_string(),
                confidence: 0.93,
                bounding_box: None,
            }],
            ..OcrPageResult::default()
        };
        let result = extract(&field, &ocr, &ExtractionSettings::default());
        assert_eq!(result.method, MethodUsed::Query);
        assert_eq!(result.value, Some(FieldValue::Text("Juan".to_string())));
        assert!(!result.fallback_used);
        assert!(!result.requires_review);
    }

    #[test]
    fn missing_query_falls_back_to_coordinate() {
        let field = spec(json!({
            "name": "firstName",
            "extractionMethod": "query",
            "query": "What is the first name?",
            "region": { "x": 0.1, "y": 0.2, "width": 0.3, "height": 0.03 }
        }));
        let ocr = OcrPageResult {
            tokens: vec![token("Juan", 0.12, 0.205), token("Carlos", 0.2, 0.206), token("Noise", 0.7, 0.7)],
            ..OcrPageResult::default()
        };
        let result = extract(&field, &ocr, &ExtractionSettings::default());
        assert_eq!(result.method, MethodUsed::Coordinate);
        assert_eq!(result.value, Some(FieldValue::Text("Juan Carlos".to_string())));
        assert!(result.fallback_used);
    }

    #[test]
    fn low_confidence_query_is_ignored() {
        let field = spec(json!({ "name": "age", "query": "Age?" }));
        let ocr = OcrPageResult {
            queries: vec![QueryAnswer {
                id: "Age?".to_string(),
                text: "34".to_string(),
                confidence: 0.4,
                bounding_box: None,
            }],
            ..OcrPageResult::default()
        };
        let result = extract(&field, &ocr, &ExtractionSettings::default());
        assert_eq!(result.method, MethodUsed::Failed);
        assert!(result.requires_review);
        assert!(result.value.is_none());
    }

    #[test]
    fn form_field_matches_fuzzy_key() {
        let field = spec(json!({ "name": "age", "label": "Age", "extractionMethod": "form-field", "pattern": "^\\d+$" }));
        let ocr = OcrPageResult {
            key_values: vec![KeyValuePair {
                key: "AGE:".to_string(),
                value: "34".to_string(),
                key_box: None,
                value_box: None,
                confidence: 0.9,
            }],
            ..OcrPageResult::default()
        };
        let result = extract(&field, &ocr, &ExtractionSettings::default());
        assert_eq!(result.method, MethodUsed::FormField);
        assert!((result.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn pattern_mismatch_halves_confidence() {
        let field = spec(json!({
            "name": "age",
            "pattern": "^\\d+$",
            "region": { "x": 0.1, "y": 0.1, "width": 0.2, "height": 0.03 }
        }));
        let ocr = OcrPageResult {
            tokens: vec![token("abc", 0.12, 0.11)],
            ..OcrPageResult::default()
        };
        let result = extract(&field, &ocr, &ExtractionSettings::default());
        assert!((result.confidence - 0.45).abs() < 1e-9);
        assert!(result.requires_review);
    }

    #[test]
    fn single_checkbox_yields_boolean() {
        let field = spec(json!({
            "name": "consent",
            "type": "checkbox",
            "region": { "x": 0.5, "y": 0.5, "width": 0.03, "height": 0.03 }
        }));
        let ocr = OcrPageResult {
            selection_marks: vec![mark(0.505, 0.505, true)],
            ..OcrPageResult::default()
        };
        let result = extract(&field, &ocr, &ExtractionSettings::default());
        assert_eq!(result.method, MethodUsed::CheckboxDetection);
        assert_eq!(result.value, Some(FieldValue::Checked(true)));
    }

    #[test]
    fn checkbox_group_lists_selected_options() {
        let field = spec(json!({
            "name": "reasons",
            "type": "checkbox-group",
            "options": [
                { "name": "a", "region": { "x": 0.1, "y": 0.1, "width": 0.02, "height": 0.02 } },
                { "name": "b", "region": { "x": 0.1, "y": 0.2, "width": 0.02, "height": 0.02 } },
                { "value": "c", "region": { "x": 0.1, "y": 0.3, "width": 0.02, "height": 0.02 } }
            ]
        }));
        let ocr = OcrPageResult {
            selection_marks: vec![mark(0.1, 0.1, true), mark(0.1, 0.2, false), mark(0.1, 0.3, true)],
            ..OcrPageResult::default()
        };
        let result = extract(&field, &ocr, &ExtractionSettings::default());
        assert_eq!(
            result.value,
            Some(FieldValue::Selected(vec!["a".to_string(), "c".to_string()]))
        );
    }

    #[test]
    fn text_after_checkbox_stops_at_next_mark() {
        let field = spec(json!({
            "name": "otherReason",
            "extractionMethod": "text-after-checkbox",
            "region": { "x": 0.1, "y": 0.4, "width": 0.05, "height": 0.03 }
        }));
        let ocr = OcrPageResult {
            tokens: vec![
                token("Travel", 0.14, 0.4),
                token("abroad", 0.2, 0.4),
                token("Unrelated", 0.5, 0.4),
                token("Below", 0.14, 0.45),
            ],
            selection_marks: vec![mark(0.11, 0.4, true), mark(0.45, 0.4, false)],
            ..OcrPageResult::default()
        };
        let result = extract(&field, &ocr, &ExtractionSettings::default());
        assert_eq!(result.method, MethodUsed::TextAfterCheckbox);
        assert_eq!(result.value, Some(FieldValue::Text("Travel abroad".to_string())));
    }

    #[test]
    fn reading_order_groups_lines() {
        let a = token("second-line", 0.1, 0.3);
        let b = token("right", 0.4, 0.2);
        let c = token("left", 0.1, 0.205);
        let ordered = reading_order(vec![&a, &b, &c]);
        let texts: Vec<_> = ordered.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["left", "right", "second-line"]);
    }

    #[test]
    fn stats_weight_required_fields() {
        let ok = ExtractionResult {
            field_name: "a".to_string(),
            value: Some(FieldValue::Text("x".to_string())),
            method: MethodUsed::Query,
            confidence: 0.9,
            requires_review: false,
            fallback_used: false,
        };
        let failed = ExtractionResult {
            field_name: "b".to_string(),
            value: None,
            method: MethodUsed::Failed,
            confidence: 0.0,
            requires_review: true,
            fallback_used: true,
        };
        let required: HashSet<String> = ["b".to_string()].into_iter().collect();
        let stats = summarize(&[ok, failed], &required);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.fallback, 1);
        assert_eq!(stats.by_method.get("query"), Some(&1));
        assert_eq!(stats.required_failures, vec!["b".to_string()]);
        assert!((stats.overall_confidence - 0.3).abs() < 1e-9);
    }

    #[test]
    fn page_extraction_skips_options_and_uses_legacy_regions() {
        let template = Template::from_value(json!({
            "ocrMapping": { "front": { "fields": {
                "sexMale": { "region": { "x": 0.1, "y": 0.1, "width": 0.02, "height": 0.02 } },
                "sexFemale": { "region": { "x": 0.2, "y": 0.1, "width": 0.02, "height": 0.02 } }
            }}},
            "structure": { "front": { "sections": { "d": { "fields": [
                { "name": "sex", "type": "checkbox", "required": true, "options": ["sexMale", "sexFemale"] }
            ]}}}}
        }))
        .unwrap();
        let ocr = OcrPageResult {
            selection_marks: vec![mark(0.1, 0.1, false), mark(0.2, 0.1, true)],
            ..OcrPageResult::default()
        };
        let extraction = extract_page(&template, Page::Front, &ocr, &ExtractionSettings::default());
        assert_eq!(extraction.results.len(), 1);
        assert_eq!(
            extraction.results[0].value,
            Some(FieldValue::Text("sexFemale".to_string()))
        );
        assert!(extraction.stats.required_failures.is_empty());
    }
}
