//! Release gate for retiring the legacy map: every legacy field with
//! coordinates must be reachable in the nested structure with a region.

use serde::Serialize;

use crate::models::{FieldRef, Page, Region, Template};
use crate::services::resolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MissingReason {
    NotInStructure,
    NoRegion,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingField {
    #[serde(flatten)]
    pub field: FieldRef,
    pub reason: MissingReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageReport {
    pub mapped_count: usize,
    pub not_found_count: usize,
    pub missing: Vec<MissingField>,
    /// mapped / (mapped + notFound), as a percentage. 100 when nothing needs mapping.
    pub coverage: f64,
}

impl CoverageReport {
    pub fn is_complete(&self) -> bool {
        self.not_found_count == 0
    }
}

pub fn validate_coverage(template: &Template) -> CoverageReport {
    let mut mapped_count = 0;
    let mut missing = Vec::new();

    for page in Page::ALL {
        let Some(legacy) = template.legacy_fields(page) else {
            continue;
        };
        for (name, spec) in legacy.iter() {
            if spec.effective_region().is_none() {
                continue;
            }
            match resolver::resolve_in_structure(template, page, name) {
                Some(found) if found.region().is_some() => mapped_count += 1,
                Some(_) => missing.push(MissingField {
                    field: FieldRef::new(page, name),
                    reason: MissingReason::NoRegion,
                }),
                None => missing.push(MissingField {
                    field: FieldRef::new(page, name),
                    reason: MissingReason::NotInStructure,
                }),
            }
        }
    }

    let not_found_count = missing.len();
    let total = mapped_count + not_found_count;
    let coverage = if total == 0 {
        100.0
    } else {
        mapped_count as f64 * 100.0 / total as f64
    };
    for miss in &missing {
        tracing::debug!("[coverage] {} not covered ({:?})", miss.field, miss.reason);
    }
    CoverageReport {
        mapped_count,
        not_found_count,
        missing,
        coverage,
    }
}

/// A field whose region differs between the two representations.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionConflict {
    pub field: FieldRef,
    pub structure: Region,
    pub legacy: Region,
}

/// Fields carrying a region in both representations must agree.
pub fn check_consistency(template: &Template) -> Vec<RegionConflict> {
    let mut conflicts = Vec::new();
    for page in Page::ALL {
        let Some(legacy) = template.legacy_fields(page) else {
            continue;
        };
        for (name, spec) in legacy.iter() {
            let Some(legacy_region) = spec.region else {
                continue;
            };
            let Some(structure_region) = resolver::resolve_in_structure(template, page, name)
                .and_then(|found| found.spec.region)
            else {
                continue;
            };
            if !same_region(&structure_region, &legacy_region) {
                conflicts.push(RegionConflict {
                    field: FieldRef::new(page, name),
                    structure: structure_region,
                    legacy: legacy_region,
                });
            }
        }
    }
    conflicts
}

fn same_region(a: &Region, b: &Region) -> bool {
    const EPS: f64 = 1e-9;
    (a.x - b.x).abs() < EPS
        && (a.y - b.y).abs() < EPS
        && (a.width - b.width).abs() < EPS
        && (a.height - b.height).abs() < EPS
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map, Value};

    fn region(i: usize) -> Value {
        json!({ "x": 0.01 * i as f64, "y": 0.05, "width": 0.1, "height": 0.02 })
    }

    #[test]
    fn eight_of_ten_is_eighty_percent() {
        let mut legacy = Map::new();
        let mut fields = Vec::new();
        for i in 0..10 {
            let name = format!("field{}", i);
            legacy.insert(name.clone(), json!({ "region": region(i) }));
            if i < 8 {
                fields.push(json!({ "name": name, "region": region(i) }));
            } else if i == 8 {
                fields.push(json!(name));
            }
        }
        let t = Template::from_value(json!({
            "ocrMapping": { "front": { "fields": legacy } },
            "structure": { "front": { "sections": { "all": { "fields": fields } } } }
        }))
        .unwrap();

        let report = validate_coverage(&t);
        assert_eq!(report.mapped_count, 8);
        assert_eq!(report.not_found_count, 2);
        assert_eq!(report.coverage, 80.0);
        assert_eq!(
            report.missing,
            vec![
                MissingField {
                    field: FieldRef::new(Page::Front, "field8"),
                    reason: MissingReason::NoRegion
                },
                MissingField {
                    field: FieldRef::new(Page::Front, "field9"),
                    reason: MissingReason::NotInStructure
                },
            ]
        );
        assert!(!report.is_complete());
    }

    #[test]
    fn legacy_fields_without_region_are_ignored() {
        let t = Template::from_value(json!({
            "ocrMapping": { "front": { "fields": { "notes": { "label": "Notes" } } } },
            "structure": {}
        }))
        .unwrap();
        let report = validate_coverage(&t);
        assert_eq!(report.mapped_count + report.not_found_count, 0);
        assert_eq!(report.coverage, 100.0);
    }

    #[test]
    fn conflicting_regions_are_reported() {
        let t = Template::from_value(json!({
            "ocrMapping": { "front": { "fields": {
                "a": { "region": region(1) },
                "b": { "region": region(2) }
            }}},
            "structure": { "front": { "sections": { "s": { "fields": [
                { "name": "a", "region": region(1) },
                { "name": "b", "region": region(5) }
            ]}}}}
        }))
        .unwrap();
        let conflicts = check_consistency(&t);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].field.name, "b");
    }
}
