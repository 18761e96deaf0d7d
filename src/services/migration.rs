//! Legacy flat `ocrMapping` -> nested `structure` migration.
//!
//! Metadata is merged fill-if-empty: an attribute already present in the
//! structure always wins. Legacy fields with no structural home are appended
//! to a catch-all section so no coordinates are lost. The legacy map is kept
//! and flagged deprecated.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;

use crate::models::{
    FieldEntry, FieldRef, FieldSpec, NamedList, Page, Section, Template, HYBRID_FORMAT,
    MIGRATED_SECTION,
};

const DEPRECATION_REASON: &str =
    "Superseded by structure (hybrid-v1). Retained read-only for rollback.";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    /// Structure entries whose content changed, including catch-all insertions.
    pub migrated_count: usize,
    /// Legacy fields with no structural counterpart, now in the catch-all section.
    pub unmapped: Vec<FieldRef>,
    /// Structure fields carrying no coordinates at all after the merge.
    pub without_coordinates: Vec<FieldRef>,
    /// Fields whose legacy options were left out because they repeat a subfield name.
    pub option_conflicts: Vec<FieldRef>,
    /// Whether format, date and deprecation stamps were written.
    pub stamped: bool,
}

impl MigrationReport {
    pub fn changed(&self) -> bool {
        self.migrated_count > 0 || self.stamped
    }
}

/// Migrate a snapshot, returning the new template and what changed.
pub fn migrate(template: &Template, now: DateTime<Utc>) -> (Template, MigrationReport) {
    let mut next = template.clone();
    let mut report = MigrationReport::default();

    for page in Page::ALL {
        let legacy = match template.legacy_fields(page) {
            Some(fields) if !fields.is_empty() => fields.clone(),
            _ => NamedList::new(),
        };

        if let Some(structure) = next.structure.page_mut(page) {
            for (_, section) in structure.sections.iter_mut() {
                for entry in section.fields.iter_mut() {
                    merge_entry(page, entry, &legacy, &mut report);
                }
            }
        }

        let mut present = HashSet::new();
        if let Some(structure) = next.structure.page(page) {
            for (_, section) in structure.sections.iter() {
                collect_keys(&section.fields, &mut present);
            }
        }

        let orphans: Vec<(String, FieldSpec)> = legacy
            .iter()
            .filter(|(name, _)| !present.contains(*name))
            .map(|(name, spec)| {
                let mut spec = spec.clone();
                spec.name = name.to_string();
                (name.to_string(), spec)
            })
            .collect();

        if !orphans.is_empty() {
            let structure = next.structure.page_or_insert(page);
            if !structure.sections.contains_key(MIGRATED_SECTION) {
                let mut section = Section::default();
                section
                    .extra
                    .insert("title".to_string(), json!("Migrated Flat Fields"));
                structure.sections.insert(MIGRATED_SECTION, section);
            }
            if let Some(section) = structure.sections.get_mut(MIGRATED_SECTION) {
                for (name, spec) in orphans {
                    tracing::info!(
                        "[migration] {}/{} has no structural home, moved to {}",
                        page,
                        name,
                        MIGRATED_SECTION
                    );
                    section.fields.push(FieldEntry::Spec(Box::new(spec)));
                    report
                        .unmapped
                        .push(FieldRef::in_section(page, MIGRATED_SECTION, name));
                    report.migrated_count += 1;
                }
            }
        }

        if let Some(structure) = next.structure.page(page) {
            for (section_name, section) in structure.sections.iter() {
                collect_uncoordinated(page, section_name, &section.fields, &mut report);
            }
        }
    }

    if report.migrated_count > 0 || !template.is_migrated() {
        let stamp = now.to_rfc3339();
        next.mapping_format = Some(HYBRID_FORMAT.to_string());
        next.migration_date = Some(stamp.clone());
        next.ocr_mapping.deprecated = Some(true);
        next.ocr_mapping.deprecation_reason = Some(DEPRECATION_REASON.to_string());
        next.ocr_mapping.deprecation_date = Some(stamp);
        report.stamped = true;
    }

    tracing::info!(
        "[migration] migrated {} entries, {} unmapped, stamped: {}",
        report.migrated_count,
        report.unmapped.len(),
        report.stamped
    );
    (next, report)
}

fn merge_entry(
    page: Page,
    entry: &mut FieldEntry,
    legacy: &NamedList<FieldSpec>,
    report: &mut MigrationReport,
) {
    if let FieldEntry::Name(name) = entry {
        let Some(source) = legacy.get(name) else {
            return;
        };
        let mut spec = FieldSpec::named(name.clone());
        spec.fill_from(source);
        *entry = FieldEntry::Spec(Box::new(spec));
        report.migrated_count += 1;
    } else if let FieldEntry::Spec(spec) = entry {
        let key = spec.key().unwrap_or_default().to_string();
        if let Some(source) = legacy.get(&key) {
            if let Some(clash) = source.options.as_deref().and_then(|o| spec.subfield_clash(o)) {
                tracing::warn!(
                    "[migration] {}/{}: legacy options not merged, '{}' is already a subfield",
                    page,
                    key,
                    clash
                );
                report.option_conflicts.push(FieldRef::new(page, key.clone()));
            }
            if spec.fill_from(source) {
                report.migrated_count += 1;
            }
        }
    }

    if let FieldEntry::Spec(spec) = entry {
        for child in spec.subfields.iter_mut().flatten() {
            merge_entry(page, child, legacy, report);
        }
        for child in spec.options.iter_mut().flatten() {
            merge_entry(page, child, legacy, report);
        }
    }
}

fn collect_keys(entries: &[FieldEntry], out: &mut HashSet<String>) {
    for entry in entries {
        if let Some(key) = entry.key() {
            out.insert(key.to_string());
        }
        if let FieldEntry::Spec(spec) = entry {
            collect_keys(spec.subfields.as_deref().unwrap_or(&[]), out);
            collect_keys(spec.options.as_deref().unwrap_or(&[]), out);
        }
    }
}

fn collect_uncoordinated(
    page: Page,
    section: &str,
    entries: &[FieldEntry],
    report: &mut MigrationReport,
) {
    for entry in entries {
        let Some(key) = entry.key() else {
            continue;
        };
        match entry {
            FieldEntry::Name(_) => report
                .without_coordinates
                .push(FieldRef::in_section(page, section, key)),
            FieldEntry::Spec(spec) => {
                if spec.effective_region().is_none() && spec.children().next().is_none() {
                    report
                        .without_coordinates
                        .push(FieldRef::in_section(page, section, key));
                }
                collect_uncoordinated(page, section, spec.subfields.as_deref().unwrap_or(&[]), report);
                collect_uncoordinated(page, section, spec.options.as_deref().unwrap_or(&[]), report);
            }
        }
    }
}
