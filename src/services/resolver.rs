//! Hybrid field lookup: nested structure first, legacy flat map as fallback.

use serde::Serialize;
use std::borrow::Cow;

use crate::models::{FieldEntry, FieldSpec, Page, Region, Template};

/// Where a resolved field was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FieldSource {
    /// `depth` 0 is a section's top-level entry.
    Structure { section: String, depth: usize },
    Legacy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedField<'a> {
    pub page: Page,
    pub spec: Cow<'a, FieldSpec>,
    pub source: FieldSource,
}

impl ResolvedField<'_> {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn region(&self) -> Option<Region> {
        self.spec.effective_region()
    }

    pub fn from_structure(&self) -> bool {
        matches!(self.source, FieldSource::Structure { .. })
    }
}

/// Look a field up on one page. `None` is a data-quality signal, not an error.
pub fn resolve<'a>(template: &'a Template, page: Page, name: &str) -> Option<ResolvedField<'a>> {
    if let Some(found) = resolve_in_structure(template, page, name) {
        return Some(found);
    }
    if let Some(found) = resolve_in_legacy(template, page, name) {
        return Some(found);
    }
    tracing::warn!("[resolver] {}/{} not found in structure or ocrMapping", page, name);
    None
}

/// Which child list a step descends into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildList {
    Subfields,
    Options,
}

/// Location of a structure entry: section, top-level index, then child steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPath {
    pub section: String,
    pub index: usize,
    pub children: Vec<(ChildList, usize)>,
}

/// Breadth-first search over the nested structure only.
pub fn resolve_in_structure<'a>(
    template: &'a Template,
    page: Page,
    name: &str,
) -> Option<ResolvedField<'a>> {
    let path = locate(template, page, name)?;
    let spec = match entry_at(template, page, &path)? {
        FieldEntry::Spec(spec) => with_name(spec, name),
        FieldEntry::Name(_) => Cow::Owned(FieldSpec::named(name)),
    };
    Some(ResolvedField {
        page,
        spec,
        source: FieldSource::Structure {
            depth: path.children.len(),
            section: path.section,
        },
    })
}

/// Find where `name` lives in the structure.
///
/// Level 0 is every section's top-level entries in declaration order; each
/// next level is the subfields then options of the previous level's objects.
/// Within a level, object entries win over bare names.
pub fn locate(template: &Template, page: Page, name: &str) -> Option<EntryPath> {
    let structure = template.structure.page(page)?;
    let mut level: Vec<(EntryPath, &FieldEntry)> = Vec::new();
    for (section, body) in structure.sections.iter() {
        for (index, entry) in body.fields.iter().enumerate() {
            let path = EntryPath {
                section: section.to_string(),
                index,
                children: Vec::new(),
            };
            level.push((path, entry));
        }
    }

    while !level.is_empty() {
        let object_hit = level.iter().position(|(_, entry)| {
            matches!(entry, FieldEntry::Spec(spec) if spec.key() == Some(name))
        });
        let hit = object_hit.or_else(|| {
            level
                .iter()
                .position(|(_, entry)| matches!(entry, FieldEntry::Name(bare) if bare == name))
        });
        if let Some(at) = hit {
            return Some(level.swap_remove(at).0);
        }

        let mut next = Vec::new();
        for &(ref path, entry) in &level {
            let FieldEntry::Spec(spec) = entry else {
                continue;
            };
            for (list, children) in [
                (ChildList::Subfields, &spec.subfields),
                (ChildList::Options, &spec.options),
            ] {
                for (i, child) in children.iter().flatten().enumerate() {
                    let mut child_path = path.clone();
                    child_path.children.push((list, i));
                    next.push((child_path, child));
                }
            }
        }
        level = next;
    }
    None
}

pub fn entry_at<'a>(template: &'a Template, page: Page, path: &EntryPath) -> Option<&'a FieldEntry> {
    let section = template.structure.page(page)?.sections.get(&path.section)?;
    let mut entry = section.fields.get(path.index)?;
    for (list, i) in &path.children {
        let FieldEntry::Spec(spec) = entry else {
            return None;
        };
        let children = match list {
            ChildList::Subfields => spec.subfields.as_ref()?,
            ChildList::Options => spec.options.as_ref()?,
        };
        entry = children.get(*i)?;
    }
    Some(entry)
}

pub fn entry_at_mut<'a>(
    template: &'a mut Template,
    page: Page,
    path: &EntryPath,
) -> Option<&'a mut FieldEntry> {
    let section = template
        .structure
        .page_mut(page)?
        .sections
        .get_mut(&path.section)?;
    let mut entry = section.fields.get_mut(path.index)?;
    for (list, i) in &path.children {
        let FieldEntry::Spec(spec) = entry else {
            return None;
        };
        let children = match list {
            ChildList::Subfields => spec.subfields.as_mut()?,
            ChildList::Options => spec.options.as_mut()?,
        };
        entry = children.get_mut(*i)?;
    }
    Some(entry)
}

pub fn resolve_in_legacy<'a>(
    template: &'a Template,
    page: Page,
    name: &str,
) -> Option<ResolvedField<'a>> {
    let spec = template.legacy_fields(page)?.get(name)?;
    Some(ResolvedField {
        page,
        spec: with_name(spec, name),
        source: FieldSource::Legacy,
    })
}

/// Structure lookup with blanks filled from the legacy entry of the same name.
///
/// Structure values still win; this only lets a bare or partial structure
/// entry borrow coordinates during the migration window.
pub fn resolve_effective<'a>(
    template: &'a Template,
    page: Page,
    name: &str,
) -> Option<ResolvedField<'a>> {
    let mut found = resolve(template, page, name)?;
    if found.from_structure() {
        if let Some(legacy) = template.legacy_fields(page).and_then(|f| f.get(name)) {
            let mut merged = found.spec.clone().into_owned();
            if merged.fill_from(legacy) {
                found.spec = Cow::Owned(merged);
            }
        }
    }
    Some(found)
}

/// Effective resolution of every named field on a page, in `Template::field_names` order.
pub fn resolve_page(template: &Template, page: Page) -> Vec<ResolvedField<'_>> {
    template
        .field_names(page)
        .iter()
        .filter_map(|name| resolve_effective(template, page, name))
        .collect()
}

fn with_name<'a>(spec: &'a FieldSpec, name: &str) -> Cow<'a, FieldSpec> {
    if spec.name == name {
        Cow::Borrowed(spec)
    } else {
        let mut owned = spec.clone();
        owned.name = name.to_string();
        Cow::Owned(owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template(structure: serde_json::Value, legacy: serde_json::Value) -> Template {
        Template::from_value(json!({ "ocrMapping": legacy, "structure": structure })).unwrap()
    }

    #[test]
    fn structure_region_beats_legacy() {
        let t = template(
            json!({ "front": { "sections": { "a": { "fields": [
                { "name": "age", "region": { "x": 0.5, "y": 0.5, "width": 0.1, "height": 0.1 } }
            ]}}}}),
            json!({ "front": { "fields": {
                "age": { "region": { "x": 0.1, "y": 0.1, "width": 0.1, "height": 0.1 } }
            }}}),
        );
        let found = resolve(&t, Page::Front, "age").unwrap();
        assert_eq!(found.region().unwrap().x, 0.5);
        assert!(found.from_structure());
    }

    #[test]
    fn top_level_of_later_section_beats_nested_in_earlier() {
        let t = template(
            json!({ "front": { "sections": {
                "first": { "fields": [
                    { "name": "parent", "subfields": [ { "name": "target", "label": "nested" } ] }
                ]},
                "second": { "fields": [ { "name": "target", "label": "top" } ] }
            }}}),
            json!({}),
        );
        let found = resolve(&t, Page::Front, "target").unwrap();
        assert_eq!(found.spec.label.as_deref(), Some("top"));
        assert_eq!(
            found.source,
            FieldSource::Structure {
                section: "second".to_string(),
                depth: 0
            }
        );
    }

    #[test]
    fn object_beats_bare_name_at_same_depth() {
        let t = template(
            json!({ "front": { "sections": {
                "first": { "fields": [ "sex" ] },
                "second": { "fields": [ { "name": "sex", "label": "Sex" } ] }
            }}}),
            json!({}),
        );
        let found = resolve(&t, Page::Front, "sex").unwrap();
        assert_eq!(found.spec.label.as_deref(), Some("Sex"));
    }

    #[test]
    fn subfields_searched_before_options_and_value_keys_match() {
        let t = template(
            json!({ "back": { "sections": { "risk": { "fields": [
                { "name": "exposure", "options": [ { "value": "needle", "label": "opt" } ] }
            ]}}}}),
            json!({}),
        );
        let found = resolve(&t, Page::Back, "needle").unwrap();
        assert_eq!(found.name(), "needle");
        assert_eq!(
            found.source,
            FieldSource::Structure {
                section: "risk".to_string(),
                depth: 1
            }
        );
    }

    #[test]
    fn legacy_fallback_and_miss() {
        let t = template(
            json!({}),
            json!({ "front": { "fields": { "testDate": { "label": "Test Date" } } } }),
        );
        let found = resolve(&t, Page::Front, "testDate").unwrap();
        assert_eq!(found.source, FieldSource::Legacy);
        assert_eq!(found.name(), "testDate");
        assert!(resolve(&t, Page::Back, "testDate").is_none());
        assert!(resolve(&t, Page::Front, "nope").is_none());
    }

    #[test]
    fn effective_lookup_borrows_legacy_coordinates_only_when_blank() {
        let t = template(
            json!({ "front": { "sections": { "a": { "fields": [
                "firstName",
                { "name": "age", "region": { "x": 0.5, "y": 0.5, "width": 0.1, "height": 0.1 } }
            ]}}}}),
            json!({ "front": { "fields": {
                "firstName": { "label": "First Name", "region": { "x": 0.1, "y": 0.2, "width": 0.3, "height": 0.02 } },
                "age": { "label": "Age", "region": { "x": 0.1, "y": 0.1, "width": 0.1, "height": 0.1 } }
            }}}),
        );
        assert!(resolve(&t, Page::Front, "firstName").unwrap().region().is_none());
        let first = resolve_effective(&t, Page::Front, "firstName").unwrap();
        assert_eq!(first.region().unwrap().x, 0.1);
        let age = resolve_effective(&t, Page::Front, "age").unwrap();
        assert_eq!(age.region().unwrap().x, 0.5);
        assert_eq!(age.spec.label.as_deref(), Some("Age"));
    }

    #[test]
    fn pages_are_separate_namespaces() {
        let t = template(
            json!({
                "front": { "sections": { "a": { "fields": [ { "name": "date", "label": "front" } ] } } },
                "back": { "sections": { "b": { "fields": [ { "name": "date", "label": "back" } ] } } }
            }),
            json!({}),
        );
        assert_eq!(
            resolve(&t, Page::Back, "date").unwrap().spec.label.as_deref(),
            Some("back")
        );
    }
}
