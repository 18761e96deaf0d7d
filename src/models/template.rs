//! HTS form template: the legacy flat `ocrMapping` and the nested `structure`
//! living side by side in one JSON document.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use super::geometry::Region;
use super::named_list::NamedList;
use crate::error::{Error, Result};

/// `mappingFormat` written by the migration.
pub const HYBRID_FORMAT: &str = "hybrid-v1";

/// Catch-all section receiving legacy fields that have no structural home.
pub const MIGRATED_SECTION: &str = "migratedFlatFields";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Page {
    Front,
    Back,
}

impl Page {
    pub const ALL: [Page; 2] = [Page::Front, Page::Back];

    pub fn as_str(&self) -> &'static str {
        match self {
            Page::Front => "front",
            Page::Back => "back",
        }
    }
}

impl fmt::Display for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Page {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "front" => Ok(Page::Front),
            "back" => Ok(Page::Back),
            other => Err(format!("unknown page '{}', expected front or back", other)),
        }
    }
}

/// Field `type`. Unknown strings are kept so the document round-trips.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FieldKind {
    Text,
    Checkbox,
    CheckboxGroup,
    Composite,
    Conditional,
    Other(String),
}

impl From<String> for FieldKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "text" => FieldKind::Text,
            "checkbox" => FieldKind::Checkbox,
            "checkbox-group" => FieldKind::CheckboxGroup,
            "composite" => FieldKind::Composite,
            "conditional" => FieldKind::Conditional,
            _ => FieldKind::Other(s),
        }
    }
}

impl From<FieldKind> for String {
    fn from(kind: FieldKind) -> Self {
        match kind {
            FieldKind::Text => "text".to_string(),
            FieldKind::Checkbox => "checkbox".to_string(),
            FieldKind::CheckboxGroup => "checkbox-group".to_string(),
            FieldKind::Composite => "composite".to_string(),
            FieldKind::Conditional => "conditional".to_string(),
            FieldKind::Other(s) => s,
        }
    }
}

/// Declared `extractionMethod`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ExtractionMethod {
    Query,
    FormField,
    CheckboxDetection,
    TextAfterCheckbox,
    Coordinate,
    Other(String),
}

impl From<String> for ExtractionMethod {
    fn from(s: String) -> Self {
        match s.as_str() {
            "query" => ExtractionMethod::Query,
            "form-field" => ExtractionMethod::FormField,
            "checkbox-detection" => ExtractionMethod::CheckboxDetection,
            "text-after-checkbox" => ExtractionMethod::TextAfterCheckbox,
            "coordinate" => ExtractionMethod::Coordinate,
            _ => ExtractionMethod::Other(s),
        }
    }
}

impl From<ExtractionMethod> for String {
    fn from(method: ExtractionMethod) -> Self {
        match method {
            ExtractionMethod::Query => "query".to_string(),
            ExtractionMethod::FormField => "form-field".to_string(),
            ExtractionMethod::CheckboxDetection => "checkbox-detection".to_string(),
            ExtractionMethod::TextAfterCheckbox => "text-after-checkbox".to_string(),
            ExtractionMethod::Coordinate => "coordinate".to_string(),
            ExtractionMethod::Other(s) => s,
        }
    }
}

/// One logical field. Legacy entries leave `name` empty; their map key is the name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Option objects sometimes identify themselves by `value` instead of `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub field_type: Option<FieldKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<Region>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_method: Option<ExtractionMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<FieldEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subfields: Option<Vec<FieldEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nearby_label: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_values: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditional_on: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FieldSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Identity used for lookups: `name`, or a string `value` for option objects.
    pub fn key(&self) -> Option<&str> {
        if !self.name.trim().is_empty() {
            return Some(self.name.as_str());
        }
        self.value
            .as_ref()
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Region used for geometry: the absolute OCR box when present, else the template region.
    pub fn effective_region(&self) -> Option<Region> {
        self.bounding_box.or(self.region)
    }

    pub fn is_required(&self) -> bool {
        self.required.unwrap_or(false)
    }

    pub fn label_text(&self) -> &str {
        self.label.as_deref().unwrap_or("")
    }

    /// `nearbyLabel` is either a plain string or an object with a `text` key.
    pub fn nearby_label_text(&self) -> Option<&str> {
        match self.nearby_label.as_ref()? {
            Value::String(s) => Some(s.as_str()),
            Value::Object(obj) => obj.get("text").and_then(|t| t.as_str()),
            _ => None,
        }
        .filter(|s| !s.trim().is_empty())
    }

    /// Declared method, or the one implied by the field's shape.
    pub fn declared_method(&self) -> ExtractionMethod {
        if let Some(method) = &self.extraction_method {
            return method.clone();
        }
        if self.query.as_deref().map(|q| !q.trim().is_empty()).unwrap_or(false) {
            return ExtractionMethod::Query;
        }
        match self.field_type {
            Some(FieldKind::Checkbox) | Some(FieldKind::CheckboxGroup) => {
                ExtractionMethod::CheckboxDetection
            }
            _ if self.effective_region().is_some() => ExtractionMethod::Coordinate,
            _ => ExtractionMethod::FormField,
        }
    }

    /// Whether any extraction strategy has something to work with.
    pub fn is_extractable(&self) -> bool {
        self.effective_region().is_some()
            || self.query.as_deref().map(|q| !q.trim().is_empty()).unwrap_or(false)
            || (self.declared_method() == ExtractionMethod::FormField
                && !self.label_text().trim().is_empty())
            || (self.is_checkbox()
                && self
                    .options
                    .iter()
                    .flatten()
                    .filter_map(FieldEntry::as_spec)
                    .any(|option| option.effective_region().is_some()))
    }

    pub fn is_checkbox(&self) -> bool {
        matches!(
            self.field_type,
            Some(FieldKind::Checkbox) | Some(FieldKind::CheckboxGroup)
        ) || self.declared_method() == ExtractionMethod::CheckboxDetection
    }

    /// Fill-if-empty merge: copy each mergeable attribute from `src` only where
    /// `self` has none (missing, null or blank string). Returns whether anything changed.
    pub fn fill_from(&mut self, src: &FieldSpec) -> bool {
        let mut changed = false;
        changed |= fill(&mut self.region, &src.region, |_| false);
        changed |= fill(&mut self.bounding_box, &src.bounding_box, |_| false);
        changed |= fill(&mut self.label, &src.label, |s| s.trim().is_empty());
        changed |= fill(&mut self.field_type, &src.field_type, |k| {
            matches!(k, FieldKind::Other(s) if s.trim().is_empty())
        });
        changed |= fill(&mut self.required, &src.required, |_| false);
        changed |= fill(&mut self.priority, &src.priority, blank_value);
        changed |= fill(&mut self.extraction_method, &src.extraction_method, |m| {
            matches!(m, ExtractionMethod::Other(s) if s.trim().is_empty())
        });
        changed |= fill(&mut self.query, &src.query, |s| s.trim().is_empty());
        changed |= fill(&mut self.pattern, &src.pattern, |s| s.trim().is_empty());
        let clash = src.options.as_deref().and_then(|o| self.subfield_clash(o));
        if clash.is_none() {
            changed |= fill(&mut self.options, &src.options, |_| false);
        }
        changed |= fill(&mut self.nearby_label, &src.nearby_label, blank_value);
        changed |= fill(&mut self.format, &src.format, blank_value);
        changed |= fill(&mut self.expected_values, &src.expected_values, blank_value);
        changed |= fill(&mut self.condition, &src.condition, blank_value);
        changed |= fill(&mut self.conditional_on, &src.conditional_on, blank_value);
        changed
    }

    /// First name in `options` already declared among this field's subfields.
    pub fn subfield_clash<'a>(&self, options: &'a [FieldEntry]) -> Option<&'a str> {
        let subfields = self.subfields.as_deref()?;
        let names: HashSet<&str> = subfields.iter().filter_map(FieldEntry::key).collect();
        options
            .iter()
            .filter_map(FieldEntry::key)
            .find(|name| names.contains(name))
    }

    /// Children in resolution order: subfields first, then options.
    pub fn children(&self) -> impl Iterator<Item = &FieldEntry> {
        self.subfields
            .iter()
            .flatten()
            .chain(self.options.iter().flatten())
    }
}

fn fill<T: Clone>(dest: &mut Option<T>, src: &Option<T>, is_blank: impl Fn(&T) -> bool) -> bool {
    let dest_empty = dest.as_ref().map(&is_blank).unwrap_or(true);
    match src {
        Some(value) if dest_empty && !is_blank(value) => {
            *dest = Some(value.clone());
            true
        }
        _ => false,
    }
}

fn blank_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// A structure entry: a bare field name or a full field object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldEntry {
    Name(String),
    Spec(Box<FieldSpec>),
}

impl FieldEntry {
    pub fn key(&self) -> Option<&str> {
        match self {
            FieldEntry::Name(name) => Some(name.as_str()).filter(|n| !n.trim().is_empty()),
            FieldEntry::Spec(spec) => spec.key(),
        }
    }

    pub fn as_spec(&self) -> Option<&FieldSpec> {
        match self {
            FieldEntry::Spec(spec) => Some(spec),
            FieldEntry::Name(_) => None,
        }
    }

    /// Owned spec view; a bare name becomes a spec carrying only the name.
    pub fn to_spec(&self) -> FieldSpec {
        match self {
            FieldEntry::Name(name) => FieldSpec::named(name.clone()),
            FieldEntry::Spec(spec) => (**spec).clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Section {
    #[serde(default)]
    pub fields: Vec<FieldEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructurePage {
    #[serde(default)]
    pub sections: NamedList<Section>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Structure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub front: Option<StructurePage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub back: Option<StructurePage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Structure {
    pub fn page(&self, page: Page) -> Option<&StructurePage> {
        match page {
            Page::Front => self.front.as_ref(),
            Page::Back => self.back.as_ref(),
        }
    }

    pub fn page_mut(&mut self, page: Page) -> Option<&mut StructurePage> {
        match page {
            Page::Front => self.front.as_mut(),
            Page::Back => self.back.as_mut(),
        }
    }

    pub fn page_or_insert(&mut self, page: Page) -> &mut StructurePage {
        match page {
            Page::Front => self.front.get_or_insert_with(StructurePage::default),
            Page::Back => self.back.get_or_insert_with(StructurePage::default),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LegacyPage {
    #[serde(default)]
    pub fields: NamedList<FieldSpec>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The flat, pre-migration `ocrMapping`. Deprecated after migration, never removed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyMapping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub front: Option<LegacyPage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub back: Option<LegacyPage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecation_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecation_date: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LegacyMapping {
    pub fn page(&self, page: Page) -> Option<&LegacyPage> {
        match page {
            Page::Front => self.front.as_ref(),
            Page::Back => self.back.as_ref(),
        }
    }

    pub fn page_mut(&mut self, page: Page) -> Option<&mut LegacyPage> {
        match page {
            Page::Front => self.front.as_mut(),
            Page::Back => self.back.as_mut(),
        }
    }

    pub fn is_deprecated(&self) -> bool {
        self.deprecated.unwrap_or(false)
    }
}

/// Root of the template document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub ocr_mapping: LegacyMapping,
    pub structure: Structure,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_date: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Reference to a field for reports: page, optional section, name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldRef {
    pub page: Page,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    pub name: String,
}

impl FieldRef {
    pub fn new(page: Page, name: impl Into<String>) -> Self {
        Self {
            page,
            section: None,
            name: name.into(),
        }
    }

    pub fn in_section(page: Page, section: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            page,
            section: Some(section.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.page, self.name)
    }
}

impl Template {
    /// Parse and validate a template document.
    pub fn from_value(value: Value) -> Result<Self> {
        let root = value
            .as_object()
            .ok_or_else(|| Error::MalformedTemplate("root is not a JSON object".to_string()))?;
        for key in ["structure", "ocrMapping"] {
            match root.get(key) {
                Some(Value::Object(_)) => {}
                Some(_) => {
                    return Err(Error::MalformedTemplate(format!(
                        "'{}' is not an object",
                        key
                    )))
                }
                None => {
                    return Err(Error::MalformedTemplate(format!(
                        "missing '{}' root key",
                        key
                    )))
                }
            }
        }
        let template: Template = serde_json::from_value(value)
            .map_err(|e| Error::MalformedTemplate(e.to_string()))?;
        template.validate()?;
        Ok(template)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| Error::MalformedTemplate(e.to_string()))?;
        Self::from_value(value)
    }

    /// Load-time authoring checks.
    pub fn validate(&self) -> Result<()> {
        for page in Page::ALL {
            if let Some(structure) = self.structure.page(page) {
                for (_, section) in structure.sections.iter() {
                    validate_entries(page, &section.fields)?;
                }
            }
            if let Some(legacy) = self.ocr_mapping.page(page) {
                for (name, spec) in legacy.fields.iter() {
                    if name.trim().is_empty() {
                        return Err(Error::MalformedTemplate(format!(
                            "blank field name in ocrMapping.{}",
                            page
                        )));
                    }
                    validate_spec(page, name, spec)?;
                }
            }
        }
        Ok(())
    }

    pub fn is_migrated(&self) -> bool {
        self.mapping_format.as_deref() == Some(HYBRID_FORMAT)
    }

    pub fn legacy_fields(&self, page: Page) -> Option<&NamedList<FieldSpec>> {
        self.ocr_mapping.page(page).map(|p| &p.fields)
    }

    /// Every named field on a page: structure entries depth-first in
    /// declaration order, then legacy-only names. No duplicates.
    pub fn field_names(&self, page: Page) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut names = Vec::new();
        if let Some(structure) = self.structure.page(page) {
            for (_, section) in structure.sections.iter() {
                collect_names(&section.fields, &mut seen, &mut names);
            }
        }
        if let Some(legacy) = self.legacy_fields(page) {
            for name in legacy.keys() {
                if seen.insert(name.to_string()) {
                    names.push(name.to_string());
                }
            }
        }
        names
    }
}

fn collect_names(entries: &[FieldEntry], seen: &mut HashSet<String>, names: &mut Vec<String>) {
    for entry in entries {
        if let Some(key) = entry.key() {
            if seen.insert(key.to_string()) {
                names.push(key.to_string());
            }
        }
        if let FieldEntry::Spec(spec) = entry {
            if let Some(subfields) = &spec.subfields {
                collect_names(subfields, seen, names);
            }
            if let Some(options) = &spec.options {
                collect_names(options, seen, names);
            }
        }
    }
}

fn check_region(name: &str, spec: &FieldSpec) -> Result<()> {
    for region in [spec.region, spec.bounding_box].into_iter().flatten() {
        if !region.is_valid() {
            return Err(Error::MalformedTemplate(format!(
                "field '{}' has a region with negative size",
                name
            )));
        }
    }
    Ok(())
}

fn validate_entries(page: Page, entries: &[FieldEntry]) -> Result<()> {
    for entry in entries {
        if let FieldEntry::Spec(spec) = entry {
            validate_spec(page, spec.key().unwrap_or("<unnamed>"), spec)?;
        }
    }
    Ok(())
}

fn validate_spec(page: Page, parent: &str, spec: &FieldSpec) -> Result<()> {
    check_region(parent, spec)?;
    if let Some(clash) = spec.options.as_deref().and_then(|o| spec.subfield_clash(o)) {
        return Err(Error::AmbiguousChild {
            page,
            parent: parent.to_string(),
            name: clash.to_string(),
        });
    }
    if let Some(subfields) = &spec.subfields {
        validate_entries(page, subfields)?;
    }
    if let Some(options) = &spec.options {
        validate_entries(page, options)?;
    }
    Ok(())
}
