use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::{Page, Region};

/// Positioned text line or word from the OCR collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrToken {
    pub text: String,
    pub bounding_box: Region,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Answer to a query-style prompt, keyed by the query text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryAnswer {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<Region>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyValuePair {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_box: Option<Region>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_box: Option<Region>,
    #[serde(default)]
    pub confidence: f64,
}

/// Detected checkbox / selection element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionMark {
    pub bounding_box: Region,
    pub selected: bool,
    #[serde(default)]
    pub confidence: f64,
}

/// Everything the OCR collaborator reports for one page side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrPageResult {
    #[serde(default)]
    pub tokens: Vec<OcrToken>,
    #[serde(default)]
    pub queries: Vec<QueryAnswer>,
    #[serde(default)]
    pub key_values: Vec<KeyValuePair>,
    #[serde(default)]
    pub selection_marks: Vec<SelectionMark>,
}

/// Strategy that actually produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MethodUsed {
    Query,
    FormField,
    Coordinate,
    CheckboxDetection,
    TextAfterCheckbox,
    Failed,
}

impl MethodUsed {
    pub fn as_str(&self) -> &'static str {
        match self {
            MethodUsed::Query => "query",
            MethodUsed::FormField => "form-field",
            MethodUsed::Coordinate => "coordinate",
            MethodUsed::CheckboxDetection => "checkbox-detection",
            MethodUsed::TextAfterCheckbox => "text-after-checkbox",
            MethodUsed::Failed => "failed",
        }
    }
}

/// Extracted value: free text, a checkbox state, or the selected option names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Checked(bool),
    Selected(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    pub field_name: String,
    pub value: Option<FieldValue>,
    pub method: MethodUsed,
    /// 0.0 ..= 1.0
    pub confidence: f64,
    pub requires_review: bool,
    pub fallback_used: bool,
}

/// Per-document data-quality summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionStats {
    pub total: usize,
    pub by_method: BTreeMap<String, usize>,
    pub failed: usize,
    pub fallback: usize,
    pub requires_review: usize,
    pub required_failures: Vec<String>,
    pub overall_confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageExtraction {
    pub page: Page,
    pub results: Vec<ExtractionResult>,
    pub stats: ExtractionStats,
}

/// OCR output for both sides of a form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OcrDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub front: Option<OcrPageResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub back: Option<OcrPageResult>,
}

impl OcrDocument {
    /// First page is the front, second the back.
    pub fn from_pages(pages: Vec<OcrPageResult>) -> Self {
        let mut pages = pages.into_iter();
        OcrDocument {
            front: pages.next(),
            back: pages.next(),
        }
    }

    pub fn page(&self, page: Page) -> Option<&OcrPageResult> {
        match page {
            Page::Front => self.front.as_ref(),
            Page::Back => self.back.as_ref(),
        }
    }

    pub fn pages(&self) -> impl Iterator<Item = (Page, &OcrPageResult)> {
        Page::ALL
            .into_iter()
            .filter_map(move |p| self.page(p).map(|r| (p, r)))
    }
}
