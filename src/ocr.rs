use reqwest::blocking::Client;
use serde_json::Value;
use std::fs;
use std::path::Path;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::models::Region;
use crate::types::{KeyValuePair, OcrDocument, OcrPageResult, OcrToken, QueryAnswer, SelectionMark};

const API_VERSION: &str = "2024-11-30";
const POLL_INTERVAL_SECS: u64 = 2;
const MAX_POLLS: usize = 60;

/// Send a scanned form to Azure prebuilt-layout and return the raw `analyzeResult`.
/// `queries` become query fields so answers come back under the same ids.
pub fn analyze_document(path: &Path, key: &str, endpoint: &str, queries: &[String]) -> Result<Value> {
    let endpoint = endpoint.trim_end_matches('/');
    let url = format!(
        "{}/documentintelligence/documentModels/prebuilt-layout:analyze",
        endpoint
    );

    let bytes = fs::read(path).map_err(|e| Error::io(path, e))?;

    let client = Client::builder()
        .timeout(std::time::Duration::from_secs(120))
        .build()
        .map_err(|e| Error::Ocr(e.to_string()))?;

    let mut params: Vec<(&str, String)> = vec![("api-version", API_VERSION.to_string())];
    if queries.is_empty() {
        params.push(("features", "keyValuePairs".to_string()));
    } else {
        params.push(("features", "keyValuePairs,queryFields".to_string()));
        params.push(("queryFields", queries.join(",")));
    }

    let response = client
        .post(&url)
        .query(&params)
        .header("Ocp-Apim-Subscription-Key", key)
        .header("Content-Type", "application/octet-stream")
        .body(bytes)
        .send()
        .map_err(|e| {
            Error::Ocr(
                if e.is_connect() || e.is_timeout() {
                    "Check your internet connection and try again."
                } else {
                    "Network error."
                }
                .to_string(),
            )
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(Error::Ocr(format!(
            "analyze failed ({}): {}",
            status,
            if body.is_empty() {
                "Invalid key or endpoint?"
            } else {
                body.as_str()
            }
        )));
    }

    let result_url = response
        .headers()
        .get("Operation-Location")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::Ocr("No Operation-Location in response".to_string()))?
        .to_string();

    tracing::info!("[ocr] submitted {}, polling for result", path.display());
    for _ in 0..MAX_POLLS {
        std::thread::sleep(std::time::Duration::from_secs(POLL_INTERVAL_SECS));
        let poll_json: Value = client
            .get(&result_url)
            .header("Ocp-Apim-Subscription-Key", key)
            .send()
            .map_err(|e| Error::Ocr(e.to_string()))?
            .json()
            .map_err(|e| Error::Ocr(format!("Invalid JSON: {}", e)))?;
        let status_str = poll_json.get("status").and_then(|s| s.as_str()).unwrap_or("");
        if status_str == "succeeded" {
            return poll_json
                .get("analyzeResult")
                .cloned()
                .ok_or_else(|| Error::Ocr("No analyzeResult".to_string()));
        }
        if status_str == "failed" {
            let err = poll_json
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("Unknown error");
            return Err(Error::Ocr(format!("analysis failed: {}", err)));
        }
    }
    Err(Error::Ocr("timed out waiting for analysis".to_string()))
}

/// Normalize an Azure layout result into per-page tokens, key/value pairs,
/// selection marks and query answers in the [0,1] coordinate space.
pub fn parse_analyze_result(result: &Value) -> Vec<OcrPageResult> {
    let empty: Vec<Value> = vec![];
    let pages = result.get("pages").and_then(|p| p.as_array()).unwrap_or(&empty);

    let mut sizes: Vec<(u64, f64, f64)> = Vec::new();
    let mut out: Vec<OcrPageResult> = Vec::new();
    for (i, page) in pages.iter().enumerate() {
        let number = page
            .get("pageNumber")
            .and_then(|n| n.as_u64())
            .unwrap_or(i as u64 + 1);
        let width = page.get("width").and_then(|w| w.as_f64()).unwrap_or(1.0);
        let height = page.get("height").and_then(|h| h.as_f64()).unwrap_or(1.0);
        sizes.push((number, width, height));

        let words: Vec<OcrToken> = page
            .get("words")
            .and_then(|w| w.as_array())
            .unwrap_or(&empty)
            .iter()
            .filter_map(|w| token(w, width, height))
            .collect();
        let tokens = page
            .get("lines")
            .and_then(|l| l.as_array())
            .unwrap_or(&empty)
            .iter()
            .filter_map(|l| token(l, width, height))
            .map(|mut line| {
                if line.confidence.is_none() {
                    line.confidence = mean_word_confidence(&line.bounding_box, &words);
                }
                line
            })
            .collect();
        let selection_marks = page
            .get("selectionMarks")
            .and_then(|s| s.as_array())
            .unwrap_or(&empty)
            .iter()
            .filter_map(|m| {
                let bounding_box = polygon_region(m.get("polygon")?, width, height)?;
                Some(SelectionMark {
                    bounding_box,
                    selected: m.get("state").and_then(|s| s.as_str()) == Some("selected"),
                    confidence: m.get("confidence").and_then(|c| c.as_f64()).unwrap_or(0.0),
                })
            })
            .collect();

        out.push(OcrPageResult {
            tokens,
            selection_marks,
            ..Default::default()
        });
    }

    let page_index = |regions: Option<&Value>| -> Option<(usize, Region)> {
        let first = regions?.as_array()?.first()?;
        let number = first.get("pageNumber").and_then(|n| n.as_u64()).unwrap_or(1);
        let idx = sizes.iter().position(|(n, _, _)| *n == number)?;
        let (_, w, h) = sizes[idx];
        Some((idx, polygon_region(first.get("polygon")?, w, h)?))
    };

    for pair in result
        .get("keyValuePairs")
        .and_then(|k| k.as_array())
        .unwrap_or(&empty)
    {
        let Some(key) = pair.get("key") else {
            continue;
        };
        let key_text = get_trimmed(key, "content").unwrap_or_default();
        if key_text.is_empty() {
            continue;
        }
        let value = pair.get("value");
        let key_loc = page_index(key.get("boundingRegions"));
        let value_loc = value.and_then(|v| page_index(v.get("boundingRegions")));
        let Some(idx) = key_loc.map(|(i, _)| i).or(value_loc.map(|(i, _)| i)) else {
            continue;
        };
        out[idx].key_values.push(KeyValuePair {
            key: key_text,
            value: value.and_then(|v| get_trimmed(v, "content")).unwrap_or_default(),
            key_box: key_loc.map(|(_, r)| r),
            value_box: value_loc.map(|(_, r)| r),
            confidence: pair.get("confidence").and_then(|c| c.as_f64()).unwrap_or(0.0),
        });
    }

    for doc in result
        .get("documents")
        .and_then(|d| d.as_array())
        .unwrap_or(&empty)
    {
        let Some(fields) = doc.get("fields").and_then(|f| f.as_object()) else {
            continue;
        };
        for (id, field) in fields {
            let text = field_text(field);
            if text.is_empty() {
                continue;
            }
            let loc = page_index(field.get("boundingRegions"));
            let idx = loc.map(|(i, _)| i).unwrap_or(0);
            if let Some(page) = out.get_mut(idx) {
                page.queries.push(QueryAnswer {
                    id: id.clone(),
                    text,
                    confidence: field.get("confidence").and_then(|c| c.as_f64()).unwrap_or(0.0),
                    bounding_box: loc.map(|(_, r)| r),
                });
            }
        }
    }

    out
}

/// OCR input for a command: our own JSON (one page, an array of pages or `{front, back}`),
/// a saved Azure response, or a scan that is sent to Azure live.
pub fn load_ocr_input(path: &Path, settings: &Settings, queries: &[String]) -> Result<OcrDocument> {
    let is_json = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if !is_json {
        let (key, endpoint) = settings.azure()?;
        let result = analyze_document(path, key, endpoint, queries)?;
        return Ok(OcrDocument::from_pages(parse_analyze_result(&result)));
    }

    let raw = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let value: Value = serde_json::from_str(&raw).map_err(|e| Error::json(path, e))?;
    document_from_json(value).map_err(|e| Error::json(path, e))
}

fn document_from_json(value: Value) -> serde_json::Result<OcrDocument> {
    if let Some(result) = value.get("analyzeResult") {
        return Ok(OcrDocument::from_pages(parse_analyze_result(result)));
    }
    if value.get("pages").is_some() && value.get("tokens").is_none() {
        return Ok(OcrDocument::from_pages(parse_analyze_result(&value)));
    }
    if value.is_array() {
        return Ok(OcrDocument::from_pages(serde_json::from_value(value)?));
    }
    if value.get("front").is_some() || value.get("back").is_some() {
        return serde_json::from_value(value);
    }
    Ok(OcrDocument {
        front: Some(serde_json::from_value(value)?),
        back: None,
    })
}

fn token(item: &Value, width: f64, height: f64) -> Option<OcrToken> {
    let text = get_trimmed(item, "content")?;
    Some(OcrToken {
        text,
        bounding_box: polygon_region(item.get("polygon")?, width, height)?,
        confidence: item.get("confidence").and_then(|c| c.as_f64()),
    })
}

/// Azure polygons are flat `[x1, y1, x2, y2, ...]` in page units.
fn polygon_region(polygon: &Value, width: f64, height: f64) -> Option<Region> {
    let coords: Vec<f64> = polygon.as_array()?.iter().filter_map(|v| v.as_f64()).collect();
    if coords.len() < 4 || width <= 0.0 || height <= 0.0 {
        return None;
    }
    let scaled: Vec<f64> = coords
        .chunks_exact(2)
        .flat_map(|c| [c[0] / width, c[1] / height])
        .collect();
    Region::from_polygon(&scaled)
}

fn mean_word_confidence(line: &Region, words: &[OcrToken]) -> Option<f64> {
    let inside: Vec<f64> = words
        .iter()
        .filter(|w| line.contains(&w.bounding_box.center()))
        .filter_map(|w| w.confidence)
        .collect();
    if inside.is_empty() {
        None
    } else {
        Some(inside.iter().sum::<f64>() / inside.len() as f64)
    }
}

fn get_trimmed(obj: &Value, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Prefer typed `value*` properties over raw content.
fn field_text(obj: &Value) -> String {
    get_trimmed(obj, "valueString")
        .or_else(|| {
            obj.get("valueNumber")
                .and_then(|v| v.as_f64())
                .map(|n| n.to_string())
        })
        .or_else(|| get_trimmed(obj, "valueDate"))
        .or_else(|| get_trimmed(obj, "content"))
        .unwrap_or_default()
}
