//! Calibration review workbook: export proposals, read back the reviewer's approvals.

use calamine::{open_workbook_auto, DataType, Reader};
use rust_xlsxwriter::{Format, FormatAlign, Workbook, Worksheet, XlsxError};
use std::path::Path;

use crate::error::{Error, Result};
use crate::services::calibration::{CalibrationObservation, CalibrationReport, SIGNIFICANT_DRIFT};

const SHEET_NAME: &str = "Calibration";

const HEADERS: &[&str] = &[
    "Approve",
    "Id",
    "Page",
    "Field",
    "Label",
    "Method",
    "Matched text",
    "Distance",
    "Confidence",
    "Old x",
    "Old y",
    "New x",
    "New y",
    "Width",
    "Height",
];

const COLUMN_WIDTHS: &[f64] = &[
    10.0, 28.0, 8.0, 24.0, 28.0, 14.0, 32.0, 10.0, 12.0, 9.0, 9.0, 9.0, 9.0, 9.0, 9.0,
];

fn xlsx_err(e: XlsxError) -> Error {
    Error::Spreadsheet(e.to_string())
}

/// One row per observation. Rows at or above `prefill` confidence get "yes" in the Approve column.
pub fn export_calibration_report(report: &CalibrationReport, path: &Path, prefill: Option<f64>) -> Result<()> {
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name(SHEET_NAME).map_err(xlsx_err)?;

    let header_format = Format::new()
        .set_bold()
        .set_background_color(rust_xlsxwriter::Color::RGB(0x2563EB))
        .set_font_color(rust_xlsxwriter::Color::RGB(0xFFFFFF));
    let number_format = Format::new().set_num_format("0.000").set_align(FormatAlign::Right);
    let drift_format = Format::new()
        .set_num_format("0.000")
        .set_align(FormatAlign::Right)
        .set_background_color(rust_xlsxwriter::Color::RGB(0xFDE68A));

    for (col, &w) in COLUMN_WIDTHS.iter().enumerate() {
        worksheet.set_column_width(col as u16, w).map_err(xlsx_err)?;
    }
    for (col, header) in HEADERS.iter().enumerate() {
        worksheet
            .write_string_with_format(0, col as u16, *header, &header_format)
            .map_err(xlsx_err)?;
    }

    for (idx, obs) in report.observations.iter().enumerate() {
        let row = (idx + 1) as u32;
        let approve = prefill.is_some_and(|min| obs.confidence >= min);
        write_row(worksheet, row, obs, approve, &number_format, &drift_format).map_err(xlsx_err)?;
    }

    worksheet.set_freeze_panes(1, 0).map_err(xlsx_err)?;
    workbook.save(path).map_err(xlsx_err)?;
    tracing::info!(
        "[excel] wrote {} observations to {}",
        report.observations.len(),
        path.display()
    );
    Ok(())
}

fn write_row(
    worksheet: &mut Worksheet,
    row: u32,
    obs: &CalibrationObservation,
    approve: bool,
    number_format: &Format,
    drift_format: &Format,
) -> Result<(), XlsxError> {
    if approve {
        worksheet.write_string(row, 0, "yes")?;
    }
    worksheet.write_string(row, 1, &obs.id)?;
    worksheet.write_string(row, 2, obs.page.as_str())?;
    worksheet.write_string(row, 3, &obs.field_name)?;
    worksheet.write_string(row, 4, obs.label.as_deref().unwrap_or(""))?;
    worksheet.write_string(row, 5, method_name(obs))?;
    worksheet.write_string(row, 6, &obs.matched_text)?;
    let distance_format = if obs.distance > SIGNIFICANT_DRIFT {
        drift_format
    } else {
        number_format
    };
    worksheet.write_number_with_format(row, 7, obs.distance, distance_format)?;
    worksheet.write_number(row, 8, obs.confidence.round())?;
    let coords = [
        obs.old_region.x,
        obs.old_region.y,
        obs.new_region.x,
        obs.new_region.y,
        obs.new_region.width,
        obs.new_region.height,
    ];
    for (offset, value) in coords.into_iter().enumerate() {
        worksheet.write_number_with_format(row, 9 + offset as u16, value, number_format)?;
    }
    Ok(())
}

fn method_name(obs: &CalibrationObservation) -> &'static str {
    use crate::services::calibration::MatchSource;
    match obs.method {
        MatchSource::Query => "query",
        MatchSource::Label => "label",
        MatchSource::NearbyLabel => "nearby-label",
        MatchSource::Pattern => "pattern",
    }
}

/// Ids of rows whose Approve cell reads yes / y / x / true / 1.
pub fn read_approvals(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Err(Error::NotFound(path.display().to_string()));
    }
    let mut workbook =
        open_workbook_auto(path).map_err(|e| Error::Spreadsheet(format!("Could not open {}: {}", path.display(), e)))?;
    let names = workbook.sheet_names();
    let sheet = names
        .iter()
        .find(|n| n.as_str() == SHEET_NAME)
        .or_else(|| names.first())
        .cloned()
        .ok_or_else(|| Error::Spreadsheet("workbook has no sheets".to_string()))?;
    let range = workbook
        .worksheet_range(&sheet)
        .map_err(|e| Error::Spreadsheet(format!("Sheet not found: {}", e)))?;

    let mut rows = range.rows();
    let header: Vec<String> = rows
        .next()
        .map(|r| r.iter().map(cell_text).collect())
        .unwrap_or_default();
    let column = |name: &str| {
        header
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::Spreadsheet(format!("missing '{}' column", name)))
    };
    let approve_col = column("Approve")?;
    let id_col = column("Id")?;

    let mut approved = Vec::new();
    for row in rows {
        let flag = row.get(approve_col).map(cell_text).unwrap_or_default();
        let id = row.get(id_col).map(cell_text).unwrap_or_default();
        if !id.trim().is_empty() && is_yes(&flag) {
            approved.push(id.trim().to_string());
        }
    }
    Ok(approved)
}

fn cell_text(cell: &calamine::Data) -> String {
    cell.get_bool()
        .map(|b| b.to_string())
        .or_else(|| cell.as_string())
        .unwrap_or_default()
}

fn is_yes(flag: &str) -> bool {
    matches!(
        flag.trim().to_ascii_lowercase().as_str(),
        "yes" | "y" | "x" | "true" | "1"
    )
}
