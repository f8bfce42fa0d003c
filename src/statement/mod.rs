//! Statement import: OFX and CSV parsing into normalized transaction records

pub mod delimited;
pub mod ofx;

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{debug, info};

use crate::types::*;

pub use self::delimited::parse_csv;
pub use self::ofx::parse_ofx;

/// Placeholder used when a transaction carries no description at all
pub const NO_DESCRIPTION: &str = "No description";

/// Source format of a statement file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatementFormat {
    Ofx,
    Csv,
}

/// Header information of an imported statement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatementMetadata {
    /// Bank organization (OFX `ORG`)
    pub bank: Option<String>,
    /// Account identifier (OFX `ACCTID`)
    pub account_id: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

/// A row or block that was dropped during parsing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRow {
    /// 1-based line number for CSV rows, block ordinal for OFX
    pub position: usize,
    pub reason: String,
}

/// Result of parsing a statement file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedStatement {
    pub format: StatementFormat,
    pub metadata: StatementMetadata,
    /// Accepted records in file order
    pub transactions: Vec<TransactionRecord>,
    pub skipped: Vec<SkippedRow>,
}

impl ParsedStatement {
    pub fn accepted_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }

    /// Counts and totals for an import preview
    pub fn preview(&self) -> ImportPreview {
        let mut total_credits = BigDecimal::from(0);
        let mut total_debits = BigDecimal::from(0);
        for transaction in &self.transactions {
            match transaction.direction {
                Direction::Credit => total_credits += &transaction.amount,
                Direction::Debit => total_debits += &transaction.amount,
            }
        }
        ImportPreview {
            format: self.format,
            metadata: self.metadata.clone(),
            accepted: self.accepted_count(),
            skipped: self.skipped_count(),
            skipped_rows: self.skipped.clone(),
            total_credits,
            total_debits,
        }
    }
}

/// What the caller shows before confirming an import
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportPreview {
    pub format: StatementFormat,
    pub metadata: StatementMetadata,
    pub accepted: usize,
    pub skipped: usize,
    pub skipped_rows: Vec<SkippedRow>,
    pub total_credits: BigDecimal,
    pub total_debits: BigDecimal,
}

/// Parse a statement file, choosing OFX or CSV from the filename and content.
///
/// Only empty or undecodable input is an error; malformed rows are skipped
/// and counted.
pub fn parse_statement(content: &[u8], filename: &str) -> ReconResult<ParsedStatement> {
    let text = decode(content);
    if text.trim().is_empty() {
        return Err(ReconError::UnreadableStatement(format!(
            "{filename} is empty"
        )));
    }

    let format = detect_format(&text, filename);
    debug!(filename, ?format, "detected statement format");

    let parsed = match format {
        StatementFormat::Ofx => parse_ofx(&text)?,
        StatementFormat::Csv => parse_csv(&text)?,
    };

    info!(
        filename,
        accepted = parsed.accepted_count(),
        skipped = parsed.skipped_count(),
        "statement parsed"
    );
    Ok(parsed)
}

/// OFX when the extension says so or the content has transaction markers
pub fn detect_format(content: &str, filename: &str) -> StatementFormat {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase());
    if matches!(extension.as_deref(), Some("ofx") | Some("qfx")) {
        return StatementFormat::Ofx;
    }

    let upper = content.to_ascii_uppercase();
    if upper.contains("<STMTTRN>") || upper.contains("<OFX>") {
        StatementFormat::Ofx
    } else {
        StatementFormat::Csv
    }
}

/// UTF-8 with a Latin-1 fallback, BOM stripped
fn decode(content: &[u8]) -> String {
    let text = match std::str::from_utf8(content) {
        Ok(text) => text.to_string(),
        Err(_) => content.iter().map(|&b| b as char).collect(),
    };
    text.trim_start_matches('\u{feff}').to_string()
}

/// Parse a date in `DD/MM/YYYY` or `YYYY-MM-DD`
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    NaiveDate::parse_from_str(value, "%d/%m/%Y")
        .or_else(|_| NaiveDate::parse_from_str(value, "%Y-%m-%d"))
        .ok()
}

/// Parse a formatted amount into a signed decimal.
///
/// Strips currency symbols and whitespace, accepts `-`, trailing `-` or
/// parentheses as negative markers, and treats the last of `.`/`,` as the
/// decimal separator when both appear.
pub fn parse_amount(value: &str) -> Option<BigDecimal> {
    let trimmed = value.trim();
    let mut negative = false;
    let mut body = trimmed;
    if body.starts_with('(') && body.ends_with(')') {
        negative = true;
        body = &body[1..body.len() - 1];
    }

    let mut cleaned: String = body
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-' | '+'))
        .collect();

    if cleaned.ends_with('-') {
        negative = !negative;
        cleaned.pop();
    }
    if let Some(rest) = cleaned.strip_prefix('-') {
        negative = !negative;
        cleaned = rest.to_string();
    } else if let Some(rest) = cleaned.strip_prefix('+') {
        cleaned = rest.to_string();
    }
    if cleaned.is_empty() || cleaned.contains(['-', '+']) {
        return None;
    }

    let normalized = match (cleaned.rfind('.'), cleaned.rfind(',')) {
        (Some(dot), Some(comma)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (None, Some(_)) => {
            if cleaned.matches(',').count() > 1 {
                cleaned.replace(',', "")
            } else {
                cleaned.replace(',', ".")
            }
        }
        (Some(_), None) if cleaned.matches('.').count() > 1 => cleaned.replace('.', ""),
        _ => cleaned,
    };

    let amount = BigDecimal::from_str(&normalized).ok()?;
    Some(if negative { -amount } else { amount })
}

/// Statement period derived from record dates when the file has no header
pub(crate) fn date_range(transactions: &[TransactionRecord]) -> (Option<NaiveDate>, Option<NaiveDate>) {
    let start = transactions.iter().map(|t| t.date).min();
    let end = transactions.iter().map(|t| t.date).max();
    (start, end)
}
