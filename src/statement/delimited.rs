//! CSV statement parsing with delimiter sniffing
//!
//! Expected columns: date, description, amount. Extra columns are ignored.

use ::csv::{ReaderBuilder, StringRecord, Trim};
use tracing::debug;

use super::*;

/// Pick `;` or `,` from the first non-empty line
pub fn detect_delimiter(content: &str) -> u8 {
    let first_line = content
        .lines()
        .find(|line| !line.trim().is_empty())
        .unwrap_or_default();
    let semicolons = first_line.matches(';').count();
    let commas = first_line.matches(',').count();
    if semicolons > 0 && semicolons >= commas {
        b';'
    } else {
        b','
    }
}

/// A first row whose first cell is not a date is a header
fn is_header(record: &StringRecord) -> bool {
    record
        .get(0)
        .map(|cell| parse_date(cell).is_none())
        .unwrap_or(false)
}

fn parse_row(record: &StringRecord) -> Result<TransactionRecord, String> {
    if record.len() < 3 {
        return Err(format!("expected 3 columns, found {}", record.len()));
    }
    let date_cell = record.get(0).unwrap_or_default();
    let date = parse_date(date_cell).ok_or_else(|| format!("invalid date '{date_cell}'"))?;

    let description = record.get(1).unwrap_or_default().trim();
    let description = if description.is_empty() {
        NO_DESCRIPTION
    } else {
        description
    };

    let amount_cell = record.get(2).unwrap_or_default();
    let amount =
        parse_amount(amount_cell).ok_or_else(|| format!("invalid amount '{amount_cell}'"))?;

    Ok(TransactionRecord::new(date, description.to_string(), &amount))
}

/// Parse CSV content into normalized transaction records.
///
/// Rows with fewer than three fields, or an unparseable date or amount, are
/// dropped and counted.
pub fn parse_csv(content: &str) -> ReconResult<ParsedStatement> {
    let delimiter = detect_delimiter(content);
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(content.as_bytes());

    let mut transactions = Vec::new();
    let mut skipped = Vec::new();

    for (index, result) in reader.records().enumerate() {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                let position = e
                    .position()
                    .map(|p| p.line() as usize)
                    .unwrap_or(index + 1);
                skipped.push(SkippedRow {
                    position,
                    reason: e.to_string(),
                });
                continue;
            }
        };
        let position = record
            .position()
            .map(|p| p.line() as usize)
            .unwrap_or(index + 1);

        if index == 0 && is_header(&record) {
            debug!("CSV header row skipped");
            continue;
        }

        match parse_row(&record) {
            Ok(transaction) => transactions.push(transaction),
            Err(reason) => {
                debug!(position, %reason, "CSV row dropped");
                skipped.push(SkippedRow { position, reason });
            }
        }
    }

    let (start_date, end_date) = date_range(&transactions);
    Ok(ParsedStatement {
        format: StatementFormat::Csv,
        metadata: StatementMetadata {
            bank: None,
            account_id: None,
            start_date,
            end_date,
        },
        transactions,
        skipped,
    })
}
