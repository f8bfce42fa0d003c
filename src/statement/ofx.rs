//! OFX statement parsing
//!
//! OFX 1.x is SGML: leaf elements often have no closing tag, so the scanner
//! tokenizes `<TAG>value` pairs and treats any tag without an inline value
//! as an aggregate opener. Transactions are the `STMTTRN` aggregates.

use chrono::NaiveDate;
use quick_xml::escape::unescape;
use std::borrow::Cow;
use std::collections::HashMap;
use tracing::debug;

use super::*;

/// One token of the tagged-block grammar
#[derive(Debug, Clone, PartialEq, Eq)]
enum Token<'a> {
    /// `<TAG>` with no inline value
    Open(String),
    /// `</TAG>`
    Close(String),
    /// `<TAG>value`, entity-decoded
    Field(String, Cow<'a, str>),
}

/// Tokenize an OFX body. Text before the first `<` (the OFX 1.x header) is ignored.
fn tokenize(content: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    for segment in content.split('<').skip(1) {
        let Some((tag, rest)) = segment.split_once('>') else {
            continue;
        };
        let tag = tag.trim();
        if tag.is_empty() || tag.starts_with('?') || tag.starts_with('!') {
            continue;
        }
        if let Some(name) = tag.strip_prefix('/') {
            tokens.push(Token::Close(name.trim().to_ascii_uppercase()));
            continue;
        }
        let name = tag.to_ascii_uppercase();
        let value = rest.trim();
        if value.is_empty() {
            tokens.push(Token::Open(name));
        } else {
            tokens.push(Token::Field(name, decode_entities(value)));
        }
    }
    tokens
}

/// Resolve `&amp;`, `&lt;` and the other predefined or numeric references.
///
/// SGML files often carry a bare `&` ("A & B"); such values are kept verbatim.
fn decode_entities(value: &str) -> Cow<'_, str> {
    if !value.contains('&') {
        return Cow::Borrowed(value);
    }
    unescape(value).unwrap_or(Cow::Borrowed(value))
}

/// Fields of one `STMTTRN` block
#[derive(Debug, Default)]
struct Block<'a> {
    fields: HashMap<String, Cow<'a, str>>,
}

impl Block<'_> {
    fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|v| v.as_ref())
            .filter(|v| !v.is_empty())
    }
}

/// Split tokens into header fields and transaction blocks
fn scan<'a>(tokens: &[Token<'a>]) -> (HashMap<String, Cow<'a, str>>, Vec<Block<'a>>) {
    let mut header = HashMap::new();
    let mut blocks = Vec::new();
    let mut current: Option<Block<'a>> = None;

    for token in tokens {
        match token {
            Token::Open(name) if name == "STMTTRN" => {
                // An unterminated block is closed by the next one
                if let Some(block) = current.take() {
                    blocks.push(block);
                }
                current = Some(Block::default());
            }
            Token::Close(name) if name == "STMTTRN" || name == "BANKTRANLIST" => {
                if let Some(block) = current.take() {
                    blocks.push(block);
                }
            }
            Token::Field(name, value) => match current.as_mut() {
                Some(block) => {
                    block.fields.insert(name.clone(), value.clone());
                }
                None => {
                    header
                        .entry(name.clone())
                        .or_insert_with(|| value.clone());
                }
            },
            _ => {}
        }
    }
    if let Some(block) = current.take() {
        blocks.push(block);
    }

    (header, blocks)
}

/// Parse an OFX date (`YYYYMMDD`, optionally followed by time and timezone)
pub fn parse_ofx_date(value: &str) -> Option<NaiveDate> {
    let digits = value.trim().get(..8)?;
    NaiveDate::parse_from_str(digits, "%Y%m%d").ok()
}

/// Parse OFX content into normalized transaction records.
///
/// A block without a posting date or amount is dropped and counted.
pub fn parse_ofx(content: &str) -> ReconResult<ParsedStatement> {
    let tokens = tokenize(content);
    if tokens.is_empty() {
        return Err(ReconError::UnreadableStatement(
            "no OFX tags found".to_string(),
        ));
    }

    let (header, blocks) = scan(&tokens);
    let metadata = StatementMetadata {
        bank: header.get("ORG").map(|v| v.to_string()),
        account_id: header.get("ACCTID").map(|v| v.to_string()),
        start_date: header.get("DTSTART").and_then(|v| parse_ofx_date(v)),
        end_date: header.get("DTEND").and_then(|v| parse_ofx_date(v)),
    };

    let mut transactions = Vec::new();
    let mut skipped = Vec::new();

    for (index, block) in blocks.iter().enumerate() {
        let position = index + 1;
        let date = block.get("DTPOSTED").and_then(parse_ofx_date);
        let amount = block.get("TRNAMT").and_then(parse_amount);

        let (date, amount) = match (date, amount) {
            (Some(date), Some(amount)) => (date, amount),
            (None, _) => {
                debug!(position, "OFX block without posting date dropped");
                skipped.push(SkippedRow {
                    position,
                    reason: "missing or invalid DTPOSTED".to_string(),
                });
                continue;
            }
            (_, None) => {
                debug!(position, "OFX block without amount dropped");
                skipped.push(SkippedRow {
                    position,
                    reason: "missing or invalid TRNAMT".to_string(),
                });
                continue;
            }
        };

        let description = block
            .get("MEMO")
            .or_else(|| block.get("NAME"))
            .unwrap_or(NO_DESCRIPTION)
            .to_string();
        let document_id = block
            .get("FITID")
            .or_else(|| block.get("CHECKNUM"))
            .map(|v| v.to_string());

        let mut record = TransactionRecord::new(date, description, &amount)
            .with_document_id(document_id);
        record.account_id = metadata.account_id.clone();
        transactions.push(record);
    }

    Ok(ParsedStatement {
        format: StatementFormat::Ofx,
        metadata,
        transactions,
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;
    use std::str::FromStr;

    const SAMPLE: &str = r#"OFXHEADER:100
DATA:OFXSGML
VERSION:102

<OFX>
<SIGNONMSGSRSV1><SONRS>
<FI><ORG>Banco Exemplo<FID>341</FI>
</SONRS></SIGNONMSGSRSV1>
<BANKMSGSRSV1><STMTTRNRS><STMTRS>
<BANKACCTFROM><BANKID>341<ACCTID>12345-6<ACCTTYPE>CHECKING</BANKACCTFROM>
<BANKTRANLIST>
<DTSTART>20240101120000[-3:BRT]
<DTEND>20240131
<STMTTRN>
<TRNTYPE>CREDIT
<DTPOSTED>20240105120000[-3:BRT]
<TRNAMT>1500.00
<FITID>A001
<NAME>ACME LTDA
<MEMO>PIX RECEBIDO ACME LTDA
</STMTTRN>
<STMTTRN>
<TRNTYPE>DEBIT
<DTPOSTED>20240106
<TRNAMT>-32,90
<CHECKNUM>000123
<NAME>TARIFA PACOTE
</STMTTRN>
<STMTTRN>
<TRNTYPE>DEBIT
<TRNAMT>-10.00
<MEMO>NO DATE
</STMTTRN>
<STMTTRN>
<DTPOSTED>20240107
<MEMO>NO AMOUNT
</STMTTRN>
<STMTTRN>
<DTPOSTED>20240108
<TRNAMT>5.00
</STMTTRN>
</BANKTRANLIST>
</STMTRS></STMTTRNRS></BANKMSGSRSV1>
</OFX>
"#;

    #[test]
    fn test_parse_header_metadata() {
        let parsed = parse_ofx(SAMPLE).unwrap();
        assert_eq!(parsed.metadata.bank.as_deref(), Some("Banco Exemplo"));
        assert_eq!(parsed.metadata.account_id.as_deref(), Some("12345-6"));
        assert_eq!(parsed.metadata.start_date, NaiveDate::from_ymd_opt(2024, 1, 1));
        assert_eq!(parsed.metadata.end_date, NaiveDate::from_ymd_opt(2024, 1, 31));
    }

    #[test]
    fn test_blocks_without_date_or_amount_are_counted() {
        let parsed = parse_ofx(SAMPLE).unwrap();
        assert_eq!(parsed.accepted_count(), 3);
        assert_eq!(parsed.skipped_count(), 2);
        assert_eq!(parsed.skipped[0].position, 3);
        assert!(parsed.skipped[0].reason.contains("DTPOSTED"));
        assert!(parsed.skipped[1].reason.contains("TRNAMT"));
    }

    #[test]
    fn test_sign_sets_direction_and_magnitude() {
        let parsed = parse_ofx(SAMPLE).unwrap();
        let credit = &parsed.transactions[0];
        assert_eq!(credit.direction, Direction::Credit);
        assert_eq!(credit.amount, BigDecimal::from_str("1500.00").unwrap());

        let debit = &parsed.transactions[1];
        assert_eq!(debit.direction, Direction::Debit);
        assert_eq!(debit.amount, BigDecimal::from_str("32.90").unwrap());

        for transaction in &parsed.transactions {
            assert!(transaction.amount >= BigDecimal::from(0));
        }
    }

    #[test]
    fn test_description_and_document_id_fallbacks() {
        let parsed = parse_ofx(SAMPLE).unwrap();
        assert_eq!(parsed.transactions[0].description, "PIX RECEBIDO ACME LTDA");
        assert_eq!(parsed.transactions[0].document_id.as_deref(), Some("A001"));
        assert_eq!(parsed.transactions[1].description, "TARIFA PACOTE");
        assert_eq!(parsed.transactions[1].document_id.as_deref(), Some("000123"));
        assert_eq!(parsed.transactions[2].description, NO_DESCRIPTION);
        assert_eq!(parsed.transactions[2].document_id, None);
        assert_eq!(
            parsed.transactions[0].account_id.as_deref(),
            Some("12345-6")
        );
    }

    #[test]
    fn test_closed_xml_style_elements() {
        let content = "<OFX><STMTTRN><DTPOSTED>20240301</DTPOSTED><TRNAMT>-7.5</TRNAMT>\
                       <MEMO>Coffee</MEMO></STMTTRN></OFX>";
        let parsed = parse_ofx(content).unwrap();
        assert_eq!(parsed.accepted_count(), 1);
        assert_eq!(parsed.transactions[0].description, "Coffee");
        assert_eq!(parsed.transactions[0].direction, Direction::Debit);
    }

    #[test]
    fn test_entities_are_decoded() {
        let content = "<OFX><STMTTRN><DTPOSTED>20240301<TRNAMT>-120.00\
                       <NAME>M&amp;M COMERCIO<MEMO>BOLETO &lt;ATRASADO&gt; &#39;MAR&#39;\
                       </STMTTRN><STMTTRN><DTPOSTED>20240302<TRNAMT>10.00\
                       <MEMO>PIX A & B</STMTTRN></OFX>";
        let parsed = parse_ofx(content).unwrap();
        assert_eq!(parsed.transactions[0].description, "BOLETO <ATRASADO> 'MAR'");
        // a bare ampersand is not an entity
        assert_eq!(parsed.transactions[1].description, "PIX A & B");

        let tokens = tokenize("<NAME>M&amp;M COMERCIO");
        assert_eq!(
            tokens,
            vec![Token::Field("NAME".to_string(), Cow::Borrowed("M&M COMERCIO"))]
        );
    }

    #[test]
    fn test_no_tags_is_unreadable() {
        assert!(matches!(
            parse_ofx("plain text"),
            Err(ReconError::UnreadableStatement(_))
        ));
    }
}
