//! Raw rows → canonical [`SaleRecord`] / [`PaymentRecord`].
//!
//! Channels disagree on column names, number formats and date formats. This
//! module absorbs those differences once, so nothing downstream ever parses a
//! string or rounds an amount again.
//!
//! Malformed rows are dropped and tallied in [`RunErrors`]; only an empty or
//! unrecognizable batch is fatal.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::Value;

use crate::error::ReconError;
use crate::ingest::{chunked, DEFAULT_CHUNK_SIZE};
use crate::model::{IssueSide, Normalized, PaymentRecord, RawRow, RunErrors, SaleRecord};

// ---------------------------------------------------------------------------
// Column aliases (canonical form: lowercase, no `_`, `-` or spaces)
// ---------------------------------------------------------------------------

const SALE_ID: &[&str] = &["orderid", "order", "ordernumber", "id"];
const PAYMENT_ID: &[&str] = &["referenceid", "reference", "orderid", "externalreference", "id"];
const CHANNEL: &[&str] = &["channelid", "channel", "marketplace"];
const SALE_DATE: &[&str] = &["date", "orderdate", "saledate", "createdat"];
const PAYMENT_DATE: &[&str] = &["date", "paymentdate", "settledat", "createdat"];

const GROSS: &[&str] = &["grossamount", "gross", "total"];
const NET: &[&str] = &["netamount", "net"];
const TAX: &[&str] = &["taxamount", "tax", "iva"];
const COMMISSION: &[&str] = &["commissionamount", "commission", "fee"];
const REFUND: &[&str] = &["refundamount", "refund", "refunds"];

const PAYMENT_AMOUNT: &[&str] = &["amount", "netamount", "paidamount"];
const PAYMENT_FEE: &[&str] = &["feeamount", "fee", "commission"];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%Y/%m/%d"];
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

/// Epoch values above this are taken as milliseconds.
const EPOCH_MILLIS_CUTOFF: i64 = 100_000_000_000;

/// Shortest digit string read as an epoch timestamp (1973-03-03 onwards).
const EPOCH_MIN_DIGITS: usize = 9;

/// Largest accepted amount magnitude, 10^15. Keeps every sum and difference
/// the engine computes far inside `Decimal` range.
const MAX_ABS_AMOUNT: Decimal = Decimal::from_parts(0xA4C6_8000, 0x0003_8D7E, 0, false, 0);

/// Longest alphabetic currency code accepted around an amount (`CLP`, `US$`).
const MAX_CURRENCY_CODE: usize = 3;

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Normalize both collections in one pass.
pub fn normalize(raw_sales: &[RawRow], raw_payments: &[RawRow]) -> Result<Normalized, ReconError> {
    normalize_in_chunks(raw_sales, raw_payments, DEFAULT_CHUNK_SIZE, || Ok(()))
}

/// Normalize in batches of `chunk_size`, calling `between_chunks` before each
/// batch. An error from the callback aborts the whole normalization.
pub fn normalize_in_chunks<F>(
    raw_sales: &[RawRow],
    raw_payments: &[RawRow],
    chunk_size: usize,
    mut between_chunks: F,
) -> Result<Normalized, ReconError>
where
    F: FnMut() -> Result<(), ReconError>,
{
    check_structure(raw_sales, raw_payments)?;

    let mut errors = RunErrors::default();
    let mut sales = Vec::with_capacity(raw_sales.len());
    let mut payments = Vec::with_capacity(raw_payments.len());

    let mut offset = 0;
    for chunk in chunked(raw_sales, chunk_size) {
        between_chunks()?;
        for (i, row) in chunk.iter().enumerate() {
            match normalize_sale(row) {
                Ok(sale) => sales.push(sale),
                Err(reason) => errors.record(IssueSide::Sale, row_ref(offset + i, row, SALE_ID), reason),
            }
        }
        offset += chunk.len();
    }

    let mut offset = 0;
    for chunk in chunked(raw_payments, chunk_size) {
        between_chunks()?;
        for (i, row) in chunk.iter().enumerate() {
            match normalize_payment(row) {
                Ok(payment) => payments.push(payment),
                Err(reason) => {
                    errors.record(IssueSide::Payment, row_ref(offset + i, row, PAYMENT_ID), reason)
                }
            }
        }
        offset += chunk.len();
    }

    Ok(Normalized {
        sales,
        payments,
        errors,
    })
}

/// Batch-level validation: something to reconcile, and each non-empty side
/// recognizable as sales / payments.
fn check_structure(raw_sales: &[RawRow], raw_payments: &[RawRow]) -> Result<(), ReconError> {
    if raw_sales.is_empty() && raw_payments.is_empty() {
        return Err(ReconError::InvalidInput("no sales or payments to reconcile".into()));
    }

    let sale_shape = |row: &RawRow| {
        has_any(row, SALE_ID)
            && has_any(row, CHANNEL)
            && has_any(row, SALE_DATE)
            && (has_any(row, GROSS) || has_any(row, NET))
    };
    if !raw_sales.is_empty() && !raw_sales.iter().any(sale_shape) {
        return Err(ReconError::InvalidInput(
            "sales input has none of the required columns (order_id, channel_id, date, gross/net amount)"
                .into(),
        ));
    }

    let payment_shape = |row: &RawRow| {
        has_any(row, PAYMENT_ID)
            && has_any(row, CHANNEL)
            && has_any(row, PAYMENT_DATE)
            && has_any(row, PAYMENT_AMOUNT)
    };
    if !raw_payments.is_empty() && !raw_payments.iter().any(payment_shape) {
        return Err(ReconError::InvalidInput(
            "payments input has none of the required columns (reference_id, channel_id, date, amount)"
                .into(),
        ));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Per-row conversion
// ---------------------------------------------------------------------------

pub fn normalize_sale(row: &RawRow) -> Result<SaleRecord, String> {
    let order_id = required_text(row, SALE_ID, "order_id")?;
    let channel_id = required_channel(row)?;
    let date = required_date(row, SALE_DATE)?;

    let gross = optional_amount(row, GROSS, "gross_amount")?;
    let net = optional_amount(row, NET, "net_amount")?;
    let tax = optional_amount(row, TAX, "tax_amount")?.unwrap_or(Decimal::ZERO);
    let commission = optional_amount(row, COMMISSION, "commission_amount")?;
    let refund = optional_amount(row, REFUND, "refund_amount")?.unwrap_or(Decimal::ZERO);
    let commission_amount = commission.unwrap_or(Decimal::ZERO);

    let overflow = || "amount overflow deriving gross/net".to_string();
    let deductions = commission_amount
        .checked_add(tax)
        .and_then(|d| d.checked_add(refund))
        .ok_or_else(overflow)?;
    let (gross_amount, net_amount) = match (gross, net) {
        (Some(g), Some(n)) => (g, n),
        (Some(g), None) => (g, g.checked_sub(deductions).ok_or_else(overflow)?),
        (None, Some(n)) => (n.checked_add(deductions).ok_or_else(overflow)?, n),
        (None, None) => return Err("missing gross_amount and net_amount".into()),
    };

    Ok(SaleRecord {
        order_id,
        channel_id,
        date,
        gross_amount,
        net_amount,
        tax_amount: tax,
        commission_amount,
        refund_amount: refund,
        commission_reported: commission.is_some(),
    })
}

pub fn normalize_payment(row: &RawRow) -> Result<PaymentRecord, String> {
    let reference_id = required_text(row, PAYMENT_ID, "reference_id")?;
    let channel_id = required_channel(row)?;
    let date = required_date(row, PAYMENT_DATE)?;
    let amount = optional_amount(row, PAYMENT_AMOUNT, "amount")?
        .ok_or_else(|| "missing amount".to_string())?;
    let fee_amount = optional_amount(row, PAYMENT_FEE, "fee_amount")?.unwrap_or(Decimal::ZERO);

    Ok(PaymentRecord {
        reference_id,
        channel_id,
        date,
        amount,
        fee_amount,
    })
}

// ---------------------------------------------------------------------------
// Field lookup
// ---------------------------------------------------------------------------

fn canonical(column: &str) -> String {
    column
        .chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

/// First non-null value among the aliases, in alias priority order.
fn lookup<'a>(row: &'a RawRow, aliases: &[&str]) -> Option<&'a Value> {
    aliases.iter().find_map(|alias| {
        row.fields
            .iter()
            .find(|(k, v)| !v.is_null() && canonical(k) == *alias)
            .map(|(_, v)| v)
    })
}

fn has_any(row: &RawRow, aliases: &[&str]) -> bool {
    lookup(row, aliases).is_some()
}

fn text_of(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn required_text(row: &RawRow, aliases: &[&str], field: &str) -> Result<String, String> {
    lookup(row, aliases)
        .and_then(text_of)
        .ok_or_else(|| format!("missing {field}"))
}

/// Channel ids are compared case-insensitively across sources.
fn required_channel(row: &RawRow) -> Result<String, String> {
    required_text(row, CHANNEL, "channel_id").map(|c| c.to_lowercase())
}

fn required_date(row: &RawRow, aliases: &[&str]) -> Result<NaiveDate, String> {
    let value = lookup(row, aliases).ok_or_else(|| "missing date".to_string())?;
    parse_date(value).ok_or_else(|| format!("unparsable date {value}"))
}

fn optional_amount(row: &RawRow, aliases: &[&str], field: &str) -> Result<Option<Decimal>, String> {
    let Some(value) = lookup(row, aliases) else {
        return Ok(None);
    };
    let amount = parse_amount(value).ok_or_else(|| format!("non-numeric {field} {value}"))?;
    if amount.abs() > MAX_ABS_AMOUNT {
        return Err(format!("{field} out of range {value}"));
    }
    Ok(Some(amount))
}

fn row_ref(index: usize, row: &RawRow, id_aliases: &[&str]) -> String {
    match lookup(row, id_aliases).and_then(text_of) {
        Some(id) => format!("row {index} ({id})"),
        None => format!("row {index}"),
    }
}

// ---------------------------------------------------------------------------
// Money
// ---------------------------------------------------------------------------

/// Parse a monetary value and round it to cents (banker's rounding).
pub fn parse_amount(value: &Value) -> Option<Decimal> {
    let raw = match value {
        Value::Number(n) => decimal_from_str(&n.to_string())?,
        Value::String(s) => parse_money_str(s)?,
        _ => return None,
    };
    Some(round_money(raw))
}

pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointNearestEven)
}

fn decimal_from_str(s: &str) -> Option<Decimal> {
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .ok()
}

/// Accepts `1234.5`, `-10`, `(10.00)`, `$ 1.234.567`, `1.234,56`,
/// `1,234.56`, `CLP 5000`, `5000 CLP`.
///
/// A currency marker (`$` and/or a code of up to three letters) may only lead
/// or trail the number; any other letter rejects the value.
///
/// A lone `.` followed by exactly three digits is a thousands separator only
/// when a currency marker is present (`$ 1.190` is 1190, `1.190` is 1.19).
/// A lone `,` followed by exactly three digits is always a thousands separator.
fn parse_money_str(input: &str) -> Option<Decimal> {
    let mut rest = input.trim();
    let mut negative = false;
    if let Some(inner) = rest.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        negative = true;
        rest = inner.trim();
    }
    if let Some(r) = rest.strip_prefix('-') {
        negative = !negative;
        rest = r.trim_start();
    }

    let (rest, leading) = strip_leading_currency(rest);
    let (mut rest, trailing) = strip_trailing_currency(rest);
    let has_currency = leading || trailing;
    if let Some(r) = rest.strip_prefix('-') {
        negative = !negative;
        rest = r.trim_start();
    }

    let mut body = String::with_capacity(rest.len());
    for c in rest.chars() {
        match c {
            '0'..='9' | '.' | ',' => body.push(c),
            ' ' | '\u{a0}' => {}
            _ => return None,
        }
    }
    if !body.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let dots = body.matches('.').count();
    let commas = body.matches(',').count();
    let normalized = match (dots, commas) {
        (0, 0) => body,
        (_, 0) => {
            if dots > 1 || (has_currency && digits_after(&body, '.') == 3) {
                body.replace('.', "")
            } else {
                body
            }
        }
        (0, _) => {
            if commas > 1 || digits_after(&body, ',') == 3 {
                body.replace(',', "")
            } else {
                body.replace(',', ".")
            }
        }
        _ => {
            // Whichever separator comes last is the decimal point.
            let last_dot = body.rfind('.').unwrap_or(0);
            let last_comma = body.rfind(',').unwrap_or(0);
            if last_comma > last_dot {
                body.replace('.', "").replace(',', ".")
            } else {
                body.replace(',', "")
            }
        }
    };

    let value = Decimal::from_str(&normalized).ok()?;
    Some(if negative { -value } else { value })
}

/// `USD 10`, `US$10`, `$ 10` → (`10`, true).
fn strip_leading_currency(s: &str) -> (&str, bool) {
    let code = s.len() - s.trim_start_matches(|c: char| c.is_ascii_alphabetic()).len();
    if code > MAX_CURRENCY_CODE {
        return (s, false);
    }
    let after_code = &s[code..];
    let (rest, dollar) = match after_code.strip_prefix('$') {
        Some(r) => (r, true),
        None => (after_code, false),
    };
    (rest.trim_start(), code > 0 || dollar)
}

/// `10 CLP`, `10$` → (`10`, true).
fn strip_trailing_currency(s: &str) -> (&str, bool) {
    let (s, dollar) = match s.strip_suffix('$') {
        Some(r) => (r, true),
        None => (s, false),
    };
    let code = s.len() - s.trim_end_matches(|c: char| c.is_ascii_alphabetic()).len();
    if code > MAX_CURRENCY_CODE {
        return (s, dollar);
    }
    (s[..s.len() - code].trim_end(), code > 0 || dollar)
}

fn digits_after(body: &str, sep: char) -> usize {
    body.rfind(sep).map(|i| body.len() - i - 1).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Dates
// ---------------------------------------------------------------------------

/// Parse into a UTC calendar date.
pub fn parse_date(value: &Value) -> Option<NaiveDate> {
    match value {
        Value::String(s) => parse_date_str(s.trim()),
        Value::Number(n) => n.as_i64().and_then(|v| parse_digits(&v.to_string())),
        _ => None,
    }
}

fn parse_date_str(s: &str) -> Option<NaiveDate> {
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc).date_naive());
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.date());
        }
    }
    if s.chars().all(|c| c.is_ascii_digit()) {
        return parse_digits(s);
    }
    None
}

/// Bare digits: `YYYYMMDD` when eight long, epoch seconds/millis from nine
/// digits up, anything shorter is not a date.
fn parse_digits(s: &str) -> Option<NaiveDate> {
    match s.len() {
        8 => NaiveDate::from_ymd_opt(
            s[..4].parse().ok()?,
            s[4..6].parse().ok()?,
            s[6..].parse().ok()?,
        ),
        n if n >= EPOCH_MIN_DIGITS => s.parse().ok().and_then(date_from_epoch),
        _ => None,
    }
}

fn date_from_epoch(value: i64) -> Option<NaiveDate> {
    let secs = if value.abs() > EPOCH_MILLIS_CUTOFF {
        value / 1000
    } else {
        value
    };
    DateTime::from_timestamp(secs, 0).map(|dt| dt.date_naive())
}
