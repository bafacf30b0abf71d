use std::collections::BTreeMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// One already-fetched row, as delivered by the backend or a CSV upload.
///
/// Values keep whatever JSON type the source used; a channel may send amounts
/// as numbers while another sends formatted strings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRow {
    pub fields: BTreeMap<String, Value>,
}

impl RawRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, handy for in-memory fixtures.
    pub fn with(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(column.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, column: &str, value: impl Into<Value>) {
        self.fields.insert(column.to_string(), value.into());
    }
}

/// A marketplace sale in canonical form. Amounts are rounded to cents once,
/// at ingestion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaleRecord {
    pub order_id: String,
    pub channel_id: String,
    pub date: NaiveDate,
    pub gross_amount: Decimal,
    pub net_amount: Decimal,
    pub tax_amount: Decimal,
    pub commission_amount: Decimal,
    pub refund_amount: Decimal,
    /// False when the source row had no commission column and
    /// `commission_amount` is only the zero default.
    pub commission_reported: bool,
}

impl SaleRecord {
    /// `gross - commission - tax - refund`, what `net_amount` should equal.
    /// `None` on overflow.
    pub fn expected_net(&self) -> Option<Decimal> {
        self.gross_amount
            .checked_sub(self.commission_amount)?
            .checked_sub(self.tax_amount)?
            .checked_sub(self.refund_amount)
    }
}

/// Money actually settled by a payment processor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentRecord {
    pub reference_id: String,
    pub channel_id: String,
    pub date: NaiveDate,
    pub amount: Decimal,
    pub fee_amount: Decimal,
}

// ---------------------------------------------------------------------------
// Normalization output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSide {
    Sale,
    Payment,
    Pair,
}

impl std::fmt::Display for IssueSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sale => write!(f, "sale"),
            Self::Payment => write!(f, "payment"),
            Self::Pair => write!(f, "pair"),
        }
    }
}

/// A recoverable problem: a dropped row or a skipped evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowIssue {
    pub side: IssueSide,
    /// Input index for rows; sale/payment reference for pairs.
    pub reference: String,
    pub reason: String,
}

/// Tally of everything the run recovered from instead of failing.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunErrors {
    pub dropped_sales: usize,
    pub dropped_payments: usize,
    pub skipped_evaluations: usize,
    pub issues: Vec<RowIssue>,
}

impl RunErrors {
    pub fn total(&self) -> usize {
        self.dropped_sales + self.dropped_payments + self.skipped_evaluations
    }

    pub fn record(&mut self, side: IssueSide, reference: impl Into<String>, reason: impl Into<String>) {
        match side {
            IssueSide::Sale => self.dropped_sales += 1,
            IssueSide::Payment => self.dropped_payments += 1,
            IssueSide::Pair => self.skipped_evaluations += 1,
        }
        self.issues.push(RowIssue {
            side,
            reference: reference.into(),
            reason: reason.into(),
        });
    }
}

#[derive(Debug, Clone, Default)]
pub struct Normalized {
    pub sales: Vec<SaleRecord>,
    pub payments: Vec<PaymentRecord>,
    pub errors: RunErrors,
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

/// A sale linked to the payment carrying the same `(channel_id, key)`.
/// Lives for a single run only.
#[derive(Debug, Clone, Serialize)]
pub struct MatchedPair {
    pub sale: SaleRecord,
    pub payment: PaymentRecord,
    /// `payment.date - sale.date`, in days.
    pub date_offset_days: i64,
}

#[derive(Debug, Default)]
pub struct MatchResult {
    pub matched: Vec<MatchedPair>,
    pub unmatched_sales: Vec<SaleRecord>,
    pub unmatched_payments: Vec<PaymentRecord>,
}

// ---------------------------------------------------------------------------
// Discrepancies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    Unmatched,
    CommissionMismatch,
    TaxMismatch,
    ToleranceExceeded,
    /// `net != gross - commission - tax - refund` on the sale itself.
    NetInvariant,
}

impl std::fmt::Display for DiscrepancyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unmatched => write!(f, "unmatched"),
            Self::CommissionMismatch => write!(f, "commission_mismatch"),
            Self::TaxMismatch => write!(f, "tax_mismatch"),
            Self::ToleranceExceeded => write!(f, "tolerance_exceeded"),
            Self::NetInvariant => write!(f, "net_invariant"),
        }
    }
}

/// Ordered so that `High > Medium > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// A flagged gap between expected and actual money movement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Discrepancy {
    pub kind: DiscrepancyKind,
    pub severity: Severity,
    pub channel_id: String,
    /// Sale `order_id`, or payment `reference_id` for unmatched payments.
    pub order_id: String,
    pub date: NaiveDate,
    pub amount_delta: Decimal,
    /// 0..=100.
    pub confidence: u8,
    pub explanation: String,
    pub suggested_action: String,
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Critical,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub channel_id: String,
    pub order_id: String,
    pub amount_delta: Decimal,
    pub message: String,
    pub action: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChannelTotals {
    pub sale_count: usize,
    pub net_sales: Decimal,
    pub payments_total: Decimal,
    pub discrepancy_amount: Decimal,
    pub discrepancy_count: usize,
    pub accuracy_rate: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReportSummary {
    pub sale_count: usize,
    pub payment_count: usize,
    pub matched: usize,
    pub unmatched_sales: usize,
    pub unmatched_payments: usize,
    pub total_net_sales: Decimal,
    pub total_payments: Decimal,
    pub discrepant_amount: Decimal,
    /// Discrepancies per reconciled group (matched + unmatched).
    pub discrepancy_rate: Decimal,
    pub by_kind: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<String, usize>,
}

/// Result of one run. Immutable once built; persistence and display belong
/// to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationReport {
    pub name: String,
    pub engine_version: String,
    pub accuracy_rate: Decimal,
    pub summary: ReportSummary,
    /// Ranked by `(severity desc, amount_delta desc)`.
    pub discrepancies: Vec<Discrepancy>,
    /// Ranked by `amount_delta desc`.
    pub alerts: Vec<Alert>,
    pub per_channel_totals: BTreeMap<String, ChannelTotals>,
    pub errors: RunErrors,
}

impl ReconciliationReport {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn critical_alerts(&self) -> impl Iterator<Item = &Alert> {
        self.alerts.iter().filter(|a| a.kind == AlertKind::Critical)
    }
}
