//! Discrepancy evaluation: turns matched/unmatched groups into flagged
//! [`Discrepancy`] values.
//!
//! Every monetary check uses the same rule: a gap is flagged when
//! `delta / base > tolerance_pct` or `delta > absolute_floor`, both strict.
//! Severity grows with how far past the tolerance the gap is:
//! - factor ≤ `medium_multiplier` → low
//! - factor ≤ `high_multiplier`   → medium
//! - above                        → high
//!
//! where factor = max(`(delta/base) / tolerance_pct`, `delta / absolute_floor`),
//! leaving out any term whose limit is zero. A gap above `critical_threshold`
//! is always high.

use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::config::{ChannelRule, ReconConfig, ToleranceConfig};
use crate::model::{
    Discrepancy, DiscrepancyKind, MatchedPair, PaymentRecord, SaleRecord, Severity,
};

// ---------------------------------------------------------------------------
// Inputs / outputs
// ---------------------------------------------------------------------------

/// One group coming out of the matcher.
#[derive(Debug, Clone, Copy)]
pub enum Subject<'a> {
    Matched(&'a MatchedPair),
    UnmatchedSale(&'a SaleRecord),
    UnmatchedPayment(&'a PaymentRecord),
}

impl Subject<'_> {
    /// Human-readable reference used in skip records.
    pub fn reference(&self) -> String {
        match self {
            Self::Matched(pair) => format!("{}/{}", pair.sale.channel_id, pair.sale.order_id),
            Self::UnmatchedSale(sale) => format!("{}/{}", sale.channel_id, sale.order_id),
            Self::UnmatchedPayment(p) => format!("{}/{}", p.channel_id, p.reference_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Clean,
    Flagged(Discrepancy),
    /// Could not be evaluated (degenerate amounts); counted, never fatal.
    Skipped(String),
}

/// Run-wide facts the evaluator needs besides the config.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub config: &'a ReconConfig,
    /// Latest date seen in the run; unmatched items older than this by more
    /// than `lookback_days` are considered aged.
    pub as_of: Option<NaiveDate>,
}

impl<'a> EvalContext<'a> {
    pub fn new(config: &'a ReconConfig, sales: &[SaleRecord], payments: &[PaymentRecord]) -> Self {
        let as_of = sales
            .iter()
            .map(|s| s.date)
            .chain(payments.iter().map(|p| p.date))
            .max();
        Self { config, as_of }
    }

    fn tolerance(&self) -> &ToleranceConfig {
        &self.config.tolerance
    }

    fn is_aged(&self, date: NaiveDate) -> bool {
        self.as_of
            .map(|as_of| (as_of - date).num_days() > i64::from(self.tolerance().lookback_days))
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Primary evaluation
// ---------------------------------------------------------------------------

/// Evaluate one matcher group against the tolerance rules.
pub fn evaluate(subject: Subject<'_>, ctx: &EvalContext<'_>) -> Evaluation {
    match subject {
        Subject::Matched(pair) => evaluate_pair(pair, ctx),
        Subject::UnmatchedSale(sale) => Evaluation::Flagged(unmatched_sale(sale, ctx)),
        Subject::UnmatchedPayment(payment) => Evaluation::Flagged(unmatched_payment(payment, ctx)),
    }
}

fn evaluate_pair(pair: &MatchedPair, ctx: &EvalContext<'_>) -> Evaluation {
    let sale = &pair.sale;
    let payment = &pair.payment;
    let base = sale.net_amount.abs();
    if base.is_zero() {
        return Evaluation::Skipped("sale net_amount is zero".into());
    }

    let Some(delta) = sale.net_amount.checked_sub(payment.amount).map(|d| d.abs()) else {
        return Evaluation::Skipped("amount overflow comparing sale and payment".into());
    };
    let Some(severity) = assess(delta, base, ctx.tolerance()) else {
        return Evaluation::Clean;
    };

    let pct = percent(delta, base);
    Evaluation::Flagged(Discrepancy {
        kind: DiscrepancyKind::ToleranceExceeded,
        severity,
        channel_id: sale.channel_id.clone(),
        order_id: sale.order_id.clone(),
        date: sale.date,
        amount_delta: delta,
        confidence: pair_confidence(pair, delta, ctx),
        explanation: format!(
            "Sale {} on {} expected {} but payment {} settled {} (delta {delta}, {pct}% of net)",
            sale.order_id, sale.channel_id, sale.net_amount, payment.reference_id, payment.amount
        ),
        suggested_action: "Review the channel settlement for deductions not recorded on the sale"
            .into(),
    })
}

fn unmatched_sale(sale: &SaleRecord, ctx: &EvalContext<'_>) -> Discrepancy {
    let weights = &ctx.config.confidence;
    let mut score = Score::new(weights.unmatched_base);
    if ctx.is_aged(sale.date) {
        score.add(weights.unmatched_aged);
    }

    Discrepancy {
        kind: DiscrepancyKind::Unmatched,
        severity: Severity::High,
        channel_id: sale.channel_id.clone(),
        order_id: sale.order_id.clone(),
        date: sale.date,
        amount_delta: sale.net_amount.abs(),
        confidence: score.finish(),
        explanation: format!(
            "Sale {} on {} for {} has no matching payment",
            sale.order_id, sale.channel_id, sale.net_amount
        ),
        suggested_action: "Confirm the payout with the channel and escalate if it was never settled"
            .into(),
    }
}

fn unmatched_payment(payment: &PaymentRecord, ctx: &EvalContext<'_>) -> Discrepancy {
    let weights = &ctx.config.confidence;
    let mut score = Score::new(weights.unmatched_payment_base);
    if ctx.is_aged(payment.date) {
        score.add(weights.unmatched_aged);
    }

    Discrepancy {
        kind: DiscrepancyKind::Unmatched,
        severity: Severity::Medium,
        channel_id: payment.channel_id.clone(),
        order_id: payment.reference_id.clone(),
        date: payment.date,
        amount_delta: payment.amount.abs(),
        confidence: score.finish(),
        explanation: format!(
            "Payment {} on {} for {} has no matching sale",
            payment.reference_id, payment.channel_id, payment.amount
        ),
        suggested_action: "Check for a delayed or missing sale import before booking the payment"
            .into(),
    }
}

// ---------------------------------------------------------------------------
// Component checks (commission / tax / net breakdown)
// ---------------------------------------------------------------------------

/// Check the sale's own breakdown: commission and tax against the channel
/// rule (or the processor fee), and the net-amount identity.
///
/// `payment` is the matched payment, if any. Returns every component that
/// fails; an empty vec means the breakdown is consistent.
pub fn evaluate_components(
    sale: &SaleRecord,
    payment: Option<&PaymentRecord>,
    ctx: &EvalContext<'_>,
) -> Vec<Discrepancy> {
    let rule = ctx.config.channel_rule(&sale.channel_id);
    let mut found = Vec::new();

    if let Some(d) = check_commission(sale, payment, rule, ctx) {
        found.push(d);
    }
    if let Some(d) = rule.and_then(|r| check_tax(sale, payment, r, ctx)) {
        found.push(d);
    }
    if let Some(d) = check_net_invariant(sale, ctx) {
        found.push(d);
    }

    found
}

fn check_commission(
    sale: &SaleRecord,
    payment: Option<&PaymentRecord>,
    rule: Option<&ChannelRule>,
    ctx: &EvalContext<'_>,
) -> Option<Discrepancy> {
    // Nothing to compare when the sale never stated its commission.
    if !sale.commission_reported {
        return None;
    }
    let rate = rule.and_then(|r| r.commission_rate);
    let expected = match (rate, payment) {
        (Some(rate), _) => sale.gross_amount.checked_mul(rate)?,
        (None, Some(p)) if !p.fee_amount.is_zero() => p.fee_amount,
        _ => return None,
    };
    let expected = expected.round_dp(2);
    let delta = sale.commission_amount.checked_sub(expected)?.abs();
    let severity = assess_component(delta, expected.abs(), ctx.tolerance())?;

    let mut score = component_score(sale, payment, ctx);
    // Processor fee agreeing with the channel rate corroborates the expectation.
    if let (Some(rate), Some(p)) = (rate, payment) {
        let band = ctx
            .config
            .confidence
            .commission_proximity_band
            .checked_mul(sale.gross_amount.abs());
        let gap = sale
            .gross_amount
            .checked_mul(rate)
            .and_then(|e| p.fee_amount.checked_sub(e));
        if let (Some(gap), Some(band)) = (gap, band) {
            if gap.abs() <= band {
                score.add(ctx.config.confidence.commission_proximity);
            }
        }
    }

    Some(Discrepancy {
        kind: DiscrepancyKind::CommissionMismatch,
        severity,
        channel_id: sale.channel_id.clone(),
        order_id: sale.order_id.clone(),
        date: sale.date,
        amount_delta: delta,
        confidence: score.finish(),
        explanation: format!(
            "Commission on {} is {}, expected {expected}",
            sale.order_id, sale.commission_amount
        ),
        suggested_action: "Verify the channel commission rate against its fee invoice".into(),
    })
}

fn check_tax(
    sale: &SaleRecord,
    payment: Option<&PaymentRecord>,
    rule: &ChannelRule,
    ctx: &EvalContext<'_>,
) -> Option<Discrepancy> {
    let rate = rule.tax_rate?;
    let tax_on_gross = sale.gross_amount.checked_mul(rate)?;
    let expected = if rule.tax_inclusive {
        tax_on_gross.checked_div(Decimal::ONE + rate)?
    } else {
        tax_on_gross
    }
    .round_dp(2);

    let delta = sale.tax_amount.checked_sub(expected)?.abs();
    let severity = assess_component(delta, expected.abs(), ctx.tolerance())?;

    Some(Discrepancy {
        kind: DiscrepancyKind::TaxMismatch,
        severity,
        channel_id: sale.channel_id.clone(),
        order_id: sale.order_id.clone(),
        date: sale.date,
        amount_delta: delta,
        confidence: component_score(sale, payment, ctx).finish(),
        explanation: format!(
            "Tax on {} is {}, expected {expected} at {}%",
            sale.order_id,
            sale.tax_amount,
            (rate * Decimal::ONE_HUNDRED).normalize()
        ),
        suggested_action: "Recompute the tax (IVA) on the sale document".into(),
    })
}

fn check_net_invariant(sale: &SaleRecord, ctx: &EvalContext<'_>) -> Option<Discrepancy> {
    let tol = ctx.tolerance();
    let expected = sale.expected_net()?;
    let gap = sale.net_amount.checked_sub(expected)?.abs();
    if gap <= tol.net_epsilon {
        return None;
    }

    let severity = if gap > tol.absolute_floor || gap > tol.critical_threshold {
        Severity::High
    } else {
        Severity::Low
    };

    Some(Discrepancy {
        kind: DiscrepancyKind::NetInvariant,
        severity,
        channel_id: sale.channel_id.clone(),
        order_id: sale.order_id.clone(),
        date: sale.date,
        amount_delta: gap,
        // Arithmetic on the record itself; nothing to corroborate.
        confidence: 100,
        explanation: format!(
            "Net {} on {} differs from gross - commission - tax - refund = {expected}",
            sale.net_amount, sale.order_id
        ),
        suggested_action: "Correct the sale breakdown at the source channel".into(),
    })
}

// ---------------------------------------------------------------------------
// Flag rule + severity
// ---------------------------------------------------------------------------

/// `None` when the gap is within tolerance, else its severity. `base` must be
/// positive.
pub fn assess(delta: Decimal, base: Decimal, tol: &ToleranceConfig) -> Option<Severity> {
    let ratio = delta.checked_div(base)?;
    let relative = ratio > tol.tolerance_pct;
    let absolute = delta > tol.absolute_floor;
    if !relative && !absolute {
        return None;
    }

    let factors = [
        factor(ratio, tol.tolerance_pct),
        factor(delta, tol.absolute_floor),
    ];
    Some(severity_for(delta, &factors, tol))
}

/// Like [`assess`], but an expected component of zero is flagged once the
/// gap passes `net_epsilon`, with severity driven by the absolute floor only.
fn assess_component(delta: Decimal, base: Decimal, tol: &ToleranceConfig) -> Option<Severity> {
    if !base.is_zero() {
        return assess(delta, base, tol);
    }
    if delta <= tol.net_epsilon && delta <= tol.absolute_floor {
        return None;
    }
    Some(severity_for(delta, &[factor(delta, tol.absolute_floor)], tol))
}

/// How many thresholds past the limit; `None` drops the term (zero limit).
fn factor(value: Decimal, limit: Decimal) -> Option<Decimal> {
    if limit.is_zero() {
        return None;
    }
    value.checked_div(limit)
}

fn severity_for(delta: Decimal, factors: &[Option<Decimal>], tol: &ToleranceConfig) -> Severity {
    if delta > tol.critical_threshold {
        return Severity::High;
    }
    let worst = factors
        .iter()
        .flatten()
        .fold(Decimal::ZERO, |worst, f| worst.max(*f));
    if worst > tol.high_multiplier {
        Severity::High
    } else if worst > tol.medium_multiplier {
        Severity::Medium
    } else {
        Severity::Low
    }
}

fn percent(delta: Decimal, base: Decimal) -> Decimal {
    delta
        .checked_div(base)
        .and_then(|r| r.checked_mul(Decimal::ONE_HUNDRED))
        .map(|p| p.round_dp(2).normalize())
        .unwrap_or(Decimal::ZERO)
}

// ---------------------------------------------------------------------------
// Confidence
// ---------------------------------------------------------------------------

struct Score(u32);

impl Score {
    fn new(base: u32) -> Self {
        Self(base)
    }

    fn add(&mut self, weight: u32) {
        self.0 = self.0.saturating_add(weight);
    }

    fn finish(self) -> u8 {
        self.0.min(100) as u8
    }
}

fn date_signal(offset_days: i64, ctx: &EvalContext<'_>) -> u32 {
    let weights = &ctx.config.confidence;
    if offset_days == 0 {
        weights.date_exact
    } else if offset_days.unsigned_abs() <= u64::from(ctx.tolerance().lookback_days) {
        weights.date_within_window
    } else {
        0
    }
}

fn pair_confidence(pair: &MatchedPair, delta: Decimal, ctx: &EvalContext<'_>) -> u8 {
    let weights = &ctx.config.confidence;
    let mut score = Score::new(weights.key_match);
    score.add(date_signal(pair.date_offset_days, ctx));

    // A gap close to the channel's usual commission is probably an
    // unrecorded commission, which is a well-understood discrepancy.
    let rate = ctx
        .config
        .channel_rule(&pair.sale.channel_id)
        .and_then(|r| r.commission_rate);
    if let (Some(rate), false) = (rate, pair.sale.gross_amount.is_zero()) {
        if let Some(implied) = delta.checked_div(pair.sale.gross_amount.abs()) {
            if implied
                .checked_sub(rate)
                .is_some_and(|gap| gap.abs() <= weights.commission_proximity_band)
            {
                score.add(weights.commission_proximity);
            }
        }
    }

    score.finish()
}

fn component_score(sale: &SaleRecord, payment: Option<&PaymentRecord>, ctx: &EvalContext<'_>) -> Score {
    let weights = &ctx.config.confidence;
    match payment {
        Some(p) => {
            let mut score = Score::new(weights.key_match);
            score.add(date_signal((p.date - sale.date).num_days(), ctx));
            score
        }
        None => Score::new(weights.unmatched_base),
    }
}
