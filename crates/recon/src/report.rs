//! Roll-up of a run into a [`ReconciliationReport`]: KPIs, per-channel
//! totals, ranked discrepancies and alerts.

use std::collections::BTreeMap;

use rust_decimal::Decimal;

use crate::config::ReconConfig;
use crate::model::{
    Alert, AlertKind, ChannelTotals, Discrepancy, MatchResult, PaymentRecord, ReconciliationReport,
    ReportSummary, RunErrors, SaleRecord, Severity,
};

/// Decimal places kept on rates (accuracy, discrepancy rate).
const RATE_DP: u32 = 4;

/// Build the report. Ranking is deterministic: identical inputs produce
/// identical reports, down to the serialized bytes.
pub fn aggregate(
    mut discrepancies: Vec<Discrepancy>,
    sales: &[SaleRecord],
    payments: &[PaymentRecord],
    matches: &MatchResult,
    errors: RunErrors,
    config: &ReconConfig,
) -> ReconciliationReport {
    let total_net_sales = total(sales.iter().map(|s| s.net_amount));
    let total_payments = total(payments.iter().map(|p| p.amount));
    let discrepant_amount = total(discrepancies.iter().map(|d| d.amount_delta));

    let groups = matches.matched.len() + matches.unmatched_sales.len() + matches.unmatched_payments.len();
    let discrepancy_rate = if groups == 0 {
        Decimal::ZERO
    } else {
        (Decimal::from(discrepancies.len()) / Decimal::from(groups)).round_dp(RATE_DP)
    };

    let mut by_kind: BTreeMap<String, usize> = BTreeMap::new();
    let mut by_severity: BTreeMap<String, usize> = BTreeMap::new();
    for d in &discrepancies {
        *by_kind.entry(d.kind.to_string()).or_insert(0) += 1;
        *by_severity.entry(d.severity.to_string()).or_insert(0) += 1;
    }

    let summary = ReportSummary {
        sale_count: sales.len(),
        payment_count: payments.len(),
        matched: matches.matched.len(),
        unmatched_sales: matches.unmatched_sales.len(),
        unmatched_payments: matches.unmatched_payments.len(),
        total_net_sales,
        total_payments,
        discrepant_amount,
        discrepancy_rate,
        by_kind,
        by_severity,
    };

    // Stable sorts: ties keep the evaluator's (key-ordered) output order.
    discrepancies.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| b.amount_delta.cmp(&a.amount_delta))
    });
    let alerts = build_alerts(&discrepancies, config);

    ReconciliationReport {
        name: config.name.clone(),
        engine_version: env!("CARGO_PKG_VERSION").to_string(),
        accuracy_rate: accuracy(discrepant_amount, total_net_sales),
        per_channel_totals: channel_totals(&discrepancies, sales, payments),
        summary,
        discrepancies,
        alerts,
        errors,
    }
}

/// `1 - discrepant / total`, clamped to [0, 1].
pub fn accuracy(discrepant: Decimal, total: Decimal) -> Decimal {
    if total <= Decimal::ZERO {
        return if discrepant.is_zero() {
            Decimal::ONE
        } else {
            Decimal::ZERO
        };
    }
    let rate = discrepant
        .checked_div(total)
        .and_then(|ratio| Decimal::ONE.checked_sub(ratio))
        .unwrap_or(Decimal::ZERO);
    rate.clamp(Decimal::ZERO, Decimal::ONE).round_dp(RATE_DP)
}

/// Saturating sum. Normalized amounts are bounded far below `Decimal::MAX`,
/// so saturation only guards records built outside the normalizer.
fn total(amounts: impl Iterator<Item = Decimal>) -> Decimal {
    amounts.fold(Decimal::ZERO, Decimal::saturating_add)
}

fn channel_totals(
    discrepancies: &[Discrepancy],
    sales: &[SaleRecord],
    payments: &[PaymentRecord],
) -> BTreeMap<String, ChannelTotals> {
    let mut totals: BTreeMap<String, ChannelTotals> = BTreeMap::new();

    for s in sales {
        let entry = totals.entry(s.channel_id.clone()).or_default();
        entry.sale_count += 1;
        entry.net_sales = entry.net_sales.saturating_add(s.net_amount);
    }
    for p in payments {
        let entry = totals.entry(p.channel_id.clone()).or_default();
        entry.payments_total = entry.payments_total.saturating_add(p.amount);
    }
    for d in discrepancies {
        let entry = totals.entry(d.channel_id.clone()).or_default();
        entry.discrepancy_amount = entry.discrepancy_amount.saturating_add(d.amount_delta);
        entry.discrepancy_count += 1;
    }
    for entry in totals.values_mut() {
        entry.accuracy_rate = accuracy(entry.discrepancy_amount, entry.net_sales);
    }

    totals
}

/// Critical: high severity above the critical threshold. Warning: high
/// severity at or below it, or medium severity above it. Largest first.
fn build_alerts(ranked: &[Discrepancy], config: &ReconConfig) -> Vec<Alert> {
    let threshold = config.tolerance.critical_threshold;

    let mut alerts: Vec<Alert> = ranked
        .iter()
        .filter_map(|d| {
            let kind = match d.severity {
                Severity::High if d.amount_delta > threshold => AlertKind::Critical,
                Severity::High => AlertKind::Warning,
                Severity::Medium if d.amount_delta > threshold => AlertKind::Warning,
                _ => return None,
            };
            let label = match kind {
                AlertKind::Critical => "Critical",
                AlertKind::Warning => "Warning",
            };
            Some(Alert {
                kind,
                channel_id: d.channel_id.clone(),
                order_id: d.order_id.clone(),
                amount_delta: d.amount_delta,
                message: format!(
                    "{label}: {} of {} on {} order {}",
                    d.kind, d.amount_delta, d.channel_id, d.order_id
                ),
                action: d.suggested_action.clone(),
            })
        })
        .collect();

    alerts.sort_by(|a, b| b.amount_delta.cmp(&a.amount_delta));
    alerts
}
