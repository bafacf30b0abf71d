use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, info_span, warn};

use crate::config::ReconConfig;
use crate::error::ReconError;
use crate::evaluate::{evaluate, evaluate_components, EvalContext, Evaluation, Subject};
use crate::ingest::chunked;
use crate::matcher::match_records;
use crate::model::{Discrepancy, IssueSide, RawRow, ReconciliationReport, RunErrors};
use crate::normalize::normalize_in_chunks;
use crate::report::aggregate;

/// Cooperative cancellation handle. Clone it, hand one copy to the run and
/// call [`CancelToken::cancel`] from elsewhere; the run stops at the next
/// chunk boundary and returns [`ReconError::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn check(&self) -> Result<(), ReconError> {
        if self.is_cancelled() {
            Err(ReconError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Run a full reconciliation: normalize → match → evaluate → aggregate.
///
/// Either a complete report or a single fatal error; never a partial report.
pub fn reconcile(
    raw_sales: &[RawRow],
    raw_payments: &[RawRow],
    config: &ReconConfig,
) -> Result<ReconciliationReport, ReconError> {
    reconcile_with_cancel(raw_sales, raw_payments, config, &CancelToken::new())
}

/// Same as [`reconcile`], checking `cancel` between chunks of
/// `config.batch.chunk_size` items.
pub fn reconcile_with_cancel(
    raw_sales: &[RawRow],
    raw_payments: &[RawRow],
    config: &ReconConfig,
    cancel: &CancelToken,
) -> Result<ReconciliationReport, ReconError> {
    let span = info_span!("reconcile", name = %config.name);
    let _guard = span.enter();

    config.validate()?;
    let chunk_size = config.batch.chunk_size;

    let normalized = normalize_in_chunks(raw_sales, raw_payments, chunk_size, || cancel.check())?;
    let mut errors = normalized.errors;
    debug!(
        sales = normalized.sales.len(),
        payments = normalized.payments.len(),
        dropped = errors.dropped_sales + errors.dropped_payments,
        "normalized"
    );
    if errors.dropped_sales + errors.dropped_payments > 0 {
        warn!(
            dropped_sales = errors.dropped_sales,
            dropped_payments = errors.dropped_payments,
            "malformed rows dropped"
        );
    }

    let sales = normalized.sales;
    let payments = normalized.payments;

    cancel.check()?;
    let matches = match_records(&sales, &payments);
    debug!(
        matched = matches.matched.len(),
        unmatched_sales = matches.unmatched_sales.len(),
        unmatched_payments = matches.unmatched_payments.len(),
        "matched"
    );

    let ctx = EvalContext::new(config, &sales, &payments);
    let mut discrepancies = Vec::new();

    for chunk in chunked(&matches.matched, chunk_size) {
        cancel.check()?;
        for pair in chunk {
            let subject = Subject::Matched(pair);
            collect(evaluate(subject, &ctx), subject, &mut discrepancies, &mut errors);
            discrepancies.extend(evaluate_components(&pair.sale, Some(&pair.payment), &ctx));
        }
    }
    for chunk in chunked(&matches.unmatched_sales, chunk_size) {
        cancel.check()?;
        for sale in chunk {
            let subject = Subject::UnmatchedSale(sale);
            collect(evaluate(subject, &ctx), subject, &mut discrepancies, &mut errors);
            discrepancies.extend(evaluate_components(sale, None, &ctx));
        }
    }
    for chunk in chunked(&matches.unmatched_payments, chunk_size) {
        cancel.check()?;
        for payment in chunk {
            let subject = Subject::UnmatchedPayment(payment);
            collect(evaluate(subject, &ctx), subject, &mut discrepancies, &mut errors);
        }
    }

    if errors.skipped_evaluations > 0 {
        warn!(skipped = errors.skipped_evaluations, "evaluations skipped");
    }

    cancel.check()?;
    let report = aggregate(discrepancies, &sales, &payments, &matches, errors, config);
    info!(
        discrepancies = report.discrepancies.len(),
        alerts = report.alerts.len(),
        accuracy = %report.accuracy_rate,
        errors = report.errors.total(),
        "reconciliation complete"
    );

    Ok(report)
}

fn collect(
    evaluation: Evaluation,
    subject: Subject<'_>,
    discrepancies: &mut Vec<Discrepancy>,
    errors: &mut RunErrors,
) {
    match evaluation {
        Evaluation::Clean => {}
        Evaluation::Flagged(d) => discrepancies.push(d),
        Evaluation::Skipped(reason) => errors.record(IssueSide::Pair, subject.reference(), reason),
    }
}
