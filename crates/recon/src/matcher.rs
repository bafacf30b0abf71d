use std::cmp::Ordering;

use crate::model::{MatchResult, MatchedPair, PaymentRecord, SaleRecord};

/// Match sales to payments by exact `(channel_id, order_id)` ==
/// `(channel_id, reference_id)`.
///
/// Both sides are sorted by `(channel, key, date, input position)` and walked
/// in one merge pass, so the cost is dominated by the sorts.
///
/// When a key repeats on either side, the earliest sale pairs with the
/// earliest payment, the second with the second, and so on; any surplus
/// lands in the unmatched groups. Every input record ends up in exactly one
/// output group.
pub fn match_records(sales: &[SaleRecord], payments: &[PaymentRecord]) -> MatchResult {
    let mut sale_order: Vec<usize> = (0..sales.len()).collect();
    sale_order.sort_by(|&a, &b| {
        let (x, y) = (&sales[a], &sales[b]);
        (x.channel_id.as_str(), x.order_id.as_str(), x.date, a)
            .cmp(&(y.channel_id.as_str(), y.order_id.as_str(), y.date, b))
    });

    let mut payment_order: Vec<usize> = (0..payments.len()).collect();
    payment_order.sort_by(|&a, &b| {
        let (x, y) = (&payments[a], &payments[b]);
        (x.channel_id.as_str(), x.reference_id.as_str(), x.date, a)
            .cmp(&(y.channel_id.as_str(), y.reference_id.as_str(), y.date, b))
    });

    let mut result = MatchResult::default();
    let (mut si, mut pi) = (0, 0);

    while si < sale_order.len() && pi < payment_order.len() {
        let sale = &sales[sale_order[si]];
        let payment = &payments[payment_order[pi]];

        match sale_key(sale).cmp(&payment_key(payment)) {
            Ordering::Less => {
                result.unmatched_sales.push(sale.clone());
                si += 1;
            }
            Ordering::Greater => {
                result.unmatched_payments.push(payment.clone());
                pi += 1;
            }
            Ordering::Equal => {
                result.matched.push(MatchedPair {
                    sale: sale.clone(),
                    payment: payment.clone(),
                    date_offset_days: (payment.date - sale.date).num_days(),
                });
                si += 1;
                pi += 1;
            }
        }
    }

    result
        .unmatched_sales
        .extend(sale_order[si..].iter().map(|&i| sales[i].clone()));
    result
        .unmatched_payments
        .extend(payment_order[pi..].iter().map(|&i| payments[i].clone()));

    result
}

fn sale_key(sale: &SaleRecord) -> (&str, &str) {
    (sale.channel_id.as_str(), sale.order_id.as_str())
}

fn payment_key(payment: &PaymentRecord) -> (&str, &str) {
    (payment.channel_id.as_str(), payment.reference_id.as_str())
}
