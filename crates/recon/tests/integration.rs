use marketplace_recon::config::ReconConfig;
use marketplace_recon::ingest::load_csv_rows;
use marketplace_recon::matcher::match_records;
use marketplace_recon::model::{AlertKind, DiscrepancyKind, RawRow, Severity};
use marketplace_recon::normalize::normalize;
use marketplace_recon::{reconcile, reconcile_with_cancel, CancelToken, ReconError};
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn sale(channel: &str, id: &str, net: &str) -> RawRow {
    RawRow::new()
        .with("order_id", id)
        .with("channel_id", channel)
        .with("date", "2026-03-02")
        .with("net_amount", net)
}

fn payment(channel: &str, id: &str, amount: &str) -> RawRow {
    RawRow::new()
        .with("reference_id", id)
        .with("channel_id", channel)
        .with("date", "2026-03-02")
        .with("amount", amount)
}

// -------------------------------------------------------------------------
// Worked scenarios
// -------------------------------------------------------------------------

#[test]
fn short_payment_over_tolerance_is_low() {
    let report = reconcile(
        &[sale("ml", "A1", "100.00")],
        &[payment("ml", "A1", "94.00")],
        &ReconConfig::default(),
    )
    .unwrap();

    assert_eq!(report.discrepancies.len(), 1);
    let d = &report.discrepancies[0];
    assert_eq!(d.kind, DiscrepancyKind::ToleranceExceeded);
    assert_eq!(d.severity, Severity::Low);
    assert_eq!(d.amount_delta, dec!(6.00));
    assert!(report.alerts.is_empty());
}

#[test]
fn sale_without_payment_is_high() {
    let report = reconcile(&[sale("ml", "A2", "50.00")], &[], &ReconConfig::default()).unwrap();

    assert_eq!(report.discrepancies.len(), 1);
    let d = &report.discrepancies[0];
    assert_eq!(d.kind, DiscrepancyKind::Unmatched);
    assert_eq!(d.severity, Severity::High);
    assert_eq!(d.amount_delta, dec!(50.00));
    assert_eq!(report.accuracy_rate, Decimal::ZERO);
}

#[test]
fn all_within_tolerance_is_fully_accurate() {
    let report = reconcile(
        &[sale("ml", "A1", "100.00"), sale("falabella", "F1", "200.00")],
        &[payment("ml", "A1", "98.00"), payment("falabella", "F1", "200.00")],
        &ReconConfig::default(),
    )
    .unwrap();

    assert_eq!(report.accuracy_rate, Decimal::ONE);
    assert!(report.discrepancies.is_empty());
    assert!(report.alerts.is_empty());
    assert_eq!(report.summary.matched, 2);
    assert_eq!(report.per_channel_totals.len(), 2);
}

#[test]
fn large_unmatched_sale_raises_critical_alert() {
    let config = ReconConfig::from_toml("[tolerance]\ncritical_threshold = 50000\n").unwrap();
    let report = reconcile(&[sale("ml", "BIG", "75000")], &[], &config).unwrap();

    assert_eq!(report.alerts.len(), 1);
    assert_eq!(report.alerts[0].kind, AlertKind::Critical);
    assert_eq!(report.alerts[0].amount_delta, dec!(75000));
    assert_eq!(report.alerts[0].order_id, "BIG");
}

#[test]
fn large_matched_gap_raises_critical_alert() {
    // 7.5% short: inside the severity ladder's low band, but 75,000 is past the threshold
    let report = reconcile(
        &[sale("ml", "BIG", "1000000")],
        &[payment("ml", "BIG", "925000")],
        &ReconConfig::default(),
    )
    .unwrap();

    assert_eq!(report.discrepancies.len(), 1);
    assert_eq!(report.discrepancies[0].kind, DiscrepancyKind::ToleranceExceeded);
    assert_eq!(report.discrepancies[0].severity, Severity::High);
    assert_eq!(report.alerts.len(), 1);
    assert_eq!(report.alerts[0].kind, AlertKind::Critical);
    assert_eq!(report.alerts[0].amount_delta, dec!(75000));
}

#[test]
fn processor_fee_alone_is_not_a_commission_mismatch() {
    let report = reconcile(
        &[sale("ml", "A1", "100.00")],
        &[payment("ml", "A1", "100.00").with("fee_amount", "5.00")],
        &ReconConfig::default(),
    )
    .unwrap();

    assert!(report.discrepancies.is_empty());
    assert!(report.alerts.is_empty());
}

#[test]
fn unmatched_payment_is_medium() {
    let report = reconcile(
        &[sale("ml", "A1", "10")],
        &[payment("ml", "A1", "10"), payment("ml", "ZZ", "30")],
        &ReconConfig::default(),
    )
    .unwrap();

    assert_eq!(report.discrepancies.len(), 1);
    assert_eq!(report.discrepancies[0].severity, Severity::Medium);
    assert_eq!(report.discrepancies[0].order_id, "ZZ");
    assert_eq!(report.summary.unmatched_payments, 1);
}

// -------------------------------------------------------------------------
// CSV + channel rules
// -------------------------------------------------------------------------

const SALES_CSV: &str = "\
order_id,channel,date,gross_amount,commission_amount,tax_amount,net_amount
ML-1001,MercadoLibre,2026-03-01,\"$ 119.000\",\"$ 15.470\",\"$ 19.000\",\"$ 84.530\"
ML-1002,MercadoLibre,02/03/2026,\"$ 59.500\",\"$ 7.735\",\"$ 9.500\",\"$ 42.265\"
ML-1003,MercadoLibre,not-a-date,1000,0,0,1000
FA-2001,Falabella,2026-03-02,\"$ 238.000\",\"$ 23.800\",\"$ 38.000\",\"$ 176.200\"
";

const PAYMENTS_CSV: &str = "\
reference_id,channel,payment_date,amount,fee_amount
ML-1001,mercadolibre,2026-03-03,84530,15470
ML-1002,mercadolibre,2026-03-04,30000,7735
FA-2001,falabella,2026-03-05,176200,23800
FA-9999,falabella,2026-03-05,5000,0
";

const RULES: &str = r#"
name = "Tienda Demo"

[channels.mercadolibre]
commission_rate = 0.13
tax_rate = 0.19

[channels.falabella]
commission_rate = 0.10
tax_rate = 0.19
"#;

#[test]
fn csv_upload_end_to_end() {
    let config = ReconConfig::from_toml(RULES).unwrap();
    let sales = load_csv_rows(SALES_CSV).unwrap();
    let payments = load_csv_rows(PAYMENTS_CSV).unwrap();
    let report = reconcile(&sales, &payments, &config).unwrap();

    assert_eq!(report.name, "Tienda Demo");
    assert_eq!(report.errors.dropped_sales, 1);
    assert!(report.errors.issues[0].reference.contains("ML-1003"));

    assert_eq!(report.summary.matched, 3);
    assert_eq!(report.summary.unmatched_payments, 1);

    // ML-1002 settled 30,000 of 42,265: ~29% short, 5.8x tolerance
    let short = report
        .discrepancies
        .iter()
        .find(|d| d.order_id == "ML-1002")
        .unwrap();
    assert_eq!(short.kind, DiscrepancyKind::ToleranceExceeded);
    assert_eq!(short.severity, Severity::High);
    assert_eq!(short.amount_delta, dec!(12265));

    // Falabella charged 10% commission on 238,000 exactly as configured
    assert!(!report
        .discrepancies
        .iter()
        .any(|d| d.order_id == "FA-2001"));

    let stray = report
        .discrepancies
        .iter()
        .find(|d| d.order_id == "FA-9999")
        .unwrap();
    assert_eq!(stray.severity, Severity::Medium);

    assert_eq!(report.discrepancies.len(), 2);
    assert_eq!(report.discrepancies[0].order_id, "ML-1002");
    // High but under the critical threshold
    assert_eq!(report.alerts.len(), 1);
    assert_eq!(report.alerts[0].kind, AlertKind::Warning);

    let ml = &report.per_channel_totals["mercadolibre"];
    assert_eq!(ml.sale_count, 2);
    assert_eq!(ml.net_sales, dec!(126795));
}

#[test]
fn commission_overcharge_is_reported() {
    let config = ReconConfig::from_toml(RULES).unwrap();
    let sales = vec![RawRow::new()
        .with("order_id", "ML-1")
        .with("channel", "mercadolibre")
        .with("date", "2026-03-02")
        .with("gross", 100000)
        .with("commission", 20000)
        .with("iva", "15966.39")
        .with("net", "64033.61")];
    let payments = vec![payment("mercadolibre", "ML-1", "64033.61")];
    let report = reconcile(&sales, &payments, &config).unwrap();

    assert_eq!(report.discrepancies.len(), 1);
    let d = &report.discrepancies[0];
    assert_eq!(d.kind, DiscrepancyKind::CommissionMismatch);
    assert_eq!(d.amount_delta, dec!(7000));
    assert_eq!(d.severity, Severity::High);
}

#[test]
fn report_serializes_to_json() {
    let report = reconcile(
        &[sale("ml", "A1", "100.00")],
        &[payment("ml", "A1", "94.00")],
        &ReconConfig::default(),
    )
    .unwrap();
    let json = report.to_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["discrepancies"][0]["kind"], "tolerance_exceeded");
    assert_eq!(value["discrepancies"][0]["amount_delta"], "6.00");
    assert_eq!(value["per_channel_totals"]["ml"]["sale_count"], 1);
    assert_eq!(value["errors"]["skipped_evaluations"], 0);
}

// -------------------------------------------------------------------------
// Fatal errors + cancellation
// -------------------------------------------------------------------------

#[test]
fn bad_amounts_are_dropped_not_fatal() {
    let sales = vec![
        sale("ml", "A1", "100"),
        sale("ml", "MAX", "79228162514264337593543950335"),
        sale("ml", "SCI", "1").with("net_amount", 5e28),
        sale("ml", "TXT", "12abc34"),
    ];
    let payments = vec![
        payment("ml", "A1", "100"),
        payment("ml", "NEG", "-79228162514264337593543950335"),
    ];
    let report = reconcile(&sales, &payments, &ReconConfig::default()).unwrap();

    assert_eq!(report.errors.dropped_sales, 3);
    assert_eq!(report.errors.dropped_payments, 1);
    assert_eq!(report.summary.matched, 1);
    assert!(report.discrepancies.is_empty());
    assert_eq!(report.accuracy_rate, Decimal::ONE);
}

#[test]
fn compact_dates_are_calendar_dates() {
    let sales = vec![sale("ml", "A1", "100").with("date", "20260302")];
    let payments = vec![payment("ml", "A1", "90").with("date", "20260302")];
    let report = reconcile(&sales, &payments, &ReconConfig::default()).unwrap();

    assert_eq!(report.discrepancies[0].date.to_string(), "2026-03-02");
    // key + same-day signal
    assert_eq!(report.discrepancies[0].confidence, 70);
}

#[test]
fn empty_input_is_invalid() {
    let err = reconcile(&[], &[], &ReconConfig::default()).unwrap_err();
    assert_eq!(err.kind(), "invalid_input");
}

#[test]
fn unrecognizable_input_is_invalid() {
    let rows = load_csv_rows("sku,qty\nX,1\n").unwrap();
    let err = reconcile(&rows, &[], &ReconConfig::default()).unwrap_err();
    assert!(matches!(err, ReconError::InvalidInput(_)));
}

#[test]
fn cancelled_run_returns_no_report() {
    let sales: Vec<RawRow> = (0..250).map(|i| sale("ml", &format!("A{i}"), "10")).collect();
    let token = CancelToken::new();
    token.cancel();
    let err = reconcile_with_cancel(&sales, &[], &ReconConfig::default(), &token).unwrap_err();
    assert!(matches!(err, ReconError::Cancelled));
}

#[test]
fn concurrent_runs_share_config() {
    let config = ReconConfig::default();
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let config = &config;
                scope.spawn(move || {
                    let id = format!("T{t}");
                    reconcile(&[sale("ml", &id, "100")], &[payment("ml", &id, "90")], config)
                })
            })
            .collect();
        for h in handles {
            let report = h.join().unwrap().unwrap();
            assert_eq!(report.discrepancies.len(), 1);
        }
    });
}

// -------------------------------------------------------------------------
// Properties
// -------------------------------------------------------------------------

fn arb_rows() -> impl Strategy<Value = (Vec<RawRow>, Vec<RawRow>)> {
    let sale_row = (0..2usize, 0..6u8, 1..100_000i64, 1..28u32).prop_map(|(ch, id, cents, day)| {
        RawRow::new()
            .with("order_id", format!("O{id}"))
            .with("channel_id", ["ml", "paris"][ch])
            .with("date", format!("2026-03-{day:02}"))
            .with("net_amount", Decimal::new(cents, 2).to_string())
    });
    let payment_row = (0..2usize, 0..6u8, 1..100_000i64, 1..28u32).prop_map(|(ch, id, cents, day)| {
        RawRow::new()
            .with("reference_id", format!("O{id}"))
            .with("channel_id", ["ml", "paris"][ch])
            .with("date", format!("2026-03-{day:02}"))
            .with("amount", Decimal::new(cents, 2).to_string())
    });
    (
        prop::collection::vec(sale_row, 1..20),
        prop::collection::vec(payment_row, 0..20),
    )
}

proptest! {
    #[test]
    fn identical_input_gives_identical_report((sales, payments) in arb_rows()) {
        let config = ReconConfig::default();
        let a = reconcile(&sales, &payments, &config).unwrap().to_json().unwrap();
        let b = reconcile(&sales, &payments, &config).unwrap().to_json().unwrap();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn matcher_places_every_record_once((sales, payments) in arb_rows()) {
        let normalized = normalize(&sales, &payments).unwrap();
        let out = match_records(&normalized.sales, &normalized.payments);
        prop_assert_eq!(out.matched.len() + out.unmatched_sales.len(), normalized.sales.len());
        prop_assert_eq!(out.matched.len() + out.unmatched_payments.len(), normalized.payments.len());
    }

    #[test]
    fn unflagged_pairs_are_within_tolerance((sales, payments) in arb_rows()) {
        let config = ReconConfig::default();
        let normalized = normalize(&sales, &payments).unwrap();
        let out = match_records(&normalized.sales, &normalized.payments);
        let report = reconcile(&sales, &payments, &config).unwrap();
        for pair in &out.matched {
            let flagged = report.discrepancies.iter().any(|d| {
                d.kind == DiscrepancyKind::ToleranceExceeded
                    && d.order_id == pair.sale.order_id
                    && d.channel_id == pair.sale.channel_id
            });
            if !flagged {
                let delta = (pair.sale.net_amount - pair.payment.amount).abs();
                prop_assert!(delta <= pair.sale.net_amount * config.tolerance.tolerance_pct);
            }
        }
    }

    #[test]
    fn raising_tolerance_never_adds_discrepancies(
        (sales, payments) in arb_rows(),
        low in 0..50u32,
        extra in 0..50u32,
    ) {
        let mut tight = ReconConfig::default();
        tight.tolerance.tolerance_pct = Decimal::new(i64::from(low), 2);
        let mut loose = tight.clone();
        loose.tolerance.tolerance_pct = Decimal::new(i64::from(low + extra), 2);

        let tight_report = reconcile(&sales, &payments, &tight).unwrap();
        let loose_report = reconcile(&sales, &payments, &loose).unwrap();
        prop_assert!(loose_report.discrepancies.len() <= tight_report.discrepancies.len());
    }
}
