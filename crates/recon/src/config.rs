use std::collections::BTreeMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

use crate::error::ReconError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Business rules for one reconciliation run.
///
/// Read-only for the whole run, so a single `&ReconConfig` can be shared by
/// any number of concurrent runs (one per tenant, typically).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconConfig {
    pub name: String,
    pub tolerance: ToleranceConfig,
    pub confidence: ConfidenceWeights,
    /// Per-channel commission/tax expectations, keyed by `channel_id`.
    pub channels: BTreeMap<String, ChannelRule>,
    pub batch: BatchConfig,
}

impl Default for ReconConfig {
    fn default() -> Self {
        Self {
            name: "reconciliation".into(),
            tolerance: ToleranceConfig::default(),
            confidence: ConfidenceWeights::default(),
            channels: BTreeMap::new(),
            batch: BatchConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tolerance
// ---------------------------------------------------------------------------

/// Thresholds deciding when a monetary gap becomes a discrepancy.
///
/// Defaults follow the dashboard rules: a gap is flagged above 5% of the
/// expected amount or above $50,000 absolute, and $50,000 is also the
/// critical-alert line.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToleranceConfig {
    /// Relative tolerance as a fraction (0.05 = 5%). Exclusive.
    pub tolerance_pct: Decimal,
    /// Absolute floor; any delta strictly above it is flagged.
    pub absolute_floor: Decimal,
    /// High-severity discrepancies above this delta raise a critical alert.
    pub critical_threshold: Decimal,
    /// Date window (days) for date-proximity scoring and unmatched aging.
    pub lookback_days: u32,
    /// Allowed slack on `net = gross - commission - tax - refund`.
    pub net_epsilon: Decimal,
    /// Severity factor above which a discrepancy is `medium`.
    pub medium_multiplier: Decimal,
    /// Severity factor above which a discrepancy is `high`.
    pub high_multiplier: Decimal,
}

impl Default for ToleranceConfig {
    fn default() -> Self {
        Self {
            tolerance_pct: dec!(0.05),
            absolute_floor: dec!(50000),
            critical_threshold: dec!(50000),
            lookback_days: 3,
            net_epsilon: dec!(0.01),
            medium_multiplier: dec!(2),
            high_multiplier: dec!(3),
        }
    }
}

// ---------------------------------------------------------------------------
// Confidence weights
// ---------------------------------------------------------------------------

/// Weights of the heuristic confidence score. Each corroborating signal adds
/// its weight; the total is clamped to 0..=100.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfidenceWeights {
    /// Sale and payment share the exact `(channel_id, order_id)` key.
    pub key_match: u32,
    /// Sale and payment fall on the same calendar date.
    pub date_exact: u32,
    /// Dates differ but by no more than `lookback_days`.
    pub date_within_window: u32,
    /// Implied rate `delta / gross` sits near the channel's commission rate.
    pub commission_proximity: u32,
    /// Half-width of the band used by `commission_proximity` (fraction).
    pub commission_proximity_band: Decimal,
    /// Starting score for an unmatched sale.
    pub unmatched_base: u32,
    /// Starting score for an unmatched payment.
    pub unmatched_payment_base: u32,
    /// Added when the unmatched item is older than the lookback window.
    pub unmatched_aged: u32,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            key_match: 30,
            date_exact: 40,
            date_within_window: 20,
            commission_proximity: 30,
            commission_proximity_band: dec!(0.01),
            unmatched_base: 50,
            unmatched_payment_base: 40,
            unmatched_aged: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Channel rules + batching
// ---------------------------------------------------------------------------

/// Expected commission/tax behaviour of one sales channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelRule {
    /// Typical commission as a fraction of gross (0.13 = 13%).
    #[serde(default)]
    pub commission_rate: Option<Decimal>,
    /// Tax rate (0.19 for Chilean IVA).
    #[serde(default)]
    pub tax_rate: Option<Decimal>,
    /// Whether `gross_amount` already includes the tax.
    #[serde(default = "default_tax_inclusive")]
    pub tax_inclusive: bool,
}

fn default_tax_inclusive() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    /// Rows/items processed between cancellation checks.
    pub chunk_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { chunk_size: 100 }
    }
}

// ---------------------------------------------------------------------------
// Parse + Validate
// ---------------------------------------------------------------------------

impl ReconConfig {
    pub fn from_toml(input: &str) -> Result<Self, ReconError> {
        let config: ReconConfig =
            toml::from_str(input).map_err(|e| ReconError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ReconError> {
        let tol = &self.tolerance;

        check_fraction("tolerance.tolerance_pct", tol.tolerance_pct)?;
        check_non_negative("tolerance.absolute_floor", tol.absolute_floor)?;
        check_non_negative("tolerance.critical_threshold", tol.critical_threshold)?;
        check_non_negative("tolerance.net_epsilon", tol.net_epsilon)?;

        if tol.medium_multiplier < Decimal::ONE || tol.high_multiplier < tol.medium_multiplier {
            return Err(ReconError::ConfigValidation(format!(
                "severity multipliers must satisfy 1 <= medium ({}) <= high ({})",
                tol.medium_multiplier, tol.high_multiplier
            )));
        }

        check_fraction(
            "confidence.commission_proximity_band",
            self.confidence.commission_proximity_band,
        )?;

        for (channel, rule) in &self.channels {
            if let Some(rate) = rule.commission_rate {
                check_fraction(&format!("channels.{channel}.commission_rate"), rate)?;
            }
            if let Some(rate) = rule.tax_rate {
                check_fraction(&format!("channels.{channel}.tax_rate"), rate)?;
            }
        }

        if self.batch.chunk_size == 0 {
            return Err(ReconError::ConfigValidation(
                "batch.chunk_size must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Rule for a channel, if one is configured.
    pub fn channel_rule(&self, channel_id: &str) -> Option<&ChannelRule> {
        self.channels.get(channel_id)
    }
}

fn check_fraction(field: &str, value: Decimal) -> Result<(), ReconError> {
    if value < Decimal::ZERO || value > Decimal::ONE {
        return Err(ReconError::ConfigValidation(format!(
            "{field} must be between 0 and 1, got {value}"
        )));
    }
    Ok(())
}

fn check_non_negative(field: &str, value: Decimal) -> Result<(), ReconError> {
    if value < Decimal::ZERO {
        return Err(ReconError::ConfigValidation(format!(
            "{field} must not be negative, got {value}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
