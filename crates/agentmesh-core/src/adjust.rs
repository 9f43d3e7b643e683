//! Rebalance math: turn current balances and target weights into signed
//! per-asset adjustments and the mint/burn actions that realize them.
//!
//! Every rebalance is relative to present holdings, never to cost basis.

use std::collections::BTreeMap;

use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::AdjustError;
use crate::types::{Balances, Weights};

/// Adjustments smaller than this (in absolute value) are not executed.
pub const MIN_ACTIONABLE: Decimal = Decimal::ONE;

/// Ledger action needed to apply one adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerAction {
    Mint(Decimal),
    Burn(Decimal),
}

/// Sum of all current balances.
pub fn total_value(balances: &Balances) -> Result<Decimal, AdjustError> {
    balances
        .values()
        .try_fold(Decimal::ZERO, |acc, v| acc.checked_add(*v))
        .ok_or(AdjustError::TotalOverflow)
}

/// `adjustment[asset] = round(total * weight[asset] - balance[asset])`.
///
/// Only assets named in `weights` get an entry; an asset the proposal does
/// not mention is left alone. Assets with no current balance count as zero.
/// Midpoints round away from zero. Fails if any intermediate value leaves
/// the `Decimal` range.
pub fn compute_adjustments(
    balances: &Balances,
    weights: &Weights,
) -> Result<BTreeMap<String, Decimal>, AdjustError> {
    let total = total_value(balances)?;
    weights
        .iter()
        .map(|(asset, weight)| {
            let current = balances.get(asset).copied().unwrap_or_default();
            let delta = total
                .checked_mul(*weight)
                .and_then(|target| target.checked_sub(current))
                .ok_or_else(|| AdjustError::Overflow(asset.clone()))?
                .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
            Ok((asset.clone(), delta.normalize()))
        })
        .collect()
}

/// Map each actionable adjustment (`|adjustment| >= 1`) to a ledger action.
pub fn plan_actions(adjustments: &BTreeMap<String, Decimal>) -> Vec<(String, LedgerAction)> {
    adjustments
        .iter()
        .filter(|(_, delta)| delta.abs() >= MIN_ACTIONABLE)
        .map(|(asset, delta)| {
            let action = if delta.is_sign_positive() {
                LedgerAction::Mint(*delta)
            } else {
                LedgerAction::Burn(delta.abs())
            };
            (asset.clone(), action)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn map(entries: &[(&str, Decimal)]) -> BTreeMap<String, Decimal> {
        entries.iter().map(|(k, v)| ((*k).to_owned(), *v)).collect()
    }

    #[test]
    fn adjustments_follow_present_holdings() {
        let balances = map(&[("A", dec!(100)), ("B", dec!(200)), ("C", dec!(300))]);
        let weights = map(&[("A", dec!(0.5)), ("B", dec!(0.3)), ("C", dec!(0.2))]);

        let adj = compute_adjustments(&balances, &weights).expect("adjust");
        assert_eq!(adj, map(&[("A", dec!(200)), ("B", dec!(-20)), ("C", dec!(-180))]));
    }

    #[test]
    fn missing_balance_counts_as_zero() {
        let balances = map(&[("A", dec!(100))]);
        let weights = map(&[("A", dec!(0.5)), ("B", dec!(0.5))]);

        let adj = compute_adjustments(&balances, &weights).expect("adjust");
        assert_eq!(adj["A"], dec!(-50));
        assert_eq!(adj["B"], dec!(50));
    }

    #[test]
    fn unmentioned_assets_are_untouched() {
        let balances = map(&[("A", dec!(100)), ("B", dec!(100))]);
        let weights = map(&[("A", dec!(1))]);

        let adj = compute_adjustments(&balances, &weights).expect("adjust");
        assert_eq!(adj.len(), 1);
        assert_eq!(adj["A"], dec!(100));
    }

    #[test]
    fn midpoint_rounds_away_from_zero() {
        // total 3, target for A = 1.5 - 0 = 1.5 → 2; B = 1.5 - 3 = -1.5 → -2
        let balances = map(&[("B", dec!(3))]);
        let weights = map(&[("A", dec!(0.5)), ("B", dec!(0.5))]);

        let adj = compute_adjustments(&balances, &weights).expect("adjust");
        assert_eq!(adj["A"], dec!(2));
        assert_eq!(adj["B"], dec!(-2));
    }

    #[test]
    fn plan_skips_sub_unit_adjustments() {
        let adj = map(&[("A", dec!(200)), ("B", dec!(-20)), ("C", dec!(0))]);
        let plan = plan_actions(&adj);
        assert_eq!(
            plan,
            vec![
                ("A".to_owned(), LedgerAction::Mint(dec!(200))),
                ("B".to_owned(), LedgerAction::Burn(dec!(20))),
            ]
        );
    }

    #[test]
    fn empty_portfolio_produces_no_actions() {
        let adj = compute_adjustments(&Balances::new(), &map(&[("A", dec!(1))])).expect("adjust");
        assert_eq!(adj["A"], dec!(0));
        assert!(plan_actions(&adj).is_empty());
    }

    #[test]
    fn oversized_weight_is_an_error() {
        let balances = map(&[("A", Decimal::from(10_000_000_000u64))]);
        let weights = map(&[("A", Decimal::from(10_000_000_000_000_000_000u64))]);

        assert_eq!(
            compute_adjustments(&balances, &weights),
            Err(AdjustError::Overflow("A".to_owned()))
        );
    }

    #[test]
    fn overflowing_total_is_an_error() {
        let balances = map(&[("A", Decimal::MAX), ("B", Decimal::MAX)]);
        let weights = map(&[("A", dec!(0.5))]);

        assert_eq!(
            compute_adjustments(&balances, &weights),
            Err(AdjustError::TotalOverflow)
        );
    }

    proptest! {
        #[test]
        fn applying_adjustments_lands_within_half_unit(
            a in 0u32..1_000_000,
            b in 0u32..1_000_000,
            wa in 0u32..=100,
        ) {
            let balances = map(&[("A", Decimal::from(a)), ("B", Decimal::from(b))]);
            let weight_a = Decimal::new(i64::from(wa), 2);
            let weights = map(&[("A", weight_a), ("B", Decimal::ONE - weight_a)]);
            let total = total_value(&balances).expect("total");

            let adj = compute_adjustments(&balances, &weights).expect("adjust");
            for (asset, weight) in &weights {
                let landed = balances[asset] + adj[asset];
                let target = total * weight;
                prop_assert!((landed - target).abs() <= dec!(0.5));
            }
        }
    }
}
