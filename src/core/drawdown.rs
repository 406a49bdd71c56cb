use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::error::{Result, SimError};
use super::math::round_to_cents;
use super::types::{Allocation, AssetBalances, AssetClass, Cents};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlidePathWaypoint {
    /// 1-based simulation year.
    pub year: u32,
    pub allocation: Allocation,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum DrawdownStrategy {
    Bucket {
        order: Vec<AssetClass>,
    },
    Rebalancing {
        target_allocation: Allocation,
        #[serde(default)]
        glide_path: Vec<GlidePathWaypoint>,
    },
}

impl Default for DrawdownStrategy {
    fn default() -> Self {
        DrawdownStrategy::Bucket {
            order: vec![AssetClass::Cash, AssetClass::Bonds, AssetClass::Stocks],
        }
    }
}

impl DrawdownStrategy {
    pub fn validate(&self) -> Result<()> {
        match self {
            DrawdownStrategy::Bucket { order } => {
                if order.is_empty() {
                    return Err(SimError::InvalidConfig(
                        "bucket order must name at least one asset class".to_string(),
                    ));
                }
                let unique = order.iter().collect::<HashSet<_>>();
                if unique.len() != order.len() {
                    return Err(SimError::InvalidConfig(
                        "bucket order must not repeat an asset class".to_string(),
                    ));
                }
                Ok(())
            }
            DrawdownStrategy::Rebalancing {
                target_allocation,
                glide_path,
            } => {
                let allocations = std::iter::once(target_allocation)
                    .chain(glide_path.iter().map(|w| &w.allocation));
                for allocation in allocations {
                    let weights = [allocation.stocks, allocation.bonds, allocation.cash];
                    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
                        return Err(SimError::InvalidConfig(
                            "allocation weights must be finite and non-negative".to_string(),
                        ));
                    }
                }
                Ok(())
            }
        }
    }
}

/// Linear interpolation between waypoints sorted by year; constant outside the path.
pub fn interpolate_glide_path(waypoints: &[GlidePathWaypoint], year: u32) -> Option<Allocation> {
    let mut sorted = waypoints.to_vec();
    sorted.sort_by_key(|waypoint| waypoint.year);

    let first = sorted.first()?;
    let last = sorted.last()?;
    if year <= first.year {
        return Some(first.allocation.normalized());
    }
    if year >= last.year {
        return Some(last.allocation.normalized());
    }

    sorted.windows(2).find_map(|pair| {
        let (a, b) = (&pair[0], &pair[1]);
        if year < a.year || year > b.year {
            return None;
        }
        if b.year == a.year {
            return Some(a.allocation.normalized());
        }
        let t = (year - a.year) as f64 / (b.year - a.year) as f64;
        Some(
            a.allocation
                .normalized()
                .lerp(&b.allocation.normalized(), t)
                .normalized(),
        )
    })
}

/// Target allocation in force for `year`.
pub fn resolve_allocation(
    target_allocation: &Allocation,
    glide_path: &[GlidePathWaypoint],
    year: u32,
) -> Allocation {
    interpolate_glide_path(glide_path, year).unwrap_or_else(|| target_allocation.normalized())
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DrawdownOutcome {
    pub balances: AssetBalances,
    pub withdrawn_by_asset: AssetBalances,
    pub total_withdrawn: Cents,
    pub shortfall: Cents,
}

struct Draw {
    balances: AssetBalances,
    withdrawn: AssetBalances,
    remaining: Cents,
}

impl Draw {
    fn new(balances: AssetBalances, requested: Cents) -> Self {
        Self {
            balances,
            withdrawn: AssetBalances::default(),
            remaining: requested,
        }
    }

    /// Takes up to `limit` from `asset`, never more than its balance or the remaining request.
    fn take(&mut self, asset: AssetClass, limit: Cents) -> Cents {
        let available = self.balances.get(asset).max(0);
        let amount = limit.min(available).min(self.remaining).max(0);
        *self.balances.get_mut(asset) -= amount;
        *self.withdrawn.get_mut(asset) += amount;
        self.remaining -= amount;
        amount
    }

    fn finish(self, requested: Cents) -> DrawdownOutcome {
        DrawdownOutcome {
            balances: self.balances,
            withdrawn_by_asset: self.withdrawn,
            total_withdrawn: requested - self.remaining,
            shortfall: self.remaining,
        }
    }
}

/// Funds `requested` from `balances`. Unmet remainder is reported as shortfall.
pub fn apply_drawdown(
    balances: AssetBalances,
    requested: Cents,
    strategy: &DrawdownStrategy,
    year: u32,
) -> DrawdownOutcome {
    let requested = requested.max(0);
    let mut draw = Draw::new(balances, requested);
    if requested == 0 {
        return draw.finish(requested);
    }

    match strategy {
        DrawdownStrategy::Bucket { order } => {
            for asset in order {
                if draw.remaining == 0 {
                    break;
                }
                draw.take(*asset, Cents::MAX);
            }
        }
        DrawdownStrategy::Rebalancing {
            target_allocation,
            glide_path,
        } => {
            let target = resolve_allocation(target_allocation, glide_path, year);
            draw_overweight_first(&mut draw, &target);
            draw_proportionally(&mut draw);
        }
    }

    draw.finish(requested)
}

fn draw_overweight_first(draw: &mut Draw, target: &Allocation) {
    let total = draw.balances.total() as f64;
    let mut overweight = AssetClass::ALL
        .iter()
        .map(|asset| {
            let excess = draw.balances.get(*asset) as f64 - target.get(*asset) * total;
            (*asset, round_to_cents(excess.max(0.0)))
        })
        .filter(|(_, excess)| *excess > 0)
        .collect::<Vec<_>>();
    overweight.sort_by(|a, b| b.1.cmp(&a.1));

    for (asset, excess) in overweight {
        if draw.remaining == 0 {
            break;
        }
        draw.take(asset, excess);
    }
}

fn draw_proportionally(draw: &mut Draw) {
    while draw.remaining > 0 {
        let available = draw.balances.total();
        if available <= 0 {
            break;
        }

        let pass_request = draw.remaining as f64;
        let mut progress = 0;
        for asset in AssetClass::ALL {
            let balance = draw.balances.get(asset);
            if balance <= 0 || draw.remaining == 0 {
                continue;
            }
            let share = round_to_cents(pass_request * balance as f64 / available as f64);
            progress += draw.take(asset, share);
        }

        // Rounding can leave every share at zero; the largest balance absorbs the rest.
        // Ties go to the later class in stocks, bonds, cash order.
        if progress == 0 {
            let largest = AssetClass::ALL
                .iter()
                .copied()
                .max_by_key(|asset| draw.balances.get(*asset))
                .unwrap_or(AssetClass::Cash);
            draw.take(largest, Cents::MAX);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::{prop_assert, prop_assert_eq, proptest};

    fn rebalancing(target: Allocation) -> DrawdownStrategy {
        DrawdownStrategy::Rebalancing {
            target_allocation: target,
            glide_path: Vec::new(),
        }
    }

    #[test]
    fn bucket_depletes_in_configured_order() {
        let strategy = DrawdownStrategy::Bucket {
            order: vec![AssetClass::Cash, AssetClass::Bonds, AssetClass::Stocks],
        };
        let outcome = apply_drawdown(
            AssetBalances::new(80_000, 50_000, 20_000),
            90_000,
            &strategy,
            1,
        );
        assert_eq!(outcome.withdrawn_by_asset, AssetBalances::new(20_000, 50_000, 20_000));
        assert_eq!(outcome.balances, AssetBalances::new(60_000, 0, 0));
        assert_eq!(outcome.total_withdrawn, 90_000);
        assert_eq!(outcome.shortfall, 0);
    }

    #[test]
    fn bucket_reports_shortfall_without_touching_unlisted_assets() {
        let strategy = DrawdownStrategy::Bucket {
            order: vec![AssetClass::Cash, AssetClass::Bonds],
        };
        let outcome = apply_drawdown(AssetBalances::new(500, 100, 50), 400, &strategy, 1);
        assert_eq!(outcome.withdrawn_by_asset, AssetBalances::new(0, 100, 50));
        assert_eq!(outcome.shortfall, 250);
        assert_eq!(outcome.balances.stocks, 500);
    }

    #[test]
    fn rebalancing_funds_overweight_assets_first() {
        let outcome = apply_drawdown(
            AssetBalances::new(700_000, 200_000, 100_000),
            200_000,
            &rebalancing(Allocation::new(0.5, 0.3, 0.2)),
            1,
        );
        assert_eq!(outcome.withdrawn_by_asset, AssetBalances::new(200_000, 0, 0));
        assert_eq!(outcome.shortfall, 0);
    }

    #[test]
    fn rebalancing_spreads_remainder_proportionally() {
        let outcome = apply_drawdown(
            AssetBalances::new(600_000, 300_000, 100_000),
            100_000,
            &rebalancing(Allocation::new(0.6, 0.3, 0.1)),
            1,
        );
        assert_eq!(outcome.withdrawn_by_asset, AssetBalances::new(60_000, 30_000, 10_000));
        assert_eq!(outcome.total_withdrawn, 100_000);
    }

    #[test]
    fn rebalancing_reports_shortfall_only_when_everything_is_spent() {
        let outcome = apply_drawdown(
            AssetBalances::new(100, 50, 25),
            1_000,
            &rebalancing(Allocation::default()),
            1,
        );
        assert_eq!(outcome.balances, AssetBalances::default());
        assert_eq!(outcome.total_withdrawn, 175);
        assert_eq!(outcome.shortfall, 825);
    }

    #[test]
    fn rebalancing_single_cent_remainder_terminates() {
        let outcome = apply_drawdown(
            AssetBalances::new(1, 1, 1),
            2,
            &rebalancing(Allocation::new(1.0, 1.0, 1.0)),
            1,
        );
        assert_eq!(outcome.total_withdrawn, 2);
        assert_eq!(outcome.balances.total(), 1);
    }

    #[test]
    fn rebalancing_stalemate_draws_from_the_largest_balance() {
        let outcome = apply_drawdown(
            AssetBalances::new(100, 100, 100),
            1,
            &rebalancing(Allocation::new(1.0, 1.0, 1.0)),
            1,
        );
        assert_eq!(outcome.total_withdrawn, 1);
        assert_eq!(outcome.shortfall, 0);
        assert_eq!(outcome.withdrawn_by_asset, AssetBalances::new(0, 0, 1));

        let outcome = apply_drawdown(
            AssetBalances::new(100, 101, 100),
            1,
            &rebalancing(Allocation::new(1.0, 1.0, 1.0)),
            1,
        );
        assert_eq!(outcome.withdrawn_by_asset.total(), 1);
        assert_eq!(outcome.shortfall, 0);
    }

    #[test]
    fn glide_path_midpoint_is_arithmetic_mean() {
        let path = vec![
            GlidePathWaypoint {
                year: 21,
                allocation: Allocation::new(0.4, 0.5, 0.1),
            },
            GlidePathWaypoint {
                year: 1,
                allocation: Allocation::new(0.8, 0.1, 0.1),
            },
        ];
        let mid = interpolate_glide_path(&path, 11).unwrap();
        assert!((mid.stocks - 0.6).abs() < 1e-12);
        assert!((mid.bonds - 0.3).abs() < 1e-12);
        assert!((mid.cash - 0.1).abs() < 1e-12);

        let before = interpolate_glide_path(&path, 0).unwrap();
        assert!((before.stocks - 0.8).abs() < 1e-12);
        let after = interpolate_glide_path(&path, 40).unwrap();
        assert!((after.stocks - 0.4).abs() < 1e-12);
    }

    #[test]
    fn glide_path_weights_are_normalized() {
        let path = vec![GlidePathWaypoint {
            year: 1,
            allocation: Allocation::new(6.0, 3.0, 1.0),
        }];
        let allocation = resolve_allocation(&Allocation::default(), &path, 5);
        assert!((allocation.sum() - 1.0).abs() < 1e-12);
        assert!((allocation.stocks - 0.6).abs() < 1e-12);
    }

    #[test]
    fn validate_rejects_duplicate_bucket_entries() {
        let strategy = DrawdownStrategy::Bucket {
            order: vec![AssetClass::Cash, AssetClass::Cash],
        };
        assert!(strategy.validate().is_err());
    }

    #[test]
    fn drawdown_strategy_parses_tagged_json() {
        let strategy: DrawdownStrategy = serde_json::from_str(
            r#"{
              "type": "rebalancing",
              "targetAllocation": { "stocks": 0.5, "bonds": 0.4, "cash": 0.1 },
              "glidePath": [{ "year": 10, "allocation": { "stocks": 0.3, "bonds": 0.6, "cash": 0.1 } }]
            }"#,
        )
        .expect("rebalancing strategy should parse");
        match strategy {
            DrawdownStrategy::Rebalancing { glide_path, .. } => assert_eq!(glide_path.len(), 1),
            other => panic!("unexpected strategy {other:?}"),
        }
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(64))]

        #[test]
        fn prop_drawdown_conserves_money(
            stocks in 0i64..5_000_000,
            bonds in 0i64..5_000_000,
            cash in 0i64..5_000_000,
            requested in 0i64..20_000_000,
            w_stocks in 0u32..100,
            w_bonds in 0u32..100,
            w_cash in 0u32..100,
            use_bucket in proptest::bool::ANY,
        ) {
            let start = AssetBalances::new(stocks, bonds, cash);
            let strategy = if use_bucket {
                DrawdownStrategy::default()
            } else {
                rebalancing(Allocation::new(w_stocks as f64, w_bonds as f64, w_cash as f64))
            };
            let outcome = apply_drawdown(start, requested, &strategy, 1);

            prop_assert_eq!(outcome.total_withdrawn + outcome.shortfall, requested);
            prop_assert_eq!(outcome.withdrawn_by_asset.total(), outcome.total_withdrawn);
            prop_assert_eq!(outcome.balances.total() + outcome.total_withdrawn, start.total());
            for asset in AssetClass::ALL {
                prop_assert!(outcome.balances.get(asset) >= 0);
            }
            if requested <= start.total() {
                prop_assert_eq!(outcome.shortfall, 0);
            }
        }
    }
}
