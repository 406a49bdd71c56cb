//! Stress scenarios layered onto a baseline path.
//!
//! Each scenario rewrites part of the baseline return series (and optionally the
//! inflation table) starting at a year counted from the first projected month, then
//! re-runs either the single-path simulator or the full Monte Carlo with the same seed.

use std::collections::BTreeMap;
use std::ops::Range;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::engine::{generate_monthly_returns_from_assumptions, simulate_path};
use super::error::{Result, SimError};
use super::history::HistoricalDataProvider;
use super::math::{InflationSchedule, annual_to_monthly_rate, entropy_seed, round_to_cents};
use super::monte_carlo::{
    DEFAULT_RUNS, MonteCarloOptions, MonteCarloResult, ReturnTransform, run_monte_carlo_with,
};
use super::types::{
    ActualOverridesByMonth, AssetReturns, Cents, MonthlySimulationRow, SimulationConfig,
    SimulationMode, SimulationOutput, first_projected_month,
};

pub const MAX_SCENARIOS: usize = 4;

/// Annual rates for one year of a custom scenario. Unset fields keep the baseline.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CustomShockYear {
    /// 0-based, from the scenario's start year.
    pub year_offset: u32,
    pub stocks: Option<f64>,
    pub bonds: Option<f64>,
    pub cash: Option<f64>,
    pub inflation: Option<f64>,
}

/// Drops are signed fractions: `-0.3` is a 30% fall.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ShockKind {
    StockCrash {
        drop_pct: f64,
    },
    BondCrash {
        drop_pct: f64,
    },
    BroadMarketCrash {
        stock_drop_pct: f64,
        bond_drop_pct: f64,
    },
    ProlongedBear {
        annual_stock_return: f64,
        annual_bond_return: f64,
        duration_years: u32,
    },
    HighInflation {
        annual_inflation: f64,
        duration_years: u32,
    },
    Custom {
        years: Vec<CustomShockYear>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StressScenario {
    pub id: String,
    pub name: String,
    pub shock: ShockKind,
    /// 1-based year, counted from the first projected month.
    pub start_year: u32,
}

/// A scenario pinned to an absolute month of the timeline.
#[derive(Clone, Copy, Debug)]
pub struct ScenarioShock<'a> {
    shock: &'a ShockKind,
    start_month: u32,
}

fn compound_drop(value: &mut f64, drop_pct: f64) {
    if drop_pct != 0.0 {
        *value = ((1.0 + *value) * (1.0 + drop_pct) - 1.0).max(-1.0);
    }
}

impl<'a> ScenarioShock<'a> {
    pub fn new(scenario: &'a StressScenario, first_projected_month: u32) -> Self {
        Self::at_year(&scenario.shock, scenario.start_year, first_projected_month)
    }

    pub fn at_year(shock: &'a ShockKind, start_year: u32, first_projected_month: u32) -> Self {
        Self {
            shock,
            start_month: first_projected_month
                .max(1)
                .saturating_add((start_year.max(1) - 1).saturating_mul(12)),
        }
    }

    /// 1-based month the shock starts in.
    pub fn start_month(&self) -> u32 {
        self.start_month
    }

    /// 0-based indices for `len` months from `offset` months after the start, capped at `limit`.
    fn window(&self, offset: u32, len: u32, limit: usize) -> Range<usize> {
        let start = (self.start_month as usize - 1)
            .saturating_add(offset as usize)
            .min(limit);
        start..start.saturating_add(len as usize).min(limit)
    }

    pub fn apply(&self, returns: &mut [AssetReturns]) {
        let first = (self.start_month - 1) as usize;
        match self.shock {
            ShockKind::StockCrash { drop_pct } => {
                if let Some(month) = returns.get_mut(first) {
                    compound_drop(&mut month.stocks, *drop_pct);
                }
            }
            ShockKind::BondCrash { drop_pct } => {
                if let Some(month) = returns.get_mut(first) {
                    compound_drop(&mut month.bonds, *drop_pct);
                }
            }
            ShockKind::BroadMarketCrash {
                stock_drop_pct,
                bond_drop_pct,
            } => {
                if let Some(month) = returns.get_mut(first) {
                    compound_drop(&mut month.stocks, *stock_drop_pct);
                    compound_drop(&mut month.bonds, *bond_drop_pct);
                }
            }
            ShockKind::ProlongedBear {
                annual_stock_return,
                annual_bond_return,
                duration_years,
            } => {
                let stocks = annual_to_monthly_rate(*annual_stock_return);
                let bonds = annual_to_monthly_rate(*annual_bond_return);
                let limit = returns.len();
                for idx in self.window(0, duration_years.saturating_mul(12), limit) {
                    if let Some(month) = returns.get_mut(idx) {
                        month.stocks = stocks;
                        month.bonds = bonds;
                    }
                }
            }
            ShockKind::HighInflation { .. } => {}
            ShockKind::Custom { years } => {
                let limit = returns.len();
                for year in years {
                    for idx in self.window(year.year_offset.saturating_mul(12), 12, limit) {
                        let Some(month) = returns.get_mut(idx) else {
                            continue;
                        };
                        if let Some(rate) = year.stocks {
                            month.stocks = annual_to_monthly_rate(rate);
                        }
                        if let Some(rate) = year.bonds {
                            month.bonds = annual_to_monthly_rate(rate);
                        }
                        if let Some(rate) = year.cash {
                            month.cash = annual_to_monthly_rate(rate);
                        }
                    }
                }
            }
        }
    }

    /// Inflation table with the shock's rates substituted, or `None` if inflation is untouched.
    pub fn inflation(&self, base: &InflationSchedule) -> Option<InflationSchedule> {
        let mut rates = base.annual_rates().to_vec();
        let limit = rates.len();
        let mut set = |range: Range<usize>, rate: f64| {
            for idx in range {
                if let Some(slot) = rates.get_mut(idx) {
                    *slot = rate;
                }
            }
        };

        match self.shock {
            ShockKind::HighInflation {
                annual_inflation,
                duration_years,
            } => set(
                self.window(0, duration_years.saturating_mul(12), limit),
                *annual_inflation,
            ),
            ShockKind::Custom { years } if years.iter().any(|y| y.inflation.is_some()) => {
                for year in years {
                    if let Some(rate) = year.inflation {
                        set(self.window(year.year_offset.saturating_mul(12), 12, limit), rate);
                    }
                }
            }
            _ => return None,
        }
        Some(InflationSchedule::from_annual_rates(rates))
    }
}

impl ReturnTransform for ScenarioShock<'_> {
    fn transform(&self, returns: &mut [AssetReturns]) {
        self.apply(returns);
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StressOptions {
    pub seed: Option<u32>,
    pub actual_overrides_by_month: Option<ActualOverridesByMonth>,
    /// Baseline return series for manual mode. Generated from the seed when absent.
    pub monthly_returns: Option<Vec<AssetReturns>>,
    /// Precomputed manual-mode baseline.
    pub base: Option<SimulationOutput>,
    pub runs: u32,
    pub include_timing_sensitivity: bool,
}

impl Default for StressOptions {
    fn default() -> Self {
        Self {
            seed: None,
            actual_overrides_by_month: None,
            monthly_returns: None,
            base: None,
            runs: DEFAULT_RUNS,
            include_timing_sensitivity: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioMetrics {
    pub terminal_value: Cents,
    pub terminal_delta: Cents,
    /// Withdrawals deflated to month-1 money.
    pub total_real_drawdown: Cents,
    pub real_drawdown_delta: Cents,
    pub first_depletion_month: Option<u32>,
    pub first_year_below_base: Option<u32>,
    pub success_probability: Option<f64>,
    /// Percentage points.
    pub success_delta: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StressBase {
    pub path: SimulationOutput,
    pub total_real_drawdown: Cents,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monte_carlo: Option<MonteCarloResult>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StressScenarioResult {
    pub id: String,
    pub name: String,
    pub start_month: u32,
    pub path: SimulationOutput,
    pub metrics: ScenarioMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monte_carlo: Option<MonteCarloResult>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingPoint {
    pub start_year: u32,
    pub start_month: u32,
    pub terminal_value: Cents,
    pub terminal_delta: Cents,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingSensitivity {
    pub scenario_id: String,
    pub points: Vec<TimingPoint>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StressTestResult {
    pub base: StressBase,
    pub scenarios: Vec<StressScenarioResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing_sensitivity: Option<Vec<TimingSensitivity>>,
    pub first_projected_month: u32,
    pub seed_used: u32,
}

pub fn total_real_drawdown(rows: &[MonthlySimulationRow]) -> Cents {
    round_to_cents(
        rows.iter()
            .map(|row| row.withdrawal.actual as f64 / row.inflation_factor)
            .sum(),
    )
}

/// First simulation year whose scenario withdrawals total less than the baseline's.
pub fn first_year_below_base(
    base: &[MonthlySimulationRow],
    scenario: &[MonthlySimulationRow],
) -> Option<u32> {
    let mut yearly: BTreeMap<u32, (Cents, Cents)> = BTreeMap::new();
    for (b, s) in base.iter().zip(scenario) {
        let totals = yearly.entry(s.year_index).or_default();
        totals.0 += b.withdrawal.actual;
        totals.1 += s.withdrawal.actual;
    }
    yearly
        .into_iter()
        .find(|(_, (base, scenario))| scenario < base)
        .map(|(year, _)| year)
}

fn compare(
    base: &SimulationOutput,
    scenario: &SimulationOutput,
    base_success: Option<f64>,
    scenario_success: Option<f64>,
) -> ScenarioMetrics {
    let base_drawdown = total_real_drawdown(&base.rows);
    let drawdown = total_real_drawdown(&scenario.rows);
    ScenarioMetrics {
        terminal_value: scenario.summary.final_value,
        terminal_delta: scenario.summary.final_value - base.summary.final_value,
        total_real_drawdown: drawdown,
        real_drawdown_delta: drawdown - base_drawdown,
        first_depletion_month: scenario.summary.depleted_month,
        first_year_below_base: first_year_below_base(&base.rows, &scenario.rows),
        success_probability: scenario_success,
        success_delta: base_success
            .zip(scenario_success)
            .map(|(base, scenario)| (scenario - base) * 100.0),
    }
}

/// Years from the first projected month to the end of the horizon, rounded up.
fn projected_years(config: &SimulationConfig, first_projected: u32) -> u32 {
    let remaining = (config.duration_months() + 1).saturating_sub(first_projected);
    remaining.div_ceil(12)
}

pub fn run_stress_test(
    config: &SimulationConfig,
    scenarios: &[StressScenario],
    options: &StressOptions,
    provider: &HistoricalDataProvider,
) -> Result<StressTestResult> {
    if scenarios.len() > MAX_SCENARIOS {
        return Err(SimError::TooManyScenarios(scenarios.len()));
    }
    if let Some(scenario) = scenarios.iter().find(|s| s.start_year == 0) {
        return Err(SimError::InvalidConfig(format!(
            "stress scenario '{}' must start in year 1 or later",
            scenario.id
        )));
    }
    config.validate()?;

    let overrides = options.actual_overrides_by_month.as_ref();
    let first_projected = first_projected_month(config.mode, overrides);
    let seed_used = options.seed.unwrap_or_else(entropy_seed);
    let base_inflation =
        InflationSchedule::constant(config.core.inflation_rate, config.duration_months());

    let mut result = match config.simulation_mode {
        SimulationMode::Manual => run_manual(
            config,
            scenarios,
            options,
            first_projected,
            seed_used,
            &base_inflation,
        )?,
        SimulationMode::MonteCarlo => run_monte_carlo_scenarios(
            config,
            scenarios,
            options,
            provider,
            first_projected,
            seed_used,
            &base_inflation,
        )?,
    };
    result.first_projected_month = first_projected;
    Ok(result)
}

fn run_shocked_path(
    config: &SimulationConfig,
    returns: &[AssetReturns],
    overrides: Option<&ActualOverridesByMonth>,
    base_inflation: &InflationSchedule,
    shock: &ScenarioShock<'_>,
) -> Result<SimulationOutput> {
    let mut shocked = returns.to_vec();
    shock.apply(&mut shocked);
    match shock.inflation(base_inflation) {
        Some(inflation) => simulate_path(config, &shocked, overrides, &inflation),
        None => simulate_path(config, &shocked, overrides, base_inflation),
    }
}

fn run_manual(
    config: &SimulationConfig,
    scenarios: &[StressScenario],
    options: &StressOptions,
    first_projected: u32,
    seed_used: u32,
    base_inflation: &InflationSchedule,
) -> Result<StressTestResult> {
    let overrides = options.actual_overrides_by_month.as_ref();
    let returns = match &options.monthly_returns {
        Some(returns) => returns.clone(),
        None => generate_monthly_returns_from_assumptions(config, Some(seed_used)),
    };
    let base = match (&options.base, &options.monthly_returns) {
        (Some(base), Some(_)) => base.clone(),
        (Some(_), None) => {
            return Err(SimError::InvalidConfig(
                "a precomputed stress base needs the monthlyReturns it was simulated on"
                    .to_string(),
            ));
        }
        (None, _) => simulate_path(config, &returns, overrides, base_inflation)?,
    };

    let results = scenarios
        .iter()
        .map(|scenario| {
            let shock = ScenarioShock::new(scenario, first_projected);
            let path = run_shocked_path(config, &returns, overrides, base_inflation, &shock)?;
            let metrics = compare(&base, &path, None, None);
            debug!(
                scenario = %scenario.id,
                start_month = shock.start_month(),
                terminal_delta = metrics.terminal_delta,
                "stress scenario complete"
            );
            Ok(StressScenarioResult {
                id: scenario.id.clone(),
                name: scenario.name.clone(),
                start_month: shock.start_month(),
                path,
                metrics,
                monte_carlo: None,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let timing_sensitivity = if options.include_timing_sensitivity {
        let years = projected_years(config, first_projected);
        let sweeps = scenarios
            .iter()
            .map(|scenario| {
                let points = (1..=years)
                    .into_par_iter()
                    .map(|start_year| {
                        let shock =
                            ScenarioShock::at_year(&scenario.shock, start_year, first_projected);
                        let path =
                            run_shocked_path(config, &returns, overrides, base_inflation, &shock)?;
                        Ok(TimingPoint {
                            start_year,
                            start_month: shock.start_month(),
                            terminal_value: path.summary.final_value,
                            terminal_delta: path.summary.final_value - base.summary.final_value,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(TimingSensitivity {
                    scenario_id: scenario.id.clone(),
                    points,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Some(sweeps)
    } else {
        None
    };

    Ok(StressTestResult {
        base: StressBase {
            total_real_drawdown: total_real_drawdown(&base.rows),
            path: base,
            monte_carlo: None,
        },
        scenarios: results,
        timing_sensitivity,
        first_projected_month: first_projected,
        seed_used,
    })
}

fn run_monte_carlo_scenarios(
    config: &SimulationConfig,
    scenarios: &[StressScenario],
    options: &StressOptions,
    provider: &HistoricalDataProvider,
    first_projected: u32,
    seed_used: u32,
    base_inflation: &InflationSchedule,
) -> Result<StressTestResult> {
    if options.include_timing_sensitivity {
        warn!("timing sensitivity is only computed for manual simulations");
    }
    let mc_options = MonteCarloOptions {
        runs: options.runs,
        seed: Some(seed_used),
        actual_overrides_by_month: options.actual_overrides_by_month.clone(),
    };
    let base = run_monte_carlo_with(config, &mc_options, provider, None, base_inflation)?;
    let base_success = base.monte_carlo.success_probability;

    let results = scenarios
        .iter()
        .map(|scenario| {
            let shock = ScenarioShock::new(scenario, first_projected);
            let inflation = shock.inflation(base_inflation);
            let output = run_monte_carlo_with(
                config,
                &mc_options,
                provider,
                Some(&shock),
                inflation.as_ref().unwrap_or(base_inflation),
            )?;
            let metrics = compare(
                &base.representative_path,
                &output.representative_path,
                Some(base_success),
                Some(output.monte_carlo.success_probability),
            );
            debug!(
                scenario = %scenario.id,
                success_delta = metrics.success_delta,
                "monte carlo stress scenario complete"
            );
            Ok(StressScenarioResult {
                id: scenario.id.clone(),
                name: scenario.name.clone(),
                start_month: shock.start_month(),
                path: output.representative_path,
                metrics,
                monte_carlo: Some(output.monte_carlo),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(StressTestResult {
        base: StressBase {
            total_real_drawdown: total_real_drawdown(&base.representative_path.rows),
            path: base.representative_path,
            monte_carlo: Some(base.monte_carlo),
        },
        scenarios: results,
        timing_sensitivity: None,
        first_projected_month: first_projected,
        seed_used,
    })
}
