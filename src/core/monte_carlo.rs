//! Monte Carlo over resampled historical months.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::engine::simulate_path;
use super::error::{Result, SimError};
use super::history::{HistoricalDataProvider, HistoricalEra, HistoricalMonth, HistoricalSummary};
use super::math::{
    InflationSchedule, Mulberry32, derive_run_seed, entropy_seed, percentile, round_to_cents,
};
use super::types::{
    ActualOverridesByMonth, AssetBalances, AssetClass, AssetReturns, Cents, SimulationConfig,
    SimulationOutput,
};

pub const DEFAULT_RUNS: u32 = 1000;
pub const MAX_RUNS: u32 = 5000;

const PERCENTILES: [f64; 7] = [5.0, 10.0, 25.0, 50.0, 75.0, 90.0, 95.0];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MonteCarloOptions {
    pub runs: u32,
    pub seed: Option<u32>,
    pub actual_overrides_by_month: Option<ActualOverridesByMonth>,
}

impl Default for MonteCarloOptions {
    fn default() -> Self {
        Self {
            runs: DEFAULT_RUNS,
            seed: None,
            actual_overrides_by_month: None,
        }
    }
}

/// Mutates a sampled return series in place before it is simulated.
pub trait ReturnTransform: Sync {
    fn transform(&self, returns: &mut [AssetReturns]);
}

/// Month-by-month percentile bands, in cents.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PercentileCurves {
    pub p05: Vec<Cents>,
    pub p10: Vec<Cents>,
    pub p25: Vec<Cents>,
    pub p50: Vec<Cents>,
    pub p75: Vec<Cents>,
    pub p90: Vec<Cents>,
    pub p95: Vec<Cents>,
}

impl PercentileCurves {
    fn with_capacity(months: usize) -> Self {
        Self {
            p05: Vec::with_capacity(months),
            p10: Vec::with_capacity(months),
            p25: Vec::with_capacity(months),
            p50: Vec::with_capacity(months),
            p75: Vec::with_capacity(months),
            p90: Vec::with_capacity(months),
            p95: Vec::with_capacity(months),
        }
    }

    fn push(&mut self, bands: [Cents; 7]) {
        self.p05.push(bands[0]);
        self.p10.push(bands[1]);
        self.p25.push(bands[2]);
        self.p50.push(bands[3]);
        self.p75.push(bands[4]);
        self.p90.push(bands[5]);
        self.p95.push(bands[6]);
    }

    pub fn len(&self) -> usize {
        self.p50.len()
    }

    pub fn is_empty(&self) -> bool {
        self.p50.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonteCarloResult {
    pub simulation_count: u32,
    pub success_count: u32,
    /// Fraction of runs ending with a positive portfolio.
    pub success_probability: f64,
    pub total: PercentileCurves,
    pub stocks: PercentileCurves,
    pub bonds: PercentileCurves,
    pub cash: PercentileCurves,
    pub historical_summary: HistoricalSummary,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonteCarloOutput {
    pub representative_path: SimulationOutput,
    pub representative_run_index: u32,
    pub monte_carlo: MonteCarloResult,
    pub seed_used: u32,
}

struct RunOutcome {
    end_balances: Vec<AssetBalances>,
    terminal: Cents,
    total_withdrawn: Cents,
    total_shortfall: Cents,
}

fn sample_path(pool: &[HistoricalMonth], months: usize, seed: u32) -> Vec<AssetReturns> {
    let mut rng = Mulberry32::new(seed);
    (0..months)
        .map(|_| pool[rng.next_index(pool.len())].returns)
        .collect()
}

fn run_once(
    config: &SimulationConfig,
    pool: &[HistoricalMonth],
    seed: u32,
    overrides: Option<&ActualOverridesByMonth>,
    transform: Option<&dyn ReturnTransform>,
    inflation: &InflationSchedule,
) -> Result<SimulationOutput> {
    let mut returns = sample_path(pool, config.duration_months() as usize, seed);
    if let Some(transform) = transform {
        transform.transform(&mut returns);
    }
    simulate_path(config, &returns, overrides, inflation)
}

pub fn run_monte_carlo(
    config: &SimulationConfig,
    options: &MonteCarloOptions,
    provider: &HistoricalDataProvider,
) -> Result<MonteCarloOutput> {
    config.validate()?;
    let inflation =
        InflationSchedule::constant(config.core.inflation_rate, config.duration_months());
    run_monte_carlo_with(config, options, provider, None, &inflation)
}

/// [`run_monte_carlo`] with a return transform and inflation table applied to every run.
pub fn run_monte_carlo_with(
    config: &SimulationConfig,
    options: &MonteCarloOptions,
    provider: &HistoricalDataProvider,
    transform: Option<&dyn ReturnTransform>,
    inflation: &InflationSchedule,
) -> Result<MonteCarloOutput> {
    if options.runs == 0 || options.runs > MAX_RUNS {
        return Err(SimError::InvalidRunCount(options.runs));
    }
    config.validate()?;

    let era = HistoricalEra::from_key(&config.historical_era)?;
    let pool = provider.era_months(era)?;
    let historical_summary = HistoricalSummary::from_months(era, &pool);
    let seed_used = options.seed.unwrap_or_else(entropy_seed);
    let overrides = options.actual_overrides_by_month.as_ref();

    let outcomes = (0..options.runs)
        .into_par_iter()
        .map(|run| {
            let seed = derive_run_seed(seed_used, run);
            let output = run_once(config, &pool, seed, overrides, transform, inflation)?;
            Ok(RunOutcome {
                end_balances: output.rows.iter().map(|row| row.end_balances).collect(),
                terminal: output.summary.final_value,
                total_withdrawn: output.summary.total_withdrawn,
                total_shortfall: output.summary.total_shortfall,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let months = config.duration_months() as usize;
    let month_bands = (0..months)
        .into_par_iter()
        .map(|month| {
            let mut bands = [[0; 7]; 4];
            let mut series = vec![Vec::with_capacity(outcomes.len()); 4];
            for outcome in &outcomes {
                let end = outcome.end_balances[month];
                series[0].push(end.total() as f64);
                for (slot, asset) in AssetClass::ALL.into_iter().enumerate() {
                    series[slot + 1].push(end.get(asset) as f64);
                }
            }
            for (band, values) in bands.iter_mut().zip(series.iter_mut()) {
                *band = PERCENTILES.map(|p| round_to_cents(percentile(values, p)));
            }
            bands
        })
        .collect::<Vec<_>>();

    let mut curves = [(); 4].map(|_| PercentileCurves::with_capacity(months));
    for bands in month_bands {
        for (curve, band) in curves.iter_mut().zip(bands) {
            curve.push(band);
        }
    }
    let [total, stocks, bonds, cash] = curves;

    let success_count = outcomes.iter().filter(|o| o.terminal > 0).count() as u32;
    let representative_run_index = select_representative(&outcomes);
    let representative_path = run_once(
        config,
        &pool,
        derive_run_seed(seed_used, representative_run_index),
        overrides,
        transform,
        inflation,
    )?;

    let success_probability = success_count as f64 / options.runs as f64;
    debug!(
        runs = options.runs,
        seed = seed_used,
        era = era.key(),
        success_probability,
        "monte carlo complete"
    );

    Ok(MonteCarloOutput {
        representative_path,
        representative_run_index,
        monte_carlo: MonteCarloResult {
            simulation_count: options.runs,
            success_count,
            success_probability,
            total,
            stocks,
            bonds,
            cash,
            historical_summary,
        },
        seed_used,
    })
}

/// Run closest to the median terminal value, then to the median total withdrawn,
/// then with the lowest shortfall, then the lowest index.
fn select_representative(outcomes: &[RunOutcome]) -> u32 {
    let mut terminals = outcomes.iter().map(|o| o.terminal as f64).collect::<Vec<_>>();
    let mut withdrawn = outcomes
        .iter()
        .map(|o| o.total_withdrawn as f64)
        .collect::<Vec<_>>();
    let median_terminal = percentile(&mut terminals, 50.0);
    let median_withdrawn = percentile(&mut withdrawn, 50.0);

    let key = |o: &RunOutcome| {
        (
            (o.terminal as f64 - median_terminal).abs(),
            (o.total_withdrawn as f64 - median_withdrawn).abs(),
            o.total_shortfall,
        )
    };

    outcomes
        .iter()
        .enumerate()
        .min_by(|(ia, a), (ib, b)| {
            let (ta, wa, sa) = key(*a);
            let (tb, wb, sb) = key(*b);
            ta.total_cmp(&tb)
                .then_with(|| wa.total_cmp(&wb))
                .then_with(|| sa.cmp(&sb))
                .then_with(|| ia.cmp(ib))
        })
        .map_or(0, |(idx, _)| idx as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::{any, prop_assert, proptest};

    fn synthetic_history() -> Vec<HistoricalMonth> {
        let mut rng = Mulberry32::new(2024);
        (1970..=1989)
            .flat_map(|year| (1..=12).map(move |month| (year, month)))
            .map(|(year, month)| HistoricalMonth {
                year,
                month,
                returns: AssetReturns::new(
                    0.007 + 0.045 * rng.standard_normal(),
                    0.003 + 0.015 * rng.standard_normal(),
                    0.002,
                ),
            })
            .collect()
    }

    fn provider() -> HistoricalDataProvider {
        HistoricalDataProvider::from_months(synthetic_history())
    }

    fn config() -> SimulationConfig {
        let mut config = SimulationConfig::default();
        config.core.duration_years = 10;
        config
    }

    fn options(runs: u32, seed: u32) -> MonteCarloOptions {
        MonteCarloOptions {
            runs,
            seed: Some(seed),
            actual_overrides_by_month: None,
        }
    }

    struct Collapse;

    impl ReturnTransform for Collapse {
        fn transform(&self, returns: &mut [AssetReturns]) {
            returns.fill(AssetReturns::new(-0.5, -0.5, -0.5));
        }
    }

    fn assert_ordered(curves: &PercentileCurves) {
        for m in 0..curves.len() {
            assert!(curves.p05[m] <= curves.p10[m]);
            assert!(curves.p10[m] <= curves.p25[m]);
            assert!(curves.p25[m] <= curves.p50[m]);
            assert!(curves.p50[m] <= curves.p75[m]);
            assert!(curves.p75[m] <= curves.p90[m]);
            assert!(curves.p90[m] <= curves.p95[m]);
        }
    }

    #[test]
    fn identical_seed_reproduces_curves_and_representative() {
        let provider = provider();
        let a = run_monte_carlo(&config(), &options(150, 42), &provider).unwrap();
        let b = run_monte_carlo(&config(), &options(150, 42), &provider).unwrap();

        assert_eq!(a.monte_carlo, b.monte_carlo);
        assert_eq!(a.representative_run_index, b.representative_run_index);
        assert_eq!(
            a.representative_path.summary.final_value,
            b.representative_path.summary.final_value
        );
        assert_eq!(a.seed_used, 42);
    }

    #[test]
    fn curves_are_ordered_and_span_every_month() {
        let output = run_monte_carlo(&config(), &options(200, 7), &provider()).unwrap();
        let mc = &output.monte_carlo;
        for curves in [&mc.total, &mc.stocks, &mc.bonds, &mc.cash] {
            assert_eq!(curves.len(), 120);
            assert_ordered(curves);
        }
        assert_eq!(mc.simulation_count, 200);
        assert_eq!(mc.historical_summary.sample_size, 240);
    }

    #[test]
    fn single_run_curves_collapse_onto_the_representative_path() {
        let output = run_monte_carlo(&config(), &options(1, 11), &provider()).unwrap();
        let totals = output
            .representative_path
            .rows
            .iter()
            .map(|row| row.end_total())
            .collect::<Vec<_>>();

        assert_eq!(output.representative_run_index, 0);
        assert_eq!(output.monte_carlo.total.p05, totals);
        assert_eq!(output.monte_carlo.total.p95, totals);
    }

    #[test]
    fn success_is_counted_on_positive_terminal_value() {
        let provider = provider();
        let config = config();
        let healthy = run_monte_carlo(&config, &options(50, 3), &provider).unwrap();
        assert_eq!(healthy.monte_carlo.success_count, 50);
        assert!((healthy.monte_carlo.success_probability - 1.0).abs() < 1e-12);

        let inflation =
            InflationSchedule::constant(config.core.inflation_rate, config.duration_months());
        let collapsed =
            run_monte_carlo_with(&config, &options(20, 3), &provider, Some(&Collapse), &inflation)
                .unwrap();
        assert_eq!(collapsed.monte_carlo.success_count, 0);
        assert_eq!(collapsed.monte_carlo.success_probability, 0.0);
    }

    #[test]
    fn run_count_is_bounded() {
        let provider = provider();
        for runs in [0, MAX_RUNS + 1] {
            assert!(matches!(
                run_monte_carlo(&config(), &options(runs, 1), &provider),
                Err(SimError::InvalidRunCount(r)) if r == runs
            ));
        }
    }

    #[test]
    fn era_errors_abort_the_run() {
        let provider = provider();
        let mut config = config();
        config.historical_era = "jazzAge".to_string();
        assert!(matches!(
            run_monte_carlo(&config, &options(5, 1), &provider),
            Err(SimError::UnknownEra(_))
        ));

        config.historical_era = "greatDepression".to_string();
        assert!(matches!(
            run_monte_carlo(&config, &options(5, 1), &provider),
            Err(SimError::EmptyHistory(_))
        ));
    }

    #[test]
    fn overrides_apply_inside_every_run() {
        let mut overrides = ActualOverridesByMonth::new();
        overrides.insert(
            1,
            crate::core::types::MonthOverride {
                start_balances: Some(AssetBalances::new(5_000_000, 0, 0)),
                ..Default::default()
            },
        );
        let opts = MonteCarloOptions {
            actual_overrides_by_month: Some(overrides),
            ..options(10, 5)
        };
        let output = run_monte_carlo(&config(), &opts, &provider()).unwrap();
        let first = &output.representative_path.rows[0];
        assert!(first.is_actual);
        assert_eq!(first.start_balances, AssetBalances::new(5_000_000, 0, 0));
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(8))]

        #[test]
        fn prop_percentile_bands_never_cross(seed in any::<u32>()) {
            let output = run_monte_carlo(&config(), &options(25, seed), &provider()).unwrap();
            let mc = &output.monte_carlo;
            for curves in [&mc.total, &mc.stocks, &mc.bonds, &mc.cash] {
                for m in 0..curves.len() {
                    prop_assert!(curves.p10[m] <= curves.p50[m]);
                    prop_assert!(curves.p50[m] <= curves.p90[m]);
                }
            }
        }
    }
}
