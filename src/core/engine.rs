//! Single-path simulator.
//!
//! A path is a fold of [`advance_month`] over a return series: each call takes the
//! previous [`PathState`] by value and yields the next state plus one
//! [`MonthlySimulationRow`]. Stochastic runs, Monte Carlo runs, stress variants and the
//! reforecaster all drive this same transition.

use tracing::debug;

use super::drawdown::apply_drawdown;
use super::error::{Result, SimError};
use super::math::{
    InflationSchedule, Mulberry32, annual_to_monthly_rate, entropy_seed, round_to_cents,
};
use super::rolling::RollingRealReturns;
use super::strategies::{StrategyContext, calculate_withdrawal};
use super::types::{
    ActualOverridesByMonth, Allocation, AssetBalances, AssetClass, AssetReturns, Cents,
    MonthOverride, MonthlySimulationRow, SimulationConfig, SimulationOutput, SimulationSummary,
    SpendingPhase, WithdrawalDetail,
};

/// Floor for a single month's drawn return.
pub const MIN_MONTHLY_RETURN: f64 = -0.9999;

/// Gaussian monthly returns per asset from the configured annual assumptions.
/// Draws are taken stocks, bonds, cash for each month in turn.
pub fn generate_monthly_returns_from_assumptions(
    config: &SimulationConfig,
    seed: Option<u32>,
) -> Vec<AssetReturns> {
    let mut rng = Mulberry32::new(seed.unwrap_or_else(entropy_seed));
    let params = AssetClass::ALL.map(|asset| {
        let assumption = config.return_assumptions.get(asset);
        (
            annual_to_monthly_rate(assumption.expected_return),
            assumption.std_dev / 12f64.sqrt(),
        )
    });

    (0..config.duration_months())
        .map(|_| {
            let mut returns = AssetReturns::default();
            for (asset, (mean, std_dev)) in AssetClass::ALL.into_iter().zip(params) {
                let draw = mean + std_dev * rng.standard_normal();
                *returns.get_mut(asset) = draw.max(MIN_MONTHLY_RETURN);
            }
            returns
        })
        .collect()
}

/// Every month earns the monthly equivalent of the expected annual return.
pub fn deterministic_monthly_returns(config: &SimulationConfig) -> Vec<AssetReturns> {
    let a = &config.return_assumptions;
    let monthly = AssetReturns::new(
        annual_to_monthly_rate(a.stocks.expected_return),
        annual_to_monthly_rate(a.bonds.expected_return),
        annual_to_monthly_rate(a.cash.expected_return),
    );
    vec![monthly; config.duration_months() as usize]
}

/// Carried between months.
#[derive(Clone, Debug)]
pub struct PathState {
    pub balances: AssetBalances,
    /// Last strategy output after phase clamping (annual, or monthly for monthly strategies).
    pub previous_withdrawal: f64,
    /// Amount requested each month until the next decision.
    pub monthly_request: Cents,
    /// Portfolio total at the start of the first withdrawal month.
    pub initial_portfolio_value: Option<f64>,
    pub previous_year_return: f64,
    pub previous_year_start_value: f64,
    year_start_value: f64,
    year_return_factor: f64,
    rolling: Option<RollingRealReturns>,
}

impl PathState {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            balances: config.portfolio,
            previous_withdrawal: 0.0,
            monthly_request: 0,
            initial_portfolio_value: None,
            previous_year_return: 0.0,
            previous_year_start_value: 0.0,
            year_start_value: config.portfolio.total() as f64,
            year_return_factor: 1.0,
            rolling: config
                .withdrawal_strategy
                .lookback_months()
                .map(RollingRealReturns::new),
        }
    }
}

/// Fixed inputs shared by every month of one path.
#[derive(Clone, Copy, Debug)]
pub struct PathEnv<'a> {
    pub config: &'a SimulationConfig,
    pub inflation: &'a InflationSchedule,
}

#[derive(Clone, Copy, Debug)]
pub struct MonthInput<'a> {
    /// 1-based.
    pub month_index: u32,
    pub returns: AssetReturns,
    pub actual: Option<&'a MonthOverride>,
}

/// One month of the state machine: start, growth, withdrawal, income, expenses.
pub fn advance_month(
    env: &PathEnv<'_>,
    mut state: PathState,
    input: MonthInput<'_>,
) -> Result<(PathState, MonthlySimulationRow)> {
    let config = env.config;
    let month_index = input.month_index.max(1);
    let year = (month_index - 1) / 12 + 1;
    let month_of_year = (month_index - 1) % 12;
    let inflation_factor = env.inflation.factor(month_index);

    let start = input
        .actual
        .and_then(|actual| actual.start_balances)
        .unwrap_or(state.balances);

    if month_of_year == 0 {
        if month_index > 1 {
            state.previous_year_return = state.year_return_factor - 1.0;
            state.previous_year_start_value = state.year_start_value;
        }
        state.year_start_value = start.total() as f64;
        state.year_return_factor = 1.0;
    }

    let mut balances = start;
    let mut market_change = AssetBalances::default();
    for asset in AssetClass::ALL {
        let before = start.get(asset);
        let after = round_to_cents(before as f64 * (1.0 + input.returns.get(asset)));
        *balances.get_mut(asset) = after;
        *market_change.get_mut(asset) = after - before;
    }
    if start.total() > 0 {
        state.year_return_factor *= balances.total() as f64 / start.total() as f64;
    }
    if let Some(rolling) = state.rolling.as_mut() {
        rolling.push(&input.returns, env.inflation.monthly_rate(month_index));
    }

    let requested = decide_withdrawal(env, &mut state, month_index, &start, &balances)?;
    let withdrawal = match input.actual.and_then(|actual| actual.withdrawals) {
        Some(explicit) => fund_explicit(&mut balances, &explicit),
        None => {
            let outcome = apply_drawdown(balances, requested, &config.drawdown_strategy, year);
            balances = outcome.balances;
            WithdrawalDetail {
                requested,
                actual: outcome.total_withdrawn,
                shortfall: outcome.shortfall,
                by_asset: outcome.withdrawn_by_asset,
            }
        }
    };

    let income_total = match input.actual.and_then(|actual| actual.income_total) {
        Some(total) => {
            let total = total.max(0);
            balances.cash += total;
            total
        }
        None => {
            let mut total = 0;
            for event in config
                .income_events
                .iter()
                .filter(|event| event.fires_in(year, month_of_year))
            {
                let amount =
                    scheduled_amount(event.amount, event.inflation_adjusted, inflation_factor);
                *balances.get_mut(event.deposit_to) += amount;
                total += amount;
            }
            total
        }
    };

    let (expense_total, expense_shortfall) =
        match input.actual.and_then(|actual| actual.expense_total) {
            Some(total) => {
                let total = total.max(0);
                let outcome = apply_drawdown(balances, total, &config.drawdown_strategy, year);
                balances = outcome.balances;
                (total, outcome.shortfall)
            }
            None => {
                let mut total = 0;
                let mut shortfall = 0;
                for event in config
                    .expense_events
                    .iter()
                    .filter(|event| event.fires_in(year, month_of_year))
                {
                    let amount =
                        scheduled_amount(event.amount, event.inflation_adjusted, inflation_factor);
                    total += amount;
                    match event.source.asset() {
                        Some(asset) => {
                            let paid = amount.min(balances.get(asset).max(0));
                            *balances.get_mut(asset) -= paid;
                            shortfall += amount - paid;
                        }
                        None => {
                            let outcome =
                                apply_drawdown(balances, amount, &config.drawdown_strategy, year);
                            balances = outcome.balances;
                            shortfall += outcome.shortfall;
                        }
                    }
                }
                (total, shortfall)
            }
        };

    let (calendar_year, calendar_month) = config.calendar(month_index);
    let row = MonthlySimulationRow {
        month_index,
        year_index: year,
        calendar_year,
        calendar_month,
        age: config.core.starting_age.saturating_add(year - 1),
        start_balances: start,
        market_change,
        withdrawal,
        income_total,
        expense_total,
        expense_shortfall,
        end_balances: balances,
        inflation_factor,
        is_actual: input.actual.is_some(),
    };

    state.balances = balances;
    Ok((state, row))
}

/// Runs the strategy when a decision is due and returns this month's request.
fn decide_withdrawal(
    env: &PathEnv<'_>,
    state: &mut PathState,
    month_index: u32,
    start: &AssetBalances,
    grown: &AssetBalances,
) -> Result<Cents> {
    let config = env.config;
    let year = (month_index - 1) / 12 + 1;
    let deferral = config.deferral_years();
    if year <= deferral {
        return Ok(0);
    }

    let monthly = config.withdrawal_strategy.is_monthly();
    if !monthly && (month_index - 1) % 12 != 0 {
        return Ok(state.monthly_request);
    }

    let withdrawal_year = year - deferral;
    let retirement_years = config.core.duration_years.saturating_sub(deferral);
    let initial = *state
        .initial_portfolio_value
        .get_or_insert(start.total() as f64);

    let ctx = StrategyContext {
        year: withdrawal_year,
        retirement_years,
        portfolio_value: grown.total() as f64,
        initial_portfolio_value: initial,
        previous_withdrawal: state.previous_withdrawal,
        previous_year_return: state.previous_year_return,
        previous_year_start_value: state.previous_year_start_value,
        remaining_years: (retirement_years + 1).saturating_sub(withdrawal_year),
        remaining_months: (config.duration_months() + 1).saturating_sub(month_index),
        inflation_rate: env.inflation.annual_rate(month_index),
        cape_ratio: config.cape_ratio,
        trailing_real_returns: state
            .rolling
            .as_ref()
            .and_then(RollingRealReturns::annualized),
        start_weights: Allocation::from_balances(start),
    };

    let raw = calculate_withdrawal(&ctx, &config.withdrawal_strategy)?;
    let periods = if monthly { 1 } else { 12 };
    let amount = clamp_to_phase(
        config.phase_for_year(year),
        raw,
        periods,
        env.inflation.factor(month_index),
    );

    state.previous_withdrawal = amount as f64;
    state.monthly_request = if monthly {
        amount
    } else {
        round_to_cents(amount as f64 / 12.0)
    };
    Ok(state.monthly_request)
}

/// Clamps to the phase's monthly bounds, inflated to the decision month and scaled to
/// `periods` months.
fn clamp_to_phase(
    phase: Option<&SpendingPhase>,
    amount: Cents,
    periods: u32,
    inflation_factor: f64,
) -> Cents {
    let Some(phase) = phase else {
        return amount;
    };
    let bound = |monthly: Cents| round_to_cents(monthly as f64 * periods as f64 * inflation_factor);

    let mut amount = amount;
    if let Some(max) = phase.max_monthly_spend {
        amount = amount.min(bound(max));
    }
    if let Some(min) = phase.min_monthly_spend {
        amount = amount.max(bound(min));
    }
    amount
}

/// Per-asset draw capped at each balance.
fn fund_explicit(balances: &mut AssetBalances, explicit: &AssetBalances) -> WithdrawalDetail {
    let mut by_asset = AssetBalances::default();
    let mut requested = 0;
    for asset in AssetClass::ALL {
        let wanted = explicit.get(asset).max(0);
        let paid = wanted.min(balances.get(asset).max(0));
        requested += wanted;
        *balances.get_mut(asset) -= paid;
        *by_asset.get_mut(asset) = paid;
    }
    let actual = by_asset.total();
    WithdrawalDetail {
        requested,
        actual,
        shortfall: requested - actual,
        by_asset,
    }
}

fn scheduled_amount(amount: Cents, inflation_adjusted: bool, inflation_factor: f64) -> Cents {
    if inflation_adjusted {
        round_to_cents(amount as f64 * inflation_factor)
    } else {
        amount
    }
}

pub fn summarize(config: &SimulationConfig, rows: &[MonthlySimulationRow]) -> SimulationSummary {
    SimulationSummary {
        months: rows.len() as u32,
        total_withdrawn: rows.iter().map(|row| row.withdrawal.actual).sum(),
        total_shortfall: rows.iter().map(|row| row.withdrawal.shortfall).sum(),
        final_value: rows
            .last()
            .map_or(config.portfolio.total(), MonthlySimulationRow::end_total),
        depleted_month: rows
            .iter()
            .find(|row| row.end_total() <= 0)
            .map(|row| row.month_index),
    }
}

/// Folds [`advance_month`] over `returns`. Extra months in `returns` are ignored.
pub fn simulate_path(
    config: &SimulationConfig,
    returns: &[AssetReturns],
    overrides: Option<&ActualOverridesByMonth>,
    inflation: &InflationSchedule,
) -> Result<SimulationOutput> {
    let months = config.duration_months() as usize;
    if returns.len() < months {
        return Err(SimError::ReturnSeriesTooShort {
            needed: months,
            got: returns.len(),
        });
    }

    let env = PathEnv { config, inflation };
    let mut state = PathState::new(config);
    let mut rows = Vec::with_capacity(months);
    for (idx, returns) in returns.iter().take(months).enumerate() {
        let month_index = idx as u32 + 1;
        let input = MonthInput {
            month_index,
            returns: *returns,
            actual: overrides.and_then(|map| map.get(&month_index)),
        };
        let (next, row) = advance_month(&env, state, input)?;
        state = next;
        rows.push(row);
    }

    let summary = summarize(config, &rows);
    Ok(SimulationOutput { rows, summary })
}

/// Runs one path against `monthly_returns`, or against a fresh assumption-driven series.
pub fn simulate(
    config: &SimulationConfig,
    monthly_returns: Option<&[AssetReturns]>,
    seed: Option<u32>,
) -> Result<SimulationOutput> {
    config.validate()?;
    let inflation =
        InflationSchedule::constant(config.core.inflation_rate, config.duration_months());
    match monthly_returns {
        Some(returns) => simulate_path(config, returns, None, &inflation),
        None => {
            let returns = generate_monthly_returns_from_assumptions(config, seed);
            simulate_path(config, &returns, None, &inflation)
        }
    }
}

/// Expected-return path with user-entered actuals applied month by month.
pub fn reforecast_deterministic(
    config: &SimulationConfig,
    overrides: &ActualOverridesByMonth,
) -> Result<SimulationOutput> {
    config.validate()?;
    let inflation =
        InflationSchedule::constant(config.core.inflation_rate, config.duration_months());
    let returns = deterministic_monthly_returns(config);
    let output = simulate_path(config, &returns, Some(overrides), &inflation)?;
    debug!(
        overrides = overrides.len(),
        final_value = output.summary.final_value,
        "deterministic reforecast complete"
    );
    Ok(output)
}
