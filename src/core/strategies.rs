//! Withdrawal strategy library.
//!
//! Every strategy is a pure function of a [`StrategyContext`] and its own parameter
//! record. [`calculate_withdrawal`] is the single dispatch point; adding a strategy
//! means one new variant of [`WithdrawalStrategyConfig`] and one calculator.

use serde::{Deserialize, Serialize};

use super::error::Result;
use super::math::{annual_to_monthly_rate, pmt, round_to_cents};
use super::types::{Allocation, AssetClass, AssetReturns, Cents};

/// Inputs for one withdrawal decision. Monetary values are in cents.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StrategyContext {
    /// 1-based withdrawal year.
    pub year: u32,
    pub retirement_years: u32,
    pub portfolio_value: f64,
    pub initial_portfolio_value: f64,
    pub previous_withdrawal: f64,
    pub previous_year_return: f64,
    pub previous_year_start_value: f64,
    pub remaining_years: u32,
    pub remaining_months: u32,
    pub inflation_rate: f64,
    pub cape_ratio: Option<f64>,
    /// Annualized trailing real return per asset, once the lookback window is full.
    pub trailing_real_returns: Option<AssetReturns>,
    pub start_weights: Option<Allocation>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConstantDollarParams {
    pub initial_withdrawal_rate: f64,
}

impl Default for ConstantDollarParams {
    fn default() -> Self {
        Self {
            initial_withdrawal_rate: 0.04,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PercentOfPortfolioParams {
    pub annual_withdrawal_rate: f64,
}

impl Default for PercentOfPortfolioParams {
    fn default() -> Self {
        Self {
            annual_withdrawal_rate: 0.04,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OneOverNParams {}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VpwParams {
    pub expected_real_return: f64,
}

impl Default for VpwParams {
    fn default() -> Self {
        Self {
            expected_real_return: 0.035,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DynamicSwrParams {
    pub expected_roi: f64,
}

impl Default for DynamicSwrParams {
    fn default() -> Self {
        Self { expected_roi: 0.06 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DynamicSwrAdaptiveParams {
    pub fallback_expected_roi: f64,
    pub lookback_months: u32,
}

impl Default for DynamicSwrAdaptiveParams {
    fn default() -> Self {
        Self {
            fallback_expected_roi: 0.06,
            lookback_months: 120,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GuytonKlingerParams {
    pub initial_withdrawal_rate: f64,
    pub capital_preservation_trigger: f64,
    pub capital_preservation_cut: f64,
    pub prosperity_trigger: f64,
    pub prosperity_raise: f64,
    pub guardrails_sunset: u32,
}

impl Default for GuytonKlingerParams {
    fn default() -> Self {
        Self {
            initial_withdrawal_rate: 0.05,
            capital_preservation_trigger: 0.20,
            capital_preservation_cut: 0.10,
            prosperity_trigger: 0.20,
            prosperity_raise: 0.10,
            guardrails_sunset: 15,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SensibleWithdrawalsParams {
    pub base_withdrawal_rate: f64,
    pub extras_withdrawal_rate: f64,
}

impl Default for SensibleWithdrawalsParams {
    fn default() -> Self {
        Self {
            base_withdrawal_rate: 0.03,
            extras_withdrawal_rate: 0.10,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NinetyFivePercentParams {
    pub withdrawal_rate: f64,
    pub minimum_percent_of_previous: f64,
}

impl Default for NinetyFivePercentParams {
    fn default() -> Self {
        Self {
            withdrawal_rate: 0.04,
            minimum_percent_of_previous: 0.95,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VanguardDynamicParams {
    pub withdrawal_rate: f64,
    pub ceiling_increase: f64,
    pub floor_decrease: f64,
}

impl Default for VanguardDynamicParams {
    fn default() -> Self {
        Self {
            withdrawal_rate: 0.05,
            ceiling_increase: 0.05,
            floor_decrease: 0.025,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EndowmentParams {
    pub spending_rate: f64,
    pub smoothing_weight: f64,
}

impl Default for EndowmentParams {
    fn default() -> Self {
        Self {
            spending_rate: 0.05,
            smoothing_weight: 0.7,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CapeBasedParams {
    pub base_withdrawal_rate: f64,
    pub cape_weight: f64,
    pub starting_cape: f64,
}

impl Default for CapeBasedParams {
    fn default() -> Self {
        Self {
            base_withdrawal_rate: 0.015,
            cape_weight: 0.5,
            starting_cape: 25.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HebelerAutopilotParams {
    pub initial_withdrawal_rate: f64,
    pub pmt_expected_return: f64,
    pub previous_withdrawal_weight: f64,
}

impl Default for HebelerAutopilotParams {
    fn default() -> Self {
        Self {
            initial_withdrawal_rate: 0.04,
            pmt_expected_return: 0.03,
            previous_withdrawal_weight: 0.5,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WithdrawalStrategyConfig {
    ConstantDollar(ConstantDollarParams),
    PercentOfPortfolio(PercentOfPortfolioParams),
    OneOverN(OneOverNParams),
    Vpw(VpwParams),
    DynamicSwr(DynamicSwrParams),
    DynamicSwrAdaptive(DynamicSwrAdaptiveParams),
    GuytonKlinger(GuytonKlingerParams),
    SensibleWithdrawals(SensibleWithdrawalsParams),
    NinetyFivePercentRule(NinetyFivePercentParams),
    VanguardDynamic(VanguardDynamicParams),
    Endowment(EndowmentParams),
    CapeBased(CapeBasedParams),
    HebelerAutopilot(HebelerAutopilotParams),
}

impl Default for WithdrawalStrategyConfig {
    fn default() -> Self {
        WithdrawalStrategyConfig::ConstantDollar(ConstantDollarParams::default())
    }
}

impl WithdrawalStrategyConfig {
    /// Monthly strategies are consulted every month and return a monthly amount.
    pub fn is_monthly(&self) -> bool {
        matches!(self, WithdrawalStrategyConfig::DynamicSwrAdaptive(_))
    }

    pub fn lookback_months(&self) -> Option<usize> {
        match self {
            WithdrawalStrategyConfig::DynamicSwrAdaptive(p) => Some(p.lookback_months as usize),
            _ => None,
        }
    }
}

/// Runs the configured strategy. Result is non-negative whole cents; annual for every
/// strategy except [`WithdrawalStrategyConfig::DynamicSwrAdaptive`], which is monthly.
pub fn calculate_withdrawal(
    ctx: &StrategyContext,
    config: &WithdrawalStrategyConfig,
) -> Result<Cents> {
    use WithdrawalStrategyConfig as S;

    let amount = match config {
        S::ConstantDollar(p) => constant_dollar(ctx, p),
        S::PercentOfPortfolio(p) => percent_of_portfolio(ctx, p),
        S::OneOverN(p) => one_over_n(ctx, p),
        S::Vpw(p) => vpw(ctx, p)?,
        S::DynamicSwr(p) => dynamic_swr(ctx, p)?,
        S::DynamicSwrAdaptive(p) => dynamic_swr_adaptive(ctx, p)?,
        S::GuytonKlinger(p) => guyton_klinger(ctx, p),
        S::SensibleWithdrawals(p) => sensible_withdrawals(ctx, p),
        S::NinetyFivePercentRule(p) => ninety_five_percent(ctx, p),
        S::VanguardDynamic(p) => vanguard_dynamic(ctx, p),
        S::Endowment(p) => endowment(ctx, p),
        S::CapeBased(p) => cape_based(ctx, p),
        S::HebelerAutopilot(p) => hebeler_autopilot(ctx, p)?,
    };

    Ok(round_to_cents(amount.max(0.0)))
}

fn is_first_year(ctx: &StrategyContext) -> bool {
    ctx.year <= 1
}

fn inflation_adjusted_previous(ctx: &StrategyContext) -> f64 {
    ctx.previous_withdrawal * (1.0 + ctx.inflation_rate)
}

pub fn constant_dollar(ctx: &StrategyContext, p: &ConstantDollarParams) -> f64 {
    if ctx.initial_portfolio_value <= 0.0 {
        return 0.0;
    }
    if is_first_year(ctx) {
        return ctx.initial_portfolio_value * p.initial_withdrawal_rate;
    }
    inflation_adjusted_previous(ctx)
}

pub fn percent_of_portfolio(ctx: &StrategyContext, p: &PercentOfPortfolioParams) -> f64 {
    if ctx.portfolio_value <= 0.0 || ctx.remaining_years == 0 {
        return 0.0;
    }
    ctx.portfolio_value * p.annual_withdrawal_rate
}

pub fn one_over_n(ctx: &StrategyContext, _p: &OneOverNParams) -> f64 {
    if ctx.portfolio_value <= 0.0 || ctx.remaining_years == 0 {
        return 0.0;
    }
    ctx.portfolio_value / ctx.remaining_years as f64
}

pub fn vpw(ctx: &StrategyContext, p: &VpwParams) -> Result<f64> {
    if ctx.portfolio_value <= 0.0 || ctx.remaining_years == 0 {
        return Ok(0.0);
    }
    pmt(
        p.expected_real_return,
        ctx.remaining_years as i64,
        ctx.portfolio_value,
    )
}

/// Nominal payment growing with inflation: `pmt(real, n, pv) * (1 + inflation)`.
fn growing_annuity(roi: f64, inflation: f64, periods: u32, portfolio: f64) -> Result<f64> {
    if (roi - inflation).abs() < 1e-9 {
        return Ok(portfolio / periods as f64);
    }
    let real = (1.0 + roi) / (1.0 + inflation) - 1.0;
    Ok(pmt(real, periods as i64, portfolio)? * (1.0 + inflation))
}

pub fn dynamic_swr(ctx: &StrategyContext, p: &DynamicSwrParams) -> Result<f64> {
    if ctx.portfolio_value <= 0.0 || ctx.remaining_years == 0 {
        return Ok(0.0);
    }
    growing_annuity(
        p.expected_roi,
        ctx.inflation_rate,
        ctx.remaining_years,
        ctx.portfolio_value,
    )
}

/// Estimated nominal ROI from trailing real returns weighted by the start-of-month mix.
fn adaptive_roi(ctx: &StrategyContext, p: &DynamicSwrAdaptiveParams) -> f64 {
    match (ctx.trailing_real_returns, ctx.start_weights) {
        (Some(real), Some(weights)) => {
            let weights = weights.normalized();
            let blended_real = AssetClass::ALL
                .iter()
                .map(|asset| weights.get(*asset) * real.get(*asset))
                .sum::<f64>();
            (1.0 + blended_real) * (1.0 + ctx.inflation_rate) - 1.0
        }
        _ => p.fallback_expected_roi,
    }
}

pub fn dynamic_swr_adaptive(ctx: &StrategyContext, p: &DynamicSwrAdaptiveParams) -> Result<f64> {
    if ctx.portfolio_value <= 0.0 || ctx.remaining_months == 0 {
        return Ok(0.0);
    }
    let roi = adaptive_roi(ctx, p);
    growing_annuity(
        annual_to_monthly_rate(roi),
        annual_to_monthly_rate(ctx.inflation_rate),
        ctx.remaining_months,
        ctx.portfolio_value,
    )
}

pub fn guyton_klinger(ctx: &StrategyContext, p: &GuytonKlingerParams) -> f64 {
    if ctx.portfolio_value <= 0.0 {
        return 0.0;
    }
    if is_first_year(ctx) {
        return ctx.initial_portfolio_value * p.initial_withdrawal_rate;
    }

    let previous = ctx.previous_withdrawal;
    let current_rate = previous / ctx.portfolio_value;
    let freeze = ctx.previous_year_return < 0.0 && current_rate > p.initial_withdrawal_rate;
    let mut withdrawal = if freeze {
        previous
    } else {
        inflation_adjusted_previous(ctx)
    };

    let guardrails_active =
        (ctx.year as i64) <= ctx.retirement_years as i64 - p.guardrails_sunset as i64;
    if guardrails_active {
        let rate = withdrawal / ctx.portfolio_value;
        if rate > p.initial_withdrawal_rate * (1.0 + p.capital_preservation_trigger) {
            withdrawal *= 1.0 - p.capital_preservation_cut;
        } else if rate < p.initial_withdrawal_rate * (1.0 - p.prosperity_trigger) {
            withdrawal *= 1.0 + p.prosperity_raise;
        }
    }
    withdrawal
}

pub fn sensible_withdrawals(ctx: &StrategyContext, p: &SensibleWithdrawalsParams) -> f64 {
    if ctx.portfolio_value <= 0.0 {
        return 0.0;
    }
    let base = ctx.portfolio_value * p.base_withdrawal_rate;
    if is_first_year(ctx) || ctx.previous_year_start_value <= 0.0 {
        return base;
    }

    let real_return = (1.0 + ctx.previous_year_return) / (1.0 + ctx.inflation_rate) - 1.0;
    let real_gain = ctx.previous_year_start_value * real_return;
    if real_gain > 0.0 {
        base + real_gain * p.extras_withdrawal_rate
    } else {
        base
    }
}

pub fn ninety_five_percent(ctx: &StrategyContext, p: &NinetyFivePercentParams) -> f64 {
    if ctx.portfolio_value <= 0.0 {
        return 0.0;
    }
    let target = ctx.portfolio_value * p.withdrawal_rate;
    if is_first_year(ctx) || ctx.previous_withdrawal <= 0.0 {
        return target;
    }
    target.max(inflation_adjusted_previous(ctx) * p.minimum_percent_of_previous)
}

pub fn vanguard_dynamic(ctx: &StrategyContext, p: &VanguardDynamicParams) -> f64 {
    if ctx.portfolio_value <= 0.0 {
        return 0.0;
    }
    let target = ctx.portfolio_value * p.withdrawal_rate;
    if is_first_year(ctx) || ctx.previous_withdrawal <= 0.0 {
        return target;
    }
    let base = inflation_adjusted_previous(ctx);
    let floor = base * (1.0 - p.floor_decrease);
    let ceiling = base * (1.0 + p.ceiling_increase);
    target.clamp(floor.min(ceiling), ceiling.max(floor))
}

pub fn endowment(ctx: &StrategyContext, p: &EndowmentParams) -> f64 {
    if ctx.portfolio_value <= 0.0 {
        return 0.0;
    }
    let current = ctx.portfolio_value * p.spending_rate;
    if is_first_year(ctx) {
        return current;
    }
    let weight = p.smoothing_weight.clamp(0.0, 1.0);
    weight * inflation_adjusted_previous(ctx) + (1.0 - weight) * current
}

pub fn cape_based(ctx: &StrategyContext, p: &CapeBasedParams) -> f64 {
    if ctx.portfolio_value <= 0.0 {
        return 0.0;
    }
    let cape = ctx
        .cape_ratio
        .filter(|cape| cape.is_finite() && *cape > 0.0)
        .unwrap_or(p.starting_cape);
    let rate = if cape > 0.0 {
        p.base_withdrawal_rate + p.cape_weight / cape
    } else {
        p.base_withdrawal_rate
    };
    ctx.portfolio_value * rate
}

pub fn hebeler_autopilot(ctx: &StrategyContext, p: &HebelerAutopilotParams) -> Result<f64> {
    if ctx.portfolio_value <= 0.0 || ctx.remaining_years == 0 {
        return Ok(0.0);
    }
    if is_first_year(ctx) {
        return Ok(ctx.initial_portfolio_value * p.initial_withdrawal_rate);
    }
    let weight = p.previous_withdrawal_weight.clamp(0.0, 1.0);
    let amortized = pmt(
        p.pmt_expected_return,
        ctx.remaining_years as i64,
        ctx.portfolio_value,
    )?;
    Ok(weight * inflation_adjusted_previous(ctx) + (1.0 - weight) * amortized)
}
