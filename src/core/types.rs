use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use super::drawdown::DrawdownStrategy;
use super::error::{Result, SimError};
use super::strategies::WithdrawalStrategyConfig;

/// Whole cents.
pub type Cents = i64;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AssetClass {
    Stocks,
    Bonds,
    Cash,
}

impl AssetClass {
    pub const ALL: [AssetClass; 3] = [AssetClass::Stocks, AssetClass::Bonds, AssetClass::Cash];
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AssetBalances {
    pub stocks: Cents,
    pub bonds: Cents,
    pub cash: Cents,
}

impl AssetBalances {
    pub const fn new(stocks: Cents, bonds: Cents, cash: Cents) -> Self {
        Self {
            stocks,
            bonds,
            cash,
        }
    }

    pub fn get(&self, asset: AssetClass) -> Cents {
        match asset {
            AssetClass::Stocks => self.stocks,
            AssetClass::Bonds => self.bonds,
            AssetClass::Cash => self.cash,
        }
    }

    pub fn get_mut(&mut self, asset: AssetClass) -> &mut Cents {
        match asset {
            AssetClass::Stocks => &mut self.stocks,
            AssetClass::Bonds => &mut self.bonds,
            AssetClass::Cash => &mut self.cash,
        }
    }

    pub fn total(&self) -> Cents {
        self.stocks + self.bonds + self.cash
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AssetReturns {
    pub stocks: f64,
    pub bonds: f64,
    pub cash: f64,
}

impl AssetReturns {
    pub const fn new(stocks: f64, bonds: f64, cash: f64) -> Self {
        Self {
            stocks,
            bonds,
            cash,
        }
    }

    pub fn get(&self, asset: AssetClass) -> f64 {
        match asset {
            AssetClass::Stocks => self.stocks,
            AssetClass::Bonds => self.bonds,
            AssetClass::Cash => self.cash,
        }
    }

    pub fn get_mut(&mut self, asset: AssetClass) -> &mut f64 {
        match asset {
            AssetClass::Stocks => &mut self.stocks,
            AssetClass::Bonds => &mut self.bonds,
            AssetClass::Cash => &mut self.cash,
        }
    }
}

/// Target weights per asset class. Consumers call [`Allocation::normalized`] before use.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub stocks: f64,
    pub bonds: f64,
    pub cash: f64,
}

impl Default for Allocation {
    fn default() -> Self {
        Self {
            stocks: 0.6,
            bonds: 0.3,
            cash: 0.1,
        }
    }
}

impl Allocation {
    pub const fn new(stocks: f64, bonds: f64, cash: f64) -> Self {
        Self {
            stocks,
            bonds,
            cash,
        }
    }

    pub fn get(&self, asset: AssetClass) -> f64 {
        match asset {
            AssetClass::Stocks => self.stocks,
            AssetClass::Bonds => self.bonds,
            AssetClass::Cash => self.cash,
        }
    }

    pub fn sum(&self) -> f64 {
        self.stocks + self.bonds + self.cash
    }

    /// Scales weights to sum to 1. A zero or negative sum falls back to equal weights.
    pub fn normalized(&self) -> Allocation {
        let sum = self.sum();
        if !sum.is_finite() || sum <= 0.0 {
            return Allocation::new(1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0);
        }
        Allocation::new(self.stocks / sum, self.bonds / sum, self.cash / sum)
    }

    pub fn lerp(&self, other: &Allocation, t: f64) -> Allocation {
        Allocation::new(
            self.stocks + (other.stocks - self.stocks) * t,
            self.bonds + (other.bonds - self.bonds) * t,
            self.cash + (other.cash - self.cash) * t,
        )
    }

    pub fn from_balances(balances: &AssetBalances) -> Option<Allocation> {
        let total = balances.total();
        if total <= 0 {
            return None;
        }
        let total = total as f64;
        Some(Allocation::new(
            balances.stocks as f64 / total,
            balances.bonds as f64 / total,
            balances.cash as f64 / total,
        ))
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlanMode {
    #[default]
    Planning,
    Tracking,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SimulationMode {
    #[default]
    Manual,
    MonteCarlo,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CoreParams {
    pub starting_age: u32,
    pub withdrawal_start_age: u32,
    pub retirement_start_date: NaiveDate,
    pub duration_years: u32,
    pub inflation_rate: f64,
}

impl Default for CoreParams {
    fn default() -> Self {
        Self {
            starting_age: 60,
            withdrawal_start_age: 60,
            retirement_start_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap_or_default(),
            duration_years: 30,
            inflation_rate: 0.03,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetAssumption {
    pub expected_return: f64,
    pub std_dev: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReturnAssumptions {
    pub stocks: AssetAssumption,
    pub bonds: AssetAssumption,
    pub cash: AssetAssumption,
}

impl Default for ReturnAssumptions {
    fn default() -> Self {
        Self {
            stocks: AssetAssumption {
                expected_return: 0.07,
                std_dev: 0.15,
            },
            bonds: AssetAssumption {
                expected_return: 0.04,
                std_dev: 0.06,
            },
            cash: AssetAssumption {
                expected_return: 0.02,
                std_dev: 0.01,
            },
        }
    }
}

impl ReturnAssumptions {
    pub fn get(&self, asset: AssetClass) -> AssetAssumption {
        match asset {
            AssetClass::Stocks => self.stocks,
            AssetClass::Bonds => self.bonds,
            AssetClass::Cash => self.cash,
        }
    }
}

/// Spending bounds in today's money for an inclusive range of simulation years.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SpendingPhase {
    pub name: String,
    pub start_year: u32,
    pub end_year: u32,
    pub min_monthly_spend: Option<Cents>,
    pub max_monthly_spend: Option<Cents>,
}

impl SpendingPhase {
    pub fn contains(&self, year: u32) -> bool {
        (self.start_year..=self.end_year).contains(&year)
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventFrequency {
    #[default]
    Monthly,
    Quarterly,
    Annual,
    OneTime,
}

impl EventFrequency {
    /// Whether an event active in `year` fires in the month at `month_of_year` (0-based).
    pub fn fires(self, year: u32, start_year: u32, month_of_year: u32) -> bool {
        match self {
            EventFrequency::Monthly => true,
            EventFrequency::Quarterly => month_of_year % 3 == 0,
            EventFrequency::Annual => month_of_year == 0,
            EventFrequency::OneTime => year == start_year && month_of_year == 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IncomeEvent {
    pub name: String,
    pub amount: Cents,
    pub start_year: u32,
    pub end_year: Option<u32>,
    pub frequency: EventFrequency,
    pub inflation_adjusted: bool,
    pub deposit_to: AssetClass,
}

impl Default for IncomeEvent {
    fn default() -> Self {
        Self {
            name: String::new(),
            amount: 0,
            start_year: 1,
            end_year: None,
            frequency: EventFrequency::Monthly,
            inflation_adjusted: false,
            deposit_to: AssetClass::Cash,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FundingSource {
    #[default]
    FollowDrawdown,
    Stocks,
    Bonds,
    Cash,
}

impl FundingSource {
    pub fn asset(self) -> Option<AssetClass> {
        match self {
            FundingSource::FollowDrawdown => None,
            FundingSource::Stocks => Some(AssetClass::Stocks),
            FundingSource::Bonds => Some(AssetClass::Bonds),
            FundingSource::Cash => Some(AssetClass::Cash),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExpenseEvent {
    pub name: String,
    pub amount: Cents,
    pub start_year: u32,
    pub end_year: Option<u32>,
    pub frequency: EventFrequency,
    pub inflation_adjusted: bool,
    pub source: FundingSource,
}

impl Default for ExpenseEvent {
    fn default() -> Self {
        Self {
            name: String::new(),
            amount: 0,
            start_year: 1,
            end_year: None,
            frequency: EventFrequency::OneTime,
            inflation_adjusted: true,
            source: FundingSource::FollowDrawdown,
        }
    }
}

fn event_active(start_year: u32, end_year: Option<u32>, year: u32) -> bool {
    year >= start_year && end_year.is_none_or(|end| year <= end)
}

impl IncomeEvent {
    pub fn fires_in(&self, year: u32, month_of_year: u32) -> bool {
        event_active(self.start_year, self.end_year, year)
            && self.frequency.fires(year, self.start_year, month_of_year)
    }
}

impl ExpenseEvent {
    pub fn fires_in(&self, year: u32, month_of_year: u32) -> bool {
        event_active(self.start_year, self.end_year, year)
            && self.frequency.fires(year, self.start_year, month_of_year)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SimulationConfig {
    pub mode: PlanMode,
    pub simulation_mode: SimulationMode,
    pub historical_era: String,
    pub core: CoreParams,
    pub portfolio: AssetBalances,
    pub return_assumptions: ReturnAssumptions,
    pub spending_phases: Vec<SpendingPhase>,
    pub withdrawal_strategy: WithdrawalStrategyConfig,
    pub drawdown_strategy: DrawdownStrategy,
    pub income_events: Vec<IncomeEvent>,
    pub expense_events: Vec<ExpenseEvent>,
    pub cape_ratio: Option<f64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            mode: PlanMode::Planning,
            simulation_mode: SimulationMode::Manual,
            historical_era: "all".to_string(),
            core: CoreParams::default(),
            portfolio: AssetBalances::new(60_000_000, 30_000_000, 10_000_000),
            return_assumptions: ReturnAssumptions::default(),
            spending_phases: Vec::new(),
            withdrawal_strategy: WithdrawalStrategyConfig::default(),
            drawdown_strategy: DrawdownStrategy::default(),
            income_events: Vec::new(),
            expense_events: Vec::new(),
            cape_ratio: None,
        }
    }
}

/// Longest horizon a plan may simulate.
pub const MAX_DURATION_YEARS: u32 = 100;
/// Upper bound for `startingAge` and `withdrawalStartAge`.
pub const MAX_AGE: u32 = 150;

impl SimulationConfig {
    pub fn duration_months(&self) -> u32 {
        self.core.duration_years.saturating_mul(12)
    }

    /// Simulation years before withdrawals begin.
    pub fn deferral_years(&self) -> u32 {
        self.core
            .withdrawal_start_age
            .saturating_sub(self.core.starting_age)
    }

    /// Calendar (year, month 1-12) of a 1-based month index.
    pub fn calendar(&self, month_index: u32) -> (i32, u32) {
        let start = self.core.retirement_start_date;
        let absolute = start.year() as i64 * 12 + start.month0() as i64 + month_index as i64 - 1;
        (absolute.div_euclid(12) as i32, absolute.rem_euclid(12) as u32 + 1)
    }

    /// Phase covering `year`; years no phase covers fall back to the last phase.
    pub fn phase_for_year(&self, year: u32) -> Option<&SpendingPhase> {
        self.spending_phases
            .iter()
            .find(|phase| phase.contains(year))
            .or_else(|| self.spending_phases.last())
    }

    pub fn validate(&self) -> Result<()> {
        if self.core.duration_years == 0 || self.core.duration_years > MAX_DURATION_YEARS {
            return Err(SimError::InvalidConfig(format!(
                "durationYears must be between 1 and {MAX_DURATION_YEARS}"
            )));
        }
        if self.core.starting_age > MAX_AGE || self.core.withdrawal_start_age > MAX_AGE {
            return Err(SimError::InvalidConfig(format!(
                "startingAge and withdrawalStartAge must be <= {MAX_AGE}"
            )));
        }
        if self.core.withdrawal_start_age < self.core.starting_age {
            return Err(SimError::InvalidConfig(
                "withdrawalStartAge must be >= startingAge".to_string(),
            ));
        }
        if !self.core.inflation_rate.is_finite() || self.core.inflation_rate <= -1.0 {
            return Err(SimError::InvalidConfig(
                "inflationRate must be > -100%".to_string(),
            ));
        }
        for asset in AssetClass::ALL {
            if self.portfolio.get(asset) < 0 {
                return Err(SimError::InvalidConfig(format!(
                    "starting {asset:?} balance must be >= 0"
                )));
            }
            let assumption = self.return_assumptions.get(asset);
            if !assumption.expected_return.is_finite()
                || !assumption.std_dev.is_finite()
                || assumption.std_dev < 0.0
            {
                return Err(SimError::InvalidConfig(format!(
                    "return assumption for {asset:?} must be finite with non-negative stdDev"
                )));
            }
        }

        let mut phases = self.spending_phases.iter().collect::<Vec<_>>();
        phases.sort_by_key(|phase| phase.start_year);
        for phase in &phases {
            if phase.end_year < phase.start_year {
                return Err(SimError::InvalidConfig(format!(
                    "spending phase '{}' ends before it starts",
                    phase.name
                )));
            }
            if let (Some(min), Some(max)) = (phase.min_monthly_spend, phase.max_monthly_spend) {
                if min > max {
                    return Err(SimError::InvalidConfig(format!(
                        "spending phase '{}' has minMonthlySpend above maxMonthlySpend",
                        phase.name
                    )));
                }
            }
        }
        for pair in phases.windows(2) {
            if pair[1].start_year <= pair[0].end_year {
                return Err(SimError::InvalidConfig(format!(
                    "spending phases '{}' and '{}' overlap",
                    pair[0].name, pair[1].name
                )));
            }
        }

        for event in &self.income_events {
            if event.amount < 0 {
                return Err(SimError::InvalidConfig(format!(
                    "income event '{}' must have a non-negative amount",
                    event.name
                )));
            }
        }
        for event in &self.expense_events {
            if event.amount < 0 {
                return Err(SimError::InvalidConfig(format!(
                    "expense event '{}' must have a non-negative amount",
                    event.name
                )));
            }
        }

        self.drawdown_strategy.validate()
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalDetail {
    pub requested: Cents,
    pub actual: Cents,
    pub shortfall: Cents,
    pub by_asset: AssetBalances,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlySimulationRow {
    pub month_index: u32,
    pub year_index: u32,
    pub calendar_year: i32,
    pub calendar_month: u32,
    pub age: u32,
    pub start_balances: AssetBalances,
    pub market_change: AssetBalances,
    pub withdrawal: WithdrawalDetail,
    pub income_total: Cents,
    pub expense_total: Cents,
    pub expense_shortfall: Cents,
    pub end_balances: AssetBalances,
    pub inflation_factor: f64,
    pub is_actual: bool,
}

impl MonthlySimulationRow {
    pub fn start_total(&self) -> Cents {
        self.start_balances.total()
    }

    pub fn end_total(&self) -> Cents {
        self.end_balances.total()
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationSummary {
    pub months: u32,
    pub total_withdrawn: Cents,
    pub total_shortfall: Cents,
    pub final_value: Cents,
    pub depleted_month: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationOutput {
    pub rows: Vec<MonthlySimulationRow>,
    pub summary: SimulationSummary,
}

/// User-entered actuals for one month. Every field is optional and absolute.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MonthOverride {
    pub start_balances: Option<AssetBalances>,
    pub withdrawals: Option<AssetBalances>,
    pub income_total: Option<Cents>,
    pub expense_total: Option<Cents>,
}

/// Keyed by 1-based month index.
pub type ActualOverridesByMonth = BTreeMap<u32, MonthOverride>;

/// First month not covered by actuals: one past the last override in tracking mode, else 1.
pub fn first_projected_month(mode: PlanMode, overrides: Option<&ActualOverridesByMonth>) -> u32 {
    match (mode, overrides) {
        (PlanMode::Tracking, Some(map)) => map.keys().next_back().map_or(1, |last| last + 1),
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calendar_rolls_over_year_boundary() {
        let mut config = SimulationConfig::default();
        config.core.retirement_start_date = NaiveDate::from_ymd_opt(2030, 11, 1).unwrap();
        assert_eq!(config.calendar(1), (2030, 11));
        assert_eq!(config.calendar(2), (2030, 12));
        assert_eq!(config.calendar(3), (2031, 1));
        assert_eq!(config.calendar(15), (2032, 1));
    }

    #[test]
    fn phase_lookup_falls_back_to_last_phase() {
        let mut config = SimulationConfig::default();
        config.spending_phases = vec![
            SpendingPhase {
                name: "go-go".to_string(),
                start_year: 1,
                end_year: 10,
                min_monthly_spend: Some(300_000),
                max_monthly_spend: None,
            },
            SpendingPhase {
                name: "slow-go".to_string(),
                start_year: 11,
                end_year: 20,
                min_monthly_spend: Some(200_000),
                max_monthly_spend: None,
            },
        ];
        assert_eq!(config.phase_for_year(5).unwrap().name, "go-go");
        assert_eq!(config.phase_for_year(11).unwrap().name, "slow-go");
        assert_eq!(config.phase_for_year(27).unwrap().name, "slow-go");
    }

    #[test]
    fn validate_bounds_duration_and_ages() {
        let mut config = SimulationConfig::default();
        config.core.duration_years = 400_000_000;
        let err = config.validate().expect_err("absurd horizon must be rejected");
        assert!(err.to_string().contains("durationYears"));
        assert_eq!(config.duration_months(), u32::MAX);

        config.core.duration_years = MAX_DURATION_YEARS;
        assert!(config.validate().is_ok());

        config.core.starting_age = u32::MAX;
        config.core.withdrawal_start_age = u32::MAX;
        let err = config.validate().expect_err("absurd age must be rejected");
        assert!(err.to_string().contains("startingAge"));
    }

    #[test]
    fn validate_rejects_overlapping_phases() {
        let mut config = SimulationConfig::default();
        config.spending_phases = vec![
            SpendingPhase {
                name: "a".to_string(),
                start_year: 1,
                end_year: 10,
                ..SpendingPhase::default()
            },
            SpendingPhase {
                name: "b".to_string(),
                start_year: 10,
                end_year: 20,
                ..SpendingPhase::default()
            },
        ];
        let err = config.validate().expect_err("overlap must be rejected");
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn validate_rejects_withdrawal_start_before_starting_age() {
        let mut config = SimulationConfig::default();
        config.core.starting_age = 65;
        config.core.withdrawal_start_age = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn quarterly_events_fire_every_third_month() {
        let event = IncomeEvent {
            amount: 100,
            start_year: 2,
            end_year: Some(3),
            frequency: EventFrequency::Quarterly,
            ..IncomeEvent::default()
        };
        let fired = (0..12).filter(|m| event.fires_in(2, *m)).collect::<Vec<_>>();
        assert_eq!(fired, vec![0, 3, 6, 9]);
        assert!(!event.fires_in(1, 0));
        assert!(!event.fires_in(4, 0));
    }

    #[test]
    fn first_projected_month_follows_last_override_in_tracking_mode() {
        let mut overrides = ActualOverridesByMonth::new();
        overrides.insert(2, MonthOverride::default());
        overrides.insert(5, MonthOverride::default());
        assert_eq!(first_projected_month(PlanMode::Tracking, Some(&overrides)), 6);
        assert_eq!(first_projected_month(PlanMode::Planning, Some(&overrides)), 1);
        assert_eq!(first_projected_month(PlanMode::Tracking, None), 1);
    }

    #[test]
    fn config_deserializes_from_minimal_json() {
        let config: SimulationConfig = serde_json::from_str(
            r#"{
              "core": { "durationYears": 25, "retirementStartDate": "2031-04-01" },
              "portfolio": { "stocks": 100000000 }
            }"#,
        )
        .expect("minimal config should parse");
        assert_eq!(config.core.duration_years, 25);
        assert_eq!(config.core.starting_age, 60);
        assert_eq!(config.portfolio, AssetBalances::new(100_000_000, 0, 0));
        assert_eq!(config.historical_era, "all");
    }
}
