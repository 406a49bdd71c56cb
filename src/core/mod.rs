mod drawdown;
mod engine;
mod error;
mod history;
mod math;
mod monte_carlo;
mod rolling;
mod strategies;
mod stress;
mod types;

pub use drawdown::{
    DrawdownOutcome, DrawdownStrategy, GlidePathWaypoint, apply_drawdown, interpolate_glide_path,
    resolve_allocation,
};
pub use engine::{
    MIN_MONTHLY_RETURN, MonthInput, PathEnv, PathState, advance_month,
    deterministic_monthly_returns, generate_monthly_returns_from_assumptions,
    reforecast_deterministic, simulate, simulate_path, summarize,
};
pub use error::{Result, SimError};
pub use history::{
    HistoricalDataProvider, HistoricalEra, HistoricalMonth, HistoricalSummary, parse_history_csv,
};
pub use math::{
    InflationSchedule, Mulberry32, annual_to_monthly_rate, build_inflation_factors,
    derive_run_seed, entropy_seed, percentile, pmt, round_to_cents,
};
pub use monte_carlo::{
    DEFAULT_RUNS, MAX_RUNS, MonteCarloOptions, MonteCarloOutput, MonteCarloResult,
    PercentileCurves, ReturnTransform, run_monte_carlo, run_monte_carlo_with,
};
pub use rolling::{RollingRealReturns, RollingWindow};
pub use strategies::*;
pub use stress::{
    CustomShockYear, MAX_SCENARIOS, ScenarioMetrics, ScenarioShock, ShockKind, StressBase,
    StressOptions, StressScenario, StressScenarioResult, StressTestResult, TimingPoint,
    TimingSensitivity, first_year_below_base, run_stress_test, total_real_drawdown,
};
pub use types::*;
