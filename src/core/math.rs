use std::collections::BTreeMap;
use std::f64::consts::PI;

use super::error::{Result, SimError};
use super::types::Cents;

/// Rounds to whole cents, halves toward positive infinity (`10.5 -> 11`, `-10.5 -> -10`).
pub fn round_to_cents(value: f64) -> Cents {
    if !value.is_finite() {
        return 0;
    }
    (value + 0.5).floor() as Cents
}

pub fn annual_to_monthly_rate(annual_rate: f64) -> f64 {
    (1.0 + annual_rate).powf(1.0 / 12.0) - 1.0
}

/// Cumulative price level at the start of each month, `factors[0] == 1.0`.
pub fn build_inflation_factors(annual_rate: f64, months: u32) -> Vec<f64> {
    InflationSchedule::constant(annual_rate, months).factors
}

/// Annuity payment amortizing `present_value` over `periods` at `rate` per period.
pub fn pmt(rate: f64, periods: i64, present_value: f64) -> Result<f64> {
    if periods <= 0 {
        return Err(SimError::InvalidAmortizationPeriod(periods));
    }
    let n = periods as f64;
    if rate.abs() < 1e-12 {
        return Ok(present_value / n);
    }
    Ok(present_value * rate / (1.0 - (1.0 + rate).powf(-n)))
}

/// Linear-interpolated rank statistic; sorts `values` in place.
pub fn percentile(values: &mut [f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    values.sort_by(|a, b| a.total_cmp(b));

    let n = values.len();
    if n == 1 {
        return values[0];
    }

    let rank = (p / 100.0) * (n as f64 - 1.0);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;

    if lower == upper {
        values[lower]
    } else {
        let w = rank - lower as f64;
        values[lower] * (1.0 - w) + values[upper] * w
    }
}

/// Per-month inflation with optional per-simulation-year rate overrides.
#[derive(Clone, Debug, PartialEq)]
pub struct InflationSchedule {
    annual_rates: Vec<f64>,
    monthly_rates: Vec<f64>,
    factors: Vec<f64>,
}

impl InflationSchedule {
    pub fn constant(annual_rate: f64, months: u32) -> Self {
        Self::with_overrides(annual_rate, months, &BTreeMap::new())
    }

    /// `overrides` maps a 1-based simulation year to the annual rate used for its months.
    pub fn with_overrides(base_rate: f64, months: u32, overrides: &BTreeMap<u32, f64>) -> Self {
        let rates = (0..months)
            .map(|idx| overrides.get(&(idx / 12 + 1)).copied().unwrap_or(base_rate))
            .collect();
        Self::from_annual_rates(rates)
    }

    /// One annual rate per month, each converted to its monthly equivalent and compounded.
    pub fn from_annual_rates(annual_rates: Vec<f64>) -> Self {
        let mut monthly_rates = Vec::with_capacity(annual_rates.len());
        let mut factors = Vec::with_capacity(annual_rates.len() + 1);
        let mut level = 1.0;
        factors.push(level);

        for annual in &annual_rates {
            let monthly = annual_to_monthly_rate(*annual);
            monthly_rates.push(monthly);
            level *= 1.0 + monthly;
            factors.push(level);
        }

        Self {
            annual_rates,
            monthly_rates,
            factors,
        }
    }

    pub fn annual_rates(&self) -> &[f64] {
        &self.annual_rates
    }

    /// Price level at the start of the 1-based month.
    pub fn factor(&self, month_index: u32) -> f64 {
        let idx = (month_index.max(1) - 1) as usize;
        self.factors
            .get(idx)
            .or_else(|| self.factors.last())
            .copied()
            .unwrap_or(1.0)
    }

    pub fn monthly_rate(&self, month_index: u32) -> f64 {
        let idx = (month_index.max(1) - 1) as usize;
        self.monthly_rates
            .get(idx)
            .or_else(|| self.monthly_rates.last())
            .copied()
            .unwrap_or(0.0)
    }

    pub fn annual_rate(&self, month_index: u32) -> f64 {
        let idx = (month_index.max(1) - 1) as usize;
        self.annual_rates
            .get(idx)
            .or_else(|| self.annual_rates.last())
            .copied()
            .unwrap_or(0.0)
    }
}

/// Mulberry32: 32-bit state, one `u32` per step. Seeded streams are stable across platforms.
#[derive(Clone, Debug)]
pub struct Mulberry32 {
    state: u32,
}

impl Mulberry32 {
    pub fn new(seed: u32) -> Self {
        Self { state: seed }
    }

    pub fn next_u32(&mut self) -> u32 {
        self.state = self.state.wrapping_add(0x6D2B_79F5);
        let mut t = self.state;
        t = (t ^ (t >> 15)).wrapping_mul(t | 1);
        t = t.wrapping_add((t ^ (t >> 7)).wrapping_mul(t | 61)) ^ t;
        t ^ (t >> 14)
    }

    /// Uniform in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        self.next_u32() as f64 / 4_294_967_296.0
    }

    /// Uniform index in `0..len`.
    pub fn next_index(&mut self, len: usize) -> usize {
        ((self.next_f64() * len as f64) as usize).min(len.saturating_sub(1))
    }

    /// Box-Muller, two uniforms per draw, no caching of the paired value.
    pub fn standard_normal(&mut self) -> f64 {
        let mut u1 = self.next_f64();
        while u1 <= f64::EPSILON {
            u1 = self.next_f64();
        }
        let u2 = self.next_f64();
        (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
    }
}

pub fn derive_run_seed(base_seed: u32, run_index: u32) -> u32 {
    base_seed.wrapping_add(run_index.wrapping_mul(9973))
}

/// Fresh seed for callers that did not pin one.
pub fn entropy_seed() -> u32 {
    rand::random::<u32>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::{prop_assert, prop_assert_eq, proptest};

    const EPS: f64 = 1e-9;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn round_to_cents_rounds_halves_up() {
        assert_eq!(round_to_cents(10.5), 11);
        assert_eq!(round_to_cents(-10.5), -10);
        assert_eq!(round_to_cents(10.4999), 10);
        assert_eq!(round_to_cents(-10.6), -11);
        assert_eq!(round_to_cents(f64::NAN), 0);
    }

    #[test]
    fn monthly_rate_compounds_back_to_annual() {
        let monthly = annual_to_monthly_rate(0.07);
        assert_approx((1.0 + monthly).powi(12) - 1.0, 0.07);
        assert_approx(annual_to_monthly_rate(0.0), 0.0);
    }

    #[test]
    fn inflation_factors_start_at_one_and_reach_annual_rate_after_twelve_months() {
        let factors = build_inflation_factors(0.03, 24);
        assert_eq!(factors.len(), 25);
        assert_approx(factors[0], 1.0);
        assert_approx(factors[12], 1.03);
        assert_approx(factors[24], 1.03 * 1.03);
    }

    #[test]
    fn inflation_overrides_apply_only_to_their_year() {
        let mut overrides = BTreeMap::new();
        overrides.insert(2, 0.10);
        let schedule = InflationSchedule::with_overrides(0.02, 36, &overrides);
        assert_approx(schedule.annual_rate(12), 0.02);
        assert_approx(schedule.annual_rate(13), 0.10);
        assert_approx(schedule.annual_rate(25), 0.02);
        assert_approx(schedule.factor(25), 1.02 * 1.10);
    }

    #[test]
    fn pmt_matches_closed_form() {
        let payment = pmt(0.05, 10, 100_000.0).unwrap();
        assert!((payment - 12_950.457_5).abs() < 1e-3, "got {payment}");
        assert_approx(pmt(0.0, 4, 1_000.0).unwrap(), 250.0);
    }

    #[test]
    fn pmt_rejects_non_positive_periods() {
        assert!(matches!(
            pmt(0.05, 0, 1_000.0),
            Err(SimError::InvalidAmortizationPeriod(0))
        ));
        assert!(pmt(0.05, -3, 1_000.0).is_err());
    }

    #[test]
    fn percentile_interpolates_between_points() {
        let mut values = vec![4.0, 1.0, 3.0, 2.0];
        assert_approx(percentile(&mut values, 25.0), 1.75);
        assert_approx(percentile(&mut values, 50.0), 2.5);
        assert_approx(percentile(&mut values, 100.0), 4.0);
    }

    #[test]
    fn mulberry32_matches_reference_stream() {
        let mut rng = Mulberry32::new(42);
        assert_eq!(rng.next_u32(), 2_581_720_956);
        assert_eq!(rng.next_u32(), 1_925_393_290);
        assert_approx(Mulberry32::new(42).next_f64(), 2_581_720_956.0 / 4_294_967_296.0);
    }

    #[test]
    fn run_seeds_are_spaced_by_9973() {
        assert_eq!(derive_run_seed(7, 0), 7);
        assert_eq!(derive_run_seed(7, 3), 7 + 3 * 9973);
        assert_eq!(derive_run_seed(u32::MAX, 1), 9972);
    }

    proptest! {
        #[test]
        fn prop_uniform_draws_stay_in_unit_interval(seed in 0u32..u32::MAX) {
            let mut rng = Mulberry32::new(seed);
            for _ in 0..64 {
                let u = rng.next_f64();
                prop_assert!((0.0..1.0).contains(&u));
                prop_assert!(rng.standard_normal().is_finite());
            }
        }

        #[test]
        fn prop_rounding_is_within_half_a_cent(value in -1.0e12f64..1.0e12) {
            let rounded = round_to_cents(value) as f64;
            prop_assert!((rounded - value).abs() <= 0.5 + 1e-6);
        }

        #[test]
        fn prop_identical_seeds_give_identical_streams(seed in 0u32..u32::MAX) {
            let mut a = Mulberry32::new(seed);
            let mut b = Mulberry32::new(seed);
            for _ in 0..16 {
                prop_assert_eq!(a.next_u32(), b.next_u32());
            }
        }
    }
}
