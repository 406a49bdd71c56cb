use drawdown::core::{
    ActualOverridesByMonth, AssetBalances, AssetReturns, HistoricalDataProvider, HistoricalEra,
    HistoricalMonth, MonteCarloOptions, MonthOverride, Mulberry32, PlanMode, ShockKind,
    SimulationConfig, SimulationMode, StressOptions, StressScenario, parse_history_csv,
    reforecast_deterministic, run_monte_carlo, run_stress_test, simulate,
};

fn history() -> HistoricalDataProvider {
    let mut rng = Mulberry32::new(1926);
    let months = (1926..=2020)
        .flat_map(|year| (1..=12).map(move |month| (year, month)))
        .map(|(year, month)| HistoricalMonth {
            year,
            month,
            returns: AssetReturns::new(
                0.008 + 0.045 * rng.standard_normal(),
                0.004 + 0.012 * rng.standard_normal(),
                0.003,
            ),
        })
        .collect();
    HistoricalDataProvider::from_months(months)
}

fn config() -> SimulationConfig {
    let mut config = SimulationConfig::default();
    config.core.duration_years = 15;
    config
}

#[test]
fn csv_history_feeds_era_summaries() {
    let csv = "year,month,stocksPct,bondsPct,cashPct\n\
        1974,1,-1.0,0.4,0.6\n\
        1974,2,0.5,0.3,0.6\n\
        2008,10,-16.8,-2.2,0.1\n";
    let provider = HistoricalDataProvider::from_months(parse_history_csv(csv.as_bytes()).unwrap());

    let oil = provider.summary(HistoricalEra::OilCrisis).unwrap();
    assert_eq!(oil.sample_size, 2);
    let gfc = provider.summary(HistoricalEra::DotComAndGfc).unwrap();
    assert!((gfc.mean.stocks + 0.168).abs() < 1e-12);
    assert!(provider.summary(HistoricalEra::PostWarBoom).is_err());
}

#[test]
fn single_path_and_monte_carlo_share_the_row_shape() {
    let config = config();
    let path = simulate(&config, None, Some(5)).unwrap();
    assert_eq!(path.rows.len(), 180);

    let mc = run_monte_carlo(
        &config,
        &MonteCarloOptions {
            runs: 100,
            seed: Some(5),
            actual_overrides_by_month: None,
        },
        &history(),
    )
    .unwrap();
    assert_eq!(mc.representative_path.rows.len(), 180);
    assert_eq!(mc.monte_carlo.total.len(), 180);
    assert!(mc.representative_run_index < 100);
    assert!((0.0..=1.0).contains(&mc.monte_carlo.success_probability));
}

#[test]
fn tracking_plan_reforecasts_from_actuals() {
    let mut config = config();
    config.mode = PlanMode::Tracking;

    let mut overrides = ActualOverridesByMonth::new();
    overrides.insert(
        1,
        MonthOverride {
            start_balances: Some(AssetBalances::new(50_000_000, 30_000_000, 10_000_000)),
            ..MonthOverride::default()
        },
    );
    let output = reforecast_deterministic(&config, &overrides).unwrap();
    assert_eq!(output.rows[0].start_balances.total(), 90_000_000);
    assert!(output.rows[0].is_actual);
    assert!(!output.rows[1].is_actual);
}

#[test]
fn monte_carlo_stress_reports_success_deltas() {
    let mut config = config();
    config.simulation_mode = SimulationMode::MonteCarlo;
    let scenarios = vec![StressScenario {
        id: "crash".to_string(),
        name: "Broad crash".to_string(),
        shock: ShockKind::BroadMarketCrash {
            stock_drop_pct: -0.4,
            bond_drop_pct: -0.1,
        },
        start_year: 1,
    }];
    let options = StressOptions {
        seed: Some(11),
        runs: 60,
        ..StressOptions::default()
    };

    let result = run_stress_test(&config, &scenarios, &options, &history()).unwrap();
    let base = result.base.monte_carlo.as_ref().expect("base monte carlo");
    let shocked = result.scenarios[0].monte_carlo.as_ref().expect("scenario monte carlo");
    assert!(shocked.success_probability <= base.success_probability);
    let delta = result.scenarios[0].metrics.success_delta.expect("delta");
    assert!(
        (delta - (shocked.success_probability - base.success_probability) * 100.0).abs() < 1e-9
    );
    assert_eq!(result.seed_used, 11);
    assert!(result.timing_sensitivity.is_none());
}
