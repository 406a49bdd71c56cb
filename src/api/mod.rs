use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router,
    extract::{Json, Query, State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::core::{
    ActualOverridesByMonth, AssetReturns, DEFAULT_RUNS, HistoricalDataProvider, HistoricalEra,
    MAX_RUNS, MAX_SCENARIOS, MonteCarloOptions, SimError, SimulationConfig, SimulationOutput,
    StressOptions, StressScenario, reforecast_deterministic, run_monte_carlo, run_stress_test,
    simulate,
};

#[derive(Parser, Debug)]
#[command(
    name = "drawdown",
    about = "Retirement drawdown projector (single paths, Monte Carlo, reforecasts, stress tests)"
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "DRAWDOWN_HISTORY_CSV",
        default_value = "data/historical_returns.csv",
        help = "CSV of monthly returns: year,month,stocksPct,bondsPct,cashPct"
    )]
    history_csv: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the JSON API
    Serve {
        #[arg(long, env = "DRAWDOWN_PORT", default_value_t = 8080)]
        port: u16,
    },
    /// Simulate one path from the configured return assumptions
    Simulate {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        seed: Option<u32>,
    },
    /// Monte Carlo over resampled historical months
    MonteCarlo {
        #[arg(long)]
        config: PathBuf,
        #[arg(long, default_value_t = DEFAULT_RUNS)]
        runs: u32,
        #[arg(long)]
        seed: Option<u32>,
        #[arg(long, help = "JSON object of month index -> actuals")]
        overrides: Option<PathBuf>,
    },
    /// Expected-return path with actual months applied
    Reforecast {
        #[arg(long)]
        config: PathBuf,
        #[arg(long, help = "JSON object of month index -> actuals")]
        overrides: PathBuf,
    },
    /// Compare up to four shock scenarios against a baseline
    Stress {
        #[arg(long)]
        config: PathBuf,
        #[arg(long, help = "JSON array of scenarios")]
        scenarios: PathBuf,
        #[arg(long)]
        overrides: Option<PathBuf>,
        #[arg(long)]
        seed: Option<u32>,
        #[arg(long, default_value_t = DEFAULT_RUNS)]
        runs: u32,
        #[arg(long)]
        timing_sensitivity: bool,
    },
    /// Summary statistics for a historical era
    History {
        #[arg(long, default_value = "all")]
        era: String,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SimulatePayload {
    config: SimulationConfig,
    monthly_returns: Option<Vec<AssetReturns>>,
    seed: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct MonteCarloPayload {
    config: SimulationConfig,
    runs: Option<u32>,
    seed: Option<u32>,
    actual_overrides_by_month: Option<ActualOverridesByMonth>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ReforecastPayload {
    config: SimulationConfig,
    actual_overrides_by_month: ActualOverridesByMonth,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct StressPayload {
    config: SimulationConfig,
    scenarios: Vec<StressScenario>,
    seed: Option<u32>,
    runs: Option<u32>,
    actual_overrides_by_month: Option<ActualOverridesByMonth>,
    monthly_returns: Option<Vec<AssetReturns>>,
    base: Option<SimulationOutput>,
    include_timing_sensitivity: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HistoryQuery {
    era: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Clone)]
struct AppState {
    history: Arc<HistoricalDataProvider>,
}

fn validate_runs(runs: Option<u32>) -> Result<u32, String> {
    let runs = runs.unwrap_or(DEFAULT_RUNS);
    if !(1..=MAX_RUNS).contains(&runs) {
        return Err(format!("runs must be between 1 and {MAX_RUNS}"));
    }
    Ok(runs)
}

fn monte_carlo_options(payload: &MonteCarloPayload) -> Result<MonteCarloOptions, String> {
    Ok(MonteCarloOptions {
        runs: validate_runs(payload.runs)?,
        seed: payload.seed,
        actual_overrides_by_month: payload.actual_overrides_by_month.clone(),
    })
}

fn stress_options(payload: &StressPayload) -> Result<StressOptions, String> {
    if payload.scenarios.len() > MAX_SCENARIOS {
        return Err(format!("at most {MAX_SCENARIOS} scenarios are supported"));
    }
    Ok(StressOptions {
        seed: payload.seed,
        actual_overrides_by_month: payload.actual_overrides_by_month.clone(),
        monthly_returns: payload.monthly_returns.clone(),
        base: payload.base.clone(),
        runs: validate_runs(payload.runs)?,
        include_timing_sensitivity: payload.include_timing_sensitivity,
    })
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let history = Arc::new(HistoricalDataProvider::from_csv_path(&cli.history_csv));

    match cli.command {
        Command::Serve { port } => {
            let months = history
                .months()
                .with_context(|| format!("loading {}", cli.history_csv.display()))?;
            info!(months = months.len(), "historical returns ready");
            run_http_server(port, history)
                .await
                .context("HTTP server failed")
        }
        Command::Simulate { config, seed } => {
            let config: SimulationConfig = read_json(&config)?;
            print_json(&simulate(&config, None, seed)?)
        }
        Command::MonteCarlo {
            config,
            runs,
            seed,
            overrides,
        } => {
            let config: SimulationConfig = read_json(&config)?;
            let options = MonteCarloOptions {
                runs,
                seed,
                actual_overrides_by_month: overrides.as_deref().map(read_json).transpose()?,
            };
            print_json(&run_monte_carlo(&config, &options, &history)?)
        }
        Command::Reforecast { config, overrides } => {
            let config: SimulationConfig = read_json(&config)?;
            let overrides: ActualOverridesByMonth = read_json(&overrides)?;
            print_json(&reforecast_deterministic(&config, &overrides)?)
        }
        Command::Stress {
            config,
            scenarios,
            overrides,
            seed,
            runs,
            timing_sensitivity,
        } => {
            let config: SimulationConfig = read_json(&config)?;
            let scenarios: Vec<StressScenario> = read_json(&scenarios)?;
            let options = StressOptions {
                seed,
                actual_overrides_by_month: overrides.as_deref().map(read_json).transpose()?,
                runs,
                include_timing_sensitivity: timing_sensitivity,
                ..StressOptions::default()
            };
            print_json(&run_stress_test(&config, &scenarios, &options, &history)?)
        }
        Command::History { era } => {
            let era = HistoricalEra::from_key(&era)?;
            print_json(&history.summary(era)?)
        }
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/simulate", post(simulate_handler))
        .route("/api/monte-carlo", post(monte_carlo_handler))
        .route("/api/reforecast", post(reforecast_handler))
        .route("/api/stress-test", post(stress_handler))
        .route("/api/history/summary", get(history_summary_handler))
        .fallback(not_found_handler)
        .with_state(state)
}

pub async fn run_http_server(
    port: u16,
    history: Arc<HistoricalDataProvider>,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = router(AppState { history });

    let listener = TcpListener::bind(addr).await?;
    info!("drawdown API listening on http://{addr}");

    axum::serve(listener, app).await
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

/// Runs CPU-bound work off the async runtime and maps the outcome to a JSON response.
async fn compute<T, F>(job: F) -> Response
where
    T: Serialize + Send + 'static,
    F: FnOnce() -> Result<T, SimError> + Send + 'static,
{
    match tokio::task::spawn_blocking(job).await {
        Ok(Ok(body)) => json_response(StatusCode::OK, body),
        Ok(Err(err)) => sim_error_response(&err),
        Err(err) => {
            error!(error = %err, "simulation task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "simulation task failed")
        }
    }
}

async fn simulate_handler(payload: Result<Json<SimulatePayload>, JsonRejection>) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, &rejection.body_text()),
    };
    compute(move || simulate(&payload.config, payload.monthly_returns.as_deref(), payload.seed))
        .await
}

async fn monte_carlo_handler(
    State(state): State<AppState>,
    payload: Result<Json<MonteCarloPayload>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, &rejection.body_text()),
    };
    let options = match monte_carlo_options(&payload) {
        Ok(options) => options,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    compute(move || run_monte_carlo(&payload.config, &options, &state.history)).await
}

async fn reforecast_handler(payload: Result<Json<ReforecastPayload>, JsonRejection>) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, &rejection.body_text()),
    };
    compute(move || reforecast_deterministic(&payload.config, &payload.actual_overrides_by_month))
        .await
}

async fn stress_handler(
    State(state): State<AppState>,
    payload: Result<Json<StressPayload>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, &rejection.body_text()),
    };
    let options = match stress_options(&payload) {
        Ok(options) => options,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    compute(move || {
        run_stress_test(&payload.config, &payload.scenarios, &options, &state.history)
    })
    .await
}

async fn history_summary_handler(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let era_key = query.era.unwrap_or_else(|| "all".to_string());
    compute(move || {
        let era = HistoricalEra::from_key(&era_key)?;
        state.history.summary(era)
    })
    .await
}

fn sim_error_response(err: &SimError) -> Response {
    if err.is_client_error() {
        error_response(StatusCode::BAD_REQUEST, &err.to_string())
    } else {
        warn!(error = %err, "request failed on server-side data");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

#[cfg(test)]
fn monte_carlo_payload_from_json(json: &str) -> Result<MonteCarloPayload, String> {
    serde_json::from_str::<MonteCarloPayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))
}
