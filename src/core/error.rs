use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("amortization period must be positive, got {0}")]
    InvalidAmortizationPeriod(i64),

    #[error("unknown historical era: {0}")]
    UnknownEra(String),

    #[error("no historical months available for era {0}")]
    EmptyHistory(String),

    #[error("failed to load historical returns from {path}: {reason}")]
    HistoryLoad { path: String, reason: String },

    #[error("malformed historical returns CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("return series too short: need {needed} months, got {got}")]
    ReturnSeriesTooShort { needed: usize, got: usize },

    #[error("run count must be between 1 and 5000, got {0}")]
    InvalidRunCount(u32),

    #[error("at most 4 stress scenarios are supported, got {0}")]
    TooManyScenarios(usize),
}

impl SimError {
    /// Whether the failure comes from the caller's input rather than the process environment.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, SimError::HistoryLoad { .. } | SimError::Csv(_))
    }
}

pub type Result<T> = std::result::Result<T, SimError>;
