use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::error::{Result, SimError};
use super::types::{AssetClass, AssetReturns};

/// One month of historical nominal returns as fractions.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalMonth {
    pub year: i32,
    pub month: u32,
    pub returns: AssetReturns,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CsvRow {
    year: i32,
    month: u32,
    stocks_pct: f64,
    bonds_pct: f64,
    cash_pct: f64,
}

impl From<CsvRow> for HistoricalMonth {
    fn from(row: CsvRow) -> Self {
        HistoricalMonth {
            year: row.year,
            month: row.month,
            returns: AssetReturns::new(
                row.stocks_pct / 100.0,
                row.bonds_pct / 100.0,
                row.cash_pct / 100.0,
            ),
        }
    }
}

/// Parses `year,month,stocksPct,bondsPct,cashPct` rows (percent units) in file order.
pub fn parse_history_csv<R: Read>(reader: R) -> Result<Vec<HistoricalMonth>> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let mut months = Vec::new();
    for row in csv_reader.deserialize::<CsvRow>() {
        months.push(row?.into());
    }
    Ok(months)
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HistoricalEra {
    All,
    GreatDepression,
    PostWarBoom,
    OilCrisis,
    GreatModeration,
    DotComAndGfc,
    PostGfc,
}

impl HistoricalEra {
    pub const ALL: [HistoricalEra; 7] = [
        HistoricalEra::All,
        HistoricalEra::GreatDepression,
        HistoricalEra::PostWarBoom,
        HistoricalEra::OilCrisis,
        HistoricalEra::GreatModeration,
        HistoricalEra::DotComAndGfc,
        HistoricalEra::PostGfc,
    ];

    pub fn key(self) -> &'static str {
        match self {
            HistoricalEra::All => "all",
            HistoricalEra::GreatDepression => "greatDepression",
            HistoricalEra::PostWarBoom => "postWarBoom",
            HistoricalEra::OilCrisis => "oilCrisis",
            HistoricalEra::GreatModeration => "greatModeration",
            HistoricalEra::DotComAndGfc => "dotComAndGfc",
            HistoricalEra::PostGfc => "postGfc",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            HistoricalEra::All => "Full History",
            HistoricalEra::GreatDepression => "Great Depression 1929-1941",
            HistoricalEra::PostWarBoom => "Post-War Boom 1946-1965",
            HistoricalEra::OilCrisis => "Oil Crisis 1973-1982",
            HistoricalEra::GreatModeration => "Great Moderation 1983-1999",
            HistoricalEra::DotComAndGfc => "Dot-Com and Financial Crisis 2000-2009",
            HistoricalEra::PostGfc => "Post-Crisis 2010-Present",
        }
    }

    /// Inclusive calendar-year window.
    pub fn bounds(self) -> (i32, i32) {
        match self {
            HistoricalEra::All => (i32::MIN, i32::MAX),
            HistoricalEra::GreatDepression => (1929, 1941),
            HistoricalEra::PostWarBoom => (1946, 1965),
            HistoricalEra::OilCrisis => (1973, 1982),
            HistoricalEra::GreatModeration => (1983, 1999),
            HistoricalEra::DotComAndGfc => (2000, 2009),
            HistoricalEra::PostGfc => (2010, i32::MAX),
        }
    }

    pub fn from_key(key: &str) -> Result<Self> {
        let key = key.trim();
        let key = if key.is_empty() { "all" } else { key };
        HistoricalEra::ALL
            .into_iter()
            .find(|era| era.key().eq_ignore_ascii_case(key))
            .ok_or_else(|| SimError::UnknownEra(key.to_string()))
    }

    pub fn contains(self, year: i32) -> bool {
        let (start, end) = self.bounds();
        (start..=end).contains(&year)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalSummary {
    pub era: HistoricalEra,
    pub label: String,
    pub start_year: i32,
    pub end_year: i32,
    pub sample_size: usize,
    /// Monthly means.
    pub mean: AssetReturns,
    /// Monthly sample standard deviations.
    pub std_dev: AssetReturns,
}

impl HistoricalSummary {
    pub fn from_months(era: HistoricalEra, months: &[HistoricalMonth]) -> Self {
        let n = months.len();
        let mut mean = AssetReturns::default();
        let mut std_dev = AssetReturns::default();

        if n > 0 {
            for asset in AssetClass::ALL {
                let avg = months.iter().map(|m| m.returns.get(asset)).sum::<f64>() / n as f64;
                *mean.get_mut(asset) = avg;
                if n > 1 {
                    let variance = months
                        .iter()
                        .map(|m| (m.returns.get(asset) - avg).powi(2))
                        .sum::<f64>()
                        / (n - 1) as f64;
                    *std_dev.get_mut(asset) = variance.sqrt();
                }
            }
        }

        HistoricalSummary {
            era,
            label: era.label().to_string(),
            start_year: months.iter().map(|m| m.year).min().unwrap_or(0),
            end_year: months.iter().map(|m| m.year).max().unwrap_or(0),
            sample_size: n,
            mean,
            std_dev,
        }
    }
}

#[derive(Debug)]
enum HistorySource {
    Csv(PathBuf),
    Memory(Vec<HistoricalMonth>),
}

/// Historical monthly returns, loaded on first use and shared read-only afterwards.
#[derive(Debug)]
pub struct HistoricalDataProvider {
    source: HistorySource,
    cache: Mutex<Option<Arc<Vec<HistoricalMonth>>>>,
}

impl HistoricalDataProvider {
    pub fn from_csv_path(path: impl AsRef<Path>) -> Self {
        Self {
            source: HistorySource::Csv(path.as_ref().to_path_buf()),
            cache: Mutex::new(None),
        }
    }

    pub fn from_months(months: Vec<HistoricalMonth>) -> Self {
        Self {
            source: HistorySource::Memory(months),
            cache: Mutex::new(None),
        }
    }

    fn load(&self) -> Result<Vec<HistoricalMonth>> {
        match &self.source {
            HistorySource::Memory(months) => Ok(months.clone()),
            HistorySource::Csv(path) => {
                let file = File::open(path).map_err(|e| SimError::HistoryLoad {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
                let months = parse_history_csv(file)?;
                info!(
                    path = %path.display(),
                    months = months.len(),
                    "loaded historical returns"
                );
                Ok(months)
            }
        }
    }

    /// All loaded months. Concurrent first calls wait on the same load.
    pub fn months(&self) -> Result<Arc<Vec<HistoricalMonth>>> {
        let mut guard = self.cache.lock();
        if let Some(months) = guard.as_ref() {
            return Ok(Arc::clone(months));
        }
        let months = Arc::new(self.load()?);
        debug!(months = months.len(), "historical returns cache filled");
        *guard = Some(Arc::clone(&months));
        Ok(months)
    }

    /// Months inside the era's window. An empty window is an error.
    pub fn era_months(&self, era: HistoricalEra) -> Result<Vec<HistoricalMonth>> {
        let months = self
            .months()?
            .iter()
            .filter(|m| era.contains(m.year))
            .copied()
            .collect::<Vec<_>>();
        if months.is_empty() {
            return Err(SimError::EmptyHistory(era.key().to_string()));
        }
        Ok(months)
    }

    pub fn summary(&self, era: HistoricalEra) -> Result<HistoricalSummary> {
        let months = self.era_months(era)?;
        Ok(HistoricalSummary::from_months(era, &months))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSV: &str = "year,month,stocksPct,bondsPct,cashPct\n\
        1972,12,1.0,0.5,0.3\n\
        1973,1,-2.0,0.4,0.5\n\
        1973,2,4.0,0.2,0.5\n\
        1982,12,3.0,1.0,0.8\n\
        1983,1,2.0,0.6,0.7\n";

    fn provider() -> HistoricalDataProvider {
        HistoricalDataProvider::from_months(parse_history_csv(CSV.as_bytes()).unwrap())
    }

    #[test]
    fn parses_percent_columns_into_fractions() {
        let months = parse_history_csv(CSV.as_bytes()).expect("csv should parse");
        assert_eq!(months.len(), 5);
        assert_eq!(months[1].year, 1973);
        assert_eq!(months[1].month, 1);
        assert!((months[1].returns.stocks + 0.02).abs() < 1e-12);
        assert!((months[1].returns.cash - 0.005).abs() < 1e-12);
    }

    #[test]
    fn malformed_csv_is_an_error() {
        let csv = "year,month,stocksPct,bondsPct,cashPct\n1973,1,abc,1,1\n";
        let err = parse_history_csv(csv.as_bytes()).expect_err("bad number must fail");
        assert!(matches!(err, SimError::Csv(_)));
    }

    #[test]
    fn era_window_is_inclusive() {
        let months = provider().era_months(HistoricalEra::OilCrisis).unwrap();
        let years = months.iter().map(|m| m.year).collect::<Vec<_>>();
        assert_eq!(years, vec![1973, 1973, 1982]);
    }

    #[test]
    fn unknown_era_key_is_fatal() {
        assert!(matches!(
            HistoricalEra::from_key("roaringTwenties"),
            Err(SimError::UnknownEra(_))
        ));
        assert_eq!(HistoricalEra::from_key("OILCRISIS").unwrap(), HistoricalEra::OilCrisis);
        assert_eq!(HistoricalEra::from_key("").unwrap(), HistoricalEra::All);
    }

    #[test]
    fn empty_era_is_fatal() {
        let err = provider()
            .era_months(HistoricalEra::GreatDepression)
            .expect_err("no 1930s data");
        assert!(matches!(err, SimError::EmptyHistory(_)));
    }

    #[test]
    fn summary_reports_mean_std_dev_and_sample_size() {
        let summary = provider().summary(HistoricalEra::OilCrisis).unwrap();
        assert_eq!(summary.sample_size, 3);
        assert_eq!((summary.start_year, summary.end_year), (1973, 1982));
        assert!((summary.mean.stocks - 0.01).abs() < 1e-12);
        // stocks: -0.02, 0.04, 0.03 around 0.01 -> variance (0.0009 + 0.0009 + 0.0004) / 2
        assert!((summary.std_dev.stocks - 0.0011f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn missing_file_is_a_load_error() {
        let provider = HistoricalDataProvider::from_csv_path("/nonexistent/drawdown/history.csv");
        assert!(matches!(provider.months(), Err(SimError::HistoryLoad { .. })));
    }

    #[test]
    fn csv_is_read_once_and_cached() {
        let path = std::env::temp_dir().join(format!(
            "drawdown-history-cache-{}.csv",
            std::process::id()
        ));
        std::fs::write(&path, CSV).unwrap();
        let provider = HistoricalDataProvider::from_csv_path(&path);
        let first = provider.months().unwrap();
        std::fs::remove_file(&path).unwrap();
        let second = provider.months().expect("cached months survive file removal");
        assert!(Arc::ptr_eq(&first, &second));
    }
}
