//! Connector contracts + config-driven bulk-file and REST connectors.

use std::collections::BTreeMap;

use async_trait::async_trait;
use pdc_core::{GeoLevel, Vintage};
use pdc_geo::RawGeoKey;
use pdc_storage::{FetchError, HttpFetcher, Payload, SourceKey, TtlClass};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "pdc-adapters";

/// Tokens that bulk files use for "no value".
const MISSING_TOKENS: &[&str] = &["", "NA", "N/A", "NaN", "nan", ".", "null", "NULL", "-"];

/// Census API annotation values standing in for suppressed or unavailable
/// estimates.
const CENSUS_SENTINELS: &[&str] = &[
    "-111111111",
    "-222222222",
    "-333333333",
    "-555555555",
    "-666666666",
    "-888888888",
    "-999999999",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKind {
    BulkFile,
    RestApi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    Csv,
    /// JSON array whose first row is the header, as served by api.census.gov.
    CensusJson,
}

impl PayloadFormat {
    pub fn extension(self) -> &'static str {
        match self {
            PayloadFormat::Csv => "csv",
            PayloadFormat::CensusJson => "json",
        }
    }
}

/// Which columns hold the location of a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GeoKeySpec {
    Code {
        column: String,
    },
    StateName {
        column: String,
    },
    CountyName {
        county_column: String,
        state_column: String,
    },
    /// State/county/tract stored in separate (often integer) columns.
    Parts {
        state_column: String,
        #[serde(default)]
        county_column: Option<String>,
        #[serde(default)]
        tract_column: Option<String>,
    },
}

impl GeoKeySpec {
    fn columns(&self) -> Vec<&str> {
        match self {
            GeoKeySpec::Code { column } | GeoKeySpec::StateName { column } => vec![column.as_str()],
            GeoKeySpec::CountyName {
                county_column,
                state_column,
            } => vec![county_column.as_str(), state_column.as_str()],
            GeoKeySpec::Parts {
                state_column,
                county_column,
                tract_column,
            } => std::iter::once(state_column.as_str())
                .chain(county_column.as_deref())
                .chain(tract_column.as_deref())
                .collect(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// One entry of `connectors.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub access: AccessKind,
    pub format: PayloadFormat,
    pub url: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    pub ttl_class: TtlClass,
    pub level: GeoLevel,
    pub geo: GeoKeySpec,
    #[serde(default)]
    pub weight_column: Option<String>,
    /// Source column → metric name.
    pub metrics: BTreeMap<String, String>,
    #[serde(default)]
    pub vintage: Option<Vintage>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl ConnectorConfig {
    pub fn validate(&self) -> Result<(), ConnectorError> {
        let invalid = |message: String| ConnectorError::Config {
            source_id: self.source_id.clone(),
            message,
        };
        if self.source_id.trim().is_empty() {
            return Err(invalid("source_id is empty".to_string()));
        }
        if self.metrics.is_empty() {
            return Err(invalid("no metrics configured".to_string()));
        }
        let mut names = self.metrics.values().collect::<Vec<_>>();
        names.sort();
        if let Some(pair) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(invalid(format!("metric name {:?} used twice", pair[0])));
        }
        let key_columns = self.geo.columns();
        if let Some(col) = self.metrics.keys().find(|c| key_columns.contains(&c.as_str())) {
            return Err(invalid(format!("column {col:?} is both a key and a metric")));
        }
        if let GeoKeySpec::Parts {
            county_column: None,
            tract_column: Some(_),
            ..
        } = &self.geo
        {
            return Err(invalid("tract_column requires county_column".to_string()));
        }
        Ok(())
    }
}

/// One parsed row before key normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawObservation {
    /// 1-based data row number within the payload.
    pub row: usize,
    pub key: RawGeoKey,
    pub metrics: BTreeMap<String, Option<f64>>,
    pub weight: Option<f64>,
}

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("connector {source_id}: {message}")]
    Config { source_id: String, message: String },
    #[error("{source_id}: payload is missing column {column:?}")]
    MissingColumn { source_id: String, column: String },
    #[error("{source_id} row {row}: column {column:?} value {value:?} is not numeric")]
    BadNumber {
        source_id: String,
        row: usize,
        column: String,
        value: String,
    },
    #[error("{source_id}: malformed payload: {message}")]
    Malformed { source_id: String, message: String },
    #[error("{source_id}: {source}")]
    Csv {
        source_id: String,
        #[source]
        source: csv::Error,
    },
    #[error("{source_id}: {source}")]
    Json {
        source_id: String,
        #[source]
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait Connector: Send + Sync {
    fn config(&self) -> &ConnectorConfig;

    fn source_id(&self) -> &str {
        &self.config().source_id
    }

    fn access(&self) -> AccessKind {
        self.config().access
    }

    fn ttl_class(&self) -> TtlClass {
        self.config().ttl_class
    }

    fn level(&self) -> GeoLevel {
        self.config().level
    }

    fn vintage(&self) -> Option<Vintage> {
        self.config().vintage
    }

    /// Canonical request identity; names the cache entry.
    fn source_key(&self) -> SourceKey {
        let config = self.config();
        SourceKey::new(config.url.clone(), config.params.clone())
    }

    /// The cache's `fetch_fn`: retrieve the raw payload for `key`.
    async fn fetch(&self, http: &HttpFetcher, key: &SourceKey) -> Result<Payload, FetchError>;

    fn parse(&self, bytes: &[u8]) -> Result<Vec<RawObservation>, ConnectorError>;
}

/// Bulk CSV download with a header row.
#[derive(Debug, Clone)]
pub struct CsvConnector {
    config: ConnectorConfig,
}

impl CsvConnector {
    pub fn new(config: ConnectorConfig) -> Result<Self, ConnectorError> {
        config.validate()?;
        Ok(Self { config })
    }
}

#[async_trait]
impl Connector for CsvConnector {
    fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    async fn fetch(&self, http: &HttpFetcher, key: &SourceKey) -> Result<Payload, FetchError> {
        let body = fetch_body(http, self.source_id(), key).await?;
        Ok(Payload::new(body, PayloadFormat::Csv.extension()))
    }

    fn parse(&self, bytes: &[u8]) -> Result<Vec<RawObservation>, ConnectorError> {
        let source_id = &self.config.source_id;
        let csv_err = |source: csv::Error| ConnectorError::Csv {
            source_id: source_id.clone(),
            source,
        };
        let mut rdr = csv::ReaderBuilder::new()
            .flexible(false)
            .from_reader(bytes);
        let headers = rdr
            .headers()
            .map_err(csv_err)?
            .iter()
            .map(|h| h.trim().trim_start_matches('\u{feff}').to_string())
            .collect::<Vec<_>>();
        let layout = RowLayout::resolve(&self.config, &headers)?;

        let mut out = Vec::new();
        for (idx, record) in rdr.records().enumerate() {
            let record = record.map_err(csv_err)?;
            let cells = record.iter().map(Some).collect::<Vec<_>>();
            out.push(layout.observation(idx + 1, &cells)?);
        }
        debug!(source_id = %source_id, rows = out.len(), "parsed csv payload");
        Ok(out)
    }
}

/// REST endpoint answering with a census-style JSON table.
#[derive(Debug, Clone)]
pub struct CensusJsonConnector {
    config: ConnectorConfig,
}

impl CensusJsonConnector {
    pub fn new(config: ConnectorConfig) -> Result<Self, ConnectorError> {
        config.validate()?;
        Ok(Self { config })
    }
}

#[async_trait]
impl Connector for CensusJsonConnector {
    fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    async fn fetch(&self, http: &HttpFetcher, key: &SourceKey) -> Result<Payload, FetchError> {
        let body = fetch_body(http, self.source_id(), key).await?;
        Ok(Payload::new(body, PayloadFormat::CensusJson.extension()))
    }

    fn parse(&self, bytes: &[u8]) -> Result<Vec<RawObservation>, ConnectorError> {
        let source_id = &self.config.source_id;
        let table: Vec<Vec<JsonValue>> =
            serde_json::from_slice(bytes).map_err(|source| ConnectorError::Json {
                source_id: source_id.clone(),
                source,
            })?;
        let mut rows = table.into_iter();
        let headers = rows
            .next()
            .ok_or_else(|| ConnectorError::Malformed {
                source_id: source_id.clone(),
                message: "empty response".to_string(),
            })?
            .iter()
            .map(|cell| json_cell(cell).unwrap_or_default())
            .collect::<Vec<_>>();
        let layout = RowLayout::resolve(&self.config, &headers)?;

        let mut out = Vec::new();
        for (idx, row) in rows.enumerate() {
            if row.len() != headers.len() {
                return Err(ConnectorError::Malformed {
                    source_id: source_id.clone(),
                    message: format!(
                        "row {} has {} cells, header has {}",
                        idx + 1,
                        row.len(),
                        headers.len()
                    ),
                });
            }
            let owned = row.iter().map(json_cell).collect::<Vec<_>>();
            let cells = owned.iter().map(|c| c.as_deref()).collect::<Vec<_>>();
            out.push(layout.observation(idx + 1, &cells)?);
        }
        debug!(source_id = %source_id, rows = out.len(), "parsed census json payload");
        Ok(out)
    }
}

/// Build the connector for a config entry.
pub fn connector_from_config(config: ConnectorConfig) -> Result<Box<dyn Connector>, ConnectorError> {
    match config.format {
        PayloadFormat::Csv => Ok(Box::new(CsvConnector::new(config)?)),
        PayloadFormat::CensusJson => Ok(Box::new(CensusJsonConnector::new(config)?)),
    }
}

/// `file://` URLs are read from disk; everything else goes through the
/// shared fetcher with its retry policy.
async fn fetch_body(http: &HttpFetcher, source_id: &str, key: &SourceKey) -> Result<Vec<u8>, FetchError> {
    let body = match key.url().strip_prefix("file://") {
        Some(path) => tokio::fs::read(path).await.map_err(|source| FetchError::Io {
            path: path.to_string(),
            source,
        })?,
        None => http.fetch(source_id, key).await?.body,
    };
    if body.is_empty() {
        return Err(FetchError::Unavailable {
            source_id: source_id.to_string(),
            message: format!("empty body from {}", key.url()),
        });
    }
    Ok(body)
}

fn json_cell(cell: &JsonValue) -> Option<String> {
    match cell {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Column positions resolved once per payload.
struct RowLayout<'a> {
    config: &'a ConnectorConfig,
    key: KeyColumns,
    weight: Option<usize>,
    metrics: Vec<(usize, &'a str, &'a str)>,
}

enum KeyColumns {
    Code(usize),
    StateName(usize),
    CountyName { county: usize, state: usize },
    Parts {
        state: usize,
        county: Option<usize>,
        tract: Option<usize>,
    },
}

impl<'a> RowLayout<'a> {
    fn resolve(config: &'a ConnectorConfig, headers: &[String]) -> Result<Self, ConnectorError> {
        let find = |column: &str| {
            headers
                .iter()
                .position(|h| h == column)
                .ok_or_else(|| ConnectorError::MissingColumn {
                    source_id: config.source_id.clone(),
                    column: column.to_string(),
                })
        };
        let key = match &config.geo {
            GeoKeySpec::Code { column } => KeyColumns::Code(find(column)?),
            GeoKeySpec::StateName { column } => KeyColumns::StateName(find(column)?),
            GeoKeySpec::CountyName {
                county_column,
                state_column,
            } => KeyColumns::CountyName {
                county: find(county_column)?,
                state: find(state_column)?,
            },
            GeoKeySpec::Parts {
                state_column,
                county_column,
                tract_column,
            } => KeyColumns::Parts {
                state: find(state_column)?,
                county: county_column.as_deref().map(find).transpose()?,
                tract: tract_column.as_deref().map(find).transpose()?,
            },
        };
        let weight = config.weight_column.as_deref().map(find).transpose()?;
        let metrics = config
            .metrics
            .iter()
            .map(|(column, name)| Ok((find(column)?, column.as_str(), name.as_str())))
            .collect::<Result<Vec<_>, ConnectorError>>()?;
        Ok(Self {
            config,
            key,
            weight,
            metrics,
        })
    }

    fn observation(&self, row: usize, cells: &[Option<&str>]) -> Result<RawObservation, ConnectorError> {
        let text = |idx: usize| cells.get(idx).copied().flatten().unwrap_or("").trim().to_string();
        let key = match &self.key {
            KeyColumns::Code(idx) => RawGeoKey::Code(text(*idx)),
            KeyColumns::StateName(idx) => RawGeoKey::StateName(text(*idx)),
            KeyColumns::CountyName { county, state } => RawGeoKey::CountyName {
                county: text(*county),
                state: text(*state),
            },
            KeyColumns::Parts {
                state,
                county,
                tract,
            } => RawGeoKey::Parts {
                state: text(*state),
                county: county.map(text),
                tract: tract.map(text),
            },
        };

        let number = |idx: usize, column: &str| {
            let raw = cells.get(idx).copied().flatten();
            parse_number(raw).ok_or_else(|| ConnectorError::BadNumber {
                source_id: self.config.source_id.clone(),
                row,
                column: column.to_string(),
                value: raw.unwrap_or("").to_string(),
            })
        };

        let weight = match (self.weight, self.config.weight_column.as_deref()) {
            (Some(idx), Some(column)) => number(idx, column)?,
            _ => None,
        };
        let mut metrics = BTreeMap::new();
        for (idx, column, name) in &self.metrics {
            metrics.insert(name.to_string(), number(*idx, column)?);
        }
        Ok(RawObservation {
            row,
            key,
            metrics,
            weight,
        })
    }
}

/// `Some(None)` for an explicit missing marker, `None` when the cell is not
/// a number at all.
fn parse_number(raw: Option<&str>) -> Option<Option<f64>> {
    let Some(raw) = raw.map(str::trim) else {
        return Some(None);
    };
    if MISSING_TOKENS.contains(&raw) || CENSUS_SENTINELS.contains(&raw) {
        return Some(None);
    }
    let cleaned = raw.replace(',', "");
    match cleaned.parse::<f64>() {
        Ok(v) if v.is_finite() => Some(Some(v)),
        _ => None,
    }
}
