//! Core geographic data model and error taxonomy for PDC.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod table;

pub use table::{Column, ColumnType, RowRef, Table, TableError, Value};

pub const CRATE_NAME: &str = "pdc-core";

/// Identifier used for the single national unit.
pub const NATIONAL_ID: &str = "US";

/// Granularity of a geographic unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeoLevel {
    Tract,
    County,
    CommutingZone,
    Zip,
    State,
    National,
}

impl GeoLevel {
    pub const ALL: [GeoLevel; 6] = [
        GeoLevel::Tract,
        GeoLevel::County,
        GeoLevel::CommutingZone,
        GeoLevel::Zip,
        GeoLevel::State,
        GeoLevel::National,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            GeoLevel::Tract => "tract",
            GeoLevel::County => "county",
            GeoLevel::CommutingZone => "commuting_zone",
            GeoLevel::Zip => "zip",
            GeoLevel::State => "state",
            GeoLevel::National => "national",
        }
    }

    /// Canonical width of a code at this level.
    pub fn code_width(self) -> usize {
        match self {
            GeoLevel::Tract => 11,
            GeoLevel::County => 5,
            GeoLevel::CommutingZone => 5,
            GeoLevel::Zip => 5,
            GeoLevel::State => 2,
            GeoLevel::National => NATIONAL_ID.len(),
        }
    }

    /// Coarseness rank; larger is coarser. ZIP and tract share the finest rank.
    pub fn rank(self) -> u8 {
        match self {
            GeoLevel::Tract | GeoLevel::Zip => 0,
            GeoLevel::County => 1,
            GeoLevel::CommutingZone => 2,
            GeoLevel::State => 3,
            GeoLevel::National => 4,
        }
    }

    pub fn is_coarser_than(self, other: GeoLevel) -> bool {
        self.rank() > other.rank()
    }

    /// Levels whose codes nest by prefix: state[2] ⊂ county[5] ⊂ tract[11].
    pub fn is_fips_hierarchy(self) -> bool {
        matches!(self, GeoLevel::Tract | GeoLevel::County | GeoLevel::State)
    }
}

impl fmt::Display for GeoLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GeoLevel {
    type Err = GeoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tract" => Ok(GeoLevel::Tract),
            "county" => Ok(GeoLevel::County),
            "commuting_zone" | "commuting-zone" | "cz" => Ok(GeoLevel::CommutingZone),
            "zip" | "zipcode" | "zip_code" => Ok(GeoLevel::Zip),
            "state" => Ok(GeoLevel::State),
            "national" | "nation" | "us" => Ok(GeoLevel::National),
            other => Err(GeoError::InvalidGeography {
                raw: other.to_string(),
                reason: "unknown geography level".to_string(),
            }),
        }
    }
}

/// Canonical fixed-width geographic key. Codes are always strings so leading
/// zeros survive; construction validates the width for the level.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(into = "String")]
pub struct GeoId {
    level: GeoLevel,
    code: String,
}

impl GeoId {
    pub fn new(level: GeoLevel, code: impl Into<String>) -> Result<Self, GeoError> {
        let code = code.into();
        let valid = match level {
            GeoLevel::National => code == NATIONAL_ID,
            _ => code.len() == level.code_width() && code.bytes().all(|b| b.is_ascii_digit()),
        };
        if !valid {
            return Err(GeoError::InvalidGeography {
                raw: code,
                reason: format!(
                    "expected a {}-character canonical {} code",
                    level.code_width(),
                    level
                ),
            });
        }
        Ok(Self { level, code })
    }

    pub fn national() -> Self {
        Self {
            level: GeoLevel::National,
            code: NATIONAL_ID.to_string(),
        }
    }

    pub fn level(&self) -> GeoLevel {
        self.level
    }

    pub fn as_str(&self) -> &str {
        &self.code
    }

    /// Containing unit obtained by prefix truncation, for pairs that nest.
    pub fn ancestor(&self, coarse: GeoLevel) -> Option<GeoId> {
        if coarse == GeoLevel::National {
            return Some(GeoId::national());
        }
        if coarse == self.level {
            return Some(self.clone());
        }
        if !(self.level.is_fips_hierarchy()
            && coarse.is_fips_hierarchy()
            && coarse.is_coarser_than(self.level))
        {
            return None;
        }
        Some(GeoId {
            level: coarse,
            code: self.code[..coarse.code_width()].to_string(),
        })
    }

    /// Two-digit state FIPS prefix for tract/county/state codes.
    pub fn state_code(&self) -> Option<&str> {
        self.level
            .is_fips_hierarchy()
            .then(|| &self.code[..GeoLevel::State.code_width()])
    }
}

impl fmt::Display for GeoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code)
    }
}

impl From<GeoId> for String {
    fn from(value: GeoId) -> Self {
        value.code
    }
}

/// Time period a dataset's values describe, e.g. `2019` or `2015-2019`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Vintage {
    start: u16,
    end: u16,
}

impl Vintage {
    pub fn year(year: u16) -> Self {
        Self {
            start: year,
            end: year,
        }
    }

    pub fn span(start: u16, end: u16) -> Result<Self, GeoError> {
        if end < start {
            return Err(GeoError::InvalidVintage(format!("{start}-{end}")));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }
}

impl fmt::Display for Vintage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

impl FromStr for Vintage {
    type Err = GeoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_year = |part: &str| {
            part.trim()
                .parse::<u16>()
                .map_err(|_| GeoError::InvalidVintage(s.to_string()))
        };
        match s.split_once('-') {
            Some((a, b)) => Vintage::span(parse_year(a)?, parse_year(b)?),
            None => Ok(Vintage::year(parse_year(s)?)),
        }
    }
}

impl TryFrom<String> for Vintage {
    type Error = GeoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Vintage> for String {
    fn from(value: Vintage) -> Self {
        value.to_string()
    }
}

/// A single observation tied to a geography. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeoRecord {
    geo_id: GeoId,
    metrics: BTreeMap<String, Option<f64>>,
    weight: Option<f64>,
}

impl GeoRecord {
    /// Non-finite metric values are stored as missing; weights must be finite
    /// and non-negative.
    pub fn new(
        geo_id: GeoId,
        metrics: BTreeMap<String, Option<f64>>,
        weight: Option<f64>,
    ) -> Result<Self, GeoError> {
        if let Some(w) = weight {
            if !w.is_finite() || w < 0.0 {
                return Err(GeoError::InvalidWeight { geo_id, weight: w });
            }
        }
        let metrics = metrics
            .into_iter()
            .map(|(name, value)| (name, value.filter(|v| v.is_finite())))
            .collect();
        Ok(Self {
            geo_id,
            metrics,
            weight,
        })
    }

    pub fn geo_id(&self) -> &GeoId {
        &self.geo_id
    }

    pub fn geo_level(&self) -> GeoLevel {
        self.geo_id.level()
    }

    pub fn metrics(&self) -> &BTreeMap<String, Option<f64>> {
        &self.metrics
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied().flatten()
    }

    pub fn weight(&self) -> Option<f64> {
        self.weight
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Statistic {
    Mean,
    WeightedMean,
    Sum,
    Count,
}

impl Statistic {
    pub fn as_str(self) -> &'static str {
        match self {
            Statistic::Mean => "mean",
            Statistic::WeightedMean => "weighted_mean",
            Statistic::Sum => "sum",
            Statistic::Count => "count",
        }
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Statistic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "mean" => Ok(Statistic::Mean),
            "weighted_mean" | "wmean" => Ok(Statistic::WeightedMean),
            "sum" => Ok(Statistic::Sum),
            "count" => Ok(Statistic::Count),
            other => Err(format!("unknown statistic {other:?}")),
        }
    }
}

/// Non-fatal marker for a coarse unit built from too few fine units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregationUnderflowWarning {
    pub geo_id: GeoId,
    pub n_contributors: usize,
    pub minimum: usize,
}

impl fmt::Display for AggregationUnderflowWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} aggregated from {} fine units (minimum {})",
            self.geo_id.level(),
            self.geo_id,
            self.n_contributors,
            self.minimum
        )
    }
}

/// One coarse unit produced by aggregation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedRecord {
    pub geo_id: GeoId,
    pub statistic: Statistic,
    pub metrics: BTreeMap<String, Option<f64>>,
    pub total_weight: Option<f64>,
    pub n_contributors: usize,
    pub low_reliability: bool,
}

impl AggregatedRecord {
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied().flatten()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedResult {
    pub target_level: GeoLevel,
    pub statistic: Statistic,
    pub records: Vec<AggregatedRecord>,
    /// Fine units that had no crosswalk entry and were left out.
    pub unmapped_units: Vec<GeoId>,
    pub warnings: Vec<AggregationUnderflowWarning>,
    /// Set when a weighted mean was requested but computed unweighted.
    pub weight_fallback: bool,
}

impl AggregatedResult {
    pub fn get(&self, geo_id: &GeoId) -> Option<&AggregatedRecord> {
        self.records
            .binary_search_by(|r| r.geo_id.cmp(geo_id))
            .ok()
            .map(|idx| &self.records[idx])
    }

    pub fn low_reliability_count(&self) -> usize {
        self.records.iter().filter(|r| r.low_reliability).count()
    }

    pub fn metric_names(&self) -> Vec<String> {
        let mut names = self
            .records
            .iter()
            .flat_map(|r| r.metrics.keys().cloned())
            .collect::<Vec<_>>();
        names.sort();
        names.dedup();
        names
    }

    /// One row per coarse unit with the bookkeeping columns ahead of metrics.
    pub fn to_table(&self) -> Result<Table, TableError> {
        let metric_names = self.metric_names();
        let mut columns = vec![
            Column::text("geo_id"),
            Column::text("geo_level"),
            Column::text("statistic"),
            Column::number("n_contributors"),
            Column::number("total_weight"),
            Column::flag("low_reliability"),
        ];
        columns.extend(metric_names.iter().map(|name| Column::number(name.as_str())));
        let mut table = Table::new(columns)?;

        for record in &self.records {
            let mut row = vec![
                Value::Text(record.geo_id.to_string()),
                Value::Text(record.geo_id.level().to_string()),
                Value::Text(record.statistic.to_string()),
                Value::Number(record.n_contributors as f64),
                Value::from(record.total_weight),
                Value::Flag(record.low_reliability),
            ];
            row.extend(metric_names.iter().map(|name| Value::from(record.metric(name))));
            table.push_row(row)?;
        }
        Ok(table)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GeoError {
    #[error("invalid geography {raw:?}: {reason}")]
    InvalidGeography { raw: String, reason: String },
    #[error("geography mismatch in {context}: expected {expected}, found {found}")]
    GeographyMismatch {
        expected: GeoLevel,
        found: GeoLevel,
        context: String,
    },
    #[error("vintage mismatch for source {source_id}: expected {expected}, found {found}")]
    VintageMismatch {
        source_id: String,
        expected: String,
        found: String,
    },
    #[error("invalid vintage {0:?}")]
    InvalidVintage(String),
    #[error("weighted aggregation requested but {geo_id} has no weight")]
    MissingWeight { geo_id: GeoId },
    #[error("invalid weight {weight} for {geo_id}")]
    InvalidWeight { geo_id: GeoId, weight: f64 },
    #[error("invalid crosswalk: {0}")]
    InvalidCrosswalk(String),
    #[error("no crosswalk available from {fine} to {coarse}")]
    UnsupportedCrosswalk { fine: GeoLevel, coarse: GeoLevel },
    #[error("duplicate merge source id {0:?}")]
    DuplicateSource(String),
    #[error(transparent)]
    Table(#[from] TableError),
}
