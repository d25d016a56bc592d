//! Join of several same-level sources on canonical geographic keys.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use pdc_core::{
    AggregatedResult, Column, GeoError, GeoId, GeoLevel, GeoRecord, Table, Value, Vintage,
};
use serde::Deserialize;
use tracing::debug;

const RESERVED_COLUMNS: &[&str] = &["geo_id", "geo_level", "vintage"];

#[derive(Debug, Clone, PartialEq)]
pub enum MergeData {
    Aggregated(AggregatedResult),
    Records(Vec<GeoRecord>),
}

/// One input to a merge: data already at the merge level, plus the period
/// it describes.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeSource {
    pub source_id: String,
    pub level: GeoLevel,
    pub vintage: Option<Vintage>,
    pub data: MergeData,
}

impl MergeSource {
    pub fn aggregated(
        source_id: impl Into<String>,
        vintage: Option<Vintage>,
        result: AggregatedResult,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            level: result.target_level,
            vintage,
            data: MergeData::Aggregated(result),
        }
    }

    pub fn records(
        source_id: impl Into<String>,
        level: GeoLevel,
        vintage: Option<Vintage>,
        records: Vec<GeoRecord>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            level,
            vintage,
            data: MergeData::Records(records),
        }
    }

    /// A level carried by the data that differs from the declared one.
    fn undeclared_level(&self) -> Option<GeoLevel> {
        match &self.data {
            MergeData::Aggregated(result) => {
                Some(result.target_level).filter(|level| *level != self.level)
            }
            MergeData::Records(records) => records
                .iter()
                .map(GeoRecord::geo_level)
                .find(|level| *level != self.level),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    /// Only keys present in every source.
    #[default]
    Inner,
    /// Union of keys; absent values are explicit missing markers.
    Outer,
}

impl fmt::Display for JoinKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JoinKind::Inner => "inner",
            JoinKind::Outer => "outer",
        })
    }
}

impl FromStr for JoinKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inner" => Ok(JoinKind::Inner),
            "outer" | "full" => Ok(JoinKind::Outer),
            other => Err(format!("unknown join {other:?}")),
        }
    }
}

/// Handling of sources that describe different periods. Values are never
/// averaged or interpolated across vintages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VintagePolicy {
    /// Attach vintage column(s) so callers can filter.
    #[default]
    Tag,
    RequireMatching,
}

struct Prepared<'a> {
    source: &'a MergeSource,
    rows: BTreeMap<&'a GeoId, Row<'a>>,
    metric_names: BTreeSet<&'a str>,
}

struct Row<'a> {
    metrics: &'a BTreeMap<String, Option<f64>>,
    low_reliability: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MergeEngine {
    vintage_policy: VintagePolicy,
}

impl MergeEngine {
    pub fn new(vintage_policy: VintagePolicy) -> Self {
        Self { vintage_policy }
    }

    pub fn vintage_policy(&self) -> VintagePolicy {
        self.vintage_policy
    }

    /// Columns: `geo_id`, `geo_level`, vintage column(s), then each source's
    /// metrics in input order. Metric names defined by more than one source,
    /// or clashing with a generated column, are prefixed `<source_id>_`; a
    /// prefixed name that is still taken gets a numeric suffix. Rows are
    /// ordered by `geo_id`.
    pub fn merge(&self, sources: &[MergeSource], join: JoinKind) -> Result<Table, GeoError> {
        let Some(first) = sources.first() else {
            return Ok(Table::new(vec![Column::text("geo_id"), Column::text("geo_level")])?);
        };
        let level = first.level;

        let mut seen = BTreeSet::new();
        for source in sources {
            if !seen.insert(source.source_id.as_str()) {
                return Err(GeoError::DuplicateSource(source.source_id.clone()));
            }
            if source.level != level {
                return Err(GeoError::GeographyMismatch {
                    expected: level,
                    found: source.level,
                    context: format!("merge source {}", source.source_id),
                });
            }
            if let Some(found) = source.undeclared_level() {
                return Err(GeoError::GeographyMismatch {
                    expected: source.level,
                    found,
                    context: format!("data of merge source {}", source.source_id),
                });
            }
        }
        let vintage_columns = self.vintage_columns(sources)?;

        let prepared = sources
            .iter()
            .map(prepare)
            .collect::<Result<Vec<_>, _>>()?;

        let mut columns = vec![Column::text("geo_id"), Column::text("geo_level")];
        match &vintage_columns {
            VintageColumns::None => {}
            VintageColumns::Shared(_) => columns.push(Column::text("vintage")),
            VintageColumns::PerSource => columns.extend(
                sources
                    .iter()
                    .map(|s| Column::text(format!("{}_vintage", s.source_id))),
            ),
        }
        let mut taken: HashSet<String> = columns.iter().map(|c| c.name.clone()).collect();
        taken.extend(
            prepared
                .iter()
                .filter(|p| matches!(p.source.data, MergeData::Aggregated(_)))
                .map(|p| reliability_column(&p.source.source_id)),
        );
        let output_names = metric_columns(&prepared, &mut taken);

        for (p, names) in prepared.iter().zip(&output_names) {
            columns.extend(names.iter().map(|name| Column::number(name.as_str())));
            if matches!(p.source.data, MergeData::Aggregated(_)) {
                columns.push(Column::flag(reliability_column(&p.source.source_id)));
            }
        }
        let mut table = Table::new(columns)?;

        let keys: BTreeSet<&GeoId> = match join {
            JoinKind::Inner => {
                let mut keys: BTreeSet<&GeoId> = prepared[0].rows.keys().copied().collect();
                for p in &prepared[1..] {
                    keys.retain(|k| p.rows.contains_key(k));
                }
                keys
            }
            JoinKind::Outer => prepared
                .iter()
                .flat_map(|p| p.rows.keys().copied())
                .collect(),
        };

        for key in &keys {
            let mut row = vec![
                Value::Text(key.to_string()),
                Value::Text(level.to_string()),
            ];
            match &vintage_columns {
                VintageColumns::None => {}
                VintageColumns::Shared(vintage) => row.push(Value::Text(vintage.to_string())),
                VintageColumns::PerSource => {
                    row.extend(prepared.iter().map(|p| {
                        match (p.rows.contains_key(key), p.source.vintage) {
                            (true, Some(v)) => Value::Text(v.to_string()),
                            _ => Value::Missing,
                        }
                    }))
                }
            }
            for p in &prepared {
                let present = p.rows.get(key);
                row.extend(p.metric_names.iter().map(|name| {
                    Value::from(present.and_then(|r| r.metrics.get(*name).copied().flatten()))
                }));
                if matches!(p.source.data, MergeData::Aggregated(_)) {
                    row.push(
                        present
                            .and_then(|r| r.low_reliability)
                            .map_or(Value::Missing, Value::Flag),
                    );
                }
            }
            table.push_row(row)?;
        }

        debug!(
            sources = sources.len(),
            rows = table.len(),
            columns = table.columns().len(),
            %join,
            %level,
            "merged"
        );
        Ok(table)
    }

    fn vintage_columns(&self, sources: &[MergeSource]) -> Result<VintageColumns, GeoError> {
        let first = sources[0].vintage;
        let all_equal = sources.iter().all(|s| s.vintage == first);
        if self.vintage_policy == VintagePolicy::RequireMatching && !all_equal {
            let describe = |v: Option<Vintage>| v.map_or("unspecified".to_string(), |v| v.to_string());
            if let Some(odd) = sources.iter().find(|s| s.vintage != first) {
                return Err(GeoError::VintageMismatch {
                    source_id: odd.source_id.clone(),
                    expected: describe(first),
                    found: describe(odd.vintage),
                });
            }
        }
        Ok(match (all_equal, first) {
            (true, Some(v)) => VintageColumns::Shared(v),
            (true, None) => VintageColumns::None,
            (false, _) => VintageColumns::PerSource,
        })
    }
}

enum VintageColumns {
    None,
    Shared(Vintage),
    PerSource,
}

fn reliability_column(source_id: &str) -> String {
    format!("{source_id}_low_reliability")
}

/// Output name for every metric of every source, aligned with each
/// source's `metric_names`. Unambiguous names are claimed first so a
/// prefixed name never displaces a metric a source really defines.
fn metric_columns(prepared: &[Prepared<'_>], taken: &mut HashSet<String>) -> Vec<Vec<String>> {
    let mut owners: HashMap<&str, usize> = HashMap::new();
    for p in prepared {
        for name in &p.metric_names {
            *owners.entry(*name).or_default() += 1;
        }
    }
    let mut names: Vec<Vec<Option<String>>> = Vec::with_capacity(prepared.len());
    let mut claimed = Vec::new();
    for p in prepared {
        let slots = p
            .metric_names
            .iter()
            .map(|metric| {
                let plain = owners.get(metric).copied().unwrap_or(0) == 1
                    && !RESERVED_COLUMNS.contains(metric)
                    && !taken.contains(*metric);
                plain.then(|| {
                    claimed.push(metric.to_string());
                    metric.to_string()
                })
            })
            .collect();
        names.push(slots);
    }
    taken.extend(claimed);

    for (p, slots) in prepared.iter().zip(names.iter_mut()) {
        for (metric, slot) in p.metric_names.iter().zip(slots.iter_mut()) {
            if slot.is_some() {
                continue;
            }
            let base = format!("{}_{metric}", p.source.source_id);
            let mut candidate = base.clone();
            let mut n = 2;
            while taken.contains(&candidate) {
                candidate = format!("{base}_{n}");
                n += 1;
            }
            taken.insert(candidate.clone());
            *slot = Some(candidate);
        }
    }

    names
        .into_iter()
        .map(|slots| slots.into_iter().flatten().collect())
        .collect()
}

fn prepare(source: &MergeSource) -> Result<Prepared<'_>, GeoError> {
    let mut rows = BTreeMap::new();
    let mut metric_names = BTreeSet::new();
    match &source.data {
        MergeData::Aggregated(result) => {
            for record in &result.records {
                metric_names.extend(record.metrics.keys().map(String::as_str));
                rows.insert(
                    &record.geo_id,
                    Row {
                        metrics: &record.metrics,
                        low_reliability: Some(record.low_reliability),
                    },
                );
            }
        }
        MergeData::Records(records) => {
            for record in records {
                metric_names.extend(record.metrics().keys().map(String::as_str));
                let row = Row {
                    metrics: record.metrics(),
                    low_reliability: None,
                };
                if rows.insert(record.geo_id(), row).is_some() {
                    return Err(GeoError::InvalidGeography {
                        raw: record.geo_id().to_string(),
                        reason: format!("appears twice in source {}", source.source_id),
                    });
                }
            }
        }
    }
    Ok(Prepared {
        source,
        rows,
        metric_names,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pdc_core::{AggregatedRecord, Statistic};

    fn county(code: &str) -> GeoId {
        GeoId::new(GeoLevel::County, code).unwrap()
    }

    fn rec(code: &str, name: &str, value: f64) -> GeoRecord {
        GeoRecord::new(
            county(code),
            BTreeMap::from([(name.to_string(), Some(value))]),
            None,
        )
        .unwrap()
    }

    fn sources() -> Vec<MergeSource> {
        vec![
            MergeSource::records("a", GeoLevel::County, None, vec![rec("06037", "value", 100.0)]),
            MergeSource::records(
                "b",
                GeoLevel::County,
                None,
                vec![rec("06037", "value", 200.0), rec("06059", "value", 300.0)],
            ),
        ]
    }

    #[test]
    fn inner_join_keeps_shared_keys_only() {
        let table = MergeEngine::default()
            .merge(&sources(), JoinKind::Inner)
            .unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(
            table.column_names(),
            vec!["geo_id", "geo_level", "a_value", "b_value"]
        );
        let row = table.row(0).unwrap();
        assert_eq!(row.text("geo_id"), Some("06037"));
        assert_eq!(row.number("a_value"), Some(100.0));
        assert_eq!(row.number("b_value"), Some(200.0));
    }

    #[test]
    fn outer_join_marks_absent_values_missing() {
        let table = MergeEngine::default()
            .merge(&sources(), JoinKind::Outer)
            .unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.value(1, "geo_id"), Some(&Value::Text("06059".into())));
        assert_eq!(table.value(1, "a_value"), Some(&Value::Missing));
        assert_eq!(table.value(1, "b_value"), Some(&Value::Number(300.0)));
    }

    #[test]
    fn distinct_metric_names_stay_unprefixed() {
        let sources = vec![
            MergeSource::records("a", GeoLevel::County, None, vec![rec("06037", "income", 1.0)]),
            MergeSource::records("b", GeoLevel::County, None, vec![rec("06037", "rent", 2.0)]),
        ];
        let table = MergeEngine::default().merge(&sources, JoinKind::Inner).unwrap();
        assert_eq!(table.column_names(), vec!["geo_id", "geo_level", "income", "rent"]);
    }

    #[test]
    fn mismatched_levels_and_duplicate_ids_fail() {
        let mut mixed = sources();
        mixed[1].level = GeoLevel::State;
        assert!(matches!(
            MergeEngine::default().merge(&mixed, JoinKind::Inner),
            Err(GeoError::GeographyMismatch { .. })
        ));

        let mut lying = sources();
        lying[0].data = MergeData::Records(vec![GeoRecord::new(
            GeoId::new(GeoLevel::State, "06").unwrap(),
            BTreeMap::new(),
            None,
        )
        .unwrap()]);
        assert!(matches!(
            MergeEngine::default().merge(&lying, JoinKind::Inner),
            Err(GeoError::GeographyMismatch { .. })
        ));

        let mut undeclared = sources();
        undeclared[1].data = MergeData::Records(vec![GeoRecord::new(
            GeoId::new(GeoLevel::State, "06").unwrap(),
            BTreeMap::new(),
            None,
        )
        .unwrap()]);
        assert!(matches!(
            MergeEngine::default().merge(&undeclared, JoinKind::Inner),
            Err(GeoError::GeographyMismatch { expected: GeoLevel::County, found: GeoLevel::State, .. })
        ));

        let mut dup = sources();
        dup[1].source_id = "a".into();
        assert_eq!(
            MergeEngine::default().merge(&dup, JoinKind::Inner),
            Err(GeoError::DuplicateSource("a".into()))
        );
    }

    #[test]
    fn declared_level_must_match_records_and_merge_level() {
        // county records declared as state, merged with a county source
        let srcs = vec![
            MergeSource::records("a", GeoLevel::County, None, vec![rec("06037", "value", 1.0)]),
            MergeSource::records("b", GeoLevel::State, None, vec![rec("06037", "rent", 2.0)]),
        ];
        let err = MergeEngine::default().merge(&srcs, JoinKind::Inner).unwrap_err();
        assert!(matches!(
            err,
            GeoError::GeographyMismatch { expected: GeoLevel::County, found: GeoLevel::State, .. }
        ));

        // every source declared state, but one holds county records
        let srcs = vec![
            MergeSource::records(
                "a",
                GeoLevel::State,
                None,
                vec![GeoRecord::new(GeoId::new(GeoLevel::State, "06").unwrap(), BTreeMap::new(), None)
                    .unwrap()],
            ),
            MergeSource::records("b", GeoLevel::State, None, vec![rec("06037", "rent", 2.0)]),
        ];
        let err = MergeEngine::default().merge(&srcs, JoinKind::Inner).unwrap_err();
        assert!(matches!(
            err,
            GeoError::GeographyMismatch { expected: GeoLevel::State, found: GeoLevel::County, .. }
        ));
    }

    #[test]
    fn prefixed_names_never_clash_with_real_metrics() {
        let srcs = vec![
            MergeSource::records("a", GeoLevel::County, None, vec![rec("06037", "value", 1.0)]),
            MergeSource::records("b", GeoLevel::County, None, vec![rec("06037", "value", 2.0)]),
            MergeSource::records("c", GeoLevel::County, None, vec![rec("06037", "a_value", 3.0)]),
        ];
        let table = MergeEngine::default().merge(&srcs, JoinKind::Inner).unwrap();
        assert_eq!(
            table.column_names(),
            vec!["geo_id", "geo_level", "a_value_2", "b_value", "a_value"]
        );
        let row = table.row(0).unwrap();
        assert_eq!(row.number("a_value_2"), Some(1.0));
        assert_eq!(row.number("b_value"), Some(2.0));
        assert_eq!(row.number("a_value"), Some(3.0));
    }

    #[test]
    fn metrics_named_like_generated_columns_are_prefixed() {
        let mut srcs = vec![
            MergeSource::records("a", GeoLevel::County, None, vec![rec("06037", "b_vintage", 1.0)]),
            MergeSource::records("b", GeoLevel::County, None, vec![rec("06037", "rent", 2.0)]),
        ];
        srcs[0].vintage = Some(Vintage::year(2019));
        srcs[1].vintage = Some(Vintage::year(2020));
        let table = MergeEngine::default().merge(&srcs, JoinKind::Inner).unwrap();
        assert_eq!(
            table.column_names(),
            vec!["geo_id", "geo_level", "a_vintage", "b_vintage", "a_b_vintage", "rent"]
        );
        assert_eq!(table.value(0, "b_vintage"), Some(&Value::Text("2020".into())));
        assert_eq!(table.value(0, "a_b_vintage"), Some(&Value::Number(1.0)));
    }

    #[test]
    fn differing_vintages_are_tagged_or_rejected() {
        let mut srcs = sources();
        srcs[0].vintage = Some(Vintage::year(2019));
        srcs[1].vintage = Some(Vintage::span(2015, 2019).unwrap());

        let table = MergeEngine::default().merge(&srcs, JoinKind::Outer).unwrap();
        assert_eq!(table.value(0, "a_vintage"), Some(&Value::Text("2019".into())));
        assert_eq!(
            table.value(0, "b_vintage"),
            Some(&Value::Text("2015-2019".into()))
        );
        assert_eq!(table.value(1, "a_vintage"), Some(&Value::Missing));

        let err = MergeEngine::new(VintagePolicy::RequireMatching)
            .merge(&srcs, JoinKind::Inner)
            .unwrap_err();
        assert!(matches!(err, GeoError::VintageMismatch { ref source_id, .. } if source_id == "b"));

        srcs[1].vintage = Some(Vintage::year(2019));
        let table = MergeEngine::new(VintagePolicy::RequireMatching)
            .merge(&srcs, JoinKind::Inner)
            .unwrap();
        assert_eq!(table.value(0, "vintage"), Some(&Value::Text("2019".into())));
    }

    #[test]
    fn aggregated_inputs_carry_reliability_flags() {
        let result = AggregatedResult {
            target_level: GeoLevel::County,
            statistic: Statistic::Mean,
            records: vec![AggregatedRecord {
                geo_id: county("06037"),
                statistic: Statistic::Mean,
                metrics: BTreeMap::from([("rate".to_string(), Some(0.5))]),
                total_weight: None,
                n_contributors: 2,
                low_reliability: true,
            }],
            unmapped_units: vec![],
            warnings: vec![],
            weight_fallback: false,
        };
        let srcs = vec![
            MergeSource::aggregated("tracts", None, result),
            MergeSource::records("b", GeoLevel::County, None, vec![rec("06037", "value", 1.0)]),
        ];
        let table = MergeEngine::default().merge(&srcs, JoinKind::Inner).unwrap();
        assert_eq!(
            table.column_names(),
            vec!["geo_id", "geo_level", "rate", "tracts_low_reliability", "value"]
        );
        assert_eq!(table.row(0).unwrap().flag("tracts_low_reliability"), Some(true));
    }
}
