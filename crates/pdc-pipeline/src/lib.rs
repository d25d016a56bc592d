//! Orchestration: connector registry, cache-backed dataset loading,
//! aggregation to a target level, merging and export.

mod export;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use pdc_adapters::{connector_from_config, Connector, ConnectorConfig};
use pdc_core::{AggregatedResult, GeoError, GeoLevel, GeoRecord, Statistic, Table, Vintage};
use pdc_geo::{
    AggregationConfig, AggregationEngine, CrosswalkFileSpec, CrosswalkRegistry, JoinKind,
    MergeData, MergeEngine, MergeSource, MissingWeightPolicy, Normalizer, VintagePolicy,
};
use pdc_storage::{
    CacheEntry, CacheManager, CacheStatus, EntryCheck, EntryStatus, HttpClientConfig, HttpFetcher,
    TtlPolicy,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use export::{
    export_table_parquet, write_query_outputs, ExportSummary, ParquetManifest, ParquetManifestFile,
};

pub const CRATE_NAME: &str = "pdc-pipeline";

const CROSSWALKS_FILE: &str = "crosswalks.yaml";
const COUNTY_NAMES_FILE: &str = "county_names.csv";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub cache_root: PathBuf,
    pub reference_dir: PathBuf,
    pub output_dir: PathBuf,
    pub connectors_file: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub min_contributors: usize,
    pub ttl: TtlPolicy,
    pub force_refresh: bool,
    pub missing_weight: MissingWeightPolicy,
    pub vintage_policy: VintagePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same defaults as [`PipelineConfig::from_env`], reading values through
    /// `lookup`. Unparseable numbers fall back to the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = |key: &str, default: &str| {
            PathBuf::from(lookup(key).unwrap_or_else(|| default.to_string()))
        };
        let number = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };
        let ttl_default = TtlPolicy::default();
        const DAY: u64 = 24 * 60 * 60;

        Self {
            cache_root: path("PDC_CACHE_ROOT", "./cache"),
            reference_dir: path("PDC_REFERENCE_DIR", "./reference"),
            output_dir: path("PDC_OUTPUT_DIR", "./reports"),
            connectors_file: path("PDC_CONNECTORS_FILE", "./connectors.yaml"),
            user_agent: lookup("PDC_USER_AGENT").unwrap_or_else(|| "pdc-bot/0.1".to_string()),
            http_timeout_secs: number("PDC_HTTP_TIMEOUT_SECS", 60),
            min_contributors: number("PDC_MIN_CONTRIBUTORS", 5) as usize,
            ttl: TtlPolicy {
                bulk: Duration::from_secs(number("PDC_TTL_BULK_DAYS", ttl_default.bulk.as_secs() / DAY) * DAY),
                api: Duration::from_secs(number("PDC_TTL_API_HOURS", ttl_default.api.as_secs() / 3600) * 3600),
                reference: Duration::from_secs(
                    number("PDC_TTL_REFERENCE_DAYS", ttl_default.reference.as_secs() / DAY) * DAY,
                ),
            },
            force_refresh: lookup("PDC_FORCE_REFRESH")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            missing_weight: match lookup("PDC_MISSING_WEIGHT").as_deref().map(str::trim) {
                Some("fallback_unweighted") => MissingWeightPolicy::FallbackUnweighted,
                _ => MissingWeightPolicy::Error,
            },
            vintage_policy: match lookup("PDC_VINTAGE_POLICY").as_deref().map(str::trim) {
                Some("require_matching") => VintagePolicy::RequireMatching,
                _ => VintagePolicy::Tag,
            },
        }
    }
}

/// Parsed `connectors.yaml`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConnectorRegistry {
    pub connectors: Vec<ConnectorConfig>,
}

impl ConnectorRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text)?;
        let mut seen = BTreeSet::new();
        for config in &registry.connectors {
            config.validate()?;
            if !seen.insert(config.source_id.as_str()) {
                bail!("connector {} is listed twice", config.source_id);
            }
        }
        Ok(registry)
    }

    pub fn get(&self, source_id: &str) -> Option<&ConnectorConfig> {
        self.connectors.iter().find(|c| c.source_id == source_id)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &ConnectorConfig> {
        self.connectors.iter().filter(|c| c.enabled)
    }

    /// Lookup with a "did you mean" hint for near-miss ids.
    fn require(&self, source_id: &str) -> Result<&ConnectorConfig> {
        if let Some(config) = self.get(source_id) {
            return Ok(config);
        }
        let closest = self
            .connectors
            .iter()
            .map(|c| (strsim::jaro_winkler(source_id, &c.source_id), c.source_id.as_str()))
            .filter(|(score, _)| *score >= 0.85)
            .max_by(|a, b| a.0.total_cmp(&b.0));
        match closest {
            Some((_, hint)) => Err(anyhow!("unknown source {source_id:?}; did you mean {hint:?}?")),
            None => Err(anyhow!("unknown source {source_id:?}")),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CrosswalksFile {
    #[serde(default)]
    crosswalks: Vec<CrosswalkFileSpec>,
}

/// Static crosswalks from `<reference_dir>/crosswalks.yaml`. A missing file
/// yields an empty registry; hierarchy roll-ups still work without it.
pub async fn load_crosswalks(reference_dir: &Path) -> Result<CrosswalkRegistry> {
    let path = reference_dir.join(CROSSWALKS_FILE);
    let mut registry = CrosswalkRegistry::new();
    let text = match fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "no crosswalk list; only hierarchy roll-ups available");
            return Ok(registry);
        }
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };
    let file: CrosswalksFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    for spec in &file.crosswalks {
        let crosswalk = spec
            .load(reference_dir)
            .with_context(|| format!("loading {} -> {} crosswalk", spec.fine, spec.coarse))?;
        info!(fine = %spec.fine, coarse = %spec.coarse, units = crosswalk.len(), "loaded crosswalk");
        if registry.insert(crosswalk).is_some() {
            bail!("{}: crosswalk {} -> {} listed twice", path.display(), spec.fine, spec.coarse);
        }
    }
    Ok(registry)
}

/// Built-in state table plus `<reference_dir>/county_names.csv` when present.
pub fn load_normalizer(reference_dir: &Path) -> Result<Normalizer> {
    let path = reference_dir.join(COUNTY_NAMES_FILE);
    if !path.exists() {
        debug!(path = %path.display(), "no county name table");
        return Ok(Normalizer::new());
    }
    let normalizer = Normalizer::new()
        .with_county_file(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    info!(counties = normalizer.county_count(), "loaded county names");
    Ok(normalizer)
}

/// A source's records, normalized to canonical keys.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub source_id: String,
    pub level: GeoLevel,
    pub vintage: Option<Vintage>,
    pub records: Vec<GeoRecord>,
    pub cache_entry: CacheEntry,
    pub cache_status: CacheStatus,
}

impl Dataset {
    pub fn served_stale(&self) -> bool {
        matches!(self.cache_status, CacheStatus::ServedStale { .. })
    }
}

#[derive(Debug, Clone)]
pub struct QuerySpec {
    pub sources: Vec<String>,
    pub level: GeoLevel,
    pub statistic: Statistic,
    pub join: JoinKind,
    pub force_refresh: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source_id: String,
    pub input_level: GeoLevel,
    pub vintage: Option<Vintage>,
    pub records: usize,
    pub cache_status: String,
    pub served_stale: bool,
    pub fetched_at: DateTime<Utc>,
    pub content_hash: String,
    /// Set when the source was rolled up to the query level.
    pub aggregated: bool,
    pub statistic: Option<Statistic>,
    pub unmapped_units: Vec<String>,
    pub low_reliability: usize,
    pub weight_fallback: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryReport {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub level: GeoLevel,
    pub statistic: Statistic,
    pub join: String,
    pub rows: usize,
    pub sources: Vec<SourceReport>,
}

impl QueryReport {
    pub fn stale_sources(&self) -> Vec<&str> {
        self.sources
            .iter()
            .filter(|s| s.served_stale)
            .map(|s| s.source_id.as_str())
            .collect()
    }

    pub fn low_reliability_rows(&self) -> usize {
        self.sources.iter().map(|s| s.low_reliability).sum()
    }
}

#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub table: Table,
    pub report: QueryReport,
}

pub struct Pipeline {
    config: PipelineConfig,
    registry: ConnectorRegistry,
    cache: CacheManager,
    http: HttpFetcher,
    normalizer: Normalizer,
    crosswalks: CrosswalkRegistry,
    aggregation: AggregationEngine,
    merge: MergeEngine,
}

impl Pipeline {
    /// Load the connector list and reference data named by `config`.
    pub async fn from_config(config: PipelineConfig) -> Result<Self> {
        let registry = ConnectorRegistry::load(&config.connectors_file).await?;
        let normalizer = load_normalizer(&config.reference_dir)?;
        let crosswalks = load_crosswalks(&config.reference_dir).await?;
        Self::new(config, registry, normalizer, crosswalks)
    }

    pub fn new(
        config: PipelineConfig,
        registry: ConnectorRegistry,
        normalizer: Normalizer,
        crosswalks: CrosswalkRegistry,
    ) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })
        .context("building http client")?;
        let aggregation = AggregationEngine::new(AggregationConfig {
            min_contributors: config.min_contributors,
            missing_weight: config.missing_weight,
        });
        Ok(Self {
            cache: CacheManager::new(config.cache_root.clone()),
            merge: MergeEngine::new(config.vintage_policy),
            config,
            registry,
            http,
            normalizer,
            crosswalks,
            aggregation,
        })
    }

    /// Replace the cache handle, e.g. one driven by a test clock.
    pub fn with_cache(mut self, cache: CacheManager) -> Self {
        self.cache = cache;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectorRegistry {
        &self.registry
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub async fn cache_status(&self) -> Result<Vec<EntryStatus>> {
        self.cache.list_entries().await.context("listing cache entries")
    }

    /// Re-hash every cached payload against its recorded digest.
    pub async fn verify_cache(&self) -> Result<Vec<EntryCheck>> {
        let checks = self.cache.verify_entries().await.context("verifying cache")?;
        let corrupt = checks.iter().filter(|c| !c.intact).count();
        if corrupt > 0 {
            warn!(corrupt, total = checks.len(), "cache payloads failed verification");
        }
        Ok(checks)
    }

    pub async fn purge_stale(&self) -> Result<usize> {
        let removed = self.cache.purge_stale().await.context("purging cache")?;
        info!(removed, "purged stale cache entries");
        Ok(removed)
    }

    /// Cache-or-fetch the source's payload, parse it and normalize every
    /// key. One unnormalizable key fails the whole load.
    pub async fn load_dataset(&self, source_id: &str, force_refresh: bool) -> Result<Dataset> {
        let config = self.registry.require(source_id)?;
        if !config.enabled {
            bail!("source {source_id} is disabled in {}", self.config.connectors_file.display());
        }
        let connector = connector_from_config(config.clone())?;
        let key = connector.source_key();
        let ttl = self.config.ttl.ttl_for(connector.ttl_class());
        let force = force_refresh || self.config.force_refresh;

        let connector_ref: &dyn Connector = connector.as_ref();
        let http = &self.http;
        let cached = self
            .cache
            .get_or_fetch(&key, ttl, force, move |key| async move {
                connector_ref.fetch(http, &key).await
            })
            .await
            .with_context(|| format!("loading {source_id}"))?;
        if let CacheStatus::ServedStale { error } = &cached.status {
            warn!(
                source_id,
                fetched_at = %cached.entry.fetched_at,
                %error,
                "refresh failed; using stale payload"
            );
        }

        let bytes = cached.read_bytes().await?;
        let observations = connector.parse(&bytes)?;
        let level = connector.level();
        let mut records = Vec::with_capacity(observations.len());
        for obs in observations {
            let geo_id = self
                .normalizer
                .normalize(&obs.key, Some(level))
                .with_context(|| format!("{source_id} row {}", obs.row))?;
            let record = GeoRecord::new(geo_id, obs.metrics, obs.weight)
                .with_context(|| format!("{source_id} row {}", obs.row))?;
            records.push(record);
        }
        info!(
            source_id,
            records = records.len(),
            status = ?cached.status,
            "dataset loaded"
        );

        Ok(Dataset {
            source_id: source_id.to_string(),
            level,
            vintage: connector.vintage(),
            records,
            cache_entry: cached.entry,
            cache_status: cached.status,
        })
    }

    /// Roll `dataset` up to `target` through a loaded, derived or composed
    /// crosswalk.
    pub fn aggregate_dataset(
        &self,
        dataset: &Dataset,
        target: GeoLevel,
        statistic: Statistic,
    ) -> Result<AggregatedResult> {
        if !target.is_coarser_than(dataset.level) {
            return Err(GeoError::GeographyMismatch {
                expected: target,
                found: dataset.level,
                context: format!("{} cannot be disaggregated", dataset.source_id),
            }
            .into());
        }
        let ids = dataset
            .records
            .iter()
            .map(|r| r.geo_id().clone())
            .collect::<Vec<_>>();
        let crosswalk = self
            .crosswalks
            .resolve(dataset.level, target, &ids)
            .with_context(|| format!("crosswalk for {}", dataset.source_id))?;
        let result = self
            .aggregation
            .aggregate(&dataset.records, target, &crosswalk, statistic)
            .with_context(|| format!("aggregating {}", dataset.source_id))?;
        Ok(result)
    }

    /// Load every requested source, bring it to `spec.level` and join the
    /// results. A single aggregated source keeps its bookkeeping columns.
    pub async fn query(&self, spec: &QuerySpec) -> Result<QueryOutcome> {
        if spec.sources.is_empty() {
            bail!("query names no sources");
        }
        let run_id = Uuid::new_v4();
        info!(%run_id, sources = ?spec.sources, level = %spec.level, "query start");

        let mut inputs = Vec::with_capacity(spec.sources.len());
        let mut reports = Vec::with_capacity(spec.sources.len());
        for source_id in &spec.sources {
            if reports.iter().any(|r: &SourceReport| &r.source_id == source_id) {
                return Err(GeoError::DuplicateSource(source_id.clone()).into());
            }
            let dataset = self.load_dataset(source_id, spec.force_refresh).await?;
            let mut report = SourceReport {
                source_id: dataset.source_id.clone(),
                input_level: dataset.level,
                vintage: dataset.vintage,
                records: dataset.records.len(),
                cache_status: status_label(&dataset.cache_status).to_string(),
                served_stale: dataset.served_stale(),
                fetched_at: dataset.cache_entry.fetched_at,
                content_hash: dataset.cache_entry.content_hash.clone(),
                aggregated: false,
                statistic: None,
                unmapped_units: Vec::new(),
                low_reliability: 0,
                weight_fallback: false,
            };

            let input = if dataset.level == spec.level {
                MergeSource::records(dataset.source_id, dataset.level, dataset.vintage, dataset.records)
            } else {
                let result = self.aggregate_dataset(&dataset, spec.level, spec.statistic)?;
                report.aggregated = true;
                report.statistic = Some(result.statistic);
                report.unmapped_units = result.unmapped_units.iter().map(ToString::to_string).collect();
                report.low_reliability = result.low_reliability_count();
                report.weight_fallback = result.weight_fallback;
                MergeSource::aggregated(dataset.source_id, dataset.vintage, result)
            };
            inputs.push(input);
            reports.push(report);
        }

        let table = match inputs.as_slice() {
            [MergeSource {
                data: MergeData::Aggregated(result),
                ..
            }] => result.to_table()?,
            _ => self.merge.merge(&inputs, spec.join)?,
        };

        let report = QueryReport {
            run_id,
            generated_at: Utc::now(),
            level: spec.level,
            statistic: spec.statistic,
            join: spec.join.to_string(),
            rows: table.len(),
            sources: reports,
        };
        info!(
            %run_id,
            rows = report.rows,
            stale = report.stale_sources().len(),
            low_reliability = report.low_reliability_rows(),
            "query complete"
        );
        Ok(QueryOutcome { table, report })
    }
}

fn status_label(status: &CacheStatus) -> &'static str {
    match status {
        CacheStatus::Hit => "hit",
        CacheStatus::Fetched => "fetched",
        CacheStatus::ServedStale { .. } => "served_stale",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn config_defaults_match_documented_values() {
        let config = PipelineConfig::default();
        assert_eq!(config.cache_root, PathBuf::from("./cache"));
        assert_eq!(config.reference_dir, PathBuf::from("./reference"));
        assert_eq!(config.output_dir, PathBuf::from("./reports"));
        assert_eq!(config.connectors_file, PathBuf::from("./connectors.yaml"));
        assert_eq!(config.user_agent, "pdc-bot/0.1");
        assert_eq!(config.http_timeout_secs, 60);
        assert_eq!(config.min_contributors, 5);
        assert_eq!(config.ttl, TtlPolicy::default());
        assert!(!config.force_refresh);
        assert_eq!(config.missing_weight, MissingWeightPolicy::Error);
        assert_eq!(config.vintage_policy, VintagePolicy::Tag);
    }

    #[test]
    fn config_reads_overrides_and_ignores_garbage_numbers() {
        let vars = HashMap::from([
            ("PDC_CACHE_ROOT", "/tmp/pdc"),
            ("PDC_MIN_CONTRIBUTORS", "3"),
            ("PDC_TTL_API_HOURS", "1"),
            ("PDC_HTTP_TIMEOUT_SECS", "soon"),
            ("PDC_FORCE_REFRESH", "true"),
            ("PDC_MISSING_WEIGHT", "fallback_unweighted"),
            ("PDC_VINTAGE_POLICY", "require_matching"),
        ]);
        let config = PipelineConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.cache_root, PathBuf::from("/tmp/pdc"));
        assert_eq!(config.min_contributors, 3);
        assert_eq!(config.ttl.api, Duration::from_secs(3600));
        assert_eq!(config.ttl.bulk, TtlPolicy::default().bulk);
        assert_eq!(config.http_timeout_secs, 60);
        assert!(config.force_refresh);
        assert_eq!(config.missing_weight, MissingWeightPolicy::FallbackUnweighted);
        assert_eq!(config.vintage_policy, VintagePolicy::RequireMatching);
    }

    #[test]
    fn registry_rejects_duplicate_ids_and_suggests_near_misses() {
        let entry = r#"
  - source_id: hud_zip_rents
    display_name: rents
    access: bulk_file
    format: csv
    url: file:///dev/null
    ttl_class: bulk
    level: zip
    geo: { kind: code, column: zip_code }
    metrics: { safmr_2br: fair_market_rent_2br }
"#;
        let one = ConnectorRegistry::from_yaml_str(&format!("connectors:{entry}")).unwrap();
        assert_eq!(one.enabled().count(), 1);
        let err = one.require("hud_zip_rent").unwrap_err().to_string();
        assert!(err.contains("did you mean \"hud_zip_rents\""), "{err}");
        let err = one.require("census").unwrap_err().to_string();
        assert!(!err.contains("did you mean"), "{err}");

        let twice = ConnectorRegistry::from_yaml_str(&format!("connectors:{entry}{entry}"));
        assert!(twice.unwrap_err().to_string().contains("listed twice"));
    }

    #[test]
    fn checked_in_connector_list_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../connectors.yaml");
        let text = std::fs::read_to_string(path).unwrap();
        let registry = ConnectorRegistry::from_yaml_str(&text).unwrap();
        let ids = registry
            .connectors
            .iter()
            .map(|c| c.source_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, ["oi_tract_outcomes", "census_county_population", "hud_zip_rents"]);
    }
}
