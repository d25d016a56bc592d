//! Roll-up of fine-grained records to a coarser level through a crosswalk.

use std::collections::{BTreeMap, BTreeSet};

use pdc_core::{
    AggregatedRecord, AggregatedResult, AggregationUnderflowWarning, GeoError, GeoId, GeoLevel,
    GeoRecord, Statistic,
};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::crosswalk::Crosswalk;

/// What to do when a weighted mean is requested and a unit has no weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingWeightPolicy {
    #[default]
    Error,
    /// Compute a plain mean instead and mark the result.
    FallbackUnweighted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationConfig {
    /// Groups built from fewer fine units are flagged `low_reliability`.
    pub min_contributors: usize,
    pub missing_weight: MissingWeightPolicy,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            min_contributors: 5,
            missing_weight: MissingWeightPolicy::Error,
        }
    }
}

#[derive(Debug, Default)]
struct MetricAcc {
    numerator: f64,
    denominator: f64,
    contributions: usize,
}

#[derive(Debug, Default)]
struct Group<'a> {
    units: BTreeSet<&'a GeoId>,
    total_weight: f64,
    weighted_units: usize,
    metrics: BTreeMap<&'a str, MetricAcc>,
}

#[derive(Debug, Clone, Default)]
pub struct AggregationEngine {
    config: AggregationConfig,
}

impl AggregationEngine {
    pub fn new(config: AggregationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    /// Group `records` by their mapped `target_level` unit and compute
    /// `statistic` per metric. A fine unit split across several coarse units
    /// contributes to each one scaled by its share. Pure and deterministic.
    pub fn aggregate(
        &self,
        records: &[GeoRecord],
        target_level: GeoLevel,
        crosswalk: &Crosswalk,
        statistic: Statistic,
    ) -> Result<AggregatedResult, GeoError> {
        if crosswalk.coarse_level() != target_level {
            return Err(GeoError::GeographyMismatch {
                expected: target_level,
                found: crosswalk.coarse_level(),
                context: "crosswalk target level".to_string(),
            });
        }
        if let Some(record) = records
            .iter()
            .find(|r| r.geo_level() != crosswalk.fine_level())
        {
            return Err(GeoError::GeographyMismatch {
                expected: crosswalk.fine_level(),
                found: record.geo_level(),
                context: format!("aggregation input {}", record.geo_id()),
            });
        }

        let mut effective = statistic;
        let mut weight_fallback = false;
        if statistic == Statistic::WeightedMean {
            // only units that land in a group need a weight
            let unweighted = records
                .iter()
                .filter(|r| crosswalk.lookup(r.geo_id()).is_some())
                .find(|r| r.weight().is_none());
            if let Some(unweighted) = unweighted {
                match self.config.missing_weight {
                    MissingWeightPolicy::Error => {
                        return Err(GeoError::MissingWeight {
                            geo_id: unweighted.geo_id().clone(),
                        })
                    }
                    MissingWeightPolicy::FallbackUnweighted => {
                        warn!(
                            geo_id = %unweighted.geo_id(),
                            "weights unavailable; computing unweighted mean"
                        );
                        effective = Statistic::Mean;
                        weight_fallback = true;
                    }
                }
            }
        }

        let mut groups: BTreeMap<&GeoId, Group<'_>> = BTreeMap::new();
        let mut unmapped = BTreeSet::new();

        for record in records {
            let Some(shares) = crosswalk.lookup(record.geo_id()) else {
                unmapped.insert(record.geo_id().clone());
                continue;
            };
            for target in shares {
                let group = groups.entry(&target.coarse).or_default();
                group.units.insert(record.geo_id());
                if let Some(w) = record.weight() {
                    group.total_weight += w * target.share;
                    group.weighted_units += 1;
                }
                for (name, value) in record.metrics() {
                    let acc = group.metrics.entry(name.as_str()).or_default();
                    let Some(v) = *value else { continue };
                    acc.contributions += 1;
                    match effective {
                        Statistic::Sum => acc.numerator += target.share * v,
                        Statistic::Count => acc.numerator += target.share,
                        Statistic::Mean => {
                            acc.numerator += target.share * v;
                            acc.denominator += target.share;
                        }
                        Statistic::WeightedMean => {
                            let w = record.weight().unwrap_or(0.0) * target.share;
                            acc.numerator += v * w;
                            acc.denominator += w;
                        }
                    }
                }
            }
        }

        if !unmapped.is_empty() {
            warn!(
                count = unmapped.len(),
                fine = %crosswalk.fine_level(),
                coarse = %target_level,
                "fine units missing from crosswalk were excluded"
            );
        }

        let min = self.config.min_contributors;
        let mut out = Vec::with_capacity(groups.len());
        let mut warnings = Vec::new();
        for (geo_id, group) in groups {
            let metrics = group
                .metrics
                .into_iter()
                .map(|(name, acc)| (name.to_string(), finalize(effective, &acc)))
                .collect();
            let n_contributors = group.units.len();
            let low_reliability = n_contributors < min;
            if low_reliability {
                warnings.push(AggregationUnderflowWarning {
                    geo_id: geo_id.clone(),
                    n_contributors,
                    minimum: min,
                });
            }
            out.push(AggregatedRecord {
                geo_id: geo_id.clone(),
                statistic: effective,
                metrics,
                total_weight: (group.weighted_units > 0).then_some(group.total_weight),
                n_contributors,
                low_reliability,
            });
        }

        if !warnings.is_empty() {
            warn!(
                groups = warnings.len(),
                minimum = min,
                level = %target_level,
                "low-reliability groups below contributor minimum"
            );
        }
        debug!(
            inputs = records.len(),
            groups = out.len(),
            statistic = %effective,
            "aggregated"
        );

        Ok(AggregatedResult {
            target_level,
            statistic: effective,
            records: out,
            unmapped_units: unmapped.into_iter().collect(),
            warnings,
            weight_fallback,
        })
    }
}

fn finalize(statistic: Statistic, acc: &MetricAcc) -> Option<f64> {
    match statistic {
        Statistic::Count => Some(acc.numerator),
        Statistic::Sum => (acc.contributions > 0).then_some(acc.numerator),
        // zero total weight reports missing rather than dividing by zero
        Statistic::Mean | Statistic::WeightedMean => {
            (acc.denominator > 0.0).then(|| acc.numerator / acc.denominator)
        }
    }
}
