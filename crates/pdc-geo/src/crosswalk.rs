//! Fine → coarse geography mappings with per-unit weight shares.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use pdc_core::{GeoError, GeoId, GeoLevel};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::normalize::Normalizer;

/// Allowed deviation of a fine unit's share total from 1.0.
pub const SHARE_TOLERANCE: f64 = 1e-3;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Geo(#[from] GeoError),
    #[error("{origin}: missing column {column:?}")]
    MissingColumn { origin: String, column: String },
    #[error("{origin} row {row}: {source}")]
    Row {
        origin: String,
        row: usize,
        #[source]
        source: GeoError,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrosswalkShare {
    pub coarse: GeoId,
    pub share: f64,
}

/// Mapping for one (fine, coarse) level pair. Every fine unit's shares sum
/// to exactly 1.0 after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Crosswalk {
    fine: GeoLevel,
    coarse: GeoLevel,
    entries: BTreeMap<GeoId, Vec<CrosswalkShare>>,
}

impl Crosswalk {
    pub fn builder(fine: GeoLevel, coarse: GeoLevel) -> CrosswalkBuilder {
        CrosswalkBuilder {
            fine,
            coarse,
            entries: BTreeMap::new(),
        }
    }

    /// Whether `coarse` contains `fine` units by code prefix (or is national).
    pub fn nests(fine: GeoLevel, coarse: GeoLevel) -> bool {
        fine != coarse
            && (coarse == GeoLevel::National
                || (fine.is_fips_hierarchy()
                    && coarse.is_fips_hierarchy()
                    && coarse.is_coarser_than(fine)))
    }

    /// Crosswalk derived from the code hierarchy for the given fine units.
    pub fn from_hierarchy<'a, I>(fine: GeoLevel, coarse: GeoLevel, ids: I) -> Result<Self, GeoError>
    where
        I: IntoIterator<Item = &'a GeoId>,
    {
        if !Self::nests(fine, coarse) {
            return Err(GeoError::UnsupportedCrosswalk { fine, coarse });
        }
        let mut entries = BTreeMap::new();
        for id in ids {
            if id.level() != fine {
                return Err(GeoError::GeographyMismatch {
                    expected: fine,
                    found: id.level(),
                    context: "hierarchy crosswalk input".to_string(),
                });
            }
            let parent = id
                .ancestor(coarse)
                .ok_or(GeoError::UnsupportedCrosswalk { fine, coarse })?;
            entries.insert(
                id.clone(),
                vec![CrosswalkShare {
                    coarse: parent,
                    share: 1.0,
                }],
            );
        }
        Ok(Self {
            fine,
            coarse,
            entries,
        })
    }

    pub fn fine_level(&self) -> GeoLevel {
        self.fine
    }

    pub fn coarse_level(&self) -> GeoLevel {
        self.coarse
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, fine: &GeoId) -> Option<&[CrosswalkShare]> {
        self.entries.get(fine).map(Vec::as_slice)
    }

    pub fn fine_units(&self) -> impl Iterator<Item = &GeoId> {
        self.entries.keys()
    }

    pub fn is_hierarchical(&self) -> bool {
        self.entries
            .values()
            .all(|shares| shares.len() == 1 && shares[0].share == 1.0)
    }

    /// Chain `self` (A → B) with `next` (B → C). Shares multiply; a fine unit
    /// whose intermediate units are not all covered by `next` is left out.
    pub fn compose(&self, next: &Crosswalk) -> Result<Crosswalk, GeoError> {
        if next.fine != self.coarse {
            return Err(GeoError::GeographyMismatch {
                expected: self.coarse,
                found: next.fine,
                context: "crosswalk composition".to_string(),
            });
        }
        let mut builder = Crosswalk::builder(self.fine, next.coarse);
        let mut dropped = 0usize;
        'units: for (fine, shares) in &self.entries {
            let mut combined: BTreeMap<&GeoId, f64> = BTreeMap::new();
            for first in shares {
                let Some(second) = next.lookup(&first.coarse) else {
                    dropped += 1;
                    continue 'units;
                };
                for leg in second {
                    *combined.entry(&leg.coarse).or_default() += first.share * leg.share;
                }
            }
            for (coarse, share) in combined {
                builder.insert(fine.clone(), coarse.clone(), share)?;
            }
        }
        if dropped > 0 {
            debug!(
                dropped,
                fine = %self.fine,
                via = %self.coarse,
                coarse = %next.coarse,
                "fine units without a complete composed mapping"
            );
        }
        builder.build()
    }

    pub fn from_csv_reader<R: Read>(
        reader: R,
        spec: &CrosswalkFileSpec,
        origin: &str,
    ) -> Result<Self, LoadError> {
        let mut rdr = csv::Reader::from_reader(reader);
        let headers = rdr.headers()?.clone();
        let column = |name: &str| {
            headers
                .iter()
                .position(|h| h.trim() == name)
                .ok_or_else(|| LoadError::MissingColumn {
                    origin: origin.to_string(),
                    column: name.to_string(),
                })
        };
        let fine_idx = column(&spec.fine_column)?;
        let coarse_idx = column(&spec.coarse_column)?;
        let share_idx = spec.share_column.as_deref().map(column).transpose()?;

        let normalizer = Normalizer::new();
        let mut builder = Crosswalk::builder(spec.fine, spec.coarse);
        for (idx, record) in rdr.records().enumerate() {
            let record = record?;
            let row = idx + 2;
            let at_row = |source: GeoError| LoadError::Row {
                origin: origin.to_string(),
                row,
                source,
            };
            let field = |i: usize| record.get(i).unwrap_or("").trim();

            let fine = normalizer
                .normalize_code(field(fine_idx), Some(spec.fine))
                .map_err(at_row)?;
            let coarse = normalizer
                .normalize_code(field(coarse_idx), Some(spec.coarse))
                .map_err(at_row)?;
            let share = match share_idx {
                Some(i) => field(i).parse::<f64>().map_err(|_| {
                    at_row(GeoError::InvalidCrosswalk(format!(
                        "share {:?} is not a number",
                        field(i)
                    )))
                })?,
                None => 1.0,
            };
            builder.insert(fine, coarse, share).map_err(at_row)?;
        }
        Ok(builder.build()?)
    }
}

#[derive(Debug, Clone)]
pub struct CrosswalkBuilder {
    fine: GeoLevel,
    coarse: GeoLevel,
    entries: BTreeMap<GeoId, Vec<CrosswalkShare>>,
}

impl CrosswalkBuilder {
    /// Add one fine → coarse share. Zero shares are ignored.
    pub fn insert(&mut self, fine: GeoId, coarse: GeoId, share: f64) -> Result<&mut Self, GeoError> {
        for (id, expected, context) in [
            (&fine, self.fine, "crosswalk fine unit"),
            (&coarse, self.coarse, "crosswalk coarse unit"),
        ] {
            if id.level() != expected {
                return Err(GeoError::GeographyMismatch {
                    expected,
                    found: id.level(),
                    context: context.to_string(),
                });
            }
        }
        if !share.is_finite() || !(0.0..=1.0 + SHARE_TOLERANCE).contains(&share) {
            return Err(GeoError::InvalidCrosswalk(format!(
                "share {share} for {fine} → {coarse} is outside [0, 1]"
            )));
        }
        if share == 0.0 {
            return Ok(self);
        }
        let shares = self.entries.entry(fine).or_default();
        if shares.iter().any(|s| s.coarse == coarse) {
            return Err(GeoError::InvalidCrosswalk(format!(
                "duplicate mapping to {coarse}"
            )));
        }
        shares.push(CrosswalkShare { coarse, share });
        Ok(self)
    }

    pub fn build(self) -> Result<Crosswalk, GeoError> {
        if !self.coarse.is_coarser_than(self.fine) {
            return Err(GeoError::InvalidCrosswalk(format!(
                "{} is not coarser than {}",
                self.coarse, self.fine
            )));
        }
        let nested = Crosswalk::nests(self.fine, self.coarse);
        let mut entries = self.entries;
        for (fine, shares) in entries.iter_mut() {
            let total: f64 = shares.iter().map(|s| s.share).sum();
            if (total - 1.0).abs() > SHARE_TOLERANCE {
                return Err(GeoError::InvalidCrosswalk(format!(
                    "shares for {fine} sum to {total}"
                )));
            }
            if nested {
                let parent = fine.ancestor(self.coarse);
                if shares.len() != 1 || parent.as_ref() != Some(&shares[0].coarse) {
                    return Err(GeoError::InvalidCrosswalk(format!(
                        "{fine} must map wholly to its containing {}",
                        self.coarse
                    )));
                }
            }
            for share in shares.iter_mut() {
                share.share /= total;
            }
        }
        Ok(Crosswalk {
            fine: self.fine,
            coarse: self.coarse,
            entries,
        })
    }
}

/// One static crosswalk file listed in `crosswalks.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct CrosswalkFileSpec {
    pub fine: GeoLevel,
    pub coarse: GeoLevel,
    pub path: PathBuf,
    pub fine_column: String,
    pub coarse_column: String,
    #[serde(default)]
    pub share_column: Option<String>,
}

impl CrosswalkFileSpec {
    /// Load the file, resolving a relative `path` against `base_dir`.
    pub fn load(&self, base_dir: &Path) -> Result<Crosswalk, LoadError> {
        let path = if self.path.is_absolute() {
            self.path.clone()
        } else {
            base_dir.join(&self.path)
        };
        let file = std::fs::File::open(&path).map_err(|source| LoadError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Crosswalk::from_csv_reader(file, self, &path.display().to_string())
    }
}

/// Loaded crosswalks keyed by level pair.
#[derive(Debug, Clone, Default)]
pub struct CrosswalkRegistry {
    tables: BTreeMap<(GeoLevel, GeoLevel), Crosswalk>,
}

impl CrosswalkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, crosswalk: Crosswalk) -> Option<Crosswalk> {
        self.tables
            .insert((crosswalk.fine, crosswalk.coarse), crosswalk)
    }

    pub fn get(&self, fine: GeoLevel, coarse: GeoLevel) -> Option<&Crosswalk> {
        self.tables.get(&(fine, coarse))
    }

    pub fn pairs(&self) -> impl Iterator<Item = (GeoLevel, GeoLevel)> + '_ {
        self.tables.keys().copied()
    }

    /// Crosswalk covering `fine_ids`: a loaded table, the code hierarchy, or
    /// a two-step composition through an intermediate level.
    pub fn resolve(
        &self,
        fine: GeoLevel,
        coarse: GeoLevel,
        fine_ids: &[GeoId],
    ) -> Result<Cow<'_, Crosswalk>, GeoError> {
        if let Some(leg) = self.leg(fine, coarse, fine_ids.iter()) {
            return leg;
        }

        let mut via = vec![GeoLevel::County];
        via.extend(GeoLevel::ALL.iter().copied().filter(|l| *l != GeoLevel::County));
        for mid in via {
            if mid == fine || mid == coarse {
                continue;
            }
            // a purely hierarchical chain is already handled above
            if self.get(fine, mid).is_none() && self.get(mid, coarse).is_none() {
                continue;
            }
            let Some(first) = self.leg(fine, mid, fine_ids.iter()) else {
                continue;
            };
            let first = first?;
            let mids = first
                .entries
                .values()
                .flatten()
                .map(|s| s.coarse.clone())
                .collect::<Vec<_>>();
            let Some(second) = self.leg(mid, coarse, mids.iter()) else {
                continue;
            };
            let composed = first.compose(&*second?)?;
            debug!(%fine, %mid, %coarse, units = composed.len(), "composed crosswalk");
            return Ok(Cow::Owned(composed));
        }
        Err(GeoError::UnsupportedCrosswalk { fine, coarse })
    }

    fn leg<'a, I>(
        &self,
        fine: GeoLevel,
        coarse: GeoLevel,
        ids: I,
    ) -> Option<Result<Cow<'_, Crosswalk>, GeoError>>
    where
        I: IntoIterator<Item = &'a GeoId>,
    {
        if let Some(table) = self.get(fine, coarse) {
            return Some(Ok(Cow::Borrowed(table)));
        }
        if Crosswalk::nests(fine, coarse) {
            return Some(Crosswalk::from_hierarchy(fine, coarse, ids).map(Cow::Owned));
        }
        None
    }
}
