//! Geographic key normalization, crosswalks, aggregation and merge engines.

mod aggregate;
mod crosswalk;
mod merge;
mod normalize;

pub use aggregate::{AggregationConfig, AggregationEngine, MissingWeightPolicy};
pub use crosswalk::{
    Crosswalk, CrosswalkBuilder, CrosswalkFileSpec, CrosswalkRegistry, CrosswalkShare, LoadError,
    SHARE_TOLERANCE,
};
pub use merge::{JoinKind, MergeData, MergeEngine, MergeSource, VintagePolicy};
pub use normalize::{Normalizer, RawGeoKey, StateInfo, STATES};

pub const CRATE_NAME: &str = "pdc-geo";
