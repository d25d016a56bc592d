//! TTL-governed artifact cache + HTTP fetch utilities for PDC.

use sha2::{Digest, Sha256};

mod cache;
mod http;

pub use cache::{
    CacheEntry, CacheError, CacheManager, CacheStatus, CachedPayload, Clock, EntryCheck,
    EntryStatus, Payload, SourceKey, SystemClock, TtlClass, TtlPolicy,
};
pub use http::{
    FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, RateLimit, RateLimiter,
    RetryPolicy,
};

pub const CRATE_NAME: &str = "pdc-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
