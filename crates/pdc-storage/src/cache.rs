//! Durable, TTL-governed cache of fetched raw datasets.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/<sha256(source_key)>/entry.json            sidecar (fetched_at, ttl, hash, size)
//! <root>/<sha256(source_key)>/payload-<hash16>.<ext>  immutable payload generations
//! ```
//!
//! Every file is written to a temp name in the same directory and renamed into
//! place, so readers observe either the previous or the complete new version.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::http::FetchError;
use crate::sha256_hex;

const ENTRY_FILE: &str = "entry.json";
const PAYLOAD_PREFIX: &str = "payload-";
const HASH_CHUNK: usize = 64 * 1024;

pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Stable identity of a fetch: url plus query parameters sorted by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceKey {
    url: String,
    params: Vec<(String, String)>,
}

impl SourceKey {
    pub fn new<K, V>(url: impl Into<String>, params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut params = params
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect::<Vec<_>>();
        params.sort();
        Self {
            url: url.into(),
            params,
        }
    }

    pub fn from_url(url: impl Into<String>) -> Self {
        Self::new(url, Vec::<(String, String)>::new())
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn canonical(&self) -> String {
        if self.params.is_empty() {
            return self.url.clone();
        }
        let query = self
            .params
            .iter()
            .map(|(k, v)| format!("{}={}", encode_component(k), encode_component(v)))
            .collect::<Vec<_>>()
            .join("&");
        format!("{}?{}", self.url, query)
    }

    /// Directory name for this key under the cache root.
    pub fn hash_hex(&self) -> String {
        sha256_hex(self.canonical().as_bytes())
    }
}

/// Percent-encode everything outside the RFC 3986 unreserved set so `&` and
/// `=` inside a key or value cannot fake a parameter boundary.
fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Raw bytes produced by a fetch function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub bytes: Vec<u8>,
    pub extension: String,
}

impl Payload {
    pub fn new(bytes: Vec<u8>, extension: impl Into<String>) -> Self {
        Self {
            bytes,
            extension: extension.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtlClass {
    /// Multi-megabyte bulk files that change a few times a year.
    Bulk,
    Api,
    Reference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub bulk: Duration,
    pub api: Duration,
    pub reference: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            bulk: Duration::from_secs(28 * 24 * 3600),
            api: Duration::from_secs(6 * 3600),
            reference: Duration::from_secs(365 * 24 * 3600),
        }
    }
}

impl TtlPolicy {
    pub fn ttl_for(&self, class: TtlClass) -> Duration {
        match class {
            TtlClass::Bulk => self.bulk,
            TtlClass::Api => self.api,
            TtlClass::Reference => self.reference,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntrySidecar {
    source_key: String,
    payload_file: String,
    fetched_at: DateTime<Utc>,
    ttl_secs: u64,
    content_hash: String,
    byte_size: u64,
}

/// One fetched artifact as recorded on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub source_key: String,
    pub payload_location: PathBuf,
    pub fetched_at: DateTime<Utc>,
    pub ttl: Duration,
    pub content_hash: String,
    pub byte_size: u64,
}

impl CacheEntry {
    /// Stale once `now - fetched_at > ttl`. Entries stamped in the future are fresh.
    pub fn is_stale_with(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        (now - self.fetched_at)
            .to_std()
            .map(|age| age > ttl)
            .unwrap_or(false)
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.is_stale_with(now, self.ttl)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheStatus {
    /// Live entry reused without calling the fetch function.
    Hit,
    Fetched,
    /// Refresh failed; the previous entry was returned instead.
    ServedStale { error: String },
}

#[derive(Debug, Clone)]
pub struct CachedPayload {
    pub entry: CacheEntry,
    pub status: CacheStatus,
}

impl CachedPayload {
    pub fn payload_location(&self) -> &Path {
        &self.entry.payload_location
    }

    pub fn served_stale(&self) -> bool {
        matches!(self.status, CacheStatus::ServedStale { .. })
    }

    pub async fn read_bytes(&self) -> Result<Vec<u8>, CacheError> {
        fs::read(&self.entry.payload_location)
            .await
            .map_err(|source| CacheError::Io {
                path: self.entry.payload_location.clone(),
                source,
            })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryStatus {
    pub entry: CacheEntry,
    pub stale: bool,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("cache io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding cache sidecar: {0}")]
    Sidecar(#[from] serde_json::Error),
}

/// Unusable on-disk state; always handled as a cache miss.
#[derive(Debug, Error)]
enum CacheCorruption {
    #[error("sidecar {path} unreadable: {reason}")]
    Sidecar { path: PathBuf, reason: String },
    #[error("sidecar records key {found:?}, expected {expected:?}")]
    KeyMismatch { expected: String, found: String },
    #[error("payload {0} missing")]
    MissingPayload(PathBuf),
    #[error("payload {path} is {found} bytes, sidecar says {expected}")]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        found: u64,
    },
    #[error("payload {path} digest {found} does not match {expected}")]
    DigestMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Integrity {
    Size,
    Digest,
}

/// Outcome of re-hashing one payload against its sidecar.
#[derive(Debug, Clone, Serialize)]
pub struct EntryCheck {
    pub entry: CacheEntry,
    pub intact: bool,
}

/// Cache handle passed to each connector. Holds no global state: two managers
/// over different roots are fully isolated.
#[derive(Debug)]
pub struct CacheManager {
    root: PathBuf,
    clock: Arc<dyn Clock>,
    verify_digests: bool,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CacheManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            clock: Arc::new(SystemClock),
            verify_digests: false,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Size checks always run. With this on, every read also re-hashes the
    /// payload; otherwise digests are only checked by [`Self::verify_entries`].
    pub fn with_digest_verification(mut self, enabled: bool) -> Self {
        self.verify_digests = enabled;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, key: &SourceKey) -> PathBuf {
        self.root.join(key.hash_hex())
    }

    fn read_integrity(&self) -> Integrity {
        if self.verify_digests {
            Integrity::Digest
        } else {
            Integrity::Size
        }
    }

    /// Run `work` holding the lock for one entry directory. The lock is
    /// dropped from the map once no other task holds a handle to it.
    async fn with_key_lock<T>(&self, key_hash: &str, work: impl Future<Output = T>) -> T {
        let lock = {
            let mut map = self.key_locks.lock().await;
            map.entry(key_hash.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let out = {
            let _guard = lock.lock().await;
            work.await
        };
        let mut map = self.key_locks.lock().await;
        drop(lock);
        if map
            .get(key_hash)
            .is_some_and(|held| Arc::strong_count(held) == 1)
        {
            map.remove(key_hash);
        }
        out
    }

    /// Return the live entry for `key`, or call `fetch_fn` and persist its
    /// payload. A failed fetch falls back to an existing (stale) entry when
    /// one is readable; otherwise the fetch error is returned unchanged.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &SourceKey,
        ttl: Duration,
        force_refresh: bool,
        fetch_fn: F,
    ) -> Result<CachedPayload, CacheError>
    where
        F: FnOnce(SourceKey) -> Fut,
        Fut: Future<Output = Result<Payload, FetchError>>,
    {
        let key_hash = key.hash_hex();
        let span = info_span!("cache_get_or_fetch", key = %key, key_hash = %key_hash);
        let work = async move {
            let existing = self.read_valid_entry(key).await;
            if let Some(entry) = &existing {
                if !force_refresh && !entry.is_stale_with(self.clock.now(), ttl) {
                    debug!(fetched_at = %entry.fetched_at, "cache hit");
                    return Ok(CachedPayload {
                        entry: entry.clone(),
                        status: CacheStatus::Hit,
                    });
                }
            }

            match fetch_fn(key.clone()).await {
                Ok(payload) => {
                    let entry = self.write_entry(key, ttl, payload).await?;
                    info!(bytes = entry.byte_size, "cache refreshed");
                    Ok(CachedPayload {
                        entry,
                        status: CacheStatus::Fetched,
                    })
                }
                Err(err) => match existing {
                    Some(entry) => {
                        warn!(
                            error = %err,
                            fetched_at = %entry.fetched_at,
                            "fetch failed; serving stale cache entry"
                        );
                        Ok(CachedPayload {
                            entry,
                            status: CacheStatus::ServedStale {
                                error: err.to_string(),
                            },
                        })
                    }
                    None => Err(CacheError::Fetch(err)),
                },
            }
        };
        self.with_key_lock(&key_hash, work).instrument(span).await
    }

    /// Current readable entry for `key`, ignoring freshness.
    pub async fn lookup(&self, key: &SourceKey) -> Option<CacheEntry> {
        self.read_valid_entry(key).await
    }

    pub async fn invalidate(&self, key: &SourceKey) -> Result<bool, CacheError> {
        let dir = self.entry_dir(key);
        self.with_key_lock(&key.hash_hex(), remove_entry_dir(dir)).await
    }

    /// Every readable entry under the root, judged against its own TTL.
    /// Payloads are checked by size only.
    pub async fn list_entries(&self) -> Result<Vec<EntryStatus>, CacheError> {
        let now = self.clock.now();
        let mut out = Vec::new();
        for dir in self.entry_dirs().await? {
            match self.read_entry_at(&dir, None, Integrity::Size).await {
                Ok(Some(entry)) => out.push(EntryStatus {
                    stale: entry.is_stale(now),
                    entry,
                }),
                Ok(None) => {}
                Err(corruption) => warn!(%corruption, "skipping corrupt cache entry"),
            }
        }
        out.sort_by(|a, b| a.entry.source_key.cmp(&b.entry.source_key));
        Ok(out)
    }

    /// Re-hash every readable payload and compare it with the digest in its
    /// sidecar.
    pub async fn verify_entries(&self) -> Result<Vec<EntryCheck>, CacheError> {
        let mut out = Vec::new();
        for status in self.list_entries().await? {
            let path = &status.entry.payload_location;
            let found = hash_file(path).await.map_err(|source| CacheError::Io {
                path: path.clone(),
                source,
            })?;
            let intact = found == status.entry.content_hash;
            if !intact {
                warn!(
                    key = %status.entry.source_key,
                    expected = %status.entry.content_hash,
                    %found,
                    "cached payload digest mismatch"
                );
            }
            out.push(EntryCheck {
                entry: status.entry,
                intact,
            });
        }
        Ok(out)
    }

    /// Remove entries older than their recorded TTL. Returns how many went.
    /// Each entry is re-read under its key lock, so one refreshed meanwhile
    /// is kept.
    pub async fn purge_stale(&self) -> Result<usize, CacheError> {
        let mut removed = 0;
        for status in self.list_entries().await? {
            if !status.stale {
                continue;
            }
            let Some(dir) = status.entry.payload_location.parent() else {
                continue;
            };
            let Some(key_hash) = dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let work = async {
                let now = self.clock.now();
                match self.read_entry_at(dir, None, Integrity::Size).await {
                    Ok(Some(entry)) if !entry.is_stale(now) => Ok(false),
                    _ => remove_entry_dir(dir.to_path_buf()).await,
                }
            };
            if self.with_key_lock(key_hash, work).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn entry_dirs(&self) -> Result<Vec<PathBuf>, CacheError> {
        let mut out = Vec::new();
        let mut dirs = match fs::read_dir(&self.root).await {
            Ok(dirs) => dirs,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(source) => {
                return Err(CacheError::Io {
                    path: self.root.clone(),
                    source,
                })
            }
        };
        while let Some(dir) = dirs.next_entry().await.map_err(|source| CacheError::Io {
            path: self.root.clone(),
            source,
        })? {
            if matches!(dir.file_type().await, Ok(ft) if ft.is_dir()) {
                out.push(dir.path());
            }
        }
        Ok(out)
    }

    async fn read_valid_entry(&self, key: &SourceKey) -> Option<CacheEntry> {
        let dir = self.entry_dir(key);
        match self.read_entry_at(&dir, Some(key), self.read_integrity()).await {
            Ok(entry) => entry,
            Err(corruption) => {
                warn!(%corruption, "cache entry unusable; treating as miss");
                None
            }
        }
    }

    async fn read_entry_at(
        &self,
        dir: &Path,
        expected_key: Option<&SourceKey>,
        integrity: Integrity,
    ) -> Result<Option<CacheEntry>, CacheCorruption> {
        let sidecar_path = dir.join(ENTRY_FILE);
        let text = match fs::read(&sidecar_path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(CacheCorruption::Sidecar {
                    path: sidecar_path,
                    reason: err.to_string(),
                })
            }
        };
        let sidecar: EntrySidecar =
            serde_json::from_slice(&text).map_err(|err| CacheCorruption::Sidecar {
                path: sidecar_path.clone(),
                reason: err.to_string(),
            })?;

        if let Some(key) = expected_key {
            let expected = key.canonical();
            if sidecar.source_key != expected {
                return Err(CacheCorruption::KeyMismatch {
                    expected,
                    found: sidecar.source_key,
                });
            }
        }

        let payload_location = dir.join(&sidecar.payload_file);
        let meta = match fs::metadata(&payload_location).await {
            Ok(meta) => meta,
            Err(_) => return Err(CacheCorruption::MissingPayload(payload_location)),
        };
        if meta.len() != sidecar.byte_size {
            return Err(CacheCorruption::SizeMismatch {
                path: payload_location,
                expected: sidecar.byte_size,
                found: meta.len(),
            });
        }
        if integrity == Integrity::Digest {
            let found = hash_file(&payload_location)
                .await
                .map_err(|_| CacheCorruption::MissingPayload(payload_location.clone()))?;
            if found != sidecar.content_hash {
                return Err(CacheCorruption::DigestMismatch {
                    path: payload_location,
                    expected: sidecar.content_hash,
                    found,
                });
            }
        }

        Ok(Some(CacheEntry {
            source_key: sidecar.source_key,
            payload_location,
            fetched_at: sidecar.fetched_at,
            ttl: Duration::from_secs(sidecar.ttl_secs),
            content_hash: sidecar.content_hash,
            byte_size: sidecar.byte_size,
        }))
    }

    async fn write_entry(
        &self,
        key: &SourceKey,
        ttl: Duration,
        payload: Payload,
    ) -> Result<CacheEntry, CacheError> {
        let dir = self.entry_dir(key);
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| CacheError::Io {
                path: dir.clone(),
                source,
            })?;

        let previous_payload = read_sidecar_payload_file(&dir).await;

        let content_hash = sha256_hex(&payload.bytes);
        let ext = payload.extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        let payload_file = format!("{PAYLOAD_PREFIX}{}.{ext}", &content_hash[..16]);
        atomic_write(&dir, &payload_file, &payload.bytes).await?;

        let sidecar = EntrySidecar {
            source_key: key.canonical(),
            payload_file: payload_file.clone(),
            fetched_at: self.clock.now(),
            ttl_secs: ttl.as_secs(),
            content_hash: content_hash.clone(),
            byte_size: payload.bytes.len() as u64,
        };
        let json = serde_json::to_vec_pretty(&sidecar)?;
        atomic_write(&dir, ENTRY_FILE, &json).await?;

        let mut keep = vec![payload_file.clone()];
        keep.extend(previous_payload);
        prune_payloads(&dir, &keep).await;

        Ok(CacheEntry {
            source_key: sidecar.source_key,
            payload_location: dir.join(payload_file),
            fetched_at: sidecar.fetched_at,
            ttl,
            content_hash,
            byte_size: sidecar.byte_size,
        })
    }
}

async fn remove_entry_dir(dir: PathBuf) -> Result<bool, CacheError> {
    match fs::remove_dir_all(&dir).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(CacheError::Io { path: dir, source }),
    }
}

async fn read_sidecar_payload_file(dir: &Path) -> Option<String> {
    let text = fs::read(dir.join(ENTRY_FILE)).await.ok()?;
    serde_json::from_slice::<EntrySidecar>(&text)
        .ok()
        .map(|s| s.payload_file)
}

/// Drop payload generations older than the current and previous one. Readers
/// that resolved the previous location keep a complete file.
async fn prune_payloads(dir: &Path, keep: &[String]) {
    let Ok(mut entries) = fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(PAYLOAD_PREFIX) && !keep.contains(&name) {
            if let Err(err) = fs::remove_file(entry.path()).await {
                debug!(file = %name, error = %err, "could not prune old payload");
            }
        }
    }
}

async fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Write `bytes` to `dir/name` via a uniquely named temp file and rename.
async fn atomic_write(dir: &Path, name: &str, bytes: &[u8]) -> Result<(), CacheError> {
    let final_path = dir.join(name);
    let temp_path = dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| CacheError::Io { path, source }
    };

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_err(&temp_path))?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(source) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(CacheError::Io {
            path: temp_path,
            source,
        });
    }

    if let Err(source) = fs::rename(&temp_path, &final_path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(CacheError::Io {
            path: final_path,
            source,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    #[derive(Debug)]
    struct ManualClock(StdMutex<DateTime<Utc>>);

    impl ManualClock {
        fn at(rfc3339: &str) -> Arc<Self> {
            let ts = DateTime::parse_from_rfc3339(rfc3339)
                .expect("ts")
                .with_timezone(&Utc);
            Arc::new(Self(StdMutex::new(ts)))
        }

        fn advance(&self, by: chrono::Duration) {
            let mut now = self.0.lock().unwrap();
            *now += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    const DAY: Duration = Duration::from_secs(24 * 3600);

    fn key() -> SourceKey {
        SourceKey::new(
            "https://example.org/tract_outcomes.csv",
            [("vintage", "2018"), ("format", "csv")],
        )
    }

    fn unavailable() -> FetchError {
        FetchError::Unavailable {
            source_id: "test".into(),
            message: "503 from upstream".into(),
        }
    }

    #[test]
    fn source_keys_are_order_independent() {
        let a = SourceKey::new("https://x/y", [("b", "2"), ("a", "1")]);
        let b = SourceKey::new("https://x/y", [("a", "1"), ("b", "2")]);
        assert_eq!(a.canonical(), "https://x/y?a=1&b=2");
        assert_eq!(a.hash_hex(), b.hash_hex());
        assert_ne!(a.hash_hex(), SourceKey::from_url("https://x/y").hash_hex());
    }

    #[test]
    fn separators_inside_params_cannot_forge_another_key() {
        let split = SourceKey::new("https://x/y", [("a", "1"), ("b", "2")]);
        let smuggled = SourceKey::new("https://x/y", [("a", "1&b=2")]);
        assert_eq!(smuggled.canonical(), "https://x/y?a=1%26b%3D2");
        assert_ne!(split.hash_hex(), smuggled.hash_hex());

        let key_with_eq = SourceKey::new("https://x/y", [("a=1", "")]);
        let value_with_eq = SourceKey::new("https://x/y", [("a", "1=")]);
        assert_ne!(key_with_eq.canonical(), value_with_eq.canonical());
        assert_eq!(
            SourceKey::new("https://x/y", [("for", "county:*"), ("in", "state:06")]).canonical(),
            "https://x/y?for=county%3A%2A&in=state%3A06"
        );
    }

    #[tokio::test]
    async fn second_call_within_ttl_does_not_fetch() {
        let dir = tempdir().expect("tempdir");
        let cache = CacheManager::new(dir.path());
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let got = cache
                .get_or_fetch(&key(), 30 * DAY, false, |_| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Payload::new(b"state,county\n6,37\n".to_vec(), "csv"))
                })
                .await
                .expect("get_or_fetch");
            assert_eq!(got.read_bytes().await.unwrap(), b"state,county\n6,37\n");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_refresh_bypasses_live_entry() {
        let dir = tempdir().expect("tempdir");
        let cache = CacheManager::new(dir.path());
        cache
            .get_or_fetch(&key(), 30 * DAY, false, |_| async {
                Ok(Payload::new(b"v1".to_vec(), "csv"))
            })
            .await
            .unwrap();
        let got = cache
            .get_or_fetch(&key(), 30 * DAY, true, |_| async {
                Ok(Payload::new(b"v2".to_vec(), "csv"))
            })
            .await
            .unwrap();
        assert_eq!(got.status, CacheStatus::Fetched);
        assert_eq!(got.read_bytes().await.unwrap(), b"v2");
    }

    #[tokio::test]
    async fn stale_entry_is_served_when_refresh_fails() {
        let dir = tempdir().expect("tempdir");
        let clock = ManualClock::at("2026-01-01T00:00:00Z");
        let cache = CacheManager::new(dir.path()).with_clock(clock.clone());
        cache
            .get_or_fetch(&key(), 30 * DAY, false, |_| async {
                Ok(Payload::new(b"old".to_vec(), "csv"))
            })
            .await
            .unwrap();

        clock.advance(chrono::Duration::days(40));
        let got = cache
            .get_or_fetch(&key(), 30 * DAY, false, |_| async { Err(unavailable()) })
            .await
            .expect("stale entry served");
        assert!(got.served_stale());
        assert_eq!(got.read_bytes().await.unwrap(), b"old");
    }

    #[tokio::test]
    async fn fetch_error_surfaces_when_nothing_is_cached() {
        let dir = tempdir().expect("tempdir");
        let cache = CacheManager::new(dir.path());
        let err = cache
            .get_or_fetch(&key(), DAY, false, |_| async { Err(unavailable()) })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CacheError::Fetch(FetchError::Unavailable { .. })
        ));
    }

    #[tokio::test]
    async fn truncated_payload_is_a_miss_and_refetches() {
        let dir = tempdir().expect("tempdir");
        let cache = CacheManager::new(dir.path());
        let first = cache
            .get_or_fetch(&key(), 30 * DAY, false, |_| async {
                Ok(Payload::new(b"0123456789".to_vec(), "csv"))
            })
            .await
            .unwrap();
        std::fs::write(first.payload_location(), b"01234").unwrap();

        let calls = AtomicUsize::new(0);
        let got = cache
            .get_or_fetch(&key(), 30 * DAY, false, |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Payload::new(b"0123456789".to_vec(), "csv"))
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(got.read_bytes().await.unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn hits_check_size_and_digests_are_verified_on_demand() {
        let dir = tempdir().expect("tempdir");
        let cache = CacheManager::new(dir.path());
        let first = cache
            .get_or_fetch(&key(), 30 * DAY, false, |_| async {
                Ok(Payload::new(b"0123456789".to_vec(), "csv"))
            })
            .await
            .unwrap();
        // same length, different bytes
        std::fs::write(first.payload_location(), b"abcdefghij").unwrap();

        let got = cache
            .get_or_fetch(&key(), 30 * DAY, false, |_| async {
                Err::<Payload, _>(unavailable())
            })
            .await
            .expect("size-only hit");
        assert_eq!(got.status, CacheStatus::Hit);

        let checks = cache.verify_entries().await.unwrap();
        assert_eq!(checks.len(), 1);
        assert!(!checks[0].intact);

        let strict = CacheManager::new(dir.path()).with_digest_verification(true);
        assert!(strict.lookup(&key()).await.is_none());

        let refreshed = cache
            .get_or_fetch(&key(), 30 * DAY, true, |_| async {
                Ok(Payload::new(b"0123456789".to_vec(), "csv"))
            })
            .await
            .unwrap();
        assert_eq!(refreshed.status, CacheStatus::Fetched);
        assert!(cache.verify_entries().await.unwrap()[0].intact);
    }

    #[tokio::test]
    async fn corrupt_sidecar_with_failing_fetch_surfaces_the_fetch_error() {
        let dir = tempdir().expect("tempdir");
        let cache = CacheManager::new(dir.path());
        cache
            .get_or_fetch(&key(), DAY, false, |_| async {
                Ok(Payload::new(b"x".to_vec(), "csv"))
            })
            .await
            .unwrap();
        let sidecar = dir.path().join(key().hash_hex()).join(ENTRY_FILE);
        std::fs::write(&sidecar, b"{not json").unwrap();

        let err = cache
            .get_or_fetch(&key(), DAY, true, |_| async { Err(unavailable()) })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Fetch(_)));
    }

    #[tokio::test]
    async fn interrupted_write_leaves_previous_entry_intact() {
        let dir = tempdir().expect("tempdir");
        let cache = CacheManager::new(dir.path());
        cache
            .get_or_fetch(&key(), DAY, false, |_| async {
                Ok(Payload::new(b"complete old payload".to_vec(), "csv"))
            })
            .await
            .unwrap();

        // A writer that died mid-way leaves only a partial temp file behind.
        let entry_dir = dir.path().join(key().hash_hex());
        std::fs::write(entry_dir.join(".crashed.4096.tmp"), b"compl").unwrap();

        let entry = cache.lookup(&key()).await.expect("entry still readable");
        assert_eq!(
            std::fs::read(&entry.payload_location).unwrap(),
            b"complete old payload"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_readers_see_old_or_new_never_partial() {
        let dir = tempdir().expect("tempdir");
        let cache = Arc::new(CacheManager::new(dir.path()));
        let old = vec![b'a'; 256 * 1024];
        let new = vec![b'b'; 512 * 1024];
        let old_payload = old.clone();
        cache
            .get_or_fetch(&key(), DAY, false, |_| async move {
                Ok(Payload::new(old_payload, "bin"))
            })
            .await
            .unwrap();

        let writer = {
            let cache = cache.clone();
            let new = new.clone();
            tokio::spawn(async move {
                cache
                    .get_or_fetch(&key(), DAY, true, |_| async move {
                        Ok(Payload::new(new, "bin"))
                    })
                    .await
                    .unwrap();
            })
        };

        let mut readers = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let (old, new) = (old.clone(), new.clone());
            readers.push(tokio::spawn(async move {
                for _ in 0..10 {
                    if let Some(entry) = cache.lookup(&key()).await {
                        let bytes = fs::read(&entry.payload_location).await.unwrap();
                        assert!(bytes == old || bytes == new, "observed partial payload");
                    }
                }
            }));
        }

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_for_one_key_fetch_once() {
        let dir = tempdir().expect("tempdir");
        let cache = Arc::new(CacheManager::new(dir.path()));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let cache = cache.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_fetch(&key(), DAY, false, |_| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(Payload::new(b"shared".to_vec(), "csv"))
                    })
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn list_and_purge_follow_recorded_ttl() {
        let dir = tempdir().expect("tempdir");
        let clock = ManualClock::at("2026-03-01T00:00:00Z");
        let cache = CacheManager::new(dir.path()).with_clock(clock.clone());
        let api_key = SourceKey::new("https://api.example.org/data", [("get", "B01003_001E")]);

        cache
            .get_or_fetch(&key(), 30 * DAY, false, |_| async {
                Ok(Payload::new(b"bulk".to_vec(), "csv"))
            })
            .await
            .unwrap();
        cache
            .get_or_fetch(&api_key, Duration::from_secs(6 * 3600), false, |_| async {
                Ok(Payload::new(b"[]".to_vec(), "json"))
            })
            .await
            .unwrap();

        clock.advance(chrono::Duration::days(1));
        let listed = cache.list_entries().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed.iter().filter(|s| s.stale).count(), 1);

        assert_eq!(cache.purge_stale().await.unwrap(), 1);
        assert!(cache.lookup(&api_key).await.is_none());
        assert!(cache.lookup(&key()).await.is_some());
        assert!(cache.invalidate(&key()).await.unwrap());
        assert!(!cache.invalidate(&key()).await.unwrap());
    }

    #[tokio::test]
    async fn key_locks_are_dropped_once_released() {
        let dir = tempdir().expect("tempdir");
        let clock = ManualClock::at("2026-03-01T00:00:00Z");
        let cache = CacheManager::new(dir.path()).with_clock(clock.clone());
        for n in 0..4 {
            let key = SourceKey::new("https://api.example.org/data", [("page", n.to_string())]);
            cache
                .get_or_fetch(&key, DAY, false, |_| async {
                    Ok(Payload::new(b"[]".to_vec(), "json"))
                })
                .await
                .unwrap();
        }
        assert!(cache.key_locks.lock().await.is_empty());

        clock.advance(chrono::Duration::days(2));
        assert_eq!(cache.purge_stale().await.unwrap(), 4);
        assert!(!cache.invalidate(&key()).await.unwrap());
        assert!(cache.key_locks.lock().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn purge_waits_for_an_in_flight_refresh() {
        let dir = tempdir().expect("tempdir");
        let clock = ManualClock::at("2026-03-01T00:00:00Z");
        let cache = Arc::new(CacheManager::new(dir.path()).with_clock(clock.clone()));
        let ttl = Duration::from_secs(6 * 3600);
        cache
            .get_or_fetch(&key(), ttl, false, |_| async {
                Ok(Payload::new(b"old".to_vec(), "csv"))
            })
            .await
            .unwrap();
        clock.advance(chrono::Duration::days(1));

        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let refresh = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_fetch(&key(), ttl, false, |_| async move {
                        let _ = started_tx.send(());
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(Payload::new(b"new".to_vec(), "csv"))
                    })
                    .await
                    .unwrap()
            })
        };
        started_rx.await.unwrap();

        // listed as stale, but fresh again once the refresh releases the key
        assert_eq!(cache.purge_stale().await.unwrap(), 0);
        assert_eq!(refresh.await.unwrap().status, CacheStatus::Fetched);
        let entry = cache.lookup(&key()).await.expect("refreshed entry kept");
        assert_eq!(std::fs::read(&entry.payload_location).unwrap(), b"new");
    }

    #[tokio::test]
    async fn old_payload_generations_are_pruned() {
        let dir = tempdir().expect("tempdir");
        let cache = CacheManager::new(dir.path());
        for body in ["one", "two", "three"] {
            cache
                .get_or_fetch(&key(), DAY, true, |_| async move {
                    Ok(Payload::new(body.as_bytes().to_vec(), "csv"))
                })
                .await
                .unwrap();
        }
        let payloads = std::fs::read_dir(dir.path().join(key().hash_hex()))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(PAYLOAD_PREFIX))
            .count();
        assert_eq!(payloads, 2);
    }
}
