//! The job cache (C4): content-addressed memoisation of completed jobs by
//! fingerprint, with at-most-once concurrent build. `probe` / `reserve` /
//! `commit` are the three operations the job manager's tick loop (C12)
//! drives; the CAS guarantee behind `reserve` is what makes "at most one
//! reservation per fingerprint is outstanding system-wide" hold even when
//! several jobs with the same fingerprint are submitted in the same tick.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use jobrelay_base::config::ConfigCache;
use jobrelay_base::error::JobError;
use jobrelay_base::fingerprint::Fingerprint;
use jobrelay_base::job::{JobId, RuntimeInfo};
use jobrelay_base::proto::{DocStatus, InlineOrUri, JobDocument, INLINE_SIZE_THRESHOLD_BYTES};
use jobrelay_base::value::Value;
use jobrelay_blobstore::BlobStore;
use jobrelay_docstore::DocStore;
use ulid::Ulid;

/// The cached outcome of a terminal job, keyed by fingerprint (§4.4's
/// "triple (result, runtime_info, error)"). Exactly one of `result`/`error`
/// is set, matching the `FINISHED`/`ERROR` split in the status lattice.
#[derive(Clone, Debug)]
pub struct CachedOutcome {
    pub result: Option<Value>,
    pub error: Option<JobError>,
    pub runtime_info: RuntimeInfo,
}

impl CachedOutcome {
    pub fn finished(result: Value, runtime_info: RuntimeInfo) -> Self {
        Self {
            result: Some(result),
            error: None,
            runtime_info,
        }
    }

    pub fn errored(error: JobError, runtime_info: RuntimeInfo) -> Self {
        Self {
            result: None,
            error: Some(error),
            runtime_info,
        }
    }
}

#[derive(Clone, Debug)]
pub enum CacheProbe {
    Hit(CachedOutcome),
    InFlight,
    Miss,
}

/// C4. A process-local cache trivially satisfies the single-reservation
/// guarantee with a mutex; a cache shared across compute resources needs an
/// atomic reserve against the doc store instead — see
/// [`DocStoreBackedJobCache`] for that variant; the trait is the same either
/// way so the job manager never needs to know which it's talking to.
pub trait JobCache: ConfigCache {
    fn probe(&self, fingerprint: &Fingerprint) -> Result<CacheProbe>;

    /// Succeeds iff `fingerprint` is neither cached nor in-flight. On
    /// success, the caller owns the right to execute the job and must
    /// eventually call either `commit` or `release_failed`.
    fn reserve(&self, fingerprint: &Fingerprint) -> Result<bool>;

    fn commit(&self, fingerprint: &Fingerprint, outcome: CachedOutcome) -> Result<()>;

    /// Releases a reservation without caching an outcome. Used when a job
    /// fails with `FrameworkError` (§5: "the outcome is not committed to
    /// cache") so a later, possibly non-broken, attempt isn't stuck
    /// observing `IN_FLIGHT` forever.
    fn release_failed(&self, fingerprint: &Fingerprint) -> Result<()>;
}

#[derive(Debug)]
enum Slot {
    InFlight,
    Done(CachedOutcome),
}

/// A mutex-guarded fingerprint table. The same implementation backs both the
/// process-local cache and, wrapped by [`DocStoreBackedJobCache`] in spirit,
/// the "shared cache" case described in §4.4: the CAS guarantee a shared
/// cache needs reduces to the same single-lock reserve-before-write
/// discipline `jobrelay-docstore`'s `InMemoryDocStore::claim` uses.
pub struct InMemoryJobCache {
    name: String,
    slots: Mutex<HashMap<Fingerprint, Slot>>,
}

impl InMemoryJobCache {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl fmt::Debug for InMemoryJobCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryJobCache").field("name", &self.name).finish()
    }
}

impl ConfigCache for InMemoryJobCache {
    fn cache_name(&self) -> &str {
        &self.name
    }
}

impl JobCache for InMemoryJobCache {
    fn probe(&self, fingerprint: &Fingerprint) -> Result<CacheProbe> {
        let slots = self.slots.lock().unwrap();
        Ok(match slots.get(fingerprint) {
            Some(Slot::Done(outcome)) => CacheProbe::Hit(outcome.clone()),
            Some(Slot::InFlight) => CacheProbe::InFlight,
            None => CacheProbe::Miss,
        })
    }

    fn reserve(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let mut slots = self.slots.lock().unwrap();
        if slots.contains_key(fingerprint) {
            return Ok(false);
        }
        slots.insert(fingerprint.clone(), Slot::InFlight);
        Ok(true)
    }

    fn commit(&self, fingerprint: &Fingerprint, outcome: CachedOutcome) -> Result<()> {
        self.slots
            .lock()
            .unwrap()
            .insert(fingerprint.clone(), Slot::Done(outcome));
        Ok(())
    }

    fn release_failed(&self, fingerprint: &Fingerprint) -> Result<()> {
        self.slots.lock().unwrap().remove(fingerprint);
        Ok(())
    }
}

/// Maps a fingerprint onto a stable `JobId` so repeated reservations of the
/// same computation address the same doc-store row. Only the first 16 bytes
/// of the fingerprint's 32-byte digest are used, since a ulid is 128 bits;
/// a collision there would require a SHA-256 preimage-style collision in
/// the truncated digest, not a concern for a content-addressed cache key.
fn job_id_for_fingerprint(fingerprint: &Fingerprint) -> JobId {
    let hex = fingerprint.to_hex();
    let bytes = hex::decode(&hex[..32]).expect("fingerprint hex is well-formed");
    let mut ulid_bytes = [0u8; 16];
    ulid_bytes.copy_from_slice(&bytes);
    JobId::from_ulid(Ulid::from_bytes(ulid_bytes))
}

/// Doc-store-backed cache (§4.9: "for a shared cache this requires an
/// atomic reserve via the doc store, compare-and-set on the fingerprint
/// document"). Unlike [`InMemoryJobCache`], reservations here are visible
/// to every collaborator sharing the same `DocStore` — a client process and
/// a remote compute-resource daemon polling the same doc store will agree
/// on who won a reservation for a given fingerprint, which a process-local
/// mutex can never provide across a process boundary.
///
/// Each fingerprint gets one synthetic `JobDocument`, keyed by
/// [`job_id_for_fingerprint`], under a reserved `compute_resource_id`
/// namespace so its rows never collide with real dispatch documents in the
/// same store. `reserve` creates that row with `insert_if_absent` (the
/// same CAS-by-creation primitive a unique-constrained `INSERT ... ON
/// CONFLICT DO NOTHING` would provide in a real store) and then claims it,
/// mirroring `jobrelay_docstore::InMemoryDocStore::claim`'s use for job
/// dispatch in `jobrelay-remote`/`jobrelay-worker`.
pub struct DocStoreBackedJobCache {
    name: String,
    namespace: String,
    doc_store: Arc<dyn DocStore>,
    blob_store: Arc<dyn BlobStore>,
}

impl DocStoreBackedJobCache {
    pub fn new(name: impl Into<String>, doc_store: Arc<dyn DocStore>, blob_store: Arc<dyn BlobStore>) -> Self {
        Self {
            name: name.into(),
            namespace: "__job_cache__".to_string(),
            doc_store,
            blob_store,
        }
    }

    fn payload_for(&self, value: &Value) -> Result<InlineOrUri> {
        let plain = jobrelay_codec::serialize(value, self.blob_store.as_ref())?;
        let encoded = serde_json::to_vec(&plain)?;
        if encoded.len() > INLINE_SIZE_THRESHOLD_BYTES {
            let uri = self.blob_store.put(&encoded)?;
            Ok(InlineOrUri::Uri(uri))
        } else {
            Ok(InlineOrUri::Inline(plain))
        }
    }

    fn resolve_payload(&self, payload: &InlineOrUri) -> Result<Value> {
        let plain = match payload {
            InlineOrUri::Inline(plain) => plain.clone(),
            InlineOrUri::Uri(uri) => serde_json::from_slice(&self.blob_store.get(uri)?)?,
        };
        jobrelay_codec::deserialize(&plain, self.blob_store.as_ref())
    }

    fn placeholder(&self, job_id: JobId) -> JobDocument {
        JobDocument {
            job_id,
            compute_resource_id: self.namespace.clone(),
            status: DocStatus::Queued,
            fingerprint: String::new(),
            function_name: String::new(),
            function_version: String::new(),
            container: None,
            code_bundle_uri: None,
            kwargs_serialized: InlineOrUri::Inline(serde_json::Value::Null),
            result_serialized: None,
            runtime_info: None,
            error: None,
            claimed_at: None,
            heartbeat_at: None,
            no_resolve_input_files: false,
            download_results: true,
            job_timeout: None,
        }
    }
}

impl fmt::Debug for DocStoreBackedJobCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocStoreBackedJobCache").field("name", &self.name).finish()
    }
}

impl ConfigCache for DocStoreBackedJobCache {
    fn cache_name(&self) -> &str {
        &self.name
    }
}

impl JobCache for DocStoreBackedJobCache {
    fn probe(&self, fingerprint: &Fingerprint) -> Result<CacheProbe> {
        let job_id = job_id_for_fingerprint(fingerprint);
        Ok(match self.doc_store.get(job_id)? {
            None => CacheProbe::Miss,
            Some(doc) => match doc.status {
                DocStatus::Finished => {
                    let result = match &doc.result_serialized {
                        Some(payload) => self.resolve_payload(payload)?,
                        None => return Ok(CacheProbe::InFlight),
                    };
                    CacheProbe::Hit(CachedOutcome::finished(result, doc.runtime_info.unwrap_or_default()))
                }
                DocStatus::Error => {
                    let error = doc.error.unwrap_or_else(|| JobError::framework("cache row marked ERROR with no error recorded"));
                    CacheProbe::Hit(CachedOutcome::errored(error, doc.runtime_info.unwrap_or_default()))
                }
                DocStatus::Queued | DocStatus::Claimed | DocStatus::Running => CacheProbe::InFlight,
            },
        })
    }

    fn reserve(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let job_id = job_id_for_fingerprint(fingerprint);
        let now = now_secs();
        let created = self.doc_store.insert_if_absent(self.placeholder(job_id))?;
        if !created {
            // A row already exists for this fingerprint, either in flight
            // or holding a finished/errored result; `claim` only succeeds
            // against a still-`QUEUED` row, which a genuinely fresh
            // placeholder always is, so this correctly reports "no
            // reservation" for every other case without probing first.
            return Ok(false);
        }
        self.doc_store.claim(job_id, &self.namespace, now)
    }

    fn commit(&self, fingerprint: &Fingerprint, outcome: CachedOutcome) -> Result<()> {
        let job_id = job_id_for_fingerprint(fingerprint);
        match (outcome.result, outcome.error) {
            (Some(result), _) => {
                let payload = self.payload_for(&result)?;
                self.doc_store.finish(job_id, payload, outcome.runtime_info)?;
            }
            (None, Some(error)) => {
                self.doc_store.fail(job_id, error, Some(outcome.runtime_info))?;
            }
            (None, None) => anyhow::bail!("cannot commit a cached outcome with neither a result nor an error"),
        }
        Ok(())
    }

    fn release_failed(&self, fingerprint: &Fingerprint) -> Result<()> {
        let job_id = job_id_for_fingerprint(fingerprint);
        self.doc_store.delete(job_id)
    }
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobrelay_base::job::RuntimeInfo;

    fn fp(seed: &str) -> Fingerprint {
        Fingerprint::compute("f", "1.0.0", None, &Value::Str(seed.to_string())).unwrap()
    }

    #[test]
    fn miss_then_reserve_then_commit_is_a_hit() {
        let cache = InMemoryJobCache::new("local");
        let fingerprint = fp("a");

        assert!(matches!(cache.probe(&fingerprint).unwrap(), CacheProbe::Miss));
        assert!(cache.reserve(&fingerprint).unwrap());
        assert!(matches!(cache.probe(&fingerprint).unwrap(), CacheProbe::InFlight));

        cache
            .commit(
                &fingerprint,
                CachedOutcome::finished(Value::Int(25), RuntimeInfo::default()),
            )
            .unwrap();

        match cache.probe(&fingerprint).unwrap() {
            CacheProbe::Hit(outcome) => assert_eq!(outcome.result, Some(Value::Int(25))),
            other => panic!("expected Hit, got {other:?}"),
        }
    }

    #[test]
    fn only_one_reservation_succeeds_per_fingerprint() {
        let cache = InMemoryJobCache::new("local");
        let fingerprint = fp("b");
        assert!(cache.reserve(&fingerprint).unwrap());
        assert!(!cache.reserve(&fingerprint).unwrap());
    }

    #[test]
    fn release_failed_clears_the_in_flight_slot() {
        let cache = InMemoryJobCache::new("local");
        let fingerprint = fp("c");
        assert!(cache.reserve(&fingerprint).unwrap());
        cache.release_failed(&fingerprint).unwrap();
        assert!(matches!(cache.probe(&fingerprint).unwrap(), CacheProbe::Miss));
        assert!(cache.reserve(&fingerprint).unwrap());
    }

    #[test]
    fn cached_error_is_also_a_hit() {
        let cache = InMemoryJobCache::new("local");
        let fingerprint = fp("d");
        cache.reserve(&fingerprint).unwrap();
        cache
            .commit(
                &fingerprint,
                CachedOutcome::errored(JobError::user_function("boom"), RuntimeInfo::default()),
            )
            .unwrap();
        match cache.probe(&fingerprint).unwrap() {
            CacheProbe::Hit(outcome) => assert!(outcome.error.is_some()),
            other => panic!("expected Hit, got {other:?}"),
        }
    }

    fn doc_store_and_blobs() -> (Arc<dyn DocStore>, Arc<dyn BlobStore>) {
        let doc_store: Arc<dyn DocStore> = Arc::new(jobrelay_docstore::InMemoryDocStore::new());
        let blob_store: Arc<dyn BlobStore> =
            Arc::new(jobrelay_blobstore::FsBlobStore::open(tempfile::tempdir().unwrap().into_path()).unwrap());
        (doc_store, blob_store)
    }

    #[test]
    fn doc_store_backed_cache_round_trips_a_hit() {
        let (doc_store, blob_store) = doc_store_and_blobs();
        let cache = DocStoreBackedJobCache::new("shared", doc_store, blob_store);
        let fingerprint = fp("shared-a");

        assert!(matches!(cache.probe(&fingerprint).unwrap(), CacheProbe::Miss));
        assert!(cache.reserve(&fingerprint).unwrap());
        assert!(matches!(cache.probe(&fingerprint).unwrap(), CacheProbe::InFlight));

        cache
            .commit(&fingerprint, CachedOutcome::finished(Value::Int(81), RuntimeInfo::default()))
            .unwrap();

        match cache.probe(&fingerprint).unwrap() {
            CacheProbe::Hit(outcome) => assert_eq!(outcome.result, Some(Value::Int(81))),
            other => panic!("expected Hit, got {other:?}"),
        }
    }

    #[test]
    fn two_cache_handles_over_the_same_doc_store_see_each_others_reservations() {
        // This is the exact property `InMemoryJobCache` cannot provide: two
        // independently constructed cache handles (standing in for a
        // client process and a remote compute-resource daemon) must agree
        // on who won the reservation.
        let (doc_store, blob_store) = doc_store_and_blobs();
        let client = DocStoreBackedJobCache::new("client", doc_store.clone(), blob_store.clone());
        let daemon = DocStoreBackedJobCache::new("daemon", doc_store, blob_store);
        let fingerprint = fp("shared-b");

        assert!(client.reserve(&fingerprint).unwrap());
        assert!(!daemon.reserve(&fingerprint).unwrap());
        assert!(matches!(daemon.probe(&fingerprint).unwrap(), CacheProbe::InFlight));

        client
            .commit(&fingerprint, CachedOutcome::finished(Value::Int(4), RuntimeInfo::default()))
            .unwrap();

        match daemon.probe(&fingerprint).unwrap() {
            CacheProbe::Hit(outcome) => assert_eq!(outcome.result, Some(Value::Int(4))),
            other => panic!("expected Hit, got {other:?}"),
        }
    }

    #[test]
    fn doc_store_backed_release_failed_allows_a_fresh_reservation() {
        let (doc_store, blob_store) = doc_store_and_blobs();
        let cache = DocStoreBackedJobCache::new("shared", doc_store, blob_store);
        let fingerprint = fp("shared-c");

        assert!(cache.reserve(&fingerprint).unwrap());
        cache.release_failed(&fingerprint).unwrap();
        assert!(matches!(cache.probe(&fingerprint).unwrap(), CacheProbe::Miss));
        assert!(cache.reserve(&fingerprint).unwrap());
    }
}
