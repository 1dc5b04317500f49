//! Travel-time enrichment.
//!
//! Cache hits are applied straight away. Misses are grouped by travel
//! mode, packed into matrix requests within the API's element limit and
//! resolved concurrently. Only the consuming loop touches the cache, so
//! batch completions never race on it.

pub mod api;
pub mod cache;

pub use api::{DistanceApi, ElementOutcome, GoogleDistanceMatrix, MatrixRequest, MatrixResponse};
pub use cache::{normalize_address, CacheEntry, CacheKey, DistanceCache};

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{DistanceApiError, ScoutError};
use crate::models::{Location, PropertyListing, TravelMode, TravelTime};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentSettings {
    /// Matrix requests in flight at once
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for EnrichmentSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retry: RetryPolicy::default(),
        }
    }
}

/// What one [`DistanceEnricher::enrich`] call did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrichmentReport {
    pub cache_hits: usize,
    /// Requests sent, retries included
    pub api_calls: u32,
    /// Pairs newly resolved to a duration
    pub resolved: usize,
    /// Pairs newly resolved as unreachable
    pub unreachable: usize,
    /// Pairs still without a value after the run
    pub unresolved: usize,
    pub failed_batches: usize,
    pub skipped_no_address: usize,
    pub cancelled: bool,
    /// The cache file could not be written; results live in memory only
    pub cache_degraded: bool,
}

impl EnrichmentReport {
    pub fn is_partial(&self) -> bool {
        self.unresolved > 0 || self.failed_batches > 0 || self.cancelled
    }
}

#[derive(Debug)]
struct Batch {
    request: MatrixRequest,
    /// Destination slug for each entry of `request.destinations`
    slugs: Vec<String>,
}

pub struct DistanceEnricher {
    api: Arc<dyn DistanceApi>,
    settings: EnrichmentSettings,
}

impl DistanceEnricher {
    pub fn new(api: Arc<dyn DistanceApi>, settings: EnrichmentSettings) -> Self {
        Self { api, settings }
    }

    /// Fill each listing's travel-time map for every location.
    ///
    /// Never fails: batches that stay broken after retries leave their
    /// pairs unresolved and are counted in the report.
    pub async fn enrich(
        &self,
        listings: &mut [PropertyListing],
        locations: &[Location],
        cache: &mut DistanceCache,
        cancel: &CancellationToken,
    ) -> EnrichmentReport {
        let mut report = EnrichmentReport::default();
        // mode -> normalized origin -> slugs still to resolve
        let mut misses: BTreeMap<TravelMode, BTreeMap<String, BTreeSet<&str>>> = BTreeMap::new();
        let mut destinations: BTreeMap<&str, &Location> = BTreeMap::new();

        for listing in listings.iter_mut() {
            if listing.full_address.trim().is_empty() {
                warn!(listing_id = %listing.listing_id, "Listing has no address, skipping enrichment");
                report.skipped_no_address += 1;
                continue;
            }
            for location in locations {
                let key = CacheKey::new(&listing.full_address, &location.slug, location.mode);
                match cache.get(&key) {
                    Some(entry) => {
                        listing.travel_times.insert(location.slug.clone(), entry.value);
                        report.cache_hits += 1;
                    }
                    None => {
                        destinations.insert(&location.slug, location);
                        misses
                            .entry(location.mode)
                            .or_default()
                            .entry(key.origin)
                            .or_default()
                            .insert(&location.slug);
                    }
                }
            }
        }

        // Keep one original spelling per normalized origin for the request.
        let mut spelled: BTreeMap<String, String> = BTreeMap::new();
        for listing in listings.iter() {
            spelled
                .entry(normalize_address(&listing.full_address))
                .or_insert_with(|| listing.full_address.trim().to_string());
        }

        let batches = self.plan_batches(&misses, &destinations, &spelled);
        info!(
            cache_hits = report.cache_hits,
            batches = batches.len(),
            "Resolving travel times"
        );

        let calls = AtomicU32::new(0);
        let api = self.api.as_ref();
        let retry = &self.settings.retry;
        let calls_ref = &calls;
        let mut results = stream::iter(batches)
            .take_while(|_| futures::future::ready(!cancel.is_cancelled()))
            .map(move |batch| async move {
                let request = &batch.request;
                let what = format!("{} distance batch of {} elements", request.mode, request.elements());
                let outcome = retry
                    .run_async(
                        &what,
                        move |_| {
                            calls_ref.fetch_add(1, Ordering::Relaxed);
                            api.matrix(request)
                        },
                        |e: &DistanceApiError| e.is_transient(),
                    )
                    .await;
                (batch, outcome)
            })
            .buffer_unordered(self.settings.concurrency.max(1));

        while let Some((batch, outcome)) = results.next().await {
            let response = match outcome {
                Ok(response) => response,
                Err(exhausted) => {
                    report.failed_batches += 1;
                    let error = ScoutError::EnrichmentApi(exhausted.error);
                    warn!(
                        %error,
                        attempts = exhausted.attempts,
                        pairs = batch.request.elements(),
                        "Distance batch failed, leaving pairs unresolved"
                    );
                    continue;
                }
            };

            for (i, origin) in batch.request.origins.iter().enumerate() {
                for (j, slug) in batch.slugs.iter().enumerate() {
                    let value = match response.element(i, j) {
                        Some(ElementOutcome::Duration { seconds }) => {
                            report.resolved += 1;
                            TravelTime::Minutes(seconds_to_minutes(*seconds))
                        }
                        Some(ElementOutcome::Unreachable) => {
                            report.unreachable += 1;
                            TravelTime::Unreachable
                        }
                        Some(ElementOutcome::Failed(status)) => {
                            debug!(%origin, %slug, %status, "Distance pair failed");
                            continue;
                        }
                        None => {
                            debug!(%origin, %slug, "Distance pair missing from response");
                            continue;
                        }
                    };
                    cache.insert(CacheKey::new(origin, slug, batch.request.mode), value);
                }
            }
            if let Err(error) = cache.flush() {
                if !report.cache_degraded {
                    warn!(%error, "Travel times from this run will not be persisted");
                }
                report.cache_degraded = true;
            }
        }
        drop(results);

        report.api_calls = calls.load(Ordering::Relaxed);
        report.cancelled = cancel.is_cancelled();

        for listing in listings.iter_mut() {
            if listing.full_address.trim().is_empty() {
                continue;
            }
            for location in locations {
                if listing.travel_times.contains_key(&location.slug) {
                    continue;
                }
                let key = CacheKey::new(&listing.full_address, &location.slug, location.mode);
                match cache.get(&key) {
                    Some(entry) => {
                        listing.travel_times.insert(location.slug.clone(), entry.value);
                    }
                    None => report.unresolved += 1,
                }
            }
        }

        if report.is_partial() {
            warn!(
                unresolved = report.unresolved,
                failed_batches = report.failed_batches,
                cancelled = report.cancelled,
                "Enrichment incomplete"
            );
        }
        info!(
            cache_hits = report.cache_hits,
            api_calls = report.api_calls,
            resolved = report.resolved,
            unreachable = report.unreachable,
            cached_routes = cache.len(),
            "Enrichment finished"
        );
        report
    }

    /// Pack misses into matrix requests. Origins needing the same set of
    /// destinations share requests; each request stays within both the
    /// element limit and the per-dimension limit.
    fn plan_batches(
        &self,
        misses: &BTreeMap<TravelMode, BTreeMap<String, BTreeSet<&str>>>,
        destinations: &BTreeMap<&str, &Location>,
        spelled: &BTreeMap<String, String>,
    ) -> Vec<Batch> {
        let max_elements = self.api.max_elements().max(1);
        let mut batches = Vec::new();

        for (mode, needs) in misses {
            // slug set -> origins sharing it
            let mut groups: BTreeMap<Vec<&str>, Vec<&str>> = BTreeMap::new();
            for (origin, slugs) in needs {
                groups
                    .entry(slugs.iter().copied().collect())
                    .or_default()
                    .push(origin.as_str());
            }

            for (slugs, origins) in groups {
                let dest_chunk = max_elements.min(api::MAX_DIMENSION);
                for slug_chunk in slugs.chunks(dest_chunk) {
                    let origin_chunk = (max_elements / slug_chunk.len()).clamp(1, api::MAX_DIMENSION);
                    for origin_group in origins.chunks(origin_chunk) {
                        batches.push(Batch {
                            request: MatrixRequest {
                                origins: origin_group
                                    .iter()
                                    .map(|o| spelled.get(*o).cloned().unwrap_or_else(|| o.to_string()))
                                    .collect(),
                                destinations: slug_chunk.iter().map(|s| destinations[s].address.clone()).collect(),
                                mode: *mode,
                            },
                            slugs: slug_chunk.iter().map(|s| s.to_string()).collect(),
                        });
                    }
                }
            }
        }
        batches
    }
}

fn seconds_to_minutes(seconds: u64) -> u32 {
    ((seconds as f64) / 60.0).round() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// 24.5 minutes for every pair, unreachable for island origins.
    struct FakeApi {
        max_elements: usize,
        calls: Mutex<Vec<MatrixRequest>>,
        fail_first: AtomicU32,
    }

    impl FakeApi {
        fn new(max_elements: usize) -> Self {
            Self {
                max_elements,
                calls: Mutex::new(Vec::new()),
                fail_first: AtomicU32::new(0),
            }
        }

        fn requests(&self) -> Vec<MatrixRequest> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DistanceApi for FakeApi {
        fn max_elements(&self) -> usize {
            self.max_elements
        }

        async fn matrix(&self, request: &MatrixRequest) -> Result<MatrixResponse, DistanceApiError> {
            self.calls.lock().unwrap().push(request.clone());
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(DistanceApiError::Transient("503".into()));
            }
            Ok(MatrixResponse {
                rows: request
                    .origins
                    .iter()
                    .map(|origin| {
                        request
                            .destinations
                            .iter()
                            .map(|_| {
                                if origin.contains("Island") {
                                    ElementOutcome::Unreachable
                                } else {
                                    ElementOutcome::Duration { seconds: 1_470 }
                                }
                            })
                            .collect()
                    })
                    .collect(),
            })
        }
    }

    fn listing(id: &str, address: &str) -> PropertyListing {
        let mut l = PropertyListing::new(id, format!("https://www.domain.com.au/{id}"), "domain");
        l.full_address = address.to_string();
        l
    }

    fn settings() -> EnrichmentSettings {
        EnrichmentSettings {
            concurrency: 2,
            retry: RetryPolicy::immediate(3),
        }
    }

    #[tokio::test]
    async fn test_batches_respect_element_limit() {
        let api = Arc::new(FakeApi::new(4));
        let enricher = DistanceEnricher::new(api.clone(), settings());
        let mut listings: Vec<_> = (0..5)
            .map(|i| listing(&i.to_string(), &format!("{i} Smith St, Chatswood")))
            .collect();
        let mut cache = DistanceCache::in_memory();

        let report = enricher
            .enrich(&mut listings, &Location::defaults(), &mut cache, &CancellationToken::new())
            .await;

        assert!(api.requests().iter().all(|r| r.elements() <= 4));
        assert_eq!(report.resolved, 15);
        assert_eq!(report.unresolved, 0);
        assert_eq!(cache.len(), 15);
        for l in &listings {
            assert_eq!(l.travel_time("qvb"), Some(TravelTime::Minutes(25)));
            assert_eq!(l.travel_time("bella_vista"), Some(TravelTime::Minutes(25)));
        }
        // driving and transit never share a request
        for r in api.requests() {
            let driving = r.destinations.iter().any(|d| d.starts_with("Bella Vista"));
            assert_eq!(driving, r.mode == TravelMode::Driving);
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let api = Arc::new(FakeApi::new(100));
        api.fail_first.store(2, Ordering::SeqCst);
        let enricher = DistanceEnricher::new(api.clone(), EnrichmentSettings { concurrency: 1, ..settings() });
        let locations = vec![Location::new("QVB", "455 George St", "qvb", TravelMode::Transit)];
        let mut listings = vec![listing("1", "1 Smith St")];
        let mut cache = DistanceCache::in_memory();

        let report = enricher
            .enrich(&mut listings, &locations, &mut cache, &CancellationToken::new())
            .await;
        assert_eq!(report.api_calls, 3);
        assert_eq!(report.failed_batches, 0);
        assert_eq!(listings[0].travel_time("qvb"), Some(TravelTime::Minutes(25)));
    }

    #[tokio::test]
    async fn test_exhausted_batch_is_not_fatal() {
        let api = Arc::new(FakeApi::new(100));
        api.fail_first.store(10, Ordering::SeqCst);
        let enricher = DistanceEnricher::new(api.clone(), settings());
        let locations = vec![Location::new("QVB", "455 George St", "qvb", TravelMode::Transit)];
        let mut listings = vec![listing("1", "1 Smith St"), listing("2", "2 Smith St")];
        let mut cache = DistanceCache::in_memory();

        let report = enricher
            .enrich(&mut listings, &locations, &mut cache, &CancellationToken::new())
            .await;
        assert_eq!(report.failed_batches, 1);
        assert_eq!(report.unresolved, 2);
        assert!(report.is_partial());
        assert!(cache.is_empty());
        assert!(listings.iter().all(|l| l.travel_times.is_empty()));
    }

    #[tokio::test]
    async fn test_unwritable_cache_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        let mut cache = DistanceCache::open(blocker.join("distance_cache.json"));
        std::fs::write(&blocker, "").unwrap();

        let api = Arc::new(FakeApi::new(100));
        let enricher = DistanceEnricher::new(api, settings());
        let locations = vec![Location::new("QVB", "455 George St", "qvb", TravelMode::Transit)];
        let mut listings = vec![listing("1", "1 Smith St")];

        let report = enricher
            .enrich(&mut listings, &locations, &mut cache, &CancellationToken::new())
            .await;
        assert!(report.cache_degraded);
        assert_eq!(report.resolved, 1);
        assert!(cache.path().is_none());
        assert_eq!(listings[0].travel_time("qvb"), Some(TravelTime::Minutes(25)));
    }

    #[tokio::test]
    async fn test_skips_listings_without_address() {
        let api = Arc::new(FakeApi::new(100));
        let enricher = DistanceEnricher::new(api.clone(), settings());
        let mut listings = vec![listing("1", "  "), listing("2", "Island Rd, Scotland Island")];
        let mut cache = DistanceCache::in_memory();

        let report = enricher
            .enrich(&mut listings, &Location::defaults(), &mut cache, &CancellationToken::new())
            .await;
        assert_eq!(report.skipped_no_address, 1);
        assert_eq!(report.unreachable, 3);
        assert!(listings[0].travel_times.is_empty());
        assert_eq!(listings[1].travel_time("rnsh"), Some(TravelTime::Unreachable));
    }

    #[tokio::test]
    async fn test_cancelled_run_issues_no_batches() {
        let api = Arc::new(FakeApi::new(100));
        let enricher = DistanceEnricher::new(api.clone(), settings());
        let mut listings = vec![listing("1", "1 Smith St")];
        let mut cache = DistanceCache::in_memory();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = enricher
            .enrich(&mut listings, &Location::defaults(), &mut cache, &cancel)
            .await;
        assert!(report.cancelled);
        assert_eq!(report.api_calls, 0);
        assert_eq!(report.unresolved, 3);
    }

    #[test]
    fn test_minutes_round_to_nearest() {
        assert_eq!(seconds_to_minutes(1_470), 25);
        assert_eq!(seconds_to_minutes(89), 1);
        assert_eq!(seconds_to_minutes(29), 0);
    }
}
