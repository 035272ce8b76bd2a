//! One execution of a saved query: fetch, filter, diff against the ledger,
//! record the new listings and announce them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use spek_adapters::{ListingSource, SourceError};
use spek_core::{Listing, NewListingEvent, Query, QueryId, SearchParams};
use spek_storage::{QueryRegistry, ResultLedger, StorageError};
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::publish::EventPublisher;
use crate::SyncError;

/// Registration request: either explicit params or a marketplace URL, the URL
/// taking precedence when present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterQuery {
    pub query_url: Option<String>,
    pub query: SearchParams,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub query_id: QueryId,
    pub fetched: usize,
    pub filtered_out: usize,
    pub new_listings: Vec<Listing>,
    pub publish_failures: usize,
}

/// Drops reserved listings, and commercial ones unless the query opts in.
/// Returns the kept listings and how many were dropped.
pub fn retain_announceable(listings: Vec<Listing>, include_commercials: bool) -> (Vec<Listing>, usize) {
    let before = listings.len();
    let kept: Vec<Listing> = listings
        .into_iter()
        .filter(|l| !l.is_reserved())
        .filter(|l| include_commercials || !l.is_commercial())
        .collect();
    let dropped = before - kept.len();
    (kept, dropped)
}

/// `fetched \ announced` by listing id, keeping source order. A page that
/// repeats an id yields it once.
pub fn unseen(fetched: Vec<Listing>, announced: &HashSet<String>) -> Vec<Listing> {
    let mut emitted = HashSet::new();
    fetched
        .into_iter()
        .filter(|l| !announced.contains(&l.id) && emitted.insert(l.id.clone()))
        .collect()
}

struct Recorded {
    query: Query,
    fetched: usize,
    filtered_out: usize,
    new_listings: Vec<Listing>,
}

pub struct Runner {
    registry: Arc<dyn QueryRegistry>,
    ledger: Arc<dyn ResultLedger>,
    source: Arc<dyn ListingSource>,
    publisher: Arc<dyn EventPublisher>,
    locks: Mutex<HashMap<QueryId, Arc<Mutex<()>>>>,
}

impl Runner {
    pub fn new(
        registry: Arc<dyn QueryRegistry>,
        ledger: Arc<dyn ResultLedger>,
        source: Arc<dyn ListingSource>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            registry,
            ledger,
            source,
            publisher,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register(&self, request: RegisterQuery) -> Result<Query, SyncError> {
        let params = match request.query_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => {
                self.source
                    .resolve_query_url(url)
                    .await
                    .map_err(|err| match err {
                        SourceError::Invalid(invalid) => SyncError::Validation(invalid),
                        other => SyncError::FetchFailed(other),
                    })?
            }
            _ => request.query,
        };
        params.validate()?;

        let query = self.registry.create(params).await.map_err(storage_error)?;
        info!(query_id = %query.id, search = %query.params.query, "query registered");
        Ok(query)
    }

    pub async fn get(&self, id: &QueryId) -> Result<Query, SyncError> {
        self.registry.get(id).await.map_err(storage_error)
    }

    pub async fn list(&self) -> Result<Vec<Query>, SyncError> {
        self.registry.list().await.map_err(storage_error)
    }

    /// Deletes the query and its ledger rows. Waits for an in-flight run of
    /// the same query to finish first.
    pub async fn delete(&self, id: &QueryId) -> Result<(), SyncError> {
        let lock = self.query_lock(id).await;
        {
            let _guard = lock.lock().await;
            self.registry.delete(id).await.map_err(storage_error)?;
        }
        self.release_lock(id, lock).await;
        info!(query_id = %id, "query deleted");
        Ok(())
    }

    /// Runs the query once. Only one run per query id is in flight at a time.
    pub async fn run(&self, id: &QueryId) -> Result<RunOutcome, SyncError> {
        self.run_with_deadline(id, None).await
    }

    /// Like [`Runner::run`], but fails with [`SyncError::TimedOut`] when the
    /// fetch and the ledger write take longer than `limit`. Listings that made
    /// it into the ledger are always published, however long that takes.
    pub async fn run_within(&self, id: &QueryId, limit: Duration) -> Result<RunOutcome, SyncError> {
        self.run_with_deadline(id, Some(limit)).await
    }

    async fn run_with_deadline(
        &self,
        id: &QueryId,
        limit: Option<Duration>,
    ) -> Result<RunOutcome, SyncError> {
        let lock = self.query_lock(id).await;
        let outcome = async {
            let record = async {
                let guard = lock.lock().await;
                let recorded = self.record_new(id).await?;
                Ok::<_, SyncError>((guard, recorded))
            };
            let (_guard, recorded) = match limit {
                Some(limit) => tokio::time::timeout(limit, record)
                    .await
                    .map_err(|_| SyncError::TimedOut(limit))??,
                None => record.await?,
            };
            Ok::<_, SyncError>(self.announce(recorded).await)
        }
        .instrument(info_span!("run_query", query_id = %id))
        .await;
        self.release_lock(id, lock).await;
        outcome
    }

    /// Steps up to and including the ledger write. Nothing is published here.
    async fn record_new(&self, id: &QueryId) -> Result<Recorded, SyncError> {
        let query = self.registry.get(id).await.map_err(storage_error)?;

        let fetched = self
            .source
            .search(&query.params)
            .await
            .map_err(SyncError::FetchFailed)?;
        let fetched_count = fetched.len();

        let (candidates, filtered_out) =
            retain_announceable(fetched, query.params.include_commercials);

        let announced = self.ledger.announced(id).await.map_err(SyncError::Storage)?;
        let fresh = unseen(candidates, &announced);

        let inserted: HashSet<String> = if fresh.is_empty() {
            HashSet::new()
        } else {
            self.ledger
                .mark_announced(id, &fresh)
                .await
                .map_err(SyncError::PersistFailed)?
                .into_iter()
                .collect()
        };
        let skipped = fresh.len() - inserted.len();
        if skipped > 0 {
            debug!(skipped, "listings recorded concurrently; not announcing again");
        }
        let new_listings = fresh
            .into_iter()
            .filter(|l| inserted.contains(&l.id))
            .collect();

        Ok(Recorded {
            query,
            fetched: fetched_count,
            filtered_out,
            new_listings,
        })
    }

    async fn announce(&self, recorded: Recorded) -> RunOutcome {
        let Recorded {
            query,
            fetched,
            filtered_out,
            new_listings,
        } = recorded;

        let mut publish_failures = 0usize;
        for listing in &new_listings {
            let event = NewListingEvent::new(&query, listing.clone());
            if let Err(err) = self.publisher.publish(&event).await {
                publish_failures += 1;
                warn!(listing_id = %listing.id, error = %err, "could not publish new listing");
            }
        }

        info!(
            source = self.source.source_id(),
            fetched,
            filtered_out,
            new = new_listings.len(),
            publish_failures,
            "query run complete"
        );

        RunOutcome {
            query_id: query.id,
            fetched,
            filtered_out,
            new_listings,
            publish_failures,
        }
    }

    async fn query_lock(&self, id: &QueryId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(id.clone()).or_default().clone()
    }

    async fn release_lock(&self, id: &QueryId, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        // Map entry + ours: nobody else is waiting on this query.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(id);
        }
    }
}

fn storage_error(err: StorageError) -> SyncError {
    match err {
        StorageError::NotFound(id) => SyncError::NotFound(id),
        other => SyncError::Storage(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::PublishError;
    use async_trait::async_trait;
    use spek_adapters::StaticSource;
    use spek_core::{PriceInfo, PriceType, SellerInfo, ValidationError};
    use spek_storage::MemoryStore;

    #[derive(Default)]
    struct RecordingPublisher {
        events: Mutex<Vec<NewListingEvent>>,
        fail_listing: Option<String>,
        delay: Duration,
    }

    impl RecordingPublisher {
        async fn listing_ids(&self) -> Vec<String> {
            self.events
                .lock()
                .await
                .iter()
                .map(|e| e.listing.id.clone())
                .collect()
        }
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(&self, event: &NewListingEvent) -> Result<(), PublishError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail_listing.as_deref() == Some(event.listing.id.as_str()) {
                return Err(PublishError::Closed("test".into()));
            }
            self.events.lock().await.push(event.clone());
            Ok(())
        }
    }

    /// Ledger whose writes always fail, as a broken transaction would.
    struct BrokenLedger(Arc<MemoryStore>);

    #[async_trait]
    impl ResultLedger for BrokenLedger {
        async fn announced(&self, query_id: &QueryId) -> Result<HashSet<String>, StorageError> {
            self.0.announced(query_id).await
        }

        async fn mark_announced(
            &self,
            _query_id: &QueryId,
            _listings: &[Listing],
        ) -> Result<Vec<String>, StorageError> {
            Err(StorageError::OutOfRange {
                column: "price_in_cents",
                value: -1,
            })
        }
    }

    struct HangingSource;

    #[async_trait]
    impl ListingSource for HangingSource {
        fn source_id(&self) -> &'static str {
            "hanging"
        }

        async fn search(&self, _params: &SearchParams) -> Result<Vec<Listing>, SourceError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }

        async fn resolve_query_url(&self, url: &str) -> Result<SearchParams, SourceError> {
            Err(SourceError::Message(format!("unsupported {url}")))
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        source: Arc<StaticSource>,
        publisher: Arc<RecordingPublisher>,
        runner: Runner,
    }

    fn harness_with(publisher: RecordingPublisher) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(StaticSource::new());
        let publisher = Arc::new(publisher);
        let runner = Runner::new(store.clone(), store.clone(), source.clone(), publisher.clone());
        Harness {
            store,
            source,
            publisher,
            runner,
        }
    }

    fn harness() -> Harness {
        harness_with(RecordingPublisher::default())
    }

    fn bikes() -> SearchParams {
        SearchParams {
            query: "bikes".into(),
            category: Some(10),
            sub_category: Some(20),
            postcode: "0000XX".into(),
            distance_meters: Some(99),
            ..Default::default()
        }
    }

    fn listing(id: &str) -> Listing {
        Listing {
            id: id.to_string(),
            title: format!("ad {id}"),
            location: spek_core::Location {
                city_name: "Ede".into(),
            },
            price: PriceInfo {
                price_cents: 10,
                price_type: PriceType::Fixed,
            },
            url: format!("https://www.marktplaats.nl/v/{id}"),
            image_urls: vec!["https://foo.png".into(), "https://bar.jpg".into()],
            ..Default::default()
        }
    }

    fn reserved(id: &str) -> Listing {
        let mut l = listing(id);
        l.price.price_type = PriceType::Reserved;
        l
    }

    fn commercial(id: &str) -> Listing {
        let mut l = listing(id);
        l.seller = SellerInfo {
            website_url: Some("https://shop.example".into()),
            show_website_url: true,
        };
        l
    }

    fn ids(listings: &[Listing]) -> Vec<&str> {
        listings.iter().map(|l| l.id.as_str()).collect()
    }

    async fn register(h: &Harness, params: SearchParams) -> Query {
        h.runner
            .register(RegisterQuery {
                query_url: None,
                query: params,
            })
            .await
            .unwrap()
    }

    #[test]
    fn unseen_is_an_ordered_set_difference() {
        let announced: HashSet<String> = ["b", "d"].iter().map(|s| s.to_string()).collect();
        let fetched = vec![listing("a"), listing("b"), listing("c"), listing("a"), listing("d")];
        let fresh = unseen(fetched, &announced);
        assert_eq!(ids(&fresh), vec!["a", "c"]);
    }

    #[test]
    fn reserved_is_dropped_even_when_commercials_are_included() {
        let mut both = commercial("x");
        both.price.price_type = PriceType::Reserved;
        let (kept, dropped) = retain_announceable(
            vec![listing("a"), reserved("r"), commercial("c"), both.clone()],
            false,
        );
        assert_eq!(ids(&kept), vec!["a"]);
        assert_eq!(dropped, 3);

        let (kept, dropped) =
            retain_announceable(vec![listing("a"), reserved("r"), commercial("c"), both], true);
        assert_eq!(ids(&kept), vec!["a", "c"]);
        assert_eq!(dropped, 2);
    }

    #[tokio::test]
    async fn first_run_announces_then_only_new_listings() {
        let h = harness();
        let query = register(&h, bikes()).await;

        h.source.push_page(vec![listing("foo")]).await;
        let first = h.runner.run(&query.id).await.unwrap();
        assert_eq!(ids(&first.new_listings), vec!["foo"]);
        assert!(h.store.announced(&query.id).await.unwrap().contains("foo"));

        h.source.push_page(vec![listing("foo"), listing("bar")]).await;
        let second = h.runner.run(&query.id).await.unwrap();
        assert_eq!(ids(&second.new_listings), vec!["bar"]);
        assert_eq!(second.fetched, 2);

        assert_eq!(h.publisher.listing_ids().await, vec!["foo", "bar"]);
        let events = h.publisher.events.lock().await;
        assert!(events.iter().all(|e| e.query_id == query.id));
        assert_eq!(events[0].search_term, "bikes");
    }

    #[tokio::test]
    async fn rerun_against_unchanged_source_is_empty() {
        let h = harness();
        let query = register(&h, bikes()).await;
        h.source.push_page(vec![listing("foo"), listing("bar")]).await;

        let first = h.runner.run(&query.id).await.unwrap();
        assert_eq!(first.new_listings.len(), 2);
        let second = h.runner.run(&query.id).await.unwrap();
        assert!(second.new_listings.is_empty());
        assert_eq!(h.publisher.listing_ids().await.len(), 2);
    }

    #[tokio::test]
    async fn reserved_listings_never_surface() {
        let h = harness();
        let query = register(
            &h,
            SearchParams {
                include_commercials: true,
                ..bikes()
            },
        )
        .await;

        h.source.push_page(vec![reserved("held"), listing("ok")]).await;
        let outcome = h.runner.run(&query.id).await.unwrap();
        assert_eq!(ids(&outcome.new_listings), vec!["ok"]);
        assert_eq!(outcome.filtered_out, 1);

        let again = h.runner.run(&query.id).await.unwrap();
        assert!(again.new_listings.is_empty());
        assert!(!h.store.announced(&query.id).await.unwrap().contains("held"));
    }

    #[tokio::test]
    async fn commercials_only_when_opted_in() {
        let h = harness();
        let private = register(&h, bikes()).await;
        let open = register(
            &h,
            SearchParams {
                include_commercials: true,
                ..bikes()
            },
        )
        .await;
        h.source.push_page(vec![commercial("shop"), listing("jan")]).await;
        h.source.push_page(vec![commercial("shop"), listing("jan")]).await;

        let a = h.runner.run(&private.id).await.unwrap();
        let b = h.runner.run(&open.id).await.unwrap();
        assert_eq!(ids(&a.new_listings), vec!["jan"]);
        assert_eq!(ids(&b.new_listings), vec!["shop", "jan"]);
    }

    #[tokio::test]
    async fn unknown_query_is_not_found_without_fetching() {
        let h = harness();
        let result = h.runner.run(&QueryId::from("nope")).await;
        assert!(matches!(result, Err(SyncError::NotFound(_))));
        assert_eq!(h.source.calls().await, 0);
    }

    #[tokio::test]
    async fn fetch_failure_has_no_side_effects() {
        let h = harness();
        let query = register(&h, bikes()).await;
        h.source.push_failure("connection reset").await;

        let result = h.runner.run(&query.id).await;
        assert!(matches!(result, Err(SyncError::FetchFailed(_))));
        assert!(h.store.announced(&query.id).await.unwrap().is_empty());
        assert!(h.publisher.listing_ids().await.is_empty());
    }

    #[tokio::test]
    async fn persist_failure_publishes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(StaticSource::with_listings(vec![listing("foo")]));
        let publisher = Arc::new(RecordingPublisher::default());
        let runner = Runner::new(
            store.clone(),
            Arc::new(BrokenLedger(store.clone())),
            source,
            publisher.clone(),
        );
        let query = store.create(bikes()).await.unwrap();

        let result = runner.run(&query.id).await;
        assert!(matches!(result, Err(SyncError::PersistFailed(_))));
        assert!(store.entries(&query.id).await.is_empty());
        assert!(publisher.listing_ids().await.is_empty());
    }

    #[tokio::test]
    async fn publish_failure_keeps_the_ledger_write() {
        let h = harness_with(RecordingPublisher {
            fail_listing: Some("foo".into()),
            ..Default::default()
        });
        let query = register(&h, bikes()).await;
        h.source.push_page(vec![listing("foo"), listing("bar")]).await;

        let outcome = h.runner.run(&query.id).await.unwrap();
        assert_eq!(ids(&outcome.new_listings), vec!["foo", "bar"]);
        assert_eq!(outcome.publish_failures, 1);
        assert_eq!(h.publisher.listing_ids().await, vec!["bar"]);

        let again = h.runner.run(&query.id).await.unwrap();
        assert!(again.new_listings.is_empty());
    }

    #[tokio::test]
    async fn concurrently_recorded_listings_are_not_announced_twice() {
        let h = harness();
        let query = register(&h, bikes()).await;
        // Another writer recorded "foo" after our ledger read would have happened.
        h.store
            .mark_announced(&query.id, &[listing("foo")])
            .await
            .unwrap();
        h.source.push_page(vec![listing("foo"), listing("bar")]).await;

        let outcome = h.runner.run(&query.id).await.unwrap();
        assert_eq!(ids(&outcome.new_listings), vec!["bar"]);
        assert_eq!(h.publisher.listing_ids().await, vec!["bar"]);
    }

    #[tokio::test]
    async fn overlapping_runs_of_one_query_announce_once() {
        let h = harness();
        let query = register(&h, bikes()).await;
        h.source.push_page(vec![listing("foo"), listing("bar")]).await;

        let (a, b) = tokio::join!(h.runner.run(&query.id), h.runner.run(&query.id));
        let total = a.unwrap().new_listings.len() + b.unwrap().new_listings.len();
        assert_eq!(total, 2);
        assert_eq!(h.publisher.listing_ids().await.len(), 2);
        assert!(h.runner.locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn delete_cascades_ledger_rows() {
        let h = harness();
        let query = register(&h, bikes()).await;
        h.source.push_page(vec![listing("foo")]).await;
        h.runner.run(&query.id).await.unwrap();

        h.runner.delete(&query.id).await.unwrap();
        assert!(h.store.entries(&query.id).await.is_empty());
        assert!(matches!(
            h.runner.get(&query.id).await,
            Err(SyncError::NotFound(_))
        ));
        h.runner.delete(&query.id).await.unwrap();
    }

    #[tokio::test]
    async fn register_prefers_url_and_validates() {
        let h = harness();
        let url = "https://www.marktplaats.nl/l/huis-en-inrichting/kachels/#q:zibro";
        h.source
            .register_url(
                url,
                SearchParams {
                    query: "zibro".into(),
                    category: Some(504),
                    sub_category: Some(513),
                    ..Default::default()
                },
            )
            .await;

        let query = h
            .runner
            .register(RegisterQuery {
                query_url: Some(url.into()),
                query: bikes(),
            })
            .await
            .unwrap();
        assert_eq!(query.params.query, "zibro");
        assert_eq!(query.params.category, Some(504));

        let bad_url = h
            .runner
            .register(RegisterQuery {
                query_url: Some("invalid uri".into()),
                query: SearchParams::default(),
            })
            .await;
        assert!(matches!(bad_url, Err(SyncError::Validation(ValidationError::InvalidUrl(_)))));

        let bad_params = h
            .runner
            .register(RegisterQuery {
                query_url: None,
                query: SearchParams {
                    sub_category: Some(3),
                    ..Default::default()
                },
            })
            .await;
        assert!(matches!(bad_params, Err(SyncError::Validation(_))));
        assert_eq!(h.runner.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn register_accepts_zero_valued_filters() {
        let h = harness();
        let query = register(
            &h,
            SearchParams {
                query: "kachel".into(),
                category: Some(0),
                sub_category: Some(0),
                distance_meters: Some(0),
                attributes_by_id: vec![0],
                ..Default::default()
            },
        )
        .await;
        assert_eq!(h.runner.get(&query.id).await.unwrap().params.distance_meters, Some(0));
    }

    #[tokio::test]
    async fn deadline_does_not_cut_off_publishing() {
        let h = harness_with(RecordingPublisher {
            delay: Duration::from_millis(100),
            ..Default::default()
        });
        let query = register(&h, bikes()).await;
        h.source.push_page(vec![listing("foo"), listing("bar")]).await;

        let outcome = h
            .runner
            .run_within(&query.id, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(ids(&outcome.new_listings), vec!["foo", "bar"]);
        assert_eq!(h.publisher.listing_ids().await, vec!["foo", "bar"]);
    }

    #[tokio::test]
    async fn deadline_during_fetch_records_nothing() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(RecordingPublisher::default());
        let runner = Runner::new(
            store.clone(),
            store.clone(),
            Arc::new(HangingSource),
            publisher.clone(),
        );
        let query = store.create(bikes()).await.unwrap();

        let result = runner
            .run_within(&query.id, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(SyncError::TimedOut(_))));
        assert!(store.entries(&query.id).await.is_empty());
        assert!(publisher.listing_ids().await.is_empty());
        assert!(runner.locks.lock().await.is_empty());
    }
}
